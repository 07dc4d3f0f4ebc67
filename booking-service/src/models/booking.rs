//! Booking aggregate and its legal-transition table.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Canceled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "completed" => Ok(Self::Completed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid booking status: {}", s)),
        }
    }
}

/// Who drives a status change. `Settlement` is the internal actor used when
/// a captured payment confirms the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Customer,
    Provider,
    Admin,
    Settlement,
}

impl From<Role> for ActorKind {
    fn from(role: Role) -> Self {
        match role {
            Role::Customer => Self::Customer,
            Role::Provider => Self::Provider,
            Role::Admin => Self::Admin,
        }
    }
}

struct TransitionRule {
    from: BookingStatus,
    to: BookingStatus,
    actor: ActorKind,
}

const fn rule(from: BookingStatus, to: BookingStatus, actor: ActorKind) -> TransitionRule {
    TransitionRule { from, to, actor }
}

const TRANSITIONS: &[TransitionRule] = &[
    rule(BookingStatus::Pending, BookingStatus::Confirmed, ActorKind::Provider),
    rule(BookingStatus::Pending, BookingStatus::Confirmed, ActorKind::Settlement),
    rule(BookingStatus::Pending, BookingStatus::Canceled, ActorKind::Provider),
    rule(BookingStatus::Pending, BookingStatus::Canceled, ActorKind::Customer),
    rule(BookingStatus::Confirmed, BookingStatus::Completed, ActorKind::Provider),
    rule(BookingStatus::Confirmed, BookingStatus::Canceled, ActorKind::Provider),
];

/// Whether any actor may move a booking from `from` to `to`.
pub fn is_reachable(from: BookingStatus, to: BookingStatus) -> bool {
    TRANSITIONS.iter().any(|r| r.from == from && r.to == to)
}

/// Whether `actor` specifically may move a booking from `from` to `to`.
pub fn is_permitted(from: BookingStatus, to: BookingStatus, actor: ActorKind) -> bool {
    TRANSITIONS
        .iter()
        .any(|r| r.from == from && r.to == to && r.actor == actor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub rating: u8,
    pub review: String,
    pub submitted_at: DateTime<Utc>,
    /// False until the provider's aggregate has absorbed this rating.
    pub rating_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub actor: ActorKind,
    pub actor_id: Option<Uuid>,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub customer_id: Uuid,
    /// Snapshot of the service's provider at creation time. Never re-joined.
    pub provider_id: Uuid,
    pub service_id: Uuid,
    pub date: NaiveDate,
    pub scheduled_time: Option<TimeWindow>,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub customer_feedback: Option<Feedback>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(
        customer_id: Uuid,
        provider_id: Uuid,
        service_id: Uuid,
        date: NaiveDate,
        scheduled_time: Option<TimeWindow>,
        notes: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id,
            provider_id,
            service_id,
            date,
            scheduled_time,
            status: BookingStatus::Pending,
            notes,
            cancellation_reason: None,
            customer_feedback: None,
            history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `user_id` is a party to this booking in the given role.
    pub fn is_party(&self, user_id: Uuid, role: Role) -> bool {
        match role {
            Role::Customer => self.customer_id == user_id,
            Role::Provider => self.provider_id == user_id,
            Role::Admin => false,
        }
    }

    /// Apply an already-authorized status change in memory.
    pub fn apply_status(
        &mut self,
        to: BookingStatus,
        actor: ActorKind,
        actor_id: Option<Uuid>,
        reason: Option<String>,
    ) {
        let now = Utc::now();
        self.history.push(StatusChange {
            from: self.status,
            to,
            actor,
            actor_id,
            reason: reason.clone(),
            at: now,
        });
        if to == BookingStatus::Canceled {
            self.cancellation_reason = reason;
        }
        self.status = to;
        self.updated_at = now;
    }

    pub fn has_pending_rating(&self) -> bool {
        self.customer_feedback
            .as_ref()
            .is_some_and(|f| !f.rating_applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [BookingStatus; 4] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Completed,
        BookingStatus::Canceled,
    ];

    #[test]
    fn terminal_states_have_no_exits() {
        for to in ALL {
            assert!(!is_reachable(BookingStatus::Completed, to));
            assert!(!is_reachable(BookingStatus::Canceled, to));
        }
    }

    #[test]
    fn self_transitions_are_never_reachable() {
        for s in ALL {
            assert!(!is_reachable(s, s), "{} -> {}", s, s);
        }
    }

    #[test]
    fn customer_may_only_cancel_pending() {
        assert!(is_permitted(
            BookingStatus::Pending,
            BookingStatus::Canceled,
            ActorKind::Customer
        ));
        assert!(!is_permitted(
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            ActorKind::Customer
        ));
        assert!(!is_permitted(
            BookingStatus::Confirmed,
            BookingStatus::Canceled,
            ActorKind::Customer
        ));
    }

    #[test]
    fn provider_drives_confirmed_bookings() {
        assert!(is_permitted(
            BookingStatus::Confirmed,
            BookingStatus::Completed,
            ActorKind::Provider
        ));
        assert!(is_permitted(
            BookingStatus::Confirmed,
            BookingStatus::Canceled,
            ActorKind::Provider
        ));
        assert!(!is_reachable(BookingStatus::Pending, BookingStatus::Completed));
    }

    #[test]
    fn admins_hold_no_transition_rights() {
        for from in ALL {
            for to in ALL {
                assert!(!is_permitted(from, to, ActorKind::Admin));
            }
        }
    }

    #[test]
    fn settlement_only_confirms_pending() {
        assert!(is_permitted(
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            ActorKind::Settlement
        ));
        assert!(!is_permitted(
            BookingStatus::Pending,
            BookingStatus::Canceled,
            ActorKind::Settlement
        ));
    }

    #[test]
    fn apply_status_records_history_and_reason() {
        let mut booking = Booking::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            None,
            None,
        );
        booking.apply_status(
            BookingStatus::Canceled,
            ActorKind::Customer,
            Some(booking.customer_id),
            Some("plans changed".into()),
        );
        assert_eq!(booking.status, BookingStatus::Canceled);
        assert_eq!(booking.cancellation_reason.as_deref(), Some("plans changed"));
        assert_eq!(booking.history.len(), 1);
        assert_eq!(booking.history[0].from, BookingStatus::Pending);
    }

    #[test]
    fn status_parses_both_spellings() {
        assert_eq!(
            "cancelled".parse::<BookingStatus>().unwrap(),
            BookingStatus::Canceled
        );
        assert!("archived".parse::<BookingStatus>().is_err());
    }
}
