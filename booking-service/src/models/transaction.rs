//! Ledger transaction: one payment attempt against one booking.

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Paid,
    PartiallyRefunded,
    Refunded,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::PartiallyRefunded => "partially_refunded",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }

    /// Money has been captured for this attempt at some point.
    pub fn was_paid(&self) -> bool {
        matches!(self, Self::Paid | Self::PartiallyRefunded | Self::Refunded)
    }

    pub fn is_refundable(&self) -> bool {
        matches!(self, Self::Paid | Self::PartiallyRefunded)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    CreditCard,
    DebitCard,
    Upi,
    NetBanking,
    Wallet,
}

/// Outbox marker for the payment-success => booking-confirmation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingSync {
    #[default]
    NotRequired,
    Pending,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub gateway_transaction_id: String,
    pub gateway_response: serde_json::Value,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundState {
    /// Amount reserved against the transaction; gateway call not yet settled.
    Requested,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub refund_id: Uuid,
    pub gateway_refund_id: Option<String>,
    pub amount: Decimal,
    pub reason: String,
    pub state: RefundState,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub booking_id: Uuid,
    /// Service price snapshotted when the attempt was opened.
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub payment_method: PaymentMethod,
    pub intent_id: Option<String>,
    pub payment_details: Option<PaymentDetails>,
    #[serde(default)]
    pub refunds: Vec<RefundRecord>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub booking_sync: BookingSync,
    /// Set while the attempt is not failed; a unique sparse index on this
    /// field enforces one live attempt per booking.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub active_booking_id: Option<Uuid>,
    pub version: i64,
    /// Stored as BSON dates so the reconciler's age scans can filter and
    /// sort in the query.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new_pending(
        booking_id: Uuid,
        amount: Decimal,
        currency: String,
        payment_method: PaymentMethod,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            booking_id,
            amount,
            currency,
            status: TransactionStatus::Pending,
            payment_method,
            intent_id: None,
            payment_details: None,
            refunds: Vec::new(),
            failure_reason: None,
            booking_sync: BookingSync::NotRequired,
            active_booking_id: Some(booking_id),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of refunds the gateway has confirmed.
    pub fn refunded_total(&self) -> Decimal {
        self.refunds
            .iter()
            .filter(|r| r.state == RefundState::Completed)
            .map(|r| r.amount)
            .sum()
    }

    /// Confirmed plus in-flight refunds. Never allowed to exceed `amount`.
    pub fn reserved_refund_total(&self) -> Decimal {
        self.refunds
            .iter()
            .filter(|r| r.state != RefundState::Failed)
            .map(|r| r.amount)
            .sum()
    }

    pub fn refundable_amount(&self) -> Decimal {
        if !self.status.is_refundable() {
            return Decimal::ZERO;
        }
        (self.amount - self.reserved_refund_total()).max(Decimal::ZERO)
    }

    pub fn gateway_transaction_id(&self) -> Option<&str> {
        self.payment_details
            .as_ref()
            .map(|d| d.gateway_transaction_id.as_str())
    }

    pub fn find_refund(&self, refund_id: Uuid) -> Option<&RefundRecord> {
        self.refunds.iter().find(|r| r.refund_id == refund_id)
    }

    pub fn requested_refunds(&self) -> impl Iterator<Item = &RefundRecord> {
        self.refunds
            .iter()
            .filter(|r| r.state == RefundState::Requested)
    }

    pub fn mark_paid(&mut self, gateway_transaction_id: String, gateway_response: serde_json::Value) {
        let now = Utc::now();
        self.status = TransactionStatus::Paid;
        self.payment_details = Some(PaymentDetails {
            gateway_transaction_id,
            gateway_response,
            paid_at: now,
        });
        self.booking_sync = BookingSync::Pending;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, reason: String) {
        self.status = TransactionStatus::Failed;
        self.failure_reason = Some(reason);
        self.active_booking_id = None;
        self.updated_at = Utc::now();
    }

    /// Reserve `amount` for a refund. Caller has checked it against
    /// [`Self::refundable_amount`].
    pub fn reserve_refund(&mut self, refund_id: Uuid, amount: Decimal, reason: String) {
        let now = Utc::now();
        self.refunds.push(RefundRecord {
            refund_id,
            gateway_refund_id: None,
            amount,
            reason,
            state: RefundState::Requested,
            requested_at: now,
            completed_at: None,
        });
        self.updated_at = now;
    }

    /// Settle a reserved refund as confirmed by the gateway and move the
    /// status to `partially_refunded` or `refunded`.
    pub fn complete_refund(&mut self, refund_id: Uuid, gateway_refund_id: String) -> bool {
        let now = Utc::now();
        let Some(record) = self
            .refunds
            .iter_mut()
            .find(|r| r.refund_id == refund_id && r.state == RefundState::Requested)
        else {
            return false;
        };
        record.state = RefundState::Completed;
        record.gateway_refund_id = Some(gateway_refund_id);
        record.completed_at = Some(now);

        self.status = if self.refunded_total() >= self.amount {
            TransactionStatus::Refunded
        } else {
            TransactionStatus::PartiallyRefunded
        };
        self.updated_at = now;
        true
    }

    /// Drop a reservation the gateway definitively rejected.
    pub fn release_refund(&mut self, refund_id: Uuid) -> bool {
        let Some(record) = self
            .refunds
            .iter_mut()
            .find(|r| r.refund_id == refund_id && r.state == RefundState::Requested)
        else {
            return false;
        };
        record.state = RefundState::Failed;
        self.updated_at = Utc::now();
        true
    }

    /// Amount in the gateway's minor unit (cents).
    pub fn amount_minor_units(&self) -> Option<u64> {
        to_minor_units(self.amount)
    }
}

pub fn to_minor_units(amount: Decimal) -> Option<u64> {
    use rust_decimal::prelude::ToPrimitive;
    (amount * Decimal::ONE_HUNDRED).round().to_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn paid_tx(amount: Decimal) -> Transaction {
        let mut tx = Transaction::new_pending(
            Uuid::new_v4(),
            amount,
            "usd".into(),
            PaymentMethod::CreditCard,
        );
        tx.mark_paid("pi_1".into(), serde_json::json!({}));
        tx
    }

    #[test]
    fn partial_then_full_refund_settles_status() {
        let mut tx = paid_tx(dec!(80.00));
        let first = Uuid::new_v4();
        tx.reserve_refund(first, dec!(30.00), "late".into());
        assert_eq!(tx.status, TransactionStatus::Paid);
        assert_eq!(tx.refundable_amount(), dec!(50.00));

        assert!(tx.complete_refund(first, "re_1".into()));
        assert_eq!(tx.status, TransactionStatus::PartiallyRefunded);

        let second = Uuid::new_v4();
        tx.reserve_refund(second, dec!(50.00), "rest".into());
        assert!(tx.complete_refund(second, "re_2".into()));
        assert_eq!(tx.status, TransactionStatus::Refunded);
        assert_eq!(tx.refundable_amount(), Decimal::ZERO);
    }

    #[test]
    fn released_reservation_frees_the_amount() {
        let mut tx = paid_tx(dec!(20));
        let id = Uuid::new_v4();
        tx.reserve_refund(id, dec!(20), "oops".into());
        assert_eq!(tx.refundable_amount(), Decimal::ZERO);

        assert!(tx.release_refund(id));
        assert_eq!(tx.refundable_amount(), dec!(20));
        assert_eq!(tx.status, TransactionStatus::Paid);
        assert!(!tx.complete_refund(id, "re_x".into()));
    }

    #[test]
    fn failing_releases_the_booking_slot() {
        let mut tx = Transaction::new_pending(
            Uuid::new_v4(),
            dec!(10),
            "usd".into(),
            PaymentMethod::Wallet,
        );
        assert!(tx.active_booking_id.is_some());
        tx.mark_failed("card declined".into());
        assert!(tx.active_booking_id.is_none());
        assert_eq!(tx.refundable_amount(), Decimal::ZERO);
    }

    #[test]
    fn minor_units_round_half_cents() {
        assert_eq!(to_minor_units(dec!(49.99)), Some(4999));
        assert_eq!(to_minor_units(dec!(0.005)), Some(0));
        assert_eq!(to_minor_units(dec!(-1)), None);
    }

    #[test]
    fn timestamps_are_stored_as_bson_dates() {
        use mongodb::bson::{self, Bson};

        let tx = paid_tx(dec!(20));
        let document = bson::to_document(&tx).unwrap();
        assert!(matches!(document.get("created_at"), Some(Bson::DateTime(_))));
        assert!(matches!(document.get("updated_at"), Some(Bson::DateTime(_))));

        let stored: Transaction = bson::from_document(document).unwrap();
        assert_eq!(
            stored.updated_at.timestamp_millis(),
            tx.updated_at.timestamp_millis()
        );
        assert_eq!(stored.amount, tx.amount);
    }
}
