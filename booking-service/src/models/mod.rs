mod booking;
mod listing;
mod rating;
mod transaction;

pub use booking::{
    is_permitted, is_reachable, ActorKind, Booking, BookingStatus, Feedback, StatusChange,
    TimeWindow,
};
pub use listing::ServiceListing;
pub use rating::{ProviderRating, RatingEntry};
pub use transaction::{
    to_minor_units, BookingSync, PaymentDetails, PaymentMethod, RefundRecord, RefundState,
    Transaction, TransactionStatus,
};

use serde::{Deserialize, Serialize};

/// Role asserted by the upstream authorization gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Provider,
    Admin,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "provider" => Ok(Role::Provider),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Authenticated caller, as supplied by the authorization gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: uuid::Uuid,
    pub role: Role,
}

impl Principal {
    pub fn new(id: uuid::Uuid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
