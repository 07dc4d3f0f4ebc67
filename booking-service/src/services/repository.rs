//! Persistence port for bookings, transactions and provider ratings.
//!
//! Every `update_*` is a conditional write keyed on the record's `version`:
//! on success the in-memory copy's version is bumped, on a stale version the
//! call fails with [`AppError::Conflict`] and the record is left untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{Booking, ProviderRating, Transaction};

/// Which bookings a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingScope {
    Customer(Uuid),
    Provider(Uuid),
    All,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn ping(&self) -> Result<(), AppError>;

    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError>;
    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, AppError>;
    async fn list_bookings(&self, scope: BookingScope) -> Result<Vec<Booking>, AppError>;
    async fn update_booking(&self, booking: &mut Booking) -> Result<(), AppError>;
    /// Bookings whose feedback is stored but not yet folded into the
    /// provider's aggregate.
    async fn bookings_with_pending_rating(&self, limit: usize) -> Result<Vec<Booking>, AppError>;

    /// Fails with `Conflict` when a non-failed transaction already exists
    /// for the same booking.
    async fn insert_transaction(&self, tx: &Transaction) -> Result<(), AppError>;
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, AppError>;
    async fn find_transaction_by_intent(
        &self,
        intent_id: &str,
    ) -> Result<Option<Transaction>, AppError>;
    async fn list_transactions_for_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError>;
    async fn update_transaction(&self, tx: &mut Transaction) -> Result<(), AppError>;
    /// Pending transactions not touched since `older_than`.
    async fn stale_pending_transactions(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError>;
    /// Paid transactions whose booking confirmation has not been applied.
    async fn transactions_awaiting_booking_sync(
        &self,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError>;
    /// Transactions holding a refund reservation the gateway has not settled.
    async fn transactions_with_requested_refunds(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError>;

    async fn get_provider_rating(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<ProviderRating>, AppError>;
    /// Version 0 inserts; anything else is a conditional replace.
    async fn save_provider_rating(&self, rating: &mut ProviderRating) -> Result<(), AppError>;
}

pub(crate) fn stale_version(entity: &str, id: Uuid) -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "{} {} was modified concurrently",
        entity,
        id
    ))
}
