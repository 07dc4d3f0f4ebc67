//! In-process storage backend used by tests and `BOOKING_STORAGE_BACKEND=memory`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use service_core::error::AppError;
use uuid::Uuid;

use super::catalog::{service_not_found, ServiceCatalog};
use super::repository::{stale_version, BookingScope, Repository};
use crate::models::{
    Booking, BookingSync, ProviderRating, ServiceListing, Transaction, TransactionStatus,
};

#[derive(Default)]
pub struct InMemoryRepository {
    bookings: DashMap<Uuid, Booking>,
    transactions: DashMap<Uuid, Transaction>,
    /// booking id -> id of its single non-failed transaction.
    active_attempts: DashMap<Uuid, Uuid>,
    ratings: DashMap<Uuid, ProviderRating>,
    services: DashMap<Uuid, ServiceListing>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a catalog entry.
    pub fn insert_service(&self, listing: ServiceListing) {
        self.services.insert(listing.id, listing);
    }

    fn collect_transactions<F>(&self, limit: usize, pred: F) -> Vec<Transaction>
    where
        F: Fn(&Transaction) -> bool,
    {
        let mut found: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|t| t.updated_at);
        found.truncate(limit);
        found
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError> {
        match self.bookings.entry(booking.id) {
            Entry::Occupied(_) => Err(AppError::Conflict(anyhow::anyhow!(
                "Booking {} already exists",
                booking.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(booking.clone());
                Ok(())
            }
        }
    }

    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, AppError> {
        Ok(self.bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn list_bookings(&self, scope: BookingScope) -> Result<Vec<Booking>, AppError> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| match scope {
                BookingScope::Customer(id) => e.customer_id == id,
                BookingScope::Provider(id) => e.provider_id == id,
                BookingScope::All => true,
            })
            .map(|e| e.value().clone())
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bookings)
    }

    async fn update_booking(&self, booking: &mut Booking) -> Result<(), AppError> {
        let Some(mut stored) = self.bookings.get_mut(&booking.id) else {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Booking {} not found",
                booking.id
            )));
        };
        if stored.version != booking.version {
            return Err(stale_version("Booking", booking.id));
        }
        booking.version += 1;
        *stored = booking.clone();
        Ok(())
    }

    async fn bookings_with_pending_rating(&self, limit: usize) -> Result<Vec<Booking>, AppError> {
        Ok(self
            .bookings
            .iter()
            .filter(|e| e.has_pending_rating())
            .take(limit)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<(), AppError> {
        if let Some(booking_id) = tx.active_booking_id {
            match self.active_attempts.entry(booking_id) {
                Entry::Occupied(_) => {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Booking {} already has an open or paid transaction",
                        booking_id
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(tx.id);
                }
            }
        }
        self.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, AppError> {
        Ok(self.transactions.get(&id).map(|t| t.value().clone()))
    }

    async fn find_transaction_by_intent(
        &self,
        intent_id: &str,
    ) -> Result<Option<Transaction>, AppError> {
        Ok(self
            .transactions
            .iter()
            .find(|e| e.intent_id.as_deref() == Some(intent_id))
            .map(|e| e.value().clone()))
    }

    async fn list_transactions_for_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        let mut found: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|e| e.booking_id == booking_id)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn update_transaction(&self, tx: &mut Transaction) -> Result<(), AppError> {
        {
            let Some(mut stored) = self.transactions.get_mut(&tx.id) else {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Transaction {} not found",
                    tx.id
                )));
            };
            if stored.version != tx.version {
                return Err(stale_version("Transaction", tx.id));
            }
            tx.version += 1;
            *stored = tx.clone();
        }
        if tx.active_booking_id.is_none() {
            self.active_attempts
                .remove_if(&tx.booking_id, |_, holder| *holder == tx.id);
        }
        Ok(())
    }

    async fn stale_pending_transactions(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError> {
        Ok(self.collect_transactions(limit, |t| {
            t.status == TransactionStatus::Pending && t.updated_at < older_than
        }))
    }

    async fn transactions_awaiting_booking_sync(
        &self,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError> {
        Ok(self.collect_transactions(limit, |t| t.booking_sync == BookingSync::Pending))
    }

    async fn transactions_with_requested_refunds(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError> {
        Ok(self.collect_transactions(limit, |t| {
            t.requested_refunds().any(|r| r.requested_at < older_than)
        }))
    }

    async fn get_provider_rating(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<ProviderRating>, AppError> {
        Ok(self.ratings.get(&provider_id).map(|r| r.value().clone()))
    }

    async fn save_provider_rating(&self, rating: &mut ProviderRating) -> Result<(), AppError> {
        match self.ratings.entry(rating.provider_id) {
            Entry::Vacant(slot) if rating.version == 0 => {
                rating.version = 1;
                slot.insert(rating.clone());
                Ok(())
            }
            Entry::Occupied(mut slot) if slot.get().version == rating.version => {
                rating.version += 1;
                slot.insert(rating.clone());
                Ok(())
            }
            _ => Err(stale_version("Provider rating", rating.provider_id)),
        }
    }
}

#[async_trait]
impl ServiceCatalog for InMemoryRepository {
    async fn get_service(&self, id: Uuid) -> Result<ServiceListing, AppError> {
        self.services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| service_not_found(id))
    }
}
