//! MongoDB storage backend.
//!
//! Records are stored through `bson::to_document`, so ids and decimals land
//! as strings and filters compare against their string form. Transaction
//! timestamps are BSON dates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Collection, Database, IndexModel};
use serde::de::DeserializeOwned;
use serde::Serialize;
use service_core::error::AppError;
use tracing::instrument;
use uuid::Uuid;

use super::catalog::{service_not_found, ServiceCatalog};
use super::repository::{stale_version, BookingScope, Repository};
use crate::models::{Booking, ProviderRating, ServiceListing, Transaction};

const DUPLICATE_KEY: i32 = 11000;

#[derive(Clone)]
pub struct MongoRepository {
    db: Database,
    bookings: Collection<Document>,
    transactions: Collection<Document>,
    ratings: Collection<Document>,
}

impl MongoRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            bookings: db.collection("bookings"),
            transactions: db.collection("transactions"),
            ratings: db.collection("provider_ratings"),
        }
    }

    pub async fn init_indexes(&self) -> Result<(), AppError> {
        let customer_idx = IndexModel::builder()
            .keys(doc! { "customer_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("booking_customer_idx".to_string())
                    .build(),
            )
            .build();
        let provider_idx = IndexModel::builder()
            .keys(doc! { "provider_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("booking_provider_idx".to_string())
                    .build(),
            )
            .build();
        let pending_rating_idx = IndexModel::builder()
            .keys(doc! { "customer_feedback.rating_applied": 1 })
            .options(
                IndexOptions::builder()
                    .name("booking_pending_rating_idx".to_string())
                    .sparse(true)
                    .build(),
            )
            .build();
        self.bookings
            .create_indexes([customer_idx, provider_idx, pending_rating_idx], None)
            .await?;

        // A failed attempt drops `active_booking_id`, so only live attempts
        // participate in the uniqueness check.
        let live_attempt_idx = IndexModel::builder()
            .keys(doc! { "active_booking_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("transaction_live_attempt_uniq".to_string())
                    .unique(true)
                    .sparse(true)
                    .build(),
            )
            .build();
        let booking_idx = IndexModel::builder()
            .keys(doc! { "booking_id": 1, "created_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("transaction_booking_idx".to_string())
                    .build(),
            )
            .build();
        let intent_idx = IndexModel::builder()
            .keys(doc! { "intent_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("transaction_intent_idx".to_string())
                    .sparse(true)
                    .build(),
            )
            .build();
        let status_idx = IndexModel::builder()
            .keys(doc! { "status": 1, "booking_sync": 1 })
            .options(
                IndexOptions::builder()
                    .name("transaction_status_idx".to_string())
                    .build(),
            )
            .build();
        let stale_idx = IndexModel::builder()
            .keys(doc! { "status": 1, "updated_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("transaction_stale_idx".to_string())
                    .build(),
            )
            .build();
        self.transactions
            .create_indexes(
                [live_attempt_idx, booking_idx, intent_idx, status_idx, stale_idx],
                None,
            )
            .await?;

        tracing::info!("Booking service indexes initialized");
        Ok(())
    }

    async fn find_many<T: DeserializeOwned>(
        collection: &Collection<Document>,
        filter: Document,
        options: FindOptions,
    ) -> Result<Vec<T>, AppError> {
        let docs: Vec<Document> = collection
            .find(filter, options)
            .await?
            .try_collect()
            .await?;
        docs.into_iter().map(decode).collect()
    }

    /// Replace `current` only if the stored version still matches.
    async fn replace_versioned(
        collection: &Collection<Document>,
        id: Uuid,
        expected_version: i64,
        replacement: Document,
    ) -> Result<bool, AppError> {
        let result = collection
            .replace_one(
                doc! { "_id": id.to_string(), "version": expected_version },
                replacement,
                None,
            )
            .await
            .map_err(map_write_error)?;
        Ok(result.matched_count == 1)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Document, AppError> {
    Ok(bson::to_document(value)?)
}

fn decode<T: DeserializeOwned>(document: Document) -> Result<T, AppError> {
    bson::from_document(document).map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn map_write_error(err: mongodb::error::Error) -> AppError {
    if is_duplicate_key(&err) {
        AppError::Conflict(anyhow::anyhow!("Unique constraint violated: {}", err))
    } else {
        AppError::from(err)
    }
}

fn oldest_first(limit: usize) -> FindOptions {
    FindOptions::builder()
        .sort(doc! { "updated_at": 1 })
        .limit(i64::try_from(limit).unwrap_or(i64::MAX))
        .build()
}

#[async_trait]
impl Repository for MongoRepository {
    async fn ping(&self) -> Result<(), AppError> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    #[instrument(skip(self, booking), fields(booking_id = %booking.id))]
    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError> {
        self.bookings
            .insert_one(encode(booking)?, None)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, AppError> {
        self.bookings
            .find_one(doc! { "_id": id.to_string() }, None)
            .await?
            .map(decode)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_bookings(&self, scope: BookingScope) -> Result<Vec<Booking>, AppError> {
        let filter = match scope {
            BookingScope::Customer(id) => doc! { "customer_id": id.to_string() },
            BookingScope::Provider(id) => doc! { "provider_id": id.to_string() },
            BookingScope::All => doc! {},
        };
        let options = FindOptions::builder().sort(doc! { "created_at": -1 }).build();
        Self::find_many(&self.bookings, filter, options).await
    }

    #[instrument(skip(self, booking), fields(booking_id = %booking.id, version = booking.version))]
    async fn update_booking(&self, booking: &mut Booking) -> Result<(), AppError> {
        let expected = booking.version;
        booking.version += 1;
        let replacement = encode(booking)?;
        if Self::replace_versioned(&self.bookings, booking.id, expected, replacement).await? {
            Ok(())
        } else {
            booking.version = expected;
            Err(stale_version("Booking", booking.id))
        }
    }

    async fn bookings_with_pending_rating(&self, limit: usize) -> Result<Vec<Booking>, AppError> {
        Self::find_many(
            &self.bookings,
            doc! { "customer_feedback.rating_applied": false },
            oldest_first(limit),
        )
        .await
    }

    #[instrument(skip(self, tx), fields(transaction_id = %tx.id, booking_id = %tx.booking_id))]
    async fn insert_transaction(&self, tx: &Transaction) -> Result<(), AppError> {
        self.transactions
            .insert_one(encode(tx)?, None)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, AppError> {
        self.transactions
            .find_one(doc! { "_id": id.to_string() }, None)
            .await?
            .map(decode)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn find_transaction_by_intent(
        &self,
        intent_id: &str,
    ) -> Result<Option<Transaction>, AppError> {
        self.transactions
            .find_one(doc! { "intent_id": intent_id }, None)
            .await?
            .map(decode)
            .transpose()
    }

    async fn list_transactions_for_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        let options = FindOptions::builder().sort(doc! { "created_at": 1 }).build();
        Self::find_many(
            &self.transactions,
            doc! { "booking_id": booking_id.to_string() },
            options,
        )
        .await
    }

    #[instrument(skip(self, tx), fields(transaction_id = %tx.id, status = %tx.status))]
    async fn update_transaction(&self, tx: &mut Transaction) -> Result<(), AppError> {
        let expected = tx.version;
        tx.version += 1;
        let replacement = encode(tx)?;
        if Self::replace_versioned(&self.transactions, tx.id, expected, replacement).await? {
            Ok(())
        } else {
            tx.version = expected;
            Err(stale_version("Transaction", tx.id))
        }
    }

    async fn stale_pending_transactions(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError> {
        Self::find_many(
            &self.transactions,
            doc! {
                "status": "pending",
                "updated_at": { "$lt": bson::DateTime::from_chrono(older_than) },
            },
            oldest_first(limit),
        )
        .await
    }

    async fn transactions_awaiting_booking_sync(
        &self,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError> {
        Self::find_many(
            &self.transactions,
            doc! { "booking_sync": "pending" },
            oldest_first(limit),
        )
        .await
    }

    async fn transactions_with_requested_refunds(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError> {
        let found: Vec<Transaction> = Self::find_many(
            &self.transactions,
            doc! { "refunds.state": "requested" },
            oldest_first(limit),
        )
        .await?;
        Ok(found
            .into_iter()
            .filter(|t| t.requested_refunds().any(|r| r.requested_at < older_than))
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_provider_rating(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<ProviderRating>, AppError> {
        self.ratings
            .find_one(doc! { "_id": provider_id.to_string() }, None)
            .await?
            .map(decode)
            .transpose()
    }

    #[instrument(skip(self, rating), fields(provider_id = %rating.provider_id, version = rating.version))]
    async fn save_provider_rating(&self, rating: &mut ProviderRating) -> Result<(), AppError> {
        let expected = rating.version;
        rating.version += 1;
        let document = encode(rating)?;

        let saved = if expected == 0 {
            // Two first-time writers collide on `_id`; the loser retries.
            self.ratings
                .insert_one(document, None)
                .await
                .map(|_| true)
                .map_err(map_write_error)
        } else {
            Self::replace_versioned(&self.ratings, rating.provider_id, expected, document).await
        };

        match saved {
            Ok(true) => Ok(()),
            Ok(false) | Err(AppError::Conflict(_)) => {
                rating.version = expected;
                Err(stale_version("Provider rating", rating.provider_id))
            }
            Err(e) => {
                rating.version = expected;
                Err(e)
            }
        }
    }
}

/// Catalog reader over the `services` collection maintained by the catalog
/// owner.
#[derive(Clone)]
pub struct MongoCatalog {
    services: Collection<Document>,
}

impl MongoCatalog {
    pub fn new(db: &Database) -> Self {
        Self {
            services: db.collection("services"),
        }
    }
}

#[async_trait]
impl ServiceCatalog for MongoCatalog {
    #[instrument(skip(self))]
    async fn get_service(&self, id: Uuid) -> Result<ServiceListing, AppError> {
        self.services
            .find_one(doc! { "_id": id.to_string() }, None)
            .await?
            .map(decode)
            .transpose()?
            .ok_or_else(|| service_not_found(id))
    }
}
