//! Provider rating aggregator: the only writer of `ProviderRating`.

use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::metrics;
use super::repository::Repository;
use super::retry_on_conflict;
use crate::models::{ProviderRating, RatingEntry};

#[derive(Clone)]
pub struct RatingAggregator {
    repo: Arc<dyn Repository>,
}

impl RatingAggregator {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Append `entry` to the provider's ratings and recompute the average.
    ///
    /// Serialized per provider through the record's version; a lost race is
    /// retried against the fresh state. Applying the same booking twice is a
    /// no-op, so a replay after a partial failure cannot double-count.
    #[instrument(skip(self, entry), fields(booking_id = %entry.booking_id, rating = entry.rating))]
    pub async fn apply_feedback(
        &self,
        provider_id: Uuid,
        entry: RatingEntry,
    ) -> Result<ProviderRating, AppError> {
        let result = retry_on_conflict(|| {
            let entry = entry.clone();
            async move {
                let mut state = self
                    .repo
                    .get_provider_rating(provider_id)
                    .await?
                    .unwrap_or_else(|| ProviderRating::empty(provider_id));

                if state.contains_booking(entry.booking_id) {
                    tracing::debug!("Rating already applied");
                    return Ok(state);
                }

                state.push(entry);
                self.repo.save_provider_rating(&mut state).await?;
                Ok(state)
            }
        })
        .await;

        match &result {
            Ok(state) => {
                metrics::record_rating_update("applied");
                tracing::info!(
                    provider_id = %provider_id,
                    average_rating = state.average_rating,
                    count = state.ratings.len(),
                    "Provider rating updated"
                );
            }
            Err(e) => {
                metrics::record_rating_update("failed");
                tracing::warn!(provider_id = %provider_id, error = %e, "Provider rating update failed");
            }
        }
        result
    }

    pub async fn get(&self, provider_id: Uuid) -> Result<ProviderRating, AppError> {
        Ok(self
            .repo
            .get_provider_rating(provider_id)
            .await?
            .unwrap_or_else(|| ProviderRating::empty(provider_id)))
    }
}
