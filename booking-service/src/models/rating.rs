//! Provider rating state, owned by the provider record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingEntry {
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub rating: u8,
    pub review: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRating {
    #[serde(rename = "_id")]
    pub provider_id: Uuid,
    /// Arrival order.
    pub ratings: Vec<RatingEntry>,
    pub average_rating: f64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl ProviderRating {
    pub fn empty(provider_id: Uuid) -> Self {
        Self {
            provider_id,
            ratings: Vec::new(),
            average_rating: 0.0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn contains_booking(&self, booking_id: Uuid) -> bool {
        self.ratings.iter().any(|r| r.booking_id == booking_id)
    }

    /// Append and recompute the mean from the full collection.
    pub fn push(&mut self, entry: RatingEntry) {
        self.ratings.push(entry);
        self.average_rating = mean(&self.ratings);
        self.updated_at = Utc::now();
    }
}

fn mean(ratings: &[RatingEntry]) -> f64 {
    if ratings.is_empty() {
        return 0.0;
    }
    let sum: u64 = ratings.iter().map(|r| u64::from(r.rating)).sum();
    sum as f64 / ratings.len() as f64
}
