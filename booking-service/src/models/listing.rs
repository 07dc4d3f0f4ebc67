use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog view of a bookable service, as read from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceListing {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub provider_id: Uuid,
    pub price: Decimal,
    pub is_available: bool,
}
