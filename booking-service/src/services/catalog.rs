use async_trait::async_trait;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::ServiceListing;

/// Read-only view of the service catalog, which is owned elsewhere.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// Fails with `NotFound` when the service does not exist.
    async fn get_service(&self, id: Uuid) -> Result<ServiceListing, AppError>;
}

pub(crate) fn service_not_found(id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Service {} not found", id))
}
