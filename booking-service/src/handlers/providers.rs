use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::ProviderRatingResponse;
use crate::startup::AppState;

/// Public provider rating summary.
pub async fn get_provider_rating(
    State(state): State<AppState>,
    Path(provider_id): Path<Uuid>,
) -> Result<Json<ProviderRatingResponse>, AppError> {
    let rating = state.bookings.provider_rating(provider_id).await?;
    Ok(Json(rating.into()))
}
