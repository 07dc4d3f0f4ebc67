use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::json;
use service_core::error::AppError;

use crate::services::webhook::SIGNATURE_HEADER;
use crate::startup::AppState;

/// Gateway webhook. The raw body is needed for signature verification, so
/// it is taken as bytes rather than JSON.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    state.payments.handle_webhook(signature, &body).await?;

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}
