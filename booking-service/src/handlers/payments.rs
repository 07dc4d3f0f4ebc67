use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{
    ConfirmPaymentRequest, ConfirmPaymentResponse, CreateIntentRequest, IntentResponse,
    RefundRequest, TransactionResponse,
};
use crate::models::Principal;
use crate::startup::AppState;
use crate::utils::ValidatedJson;

pub async fn create_intent(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(payload): ValidatedJson<CreateIntentRequest>,
) -> Result<(StatusCode, Json<IntentResponse>), AppError> {
    let created = state
        .payments
        .create_payment_intent(&principal, payload.booking_id, payload.payment_method)
        .await?;

    tracing::info!(
        booking_id = %payload.booking_id,
        transaction_id = %created.transaction.id,
        reused = created.reused,
        "Payment intent issued"
    );

    let status = if created.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(IntentResponse {
            transaction_id: created.transaction.id,
            intent_id: created.transaction.intent_id,
            client_secret: created.client_secret,
            amount: created.transaction.amount,
            currency: created.transaction.currency,
        }),
    ))
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(payload): ValidatedJson<ConfirmPaymentRequest>,
) -> Result<Json<ConfirmPaymentResponse>, AppError> {
    let confirmation = state
        .payments
        .confirm_payment(&principal, payload.booking_id, &payload.intent_id)
        .await?;

    Ok(Json(ConfirmPaymentResponse {
        transaction: confirmation.transaction.into(),
        booking: confirmation.booking.into(),
    }))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    principal: Principal,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<TransactionResponse>, AppError> {
    let tx = state
        .payments
        .get_transaction(&principal, transaction_id)
        .await?;
    Ok(Json(tx.into()))
}

pub async fn refund_transaction(
    State(state): State<AppState>,
    principal: Principal,
    Path(transaction_id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<RefundRequest>,
) -> Result<Json<TransactionResponse>, AppError> {
    let tx = state
        .payments
        .refund(&principal, transaction_id, payload.amount, payload.reason)
        .await?;
    Ok(Json(tx.into()))
}
