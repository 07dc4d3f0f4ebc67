use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{
    BookingResponse, CreateBookingRequest, FeedbackRequest, FeedbackResponse,
    TransactionResponse, UpdateBookingStatusRequest,
};
use crate::models::{BookingStatus, Principal, TimeWindow};
use crate::services::bookings::NewBooking;
use crate::startup::AppState;
use crate::utils::{parse_date, parse_time, ValidatedJson};

pub async fn create_booking(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(payload): ValidatedJson<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), AppError> {
    let time_window = payload
        .scheduled_time
        .map(|w| {
            Ok::<_, AppError>(TimeWindow {
                start_time: parse_time(&w.start_time)?,
                end_time: parse_time(&w.end_time)?,
            })
        })
        .transpose()?;

    let booking = state
        .bookings
        .create(
            &principal,
            NewBooking {
                service_id: payload.service_id,
                date: parse_date(&payload.date)?,
                time_window,
                notes: payload.notes,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(booking.into())))
}

pub async fn list_my_bookings(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<BookingResponse>>, AppError> {
    let bookings = state.bookings.list_mine(&principal).await?;
    Ok(Json(bookings.into_iter().map(Into::into).collect()))
}

pub async fn get_booking(
    State(state): State<AppState>,
    principal: Principal,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<BookingResponse>, AppError> {
    let booking = state.bookings.get(&principal, booking_id).await?;
    Ok(Json(booking.into()))
}

pub async fn update_status(
    State(state): State<AppState>,
    principal: Principal,
    Path(booking_id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<UpdateBookingStatusRequest>,
) -> Result<Json<BookingResponse>, AppError> {
    let target: BookingStatus = payload
        .status
        .parse()
        .map_err(|e: String| AppError::BadRequest(anyhow::anyhow!(e)))?;

    let booking = state
        .bookings
        .transition(&principal, booking_id, target, payload.reason)
        .await?;
    Ok(Json(booking.into()))
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    principal: Principal,
    Path(booking_id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>, AppError> {
    let outcome = state
        .bookings
        .attach_feedback(&principal, booking_id, payload.rating, payload.review)
        .await?;

    Ok(Json(FeedbackResponse {
        rating_pending: outcome.provider_rating.is_none(),
        booking: outcome.booking.into(),
        provider_rating: outcome.provider_rating.map(Into::into),
    }))
}

pub async fn list_booking_transactions(
    State(state): State<AppState>,
    principal: Principal,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Vec<TransactionResponse>>, AppError> {
    let transactions = state
        .payments
        .list_transactions(&principal, booking_id)
        .await?;
    Ok(Json(transactions.into_iter().map(Into::into).collect()))
}
