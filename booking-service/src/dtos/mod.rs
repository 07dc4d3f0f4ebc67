use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::models::{
    Booking, BookingStatus, PaymentMethod, ProviderRating, RatingEntry, RefundRecord,
    StatusChange, TimeWindow, Transaction, TransactionStatus,
};

#[derive(Debug, Deserialize, Validate)]
pub struct TimeWindowRequest {
    #[validate(length(min = 1))]
    pub start_time: String,
    #[validate(length(min = 1))]
    pub end_time: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBookingRequest {
    pub service_id: Uuid,
    #[validate(length(min = 1))]
    pub date: String,
    #[validate(nested)]
    pub scheduled_time: Option<TimeWindowRequest>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateBookingStatusRequest {
    #[validate(length(min = 1))]
    pub status: String,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FeedbackRequest {
    #[validate(range(min = 1, max = 5))]
    pub rating: u8,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub review: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateIntentRequest {
    pub booking_id: Uuid,
    #[serde(default)]
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmPaymentRequest {
    pub booking_id: Uuid,
    #[validate(length(min = 1))]
    pub intent_id: String,
}

fn positive_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_positive() && !amount.is_zero() {
        Ok(())
    } else {
        Err(ValidationError::new("amount_must_be_positive"))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    #[validate(custom(function = "positive_amount"))]
    pub amount: Decimal,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct FeedbackView {
    pub rating: u8,
    pub review: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub service_id: Uuid,
    pub date: String,
    pub scheduled_time: Option<TimeWindow>,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub customer_feedback: Option<FeedbackView>,
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Booking> for BookingResponse {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            customer_id: b.customer_id,
            provider_id: b.provider_id,
            service_id: b.service_id,
            date: b.date.format("%Y-%m-%d").to_string(),
            scheduled_time: b.scheduled_time,
            status: b.status,
            notes: b.notes,
            cancellation_reason: b.cancellation_reason,
            customer_feedback: b.customer_feedback.map(|f| FeedbackView {
                rating: f.rating,
                review: f.review,
                submitted_at: f.submitted_at,
            }),
            history: b.history,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub payment_method: PaymentMethod,
    pub intent_id: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refunds: Vec<RefundRecord>,
    pub refunded_total: Decimal,
    pub refundable_amount: Decimal,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Transaction> for TransactionResponse {
    fn from(t: Transaction) -> Self {
        let refunded_total = t.refunded_total();
        let refundable_amount = t.refundable_amount();
        let (gateway_transaction_id, paid_at) = match t.payment_details {
            Some(d) => (Some(d.gateway_transaction_id), Some(d.paid_at)),
            None => (None, None),
        };
        Self {
            id: t.id,
            booking_id: t.booking_id,
            amount: t.amount,
            currency: t.currency,
            status: t.status,
            payment_method: t.payment_method,
            intent_id: t.intent_id,
            gateway_transaction_id,
            paid_at,
            refunds: t.refunds,
            refunded_total,
            refundable_amount,
            failure_reason: t.failure_reason,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IntentResponse {
    pub transaction_id: Uuid,
    pub intent_id: Option<String>,
    pub client_secret: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmPaymentResponse {
    pub transaction: TransactionResponse,
    pub booking: BookingResponse,
}

#[derive(Debug, Serialize)]
pub struct ProviderRatingResponse {
    pub provider_id: Uuid,
    pub average_rating: f64,
    pub count: usize,
    pub ratings: Vec<RatingEntry>,
}

impl From<ProviderRating> for ProviderRatingResponse {
    fn from(r: ProviderRating) -> Self {
        Self {
            provider_id: r.provider_id,
            average_rating: r.average_rating,
            count: r.ratings.len(),
            ratings: r.ratings,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub booking: BookingResponse,
    pub provider_rating: Option<ProviderRatingResponse>,
    /// True when the provider's average has not absorbed this rating yet.
    pub rating_pending: bool,
}
