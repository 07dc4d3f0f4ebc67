//! Domain event trigger points. Delivery (email, push) lives elsewhere; the
//! default sink only logs.

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::models::BookingStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    BookingCreated {
        booking_id: Uuid,
        customer_id: Uuid,
        provider_id: Uuid,
    },
    BookingStatusChanged {
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    },
    PaymentSucceeded {
        transaction_id: Uuid,
        booking_id: Uuid,
        amount: Decimal,
    },
    PaymentFailed {
        transaction_id: Uuid,
        booking_id: Uuid,
        reason: String,
    },
    /// Money moved for an attempt or booking that can no longer use it;
    /// an admin should refund.
    PaymentCapturedForInactiveBooking {
        transaction_id: Uuid,
        booking_id: Uuid,
        gateway_transaction_id: String,
    },
    RefundIssued {
        transaction_id: Uuid,
        refund_id: Uuid,
        amount: Decimal,
    },
    FeedbackSubmitted {
        booking_id: Uuid,
        provider_id: Uuid,
        rating: u8,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BookingCreated { .. } => "booking_created",
            Self::BookingStatusChanged { .. } => "booking_status_changed",
            Self::PaymentSucceeded { .. } => "payment_succeeded",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::PaymentCapturedForInactiveBooking { .. } => {
                "payment_captured_for_inactive_booking"
            }
            Self::RefundIssued { .. } => "refund_issued",
            Self::FeedbackSubmitted { .. } => "feedback_submitted",
        }
    }
}

pub trait EventSink: Send + Sync {
    /// Must not fail the calling operation.
    fn emit(&self, event: DomainEvent);
}

#[derive(Debug, Default, Clone)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: DomainEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match event {
            DomainEvent::PaymentCapturedForInactiveBooking { .. } => {
                tracing::warn!(event = event.name(), payload = %payload, "Domain event");
            }
            _ => tracing::info!(event = event.name(), payload = %payload, "Domain event"),
        }
    }
}

/// Keeps every event in memory; used by tests to assert trigger points.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: std::sync::Mutex<Vec<DomainEvent>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: DomainEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}
