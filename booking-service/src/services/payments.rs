//! Payment flow entry points: intents, confirmations, webhooks, refunds.

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::bookings::BookingService;
use super::gateway::{IntentRequest, PaymentGateway};
use super::ledger::TransactionLedger;
use super::repository::Repository;
use super::webhook::{self, WebhookAction};
use crate::models::{
    Booking, BookingStatus, PaymentMethod, Principal, Role, Transaction, TransactionStatus,
};

#[derive(Debug, Clone)]
pub struct IntentCreated {
    pub transaction: Transaction,
    pub client_secret: String,
    /// The booking already had an open attempt and its intent was handed
    /// back instead of a new one.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    pub transaction: Transaction,
    pub booking: Booking,
}

#[derive(Clone)]
pub struct PaymentService {
    repo: Arc<dyn Repository>,
    bookings: BookingService,
    ledger: TransactionLedger,
    gateway: Arc<dyn PaymentGateway>,
    webhook_secret: Secret<String>,
}

impl PaymentService {
    pub fn new(
        repo: Arc<dyn Repository>,
        bookings: BookingService,
        ledger: TransactionLedger,
        gateway: Arc<dyn PaymentGateway>,
        webhook_secret: Secret<String>,
    ) -> Self {
        Self {
            repo,
            bookings,
            ledger,
            gateway,
            webhook_secret,
        }
    }

    /// Load a booking the principal may pay for.
    async fn payable_booking(&self, principal: &Principal, id: Uuid) -> Result<Booking, AppError> {
        let booking = self.bookings.get(principal, id).await?;
        let is_customer = principal.role == Role::Customer && booking.customer_id == principal.id;
        if !(is_customer || principal.is_admin()) {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Only the booking's customer can pay for it"
            )));
        }
        Ok(booking)
    }

    /// Open a transaction for a pending booking and create the matching
    /// gateway intent. A booking that already has an open attempt gets that
    /// attempt's intent back, so an abandoned checkout can be resumed.
    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn create_payment_intent(
        &self,
        principal: &Principal,
        booking_id: Uuid,
        payment_method: PaymentMethod,
    ) -> Result<IntentCreated, AppError> {
        let booking = self.payable_booking(principal, booking_id).await?;
        if booking.status != BookingStatus::Pending {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Booking {} is {} and not awaiting payment",
                booking_id,
                booking.status
            )));
        }

        let (tx, reused) = match self
            .ledger
            .create_pending_transaction(booking.id, payment_method)
            .await
        {
            Ok(tx) => (tx, false),
            Err(AppError::Conflict(e)) => match self.open_attempt(booking.id).await? {
                Some(tx) => (tx, true),
                None => return Err(AppError::Conflict(e)),
            },
            Err(e) => return Err(e),
        };

        let Some(amount) = tx.amount_minor_units() else {
            self.ledger
                .fail(tx.id, "amount not representable".to_string())
                .await?;
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Service price {} cannot be charged",
                tx.amount
            )));
        };

        // The idempotency key is derived from the transaction id, so asking
        // again for an open attempt returns the intent created the first time.
        let request = IntentRequest {
            amount,
            currency: tx.currency.clone(),
            booking_id: booking.id,
            transaction_id: tx.id,
        };
        match self.gateway.create_intent(&request).await {
            Ok(intent) => {
                let transaction = self.ledger.attach_intent(tx.id, intent.intent_id).await?;
                if reused {
                    tracing::info!(transaction_id = %tx.id, "Resuming open payment attempt");
                }
                Ok(IntentCreated {
                    transaction,
                    client_secret: intent.client_secret,
                    reused,
                })
            }
            Err(failure) if tx.intent_id.is_none() => {
                // No client secret left the service, so nothing can be
                // charged against this attempt.
                self.ledger
                    .fail(tx.id, format!("intent creation failed: {}", failure))
                    .await?;
                Err(failure.into())
            }
            Err(failure) => Err(failure.into()),
        }
    }

    async fn open_attempt(&self, booking_id: Uuid) -> Result<Option<Transaction>, AppError> {
        Ok(self
            .repo
            .list_transactions_for_booking(booking_id)
            .await?
            .into_iter()
            .find(|tx| tx.status == TransactionStatus::Pending))
    }

    /// Ask the gateway for the intent's outcome and record it.
    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn confirm_payment(
        &self,
        principal: &Principal,
        booking_id: Uuid,
        intent_id: &str,
    ) -> Result<PaymentConfirmation, AppError> {
        self.payable_booking(principal, booking_id).await?;
        let tx = self
            .repo
            .find_transaction_by_intent(intent_id)
            .await?
            .filter(|tx| tx.booking_id == booking_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No transaction for intent {} on booking {}",
                    intent_id,
                    booking_id
                ))
            })?;

        // A gateway error leaves the transaction pending for reconciliation.
        let outcome = self.gateway.confirm(intent_id).await?;
        let recorded = self.ledger.record_gateway_outcome(tx.id, outcome).await?;

        let booking = match recorded.booking {
            Some(booking) => booking,
            None => self.bookings.get(principal, booking_id).await?,
        };
        Ok(PaymentConfirmation {
            transaction: recorded.transaction,
            booking,
        })
    }

    /// Verify and apply a gateway webhook delivery.
    #[instrument(skip_all)]
    pub async fn handle_webhook(&self, signature: Option<&str>, body: &[u8]) -> Result<(), AppError> {
        let secret = self.webhook_secret.expose_secret();
        if secret.is_empty() {
            return Err(AppError::ServiceUnavailable);
        }
        let header = signature.ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing webhook signature"))
        })?;
        let valid = webhook::verify_signature(
            secret,
            header,
            body,
            webhook::DEFAULT_TOLERANCE_SECS,
        )
        .map_err(AppError::BadRequest)?;
        if !valid {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Invalid webhook signature"
            )));
        }

        let event = webhook::parse_event(body).map_err(AppError::BadRequest)?;
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Webhook received");

        match event.action() {
            WebhookAction::Record { intent_id, outcome } => {
                match self.repo.find_transaction_by_intent(&intent_id).await? {
                    Some(tx) => {
                        self.ledger.record_gateway_outcome(tx.id, outcome).await?;
                    }
                    None => {
                        tracing::warn!(intent_id = %intent_id, "Webhook for unknown intent");
                    }
                }
            }
            WebhookAction::Ignore => {
                tracing::debug!(event_type = %event.event_type, "Webhook event ignored");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, principal, reason), fields(principal_id = %principal.id))]
    pub async fn refund(
        &self,
        principal: &Principal,
        transaction_id: Uuid,
        amount: Decimal,
        reason: String,
    ) -> Result<Transaction, AppError> {
        if !principal.is_admin() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Only admins can issue refunds"
            )));
        }
        self.ledger.refund(transaction_id, amount, reason).await
    }

    pub async fn get_transaction(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<Transaction, AppError> {
        let tx = self.ledger.load(id).await?;
        // Visibility follows the booking.
        self.bookings.get(principal, tx.booking_id).await?;
        Ok(tx)
    }

    pub async fn list_transactions(
        &self,
        principal: &Principal,
        booking_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        self.bookings.get(principal, booking_id).await?;
        self.repo.list_transactions_for_booking(booking_id).await
    }
}
