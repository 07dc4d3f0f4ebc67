//! Transaction ledger: the record of what has actually been paid and
//! refunded.
//!
//! Payment success drives booking confirmation through an outbox marker on
//! the transaction (`booking_sync`). The marker is written in the same
//! conditional update that marks the transaction paid, and cleared only
//! after the booking side has been applied, so the reconciler can always
//! finish a half-done settlement.

use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::bookings::{BookingService, Settlement};
use super::catalog::ServiceCatalog;
use super::events::{DomainEvent, EventSink};
use super::gateway::{GatewayOutcome, PaymentGateway, RefundRequest};
use super::metrics;
use super::repository::Repository;
use super::retry_on_conflict;
use crate::models::{
    to_minor_units, Booking, BookingSync, PaymentMethod, RefundState, Transaction,
    TransactionStatus,
};

/// State of the ledger after a gateway outcome has been applied.
#[derive(Debug, Clone)]
pub struct RecordedOutcome {
    pub transaction: Transaction,
    /// Present once the booking side of a successful payment is settled.
    pub booking: Option<Booking>,
}

#[derive(Clone)]
pub struct TransactionLedger {
    repo: Arc<dyn Repository>,
    catalog: Arc<dyn ServiceCatalog>,
    bookings: BookingService,
    gateway: Arc<dyn PaymentGateway>,
    events: Arc<dyn EventSink>,
    currency: String,
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Transaction {} not found", id))
}

impl TransactionLedger {
    pub fn new(
        repo: Arc<dyn Repository>,
        catalog: Arc<dyn ServiceCatalog>,
        bookings: BookingService,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<dyn EventSink>,
        currency: String,
    ) -> Self {
        Self {
            repo,
            catalog,
            bookings,
            gateway,
            events,
            currency,
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub async fn load(&self, id: Uuid) -> Result<Transaction, AppError> {
        self.repo.get_transaction(id).await?.ok_or_else(|| not_found(id))
    }

    /// Open a payment attempt for `booking_id`, snapshotting the current
    /// service price.
    #[instrument(skip(self))]
    pub async fn create_pending_transaction(
        &self,
        booking_id: Uuid,
        payment_method: PaymentMethod,
    ) -> Result<Transaction, AppError> {
        let booking = self.repo.get_booking(booking_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Booking {} not found", booking_id))
        })?;
        let service = self.catalog.get_service(booking.service_id).await?;

        let tx = Transaction::new_pending(
            booking.id,
            service.price,
            self.currency.clone(),
            payment_method,
        );
        self.repo.insert_transaction(&tx).await?;

        tracing::info!(transaction_id = %tx.id, amount = %tx.amount, "Pending transaction created");
        Ok(tx)
    }

    /// Bind the gateway intent to a pending attempt. Re-attaching the same
    /// intent is a no-op.
    #[instrument(skip(self))]
    pub async fn attach_intent(&self, id: Uuid, intent_id: String) -> Result<Transaction, AppError> {
        retry_on_conflict(|| {
            let intent_id = intent_id.clone();
            async move {
                let mut tx = self.load(id).await?;
                if tx.status != TransactionStatus::Pending {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Payment attempt {} is {}; start a new one",
                        id,
                        tx.status
                    )));
                }
                match tx.intent_id.as_deref() {
                    Some(existing) if existing == intent_id => return Ok(tx),
                    Some(existing) => {
                        return Err(AppError::Conflict(anyhow::anyhow!(
                            "Payment attempt {} is bound to intent {}",
                            id,
                            existing
                        )))
                    }
                    None => {}
                }
                tx.intent_id = Some(intent_id);
                tx.updated_at = chrono::Utc::now();
                self.repo.update_transaction(&mut tx).await?;
                Ok(tx)
            }
        })
        .await
    }

    /// Mark a still-pending attempt failed. Paid or already failed attempts
    /// are returned unchanged.
    #[instrument(skip(self, reason))]
    pub async fn fail(&self, id: Uuid, reason: String) -> Result<Transaction, AppError> {
        retry_on_conflict(|| {
            let reason = reason.clone();
            async move {
                let mut tx = self.load(id).await?;
                if tx.status != TransactionStatus::Pending {
                    return Ok(tx);
                }
                tx.mark_failed(reason.clone());
                self.repo.update_transaction(&mut tx).await?;

                tracing::info!(transaction_id = %id, reason = %reason, "Transaction failed");
                metrics::record_payment_outcome("failed");
                self.events.emit(DomainEvent::PaymentFailed {
                    transaction_id: id,
                    booking_id: tx.booking_id,
                    reason,
                });
                Ok(tx)
            }
        })
        .await
    }

    /// Apply the gateway's authoritative outcome. Idempotent: webhooks,
    /// client confirmations and the reconciler may all report the same
    /// outcome.
    #[instrument(skip(self, outcome))]
    pub async fn record_gateway_outcome(
        &self,
        id: Uuid,
        outcome: GatewayOutcome,
    ) -> Result<RecordedOutcome, AppError> {
        match outcome {
            GatewayOutcome::Processing => self.unchanged(id).await,
            GatewayOutcome::Failed { reason, .. } => self.settle_failure(id, reason).await,
            GatewayOutcome::Declined { reason, .. } => {
                let transaction = self.load(id).await?;
                match (transaction.status, transaction.intent_id.as_deref()) {
                    // The intent could still be charged on a retry, so it is
                    // closed before the attempt is written off.
                    (TransactionStatus::Pending, Some(intent_id)) => {
                        self.cancel_attempt(id, intent_id, reason).await
                    }
                    _ => self.settle_failure(id, reason).await,
                }
            }
            GatewayOutcome::Succeeded {
                gateway_transaction_id,
                raw,
            } => self.settle_success(id, gateway_transaction_id, raw).await,
        }
    }

    /// Close the attempt's intent at the gateway and record what the gateway
    /// reports afterwards: failed once cancelled, paid if the customer got a
    /// charge through first. An unknown cancel outcome leaves the attempt
    /// pending.
    #[instrument(skip(self, reason))]
    pub async fn cancel_attempt(
        &self,
        id: Uuid,
        intent_id: &str,
        reason: String,
    ) -> Result<RecordedOutcome, AppError> {
        let outcome = match self.gateway.cancel_intent(intent_id).await {
            Ok(outcome) => outcome,
            Err(failure) if failure.outcome_unknown() => return Err(failure.into()),
            Err(failure) => {
                tracing::warn!(
                    transaction_id = %id,
                    intent_id,
                    error = %failure,
                    "Intent cancel rejected, polling its state"
                );
                self.gateway.confirm(intent_id).await?
            }
        };

        match outcome {
            GatewayOutcome::Failed { .. } => self.settle_failure(id, reason).await,
            GatewayOutcome::Succeeded {
                gateway_transaction_id,
                raw,
            } => self.settle_success(id, gateway_transaction_id, raw).await,
            GatewayOutcome::Declined { .. } | GatewayOutcome::Processing => {
                tracing::warn!(transaction_id = %id, intent_id, "Intent still open after cancel");
                self.unchanged(id).await
            }
        }
    }

    async fn unchanged(&self, id: Uuid) -> Result<RecordedOutcome, AppError> {
        Ok(RecordedOutcome {
            transaction: self.load(id).await?,
            booking: None,
        })
    }

    async fn settle_failure(&self, id: Uuid, reason: String) -> Result<RecordedOutcome, AppError> {
        let transaction = self.load(id).await?;
        if transaction.status.was_paid() {
            tracing::warn!(
                transaction_id = %id,
                reason = %reason,
                "Ignoring failure report for a paid transaction"
            );
            return Ok(RecordedOutcome {
                transaction,
                booking: None,
            });
        }
        let transaction = self.fail(id, reason).await?;
        Ok(RecordedOutcome {
            transaction,
            booking: None,
        })
    }

    async fn settle_success(
        &self,
        id: Uuid,
        gateway_transaction_id: String,
        raw: serde_json::Value,
    ) -> Result<RecordedOutcome, AppError> {
        let transaction = self.mark_paid(id, gateway_transaction_id, raw).await?;
        let booking = self.sync_booking(&transaction).await;
        let transaction = if booking.is_some() {
            self.load(id).await?
        } else {
            transaction
        };
        Ok(RecordedOutcome {
            transaction,
            booking,
        })
    }

    async fn mark_paid(
        &self,
        id: Uuid,
        gateway_transaction_id: String,
        raw: serde_json::Value,
    ) -> Result<Transaction, AppError> {
        retry_on_conflict(|| {
            let gateway_transaction_id = gateway_transaction_id.clone();
            let raw = raw.clone();
            async move {
                let mut tx = self.load(id).await?;
                match tx.status {
                    TransactionStatus::Pending => {}
                    TransactionStatus::Failed => {
                        // Failed is terminal; the captured money needs an
                        // admin refund outside this attempt.
                        tracing::error!(
                            transaction_id = %id,
                            gateway_transaction_id = %gateway_transaction_id,
                            "Payment captured for a failed transaction"
                        );
                        self.events.emit(DomainEvent::PaymentCapturedForInactiveBooking {
                            transaction_id: id,
                            booking_id: tx.booking_id,
                            gateway_transaction_id,
                        });
                        return Ok(tx);
                    }
                    _ => return Ok(tx),
                }

                tx.mark_paid(gateway_transaction_id, raw);
                self.repo.update_transaction(&mut tx).await?;

                tracing::info!(transaction_id = %id, amount = %tx.amount, "Transaction paid");
                metrics::record_payment_outcome("succeeded");
                self.events.emit(DomainEvent::PaymentSucceeded {
                    transaction_id: id,
                    booking_id: tx.booking_id,
                    amount: tx.amount,
                });
                Ok(tx)
            }
        })
        .await
    }

    /// Replay the payment => booking confirmation step for `tx` if it is
    /// still outstanding. Failures are logged and left for the reconciler.
    #[instrument(skip(self, tx), fields(transaction_id = %tx.id, booking_id = %tx.booking_id))]
    pub async fn sync_booking(&self, tx: &Transaction) -> Option<Booking> {
        if tx.booking_sync != BookingSync::Pending {
            return None;
        }

        let booking = match self.bookings.confirm_from_settlement(tx.booking_id).await {
            Ok(Settlement::Confirmed(booking)) | Ok(Settlement::AlreadyConfirmed(booking)) => {
                booking
            }
            Ok(Settlement::Inactive(booking)) => {
                tracing::warn!(status = %booking.status, "Payment captured for an inactive booking");
                if let Some(gateway_transaction_id) = tx.gateway_transaction_id() {
                    self.events.emit(DomainEvent::PaymentCapturedForInactiveBooking {
                        transaction_id: tx.id,
                        booking_id: tx.booking_id,
                        gateway_transaction_id: gateway_transaction_id.to_string(),
                    });
                }
                booking
            }
            Err(e) => {
                tracing::warn!(error = %e, "Booking confirmation deferred");
                return None;
            }
        };

        let id = tx.id;
        let cleared = retry_on_conflict(|| async move {
            let mut current = self.load(id).await?;
            if current.booking_sync != BookingSync::Pending {
                return Ok(());
            }
            current.booking_sync = BookingSync::Done;
            self.repo.update_transaction(&mut current).await
        })
        .await;
        if let Err(e) = cleared {
            tracing::warn!(error = %e, "Booking sync marker not cleared");
        }

        Some(booking)
    }

    /// Refund `amount` of a paid transaction.
    ///
    /// The amount is reserved on the transaction before the gateway is
    /// called, so concurrent refunds can never add up past the paid amount.
    /// A definitive gateway rejection releases the reservation; an unknown
    /// outcome keeps it for [`Self::retry_refund`].
    #[instrument(skip(self, reason))]
    pub async fn refund(
        &self,
        id: Uuid,
        amount: Decimal,
        reason: String,
    ) -> Result<Transaction, AppError> {
        if amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Refund amount must be positive"
            )));
        }
        if amount.normalize().scale() > 2 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Refund amount has more than two decimal places"
            )));
        }
        let minor = to_minor_units(amount).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Refund amount out of range"))
        })?;

        let refund_id = Uuid::new_v4();
        let tx = retry_on_conflict(|| {
            let reason = reason.clone();
            async move {
                let mut tx = self.load(id).await?;
                if !tx.status.is_refundable() {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "Transaction {} is {} and cannot be refunded",
                        id,
                        tx.status
                    )));
                }
                let available = tx.refundable_amount();
                if amount > available {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "Refund of {} exceeds refundable amount {}",
                        amount,
                        available
                    )));
                }
                tx.reserve_refund(refund_id, amount, reason);
                self.repo.update_transaction(&mut tx).await?;
                Ok(tx)
            }
        })
        .await?;

        let intent_id = tx.intent_id.clone().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Paid transaction {} has no intent", id))
        })?;
        self.settle_refund(
            id,
            RefundRequest {
                intent_id,
                amount: minor,
                reason,
                refund_id,
            },
        )
        .await
    }

    /// Re-drive a refund reservation whose gateway outcome was unknown. The
    /// original idempotency key is reused.
    #[instrument(skip(self))]
    pub async fn retry_refund(&self, id: Uuid, refund_id: Uuid) -> Result<Transaction, AppError> {
        let tx = self.load(id).await?;
        let record = tx.find_refund(refund_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Refund {} not found", refund_id))
        })?;
        if record.state != RefundState::Requested {
            return Ok(tx);
        }
        let (Some(intent_id), Some(amount)) = (tx.intent_id.clone(), to_minor_units(record.amount))
        else {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Refund {} cannot be replayed",
                refund_id
            )));
        };
        let request = RefundRequest {
            intent_id,
            amount,
            reason: record.reason.clone(),
            refund_id,
        };
        self.settle_refund(id, request).await
    }

    async fn settle_refund(
        &self,
        id: Uuid,
        request: RefundRequest,
    ) -> Result<Transaction, AppError> {
        let refund_id = request.refund_id;
        match self.gateway.refund(&request).await {
            Ok(refund) => {
                let tx = retry_on_conflict(|| {
                    let gateway_refund_id = refund.gateway_refund_id.clone();
                    async move {
                        let mut tx = self.load(id).await?;
                        if tx.complete_refund(refund_id, gateway_refund_id) {
                            self.repo.update_transaction(&mut tx).await?;
                        }
                        Ok(tx)
                    }
                })
                .await?;

                let amount = tx
                    .find_refund(refund_id)
                    .map(|r| r.amount)
                    .unwrap_or_default();
                tracing::info!(
                    transaction_id = %id,
                    refund_id = %refund_id,
                    amount = %amount,
                    status = %tx.status,
                    "Refund completed"
                );
                metrics::record_refund("completed");
                self.events.emit(DomainEvent::RefundIssued {
                    transaction_id: id,
                    refund_id,
                    amount,
                });
                Ok(tx)
            }
            Err(failure) if failure.outcome_unknown() => {
                tracing::warn!(
                    transaction_id = %id,
                    refund_id = %refund_id,
                    error = %failure,
                    "Refund outcome unknown, reservation kept"
                );
                metrics::record_refund("unknown");
                Err(failure.into())
            }
            Err(failure) => {
                tracing::warn!(
                    transaction_id = %id,
                    refund_id = %refund_id,
                    error = %failure,
                    "Refund rejected, reservation released"
                );
                metrics::record_refund("rejected");
                retry_on_conflict(|| async move {
                    let mut tx = self.load(id).await?;
                    if tx.release_refund(refund_id) {
                        self.repo.update_transaction(&mut tx).await?;
                    }
                    Ok(())
                })
                .await?;
                Err(failure.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookingStatus, Principal, Role, ServiceListing};
    use crate::services::bookings::NewBooking;
    use crate::services::events::RecordingEventSink;
    use crate::services::gateway::IntentRequest;
    use crate::services::memory::InMemoryRepository;
    use crate::services::rating::RatingAggregator;
    use crate::services::sandbox::SandboxGateway;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Fixture<G = SandboxGateway> {
        ledger: TransactionLedger,
        bookings: BookingService,
        gateway: Arc<G>,
        events: Arc<RecordingEventSink>,
        customer: Principal,
        service_id: Uuid,
    }

    fn fixture() -> Fixture {
        fixture_over(Arc::new(SandboxGateway::new()))
    }

    fn fixture_over<G: PaymentGateway + 'static>(gateway: Arc<G>) -> Fixture<G> {
        let repo = Arc::new(InMemoryRepository::new());
        let service_id = Uuid::new_v4();
        repo.insert_service(ServiceListing {
            id: service_id,
            provider_id: Uuid::new_v4(),
            price: dec!(25.00),
            is_available: true,
        });
        let events = Arc::new(RecordingEventSink::default());
        let bookings = BookingService::new(
            repo.clone(),
            repo.clone(),
            RatingAggregator::new(repo.clone()),
            events.clone(),
        );
        let ledger = TransactionLedger::new(
            repo.clone(),
            repo,
            bookings.clone(),
            gateway.clone(),
            events.clone(),
            "usd".to_string(),
        );
        Fixture {
            ledger,
            bookings,
            gateway,
            events,
            customer: Principal::new(Uuid::new_v4(), Role::Customer),
            service_id,
        }
    }

    /// A booking with a pending transaction that has no intent yet.
    async fn pending_attempt<G>(f: &Fixture<G>) -> (Booking, Transaction) {
        let booking = f
            .bookings
            .create(
                &f.customer,
                NewBooking {
                    service_id: f.service_id,
                    date: (Utc::now() + Duration::days(2)).date_naive(),
                    time_window: None,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let tx = f
            .ledger
            .create_pending_transaction(booking.id, PaymentMethod::Upi)
            .await
            .unwrap();
        (booking, tx)
    }

    /// A booking with a pending transaction that has a sandbox intent.
    async fn open_attempt(f: &Fixture) -> (Booking, Transaction) {
        let (booking, tx) = pending_attempt(f).await;
        let intent = f
            .gateway
            .create_intent(&IntentRequest {
                amount: tx.amount_minor_units().unwrap(),
                currency: tx.currency.clone(),
                booking_id: booking.id,
                transaction_id: tx.id,
            })
            .await
            .unwrap();
        let tx = f.ledger.attach_intent(tx.id, intent.intent_id).await.unwrap();
        (booking, tx)
    }

    fn success(id: &str) -> GatewayOutcome {
        GatewayOutcome::Succeeded {
            gateway_transaction_id: id.to_string(),
            raw: json!({ "id": id }),
        }
    }

    fn count<G>(f: &Fixture<G>, name: &str) -> usize {
        f.events.events().iter().filter(|e| e.name() == name).count()
    }

    #[tokio::test]
    async fn pending_transaction_snapshots_price_and_currency() {
        let f = fixture();
        let (_, tx) = open_attempt(&f).await;
        assert_eq!(tx.amount, dec!(25.00));
        assert_eq!(tx.currency, "usd");
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.intent_id.is_some());
    }

    #[tokio::test]
    async fn success_is_recorded_once() {
        let f = fixture();
        let (booking, tx) = open_attempt(&f).await;

        let first = f
            .ledger
            .record_gateway_outcome(tx.id, success("ch_1"))
            .await
            .unwrap();
        assert_eq!(first.transaction.status, TransactionStatus::Paid);
        assert_eq!(first.transaction.booking_sync, BookingSync::Done);
        assert_eq!(first.booking.unwrap().status, BookingStatus::Confirmed);

        let second = f
            .ledger
            .record_gateway_outcome(tx.id, success("ch_1"))
            .await
            .unwrap();
        assert_eq!(second.transaction.status, TransactionStatus::Paid);
        assert!(second.booking.is_none());

        assert_eq!(count(&f, "payment_succeeded"), 1);
        let booking = f.bookings.get(&f.customer, booking.id).await.unwrap();
        assert_eq!(booking.history.len(), 1);
    }

    #[tokio::test]
    async fn failure_report_does_not_undo_a_payment() {
        let f = fixture();
        let (_, tx) = open_attempt(&f).await;
        f.ledger
            .record_gateway_outcome(tx.id, success("ch_2"))
            .await
            .unwrap();

        let recorded = f
            .ledger
            .record_gateway_outcome(
                tx.id,
                GatewayOutcome::Failed {
                    reason: "card_declined".into(),
                    raw: json!({}),
                },
            )
            .await
            .unwrap();
        assert_eq!(recorded.transaction.status, TransactionStatus::Paid);
        assert_eq!(count(&f, "payment_failed"), 0);
    }

    #[tokio::test]
    async fn failed_transaction_is_not_resurrected_by_a_late_success() {
        let f = fixture();
        let (booking, tx) = open_attempt(&f).await;
        f.ledger.fail(tx.id, "abandoned".into()).await.unwrap();

        let recorded = f
            .ledger
            .record_gateway_outcome(tx.id, success("ch_3"))
            .await
            .unwrap();
        assert_eq!(recorded.transaction.status, TransactionStatus::Failed);
        assert!(recorded.booking.is_none());
        assert_eq!(count(&f, "payment_captured_for_inactive_booking"), 1);

        let booking = f.bookings.get(&f.customer, booking.id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn failing_twice_emits_once() {
        let f = fixture();
        let (_, tx) = open_attempt(&f).await;
        f.ledger.fail(tx.id, "declined".into()).await.unwrap();
        let again = f.ledger.fail(tx.id, "declined".into()).await.unwrap();
        assert_eq!(again.failure_reason.as_deref(), Some("declined"));
        assert_eq!(count(&f, "payment_failed"), 1);
    }

    #[tokio::test]
    async fn refund_requires_a_paid_transaction_and_cent_precision() {
        let f = fixture();
        let (_, tx) = open_attempt(&f).await;

        let err = f
            .ledger
            .refund(tx.id, dec!(5.00), "early".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let intent_id = tx.intent_id.clone().unwrap();
        assert!(f.gateway.capture(&intent_id));
        f.ledger
            .record_gateway_outcome(tx.id, success("ch_4"))
            .await
            .unwrap();

        let err = f
            .ledger
            .refund(tx.id, dec!(1.005), "fractional".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let tx = f
            .ledger
            .refund(tx.id, dec!(25), "full".into())
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Refunded);
        assert_eq!(tx.refunds[0].state, RefundState::Completed);
        assert!(tx.refunds[0].gateway_refund_id.is_some());
        assert_eq!(count(&f, "refund_issued"), 1);
    }

    #[tokio::test]
    async fn retrying_a_settled_refund_does_not_refund_twice() {
        let f = fixture();
        let (_, tx) = open_attempt(&f).await;
        assert!(f.gateway.capture(tx.intent_id.as_deref().unwrap()));
        f.ledger
            .record_gateway_outcome(tx.id, success("ch_5"))
            .await
            .unwrap();

        let tx = f
            .ledger
            .refund(tx.id, dec!(10), "partial".into())
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::PartiallyRefunded);

        let refund_id = tx.refunds[0].refund_id;
        let replayed = f.ledger.retry_refund(tx.id, refund_id).await.unwrap();
        assert_eq!(replayed.refunded_total(), dec!(10));
        assert_eq!(f.gateway.refund_count(), 1);
    }

    fn declined() -> GatewayOutcome {
        GatewayOutcome::Declined {
            reason: "card_declined".into(),
            raw: json!({ "status": "requires_payment_method" }),
        }
    }

    #[tokio::test]
    async fn attaching_an_intent_is_idempotent() {
        let f = fixture();
        let (_, tx) = open_attempt(&f).await;
        let intent_id = tx.intent_id.clone().unwrap();

        let again = f.ledger.attach_intent(tx.id, intent_id).await.unwrap();
        assert_eq!(again.version, tx.version);

        let err = f
            .ledger
            .attach_intent(tx.id, "pi_other".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn decline_closes_the_intent_before_failing() {
        let f = fixture();
        let (booking, tx) = open_attempt(&f).await;
        let intent_id = tx.intent_id.clone().unwrap();
        assert!(f.gateway.decline(&intent_id, "card_declined"));

        let recorded = f
            .ledger
            .record_gateway_outcome(tx.id, declined())
            .await
            .unwrap();
        assert_eq!(recorded.transaction.status, TransactionStatus::Failed);
        assert_eq!(
            recorded.transaction.failure_reason.as_deref(),
            Some("card_declined")
        );

        // A retry on the checkout page can no longer be charged.
        assert!(!f.gateway.capture(&intent_id));
        let booking = f.bookings.get(&f.customer, booking.id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn decline_with_unreachable_gateway_stays_pending() {
        let f = fixture();
        let (_, tx) = open_attempt(&f).await;
        f.gateway.set_unavailable(true);

        let err = f
            .ledger
            .record_gateway_outcome(tx.id, declined())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "gateway_error");
        assert_eq!(f.ledger.load(tx.id).await.unwrap().status, TransactionStatus::Pending);
    }

    mod stripe {
        use super::*;
        use crate::services::stripe::StripeGateway;
        use secrecy::Secret;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        async fn stripe_fixture(server: &MockServer) -> (Fixture<StripeGateway>, Booking, Transaction) {
            let gateway = Arc::new(StripeGateway::new(
                server.uri(),
                Secret::new("sk_test_123".to_string()),
            ));
            let f = fixture_over(gateway);
            let (booking, tx) = pending_attempt(&f).await;
            let tx = f.ledger.attach_intent(tx.id, "pi_live".into()).await.unwrap();
            (f, booking, tx)
        }

        #[tokio::test]
        async fn declined_intent_is_cancelled_at_the_gateway() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/payment_intents/pi_live/cancel"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "id": "pi_live",
                    "status": "canceled",
                    "last_payment_error": { "code": "card_declined" }
                })))
                .expect(1)
                .mount(&server)
                .await;
            let (f, _, tx) = stripe_fixture(&server).await;

            let recorded = f
                .ledger
                .record_gateway_outcome(tx.id, declined())
                .await
                .unwrap();
            assert_eq!(recorded.transaction.status, TransactionStatus::Failed);
            assert_eq!(count(&f, "payment_failed"), 1);
        }

        #[tokio::test]
        async fn charge_that_beat_the_cancel_confirms_the_booking() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/payment_intents/pi_live/cancel"))
                .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                    "error": { "code": "payment_intent_unexpected_state" }
                })))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/v1/payment_intents/pi_live"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "id": "pi_live",
                    "status": "succeeded",
                    "latest_charge": "ch_retry"
                })))
                .expect(1)
                .mount(&server)
                .await;
            let (f, booking, tx) = stripe_fixture(&server).await;

            let recorded = f
                .ledger
                .record_gateway_outcome(tx.id, declined())
                .await
                .unwrap();
            assert_eq!(recorded.transaction.status, TransactionStatus::Paid);
            assert_eq!(recorded.transaction.gateway_transaction_id(), Some("ch_retry"));
            assert_eq!(recorded.booking.unwrap().status, BookingStatus::Confirmed);

            let booking = f.bookings.get(&f.customer, booking.id).await.unwrap();
            assert_eq!(booking.status, BookingStatus::Confirmed);
        }
    }
}
