//! Background repair of work left half-done by timeouts or crashes:
//! pending payments the gateway has since settled, abandoned payment
//! attempts, payment => booking confirmations, rating aggregation and
//! unsettled refund reservations.

use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bookings::BookingService;
use super::gateway::{GatewayOutcome, PaymentGateway};
use super::ledger::TransactionLedger;
use super::repository::Repository;
use crate::models::TransactionStatus;

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    /// How long a pending payment or refund is left alone before polling.
    pub stale_after: Duration,
    /// An attempt whose intent is still open this long after it was
    /// created is cancelled so the booking can be paid again.
    pub attempt_ttl: Duration,
    pub batch_size: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub payments_resolved: usize,
    pub attempts_expired: usize,
    pub bookings_synced: usize,
    pub ratings_applied: usize,
    pub refunds_settled: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    repo: Arc<dyn Repository>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: TransactionLedger,
    bookings: BookingService,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn Repository>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: TransactionLedger,
        bookings: BookingService,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            repo,
            gateway,
            ledger,
            bookings,
            settings,
        }
    }

    /// One full pass. Individual failures are logged and skipped; only a
    /// failed storage scan aborts the pass.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ReconcileReport, AppError> {
        let mut report = ReconcileReport::default();
        let now = Utc::now();
        let cutoff = now - to_chrono(self.settings.stale_after);
        let expiry = now - to_chrono(self.settings.attempt_ttl);
        let limit = self.settings.batch_size;

        for tx in self.repo.stale_pending_transactions(cutoff, limit).await? {
            let Some(intent_id) = tx.intent_id.clone() else {
                // No client secret was handed out for this attempt.
                match self
                    .ledger
                    .fail(tx.id, "abandoned before intent creation".to_string())
                    .await
                {
                    Ok(_) => report.attempts_expired += 1,
                    Err(e) => {
                        tracing::warn!(transaction_id = %tx.id, error = %e, "Expire attempt failed")
                    }
                }
                continue;
            };
            let outcome = match self.gateway.confirm(&intent_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(transaction_id = %tx.id, error = %e, "Gateway poll failed");
                    continue;
                }
            };
            match outcome {
                GatewayOutcome::Processing if tx.created_at < expiry => {
                    match self
                        .ledger
                        .cancel_attempt(tx.id, &intent_id, "payment attempt expired".to_string())
                        .await
                    {
                        Ok(recorded) if recorded.transaction.status.was_paid() => {
                            report.payments_resolved += 1
                        }
                        Ok(recorded) if recorded.transaction.status == TransactionStatus::Failed => {
                            report.attempts_expired += 1
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(transaction_id = %tx.id, error = %e, "Expire attempt failed")
                        }
                    }
                }
                GatewayOutcome::Processing => {}
                outcome => match self.ledger.record_gateway_outcome(tx.id, outcome).await {
                    Ok(_) => report.payments_resolved += 1,
                    Err(e) => {
                        tracing::warn!(transaction_id = %tx.id, error = %e, "Reconcile payment failed")
                    }
                },
            }
        }

        for tx in self.repo.transactions_awaiting_booking_sync(limit).await? {
            if self.ledger.sync_booking(&tx).await.is_some() {
                report.bookings_synced += 1;
            }
        }

        for booking in self.repo.bookings_with_pending_rating(limit).await? {
            let id = booking.id;
            match self.bookings.complete_pending_rating(booking).await {
                Ok(_) => report.ratings_applied += 1,
                Err(e) => tracing::warn!(booking_id = %id, error = %e, "Reconcile rating failed"),
            }
        }

        for tx in self
            .repo
            .transactions_with_requested_refunds(cutoff, limit)
            .await?
        {
            let stale: Vec<_> = tx
                .requested_refunds()
                .filter(|r| r.requested_at < cutoff)
                .map(|r| r.refund_id)
                .collect();
            for refund_id in stale {
                match self.ledger.retry_refund(tx.id, refund_id).await {
                    Ok(_) => report.refunds_settled += 1,
                    Err(e) => tracing::warn!(
                        transaction_id = %tx.id,
                        refund_id = %refund_id,
                        error = %e,
                        "Reconcile refund failed"
                    ),
                }
            }
        }

        if report != ReconcileReport::default() {
            tracing::info!(
                payments_resolved = report.payments_resolved,
                attempts_expired = report.attempts_expired,
                bookings_synced = report.bookings_synced,
                ratings_applied = report.ratings_applied,
                refunds_settled = report.refunds_settled,
                "Reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Run a pass every `interval`, the first one after a full interval,
    /// until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.settings.interval;
            let mut ticker = tokio::time::interval_at(start, self.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                interval_secs = self.settings.interval.as_secs(),
                "Reconciler started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Reconciler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "Reconciliation pass failed");
                        }
                    }
                }
            }
        })
    }
}
