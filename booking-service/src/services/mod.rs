pub mod bookings;
pub mod catalog;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod mongo;
pub mod payments;
pub mod rating;
pub mod reconciler;
pub mod repository;
pub mod sandbox;
pub mod stripe;
pub mod webhook;

pub use bookings::BookingService;
pub use catalog::ServiceCatalog;
pub use events::{DomainEvent, EventSink, LogEventSink, RecordingEventSink};
pub use gateway::{BoundedGateway, GatewayFailure, GatewayOutcome, PaymentGateway};
pub use ledger::TransactionLedger;
pub use memory::InMemoryRepository;
pub use metrics::{get_metrics, init_metrics};
pub use mongo::{MongoCatalog, MongoRepository};
pub use payments::PaymentService;
pub use rating::RatingAggregator;
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerSettings};
pub use repository::Repository;
pub use sandbox::SandboxGateway;
pub use stripe::StripeGateway;

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use service_core::error::AppError;
use std::future::Future;
use std::time::Duration;

/// Re-run `op` while it loses optimistic-concurrency races. Any other error
/// is returned immediately; a conflict that outlives the retry budget is
/// returned as `Conflict`.
pub(crate) async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(5))
        .with_max_interval(Duration::from_millis(200))
        .with_max_elapsed_time(Some(Duration::from_secs(5)))
        .build();

    retry(policy, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| match e {
                AppError::Conflict(_) => backoff::Error::transient(e),
                other => backoff::Error::permanent(other),
            })
        }
    })
    .await
}
