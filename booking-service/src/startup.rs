//! Application startup and lifecycle management.

use axum::{
    middleware::from_fn,
    routing::{get, post, put},
    Router,
};
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    tracing::{make_request_span, request_id_middleware},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::{BookingConfig, GatewayProvider, StorageBackend};
use crate::handlers;
use crate::services::{
    init_metrics, BookingService, BoundedGateway, EventSink, InMemoryRepository, LogEventSink,
    MongoCatalog, MongoRepository, PaymentGateway, PaymentService, RatingAggregator, Reconciler,
    ReconcilerSettings, Repository, SandboxGateway, ServiceCatalog, StripeGateway,
    TransactionLedger,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub bookings: BookingService,
    pub payments: PaymentService,
}

/// The pluggable edges of the service. [`Application::build`] derives them
/// from configuration; tests hand them in directly.
#[derive(Clone)]
pub struct Components {
    pub repo: Arc<dyn Repository>,
    pub catalog: Arc<dyn ServiceCatalog>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub events: Arc<dyn EventSink>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
    reconciler: Reconciler,
    shutdown: CancellationToken,
}

async fn connect_mongo(config: &BookingConfig) -> Result<mongodb::Database, AppError> {
    let mut client_options = ClientOptions::parse(config.storage.database_url.expose_secret())
        .await
        .map_err(|e| {
            tracing::error!("Failed to parse MongoDB connection string: {}", e);
            AppError::DatabaseError(e.into())
        })?;
    client_options.app_name = Some("booking-service".to_string());

    let client = Client::with_options(client_options).map_err(|e| {
        tracing::error!("Failed to create MongoDB client: {}", e);
        AppError::DatabaseError(e.into())
    })?;
    Ok(client.database(&config.storage.database_name))
}

impl Components {
    pub async fn from_config(config: &BookingConfig) -> Result<Self, AppError> {
        let (repo, catalog): (Arc<dyn Repository>, Arc<dyn ServiceCatalog>) =
            match config.storage.backend {
                StorageBackend::Mongo => {
                    let db = connect_mongo(config).await?;
                    let repo = MongoRepository::new(&db);
                    repo.init_indexes().await.map_err(|e| {
                        tracing::error!("Failed to initialize database indexes: {}", e);
                        e
                    })?;
                    let catalog: Arc<dyn ServiceCatalog> = Arc::new(MongoCatalog::new(&db));
                    let repo: Arc<dyn Repository> = Arc::new(repo);
                    (repo, catalog)
                }
                StorageBackend::Memory => {
                    tracing::warn!("Using in-memory storage; data is lost on restart");
                    let memory = Arc::new(InMemoryRepository::new());
                    let repo: Arc<dyn Repository> = memory.clone();
                    let catalog: Arc<dyn ServiceCatalog> = memory;
                    (repo, catalog)
                }
            };

        let gateway: Arc<dyn PaymentGateway> = match config.gateway.provider {
            GatewayProvider::Stripe => {
                let stripe = StripeGateway::new(
                    config.gateway.api_base_url.clone(),
                    config.gateway.secret_key.clone(),
                );
                if stripe.is_configured() {
                    tracing::info!("Stripe gateway initialized");
                } else {
                    tracing::warn!(
                        "Stripe credentials not configured - payment features will be limited"
                    );
                }
                Arc::new(stripe)
            }
            GatewayProvider::Sandbox => {
                tracing::warn!("Using sandbox gateway - intents are captured immediately");
                Arc::new(SandboxGateway::new().with_auto_capture())
            }
        };

        Ok(Self {
            repo,
            catalog,
            gateway,
            events: Arc::new(LogEventSink),
        })
    }
}

pub fn reconciler_settings(config: &BookingConfig) -> ReconcilerSettings {
    ReconcilerSettings {
        interval: Duration::from_secs(config.reconciler.interval_secs.max(1)),
        stale_after: Duration::from_secs(config.reconciler.stale_after_secs),
        attempt_ttl: Duration::from_secs(config.reconciler.attempt_ttl_secs),
        batch_size: config.reconciler.batch_size.max(1),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/bookings", post(handlers::bookings::create_booking))
        .route("/bookings/mine", get(handlers::bookings::list_my_bookings))
        .route("/bookings/:id", get(handlers::bookings::get_booking))
        .route(
            "/bookings/:id/status",
            put(handlers::bookings::update_status),
        )
        .route(
            "/bookings/:id/feedback",
            post(handlers::bookings::submit_feedback),
        )
        .route(
            "/bookings/:id/transactions",
            get(handlers::bookings::list_booking_transactions),
        )
        .route("/payments/intents", post(handlers::payments::create_intent))
        .route("/payments/confirm", post(handlers::payments::confirm_payment))
        .route(
            "/transactions/:id",
            get(handlers::payments::get_transaction),
        )
        .route(
            "/transactions/:id/refunds",
            post(handlers::payments::refund_transaction),
        )
        .route("/webhooks/gateway", post(handlers::webhooks::gateway_webhook))
        .route(
            "/providers/:id/rating",
            get(handlers::providers::get_provider_rating),
        )
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                make_request_span(request)
            }),
        )
        .with_state(state)
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BookingConfig) -> Result<Self, AppError> {
        let components = Components::from_config(&config).await?;
        Self::build_with(config, components).await
    }

    /// Build around caller-supplied storage, catalog, gateway and event sink.
    pub async fn build_with(
        config: BookingConfig,
        components: Components,
    ) -> Result<Self, AppError> {
        init_metrics();

        let Components {
            repo,
            catalog,
            gateway,
            events,
        } = components;

        if config.gateway.webhook_secret.expose_secret().is_empty() {
            tracing::warn!("Webhook secret not configured - gateway webhooks will be refused");
        }

        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(BoundedGateway::new(gateway, config.gateway.timeout()));

        let ratings = RatingAggregator::new(repo.clone());
        let bookings = BookingService::new(repo.clone(), catalog.clone(), ratings, events.clone());
        let ledger = TransactionLedger::new(
            repo.clone(),
            catalog,
            bookings.clone(),
            gateway.clone(),
            events,
            config.gateway.currency.clone(),
        );
        let payments = PaymentService::new(
            repo.clone(),
            bookings.clone(),
            ledger.clone(),
            gateway.clone(),
            config.gateway.webhook_secret.clone(),
        );
        let reconciler = Reconciler::new(
            repo.clone(),
            gateway,
            ledger,
            bookings.clone(),
            reconciler_settings(&config),
        );

        let state = AppState {
            repo,
            bookings,
            payments,
        };

        // Port 0 picks a random port for tests
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Booking service: HTTP on port {}", port);

        Ok(Self {
            port,
            listener,
            router: router(state.clone()),
            state,
            reconciler,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// A handle on the background reconciler, for driving passes by hand.
    pub fn reconciler(&self) -> Reconciler {
        self.reconciler.clone()
    }

    /// Cancelling this token stops the server and the reconciler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve HTTP and run the reconciler until the shutdown token fires or
    /// the process receives Ctrl-C.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let shutdown = self.shutdown.clone();
        let reconciler = self.reconciler.spawn(shutdown.clone());

        let signal = shutdown.clone();
        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = signal.cancelled() => {}
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Shutdown signal received");
                    }
                }
            })
            .await;

        shutdown.cancel();
        if let Err(e) = reconciler.await {
            tracing::error!("Reconciler task failed: {}", e);
        }

        result.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
