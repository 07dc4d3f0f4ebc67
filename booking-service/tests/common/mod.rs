#![allow(dead_code)]

use booking_service::config::{
    BookingConfig, GatewayConfig, GatewayProvider, ReconcilerConfig, StorageBackend,
    StorageConfig,
};
use async_trait::async_trait;
use booking_service::models::{Booking, ProviderRating, ServiceListing, Transaction};
use booking_service::services::repository::BookingScope;
use booking_service::services::{
    EventSink, InMemoryRepository, PaymentGateway, Reconciler, RecordingEventSink, Repository,
    SandboxGateway, ServiceCatalog,
};
use booking_service::startup::{Application, Components};
use chrono::{DateTime, Days, Utc};
use reqwest::{Client, RequestBuilder, Response};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::error::AppError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const GATEWAY_TIMEOUT_MS: u64 = 200;

/// A caller identity, sent as the gateway-provided principal headers.
#[derive(Debug, Clone, Copy)]
pub struct User {
    pub id: Uuid,
    pub role: &'static str,
}

impl User {
    pub fn customer() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: "customer",
        }
    }

    pub fn provider() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: "provider",
        }
    }

    pub fn admin() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: "admin",
        }
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: Client,
    pub store: Arc<InMemoryRepository>,
    pub gateway: Arc<SandboxGateway>,
    pub events: Arc<RecordingEventSink>,
    pub reconciler: Reconciler,
    shutdown: CancellationToken,
}

pub fn test_config() -> BookingConfig {
    BookingConfig {
        common: service_core::config::Config {
            port: 0,
            environment: "test".to_string(),
        },
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            database_url: Secret::new(String::new()),
            database_name: "booking_test".to_string(),
        },
        gateway: GatewayConfig {
            provider: GatewayProvider::Sandbox,
            api_base_url: "http://localhost".to_string(),
            secret_key: Secret::new(String::new()),
            webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            currency: "usd".to_string(),
            timeout_ms: GATEWAY_TIMEOUT_MS,
        },
        reconciler: ReconcilerConfig {
            // Tests drive passes by hand.
            interval_secs: 3600,
            stale_after_secs: 0,
            attempt_ttl_secs: 3600,
            batch_size: 100,
        },
        log_level: "info".to_string(),
        otlp_endpoint: None,
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config()).await
    }

    pub async fn spawn_with(config: BookingConfig) -> Self {
        Self::spawn_over(config, Arc::new(InMemoryRepository::new()), None).await
    }

    /// Boot the application over a [`FaultyRepository`] wrapping the
    /// in-memory store.
    pub async fn spawn_faulty() -> (Self, Arc<FaultyRepository>) {
        let store = Arc::new(InMemoryRepository::new());
        let faulty = Arc::new(FaultyRepository::new(store.clone()));
        let app = Self::spawn_over(
            test_config(),
            store,
            Some(faulty.clone() as Arc<dyn Repository>),
        )
        .await;
        (app, faulty)
    }

    async fn spawn_over(
        config: BookingConfig,
        store: Arc<InMemoryRepository>,
        repo: Option<Arc<dyn Repository>>,
    ) -> Self {
        let gateway = Arc::new(SandboxGateway::new());
        let events = Arc::new(RecordingEventSink::default());

        let components = Components {
            repo: repo.unwrap_or_else(|| store.clone() as Arc<dyn Repository>),
            catalog: store.clone() as Arc<dyn ServiceCatalog>,
            gateway: gateway.clone() as Arc<dyn PaymentGateway>,
            events: events.clone() as Arc<dyn EventSink>,
        };

        let app = Application::build_with(config, components)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);
        let reconciler = app.reconciler();
        let shutdown = app.shutdown_token();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            client,
            store,
            gateway,
            events,
            reconciler,
            shutdown,
        }
    }

    /// Put a bookable service in the catalog and return its id.
    pub fn seed_service(&self, provider: &User, price: Decimal) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_service(ServiceListing {
            id,
            provider_id: provider.id,
            price,
            is_available: true,
        });
        id
    }

    pub fn seed_unavailable_service(&self, provider: &User) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_service(ServiceListing {
            id,
            provider_id: provider.id,
            price: Decimal::new(5000, 2),
            is_available: false,
        });
        id
    }

    fn as_user(&self, builder: RequestBuilder, user: &User) -> RequestBuilder {
        builder
            .header("x-user-id", user.id.to_string())
            .header("x-user-role", user.role)
    }

    pub fn get(&self, path: &str, user: &User) -> RequestBuilder {
        self.as_user(self.client.get(format!("{}{}", self.address, path)), user)
    }

    pub fn post(&self, path: &str, user: &User) -> RequestBuilder {
        self.as_user(self.client.post(format!("{}{}", self.address, path)), user)
    }

    pub fn put(&self, path: &str, user: &User) -> RequestBuilder {
        self.as_user(self.client.put(format!("{}{}", self.address, path)), user)
    }

    pub async fn create_booking(&self, customer: &User, service_id: Uuid) -> Response {
        self.post("/bookings", customer)
            .json(&json!({
                "service_id": service_id,
                "date": tomorrow(),
                "scheduled_time": { "start_time": "09:00", "end_time": "10:30" },
                "notes": "Ring the bell twice"
            }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Create a booking and return its id, panicking on failure.
    pub async fn booking_id(&self, customer: &User, service_id: Uuid) -> Uuid {
        let response = self.create_booking(customer, service_id).await;
        assert_eq!(response.status().as_u16(), 201);
        let body: Value = response.json().await.expect("Failed to parse JSON");
        body["id"].as_str().and_then(|s| s.parse().ok()).expect("booking id")
    }

    pub async fn set_status(&self, user: &User, booking_id: Uuid, status: &str) -> Response {
        self.put(&format!("/bookings/{}/status", booking_id), user)
            .json(&json!({ "status": status }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn create_intent(&self, customer: &User, booking_id: Uuid) -> Response {
        self.post("/payments/intents", customer)
            .json(&json!({ "booking_id": booking_id, "payment_method": "credit_card" }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Create an intent and return its body, panicking on failure.
    pub async fn intent(&self, customer: &User, booking_id: Uuid) -> Value {
        let response = self.create_intent(customer, booking_id).await;
        assert_eq!(response.status().as_u16(), 201);
        response.json().await.expect("Failed to parse JSON")
    }

    pub async fn confirm(&self, customer: &User, booking_id: Uuid, intent_id: &str) -> Response {
        self.post("/payments/confirm", customer)
            .json(&json!({ "booking_id": booking_id, "intent_id": intent_id }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Drive a booking to `confirmed` through a captured payment. Returns
    /// the paid transaction id.
    pub async fn pay(&self, customer: &User, booking_id: Uuid) -> Uuid {
        let intent = self.intent(customer, booking_id).await;
        let intent_id = intent["intent_id"].as_str().expect("intent id");
        assert!(self.gateway.capture(intent_id));
        let response = self.confirm(customer, booking_id, intent_id).await;
        assert_eq!(response.status().as_u16(), 200);
        intent["transaction_id"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .expect("transaction id")
    }

    pub async fn get_booking(&self, user: &User, booking_id: Uuid) -> Value {
        self.get(&format!("/bookings/{}", booking_id), user)
            .send()
            .await
            .expect("Failed to execute request")
            .json()
            .await
            .expect("Failed to parse JSON")
    }

    pub async fn get_transaction(&self, user: &User, transaction_id: Uuid) -> Value {
        self.get(&format!("/transactions/{}", transaction_id), user)
            .send()
            .await
            .expect("Failed to execute request")
            .json()
            .await
            .expect("Failed to parse JSON")
    }

    pub async fn post_webhook(&self, body: &str, signature: Option<String>) -> Response {
        let mut request = self
            .client
            .post(format!("{}/webhooks/gateway", self.address))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(signature) = signature {
            request = request.header("stripe-signature", signature);
        }
        request.send().await.expect("Failed to execute request")
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub fn tomorrow() -> String {
    Utc::now()
        .date_naive()
        .checked_add_days(Days::new(1))
        .expect("valid date")
        .format("%Y-%m-%d")
        .to_string()
}

/// A valid signature header for `body` under the test webhook secret.
pub fn sign_webhook(body: &str) -> String {
    let timestamp = Utc::now().timestamp();
    let signature = booking_service::services::webhook::compute_signature(
        WEBHOOK_SECRET,
        timestamp,
        body.as_bytes(),
    )
    .expect("signature");
    format!("t={},v1={}", timestamp, signature)
}

/// Delegates to an in-memory store but can be told to fail the next N
/// booking updates, transaction updates or rating saves, to simulate a
/// crash between steps.
pub struct FaultyRepository {
    inner: Arc<InMemoryRepository>,
    failing_booking_updates: AtomicUsize,
    failing_rating_saves: AtomicUsize,
    failing_transaction_updates: AtomicUsize,
}

impl FaultyRepository {
    pub fn new(inner: Arc<InMemoryRepository>) -> Self {
        Self {
            inner,
            failing_booking_updates: AtomicUsize::new(0),
            failing_rating_saves: AtomicUsize::new(0),
            failing_transaction_updates: AtomicUsize::new(0),
        }
    }

    pub fn fail_booking_updates(&self, n: usize) {
        self.failing_booking_updates.store(n, Ordering::SeqCst);
    }

    pub fn fail_rating_saves(&self, n: usize) {
        self.failing_rating_saves.store(n, Ordering::SeqCst);
    }

    pub fn fail_transaction_updates(&self, n: usize) {
        self.failing_transaction_updates.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn injected() -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("injected storage failure"))
}

#[async_trait]
impl Repository for FaultyRepository {
    async fn ping(&self) -> Result<(), AppError> {
        self.inner.ping().await
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError> {
        self.inner.insert_booking(booking).await
    }

    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, AppError> {
        self.inner.get_booking(id).await
    }

    async fn list_bookings(&self, scope: BookingScope) -> Result<Vec<Booking>, AppError> {
        self.inner.list_bookings(scope).await
    }

    async fn update_booking(&self, booking: &mut Booking) -> Result<(), AppError> {
        if Self::take(&self.failing_booking_updates) {
            return Err(injected());
        }
        self.inner.update_booking(booking).await
    }

    async fn bookings_with_pending_rating(&self, limit: usize) -> Result<Vec<Booking>, AppError> {
        self.inner.bookings_with_pending_rating(limit).await
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<(), AppError> {
        self.inner.insert_transaction(tx).await
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, AppError> {
        self.inner.get_transaction(id).await
    }

    async fn find_transaction_by_intent(
        &self,
        intent_id: &str,
    ) -> Result<Option<Transaction>, AppError> {
        self.inner.find_transaction_by_intent(intent_id).await
    }

    async fn list_transactions_for_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        self.inner.list_transactions_for_booking(booking_id).await
    }

    async fn update_transaction(&self, tx: &mut Transaction) -> Result<(), AppError> {
        if Self::take(&self.failing_transaction_updates) {
            return Err(injected());
        }
        self.inner.update_transaction(tx).await
    }

    async fn stale_pending_transactions(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError> {
        self.inner.stale_pending_transactions(older_than, limit).await
    }

    async fn transactions_awaiting_booking_sync(
        &self,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError> {
        self.inner.transactions_awaiting_booking_sync(limit).await
    }

    async fn transactions_with_requested_refunds(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, AppError> {
        self.inner
            .transactions_with_requested_refunds(older_than, limit)
            .await
    }

    async fn get_provider_rating(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<ProviderRating>, AppError> {
        self.inner.get_provider_rating(provider_id).await
    }

    async fn save_provider_rating(&self, rating: &mut ProviderRating) -> Result<(), AppError> {
        if Self::take(&self.failing_rating_saves) {
            return Err(injected());
        }
        self.inner.save_provider_rating(rating).await
    }
}

/// Read a decimal serialized as a JSON string.
pub fn decimal(value: &Value) -> Decimal {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("not a decimal: {}", value))
}
