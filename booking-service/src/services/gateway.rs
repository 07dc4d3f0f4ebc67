//! Payment gateway port.
//!
//! Adapters report transport problems and timeouts separately from
//! definitive rejections: only a rejection says anything about the outcome.

use async_trait::async_trait;
use serde_json::Value;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IntentRequest {
    /// Minor currency units.
    pub amount: u64,
    pub currency: String,
    pub booking_id: Uuid,
    pub transaction_id: Uuid,
}

impl IntentRequest {
    /// One transaction never creates two intents, even if the call is retried.
    pub fn idempotency_key(&self) -> String {
        format!("intent-{}", self.transaction_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub client_secret: String,
}

/// Authoritative state of an intent as reported by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOutcome {
    Succeeded {
        gateway_transaction_id: String,
        raw: Value,
    },
    /// The last charge was declined but the intent is still open: the
    /// customer can retry it with another payment method.
    Declined {
        reason: String,
        raw: Value,
    },
    /// The intent is closed and can never be charged.
    Failed {
        reason: String,
        raw: Value,
    },
    /// Customer action or capture still outstanding.
    Processing,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub intent_id: String,
    pub amount: u64,
    pub reason: String,
    pub refund_id: Uuid,
}

impl RefundRequest {
    pub fn idempotency_key(&self) -> String {
        format!("refund-{}", self.refund_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRefund {
    pub gateway_refund_id: String,
}

#[derive(Debug, Error)]
pub enum GatewayFailure {
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    #[error("gateway not configured: {0}")]
    NotConfigured(String),
}

impl GatewayFailure {
    /// The request may or may not have taken effect on the gateway side.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

impl From<GatewayFailure> for AppError {
    fn from(err: GatewayFailure) -> Self {
        AppError::GatewayError(anyhow::Error::new(err))
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayFailure>;

    /// Look up the current state of an intent.
    async fn confirm(&self, intent_id: &str) -> Result<GatewayOutcome, GatewayFailure>;

    /// Close an intent so nothing can be charged against it. Returns the
    /// intent's resulting state. Cancelling an intent that already
    /// succeeded is a rejection.
    async fn cancel_intent(&self, intent_id: &str) -> Result<GatewayOutcome, GatewayFailure>;

    async fn refund(&self, request: &RefundRequest) -> Result<GatewayRefund, GatewayFailure>;
}

/// Puts a hard deadline on every call to the wrapped gateway.
pub struct BoundedGateway {
    inner: Arc<dyn PaymentGateway>,
    timeout: Duration,
}

impl BoundedGateway {
    pub fn new(inner: Arc<dyn PaymentGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, GatewayFailure>
    where
        F: std::future::Future<Output = Result<T, GatewayFailure>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    gateway = self.inner.name(),
                    op,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Gateway call timed out"
                );
                Err(GatewayFailure::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for BoundedGateway {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayFailure> {
        self.bounded("create_intent", self.inner.create_intent(request))
            .await
    }

    async fn confirm(&self, intent_id: &str) -> Result<GatewayOutcome, GatewayFailure> {
        self.bounded("confirm", self.inner.confirm(intent_id)).await
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<GatewayOutcome, GatewayFailure> {
        self.bounded("cancel_intent", self.inner.cancel_intent(intent_id))
            .await
    }

    async fn refund(&self, request: &RefundRequest) -> Result<GatewayRefund, GatewayFailure> {
        self.bounded("refund", self.inner.refund(request)).await
    }
}
