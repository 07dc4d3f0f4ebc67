//! Stripe-compatible HTTP gateway client.
//!
//! Uses the PaymentIntents and Refunds APIs with form-encoded bodies and
//! bearer authentication. Every mutating call carries an `Idempotency-Key`
//! so a retry after a timeout cannot double-charge or double-refund.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::Value;
use service_core::observability::outbound_headers;

use super::gateway::{
    GatewayFailure, GatewayOutcome, GatewayRefund, IntentRequest, PaymentGateway, PaymentIntent,
    RefundRequest,
};

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    api_base_url: String,
    secret_key: Secret<String>,
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    status: String,
    client_secret: Option<String>,
    latest_charge: Option<String>,
    last_payment_error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

impl ApiErrorDetail {
    fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (Some(code), None) => code.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

impl StripeGateway {
    pub fn new(api_base_url: impl Into<String>, secret_key: Secret<String>) -> Self {
        Self {
            client: Client::new(),
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            secret_key,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_base_url.is_empty() && !self.secret_key.expose_secret().is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(self.secret_key.expose_secret())
            .headers(outbound_headers(None))
    }

    async fn send(&self, op: &'static str, request: RequestBuilder) -> Result<Value, GatewayFailure> {
        if !self.is_configured() {
            return Err(GatewayFailure::NotConfigured(
                "gateway secret key or base url missing".to_string(),
            ));
        }

        let response = request.send().await.map_err(transport_failure)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_failure)?;

        tracing::debug!(op, status = %status, "Gateway response");

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| {
                GatewayFailure::Transport(format!("unreadable gateway response: {}", e))
            });
        }

        let detail = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.error.describe())
            .unwrap_or_else(|_| body.clone());

        // 5xx and 429 leave the outcome unknown; any other 4xx is definitive.
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(op, status = %status, detail = %detail, "Gateway unavailable");
            Err(GatewayFailure::Transport(format!("{} ({})", detail, status)))
        } else {
            tracing::error!(op, status = %status, detail = %detail, "Gateway rejected request");
            Err(GatewayFailure::Rejected(detail))
        }
    }
}

fn transport_failure(err: reqwest::Error) -> GatewayFailure {
    GatewayFailure::Transport(err.to_string())
}

fn parse<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, GatewayFailure> {
    serde_json::from_value(value)
        .map_err(|e| GatewayFailure::Transport(format!("unexpected gateway payload: {}", e)))
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    #[tracing::instrument(skip(self, request), fields(transaction_id = %request.transaction_id))]
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayFailure> {
        let form = [
            ("amount", request.amount.to_string()),
            ("currency", request.currency.clone()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("metadata[booking_id]", request.booking_id.to_string()),
            ("metadata[transaction_id]", request.transaction_id.to_string()),
        ];
        let builder = self
            .authorized(self.client.post(self.url("/v1/payment_intents")))
            .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key())
            .form(&form);

        let intent: IntentResponse = parse(self.send("create_intent", builder).await?)?;
        let client_secret = intent.client_secret.ok_or_else(|| {
            GatewayFailure::Transport("payment intent returned without client secret".to_string())
        })?;

        tracing::info!(intent_id = %intent.id, "Payment intent created");
        Ok(PaymentIntent {
            intent_id: intent.id,
            client_secret,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn confirm(&self, intent_id: &str) -> Result<GatewayOutcome, GatewayFailure> {
        let builder = self.authorized(
            self.client
                .get(self.url(&format!("/v1/payment_intents/{}", intent_id))),
        );
        let raw = self.send("confirm", builder).await?;
        let intent: IntentResponse = parse(raw.clone())?;
        Ok(outcome_from_intent(intent, raw))
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_intent(&self, intent_id: &str) -> Result<GatewayOutcome, GatewayFailure> {
        let builder = self
            .authorized(
                self.client
                    .post(self.url(&format!("/v1/payment_intents/{}/cancel", intent_id))),
            )
            .form(&[("cancellation_reason", "abandoned")]);
        let raw = self.send("cancel_intent", builder).await?;
        let intent: IntentResponse = parse(raw.clone())?;

        tracing::info!(intent_id = %intent.id, status = %intent.status, "Payment intent cancelled");
        Ok(outcome_from_intent(intent, raw))
    }

    #[tracing::instrument(skip(self, request), fields(refund_id = %request.refund_id))]
    async fn refund(&self, request: &RefundRequest) -> Result<GatewayRefund, GatewayFailure> {
        let form = [
            ("payment_intent", request.intent_id.clone()),
            ("amount", request.amount.to_string()),
            ("metadata[reason]", request.reason.clone()),
            ("metadata[refund_id]", request.refund_id.to_string()),
        ];
        let builder = self
            .authorized(self.client.post(self.url("/v1/refunds")))
            .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key())
            .form(&form);

        let refund: RefundResponse = parse(self.send("refund", builder).await?)?;
        if refund.status.as_deref() == Some("failed") {
            return Err(GatewayFailure::Rejected(format!(
                "refund {} failed at the gateway",
                refund.id
            )));
        }
        Ok(GatewayRefund {
            gateway_refund_id: refund.id,
        })
    }
}

fn outcome_from_intent(intent: IntentResponse, raw: Value) -> GatewayOutcome {
    match intent.status.as_str() {
        "succeeded" => GatewayOutcome::Succeeded {
            gateway_transaction_id: intent.latest_charge.unwrap_or(intent.id),
            raw,
        },
        "canceled" => GatewayOutcome::Failed {
            reason: intent
                .last_payment_error
                .map(|e| e.describe())
                .unwrap_or_else(|| "payment intent canceled".to_string()),
            raw,
        },
        // The intent stays confirmable with the same client secret.
        "requires_payment_method" if intent.last_payment_error.is_some() => {
            GatewayOutcome::Declined {
                reason: intent
                    .last_payment_error
                    .map(|e| e.describe())
                    .unwrap_or_default(),
                raw,
            }
        }
        _ => GatewayOutcome::Processing,
    }
}
