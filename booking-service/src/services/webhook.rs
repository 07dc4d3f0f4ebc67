//! Gateway webhook signature verification and event parsing.
//!
//! The signature header has the form `t=<unix ts>,v1=<hex hmac>` where the
//! HMAC-SHA256 is computed over `"<ts>.<raw body>"` with the webhook secret.

use anyhow::{anyhow, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use super::gateway::GatewayOutcome;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Signatures older than this are rejected as replays.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub object: Value,
}

/// What a webhook asks the ledger to do.
#[derive(Debug, PartialEq)]
pub enum WebhookAction {
    Record {
        intent_id: String,
        outcome: GatewayOutcome,
    },
    Ignore,
}

pub fn compute_signature(secret: &str, timestamp: i64, body: &[u8]) -> Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| anyhow!("Invalid key length"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify `header` against `body`. Returns `Ok(false)` for a well-formed but
/// wrong or expired signature and `Err` for a malformed header.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    tolerance_secs: i64,
) -> Result<bool> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or_else(|| anyhow!("signature header missing timestamp"))?;
    if candidates.is_empty() {
        return Err(anyhow!("signature header missing v1 signature"));
    }

    if (Utc::now().timestamp() - timestamp).abs() > tolerance_secs {
        tracing::warn!(timestamp, "Webhook signature outside tolerance window");
        return Ok(false);
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| anyhow!("Invalid key length"))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(true);
        }
    }

    tracing::warn!("Webhook signature verification failed");
    Ok(false)
}

pub fn parse_event(body: &[u8]) -> Result<WebhookEvent> {
    Ok(serde_json::from_slice(body)?)
}

fn decline_reason(object: &Value) -> Option<&str> {
    object
        .pointer("/last_payment_error/code")
        .or_else(|| object.pointer("/last_payment_error/message"))
        .and_then(Value::as_str)
}

impl WebhookEvent {
    pub fn action(&self) -> WebhookAction {
        let object = &self.data.object;
        let Some(intent_id) = object.get("id").and_then(Value::as_str) else {
            return WebhookAction::Ignore;
        };

        let outcome = match self.event_type.as_str() {
            "payment_intent.succeeded" => GatewayOutcome::Succeeded {
                gateway_transaction_id: object
                    .get("latest_charge")
                    .and_then(Value::as_str)
                    .unwrap_or(intent_id)
                    .to_string(),
                raw: object.clone(),
            },
            "payment_intent.payment_failed" => GatewayOutcome::Declined {
                reason: decline_reason(object).unwrap_or("payment_failed").to_string(),
                raw: object.clone(),
            },
            "payment_intent.canceled" => GatewayOutcome::Failed {
                reason: decline_reason(object)
                    .or_else(|| object.get("cancellation_reason").and_then(Value::as_str))
                    .unwrap_or("canceled")
                    .to_string(),
                raw: object.clone(),
            },
            _ => return WebhookAction::Ignore,
        };

        WebhookAction::Record {
            intent_id: intent_id.to_string(),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    fn signed_header(body: &[u8], timestamp: i64) -> String {
        format!(
            "t={},v1={}",
            timestamp,
            compute_signature(SECRET, timestamp, body).unwrap()
        )
    }

    #[test]
    fn accepts_a_fresh_valid_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = signed_header(body, Utc::now().timestamp());
        assert!(verify_signature(SECRET, &header, body, DEFAULT_TOLERANCE_SECS).unwrap());
    }

    #[test]
    fn rejects_tampered_body_and_old_timestamps() {
        let body = br#"{"id":"evt_1"}"#;
        let now = Utc::now().timestamp();
        let header = signed_header(body, now);
        assert!(!verify_signature(SECRET, &header, b"{}", DEFAULT_TOLERANCE_SECS).unwrap());

        let stale = signed_header(body, now - 3600);
        assert!(!verify_signature(SECRET, &stale, body, DEFAULT_TOLERANCE_SECS).unwrap());
    }

    #[test]
    fn malformed_header_is_an_error() {
        assert!(verify_signature(SECRET, "v1=abc", b"{}", DEFAULT_TOLERANCE_SECS).is_err());
        assert!(verify_signature(SECRET, "t=123", b"{}", DEFAULT_TOLERANCE_SECS).is_err());
    }

    #[test]
    fn maps_intent_events_to_outcomes() {
        let body = json!({
            "id": "evt_2",
            "type": "payment_intent.payment_failed",
            "data": { "object": { "id": "pi_7", "last_payment_error": { "code": "card_declined" } } }
        });
        let event = parse_event(body.to_string().as_bytes()).unwrap();
        match event.action() {
            WebhookAction::Record { intent_id, outcome } => {
                assert_eq!(intent_id, "pi_7");
                assert!(matches!(outcome, GatewayOutcome::Declined { ref reason, .. } if reason == "card_declined"));
            }
            WebhookAction::Ignore => panic!("expected a recorded outcome"),
        }

        let canceled = json!({
            "id": "evt_4",
            "type": "payment_intent.canceled",
            "data": { "object": { "id": "pi_8", "cancellation_reason": "abandoned" } }
        });
        let event = parse_event(canceled.to_string().as_bytes()).unwrap();
        assert!(matches!(
            event.action(),
            WebhookAction::Record { outcome: GatewayOutcome::Failed { ref reason, .. }, .. } if reason == "abandoned"
        ));

        let other = json!({ "id": "evt_3", "type": "charge.updated", "data": { "object": { "id": "ch_1" } } });
        let event = parse_event(other.to_string().as_bytes()).unwrap();
        assert_eq!(event.action(), WebhookAction::Ignore);
    }
}
