//! In-process gateway for local runs and tests. Intents are created in a
//! processing state and settled by [`SandboxGateway::capture`] or
//! [`SandboxGateway::decline`], standing in for the customer's checkout.
//! A declined intent stays open and can still be captured until it is
//! cancelled.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::gateway::{
    GatewayFailure, GatewayOutcome, GatewayRefund, IntentRequest, PaymentGateway, PaymentIntent,
    RefundRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentState {
    Processing,
    Succeeded,
    Declined,
    Canceled,
}

#[derive(Debug, Clone)]
struct SandboxIntent {
    amount: u64,
    refunded: u64,
    state: IntentState,
    decline_reason: Option<String>,
}

#[derive(Debug, Default)]
pub struct SandboxGateway {
    intents: DashMap<String, SandboxIntent>,
    /// idempotency key -> intent id
    intent_keys: DashMap<String, String>,
    /// idempotency key -> gateway refund id
    refunds: DashMap<String, String>,
    delay_ms: AtomicU64,
    unavailable: AtomicBool,
    auto_capture: AtomicBool,
    reject_refunds: AtomicBool,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intents succeed as soon as they are created.
    pub fn with_auto_capture(self) -> Self {
        self.auto_capture.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every call fails with a transport error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_reject_refunds(&self, reject: bool) {
        self.reject_refunds.store(reject, Ordering::SeqCst);
    }

    pub fn capture(&self, intent_id: &str) -> bool {
        self.settle(intent_id, IntentState::Succeeded, None)
    }

    pub fn decline(&self, intent_id: &str, reason: &str) -> bool {
        self.settle(intent_id, IntentState::Declined, Some(reason.to_string()))
    }

    /// Refunds accepted so far, counting idempotent replays once.
    pub fn refund_count(&self) -> usize {
        self.refunds.len()
    }

    fn settle(&self, intent_id: &str, state: IntentState, reason: Option<String>) -> bool {
        match self.intents.get_mut(intent_id) {
            Some(mut intent)
                if matches!(intent.state, IntentState::Processing | IntentState::Declined) =>
            {
                intent.state = state;
                intent.decline_reason = reason;
                true
            }
            _ => false,
        }
    }

    async fn before_call(&self) -> Result<(), GatewayFailure> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayFailure::Transport(
                "sandbox gateway unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayFailure> {
        self.before_call().await?;
        if request.amount == 0 {
            return Err(GatewayFailure::Rejected(
                "amount must be positive".to_string(),
            ));
        }

        let intent_id = self
            .intent_keys
            .entry(request.idempotency_key())
            .or_insert_with(|| {
                let id = format!("pi_sandbox_{}", uuid::Uuid::new_v4().simple());
                let state = if self.auto_capture.load(Ordering::SeqCst) {
                    IntentState::Succeeded
                } else {
                    IntentState::Processing
                };
                self.intents.insert(
                    id.clone(),
                    SandboxIntent {
                        amount: request.amount,
                        refunded: 0,
                        state,
                        decline_reason: None,
                    },
                );
                id
            })
            .clone();

        Ok(PaymentIntent {
            client_secret: format!("{}_secret", intent_id),
            intent_id,
        })
    }

    async fn confirm(&self, intent_id: &str) -> Result<GatewayOutcome, GatewayFailure> {
        self.before_call().await?;
        let intent = self
            .intents
            .get(intent_id)
            .map(|i| i.value().clone())
            .ok_or_else(|| GatewayFailure::Rejected(format!("no such intent: {}", intent_id)))?;

        Ok(match intent.state {
            IntentState::Processing => GatewayOutcome::Processing,
            IntentState::Succeeded => GatewayOutcome::Succeeded {
                gateway_transaction_id: format!("ch_{}", intent_id),
                raw: json!({ "id": intent_id, "status": "succeeded", "amount": intent.amount }),
            },
            IntentState::Declined => {
                let reason = intent
                    .decline_reason
                    .unwrap_or_else(|| "card_declined".to_string());
                GatewayOutcome::Declined {
                    raw: json!({
                        "id": intent_id,
                        "status": "requires_payment_method",
                        "reason": reason
                    }),
                    reason,
                }
            }
            IntentState::Canceled => canceled_outcome(intent_id, intent.decline_reason),
        })
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<GatewayOutcome, GatewayFailure> {
        self.before_call().await?;
        let mut intent = self
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| GatewayFailure::Rejected(format!("no such intent: {}", intent_id)))?;
        if intent.state == IntentState::Succeeded {
            return Err(GatewayFailure::Rejected(
                "payment intent already succeeded".to_string(),
            ));
        }
        intent.state = IntentState::Canceled;
        Ok(canceled_outcome(intent_id, intent.decline_reason.clone()))
    }

    async fn refund(&self, request: &RefundRequest) -> Result<GatewayRefund, GatewayFailure> {
        self.before_call().await?;
        let key = request.idempotency_key();
        if let Some(existing) = self.refunds.get(&key) {
            return Ok(GatewayRefund {
                gateway_refund_id: existing.value().clone(),
            });
        }
        if self.reject_refunds.load(Ordering::SeqCst) {
            return Err(GatewayFailure::Rejected("refund declined".to_string()));
        }

        let mut intent = self
            .intents
            .get_mut(&request.intent_id)
            .ok_or_else(|| {
                GatewayFailure::Rejected(format!("no such intent: {}", request.intent_id))
            })?;
        if intent.state != IntentState::Succeeded {
            return Err(GatewayFailure::Rejected(
                "intent has no captured charge".to_string(),
            ));
        }
        if intent.refunded + request.amount > intent.amount {
            return Err(GatewayFailure::Rejected(
                "refund exceeds captured amount".to_string(),
            ));
        }
        intent.refunded += request.amount;
        drop(intent);

        let gateway_refund_id = format!("re_sandbox_{}", request.refund_id.simple());
        self.refunds.insert(key, gateway_refund_id.clone());
        Ok(GatewayRefund { gateway_refund_id })
    }
}

fn canceled_outcome(intent_id: &str, decline_reason: Option<String>) -> GatewayOutcome {
    let reason = decline_reason.unwrap_or_else(|| "canceled".to_string());
    GatewayOutcome::Failed {
        raw: json!({ "id": intent_id, "status": "canceled", "reason": reason }),
        reason,
    }
}
