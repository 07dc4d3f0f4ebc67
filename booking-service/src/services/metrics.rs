use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();
static DOMAIN_METRICS: OnceLock<Option<DomainMetrics>> = OnceLock::new();

struct DomainMetrics {
    registry: Registry,
    booking_transitions: IntCounterVec,
    payment_outcomes: IntCounterVec,
    refunds: IntCounterVec,
    rating_updates: IntCounterVec,
}

fn counter(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
}

impl DomainMetrics {
    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let booking_transitions = counter(
            "booking_transitions_total",
            "Booking status transitions by target status and actor",
            &["to", "actor"],
        )?;
        let payment_outcomes = counter(
            "booking_payment_outcomes_total",
            "Gateway payment outcomes recorded on the ledger",
            &["outcome"],
        )?;
        let refunds = counter(
            "booking_refunds_total",
            "Refund attempts by result",
            &["result"],
        )?;
        let rating_updates = counter(
            "booking_rating_updates_total",
            "Provider rating aggregation attempts by result",
            &["result"],
        )?;

        registry.register(Box::new(booking_transitions.clone()))?;
        registry.register(Box::new(payment_outcomes.clone()))?;
        registry.register(Box::new(refunds.clone()))?;
        registry.register(Box::new(rating_updates.clone()))?;

        Ok(Self {
            registry,
            booking_transitions,
            payment_outcomes,
            refunds,
            rating_updates,
        })
    }
}

/// Install the HTTP metrics recorder and the domain counters. Safe to call
/// more than once; later calls are no-ops.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    });
    DOMAIN_METRICS.get_or_init(|| match DomainMetrics::build() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            tracing::warn!(error = %e, "Domain metrics not registered");
            None
        }
    });
}

fn domain() -> Option<&'static DomainMetrics> {
    DOMAIN_METRICS.get().and_then(Option::as_ref)
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .and_then(Option::as_ref)
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(metrics) = domain() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metrics.registry.gather(), &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_transition(to: &str, actor: &str) {
    if let Some(m) = domain() {
        m.booking_transitions.with_label_values(&[to, actor]).inc();
    }
}

pub fn record_payment_outcome(outcome: &str) {
    if let Some(m) = domain() {
        m.payment_outcomes.with_label_values(&[outcome]).inc();
    }
}

pub fn record_refund(result: &str) {
    if let Some(m) = domain() {
        m.refunds.with_label_values(&[result]).inc();
    }
}

pub fn record_rating_update(result: &str) {
    if let Some(m) = domain() {
        m.rating_updates.with_label_values(&[result]).inc();
    }
}
