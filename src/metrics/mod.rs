// Private module declaration
mod server;

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for fulfillment
// ============================================================================
//
// - Order transitions and rejections
// - Claim outcomes
// - Ready-timeout timers and auto-completions
// - Event fan-out (published / dropped) and external sink delivery
// - Retry attempts and circuit breaker state for the sink transport
//
// Scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Lifecycle
    pub order_transitions: IntCounterVec,
    pub order_rejections: IntCounterVec,
    pub claim_attempts: IntCounterVec,

    // Ready-timeout scheduler
    pub ready_timers_armed: IntGauge,
    pub auto_completions: IntCounterVec,

    // Event delivery
    pub events_published: IntCounterVec,
    pub events_dropped: IntCounterVec,
    pub sink_deliveries: IntCounterVec,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,
    pub retry_outcomes: IntCounterVec,

    // Circuit Breaker Metrics
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let order_transitions = IntCounterVec::new(
            Opts::new("order_transitions_total", "Accepted order status transitions"),
            &["from", "to"],
        )?;
        registry.register(Box::new(order_transitions.clone()))?;

        let order_rejections = IntCounterVec::new(
            Opts::new("order_rejections_total", "Rejected coordinator operations"),
            &["operation", "reason"],
        )?;
        registry.register(Box::new(order_rejections.clone()))?;

        let claim_attempts = IntCounterVec::new(
            Opts::new("claim_attempts_total", "Claim attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(claim_attempts.clone()))?;

        let ready_timers_armed = IntGauge::new(
            "ready_timers_armed",
            "Orders in ready with an armed auto-complete timer",
        )?;
        registry.register(Box::new(ready_timers_armed.clone()))?;

        let auto_completions = IntCounterVec::new(
            Opts::new("auto_completions_total", "Ready-timeout firings by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(auto_completions.clone()))?;

        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Order events fanned out"),
            &["kind"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let events_dropped = IntCounterVec::new(
            Opts::new("events_dropped_total", "Order event pushes that were dropped"),
            &["reason"],
        )?;
        registry.register(Box::new(events_dropped.clone()))?;

        let sink_deliveries = IntCounterVec::new(
            Opts::new("sink_deliveries_total", "Deliveries to external event sinks"),
            &["sink", "outcome"],
        )?;
        registry.register(Box::new(sink_deliveries.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation", "attempt"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_outcomes = IntCounterVec::new(
            Opts::new("retry_outcomes_total", "Retried operations by final outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(retry_outcomes.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        Ok(Self {
            registry,
            order_transitions,
            order_rejections,
            claim_attempts,
            ready_timers_armed,
            auto_completions,
            events_published,
            events_dropped,
            sink_deliveries,
            retry_attempts_total,
            retry_outcomes,
            circuit_breaker_state,
            circuit_breaker_transitions,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        self.order_transitions.with_label_values(&[from, to]).inc();
    }

    pub fn record_rejection(&self, operation: &str, reason: &str) {
        self.order_rejections.with_label_values(&[operation, reason]).inc();
    }

    pub fn record_claim(&self, outcome: &str) {
        self.claim_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn set_armed_timers(&self, count: usize) {
        self.ready_timers_armed.set(count as i64);
    }

    pub fn record_auto_completion(&self, outcome: &str) {
        self.auto_completions.with_label_values(&[outcome]).inc();
    }

    pub fn record_event_published(&self, kind: &str) {
        self.events_published.with_label_values(&[kind]).inc();
    }

    pub fn record_event_dropped(&self, reason: &str) {
        self.events_dropped.with_label_values(&[reason]).inc();
    }

    pub fn record_sink_delivery(&self, sink: &str, success: bool) {
        let outcome = if success { "delivered" } else { "failed" };
        self.sink_deliveries.with_label_values(&[sink, outcome]).inc();
    }

    pub fn record_retry_attempt(&self, operation: &str, attempt: u32) {
        self.retry_attempts_total.with_label_values(&[operation, &attempt.to_string()]).inc();
    }

    pub fn record_retry_outcome(&self, operation: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.retry_outcomes.with_label_values(&[operation, outcome]).inc();
    }

    pub fn update_circuit_breaker_state(&self, state: u8) {
        self.circuit_breaker_state.set(state as i64);
    }

    pub fn record_circuit_breaker_transition(&self, from_state: &str, to_state: &str) {
        self.circuit_breaker_transitions.with_label_values(&[from_state, to_state]).inc();
    }
}
