// Private module declaration
mod server;

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the messaging pipeline
// ============================================================================
//
// - Outbox: items stored, items dispatched, dispatch runs by outcome,
//   consecutive failed runs (a stuck head item keeps this climbing)
// - Bus sender: batches and messages published
// - Bus receiver: settlements by outcome, dead letters by type, session faults
// - Circuit breaker state per named breaker
//
// All metrics are registered with one Registry and scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Outbox
    pub outbox_items_stored: IntCounter,
    pub outbox_items_dispatched: IntCounter,
    pub dispatch_runs: IntCounterVec,
    pub dispatch_duration: Histogram,
    pub dispatch_consecutive_failures: IntGauge,

    // Sender
    pub batches_published: IntCounter,
    pub messages_published: IntCounter,

    // Receiver
    pub messages_received: IntCounterVec,
    pub dead_letters: IntCounterVec,
    pub session_faults: IntCounter,
    pub active_sessions: IntGauge,

    // Circuit Breaker
    pub circuit_breaker_state: IntGaugeVec,
    pub circuit_breaker_transitions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let outbox_items_stored = IntCounter::new("outbox_items_stored_total", "Outbox items committed by producers")?;
        registry.register(Box::new(outbox_items_stored.clone()))?;

        let outbox_items_dispatched = IntCounter::new(
            "outbox_items_dispatched_total",
            "Outbox items handed to the bus and removed from the outbox",
        )?;
        registry.register(Box::new(outbox_items_dispatched.clone()))?;

        let dispatch_runs = IntCounterVec::new(
            Opts::new("outbox_dispatch_runs_total", "Dispatcher runs by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(dispatch_runs.clone()))?;

        let dispatch_duration = Histogram::with_opts(
            HistogramOpts::new("outbox_dispatch_duration_seconds", "Dispatcher run duration")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        let dispatch_consecutive_failures = IntGauge::new(
            "outbox_dispatch_consecutive_failures",
            "Failed dispatcher runs since the last successful one",
        )?;
        registry.register(Box::new(dispatch_consecutive_failures.clone()))?;

        let batches_published = IntCounter::new("bus_batches_published_total", "Batches published to the broker")?;
        registry.register(Box::new(batches_published.clone()))?;

        let messages_published = IntCounter::new("bus_messages_published_total", "Messages published to the broker")?;
        registry.register(Box::new(messages_published.clone()))?;

        let messages_received = IntCounterVec::new(
            Opts::new("bus_messages_received_total", "Received messages by settlement outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let dead_letters = IntCounterVec::new(
            Opts::new("bus_dead_letters_total", "Dead-lettered messages by message type"),
            &["message_type"],
        )?;
        registry.register(Box::new(dead_letters.clone()))?;

        let session_faults = IntCounter::new("bus_session_faults_total", "Sessions moved to the faulted state")?;
        registry.register(Box::new(session_faults.clone()))?;

        let active_sessions = IntGauge::new("bus_active_sessions", "Sessions currently locked by this receiver")?;
        registry.register(Box::new(active_sessions.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new("circuit_breaker_state", "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)"),
            &["breaker"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["breaker", "from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        Ok(Self {
            registry,
            outbox_items_stored,
            outbox_items_dispatched,
            dispatch_runs,
            dispatch_duration,
            dispatch_consecutive_failures,
            batches_published,
            messages_published,
            messages_received,
            dead_letters,
            session_faults,
            active_sessions,
            circuit_breaker_state,
            circuit_breaker_transitions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_stored(&self, count: usize) {
        self.outbox_items_stored.inc_by(count as u64);
    }

    pub fn record_dispatch(&self, outcome: &str, dispatched: usize, duration_secs: f64) {
        self.dispatch_runs.with_label_values(&[outcome]).inc();
        self.outbox_items_dispatched.inc_by(dispatched as u64);
        self.dispatch_duration.observe(duration_secs);
    }

    pub fn record_batch_published(&self, messages: usize) {
        self.batches_published.inc();
        self.messages_published.inc_by(messages as u64);
    }

    pub fn record_received(&self, outcome: &str) {
        self.messages_received.with_label_values(&[outcome]).inc();
    }

    pub fn record_dead_letter(&self, message_type: &str) {
        self.dead_letters.with_label_values(&[message_type]).inc();
    }

    pub fn record_session_fault(&self) {
        self.session_faults.inc();
    }

    pub fn update_circuit_breaker_state(&self, breaker: &str, state: u8) {
        self.circuit_breaker_state.with_label_values(&[breaker]).set(state as i64);
    }

    pub fn record_circuit_breaker_transition(&self, breaker: &str, from_state: &str, to_state: &str) {
        self.circuit_breaker_transitions
            .with_label_values(&[breaker, from_state, to_state])
            .inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
