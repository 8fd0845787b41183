use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, register_histogram_with_registry,
    Counter, Gauge, Histogram, Registry,
};
use std::sync::Arc;
use tracing::warn;

pub struct RelayMetrics {
    pub active_mailboxes: Gauge,
    pub pending_signals: Gauge,
    pub signals_posted: Counter,
    pub signals_delivered: Counter,
    pub signals_deleted: Counter,
    pub signals_evicted: Counter,
    pub request_latency: Histogram,
    pub error_counts: Counter,
    pub registry: Arc<Registry>,
}

impl RelayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let active_mailboxes = register_gauge_with_registry!(
            "tether_relay_active_mailboxes",
            "Number of active signal mailboxes",
            registry
        )?;

        let pending_signals = register_gauge_with_registry!(
            "tether_relay_pending_signals",
            "Signals waiting in all mailboxes",
            registry
        )?;

        let signals_posted = register_counter_with_registry!(
            "tether_relay_signals_posted_total",
            "Total number of signals posted",
            registry
        )?;

        let signals_delivered = register_counter_with_registry!(
            "tether_relay_signals_delivered_total",
            "Total number of signals returned to pollers",
            registry
        )?;

        let signals_deleted = register_counter_with_registry!(
            "tether_relay_signals_deleted_total",
            "Total number of signals deleted by recipients",
            registry
        )?;

        let signals_evicted = register_counter_with_registry!(
            "tether_relay_signals_evicted_total",
            "Total number of signals evicted after their TTL",
            registry
        )?;

        let request_latency = register_histogram_with_registry!(
            "tether_relay_request_latency_seconds",
            "Request latency in seconds",
            registry
        )?;

        let error_counts = register_counter_with_registry!(
            "tether_relay_errors_total",
            "Total number of rejected requests",
            registry
        )?;

        Ok(Self {
            active_mailboxes,
            pending_signals,
            signals_posted,
            signals_delivered,
            signals_deleted,
            signals_evicted,
            request_latency,
            error_counts,
            registry,
        })
    }

    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
