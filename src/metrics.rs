use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Global metrics for the API client
pub struct Metrics {
    pub registry: Registry,

    // Request metrics
    pub requests_total: CounterVec,

    // Credential renewal metrics
    pub renewals_total: CounterVec,
    pub replays_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("frontdesk_requests_total", "Total number of API requests sent"),
            &["method", "status"],
        )?;

        let renewals_total = CounterVec::new(
            Opts::new(
                "frontdesk_renewals_total",
                "Credential renewal attempts by outcome",
            ),
            &["outcome"], // success, failure, abandoned
        )?;

        let replays_total = CounterVec::new(
            Opts::new(
                "frontdesk_replays_total",
                "Requests replayed after an authorization failure",
            ),
            &["outcome"], // success, failure
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(renewals_total.clone()))?;
        registry.register(Box::new(replays_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            renewals_total,
            replays_total,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<Arc<Metrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(Metrics::default()));
