//! Prometheus metrics for the relay.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

/// Relay counters.
///
/// Clones share the same underlying atomics, so one clone can be handed to
/// a registry while others are incremented by the relay.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Failed receives plus failed deliveries.
    errors: IntCounter,
    /// Error events discarded because the consumer fell behind.
    error_events_dropped: IntCounter,
}

impl RelayMetrics {
    /// Create counters under the given namespace (metric name prefix).
    pub fn new(namespace: &str) -> Result<Self, prometheus::Error> {
        let errors = IntCounter::with_opts(
            Opts::new("errors_total", "Number of errors").namespace(namespace),
        )?;
        let error_events_dropped = IntCounter::with_opts(
            Opts::new(
                "error_events_dropped_total",
                "Number of error events dropped because the error channel was full",
            )
            .namespace(namespace),
        )?;
        Ok(Self {
            errors,
            error_events_dropped,
        })
    }

    pub fn inc_errors(&self) {
        self.errors.inc();
    }

    pub fn errors_total(&self) -> u64 {
        self.errors.get()
    }

    pub fn inc_error_events_dropped(&self) {
        self.error_events_dropped.inc();
    }

    pub fn error_events_dropped_total(&self) -> u64 {
        self.error_events_dropped.get()
    }

    /// Register a clone of these counters into `registry`.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.clone()))
    }
}

impl Collector for RelayMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.errors.desc();
        descs.extend(self.error_events_dropped.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.errors.collect();
        families.extend(self.error_events_dropped.collect());
        families
    }
}

/// Render everything in `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
