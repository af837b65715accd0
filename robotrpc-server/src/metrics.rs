//! Prometheus metrics for the robot host.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use robotrpc_core::HostStats;

/// Request duration histogram buckets (in seconds). Prompts wait on users,
/// so the tail is long.
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.25, 1.0, 5.0, 15.0, 45.0];

/// Prometheus metrics for the robot host.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Calls by function name.
    pub requests_total: CounterVec,
    /// Results by return code name.
    pub retvals_total: CounterVec,
    /// Rejected requests by error code.
    pub errors_total: CounterVec,
    pub request_duration: HistogramVec,
    pub datum_locks_active: Gauge,
    pub prompt_waiters_active: Gauge,
    pub callers_active: Gauge,
    pub exclusive_tags_active: Gauge,
    pub short_term_memories: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("robotrpc_requests_total", "Total robot calls by function"),
            &["func"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let retvals_total = CounterVec::new(
            Opts::new("robotrpc_retvals_total", "Total call results by return code"),
            &["retval"],
        )?;
        registry.register(Box::new(retvals_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("robotrpc_errors_total", "Total rejected requests by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "robotrpc_request_duration_seconds",
                "Call duration in seconds by function",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["func"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let datum_locks_active = Gauge::with_opts(Opts::new(
            "robotrpc_datum_locks_active",
            "Number of live datum locks",
        ))?;
        registry.register(Box::new(datum_locks_active.clone()))?;

        let prompt_waiters_active = Gauge::with_opts(Opts::new(
            "robotrpc_prompt_waiters_active",
            "Number of prompts waiting for a reply",
        ))?;
        registry.register(Box::new(prompt_waiters_active.clone()))?;

        let callers_active = Gauge::with_opts(Opts::new(
            "robotrpc_callers_active",
            "Number of registered callers",
        ))?;
        registry.register(Box::new(callers_active.clone()))?;

        let exclusive_tags_active = Gauge::with_opts(Opts::new(
            "robotrpc_exclusive_tags_active",
            "Number of held exclusive tags",
        ))?;
        registry.register(Box::new(exclusive_tags_active.clone()))?;

        let short_term_memories = Gauge::with_opts(Opts::new(
            "robotrpc_short_term_memories",
            "Number of stored short-term memories",
        ))?;
        registry.register(Box::new(short_term_memories.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            retvals_total,
            errors_total,
            request_duration,
            datum_locks_active,
            prompt_waiters_active,
            callers_active,
            exclusive_tags_active,
            short_term_memories,
        })
    }

    /// Sets the gauges from a host snapshot.
    pub fn update_host_stats(&self, stats: HostStats) {
        self.datum_locks_active.set(stats.datum_locks as f64);
        self.prompt_waiters_active.set(stats.prompt_waiters as f64);
        self.callers_active.set(stats.callers as f64);
        self.exclusive_tags_active.set(stats.exclusive_tags as f64);
        self.short_term_memories
            .set(stats.short_term_memories as f64);
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics
            .requests_total
            .with_label_values(&["CheckAdmin"])
            .inc();
        metrics.retvals_total.with_label_values(&["Ok"]).inc();
        metrics
            .errors_total
            .with_label_values(&["UNKNOWN_CALLER"])
            .inc();
        metrics
            .request_duration
            .with_label_values(&["CheckAdmin"])
            .observe(0.001);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("robotrpc_requests_total"));
        assert!(encoded.contains("robotrpc_retvals_total"));
        assert!(encoded.contains("robotrpc_errors_total"));
        assert!(encoded.contains("robotrpc_request_duration_seconds"));
    }

    #[test]
    fn test_update_host_stats() {
        let metrics = Metrics::new().unwrap();
        metrics.update_host_stats(HostStats {
            callers: 3,
            datum_locks: 2,
            prompt_waiters: 1,
            exclusive_tags: 4,
            short_term_memories: 5,
        });
        assert_eq!(metrics.callers_active.get(), 3.0);
        assert_eq!(metrics.datum_locks_active.get(), 2.0);
        assert_eq!(metrics.prompt_waiters_active.get(), 1.0);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("robotrpc_datum_locks_active 2"));
        assert!(encoded.contains("robotrpc_callers_active 3"));
    }
}
