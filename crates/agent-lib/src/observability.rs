//! Observability infrastructure for the agent
//!
//! Provides:
//! - Prometheus self-metrics (scrape latency, datapoints collected, active
//!   schedulers) served by the telemetry emitter
//! - Structured lifecycle logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for scrape round-trips (in seconds)
const SCRAPE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct AgentMetricsInner {
    datapoints_collected: IntCounter,
    definitions_declared: IntCounter,
    scrape_duration_seconds: Histogram,
    scrape_errors: IntCounter,
    endpoints_active: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            datapoints_collected: register_int_counter!(
                "metrics_agent_datapoints_collected_total",
                "Total number of datapoints emitted to the store"
            )
            .expect("Failed to register datapoints_collected_total"),

            definitions_declared: register_int_counter!(
                "metrics_agent_definitions_declared_total",
                "Total number of metric definitions declared at the store"
            )
            .expect("Failed to register definitions_declared_total"),

            scrape_duration_seconds: register_histogram!(
                "metrics_agent_scrape_duration_seconds",
                "Time spent scraping a monitored endpoint",
                SCRAPE_BUCKETS.to_vec()
            )
            .expect("Failed to register scrape_duration_seconds"),

            scrape_errors: register_int_counter!(
                "metrics_agent_scrape_errors_total",
                "Total number of failed scrape cycles"
            )
            .expect("Failed to register scrape_errors_total"),

            endpoints_active: register_int_gauge!(
                "metrics_agent_endpoints_active",
                "Number of endpoints currently being collected"
            )
            .expect("Failed to register endpoints_active"),
        }
    }
}

/// Agent self-metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Add to the emitted-datapoints counter
    pub fn add_datapoints_collected(&self, count: u64) {
        self.inner().datapoints_collected.inc_by(count);
    }

    /// Add to the declared-definitions counter
    pub fn add_definitions_declared(&self, count: u64) {
        self.inner().definitions_declared.inc_by(count);
    }

    /// Record one scrape round-trip
    pub fn observe_scrape_duration(&self, duration_secs: f64) {
        self.inner().scrape_duration_seconds.observe(duration_secs);
    }

    /// Increment the failed-scrape counter
    pub fn inc_scrape_errors(&self) {
        self.inner().scrape_errors.inc();
    }

    /// Update the active-endpoints gauge
    pub fn set_endpoints_active(&self, count: i64) {
        self.inner().endpoints_active.set(count);
    }
}

/// Structured logger for agent lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            "Metrics agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Metrics agent shutting down"
        );
    }

    /// Log the start of collection for an endpoint
    pub fn log_collection_started(&self, endpoint_id: &str, interval_secs: u64) {
        info!(
            event = "collection_started",
            node = %self.node_name,
            endpoint_id = %endpoint_id,
            interval_secs = interval_secs,
            "Started collecting from endpoint"
        );
    }

    /// Log the end of collection for an endpoint
    pub fn log_collection_stopped(&self, endpoint_id: &str) {
        info!(
            event = "collection_stopped",
            node = %self.node_name,
            endpoint_id = %endpoint_id,
            "Stopped collecting from endpoint"
        );
    }

    /// Log a failed scrape cycle
    pub fn log_scrape_error(&self, endpoint_id: &str, error: &str) {
        warn!(
            event = "scrape_failed",
            node = %self.node_name,
            endpoint_id = %endpoint_id,
            error = %error,
            "Scrape cycle failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics_creation() {
        // Note: metrics register against the process-global Prometheus
        // registry, so this exercises the handle rather than asserting on
        // registry contents.
        let metrics = AgentMetrics::new();

        metrics.add_datapoints_collected(5);
        metrics.add_definitions_declared(2);
        metrics.observe_scrape_duration(0.05);
        metrics.inc_scrape_errors();
        metrics.set_endpoints_active(3);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
    }
}
