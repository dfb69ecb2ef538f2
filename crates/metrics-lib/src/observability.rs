//! Observability infrastructure for the metrics agent
//!
//! Provides:
//! - Agent self-metrics (collection latency, errors, monitored entities, resets)
//! - Structured JSON logging of lifecycle events with tracing

use crate::registry::MetricsRegistry;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts};
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for collection pass latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Agent self-metrics, registered next to the published GPU gauges
///
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    collection_latency_seconds: Histogram,
    collection_errors: IntCounterVec,
    containers_monitored: IntGauge,
    devices_monitored: IntGauge,
    metric_resets: IntCounter,
}

impl AgentMetrics {
    /// Register the agent metrics on the given registry
    pub fn register(registry: &MetricsRegistry) -> prometheus::Result<Self> {
        let collection_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "gpu_metrics_agent_collection_latency_seconds",
                "Time spent in one collection pass",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let collection_errors = IntCounterVec::new(
            Opts::new(
                "gpu_metrics_agent_collection_errors_total",
                "Total number of collection errors by kind",
            ),
            &["kind"],
        )?;
        let containers_monitored = IntGauge::new(
            "gpu_metrics_agent_containers_monitored",
            "Number of containers with GPUs seen in the last pass",
        )?;
        let devices_monitored = IntGauge::new(
            "gpu_metrics_agent_devices_monitored",
            "Number of devices published in the last pass",
        )?;
        let metric_resets = IntCounter::new(
            "gpu_metrics_agent_metric_resets_total",
            "Total number of full resets of the published gauges",
        )?;

        let r = registry.registry();
        r.register(Box::new(collection_latency_seconds.clone()))?;
        r.register(Box::new(collection_errors.clone()))?;
        r.register(Box::new(containers_monitored.clone()))?;
        r.register(Box::new(devices_monitored.clone()))?;
        r.register(Box::new(metric_resets.clone()))?;

        Ok(Self {
            collection_latency_seconds,
            collection_errors,
            containers_monitored,
            devices_monitored,
            metric_resets,
        })
    }

    /// Record the duration of a collection pass
    pub fn observe_collection_latency(&self, elapsed: Duration) {
        self.collection_latency_seconds
            .observe(elapsed.as_secs_f64());
    }

    /// Increment the error counter for a failure kind
    pub fn inc_collection_errors(&self, kind: &str) {
        self.collection_errors.with_label_values(&[kind]).inc();
    }

    #[cfg(test)]
    pub(crate) fn collection_errors(&self, kind: &str) -> u64 {
        self.collection_errors.with_label_values(&[kind]).get()
    }

    pub fn set_monitored(&self, containers: usize, devices: usize) {
        self.containers_monitored.set(containers as i64);
        self.devices_monitored.set(devices as i64);
    }

    pub fn inc_metric_resets(&self) {
        self.metric_resets.inc();
    }

    #[cfg(test)]
    pub(crate) fn metric_resets(&self) -> u64 {
        self.metric_resets.get()
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for lifecycle events.
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
    pub fn log_startup(&self, version: &str, driver_version: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            driver_version = %driver_version,
            "GPU metrics agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "GPU metrics agent shutting down"
        );
    }

    /// Log a full reset of the published gauges
    pub fn log_metrics_reset(&self, since_last_reset: Duration) {
        info!(
            event = "metrics_reset",
            node = %self.node_name,
            since_last_reset_secs = since_last_reset.as_secs(),
            "Cleared all GPU metric label sets"
        );
    }

    /// Log a collection pass abandoned before publishing anything
    pub fn log_pass_skipped(&self, error: &anyhow::Error) {
        warn!(
            event = "collection_pass_skipped",
            node = %self.node_name,
            error = %error,
            "Failed to get devices for containers, skipping collection pass"
        );
    }
}
