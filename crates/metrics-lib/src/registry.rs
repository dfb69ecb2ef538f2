//! Published GPU gauge families
//!
//! `MetricsRegistry` owns a prometheus [`Registry`] and the four gauge
//! families exported per container. It is cheap to clone: every clone shares
//! the same underlying vectors.
//!
//! Concurrency: the prometheus vectors synchronise internally, so the
//! collection loop may set and reset values while the exposition handler
//! gathers from any number of other tasks. Callers need no extra locking.

use crate::models::{ContainerId, DeviceSample, GPU_MAKE};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;

pub const DUTY_CYCLE: &str = "duty_cycle";
pub const MEMORY_TOTAL: &str = "memory_total";
pub const MEMORY_USED: &str = "memory_used";
pub const REQUEST: &str = "request";

/// Labels on the per-device gauges
pub const DEVICE_LABELS: &[&str] = &[
    "namespace",
    "pod",
    "container",
    "make",
    "accelerator_id",
    "model",
];

/// Labels on the per-container request gauge
pub const REQUEST_LABELS: &[&str] = &["namespace", "pod", "container", "resource_name"];

#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    duty_cycle: GaugeVec,
    memory_total: GaugeVec,
    memory_used: GaugeVec,
    requests: GaugeVec,
}

impl MetricsRegistry {
    /// Create the four gauge families on a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create the gauge families on an existing registry
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let duty_cycle = register(
            &registry,
            DUTY_CYCLE,
            "Percent of time when the GPU was actively processing",
            DEVICE_LABELS,
        )?;
        let memory_total = register(
            &registry,
            MEMORY_TOTAL,
            "Total memory available on the GPU in bytes",
            DEVICE_LABELS,
        )?;
        let memory_used = register(
            &registry,
            MEMORY_USED,
            "Allocated GPU memory in bytes",
            DEVICE_LABELS,
        )?;
        let requests = register(
            &registry,
            REQUEST,
            "Number of accelerator devices requested by the container",
            REQUEST_LABELS,
        )?;

        Ok(Self {
            registry,
            duty_cycle,
            memory_total,
            memory_used,
            requests,
        })
    }

    /// Underlying registry, for registering additional collectors
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Set the number of devices assigned to a container
    pub fn set_requests(&self, container: &ContainerId, resource_name: &str, count: usize) {
        self.requests
            .with_label_values(&[
                container.namespace.as_str(),
                container.pod.as_str(),
                container.container.as_str(),
                resource_name,
            ])
            .set(count as f64);
    }

    /// Publish duty cycle and memory gauges for one device of a container
    pub fn publish_device(&self, container: &ContainerId, sample: &DeviceSample) {
        let labels = [
            container.namespace.as_str(),
            container.pod.as_str(),
            container.container.as_str(),
            GPU_MAKE,
            sample.uuid.as_str(),
            sample.model.as_str(),
        ];

        self.duty_cycle
            .with_label_values(&labels)
            .set(f64::from(sample.duty_cycle));
        self.memory_total
            .with_label_values(&labels)
            .set(sample.memory_total_bytes());
        self.memory_used
            .with_label_values(&labels)
            .set(sample.memory_used_bytes());
    }

    /// Drop every label combination from all four families
    pub fn reset(&self) {
        self.requests.reset();
        self.duty_cycle.reset();
        self.memory_total.reset();
        self.memory_used.reset();
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Number of label combinations currently held by a family
    pub fn series_count(&self, family: &str) -> usize {
        self.gather()
            .iter()
            .find(|mf| mf.get_name() == family)
            .map(|mf| mf.get_metric().len())
            .unwrap_or(0)
    }

    /// Current value of the series in `family` whose labels match exactly
    pub fn gauge_value(&self, family: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let wanted: HashMap<&str, &str> = labels.iter().copied().collect();

        self.gather()
            .iter()
            .find(|mf| mf.get_name() == family)?
            .get_metric()
            .iter()
            .find(|m| {
                let have: HashMap<&str, &str> = m
                    .get_label()
                    .iter()
                    .map(|lp| (lp.get_name(), lp.get_value()))
                    .collect();
                have == wanted
            })
            .map(|m| m.get_gauge().get_value())
    }
}

fn register(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}
