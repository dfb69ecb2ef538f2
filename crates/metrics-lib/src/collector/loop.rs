//! Metrics collection loop
//!
//! Runs one collection pass per tick. A pass checks whether the published
//! gauges are due for a full reset, re-resolves which devices every container
//! holds, and publishes the request count and per-device gauges. Failures are
//! isolated: a failed device is skipped, a failed resolution skips the pass,
//! and nothing stops the loop except the shutdown signal.

use super::{ContainerDeviceResolver, DeviceStatusProvider};
use crate::error::{DeviceError, QueryTimeout};
use crate::health::{components, HealthRegistry};
use crate::models::{ContainerId, DeviceSample, GPU_RESOURCE_NAME};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::registry::MetricsRegistry;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default period between collection passes
pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(30);

/// Published label sets older than this are dropped by a full reset
pub const METRICS_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// Trailing window the duty cycle is averaged over
pub const DUTY_CYCLE_WINDOW: Duration = Duration::from_secs(10);

/// Configuration for the collection loop
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Period between passes (default: 30 seconds)
    pub interval: Duration,
    /// Minimum time between full resets of the published gauges (default: 60 seconds)
    pub reset_interval: Duration,
    /// Duty cycle averaging window (default: 10 seconds)
    pub duty_cycle_window: Duration,
    /// Upper bound on each device query; `None` waits indefinitely
    pub device_query_timeout: Option<Duration>,
    /// Value of the `resource_name` label on the request gauge
    pub resource_name: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_COLLECTION_INTERVAL,
            reset_interval: METRICS_RESET_INTERVAL,
            duty_cycle_window: DUTY_CYCLE_WINDOW,
            device_query_timeout: None,
            resource_name: GPU_RESOURCE_NAME.to_string(),
        }
    }
}

/// Outcome of a single collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionResults {
    /// The gauges were cleared at the start of this pass
    pub reset: bool,
    /// Container resolution failed and nothing was published
    pub skipped: bool,
    pub containers: usize,
    pub devices_published: usize,
    pub device_errors: usize,
}

/// Periodically samples every container's devices into the registry
///
/// The scheduler is the only writer to the published gauge families.
pub struct CollectionScheduler {
    devices: Arc<dyn DeviceStatusProvider>,
    resolver: Arc<dyn ContainerDeviceResolver>,
    registry: MetricsRegistry,
    metrics: AgentMetrics,
    health: HealthRegistry,
    logger: StructuredLogger,
    config: CollectionConfig,
    /// Only modified by the reset check
    last_reset: Instant,
}

impl CollectionScheduler {
    /// Create a scheduler; the reset clock starts now
    pub fn new(
        devices: Arc<dyn DeviceStatusProvider>,
        resolver: Arc<dyn ContainerDeviceResolver>,
        registry: MetricsRegistry,
        metrics: AgentMetrics,
        health: HealthRegistry,
        logger: StructuredLogger,
        config: CollectionConfig,
    ) -> Self {
        Self {
            devices,
            resolver,
            registry,
            metrics,
            health,
            logger,
            config,
            last_reset: Instant::now(),
        }
    }

    /// Run the collection loop until the shutdown signal fires
    ///
    /// The first pass runs one interval after the loop starts. A pass that
    /// is in flight when shutdown is signalled runs to completion.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            reset_interval_secs = self.config.reset_interval.as_secs(),
            "Starting metrics collection loop"
        );

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        // A slow pass delays the next tick instead of triggering a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pass_count = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let results = self.collect_once().await;
                    pass_count += 1;

                    debug!(
                        pass = pass_count,
                        reset = results.reset,
                        skipped = results.skipped,
                        containers = results.containers,
                        devices = results.devices_published,
                        device_errors = results.device_errors,
                        "Collection pass complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!(passes = pass_count, "Shutting down metrics collection loop");
                    break;
                }
            }
        }
    }

    /// Execute one collection pass now
    pub async fn collect_once(&mut self) -> CollectionResults {
        self.collect_at(Instant::now()).await
    }

    /// Execute one collection pass, using `now` for the reset check
    pub(crate) async fn collect_at(&mut self, now: Instant) -> CollectionResults {
        let start = Instant::now();
        let mut results = CollectionResults {
            reset: self.reset_if_needed(now),
            ..Default::default()
        };

        let containers = match self.resolver.devices_for_all_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                self.logger.log_pass_skipped(&e);
                self.metrics.inc_collection_errors("resolve");
                self.health
                    .set_degraded(components::RESOLVER, format!("{:#}", e))
                    .await;
                results.skipped = true;
                return results;
            }
        };
        self.health.set_healthy(components::RESOLVER).await;

        for (container, devices) in &containers {
            self.registry
                .set_requests(container, &self.config.resource_name, devices.len());
            results.containers += 1;

            for device in devices {
                match self.collect_device(device).await {
                    Ok(sample) => {
                        self.registry.publish_device(container, &sample);
                        results.devices_published += 1;
                    }
                    Err(e) => {
                        self.record_device_error(container, &e);
                        results.device_errors += 1;
                    }
                }
            }
        }

        if results.device_errors > 0 {
            self.health
                .set_degraded(
                    components::COLLECTOR,
                    format!("{} device queries failed in last pass", results.device_errors),
                )
                .await;
        } else {
            self.health.set_healthy(components::COLLECTOR).await;
        }

        self.metrics
            .set_monitored(results.containers, results.devices_published);
        self.metrics.observe_collection_latency(start.elapsed());

        results
    }

    /// Clear all published gauges once the reset interval has elapsed
    fn reset_if_needed(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_reset);
        if elapsed <= self.config.reset_interval {
            return false;
        }

        self.registry.reset();
        self.metrics.inc_metric_resets();
        self.logger.log_metrics_reset(elapsed);
        self.last_reset = now;
        true
    }

    /// Gather handle, status and duty cycle for one device
    async fn collect_device(&self, device_id: &str) -> Result<DeviceSample, DeviceError> {
        let handle = self
            .query(self.devices.device(device_id))
            .await
            .map_err(|source| DeviceError::Lookup {
                device: device_id.to_string(),
                source,
            })?;

        let status = self
            .query(self.devices.status(&handle))
            .await
            .map_err(|source| DeviceError::Status {
                device: device_id.to_string(),
                source,
            })?;

        let duty_cycle = self
            .query(
                self.devices
                    .average_utilization(&handle.uuid, self.config.duty_cycle_window),
            )
            .await
            .map_err(|source| DeviceError::DutyCycle {
                device: device_id.to_string(),
                source,
            })?;

        Ok(DeviceSample::new(handle, status, duty_cycle))
    }

    /// Await a device query, bounded by the configured timeout if any
    async fn query<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.device_query_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| QueryTimeout(limit))?,
            None => call.await,
        }
    }

    fn record_device_error(&self, container: &ContainerId, err: &DeviceError) {
        self.metrics.inc_collection_errors(err.kind());

        match err {
            DeviceError::DutyCycle { .. } => warn!(
                container = %container,
                device = %err.device(),
                error = %err,
                "Duty cycle unavailable, skipping this device"
            ),
            _ => error!(
                container = %container,
                device = %err.device(),
                error = %err,
                "Failed to query device"
            ),
        }
    }
}

/// Builder for creating the collection scheduler
pub struct CollectionSchedulerBuilder {
    devices: Option<Arc<dyn DeviceStatusProvider>>,
    resolver: Option<Arc<dyn ContainerDeviceResolver>>,
    registry: Option<MetricsRegistry>,
    metrics: Option<AgentMetrics>,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
    config: CollectionConfig,
}

impl CollectionSchedulerBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            devices: None,
            resolver: None,
            registry: None,
            metrics: None,
            health: None,
            logger: None,
            config: CollectionConfig::default(),
        }
    }

    /// Set the device status provider
    pub fn devices(mut self, devices: Arc<dyn DeviceStatusProvider>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the container resolver
    pub fn resolver(mut self, resolver: Arc<dyn ContainerDeviceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the registry the gauges are published to
    pub fn registry(mut self, registry: MetricsRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use already registered agent metrics
    pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the collection interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the reset interval
    pub fn reset_interval(mut self, interval: Duration) -> Self {
        self.config.reset_interval = interval;
        self
    }

    /// Set the duty cycle averaging window
    pub fn duty_cycle_window(mut self, window: Duration) -> Self {
        self.config.duty_cycle_window = window;
        self
    }

    /// Bound each device query
    pub fn device_query_timeout(mut self, timeout: Duration) -> Self {
        self.config.device_query_timeout = Some(timeout);
        self
    }

    /// Build the scheduler
    ///
    /// Agent metrics are registered on the registry unless provided.
    pub fn build(self) -> Result<CollectionScheduler> {
        let devices = self
            .devices
            .ok_or_else(|| anyhow::anyhow!("Device status provider is required"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| anyhow::anyhow!("Container resolver is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Metrics registry is required"))?;

        if self.config.interval.is_zero() {
            anyhow::bail!("Collection interval must be greater than zero");
        }

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => AgentMetrics::register(&registry)?,
        };

        Ok(CollectionScheduler::new(
            devices,
            resolver,
            registry,
            metrics,
            self.health.unwrap_or_default(),
            self.logger
                .unwrap_or_else(|| StructuredLogger::new("unknown")),
            self.config,
        ))
    }
}

impl Default for CollectionSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
