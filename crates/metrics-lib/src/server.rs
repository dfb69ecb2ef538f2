//! Metric server lifecycle
//!
//! `MetricServer` initializes the driver, then runs the HTTP exposition
//! server and the collection loop as two independent tasks until stopped.

use crate::api::{self, AppState, DEFAULT_METRICS_PATH};
use crate::collector::{
    CollectionConfig, CollectionScheduler, CollectionSchedulerBuilder, ContainerDeviceResolver,
    DeviceStatusProvider, DriverBinding, DEFAULT_COLLECTION_INTERVAL, DUTY_CYCLE_WINDOW,
    METRICS_RESET_INTERVAL,
};
use crate::error::StartError;
use crate::health::{components, HealthRegistry};
use crate::models::GPU_RESOURCE_NAME;
use crate::observability::StructuredLogger;
use crate::registry::MetricsRegistry;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Default port for the metrics endpoint
pub const DEFAULT_METRICS_PORT: u16 = 2112;

/// Settings for the metric server and its collection loop
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub collection_interval: Duration,
    pub port: u16,
    pub metrics_path: String,
    pub reset_interval: Duration,
    pub duty_cycle_window: Duration,
    pub device_query_timeout: Option<Duration>,
    pub resource_name: String,
}

impl ServerConfig {
    pub fn new(collection_interval_ms: u64, port: u16, metrics_path: impl Into<String>) -> Self {
        Self {
            collection_interval: Duration::from_millis(collection_interval_ms),
            port,
            metrics_path: metrics_path.into(),
            ..Default::default()
        }
    }

    fn collection_config(&self) -> CollectionConfig {
        CollectionConfig {
            interval: self.collection_interval,
            reset_interval: self.reset_interval,
            duty_cycle_window: self.duty_cycle_window,
            device_query_timeout: self.device_query_timeout,
            resource_name: self.resource_name.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            collection_interval: DEFAULT_COLLECTION_INTERVAL,
            port: DEFAULT_METRICS_PORT,
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            reset_interval: METRICS_RESET_INTERVAL,
            duty_cycle_window: DUTY_CYCLE_WINDOW,
            device_query_timeout: None,
            resource_name: GPU_RESOURCE_NAME.to_string(),
        }
    }
}

/// Exposes per-container GPU metrics in Prometheus format
pub struct MetricServer {
    config: ServerConfig,
    driver: Arc<dyn DriverBinding>,
    registry: MetricsRegistry,
    health: HealthRegistry,
    logger: StructuredLogger,
    /// Taken when the collection loop is launched
    scheduler: Option<CollectionScheduler>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl MetricServer {
    pub fn builder() -> MetricServerBuilder {
        MetricServerBuilder::new()
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Whether the server tasks have been launched and not yet stopped
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Initialize the driver and launch the exposition server and collection loop
    ///
    /// Fails without launching anything if the driver cannot be queried or
    /// devices cannot be discovered.
    pub async fn start(&mut self) -> Result<(), StartError> {
        if self.scheduler.is_none() {
            return Err(StartError::AlreadyStarted);
        }
        info!("Starting metrics server");

        let driver_version = match self.driver.driver_version().await {
            Ok(version) => version,
            Err(source) => {
                self.health
                    .set_unhealthy(components::DRIVER, format!("{:#}", source))
                    .await;
                return Err(StartError::Driver { source });
            }
        };
        info!(driver_version = %driver_version, "Driver initialized successfully");

        if let Err(source) = self.driver.discover_devices().await {
            self.health
                .set_unhealthy(components::DRIVER, format!("{:#}", source))
                .await;
            return Err(StartError::Discovery { source });
        }
        self.health.set_healthy(components::DRIVER).await;

        let scheduler = self.scheduler.take().ok_or(StartError::AlreadyStarted)?;

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let metrics_path = self.config.metrics_path.clone();
        let state = Arc::new(AppState::new(self.health.clone(), self.registry.clone()));
        let mut api_shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = api_shutdown.recv().await;
            };
            if let Err(e) = api::serve(addr, &metrics_path, state, shutdown).await {
                warn!(error = %e, "Metrics server failed, collection continues");
            }
        }));

        self.tasks
            .push(tokio::spawn(scheduler.run(self.shutdown_tx.subscribe())));

        self.health.set_ready(true).await;
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), &driver_version);

        Ok(())
    }

    /// Stop both tasks and wait for them to exit
    ///
    /// A collection pass in flight finishes before the loop exits.
    pub async fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        info!("Stopping metrics server");
        self.health.set_ready(false).await;

        // Fails only if every receiver is already gone.
        let _ = self.shutdown_tx.send(());

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Metrics server task ended abnormally");
            }
        }
    }
}

/// Builder for the metric server
pub struct MetricServerBuilder {
    config: ServerConfig,
    driver: Option<Arc<dyn DriverBinding>>,
    devices: Option<Arc<dyn DeviceStatusProvider>>,
    resolver: Option<Arc<dyn ContainerDeviceResolver>>,
    registry: Option<MetricsRegistry>,
    logger: Option<StructuredLogger>,
}

impl MetricServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            driver: None,
            devices: None,
            resolver: None,
            registry: None,
            logger: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn driver(mut self, driver: Arc<dyn DriverBinding>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn devices(mut self, devices: Arc<dyn DeviceStatusProvider>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ContainerDeviceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Publish into an existing registry instead of a fresh one
    pub fn registry(mut self, registry: MetricsRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the server; nothing is started and no I/O happens
    pub fn build(mut self) -> Result<MetricServer> {
        self.config.metrics_path = api::normalize_metrics_path(&self.config.metrics_path)?;

        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("Driver binding is required"))?;
        let devices = self
            .devices
            .ok_or_else(|| anyhow::anyhow!("Device status provider is required"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| anyhow::anyhow!("Container resolver is required"))?;
        let registry = match self.registry {
            Some(registry) => registry,
            None => MetricsRegistry::new()?,
        };
        let logger = self
            .logger
            .unwrap_or_else(|| StructuredLogger::new("unknown"));
        let health = HealthRegistry::with_components(&[
            components::DRIVER,
            components::RESOLVER,
            components::COLLECTOR,
        ]);

        let scheduler = CollectionSchedulerBuilder::new()
            .devices(devices)
            .resolver(resolver)
            .registry(registry.clone())
            .health(health.clone())
            .logger(logger.clone())
            .config(self.config.collection_config())
            .build()?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(MetricServer {
            config: self.config,
            driver,
            registry,
            health,
            logger,
            scheduler: Some(scheduler),
            shutdown_tx,
            tasks: Vec::new(),
        })
    }
}

impl Default for MetricServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
