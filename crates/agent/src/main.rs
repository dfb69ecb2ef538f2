//! GPU metrics agent
//!
//! This binary runs as a DaemonSet on each GPU node, publishing per-container
//! GPU memory and duty-cycle gauges for Prometheus to scrape.

use anyhow::Result;
use metrics_lib::collector::{NvmlDriver, PodResourcesResolver};
use metrics_lib::{MetricServer, MetricsRegistry, StructuredLogger};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting gpu-metrics-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        port = config.metrics_port,
        path = %config.metrics_path,
        interval_ms = config.collection_interval_ms,
        "Agent configured"
    );

    let driver = Arc::new(NvmlDriver::new());
    let resolver = PodResourcesResolver::new(&config.pod_resources_socket)
        .with_resource_name(&config.resource_name);
    let logger = StructuredLogger::new(&config.node_name);

    let mut server = MetricServer::builder()
        .config(config.server_config())
        .driver(driver.clone())
        .devices(driver)
        .resolver(Arc::new(resolver))
        .registry(MetricsRegistry::new()?)
        .logger(logger.clone())
        .build()?;

    server.start().await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    server.stop().await;
    info!("Shutting down");

    Ok(())
}
