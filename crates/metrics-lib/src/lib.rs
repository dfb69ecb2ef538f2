//! Per-container GPU metrics for Kubernetes nodes
//!
//! This crate provides the core functionality for:
//! - Resolving which GPUs the kubelet assigned to each container
//! - Sampling memory and duty cycle from the NVIDIA driver
//! - Publishing labeled Prometheus gauges and resetting them periodically
//! - Health checks and agent self-metrics

pub mod api;
pub mod collector;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod proto;
pub mod registry;
pub mod server;

pub use error::{DeviceError, StartError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use registry::MetricsRegistry;
pub use server::{MetricServer, MetricServerBuilder, ServerConfig};
