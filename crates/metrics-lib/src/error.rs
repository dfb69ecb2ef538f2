//! Error types for the metrics agent.
//!
//! Collaborator traits return `anyhow::Result`; these enums classify the
//! failures the core reacts to differently.

use std::time::Duration;
use thiserror::Error;

/// Failures that prevent the metric server from starting.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("failed to query driver: {source}")]
    Driver {
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to discover GPU devices: {source}")]
    Discovery {
        #[source]
        source: anyhow::Error,
    },

    #[error("metric server already started")]
    AlreadyStarted,
}

/// A failed query for a single device within one collection pass.
///
/// The device is skipped for the pass; other devices are unaffected.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to get device {device}: {source}")]
    Lookup {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to get device status for {device}: {source}")]
    Status {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to calculate duty cycle for device {device}: {source}")]
    DutyCycle {
        device: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DeviceError {
    /// Short label used for the collection errors counter
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::Lookup { .. } => "device_lookup",
            DeviceError::Status { .. } => "device_status",
            DeviceError::DutyCycle { .. } => "duty_cycle",
        }
    }

    pub fn device(&self) -> &str {
        match self {
            DeviceError::Lookup { device, .. }
            | DeviceError::Status { device, .. }
            | DeviceError::DutyCycle { device, .. } => device,
        }
    }
}

/// Error raised when a device query exceeds the configured timeout
#[derive(Error, Debug)]
#[error("device query timed out after {0:?}")]
pub struct QueryTimeout(pub Duration);
