//! GPU metrics collection
//!
//! The collection scheduler talks to the outside world through three narrow
//! traits: the driver binding (initialization and discovery), the device
//! status provider (per-device queries) and the container resolver (which
//! devices each container holds). Production implementations live in the
//! `nvml` and `podresources` submodules; tests substitute fakes.

mod r#loop;
#[cfg(feature = "nvml")]
mod nvml;
mod podresources;

#[cfg(test)]
mod tests;

#[cfg(feature = "nvml")]
pub use nvml::NvmlDriver;
pub use podresources::{
    containers_with_devices, PodResourcesResolver, DEFAULT_POD_RESOURCES_SOCKET,
};
pub use r#loop::{
    CollectionConfig, CollectionResults, CollectionScheduler, CollectionSchedulerBuilder,
    DEFAULT_COLLECTION_INTERVAL, DUTY_CYCLE_WINDOW, METRICS_RESET_INTERVAL,
};

use crate::models::{ContainerDeviceMap, DeviceHandle, DeviceStatus};
use anyhow::Result;
use std::time::Duration;

pub use async_trait::async_trait;

/// One-time driver initialization and device enumeration
#[async_trait]
pub trait DriverBinding: Send + Sync {
    /// Query the installed driver version; initializes the driver if needed
    async fn driver_version(&self) -> Result<String>;

    /// Enumerate devices so later lookups by identifier succeed
    async fn discover_devices(&self) -> Result<()>;
}

/// Per-device status and utilization queries
#[async_trait]
pub trait DeviceStatusProvider: Send + Sync {
    /// Resolve a device identifier (e.g. `nvidia0`) to a handle
    async fn device(&self, device_id: &str) -> Result<DeviceHandle>;

    /// Point-in-time memory status of a device
    async fn status(&self, device: &DeviceHandle) -> Result<DeviceStatus>;

    /// Average utilization percent over the window ending now
    async fn average_utilization(&self, uuid: &str, window: Duration) -> Result<u32>;
}

/// Maps every running container to the devices assigned to it
#[async_trait]
pub trait ContainerDeviceResolver: Send + Sync {
    async fn devices_for_all_containers(&self) -> Result<ContainerDeviceMap>;
}
