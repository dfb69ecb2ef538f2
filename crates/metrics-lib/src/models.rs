//! Core data models for the GPU metrics agent

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Extended resource name under which the device plugin advertises GPUs
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// Value of the `make` label on per-device gauges
pub const GPU_MAKE: &str = "nvidia";

/// Bytes per mebibyte; drivers report memory in MiB, gauges publish bytes
pub const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Identity of a running container as seen by the kubelet
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ContainerId {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Devices assigned to each container, rebuilt from scratch on every pass
pub type ContainerDeviceMap = HashMap<ContainerId, Vec<String>>;

/// A device resolved from its identifier (e.g. `nvidia0`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Identifier the device was looked up by
    pub name: String,
    pub uuid: String,
    /// Product name, e.g. "Tesla T4"
    pub model: String,
}

/// Point-in-time memory status of a device, in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub memory_total_mib: u64,
    pub memory_used_mib: u64,
}

/// Everything published for one device in one collection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSample {
    pub uuid: String,
    pub model: String,
    pub memory_total_mib: u64,
    pub memory_used_mib: u64,
    /// Average utilization percent over the trailing window
    pub duty_cycle: u32,
}

impl DeviceSample {
    pub fn new(handle: DeviceHandle, status: DeviceStatus, duty_cycle: u32) -> Self {
        Self {
            uuid: handle.uuid,
            model: handle.model,
            memory_total_mib: status.memory_total_mib,
            memory_used_mib: status.memory_used_mib,
            duty_cycle,
        }
    }

    pub fn memory_total_bytes(&self) -> f64 {
        mib_to_bytes(self.memory_total_mib)
    }

    pub fn memory_used_bytes(&self) -> f64 {
        mib_to_bytes(self.memory_used_mib)
    }
}

fn mib_to_bytes(mib: u64) -> f64 {
    mib as f64 * BYTES_PER_MIB as f64
}
