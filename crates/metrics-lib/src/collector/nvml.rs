//! NVML-backed driver binding and device status provider

use super::{DeviceStatusProvider, DriverBinding};
use crate::models::{DeviceHandle, DeviceStatus, BYTES_PER_MIB};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use nvml_wrapper::enum_wrappers::device::Sampling;
use nvml_wrapper::enums::device::SampleValue;
use nvml_wrapper::Nvml;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Talks to the NVIDIA driver through NVML
///
/// NVML is loaded on the first driver call, so a missing or broken driver
/// surfaces from `driver_version` rather than from construction.
#[derive(Default)]
pub struct NvmlDriver {
    nvml: OnceCell<Arc<Nvml>>,
    /// Device name (`nvidia<minor>`) to NVML index
    devices: DashMap<String, u32>,
}

impl NvmlDriver {
    pub fn new() -> Self {
        Self::default()
    }

    async fn nvml(&self) -> Result<Arc<Nvml>> {
        self.nvml
            .get_or_try_init(|| async { Nvml::init().map(Arc::new) })
            .await
            .map(Arc::clone)
            .context("Failed to initialize NVML")
    }

    fn index_of(&self, device_id: &str) -> Result<u32> {
        self.devices
            .get(device_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| anyhow!("device {} not found", device_id))
    }
}

#[async_trait]
impl DriverBinding for NvmlDriver {
    async fn driver_version(&self) -> Result<String> {
        let nvml = self.nvml().await?;
        nvml.sys_driver_version()
            .context("Failed to query driver version")
    }

    async fn discover_devices(&self) -> Result<()> {
        let nvml = self.nvml().await?;
        let count = nvml.device_count().context("Failed to count devices")?;

        self.devices.clear();
        for index in 0..count {
            let device = nvml
                .device_by_index(index)
                .with_context(|| format!("Failed to open device {}", index))?;
            let minor = device
                .minor_number()
                .with_context(|| format!("Failed to read minor number of device {}", index))?;

            let name = format!("nvidia{}", minor);
            debug!(device = %name, index, "Discovered GPU device");
            self.devices.insert(name, index);
        }

        info!(count, "GPU device discovery complete");
        Ok(())
    }
}

#[async_trait]
impl DeviceStatusProvider for NvmlDriver {
    async fn device(&self, device_id: &str) -> Result<DeviceHandle> {
        let index = self.index_of(device_id)?;
        let nvml = self.nvml().await?;
        let name = device_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<DeviceHandle> {
            let device = nvml.device_by_index(index)?;
            Ok(DeviceHandle {
                name,
                uuid: device.uuid()?,
                model: device.name()?,
            })
        })
        .await?
    }

    async fn status(&self, device: &DeviceHandle) -> Result<DeviceStatus> {
        let index = self.index_of(&device.name)?;
        let nvml = self.nvml().await?;

        tokio::task::spawn_blocking(move || -> Result<DeviceStatus> {
            let memory = nvml.device_by_index(index)?.memory_info()?;
            Ok(DeviceStatus {
                memory_total_mib: memory.total / BYTES_PER_MIB,
                memory_used_mib: memory.used / BYTES_PER_MIB,
            })
        })
        .await?
    }

    async fn average_utilization(&self, uuid: &str, window: Duration) -> Result<u32> {
        let nvml = self.nvml().await?;
        let uuid = uuid.to_string();
        let since = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(UNIX_EPOCH)
            .duration_since(UNIX_EPOCH)?
            .as_micros() as u64;

        let values = tokio::task::spawn_blocking(move || -> Result<Vec<f64>> {
            let device = nvml.device_by_uuid(uuid.as_str())?;
            let samples = device.samples(Sampling::GpuUtilization, since)?;
            Ok(samples
                .iter()
                .filter_map(|sample| sample_as_f64(&sample.value))
                .collect())
        })
        .await??;

        mean_percent(&values).ok_or_else(|| anyhow!("no utilization samples in the last {:?}", window))
    }
}

fn sample_as_f64(value: &SampleValue) -> Option<f64> {
    match *value {
        SampleValue::F64(v) => Some(v),
        SampleValue::U32(v) => Some(f64::from(v)),
        SampleValue::U64(v) => Some(v as f64),
        SampleValue::I64(v) => Some(v as f64),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Integer mean of utilization samples, `None` when there are none
fn mean_percent(values: &[f64]) -> Option<u32> {
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some(mean.clamp(0.0, 100.0) as u32)
}
