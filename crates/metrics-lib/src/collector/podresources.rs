//! Container to GPU resolution via the kubelet
//!
//! Asks the kubelet's PodResources service which devices of the GPU
//! extended resource are assigned to every container on the node.

use super::ContainerDeviceResolver;
use crate::models::{ContainerDeviceMap, ContainerId, GPU_RESOURCE_NAME};
use crate::proto::{ListPodResourcesRequest, ListPodResourcesResponse, PodResourcesListerClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

/// Default location of the kubelet pod-resources socket
pub const DEFAULT_POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves container GPU assignments from the kubelet
#[derive(Debug, Clone)]
pub struct PodResourcesResolver {
    socket_path: PathBuf,
    resource_name: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl PodResourcesResolver {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            resource_name: GPU_RESOURCE_NAME.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Only count devices of this extended resource
    pub fn with_resource_name(mut self, resource_name: impl Into<String>) -> Self {
        self.resource_name = resource_name.into();
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    async fn connect(&self) -> Result<Channel> {
        let path = self.socket_path.clone();

        // The URI is ignored by the connector; tonic only needs a valid one.
        Endpoint::try_from("http://[::]:50051")?
            .connect_timeout(self.connect_timeout)
            .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to kubelet socket {}",
                    self.socket_path.display()
                )
            })
    }
}

#[async_trait]
impl ContainerDeviceResolver for PodResourcesResolver {
    async fn devices_for_all_containers(&self) -> Result<ContainerDeviceMap> {
        let channel = self.connect().await?;
        let mut client = PodResourcesListerClient::new(channel);

        let response = tokio::time::timeout(
            self.request_timeout,
            client.list(ListPodResourcesRequest {}),
        )
        .await
        .context("Timed out listing pod resources")?
        .context("Failed to list pod resources")?
        .into_inner();

        let containers = containers_with_devices(&response, &self.resource_name);
        debug!(
            pods = response.pod_resources.len(),
            containers = containers.len(),
            "Resolved container devices"
        );

        Ok(containers)
    }
}

/// Build the container to device map for one extended resource
///
/// Containers holding no device of that resource are left out.
pub fn containers_with_devices(
    response: &ListPodResourcesResponse,
    resource_name: &str,
) -> ContainerDeviceMap {
    let mut containers = ContainerDeviceMap::new();

    for pod in &response.pod_resources {
        for container in &pod.containers {
            let device_ids: Vec<String> = container
                .devices
                .iter()
                .filter(|d| d.resource_name == resource_name)
                .flat_map(|d| d.device_ids.iter().cloned())
                .collect();

            if device_ids.is_empty() {
                continue;
            }

            containers
                .entry(ContainerId::new(&pod.namespace, &pod.name, &container.name))
                .or_default()
                .extend(device_ids);
        }
    }

    containers
}
