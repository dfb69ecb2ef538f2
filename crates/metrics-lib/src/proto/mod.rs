//! Kubelet PodResources API (v1alpha1)
//!
//! Message and client definitions for the `PodResourcesLister` service the
//! kubelet serves on its pod-resources unix socket. The API is small and
//! frozen, so the types are written out rather than generated by protoc.

pub mod v1alpha1 {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct ListPodResourcesRequest {}

    #[derive(Clone, PartialEq, Message)]
    pub struct ListPodResourcesResponse {
        #[prost(message, repeated, tag = "1")]
        pub pod_resources: Vec<PodResources>,
    }

    /// Resources assigned to the containers of one pod
    #[derive(Clone, PartialEq, Message)]
    pub struct PodResources {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub namespace: String,
        #[prost(message, repeated, tag = "3")]
        pub containers: Vec<ContainerResources>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerResources {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, repeated, tag = "2")]
        pub devices: Vec<ContainerDevices>,
    }

    /// Device IDs of one extended resource assigned to a container
    #[derive(Clone, PartialEq, Message)]
    pub struct ContainerDevices {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(string, repeated, tag = "2")]
        pub device_ids: Vec<String>,
    }

    pub mod pod_resources_lister_client {
        use super::*;
        use tonic::codegen::http;
        use tonic::transport::Channel;

        #[derive(Debug, Clone)]
        pub struct PodResourcesListerClient {
            inner: tonic::client::Grpc<Channel>,
        }

        impl PodResourcesListerClient {
            pub fn new(channel: Channel) -> Self {
                let inner = tonic::client::Grpc::new(channel);
                Self { inner }
            }

            /// List the resources assigned to every pod on the node
            pub async fn list(
                &mut self,
                request: impl tonic::IntoRequest<ListPodResourcesRequest>,
            ) -> Result<tonic::Response<ListPodResourcesResponse>, tonic::Status> {
                self.inner.ready().await.map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("Service was not ready: {}", e),
                    )
                })?;
                let codec = tonic::codec::ProstCodec::default();
                let path =
                    http::uri::PathAndQuery::from_static("/v1alpha1.PodResourcesLister/List");
                self.inner.unary(request.into_request(), path, codec).await
            }
        }
    }
}

pub use v1alpha1::pod_resources_lister_client::PodResourcesListerClient;
pub use v1alpha1::*;
