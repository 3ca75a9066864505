use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::api::device_plugin_server::DevicePlugin;
use super::api::device_plugin_server::DevicePluginServer;
use super::api::registration_client::RegistrationClient;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::Device;
use super::api::DevicePluginOptions;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::NumaNode;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::api::RegisterRequest;
use super::api::TopologyInfo;
use super::DevicePluginError;
use super::API_VERSION;
use super::EXCLUSIVE_CPUS_ENV;
use super::SHARED_CPUS_ENV;
use super::SHARED_DEVICES_PER_CORE;
use crate::cpuset::CpuSet;
use crate::pool::HtPolicy;
use crate::pool::Pool;
use crate::pool::PoolType;
use crate::topology::NodeTopology;

const HEALTHY: &str = "Healthy";

/// Device plugin advertising the cores of one pool.
#[derive(Debug)]
pub(crate) struct CpuDevicePlugin {
    pool_name: String,
    /// e.g. "cmss.cn/exclusive_caas"
    resource_name: String,
    /// socket file name, relative to the device plugin directory
    endpoint: String,
    pool: Pool,
    pool_type: PoolType,
    topology: Arc<NodeTopology>,
    options: DevicePluginOptions,
}

impl CpuDevicePlugin {
    pub(crate) fn new(
        pool_name: impl Into<String>,
        resource_base_name: &str,
        pool: Pool,
        topology: Arc<NodeTopology>,
    ) -> Arc<Self> {
        let pool_name = pool_name.into();
        Arc::new(Self {
            resource_name: format!("{resource_base_name}/{pool_name}"),
            endpoint: super::socket_name(&pool_name),
            pool_type: PoolType::from_pool_name(&pool_name),
            pool_name,
            pool,
            topology,
            options: DevicePluginOptions::default(),
        })
    }

    pub(crate) fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Serves the plugin API on `<socket_dir>/<endpoint>` until `token` is cancelled.
    pub(crate) async fn start(
        self: &Arc<Self>,
        socket_dir: &Path,
        token: CancellationToken,
    ) -> Result<PathBuf, Report<DevicePluginError>> {
        let socket_path = socket_dir.join(&self.endpoint);
        let bind_failed = || DevicePluginError::BindFailed {
            path: socket_path.display().to_string(),
        };

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).change_context_lazy(bind_failed)?;
        }
        let listener = UnixListener::bind(&socket_path).change_context_lazy(bind_failed)?;

        let server = DevicePluginServer::new(DevicePluginService::new(self.clone(), token.clone()));
        let pool_name = self.pool_name.clone();
        info!(pool = %pool_name, socket = %socket_path.display(), "Serving device plugin");

        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(server)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        token.cancelled().await;
                    },
                )
                .await;
            match result {
                Ok(()) => info!(pool = %pool_name, "Device plugin server stopped"),
                Err(e) => error!(pool = %pool_name, "Device plugin server failed: {e}"),
            }
        });

        Ok(socket_path)
    }

    /// Registers the pool resource with the kubelet listening on `kubelet_socket`.
    pub(crate) async fn register_with_kubelet(
        &self,
        kubelet_socket: &Path,
    ) -> Result<(), Report<DevicePluginError>> {
        let channel = connect_uds(kubelet_socket).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource_name.clone(),
            options: Some(self.options),
        };
        client
            .register(Request::new(request))
            .await
            .change_context(DevicePluginError::RegistrationFailed {
                resource_name: self.resource_name.clone(),
            })?;

        info!(resource = %self.resource_name, "Registered device plugin with kubelet");
        Ok(())
    }

    /// Devices advertised to the kubelet.
    ///
    /// Exclusive pools expose one device per core; shared pools expose a
    /// large synthetic count so that the quantity never runs out.
    pub(crate) fn devices(&self) -> Vec<Device> {
        match self.pool_type {
            PoolType::Shared => {
                let count = self.pool.cpus.len() as u32 * SHARED_DEVICES_PER_CORE;
                (0..count)
                    .map(|id| Device {
                        id: id.to_string(),
                        health: HEALTHY.to_string(),
                        topology: None,
                    })
                    .collect()
            }
            _ => self
                .pool
                .cpus
                .iter()
                .map(|core| Device {
                    id: core.to_string(),
                    health: HEALTHY.to_string(),
                    topology: self.topology.numa_node(core).map(|node| TopologyInfo {
                        nodes: vec![NumaNode { id: i64::from(node) }],
                    }),
                })
                .collect(),
        }
    }

    /// Environment handed to a container granted `device_ids`.
    pub(crate) fn allocate_container(
        &self,
        device_ids: &[String],
    ) -> Result<ContainerAllocateResponse, Status> {
        let mut envs = HashMap::new();
        match self.pool_type {
            PoolType::Shared => {
                envs.insert(SHARED_CPUS_ENV.to_string(), self.pool.cpus.to_string());
            }
            _ => {
                let cpus: CpuSet = device_ids.join(",").parse().map_err(|e| {
                    Status::invalid_argument(format!("invalid device IDs {device_ids:?}: {e}"))
                })?;
                let cpus = match self.pool.ht_policy {
                    HtPolicy::MultiThreaded => self.topology.expand_with_siblings(&cpus),
                    HtPolicy::SingleThreaded => cpus,
                };
                envs.insert(EXCLUSIVE_CPUS_ENV.to_string(), cpus.to_string());
            }
        }
        Ok(ContainerAllocateResponse {
            envs,
            ..Default::default()
        })
    }
}

/// Opens a gRPC channel over a Unix domain socket.
pub(crate) async fn connect_uds(socket_path: &Path) -> Result<Channel, Report<DevicePluginError>> {
    let path = socket_path.to_path_buf();
    // the URL is a placeholder, the connector decides where to connect
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await.map(TokioIo::new) }
        }))
        .await
        .change_context(DevicePluginError::ConnectFailed {
            path: socket_path.display().to_string(),
        })
}

#[derive(Debug)]
pub(crate) struct DevicePluginService {
    plugin: Arc<CpuDevicePlugin>,
    token: CancellationToken,
}

impl DevicePluginService {
    pub(crate) fn new(plugin: Arc<CpuDevicePlugin>, token: CancellationToken) -> Self {
        Self { plugin, token }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(self.plugin.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let devices = self.plugin.devices();
        let token = self.token.clone();
        info!(
            pool = %self.plugin.pool_name,
            devices = devices.len(),
            "Advertising devices"
        );

        tokio::spawn(async move {
            if tx.send(Ok(ListAndWatchResponse { devices })).is_err() {
                debug!("ListAndWatch client went away");
                return;
            }
            // the stream stays open until the plugin stops
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tx.closed() => {}
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        let container_responses = request
            .container_requests
            .iter()
            .map(|container| {
                debug!(pool = %self.plugin.pool_name, devices = ?container.devices_ids, "Allocating");
                self.plugin.allocate_container(&container.devices_ids)
            })
            .collect::<Result<Vec<_>, Status>>()?;
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
