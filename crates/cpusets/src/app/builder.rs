use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::allocation::AllocationEngine;
use crate::app::core::Application;
use crate::app::services::AgentServices;
use crate::app::services::ControllerServices;
use crate::cgroup;
use crate::checkpoint::CheckpointReader;
use crate::config::ControllerArgs;
use crate::config::DevicePluginArgs;
use crate::config::NodeArgs;
use crate::config::PoolArgs;
use crate::config::WebhookArgs;
use crate::controller::CpusetController;
use crate::controller::PodWatcher;
use crate::controller::Reconciler;
use crate::controller::WorkQueue;
use crate::controller::CONFIGURED_MARKER_SUFFIX;
use crate::cpuset::CpuSet;
use crate::device_plugin::DevicePluginManager;
use crate::k8s;
use crate::k8s::KubePodClient;
use crate::k8s::PodClient;
use crate::pool::PoolConfig;
use crate::topology::NodeTopology;
use crate::webhook::PodMutator;
use crate::webhook::TlsFiles;
use crate::webhook::WebhookServer;

/// Application builder
pub(crate) struct ApplicationBuilder {
    cancellation_token: CancellationToken,
}

impl ApplicationBuilder {
    pub(crate) fn new() -> Self {
        Self {
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Build the cpuset controller agent
    pub(crate) async fn build_controller(self, args: ControllerArgs) -> Result<Application> {
        tracing::info!("Building controller components...");

        let client = init_client(&args.node).await?;
        let pool_config = load_node_pool_config(client.clone(), &args.node, &args.pool).await?;
        let topology = discover_topology().await?;
        let full_cpuset = discover_node_cpuset(&args.cpuset_root).await?;
        tracing::info!(%full_cpuset, "Unconstrained cpuset of this node");

        let base = &args.pool.resource_base_name;
        let node_name = &args.node.node_name;
        let engine = Arc::new(AllocationEngine::new(
            Arc::new(pool_config),
            Arc::new(topology),
            CheckpointReader::new(&args.checkpoint_path),
            base,
        ));
        let pods: Arc<dyn PodClient> = Arc::new(KubePodClient::new(client.clone()));

        let controller = Arc::new(CpusetController::new(
            pods.clone(),
            engine.clone(),
            node_name,
            &args.cpuset_root,
            format!("{base}/{CONFIGURED_MARKER_SUFFIX}"),
            args.retry_policy(),
            self.cancellation_token.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            pods,
            engine,
            node_name,
            &args.cpuset_root,
            full_cpuset,
            args.reconcile_interval(),
        ));

        let services = ControllerServices {
            watcher: Arc::new(PodWatcher::new(client, node_name)),
            queue: Arc::new(WorkQueue::new(args.queue_capacity)),
            controller,
            reconciler,
            workers: args.workers,
        };
        Ok(Application::new(
            AgentServices::Controller(services),
            self.cancellation_token,
        ))
    }

    /// Build the device plugin agent
    pub(crate) async fn build_device_plugin(self, args: DevicePluginArgs) -> Result<Application> {
        tracing::info!("Building device plugin components...");

        let client = init_client(&args.node).await?;
        let pool_config = load_node_pool_config(client, &args.node, &args.pool).await?;
        pool_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid pool configuration: {e:?}"))?;
        let topology = discover_topology().await?;

        let manager = DevicePluginManager::new(
            Arc::new(pool_config),
            Arc::new(topology),
            &args.pool.resource_base_name,
            &args.plugin_dir,
        );
        Ok(Application::new(
            AgentServices::DevicePlugin(Arc::new(manager)),
            self.cancellation_token,
        ))
    }

    /// Build the admission webhook agent
    pub(crate) fn build_webhook(self, args: WebhookArgs) -> Application {
        tracing::info!("Building webhook components...");

        let mutator = PodMutator::new(
            &args.pool.resource_base_name,
            &args.process_starter_path,
            args.cfs_quotas,
            args.pool.loader(),
        );
        let server = WebhookServer::new(
            mutator,
            &args.listen_addr,
            TlsFiles {
                cert: args.tls_cert_file,
                key: args.tls_private_key_file,
            },
        );
        Application::new(AgentServices::Webhook(server), self.cancellation_token)
    }
}

async fn init_client(node: &NodeArgs) -> Result<Client> {
    k8s::init_kube_client(node.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))
}

/// Selects the pool configuration file matching the labels of this node.
async fn load_node_pool_config(
    client: Client,
    node: &NodeArgs,
    pool: &PoolArgs,
) -> Result<PoolConfig> {
    let labels = k8s::node_labels(client, &node.node_name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read node labels: {e:?}"))?;
    let pool_config = pool
        .loader()
        .load_for_node(labels.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to load pool configuration: {e:?}"))?;
    tracing::info!(
        node_name = %node.node_name,
        pools = ?pool_config.pools.keys().collect::<Vec<_>>(),
        "Loaded pool configuration"
    );
    Ok(pool_config)
}

async fn discover_topology() -> Result<NodeTopology> {
    tokio::task::spawn_blocking(NodeTopology::discover)
        .await
        .context("Topology discovery task failed")
}

async fn discover_node_cpuset(cpuset_root: &Path) -> Result<CpuSet> {
    let root = cpuset_root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        cgroup::node_cpuset(Path::new(cgroup::ONLINE_CPUS_FILE), &root)
    })
    .await
    .context("Node cpuset discovery task failed")?
    .map_err(|e| anyhow::anyhow!("Failed to determine the cores of this node: {e:?}"))
}
