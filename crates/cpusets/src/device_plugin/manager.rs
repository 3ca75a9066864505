use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::plugin::CpuDevicePlugin;
use super::DevicePluginError;
use super::KUBELET_SOCKET;
use crate::pool::PoolConfig;
use crate::pool::PoolType;
use crate::topology::NodeTopology;

/// Runs one device plugin per non-default pool and restarts them all when
/// the kubelet comes back.
pub(crate) struct DevicePluginManager {
    pool_config: Arc<PoolConfig>,
    topology: Arc<NodeTopology>,
    resource_base_name: String,
    plugin_dir: PathBuf,
}

impl DevicePluginManager {
    pub(crate) fn new(
        pool_config: Arc<PoolConfig>,
        topology: Arc<NodeTopology>,
        resource_base_name: impl Into<String>,
        plugin_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pool_config,
            topology,
            resource_base_name: resource_base_name.into(),
            plugin_dir: plugin_dir.into(),
        }
    }

    fn kubelet_socket(&self) -> PathBuf {
        self.plugin_dir.join(KUBELET_SOCKET)
    }

    /// One plugin per pool that is not a default pool, in pool name order.
    pub(crate) fn plugins(&self) -> Vec<Arc<CpuDevicePlugin>> {
        self.pool_config
            .pools
            .iter()
            .filter(|(name, _)| PoolType::from_pool_name(name) != PoolType::Default)
            .map(|(name, pool)| {
                CpuDevicePlugin::new(
                    name.as_str(),
                    &self.resource_base_name,
                    pool.clone(),
                    self.topology.clone(),
                )
            })
            .collect()
    }

    /// Serves and registers every plugin until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`DevicePluginError::WatchFailed`] if the kubelet socket cannot be watched
    /// - [`DevicePluginError::CleanupFailed`] if a stale socket cannot be removed
    #[tracing::instrument(skip(self, token), fields(plugin_dir = %self.plugin_dir.display()))]
    pub(crate) async fn run(&self, token: CancellationToken) -> Result<(), Report<DevicePluginError>> {
        let (restart_tx, mut restart_rx) = mpsc::unbounded_channel();
        let _watcher = self.watch_kubelet_socket(restart_tx)?;

        loop {
            remove_stale_sockets(&self.plugin_dir)?;

            let plugins_token = token.child_token();
            self.start_plugins(&plugins_token).await;

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Device plugins shutting down");
                    plugins_token.cancel();
                    break;
                }
                restarted = restart_rx.recv() => {
                    plugins_token.cancel();
                    if restarted.is_none() {
                        warn!("Kubelet socket watcher stopped");
                        break;
                    }
                    info!("Kubelet restarted, re-registering device plugins");
                    // collapse bursts of socket events into one restart
                    while restart_rx.try_recv().is_ok() {}
                }
            }
        }

        remove_stale_sockets(&self.plugin_dir)?;
        Ok(())
    }

    async fn start_plugins(&self, token: &CancellationToken) {
        let kubelet_socket = self.kubelet_socket();
        for plugin in self.plugins() {
            if let Err(e) = plugin.start(&self.plugin_dir, token.child_token()).await {
                error!(resource = plugin.resource_name(), "Failed to start device plugin: {e:?}");
                continue;
            }
            if let Err(e) = plugin.register_with_kubelet(&kubelet_socket).await {
                error!(resource = plugin.resource_name(), "Failed to register device plugin: {e:?}");
            }
        }
    }

    fn watch_kubelet_socket(
        &self,
        restart_tx: mpsc::UnboundedSender<()>,
    ) -> Result<RecommendedWatcher, Report<DevicePluginError>> {
        let kubelet_socket = self.kubelet_socket();
        let watch_failed = || DevicePluginError::WatchFailed {
            path: self.plugin_dir.display().to_string(),
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if is_kubelet_restart(&event, &kubelet_socket) {
                        let _ = restart_tx.send(());
                    }
                }
                Err(e) => error!("Device plugin directory watch error: {e:?}"),
            },
            Config::default(),
        )
        .change_context_lazy(watch_failed)?;
        watcher
            .watch(&self.plugin_dir, RecursiveMode::NonRecursive)
            .change_context_lazy(watch_failed)?;
        Ok(watcher)
    }
}

fn is_kubelet_restart(event: &Event, kubelet_socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|p| p == kubelet_socket)
}

/// Removes plugin sockets left behind by a previous run.
pub(crate) fn remove_stale_sockets(plugin_dir: &Path) -> Result<(), Report<DevicePluginError>> {
    let pattern = plugin_dir.join("cpudp_*.sock").display().to_string();
    let paths = glob::glob(&pattern).change_context(DevicePluginError::CleanupFailed {
        path: pattern.clone(),
    })?;
    for path in paths.filter_map(Result::ok) {
        debug!(path = %path.display(), "Removing stale plugin socket");
        std::fs::remove_file(&path).change_context(DevicePluginError::CleanupFailed {
            path: path.display().to_string(),
        })?;
    }
    Ok(())
}
