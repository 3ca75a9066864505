use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ControllerError;
use crate::allocation::AllocationEngine;
use crate::cgroup;
use crate::cpuset::CpuSet;
use crate::k8s::pod;
use crate::k8s::PodClient;

/// Periodically re-pins containers whose cpuset was reset to all cores.
///
/// Only leaves still at the unconstrained set are rewritten; any other value
/// is assumed to be correct and left alone.
pub(crate) struct Reconciler {
    pods: Arc<dyn PodClient>,
    engine: Arc<AllocationEngine>,
    node_name: String,
    cpuset_root: PathBuf,
    full_cpuset: CpuSet,
    interval: Duration,
}

impl Reconciler {
    pub(crate) fn new(
        pods: Arc<dyn PodClient>,
        engine: Arc<AllocationEngine>,
        node_name: impl Into<String>,
        cpuset_root: impl Into<PathBuf>,
        full_cpuset: CpuSet,
        interval: Duration,
    ) -> Self {
        Self {
            pods,
            engine,
            node_name: node_name.into(),
            cpuset_root: cpuset_root.into(),
            full_cpuset,
            interval,
        }
    }

    #[tracing::instrument(skip(self, token), fields(node_name = %self.node_name))]
    pub(crate) async fn run(&self, token: CancellationToken) {
        info!(interval = ?self.interval, "Starting cpuset reconciliation");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Cpuset reconciliation stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(0) => {}
                        Ok(fixed) => info!(fixed, "Re-applied reset cpusets"),
                        Err(e) => warn!("Cpuset reconciliation failed: {e:?}"),
                    }
                }
            }
        }
    }

    /// One pass over the node's pods. Returns the number of rewritten leaves.
    pub(crate) async fn reconcile_once(&self) -> Result<usize, Report<ControllerError>> {
        let pods = self
            .pods
            .list_node_pods(&self.node_name)
            .await
            .change_context(ControllerError::ListFailed {
                node_name: self.node_name.clone(),
            })?;

        let root = self.cpuset_root.clone();
        let leaves = tokio::task::spawn_blocking(move || cgroup::leaf_cpusets(&root))
            .await
            .change_context(ControllerError::BlockingTaskFailed)?;

        let mut fixed = 0;
        for pod in pods.iter().filter(|pod| !pod::is_terminal(pod)) {
            for container in pod.spec.iter().flat_map(|spec| spec.containers.iter()) {
                let Some(container_id) = pod::container_id(pod, &container.name) else {
                    continue;
                };
                let Some(leaf) = leaves
                    .iter()
                    .find(|leaf| leaf.to_string_lossy().contains(container_id.as_str()))
                else {
                    continue;
                };

                match self.reconcile_container(pod, container, leaf).await {
                    Ok(true) => fixed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        pod = pod::name(pod),
                        container = %container.name,
                        "Failed to reconcile container cpuset: {e:?}"
                    ),
                }
            }
        }
        Ok(fixed)
    }

    async fn reconcile_container(
        &self,
        pod: &Pod,
        container: &Container,
        leaf: &Path,
    ) -> Result<bool, Report<ControllerError>> {
        let apply_failed = || ControllerError::ApplyFailed {
            container: container.name.clone(),
        };

        let dir = leaf.to_path_buf();
        let current = tokio::task::spawn_blocking(move || cgroup::read_cpuset(&dir))
            .await
            .change_context(ControllerError::BlockingTaskFailed)?
            .change_context_lazy(apply_failed)?;
        if current != self.full_cpuset {
            return Ok(false);
        }

        let cpus = self
            .engine
            .compute_cpuset(pod::uid(pod), container)
            .await
            .change_context(ControllerError::ComputeFailed {
                container: container.name.clone(),
            })?;
        if cpus.is_empty() {
            return Ok(false);
        }

        debug!(leaf = %leaf.display(), cpus = %cpus, "Cpuset was reset, re-applying");
        let dir = leaf.to_path_buf();
        tokio::task::spawn_blocking(move || cgroup::write_cpuset(&dir, &cpus))
            .await
            .change_context(ControllerError::BlockingTaskFailed)?
            .change_context_lazy(apply_failed)?;
        Ok(true)
    }
}
