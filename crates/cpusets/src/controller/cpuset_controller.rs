use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::work_queue::WorkQueue;
use super::ControllerError;
use super::PodKey;
use super::RetryPolicy;
use crate::allocation::AllocationEngine;
use crate::cgroup;
use crate::k8s::pod;
use crate::k8s::PodClient;

/// What happened to a queued pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PodOutcome {
    Applied,
    Skipped,
    NotReady,
    RetryExhausted,
    Cancelled,
}

/// Pins the containers of newly seen pods to their pool cores.
pub(crate) struct CpusetController {
    pods: Arc<dyn PodClient>,
    engine: Arc<AllocationEngine>,
    node_name: String,
    cpuset_root: PathBuf,
    marker_key: String,
    retry: RetryPolicy,
    token: CancellationToken,
}

impl CpusetController {
    pub(crate) fn new(
        pods: Arc<dyn PodClient>,
        engine: Arc<AllocationEngine>,
        node_name: impl Into<String>,
        cpuset_root: impl Into<PathBuf>,
        marker_key: impl Into<String>,
        retry: RetryPolicy,
        token: CancellationToken,
    ) -> Self {
        Self {
            pods,
            engine,
            node_name: node_name.into(),
            cpuset_root: cpuset_root.into(),
            marker_key: marker_key.into(),
            retry,
            token,
        }
    }

    /// Spawns `count` workers draining `queue` until it is shut down and empty.
    pub(crate) fn spawn_workers(
        self: &Arc<Self>,
        queue: Arc<WorkQueue<PodKey>>,
        count: usize,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let controller = self.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        let outcome = controller.process(&key).await;
                        debug!(worker, pod = %key.name, namespace = %key.namespace, ?outcome, "Processed pod");
                        queue.done(&key);
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect()
    }

    /// Runs one pod through eligibility, readiness polling and cpuset apply.
    ///
    /// The pod counts as applied once its cpusets are written and the
    /// completion marker is stored.
    #[tracing::instrument(skip(self, key), fields(pod = %key.name, namespace = %key.namespace))]
    pub(crate) async fn process(&self, key: &PodKey) -> PodOutcome {
        let pod = match self.wait_until_ready(key).await {
            Ok(pod) => pod,
            Err(outcome) => return outcome,
        };

        for attempt in 0..self.retry.max_retries {
            match self.apply(&pod).await {
                Ok(()) => {
                    info!("Applied cpusets to pod");
                    return PodOutcome::Applied;
                }
                Err(e) => {
                    debug!(attempt, "Applying cpusets failed, retrying: {e:?}");
                    if !self.pause().await {
                        return PodOutcome::Cancelled;
                    }
                }
            }
        }

        warn!(
            retries = self.retry.max_retries,
            "Giving up applying cpusets to pod"
        );
        PodOutcome::RetryExhausted
    }

    /// Re-reads the pod until every container has a runtime ID.
    async fn wait_until_ready(&self, key: &PodKey) -> Result<Pod, PodOutcome> {
        for _ in 0..self.retry.max_retries {
            let pod = match self.pods.get_pod(&key.namespace, &key.name).await {
                Ok(pod) => pod,
                Err(e) => {
                    warn!("Failed to refresh pod: {e:?}");
                    return Err(PodOutcome::Skipped);
                }
            };

            if pod::is_terminal(&pod) {
                debug!(phase = ?pod::phase(&pod), "Pod is terminal, skipping");
                return Err(PodOutcome::Skipped);
            }
            if pod::node_name(&pod).is_some_and(|node| node != self.node_name) {
                debug!("Pod is scheduled to another node, skipping");
                return Err(PodOutcome::Skipped);
            }
            if pod::annotation(&pod, &self.marker_key).is_some() {
                debug!("Pod cpusets already configured, skipping");
                return Err(PodOutcome::Skipped);
            }
            if pod::is_ready_for_processing(&pod) {
                return Ok(pod);
            }

            if !self.pause().await {
                return Err(PodOutcome::Cancelled);
            }
        }

        warn!(
            retries = self.retry.max_retries,
            "Pod containers never got runtime IDs, abandoning"
        );
        Err(PodOutcome::NotReady)
    }

    /// Sleeps one retry interval. Returns `false` when shutdown was requested.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(self.retry.interval) => true,
        }
    }

    async fn apply(&self, pod: &Pod) -> Result<(), Report<ControllerError>> {
        let pod_uid = pod::uid(pod);
        let container_ids = pod::container_ids(pod);
        let mut container_dir = None;

        for container in pod.spec.iter().flat_map(|spec| spec.containers.iter()) {
            let Some(container_id) = pod::container_id(pod, &container.name) else {
                continue;
            };
            let cpus = self
                .engine
                .compute_cpuset(pod_uid, container)
                .await
                .change_context(ControllerError::ComputeFailed {
                    container: container.name.clone(),
                })?;

            let root = self.cpuset_root.clone();
            let dir = tokio::task::spawn_blocking(move || {
                cgroup::apply_to_container(&root, &container_id, &cpus)
            })
            .await
            .change_context(ControllerError::BlockingTaskFailed)?
            .change_context(ControllerError::ApplyFailed {
                container: container.name.clone(),
            })?;
            if dir.is_some() {
                container_dir = dir;
            }
        }

        if let Some(container_dir) = container_dir {
            let cpus = self.engine.default_cpuset();
            tokio::task::spawn_blocking(move || {
                cgroup::apply_to_infra_container(&container_dir, &container_ids, &cpus)
            })
            .await
            .change_context(ControllerError::BlockingTaskFailed)?
            .change_context(ControllerError::InfraApplyFailed {
                pod: pod::name(pod).to_string(),
            })?;
        }

        // cgroup writes are overwrites, so a failed mark replays them safely
        self.pods
            .annotate_pod(pod::namespace(pod), pod::name(pod), &self.marker_key, "true")
            .await
            .change_context(ControllerError::MarkFailed {
                pod: pod::name(pod).to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::checkpoint::CheckpointReader;
    use crate::cgroup::CPUSET_FILE;
    use crate::cpuset::CpuSet;
    use crate::k8s::mock::MockPodClient;
    use crate::k8s::pod::fixtures::container;
    use crate::k8s::pod::fixtures::pending;
    use crate::k8s::pod::fixtures::pod;
    use crate::pool::Pool;
    use crate::pool::PoolConfig;
    use crate::topology::NodeTopology;

    const MARKER: &str = "cmss.cn/cpusets-configured";

    struct Fixture {
        root: tempfile::TempDir,
        pods: Arc<MockPodClient>,
        controller: CpusetController,
    }

    fn engine() -> Arc<AllocationEngine> {
        let mut pools = BTreeMap::new();
        pools.insert(
            "default".to_string(),
            Pool {
                cpus: "0,1".parse().unwrap(),
                ..Default::default()
            },
        );
        pools.insert(
            "shared_caas".to_string(),
            Pool {
                cpus: "2,3".parse().unwrap(),
                ..Default::default()
            },
        );
        let config = PoolConfig {
            pools,
            node_selector: BTreeMap::new(),
        };
        Arc::new(AllocationEngine::new(
            Arc::new(config),
            Arc::new(NodeTopology::default()),
            CheckpointReader::new("/nonexistent/checkpoint"),
            "cmss.cn",
        ))
    }

    /// kubepods/pod-web/{app-id, pause-id}, every file at "0-7"
    fn fixture(max_retries: usize) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        for dir in ["app-id", "pause-id"] {
            let path = root.path().join("kubepods/pod-web").join(dir);
            fs::create_dir_all(&path).unwrap();
            fs::write(path.join(CPUSET_FILE), "0-7").unwrap();
        }
        let pods = Arc::new(MockPodClient::new());
        let controller = CpusetController::new(
            pods.clone(),
            engine(),
            "node-1",
            root.path(),
            MARKER,
            RetryPolicy {
                max_retries,
                interval: Duration::from_millis(1),
            },
            CancellationToken::new(),
        );
        Fixture {
            root,
            pods,
            controller,
        }
    }

    fn cpuset_of(root: &Path, dir: &str) -> CpuSet {
        cgroup::read_cpuset(&root.join("kubepods/pod-web").join(dir)).unwrap()
    }

    fn web() -> Pod {
        pod(
            "web",
            "node-1",
            vec![container("app", &[("cmss.cn/shared_caas", "200")])],
        )
    }

    #[test(tokio::test)]
    async fn applies_cpusets_and_marks_pod() {
        let f = fixture(3);
        let web = web();
        f.pods.set_pod_states(vec![web.clone()]);

        let outcome = f.controller.process(&PodKey::from_pod(&web)).await;

        assert_eq!(outcome, PodOutcome::Applied);
        assert_eq!(cpuset_of(f.root.path(), "app-id").to_string(), "2,3");
        assert_eq!(cpuset_of(f.root.path(), "pause-id").to_string(), "0,1");
        assert_eq!(
            f.pods.annotations(),
            vec![(
                "default".to_string(),
                "web".to_string(),
                MARKER.to_string(),
                "true".to_string()
            )]
        );
    }

    #[test(tokio::test)]
    async fn failed_mark_is_retried() {
        let f = fixture(3);
        let web = web();
        f.pods.set_pod_states(vec![web.clone()]);
        f.pods.fail_next_annotations(1);

        let outcome = f.controller.process(&PodKey::from_pod(&web)).await;

        assert_eq!(outcome, PodOutcome::Applied);
        assert_eq!(f.pods.annotations().len(), 1);
        assert_eq!(cpuset_of(f.root.path(), "app-id").to_string(), "2,3");
    }

    #[test(tokio::test)]
    async fn pod_is_not_applied_until_marked() {
        let f = fixture(2);
        let web = web();
        f.pods.set_pod_states(vec![web.clone()]);
        f.pods.fail_next_annotations(2);

        let outcome = f.controller.process(&PodKey::from_pod(&web)).await;

        assert_eq!(outcome, PodOutcome::RetryExhausted);
        assert!(f.pods.annotations().is_empty());
    }

    #[test(tokio::test)]
    async fn waits_for_container_ids() {
        let f = fixture(5);
        let web = web();
        f.pods
            .set_pod_states(vec![pending(web.clone()), pending(web.clone()), web.clone()]);

        let outcome = f.controller.process(&PodKey::from_pod(&web)).await;

        assert_eq!(outcome, PodOutcome::Applied);
        assert_eq!(f.pods.get_calls(), 3);
    }

    #[test(tokio::test)]
    async fn abandons_pod_that_never_gets_ready() {
        let f = fixture(3);
        let web = web();
        f.pods.set_pod_states(vec![pending(web.clone())]);

        let outcome = f.controller.process(&PodKey::from_pod(&web)).await;

        assert_eq!(outcome, PodOutcome::NotReady);
        assert_eq!(f.pods.get_calls(), 3);
        assert_eq!(cpuset_of(f.root.path(), "app-id").to_string(), "0-7");
    }

    #[test(tokio::test)]
    async fn skips_terminal_and_foreign_pods() {
        let f = fixture(3);

        let mut done = web();
        done.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        f.pods.set_pod_states(vec![done.clone()]);
        assert_eq!(
            f.controller.process(&PodKey::from_pod(&done)).await,
            PodOutcome::Skipped
        );

        let foreign = pod("web", "node-2", vec![container("app", &[])]);
        f.pods.set_pod_states(vec![foreign.clone()]);
        assert_eq!(
            f.controller.process(&PodKey::from_pod(&foreign)).await,
            PodOutcome::Skipped
        );

        assert!(f.pods.annotations().is_empty());
        assert_eq!(cpuset_of(f.root.path(), "app-id").to_string(), "0-7");
    }

    #[test(tokio::test)]
    async fn skips_already_configured_pod() {
        let f = fixture(3);
        let mut web = web();
        web.metadata.annotations = Some(BTreeMap::from([(
            MARKER.to_string(),
            "true".to_string(),
        )]));
        f.pods.set_pod_states(vec![web.clone()]);

        assert_eq!(
            f.controller.process(&PodKey::from_pod(&web)).await,
            PodOutcome::Skipped
        );
    }

    #[test(tokio::test)]
    async fn unknown_pod_is_skipped() {
        let f = fixture(3);
        let key = PodKey::from_pod(&web());
        assert_eq!(f.controller.process(&key).await, PodOutcome::Skipped);
    }

    #[test(tokio::test)]
    async fn missing_cgroup_exhausts_retries() {
        let f = fixture(2);
        let ghost = pod(
            "ghost",
            "node-1",
            vec![container("sidecar", &[("cmss.cn/shared_caas", "100")])],
        );
        f.pods.set_pod_states(vec![ghost.clone()]);

        assert_eq!(
            f.controller.process(&PodKey::from_pod(&ghost)).await,
            PodOutcome::RetryExhausted
        );
        assert!(f.pods.annotations().is_empty());
    }

    #[test(tokio::test)]
    async fn workers_drain_queue() {
        let f = fixture(3);
        let web = web();
        f.pods.set_pod_states(vec![web.clone()]);
        let controller = Arc::new(f.controller);
        let queue = Arc::new(WorkQueue::new(4));

        queue.add(PodKey::from_pod(&web)).await;
        queue.shut_down();
        for worker in controller.spawn_workers(queue, 2) {
            worker.await.unwrap();
        }

        assert_eq!(f.pods.annotations().len(), 1);
        assert_eq!(cpuset_of(f.root.path(), "app-id").to_string(), "2,3");
    }
}
