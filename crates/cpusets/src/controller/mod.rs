//! The cpuset controller agent: pins containers of pods on this node.

mod cpuset_controller;
mod reconcile;
mod watcher;
mod work_queue;

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;

pub(crate) use cpuset_controller::CpusetController;
pub(crate) use reconcile::Reconciler;
pub(crate) use watcher::PodWatcher;
pub(crate) use work_queue::WorkQueue;

use crate::k8s::pod;

/// Annotation key suffix of the completion marker.
pub const CONFIGURED_MARKER_SUFFIX: &str = "cpusets-configured";

#[derive(Debug, derive_more::Display)]
pub enum ControllerError {
    #[display("Failed to compute cpuset of container {container}")]
    ComputeFailed { container: String },
    #[display("Failed to apply cpuset of container {container}")]
    ApplyFailed { container: String },
    #[display("Failed to apply cpuset of the infra container of pod {pod}")]
    InfraApplyFailed { pod: String },
    #[display("Blocking cgroup task failed")]
    BlockingTaskFailed,
    #[display("Failed to list pods of node {node_name}")]
    ListFailed { node_name: String },
    #[display("Failed to mark pod {pod} as configured")]
    MarkFailed { pod: String },
}

impl core::error::Error for ControllerError {}

/// Bounded retry with a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 150,
            interval: Duration::from_millis(200),
        }
    }
}

/// Identity of a queued pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PodKey {
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub(crate) fn from_pod(pod: &Pod) -> Self {
        Self {
            uid: pod::uid(pod).to_string(),
            namespace: pod::namespace(pod).to_string(),
            name: pod::name(pod).to_string(),
        }
    }
}
