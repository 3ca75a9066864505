//! Kubernetes integration.
//!
//! - [`PodClient`]: the pod operations the controller needs, behind a trait
//!   so the controller can be exercised without an API server
//! - [`KubePodClient`]: the `kube` backed implementation
//! - [`pod`]: helpers reading container IDs and readiness out of pod status

pub(crate) mod kube_client;
#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod pod;
pub(crate) mod pod_client;
pub(crate) mod types;

pub(crate) use kube_client::init_kube_client;
pub(crate) use kube_client::node_labels;
pub(crate) use pod_client::KubePodClient;
pub(crate) use pod_client::PodClient;
pub(crate) use types::KubernetesError;
