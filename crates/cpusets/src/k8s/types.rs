use thiserror::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub(crate) enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to watch pods: {message}")]
    WatchFailed { message: String },
    #[error("Pod not found: {pod_name} in namespace {namespace}")]
    PodNotFound { pod_name: String, namespace: String },
    #[error("Failed to list pods on node {node_name}")]
    ListFailed { node_name: String },
    #[error("Failed to patch pod {pod_name} in namespace {namespace}")]
    PatchFailed { pod_name: String, namespace: String },
    #[error("Failed to get node {node_name}")]
    NodeLookupFailed { node_name: String },
}
