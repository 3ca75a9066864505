use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Api;
use kube::Client;
use tracing::warn;

use crate::k8s::KubernetesError;

const LIST_RETRIES: usize = 3;
const LIST_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Pod operations used by the cpuset controller.
#[async_trait::async_trait]
pub(crate) trait PodClient: Send + Sync {
    /// Reads the current state of a pod from the API server.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>>;

    /// Lists every pod bound to `node_name`.
    async fn list_node_pods(&self, node_name: &str) -> Result<Vec<Pod>, Report<KubernetesError>>;

    /// Sets a single annotation with a JSON merge patch.
    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Report<KubernetesError>>;
}

pub(crate) struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PodClient for KubePodClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.get(name)
            .await
            .change_context(KubernetesError::PodNotFound {
                pod_name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    async fn list_node_pods(&self, node_name: &str) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));

        let mut attempt = 0;
        loop {
            match pods.list(&params).await {
                Ok(list) => return Ok(list.items),
                Err(e) if attempt + 1 < LIST_RETRIES => {
                    warn!(node_name, attempt, "Listing node pods failed, retrying: {e}");
                    attempt += 1;
                    tokio::time::sleep(LIST_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(Report::new(e).change_context(KubernetesError::ListFailed {
                        node_name: node_name.to_string(),
                    }))
                }
            }
        }
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Report<KubernetesError>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    key: value
                }
            }
        });
        pods.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::PatchFailed {
                pod_name: name.to_string(),
                namespace: namespace.to_string(),
            })?;
        Ok(())
    }
}
