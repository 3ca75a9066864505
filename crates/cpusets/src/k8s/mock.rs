//! In-memory [`PodClient`] for controller tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;

use super::pod;
use super::KubernetesError;
use super::PodClient;

#[derive(Default)]
pub(crate) struct MockPodClient {
    /// successive `get_pod` answers per (namespace, name); the last one sticks
    pods: Mutex<HashMap<(String, String), VecDeque<Pod>>>,
    node_pods: Mutex<Vec<Pod>>,
    annotations: Mutex<Vec<(String, String, String, String)>>,
    /// number of upcoming `annotate_pod` calls that fail
    annotate_failures: Mutex<usize>,
    get_calls: Mutex<usize>,
}

impl MockPodClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues `states` as the answers to successive `get_pod` calls.
    pub(crate) fn set_pod_states(&self, states: Vec<Pod>) {
        let Some(first) = states.first() else {
            return;
        };
        let key = (
            pod::namespace(first).to_string(),
            pod::name(first).to_string(),
        );
        self.pods.lock().unwrap().insert(key, states.into());
    }

    pub(crate) fn set_node_pods(&self, pods: Vec<Pod>) {
        *self.node_pods.lock().unwrap() = pods;
    }

    /// Recorded `(namespace, name, key, value)` annotations.
    pub(crate) fn annotations(&self) -> Vec<(String, String, String, String)> {
        self.annotations.lock().unwrap().clone()
    }

    /// Makes the next `count` `annotate_pod` calls fail without recording.
    pub(crate) fn fail_next_annotations(&self, count: usize) {
        *self.annotate_failures.lock().unwrap() = count;
    }

    pub(crate) fn get_calls(&self) -> usize {
        *self.get_calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl PodClient for MockPodClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        *self.get_calls.lock().unwrap() += 1;
        let mut pods = self.pods.lock().unwrap();
        let states = pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| {
                Report::new(KubernetesError::PodNotFound {
                    pod_name: name.to_string(),
                    namespace: namespace.to_string(),
                })
            })?;
        let pod = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        };
        pod.ok_or_else(|| {
            Report::new(KubernetesError::PodNotFound {
                pod_name: name.to_string(),
                namespace: namespace.to_string(),
            })
        })
    }

    async fn list_node_pods(&self, node_name: &str) -> Result<Vec<Pod>, Report<KubernetesError>> {
        Ok(self
            .node_pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| pod::node_name(p) == Some(node_name))
            .cloned()
            .collect())
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Report<KubernetesError>> {
        {
            let mut failures = self.annotate_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Report::new(KubernetesError::PatchFailed {
                    pod_name: name.to_string(),
                    namespace: namespace.to_string(),
                }));
            }
        }
        self.annotations.lock().unwrap().push((
            namespace.to_string(),
            name.to_string(),
            key.to_string(),
            value.to_string(),
        ));
        Ok(())
    }
}
