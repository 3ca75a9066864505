use k8s_openapi::api::core::v1::Pod;

/// Prefixes container runtimes put in front of `status.containerStatuses[].containerID`.
const CONTAINER_ID_PREFIXES: [&str; 3] = ["docker://", "containerd://", "cri-o://"];

pub(crate) fn trim_runtime_prefix(container_id: &str) -> &str {
    CONTAINER_ID_PREFIXES
        .iter()
        .find_map(|prefix| container_id.strip_prefix(prefix))
        .unwrap_or(container_id)
}

pub(crate) fn name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub(crate) fn namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

pub(crate) fn uid(pod: &Pod) -> &str {
    pod.metadata.uid.as_deref().unwrap_or_default()
}

pub(crate) fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}

pub(crate) fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Succeeded and failed pods have nothing left to pin.
pub(crate) fn is_terminal(pod: &Pod) -> bool {
    matches!(phase(pod), Some("Succeeded") | Some("Failed"))
}

pub(crate) fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata.annotations.as_ref()?.get(key).map(String::as_str)
}

/// Runtime ID of `container_name` with the runtime prefix removed.
pub(crate) fn container_id(pod: &Pod, container_name: &str) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|status| status.name == container_name)
        .and_then(|status| status.container_id.as_deref())
        .map(trim_runtime_prefix)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Every non-empty runtime ID recorded in the pod status.
pub(crate) fn container_ids(pod: &Pod) -> Vec<String> {
    pod.status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
        .filter_map(|status| status.container_id.as_deref())
        .map(trim_runtime_prefix)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// A pod is ready once it is bound to a node and every declared container has
/// a runtime ID in its status.
pub(crate) fn is_ready_for_processing(pod: &Pod) -> bool {
    if node_name(pod).map_or(true, str::is_empty) {
        return false;
    }
    let declared = pod.spec.as_ref().map_or(0, |spec| spec.containers.len());
    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref());
    match statuses {
        Some(statuses) => {
            statuses.len() == declared
                && statuses
                    .iter()
                    .all(|s| s.container_id.as_deref().is_some_and(|id| !id.is_empty()))
        }
        None => declared == 0,
    }
}
