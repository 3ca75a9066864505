//! Desired cpuset of a container, derived from its pool resource requests.

use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Container;
use tracing::debug;

use crate::checkpoint::CheckpointReader;
use crate::cpuset::CpuSet;
use crate::pool::HtPolicy;
use crate::pool::PoolConfig;
use crate::pool::EXCLUSIVE_POOL_ID;
use crate::pool::SHARED_POOL_ID;
use crate::topology::NodeTopology;

#[derive(Debug, derive_more::Display)]
pub enum AllocationError {
    #[display("Failed to look up exclusive cores of {resource_name} for container {container}")]
    ExclusiveLookupFailed {
        resource_name: String,
        container: String,
    },
}

impl core::error::Error for AllocationError {}

pub struct AllocationEngine {
    pool_config: Arc<PoolConfig>,
    topology: Arc<NodeTopology>,
    checkpoint: CheckpointReader,
    resource_base_name: String,
}

impl AllocationEngine {
    pub fn new(
        pool_config: Arc<PoolConfig>,
        topology: Arc<NodeTopology>,
        checkpoint: CheckpointReader,
        resource_base_name: impl Into<String>,
    ) -> Self {
        Self {
            pool_config,
            topology,
            checkpoint,
            resource_base_name: resource_base_name.into(),
        }
    }

    /// Cores the default pool allows, used for containers without pool
    /// requests and for the infra container.
    pub fn default_cpuset(&self) -> CpuSet {
        self.pool_config.default_pool().cpus
    }

    /// Computes the cpuset of `container` in pod `pod_uid`.
    ///
    /// Shared requests contribute the shared pool, exclusive requests the
    /// cores recorded in the kubelet checkpoint. When neither contributes,
    /// the default pool applies. An empty result means the container keeps
    /// whatever cpuset the runtime gave it.
    pub async fn compute_cpuset(
        &self,
        pod_uid: &str,
        container: &Container,
    ) -> Result<CpuSet, Report<AllocationError>> {
        let shared_prefix = format!("{}/{SHARED_POOL_ID}", self.resource_base_name);
        let exclusive_prefix = format!("{}/{EXCLUSIVE_POOL_ID}", self.resource_base_name);

        let mut cpus = CpuSet::new();
        let requests = container
            .resources
            .as_ref()
            .and_then(|resources| resources.requests.as_ref());
        for resource_name in requests.into_iter().flat_map(|requests| requests.keys()) {
            if resource_name.starts_with(&shared_prefix) {
                cpus.extend(&self.pool_config.shared_pool().cpus);
            } else if resource_name.starts_with(&exclusive_prefix) {
                let exclusive = self
                    .exclusive_cores(pod_uid, &container.name, resource_name)
                    .await?;
                cpus.extend(&exclusive);
            }
        }

        if cpus.is_empty() {
            cpus = self.default_cpuset();
        }
        debug!(pod_uid, container = %container.name, cpus = %cpus, "Computed cpuset");
        Ok(cpus)
    }

    async fn exclusive_cores(
        &self,
        pod_uid: &str,
        container_name: &str,
        resource_name: &str,
    ) -> Result<CpuSet, Report<AllocationError>> {
        let cores = self
            .checkpoint
            .allocated_cores(resource_name, pod_uid, container_name)
            .await
            .change_context(AllocationError::ExclusiveLookupFailed {
                resource_name: resource_name.to_string(),
                container: container_name.to_string(),
            })?;

        let pool_name = resource_name
            .strip_prefix(&format!("{}/", self.resource_base_name))
            .unwrap_or(resource_name);
        if self.pool_config.select_pool(pool_name).ht_policy == HtPolicy::MultiThreaded {
            return Ok(self.topology.expand_with_siblings(&cores));
        }
        Ok(cores)
    }
}
