//! Pod mutation: CFS limits, pool environment and the pinning entrypoint.

use std::collections::BTreeMap;

use json_patch::AddOperation;
use json_patch::PatchOperation;
use json_patch::ReplaceOperation;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use serde_json::json;
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::annotation::AnnotationError;
use crate::annotation::CpuAnnotation;
use crate::annotation::CPU_ANNOTATION_SUFFIX;
use crate::pool::PoolType;
use crate::pool::EXCLUSIVE_POOL_ID;
use crate::pool::SHARED_POOL_ID;
use crate::pool_config::PoolConfigLoader;

pub const CPU_POOLS_ENV: &str = "CPU_POOLS";
pub const CONTAINER_NAME_ENV: &str = "CONTAINER_NAME";
pub const PODINFO_VOLUME: &str = "podinfo";
pub const PODINFO_MOUNT_PATH: &str = "/etc/podinfo";
pub const HOSTBIN_VOLUME: &str = "hostbin";

/// Which containers get CFS quotas provisioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CfsQuotas {
    /// Every container with pool requests.
    #[default]
    All,
    /// Only containers using shared pools.
    Shared,
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Annotation(#[from] AnnotationError),
    #[error("Cannot convert cpu request {value} of {resource} to int")]
    InvalidQuantity { resource: String, value: String },
    #[error("Container {container} has no pool requests in pod spec")]
    NoPoolRequests { container: String },
    #[error("Shared CPU requests {requested} do not match to annotation {annotated}")]
    SharedMismatch { requested: u64, annotated: u64 },
    #[error("Container {container}; Pool {pool} in annotation not found from resources")]
    PoolNotRequested { container: String, pool: String },
    #[error("Exclusive CPU requests {requested} do not match to annotation {annotated}")]
    ExclusiveMismatch { requested: u64, annotated: u64 },
    #[error("CPU Annotation error")]
    NothingPinned,
}

/// Pool resources a container asks for in its limits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerPoolRequests {
    /// summed shared pool CPU time, in millicores
    pub shared: u64,
    /// summed exclusive pool cores
    pub exclusive: u64,
    /// pool name -> requested quantity
    pub pools: BTreeMap<String, u64>,
}

impl ContainerPoolRequests {
    fn shared_pool(&self) -> Option<&str> {
        self.pools
            .keys()
            .find(|name| PoolType::from_pool_name(name) == PoolType::Shared)
            .map(String::as_str)
    }

    fn cpu_pools_value(&self) -> &'static str {
        match (self.exclusive > 0, self.shared > 0) {
            (true, true) => "exclusive&shared",
            (true, false) => EXCLUSIVE_POOL_ID,
            _ => SHARED_POOL_ID,
        }
    }
}

pub struct PodMutator {
    resource_base_name: String,
    process_starter_path: String,
    cfs_quotas: CfsQuotas,
    pool_loader: PoolConfigLoader,
}

impl PodMutator {
    pub fn new(
        resource_base_name: impl Into<String>,
        process_starter_path: impl Into<String>,
        cfs_quotas: CfsQuotas,
        pool_loader: PoolConfigLoader,
    ) -> Self {
        Self {
            resource_base_name: resource_base_name.into(),
            process_starter_path: process_starter_path.into(),
            cfs_quotas,
            pool_loader,
        }
    }

    fn annotation_key(&self) -> String {
        format!("{}/{CPU_ANNOTATION_SUFFIX}", self.resource_base_name)
    }

    /// JSON patch operations that prepare `pod` for pinning.
    ///
    /// # Errors
    ///
    /// Any error denies admission of the pod.
    pub fn mutate(&self, pod: &Pod) -> Result<Vec<PatchOperation>, MutationError> {
        let annotation = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(&self.annotation_key()))
            .map(|value| CpuAnnotation::decode(value))
            .transpose()?;

        let requests = self.pool_requests(pod)?;
        if let Some(annotation) = &annotation {
            validate_annotation(&requests, annotation)?;
        }

        let empty = ContainerPoolRequests::default();
        let mut patches = Vec::new();
        let mut pinned = false;
        let containers = pod.spec.iter().flat_map(|spec| spec.containers.iter());
        for (index, container) in containers.enumerate() {
            let requests = requests.get(&container.name).unwrap_or(&empty);
            let annotated = annotation
                .as_ref()
                .is_some_and(|a| a.contains_container(&container.name));

            self.patch_cpu_limit(requests, index, container, &mut patches);

            let mut pinning_needed = annotated;
            if requests.exclusive > 0 {
                if container.command.as_ref().map_or(true, Vec::is_empty) && !annotated {
                    warn!(
                        container = %container.name,
                        "Container asked for exclusive cpus without a command, cpu affinity may be lost"
                    );
                } else {
                    pinning_needed = true;
                }
            }

            let mut env_patched = false;
            if pinning_needed {
                info!(container = %container.name, "Patching container for pinning");
                self.patch_container_for_pinning(annotated, index, container, &mut patches);
                pinned = true;
                env_patched = true;
            }
            if requests.shared > 0 || requests.exclusive > 0 {
                patch_pool_env(requests, env_patched, index, container, &mut patches);
            }
        }

        if pinned {
            let volumes = pod
                .spec
                .as_ref()
                .and_then(|spec| spec.volumes.as_ref());
            let exists = volumes.is_some_and(|volumes| {
                volumes
                    .iter()
                    .any(|v| v.name == HOSTBIN_VOLUME || v.name == PODINFO_VOLUME)
            });
            if !exists {
                let has_volumes = volumes.is_some_and(|volumes| !volumes.is_empty());
                self.patch_volumes(has_volumes, &mut patches);
            }
        } else if annotation.is_some() {
            return Err(MutationError::NothingPinned);
        }

        Ok(patches)
    }

    /// Pool requests per container, read from resource limits.
    pub fn pool_requests(
        &self,
        pod: &Pod,
    ) -> Result<BTreeMap<String, ContainerPoolRequests>, MutationError> {
        let base = format!("{}/", self.resource_base_name);
        let shared_prefix = format!("{base}{SHARED_POOL_ID}");
        let exclusive_prefix = format!("{base}{EXCLUSIVE_POOL_ID}");

        let mut requests: BTreeMap<String, ContainerPoolRequests> = BTreeMap::new();
        for container in pod.spec.iter().flat_map(|spec| spec.containers.iter()) {
            let limits = container
                .resources
                .as_ref()
                .and_then(|resources| resources.limits.as_ref());
            for (resource, quantity) in limits.into_iter().flatten() {
                let Some(pool_name) = resource.strip_prefix(&base) else {
                    continue;
                };
                let value = quantity.0.replacen('k', "000", 1).parse::<u64>().map_err(|_| {
                    MutationError::InvalidQuantity {
                        resource: resource.clone(),
                        value: quantity.0.clone(),
                    }
                })?;

                let entry = requests.entry(container.name.clone()).or_default();
                if resource.starts_with(&shared_prefix) {
                    entry.shared += value;
                }
                if resource.starts_with(&exclusive_prefix) {
                    entry.exclusive += value;
                }
                entry.pools.insert(pool_name.to_string(), value);
            }
        }
        Ok(requests)
    }

    fn patch_cpu_limit(
        &self,
        requests: &ContainerPoolRequests,
        index: usize,
        container: &Container,
        patches: &mut Vec<PatchOperation>,
    ) {
        let limit = if requests.exclusive > 0 && self.cfs_quotas == CfsQuotas::All {
            if requests.shared > 0 {
                // the whole shared pool, so shared bursts never throttle exclusive threads
                1000 * requests.exclusive + self.max_shared_pool_limit(requests, container)
            } else {
                1000 * requests.exclusive + 100
            }
        } else {
            requests.shared
        };
        if limit == 0 {
            return;
        }

        patches.push(replace(
            format!("/spec/containers/{index}/resources/limits/cpu"),
            json!(format!("{limit}m")),
        ));
        patches.push(replace(
            format!("/spec/containers/{index}/resources/requests/cpu"),
            json!("0m"),
        ));
    }

    /// Largest size, in millicores, of the container's shared pool across
    /// every node configuration.
    fn max_shared_pool_limit(&self, requests: &ContainerPoolRequests, container: &Container) -> u64 {
        let configs = match self.pool_loader.read_all() {
            Ok(configs) => configs,
            Err(e) => {
                warn!(
                    container = %container.name,
                    "Pool configs unreadable, CFS limit of mixed container only covers its shared request: {e:?}"
                );
                return requests.shared;
            }
        };
        let Some(shared_pool) = requests.shared_pool() else {
            return requests.shared;
        };
        configs
            .iter()
            .filter_map(|config| config.pools.get(shared_pool))
            .map(|pool| pool.cpus.len() as u64 * 1000)
            .max()
            .unwrap_or(0)
    }

    fn patch_container_for_pinning(
        &self,
        annotated: bool,
        index: usize,
        container: &Container,
        patches: &mut Vec<PatchOperation>,
    ) {
        let mounts = container.volume_mounts.as_deref().unwrap_or_default();
        if mounts.iter().any(|m| m.name == PODINFO_VOLUME) {
            return;
        }

        let podinfo = json!({"name": PODINFO_VOLUME, "mountPath": PODINFO_MOUNT_PATH, "readOnly": true});
        let hostbin = json!({"name": HOSTBIN_VOLUME, "mountPath": self.process_starter_path, "readOnly": true});
        let mounts_path = format!("/spec/containers/{index}/volumeMounts");
        if mounts.is_empty() {
            patches.push(add(mounts_path, json!([podinfo, hostbin])));
        } else {
            patches.push(add(format!("{mounts_path}/-"), podinfo));
            patches.push(add(format!("{mounts_path}/-"), hostbin));
        }

        let has_env = container.env.as_ref().is_some_and(|env| !env.is_empty());
        patches.push(env_patch(
            index,
            has_env,
            json!({"name": CONTAINER_NAME_ENV, "value": container.name}),
        ));

        patches.push(add(
            format!("/spec/containers/{index}/command"),
            json!([self.process_starter_path]),
        ));

        let command = container.command.as_deref().unwrap_or_default();
        if !command.is_empty() && !annotated {
            let args: Vec<&String> = command
                .iter()
                .chain(container.args.iter().flatten())
                .collect();
            patches.push(add(format!("/spec/containers/{index}/args"), json!(args)));
        }
    }

    fn patch_volumes(&self, has_volumes: bool, patches: &mut Vec<PatchOperation>) {
        let podinfo = json!({
            "name": PODINFO_VOLUME,
            "downwardAPI": {
                "items": [{"path": "annotations", "fieldRef": {"fieldPath": "metadata.annotations"}}]
            }
        });
        let hostbin = json!({"name": HOSTBIN_VOLUME, "hostPath": {"path": self.process_starter_path}});
        if has_volumes {
            patches.push(add("/spec/volumes/-".to_string(), podinfo));
            patches.push(add("/spec/volumes/-".to_string(), hostbin));
        } else {
            patches.push(add("/spec/volumes".to_string(), json!([podinfo, hostbin])));
        }
    }
}

fn validate_annotation(
    requests: &BTreeMap<String, ContainerPoolRequests>,
    annotation: &CpuAnnotation,
) -> Result<(), MutationError> {
    for container in annotation.container_names() {
        for pool in annotation.pools(container) {
            let requests = requests
                .get(container)
                .ok_or_else(|| MutationError::NoPoolRequests {
                    container: container.to_string(),
                })?;

            let annotated_shared = annotation.shared_cpu_time(container);
            if annotated_shared != requests.shared {
                return Err(MutationError::SharedMismatch {
                    requested: requests.shared,
                    annotated: annotated_shared,
                });
            }

            let requested = *requests
                .pools
                .get(pool)
                .ok_or_else(|| MutationError::PoolNotRequested {
                    container: container.to_string(),
                    pool: pool.to_string(),
                })?;
            // multiThreaded pools may run twice as many threads as cores requested
            let annotated = annotation.total_cpu_request(pool, container);
            if annotated > 2 * requested {
                return Err(MutationError::ExclusiveMismatch {
                    requested,
                    annotated,
                });
            }
        }
    }
    Ok(())
}

fn patch_pool_env(
    requests: &ContainerPoolRequests,
    env_patched: bool,
    index: usize,
    container: &Container,
    patches: &mut Vec<PatchOperation>,
) {
    let env = container.env.as_deref().unwrap_or_default();
    if env.iter().any(|var| var.name == CPU_POOLS_ENV) {
        return;
    }
    patches.push(env_patch(
        index,
        env_patched || !env.is_empty(),
        json!({"name": CPU_POOLS_ENV, "value": requests.cpu_pools_value()}),
    ));
}

/// Appends to an existing env list, or creates the list.
fn env_patch(index: usize, append: bool, var: Value) -> PatchOperation {
    if append {
        add(format!("/spec/containers/{index}/env/-"), var)
    } else {
        add(format!("/spec/containers/{index}/env"), json!([var]))
    }
}

fn add(path: String, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

fn replace(path: String, value: Value) -> PatchOperation {
    PatchOperation::Replace(ReplaceOperation { path, value })
}
