//! The per-pod CPU annotation describing which process runs in which pool.
//!
//! ```json
//! [{"container": "app", "processes": [
//!     {"process": "/bin/app", "args": ["-c", "1"], "cpus": 1, "pool": "exclusive_caas"}
//! ]}]
//! ```

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::pool::SHARED_POOL_ID;

/// Annotation key suffix, appended to the resource base name.
pub const CPU_ANNOTATION_SUFFIX: &str = "cpus";

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("'container' is mandatory in annotation")]
    NoContainerName,
    #[error("'processes' is mandatory in annotation")]
    NoProcesses,
    #[error("'process' (name) is mandatory in annotation")]
    NoProcessName,
    #[error("'cpus' field is mandatory in annotation")]
    NoCpus,
    #[error("invalid CPU annotation: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    #[serde(rename = "process", default)]
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cpus: u64,
    #[serde(default)]
    pub pool: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(rename = "container", default)]
    pub name: String,
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
}

/// Decoded CPU annotation, one entry per container in annotation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuAnnotation {
    containers: Vec<ContainerSpec>,
}

impl CpuAnnotation {
    /// Decodes and validates an annotation value.
    ///
    /// A container listed twice keeps its first position and the later
    /// definition.
    pub fn decode(value: &str) -> Result<Self, AnnotationError> {
        let decoded: Vec<ContainerSpec> = serde_json::from_str(value)?;

        let mut containers: Vec<ContainerSpec> = Vec::with_capacity(decoded.len());
        for container in decoded {
            match containers.iter_mut().find(|c| c.name == container.name) {
                Some(existing) => *existing = container,
                None => containers.push(container),
            }
        }

        for container in &containers {
            if container.name.is_empty() {
                return Err(AnnotationError::NoContainerName);
            }
            if container.processes.is_empty() {
                return Err(AnnotationError::NoProcesses);
            }
            for process in &container.processes {
                if process.name.is_empty() {
                    return Err(AnnotationError::NoProcessName);
                }
                if process.cpus == 0 {
                    return Err(AnnotationError::NoCpus);
                }
            }
        }

        Ok(Self { containers })
    }

    pub fn container_names(&self) -> impl Iterator<Item = &str> {
        self.containers.iter().map(|c| c.name.as_str())
    }

    pub fn contains_container(&self, name: &str) -> bool {
        self.container(name).is_some()
    }

    fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name == name)
    }

    fn processes(&self, container: &str) -> impl Iterator<Item = &ProcessSpec> {
        self.container(container)
            .into_iter()
            .flat_map(|c| c.processes.iter())
    }

    /// CPU time requested from shared pools by `container`.
    pub fn shared_cpu_time(&self, container: &str) -> u64 {
        self.processes(container)
            .filter(|p| p.pool.starts_with(SHARED_POOL_ID))
            .map(|p| p.cpus)
            .sum()
    }

    /// Pools referenced by `container`, first occurrence order.
    pub fn pools(&self, container: &str) -> Vec<&str> {
        let mut pools: Vec<&str> = Vec::new();
        for process in self.processes(container) {
            if !pools.contains(&process.pool.as_str()) {
                pools.push(&process.pool);
            }
        }
        pools
    }

    /// Total CPU requested from `pool` by `container`.
    pub fn total_cpu_request(&self, pool: &str, container: &str) -> u64 {
        self.processes(container)
            .filter(|p| p.pool == pool)
            .map(|p| p.cpus)
            .sum()
    }
}
