//! Reader for the kubelet device manager checkpoint.
//!
//! The kubelet records which device IDs it handed to which container in
//! `kubelet_internal_checkpoint`. For CPU pools the device IDs are core
//! numbers. Older kubelets store a flat `DeviceIDs` list per entry, newer ones
//! group the IDs by NUMA node; both decode into [`PodDeviceEntry`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::fs;
use tracing::warn;

use crate::cpuset::CpuSet;

pub const DEFAULT_CHECKPOINT_PATH: &str =
    "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint";

#[derive(Debug, derive_more::Display)]
pub enum CheckpointError {
    #[display("Failed to read checkpoint file: {path}")]
    ReadFailed { path: String },
    #[display("Failed to parse checkpoint file")]
    ParseFailed,
    #[display("Invalid device ID in checkpoint: {device_id}")]
    InvalidDeviceId { device_id: String },
}

impl core::error::Error for CheckpointError {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KubeletCheckpoint<D> {
    data: CheckpointData<D>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckpointData<D> {
    #[serde(default = "Option::default")]
    pod_device_entries: Option<Vec<RawPodDeviceEntry<D>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPodDeviceEntry<D> {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    container_name: String,
    resource_name: String,
    #[serde(rename = "DeviceIDs")]
    device_ids: D,
}

/// Legacy layout: `"DeviceIDs": ["3", "4"]`.
type FlatDeviceIds = Vec<String>;

/// NUMA layout: `"DeviceIDs": {"0": ["3", "4"], "1": ["5"]}`, `-1` when the
/// device has no affinity.
type NumaDeviceIds = BTreeMap<i64, Vec<String>>;

/// A checkpoint entry normalized to the flat layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDeviceEntry {
    pub pod_uid: String,
    pub container_name: String,
    pub resource_name: String,
    pub device_ids: Vec<String>,
}

impl From<RawPodDeviceEntry<FlatDeviceIds>> for PodDeviceEntry {
    fn from(entry: RawPodDeviceEntry<FlatDeviceIds>) -> Self {
        Self {
            pod_uid: entry.pod_uid,
            container_name: entry.container_name,
            resource_name: entry.resource_name,
            device_ids: entry.device_ids,
        }
    }
}

impl From<RawPodDeviceEntry<NumaDeviceIds>> for PodDeviceEntry {
    /// IDs are concatenated in ascending NUMA node order.
    fn from(entry: RawPodDeviceEntry<NumaDeviceIds>) -> Self {
        Self {
            pod_uid: entry.pod_uid,
            container_name: entry.container_name,
            resource_name: entry.resource_name,
            device_ids: entry.device_ids.into_values().flatten().collect(),
        }
    }
}

fn decode_as<D>(content: &str) -> Result<Vec<PodDeviceEntry>, serde_json::Error>
where
    D: DeserializeOwned,
    PodDeviceEntry: From<RawPodDeviceEntry<D>>,
{
    let checkpoint: KubeletCheckpoint<D> = serde_json::from_str(content)?;
    Ok(checkpoint
        .data
        .pod_device_entries
        .unwrap_or_default()
        .into_iter()
        .map(PodDeviceEntry::from)
        .collect())
}

/// Decodes a checkpoint under the legacy layout, falling back to the NUMA one.
pub fn decode_checkpoint(content: &str) -> Result<Vec<PodDeviceEntry>, Report<CheckpointError>> {
    match decode_as::<FlatDeviceIds>(content) {
        Ok(entries) => Ok(entries),
        Err(legacy_err) => decode_as::<NumaDeviceIds>(content)
            .change_context(CheckpointError::ParseFailed)
            .attach_printable(format!("legacy layout: {legacy_err}")),
    }
}

/// Looks up kubelet device allocations for containers.
#[derive(Debug, Clone)]
pub struct CheckpointReader {
    path: PathBuf,
}

impl CheckpointReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the cores granted to `container_name` of pod `pod_uid` for
    /// `resource_name`.
    ///
    /// No matching entry is not an error: the allocation may simply not be
    /// recorded yet, so an empty set is returned.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::ReadFailed`] if the file cannot be read
    /// - [`CheckpointError::ParseFailed`] if neither layout decodes
    /// - [`CheckpointError::InvalidDeviceId`] if a matched device ID is not a core number
    pub async fn allocated_cores(
        &self,
        resource_name: &str,
        pod_uid: &str,
        container_name: &str,
    ) -> Result<CpuSet, Report<CheckpointError>> {
        let content = fs::read_to_string(&self.path).await.change_context(
            CheckpointError::ReadFailed {
                path: self.path.display().to_string(),
            },
        )?;
        let entries = decode_checkpoint(&content)?;
        cores_for(&entries, resource_name, pod_uid, container_name)
    }
}

fn cores_for(
    entries: &[PodDeviceEntry],
    resource_name: &str,
    pod_uid: &str,
    container_name: &str,
) -> Result<CpuSet, Report<CheckpointError>> {
    let mut cores = CpuSet::new();
    let mut matched = false;
    for entry in entries.iter().filter(|entry| {
        entry.pod_uid == pod_uid
            && entry.container_name == container_name
            && entry.resource_name == resource_name
    }) {
        matched = true;
        for device_id in &entry.device_ids {
            let core = device_id.trim().parse::<u32>().map_err(|_| {
                Report::new(CheckpointError::InvalidDeviceId {
                    device_id: device_id.clone(),
                })
            })?;
            cores.insert(core);
        }
    }

    if !matched {
        warn!(
            pod_uid,
            container = container_name,
            resource = resource_name,
            "No device allocation recorded in checkpoint"
        );
    }
    Ok(cores)
}
