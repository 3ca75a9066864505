//! Cpuset cgroup filesystem access.
//!
//! Container cgroups are located by walking the cpuset hierarchy and matching
//! the runtime container ID against directory names. Nothing is cached: the
//! runtime owns the layout and may change it at any time. Every lookup is a
//! full walk, so its cost is linear in the number of directories under the
//! root. All functions here block and are meant for `spawn_blocking`.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use walkdir::WalkDir;

use crate::cpuset::CpuSet;

/// Control file holding the allowed cores of a cgroup.
pub const CPUSET_FILE: &str = "cpuset.cpus";

/// Kernel list of the node's online cores.
pub const ONLINE_CPUS_FILE: &str = "/sys/devices/system/cpu/online";

#[derive(Debug, derive_more::Display)]
pub enum CgroupError {
    #[display("No cgroup directory for container {container_id} under {root}")]
    ContainerNotFound { container_id: String, root: String },
    #[display("No infra container cgroup next to {container_dir}")]
    InfraContainerNotFound { container_dir: String },
    #[display("Failed to read {path}")]
    ReadFailed { path: String },
    #[display("Failed to write {path}")]
    WriteFailed { path: String },
    #[display("Invalid cpuset in {path}")]
    InvalidCpuset { path: String },
}

impl core::error::Error for CgroupError {}

/// Writes `cpus` into the cgroup of `container_id`.
///
/// The deepest, last directory below the matched container directory is
/// written, so runtimes that nest a child cgroup under the container are
/// covered. Returns the matched container directory, or `None` when `cpus`
/// is empty and nothing was written.
///
/// # Errors
///
/// - [`CgroupError::ContainerNotFound`] if the runtime has not created the cgroup yet
/// - [`CgroupError::WriteFailed`] if the control file cannot be written
pub fn apply_to_container(
    root: &Path,
    container_id: &str,
    cpus: &CpuSet,
) -> Result<Option<PathBuf>, Report<CgroupError>> {
    if cpus.is_empty() {
        debug!(container_id, "Empty cpuset, leaving container cgroup untouched");
        return Ok(None);
    }

    let container_dir = find_container_dir(root, container_id).ok_or_else(|| {
        Report::new(CgroupError::ContainerNotFound {
            container_id: container_id.to_string(),
            root: root.display().to_string(),
        })
    })?;
    let leaf = last_nested_dir(&container_dir);
    write_cpuset(&leaf, cpus)?;
    Ok(Some(container_dir))
}

/// Writes `cpus` into the infra (pause) container cgroup of a pod.
///
/// The infra container is the sibling of `container_dir` whose name contains
/// none of the pod's known `container_ids`; the last one in name order wins.
/// Does nothing when `cpus` is empty.
pub fn apply_to_infra_container(
    container_dir: &Path,
    container_ids: &[String],
    cpus: &CpuSet,
) -> Result<(), Report<CgroupError>> {
    if cpus.is_empty() {
        debug!("Empty default cpuset, leaving infra container cgroup untouched");
        return Ok(());
    }

    let infra_dir = find_infra_dir(container_dir, container_ids).ok_or_else(|| {
        Report::new(CgroupError::InfraContainerNotFound {
            container_dir: container_dir.display().to_string(),
        })
    })?;
    write_cpuset(&infra_dir, cpus)
}

/// Directories under `root` that have no subdirectories.
pub fn leaf_cpusets(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .filter(|dir| !has_subdirectory(dir))
        .collect()
}

pub fn read_cpuset(dir: &Path) -> Result<CpuSet, Report<CgroupError>> {
    read_cpu_list(&dir.join(CPUSET_FILE))
}

/// Every core of the node, regardless of the affinity or quota of this
/// process.
///
/// The kernel's `online` list is read first. When it is unreadable or empty
/// the control file at the root of the cpuset hierarchy is used instead.
pub fn node_cpuset(online: &Path, root: &Path) -> Result<CpuSet, Report<CgroupError>> {
    match read_cpu_list(online) {
        Ok(cpus) if !cpus.is_empty() => return Ok(cpus),
        Ok(_) => debug!(path = %online.display(), "Online core list is empty"),
        Err(e) => debug!("Online core list unavailable: {e:?}"),
    }

    let cpus = read_cpuset(root)?;
    if cpus.is_empty() {
        return Err(Report::new(CgroupError::InvalidCpuset {
            path: root.join(CPUSET_FILE).display().to_string(),
        }));
    }
    Ok(cpus)
}

fn read_cpu_list(path: &Path) -> Result<CpuSet, Report<CgroupError>> {
    let content = fs::read_to_string(path).change_context(CgroupError::ReadFailed {
        path: path.display().to_string(),
    })?;
    content
        .parse::<CpuSet>()
        .change_context(CgroupError::InvalidCpuset {
            path: path.display().to_string(),
        })
}

/// Overwrites the control file of `dir` with `cpus`.
pub fn write_cpuset(dir: &Path, cpus: &CpuSet) -> Result<(), Report<CgroupError>> {
    let path = dir.join(CPUSET_FILE);
    fs::write(&path, cpus.to_string()).change_context(CgroupError::WriteFailed {
        path: path.display().to_string(),
    })?;
    debug!(path = %path.display(), cpus = %cpus, "Wrote cpuset");
    Ok(())
}

fn find_container_dir(root: &Path, container_id: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry.file_type().is_dir() && entry.file_name().to_string_lossy().contains(container_id)
        })
        .map(|entry| entry.into_path())
}

fn last_nested_dir(dir: &Path) -> PathBuf {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .last()
        .map(|entry| entry.into_path())
        .unwrap_or_else(|| dir.to_path_buf())
}

fn find_infra_dir(container_dir: &Path, container_ids: &[String]) -> Option<PathBuf> {
    let pod_dir = container_dir.parent()?;
    WalkDir::new(pod_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            !container_ids
                .iter()
                .any(|id| !id.is_empty() && name.contains(id.as_str()))
        })
        .last()
        .map(|entry| entry.into_path())
}

fn has_subdirectory(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn set(s: &str) -> CpuSet {
        s.parse().unwrap()
    }

    /// kubepods/pod-1/{abc123, def456, pause999}
    fn pod_tree() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for dir in ["abc123", "def456", "pause999"] {
            let path = root.path().join("kubepods/pod-1").join(dir);
            fs::create_dir_all(&path).unwrap();
            fs::write(path.join(CPUSET_FILE), "0-7").unwrap();
        }
        root
    }

    fn content(dir: &Path) -> String {
        fs::read_to_string(dir.join(CPUSET_FILE)).unwrap()
    }

    #[test]
    fn writes_container_cpuset() {
        let root = pod_tree();
        let dir = apply_to_container(root.path(), "abc123", &set("2,3")).unwrap();

        let expected = root.path().join("kubepods/pod-1/abc123");
        assert_eq!(dir, Some(expected.clone()));
        assert_eq!(content(&expected), "2,3");
    }

    #[test]
    fn writes_into_nested_child_cgroup() {
        let root = pod_tree();
        let child = root.path().join("kubepods/pod-1/abc123/sidecar");
        fs::create_dir_all(&child).unwrap();

        let dir = apply_to_container(root.path(), "abc123", &set("4-7")).unwrap();
        assert_eq!(dir, Some(root.path().join("kubepods/pod-1/abc123")));
        assert_eq!(content(&child), "4-7");
        assert_eq!(content(&root.path().join("kubepods/pod-1/abc123")), "0-7");
    }

    #[test]
    fn empty_cpuset_writes_nothing() {
        let root = pod_tree();
        let dir = apply_to_container(root.path(), "abc123", &CpuSet::new()).unwrap();
        assert_eq!(dir, None);
        assert_eq!(content(&root.path().join("kubepods/pod-1/abc123")), "0-7");
    }

    #[test]
    fn missing_container_is_an_error() {
        let root = pod_tree();
        let err = apply_to_container(root.path(), "zzz", &set("1")).unwrap_err();
        assert!(matches!(
            err.current_context(),
            CgroupError::ContainerNotFound { .. }
        ));
    }

    #[test]
    fn infra_container_is_the_unknown_sibling() {
        let root = pod_tree();
        let container_dir = root.path().join("kubepods/pod-1/abc123");
        let ids = vec!["abc123".to_string(), "def456".to_string()];

        apply_to_infra_container(&container_dir, &ids, &set("0,1")).unwrap();

        assert_eq!(content(&root.path().join("kubepods/pod-1/pause999")), "0,1");
        assert_eq!(content(&root.path().join("kubepods/pod-1/def456")), "0-7");
    }

    #[test]
    fn infra_container_missing() {
        let root = pod_tree();
        let container_dir = root.path().join("kubepods/pod-1/abc123");
        let ids = vec![
            "abc123".to_string(),
            "def456".to_string(),
            "pause999".to_string(),
        ];

        let err = apply_to_infra_container(&container_dir, &ids, &set("0")).unwrap_err();
        assert!(matches!(
            err.current_context(),
            CgroupError::InfraContainerNotFound { .. }
        ));
    }

    #[test]
    fn empty_default_cpuset_skips_infra() {
        let root = pod_tree();
        let container_dir = root.path().join("kubepods/pod-1/abc123");
        apply_to_infra_container(&container_dir, &[], &CpuSet::new()).unwrap();
        assert_eq!(content(&root.path().join("kubepods/pod-1/pause999")), "0-7");
    }

    #[test]
    fn finds_leaf_directories() {
        let root = pod_tree();
        let leaves = leaf_cpusets(root.path());
        assert_eq!(
            leaves,
            vec![
                root.path().join("kubepods/pod-1/abc123"),
                root.path().join("kubepods/pod-1/def456"),
                root.path().join("kubepods/pod-1/pause999"),
            ]
        );
    }

    #[test]
    fn reads_cpuset_file() {
        let root = pod_tree();
        let dir = root.path().join("kubepods/pod-1/abc123");
        assert_eq!(read_cpuset(&dir).unwrap(), set("0-7"));

        fs::write(dir.join(CPUSET_FILE), "garbage").unwrap();
        assert!(read_cpuset(&dir).is_err());
    }

    #[test]
    fn node_cpuset_prefers_online_list() {
        let root = pod_tree();
        fs::write(root.path().join(CPUSET_FILE), "0-3\n").unwrap();
        let online = root.path().join("online");
        fs::write(&online, "0-15\n").unwrap();

        assert_eq!(node_cpuset(&online, root.path()).unwrap(), set("0-15"));
    }

    #[test]
    fn node_cpuset_falls_back_to_root_cpuset() {
        let root = pod_tree();
        fs::write(root.path().join(CPUSET_FILE), "0-7\n").unwrap();
        let missing = root.path().join("no-such-online");
        assert_eq!(node_cpuset(&missing, root.path()).unwrap(), set("0-7"));

        let empty = root.path().join("online");
        fs::write(&empty, "\n").unwrap();
        assert_eq!(node_cpuset(&empty, root.path()).unwrap(), set("0-7"));
    }

    #[test]
    fn node_cpuset_without_any_source_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("online");
        assert!(node_cpuset(&missing, root.path()).is_err());

        fs::write(root.path().join(CPUSET_FILE), "").unwrap();
        assert!(node_cpuset(&missing, root.path()).is_err());
    }
}
