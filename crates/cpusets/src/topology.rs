//! Host CPU topology as reported by `lscpu`.

use std::collections::BTreeMap;
use std::process::Command;

use tracing::debug;
use tracing::warn;

use crate::cpuset::CpuSet;

/// Topology snapshot taken once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTopology {
    /// logical core -> NUMA node
    pub numa_nodes: BTreeMap<u32, u32>,
    /// physical core -> comma-joined sibling logical cores
    pub ht_siblings: BTreeMap<u32, String>,
}

impl NodeTopology {
    /// Queries the host. Failures degrade to empty maps.
    pub fn discover() -> Self {
        let numa_nodes = list_and_parse_cores("node");
        let ht_siblings = ht_topology(&list_and_parse_cores("core"));
        debug!(?numa_nodes, ?ht_siblings, "Discovered node topology");
        Self {
            numa_nodes,
            ht_siblings,
        }
    }

    pub fn numa_node(&self, core: u32) -> Option<u32> {
        self.numa_nodes.get(&core).copied()
    }

    pub fn expand_with_siblings(&self, cpus: &CpuSet) -> CpuSet {
        expand_with_siblings(cpus, &self.ht_siblings)
    }
}

fn list_and_parse_cores(attribute: &str) -> BTreeMap<u32, u32> {
    let output = match Command::new("lscpu")
        .arg(format!("-p=cpu,{attribute}"))
        .output()
    {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            warn!(
                attribute,
                status = %output.status,
                "lscpu failed, topology for this attribute is unavailable"
            );
            return BTreeMap::new();
        }
        Err(e) => {
            warn!(attribute, "Failed to run lscpu: {e}");
            return BTreeMap::new();
        }
    };

    parse_lscpu_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parses `lscpu -p=cpu,<attr>` output into `cpu -> attr`.
///
/// Comment lines and lines that are not exactly two integer columns are
/// skipped.
pub fn parse_lscpu_output(output: &str) -> BTreeMap<u32, u32> {
    let mut cores = BTreeMap::new();
    for line in output.lines() {
        let columns: Vec<&str> = line.split(',').collect();
        let [cpu, value] = columns.as_slice() else {
            continue;
        };
        let (Ok(cpu), Ok(value)) = (cpu.trim().parse(), value.trim().parse()) else {
            continue;
        };
        cores.insert(cpu, value);
    }
    cores
}

/// Groups logical CPUs under the physical core they belong to.
///
/// Works on the `cpu -> core` map: a CPU whose core ID differs from its own
/// ID is recorded as a sibling of that core.
pub fn ht_topology(core_map: &BTreeMap<u32, u32>) -> BTreeMap<u32, String> {
    let mut siblings: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for (&logical, &physical) in core_map {
        if logical != physical {
            siblings
                .entry(physical)
                .or_default()
                .push(logical.to_string());
        }
    }
    siblings
        .into_iter()
        .map(|(physical, logical)| (physical, logical.join(",")))
        .collect()
}

/// Adds the hyperthread siblings of every core in `cpus`.
///
/// An unparsable sibling list aborts the expansion and returns `cpus`
/// unchanged.
pub fn expand_with_siblings(cpus: &CpuSet, ht_siblings: &BTreeMap<u32, String>) -> CpuSet {
    let mut expanded = cpus.clone();
    for core in cpus.iter() {
        let Some(siblings) = ht_siblings.get(&core) else {
            continue;
        };
        match siblings.parse::<CpuSet>() {
            Ok(siblings) => expanded.extend(&siblings),
            Err(e) => {
                warn!(core, siblings = %siblings, "Invalid hyperthread sibling list: {e}");
                return cpus.clone();
            }
        }
    }
    expanded
}
