//! Core-list values as used by the cgroup `cpuset.cpus` control file.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use thiserror::Error;

/// Errors produced while parsing a core list such as `"0,2,4-7"`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CpuSetParseError {
    #[error("invalid core id `{0}`")]
    InvalidCore(String),
    #[error("invalid core range `{0}`")]
    InvalidRange(String),
}

/// An ordered set of logical core IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(BTreeSet<u32>);

impl CpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, core: u32) -> bool {
        self.0.contains(&core)
    }

    pub fn insert(&mut self, core: u32) -> bool {
        self.0.insert(core)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn extend(&mut self, other: &CpuSet) {
        self.0.extend(other.0.iter().copied());
    }
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for CpuSet {
    type Err = CpuSetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cores = BTreeSet::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self(cores));
        }

        for entry in s.split(',') {
            let entry = entry.trim();
            match entry.split_once('-') {
                Some((start, end)) => {
                    let start = parse_core(start)?;
                    let end = parse_core(end)?;
                    if start > end {
                        return Err(CpuSetParseError::InvalidRange(entry.to_string()));
                    }
                    cores.extend(start..=end);
                }
                None => {
                    cores.insert(parse_core(entry)?);
                }
            }
        }

        Ok(Self(cores))
    }
}

fn parse_core(s: &str) -> Result<u32, CpuSetParseError> {
    s.trim()
        .parse()
        .map_err(|_| CpuSetParseError::InvalidCore(s.to_string()))
}

impl fmt::Display for CpuSet {
    /// Runs of three or more consecutive cores collapse into `a-b`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for core in self.iter() {
            match runs.last_mut() {
                Some((_, end)) if *end + 1 == core => *end = core,
                _ => runs.push((core, core)),
            }
        }

        let mut first = true;
        for (start, end) in runs {
            let rendered = match end - start {
                0 => start.to_string(),
                1 => format!("{start},{end}"),
                _ => format!("{start}-{end}"),
            };
            if !first {
                f.write_str(",")?;
            }
            f.write_str(&rendered)?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for CpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
