//! CPU pool model.
//!
//! A node's pool configuration maps pool names to core sets. The pool type
//! is not stored; it is derived from the name prefix (`shared...`,
//! `exclusive...`, anything else is a default pool).

use std::collections::BTreeMap;
use std::fmt;

use error_stack::Report;
use serde::Deserialize;

use crate::pool_config::PoolConfigError;
use serde::Serialize;

use crate::cpuset::CpuSet;

pub const SHARED_POOL_ID: &str = "shared";
pub const EXCLUSIVE_POOL_ID: &str = "exclusive";
pub const DEFAULT_POOL_ID: &str = "default";

/// Sharing policy of a pool, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolType {
    Shared,
    Exclusive,
    Default,
}

impl PoolType {
    pub fn from_pool_name(name: &str) -> Self {
        if name.starts_with(SHARED_POOL_ID) {
            PoolType::Shared
        } else if name.starts_with(EXCLUSIVE_POOL_ID) {
            PoolType::Exclusive
        } else {
            PoolType::Default
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Shared => SHARED_POOL_ID,
            PoolType::Exclusive => EXCLUSIVE_POOL_ID,
            PoolType::Default => DEFAULT_POOL_ID,
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hyperthreading policy of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtPolicy {
    /// Only the allocated logical cores are used.
    #[default]
    #[serde(rename = "singleThreaded")]
    SingleThreaded,
    /// Allocated physical cores are expanded with their hyperthread siblings.
    #[serde(rename = "multiThreaded")]
    MultiThreaded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    #[serde(rename = "cpus", default)]
    pub cpus: CpuSet,
    #[serde(rename = "hyperThreadingPolicy", default)]
    pub ht_policy: HtPolicy,
}

/// Pools and the node selector of one configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    #[serde(default)]
    pub pools: BTreeMap<String, Pool>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

impl PoolConfig {
    /// Returns the first pool, in name order, whose name starts with `prefix`.
    ///
    /// A missing pool yields an empty [`Pool`], which callers treat as
    /// "nothing to enforce".
    pub fn select_pool(&self, prefix: &str) -> Pool {
        self.pools
            .iter()
            .find(|(name, _)| name.starts_with(prefix))
            .map(|(_, pool)| pool.clone())
            .unwrap_or_default()
    }

    pub fn shared_pool(&self) -> Pool {
        self.select_pool(SHARED_POOL_ID)
    }

    pub fn default_pool(&self) -> Pool {
        self.select_pool(DEFAULT_POOL_ID)
    }

    /// Names of pools of the given type, in name order.
    pub fn pool_names(&self, pool_type: PoolType) -> impl Iterator<Item = &str> {
        self.pools
            .keys()
            .filter(move |name| PoolType::from_pool_name(name) == pool_type)
            .map(String::as_str)
    }

    /// Checks that at most one shared pool is configured.
    pub fn validate(&self) -> Result<(), Report<PoolConfigError>> {
        let shared: Vec<&str> = self.pool_names(PoolType::Shared).collect();
        if shared.len() > 1 {
            return Err(Report::new(PoolConfigError::MultipleSharedPools {
                pools: shared.join(", "),
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn pool(cpus: &str, ht_policy: HtPolicy) -> Pool {
        Pool {
            cpus: cpus.parse().unwrap(),
            ht_policy,
        }
    }

    fn config() -> PoolConfig {
        let mut pools = BTreeMap::new();
        pools.insert(
            "exclusive_caas".to_string(),
            pool("2-5", HtPolicy::MultiThreaded),
        );
        pools.insert("shared_caas".to_string(), pool("6,7", HtPolicy::default()));
        pools.insert("default".to_string(), pool("0,1", HtPolicy::default()));
        PoolConfig {
            pools,
            node_selector: BTreeMap::new(),
        }
    }

    #[test]
    fn pool_type_from_name_prefix() {
        assert_eq!(PoolType::from_pool_name("shared_caas"), PoolType::Shared);
        assert_eq!(
            PoolType::from_pool_name("exclusive_numa0"),
            PoolType::Exclusive
        );
        assert_eq!(PoolType::from_pool_name("default"), PoolType::Default);
        assert_eq!(PoolType::from_pool_name("infra"), PoolType::Default);
    }

    #[test]
    fn select_pool_by_prefix() {
        let config = config();
        assert_eq!(config.shared_pool(), pool("6,7", HtPolicy::SingleThreaded));
        assert_eq!(config.default_pool(), pool("0,1", HtPolicy::SingleThreaded));
        assert_eq!(
            config.select_pool("exclusive_caas"),
            pool("2-5", HtPolicy::MultiThreaded)
        );
    }

    #[test]
    fn select_missing_pool_is_empty() {
        let config = PoolConfig::default();
        let selected = config.select_pool(SHARED_POOL_ID);
        assert!(selected.cpus.is_empty());
        assert_eq!(selected.ht_policy, HtPolicy::SingleThreaded);
    }

    #[test]
    fn select_pool_is_deterministic_across_matches() {
        let mut config = config();
        config
            .pools
            .insert("exclusive_a".to_string(), pool("8", HtPolicy::default()));
        assert_eq!(
            config.select_pool(EXCLUSIVE_POOL_ID),
            pool("8", HtPolicy::SingleThreaded)
        );
    }

    #[test]
    fn two_shared_pools_fail_validation() {
        let mut config = config();
        assert!(config.validate().is_ok());

        config
            .pools
            .insert("shared_other".to_string(), pool("8", HtPolicy::default()));
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.current_context().to_string(),
            "Only one shared pool allowed, found shared_caas, shared_other"
        );
    }

    #[test]
    fn deserializes_pool_file_schema() {
        let yaml = r#"
pools:
  exclusive_caas:
    cpus: "2-5"
    hyperThreadingPolicy: multiThreaded
  shared_caas:
    cpus: "6,7"
nodeSelector:
  nodeType: caas
"#;
        let parsed: PoolConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            parsed.pools["exclusive_caas"],
            pool("2-5", HtPolicy::MultiThreaded)
        );
        assert_eq!(
            parsed.pools["shared_caas"],
            pool("6,7", HtPolicy::SingleThreaded)
        );
        assert_eq!(parsed.node_selector["nodeType"], "caas");
    }
}
