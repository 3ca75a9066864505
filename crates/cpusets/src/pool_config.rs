use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;

use crate::pool::PoolConfig;

/// Errors raised while loading pool configuration files.
#[derive(Debug, derive_more::Display)]
pub enum PoolConfigError {
    #[display("Invalid pool config file pattern: {pattern}")]
    InvalidPattern { pattern: String },
    #[display("Failed to read pool config file: {path}")]
    ReadFailed { path: String },
    #[display("Failed to parse pool config file: {path}")]
    ParseFailed { path: String },
    #[display("Invalid pool config file: {path}")]
    Invalid { path: String },
    #[display("Only one shared pool allowed, found {pools}")]
    MultipleSharedPools { pools: String },
    #[display("No pool config file found in {dir}")]
    NoConfigFiles { dir: String },
    #[display("No pool config matches the node labels")]
    NoMatch,
}

impl core::error::Error for PoolConfigError {}

/// Loads pool configuration files from a directory.
#[derive(Debug, Clone)]
pub struct PoolConfigLoader {
    dir: PathBuf,
    file_match: String,
}

impl PoolConfigLoader {
    pub fn new(dir: impl Into<PathBuf>, file_match: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_match: file_match.into(),
        }
    }

    /// Reads every file matching the pattern, in file-name order.
    ///
    /// # Errors
    ///
    /// Any unreadable, unparsable or invalid file fails the whole load.
    pub fn read_all(&self) -> Result<Vec<PoolConfig>, Report<PoolConfigError>> {
        let pattern = self.dir.join(&self.file_match).display().to_string();
        let paths = glob::glob(&pattern).change_context(PoolConfigError::InvalidPattern {
            pattern: pattern.clone(),
        })?;

        let mut configs = Vec::new();
        for entry in paths {
            let path = entry.change_context(PoolConfigError::InvalidPattern {
                pattern: pattern.clone(),
            })?;
            if path.is_file() {
                configs.push(parse_pool_config_file(&path)?);
            }
        }
        Ok(configs)
    }

    /// Picks the configuration that applies to a node with the given labels.
    ///
    /// The first file with any selector entry equal to a node label wins. A
    /// node without labels gets the first file unconditionally.
    pub fn load_for_node(
        &self,
        node_labels: Option<&BTreeMap<String, String>>,
    ) -> Result<PoolConfig, Report<PoolConfigError>> {
        let configs = self.read_all()?;
        if configs.is_empty() {
            return Err(Report::new(PoolConfigError::NoConfigFiles {
                dir: self.dir.display().to_string(),
            }));
        }
        select_for_labels(configs, node_labels)
    }
}

fn select_for_labels(
    configs: Vec<PoolConfig>,
    node_labels: Option<&BTreeMap<String, String>>,
) -> Result<PoolConfig, Report<PoolConfigError>> {
    let labels = match node_labels {
        Some(labels) if !labels.is_empty() => labels,
        _ => {
            info!("Node has no labels, using the first pool config file");
            return configs
                .into_iter()
                .next()
                .ok_or_else(|| Report::new(PoolConfigError::NoMatch));
        }
    };

    for (index, config) in configs.into_iter().enumerate() {
        let matched = labels
            .iter()
            .any(|(label, value)| config.node_selector.get(label) == Some(value));
        if matched {
            info!(index, "Using pool config file matching node labels");
            return Ok(config);
        }
    }

    Err(Report::new(PoolConfigError::NoMatch)).attach_printable(format!("node labels: {labels:?}"))
}

fn parse_pool_config_file(path: &Path) -> Result<PoolConfig, Report<PoolConfigError>> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).change_context(PoolConfigError::ReadFailed {
        path: display.clone(),
    })?;
    let config: PoolConfig =
        serde_yaml::from_str(&content).change_context(PoolConfigError::ParseFailed {
            path: display.clone(),
        })?;
    config
        .validate()
        .change_context(PoolConfigError::Invalid { path: display })?;
    Ok(config)
}
