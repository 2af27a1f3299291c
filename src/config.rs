//! Catalog settings, read with the `config` crate from defaults, an optional
//! file and `METACATALOG_*` environment variables (sections separated by a
//! double underscore, e.g. `METACATALOG_QUERY__MAX_LOOP_DEPTH=8`).

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{CatalogError, Result};

pub const ENV_PREFIX: &str = "METACATALOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: Backend,
    /// Database file for the sqlite backend; in-memory sqlite when absent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Row limit for queries without a `limit` clause.
    pub default_limit: Option<usize>,
    /// Rounds an unbounded `loop` may run before it is cut off.
    pub max_loop_depth: usize,
}
impl Default for QueryConfig {
    fn default() -> Self {
        Self { default_limit: None, max_loop_depth: 32 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub full_text: bool,
}
impl Default for SearchConfig {
    fn default() -> Self {
        Self { full_text: true }
    }
}

/// Type and attribute names lineage questions are asked in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageConfig {
    pub table_type: String,
    pub process_type: String,
    pub inputs_attribute: String,
    pub outputs_attribute: String,
    pub columns_attribute: String,
    pub name_attribute: String,
}
impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            table_type: "Table".to_string(),
            process_type: "LoadProcess".to_string(),
            inputs_attribute: "inputTables".to_string(),
            outputs_attribute: "outputTables".to_string(),
            columns_attribute: "columns".to_string(),
            name_attribute: "name".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}
impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: "info".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub storage: StorageConfig,
    pub query: QueryConfig,
    pub search: SearchConfig,
    pub lineage: LineageConfig,
    pub log: LogConfig,
}

impl CatalogConfig {
    /// Layers the defaults, the file at `path` (format taken from its
    /// extension) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let config: CatalogConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.max_loop_depth == 0 {
            return Err(CatalogError::Config("query.max_loop_depth must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over the configured
/// filter; a second call fails because a subscriber is already set.
pub fn init_tracing(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .map_err(|e| CatalogError::Config(e.to_string()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| CatalogError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_sources() {
        let config = CatalogConfig::load(None).expect("defaults load");
        assert_eq!(config.storage.backend, Backend::Memory);
        assert_eq!(config.query.max_loop_depth, 32);
        assert!(config.search.full_text);
        assert_eq!(config.lineage.process_type, "LoadProcess");
    }
}
