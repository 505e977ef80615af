//! CLI configuration file.
//!
//! ```json
//! {
//!   "database_url": "postgresql://localhost/ccdindex",
//!   "import": { "batch_size": 1000, "max_parallel_tasks": 5 },
//!   "blocks": { "enabled": true, "job_name": "BlockImportJob" },
//!   "chain_time": { "1": { "slot_duration_ms": 250, "epoch_duration_ms": 3600000 } },
//!   "log": { "level": "info", "json": false }
//! }
//! ```
//!
//! Every section is optional. `DATABASE_URL` overrides `database_url`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ccdindex_core::chain_time::ChainTimeConfig;
use ccdindex_core::job::{BlockImportConfig, ImportJobConfig};

use crate::logging::LogConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub import: ImportJobConfig,
    #[serde(default)]
    pub blocks: BlockImportConfig,
    #[serde(default)]
    pub chain_time: ChainTimeConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Pause between runs in follow mode, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            import: ImportJobConfig::default(),
            blocks: BlockImportConfig::default(),
            chain_time: ChainTimeConfig::default(),
            log: LogConfig::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl CliConfig {
    /// Read and validate a config file. Without a path the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: CliConfig = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => CliConfig::default(),
        };
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }
        config.import.validate()?;
        config.blocks.validate()?;
        config.chain_time.validate()?;
        Ok(config)
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("database_url is not configured (set it in the config file or DATABASE_URL)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccdindex_core::job::FrontierSource;

    #[test]
    fn sections_are_optional() {
        let config: CliConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.import.job_name, "ContractDatabaseImportJob");
        assert_eq!(config.poll_interval_ms, 5_000);
        assert!(config.blocks.enabled);
        assert_eq!(config.blocks.job_name, "BlockImportJob");
        assert!(config.chain_time.parameters(3).is_ok());
    }

    #[test]
    fn parses_full_config() {
        let config: CliConfig = serde_json::from_str(
            r#"{
                "database_url": "postgresql://localhost/ccdindex",
                "import": { "batch_size": 50, "frontier": "node", "retry": { "retry_count": 2 } },
                "blocks": { "enabled": false, "retry": { "retry_count": -1, "retry_delay_ms": 10 } },
                "chain_time": { "4": { "slot_duration_ms": 250, "epoch_duration_ms": 1000 } },
                "log": { "level": "debug", "json": true }
            }"#,
        )
        .unwrap();
        assert_eq!(config.import.batch_size, 50);
        assert_eq!(config.import.frontier, FrontierSource::Node);
        assert_eq!(config.import.retry.retry_count, 2);
        assert_eq!(config.import.retry.retry_delay_ms, 5_000);
        assert!(!config.blocks.enabled);
        assert_eq!(config.blocks.job_name, "BlockImportJob");
        assert_eq!(config.blocks.retry.retry_count, -1);
        assert_eq!(config.chain_time.parameters(7).unwrap().epoch_duration_ms, 1_000);
        assert!(config.log.json);
    }
}
