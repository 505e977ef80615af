//! Import job configuration and state types.

use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use crate::retry::RetryConfig;

/// Where the importer reads the final height from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontierSource {
    /// Highest height present in the staging database.
    #[default]
    Repository,
    /// Last finalized height reported by the node.
    Node,
}

/// Configuration for an import job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJobConfig {
    /// Unique job name; keys the checkpoint row and health entries.
    #[serde(default = "default_job_name")]
    pub job_name: String,
    /// Heights per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Maximum number of batches in flight.
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    /// Interval of the read-height sampler in milliseconds.
    #[serde(default = "default_metric_delay_ms")]
    pub metric_delay_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub frontier: FrontierSource,
}

fn default_job_name() -> String {
    "ContractDatabaseImportJob".into()
}

fn default_batch_size() -> u64 {
    1_000
}

fn default_max_parallel_tasks() -> usize {
    5
}

fn default_metric_delay_ms() -> u64 {
    10_000
}

impl Default for ImportJobConfig {
    fn default() -> Self {
        Self {
            job_name: default_job_name(),
            batch_size: default_batch_size(),
            max_parallel_tasks: default_max_parallel_tasks(),
            metric_delay_ms: default_metric_delay_ms(),
            retry: RetryConfig::default(),
            frontier: FrontierSource::default(),
        }
    }
}

impl ImportJobConfig {
    pub fn validate(&self) -> Result<(), ImportError> {
        if self.job_name.trim().is_empty() {
            return Err(ImportError::Config("job_name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(ImportError::Config("batch_size must be > 0".into()));
        }
        if self.max_parallel_tasks == 0 {
            return Err(ImportError::Config("max_parallel_tasks must be > 0".into()));
        }
        if self.retry.retry_count < -1 {
            return Err(ImportError::Config(
                "retry.retry_count must be -1 or non-negative".into(),
            ));
        }
        Ok(())
    }

    /// Inclusive height range covered by batch `index`.
    ///
    /// Batch 0 holds the genesis height alone; batch `b > 0` holds
    /// `(b - 1) * batch_size + 1 ..= b * batch_size`.
    pub fn batch_range(&self, index: u64) -> (u64, u64) {
        let to = index.saturating_mul(self.batch_size);
        let from = index
            .saturating_sub(1)
            .saturating_mul(self.batch_size)
            .saturating_add(1)
            .min(to);
        (from, to)
    }
}

/// Configuration of the per-block importer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockImportConfig {
    /// Run the block importer after each batch import run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Keys the checkpoint row holding the last imported block and baker state.
    #[serde(default = "default_block_job_name")]
    pub job_name: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_enabled() -> bool {
    true
}

fn default_block_job_name() -> String {
    "BlockImportJob".into()
}

impl Default for BlockImportConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            job_name: default_block_job_name(),
            retry: RetryConfig::default(),
        }
    }
}

impl BlockImportConfig {
    pub fn validate(&self) -> Result<(), ImportError> {
        if self.job_name.trim().is_empty() {
            return Err(ImportError::Config("blocks.job_name must not be empty".into()));
        }
        if self.retry.retry_count < -1 {
            return Err(ImportError::Config(
                "blocks.retry.retry_count must be -1 or non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Runtime state of the import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Between cycles.
    Idle,
    /// Querying the final height.
    ComputingFrontier,
    /// Batches of the current cycle are in flight.
    RunningBatches,
    /// All batches finished; persisting the checkpoint and advancing.
    Committing,
    /// Encountered an unrecoverable error.
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::ComputingFrontier => write!(f, "computing-frontier"),
            Self::RunningBatches => write!(f, "running-batches"),
            Self::Committing => write!(f, "committing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
