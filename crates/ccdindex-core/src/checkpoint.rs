//! Checkpoint manager: persists the import job's cross-cycle state.
//!
//! The checkpoint holds the first batch index not yet committed, the last
//! block imported by the block importer, the era counter last seen by the
//! baker handler and the earliest effective time among all pending baker
//! changes. The batch importer loads it once per cycle and saves it when the
//! cycle completes. The block importer writes it inside each block's session,
//! so a committed block and its checkpoint are never out of step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ImportError;

/// In-memory view of the checkpoint used while a cycle runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportState {
    /// First batch index of the next cycle.
    pub next_batch: u64,
    /// Height of the last block committed by the block importer.
    pub last_block_height: Option<u64>,
    /// Genesis index of the last block processed by the baker handler.
    pub last_genesis_index: u32,
    /// Minimum effective time across all pending baker changes, if any.
    pub next_pending_baker_change_time: Option<DateTime<Utc>>,
}

/// A persisted checkpoint row, one per job name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCheckpoint {
    pub job_name: String,
    pub next_batch: u64,
    pub last_block_height: Option<u64>,
    pub last_genesis_index: u32,
    pub next_pending_baker_change_time: Option<DateTime<Utc>>,
    /// When this checkpoint was saved.
    pub updated_at: DateTime<Utc>,
}

impl ImportCheckpoint {
    pub fn state(&self) -> ImportState {
        ImportState {
            next_batch: self.next_batch,
            last_block_height: self.last_block_height,
            last_genesis_index: self.last_genesis_index,
            next_pending_baker_change_time: self.next_pending_baker_change_time,
        }
    }
}

/// Trait for storing and loading checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a job.
    async fn load(&self, job_name: &str) -> Result<Option<ImportCheckpoint>, ImportError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: ImportCheckpoint) -> Result<(), ImportError>;

    /// Delete a checkpoint (e.g. when resetting a job).
    async fn delete(&self, job_name: &str) -> Result<(), ImportError>;
}

/// Loads and saves [`ImportState`] for a single job.
pub struct CheckpointManager {
    store: Box<dyn CheckpointStore>,
    job_name: String,
}

impl CheckpointManager {
    pub fn new(store: Box<dyn CheckpointStore>, job_name: impl Into<String>) -> Self {
        Self {
            store,
            job_name: job_name.into(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Load the saved state, or the default state if the job never saved one.
    pub async fn load_state(&self) -> Result<ImportState, ImportError> {
        Ok(self
            .store
            .load(&self.job_name)
            .await?
            .map(|cp| cp.state())
            .unwrap_or_default())
    }

    /// Persist the state at the end of a cycle.
    pub async fn save_state(&self, state: &ImportState) -> Result<(), ImportError> {
        self.store.save(self.checkpoint(state)).await
    }

    /// The checkpoint row for `state`, stamped now.
    pub fn checkpoint(&self, state: &ImportState) -> ImportCheckpoint {
        ImportCheckpoint {
            job_name: self.job_name.clone(),
            next_batch: state.next_batch,
            last_block_height: state.last_block_height,
            last_genesis_index: state.last_genesis_index,
            next_pending_baker_change_time: state.next_pending_baker_change_time,
            updated_at: Utc::now(),
        }
    }

    pub async fn reset(&self) -> Result<(), ImportError> {
        self.store.delete(&self.job_name).await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, ImportCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, job_name: &str) -> Result<Option<ImportCheckpoint>, ImportError> {
        Ok(self.data.lock().unwrap().get(job_name).cloned())
    }

    async fn save(&self, checkpoint: ImportCheckpoint) -> Result<(), ImportError> {
        self.data
            .lock()
            .unwrap()
            .insert(checkpoint.job_name.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, job_name: &str) -> Result<(), ImportError> {
        self.data.lock().unwrap().remove(job_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn missing_checkpoint_loads_default_state() {
        let mgr = CheckpointManager::new(Box::new(MemoryCheckpointStore::new()), "job");
        assert_eq!(mgr.load_state().await.unwrap(), ImportState::default());
    }

    #[tokio::test]
    async fn state_roundtrip_and_reset() {
        let mgr = CheckpointManager::new(Box::new(MemoryCheckpointStore::new()), "job");
        let state = ImportState {
            next_batch: 4,
            last_block_height: Some(4_021),
            last_genesis_index: 2,
            next_pending_baker_change_time: Some(Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap()),
        };
        mgr.save_state(&state).await.unwrap();
        assert_eq!(mgr.load_state().await.unwrap(), state);

        mgr.reset().await.unwrap();
        assert_eq!(mgr.load_state().await.unwrap(), ImportState::default());
    }

    #[tokio::test]
    async fn checkpoints_are_keyed_by_job_name() {
        let store = MemoryCheckpointStore::new();
        store
            .save(ImportCheckpoint {
                job_name: "a".into(),
                next_batch: 0,
                last_block_height: None,
                last_genesis_index: 1,
                next_pending_baker_change_time: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(store.load("a").await.unwrap().is_some());
        assert!(store.load("b").await.unwrap().is_none());
    }
}
