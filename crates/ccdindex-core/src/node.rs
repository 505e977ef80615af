//! Node client abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ImportError;

/// Subset of the node's consensus status consumed by the importer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusInfo {
    pub last_finalized_height: u64,
    pub last_finalized_time: Option<DateTime<Utc>>,
    pub genesis_index: u32,
}

/// Read access to a chain node.
///
/// Implementations report transport failures as [`ImportError::Node`], which
/// the retry policy treats as transient.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn consensus_info(&self) -> Result<ConsensusInfo, ImportError>;
}
