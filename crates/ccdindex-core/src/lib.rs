//! ccdindex-core: import pipeline for finalized Concordium block data.
//!
//! # Architecture
//!
//! ```text
//! ImportJob (batch importer)
//!     ├── CheckpointManager   (frontier, era counter, next pending change)
//!     ├── RetryPolicy         (fixed delay, transient errors only)
//!     └── EventReconciler     (one Repository transaction per batch)
//!              └── ranges     (already-read heights → skip log)
//!
//! BlockImporter (one BlockSession per staged block, checkpoint in session)
//!     ├── EventReconciler          (events of the block's height)
//!     ├── BakerImportHandler       (baker lifecycle, ChainTimeConfig)
//!     └── AccountChangeCalculator  (balances, statement entries, release schedules)
//! ```
//!
//! Storage, node access, health and metrics are injected through the traits
//! in [`repository`], [`block`], [`baker`], [`account`], [`checkpoint`], [`node`],
//! [`health`] and [`metrics`]; backends live in `ccdindex-storage`.

pub mod account;
pub mod baker;
pub mod block;
pub mod chain_time;
pub mod checkpoint;
pub mod error;
pub mod health;
pub mod importer;
pub mod job;
pub mod metrics;
pub mod node;
pub mod payload;
pub mod ranges;
pub mod reconciler;
pub mod repository;
pub mod retry;
pub mod types;

pub use account::{AccountChangeCalculator, AccountLookup};
pub use baker::{Baker, BakerImportHandler, BakerState, BakerStore, PendingChange};
pub use block::{
    BlockImportSummary, BlockImporter, BlockSession, BlockSessionFactory, BlockSource, BlockStores,
};
pub use chain_time::{ChainTimeConfig, ChainTimeParameters};
pub use checkpoint::{CheckpointManager, CheckpointStore, ImportState};
pub use error::ImportError;
pub use health::{HealthCheck, JobHealth};
pub use importer::{ImportJob, ImportSummary};
pub use job::{BlockImportConfig, FrontierSource, ImportJobConfig, JobState};
pub use metrics::{ImportMetrics, Metrics};
pub use node::NodeClient;
pub use reconciler::EventReconciler;
pub use repository::{Repository, RepositoryFactory};
pub use retry::{RetryConfig, RetryPolicy};
pub use types::{AccountAddress, BlockInfo, ImportSource};
