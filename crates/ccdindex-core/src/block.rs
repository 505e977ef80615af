//! The block importer: applies staged blocks one height at a time.
//!
//! For every staged height above the checkpoint's last block height, in order:
//!
//! 1. open a [`BlockSession`] (one storage transaction),
//! 2. reconcile the height's events and rejections; a height the batch
//!    importer already marked read keeps its rows,
//! 3. apply baker updates,
//! 4. create accounts, store the transactions and their account relations,
//!    apply the aggregated balance updates, write statement entries and
//!    release schedule items,
//! 5. write the checkpoint with the new last block height into the session,
//! 6. commit.
//!
//! Steps 1 to 6 run inside the retry policy and restart from scratch after a
//! transient failure. The checkpoint commits together with the block, so a
//! committed block is never applied again. Cancellation stops the importer
//! between blocks or drops the block in flight, which rolls it back.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::account::{
    Account, AccountChangeCalculator, AccountLookup, AccountReleaseScheduleItem,
    AccountStatementEntry, AccountTransactionRelation, AccountUpdate, AccountUpdateResult,
    BlockAccountLookup, TransactionPair,
};
use crate::baker::{BakerImportHandler, BakerStore};
use crate::chain_time::ChainTimeConfig;
use crate::checkpoint::{CheckpointManager, CheckpointStore, ImportCheckpoint, ImportState};
use crate::error::ImportError;
use crate::health::HealthCheck;
use crate::job::BlockImportConfig;
use crate::metrics::{BatchTimer, Metrics};
use crate::payload::{BlockDataPayload, TransactionSummary};
use crate::reconciler::{EventReconciler, ReconcileOutcome};
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::types::{BlockInfo, ImportSource};

/// Message recorded with the health check when the block importer fails.
pub const UNHEALTHY_MESSAGE: &str = "Block import job stopped due to exception.";

// ─── Storage seams ────────────────────────────────────────────────────────────

/// Staged block data, one payload per height.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Highest staged height, or `None` if nothing is staged.
    async fn last_staged_height(&self) -> Result<Option<u64>, ImportError>;

    async fn block_payload(&self, height: u64) -> Result<Option<BlockDataPayload>, ImportError>;
}

/// Unit of work for one block.
///
/// Everything written through the session, the checkpoint included, becomes
/// visible with [`Repository::commit`].
#[async_trait]
pub trait BlockSession: Repository + BakerStore {
    fn as_repository(&mut self) -> &mut dyn Repository;

    fn as_baker_store(&mut self) -> &mut dyn BakerStore;

    async fn add_accounts(&mut self, accounts: &[Account]) -> Result<(), ImportError>;

    /// Store the block's transactions; returns their ids in input order.
    async fn add_transactions(
        &mut self,
        block: &BlockInfo,
        transactions: &[TransactionSummary],
    ) -> Result<Vec<u64>, ImportError>;

    async fn add_account_transactions(
        &mut self,
        relations: &[AccountTransactionRelation],
    ) -> Result<(), ImportError>;

    /// Apply balance adjustments and transaction counts.
    ///
    /// Fails if an account does not exist or its balance would go negative.
    async fn apply_account_updates(
        &mut self,
        updates: &[AccountUpdate],
    ) -> Result<Vec<AccountUpdateResult>, ImportError>;

    async fn add_statement_entries(
        &mut self,
        entries: &[AccountStatementEntry],
    ) -> Result<(), ImportError>;

    async fn add_release_schedule_items(
        &mut self,
        items: &[AccountReleaseScheduleItem],
    ) -> Result<(), ImportError>;

    /// Upsert the checkpoint row as part of this session.
    async fn save_checkpoint(&mut self, checkpoint: ImportCheckpoint) -> Result<(), ImportError>;
}

/// Opens one [`BlockSession`] per block.
#[async_trait]
pub trait BlockSessionFactory: Send + Sync {
    async fn open_block_session(&self) -> Result<Box<dyn BlockSession>, ImportError>;
}

/// Storage handles used by the [`BlockImporter`].
pub struct BlockStores {
    pub sessions: Arc<dyn BlockSessionFactory>,
    pub blocks: Arc<dyn BlockSource>,
    pub accounts: Arc<dyn AccountLookup>,
    pub checkpoints: Box<dyn CheckpointStore>,
}

impl BlockStores {
    /// Every handle served by one cloneable backend.
    pub fn shared<S>(storage: S) -> Self
    where
        S: BlockSessionFactory + BlockSource + AccountLookup + CheckpointStore + Clone + 'static,
    {
        Self {
            sessions: Arc::new(storage.clone()),
            blocks: Arc::new(storage.clone()),
            accounts: Arc::new(storage.clone()),
            checkpoints: Box::new(storage),
        }
    }
}

// ─── Importer ─────────────────────────────────────────────────────────────────

/// Totals over one [`BlockImporter::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockImportSummary {
    pub blocks: u64,
    pub events_stored: u64,
    pub rejections_stored: u64,
    /// Last committed block, including blocks of earlier runs.
    pub last_block_height: Option<u64>,
    /// Total stake after the last block of this run.
    pub total_amount_staked: Option<u64>,
    pub cancelled: bool,
}

struct BlockOutcome {
    state: ImportState,
    events: ReconcileOutcome,
    total_amount_staked: u64,
}

pub struct BlockImporter {
    retry: RetryPolicy,
    chain_time: ChainTimeConfig,
    sessions: Arc<dyn BlockSessionFactory>,
    blocks: Arc<dyn BlockSource>,
    accounts: Arc<dyn AccountLookup>,
    checkpoint: CheckpointManager,
    reconciler: EventReconciler,
    health: Arc<dyn HealthCheck>,
    metrics: Arc<dyn Metrics>,
}

impl BlockImporter {
    pub fn new(
        config: BlockImportConfig,
        chain_time: ChainTimeConfig,
        stores: BlockStores,
        health: Arc<dyn HealthCheck>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self, ImportError> {
        config.validate()?;
        chain_time.validate()?;
        let retry = RetryPolicy::from_config(&config.retry)?;
        let BlockStores {
            sessions,
            blocks,
            accounts,
            checkpoints,
        } = stores;
        Ok(Self {
            retry,
            chain_time,
            sessions,
            blocks,
            accounts,
            checkpoint: CheckpointManager::new(checkpoints, config.job_name),
            reconciler: EventReconciler::new(ImportSource::NodeImport),
            health,
            metrics,
        })
    }

    pub fn job_name(&self) -> &str {
        self.checkpoint.job_name()
    }

    /// Import every staged block after the last committed one, until the
    /// staged data runs out or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<BlockImportSummary, ImportError> {
        match self.run_blocks(&cancel).await {
            Ok(summary) => {
                info!(job = %self.job_name(), ?summary, "Done with block import");
                Ok(summary)
            }
            Err(err) => {
                let job = self.job_name();
                error!(job = %job, error = %err, "Block import stopped due to exception");
                self.health.mark_unhealthy(job, UNHEALTHY_MESSAGE);
                Err(err)
            }
        }
    }

    async fn run_blocks(&self, cancel: &CancellationToken) -> Result<BlockImportSummary, ImportError> {
        let mut state = self.checkpoint.load_state().await?;
        let mut summary = BlockImportSummary {
            last_block_height: state.last_block_height,
            ..Default::default()
        };

        let blocks = &self.blocks;
        let last_staged = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                summary.cancelled = true;
                return Ok(summary);
            }
            height = self.retry.execute("last staged block", || blocks.last_staged_height()) => height?,
        };
        let Some(last_staged) = last_staged else {
            return Ok(summary);
        };

        let mut height = state.last_block_height.map_or(0, |h| h + 1);
        while height <= last_staged {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let imported = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(height, "Block import cancelled while running");
                    summary.cancelled = true;
                    break;
                }
                imported = self.retry.execute("block import", || self.import_block(height, &state)) => imported?,
            };
            let Some(outcome) = imported else {
                debug!(height, last_staged, "no payload staged for height, waiting");
                break;
            };

            let source = self.reconciler.source();
            self.metrics.set_read_height(height, source);
            self.metrics.inc_transaction_events(
                outcome.events.stored_events + outcome.events.stored_rejections,
                source,
            );
            summary.blocks += 1;
            summary.events_stored += outcome.events.stored_events;
            summary.rejections_stored += outcome.events.stored_rejections;
            summary.total_amount_staked = Some(outcome.total_amount_staked);
            summary.last_block_height = Some(height);
            state = outcome.state;
            height += 1;
        }
        Ok(summary)
    }

    /// One attempt at importing `height`; `None` if it is not staged.
    async fn import_block(
        &self,
        height: u64,
        committed: &ImportState,
    ) -> Result<Option<BlockOutcome>, ImportError> {
        let Some(payload) = self.blocks.block_payload(height).await? else {
            return Ok(None);
        };
        if payload.block.height != height {
            return Err(ImportError::DataIntegrity(format!(
                "payload staged for height {height} describes block {}",
                payload.block.height
            )));
        }

        let mut timer = BatchTimer::start(self.metrics.clone(), self.reconciler.source());
        let mut state = committed.clone();
        let mut session = self.sessions.open_block_session().await?;

        let events = self
            .reconciler
            .reconcile_range(session.as_repository(), height, height)
            .await?;

        let lookup: Arc<dyn AccountLookup> = Arc::new(BlockAccountLookup::new(
            self.accounts.clone(),
            &payload.created_accounts,
        ));
        let bakers = BakerImportHandler::new(self.chain_time.clone(), lookup.clone());
        let baker_results = bakers
            .handle_baker_updates(session.as_baker_store(), &payload, &mut state)
            .await?;

        let accounts = AccountChangeCalculator::new(lookup);
        self.apply_account_changes(session.as_mut(), &accounts, &payload)
            .await?;

        state.last_block_height = Some(height);
        session.save_checkpoint(self.checkpoint.checkpoint(&state)).await?;
        session.commit().await?;
        timer.set_success();
        debug!(
            height,
            events = events.stored_events,
            total_amount_staked = baker_results.total_amount_staked,
            "block committed"
        );

        Ok(Some(BlockOutcome {
            state,
            events,
            total_amount_staked: baker_results.total_amount_staked,
        }))
    }

    async fn apply_account_changes(
        &self,
        session: &mut dyn BlockSession,
        accounts: &AccountChangeCalculator,
        payload: &BlockDataPayload,
    ) -> Result<(), ImportError> {
        let block = &payload.block;
        let created = accounts.accounts_created(&payload.created_accounts, block.slot_time);
        session.add_accounts(&created).await?;

        let ids = session.add_transactions(block, &payload.transactions).await?;
        if ids.len() != payload.transactions.len() {
            return Err(ImportError::storage(format!(
                "stored {} of {} transactions of block {}",
                ids.len(),
                payload.transactions.len(),
                block.height
            )));
        }
        let transactions: Vec<TransactionPair> = payload
            .transactions
            .iter()
            .cloned()
            .zip(ids)
            .map(|(source, transaction_id)| TransactionPair {
                source,
                transaction_id,
            })
            .collect();

        let relations = accounts.account_transaction_relations(&transactions).await?;
        session.add_account_transactions(&relations).await?;

        let balance_updates = payload.balance_updates();
        let updates = accounts
            .aggregated_account_updates(&balance_updates, &relations)
            .await?;
        let results = session.apply_account_updates(&updates).await?;
        let entries = accounts
            .account_statement_entries(
                &balance_updates,
                &results,
                block.height,
                block.slot_time,
                &transactions,
            )
            .await?;
        session.add_statement_entries(&entries).await?;

        let schedule = accounts.account_release_schedule_items(&transactions).await?;
        session.add_release_schedule_items(&schedule).await
    }
}
