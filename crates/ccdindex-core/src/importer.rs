//! The batch importer: the outer control loop of the import job.
//!
//! # Cycle
//!
//! 1. Load the checkpoint and read the final height (storage or node).
//! 2. Stop if `final_height < next_batch * batch_size`; the job caught up.
//! 3. Run batches `next_batch..=final_height / batch_size` with at most
//!    `max_parallel_tasks` in flight. Each batch reconciles its height range
//!    in its own repository inside the retry policy.
//! 4. Once every batch committed, save the checkpoint with the advanced
//!    frontier and start over.
//!
//! A sampler task publishes the latest committed height while batches run.
//! Cancellation interrupts a batch even while its retry policy is waiting; the
//! interrupted batch rolls back and the frontier stays where it was.
//! Any error fails the job: it is logged, the job is marked unhealthy and the
//! error is returned to the caller. Restarting is up to the supervisor.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::error::ImportError;
use crate::health::HealthCheck;
use crate::job::{FrontierSource, ImportJobConfig, JobState};
use crate::metrics::{BatchTimer, Metrics};
use crate::node::NodeClient;
use crate::reconciler::{EventReconciler, ReconcileOutcome};
use crate::repository::RepositoryFactory;
use crate::retry::RetryPolicy;
use crate::types::ImportSource;

/// Message recorded with the health check when the job fails.
pub const UNHEALTHY_MESSAGE: &str = "Database import job stopped due to exception.";

/// Batch cursor of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportFrontier {
    pub final_height: u64,
    pub from_batch: u64,
    pub to_batch: u64,
}

/// Totals over a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub cycles: u64,
    pub batches: u64,
    pub heights_imported: u64,
    pub events_stored: u64,
    pub rejections_stored: u64,
    /// Final height seen by the last cycle.
    pub final_height: Option<u64>,
    /// The run stopped because cancellation was requested.
    pub cancelled: bool,
}

impl ImportSummary {
    fn absorb(&mut self, outcome: &ReconcileOutcome) {
        self.batches += 1;
        self.heights_imported += outcome.affected_heights;
        self.events_stored += outcome.stored_events;
        self.rejections_stored += outcome.stored_rejections;
    }
}

/// Shared per-batch dependencies.
struct BatchRunner {
    config: ImportJobConfig,
    repositories: Arc<dyn RepositoryFactory>,
    metrics: Arc<dyn Metrics>,
    retry: RetryPolicy,
    reconciler: EventReconciler,
}

impl BatchRunner {
    /// `None` if cancellation was requested before the batch started.
    async fn run(
        &self,
        batch: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<ReconcileOutcome>, ImportError> {
        if cancel.is_cancelled() {
            debug!(batch, "cancelled before start, skipping batch");
            return Ok(None);
        }
        let (from, to) = self.config.batch_range(batch);
        let source = self.reconciler.source();

        let attempts = self.retry.execute("batch import", move || async move {
            let mut timer = BatchTimer::start(self.metrics.clone(), source);
            let repo = self.repositories.create().await?;
            let outcome = self.reconciler.import_range(repo, from, to).await?;
            timer.set_success();
            Ok(outcome)
        });
        // Dropping the attempt in flight rolls its repository back.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(batch, from, to, "Batch cancelled while running");
                return Ok(None);
            }
            outcome = attempts => outcome?,
        };

        self.metrics
            .inc_transaction_events(outcome.stored_events + outcome.stored_rejections, source);
        if outcome.affected_heights > 0 {
            info!(batch, from, to, "Written heights");
        }
        Ok(Some(outcome))
    }
}

/// The import job.
pub struct ImportJob {
    runner: Arc<BatchRunner>,
    checkpoint: CheckpointManager,
    node: Option<Arc<dyn NodeClient>>,
    health: Arc<dyn HealthCheck>,
    state: JobState,
}

impl ImportJob {
    pub fn new(
        config: ImportJobConfig,
        repositories: Arc<dyn RepositoryFactory>,
        checkpoints: Box<dyn CheckpointStore>,
        health: Arc<dyn HealthCheck>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self, ImportError> {
        config.validate()?;
        let retry = RetryPolicy::from_config(&config.retry)?;
        let source = match config.frontier {
            FrontierSource::Repository => ImportSource::DatabaseImport,
            FrontierSource::Node => ImportSource::NodeImport,
        };
        let checkpoint = CheckpointManager::new(checkpoints, config.job_name.clone());
        Ok(Self {
            runner: Arc::new(BatchRunner {
                config,
                repositories,
                metrics,
                retry,
                reconciler: EventReconciler::new(source),
            }),
            checkpoint,
            node: None,
            health,
            state: JobState::Idle,
        })
    }

    /// Attach the node used when the frontier source is [`FrontierSource::Node`].
    pub fn with_node(mut self, node: Arc<dyn NodeClient>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn job_name(&self) -> &str {
        &self.runner.config.job_name
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn set_state(&mut self, state: JobState) {
        debug!(job = %self.runner.config.job_name, from = %self.state, to = %state, "job state");
        self.state = state;
    }

    /// Run cycles until the frontier catches up with the final height or
    /// `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<ImportSummary, ImportError> {
        match self.run_cycles(&cancel).await {
            Ok(summary) => {
                self.set_state(JobState::Idle);
                info!(job = %self.job_name(), ?summary, "Done with job");
                Ok(summary)
            }
            Err(err) => {
                self.set_state(JobState::Failed);
                let job = self.runner.config.job_name.clone();
                error!(job = %job, error = %err, "Import job stopped due to exception");
                self.health.mark_unhealthy(&job, UNHEALTHY_MESSAGE);
                Err(err)
            }
        }
    }

    async fn run_cycles(&mut self, cancel: &CancellationToken) -> Result<ImportSummary, ImportError> {
        let mut summary = ImportSummary::default();
        let batch_size = self.runner.config.batch_size;

        while !cancel.is_cancelled() {
            self.set_state(JobState::ComputingFrontier);
            let mut state = self.checkpoint.load_state().await?;
            let final_height = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                height = self.final_height() => height?,
            };
            summary.final_height = Some(final_height);

            if final_height < state.next_batch.saturating_mul(batch_size) {
                break;
            }
            let frontier = ImportFrontier {
                final_height,
                from_batch: state.next_batch,
                to_batch: final_height / batch_size,
            };
            info!(
                final_height,
                from_batch = frontier.from_batch,
                to_batch = frontier.to_batch,
                "Starting import cycle"
            );

            self.set_state(JobState::RunningBatches);
            let sampler_cancel = cancel.child_token();
            let sampler = tokio::spawn(sample_read_height(
                self.runner.clone(),
                sampler_cancel.clone(),
            ));

            let result = self.run_batches(frontier, cancel).await;

            sampler_cancel.cancel();
            if let Err(err) = sampler.await {
                warn!(error = %err, "read height sampler terminated abnormally");
            }

            let outcomes = result?;
            let all_done = outcomes.iter().all(Option::is_some);
            for outcome in outcomes.iter().flatten() {
                summary.absorb(outcome);
            }
            if !all_done {
                info!(from_batch = frontier.from_batch, "Cycle cancelled, frontier not advanced");
                summary.cancelled = true;
                return Ok(summary);
            }

            self.set_state(JobState::Committing);
            state.next_batch = frontier.to_batch + 1;
            self.checkpoint.save_state(&state).await?;
            summary.cycles += 1;
            self.set_state(JobState::Idle);
        }

        summary.cancelled |= cancel.is_cancelled();
        Ok(summary)
    }

    async fn run_batches(
        &self,
        frontier: ImportFrontier,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<ReconcileOutcome>>, ImportError> {
        let runner = &self.runner;
        stream::iter(frontier.from_batch..=frontier.to_batch)
            .map(move |batch| runner.run(batch, cancel))
            .buffer_unordered(runner.config.max_parallel_tasks)
            .try_collect()
            .await
    }

    async fn final_height(&self) -> Result<u64, ImportError> {
        let runner = &self.runner;
        match runner.config.frontier {
            FrontierSource::Repository => {
                runner
                    .retry
                    .execute("final height", move || async move {
                        runner.repositories.create().await?.final_height().await
                    })
                    .await
            }
            FrontierSource::Node => {
                let node = self.node.as_ref().ok_or_else(|| {
                    ImportError::Config("frontier source is node but no node client is attached".into())
                })?;
                runner
                    .retry
                    .execute("consensus info", move || async move {
                        Ok(node.consensus_info().await?.last_finalized_height)
                    })
                    .await
            }
        }
    }
}

/// Publish the latest committed height until `cancel` fires.
async fn sample_read_height(runner: Arc<BatchRunner>, cancel: CancellationToken) {
    let delay = Duration::from_millis(runner.config.metric_delay_ms);
    let source = runner.reconciler.source();
    while !cancel.is_cancelled() {
        match latest_read_height(&runner).await {
            Ok(Some(height)) => runner.metrics.set_read_height(height, source),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to sample latest read height"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn latest_read_height(runner: &BatchRunner) -> Result<Option<u64>, ImportError> {
    runner.repositories.create().await?.latest_read_height().await
}
