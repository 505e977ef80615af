//! Postgres backend.
//!
//! Each [`PostgresRepository`] holds one `sqlx` transaction. A batch or a
//! block, and for blocks the checkpoint row as well, becomes visible in a
//! single commit; dropping the session rolls it back. Staging input (candidate
//! rows and block payloads) is written through the pool by whatever feeds the
//! importer.
//!
//! Compiled only with the `postgres` feature of `ccdindex-storage`.
//!
//! ```rust,no_run
//! use ccdindex_core::block::BlockSource;
//! use ccdindex_storage::postgres::{PostgresOptions, PostgresStorage};
//!
//! # async fn open(url: &str) -> Result<(), ccdindex_core::error::ImportError> {
//! let options = PostgresOptions { max_connections: 4, ..Default::default() };
//! let storage = PostgresStorage::connect_with_options(url, options).await?;
//! let staged = storage.last_staged_height().await?;
//! # let _ = staged;
//! # Ok(())
//! # }
//! ```
//!
//! ## Tables
//!
//! `connect` creates missing tables and columns; existing rows are left alone.
//!
//! | Table | Key |
//! |-------|-----|
//! | `ccdindex_checkpoints` | job name |
//! | `ccdindex_candidate_events`, `ccdindex_candidate_rejections` | serial id, indexed by height |
//! | `ccdindex_block_payloads` | height |
//! | `ccdindex_events`, `ccdindex_rejections` | `(block_height, transaction_index, event_index)` |
//! | `ccdindex_read_heights` | height |
//! | `ccdindex_bakers` | baker id |
//! | `ccdindex_accounts` | account id; both addresses unique |
//! | `ccdindex_transactions` | serial id |
//! | `ccdindex_account_transactions` | `(account_id, transaction_id)` |
//! | `ccdindex_account_statement_entries` | serial id |
//! | `ccdindex_account_release_schedule` | `(account_id, transaction_id, schedule_index)` |

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use ccdindex_core::account::{
    Account, AccountLookup, AccountReleaseScheduleItem, AccountStatementEntry,
    AccountTransactionRelation, AccountUpdate, AccountUpdateResult,
};
use ccdindex_core::baker::{Baker, BakerStore};
use ccdindex_core::block::{BlockSession, BlockSessionFactory, BlockSource};
use ccdindex_core::checkpoint::{CheckpointStore, ImportCheckpoint};
use ccdindex_core::error::ImportError;
use ccdindex_core::payload::{BlockDataPayload, TransactionSummary};
use ccdindex_core::repository::{Repository, RepositoryFactory};
use ccdindex_core::types::{
    AccountAddress, BlockInfo, CandidateEvent, CandidateRejection, ReadHeight, RowKind,
    StoredEvent, StoredRejection,
};

// ─── Pool ─────────────────────────────────────────────────────────────────────

/// Pool sizing for [`PostgresStorage::connect_with_options`].
///
/// Each running batch and each block holds a connection until it commits, so
/// `max_connections` should exceed the job's `max_parallel_tasks`.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub max_connections: u32,
    /// Idle connections kept open.
    pub min_connections: u32,
    /// Seconds to wait for a free connection before failing transiently.
    pub connect_timeout_secs: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
        }
    }
}

// ─── Error mapping ────────────────────────────────────────────────────────────

/// Map a driver error, classifying connection loss and contention as transient.
pub fn map_sqlx_error(err: sqlx::Error) -> ImportError {
    let transient = match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db.code().map_or(false, |code| is_transient_sqlstate(&code)),
        _ => false,
    };
    ImportError::Storage {
        message: err.to_string(),
        transient,
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "57014" | "53300") || code.starts_with("08")
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, ImportError> {
    serde_json::to_value(value).map_err(|e| ImportError::storage(format!("serialize: {e}")))
}

fn from_json<T: DeserializeOwned>(row: &PgRow, column: &str) -> Result<T, ImportError> {
    let value: serde_json::Value = row.try_get(column).map_err(map_sqlx_error)?;
    serde_json::from_value(value).map_err(|e| ImportError::DataIntegrity(format!("{column}: {e}")))
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn to_i64(value: u64) -> Result<i64, ImportError> {
    i64::try_from(value)
        .map_err(|_| ImportError::DataIntegrity(format!("{value} exceeds BIGINT")))
}

fn checkpoint_upsert(checkpoint: &ImportCheckpoint) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        "INSERT INTO ccdindex_checkpoints
            (job_name, next_batch, last_block_height, last_genesis_index,
             next_pending_baker_change_time, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (job_name)
         DO UPDATE SET
            next_batch                     = EXCLUDED.next_batch,
            last_block_height              = EXCLUDED.last_block_height,
            last_genesis_index             = EXCLUDED.last_genesis_index,
            next_pending_baker_change_time = EXCLUDED.next_pending_baker_change_time,
            updated_at                     = EXCLUDED.updated_at",
    )
    .bind(&checkpoint.job_name)
    .bind(checkpoint.next_batch as i64)
    .bind(checkpoint.last_block_height.map(|h| h as i64))
    .bind(checkpoint.last_genesis_index as i32)
    .bind(checkpoint.next_pending_baker_change_time)
    .bind(checkpoint.updated_at)
}

// ─── PostgresStorage ─────────────────────────────────────────────────────────

/// Import storage on a Postgres pool. Clones share the pool.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Open a pool with default [`PostgresOptions`] and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self, ImportError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, ImportError> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(Duration::from_secs(opts.connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        info!(
            max_connections = opts.max_connections,
            "import storage ready"
        );
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), ImportError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS ccdindex_checkpoints (
                job_name                       TEXT        PRIMARY KEY,
                next_batch                     BIGINT      NOT NULL,
                last_block_height              BIGINT,
                last_genesis_index             INTEGER     NOT NULL,
                next_pending_baker_change_time TIMESTAMPTZ,
                updated_at                     TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ccdindex_candidate_events (
                id           BIGSERIAL PRIMARY KEY,
                block_height BIGINT    NOT NULL,
                candidate    JSONB     NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_ccdindex_candidate_events_height
                ON ccdindex_candidate_events (block_height)",
            "CREATE TABLE IF NOT EXISTS ccdindex_candidate_rejections (
                id           BIGSERIAL PRIMARY KEY,
                block_height BIGINT    NOT NULL,
                candidate    JSONB     NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_ccdindex_candidate_rejections_height
                ON ccdindex_candidate_rejections (block_height)",
            "CREATE TABLE IF NOT EXISTS ccdindex_events (
                block_height      BIGINT      NOT NULL,
                transaction_index INTEGER     NOT NULL,
                event_index       INTEGER     NOT NULL,
                transaction_hash  TEXT        NOT NULL,
                sender            BYTEA       NOT NULL,
                block_slot_time   TIMESTAMPTZ NOT NULL,
                source            TEXT        NOT NULL,
                event             JSONB       NOT NULL,
                PRIMARY KEY (block_height, transaction_index, event_index)
            )",
            "CREATE TABLE IF NOT EXISTS ccdindex_rejections (
                block_height      BIGINT      NOT NULL,
                transaction_index INTEGER     NOT NULL,
                event_index       INTEGER     NOT NULL,
                transaction_hash  TEXT        NOT NULL,
                sender            BYTEA       NOT NULL,
                block_slot_time   TIMESTAMPTZ NOT NULL,
                source            TEXT        NOT NULL,
                reason            JSONB       NOT NULL,
                PRIMARY KEY (block_height, transaction_index, event_index)
            )",
            "CREATE TABLE IF NOT EXISTS ccdindex_read_heights (
                block_height BIGINT      PRIMARY KEY,
                source       TEXT        NOT NULL,
                created_at   TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ccdindex_bakers (
                baker_id               BIGINT PRIMARY KEY,
                staked_amount          BIGINT,
                pending_effective_time TIMESTAMPTZ,
                state                  JSONB  NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ccdindex_accounts (
                account_id        BIGINT      PRIMARY KEY,
                canonical_address BYTEA       NOT NULL UNIQUE,
                base_address      BYTEA       NOT NULL UNIQUE,
                balance           BIGINT      NOT NULL,
                transaction_count BIGINT      NOT NULL DEFAULT 0,
                created_at        TIMESTAMPTZ NOT NULL
            )",
            "ALTER TABLE ccdindex_checkpoints ADD COLUMN IF NOT EXISTS last_block_height BIGINT",
            "ALTER TABLE ccdindex_accounts
                ADD COLUMN IF NOT EXISTS transaction_count BIGINT NOT NULL DEFAULT 0",
            "CREATE TABLE IF NOT EXISTS ccdindex_block_payloads (
                block_height BIGINT PRIMARY KEY,
                payload      JSONB  NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ccdindex_transactions (
                id               BIGSERIAL PRIMARY KEY,
                block_height     BIGINT    NOT NULL,
                transaction_hash TEXT      NOT NULL UNIQUE
            )",
            "CREATE TABLE IF NOT EXISTS ccdindex_account_transactions (
                account_id     BIGINT NOT NULL,
                transaction_id BIGINT NOT NULL,
                PRIMARY KEY (account_id, transaction_id)
            )",
            "CREATE TABLE IF NOT EXISTS ccdindex_account_statement_entries (
                id              BIGSERIAL   PRIMARY KEY,
                account_id      BIGINT      NOT NULL,
                timestamp       TIMESTAMPTZ NOT NULL,
                amount          BIGINT      NOT NULL,
                entry_type      TEXT        NOT NULL,
                block_id        BIGINT      NOT NULL,
                transaction_id  BIGINT,
                account_balance BIGINT      NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_ccdindex_statement_entries_account
                ON ccdindex_account_statement_entries (account_id, id)",
            "CREATE TABLE IF NOT EXISTS ccdindex_account_release_schedule (
                account_id      BIGINT      NOT NULL,
                transaction_id  BIGINT      NOT NULL,
                schedule_index  INTEGER     NOT NULL,
                timestamp       TIMESTAMPTZ NOT NULL,
                amount          BIGINT      NOT NULL,
                from_account_id BIGINT      NOT NULL,
                PRIMARY KEY (account_id, transaction_id, schedule_index)
            )",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    /// Open a repository session over a fresh transaction.
    pub async fn session(&self) -> Result<PostgresRepository, ImportError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(PostgresRepository { tx })
    }

    /// Stage a candidate event.
    pub async fn add_candidate_event(&self, event: &CandidateEvent) -> Result<(), ImportError> {
        sqlx::query(
            "INSERT INTO ccdindex_candidate_events (block_height, candidate) VALUES ($1, $2)",
        )
        .bind(event.block_height as i64)
        .bind(to_json(event)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Stage a candidate rejection.
    pub async fn add_candidate_rejection(
        &self,
        rejection: &CandidateRejection,
    ) -> Result<(), ImportError> {
        sqlx::query(
            "INSERT INTO ccdindex_candidate_rejections (block_height, candidate) VALUES ($1, $2)",
        )
        .bind(rejection.block_height as i64)
        .bind(to_json(rejection)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Stage the payload of one block; a payload already staged at that height is replaced.
    pub async fn add_block_payload(&self, payload: &BlockDataPayload) -> Result<(), ImportError> {
        sqlx::query(
            "INSERT INTO ccdindex_block_payloads (block_height, payload) VALUES ($1, $2)
             ON CONFLICT (block_height) DO UPDATE SET payload = EXCLUDED.payload",
        )
        .bind(to_i64(payload.block.height)?)
        .bind(to_json(payload)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Insert an account outside any session, e.g. to seed a test database.
    pub async fn insert_account(&self, account: &Account) -> Result<(), ImportError> {
        insert_account(account)?
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn insert_account(account: &Account) -> Result<Query<'static, Postgres, PgArguments>, ImportError> {
    Ok(sqlx::query(
        "INSERT INTO ccdindex_accounts
            (account_id, canonical_address, base_address, balance, transaction_count, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(to_i64(account.id)?)
    .bind(account.canonical_address.0.to_vec())
    .bind(account.base_address.0.to_vec())
    .bind(to_i64(account.balance)?)
    .bind(to_i64(account.transaction_count)?)
    .bind(account.created_at))
}

#[async_trait]
impl RepositoryFactory for PostgresStorage {
    async fn create(&self) -> Result<Box<dyn Repository>, ImportError> {
        Ok(Box::new(self.session().await?))
    }
}

#[async_trait]
impl BlockSessionFactory for PostgresStorage {
    async fn open_block_session(&self) -> Result<Box<dyn BlockSession>, ImportError> {
        Ok(Box::new(self.session().await?))
    }
}

#[async_trait]
impl BlockSource for PostgresStorage {
    async fn last_staged_height(&self) -> Result<Option<u64>, ImportError> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(block_height) FROM ccdindex_block_payloads")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        Ok(max.map(to_u64))
    }

    async fn block_payload(&self, height: u64) -> Result<Option<BlockDataPayload>, ImportError> {
        let row = sqlx::query("SELECT payload FROM ccdindex_block_payloads WHERE block_height = $1")
            .bind(to_i64(height)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|r| from_json(&r, "payload")).transpose()
    }
}

// ─── CheckpointStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for PostgresStorage {
    async fn load(&self, job_name: &str) -> Result<Option<ImportCheckpoint>, ImportError> {
        let row = sqlx::query(
            "SELECT next_batch, last_block_height, last_genesis_index,
                    next_pending_baker_change_time, updated_at
             FROM ccdindex_checkpoints
             WHERE job_name = $1",
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|r| -> Result<ImportCheckpoint, sqlx::Error> {
            Ok(ImportCheckpoint {
                job_name: job_name.to_string(),
                next_batch: to_u64(r.try_get("next_batch")?),
                last_block_height: r.try_get::<Option<i64>, _>("last_block_height")?.map(to_u64),
                last_genesis_index: r.try_get::<i32, _>("last_genesis_index")?.max(0) as u32,
                next_pending_baker_change_time: r.try_get("next_pending_baker_change_time")?,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
        .map_err(map_sqlx_error)
    }

    async fn save(&self, checkpoint: ImportCheckpoint) -> Result<(), ImportError> {
        checkpoint_upsert(&checkpoint)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!(
            job = %checkpoint.job_name,
            next_batch = checkpoint.next_batch,
            last_block_height = ?checkpoint.last_block_height,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, job_name: &str) -> Result<(), ImportError> {
        sqlx::query("DELETE FROM ccdindex_checkpoints WHERE job_name = $1")
            .bind(job_name)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl AccountLookup for PostgresStorage {
    async fn account_ids(
        &self,
        base_addresses: &[AccountAddress],
    ) -> Result<HashMap<AccountAddress, u64>, ImportError> {
        let keys: Vec<Vec<u8>> = base_addresses.iter().map(|a| a.0.to_vec()).collect();
        let rows = sqlx::query(
            "SELECT account_id, base_address FROM ccdindex_accounts
             WHERE base_address = ANY($1)",
        )
        .bind(keys)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|r| {
                let id: i64 = r.try_get("account_id").map_err(map_sqlx_error)?;
                let bytes: Vec<u8> = r.try_get("base_address").map_err(map_sqlx_error)?;
                let address = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    ImportError::DataIntegrity(format!("account {id}: malformed base address"))
                })?;
                Ok((AccountAddress(address), to_u64(id)))
            })
            .collect()
    }
}

// ─── Repository session ───────────────────────────────────────────────────────

/// A repository over one Postgres transaction.
///
/// Dropping it without calling [`Repository::commit`] rolls back.
pub struct PostgresRepository {
    tx: Transaction<'static, Postgres>,
}

impl PostgresRepository {
    /// Commit the underlying transaction.
    pub async fn commit_transaction(self) -> Result<(), ImportError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn candidates<T: DeserializeOwned>(
        &mut self,
        table: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<T>, ImportError> {
        let sql = format!(
            "SELECT candidate FROM {table}
             WHERE block_height >= $1 AND block_height <= $2
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(from as i64)
            .bind(to as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(|r| from_json(r, "candidate")).collect()
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn latest_read_height(&mut self) -> Result<Option<u64>, ImportError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(block_height) FROM ccdindex_read_heights")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(max.map(to_u64))
    }

    async fn final_height(&mut self) -> Result<u64, ImportError> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT GREATEST(
                (SELECT MAX(block_height) FROM ccdindex_candidate_events),
                (SELECT MAX(block_height) FROM ccdindex_candidate_rejections)
             )",
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(max.map_or(0, to_u64))
    }

    async fn read_heights_in_range(&mut self, from: u64, to: u64) -> Result<Vec<u64>, ImportError> {
        let heights: Vec<i64> = sqlx::query_scalar(
            "SELECT block_height FROM ccdindex_read_heights
             WHERE block_height >= $1 AND block_height <= $2
             ORDER BY block_height ASC",
        )
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(heights.into_iter().map(to_u64).collect())
    }

    async fn candidate_events(
        &mut self,
        from: u64,
        to: u64,
    ) -> Result<Vec<CandidateEvent>, ImportError> {
        self.candidates("ccdindex_candidate_events", from, to).await
    }

    async fn candidate_rejections(
        &mut self,
        from: u64,
        to: u64,
    ) -> Result<Vec<CandidateRejection>, ImportError> {
        self.candidates("ccdindex_candidate_rejections", from, to).await
    }

    async fn next_index(
        &mut self,
        kind: RowKind,
        block_height: u64,
        transaction_index: u32,
    ) -> Result<u32, ImportError> {
        let sql = match kind {
            RowKind::Event => {
                "SELECT MAX(event_index) FROM ccdindex_events
                 WHERE block_height = $1 AND transaction_index = $2"
            }
            RowKind::Rejection => {
                "SELECT MAX(event_index) FROM ccdindex_rejections
                 WHERE block_height = $1 AND transaction_index = $2"
            }
        };
        let max: Option<i32> = sqlx::query_scalar(sql)
            .bind(block_height as i64)
            .bind(transaction_index as i32)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(max.map_or(0, |i| i.max(0) as u32 + 1))
    }

    async fn add_event(&mut self, event: StoredEvent) -> Result<(), ImportError> {
        sqlx::query(
            "INSERT INTO ccdindex_events
                (block_height, transaction_index, event_index, transaction_hash,
                 sender, block_slot_time, source, event)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.block_height as i64)
        .bind(event.transaction_index as i32)
        .bind(event.event_index as i32)
        .bind(&event.transaction_hash)
        .bind(event.sender.0.to_vec())
        .bind(event.block_slot_time)
        .bind(event.source.as_str())
        .bind(&event.event)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn add_rejection(&mut self, rejection: StoredRejection) -> Result<(), ImportError> {
        sqlx::query(
            "INSERT INTO ccdindex_rejections
                (block_height, transaction_index, event_index, transaction_hash,
                 sender, block_slot_time, source, reason)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(rejection.block_height as i64)
        .bind(rejection.transaction_index as i32)
        .bind(rejection.event_index as i32)
        .bind(&rejection.transaction_hash)
        .bind(rejection.sender.0.to_vec())
        .bind(rejection.block_slot_time)
        .bind(rejection.source.as_str())
        .bind(&rejection.reason)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn add_read_height(&mut self, marker: ReadHeight) -> Result<(), ImportError> {
        sqlx::query(
            "INSERT INTO ccdindex_read_heights (block_height, source, created_at)
             VALUES ($1, $2, $3)",
        )
        .bind(marker.block_height as i64)
        .bind(marker.source.as_str())
        .bind(marker.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), ImportError> {
        self.commit_transaction().await
    }
}

#[async_trait]
impl BakerStore for PostgresRepository {
    async fn get_baker(&mut self, id: u64) -> Result<Option<Baker>, ImportError> {
        let row = sqlx::query("SELECT state FROM ccdindex_bakers WHERE baker_id = $1")
            .bind(id as i64)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|r| from_json(&r, "state")).transpose()
    }

    async fn save_baker(&mut self, baker: Baker) -> Result<(), ImportError> {
        let staked = baker.active().map(|a| a.staked_amount as i64);
        let pending: Option<DateTime<Utc>> = baker.pending_change().map(|c| c.effective_time());
        sqlx::query(
            "INSERT INTO ccdindex_bakers (baker_id, staked_amount, pending_effective_time, state)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (baker_id)
             DO UPDATE SET
                staked_amount          = EXCLUDED.staked_amount,
                pending_effective_time = EXCLUDED.pending_effective_time,
                state                  = EXCLUDED.state",
        )
        .bind(baker.id as i64)
        .bind(staked)
        .bind(pending)
        .bind(to_json(&baker)?)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn bakers_with_pending_change(&mut self) -> Result<Vec<Baker>, ImportError> {
        let rows = sqlx::query(
            "SELECT state FROM ccdindex_bakers
             WHERE pending_effective_time IS NOT NULL
             ORDER BY baker_id ASC",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(|r| from_json(r, "state")).collect()
    }

    async fn total_amount_staked(&mut self) -> Result<u64, ImportError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(staked_amount), 0)::BIGINT FROM ccdindex_bakers",
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(to_u64(total))
    }
}

#[async_trait]
impl BlockSession for PostgresRepository {
    fn as_repository(&mut self) -> &mut dyn Repository {
        self
    }

    fn as_baker_store(&mut self) -> &mut dyn BakerStore {
        self
    }

    async fn add_accounts(&mut self, accounts: &[Account]) -> Result<(), ImportError> {
        for account in accounts {
            insert_account(account)?
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    async fn add_transactions(
        &mut self,
        block: &BlockInfo,
        transactions: &[TransactionSummary],
    ) -> Result<Vec<u64>, ImportError> {
        let mut ids = Vec::with_capacity(transactions.len());
        for tx in transactions {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO ccdindex_transactions (block_height, transaction_hash)
                 VALUES ($1, $2)
                 RETURNING id",
            )
            .bind(to_i64(block.height)?)
            .bind(&tx.hash)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
            ids.push(to_u64(id));
        }
        Ok(ids)
    }

    async fn add_account_transactions(
        &mut self,
        relations: &[AccountTransactionRelation],
    ) -> Result<(), ImportError> {
        for r in relations {
            sqlx::query(
                "INSERT INTO ccdindex_account_transactions (account_id, transaction_id)
                 VALUES ($1, $2)",
            )
            .bind(to_i64(r.account_id)?)
            .bind(to_i64(r.transaction_id)?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    async fn apply_account_updates(
        &mut self,
        updates: &[AccountUpdate],
    ) -> Result<Vec<AccountUpdateResult>, ImportError> {
        let mut results = Vec::with_capacity(updates.len());
        for u in updates {
            let after: Option<i64> = sqlx::query_scalar(
                "UPDATE ccdindex_accounts
                 SET balance           = balance + $2,
                     transaction_count = transaction_count + $3
                 WHERE account_id = $1
                 RETURNING balance",
            )
            .bind(to_i64(u.account_id)?)
            .bind(u.amount_adjustment)
            .bind(i64::from(u.transactions_added))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

            let after = after.ok_or_else(|| {
                ImportError::DataIntegrity(format!("account {} does not exist", u.account_id))
            })?;
            let before = after.checked_sub(u.amount_adjustment).filter(|b| *b >= 0);
            let (Some(before), true) = (before, after >= 0) else {
                return Err(ImportError::DataIntegrity(format!(
                    "balance of account {} out of range after adding {}",
                    u.account_id, u.amount_adjustment
                )));
            };
            results.push(AccountUpdateResult {
                account_id: u.account_id,
                balance_before: to_u64(before),
                balance_after: to_u64(after),
            });
        }
        Ok(results)
    }

    async fn add_statement_entries(
        &mut self,
        entries: &[AccountStatementEntry],
    ) -> Result<(), ImportError> {
        for e in entries {
            sqlx::query(
                "INSERT INTO ccdindex_account_statement_entries
                    (account_id, timestamp, amount, entry_type, block_id,
                     transaction_id, account_balance)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(to_i64(e.account_id)?)
            .bind(e.timestamp)
            .bind(e.amount)
            .bind(e.entry_type.as_str())
            .bind(to_i64(e.block_id)?)
            .bind(e.transaction_id.map(to_i64).transpose()?)
            .bind(to_i64(e.account_balance)?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    async fn add_release_schedule_items(
        &mut self,
        items: &[AccountReleaseScheduleItem],
    ) -> Result<(), ImportError> {
        for item in items {
            sqlx::query(
                "INSERT INTO ccdindex_account_release_schedule
                    (account_id, transaction_id, schedule_index, timestamp, amount,
                     from_account_id)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(to_i64(item.account_id)?)
            .bind(to_i64(item.transaction_id)?)
            .bind(item.index as i32)
            .bind(item.timestamp)
            .bind(to_i64(item.amount)?)
            .bind(to_i64(item.from_account_id)?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    async fn save_checkpoint(&mut self, checkpoint: ImportCheckpoint) -> Result<(), ImportError> {
        checkpoint_upsert(&checkpoint)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}
