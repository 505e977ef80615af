//! In-memory storage backend.
//!
//! Holds staging candidates and block payloads, derived rows, read markers,
//! bakers, accounts with their statements and release schedules, and
//! checkpoints in RAM. Every session buffers its writes and applies them
//! atomically on commit, mirroring the one-transaction-per-unit model of the
//! Postgres backend. Commit failures can be injected for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

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

type RowKey = (u64, u32, u32);

/// `(transaction_id, index, account_id)`
type ScheduleKey = (u64, u32, u64);

/// A stored block transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTransaction {
    pub id: u64,
    pub block_height: u64,
    pub hash: String,
}

#[derive(Default)]
struct Tables {
    candidate_events: Vec<CandidateEvent>,
    candidate_rejections: Vec<CandidateRejection>,
    block_payloads: BTreeMap<u64, BlockDataPayload>,
    final_height: u64,
    events: BTreeMap<RowKey, StoredEvent>,
    rejections: BTreeMap<RowKey, StoredRejection>,
    read_heights: BTreeMap<u64, ReadHeight>,
    bakers: BTreeMap<u64, Baker>,
    accounts: BTreeMap<u64, Account>,
    transactions: BTreeMap<u64, MemoryTransaction>,
    account_transactions: HashSet<AccountTransactionRelation>,
    statement_entries: Vec<AccountStatementEntry>,
    release_schedule: BTreeMap<ScheduleKey, AccountReleaseScheduleItem>,
}

#[derive(Default)]
struct Faults {
    /// Remaining commits to fail, and whether the failure is transient.
    fail_commits: Mutex<Option<(u32, bool)>>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    checkpoints: Mutex<HashMap<String, ImportCheckpoint>>,
    faults: Faults,
    commits: AtomicU64,
    next_transaction_id: AtomicU64,
}

/// In-memory import storage.
///
/// Cloning is cheap and clones share the same data. All data is lost when the
/// process exits.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a repository session directly, e.g. for baker updates.
    pub fn session(&self) -> MemoryRepository {
        MemoryRepository {
            inner: self.inner.clone(),
            writes: Writes::default(),
        }
    }

    // ─── Staging data ─────────────────────────────────────────────────────

    pub fn add_candidate_event(&self, event: CandidateEvent) {
        let mut t = self.inner.tables.lock().unwrap();
        t.final_height = t.final_height.max(event.block_height);
        t.candidate_events.push(event);
    }

    pub fn add_candidate_rejection(&self, rejection: CandidateRejection) {
        let mut t = self.inner.tables.lock().unwrap();
        t.final_height = t.final_height.max(rejection.block_height);
        t.candidate_rejections.push(rejection);
    }

    /// Set the highest height the staging data covers.
    pub fn set_final_height(&self, height: u64) {
        self.inner.tables.lock().unwrap().final_height = height;
    }

    pub fn insert_account(&self, account: Account) {
        self.inner
            .tables
            .lock()
            .unwrap()
            .accounts
            .insert(account.id, account);
    }

    pub fn insert_baker(&self, baker: Baker) {
        self.inner.tables.lock().unwrap().bakers.insert(baker.id, baker);
    }

    /// Stage the payload of one block for the block importer.
    pub fn add_block_payload(&self, payload: BlockDataPayload) {
        self.inner
            .tables
            .lock()
            .unwrap()
            .block_payloads
            .insert(payload.block.height, payload);
    }

    // ─── Inspection ───────────────────────────────────────────────────────

    /// Stored events ordered by `(height, transaction, index)`.
    pub fn stored_events(&self) -> Vec<StoredEvent> {
        self.inner.tables.lock().unwrap().events.values().cloned().collect()
    }

    pub fn stored_rejections(&self) -> Vec<StoredRejection> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .rejections
            .values()
            .cloned()
            .collect()
    }

    pub fn read_heights(&self) -> Vec<u64> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .read_heights
            .keys()
            .copied()
            .collect()
    }

    pub fn baker(&self, id: u64) -> Option<Baker> {
        self.inner.tables.lock().unwrap().bakers.get(&id).cloned()
    }

    pub fn account(&self, id: u64) -> Option<Account> {
        self.inner.tables.lock().unwrap().accounts.get(&id).cloned()
    }

    pub fn transactions(&self) -> Vec<MemoryTransaction> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .transactions
            .values()
            .cloned()
            .collect()
    }

    /// Account to transaction relations ordered by `(account, transaction)`.
    pub fn account_transactions(&self) -> Vec<AccountTransactionRelation> {
        let t = self.inner.tables.lock().unwrap();
        let mut relations: Vec<_> = t.account_transactions.iter().copied().collect();
        relations.sort_by_key(|r| (r.account_id, r.transaction_id));
        relations
    }

    /// Statement entries in insertion order.
    pub fn statement_entries(&self) -> Vec<AccountStatementEntry> {
        self.inner.tables.lock().unwrap().statement_entries.clone()
    }

    pub fn release_schedule(&self) -> Vec<AccountReleaseScheduleItem> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .release_schedule
            .values()
            .copied()
            .collect()
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    // ─── Fault injection ──────────────────────────────────────────────────

    /// Fail the next `count` commits with a storage error.
    pub fn fail_next_commits(&self, count: u32, transient: bool) {
        *self.inner.faults.fail_commits.lock().unwrap() = Some((count, transient));
    }
}

fn take_fault(inner: &Inner) -> Option<ImportError> {
    let mut slot = inner.faults.fail_commits.lock().unwrap();
    match *slot {
        Some((remaining, transient)) if remaining > 0 => {
            *slot = Some((remaining - 1, transient));
            let message = "injected commit failure";
            Some(if transient {
                ImportError::transient(message)
            } else {
                ImportError::storage(message)
            })
        }
        _ => None,
    }
}

#[async_trait]
impl RepositoryFactory for InMemoryStorage {
    async fn create(&self) -> Result<Box<dyn Repository>, ImportError> {
        Ok(Box::new(self.session()))
    }
}

#[async_trait]
impl BlockSessionFactory for InMemoryStorage {
    async fn open_block_session(&self) -> Result<Box<dyn BlockSession>, ImportError> {
        Ok(Box::new(self.session()))
    }
}

#[async_trait]
impl BlockSource for InMemoryStorage {
    async fn last_staged_height(&self) -> Result<Option<u64>, ImportError> {
        let t = self.inner.tables.lock().unwrap();
        Ok(t.block_payloads.keys().next_back().copied())
    }

    async fn block_payload(&self, height: u64) -> Result<Option<BlockDataPayload>, ImportError> {
        Ok(self
            .inner
            .tables
            .lock()
            .unwrap()
            .block_payloads
            .get(&height)
            .cloned())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(&self, job_name: &str) -> Result<Option<ImportCheckpoint>, ImportError> {
        Ok(self.inner.checkpoints.lock().unwrap().get(job_name).cloned())
    }

    async fn save(&self, checkpoint: ImportCheckpoint) -> Result<(), ImportError> {
        self.inner
            .checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.job_name.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, job_name: &str) -> Result<(), ImportError> {
        self.inner.checkpoints.lock().unwrap().remove(job_name);
        Ok(())
    }
}

#[async_trait]
impl AccountLookup for InMemoryStorage {
    async fn account_ids(
        &self,
        base_addresses: &[AccountAddress],
    ) -> Result<HashMap<AccountAddress, u64>, ImportError> {
        let t = self.inner.tables.lock().unwrap();
        Ok(t.accounts
            .values()
            .filter(|a| base_addresses.contains(&a.base_address))
            .map(|a| (a.base_address, a.id))
            .collect())
    }
}

// ─── Repository session ───────────────────────────────────────────────────────

#[derive(Default)]
struct Writes {
    events: Vec<StoredEvent>,
    rejections: Vec<StoredRejection>,
    read_heights: Vec<ReadHeight>,
    bakers: BTreeMap<u64, Baker>,
    created_accounts: Vec<u64>,
    /// Created and updated accounts, latest version.
    accounts: BTreeMap<u64, Account>,
    transactions: Vec<MemoryTransaction>,
    account_transactions: Vec<AccountTransactionRelation>,
    statement_entries: Vec<AccountStatementEntry>,
    release_schedule: Vec<AccountReleaseScheduleItem>,
    checkpoint: Option<ImportCheckpoint>,
}

/// A buffered session over [`InMemoryStorage`].
pub struct MemoryRepository {
    inner: Arc<Inner>,
    writes: Writes,
}

impl MemoryRepository {
    /// Bakers as seen by this session: committed state overlaid with its writes.
    fn bakers(&self) -> BTreeMap<u64, Baker> {
        let mut bakers = self.inner.tables.lock().unwrap().bakers.clone();
        bakers.extend(self.writes.bakers.iter().map(|(id, b)| (*id, b.clone())));
        bakers
    }

    fn account(&self, id: u64) -> Option<Account> {
        if let Some(a) = self.writes.accounts.get(&id) {
            return Some(a.clone());
        }
        self.inner.tables.lock().unwrap().accounts.get(&id).cloned()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn latest_read_height(&mut self) -> Result<Option<u64>, ImportError> {
        let t = self.inner.tables.lock().unwrap();
        Ok(t.read_heights.keys().next_back().copied())
    }

    async fn final_height(&mut self) -> Result<u64, ImportError> {
        Ok(self.inner.tables.lock().unwrap().final_height)
    }

    async fn read_heights_in_range(&mut self, from: u64, to: u64) -> Result<Vec<u64>, ImportError> {
        let t = self.inner.tables.lock().unwrap();
        Ok(t.read_heights.range(from..=to).map(|(h, _)| *h).collect())
    }

    async fn candidate_events(
        &mut self,
        from: u64,
        to: u64,
    ) -> Result<Vec<CandidateEvent>, ImportError> {
        let t = self.inner.tables.lock().unwrap();
        Ok(t.candidate_events
            .iter()
            .filter(|e| (from..=to).contains(&e.block_height))
            .cloned()
            .collect())
    }

    async fn candidate_rejections(
        &mut self,
        from: u64,
        to: u64,
    ) -> Result<Vec<CandidateRejection>, ImportError> {
        let t = self.inner.tables.lock().unwrap();
        Ok(t.candidate_rejections
            .iter()
            .filter(|r| (from..=to).contains(&r.block_height))
            .cloned()
            .collect())
    }

    async fn next_index(
        &mut self,
        kind: RowKind,
        block_height: u64,
        transaction_index: u32,
    ) -> Result<u32, ImportError> {
        let t = self.inner.tables.lock().unwrap();
        let range = (block_height, transaction_index, 0)..=(block_height, transaction_index, u32::MAX);
        let last = match kind {
            RowKind::Event => t.events.range(range).next_back().map(|(k, _)| k.2),
            RowKind::Rejection => t.rejections.range(range).next_back().map(|(k, _)| k.2),
        };
        Ok(last.map_or(0, |i| i + 1))
    }

    async fn add_event(&mut self, event: StoredEvent) -> Result<(), ImportError> {
        self.writes.events.push(event);
        Ok(())
    }

    async fn add_rejection(&mut self, rejection: StoredRejection) -> Result<(), ImportError> {
        self.writes.rejections.push(rejection);
        Ok(())
    }

    async fn add_read_height(&mut self, marker: ReadHeight) -> Result<(), ImportError> {
        self.writes.read_heights.push(marker);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), ImportError> {
        MemoryRepository::commit_writes(*self)
    }
}

impl MemoryRepository {
    /// Apply all buffered writes, or none if a key already exists.
    pub fn commit_writes(self) -> Result<(), ImportError> {
        if let Some(err) = take_fault(&self.inner) {
            return Err(err);
        }
        let Writes {
            events,
            rejections,
            read_heights,
            bakers,
            created_accounts,
            accounts,
            transactions,
            account_transactions,
            statement_entries,
            release_schedule,
            checkpoint,
        } = self.writes;

        let mut t = self.inner.tables.lock().unwrap();
        let duplicate = events
            .iter()
            .any(|e| t.events.contains_key(&(e.block_height, e.transaction_index, e.event_index)))
            || rejections.iter().any(|r| {
                t.rejections
                    .contains_key(&(r.block_height, r.transaction_index, r.event_index))
            })
            || read_heights
                .iter()
                .any(|m| t.read_heights.contains_key(&m.block_height))
            || created_accounts.iter().any(|id| t.accounts.contains_key(id))
            || account_transactions
                .iter()
                .any(|r| t.account_transactions.contains(r))
            || release_schedule
                .iter()
                .any(|i| t.release_schedule.contains_key(&schedule_key(i)));
        if duplicate {
            return Err(ImportError::storage("duplicate key violates unique constraint"));
        }

        for e in events {
            t.events
                .insert((e.block_height, e.transaction_index, e.event_index), e);
        }
        for r in rejections {
            t.rejections
                .insert((r.block_height, r.transaction_index, r.event_index), r);
        }
        for m in read_heights {
            t.read_heights.insert(m.block_height, m);
        }
        t.bakers.extend(bakers);
        t.accounts.extend(accounts);
        t.transactions
            .extend(transactions.into_iter().map(|tx| (tx.id, tx)));
        t.account_transactions.extend(account_transactions);
        t.statement_entries.extend(statement_entries);
        t.release_schedule
            .extend(release_schedule.into_iter().map(|i| (schedule_key(&i), i)));
        drop(t);

        if let Some(cp) = checkpoint {
            self.inner
                .checkpoints
                .lock()
                .unwrap()
                .insert(cp.job_name.clone(), cp);
        }
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn schedule_key(item: &AccountReleaseScheduleItem) -> ScheduleKey {
    (item.transaction_id, item.index, item.account_id)
}

#[async_trait]
impl BakerStore for MemoryRepository {
    async fn get_baker(&mut self, id: u64) -> Result<Option<Baker>, ImportError> {
        if let Some(b) = self.writes.bakers.get(&id) {
            return Ok(Some(b.clone()));
        }
        Ok(self.inner.tables.lock().unwrap().bakers.get(&id).cloned())
    }

    async fn save_baker(&mut self, baker: Baker) -> Result<(), ImportError> {
        self.writes.bakers.insert(baker.id, baker);
        Ok(())
    }

    async fn bakers_with_pending_change(&mut self) -> Result<Vec<Baker>, ImportError> {
        Ok(self
            .bakers()
            .into_values()
            .filter(|b| b.pending_change().is_some())
            .collect())
    }

    async fn total_amount_staked(&mut self) -> Result<u64, ImportError> {
        Ok(self
            .bakers()
            .values()
            .filter_map(|b| b.active())
            .map(|a| a.staked_amount)
            .sum())
    }
}

#[async_trait]
impl BlockSession for MemoryRepository {
    fn as_repository(&mut self) -> &mut dyn Repository {
        self
    }

    fn as_baker_store(&mut self) -> &mut dyn BakerStore {
        self
    }

    async fn add_accounts(&mut self, accounts: &[Account]) -> Result<(), ImportError> {
        for account in accounts {
            self.writes.created_accounts.push(account.id);
            self.writes.accounts.insert(account.id, account.clone());
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
            let id = self.inner.next_transaction_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.writes.transactions.push(MemoryTransaction {
                id,
                block_height: block.height,
                hash: tx.hash.clone(),
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn add_account_transactions(
        &mut self,
        relations: &[AccountTransactionRelation],
    ) -> Result<(), ImportError> {
        self.writes.account_transactions.extend_from_slice(relations);
        Ok(())
    }

    async fn apply_account_updates(
        &mut self,
        updates: &[AccountUpdate],
    ) -> Result<Vec<AccountUpdateResult>, ImportError> {
        let mut results = Vec::with_capacity(updates.len());
        for u in updates {
            let mut account = self.account(u.account_id).ok_or_else(|| {
                ImportError::DataIntegrity(format!("account {} does not exist", u.account_id))
            })?;
            let balance_before = account.balance;
            account.balance = balance_before
                .checked_add_signed(u.amount_adjustment)
                .ok_or_else(|| {
                    ImportError::DataIntegrity(format!(
                        "balance of account {} out of range after adding {}",
                        u.account_id, u.amount_adjustment
                    ))
                })?;
            account.transaction_count += u64::from(u.transactions_added);
            results.push(AccountUpdateResult {
                account_id: u.account_id,
                balance_before,
                balance_after: account.balance,
            });
            self.writes.accounts.insert(u.account_id, account);
        }
        Ok(results)
    }

    async fn add_statement_entries(
        &mut self,
        entries: &[AccountStatementEntry],
    ) -> Result<(), ImportError> {
        self.writes.statement_entries.extend_from_slice(entries);
        Ok(())
    }

    async fn add_release_schedule_items(
        &mut self,
        items: &[AccountReleaseScheduleItem],
    ) -> Result<(), ImportError> {
        self.writes.release_schedule.extend_from_slice(items);
        Ok(())
    }

    async fn save_checkpoint(&mut self, checkpoint: ImportCheckpoint) -> Result<(), ImportError> {
        self.writes.checkpoint = Some(checkpoint);
        Ok(())
    }
}
