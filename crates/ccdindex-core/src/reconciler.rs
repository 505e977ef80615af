//! Event reconciler: turns candidate rows of a height range into stored rows.
//!
//! For a range `[from, to]` the reconciler
//!
//! 1. loads the heights already marked read and skips them,
//! 2. stores events of account transactions in emission order, assigning each
//!    `(height, transaction)` pair consecutive ordinals that continue after
//!    any rows stored by an earlier, interrupted run,
//! 3. stores rejections the same way,
//! 4. writes a read marker for every height of the range not yet marked,
//! 5. commits everything in one transaction.
//!
//! Running it again over a committed range stores nothing. The block importer
//! uses [`EventReconciler::reconcile_range`] to stage the same rows in a
//! session it commits together with baker and account writes.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info};

use crate::error::ImportError;
use crate::ranges::{sorted_to_ranges, HeightRange};
use crate::repository::Repository;
use crate::types::{
    AccountAddress, ImportSource, ReadHeight, RowKind, StoredEvent, StoredRejection,
    TransactionType,
};

/// Summary of one reconciled range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Heights of the range that were not read before this run.
    pub affected_heights: u64,
    pub stored_events: u64,
    pub stored_rejections: u64,
    /// Ranges skipped because they were already read.
    pub skipped: Vec<HeightRange>,
}

/// Reconciles height ranges for one import source.
#[derive(Debug, Clone, Copy)]
pub struct EventReconciler {
    source: ImportSource,
}

impl EventReconciler {
    pub fn new(source: ImportSource) -> Self {
        Self { source }
    }

    pub fn source(&self) -> ImportSource {
        self.source
    }

    /// Reconcile `[from, to]` inside `repo` and commit it.
    ///
    /// If every height is already read the repository is dropped without
    /// committing.
    pub async fn import_range(
        &self,
        mut repo: Box<dyn Repository>,
        from: u64,
        to: u64,
    ) -> Result<ReconcileOutcome, ImportError> {
        let outcome = self.reconcile_range(repo.as_mut(), from, to).await?;
        if outcome.affected_heights == 0 {
            return Ok(outcome);
        }
        repo.commit().await?;
        debug!(
            from,
            to,
            stored_events = outcome.stored_events,
            stored_rejections = outcome.stored_rejections,
            "range committed"
        );
        Ok(outcome)
    }

    /// Stage the rows and read markers of `[from, to]` in `repo` without
    /// committing; the caller owns the transaction.
    pub async fn reconcile_range(
        &self,
        repo: &mut dyn Repository,
        from: u64,
        to: u64,
    ) -> Result<ReconcileOutcome, ImportError> {
        if from > to {
            return Err(ImportError::DataIntegrity(format!(
                "invalid height range {from}..={to}"
            )));
        }

        let already_read = repo.read_heights_in_range(from, to).await?;
        let skipped = sorted_to_ranges(&already_read);
        if !skipped.is_empty() {
            info!(from, to, ranges = ?skipped, "Skipping height ranges already processed");
        }

        let affected_heights = (to - from + 1).saturating_sub(already_read.len() as u64);
        if affected_heights == 0 {
            return Ok(ReconcileOutcome {
                skipped,
                ..Default::default()
            });
        }

        let read: HashSet<u64> = already_read.iter().copied().collect();
        let stored_events = self.store_events(repo, &read, from, to).await?;
        let stored_rejections = self.store_rejections(repo, &read, from, to).await?;

        let now = Utc::now();
        for height in (from..=to).filter(|h| !read.contains(h)) {
            repo.add_read_height(ReadHeight {
                block_height: height,
                source: self.source,
                created_at: now,
            })
            .await?;
        }

        Ok(ReconcileOutcome {
            affected_heights,
            stored_events,
            stored_rejections,
            skipped,
        })
    }

    async fn store_events(
        &self,
        repo: &mut dyn Repository,
        read: &HashSet<u64>,
        from: u64,
        to: u64,
    ) -> Result<u64, ImportError> {
        let mut events: Vec<_> = repo
            .candidate_events(from, to)
            .await?
            .into_iter()
            .filter(|e| !read.contains(&e.block_height))
            .collect();
        events.sort_by_key(|e| (e.block_height, e.transaction_index, e.transaction_event_index));

        let mut counters = IndexCounters::new(RowKind::Event);
        let mut stored = 0;
        for e in events {
            let Some(sender) = usable_sender(e.transaction_type, e.sender, &e.transaction_hash)?
            else {
                continue;
            };
            let event_index = counters
                .next(repo, e.block_height, e.transaction_index)
                .await?;
            repo.add_event(StoredEvent {
                block_height: e.block_height,
                transaction_index: e.transaction_index,
                event_index,
                transaction_hash: e.transaction_hash,
                sender,
                block_slot_time: e.block_slot_time,
                source: self.source,
                event: e.event,
            })
            .await?;
            stored += 1;
        }
        Ok(stored)
    }

    async fn store_rejections(
        &self,
        repo: &mut dyn Repository,
        read: &HashSet<u64>,
        from: u64,
        to: u64,
    ) -> Result<u64, ImportError> {
        let mut rejections: Vec<_> = repo
            .candidate_rejections(from, to)
            .await?
            .into_iter()
            .filter(|r| !read.contains(&r.block_height))
            .collect();
        rejections.sort_by_key(|r| (r.block_height, r.transaction_index));

        let mut counters = IndexCounters::new(RowKind::Rejection);
        let mut stored = 0;
        for r in rejections {
            let Some(sender) = usable_sender(r.transaction_type, r.sender, &r.transaction_hash)?
            else {
                continue;
            };
            let event_index = counters
                .next(repo, r.block_height, r.transaction_index)
                .await?;
            repo.add_rejection(StoredRejection {
                block_height: r.block_height,
                transaction_index: r.transaction_index,
                event_index,
                transaction_hash: r.transaction_hash,
                sender,
                block_slot_time: r.block_slot_time,
                source: self.source,
                reason: r.reason,
            })
            .await?;
            stored += 1;
        }
        Ok(stored)
    }
}

/// Only account transactions are imported, and those must have a sender.
fn usable_sender(
    transaction_type: TransactionType,
    sender: Option<AccountAddress>,
    transaction_hash: &str,
) -> Result<Option<AccountAddress>, ImportError> {
    if transaction_type != TransactionType::AccountTransaction {
        return Ok(None);
    }
    sender.map(Some).ok_or_else(|| ImportError::MissingSender {
        transaction_hash: transaction_hash.to_string(),
    })
}

/// Per-`(height, transaction)` ordinal counters seeded from storage.
struct IndexCounters {
    kind: RowKind,
    next: HashMap<(u64, u32), u32>,
}

impl IndexCounters {
    fn new(kind: RowKind) -> Self {
        Self {
            kind,
            next: HashMap::new(),
        }
    }

    async fn next(
        &mut self,
        repo: &mut dyn Repository,
        height: u64,
        transaction_index: u32,
    ) -> Result<u32, ImportError> {
        let key = (height, transaction_index);
        let index = match self.next.get(&key) {
            Some(&i) => i,
            None => repo.next_index(self.kind, height, transaction_index).await?,
        };
        self.next.insert(key, index + 1);
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidateEvent, CandidateRejection};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Tables {
        read: Vec<u64>,
        candidates: Vec<CandidateEvent>,
        rejections: Vec<CandidateRejection>,
        events: Vec<StoredEvent>,
        stored_rejections: Vec<StoredRejection>,
        markers: Vec<u64>,
        commits: u32,
    }

    /// Repository writing straight into shared tables on commit.
    struct TestRepo {
        tables: Arc<Mutex<Tables>>,
        events: Vec<StoredEvent>,
        rejections: Vec<StoredRejection>,
        markers: Vec<u64>,
    }

    impl TestRepo {
        fn boxed(tables: &Arc<Mutex<Tables>>) -> Box<dyn Repository> {
            Box::new(Self {
                tables: tables.clone(),
                events: vec![],
                rejections: vec![],
                markers: vec![],
            })
        }
    }

    #[async_trait]
    impl Repository for TestRepo {
        async fn latest_read_height(&mut self) -> Result<Option<u64>, ImportError> {
            Ok(self.tables.lock().unwrap().read.iter().max().copied())
        }
        async fn final_height(&mut self) -> Result<u64, ImportError> {
            Ok(0)
        }
        async fn read_heights_in_range(&mut self, from: u64, to: u64) -> Result<Vec<u64>, ImportError> {
            let mut v: Vec<u64> = self
                .tables
                .lock()
                .unwrap()
                .read
                .iter()
                .copied()
                .filter(|h| (from..=to).contains(h))
                .collect();
            v.sort_unstable();
            Ok(v)
        }
        async fn candidate_events(&mut self, from: u64, to: u64) -> Result<Vec<CandidateEvent>, ImportError> {
            let t = self.tables.lock().unwrap();
            Ok(t.candidates.iter().filter(|e| (from..=to).contains(&e.block_height)).cloned().collect())
        }
        async fn candidate_rejections(&mut self, from: u64, to: u64) -> Result<Vec<CandidateRejection>, ImportError> {
            let t = self.tables.lock().unwrap();
            Ok(t.rejections.iter().filter(|r| (from..=to).contains(&r.block_height)).cloned().collect())
        }
        async fn next_index(&mut self, kind: RowKind, height: u64, tx: u32) -> Result<u32, ImportError> {
            let t = self.tables.lock().unwrap();
            let max = match kind {
                RowKind::Event => t
                    .events
                    .iter()
                    .filter(|e| e.block_height == height && e.transaction_index == tx)
                    .map(|e| e.event_index)
                    .max(),
                RowKind::Rejection => t
                    .stored_rejections
                    .iter()
                    .filter(|e| e.block_height == height && e.transaction_index == tx)
                    .map(|e| e.event_index)
                    .max(),
            };
            Ok(max.map_or(0, |m| m + 1))
        }
        async fn add_event(&mut self, event: StoredEvent) -> Result<(), ImportError> {
            self.events.push(event);
            Ok(())
        }
        async fn add_rejection(&mut self, rejection: StoredRejection) -> Result<(), ImportError> {
            self.rejections.push(rejection);
            Ok(())
        }
        async fn add_read_height(&mut self, marker: ReadHeight) -> Result<(), ImportError> {
            self.markers.push(marker.block_height);
            Ok(())
        }
        async fn commit(self: Box<Self>) -> Result<(), ImportError> {
            let this = *self;
            let mut t = this.tables.lock().unwrap();
            t.events.extend(this.events);
            t.stored_rejections.extend(this.rejections);
            t.markers.extend(this.markers.iter().copied());
            t.read.extend(this.markers);
            t.commits += 1;
            Ok(())
        }
    }

    fn time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()
    }

    fn sender() -> Option<AccountAddress> {
        Some(AccountAddress([1; 32]))
    }

    fn candidate(height: u64, tx: u32, idx: u32) -> CandidateEvent {
        CandidateEvent {
            block_height: height,
            block_slot_time: time(),
            transaction_index: tx,
            transaction_event_index: idx,
            transaction_hash: format!("{height}-{tx}"),
            transaction_type: TransactionType::AccountTransaction,
            sender: sender(),
            event: serde_json::json!({ "idx": idx }),
        }
    }

    fn rejection(height: u64, tx: u32) -> CandidateRejection {
        CandidateRejection {
            block_height: height,
            block_slot_time: time(),
            transaction_index: tx,
            transaction_hash: format!("r{height}-{tx}"),
            transaction_type: TransactionType::AccountTransaction,
            sender: sender(),
            reason: serde_json::json!("OutOfEnergy"),
        }
    }

    #[tokio::test]
    async fn stores_events_in_emission_order_and_marks_every_height() {
        let tables = Arc::new(Mutex::new(Tables {
            candidates: vec![candidate(2, 0, 1), candidate(2, 0, 0), candidate(1, 3, 0)],
            rejections: vec![rejection(3, 1)],
            ..Default::default()
        }));
        let out = EventReconciler::new(ImportSource::DatabaseImport)
            .import_range(TestRepo::boxed(&tables), 1, 4)
            .await
            .unwrap();

        assert_eq!(out.affected_heights, 4);
        assert_eq!(out.stored_events, 3);
        assert_eq!(out.stored_rejections, 1);

        let t = tables.lock().unwrap();
        let keys: Vec<_> = t
            .events
            .iter()
            .map(|e| (e.block_height, e.transaction_index, e.event_index, e.event["idx"].as_u64()))
            .collect();
        assert_eq!(keys, vec![(1, 3, 0, Some(0)), (2, 0, 0, Some(0)), (2, 0, 1, Some(1))]);
        assert_eq!(t.markers, vec![1, 2, 3, 4]);
        assert_eq!(t.commits, 1);
    }

    #[tokio::test]
    async fn skips_already_read_heights() {
        let tables = Arc::new(Mutex::new(Tables {
            read: vec![1, 2],
            candidates: vec![candidate(1, 0, 0), candidate(3, 0, 0)],
            ..Default::default()
        }));
        let out = EventReconciler::new(ImportSource::DatabaseImport)
            .import_range(TestRepo::boxed(&tables), 1, 3)
            .await
            .unwrap();

        assert_eq!(out.affected_heights, 1);
        assert_eq!(out.stored_events, 1);
        assert_eq!(out.skipped, vec![(1, 2)]);
        assert_eq!(tables.lock().unwrap().markers, vec![3]);
    }

    #[tokio::test]
    async fn reconcile_range_leaves_commit_to_the_caller() {
        let tables = Arc::new(Mutex::new(Tables {
            candidates: vec![candidate(4, 0, 0)],
            ..Default::default()
        }));
        let mut repo = TestRepo::boxed(&tables);
        let out = EventReconciler::new(ImportSource::NodeImport)
            .reconcile_range(repo.as_mut(), 4, 4)
            .await
            .unwrap();
        assert_eq!(out.stored_events, 1);
        assert_eq!(tables.lock().unwrap().commits, 0);

        repo.commit().await.unwrap();
        let t = tables.lock().unwrap();
        assert_eq!(t.markers, vec![4]);
        assert_eq!(t.events[0].source, ImportSource::NodeImport);
    }

    #[tokio::test]
    async fn fully_read_range_does_not_commit() {
        let tables = Arc::new(Mutex::new(Tables {
            read: vec![5, 6],
            ..Default::default()
        }));
        let out = EventReconciler::new(ImportSource::DatabaseImport)
            .import_range(TestRepo::boxed(&tables), 5, 6)
            .await
            .unwrap();
        assert_eq!(out.affected_heights, 0);
        assert_eq!(tables.lock().unwrap().commits, 0);
    }

    #[tokio::test]
    async fn resumes_ordinals_of_partially_stored_transaction() {
        let tables = Arc::new(Mutex::new(Tables {
            candidates: vec![candidate(7, 2, 2)],
            ..Default::default()
        }));
        {
            let mut t = tables.lock().unwrap();
            for i in 0..2 {
                t.events.push(StoredEvent {
                    block_height: 7,
                    transaction_index: 2,
                    event_index: i,
                    transaction_hash: "7-2".into(),
                    sender: AccountAddress([1; 32]),
                    block_slot_time: time(),
                    source: ImportSource::NodeImport,
                    event: serde_json::Value::Null,
                });
            }
        }
        EventReconciler::new(ImportSource::DatabaseImport)
            .import_range(TestRepo::boxed(&tables), 7, 7)
            .await
            .unwrap();
        let t = tables.lock().unwrap();
        assert_eq!(t.events.last().map(|e| e.event_index), Some(2));
    }

    #[tokio::test]
    async fn non_account_transactions_are_ignored() {
        let mut update = candidate(1, 0, 0);
        update.transaction_type = TransactionType::Update;
        update.sender = None;
        let tables = Arc::new(Mutex::new(Tables {
            candidates: vec![update],
            ..Default::default()
        }));
        let out = EventReconciler::new(ImportSource::DatabaseImport)
            .import_range(TestRepo::boxed(&tables), 1, 1)
            .await
            .unwrap();
        assert_eq!(out.stored_events, 0);
        assert_eq!(tables.lock().unwrap().markers, vec![1]);
    }

    #[tokio::test]
    async fn missing_sender_is_fatal_and_nothing_commits() {
        let mut orphan = candidate(1, 0, 0);
        orphan.sender = None;
        let tables = Arc::new(Mutex::new(Tables {
            candidates: vec![orphan],
            ..Default::default()
        }));
        let err = EventReconciler::new(ImportSource::DatabaseImport)
            .import_range(TestRepo::boxed(&tables), 1, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::MissingSender { .. }));
        let t = tables.lock().unwrap();
        assert_eq!(t.commits, 0);
        assert!(t.markers.is_empty());
    }
}
