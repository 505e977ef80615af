//! Baker lifecycle state machine.
//!
//! A baker is either `Active` (optionally carrying one pending change) or
//! `Removed`. Per regular block the handler applies, in order:
//!
//! 1. the era-reset workaround: when the genesis index grows, epoch numbering
//!    restarts, so every pending change gets its effective time recomputed
//!    from its epoch using the new era,
//! 2. maturation of pending changes that are due at the block's slot time,
//! 3. transaction events (`BakerAdded`, `BakerRemoved`, `BakerStakeDecreased`,
//!    `BakerSetRestakeEarnings`),
//! 4. reward accrual for active bakers that restake earnings,
//! 5. `BakerStakeIncreased` events, which carry the absolute new stake and so
//!    are applied after rewards.
//!
//! Operations that need an active baker fail with
//! [`ImportError::InvalidBakerState`] on a removed one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::account::AccountLookup;
use crate::chain_time::ChainTimeConfig;
use crate::checkpoint::ImportState;
use crate::error::ImportError;
use crate::payload::{
    AccountBakerPendingChange, AccountBalanceUpdate, AccountInfo, BlockDataPayload, BlockKind,
    TransactionEvent,
};
use crate::types::{AccountAddress, BlockInfo};

// ─── State ────────────────────────────────────────────────────────────────────

/// A scheduled change to an active baker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingChange {
    Removal {
        effective_time: DateTime<Utc>,
        epoch: u64,
    },
    ReduceStake {
        effective_time: DateTime<Utc>,
        new_staked_amount: u64,
        epoch: u64,
    },
}

impl PendingChange {
    pub fn effective_time(&self) -> DateTime<Utc> {
        match self {
            Self::Removal { effective_time, .. } | Self::ReduceStake { effective_time, .. } => {
                *effective_time
            }
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            Self::Removal { epoch, .. } | Self::ReduceStake { epoch, .. } => *epoch,
        }
    }

    fn rescheduled(self, at: DateTime<Utc>) -> Self {
        match self {
            Self::Removal { epoch, .. } => Self::Removal {
                effective_time: at,
                epoch,
            },
            Self::ReduceStake {
                new_staked_amount,
                epoch,
                ..
            } => Self::ReduceStake {
                effective_time: at,
                new_staked_amount,
                epoch,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveBakerState {
    pub staked_amount: u64,
    pub restake_earnings: bool,
    pub pending_change: Option<PendingChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BakerState {
    Active(ActiveBakerState),
    Removed { effective_time: DateTime<Utc> },
}

/// A baker; `id` equals the index of the owning account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baker {
    pub id: u64,
    pub state: BakerState,
}

impl Baker {
    pub fn new_active(id: u64, staked_amount: u64, restake_earnings: bool) -> Self {
        Self {
            id,
            state: BakerState::Active(ActiveBakerState {
                staked_amount,
                restake_earnings,
                pending_change: None,
            }),
        }
    }

    pub fn active(&self) -> Option<&ActiveBakerState> {
        match &self.state {
            BakerState::Active(a) => Some(a),
            BakerState::Removed { .. } => None,
        }
    }

    pub fn pending_change(&self) -> Option<&PendingChange> {
        self.active().and_then(|a| a.pending_change.as_ref())
    }

    fn active_mut(&mut self, operation: &'static str) -> Result<&mut ActiveBakerState, ImportError> {
        match &mut self.state {
            BakerState::Active(a) => Ok(a),
            BakerState::Removed { .. } => Err(ImportError::InvalidBakerState {
                baker_id: self.id,
                expected: "active",
                operation,
            }),
        }
    }

    /// Apply the pending change if it is due at `now`.
    ///
    /// Returns `true` if a change was applied.
    pub fn apply_due_change(&mut self, now: DateTime<Utc>) -> Result<bool, ImportError> {
        let id = self.id;
        let active = self.active_mut("apply pending change")?;
        let Some(change) = active.pending_change else {
            return Ok(false);
        };
        if change.effective_time() > now {
            return Ok(false);
        }
        match change {
            PendingChange::Removal { effective_time, .. } => {
                info!(baker_id = id, "Baker will be removed");
                self.state = BakerState::Removed { effective_time };
            }
            PendingChange::ReduceStake {
                new_staked_amount, ..
            } => {
                info!(baker_id = id, new_stake = new_staked_amount, "Baker will have its stake reduced");
                active.pending_change = None;
                active.staked_amount = new_staked_amount;
            }
        }
        Ok(true)
    }
}

// ─── Storage ──────────────────────────────────────────────────────────────────

/// Baker persistence used by [`BakerImportHandler`].
#[async_trait]
pub trait BakerStore: Send {
    async fn get_baker(&mut self, id: u64) -> Result<Option<Baker>, ImportError>;

    async fn save_baker(&mut self, baker: Baker) -> Result<(), ImportError>;

    /// Active bakers that carry a pending change.
    async fn bakers_with_pending_change(&mut self) -> Result<Vec<Baker>, ImportError>;

    /// Sum of staked amounts over active bakers.
    async fn total_amount_staked(&mut self) -> Result<u64, ImportError>;
}

/// Result of handling one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BakerUpdateResults {
    pub total_amount_staked: u64,
}

// ─── Handler ──────────────────────────────────────────────────────────────────

pub struct BakerImportHandler {
    chain_time: ChainTimeConfig,
    accounts: Arc<dyn AccountLookup>,
}

impl BakerImportHandler {
    pub fn new(chain_time: ChainTimeConfig, accounts: Arc<dyn AccountLookup>) -> Self {
        Self {
            chain_time,
            accounts,
        }
    }

    pub async fn handle_baker_updates(
        &self,
        store: &mut dyn BakerStore,
        payload: &BlockDataPayload,
        state: &mut ImportState,
    ) -> Result<BakerUpdateResults, ImportError> {
        match payload.kind {
            BlockKind::Genesis => self.add_genesis_bakers(store, &payload.created_accounts).await?,
            BlockKind::Regular => self.apply_baker_changes(store, payload, state).await?,
        }
        Ok(BakerUpdateResults {
            total_amount_staked: store.total_amount_staked().await?,
        })
    }

    /// Every genesis account with baker info becomes an active baker.
    pub async fn add_genesis_bakers(
        &self,
        store: &mut dyn BakerStore,
        genesis_accounts: &[AccountInfo],
    ) -> Result<(), ImportError> {
        for baker in genesis_accounts.iter().filter_map(|a| a.baker.as_ref()) {
            store
                .save_baker(Baker::new_active(
                    baker.baker_id,
                    baker.staked_amount,
                    baker.restake_earnings,
                ))
                .await?;
        }
        Ok(())
    }

    async fn apply_baker_changes(
        &self,
        store: &mut dyn BakerStore,
        payload: &BlockDataPayload,
        state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let block = &payload.block;
        self.reschedule_after_era_change(store, block, state).await?;
        self.apply_due_changes(store, block, state).await?;

        let (increases, others): (Vec<_>, Vec<_>) = payload
            .transaction_events
            .iter()
            .filter(|e| !matches!(e, TransactionEvent::Other))
            .partition(|e| matches!(e, TransactionEvent::BakerStakeIncreased { .. }));

        self.apply_transaction_events(store, &others, payload, state).await?;
        self.update_stake_from_earnings(store, &payload.special_event_balance_updates)
            .await?;
        self.apply_transaction_events(store, &increases, payload, state).await
    }

    async fn reschedule_after_era_change(
        &self,
        store: &mut dyn BakerStore,
        block: &BlockInfo,
        state: &mut ImportState,
    ) -> Result<(), ImportError> {
        if block.genesis_index <= state.last_genesis_index {
            return Ok(());
        }
        state.last_genesis_index = block.genesis_index;
        info!(
            genesis_index = block.genesis_index,
            slot = block.slot,
            slot_time = %block.slot_time,
            "New genesis index detected, rescheduling pending baker changes"
        );

        for mut baker in store.bakers_with_pending_change().await? {
            let id = baker.id;
            let active = baker.active_mut("reschedule pending change")?;
            let Some(change) = active.pending_change else {
                continue;
            };
            let at = self.chain_time.effective_time(change.epoch(), block)?;
            active.pending_change = Some(change.rescheduled(at));
            info!(baker_id = id, effective_time = %at, epoch = change.epoch(), "Rescheduled pending baker change");
            store.save_baker(baker).await?;
        }

        state.next_pending_baker_change_time = min_pending_change_time(store).await?;
        Ok(())
    }

    async fn apply_due_changes(
        &self,
        store: &mut dyn BakerStore,
        block: &BlockInfo,
        state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let due = state
            .next_pending_baker_change_time
            .is_some_and(|next| block.slot_time > next);
        if !due {
            return Ok(());
        }

        for mut baker in store.bakers_with_pending_change().await? {
            if baker.apply_due_change(block.slot_time)? {
                store.save_baker(baker).await?;
            }
        }

        state.next_pending_baker_change_time = min_pending_change_time(store).await?;
        info!(next = ?state.next_pending_baker_change_time, "Next pending baker change time updated");
        Ok(())
    }

    async fn apply_transaction_events(
        &self,
        store: &mut dyn BakerStore,
        events: &[&TransactionEvent],
        payload: &BlockDataPayload,
        state: &mut ImportState,
    ) -> Result<(), ImportError> {
        for event in events {
            match event {
                TransactionEvent::BakerAdded {
                    baker_id,
                    stake,
                    restake_earnings,
                    ..
                } => {
                    store
                        .save_baker(Baker::new_active(*baker_id, *stake, *restake_earnings))
                        .await?;
                }
                TransactionEvent::BakerRemoved { account, .. }
                | TransactionEvent::BakerStakeDecreased { account, .. } => {
                    self.apply_pending_change(store, account, payload, state)
                        .await?;
                }
                TransactionEvent::BakerStakeIncreased {
                    baker_id,
                    new_stake,
                    ..
                } => {
                    let mut baker = load_baker(store, *baker_id).await?;
                    baker.active_mut("increase stake")?.staked_amount = *new_stake;
                    store.save_baker(baker).await?;
                }
                TransactionEvent::BakerSetRestakeEarnings {
                    baker_id,
                    restake_earnings,
                    ..
                } => {
                    let mut baker = load_baker(store, *baker_id).await?;
                    baker.active_mut("set restake earnings")?.restake_earnings = *restake_earnings;
                    store.save_baker(baker).await?;
                }
                TransactionEvent::Other => {}
            }
        }
        Ok(())
    }

    /// Install the pending change reported in the account info of `account`.
    async fn apply_pending_change(
        &self,
        store: &mut dyn BakerStore,
        account: &AccountAddress,
        payload: &BlockDataPayload,
        state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let account_baker = payload
            .bakers_with_new_pending_changes
            .iter()
            .find(|info| info.address == *account)
            .and_then(|info| info.baker.as_ref())
            .ok_or_else(|| {
                ImportError::DataIntegrity(format!(
                    "account info not included for baker account {account}, or account is not a baker"
                ))
            })?;
        let reported = account_baker.pending_change.ok_or_else(|| {
            ImportError::DataIntegrity(format!(
                "baker {} has no pending change in its account info",
                account_baker.baker_id
            ))
        })?;

        let block = &payload.block;
        let change = match reported {
            AccountBakerPendingChange::RemovePending { epoch } => PendingChange::Removal {
                effective_time: self.chain_time.effective_time(epoch, block)?,
                epoch,
            },
            AccountBakerPendingChange::ReduceStakePending { new_stake, epoch } => {
                PendingChange::ReduceStake {
                    effective_time: self.chain_time.effective_time(epoch, block)?,
                    new_staked_amount: new_stake,
                    epoch,
                }
            }
        };

        let mut baker = load_baker(store, account_baker.baker_id).await?;
        baker.active_mut("set pending change")?.pending_change = Some(change);
        store.save_baker(baker).await?;

        let at = change.effective_time();
        if state.next_pending_baker_change_time.map_or(true, |next| next > at) {
            state.next_pending_baker_change_time = Some(at);
        }
        Ok(())
    }

    /// Add reward balance updates to the stake of active bakers that restake.
    async fn update_stake_from_earnings(
        &self,
        store: &mut dyn BakerStore,
        updates: &[AccountBalanceUpdate],
    ) -> Result<(), ImportError> {
        let mut earnings: HashMap<AccountAddress, i64> = HashMap::new();
        for u in updates {
            *earnings.entry(u.address.base_address()).or_default() += u.amount_adjustment;
        }
        if earnings.is_empty() {
            return Ok(());
        }

        let addresses: Vec<AccountAddress> = earnings.keys().copied().collect();
        let ids = self.accounts.account_ids(&addresses).await?;

        for (address, amount) in earnings {
            let id = *ids
                .get(&address)
                .ok_or_else(|| ImportError::AccountNotFound(address.to_string()))?;
            let Some(mut baker) = store.get_baker(id).await? else {
                continue;
            };
            let BakerState::Active(active) = &mut baker.state else {
                continue;
            };
            if !active.restake_earnings {
                continue;
            }
            active.staked_amount = active
                .staked_amount
                .checked_add_signed(amount)
                .ok_or_else(|| {
                    ImportError::DataIntegrity(format!(
                        "stake of baker {id} out of range after adding {amount}"
                    ))
                })?;
            store.save_baker(baker).await?;
        }
        Ok(())
    }
}

async fn load_baker(store: &mut dyn BakerStore, id: u64) -> Result<Baker, ImportError> {
    store
        .get_baker(id)
        .await?
        .ok_or(ImportError::BakerNotFound(id))
}

async fn min_pending_change_time(
    store: &mut dyn BakerStore,
) -> Result<Option<DateTime<Utc>>, ImportError> {
    Ok(store
        .bakers_with_pending_change()
        .await?
        .iter()
        .filter_map(|b| b.pending_change().map(|c| c.effective_time()))
        .min())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::AccountBaker;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Bakers(BTreeMap<u64, Baker>);

    #[async_trait]
    impl BakerStore for Bakers {
        async fn get_baker(&mut self, id: u64) -> Result<Option<Baker>, ImportError> {
            Ok(self.0.get(&id).cloned())
        }
        async fn save_baker(&mut self, baker: Baker) -> Result<(), ImportError> {
            self.0.insert(baker.id, baker);
            Ok(())
        }
        async fn bakers_with_pending_change(&mut self) -> Result<Vec<Baker>, ImportError> {
            Ok(self.0.values().filter(|b| b.pending_change().is_some()).cloned().collect())
        }
        async fn total_amount_staked(&mut self) -> Result<u64, ImportError> {
            Ok(self.0.values().filter_map(|b| b.active()).map(|a| a.staked_amount).sum())
        }
    }

    /// Account id is the first address byte.
    struct FirstByteLookup;

    #[async_trait]
    impl AccountLookup for FirstByteLookup {
        async fn account_ids(
            &self,
            base_addresses: &[AccountAddress],
        ) -> Result<HashMap<AccountAddress, u64>, ImportError> {
            Ok(base_addresses.iter().map(|a| (*a, a.0[0] as u64)).collect())
        }
    }

    fn handler() -> BakerImportHandler {
        BakerImportHandler::new(ChainTimeConfig::default(), Arc::new(FirstByteLookup))
    }

    fn addr(id: u8) -> AccountAddress {
        let mut bytes = [0u8; 32];
        bytes[0] = id;
        AccountAddress(bytes)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 7, 1, 0, 0, 0).unwrap()
    }

    fn block(slot_time: DateTime<Utc>, slot: u64, genesis_index: u32) -> BlockInfo {
        BlockInfo {
            height: 100,
            slot,
            slot_time,
            genesis_index,
            protocol_version: 1,
        }
    }

    fn payload(block: BlockInfo) -> BlockDataPayload {
        BlockDataPayload {
            block,
            kind: BlockKind::Regular,
            created_accounts: vec![],
            bakers_with_new_pending_changes: vec![],
            transaction_events: vec![],
            special_event_balance_updates: vec![],
            transactions: vec![],
            transaction_balance_updates: vec![],
        }
    }

    fn baker_info(id: u8, change: AccountBakerPendingChange) -> AccountInfo {
        AccountInfo {
            account_index: id as u64,
            address: addr(id),
            balance: 0,
            baker: Some(AccountBaker {
                baker_id: id as u64,
                staked_amount: 1_000,
                restake_earnings: true,
                pending_change: Some(change),
            }),
        }
    }

    fn removal_at(at: DateTime<Utc>) -> PendingChange {
        PendingChange::Removal {
            effective_time: at,
            epoch: 1,
        }
    }

    fn active_with(id: u64, stake: u64, change: Option<PendingChange>) -> Baker {
        Baker {
            id,
            state: BakerState::Active(ActiveBakerState {
                staked_amount: stake,
                restake_earnings: true,
                pending_change: change,
            }),
        }
    }

    #[tokio::test]
    async fn genesis_block_creates_bakers() {
        let mut store = Bakers::default();
        let mut p = payload(block(t0(), 0, 0));
        p.kind = BlockKind::Genesis;
        p.created_accounts = vec![
            baker_info(1, AccountBakerPendingChange::RemovePending { epoch: 0 }),
            AccountInfo {
                account_index: 2,
                address: addr(2),
                balance: 5,
                baker: None,
            },
        ];
        let result = handler()
            .handle_baker_updates(&mut store, &p, &mut ImportState::default())
            .await
            .unwrap();
        assert_eq!(store.0.len(), 1);
        assert!(store.0[&1].pending_change().is_none());
        assert_eq!(result.total_amount_staked, 1_000);
    }

    #[tokio::test]
    async fn removal_matures_exactly_once() {
        let mut store = Bakers::default();
        store.0.insert(7, active_with(7, 500, Some(removal_at(t0()))));
        let mut state = ImportState {
            last_genesis_index: 0,
            next_pending_baker_change_time: Some(t0()),
            ..Default::default()
        };

        let later = block(t0() + Duration::seconds(1), 10, 0);
        let h = handler();
        let r = h
            .handle_baker_updates(&mut store, &payload(later.clone()), &mut state)
            .await
            .unwrap();
        assert_eq!(store.0[&7].state, BakerState::Removed { effective_time: t0() });
        assert_eq!(state.next_pending_baker_change_time, None);
        assert_eq!(r.total_amount_staked, 0);

        // Second pass: nothing pending, state unchanged.
        h.handle_baker_updates(&mut store, &payload(later), &mut state)
            .await
            .unwrap();
        assert_eq!(store.0[&7].state, BakerState::Removed { effective_time: t0() });
    }

    #[test]
    fn removed_baker_rejects_direct_maturation() {
        let mut baker = active_with(3, 10, Some(removal_at(t0())));
        assert!(baker.apply_due_change(t0()).unwrap());
        assert!(matches!(
            baker.apply_due_change(t0()),
            Err(ImportError::InvalidBakerState { baker_id: 3, .. })
        ));
    }

    #[tokio::test]
    async fn reduce_stake_matures_and_min_is_recomputed() {
        let mut store = Bakers::default();
        store.0.insert(
            1,
            active_with(
                1,
                900,
                Some(PendingChange::ReduceStake {
                    effective_time: t0(),
                    new_staked_amount: 400,
                    epoch: 3,
                }),
            ),
        );
        let far = t0() + Duration::days(3);
        store.0.insert(2, active_with(2, 100, Some(removal_at(far))));
        let mut state = ImportState {
            last_genesis_index: 0,
            next_pending_baker_change_time: Some(t0()),
            ..Default::default()
        };

        handler()
            .handle_baker_updates(&mut store, &payload(block(t0() + Duration::minutes(1), 5, 0)), &mut state)
            .await
            .unwrap();

        let a = store.0[&1].active().unwrap();
        assert_eq!(a.staked_amount, 400);
        assert!(a.pending_change.is_none());
        assert!(store.0[&2].pending_change().is_some());
        assert_eq!(state.next_pending_baker_change_time, Some(far));
    }

    #[tokio::test]
    async fn maturation_requires_slot_time_strictly_after_tracked_minimum() {
        let mut store = Bakers::default();
        store.0.insert(1, active_with(1, 10, Some(removal_at(t0()))));
        let mut state = ImportState {
            last_genesis_index: 0,
            next_pending_baker_change_time: Some(t0()),
            ..Default::default()
        };
        handler()
            .handle_baker_updates(&mut store, &payload(block(t0(), 5, 0)), &mut state)
            .await
            .unwrap();
        assert!(store.0[&1].pending_change().is_some());
    }

    #[tokio::test]
    async fn baker_removed_event_installs_pending_change() {
        let mut store = Bakers::default();
        store.0.insert(4, Baker::new_active(4, 1_000, true));
        let b = block(t0(), 100, 0);
        let mut p = payload(b.clone());
        p.transaction_events = vec![TransactionEvent::BakerRemoved {
            baker_id: 4,
            account: addr(4),
        }];
        p.bakers_with_new_pending_changes =
            vec![baker_info(4, AccountBakerPendingChange::RemovePending { epoch: 2 })];
        let mut state = ImportState::default();

        handler()
            .handle_baker_updates(&mut store, &p, &mut state)
            .await
            .unwrap();

        let expected = t0() - Duration::milliseconds(25_000) + Duration::hours(2);
        assert_eq!(
            store.0[&4].pending_change(),
            Some(&PendingChange::Removal {
                effective_time: expected,
                epoch: 2
            })
        );
        assert_eq!(state.next_pending_baker_change_time, Some(expected));
    }

    #[tokio::test]
    async fn stake_decrease_on_removed_baker_is_fatal() {
        let mut store = Bakers::default();
        store.0.insert(
            4,
            Baker {
                id: 4,
                state: BakerState::Removed { effective_time: t0() },
            },
        );
        let mut p = payload(block(t0(), 1, 0));
        p.transaction_events = vec![TransactionEvent::BakerStakeDecreased {
            baker_id: 4,
            account: addr(4),
            new_stake: 1,
        }];
        p.bakers_with_new_pending_changes = vec![baker_info(
            4,
            AccountBakerPendingChange::ReduceStakePending {
                new_stake: 1,
                epoch: 1,
            },
        )];
        let err = handler()
            .handle_baker_updates(&mut store, &p, &mut ImportState::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidBakerState { baker_id: 4, .. }));
    }

    #[tokio::test]
    async fn missing_account_info_is_fatal() {
        let mut store = Bakers::default();
        store.0.insert(4, Baker::new_active(4, 1, false));
        let mut p = payload(block(t0(), 1, 0));
        p.transaction_events = vec![TransactionEvent::BakerRemoved {
            baker_id: 4,
            account: addr(4),
        }];
        let err = handler()
            .handle_baker_updates(&mut store, &p, &mut ImportState::default())
            .await
            .unwrap_err();
        assert!(err.is_data_integrity());
    }

    #[tokio::test]
    async fn era_change_reschedules_pending_changes() {
        let mut store = Bakers::default();
        store.0.insert(
            9,
            active_with(
                9,
                10,
                Some(PendingChange::Removal {
                    effective_time: t0() + Duration::days(30),
                    epoch: 5,
                }),
            ),
        );
        let mut state = ImportState {
            last_genesis_index: 0,
            next_pending_baker_change_time: Some(t0() + Duration::days(30)),
            ..Default::default()
        };
        // New era: slot 40 at t0 puts era genesis 10s earlier.
        let b = block(t0(), 40, 1);

        handler()
            .handle_baker_updates(&mut store, &payload(b), &mut state)
            .await
            .unwrap();

        let expected = t0() - Duration::seconds(10) + Duration::hours(5);
        assert_eq!(state.last_genesis_index, 1);
        assert_eq!(state.next_pending_baker_change_time, Some(expected));
        assert_eq!(
            store.0[&9].pending_change().map(|c| c.effective_time()),
            Some(expected)
        );
    }

    #[tokio::test]
    async fn rewards_accrue_before_absolute_stake_increase() {
        let mut store = Bakers::default();
        store.0.insert(1, Baker::new_active(1, 100, true));
        store.0.insert(2, Baker::new_active(2, 100, false));
        store.0.insert(3, Baker::new_active(3, 100, true));

        let mut alias = addr(1);
        alias.0[31] = 9;
        let reward = |address, amount| AccountBalanceUpdate {
            address,
            amount_adjustment: amount,
            balance_update_type: crate::payload::BalanceUpdateType::BakingReward,
            transaction_hash: None,
        };
        let mut p = payload(block(t0(), 1, 0));
        p.special_event_balance_updates =
            vec![reward(addr(1), 5), reward(alias, 7), reward(addr(2), 50), reward(addr(3), 1)];
        p.transaction_events = vec![TransactionEvent::BakerStakeIncreased {
            baker_id: 3,
            account: addr(3),
            new_stake: 1_000,
        }];

        let r = handler()
            .handle_baker_updates(&mut store, &p, &mut ImportState::default())
            .await
            .unwrap();

        assert_eq!(store.0[&1].active().unwrap().staked_amount, 112);
        assert_eq!(store.0[&2].active().unwrap().staked_amount, 100);
        assert_eq!(store.0[&3].active().unwrap().staked_amount, 1_000);
        assert_eq!(r.total_amount_staked, 1_212);
    }

    #[tokio::test]
    async fn baker_added_reactivates_removed_baker() {
        let mut store = Bakers::default();
        store.0.insert(
            6,
            Baker {
                id: 6,
                state: BakerState::Removed { effective_time: t0() },
            },
        );
        let mut p = payload(block(t0(), 1, 0));
        p.transaction_events = vec![
            TransactionEvent::BakerAdded {
                baker_id: 6,
                account: addr(6),
                stake: 42,
                restake_earnings: false,
            },
            TransactionEvent::BakerSetRestakeEarnings {
                baker_id: 6,
                account: addr(6),
                restake_earnings: true,
            },
        ];
        handler()
            .handle_baker_updates(&mut store, &p, &mut ImportState::default())
            .await
            .unwrap();
        let a = store.0[&6].active().unwrap();
        assert_eq!(a.staked_amount, 42);
        assert!(a.restake_earnings);
    }
}
