//! Account reconciler: balance aggregation and statement entries.
//!
//! All account keyed work happens on base addresses, so aliases of one
//! account collapse into a single account id.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use crate::payload::{AccountBalanceUpdate, AccountInfo, BalanceUpdateType, TransactionSummary};
use crate::types::AccountAddress;

/// Resolves base addresses to account ids.
#[async_trait]
pub trait AccountLookup: Send + Sync {
    /// Ids of the accounts that exist; unknown addresses are absent from the map.
    async fn account_ids(
        &self,
        base_addresses: &[AccountAddress],
    ) -> Result<HashMap<AccountAddress, u64>, ImportError>;
}

/// Committed accounts plus the accounts created by the block being imported.
///
/// Those are written in the same session as the rest of the block and are not
/// visible to the committed lookup yet.
pub struct BlockAccountLookup {
    committed: Arc<dyn AccountLookup>,
    created: HashMap<AccountAddress, u64>,
}

impl BlockAccountLookup {
    pub fn new(committed: Arc<dyn AccountLookup>, created: &[AccountInfo]) -> Self {
        Self {
            committed,
            created: created
                .iter()
                .map(|info| (info.address.base_address(), info.account_index))
                .collect(),
        }
    }
}

#[async_trait]
impl AccountLookup for BlockAccountLookup {
    async fn account_ids(
        &self,
        base_addresses: &[AccountAddress],
    ) -> Result<HashMap<AccountAddress, u64>, ImportError> {
        let unknown: Vec<AccountAddress> = base_addresses
            .iter()
            .filter(|a| !self.created.contains_key(a))
            .copied()
            .collect();
        let mut ids = if unknown.is_empty() {
            HashMap::new()
        } else {
            self.committed.account_ids(&unknown).await?
        };
        ids.extend(
            base_addresses
                .iter()
                .filter_map(|a| self.created.get(a).map(|id| (*a, *id))),
        );
        Ok(ids)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub canonical_address: AccountAddress,
    pub base_address: AccountAddress,
    pub balance: u64,
    pub transaction_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Net change to apply to one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub account_id: u64,
    pub amount_adjustment: i64,
    pub transactions_added: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountTransactionRelation {
    pub account_id: u64,
    pub transaction_id: u64,
}

/// A block transaction paired with its stored id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionPair {
    pub source: TransactionSummary,
    pub transaction_id: u64,
}

/// Balances of an account around the application of its [`AccountUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountUpdateResult {
    pub account_id: u64,
    pub balance_before: u64,
    pub balance_after: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatementEntryType {
    AmountDecrypted,
    AmountEncrypted,
    BakingReward,
    BlockReward,
    FinalizationReward,
    MintReward,
    TransactionFee,
    TransferIn,
    TransferOut,
}

impl AccountStatementEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AmountDecrypted => "amount_decrypted",
            Self::AmountEncrypted => "amount_encrypted",
            Self::BakingReward => "baking_reward",
            Self::BlockReward => "block_reward",
            Self::FinalizationReward => "finalization_reward",
            Self::MintReward => "mint_reward",
            Self::TransactionFee => "transaction_fee",
            Self::TransferIn => "transfer_in",
            Self::TransferOut => "transfer_out",
        }
    }
}

impl From<BalanceUpdateType> for AccountStatementEntryType {
    fn from(t: BalanceUpdateType) -> Self {
        match t {
            BalanceUpdateType::AmountDecrypted => Self::AmountDecrypted,
            BalanceUpdateType::AmountEncrypted => Self::AmountEncrypted,
            BalanceUpdateType::BakingReward => Self::BakingReward,
            BalanceUpdateType::BlockReward => Self::BlockReward,
            BalanceUpdateType::FinalizationReward => Self::FinalizationReward,
            BalanceUpdateType::MintReward => Self::MintReward,
            BalanceUpdateType::TransactionFee => Self::TransactionFee,
            BalanceUpdateType::TransferIn => Self::TransferIn,
            BalanceUpdateType::TransferOut => Self::TransferOut,
        }
    }
}

/// Immutable ledger line with the running balance after `amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatementEntry {
    pub account_id: u64,
    pub timestamp: DateTime<Utc>,
    pub amount: i64,
    pub entry_type: AccountStatementEntryType,
    pub block_id: u64,
    pub transaction_id: Option<u64>,
    pub account_balance: u64,
}

/// One release of a scheduled transfer, owned by the receiving account.
///
/// `index` is the position of the release within its transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountReleaseScheduleItem {
    pub account_id: u64,
    pub transaction_id: u64,
    pub index: u32,
    pub timestamp: DateTime<Utc>,
    pub amount: u64,
    pub from_account_id: u64,
}

pub struct AccountChangeCalculator {
    accounts: Arc<dyn AccountLookup>,
}

impl AccountChangeCalculator {
    pub fn new(accounts: Arc<dyn AccountLookup>) -> Self {
        Self { accounts }
    }

    pub fn accounts_created(
        &self,
        created: &[AccountInfo],
        block_slot_time: DateTime<Utc>,
    ) -> Vec<Account> {
        created
            .iter()
            .map(|info| Account {
                id: info.account_index,
                canonical_address: info.address,
                base_address: info.address.base_address(),
                balance: info.balance,
                transaction_count: 0,
                created_at: block_slot_time,
            })
            .collect()
    }

    /// One relation per distinct account touched by each transaction.
    ///
    /// Addresses without a known account are dropped.
    pub async fn account_transaction_relations(
        &self,
        transactions: &[TransactionPair],
    ) -> Result<Vec<AccountTransactionRelation>, ImportError> {
        let per_tx: Vec<(u64, BTreeSet<AccountAddress>)> = transactions
            .iter()
            .map(|tx| {
                let bases = tx
                    .source
                    .sender
                    .iter()
                    .chain(tx.source.affected_addresses.iter())
                    .map(AccountAddress::base_address)
                    .collect();
                (tx.transaction_id, bases)
            })
            .collect();

        let distinct: BTreeSet<AccountAddress> =
            per_tx.iter().flat_map(|(_, b)| b.iter().copied()).collect();
        if distinct.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.lookup(distinct).await?;

        Ok(per_tx
            .iter()
            .flat_map(|(transaction_id, bases)| {
                bases.iter().filter_map(|b| {
                    ids.get(b).map(|&account_id| AccountTransactionRelation {
                        account_id,
                        transaction_id: *transaction_id,
                    })
                })
            })
            .collect())
    }

    /// Net balance change and transaction count per account, ordered by id.
    ///
    /// Accounts whose adjustments cancel out only appear if they gained
    /// transactions.
    pub async fn aggregated_account_updates(
        &self,
        balance_updates: &[AccountBalanceUpdate],
        relations: &[AccountTransactionRelation],
    ) -> Result<Vec<AccountUpdate>, ImportError> {
        let mut per_address: BTreeMap<AccountAddress, i64> = BTreeMap::new();
        for u in balance_updates {
            let sum = per_address.entry(u.address.base_address()).or_default();
            *sum = sum.checked_add(u.amount_adjustment).ok_or_else(|| {
                ImportError::DataIntegrity(format!("balance adjustment overflow for {}", u.address))
            })?;
        }
        let ids = self.lookup(per_address.keys().copied()).await?;

        let mut merged: BTreeMap<u64, AccountUpdate> = BTreeMap::new();
        for (address, amount) in per_address {
            let account_id = *ids
                .get(&address)
                .ok_or_else(|| ImportError::AccountNotFound(address.to_string()))?;
            if amount == 0 {
                continue;
            }
            merged.entry(account_id).or_insert_with(|| empty(account_id)).amount_adjustment += amount;
        }
        for r in relations {
            merged
                .entry(r.account_id)
                .or_insert_with(|| empty(r.account_id))
                .transactions_added += 1;
        }
        Ok(merged.into_values().collect())
    }

    /// Statement entries in update order with a running balance per account.
    ///
    /// Fails with [`ImportError::BalanceMismatch`] if replaying an account's
    /// adjustments from its balance before the update does not end at its
    /// balance after the update.
    pub async fn account_statement_entries(
        &self,
        balance_updates: &[AccountBalanceUpdate],
        update_results: &[AccountUpdateResult],
        block_id: u64,
        block_slot_time: DateTime<Utc>,
        transactions: &[TransactionPair],
    ) -> Result<Vec<AccountStatementEntry>, ImportError> {
        let ids = self
            .lookup(balance_updates.iter().map(|u| u.address.base_address()))
            .await?;

        let mut entries = Vec::with_capacity(balance_updates.len());
        for u in balance_updates {
            let base = u.address.base_address();
            let account_id = *ids
                .get(&base)
                .ok_or_else(|| ImportError::AccountNotFound(base.to_string()))?;
            let transaction_id = u
                .transaction_hash
                .as_deref()
                .map(|hash| transaction_id(transactions, hash))
                .transpose()?;
            entries.push(AccountStatementEntry {
                account_id,
                timestamp: block_slot_time,
                amount: u.amount_adjustment,
                entry_type: u.balance_update_type.into(),
                block_id,
                transaction_id,
                account_balance: 0,
            });
        }

        let results: HashMap<u64, &AccountUpdateResult> =
            update_results.iter().map(|r| (r.account_id, r)).collect();
        let mut running: HashMap<u64, u64> = HashMap::new();
        for entry in &mut entries {
            let result = results.get(&entry.account_id).ok_or_else(|| {
                ImportError::DataIntegrity(format!(
                    "no balance update result for account {}",
                    entry.account_id
                ))
            })?;
            let balance = running.entry(entry.account_id).or_insert(result.balance_before);
            *balance = balance.checked_add_signed(entry.amount).ok_or_else(|| {
                ImportError::DataIntegrity(format!(
                    "balance of account {} out of range while replaying statement",
                    entry.account_id
                ))
            })?;
            entry.account_balance = *balance;
        }

        for (account_id, actual) in running {
            let expected = results[&account_id].balance_after;
            if actual != expected {
                return Err(ImportError::BalanceMismatch {
                    account_id,
                    expected,
                    actual,
                });
            }
        }
        Ok(entries)
    }

    /// Release schedule items of every scheduled transfer in `transactions`.
    ///
    /// Both the sender and the receiver must exist.
    pub async fn account_release_schedule_items(
        &self,
        transactions: &[TransactionPair],
    ) -> Result<Vec<AccountReleaseScheduleItem>, ImportError> {
        let transfers: Vec<_> = transactions
            .iter()
            .flat_map(|tx| {
                tx.source
                    .scheduled_transfers
                    .iter()
                    .map(move |transfer| (tx.transaction_id, transfer))
            })
            .collect();
        if transfers.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self
            .lookup(transfers.iter().flat_map(|(_, t)| {
                [t.to.base_address(), t.from.base_address()]
            }))
            .await?;
        let id_of = |address: &AccountAddress| {
            let base = address.base_address();
            ids.get(&base)
                .copied()
                .ok_or_else(|| ImportError::AccountNotFound(base.to_string()))
        };

        let mut items = Vec::new();
        for (transaction_id, transfer) in transfers {
            let account_id = id_of(&transfer.to)?;
            let from_account_id = id_of(&transfer.from)?;
            for (index, release) in (0u32..).zip(&transfer.releases) {
                items.push(AccountReleaseScheduleItem {
                    account_id,
                    transaction_id,
                    index,
                    timestamp: release.timestamp,
                    amount: release.amount,
                    from_account_id,
                });
            }
        }
        Ok(items)
    }

    async fn lookup(
        &self,
        addresses: impl IntoIterator<Item = AccountAddress>,
    ) -> Result<HashMap<AccountAddress, u64>, ImportError> {
        let distinct: Vec<AccountAddress> = addresses
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if distinct.is_empty() {
            return Ok(HashMap::new());
        }
        self.accounts.account_ids(&distinct).await
    }
}

fn empty(account_id: u64) -> AccountUpdate {
    AccountUpdate {
        account_id,
        amount_adjustment: 0,
        transactions_added: 0,
    }
}

fn transaction_id(transactions: &[TransactionPair], hash: &str) -> Result<u64, ImportError> {
    transactions
        .iter()
        .find(|t| t.source.hash == hash)
        .map(|t| t.transaction_id)
        .ok_or_else(|| ImportError::DataIntegrity(format!("transaction {hash} not found in block")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ScheduledRelease, ScheduledTransfer};
    use chrono::TimeZone;

    /// Knows accounts whose first address byte is below 100; id = that byte.
    struct Lookup;

    #[async_trait]
    impl AccountLookup for Lookup {
        async fn account_ids(
            &self,
            base_addresses: &[AccountAddress],
        ) -> Result<HashMap<AccountAddress, u64>, ImportError> {
            Ok(base_addresses
                .iter()
                .filter(|a| a.0[0] < 100)
                .map(|a| (*a, a.0[0] as u64))
                .collect())
        }
    }

    fn calc() -> AccountChangeCalculator {
        AccountChangeCalculator::new(Arc::new(Lookup))
    }

    fn addr(id: u8, alias: u8) -> AccountAddress {
        let mut bytes = [0u8; 32];
        bytes[0] = id;
        bytes[31] = alias;
        AccountAddress(bytes)
    }

    fn update(address: AccountAddress, amount: i64, tx: Option<&str>) -> AccountBalanceUpdate {
        AccountBalanceUpdate {
            address,
            amount_adjustment: amount,
            balance_update_type: if amount < 0 {
                BalanceUpdateType::TransferOut
            } else {
                BalanceUpdateType::TransferIn
            },
            transaction_hash: tx.map(str::to_string),
        }
    }

    fn tx(hash: &str, id: u64, sender: AccountAddress, affected: Vec<AccountAddress>) -> TransactionPair {
        TransactionPair {
            source: TransactionSummary {
                hash: hash.into(),
                sender: Some(sender),
                affected_addresses: affected,
                scheduled_transfers: vec![],
            },
            transaction_id: id,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn created_accounts_carry_base_address() {
        let info = AccountInfo {
            account_index: 3,
            address: addr(3, 7),
            balance: 50,
            baker: None,
        };
        let accounts = calc().accounts_created(&[info], now());
        assert_eq!(accounts[0].id, 3);
        assert_eq!(accounts[0].canonical_address, addr(3, 7));
        assert_eq!(accounts[0].base_address, addr(3, 0));
        assert_eq!(accounts[0].created_at, now());
    }

    #[tokio::test]
    async fn relations_collapse_aliases_and_drop_unknown() {
        let txs = vec![tx("a", 10, addr(1, 0), vec![addr(1, 5), addr(2, 0), addr(200, 0)])];
        let relations = calc().account_transaction_relations(&txs).await.unwrap();
        assert_eq!(
            relations,
            vec![
                AccountTransactionRelation { account_id: 1, transaction_id: 10 },
                AccountTransactionRelation { account_id: 2, transaction_id: 10 },
            ]
        );
    }

    #[tokio::test]
    async fn aggregation_merges_aliases_and_drops_zero_net() {
        let updates = vec![
            update(addr(1, 0), -30, Some("a")),
            update(addr(1, 9), 10, None),
            update(addr(2, 0), 5, Some("a")),
            update(addr(2, 0), -5, None),
        ];
        let relations = vec![AccountTransactionRelation { account_id: 1, transaction_id: 10 }];
        let result = calc().aggregated_account_updates(&updates, &relations).await.unwrap();
        assert_eq!(
            result,
            vec![AccountUpdate { account_id: 1, amount_adjustment: -20, transactions_added: 1 }]
        );
    }

    #[tokio::test]
    async fn aggregation_fails_for_unknown_account() {
        let err = calc()
            .aggregated_account_updates(&[update(addr(150, 0), 1, None)], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn statement_entries_replay_running_balance() {
        let updates = vec![
            update(addr(1, 0), -30, Some("a")),
            update(addr(2, 0), 30, Some("a")),
            update(addr(1, 4), 7, None),
        ];
        let results = vec![
            AccountUpdateResult { account_id: 1, balance_before: 100, balance_after: 77 },
            AccountUpdateResult { account_id: 2, balance_before: 0, balance_after: 30 },
        ];
        let txs = vec![tx("a", 55, addr(1, 0), vec![addr(2, 0)])];
        let entries = calc()
            .account_statement_entries(&updates, &results, 9, now(), &txs)
            .await
            .unwrap();

        let balances: Vec<_> = entries.iter().map(|e| (e.account_id, e.account_balance)).collect();
        assert_eq!(balances, vec![(1, 70), (2, 30), (1, 77)]);
        assert_eq!(entries[0].transaction_id, Some(55));
        assert_eq!(entries[0].entry_type, AccountStatementEntryType::TransferOut);
        assert_eq!(entries[2].transaction_id, None);
        assert!(entries.iter().all(|e| e.block_id == 9));
    }

    #[tokio::test]
    async fn release_schedule_items_follow_release_order() {
        let mut scheduled = tx("s", 31, addr(1, 2), vec![addr(2, 0)]);
        scheduled.source.scheduled_transfers = vec![ScheduledTransfer {
            from: addr(1, 2),
            to: addr(2, 6),
            releases: vec![
                ScheduledRelease { timestamp: now(), amount: 10 },
                ScheduledRelease { timestamp: now() + chrono::Duration::days(30), amount: 20 },
            ],
        }];
        let plain = tx("p", 32, addr(1, 0), vec![]);

        let items = calc()
            .account_release_schedule_items(&[plain, scheduled])
            .await
            .unwrap();

        assert_eq!(
            items,
            vec![
                AccountReleaseScheduleItem {
                    account_id: 2,
                    transaction_id: 31,
                    index: 0,
                    timestamp: now(),
                    amount: 10,
                    from_account_id: 1,
                },
                AccountReleaseScheduleItem {
                    account_id: 2,
                    transaction_id: 31,
                    index: 1,
                    timestamp: now() + chrono::Duration::days(30),
                    amount: 20,
                    from_account_id: 1,
                },
            ]
        );
    }

    #[tokio::test]
    async fn release_schedule_to_unknown_account_is_fatal() {
        let mut scheduled = tx("s", 31, addr(1, 0), vec![]);
        scheduled.source.scheduled_transfers = vec![ScheduledTransfer {
            from: addr(1, 0),
            to: addr(150, 0),
            releases: vec![ScheduledRelease { timestamp: now(), amount: 1 }],
        }];
        let err = calc()
            .account_release_schedule_items(&[scheduled])
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn block_lookup_sees_accounts_created_in_the_block() {
        let created = [AccountInfo {
            account_index: 120,
            address: addr(120, 3),
            balance: 0,
            baker: None,
        }];
        let lookup = BlockAccountLookup::new(Arc::new(Lookup), &created);
        let ids = lookup
            .account_ids(&[addr(120, 0), addr(5, 0), addr(130, 0)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[&addr(120, 0)], 120);
        assert_eq!(ids[&addr(5, 0)], 5);
    }

    #[tokio::test]
    async fn statement_mismatch_is_fatal() {
        let updates = vec![update(addr(1, 0), 10, None)];
        let results = vec![AccountUpdateResult { account_id: 1, balance_before: 100, balance_after: 111 }];
        let err = calc()
            .account_statement_entries(&updates, &results, 1, now(), &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::BalanceMismatch { account_id: 1, expected: 111, actual: 110 }
        ));
    }
}
