//! Per-block data handed to the baker and account handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccountAddress, BlockInfo};

/// Pending change reported by the node for a baker account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountBakerPendingChange {
    RemovePending { epoch: u64 },
    ReduceStakePending { new_stake: u64, epoch: u64 },
}

/// Baker section of an account info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBaker {
    pub baker_id: u64,
    pub staked_amount: u64,
    pub restake_earnings: bool,
    pub pending_change: Option<AccountBakerPendingChange>,
}

/// Account state as reported by the node at a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_index: u64,
    pub address: AccountAddress,
    /// Balance in micro CCD.
    pub balance: u64,
    pub baker: Option<AccountBaker>,
}

/// Baker-relevant events emitted by successful transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionEvent {
    BakerAdded {
        baker_id: u64,
        account: AccountAddress,
        stake: u64,
        restake_earnings: bool,
    },
    BakerRemoved {
        baker_id: u64,
        account: AccountAddress,
    },
    BakerStakeIncreased {
        baker_id: u64,
        account: AccountAddress,
        new_stake: u64,
    },
    BakerStakeDecreased {
        baker_id: u64,
        account: AccountAddress,
        new_stake: u64,
    },
    BakerSetRestakeEarnings {
        baker_id: u64,
        account: AccountAddress,
        restake_earnings: bool,
    },
    /// Any event the baker handler does not act on.
    Other,
}

/// Cause of a balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalanceUpdateType {
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

/// A single signed change to an account's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalanceUpdate {
    pub address: AccountAddress,
    pub amount_adjustment: i64,
    pub balance_update_type: BalanceUpdateType,
    /// Hash of the causing transaction; `None` for special events.
    pub transaction_hash: Option<String>,
}

/// One release of a transfer with schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRelease {
    pub timestamp: DateTime<Utc>,
    pub amount: u64,
}

/// A `TransferredWithSchedule` event: `releases` unlock for `to` one by one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTransfer {
    pub from: AccountAddress,
    pub to: AccountAddress,
    pub releases: Vec<ScheduledRelease>,
}

/// A transaction of the block with every address its result touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub hash: String,
    pub sender: Option<AccountAddress>,
    pub affected_addresses: Vec<AccountAddress>,
    /// Scheduled transfers emitted by the transaction; empty if it was rejected.
    #[serde(default)]
    pub scheduled_transfers: Vec<ScheduledTransfer>,
}

/// Genesis blocks seed bakers from account infos; regular blocks apply changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Genesis,
    Regular,
}

/// Everything the handlers need to import one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDataPayload {
    pub block: BlockInfo,
    pub kind: BlockKind,
    pub created_accounts: Vec<AccountInfo>,
    /// Account infos of bakers whose pending change was set in this block.
    pub bakers_with_new_pending_changes: Vec<AccountInfo>,
    /// Events of successful transactions, in block order.
    pub transaction_events: Vec<TransactionEvent>,
    /// Balance updates caused by special events (rewards, minting).
    pub special_event_balance_updates: Vec<AccountBalanceUpdate>,
    /// Transactions of the block in block order.
    #[serde(default)]
    pub transactions: Vec<TransactionSummary>,
    /// Balance updates caused by transactions, in block order.
    #[serde(default)]
    pub transaction_balance_updates: Vec<AccountBalanceUpdate>,
}

impl BlockDataPayload {
    /// Every balance update of the block: transactions first, then special
    /// events, which the chain pays out at the end of the block.
    pub fn balance_updates(&self) -> Vec<AccountBalanceUpdate> {
        self.transaction_balance_updates
            .iter()
            .chain(&self.special_event_balance_updates)
            .cloned()
            .collect()
    }
}
