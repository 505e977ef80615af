//! Shared types for the import pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ImportError;

// ─── AccountAddress ───────────────────────────────────────────────────────────

/// A 32-byte account address.
///
/// Addresses sharing the first [`AccountAddress::BASE_LEN`] bytes are aliases
/// of the same account; the base address zeroes the alias bytes and is the
/// stable join key for accounts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountAddress(pub [u8; 32]);

impl AccountAddress {
    /// Number of leading bytes shared by all aliases of an account.
    pub const BASE_LEN: usize = 29;

    /// The canonical form with the alias bytes cleared.
    pub fn base_address(&self) -> AccountAddress {
        let mut bytes = self.0;
        bytes[Self::BASE_LEN..].fill(0);
        AccountAddress(bytes)
    }

    /// Returns `true` if both addresses refer to the same account.
    pub fn is_alias_of(&self, other: &AccountAddress) -> bool {
        self.0[..Self::BASE_LEN] == other.0[..Self::BASE_LEN]
    }

    pub fn from_hex(s: &str) -> Result<Self, ImportError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| ImportError::DataIntegrity(format!("invalid account address {s}: {e}")))?;
        let array: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            ImportError::DataIntegrity(format!(
                "account address must be 32 bytes, got {}",
                v.len()
            ))
        })?;
        Ok(AccountAddress(array))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountAddress({})", self.to_hex())
    }
}

impl Serialize for AccountAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AccountAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AccountAddress::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ─── BlockInfo ────────────────────────────────────────────────────────────────

/// The block attributes the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block height.
    pub height: u64,
    /// Slot number within the current era.
    pub slot: u64,
    /// Wall-clock time of the slot.
    pub slot_time: DateTime<Utc>,
    /// Era counter, incremented by every protocol update.
    pub genesis_index: u32,
    /// Protocol version in effect for this block.
    pub protocol_version: u32,
}

// ─── ImportSource ─────────────────────────────────────────────────────────────

/// Where imported rows came from. Used to tag rows and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImportSource {
    /// Re-derived from the staging database.
    DatabaseImport,
    /// Derived while importing directly from a node.
    NodeImport,
}

impl ImportSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatabaseImport => "database_import",
            Self::NodeImport => "node_import",
        }
    }
}

impl fmt::Display for ImportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── TransactionType ─────────────────────────────────────────────────────────

/// Initiator kind of a block item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// Signed and sent by an account.
    AccountTransaction,
    CredentialDeployment,
    /// Chain update signed by governance keys.
    Update,
}

// ─── Candidate rows (read side) ───────────────────────────────────────────────

/// A transaction result event as read from the staging source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub block_height: u64,
    pub block_slot_time: DateTime<Utc>,
    pub transaction_index: u32,
    /// Position of the event within its transaction's emitted events.
    pub transaction_event_index: u32,
    pub transaction_hash: String,
    pub transaction_type: TransactionType,
    pub sender: Option<AccountAddress>,
    pub event: serde_json::Value,
}

/// A rejected transaction as read from the staging source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRejection {
    pub block_height: u64,
    pub block_slot_time: DateTime<Utc>,
    pub transaction_index: u32,
    pub transaction_hash: String,
    pub transaction_type: TransactionType,
    pub sender: Option<AccountAddress>,
    pub reason: serde_json::Value,
}

// ─── Derived rows (write side) ────────────────────────────────────────────────

/// Kind of derived row that receives a per-transaction ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKind {
    Event,
    Rejection,
}

/// A stored event keyed by `(block_height, transaction_index, event_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub block_height: u64,
    pub transaction_index: u32,
    pub event_index: u32,
    pub transaction_hash: String,
    pub sender: AccountAddress,
    pub block_slot_time: DateTime<Utc>,
    pub source: ImportSource,
    pub event: serde_json::Value,
}

/// A stored rejection keyed by `(block_height, transaction_index, event_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRejection {
    pub block_height: u64,
    pub transaction_index: u32,
    pub event_index: u32,
    pub transaction_hash: String,
    pub sender: AccountAddress,
    pub block_slot_time: DateTime<Utc>,
    pub source: ImportSource,
    pub reason: serde_json::Value,
}

/// Marker stating that a height has been fully imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadHeight {
    pub block_height: u64,
    pub source: ImportSource,
    pub created_at: DateTime<Utc>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
