//! Error types for the ccdindex import pipeline.

use thiserror::Error;

/// Errors that can occur while importing and reconciling chain data.
#[derive(Debug, Error)]
pub enum ImportError {
    /// Storage layer failure. `transient` marks connection resets, deadlocks,
    /// serialization failures and timeouts.
    #[error("Storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("Node error: {0}")]
    Node(String),

    #[error("Not able to map transaction {transaction_hash}, since transaction sender was null")]
    MissingSender { transaction_hash: String },

    #[error("Baker {baker_id} is not {expected}; cannot {operation}")]
    InvalidBakerState {
        baker_id: u64,
        expected: &'static str,
        operation: &'static str,
    },

    #[error("Baker {0} does not exist")]
    BakerNotFound(u64),

    #[error("Account with base address {0} does not exist")]
    AccountNotFound(String),

    #[error("Balance mismatch for account {account_id}: replayed {actual}, expected {expected}")]
    BalanceMismatch {
        account_id: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Import aborted: {reason}")]
    Aborted { reason: String },
}

impl ImportError {
    /// Transient storage failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: true,
        }
    }

    /// Non-transient storage failure.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns `true` if retrying the unit of work may succeed.
    ///
    /// Only storage errors explicitly marked transient and node network errors
    /// qualify; everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                transient: true,
                ..
            } | Self::Node(_)
        )
    }

    /// Returns `true` for errors indicating corrupt or inconsistent chain data.
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            Self::MissingSender { .. }
                | Self::InvalidBakerState { .. }
                | Self::BakerNotFound(_)
                | Self::AccountNotFound(_)
                | Self::BalanceMismatch { .. }
                | Self::DataIntegrity(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ImportError::transient("deadlock detected").is_transient());
        assert!(ImportError::Node("connection refused".into()).is_transient());
        assert!(!ImportError::storage("unique violation").is_transient());
        assert!(!ImportError::MissingSender {
            transaction_hash: "ab".into()
        }
        .is_transient());
    }

    #[test]
    fn integrity_errors_are_never_transient() {
        let err = ImportError::BalanceMismatch {
            account_id: 7,
            expected: 10,
            actual: 11,
        };
        assert!(err.is_data_integrity());
        assert!(!err.is_transient());
    }
}
