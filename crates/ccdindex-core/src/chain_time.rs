//! Chain-time arithmetic for pending baker changes.
//!
//! Pending changes are scheduled by epoch. The wall-clock effective time is
//! derived from the block that carries the change:
//!
//! ```text
//! effective_time = slot_time - slot * slot_duration + epoch * epoch_duration
//! ```
//!
//! The first two terms recover the genesis time of the current era. This only
//! holds while slot and epoch durations are constants of the protocol version,
//! so the durations are configured per protocol version.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use crate::types::BlockInfo;

/// Fixed time parameters of a protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTimeParameters {
    pub slot_duration_ms: u64,
    pub epoch_duration_ms: u64,
}

impl Default for ChainTimeParameters {
    fn default() -> Self {
        Self {
            slot_duration_ms: 250,
            epoch_duration_ms: 3_600_000,
        }
    }
}

/// Protocol version → time parameters.
///
/// A lookup for a version without an entry uses the highest configured version
/// below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainTimeConfig {
    versions: BTreeMap<u32, ChainTimeParameters>,
}

impl Default for ChainTimeConfig {
    fn default() -> Self {
        let versions = (1..=3)
            .map(|v| (v, ChainTimeParameters::default()))
            .collect();
        Self { versions }
    }
}

impl ChainTimeConfig {
    pub fn new(versions: BTreeMap<u32, ChainTimeParameters>) -> Self {
        Self { versions }
    }

    pub fn with_version(mut self, protocol_version: u32, params: ChainTimeParameters) -> Self {
        self.versions.insert(protocol_version, params);
        self
    }

    pub fn parameters(&self, protocol_version: u32) -> Result<ChainTimeParameters, ImportError> {
        self.versions
            .range(..=protocol_version)
            .next_back()
            .map(|(_, p)| *p)
            .ok_or_else(|| {
                ImportError::Config(format!(
                    "no chain time parameters for protocol version {protocol_version}"
                ))
            })
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        if self.versions.is_empty() {
            return Err(ImportError::Config(
                "chain_time must configure at least one protocol version".into(),
            ));
        }
        for (version, p) in &self.versions {
            if p.slot_duration_ms == 0 || p.epoch_duration_ms == 0 {
                return Err(ImportError::Config(format!(
                    "chain time durations for protocol version {version} must be > 0"
                )));
            }
        }
        Ok(())
    }

    /// Wall-clock time at which a change scheduled for `epoch` takes effect,
    /// using the era of `block`.
    pub fn effective_time(&self, epoch: u64, block: &BlockInfo) -> Result<DateTime<Utc>, ImportError> {
        let params = self.parameters(block.protocol_version)?;
        calculate_effective_time(epoch, block.slot_time, block.slot, params)
    }
}

/// `slot_time - slot * slot_duration + epoch * epoch_duration`.
pub fn calculate_effective_time(
    epoch: u64,
    slot_time: DateTime<Utc>,
    slot: u64,
    params: ChainTimeParameters,
) -> Result<DateTime<Utc>, ImportError> {
    let overflow = || ImportError::DataIntegrity(format!(
        "effective time overflows for epoch {epoch} at slot {slot}"
    ));
    let since_genesis = millis(slot, params.slot_duration_ms).ok_or_else(overflow)?;
    let until_epoch = millis(epoch, params.epoch_duration_ms).ok_or_else(overflow)?;
    slot_time
        .checked_sub_signed(since_genesis)
        .and_then(|genesis| genesis.checked_add_signed(until_epoch))
        .ok_or_else(overflow)
}

fn millis(count: u64, unit_ms: u64) -> Option<Duration> {
    let ms = count.checked_mul(unit_ms)?;
    Duration::try_milliseconds(i64::try_from(ms).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn block(slot: u64, protocol_version: u32) -> BlockInfo {
        BlockInfo {
            height: 10,
            slot,
            slot_time: Utc.with_ymd_and_hms(2021, 6, 9, 12, 0, 0).unwrap(),
            genesis_index: 0,
            protocol_version,
        }
    }

    #[test]
    fn effective_time_formula() {
        let b = block(100, 1);
        let t = ChainTimeConfig::default().effective_time(2, &b).unwrap();
        assert_eq!(
            t,
            b.slot_time - Duration::milliseconds(25_000) + Duration::hours(2)
        );
    }

    #[test]
    fn falls_back_to_lower_version() {
        let cfg = ChainTimeConfig::default().with_version(
            5,
            ChainTimeParameters {
                slot_duration_ms: 100,
                epoch_duration_ms: 60_000,
            },
        );
        assert_eq!(cfg.parameters(4).unwrap(), ChainTimeParameters::default());
        assert_eq!(cfg.parameters(9).unwrap().slot_duration_ms, 100);
        assert!(cfg.parameters(0).is_err());
    }

    #[test]
    fn validate_rejects_zero_durations() {
        let cfg = ChainTimeConfig::default().with_version(
            4,
            ChainTimeParameters {
                slot_duration_ms: 0,
                epoch_duration_ms: 1,
            },
        );
        assert!(cfg.validate().is_err());
        assert!(ChainTimeConfig::default().validate().is_ok());
    }

    #[test]
    fn overflow_is_an_error() {
        let b = block(u64::MAX, 1);
        assert!(ChainTimeConfig::default().effective_time(1, &b).is_err());
    }
}
