//! Configuration types for vaultio
//!
//! The erasure-set configuration fixes drive count and coding parameters
//! for the lifetime of a set; the lock configuration drives the expiry
//! and refresh cadence of the distributed lock.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Valid erasure-set drive counts.
pub const VALID_SET_SIZES: [usize; 7] = [4, 6, 8, 10, 12, 14, 16];

/// Default erasure block size: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Objects smaller than this are stored inline in `xl.meta`.
pub const INLINE_DATA_THRESHOLD: usize = 128 * 1024;

/// Listing read policy: how many drives a listing consults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuorumPolicy {
    /// Ask data-blocks + 1 drives (default)
    #[default]
    Disk,
    /// Ask half of the drives, rounded up
    Reduced,
    /// Ask every drive
    Strict,
}

/// Heal scan depth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealScanMode {
    /// Check part presence and size only
    #[default]
    Normal,
    /// Re-hash every part through its bitrot verifier
    Deep,
}

/// Erasure set configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetConfig {
    /// Number of data blocks (M)
    pub data_blocks: usize,
    /// Number of parity blocks (N)
    pub parity_blocks: usize,
    /// Erasure block size in bytes (power of two)
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Listing read policy
    #[serde(default)]
    pub quorum_policy: QuorumPolicy,
    /// Override for the number of drives a listing asks; 0 = derive
    /// from `quorum_policy`.
    #[serde(default)]
    pub list_ask_disks: usize,
    /// Heal scan depth
    #[serde(default)]
    pub heal_scan_mode: HealScanMode,
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

impl SetConfig {
    /// Create a configuration and validate it.
    pub fn new(data_blocks: usize, parity_blocks: usize) -> Result<Self> {
        let cfg = Self {
            data_blocks,
            parity_blocks,
            block_size: DEFAULT_BLOCK_SIZE,
            quorum_policy: QuorumPolicy::default(),
            list_ask_disks: 0,
            heal_scan_mode: HealScanMode::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate drive count, coding parameters and block size.
    pub fn validate(&self) -> Result<()> {
        let total = self.drive_count();
        if !VALID_SET_SIZES.contains(&total) {
            return Err(Error::config(format!(
                "drive count {total} not in {VALID_SET_SIZES:?}"
            )));
        }
        if self.data_blocks == 0 || self.parity_blocks == 0 {
            return Err(Error::config("data and parity blocks must be >= 1"));
        }
        if !(4..=256).contains(&total) {
            return Err(Error::config("total blocks must be within 4..=256"));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::config("erasure block size must be a power of two"));
        }
        Ok(())
    }

    /// Total drives in the set (M + N)
    #[must_use]
    pub const fn drive_count(&self) -> usize {
        self.data_blocks + self.parity_blocks
    }

    /// Read quorum: number of drives that must agree on metadata.
    #[must_use]
    pub const fn read_quorum(&self) -> usize {
        self.data_blocks
    }

    /// Write quorum: M + 1 when more than one parity block exists,
    /// otherwise M.
    #[must_use]
    pub const fn write_quorum(&self) -> usize {
        if self.parity_blocks > 1 {
            self.data_blocks + 1
        } else {
            self.data_blocks
        }
    }

    /// Number of drives a listing consults under the configured policy.
    #[must_use]
    pub fn ask_disks(&self) -> usize {
        if self.list_ask_disks > 0 {
            return self.list_ask_disks.min(self.drive_count());
        }
        match self.quorum_policy {
            QuorumPolicy::Disk => (self.data_blocks + 1).min(self.drive_count()),
            QuorumPolicy::Reduced => self.drive_count().div_ceil(2),
            QuorumPolicy::Strict => self.drive_count(),
        }
    }
}

impl Default for SetConfig {
    fn default() -> Self {
        Self {
            data_blocks: 2,
            parity_blocks: 2,
            block_size: DEFAULT_BLOCK_SIZE,
            quorum_policy: QuorumPolicy::default(),
            list_ask_disks: 0,
            heal_scan_mode: HealScanMode::default(),
        }
    }
}

/// Distributed lock configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Entries not refreshed within this window are expired by peers.
    #[serde(default = "default_lock_expiry_secs")]
    pub expiry_secs: u64,
    /// Holder refresh cadence; must be well below half the expiry.
    #[serde(default = "default_lock_refresh_secs")]
    pub refresh_secs: u64,
    /// Per-peer call deadline during acquisition, milliseconds.
    #[serde(default = "default_lock_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_lock_expiry_secs() -> u64 {
    300
}

fn default_lock_refresh_secs() -> u64 {
    10
}

fn default_lock_call_timeout_ms() -> u64 {
    5000
}

impl LockConfig {
    /// Validate the refresh/expiry relationship.
    pub fn validate(&self) -> Result<()> {
        if self.expiry_secs == 0 || self.refresh_secs == 0 {
            return Err(Error::config("lock expiry and refresh must be non-zero"));
        }
        if self.refresh_secs * 2 >= self.expiry_secs {
            return Err(Error::config("lock refresh must be < expiry / 2"));
        }
        Ok(())
    }

    /// Expiry window as a `Duration`.
    #[must_use]
    pub const fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    /// Refresh cadence as a `Duration`.
    #[must_use]
    pub const fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    /// Per-peer call deadline as a `Duration`.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_lock_expiry_secs(),
            refresh_secs: default_lock_refresh_secs(),
            call_timeout_ms: default_lock_call_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_config_quorums() {
        let cfg = SetConfig::new(2, 2).unwrap();
        assert_eq!(cfg.drive_count(), 4);
        assert_eq!(cfg.read_quorum(), 2);
        assert_eq!(cfg.write_quorum(), 3);

        let cfg = SetConfig::new(3, 1).unwrap();
        assert_eq!(cfg.write_quorum(), 3);
    }

    #[test]
    fn test_set_config_invalid_drive_count() {
        assert!(SetConfig::new(3, 2).is_err()); // 5 drives
        assert!(SetConfig::new(10, 8).is_err()); // 18 drives
        assert!(SetConfig::new(0, 4).is_err());
    }

    #[test]
    fn test_ask_disks_policies() {
        let mut cfg = SetConfig::new(8, 4).unwrap();
        assert_eq!(cfg.ask_disks(), 9); // M + 1

        cfg.quorum_policy = QuorumPolicy::Reduced;
        assert_eq!(cfg.ask_disks(), 6);

        cfg.quorum_policy = QuorumPolicy::Strict;
        assert_eq!(cfg.ask_disks(), 12);

        cfg.list_ask_disks = 5;
        assert_eq!(cfg.ask_disks(), 5);
    }

    #[test]
    fn test_lock_config_validation() {
        assert!(LockConfig::default().validate().is_ok());
        let bad = LockConfig {
            expiry_secs: 10,
            refresh_secs: 6,
            call_timeout_ms: 1000,
        };
        assert!(bad.validate().is_err());
    }
}
