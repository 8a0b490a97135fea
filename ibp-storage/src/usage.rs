//! Usage snapshot
//!
//! A small record kept at the reserved usage id. It is written with state
//! `Bad` right after mount and with state `Good` on clean unmount, so a mount
//! that finds anything but a `Good` snapshot of the current version knows the
//! previous run did not shut down cleanly.

use crate::device::ObjectDevice;
use ibp_core::{IbpError, Result, USAGE_ID};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Snapshot layout version
pub const RESOURCE_VERSION: i32 = 100_000;

/// Shutdown state recorded in the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageState {
    Good,
    Bad,
}

/// Persisted resource counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub version: i32,
    /// Indexed by `Reliability::index`
    pub used_space: [u64; 2],
    pub n_allocs: u64,
    pub n_alias: u64,
    pub state: UsageState,
}

impl UsageSnapshot {
    pub fn new(used_space: [u64; 2], n_allocs: u64, n_alias: u64, state: UsageState) -> Self {
        Self {
            version: RESOURCE_VERSION,
            used_space,
            n_allocs,
            n_alias,
            state,
        }
    }

    /// True when the counters can be trusted without a rebuild
    pub fn is_clean(&self) -> bool {
        self.version == RESOURCE_VERSION && self.state == UsageState::Good
    }

    /// Persist to the reserved object
    pub fn write(&self, dev: &dyn ObjectDevice) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        dev.create_with_id(USAGE_ID)?;
        dev.truncate(USAGE_ID, 0)?;
        dev.write(USAGE_ID, 0, &bytes)?;
        debug!(state = ?self.state, n_allocs = self.n_allocs, "Wrote usage snapshot");
        Ok(())
    }

    /// Load from the reserved object, `None` when absent or unreadable
    pub fn read(dev: &dyn ObjectDevice) -> Option<Self> {
        if !dev.exists(USAGE_ID) {
            return None;
        }
        let bytes = match dev.read(USAGE_ID, 0, 4096) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to read usage snapshot");
                return None;
            }
        };
        match bincode::deserialize::<UsageSnapshot>(&bytes) {
            Ok(snap) => Some(snap),
            Err(e) => {
                warn!(error = %e, "Usage snapshot is corrupt");
                None
            }
        }
    }

    /// Load and require a clean snapshot
    pub fn read_clean(dev: &dyn ObjectDevice) -> Result<Self> {
        match Self::read(dev) {
            Some(snap) if snap.is_clean() => Ok(snap),
            Some(snap) => Err(IbpError::CorruptRecord {
                id: USAGE_ID,
                reason: format!(
                    "usage snapshot state {:?} version {}",
                    snap.state, snap.version
                ),
            }),
            None => Err(IbpError::NotFound("usage snapshot".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDevice;

    #[test]
    fn test_snapshot_states() {
        let dev = MemoryDevice::new();
        assert!(UsageSnapshot::read(&dev).is_none());

        let good = UsageSnapshot::new([10, 20], 3, 1, UsageState::Good);
        good.write(&dev).unwrap();
        assert_eq!(UsageSnapshot::read_clean(&dev).unwrap(), good);

        UsageSnapshot::new([10, 20], 3, 1, UsageState::Bad)
            .write(&dev)
            .unwrap();
        assert!(UsageSnapshot::read_clean(&dev).is_err());
    }

    #[test]
    fn test_version_mismatch_is_dirty() {
        let dev = MemoryDevice::new();
        let mut snap = UsageSnapshot::new([0, 0], 0, 0, UsageState::Good);
        snap.version = 99;
        snap.write(&dev).unwrap();
        assert!(UsageSnapshot::read_clean(&dev).is_err());
    }

    #[test]
    fn test_snapshot_not_listed_as_allocation() {
        let dev = MemoryDevice::new();
        UsageSnapshot::new([0, 0], 0, 0, UsageState::Good)
            .write(&dev)
            .unwrap();
        assert!(dev.ids().unwrap().is_empty());
    }
}
