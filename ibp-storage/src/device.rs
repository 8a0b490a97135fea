//! Object device trait
//!
//! Defines the block store every resource sits on: blobs addressed by
//! numeric id, plus two trash bins holding removed blobs until they are purged
//! or undeleted.

use bytes::Bytes;
use ibp_core::{AllocationId, Result};
use std::fmt;

/// Device space figures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Bytes available to new objects
    pub free_bytes: u64,

    /// Size of the underlying device
    pub total_bytes: u64,
}

/// Trash bin selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrashKind {
    /// Explicitly removed by a client
    Delete,
    /// Removed after expiring
    Expire,
}

impl TrashKind {
    pub const ALL: [TrashKind; 2] = [TrashKind::Delete, TrashKind::Expire];

    /// Slot in per-bin counter arrays
    pub fn index(&self) -> usize {
        match self {
            TrashKind::Delete => 0,
            TrashKind::Expire => 1,
        }
    }

    /// Directory name used by on-disk devices
    pub fn dir_name(&self) -> &'static str {
        match self {
            TrashKind::Delete => "deleted_trash",
            TrashKind::Expire => "expired_trash",
        }
    }
}

impl fmt::Display for TrashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrashKind::Delete => write!(f, "delete"),
            TrashKind::Expire => write!(f, "expire"),
        }
    }
}

/// How an allocation leaves the live set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// Bytes are released immediately
    Physical,
    /// Bytes move into a trash bin
    Trash(TrashKind),
}

/// One object sitting in a trash bin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashEntry {
    /// Name of the entry inside its bin, `<move_time>_<id>`
    pub trash_id: String,
    pub id: AllocationId,
    pub move_time: u64,
    pub size: u64,
}

impl TrashEntry {
    pub fn trash_name(move_time: u64, id: AllocationId) -> String {
        format!("{}_{}", move_time, id)
    }

    /// Parse `<move_time>_<id>`
    pub fn parse_name(name: &str) -> Option<(u64, AllocationId)> {
        let (time, id) = name.split_once('_')?;
        Some((time.parse().ok()?, AllocationId::new(id.parse().ok()?)))
    }
}

/// Synchronous object device
///
/// All implementations must be Send + Sync; one device is shared by the
/// resource's callers and its janitor thread.
pub trait ObjectDevice: Send + Sync {
    /// Create an empty object under a fresh id
    fn create_id(&self) -> Result<AllocationId>;

    /// Create an empty object under a caller-chosen id if absent
    fn create_with_id(&self, id: AllocationId) -> Result<()>;

    /// Preallocate the object to at least `len` bytes
    fn reserve(&self, id: AllocationId, len: u64) -> Result<()>;

    /// Read up to `len` bytes; short reads return fewer
    fn read(&self, id: AllocationId, offset: u64, len: u64) -> Result<Bytes>;

    /// Write at `offset`, extending the object as needed
    fn write(&self, id: AllocationId, offset: u64, data: &[u8]) -> Result<()>;

    /// Physical object size
    fn size(&self, id: AllocationId) -> Result<u64>;

    fn truncate(&self, id: AllocationId, len: u64) -> Result<()>;

    fn exists(&self, id: AllocationId) -> bool;

    /// Release an object's bytes immediately
    fn remove(&self, id: AllocationId) -> Result<()>;

    /// Move an object into a trash bin
    fn trash(&self, id: AllocationId, kind: TrashKind, move_time: u64) -> Result<()>;

    /// Entries of one bin, oldest first
    fn trash_entries(&self, kind: TrashKind) -> Result<Vec<TrashEntry>>;

    /// Purge one trash entry, returning the bytes released
    fn trash_remove(&self, kind: TrashKind, trash_id: &str) -> Result<u64>;

    /// Move a trash entry back into the live set under its old id
    fn trash_undelete(&self, kind: TrashKind, trash_id: &str) -> Result<AllocationId>;

    /// Ids of every live object, excluding reserved ids
    fn ids(&self) -> Result<Vec<AllocationId>>;

    fn statfs(&self) -> Result<DeviceStats>;
}
