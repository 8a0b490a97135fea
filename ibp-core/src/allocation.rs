//! Allocation records and their identifiers
//!
//! An allocation is a capability-addressed byte array living on a resource.
//! Records are plain values: they are copied in and out of the allocation
//! store and never shared mutably.

use crate::error::{IbpError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the on-device header region preceding the payload
pub const ALLOC_HEADER: u64 = 4096;

/// Device id reserved for the usage snapshot
pub const USAGE_ID: AllocationId = AllocationId(1);

/// 64-bit allocation identifier assigned by the object device
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationId(u64);

impl AllocationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Big-endian key bytes, so ids sort numerically in the store
    pub fn to_key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_key(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| IbpError::Index(format!("bad id key length {}", bytes.len())))?;
        Ok(Self(u64::from_be_bytes(arr)))
    }

    /// True for ids that may never name an allocation
    pub fn is_reserved(&self) -> bool {
        self.0 == 0 || *self == USAGE_ID
    }
}

impl fmt::Debug for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocationId({})", self.0)
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Quota class of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reliability {
    /// Reclaimable once the resource is over its soft quota
    Soft,
    /// Protected from reclamation ahead of its expiration
    Hard,
}

impl Reliability {
    pub const ALL: [Reliability; 2] = [Reliability::Soft, Reliability::Hard];

    /// Slot in per-class counter arrays
    pub fn index(&self) -> usize {
        match self {
            Reliability::Soft => 0,
            Reliability::Hard => 1,
        }
    }
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reliability::Soft => write!(f, "soft"),
            Reliability::Hard => write!(f, "hard"),
        }
    }
}

/// Access semantics of the byte array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationType {
    #[default]
    ByteArray,
    Buffer,
    Fifo,
    Circular,
}

/// The three capability kinds handed out per allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapKind {
    Read,
    Write,
    Manage,
}

impl CapKind {
    pub const ALL: [CapKind; 3] = [CapKind::Read, CapKind::Write, CapKind::Manage];
}

impl fmt::Display for CapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapKind::Read => write!(f, "read"),
            CapKind::Write => write!(f, "write"),
            CapKind::Manage => write!(f, "manage"),
        }
    }
}

/// Unguessable access token, stored and compared as text
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Capability(String);

impl Capability {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print a full token into logs
        let shown: String = self.0.chars().take(6).collect();
        write!(f, "Capability({}..)", shown)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read, write and manage tokens of one allocation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub read: Capability,
    pub write: Capability,
    pub manage: Capability,
}

impl Capabilities {
    pub fn get(&self, kind: CapKind) -> &Capability {
        match kind {
            CapKind::Read => &self.read,
            CapKind::Write => &self.write,
            CapKind::Manage => &self.manage,
        }
    }
}

/// Sort key of the time-ordered indices
///
/// Ordered by expiration first, then id. Field order matters for the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeKey {
    pub expiration: u64,
    pub id: AllocationId,
}

impl TimeKey {
    pub const LEN: usize = 16;

    pub fn new(expiration: u64, id: AllocationId) -> Self {
        Self { expiration, id }
    }

    /// Smallest key at or after `expiration`
    pub fn at(expiration: u64) -> Self {
        Self::new(expiration, AllocationId::new(0))
    }

    /// Big-endian encoding; byte order equals tuple order
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..8].copy_from_slice(&self.expiration.to_be_bytes());
        out[8..].copy_from_slice(&self.id.to_key());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(IbpError::Index(format!(
                "bad time key length {}",
                bytes.len()
            )));
        }
        let mut exp = [0u8; 8];
        exp.copy_from_slice(&bytes[..8]);
        Ok(Self {
            expiration: u64::from_be_bytes(exp),
            id: AllocationId::from_key(&bytes[8..])?,
        })
    }
}

/// Checksum parameters recorded with an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumOptions {
    pub kind: String,
    pub block_size: u32,
}

/// Result of releasing a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// References remain
    Live,
    /// The last reference of this kind was released
    Released,
}

/// The stored allocation entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: AllocationId,
    pub caps: Capabilities,
    pub reliability: Reliability,
    /// Reserved payload bytes
    pub max_size: u64,
    /// Payload bytes currently written
    pub size: u64,
    /// Write position for fifo/circular types
    pub w_pos: u64,
    pub alloc_type: AllocationType,
    /// Absolute expiration, seconds since the epoch
    pub expiration: u64,
    pub creation_ts: u64,
    read_refcount: u32,
    write_refcount: u32,
    pub split_parent_id: Option<AllocationId>,
    pub is_alias: bool,
    pub checksum: Option<ChecksumOptions>,
}

impl AllocationRecord {
    /// A fresh record with one read reference and nothing written
    pub fn new(
        id: AllocationId,
        reliability: Reliability,
        max_size: u64,
        expiration: u64,
    ) -> Self {
        Self {
            id,
            caps: Capabilities::default(),
            reliability,
            max_size,
            size: 0,
            w_pos: 0,
            alloc_type: AllocationType::ByteArray,
            expiration,
            creation_ts: 0,
            read_refcount: 1,
            write_refcount: 0,
            split_parent_id: None,
            is_alias: false,
            checksum: None,
        }
    }

    /// Key in the expire index
    pub fn expire_key(&self) -> TimeKey {
        TimeKey::new(self.expiration, self.id)
    }

    /// Key in the soft index, absent for hard allocations
    pub fn soft_key(&self) -> Option<TimeKey> {
        match self.reliability {
            Reliability::Soft => Some(self.expire_key()),
            Reliability::Hard => None,
        }
    }

    /// Bytes charged against quota; aliases carry none
    pub fn charged_size(&self) -> u64 {
        if self.is_alias {
            0
        } else {
            self.max_size
        }
    }

    /// Shrink or grow the reservation, clamping the written size
    pub fn set_max_size(&mut self, max_size: u64) {
        self.max_size = max_size;
        if self.size > max_size {
            self.size = max_size;
        }
        if self.w_pos > max_size {
            self.w_pos = max_size;
        }
    }

    pub fn read_refcount(&self) -> u32 {
        self.read_refcount
    }

    pub fn write_refcount(&self) -> u32 {
        self.write_refcount
    }

    pub fn acquire_read(&mut self) {
        self.read_refcount = self.read_refcount.saturating_add(1);
    }

    pub fn acquire_write(&mut self) {
        self.write_refcount = self.write_refcount.saturating_add(1);
    }

    pub fn release_read(&mut self) -> Result<RefState> {
        self.read_refcount = Self::release(self.id, self.read_refcount, CapKind::Read)?;
        Ok(Self::state_of(self.read_refcount))
    }

    pub fn release_write(&mut self) -> Result<RefState> {
        self.write_refcount = Self::release(self.id, self.write_refcount, CapKind::Write)?;
        Ok(Self::state_of(self.write_refcount))
    }

    /// Reset references after recovery from trash
    pub fn reset_refcounts(&mut self) {
        self.read_refcount = 1;
        self.write_refcount = 0;
    }

    fn release(id: AllocationId, count: u32, kind: CapKind) -> Result<u32> {
        count.checked_sub(1).ok_or_else(|| IbpError::InvalidRefcount {
            id,
            reason: format!("{} count already zero", kind),
        })
    }

    fn state_of(count: u32) -> RefState {
        if count == 0 {
            RefState::Released
        } else {
            RefState::Live
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_time_key_byte_order_matches_tuple_order() {
        let a = TimeKey::new(10, AllocationId::new(500));
        let b = TimeKey::new(11, AllocationId::new(2));
        let c = TimeKey::new(11, AllocationId::new(3));
        assert!(a < b && b < c);
        assert!(a.to_bytes() < b.to_bytes());
        assert!(b.to_bytes() < c.to_bytes());
        assert_eq!(TimeKey::from_bytes(&c.to_bytes()).unwrap(), c);
    }

    #[test]
    fn test_soft_key_only_for_soft() {
        let mut rec = AllocationRecord::new(AllocationId::new(9), Reliability::Hard, 10, 100);
        assert!(rec.soft_key().is_none());
        rec.reliability = Reliability::Soft;
        assert_eq!(rec.soft_key(), Some(TimeKey::new(100, AllocationId::new(9))));
    }

    #[test]
    fn test_refcount_release_to_zero() {
        let mut rec = AllocationRecord::new(AllocationId::new(3), Reliability::Soft, 10, 100);
        rec.acquire_read();
        assert_eq!(rec.release_read().unwrap(), RefState::Live);
        assert_eq!(rec.release_read().unwrap(), RefState::Released);
        assert!(matches!(
            rec.release_read(),
            Err(IbpError::InvalidRefcount { .. })
        ));
        assert!(rec.release_write().is_err());
    }

    #[test]
    fn test_alias_charges_nothing() {
        let mut rec = AllocationRecord::new(AllocationId::new(4), Reliability::Hard, 4096, 1);
        assert_eq!(rec.charged_size(), 4096);
        rec.is_alias = true;
        assert_eq!(rec.charged_size(), 0);
    }

    #[test]
    fn test_set_max_size_clamps() {
        let mut rec = AllocationRecord::new(AllocationId::new(5), Reliability::Hard, 100, 1);
        rec.size = 80;
        rec.w_pos = 90;
        rec.set_max_size(50);
        assert_eq!((rec.max_size, rec.size, rec.w_pos), (50, 50, 50));
    }

    #[test]
    fn test_reserved_ids() {
        assert!(AllocationId::new(0).is_reserved());
        assert!(USAGE_ID.is_reserved());
        assert!(!AllocationId::new(2).is_reserved());
    }

    proptest! {
        #[test]
        fn prop_time_key_bytes_sort_like_keys(a in any::<(u64, u64)>(), b in any::<(u64, u64)>()) {
            let ka = TimeKey::new(a.0, AllocationId::new(a.1));
            let kb = TimeKey::new(b.0, AllocationId::new(b.1));
            prop_assert_eq!(ka.cmp(&kb), ka.to_bytes().cmp(&kb.to_bytes()));
        }
    }
}
