//! In-memory object device
//!
//! Used for testing and benchmarks. Not persistent.

use crate::device::{DeviceStats, ObjectDevice, TrashEntry, TrashKind};
use bytes::Bytes;
use ibp_core::{AllocationId, IbpError, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Device operation that can be made to fail for one object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `write`, header writes included
    Write,
    /// `size`
    Size,
    /// `remove`, `trash` and `trash_remove`
    Remove,
}

/// In-memory object device
pub struct MemoryDevice {
    /// Live objects
    objects: RwLock<HashMap<AllocationId, Vec<u8>>>,

    /// Trash bins, keyed by trash id
    trash: RwLock<[HashMap<String, Vec<u8>>; 2]>,

    /// Device size reported by statfs
    capacity: u64,

    /// Bytes held by live and trashed objects
    bytes_used: AtomicU64,

    next_id: AtomicU64,

    /// Fail every `create_id` while set
    fail_creates: AtomicBool,

    /// Per-object injected failures
    faults: RwLock<HashSet<(AllocationId, Fault)>>,
}

impl MemoryDevice {
    /// Create a device with an effectively unlimited capacity
    pub fn new() -> Self {
        Self::with_capacity(u64::MAX / 2)
    }

    /// Create a device reporting `capacity` bytes
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            trash: RwLock::new([HashMap::new(), HashMap::new()]),
            capacity,
            bytes_used: AtomicU64::new(0),
            next_id: AtomicU64::new(2),
            fail_creates: AtomicBool::new(false),
            faults: RwLock::new(HashSet::new()),
        }
    }

    /// Make object creation fail, to exercise error paths
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make one operation fail for object `id` until faults are cleared
    pub fn inject(&self, id: AllocationId, fault: Fault) {
        self.faults.write().insert((id, fault));
    }

    pub fn clear_faults(&self) {
        self.faults.write().clear();
    }

    fn check(&self, id: AllocationId, fault: Fault) -> Result<()> {
        if self.faults.read().contains(&(id, fault)) {
            return Err(IbpError::Device(format!("injected {:?} failure on {}", fault, id)));
        }
        Ok(())
    }

    /// Overwrite raw bytes, bypassing size accounting of the header region
    pub fn corrupt(&self, id: AllocationId, offset: usize, data: &[u8]) {
        let mut objects = self.objects.write();
        if let Some(obj) = objects.get_mut(&id) {
            if obj.len() < offset + data.len() {
                let grow = (offset + data.len() - obj.len()) as u64;
                obj.resize(offset + data.len(), 0);
                self.bytes_used.fetch_add(grow, Ordering::SeqCst);
            }
            obj[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    fn resize(&self, obj: &mut Vec<u8>, len: usize) {
        let old = obj.len();
        obj.resize(len, 0);
        if len > old {
            self.bytes_used.fetch_add((len - old) as u64, Ordering::SeqCst);
        } else {
            self.bytes_used.fetch_sub((old - len) as u64, Ordering::SeqCst);
        }
    }

    fn missing(id: AllocationId) -> IbpError {
        IbpError::Device(format!("no object {}", id))
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDevice for MemoryDevice {
    fn create_id(&self) -> Result<AllocationId> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(IbpError::Device("object creation disabled".to_string()));
        }
        let id = AllocationId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.objects.write().insert(id, Vec::new());
        Ok(id)
    }

    fn create_with_id(&self, id: AllocationId) -> Result<()> {
        self.objects.write().entry(id).or_default();
        Ok(())
    }

    fn reserve(&self, id: AllocationId, len: u64) -> Result<()> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&id).ok_or_else(|| Self::missing(id))?;
        if (obj.len() as u64) < len {
            self.resize(obj, len as usize);
        }
        Ok(())
    }

    fn read(&self, id: AllocationId, offset: u64, len: u64) -> Result<Bytes> {
        let objects = self.objects.read();
        let obj = objects.get(&id).ok_or_else(|| Self::missing(id))?;
        let start = (offset as usize).min(obj.len());
        let end = (offset.saturating_add(len) as usize).min(obj.len());
        Ok(Bytes::copy_from_slice(&obj[start..end]))
    }

    fn write(&self, id: AllocationId, offset: u64, data: &[u8]) -> Result<()> {
        self.check(id, Fault::Write)?;
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&id).ok_or_else(|| Self::missing(id))?;
        let end = offset as usize + data.len();
        if obj.len() < end {
            self.resize(obj, end);
        }
        obj[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn size(&self, id: AllocationId) -> Result<u64> {
        self.check(id, Fault::Size)?;
        let objects = self.objects.read();
        objects
            .get(&id)
            .map(|obj| obj.len() as u64)
            .ok_or_else(|| Self::missing(id))
    }

    fn truncate(&self, id: AllocationId, len: u64) -> Result<()> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&id).ok_or_else(|| Self::missing(id))?;
        self.resize(obj, len as usize);
        Ok(())
    }

    fn exists(&self, id: AllocationId) -> bool {
        self.objects.read().contains_key(&id)
    }

    fn remove(&self, id: AllocationId) -> Result<()> {
        self.check(id, Fault::Remove)?;
        let removed = self.objects.write().remove(&id);
        match removed {
            Some(obj) => {
                self.bytes_used
                    .fetch_sub(obj.len() as u64, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Self::missing(id)),
        }
    }

    fn trash(&self, id: AllocationId, kind: TrashKind, move_time: u64) -> Result<()> {
        self.check(id, Fault::Remove)?;
        let obj = self
            .objects
            .write()
            .remove(&id)
            .ok_or_else(|| Self::missing(id))?;
        self.trash.write()[kind.index()].insert(TrashEntry::trash_name(move_time, id), obj);
        Ok(())
    }

    fn trash_entries(&self, kind: TrashKind) -> Result<Vec<TrashEntry>> {
        let trash = self.trash.read();
        let mut entries: Vec<TrashEntry> = trash[kind.index()]
            .iter()
            .filter_map(|(name, obj)| {
                let (move_time, id) = TrashEntry::parse_name(name)?;
                Some(TrashEntry {
                    trash_id: name.clone(),
                    id,
                    move_time,
                    size: obj.len() as u64,
                })
            })
            .collect();
        entries.sort_by_key(|e| (e.move_time, e.id));
        Ok(entries)
    }

    fn trash_remove(&self, kind: TrashKind, trash_id: &str) -> Result<u64> {
        if let Some((_, id)) = TrashEntry::parse_name(trash_id) {
            self.check(id, Fault::Remove)?;
        }
        let removed = self.trash.write()[kind.index()].remove(trash_id);
        match removed {
            Some(obj) => {
                let len = obj.len() as u64;
                self.bytes_used.fetch_sub(len, Ordering::SeqCst);
                Ok(len)
            }
            None => Err(IbpError::Device(format!("no trash entry {}", trash_id))),
        }
    }

    fn trash_undelete(&self, kind: TrashKind, trash_id: &str) -> Result<AllocationId> {
        let (_, id) = TrashEntry::parse_name(trash_id)
            .ok_or_else(|| IbpError::Device(format!("bad trash id {}", trash_id)))?;

        let mut objects = self.objects.write();
        if objects.contains_key(&id) {
            return Err(IbpError::Device(format!("object {} already live", id)));
        }
        let obj = self.trash.write()[kind.index()]
            .remove(trash_id)
            .ok_or_else(|| IbpError::Device(format!("no trash entry {}", trash_id)))?;
        objects.insert(id, obj);
        Ok(id)
    }

    fn ids(&self) -> Result<Vec<AllocationId>> {
        let mut ids: Vec<AllocationId> = self
            .objects
            .read()
            .keys()
            .copied()
            .filter(|id| !id.is_reserved())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn statfs(&self) -> Result<DeviceStats> {
        let used = self.bytes_used.load(Ordering::SeqCst);
        Ok(DeviceStats {
            free_bytes: self.capacity.saturating_sub(used),
            total_bytes: self.capacity,
        })
    }
}
