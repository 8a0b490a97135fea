//! Allocation lifecycle operations
//!
//! Every operation takes the resource mutex for its accounting critical
//! section. Quota admission happens before any index or device mutation, so a
//! rejected request leaves no trace. Preallocation of payload bytes happens
//! after the mutex is released, covered by the `pending` counter.

use crate::device::{RemoveMode, TrashEntry, TrashKind};
use crate::header;
use crate::history::{HistoryEvent, ManageOp};
use crate::reclaim::SpaceRequest;
use crate::resource::{Counters, CreateRequest, Resource};
use bytes::Bytes;
use ibp_core::{
    capability, AllocationId, AllocationRecord, CapKind, IbpError, RefState, Result, ALLOC_HEADER,
};
use tracing::{debug, error, warn};

impl Resource {
    /// Create a new allocation
    pub fn create(&self, req: &CreateRequest) -> Result<AllocationRecord> {
        self.touch();
        self.require_mode(self.mode.write, "create")?;
        self.check_duration(req.duration)?;

        let preallocate = !req.is_alias && self.wants_preallocate(req.preallocate);
        let record = {
            let mut c = self.lock_counters();
            if !req.is_alias {
                self.make_space_locked(&mut c, SpaceRequest::new(req.size, req.reliability))?;
            }
            if preallocate {
                c.pending += req.size;
            }
            match self.new_allocation_locked(&mut c, req, None) {
                Ok(record) => record,
                Err(e) => {
                    if preallocate {
                        c.pending = c.pending.saturating_sub(req.size);
                    }
                    return Err(e);
                }
            }
        };

        if preallocate {
            self.finish_preallocation(record.id, req.size, req.size);
        }

        self.record_manage(&record, ManageOp::Create);
        debug!(rid = %self.rid, id = %record.id, size = req.size, reliability = %req.reliability, "Created allocation");
        Ok(record)
    }

    /// Carve a child allocation out of a master's reservation
    pub fn split(&self, master: AllocationId, req: &CreateRequest) -> Result<AllocationRecord> {
        self.touch();
        self.require_mode(self.mode.write, "split")?;
        self.check_duration(req.duration)?;

        let preallocate = !req.is_alias && self.wants_preallocate(req.preallocate);
        let child = {
            let mut c = self.lock_counters();
            let mut ma = self.store.get_by_id(master)?;
            if req.size > ma.max_size {
                return Err(IbpError::InsufficientMasterSpace {
                    requested: req.size,
                    available: ma.max_size,
                });
            }

            let rel = ma.reliability.index();
            c.used_space[rel] = c.used_space[rel].saturating_sub(req.size);
            ma.max_size -= req.size;

            let created = if req.is_alias {
                Ok(())
            } else {
                self.make_space_locked(
                    &mut c,
                    SpaceRequest::new(req.size, req.reliability).protecting(ma.id),
                )
            }
            .and_then(|()| self.new_allocation_locked(&mut c, req, Some(ma.id)));

            let child = match created {
                Ok(child) => child,
                Err(e) => {
                    c.used_space[rel] += req.size;
                    return Err(e);
                }
            };

            ma.set_max_size(ma.max_size);
            if let Err(e) = self.persist_locked(&ma) {
                if let Err(undo) = self.remove_locked(&mut c, &child, RemoveMode::Physical) {
                    error!(rid = %self.rid, id = %child.id, error = %undo, "Failed to undo split child");
                }
                c.used_space[rel] += req.size;
                return Err(e);
            }
            self.trim_payload(ma.id, ma.max_size);

            if preallocate {
                c.pending += req.size;
            }
            self.record_manage(&ma, ManageOp::Split);
            child
        };

        if preallocate {
            self.finish_preallocation(child.id, req.size, req.size);
        }

        debug!(rid = %self.rid, master = %master, child = %child.id, size = req.size, "Split allocation");
        Ok(child)
    }

    /// Fold a child's reservation back into its master; the child's bytes are discarded
    pub fn merge(&self, master: AllocationId, child: AllocationId) -> Result<AllocationRecord> {
        self.touch();
        self.require_mode(self.mode.manage, "merge")?;

        if master == child {
            return Err(IbpError::InvalidArgument(format!(
                "cannot merge allocation {} into itself",
                master
            )));
        }

        let mut c = self.lock_counters();
        let mut ma = self.store.get_by_id(master)?;
        let a = self.store.get_by_id(child)?;

        self.remove_locked(&mut c, &a, RemoveMode::Trash(TrashKind::Delete))?;

        let charged = a.charged_size();
        c.used_space[ma.reliability.index()] += charged;
        ma.max_size += charged;
        self.persist_locked(&ma)?;
        drop(c);

        self.record_manage(&ma, ManageOp::Merge);
        debug!(rid = %self.rid, master = %master, child = %child, "Merged allocation");
        Ok(ma)
    }

    /// Replace all three capabilities, keeping the id
    pub fn rename(&self, id: AllocationId) -> Result<AllocationRecord> {
        self.touch();
        self.require_mode(self.mode.manage, "rename")?;

        let c = self.lock_counters();
        let mut record = self.store.get_by_id(id)?;
        {
            let _guard = self.store.lock();
            record.caps = capability::generate();
            self.store.put(&record)?;
        }
        if !record.is_alias {
            header::write_header(self.device.as_ref(), &record)?;
        }
        drop(c);

        self.record_manage(&record, ManageOp::Rename);
        Ok(record)
    }

    /// Store an updated record, adjusting quota for size or class changes
    pub fn modify(&self, id: AllocationId, new: &AllocationRecord) -> Result<AllocationRecord> {
        self.touch();
        self.require_mode(self.mode.manage, "modify")?;

        let now = self.now();
        if new.expiration > now.saturating_add(self.config.max_duration) {
            return Err(IbpError::DurationTooLong {
                requested: new.expiration.saturating_sub(now),
                max: self.config.max_duration,
            });
        }

        let mut c = self.lock_counters();
        let old = self.store.get_by_id(id)?;
        let mut a = new.clone();
        a.id = old.id;
        a.caps = old.caps.clone();
        a.is_alias = old.is_alias;

        let mut grown = 0;
        let recharged =
            !a.is_alias && (old.reliability != a.reliability || old.max_size != a.max_size);
        if recharged {
            let old_rel = old.reliability.index();
            c.used_space[old_rel] = c.used_space[old_rel].saturating_sub(old.max_size);

            grown = a.max_size.saturating_sub(old.max_size);
            let admitted = self.make_space_locked(
                &mut c,
                SpaceRequest::new(a.max_size, a.reliability)
                    .with_physical(grown)
                    .protecting(a.id),
            );
            if let Err(e) = admitted {
                c.used_space[old_rel] += old.max_size;
                return Err(e);
            }

            a.set_max_size(a.max_size);
            c.used_space[a.reliability.index()] += a.max_size;
        }

        if let Err(e) = self.persist_locked(&a) {
            if recharged {
                let rel = a.reliability.index();
                c.used_space[rel] = c.used_space[rel].saturating_sub(a.max_size);
                c.used_space[old.reliability.index()] += old.max_size;
            }
            return Err(e);
        }
        if recharged && a.max_size < old.max_size {
            self.trim_payload(a.id, a.max_size);
        }
        let preallocate = grown > 0 && self.wants_preallocate(None);
        if preallocate {
            c.pending += grown;
        }
        drop(c);

        if preallocate {
            self.finish_preallocation(a.id, a.max_size, grown);
        }

        self.record_manage(&a, ManageOp::Modify);
        debug!(rid = %self.rid, id = %a.id, max_size = a.max_size, expiration = a.expiration, "Modified allocation");
        Ok(a)
    }

    /// Remove an allocation, trashing or releasing its bytes
    pub fn remove(&self, mode: RemoveMode, id: AllocationId) -> Result<()> {
        self.touch();
        let mut c = self.lock_counters();
        let record = self.store.get_by_id(id)?;
        self.remove_locked(&mut c, &record, mode)
    }

    /// Recover an allocation from a trash bin with a fresh expiration
    pub fn undelete(
        &self,
        kind: TrashKind,
        trash_id: &str,
        expiration: u64,
    ) -> Result<AllocationRecord> {
        self.touch();
        self.require_mode(self.mode.manage, "undelete")?;

        let id = self.device.trash_undelete(kind, trash_id)?;
        let size = self.device.size(id).unwrap_or(0);
        self.lock_counters().trash_removed(kind, size);

        let retrash = |reason: IbpError| -> IbpError {
            warn!(rid = %self.rid, id = %id, error = %reason, "Undelete failed, returning to trash");
            let now = self.now();
            match self.device.trash(id, kind, now) {
                Ok(()) => self.lock_counters().trash_added(kind, size),
                Err(e) => warn!(rid = %self.rid, id = %id, error = %e, "Failed to re-trash allocation"),
            }
            reason
        };

        let mut a = match header::read_header(self.device.as_ref(), id) {
            Ok(Some(a)) if a.id == id => a,
            Ok(Some(a)) => {
                return Err(retrash(IbpError::CorruptRecord {
                    id,
                    reason: format!("header names id {}", a.id),
                }))
            }
            Ok(None) => {
                return Err(retrash(IbpError::CorruptRecord {
                    id,
                    reason: "no header".to_string(),
                }))
            }
            Err(e) => return Err(retrash(e)),
        };

        let mut c = self.lock_counters();
        if !a.is_alias {
            let unwritten = a.max_size.saturating_sub(a.size);
            let req = SpaceRequest::new(a.max_size, a.reliability)
                .with_physical(unwritten)
                .protecting(id);
            if let Err(e) = self.make_space_locked(&mut c, req) {
                drop(c);
                return Err(retrash(e));
            }
        }

        a.expiration = expiration;
        a.reset_refcounts();
        let stored = header::write_header(self.device.as_ref(), &a).and_then(|()| self.store.put(&a));
        if let Err(e) = stored {
            drop(c);
            return Err(retrash(e));
        }
        c.charge(&a);
        drop(c);

        self.record_manage(&a, ManageOp::Undelete);
        debug!(rid = %self.rid, id = %id, bin = %kind, "Undeleted allocation");
        Ok(a)
    }

    // ===== Reference Counts =====

    pub fn increment_refcount(&self, id: AllocationId, kind: CapKind) -> Result<AllocationRecord> {
        self.touch();
        let _c = self.lock_counters();
        let mut a = self.store.get_by_id(id)?;
        match kind {
            CapKind::Write => a.acquire_write(),
            _ => a.acquire_read(),
        }
        self.persist_locked(&a)?;
        Ok(a)
    }

    /// Drop a reference; releasing the last read reference deletes the allocation
    pub fn decrement_refcount(&self, id: AllocationId, kind: CapKind) -> Result<RefState> {
        self.touch();
        let mut c = self.lock_counters();
        let mut a = self.store.get_by_id(id)?;
        let state = match kind {
            CapKind::Write => a.release_write()?,
            _ => a.release_read()?,
        };

        if kind != CapKind::Write && state == RefState::Released {
            debug!(rid = %self.rid, id = %id, "Last read reference released");
            self.remove_locked(&mut c, &a, RemoveMode::Trash(TrashKind::Delete))?;
        } else {
            self.persist_locked(&a)?;
        }
        Ok(state)
    }

    // ===== Payload I/O =====

    /// Read payload bytes; never holds the resource mutex during I/O
    pub fn read_payload(
        &self,
        id: AllocationId,
        offset: u64,
        len: u64,
        client: Option<&str>,
    ) -> Result<Bytes> {
        self.touch();
        self.require_mode(self.mode.read, "read")?;
        let a = self.store.get_by_id(id)?;
        let start = offset
            .checked_add(ALLOC_HEADER)
            .ok_or_else(|| IbpError::InvalidArgument(format!("read offset {} out of range", offset)))?;
        let len = len.min(a.size.saturating_sub(offset));
        let data = self.device.read(id, start, len)?;
        self.history.record(
            id,
            a.is_alias,
            HistoryEvent::read(self.now(), client, offset, data.len() as u64),
        );
        Ok(data)
    }

    /// Write payload bytes within the reservation
    pub fn write_payload(
        &self,
        id: AllocationId,
        offset: u64,
        data: &[u8],
        client: Option<&str>,
    ) -> Result<AllocationRecord> {
        self.touch();
        self.require_mode(self.mode.write, "write")?;
        let a = self.store.get_by_id(id)?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| IbpError::InvalidArgument(format!("write offset {} out of range", offset)))?;
        if end > a.max_size {
            return Err(IbpError::OutOfSpace {
                needed: end - a.max_size,
            });
        }

        self.device.write(id, ALLOC_HEADER + offset, data)?;
        self.history.record(
            id,
            a.is_alias,
            HistoryEvent::write(self.now(), client, offset, data.len() as u64),
        );

        if end <= a.size {
            return Ok(a);
        }
        let _c = self.lock_counters();
        let mut a = self.store.get_by_id(id)?;
        if end > a.size {
            a.size = end;
            a.w_pos = end;
            self.persist_locked(&a)?;
        }
        Ok(a)
    }

    // ===== Internals =====

    /// Id, capabilities, index entries and header of a new allocation
    pub(crate) fn new_allocation_locked(
        &self,
        c: &mut Counters,
        req: &CreateRequest,
        split_parent: Option<AllocationId>,
    ) -> Result<AllocationRecord> {
        let now = self.now();
        let id = self.device.create_id()?;

        let mut a = AllocationRecord::new(
            id,
            req.reliability,
            req.size,
            now.saturating_add(req.duration),
        );
        a.alloc_type = req.alloc_type;
        a.is_alias = req.is_alias;
        a.creation_ts = now;
        a.split_parent_id = split_parent;
        a.checksum = req.checksum.clone().or_else(|| self.default_checksum());

        let stored = {
            let _guard = self.store.lock();
            a.caps = capability::generate();
            self.store.put(&a)
        };
        if let Err(e) = stored {
            self.discard_object(id);
            return Err(e);
        }

        if !a.is_alias || self.history.alias_enabled() {
            if let Err(e) = header::write_header(self.device.as_ref(), &a) {
                if let Err(undo) = self.store.remove(id) {
                    warn!(rid = %self.rid, id = %id, error = %undo, "Failed to undo index insert");
                }
                self.discard_object(id);
                return Err(e);
            }
            self.history.blank(id, a.is_alias);
        }

        c.charge(&a);
        Ok(a)
    }

    /// Remove a record the caller already holds, under the resource mutex
    ///
    /// When the device refuses to give up the bytes the index entries are
    /// restored and nothing is discharged.
    pub(crate) fn remove_locked(
        &self,
        c: &mut Counters,
        a: &AllocationRecord,
        mode: RemoveMode,
    ) -> Result<()> {
        self.store.remove(a.id)?;

        if (a.is_alias && !self.history.alias_enabled()) || !self.device.exists(a.id) {
            // Placeholder object of an alias without history, or bytes already gone
            self.discard_object(a.id);
            if let RemoveMode::Physical = mode {
                self.history.drop_table(a.id);
            }
        } else {
            let released = match mode {
                RemoveMode::Trash(kind) => {
                    let size = self.device.size(a.id).unwrap_or(0);
                    self.device
                        .trash(a.id, kind, self.now())
                        .map(|()| c.trash_added(kind, size))
                }
                RemoveMode::Physical => self
                    .device
                    .remove(a.id)
                    .map(|()| self.history.drop_table(a.id)),
            };
            if let Err(e) = released {
                if let Err(undo) = self.store.put(a) {
                    error!(rid = %self.rid, id = %a.id, error = %undo, "Failed to restore index entries");
                }
                return Err(e);
            }
        }

        c.discharge(a);
        debug!(rid = %self.rid, id = %a.id, mode = ?mode, "Removed allocation");
        Ok(())
    }

    /// Write header (when enabled) and index entry of a changed record
    pub(crate) fn persist_locked(&self, a: &AllocationRecord) -> Result<()> {
        if self.config.update_alloc && (!a.is_alias || self.history.alias_enabled()) {
            header::write_header(self.device.as_ref(), a)?;
        }
        self.store.put(a)
    }

    /// Purge one trash entry for good, along with the history of its allocation
    pub(crate) fn purge_trash_locked(
        &self,
        c: &mut Counters,
        kind: TrashKind,
        entry: &TrashEntry,
    ) -> Result<u64> {
        let bytes = self.device.trash_remove(kind, &entry.trash_id)?;
        c.trash_removed(kind, bytes);
        self.history.drop_table(entry.id);
        Ok(bytes)
    }

    /// Release physical bytes beyond a shrunk reservation
    fn trim_payload(&self, id: AllocationId, max_size: u64) {
        let limit = ALLOC_HEADER.saturating_add(max_size);
        if self.device.size(id).is_ok_and(|len| len > limit) {
            if let Err(e) = self.device.truncate(id, limit) {
                warn!(rid = %self.rid, id = %id, error = %e, "Failed to truncate allocation bytes");
            }
        }
    }

    fn discard_object(&self, id: AllocationId) {
        if self.device.exists(id) {
            if let Err(e) = self.device.remove(id) {
                warn!(rid = %self.rid, id = %id, error = %e, "Failed to discard object");
            }
        }
    }

    fn check_duration(&self, duration: u64) -> Result<()> {
        if duration > self.config.max_duration {
            return Err(IbpError::DurationTooLong {
                requested: duration,
                max: self.config.max_duration,
            });
        }
        Ok(())
    }

    fn wants_preallocate(&self, requested: Option<bool>) -> bool {
        requested.unwrap_or(self.config.preallocate && !self.lazy_allocate)
    }

    fn default_checksum(&self) -> Option<ibp_core::ChecksumOptions> {
        let cs = &self.config.checksum;
        cs.enabled.then(|| ibp_core::ChecksumOptions {
            kind: cs.kind.clone(),
            block_size: cs.block_size_kb * 1024,
        })
    }

    /// Reserve `payload` bytes outside the mutex, then release the promise
    fn finish_preallocation(&self, id: AllocationId, payload: u64, promised: u64) {
        if let Err(e) = self.device.reserve(id, ALLOC_HEADER.saturating_add(payload)) {
            warn!(rid = %self.rid, id = %id, error = %e, "Failed to reserve allocation bytes");
        }
        let mut c = self.lock_counters();
        c.pending = c.pending.saturating_sub(promised);
    }

    fn record_manage(&self, a: &AllocationRecord, op: ManageOp) {
        self.history.record(
            a.id,
            a.is_alias,
            HistoryEvent::manage(self.now(), None, op, a.reliability, a.expiration, a.max_size),
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::device::{ObjectDevice, RemoveMode, TrashKind};
    use crate::header;
    use crate::memory::Fault;
    use crate::resource::test_support::*;
    use crate::resource::CreateRequest;
    use crate::store::IndexKind;
    use ibp_core::{CapKind, IbpError, RefState, Reliability, ALLOC_HEADER};

    #[test]
    fn test_create_charges_quota_and_indexes() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let a = fx
            .res
            .create(&CreateRequest::new(500, Reliability::Soft, 60))
            .unwrap();

        let c = fx.res.counters();
        assert_eq!(c.used(Reliability::Soft), 500);
        assert_eq!(c.n_allocs, 1);
        assert_eq!(a.expiration, T0 + 60);
        for kind in CapKind::ALL {
            assert_eq!(fx.res.get_by_cap(kind, a.caps.get(kind)).unwrap(), a);
        }
        assert_eq!(header::read_header(fx.dev.as_ref(), a.id).unwrap(), Some(a));
    }

    #[test]
    fn test_create_rejects_long_duration() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let err = fx
            .res
            .create(&CreateRequest::new(1, Reliability::Hard, 2_000_000))
            .unwrap_err();
        assert!(matches!(err, IbpError::DurationTooLong { .. }));
    }

    #[test]
    fn test_create_device_failure_leaves_no_trace() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        fx.dev.set_fail_creates(true);
        let err = fx
            .res
            .create(&CreateRequest::new(10, Reliability::Hard, 60))
            .unwrap_err();
        assert!(matches!(err, IbpError::Device(_)));
        assert_eq!(fx.res.counters().n_allocs, 0);
        assert_eq!(fx.res.counters().used_total(), 0);
        assert!(fx.res.store().is_empty());
    }

    #[test]
    fn test_oversized_requests_are_rejected() {
        let fx = mount(limits(1000, 1000, 1000));
        let a = fx
            .res
            .create(&CreateRequest::new(1, Reliability::Hard, 60))
            .unwrap();

        let err = fx
            .res
            .create(&CreateRequest::new(u64::MAX, Reliability::Hard, 60))
            .unwrap_err();
        assert!(err.is_out_of_space());
        let c = fx.res.counters();
        assert_eq!((c.n_allocs, c.used(Reliability::Hard)), (1, 1));
        assert_eq!(fx.res.store().len(), 1);

        let mut huge = a.clone();
        huge.max_size = u64::MAX;
        assert!(fx.res.modify(a.id, &huge).unwrap_err().is_out_of_space());
        assert_eq!(fx.res.counters().used(Reliability::Hard), 1);
        assert_eq!(fx.res.get_by_id(a.id).unwrap().max_size, 1);

        assert!(matches!(
            fx.res.write_payload(a.id, u64::MAX, b"x", None),
            Err(IbpError::InvalidArgument(_))
        ));
        assert!(matches!(
            fx.res.read_payload(a.id, u64::MAX, 1, None),
            Err(IbpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_preallocate_reserves_and_clears_pending() {
        let fx = mount(limits(1 << 20, 1 << 20, 1 << 20));
        let a = fx
            .res
            .create(&CreateRequest::new(8192, Reliability::Hard, 60).with_preallocate(true))
            .unwrap();
        assert_eq!(fx.dev.size(a.id).unwrap(), ALLOC_HEADER + 8192);
        assert_eq!(fx.res.counters().pending, 0);
    }

    #[test]
    fn test_alias_is_not_charged() {
        let fx = mount(limits(100, 100, 100));
        let alias = fx.res.create(&CreateRequest::alias(60)).unwrap();
        let c = fx.res.counters();
        assert_eq!((c.n_allocs, c.n_alias, c.used_total()), (1, 1, 0));

        fx.res
            .remove(RemoveMode::Trash(TrashKind::Delete), alias.id)
            .unwrap();
        let c = fx.res.counters();
        assert_eq!((c.n_allocs, c.n_alias), (0, 0));
    }

    #[test]
    fn test_split_then_merge_restores_master() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let master = fx
            .res
            .create(&CreateRequest::new(1000, Reliability::Hard, 60))
            .unwrap();

        let child = fx
            .res
            .split(master.id, &CreateRequest::new(400, Reliability::Hard, 60))
            .unwrap();
        assert_eq!(child.split_parent_id, Some(master.id));
        assert_eq!(fx.res.get_by_id(master.id).unwrap().max_size, 600);
        assert_eq!(fx.res.counters().used(Reliability::Hard), 1000);

        let merged = fx.res.merge(master.id, child.id).unwrap();
        assert_eq!(merged.max_size, 1000);
        assert_eq!(fx.res.counters().used(Reliability::Hard), 1000);
        assert_eq!(fx.res.counters().n_allocs, 1);
        assert!(fx.res.get_by_id(child.id).is_err());
    }

    #[test]
    fn test_split_larger_than_master_fails() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let master = fx
            .res
            .create(&CreateRequest::new(100, Reliability::Hard, 60))
            .unwrap();
        let err = fx
            .res
            .split(master.id, &CreateRequest::new(101, Reliability::Hard, 60))
            .unwrap_err();
        assert!(matches!(err, IbpError::InsufficientMasterSpace { .. }));
        assert_eq!(fx.res.get_by_id(master.id).unwrap().max_size, 100);
        assert_eq!(fx.res.counters().used(Reliability::Hard), 100);
    }

    #[test]
    fn test_split_rolls_back_when_master_cannot_be_saved() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let master = fx
            .res
            .create(&CreateRequest::new(1000, Reliability::Hard, 60))
            .unwrap();
        fx.res
            .write_payload(master.id, 0, &[9u8; 900], None)
            .unwrap();
        fx.dev.inject(master.id, Fault::Write);

        let err = fx
            .res
            .split(master.id, &CreateRequest::new(400, Reliability::Hard, 60))
            .unwrap_err();
        assert!(matches!(err, IbpError::Device(_)));

        let c = fx.res.counters();
        assert_eq!((c.n_allocs, c.used(Reliability::Hard)), (1, 1000));
        assert_eq!(fx.res.store().len(), 1);
        let ma = fx.res.get_by_id(master.id).unwrap();
        assert_eq!((ma.max_size, ma.size), (1000, 900));
        assert_eq!(fx.dev.size(master.id).unwrap(), ALLOC_HEADER + 900);
    }

    #[test]
    fn test_merge_into_itself_fails() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let a = fx
            .res
            .create(&CreateRequest::new(100, Reliability::Hard, 60))
            .unwrap();
        let err = fx.res.merge(a.id, a.id).unwrap_err();
        assert!(matches!(err, IbpError::InvalidArgument(_)));
        assert_eq!(fx.res.get_by_id(a.id).unwrap().max_size, 100);
        assert_eq!(fx.res.counters().n_allocs, 1);
    }

    #[test]
    fn test_split_truncates_master_bytes() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let master = fx
            .res
            .create(&CreateRequest::new(1000, Reliability::Hard, 60))
            .unwrap();
        fx.res
            .write_payload(master.id, 0, &[9u8; 900], None)
            .unwrap();

        fx.res
            .split(master.id, &CreateRequest::new(500, Reliability::Hard, 60))
            .unwrap();
        let ma = fx.res.get_by_id(master.id).unwrap();
        assert_eq!((ma.max_size, ma.size), (500, 500));
        assert_eq!(fx.dev.size(master.id).unwrap(), ALLOC_HEADER + 500);
    }

    #[test]
    fn test_rename_replaces_caps() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let a = fx
            .res
            .create(&CreateRequest::new(10, Reliability::Soft, 60))
            .unwrap();
        let renamed = fx.res.rename(a.id).unwrap();

        assert_eq!(renamed.id, a.id);
        assert_ne!(renamed.caps, a.caps);
        assert!(fx.res.get_by_cap(CapKind::Manage, &a.caps.manage).is_err());
        assert_eq!(
            fx.res
                .get_by_cap(CapKind::Manage, &renamed.caps.manage)
                .unwrap()
                .id,
            a.id
        );
    }

    #[test]
    fn test_modify_grow_shrink_and_reclass() {
        let fx = mount(limits(1000, 1000, 600));
        let a = fx
            .res
            .create(&CreateRequest::new(500, Reliability::Hard, 60))
            .unwrap();

        let mut grown = a.clone();
        grown.max_size = 600;
        fx.res.modify(a.id, &grown).unwrap();
        assert_eq!(fx.res.counters().used(Reliability::Hard), 600);

        let mut too_big = grown.clone();
        too_big.max_size = 601;
        assert!(fx.res.modify(a.id, &too_big).unwrap_err().is_out_of_space());
        assert_eq!(fx.res.counters().used(Reliability::Hard), 600);
        assert_eq!(fx.res.get_by_id(a.id).unwrap().max_size, 600);

        let mut soft = grown.clone();
        soft.reliability = Reliability::Soft;
        soft.max_size = 200;
        fx.res.modify(a.id, &soft).unwrap();
        let c = fx.res.counters();
        assert_eq!((c.used(Reliability::Hard), c.used(Reliability::Soft)), (0, 200));
        assert_eq!(fx.res.store().index_len(IndexKind::BySoft), 1);
    }

    #[test]
    fn test_modify_shrink_truncates() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let a = fx
            .res
            .create(&CreateRequest::new(1000, Reliability::Hard, 60))
            .unwrap();
        let a = fx.res.write_payload(a.id, 0, &[1u8; 800], None).unwrap();

        let mut shrunk = a.clone();
        shrunk.max_size = 100;
        let stored = fx.res.modify(a.id, &shrunk).unwrap();
        assert_eq!((stored.size, stored.w_pos), (100, 100));
        assert_eq!(fx.dev.size(a.id).unwrap(), ALLOC_HEADER + 100);
    }

    #[test]
    fn test_modify_shrink_releases_preallocated_bytes() {
        let fx = mount(limits(1 << 20, 1 << 20, 1 << 20));
        let a = fx
            .res
            .create(&CreateRequest::new(8192, Reliability::Hard, 60).with_preallocate(true))
            .unwrap();
        assert_eq!(fx.dev.size(a.id).unwrap(), ALLOC_HEADER + 8192);

        let mut shrunk = a.clone();
        shrunk.max_size = 100;
        let stored = fx.res.modify(a.id, &shrunk).unwrap();
        assert_eq!((stored.size, stored.max_size), (0, 100));
        assert_eq!(fx.dev.size(a.id).unwrap(), ALLOC_HEADER + 100);
        assert_eq!(fx.res.counters().used(Reliability::Hard), 100);
    }

    #[test]
    fn test_modify_cannot_change_caps() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let a = fx
            .res
            .create(&CreateRequest::new(10, Reliability::Hard, 60))
            .unwrap();
        let mut forged = a.clone();
        forged.caps = ibp_core::capability::generate();
        forged.expiration = T0 + 30;
        let stored = fx.res.modify(a.id, &forged).unwrap();
        assert_eq!(stored.caps, a.caps);
        assert_eq!(stored.expiration, T0 + 30);
    }

    #[test]
    fn test_remove_to_trash_and_undelete() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let a = fx
            .res
            .create(&CreateRequest::new(100, Reliability::Soft, 60))
            .unwrap();
        fx.res.write_payload(a.id, 0, b"payload", None).unwrap();

        fx.res
            .remove(RemoveMode::Trash(TrashKind::Delete), a.id)
            .unwrap();
        let c = fx.res.counters();
        assert_eq!((c.n_allocs, c.used_total(), c.n_trash[0]), (0, 0, 1));
        for kind in CapKind::ALL {
            assert!(fx.res.get_by_cap(kind, a.caps.get(kind)).is_err());
        }

        let entry = fx.res.trash_list(TrashKind::Delete).unwrap().remove(0);
        let back = fx
            .res
            .undelete(TrashKind::Delete, &entry.trash_id, T0 + 500)
            .unwrap();
        assert_eq!(back.expiration, T0 + 500);
        assert_eq!(back.read_refcount(), 1);
        assert_eq!(back.caps, a.caps);

        let c = fx.res.counters();
        assert_eq!((c.n_allocs, c.used_total(), c.n_trash[0]), (1, 100, 0));
        let data = fx.res.read_payload(a.id, 0, 7, None).unwrap();
        assert_eq!(&data[..], b"payload");
    }

    #[test]
    fn test_remove_keeps_record_when_device_refuses() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let a = fx
            .res
            .create(&CreateRequest::new(100, Reliability::Soft, 60))
            .unwrap();
        fx.dev.inject(a.id, Fault::Remove);

        for mode in [RemoveMode::Trash(TrashKind::Delete), RemoveMode::Physical] {
            let err = fx.res.remove(mode, a.id).unwrap_err();
            assert!(matches!(err, IbpError::Device(_)));
        }
        for kind in CapKind::ALL {
            assert_eq!(fx.res.get_by_cap(kind, a.caps.get(kind)).unwrap().id, a.id);
        }
        assert_eq!(fx.res.store().index_len(IndexKind::BySoft), 1);
        let c = fx.res.counters();
        assert_eq!((c.n_allocs, c.used(Reliability::Soft), c.n_trash[0]), (1, 100, 0));

        fx.dev.clear_faults();
        fx.res.remove(RemoveMode::Physical, a.id).unwrap();
        assert!(!fx.dev.exists(a.id));
        assert_eq!(fx.res.counters().n_allocs, 0);
    }

    #[test]
    fn test_undelete_without_space_retrashes() {
        let fx = mount(limits(100, 100, 100));
        let a = fx
            .res
            .create(&CreateRequest::new(100, Reliability::Hard, 60))
            .unwrap();
        fx.res
            .remove(RemoveMode::Trash(TrashKind::Delete), a.id)
            .unwrap();
        fx.res
            .create(&CreateRequest::new(100, Reliability::Hard, 60))
            .unwrap();

        let entry = fx.res.trash_list(TrashKind::Delete).unwrap().remove(0);
        let err = fx
            .res
            .undelete(TrashKind::Delete, &entry.trash_id, T0 + 10)
            .unwrap_err();
        assert!(err.is_out_of_space());
        assert_eq!(fx.res.trash_list(TrashKind::Delete).unwrap().len(), 1);
        assert_eq!(fx.res.counters().n_trash[TrashKind::Delete.index()], 1);
        assert!(!fx.dev.exists(a.id));
    }

    #[test]
    fn test_refcount_release_deletes() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let a = fx
            .res
            .create(&CreateRequest::new(10, Reliability::Hard, 60))
            .unwrap();
        fx.res.increment_refcount(a.id, CapKind::Read).unwrap();
        assert_eq!(
            fx.res.decrement_refcount(a.id, CapKind::Read).unwrap(),
            RefState::Live
        );
        assert_eq!(
            fx.res.decrement_refcount(a.id, CapKind::Read).unwrap(),
            RefState::Released
        );
        assert!(fx.res.get_by_id(a.id).is_err());
        assert_eq!(fx.res.counters().n_trash[TrashKind::Delete.index()], 1);
    }

    #[test]
    fn test_write_beyond_reservation_fails() {
        let fx = mount(limits(10_000, 10_000, 10_000));
        let a = fx
            .res
            .create(&CreateRequest::new(10, Reliability::Hard, 60))
            .unwrap();
        assert!(fx.res.write_payload(a.id, 5, &[0u8; 6], None).is_err());
        let a = fx.res.write_payload(a.id, 5, &[0u8; 5], None).unwrap();
        assert_eq!(a.size, 10);
    }

    #[test]
    fn test_mode_disables_writes() {
        let fx = mount_with(
            config(limits(10_000, 10_000, 10_000)).with_mode("read,manage"),
            u64::MAX / 4,
        );
        let err = fx
            .res
            .create(&CreateRequest::new(10, Reliability::Hard, 60))
            .unwrap_err();
        assert!(matches!(err, IbpError::ModeDisabled(_)));
    }
}
