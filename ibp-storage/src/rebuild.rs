//! Recovery and rebuild
//!
//! `RepairIndices` trusts the primary index and re-derives everything else
//! from it. The full modes trust only the device: every object header is
//! re-read and the store is refilled from scratch. Either way the counters
//! afterwards are recomputed totals, never the snapshot's claims.

use crate::device::{RemoveMode, TrashKind};
use crate::header;
use crate::resource::Resource;
use crate::store::{Direction, IndexKind};
use ibp_core::{AllocationRecord, IbpError, Result, ALLOC_HEADER, REBUILD_BATCH};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// How much of the resource to rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildMode {
    /// Re-derive secondary indices and counters from the primary index
    RepairIndices,
    /// Refill the store from the object headers on the device
    FullRebuild,
    /// Full rebuild that also resets every expiration to `now + max_duration`
    FullRebuildTruncate,
}

impl RebuildMode {
    /// Numeric level used on the command line, 1 to 3
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(RebuildMode::RepairIndices),
            2 => Some(RebuildMode::FullRebuild),
            3 => Some(RebuildMode::FullRebuildTruncate),
            _ => None,
        }
    }
}

impl fmt::Display for RebuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildMode::RepairIndices => write!(f, "repair-indices"),
            RebuildMode::FullRebuild => write!(f, "full"),
            RebuildMode::FullRebuildTruncate => write!(f, "full-truncate"),
        }
    }
}

impl FromStr for RebuildMode {
    type Err = IbpError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" | "repair-indices" => Ok(RebuildMode::RepairIndices),
            "2" | "full" => Ok(RebuildMode::FullRebuild),
            "3" | "full-truncate" => Ok(RebuildMode::FullRebuildTruncate),
            other => Err(IbpError::Configuration(format!("unknown rebuild mode '{}'", other))),
        }
    }
}

/// What a rebuild or truncate pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub added: u64,
    pub aliases: u64,
    /// Expired allocations moved to trash
    pub removed: u64,
    /// Objects left alone because their header was unusable
    pub skipped: u64,
    /// Expirations clamped to `now + max_duration`
    pub truncated: u64,
}

impl Resource {
    /// Rebuild the store in the given mode
    pub fn rebuild(&self, mode: RebuildMode, truncate_expiration: bool) -> Result<RebuildReport> {
        match mode {
            RebuildMode::RepairIndices => {
                let mut report = self.repair_indices()?;
                if truncate_expiration {
                    let t = self.perform_truncate()?;
                    report.removed = t.removed;
                    report.truncated = t.truncated;
                }
                Ok(report)
            }
            RebuildMode::FullRebuild => self.rebuild_from_device(false, truncate_expiration),
            RebuildMode::FullRebuildTruncate => self.rebuild_from_device(true, true),
        }
    }

    /// Re-derive secondary indices, then recount
    pub fn repair_indices(&self) -> Result<RebuildReport> {
        info!(rid = %self.rid, "Repairing allocation indices");
        self.store.rebuild_indices()?;
        self.calc_usage()
    }

    /// Recompute the usage counters from the primary index alone
    pub fn calc_usage(&self) -> Result<RebuildReport> {
        let mut used_space = [0u64; 2];
        let mut report = RebuildReport::default();

        let mut cursor = self.store.iterate(IndexKind::ById, Direction::Next);
        loop {
            let batch = cursor.next_batch(REBUILD_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for a in &batch {
                used_space[a.reliability.index()] += a.charged_size();
                report.added += 1;
                if a.is_alias {
                    report.aliases += 1;
                }
            }
        }

        let mut c = self.lock_counters();
        c.used_space = used_space;
        c.n_allocs = report.added;
        c.n_alias = report.aliases;
        debug!(rid = %self.rid, n_allocs = c.n_allocs, n_alias = c.n_alias, "Recalculated usage");
        Ok(report)
    }

    /// Trash expired allocations and clamp expirations beyond `now + max_duration`
    pub fn perform_truncate(&self) -> Result<RebuildReport> {
        let now = self.now();
        let max_expiration = now.saturating_add(self.config.max_duration);
        let mut report = RebuildReport::default();

        let mut cursor = self.store.iterate(IndexKind::ById, Direction::Next);
        loop {
            let batch = cursor.next_batch(REBUILD_BATCH)?;
            if batch.is_empty() {
                break;
            }
            let mut c = self.lock_counters();
            for mut a in batch {
                if a.expiration < now {
                    match self.remove_locked(&mut c, &a, RemoveMode::Trash(TrashKind::Expire)) {
                        Ok(()) => report.removed += 1,
                        Err(e) => {
                            warn!(rid = %self.rid, id = %a.id, error = %e, "Failed to trash expired allocation");
                            report.skipped += 1;
                        }
                    }
                } else if a.expiration > max_expiration {
                    a.expiration = max_expiration;
                    self.persist_locked(&a)?;
                    report.truncated += 1;
                }
            }
        }

        info!(
            rid = %self.rid,
            removed = report.removed,
            truncated = report.truncated,
            "Truncated expirations"
        );
        Ok(report)
    }

    fn rebuild_from_device(&self, force_expiration: bool, truncate: bool) -> Result<RebuildReport> {
        let now = self.now();
        let max_expiration = now.saturating_add(self.config.max_duration);
        // Expired allocations only go when there is no post-mount grace window
        let remove_expired = !force_expiration && self.config.preexpire_grace_period == 0;

        info!(
            rid = %self.rid,
            force_expiration,
            truncate,
            remove_expired,
            "Rebuilding resource from device"
        );

        self.store.wipe()?;
        let mut report = RebuildReport::default();
        let mut used_space = [0u64; 2];
        let mut buffer: Vec<AllocationRecord> = Vec::with_capacity(REBUILD_BATCH);

        for id in self.device.ids()? {
            let mut a = match header::read_header(self.device.as_ref(), id) {
                Ok(Some(a)) if a.id == id => a,
                Ok(Some(a)) => {
                    warn!(rid = %self.rid, id = %id, header_id = %a.id, "Header names another allocation, skipping");
                    report.skipped += 1;
                    continue;
                }
                Ok(None) => {
                    warn!(rid = %self.rid, id = %id, "Object without header, moving to trash");
                    if let Err(e) = self.device.trash(id, TrashKind::Expire, now) {
                        warn!(rid = %self.rid, id = %id, error = %e, "Failed to trash headerless object");
                    }
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(rid = %self.rid, id = %id, error = %e, "Unreadable header, skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            let payload = match self.device.size(id) {
                Ok(len) => len.saturating_sub(ALLOC_HEADER),
                Err(e) => {
                    warn!(rid = %self.rid, id = %id, error = %e, "Cannot size object, skipping");
                    report.skipped += 1;
                    continue;
                }
            };
            if !a.is_alias && a.size > payload {
                warn!(rid = %self.rid, id = %id, recorded = a.size, physical = payload, "Recorded size exceeds object");
                a.size = payload;
                a.w_pos = a.w_pos.min(payload);
            }

            if remove_expired && a.expiration < now {
                if let Err(e) = self.device.trash(id, TrashKind::Expire, now) {
                    warn!(rid = %self.rid, id = %id, error = %e, "Failed to trash expired allocation");
                }
                report.removed += 1;
                continue;
            }

            if force_expiration || (truncate && a.expiration > max_expiration) {
                a.expiration = max_expiration;
                report.truncated += 1;
                if let Err(e) = header::write_header(self.device.as_ref(), &a) {
                    warn!(rid = %self.rid, id = %id, error = %e, "Failed to rewrite header");
                }
            }

            buffer.push(a);
            if buffer.len() >= REBUILD_BATCH {
                self.flush_rebuild_batch(&mut buffer, &mut used_space, &mut report);
            }
        }
        self.flush_rebuild_batch(&mut buffer, &mut used_space, &mut report);

        let mut c = self.lock_counters();
        c.used_space = used_space;
        c.n_allocs = report.added;
        c.n_alias = report.aliases;
        drop(c);

        info!(
            rid = %self.rid,
            added = report.added,
            aliases = report.aliases,
            removed = report.removed,
            skipped = report.skipped,
            truncated = report.truncated,
            "Rebuild finished"
        );
        Ok(report)
    }

    /// Store a batch; a failed batch is retried record by record
    fn flush_rebuild_batch(
        &self,
        buffer: &mut Vec<AllocationRecord>,
        used_space: &mut [u64; 2],
        report: &mut RebuildReport,
    ) {
        if buffer.is_empty() {
            return;
        }

        let stored: Vec<AllocationRecord> = match self.store.put_batch(buffer) {
            Ok(()) => std::mem::take(buffer),
            Err(e) => {
                warn!(rid = %self.rid, error = %e, "Rebuild batch failed, storing records one by one");
                buffer
                    .drain(..)
                    .filter(|a| match self.store.put(a) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(rid = %self.rid, id = %a.id, error = %e, "Failed to store rebuilt record");
                            report.skipped += 1;
                            false
                        }
                    })
                    .collect()
            }
        };

        for a in &stored {
            used_space[a.reliability.index()] += a.charged_size();
            report.added += 1;
            if a.is_alias {
                report.aliases += 1;
            }
        }
    }
}
