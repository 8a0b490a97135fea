//! Space reclaimer
//!
//! Admission runs in two phases. The plan phase works out which trash entries
//! and which allocations would have to go to cover every deficit; nothing is
//! touched. Only when the plan covers all of them does the commit phase purge
//! and remove. A request that cannot be satisfied therefore fails without
//! side effects, and repeating it yields the same result.
//!
//! If the device refuses to release a planned victim during commit, the
//! victims already released stay released and the request fails.

use crate::device::{RemoveMode, TrashEntry, TrashKind};
use crate::resource::{Counters, Resource};
use crate::store::{Direction, IndexKind};
use ibp_core::{AllocationId, AllocationRecord, IbpError, Reliability, Result, ALLOC_HEADER};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Records fetched per index batch while planning
const PLAN_BATCH: usize = 256;

/// Space a pending operation needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceRequest {
    /// Bytes charged against the class and aggregate quotas
    pub charge: u64,
    /// Bytes that will land on the device
    pub physical: u64,
    pub class: Reliability,
    /// Allocation that must survive the sweep
    pub protect: Option<AllocationId>,
}

impl SpaceRequest {
    /// A new allocation of `charge` payload bytes plus its header
    pub fn new(charge: u64, class: Reliability) -> Self {
        Self {
            charge,
            physical: charge.saturating_add(ALLOC_HEADER),
            class,
            protect: None,
        }
    }

    pub fn with_physical(mut self, physical: u64) -> Self {
        self.physical = physical;
        self
    }

    pub fn protecting(mut self, id: AllocationId) -> Self {
        self.protect = Some(id);
        self
    }
}

/// Outstanding deficits while planning
#[derive(Debug, Clone, Copy, Default)]
struct Deficit {
    class: u64,
    total: u64,
    free: u64,
}

impl Deficit {
    fn is_covered(&self) -> bool {
        self.class == 0 && self.total == 0 && self.free == 0
    }

    fn largest(&self) -> u64 {
        self.class.max(self.total).max(self.free)
    }
}

#[derive(Debug, Default)]
struct Plan {
    trash: Vec<(TrashKind, TrashEntry)>,
    records: Vec<AllocationRecord>,
    planned: HashSet<AllocationId>,
}

impl Resource {
    /// Free enough space for `size` bytes of class `class`
    ///
    /// Nothing is charged; the call only reclaims.
    pub fn make_space(&self, size: u64, class: Reliability) -> Result<()> {
        let mut c = self.lock_counters();
        self.make_space_locked(&mut c, SpaceRequest::new(size, class).with_physical(size))
    }

    /// Reclaim for `req` while holding the resource mutex
    pub(crate) fn make_space_locked(&self, c: &mut Counters, req: SpaceRequest) -> Result<()> {
        let free = self.device.statfs()?.free_bytes;
        let limits = self.limits;

        let class_after = c.used(req.class).checked_add(req.charge);
        let total_after = c.used_total().checked_add(req.charge);
        let free_wanted = req
            .physical
            .checked_add(limits.minfree)
            .and_then(|n| n.checked_add(c.pending));
        let (Some(class_after), Some(total_after), Some(free_wanted)) =
            (class_after, total_after, free_wanted)
        else {
            debug!(rid = %self.rid, charge = req.charge, physical = req.physical, "Request size overflows");
            return Err(IbpError::size_overflow());
        };

        let mut need = Deficit {
            class: class_after.saturating_sub(limits.class_max(req.class)),
            total: total_after.saturating_sub(limits.max_total),
            free: free_wanted.saturating_sub(free),
        };
        if need.is_covered() {
            return Ok(());
        }

        debug!(
            rid = %self.rid,
            class = %req.class,
            need_class = need.class,
            need_total = need.total,
            need_free = need.free,
            "Reclaiming space"
        );

        let plan = self.plan_reclaim(&req, &mut need)?;
        if !need.is_covered() {
            debug!(rid = %self.rid, short = need.largest(), "Reclaim plan falls short");
            return Err(IbpError::OutOfSpace {
                needed: need.largest(),
            });
        }

        self.commit_reclaim(c, plan)
    }

    fn plan_reclaim(&self, req: &SpaceRequest, need: &mut Deficit) -> Result<Plan> {
        let mut plan = Plan::default();

        for kind in TrashKind::ALL {
            if need.free == 0 {
                break;
            }
            for entry in self.device.trash_entries(kind)? {
                if need.free == 0 {
                    break;
                }
                need.free = need.free.saturating_sub(entry.size);
                plan.trash.push((kind, entry));
            }
        }

        let now = self.now();
        for index in [IndexKind::ByExpire, IndexKind::BySoft] {
            let mut cursor = self.store.iterate(index, Direction::Next);
            'walk: while !need.is_covered() {
                let batch = cursor.next_batch(PLAN_BATCH)?;
                if batch.is_empty() {
                    break;
                }
                for a in batch {
                    if need.is_covered() {
                        break 'walk;
                    }
                    if index == IndexKind::ByExpire && a.expiration >= now {
                        break 'walk;
                    }
                    if Some(a.id) == req.protect || plan.planned.contains(&a.id) {
                        continue;
                    }

                    let charged = a.charged_size();
                    let helps_class = need.class > 0 && a.reliability == req.class && charged > 0;
                    if !(helps_class || need.total > 0 && charged > 0 || need.free > 0) {
                        continue;
                    }

                    if a.reliability == req.class {
                        need.class = need.class.saturating_sub(charged);
                    }
                    need.total = need.total.saturating_sub(charged);
                    need.free = need.free.saturating_sub(self.device.size(a.id).unwrap_or(0));
                    plan.planned.insert(a.id);
                    plan.records.push(a);
                }
            }
        }

        Ok(plan)
    }

    fn commit_reclaim(&self, c: &mut Counters, plan: Plan) -> Result<()> {
        // Bytes the plan counted on but the device did not release
        let mut missed = 0u64;
        let mut purged = 0;
        let mut removed = 0;

        for (kind, entry) in &plan.trash {
            match self.purge_trash_locked(c, *kind, entry) {
                Ok(_) => purged += 1,
                Err(e) => {
                    warn!(rid = %self.rid, bin = %kind, trash_id = %entry.trash_id, error = %e, "Failed to purge trash entry");
                    missed = missed.saturating_add(entry.size.max(1));
                }
            }
        }

        for a in &plan.records {
            match self.remove_locked(c, a, RemoveMode::Physical) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(rid = %self.rid, id = %a.id, error = %e, "Failed to reclaim allocation");
                    missed = missed.saturating_add(a.charged_size().max(1));
                }
            }
        }

        if purged > 0 || removed > 0 {
            info!(rid = %self.rid, purged, removed, "Reclaimed space");
        }
        if missed > 0 {
            return Err(IbpError::OutOfSpace { needed: missed });
        }
        Ok(())
    }
}
