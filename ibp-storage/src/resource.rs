//! Depot resource
//!
//! A resource owns one object device and one allocation store, and keeps the
//! live counters used for quota admission. Counters are only touched while
//! holding the resource mutex; the allocation store has its own lock, always
//! taken after the resource mutex.

use crate::device::{ObjectDevice, TrashEntry, TrashKind};
use crate::dir_device::DirDevice;
use crate::history::{AllocationHistory, HistoryTable};
use crate::janitor::Janitor;
use crate::rebuild::RebuildMode;
use crate::store::{AllocationStore, Direction, IndexKind};
use crate::usage::{UsageSnapshot, UsageState};
use ibp_core::{
    AllocationId, AllocationRecord, AllocationType, CapKind, Capability, ChecksumOptions, Clock,
    IbpError, Reliability, ResourceConfig, ResourceLimits, ResourceMode, Result, SystemClock,
    TimeKey,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Live accounting of a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Reserved bytes per reliability class
    pub used_space: [u64; 2],
    pub n_allocs: u64,
    pub n_alias: u64,
    /// Bytes per trash bin
    pub trash_size: [u64; 2],
    pub n_trash: [u64; 2],
    /// Bytes promised to in-flight preallocations
    pub pending: u64,
}

impl Counters {
    pub fn used(&self, class: Reliability) -> u64 {
        self.used_space[class.index()]
    }

    pub fn used_total(&self) -> u64 {
        self.used_space[0] + self.used_space[1]
    }

    pub fn trash_total(&self) -> u64 {
        self.trash_size[0] + self.trash_size[1]
    }

    pub(crate) fn charge(&mut self, record: &AllocationRecord) {
        self.n_allocs += 1;
        if record.is_alias {
            self.n_alias += 1;
        } else {
            self.used_space[record.reliability.index()] += record.max_size;
        }
    }

    pub(crate) fn discharge(&mut self, record: &AllocationRecord) {
        self.n_allocs = self.n_allocs.saturating_sub(1);
        if record.is_alias {
            self.n_alias = self.n_alias.saturating_sub(1);
        } else {
            let slot = &mut self.used_space[record.reliability.index()];
            *slot = slot.saturating_sub(record.max_size);
        }
    }

    pub(crate) fn trash_added(&mut self, kind: TrashKind, size: u64) {
        self.n_trash[kind.index()] += 1;
        self.trash_size[kind.index()] += size;
    }

    pub(crate) fn trash_removed(&mut self, kind: TrashKind, size: u64) {
        let k = kind.index();
        self.n_trash[k] = self.n_trash[k].saturating_sub(1);
        self.trash_size[k] = self.trash_size[k].saturating_sub(size);
    }
}

/// Point-in-time view of a resource's accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub counters: Counters,
    pub limits: ResourceLimits,
    pub free_bytes: u64,
    pub activity: u64,
}

/// Parameters of a new allocation
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub size: u64,
    pub alloc_type: AllocationType,
    pub reliability: Reliability,
    /// Seconds from now
    pub duration: u64,
    pub is_alias: bool,
    /// Reserve the bytes now; `None` follows the resource default
    pub preallocate: Option<bool>,
    pub checksum: Option<ChecksumOptions>,
}

impl CreateRequest {
    pub fn new(size: u64, reliability: Reliability, duration: u64) -> Self {
        Self {
            size,
            alloc_type: AllocationType::ByteArray,
            reliability,
            duration,
            is_alias: false,
            preallocate: None,
            checksum: None,
        }
    }

    pub fn alias(duration: u64) -> Self {
        Self {
            is_alias: true,
            ..Self::new(0, Reliability::Hard, duration)
        }
    }

    pub fn with_type(mut self, alloc_type: AllocationType) -> Self {
        self.alloc_type = alloc_type;
        self
    }

    pub fn with_preallocate(mut self, preallocate: bool) -> Self {
        self.preallocate = Some(preallocate);
        self
    }

    pub fn with_checksum(mut self, checksum: ChecksumOptions) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

/// How a resource is brought online
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Rebuild regardless of the usage snapshot
    pub force_rebuild: Option<RebuildMode>,
    /// Do not reserve bytes at creation unless asked to
    pub lazy_allocate: bool,
    /// Clamp expirations beyond `now + max_duration`
    pub truncate_expiration: bool,
    /// Spawn the background janitor
    pub start_janitor: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            force_rebuild: None,
            lazy_allocate: false,
            truncate_expiration: false,
            start_janitor: true,
        }
    }
}

impl MountOptions {
    pub fn with_rebuild(mut self, mode: RebuildMode) -> Self {
        self.force_rebuild = Some(mode);
        self
    }

    pub fn with_truncate_expiration(mut self, enabled: bool) -> Self {
        self.truncate_expiration = enabled;
        self
    }

    pub fn without_janitor(mut self) -> Self {
        self.start_janitor = false;
        self
    }
}

/// A mounted depot resource
pub struct Resource {
    pub(crate) rid: String,
    pub(crate) config: ResourceConfig,
    pub(crate) limits: ResourceLimits,
    pub(crate) mode: ResourceMode,
    pub(crate) device: Arc<dyn ObjectDevice>,
    pub(crate) store: AllocationStore,
    pub(crate) history: AllocationHistory,
    pub(crate) counters: Mutex<Counters>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) start_time: u64,
    pub(crate) lazy_allocate: bool,
    pub(crate) janitor: Arc<Janitor>,

    /// Bumped on every externally visible operation
    activity: AtomicU64,
}

impl Resource {
    /// Mount a resource on the given device and store
    pub fn mount(
        config: ResourceConfig,
        device: Arc<dyn ObjectDevice>,
        store: AllocationStore,
        clock: Arc<dyn Clock>,
        opts: MountOptions,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!(rid = %config.rid, force_rebuild = ?opts.force_rebuild, "Mounting resource");

        let history = AllocationHistory::open(&store, &config)?;
        let start_time = clock.now();
        let res = Arc::new(Self {
            rid: config.rid.clone(),
            limits: config.limits(),
            mode: config.mode(),
            janitor: Arc::new(Janitor::new()),
            counters: Mutex::new(Counters::default()),
            activity: AtomicU64::new(0),
            lazy_allocate: opts.lazy_allocate,
            start_time,
            config,
            device,
            store,
            history,
            clock,
        });

        match opts.force_rebuild {
            Some(mode) => {
                res.rebuild(mode, opts.truncate_expiration)?;
            }
            None => match UsageSnapshot::read_clean(res.device.as_ref()) {
                Ok(snap) => {
                    let mut c = res.counters.lock();
                    c.used_space = snap.used_space;
                    c.n_allocs = snap.n_allocs;
                    c.n_alias = snap.n_alias;
                }
                Err(e) => {
                    warn!(rid = %res.rid, error = %e, "Resource not cleanly unmounted, rebuilding");
                    res.rebuild(RebuildMode::FullRebuild, opts.truncate_expiration)?;
                }
            },
        }

        res.trash_rescan_all();
        res.write_snapshot(UsageState::Bad)?;

        if opts.start_janitor {
            res.start_janitor()?;
        }

        let c = res.counters();
        info!(
            rid = %res.rid,
            n_allocs = c.n_allocs,
            n_alias = c.n_alias,
            used_soft = c.used(Reliability::Soft),
            used_hard = c.used(Reliability::Hard),
            "Resource mounted"
        );
        Ok(res)
    }

    /// Mount a directory resource at `config.device` with its store under `db/`
    pub fn mount_dir(config: ResourceConfig, opts: MountOptions) -> Result<Arc<Self>> {
        let device = Arc::new(DirDevice::open(&config.device)?);
        let store = AllocationStore::open(config.device.join("db"))?;
        Self::mount(config, device, store, Arc::new(SystemClock), opts)
    }

    /// Format an empty resource: blank store and a clean usage snapshot
    pub fn mkfs(config: &ResourceConfig, device: &dyn ObjectDevice, store: &AllocationStore) -> Result<()> {
        config.validate()?;
        store.wipe()?;
        store.flush()?;
        UsageSnapshot::new([0, 0], 0, 0, UsageState::Good).write(device)?;
        info!(rid = %config.rid, "Formatted resource");
        Ok(())
    }

    /// Stop the janitor, flush the store and record a clean shutdown
    pub fn unmount(&self) -> Result<()> {
        info!(rid = %self.rid, "Unmounting resource");
        self.stop_janitor();

        match self.store.flush() {
            Ok(()) => self.write_snapshot(UsageState::Good),
            Err(e) => {
                warn!(rid = %self.rid, error = %e, "Store close failed, leaving usage snapshot dirty");
                Err(e)
            }
        }
    }

    pub(crate) fn write_snapshot(&self, state: UsageState) -> Result<()> {
        let c = self.counters();
        UsageSnapshot::new(c.used_space, c.n_allocs, c.n_alias, state).write(self.device.as_ref())
    }

    // ===== Accessors =====

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn device(&self) -> &dyn ObjectDevice {
        self.device.as_ref()
    }

    pub fn store(&self) -> &AllocationStore {
        &self.store
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Current time on the resource clock
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub(crate) fn lock_counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock()
    }

    /// Copy of the live counters
    pub fn counters(&self) -> Counters {
        *self.counters.lock()
    }

    pub(crate) fn touch(&self) {
        self.activity.fetch_add(1, Ordering::Relaxed);
    }

    /// Operations performed since mount
    pub fn activity(&self) -> u64 {
        self.activity.load(Ordering::Relaxed)
    }

    /// Counters, limits and device free space
    pub fn usage(&self) -> Result<ResourceUsage> {
        let free_bytes = self.device.statfs()?.free_bytes;
        Ok(ResourceUsage {
            counters: self.counters(),
            limits: self.limits,
            free_bytes,
            activity: self.activity(),
        })
    }

    /// Largest allocation of `class` admissible without reclaiming live data
    pub fn allocable(&self, class: Reliability) -> Result<u64> {
        let free = self.device.statfs()?.free_bytes;
        let c = self.lock_counters();
        let quota = self
            .limits
            .max_total
            .saturating_sub(c.used_total())
            .min(self.limits.class_max(class).saturating_sub(c.used(class)));
        let device = (free + c.trash_total())
            .saturating_sub(self.limits.minfree)
            .saturating_sub(c.pending);
        Ok(quota.min(device))
    }

    pub(crate) fn require_mode(&self, enabled: bool, what: &str) -> Result<()> {
        if enabled {
            Ok(())
        } else {
            Err(IbpError::ModeDisabled(format!("{} on resource {}", what, self.rid)))
        }
    }

    // ===== Lookups =====

    pub fn get_by_id(&self, id: AllocationId) -> Result<AllocationRecord> {
        self.touch();
        self.store.get_by_id(id)
    }

    pub fn get_by_cap(&self, kind: CapKind, cap: &Capability) -> Result<AllocationRecord> {
        self.touch();
        self.store.get_by_cap(kind, cap)
    }

    /// Up to `max` `(expiration, id)` pairs starting at `start_time`
    pub fn expire_list(&self, start_time: u64, max: usize) -> Result<Vec<TimeKey>> {
        self.touch();
        let mut cursor = self.store.iterate(IndexKind::ByExpire, Direction::Next);
        cursor.seek_time(start_time)?;
        Ok(cursor
            .next_batch(max)?
            .iter()
            .map(AllocationRecord::expire_key)
            .collect())
    }

    /// Entries of one trash bin, oldest first
    pub fn trash_list(&self, kind: TrashKind) -> Result<Vec<TrashEntry>> {
        self.device.trash_entries(kind)
    }

    /// Stored access history of an allocation
    pub fn history(&self, id: AllocationId) -> Result<HistoryTable> {
        self.history.get(id)
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        self.stop_janitor();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_fresh_mount_is_empty() {
        let fx = mount(limits(1 << 20, 1 << 20, 1 << 20));
        assert_eq!(fx.res.counters(), Counters::default());
        let snap = UsageSnapshot::read(fx.dev.as_ref()).unwrap();
        assert_eq!(snap.state, UsageState::Bad);
    }

    #[test]
    fn test_unmount_writes_clean_snapshot() {
        let fx = mount(limits(1 << 20, 1 << 20, 1 << 20));
        fx.res
            .create(&CreateRequest::new(100, Reliability::Hard, 60))
            .unwrap();
        fx.res.unmount().unwrap();

        let snap = UsageSnapshot::read_clean(fx.dev.as_ref()).unwrap();
        assert_eq!(snap.n_allocs, 1);
        assert_eq!(snap.used_space[Reliability::Hard.index()], 100);
    }

    #[test]
    fn test_allocable() {
        let fx = mount(limits(1000, 1000, 400));
        assert_eq!(fx.res.allocable(Reliability::Soft).unwrap(), 1000);
        assert_eq!(fx.res.allocable(Reliability::Hard).unwrap(), 400);
        fx.res
            .create(&CreateRequest::new(300, Reliability::Soft, 60))
            .unwrap();
        assert_eq!(fx.res.allocable(Reliability::Soft).unwrap(), 700);
        assert_eq!(fx.res.allocable(Reliability::Hard).unwrap(), 400);
    }

    #[test]
    fn test_expire_list() {
        let fx = mount(limits(1 << 20, 1 << 20, 1 << 20));
        for d in [30, 10, 20] {
            fx.res
                .create(&CreateRequest::new(1, Reliability::Hard, d))
                .unwrap();
        }
        let list = fx.res.expire_list(T0 + 15, 10).unwrap();
        let exps: Vec<u64> = list.iter().map(|k| k.expiration).collect();
        assert_eq!(exps, vec![T0 + 20, T0 + 30]);
    }

    #[test]
    fn test_activity_counter() {
        let fx = mount(limits(1 << 20, 1 << 20, 1 << 20));
        let before = fx.res.activity();
        let rec = fx
            .res
            .create(&CreateRequest::new(1, Reliability::Hard, 5))
            .unwrap();
        fx.res.get_by_id(rec.id).unwrap();
        assert!(fx.res.activity() >= before + 2);
    }
}
