//! Background janitor
//!
//! One thread per mounted resource. Each pass recounts the trash bins when a
//! rescan is due, purges trash past its grace period, then moves expired
//! allocations into the expire bin. Between passes the thread sleeps on a
//! condition variable, so shutdown and rescan requests wake it at once.
//!
//! The thread holds only a weak reference to its resource while asleep.

use crate::device::{RemoveMode, TrashKind};
use crate::resource::Resource;
use crate::walk::ExpireWalk;
use ibp_core::{IbpError, Result, CLEANUP_BATCH};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct JanitorState {
    shutting_down: bool,
    /// Time of the next trash recount; zero forces one
    next_rescan: u64,
}

/// Janitor thread control block
#[derive(Debug, Default)]
pub struct Janitor {
    state: Mutex<JanitorState>,
    wake: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Janitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    fn shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Sleep for `interval` unless woken; returns false once shutdown is requested
    fn sleep(&self, interval: Duration) -> bool {
        let mut state = self.state.lock();
        // A rescan requested during the pass skips the sleep
        if !state.shutting_down && state.next_rescan != 0 {
            self.wake.wait_for(&mut state, interval);
        }
        !state.shutting_down
    }

    /// Claim the rescan if due, scheduling the next one
    fn take_rescan(&self, now: u64, interval: u64) -> bool {
        let mut state = self.state.lock();
        if now < state.next_rescan {
            return false;
        }
        state.next_rescan = now.saturating_add(interval);
        true
    }
}

impl Resource {
    /// Spawn the janitor thread; a no-op if it is already running
    pub fn start_janitor(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.janitor.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        {
            let mut state = self.janitor.state.lock();
            state.shutting_down = false;
            state.next_rescan = self.now().saturating_sub(1);
        }

        let weak = Arc::downgrade(self);
        let janitor = Arc::clone(&self.janitor);
        let interval = Duration::from_secs(self.config.cleanup_interval);
        let spawned = thread::Builder::new()
            .name(format!("ibp-janitor-{}", self.rid))
            .spawn(move || janitor_loop(weak, janitor, interval))
            .map_err(IbpError::Io)?;
        *handle = Some(spawned);

        info!(rid = %self.rid, interval_secs = interval.as_secs(), "Janitor started");
        Ok(())
    }

    /// Signal the janitor and wait for it to exit
    pub fn stop_janitor(&self) {
        {
            let mut state = self.janitor.state.lock();
            state.shutting_down = true;
        }
        self.janitor.wake.notify_all();

        let handle = self.janitor.handle.lock().take();
        if let Some(handle) = handle {
            // The last strong reference can be released on the janitor thread itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(rid = %self.rid, "Janitor thread panicked");
            } else {
                info!(rid = %self.rid, "Janitor stopped");
            }
        }
    }

    /// Wake the janitor and force a trash recount on its next pass
    pub fn rescan(&self) {
        self.janitor.state.lock().next_rescan = 0;
        self.janitor.wake.notify_all();
    }

    /// One janitor pass; errors are logged so the loop keeps going
    pub fn janitor_pass(&self) {
        let now = self.now();
        if self.janitor.take_rescan(now, self.config.rescan_interval) {
            self.trash_rescan_all();
        }

        let (delete_grace, expire_grace) = self.config.grace_periods();
        for (kind, grace) in [
            (TrashKind::Delete, delete_grace),
            (TrashKind::Expire, expire_grace),
        ] {
            if let Err(e) = self.trash_cleanup(kind, now.saturating_sub(grace)) {
                warn!(rid = %self.rid, bin = %kind, error = %e, "Trash cleanup failed");
            }
        }

        if let Err(e) = self.resource_cleanup() {
            warn!(rid = %self.rid, error = %e, "Expired allocation cleanup failed");
        }
    }

    /// Recount both trash bins from the device
    pub fn trash_rescan_all(&self) {
        for kind in TrashKind::ALL {
            if let Err(e) = self.trash_rescan(kind) {
                warn!(rid = %self.rid, bin = %kind, error = %e, "Trash rescan failed");
            }
        }
    }

    /// Recount one trash bin from the device
    pub fn trash_rescan(&self, kind: TrashKind) -> Result<()> {
        let entries = self.device.trash_entries(kind)?;
        let bytes: u64 = entries.iter().map(|e| e.size).sum();

        let mut c = self.lock_counters();
        c.n_trash[kind.index()] = entries.len() as u64;
        c.trash_size[kind.index()] = bytes;
        debug!(rid = %self.rid, bin = %kind, count = entries.len(), bytes, "Rescanned trash");
        Ok(())
    }

    /// Purge entries moved to the bin at or before `wipe_start`
    ///
    /// While the device is below its free-space reserve, newer entries go too.
    pub fn trash_cleanup(&self, kind: TrashKind, wipe_start: u64) -> Result<usize> {
        let minfree = self.limits.minfree;
        let mut free = self.device.statfs()?.free_bytes;
        let mut purged = 0;

        for entry in self.device.trash_entries(kind)? {
            let low_space = free < minfree;
            if entry.move_time > wipe_start && !low_space {
                break;
            }
            let mut c = self.lock_counters();
            match self.purge_trash_locked(&mut c, kind, &entry) {
                Ok(bytes) => {
                    free = free.saturating_add(bytes);
                    purged += 1;
                }
                Err(e) => {
                    warn!(rid = %self.rid, bin = %kind, trash_id = %entry.trash_id, error = %e, "Failed to purge trash entry")
                }
            }
        }

        if purged > 0 {
            info!(rid = %self.rid, bin = %kind, purged, "Purged trash");
        }
        Ok(purged)
    }

    /// Move expired allocations into the expire bin
    ///
    /// Until `preexpire_grace_period` has passed since mount, allocations that
    /// expired before the mount are left alone.
    pub fn resource_cleanup(&self) -> Result<usize> {
        let now = self.now();
        let grace_over = self.start_time.saturating_add(self.config.preexpire_grace_period);
        let start = if now < grace_over {
            self.start_time.saturating_add(1)
        } else {
            0
        };

        let mut walk = ExpireWalk::new(&self.store, start)?;
        let mut trashed = 0;
        loop {
            let mut batch = walk.next_batch(CLEANUP_BATCH)?;
            let full = batch.len() == CLEANUP_BATCH;
            let expired = batch.iter().take_while(|a| a.expiration < now).count();
            batch.truncate(expired);

            for a in &batch {
                let mut c = self.lock_counters();
                match self.store.get(a.id)? {
                    Some(current) if current.expiration < now => {
                        match self.remove_locked(&mut c, &current, RemoveMode::Trash(TrashKind::Expire)) {
                            Ok(()) => trashed += 1,
                            Err(e) => {
                                warn!(rid = %self.rid, id = %a.id, error = %e, "Failed to trash expired allocation")
                            }
                        }
                    }
                    _ => {}
                }
            }

            if !full || expired < CLEANUP_BATCH || self.janitor.shutting_down() {
                break;
            }
        }

        if trashed > 0 {
            info!(rid = %self.rid, trashed, "Moved expired allocations to trash");
        }
        Ok(trashed)
    }
}

fn janitor_loop(resource: Weak<Resource>, janitor: Arc<Janitor>, interval: Duration) {
    loop {
        if janitor.shutting_down() {
            break;
        }
        match resource.upgrade() {
            Some(res) => res.janitor_pass(),
            None => break,
        }
        if !janitor.sleep(interval) {
            break;
        }
    }
    debug!("Janitor loop exiting");
}
