//! Registry of mounted resources
//!
//! A rid is first reserved as pending while its resource mounts, then
//! activated. Both states block a second mount of the same rid.

use crate::resource::Resource;
use ibp_core::{IbpError, Reliability, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

enum Slot {
    Pending,
    Mounted(Arc<Resource>),
}

/// Resources of one depot, keyed by rid
#[derive(Default)]
pub struct ResourceList {
    slots: RwLock<HashMap<String, Slot>>,
}

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `rid` for a mount in progress
    pub fn reserve_pending(&self, rid: &str) -> Result<()> {
        let mut slots = self.slots.write();
        if slots.contains_key(rid) {
            return Err(IbpError::AlreadyPending(rid.to_string()));
        }
        slots.insert(rid.to_string(), Slot::Pending);
        debug!(rid = %rid, "Reserved resource slot");
        Ok(())
    }

    /// Release a pending claim after a failed mount
    pub fn cancel_pending(&self, rid: &str) {
        let mut slots = self.slots.write();
        if matches!(slots.get(rid), Some(Slot::Pending)) {
            slots.remove(rid);
        }
    }

    /// Publish a mounted resource under its pending rid
    pub fn activate(&self, resource: Arc<Resource>) -> Result<()> {
        let rid = resource.rid().to_string();
        let mut slots = self.slots.write();
        match slots.get(&rid) {
            Some(Slot::Pending) => {
                slots.insert(rid.clone(), Slot::Mounted(resource));
                info!(rid = %rid, "Resource active");
                Ok(())
            }
            Some(Slot::Mounted(_)) => Err(IbpError::AlreadyPending(rid)),
            None => Err(IbpError::NotFound(format!("no pending slot for resource {}", rid))),
        }
    }

    pub fn get(&self, rid: &str) -> Option<Arc<Resource>> {
        match self.slots.read().get(rid) {
            Some(Slot::Mounted(res)) => Some(Arc::clone(res)),
            _ => None,
        }
    }

    /// Detach a mounted resource; the caller unmounts it
    pub fn remove(&self, rid: &str) -> Option<Arc<Resource>> {
        let mut slots = self.slots.write();
        match slots.remove(rid) {
            Some(Slot::Mounted(res)) => Some(res),
            Some(Slot::Pending) => {
                slots.insert(rid.to_string(), Slot::Pending);
                None
            }
            None => None,
        }
    }

    /// Rids of mounted resources, sorted
    pub fn rids(&self) -> Vec<String> {
        let mut rids: Vec<String> = self
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Mounted(_)))
            .map(|(rid, _)| rid.clone())
            .collect();
        rids.sort();
        rids
    }

    pub fn len(&self) -> usize {
        self.rids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mounted resource with the most room for `size` bytes of `class`
    pub fn pick(&self, class: Reliability, size: u64) -> Option<Arc<Resource>> {
        let mounted: Vec<Arc<Resource>> = self
            .slots
            .read()
            .values()
            .filter_map(|slot| match slot {
                Slot::Mounted(res) => Some(Arc::clone(res)),
                Slot::Pending => None,
            })
            .collect();

        mounted
            .into_iter()
            .filter(|res| res.config().mode().write)
            .filter_map(|res| match res.allocable(class) {
                Ok(room) if room >= size => Some((room, res)),
                Ok(_) => None,
                Err(e) => {
                    warn!(rid = %res.rid(), error = %e, "Failed to size resource");
                    None
                }
            })
            .max_by(|(a, ra), (b, rb)| a.cmp(b).then_with(|| rb.rid().cmp(ra.rid())))
            .map(|(_, res)| res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDevice;
    use crate::resource::test_support::{config, limits};
    use crate::resource::MountOptions;
    use crate::store::AllocationStore;
    use ibp_core::ManualClock;

    fn mount(rid: &str, total: u64) -> Arc<Resource> {
        let mut cfg = config(limits(total, total, total));
        cfg.rid = rid.to_string();
        Resource::mount(
            cfg,
            Arc::new(MemoryDevice::new()),
            AllocationStore::open_temporary().unwrap(),
            Arc::new(ManualClock::new(1000)),
            MountOptions::default().without_janitor(),
        )
        .unwrap()
    }

    #[test]
    fn test_pending_blocks_second_mount() {
        let list = ResourceList::new();
        list.reserve_pending("r1").unwrap();
        assert!(matches!(
            list.reserve_pending("r1"),
            Err(IbpError::AlreadyPending(_))
        ));
        assert!(list.get("r1").is_none());

        list.activate(mount("r1", 100)).unwrap();
        assert!(list.reserve_pending("r1").is_err());
        assert_eq!(list.rids(), vec!["r1".to_string()]);
    }

    #[test]
    fn test_cancel_and_remove() {
        let list = ResourceList::new();
        list.reserve_pending("r1").unwrap();
        list.cancel_pending("r1");
        list.reserve_pending("r1").unwrap();
        list.activate(mount("r1", 100)).unwrap();

        list.cancel_pending("r1");
        assert!(list.get("r1").is_some());
        assert!(list.remove("r1").is_some());
        assert!(list.is_empty());
    }

    #[test]
    fn test_activate_requires_reservation() {
        let list = ResourceList::new();
        assert!(matches!(
            list.activate(mount("r9", 100)),
            Err(IbpError::NotFound(_))
        ));
    }

    #[test]
    fn test_pick_prefers_most_room() {
        let list = ResourceList::new();
        for (rid, total) in [("small", 100), ("large", 1000)] {
            list.reserve_pending(rid).unwrap();
            list.activate(mount(rid, total)).unwrap();
        }
        assert_eq!(list.pick(Reliability::Hard, 50).unwrap().rid(), "large");
        assert!(list.pick(Reliability::Hard, 5000).is_none());
    }
}
