//! End-to-end tests for the depot resource
//!
//! Covers mount → lifecycle → unmount → remount on a directory device, the
//! rebuild modes, and the quota and time-order invariants.
//!
//! Run with: cargo test --package ibp-storage --test resource

use ibp_core::{
    AllocationRecord, CapKind, IbpError, ManualClock, Reliability, ResourceConfig, ResourceLimits,
};
use ibp_storage::{
    AllocationStore, CreateRequest, DirDevice, Direction, IndexKind, MemoryDevice, MountOptions,
    RebuildMode, RemoveMode, Resource, TrashKind, UsageSnapshot,
};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

const T0: u64 = 1_700_000_000;

fn limits(total: u64, soft: u64, hard: u64) -> ResourceLimits {
    ResourceLimits {
        max_total: total,
        max_soft: soft,
        max_hard: hard,
        minfree: 0,
    }
}

fn dir_config(dir: &TempDir) -> ResourceConfig {
    ResourceConfig::new("disk", dir.path())
        .with_max_duration(30 * 24 * 3600)
        .with_limits(limits(1 << 30, 1 << 30, 1 << 30))
}

fn memory_resource(limits: ResourceLimits) -> (Arc<Resource>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let res = Resource::mount(
        ResourceConfig::new("mem", "/unused")
            .with_max_duration(1000)
            .with_limits(limits),
        Arc::new(MemoryDevice::new()),
        AllocationStore::open_temporary().unwrap(),
        clock.clone(),
        MountOptions::default().without_janitor(),
    )
    .unwrap();
    (res, clock)
}

/// Quota walk-through: a full hard quota frees up once its allocation expires
#[test]
fn test_hard_quota_scenario() {
    let (res, clock) = memory_resource(limits(1000, 1000, 1000));

    let first = res
        .create(&CreateRequest::new(1000, Reliability::Hard, 10))
        .unwrap();
    assert_eq!(res.counters().used(Reliability::Hard), 1000);

    clock.set(T0 + 5);
    let err = res
        .create(&CreateRequest::new(1, Reliability::Hard, 10))
        .unwrap_err();
    assert!(matches!(err, IbpError::OutOfSpace { .. }));

    clock.set(T0 + 11);
    let second = res
        .create(&CreateRequest::new(1, Reliability::Hard, 10))
        .unwrap();
    assert!(res.get_by_id(first.id).is_err());
    for kind in CapKind::ALL {
        assert!(res.get_by_cap(kind, first.caps.get(kind)).is_err());
    }
    assert_eq!(res.get_by_id(second.id).unwrap().max_size, 1);
    assert_eq!(res.counters().used(Reliability::Hard), 1);
}

#[test]
fn test_clean_remount_uses_snapshot() {
    let dir = TempDir::new().unwrap();
    let opts = MountOptions::default().without_janitor();

    let res = Resource::mount_dir(dir_config(&dir), opts).unwrap();
    let a = res
        .create(&CreateRequest::new(4096, Reliability::Soft, 3600))
        .unwrap();
    res.write_payload(a.id, 0, b"hello depot", Some("127.0.0.1"))
        .unwrap();
    let before = res.counters();
    res.unmount().unwrap();
    drop(res);

    let res = Resource::mount_dir(dir_config(&dir), opts).unwrap();
    let after = res.counters();
    assert_eq!(after.used_space, before.used_space);
    assert_eq!(after.n_allocs, 1);

    let found = res.get_by_cap(CapKind::Read, &a.caps.read).unwrap();
    assert_eq!(found.size, 11);
    let data = res.read_payload(a.id, 0, 100, None).unwrap();
    assert_eq!(&data[..], b"hello depot");
    assert_eq!(res.history(a.id).unwrap().write.len(), 1);
    res.unmount().unwrap();
}

#[test]
fn test_unclean_shutdown_rebuilds_from_headers() {
    let dir = TempDir::new().unwrap();
    let opts = MountOptions::default().without_janitor();

    let res = Resource::mount_dir(dir_config(&dir), opts).unwrap();
    let mut ids = Vec::new();
    for (size, rel) in [(100, Reliability::Soft), (200, Reliability::Hard), (300, Reliability::Hard)] {
        ids.push(res.create(&CreateRequest::new(size, rel, 3600)).unwrap().id);
    }
    res.store().flush().unwrap();
    drop(res);

    let snapshot = UsageSnapshot::read(&DirDevice::open(dir.path()).unwrap()).unwrap();
    assert!(!snapshot.is_clean());

    let res = Resource::mount_dir(dir_config(&dir), opts).unwrap();
    let c = res.counters();
    assert_eq!(c.n_allocs, 3);
    assert_eq!(c.used(Reliability::Soft), 100);
    assert_eq!(c.used(Reliability::Hard), 500);
    for id in ids {
        assert!(res.get_by_id(id).is_ok());
    }
    res.unmount().unwrap();
}

#[test]
fn test_forced_repair_keeps_records() {
    let dir = TempDir::new().unwrap();
    let opts = MountOptions::default().without_janitor();

    let res = Resource::mount_dir(dir_config(&dir), opts).unwrap();
    let a = res
        .create(&CreateRequest::new(10, Reliability::Soft, 3600))
        .unwrap();
    res.unmount().unwrap();
    drop(res);

    let res = Resource::mount_dir(
        dir_config(&dir),
        opts.with_rebuild(RebuildMode::RepairIndices),
    )
    .unwrap();
    assert_eq!(res.get_by_cap(CapKind::Manage, &a.caps.manage).unwrap().id, a.id);
    assert_eq!(res.store().index_len(IndexKind::BySoft), 1);
    assert_eq!(res.counters().used(Reliability::Soft), 10);
    res.unmount().unwrap();
}

fn index_contents(res: &Resource) -> Vec<Vec<AllocationRecord>> {
    [
        IndexKind::ById,
        IndexKind::ByReadCap,
        IndexKind::ByWriteCap,
        IndexKind::ByManageCap,
        IndexKind::ByExpire,
        IndexKind::BySoft,
    ]
    .into_iter()
    .map(|index| {
        let mut cursor = res.store().iterate(index, Direction::Next);
        let mut records = Vec::new();
        loop {
            let batch = cursor.next_batch(64).unwrap();
            if batch.is_empty() {
                break;
            }
            records.extend(batch);
        }
        records
    })
    .collect()
}

#[test]
fn test_repair_indices_twice_is_stable() {
    let (res, _clock) = memory_resource(limits(1 << 20, 1 << 20, 1 << 20));
    for (size, rel) in [(10, Reliability::Soft), (20, Reliability::Hard), (30, Reliability::Soft)] {
        res.create(&CreateRequest::new(size, rel, 60)).unwrap();
    }
    res.create(&CreateRequest::alias(60)).unwrap();

    let first = res.rebuild(RebuildMode::RepairIndices, false).unwrap();
    let counters = res.counters();
    let indices = index_contents(&res);

    let second = res.rebuild(RebuildMode::RepairIndices, false).unwrap();
    assert_eq!(second, first);
    assert_eq!(res.counters(), counters);
    assert_eq!(index_contents(&res), indices);

    assert_eq!((first.added, first.aliases), (4, 1));
    let lens: Vec<usize> = indices.iter().map(Vec::len).collect();
    assert_eq!(lens, vec![4, 4, 4, 4, 4, 2]);
}

#[test]
fn test_split_merge_and_trash_on_disk() {
    let dir = TempDir::new().unwrap();
    let res = Resource::mount_dir(
        dir_config(&dir),
        MountOptions::default().without_janitor(),
    )
    .unwrap();

    let master = res
        .create(&CreateRequest::new(10_000, Reliability::Hard, 3600))
        .unwrap();
    let child = res
        .split(master.id, &CreateRequest::new(4000, Reliability::Hard, 600))
        .unwrap();
    assert_eq!(res.get_by_id(master.id).unwrap().max_size, 6000);

    let merged = res.merge(master.id, child.id).unwrap();
    assert_eq!(merged.max_size, 10_000);
    assert_eq!(res.counters().used(Reliability::Hard), 10_000);
    assert_eq!(res.trash_list(TrashKind::Delete).unwrap().len(), 1);

    res.remove(RemoveMode::Trash(TrashKind::Delete), master.id)
        .unwrap();
    assert_eq!(res.counters().n_allocs, 0);
    assert_eq!(res.trash_list(TrashKind::Delete).unwrap().len(), 2);
    res.unmount().unwrap();
}

#[test]
fn test_janitor_runs_on_mount() {
    let clock = Arc::new(ManualClock::new(T0));
    let res = Resource::mount(
        ResourceConfig::new("jan", "/unused")
            .with_max_duration(1000)
            .with_preexpire_grace(0)
            .with_limits(limits(1 << 20, 1 << 20, 1 << 20)),
        Arc::new(MemoryDevice::new()),
        AllocationStore::open_temporary().unwrap(),
        clock.clone(),
        MountOptions::default(),
    )
    .unwrap();
    let a = res
        .create(&CreateRequest::new(10, Reliability::Soft, 1))
        .unwrap();

    clock.set(T0 + 5);
    res.rescan();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while res.store().get(a.id).unwrap().is_some() && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert!(res.store().get(a.id).unwrap().is_none());
    assert_eq!(res.trash_list(TrashKind::Expire).unwrap().len(), 1);
    res.unmount().unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Create { size: u64, soft: bool, duration: u64 },
    Remove(usize),
    Advance(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u64..400, any::<bool>(), 1u64..40)
            .prop_map(|(size, soft, duration)| Op::Create { size, soft, duration }),
        1 => (0usize..16).prop_map(Op::Remove),
        1 => (0u64..15).prop_map(Op::Advance),
    ]
}

fn expire_keys(res: &Resource, direction: Direction) -> Vec<(u64, u64)> {
    let mut cursor = res.store().iterate(IndexKind::ByExpire, direction);
    let mut keys = Vec::new();
    loop {
        let batch = cursor.next_batch(7).unwrap();
        if batch.is_empty() {
            break;
        }
        keys.extend(batch.iter().map(|a| (a.expiration, a.id.as_u64())));
    }
    keys
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_quota_and_time_order_hold(ops in proptest::collection::vec(op(), 1..40)) {
        let lim = limits(1000, 600, 700);
        let (res, clock) = memory_resource(lim);
        let mut live: Vec<AllocationRecord> = Vec::new();

        for op in ops {
            match op {
                Op::Create { size, soft, duration } => {
                    let rel = if soft { Reliability::Soft } else { Reliability::Hard };
                    match res.create(&CreateRequest::new(size, rel, duration)) {
                        Ok(a) => live.push(a),
                        Err(e) => prop_assert!(e.is_out_of_space()),
                    }
                }
                Op::Remove(i) => {
                    if !live.is_empty() {
                        let a = live.remove(i % live.len());
                        let _ = res.remove(RemoveMode::Trash(TrashKind::Delete), a.id);
                    }
                }
                Op::Advance(secs) => clock.advance(secs),
            }

            let c = res.counters();
            prop_assert!(c.used(Reliability::Soft) <= lim.max_soft);
            prop_assert!(c.used(Reliability::Hard) <= lim.max_hard);
            prop_assert!(c.used_total() <= lim.max_total);
            prop_assert_eq!(c.n_allocs as usize, res.store().len());

            let forward = expire_keys(&res, Direction::Next);
            prop_assert!(forward.windows(2).all(|w| w[0] <= w[1]));
            let mut backward = expire_keys(&res, Direction::Prev);
            backward.reverse();
            prop_assert_eq!(forward, backward);
        }
    }
}
