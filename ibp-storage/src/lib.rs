//! IBP Depot Storage Engine
//!
//! Turns an object device into a pool of capability-addressed,
//! quota-bounded, expiring allocations:
//! - `ObjectDevice` trait with `DirDevice` for production and `MemoryDevice` for testing
//! - `AllocationStore`, a sled-backed multi-index store
//! - `Resource`, the per-device manager: lifecycle operations, space reclaim,
//!   background janitor and rebuild
//! - `ResourceList` for the resources of one depot

pub mod device;
pub mod dir_device;
pub mod header;
pub mod history;
pub mod janitor;
mod lifecycle;
pub mod memory;
pub mod rebuild;
pub mod reclaim;
pub mod resource;
pub mod resource_list;
pub mod store;
pub mod usage;
pub mod walk;

pub use device::{DeviceStats, ObjectDevice, RemoveMode, TrashEntry, TrashKind};
pub use dir_device::DirDevice;
pub use history::{HistoryEvent, HistoryTable, ManageOp};
pub use memory::{Fault, MemoryDevice};
pub use rebuild::{RebuildMode, RebuildReport};
pub use reclaim::SpaceRequest;
pub use resource::{Counters, CreateRequest, MountOptions, Resource, ResourceUsage};
pub use resource_list::ResourceList;
pub use store::{AllocationStore, Cursor, Direction, IndexKind};
pub use usage::{UsageSnapshot, UsageState};
pub use walk::ExpireWalk;
