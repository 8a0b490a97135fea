//! IBP Depot Core Library
//!
//! Shared types for the depot storage engine.
//! This crate provides:
//! - Allocation records, ids and time-ordered index keys
//! - Capability generation (read/write/manage tokens)
//! - Resource configuration loaded from TOML
//! - A clock abstraction for expirations
//! - Common error handling

pub mod allocation;
pub mod capability;
pub mod clock;
pub mod config;
pub mod error;

pub use allocation::{
    AllocationId, AllocationRecord, AllocationType, CapKind, Capabilities, Capability,
    ChecksumOptions, RefState, Reliability, TimeKey, ALLOC_HEADER, USAGE_ID,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ResourceConfig, ResourceLimits, ResourceMode};
pub use error::{IbpError, Result};

/// Records buffered per store write during a rebuild
pub const REBUILD_BATCH: usize = 1024;

/// Allocations trashed per janitor cleanup batch
pub const CLEANUP_BATCH: usize = 100;
