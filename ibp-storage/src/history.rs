//! Per-allocation access history
//!
//! Each allocation keeps three bounded rings of recent events (read, write,
//! manage) in a dedicated tree of the store's database. History is
//! best-effort: failures are logged and never fail the operation that
//! produced the event.

use crate::store::AllocationStore;
use ibp_core::{AllocationId, IbpError, Reliability, ResourceConfig, Result};
use serde::{Deserialize, Serialize};
use sled::Tree;
use tracing::{trace, warn};

/// Events kept per ring
pub const HISTORY_DEPTH: usize = 16;

const HISTORY_TREE: &str = "history";

/// Management operation recorded in the manage ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManageOp {
    Create,
    Split,
    Merge,
    Rename,
    Modify,
    Undelete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Read {
        offset: u64,
        len: u64,
    },
    Write {
        offset: u64,
        len: u64,
    },
    Manage {
        op: ManageOp,
        reliability: Reliability,
        expiration: u64,
        max_size: u64,
    },
}

/// One history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub time: u64,
    /// Remote peer, when the caller knows it
    pub client: Option<String>,
    pub kind: EventKind,
}

impl HistoryEvent {
    pub fn read(time: u64, client: Option<&str>, offset: u64, len: u64) -> Self {
        Self::new(time, client, EventKind::Read { offset, len })
    }

    pub fn write(time: u64, client: Option<&str>, offset: u64, len: u64) -> Self {
        Self::new(time, client, EventKind::Write { offset, len })
    }

    pub fn manage(
        time: u64,
        client: Option<&str>,
        op: ManageOp,
        reliability: Reliability,
        expiration: u64,
        max_size: u64,
    ) -> Self {
        Self::new(
            time,
            client,
            EventKind::Manage {
                op,
                reliability,
                expiration,
                max_size,
            },
        )
    }

    fn new(time: u64, client: Option<&str>, kind: EventKind) -> Self {
        Self {
            time,
            client: client.map(str::to_string),
            kind,
        }
    }
}

/// The three rings of one allocation, oldest event first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTable {
    pub read: Vec<HistoryEvent>,
    pub write: Vec<HistoryEvent>,
    pub manage: Vec<HistoryEvent>,
}

impl HistoryTable {
    fn push(&mut self, event: HistoryEvent) {
        let ring = match event.kind {
            EventKind::Read { .. } => &mut self.read,
            EventKind::Write { .. } => &mut self.write,
            EventKind::Manage { .. } => &mut self.manage,
        };
        if ring.len() == HISTORY_DEPTH {
            ring.remove(0);
        }
        ring.push(event);
    }
}

/// History storage of one resource
pub struct AllocationHistory {
    tree: Tree,
    read: bool,
    write: bool,
    manage: bool,
    alias: bool,
}

impl AllocationHistory {
    pub fn open(store: &AllocationStore, config: &ResourceConfig) -> Result<Self> {
        Ok(Self {
            tree: store.tree(HISTORY_TREE)?,
            read: config.enable_read_history,
            write: config.enable_write_history,
            manage: config.enable_manage_history,
            alias: config.enable_alias_history,
        })
    }

    /// Whether aliases keep an on-device object and history
    pub fn alias_enabled(&self) -> bool {
        self.alias
    }

    /// Start an empty table for a new allocation
    pub fn blank(&self, id: AllocationId, is_alias: bool) {
        if is_alias && !self.alias {
            return;
        }
        let table = HistoryTable::default();
        let stored = bincode::serialize(&table)
            .map_err(IbpError::from)
            .and_then(|bytes| {
                self.tree
                    .insert(id.to_key(), bytes)
                    .map_err(|e| IbpError::Index(e.to_string()))
            });
        if let Err(e) = stored {
            warn!(id = %id, error = %e, "Failed to blank history");
        }
    }

    /// Append an event to its ring
    pub fn record(&self, id: AllocationId, is_alias: bool, event: HistoryEvent) {
        let enabled = match event.kind {
            EventKind::Read { .. } => self.read,
            EventKind::Write { .. } => self.write,
            EventKind::Manage { .. } => self.manage,
        };
        if !enabled || (is_alias && !self.alias) {
            return;
        }

        let result = self.tree.update_and_fetch(id.to_key(), |old| {
            let mut table: HistoryTable = old
                .and_then(|bytes| bincode::deserialize(bytes).ok())
                .unwrap_or_default();
            table.push(event.clone());
            bincode::serialize(&table).ok()
        });
        match result {
            Ok(_) => trace!(id = %id, "Recorded history event"),
            Err(e) => warn!(id = %id, error = %e, "Failed to record history"),
        }
    }

    /// Stored table, empty when the allocation has none
    pub fn get(&self, id: AllocationId) -> Result<HistoryTable> {
        match self
            .tree
            .get(id.to_key())
            .map_err(|e| IbpError::Index(e.to_string()))?
        {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(HistoryTable::default()),
        }
    }

    /// Forget an allocation's history
    pub fn drop_table(&self, id: AllocationId) {
        if let Err(e) = self.tree.remove(id.to_key()) {
            warn!(id = %id, error = %e, "Failed to drop history");
        }
    }
}
