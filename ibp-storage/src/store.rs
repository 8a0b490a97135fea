//! Multi-index allocation store
//!
//! One primary sled tree keyed by id holds the records. Five secondary trees
//! are pure projections of the primary record: three capability indices and
//! the time-ordered expire and soft indices keyed by `(expiration, id)`.
//! Every mutation touching more than one tree runs inside a single sled
//! transaction, so partial index updates are never observable.

use ibp_core::{AllocationId, AllocationRecord, CapKind, Capability, IbpError, Result, TimeKey};
use parking_lot::{Mutex, MutexGuard};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree, Transactional,
};
use sled::{IVec, Tree};
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// Guard returned by [`AllocationStore::lock`]
pub type StoreGuard<'a> = MutexGuard<'a, ()>;

/// Index selector for iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    ById,
    ByReadCap,
    ByWriteCap,
    ByManageCap,
    ByExpire,
    BySoft,
}

impl IndexKind {
    pub fn for_cap(kind: CapKind) -> Self {
        match kind {
            CapKind::Read => IndexKind::ByReadCap,
            CapKind::Write => IndexKind::ByWriteCap,
            CapKind::Manage => IndexKind::ByManageCap,
        }
    }
}

/// Iteration direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

/// Sled-backed allocation store
pub struct AllocationStore {
    db: sled::Db,
    allocs: Tree,
    read_cap: Tree,
    write_cap: Tree,
    manage_cap: Tree,
    expire: Tree,
    soft: Tree,

    /// Serializes multi-step sequences and cursor batches
    lock: Mutex<()>,
}

impl AllocationStore {
    /// Open or create a store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening allocation store");

        let db = sled::open(path.as_ref())
            .map_err(|e| IbpError::Index(format!("Failed to open Sled: {}", e)))?;
        Self::with_db(db)
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| IbpError::Index(format!("Failed to open Sled: {}", e)))?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> Result<Self> {
        let tree = |name: &str| db.open_tree(name).map_err(db_err);
        Ok(Self {
            allocs: tree("allocs")?,
            read_cap: tree("read_cap")?,
            write_cap: tree("write_cap")?,
            manage_cap: tree("manage_cap")?,
            expire: tree("expire")?,
            soft: tree("soft")?,
            lock: Mutex::new(()),
            db,
        })
    }

    /// Hold the store lock across a multi-step sequence
    pub fn lock(&self) -> StoreGuard<'_> {
        self.lock.lock()
    }

    /// Auxiliary tree in the same database
    pub fn tree(&self, name: &str) -> Result<Tree> {
        self.db.open_tree(name).map_err(db_err)
    }

    fn index_tree(&self, index: IndexKind) -> &Tree {
        match index {
            IndexKind::ById => &self.allocs,
            IndexKind::ByReadCap => &self.read_cap,
            IndexKind::ByWriteCap => &self.write_cap,
            IndexKind::ByManageCap => &self.manage_cap,
            IndexKind::ByExpire => &self.expire,
            IndexKind::BySoft => &self.soft,
        }
    }

    // ===== Record Operations =====

    /// Insert or replace a record and every index entry derived from it
    pub fn put(&self, record: &AllocationRecord) -> Result<()> {
        self.put_batch(std::slice::from_ref(record))
    }

    /// Insert or replace several records in one transaction
    pub fn put_batch(&self, records: &[AllocationRecord]) -> Result<()> {
        let encoded = records
            .iter()
            .map(|r| bincode::serialize(r).map_err(IbpError::from))
            .collect::<Result<Vec<_>>>()?;

        (
            &self.allocs,
            &self.read_cap,
            &self.write_cap,
            &self.manage_cap,
            &self.expire,
            &self.soft,
        )
            .transaction(|(allocs, rc, wc, mc, exp, soft)| {
                let caps = [rc, wc, mc];
                for (record, bytes) in records.iter().zip(&encoded) {
                    let key = record.id.to_key();

                    if let Some(old) = allocs.get(key)? {
                        let old = decode_record(&old).map_err(ConflictableTransactionError::Abort)?;
                        unlink(&old, &caps, exp, soft)?;
                    }

                    for (tree, kind) in caps.iter().zip(CapKind::ALL) {
                        let cap = record.caps.get(kind);
                        if cap.is_empty() {
                            continue;
                        }
                        if let Some(owner) = tree.get(cap.as_bytes())? {
                            if owner.as_ref() != key.as_slice() {
                                return Err(ConflictableTransactionError::Abort(IbpError::Index(
                                    format!("{} capability of {} already in use", kind, record.id),
                                )));
                            }
                        }
                        tree.insert(cap.as_bytes(), &key[..])?;
                    }

                    exp.insert(&record.expire_key().to_bytes()[..], &key[..])?;
                    if let Some(sk) = record.soft_key() {
                        soft.insert(&sk.to_bytes()[..], &key[..])?;
                    }
                    allocs.insert(&key[..], bytes.as_slice())?;
                }
                Ok(())
            })
            .map_err(tx_err)?;

        trace!(count = records.len(), "Stored allocation records");
        Ok(())
    }

    /// Fetch by id
    pub fn get(&self, id: AllocationId) -> Result<Option<AllocationRecord>> {
        match self.allocs.get(id.to_key()).map_err(db_err)? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch by id, failing with `NotFound`
    pub fn get_by_id(&self, id: AllocationId) -> Result<AllocationRecord> {
        self.get(id)?.ok_or_else(|| IbpError::missing_id(id))
    }

    /// Fetch through a capability index
    pub fn get_by_cap(&self, kind: CapKind, cap: &Capability) -> Result<AllocationRecord> {
        let tree = self.index_tree(IndexKind::for_cap(kind));
        let id = tree
            .get(cap.as_bytes())
            .map_err(db_err)?
            .ok_or_else(|| IbpError::NotFound(format!("{} capability", kind)))?;
        self.get_by_id(AllocationId::from_key(&id)?)
    }

    /// Delete a record and all of its index entries
    pub fn remove(&self, id: AllocationId) -> Result<AllocationRecord> {
        let removed = (
            &self.allocs,
            &self.read_cap,
            &self.write_cap,
            &self.manage_cap,
            &self.expire,
            &self.soft,
        )
            .transaction(|(allocs, rc, wc, mc, exp, soft)| {
                let old = match allocs.remove(&id.to_key()[..])? {
                    Some(bytes) => decode_record(&bytes).map_err(ConflictableTransactionError::Abort)?,
                    None => {
                        return Err(ConflictableTransactionError::Abort(IbpError::missing_id(id)))
                    }
                };
                unlink(&old, &[rc, wc, mc], exp, soft)?;
                Ok(old)
            })
            .map_err(tx_err)?;

        debug!(id = %id, "Removed allocation record");
        Ok(removed)
    }

    // ===== Maintenance =====

    /// Number of records in the primary index
    pub fn len(&self) -> usize {
        self.allocs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocs.is_empty()
    }

    /// Number of entries in one index
    pub fn index_len(&self, index: IndexKind) -> usize {
        self.index_tree(index).len()
    }

    /// Drop every record and index entry
    pub fn wipe(&self) -> Result<()> {
        let _guard = self.lock();
        for index in ALL_INDICES {
            self.index_tree(index).clear().map_err(db_err)?;
        }
        info!("Wiped allocation store");
        Ok(())
    }

    /// Re-derive the secondary indices from the primary one
    pub fn rebuild_indices(&self) -> Result<usize> {
        {
            let _guard = self.lock();
            for index in &ALL_INDICES[1..] {
                self.index_tree(*index).clear().map_err(db_err)?;
            }
        }

        let mut cursor = self.iterate(IndexKind::ById, Direction::Next);
        let mut total = 0;
        loop {
            let batch = cursor.next_batch(ibp_core::REBUILD_BATCH)?;
            if batch.is_empty() {
                break;
            }
            total += batch.len();
            self.put_batch(&batch)?;
        }

        info!(records = total, "Rebuilt secondary indices");
        Ok(total)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(db_err)?;
        Ok(())
    }

    /// Open a cursor over an index
    pub fn iterate(&self, index: IndexKind, direction: Direction) -> Cursor<'_> {
        Cursor {
            store: self,
            index,
            direction,
            position: Position::Start,
        }
    }
}

const ALL_INDICES: [IndexKind; 6] = [
    IndexKind::ById,
    IndexKind::ByReadCap,
    IndexKind::ByWriteCap,
    IndexKind::ByManageCap,
    IndexKind::ByExpire,
    IndexKind::BySoft,
];

/// Remove the secondary entries derived from `old`
fn unlink(
    old: &AllocationRecord,
    caps: &[&TransactionalTree; 3],
    exp: &TransactionalTree,
    soft: &TransactionalTree,
) -> std::result::Result<(), ConflictableTransactionError<IbpError>> {
    let key = old.id.to_key();
    for (tree, kind) in caps.iter().zip(CapKind::ALL) {
        let cap = old.caps.get(kind);
        if cap.is_empty() {
            continue;
        }
        // Only drop the entry if it still points at this record
        if let Some(owner) = tree.get(cap.as_bytes())? {
            if owner.as_ref() == key.as_slice() {
                tree.remove(cap.as_bytes())?;
            }
        }
    }
    exp.remove(&old.expire_key().to_bytes()[..])?;
    if let Some(sk) = old.soft_key() {
        soft.remove(&sk.to_bytes()[..])?;
    }
    Ok(())
}

fn decode_record(bytes: &[u8]) -> Result<AllocationRecord> {
    Ok(bincode::deserialize(bytes)?)
}

fn db_err(e: sled::Error) -> IbpError {
    IbpError::Index(e.to_string())
}

fn tx_err(e: TransactionError<IbpError>) -> IbpError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => db_err(e),
    }
}

#[derive(Debug, Clone)]
enum Position {
    /// Nothing returned yet
    Start,
    /// Resume at this key, inclusive
    At(IVec),
    /// Resume past this key, the last one returned
    After(IVec),
    /// No more entries
    End,
}

/// Batched cursor over one index
///
/// The store lock is held only while a batch is read, never between calls,
/// so callers may mutate the store between batches. The cursor resumes from
/// the last key it returned.
pub struct Cursor<'a> {
    store: &'a AllocationStore,
    index: IndexKind,
    direction: Direction,
    position: Position,
}

impl<'a> Cursor<'a> {
    /// Position at the first key at or after `key`
    ///
    /// In `Prev` direction iteration then proceeds backwards from that key;
    /// when no such key exists it starts at the end of the index.
    pub fn seek_range_ge(&mut self, key: &[u8]) -> Result<()> {
        let _guard = self.store.lock();
        let tree = self.store.index_tree(self.index);
        self.position = match tree.range(key..).next() {
            Some(item) => Position::At(item.map_err(db_err)?.0),
            None => match self.direction {
                Direction::Next => Position::End,
                Direction::Prev => Position::Start,
            },
        };
        Ok(())
    }

    /// Seek a time-ordered index to `(expiration, 0)`
    pub fn seek_time(&mut self, expiration: u64) -> Result<()> {
        self.seek_range_ge(&TimeKey::at(expiration).to_bytes())
    }

    /// Next record, or `None` when exhausted
    pub fn next(&mut self) -> Result<Option<AllocationRecord>> {
        Ok(self.next_batch(1)?.pop())
    }

    /// Up to `n` records in cursor order
    pub fn next_batch(&mut self, n: usize) -> Result<Vec<AllocationRecord>> {
        if matches!(self.position, Position::End) || n == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.store.lock();
        let tree = self.store.index_tree(self.index);
        let iter: Box<dyn Iterator<Item = sled::Result<(IVec, IVec)>>> =
            match (&self.position, self.direction) {
                (Position::Start, Direction::Next) => Box::new(tree.iter()),
                (Position::Start, Direction::Prev) => Box::new(tree.iter().rev()),
                (Position::At(k), Direction::Next) => Box::new(tree.range(k.clone()..)),
                (Position::At(k), Direction::Prev) => Box::new(tree.range(..=k.clone()).rev()),
                (Position::After(k), Direction::Next) => Box::new(tree.range((
                    std::ops::Bound::Excluded(k.clone()),
                    std::ops::Bound::Unbounded,
                ))),
                (Position::After(k), Direction::Prev) => Box::new(tree.range(..k.clone()).rev()),
                (Position::End, _) => return Ok(Vec::new()),
            };

        let mut out = Vec::with_capacity(n.min(1024));
        let mut last = None;
        for item in iter.take(n) {
            let (key, value) = item.map_err(db_err)?;
            let record = match self.index {
                IndexKind::ById => Some(decode_record(&value)?),
                _ => {
                    let id = AllocationId::from_key(&value)?;
                    let record = self.store.get(id)?;
                    if record.is_none() {
                        warn!(id = %id, index = ?self.index, "Index entry without primary record");
                    }
                    record
                }
            };
            last = Some(key);
            out.extend(record);
        }

        self.position = match last {
            Some(k) => Position::After(k),
            None => Position::End,
        };
        trace!(index = ?self.index, count = out.len(), "Cursor batch");
        Ok(out)
    }
}
