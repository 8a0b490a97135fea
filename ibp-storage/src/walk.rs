//! Merged walk over the two time-ordered indices
//!
//! Yields records from `ByExpire` and `BySoft` in one ascending
//! `(expiration, id)` stream. A record present in both indices is returned
//! once.

use crate::store::{AllocationStore, Cursor, Direction, IndexKind};
use ibp_core::{AllocationRecord, Result};
use std::collections::VecDeque;

/// Records pulled per index refill
const WALK_BATCH: usize = 128;

struct Stream<'a> {
    cursor: Cursor<'a>,
    buffered: VecDeque<AllocationRecord>,
    exhausted: bool,
}

impl<'a> Stream<'a> {
    fn new(store: &'a AllocationStore, index: IndexKind, start: u64) -> Result<Self> {
        let mut cursor = store.iterate(index, Direction::Next);
        cursor.seek_time(start)?;
        Ok(Self {
            cursor,
            buffered: VecDeque::new(),
            exhausted: false,
        })
    }

    fn peek(&mut self) -> Result<Option<&AllocationRecord>> {
        if self.buffered.is_empty() && !self.exhausted {
            let batch = self.cursor.next_batch(WALK_BATCH)?;
            self.exhausted = batch.is_empty();
            self.buffered.extend(batch);
        }
        Ok(self.buffered.front())
    }
}

/// Ascending walk over expire and soft entries from a start time
pub struct ExpireWalk<'a> {
    expire: Stream<'a>,
    soft: Stream<'a>,
}

impl<'a> ExpireWalk<'a> {
    pub fn new(store: &'a AllocationStore, start: u64) -> Result<Self> {
        Ok(Self {
            expire: Stream::new(store, IndexKind::ByExpire, start)?,
            soft: Stream::new(store, IndexKind::BySoft, start)?,
        })
    }

    /// Next record in time order
    pub fn next(&mut self) -> Result<Option<AllocationRecord>> {
        let e = self.expire.peek()?.map(AllocationRecord::expire_key);
        let s = self.soft.peek()?.map(AllocationRecord::expire_key);

        let (from_expire, from_soft) = match (e, s) {
            (None, None) => return Ok(None),
            (Some(_), None) => (true, false),
            (None, Some(_)) => (false, true),
            (Some(e), Some(s)) => (e <= s, s <= e),
        };

        let mut out = None;
        if from_expire {
            out = self.expire.buffered.pop_front();
        }
        if from_soft {
            let soft = self.soft.buffered.pop_front();
            out = out.or(soft);
        }
        Ok(out)
    }

    /// Up to `n` records in time order
    pub fn next_batch(&mut self, n: usize) -> Result<Vec<AllocationRecord>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.next()? {
                Some(a) => out.push(a),
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibp_core::{capability, AllocationId, Reliability};

    fn put(store: &AllocationStore, id: u64, rel: Reliability, exp: u64) {
        let mut a = AllocationRecord::new(AllocationId::new(id), rel, 10, exp);
        a.caps = capability::generate();
        store.put(&a).unwrap();
    }

    #[test]
    fn test_merged_walk_is_ordered_and_deduplicated() {
        let store = AllocationStore::open_temporary().unwrap();
        put(&store, 2, Reliability::Soft, 30);
        put(&store, 3, Reliability::Hard, 10);
        put(&store, 4, Reliability::Soft, 20);
        put(&store, 5, Reliability::Hard, 20);

        let mut walk = ExpireWalk::new(&store, 0).unwrap();
        let keys: Vec<(u64, u64)> = walk
            .next_batch(100)
            .unwrap()
            .iter()
            .map(|a| (a.expiration, a.id.as_u64()))
            .collect();
        assert_eq!(keys, vec![(10, 3), (20, 4), (20, 5), (30, 2)]);
    }

    #[test]
    fn test_walk_from_start_time() {
        let store = AllocationStore::open_temporary().unwrap();
        for id in 2..10 {
            put(&store, id, Reliability::Soft, id * 10);
        }
        let mut walk = ExpireWalk::new(&store, 55).unwrap();
        let first = walk.next().unwrap().unwrap();
        assert_eq!(first.expiration, 60);
        assert_eq!(walk.next_batch(100).unwrap().len(), 3);
        assert!(walk.next().unwrap().is_none());
    }
}
