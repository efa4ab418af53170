//! Module `dms` implement the DeltaMemStore: the in-memory, ordered
//! store of fresh REDO deltas for one DiskRowSet.

use std::sync::Arc;

use crate::{
    delta::{DeltaKey, DeltaStats, RowChange},
    mdb::Mdb,
    mvcc::Timestamp,
    schema::Schema,
    util::Spinlock,
    LogIndex, Result, RowId,
};

/// In-memory REDO store keyed by `(row_id, timestamp)`. Concurrent
/// readers iterate copy-on-write snapshots; the write path serializes
/// behind the index's writer lock.
pub struct DeltaMemStore {
    index: Mdb<Vec<u8>, Vec<u8>>,
    state: Spinlock<DmsState>,
    created: std::time::Instant,
}

#[derive(Clone, Default)]
struct DmsState {
    stats: DeltaStats,
    /// Lowest WAL index whose mutations live only here.
    min_log_index: Option<LogIndex>,
}

impl DeltaMemStore {
    pub fn new(name: &str) -> DeltaMemStore {
        DeltaMemStore {
            index: Mdb::new(name),
            state: Spinlock::new(DmsState::default()),
            created: std::time::Instant::now(),
        }
    }

    /// Record a mutation against `row_id` at `ts`.
    pub fn add(
        &self,
        schema: &Schema,
        row_id: RowId,
        ts: Timestamp,
        log_index: LogIndex,
        change: &RowChange,
    ) -> Result<()> {
        let key = DeltaKey::new(row_id, ts).encode();
        let value = change.encode(schema)?;
        self.index.set(key, value)?;

        let mut state = self.state.write();
        state.stats.note(ts, change);
        state.min_log_index = Some(match state.min_log_index {
            Some(idx) => idx.min(log_index),
            None => log_index,
        });
        Ok(())
    }

    /// All deltas for `row_id`, timestamp ascending.
    pub fn deltas_for_row(
        &self,
        schema: &Schema,
        row_id: RowId,
    ) -> Result<Vec<(Timestamp, RowChange)>> {
        let lo = DeltaKey::new(row_id, Timestamp::MIN).encode();
        let hi = DeltaKey::new(row_id, Timestamp::MAX).encode();

        let mut deltas = vec![];
        for (key, value) in self.index.range(lo..=hi) {
            let key = DeltaKey::decode(&key)?;
            deltas.push((key.ts, RowChange::decode(schema, &value)?));
        }
        Ok(deltas)
    }

    /// Deltas of every row in `[start_row, end_row)`, key ascending.
    pub fn deltas_in_range(
        &self,
        schema: &Schema,
        start_row: RowId,
        end_row: RowId,
    ) -> Result<Vec<(DeltaKey, RowChange)>> {
        let lo = DeltaKey::new(start_row, Timestamp::MIN).encode();
        let hi = DeltaKey::new(end_row, Timestamp::MIN).encode();

        let mut deltas = vec![];
        for (key, value) in self.index.range(lo..hi) {
            let key = DeltaKey::decode(&key)?;
            deltas.push((key, RowChange::decode(schema, &value)?));
        }
        Ok(deltas)
    }

    /// Snapshot iteration over every delta, key ascending.
    pub fn iter(
        &self,
        schema: Arc<Schema>,
    ) -> impl Iterator<Item = Result<(DeltaKey, RowChange)>> {
        self.index.iter().map(move |(key, value)| {
            let key = DeltaKey::decode(&key)?;
            let change = RowChange::decode(&schema, &value)?;
            Ok((key, change))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Bytes anchored in memory by this store.
    pub fn ram_anchored(&self) -> usize {
        self.index.footprint()
    }

    pub fn to_stats(&self) -> DeltaStats {
        self.state.read().stats.clone()
    }

    pub fn min_log_index(&self) -> Option<LogIndex> {
        self.state.read().min_log_index
    }

    /// Seconds since this store was created.
    pub fn age_secs(&self) -> u64 {
        self.created.elapsed().as_secs()
    }
}

#[cfg(test)]
#[path = "dms_test.rs"]
mod dms_test;
