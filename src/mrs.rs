//! Module `mrs` implement the MemRowSet: the in-memory, ordered,
//! writable rowset receiving inserts, keyed by encoded primary key.
//!
//! Each entry holds the insert image plus a mutation chain ordered by
//! timestamp ascending. Readers resolve an entry against an MVCC
//! snapshot; writers append to the chain through the copy-on-write
//! index, so a snapshot taken before a mutation keeps seeing the
//! pre-mutation chain.

use std::time;

use crate::{
    delta::{apply_change, RowChange, RowState},
    mdb::{Footprint, Iter, Mdb},
    mvcc::{Snapshot, Timestamp},
    row::Value,
    schema::Schema,
    util::Spinlock,
    Error, LogIndex, Result,
};

/// One mutation hanging off a MemRowSet entry.
#[derive(Clone, Debug)]
pub struct Mutation {
    pub ts: Timestamp,
    pub op_id: LogIndex,
    pub change: RowChange,
}

/// A MemRowSet entry: the insert image and its mutation chain.
#[derive(Clone, Debug)]
pub struct RowEntry {
    pub insert_ts: Timestamp,
    pub insert_op: LogIndex,
    pub cells: Vec<Value>,
    pub chain: Vec<Mutation>,
}

impl RowEntry {
    /// Latest state of the entry, no snapshot filtering.
    pub fn is_deleted_at_tail(&self) -> bool {
        for mutation in self.chain.iter().rev() {
            match mutation.change {
                RowChange::Delete => return true,
                RowChange::Reinsert { .. } => return false,
                RowChange::Update { .. } => (),
            }
        }
        false
    }
}

fn value_footprint(value: &Value) -> usize {
    let heap = match value {
        Value::String(val) => val.capacity(),
        Value::Binary(val) => val.capacity(),
        Value::Array(vals) => vals.iter().map(value_footprint).sum(),
        _ => 0,
    };
    std::mem::size_of::<Value>() + heap
}

impl Footprint for RowEntry {
    fn footprint(&self) -> usize {
        let cells: usize = self.cells.iter().map(value_footprint).sum();
        let chain: usize = self
            .chain
            .iter()
            .map(|m| {
                std::mem::size_of::<Mutation>()
                    + match &m.change {
                        RowChange::Update { cols } => cols
                            .iter()
                            .map(|(_, v)| v.as_ref().map(value_footprint).unwrap_or(0))
                            .sum(),
                        RowChange::Delete => 0,
                        RowChange::Reinsert { cells } => {
                            cells.iter().map(value_footprint).sum()
                        }
                    }
            })
            .sum();
        std::mem::size_of::<Self>() + cells + chain
    }
}

#[derive(Clone, Copy, Default)]
struct MrsState {
    min_log_index: Option<LogIndex>,
    /// Approximate WAL bytes that would need replay if the process
    /// crashed now.
    log_replay_size: u64,
}

/// In-memory rowset; the destination of all inserts.
pub struct MemRowSet {
    index: Mdb<Vec<u8>, RowEntry>,
    state: Spinlock<MrsState>,
    created: time::Instant,
}

impl MemRowSet {
    pub fn new(name: &str) -> MemRowSet {
        MemRowSet {
            index: Mdb::new(name),
            state: Spinlock::new(MrsState::default()),
            created: time::Instant::now(),
        }
    }

    pub fn to_name(&self) -> String {
        self.index.to_name()
    }

    /// Insert a fresh row. When the key is already present:
    ///
    /// * entry deleted at its tail: the insert becomes a REINSERT
    ///   mutation on the chain;
    /// * entry live: fail with [Error::AlreadyPresent].
    pub fn insert(
        &self,
        key: Vec<u8>,
        cells: Vec<Value>,
        ts: Timestamp,
        op_id: LogIndex,
        op_bytes: u64,
    ) -> Result<()> {
        let entry = RowEntry {
            insert_ts: ts,
            insert_op: op_id,
            cells: cells.clone(),
            chain: vec![],
        };

        match self.index.try_insert(key.clone(), entry) {
            Ok(_) => {
                self.note_op(op_id, op_bytes);
                Ok(())
            }
            Err(Error::AlreadyPresent(_, _)) => {
                let current = self.index.get(&key)?;
                if !current.is_deleted_at_tail() {
                    return err_at!(AlreadyPresent, msg: "row live in memrowset");
                }
                let mutation = Mutation {
                    ts,
                    op_id,
                    change: RowChange::Reinsert { cells },
                };
                self.index.modify(&key, |entry| {
                    let mut entry = entry.clone();
                    entry.chain.push(mutation.clone());
                    entry
                })?;
                self.note_op(op_id, op_bytes);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Apply an update or delete to an existing entry. Fails with
    /// [Error::KeyNotFound] when the key is absent or dead at its
    /// tail.
    pub fn mutate(
        &self,
        key: &[u8],
        ts: Timestamp,
        op_id: LogIndex,
        change: RowChange,
        op_bytes: u64,
    ) -> Result<()> {
        let current = self.index.get(key)?;
        if current.is_deleted_at_tail() {
            return err_at!(KeyNotFound, msg: "row deleted in memrowset");
        }

        let mutation = Mutation { ts, op_id, change };
        self.index.modify(key, |entry| {
            let mut entry = entry.clone();
            entry.chain.push(mutation.clone());
            entry
        })?;
        self.note_op(op_id, op_bytes);
        Ok(())
    }

    fn note_op(&self, op_id: LogIndex, op_bytes: u64) {
        let mut state = self.state.write();
        state.min_log_index = Some(match state.min_log_index {
            Some(idx) => idx.min(op_id),
            None => op_id,
        });
        state.log_replay_size += op_bytes;
    }

    /// Adopt an entry wholesale, chain included; used when a flush
    /// carries post-snapshot entries over into the fresh MemRowSet.
    pub fn adopt(&self, key: Vec<u8>, entry: RowEntry, op_bytes: u64) -> Result<()> {
        let op_id = entry.insert_op;
        self.index.try_insert(key, entry)?;
        self.note_op(op_id, op_bytes);
        Ok(())
    }

    /// Does the index hold `key`, in any state?
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.index.get(key).is_ok()
    }

    /// Entry for `key`, when present.
    pub fn get(&self, key: &[u8]) -> Option<RowEntry> {
        self.index.get(key).ok()
    }

    /// Resolve an entry against `snap`. None when the row's insert is
    /// not visible; otherwise the cells plus deleted flag at the
    /// snapshot.
    pub fn state_at(
        schema: &Schema,
        entry: &RowEntry,
        snap: &Snapshot,
    ) -> Result<Option<RowState>> {
        if !snap.is_visible(entry.insert_ts) {
            return Ok(None);
        }
        let mut state = RowState::new(entry.cells.clone());
        for mutation in entry.chain.iter() {
            if snap.is_visible(mutation.ts) {
                apply_change(schema, &mut state, &mutation.change)?;
            }
        }
        Ok(Some(state))
    }

    /// Ordered iteration over a snapshot of the index.
    pub fn iter(&self) -> Iter<Vec<u8>, RowEntry> {
        self.index.iter()
    }

    /// Ordered iteration over `[lower, upper)` of the encoded-PK
    /// space.
    pub fn range(
        &self,
        range: (
            std::ops::Bound<Vec<u8>>,
            std::ops::Bound<Vec<u8>>,
        ),
    ) -> Iter<Vec<u8>, RowEntry> {
        self.index.range(range)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes of memory anchored until this rowset is flushed.
    pub fn ram_anchored(&self) -> usize {
        self.index.footprint()
    }

    /// WAL bytes that a crash would replay through this rowset.
    pub fn log_replay_size(&self) -> u64 {
        self.state.read().log_replay_size
    }

    pub fn min_log_index(&self) -> Option<LogIndex> {
        self.state.read().min_log_index
    }

    pub fn age_secs(&self) -> u64 {
        self.created.elapsed().as_secs()
    }

    /// Count of entries live at the latest state.
    pub fn count_live_rows(&self) -> usize {
        self.iter()
            .filter(|(_, entry)| !entry.is_deleted_at_tail())
            .count()
    }
}

impl std::fmt::Debug for MemRowSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "MemRowSet<{}, {} entries>", self.to_name(), self.len())
    }
}

#[cfg(test)]
#[path = "mrs_test.rs"]
mod mrs_test;
