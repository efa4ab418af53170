//! Package implement delta storage: the mutation records laid over a
//! DiskRowSet's immutable base data.
//!
//! A delta is keyed by `(row_id, timestamp)` and carries a change
//! list: a compact encoding of updated columns, a deletion, or a
//! reinsertion. REDO deltas roll a base row forward to timestamps at
//! or above their own; UNDO deltas roll it backward below theirs.
//! Fresh mutations accumulate in a [DeltaMemStore]; flushes freeze
//! them into immutable [DeltaFile]s tracked per rowset by a
//! [DeltaTracker].

use cbordata::Cborize;

use std::convert::{TryFrom, TryInto};

use crate::{
    mvcc::Timestamp,
    row::{decode_array_cell, decode_cell, encode_cell, Row, Value},
    schema::{ColumnId, Schema},
    util, Error, Result, RowId,
};

mod dms;
mod file;
mod tracker;

pub use dms::DeltaMemStore;
pub use file::{DeltaFile, DeltaFileWriter};
pub use tracker::{DeltaTracker, RowHistory};

const DELTA_VER: u32 = 0x00510001;

/// Width of an encoded delta key: 32-bit row id plus 64-bit timestamp,
/// both big-endian.
pub const DELTA_KEY_LEN: usize = 12;

const TAG_UPDATE: u8 = 0;
const TAG_DELETE: u8 = 1;
const TAG_REINSERT: u8 = 2;

/// Key of a delta record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct DeltaKey {
    pub row_id: RowId,
    pub ts: Timestamp,
}

impl DeltaKey {
    pub fn new(row_id: RowId, ts: Timestamp) -> DeltaKey {
        DeltaKey { row_id, ts }
    }

    /// Memcmp-ordered byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(DELTA_KEY_LEN);
        key.extend_from_slice(&self.row_id.to_be_bytes());
        key.extend_from_slice(&self.ts.0.to_be_bytes());
        key
    }

    pub fn decode(buf: &[u8]) -> Result<DeltaKey> {
        check_remaining!(buf, DELTA_KEY_LEN, "delta-key")?;
        let row_id = u32::from_be_bytes(buf[..4].try_into().unwrap());
        let ts = Timestamp(u64::from_be_bytes(buf[4..12].try_into().unwrap()));
        Ok(DeltaKey { row_id, ts })
    }
}

/// A change list: what one mutation did to one row.
#[derive(Clone, Debug, PartialEq)]
pub enum RowChange {
    /// Column-wise update; `None` sets the column to NULL.
    Update { cols: Vec<(ColumnId, Option<Value>)> },
    Delete,
    /// Full row image, in schema column order.
    Reinsert { cells: Vec<Value> },
}

impl RowChange {
    /// Wire form: one tag byte, then `varint(n) { varint(col_id)
    /// varint(len) bytes }...`. A one-byte 0x00 marker encodes NULL,
    /// 0x01 prefixes a cell-codec value.
    pub fn encode(&self, schema: &Schema) -> Result<Vec<u8>> {
        let mut buf = vec![];
        match self {
            RowChange::Delete => buf.push(TAG_DELETE),
            RowChange::Update { cols } => {
                buf.push(TAG_UPDATE);
                util::encode_varint(cols.len() as u64, &mut buf);
                for (col_id, value) in cols.iter() {
                    encode_change_cell(*col_id, value.as_ref(), &mut buf)?;
                }
            }
            RowChange::Reinsert { cells } => {
                buf.push(TAG_REINSERT);
                if cells.len() != schema.len() {
                    err_at!(
                        InvalidInput, msg: "reinsert arity {}/{}", cells.len(), schema.len()
                    )?;
                }
                util::encode_varint(cells.len() as u64, &mut buf);
                for (cell, col) in cells.iter().zip(schema.cols.iter()) {
                    let value = match cell {
                        Value::Null => None,
                        cell => Some(cell),
                    };
                    encode_change_cell(col.id, value, &mut buf)?;
                }
            }
        }
        Ok(buf)
    }

    pub fn decode(schema: &Schema, buf: &[u8]) -> Result<RowChange> {
        check_remaining!(buf, 1, "change-tag")?;
        let (tag, buf) = (buf[0], &buf[1..]);

        match tag {
            TAG_DELETE => Ok(RowChange::Delete),
            TAG_UPDATE => {
                let cols = decode_change_cols(schema, buf)?;
                Ok(RowChange::Update { cols })
            }
            TAG_REINSERT => {
                let cols = decode_change_cols(schema, buf)?;
                let mut cells = vec![Value::Null; schema.len()];
                for (col_id, value) in cols.into_iter() {
                    let pos = match schema.position_of_id(col_id) {
                        Some(pos) => pos,
                        None => err_at!(Corruption, msg: "reinsert col {}", col_id)?,
                    };
                    cells[pos] = value.unwrap_or(Value::Null);
                }
                Ok(RowChange::Reinsert { cells })
            }
            tag => err_at!(Corruption, msg: "change tag {}", tag),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RowChange::Delete)
    }

    /// Column ids this change touches; empty for deletes.
    pub fn touched_cols(&self) -> Vec<ColumnId> {
        match self {
            RowChange::Delete => vec![],
            RowChange::Update { cols } => cols.iter().map(|(id, _)| *id).collect(),
            RowChange::Reinsert { .. } => vec![],
        }
    }
}

fn encode_change_cell(
    col_id: ColumnId,
    value: Option<&Value>,
    buf: &mut Vec<u8>,
) -> Result<()> {
    util::encode_varint(col_id as u64, buf);
    match value {
        None => {
            util::encode_varint(1, buf);
            buf.push(0x00);
        }
        Some(value) => {
            let mut cell = vec![0x01];
            encode_cell(value, &mut cell)?;
            util::encode_varint(cell.len() as u64, buf);
            buf.extend_from_slice(&cell);
        }
    }
    Ok(())
}

fn decode_change_cols(
    schema: &Schema,
    buf: &[u8],
) -> Result<Vec<(ColumnId, Option<Value>)>> {
    let (n, mut off) = util::decode_varint(buf)?;
    let mut cols = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (col_id, m) = util::decode_varint(&buf[off..])?;
        off += m;
        let (len, m) = util::decode_varint(&buf[off..])?;
        off += m;
        let len = err_at!(FailConvert, usize::try_from(len))?;
        check_remaining!(&buf[off..], len, "change-cell")?;
        let cell = &buf[off..off + len];
        off += len;

        let col_id = err_at!(FailConvert, u32::try_from(col_id))?;
        let col = match schema.col_by_id(col_id) {
            Some(col) => col,
            None => err_at!(Corruption, msg: "change for unknown col {}", col_id)?,
        };

        check_remaining!(cell, 1, "change-cell-marker")?;
        let value = match cell[0] {
            0x00 => None,
            0x01 if col.array => Some(decode_array_cell(&col.ctype, &cell[1..])?),
            0x01 => Some(decode_cell(&col.ctype, &cell[1..])?),
            marker => err_at!(Corruption, msg: "change cell marker {}", marker)?,
        };
        cols.push((col_id, value));
    }
    Ok(cols)
}

/// Mutable row image used while folding deltas over base data.
#[derive(Clone, Debug)]
pub struct RowState {
    pub cells: Vec<Value>,
    pub deleted: bool,
}

impl RowState {
    pub fn new(cells: Vec<Value>) -> RowState {
        RowState {
            cells,
            deleted: false,
        }
    }

    pub fn into_row(self) -> Row {
        Row::new(self.cells)
    }
}

/// Roll `state` forward through `change`.
pub fn apply_change(schema: &Schema, state: &mut RowState, change: &RowChange) -> Result<()> {
    match change {
        RowChange::Delete => state.deleted = true,
        RowChange::Reinsert { cells } => {
            state.cells = cells.clone();
            state.deleted = false;
        }
        RowChange::Update { cols } => {
            for (col_id, value) in cols.iter() {
                let pos = match schema.position_of_id(*col_id) {
                    Some(pos) => pos,
                    // column dropped since the delta was written
                    None => continue,
                };
                // rows written under an older schema pad out
                if pos >= state.cells.len() {
                    state.cells.resize(schema.len(), Value::Null);
                }
                state.cells[pos] = value.clone().unwrap_or(Value::Null);
            }
        }
    }
    Ok(())
}

/// Compose the UNDO change that reverses `change` when applied to the
/// prior state.
pub fn invert_change(
    schema: &Schema,
    prior: &RowState,
    change: &RowChange,
) -> Result<RowChange> {
    let inverse = match change {
        RowChange::Delete => RowChange::Reinsert {
            cells: prior.cells.clone(),
        },
        RowChange::Reinsert { .. } => RowChange::Delete,
        RowChange::Update { cols } => {
            let mut inverse = Vec::with_capacity(cols.len());
            for (col_id, _) in cols.iter() {
                let pos = match schema.position_of_id(*col_id) {
                    Some(pos) => pos,
                    None => continue,
                };
                let old = match &prior.cells[pos] {
                    Value::Null => None,
                    value => Some(value.clone()),
                };
                inverse.push((*col_id, old));
            }
            RowChange::Update { cols: inverse }
        }
    };
    Ok(inverse)
}

/// Per-store statistics consumed by the maintenance scheduler.
#[derive(Clone, Debug, Default, Cborize)]
pub struct DeltaStats {
    pub n_updates: Vec<ColumnUpdateCount>,
    pub n_deletes: u64,
    pub n_reinserts: u64,
    pub min_ts: u64,
    pub max_ts: u64,
}

#[derive(Clone, Debug, Cborize)]
pub struct ColumnUpdateCount {
    pub col_id: ColumnId,
    pub count: u64,
}

impl ColumnUpdateCount {
    const ID: u32 = DELTA_VER;
}

impl DeltaStats {
    const ID: u32 = DELTA_VER;

    pub fn note(&mut self, ts: Timestamp, change: &RowChange) {
        match change {
            RowChange::Delete => self.n_deletes += 1,
            RowChange::Reinsert { .. } => self.n_reinserts += 1,
            RowChange::Update { cols } => {
                for (col_id, _) in cols.iter() {
                    match self.n_updates.iter_mut().find(|c| c.col_id == *col_id) {
                        Some(entry) => entry.count += 1,
                        None => self.n_updates.push(ColumnUpdateCount {
                            col_id: *col_id,
                            count: 1,
                        }),
                    }
                }
            }
        }
        if self.min_ts == 0 || ts.0 < self.min_ts {
            self.min_ts = ts.0;
        }
        self.max_ts = self.max_ts.max(ts.0);
    }

    pub fn merge(&mut self, other: &DeltaStats) {
        for entry in other.n_updates.iter() {
            match self.n_updates.iter_mut().find(|c| c.col_id == entry.col_id) {
                Some(mine) => mine.count += entry.count,
                None => self.n_updates.push(entry.clone()),
            }
        }
        self.n_deletes += other.n_deletes;
        self.n_reinserts += other.n_reinserts;
        if self.min_ts == 0 || (other.min_ts != 0 && other.min_ts < self.min_ts) {
            self.min_ts = other.min_ts;
        }
        self.max_ts = self.max_ts.max(other.max_ts);
    }

    pub fn update_count(&self) -> u64 {
        self.n_updates.iter().map(|c| c.count).sum()
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
