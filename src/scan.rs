//! Module `scan` implement the read path: pushed-down predicates,
//! per-rowset iterators that materialize base columns and apply
//! deltas under an MVCC snapshot, and the key-ordered merge across
//! rowsets.

use xorfilter::{BuildHasherDefault, Xor8};

use std::{
    cmp::Ordering,
    collections::VecDeque,
    ops::Bound,
    sync::Arc,
};

use crate::{
    cfile::{reader::ColumnScan, Reader},
    delta::{apply_change, RowChange, RowState},
    drs::DiskRowSet,
    mrs::MemRowSet,
    mvcc::Snapshot,
    row::{encode_cell, Value},
    schema::Schema,
    Error, Result, RowId,
};

/// Default number of rows a rowset iterator materializes per batch.
pub const SCAN_BATCH_ROWS: usize = 1024;

/// A pushed-down, single-column predicate. `col` is the column's
/// position within the tablet schema.
#[derive(Clone)]
pub enum Predicate {
    /// `lo <= value < hi`, either bound optional.
    Range {
        col: usize,
        lo: Bound<Value>,
        hi: Bound<Value>,
    },
    Equals {
        col: usize,
        value: Value,
    },
    InList {
        col: usize,
        values: Vec<Value>,
    },
    IsNull {
        col: usize,
    },
    IsNotNull {
        col: usize,
    },
    /// Bloom-filter membership over the cell codec bytes.
    InBloom {
        col: usize,
        bloom: Arc<Xor8<BuildHasherDefault>>,
    },
}

impl Predicate {
    pub fn to_col(&self) -> usize {
        match self {
            Predicate::Range { col, .. } => *col,
            Predicate::Equals { col, .. } => *col,
            Predicate::InList { col, .. } => *col,
            Predicate::IsNull { col } => *col,
            Predicate::IsNotNull { col } => *col,
            Predicate::InBloom { col, .. } => *col,
        }
    }

    /// Does `value` satisfy this predicate?
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Predicate::IsNull { .. } => value.is_null(),
            Predicate::IsNotNull { .. } => !value.is_null(),
            _ if value.is_null() => false,
            Predicate::Range { lo, hi, .. } => {
                let lo_ok = match lo {
                    Bound::Unbounded => true,
                    Bound::Included(b) => value.cmp(b) != Ordering::Less,
                    Bound::Excluded(b) => value.cmp(b) == Ordering::Greater,
                };
                let hi_ok = match hi {
                    Bound::Unbounded => true,
                    Bound::Included(b) => value.cmp(b) != Ordering::Greater,
                    Bound::Excluded(b) => value.cmp(b) == Ordering::Less,
                };
                lo_ok && hi_ok
            }
            Predicate::Equals { value: want, .. } => value.cmp(want) == Ordering::Equal,
            Predicate::InList { values, .. } => {
                values.iter().any(|v| value.cmp(v) == Ordering::Equal)
            }
            Predicate::InBloom { bloom, .. } => {
                let mut bytes = vec![];
                match encode_cell(value, &mut bytes) {
                    Ok(_) => bloom.contains(&bytes),
                    Err(_) => false,
                }
            }
        }
    }
}

/// Pull-only counters reported by a scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanStats {
    pub rows_scanned: u64,
    pub rows_returned: u64,
    pub blocks_read: u64,
    pub bytes_read: u64,
    /// Values materialized through dictionary decode; stays low when
    /// codeword short-circuiting kicks in.
    pub dict_materialized: u64,
}

/// One key-ordered row produced by a rowset iterator: full-schema
/// cells (unprojected columns are Null) plus the deleted flag at the
/// scan snapshot.
#[derive(Clone, Debug)]
pub struct ScanRow {
    pub key: Vec<u8>,
    pub cells: Vec<Value>,
    pub deleted: bool,
}

/// Snapshot iterator over the MemRowSet.
pub struct MrsScan {
    schema: Arc<Schema>,
    snap: Snapshot,
    iter: crate::mdb::Iter<Vec<u8>, crate::mrs::RowEntry>,
}

impl MrsScan {
    pub fn new(
        mrs: &MemRowSet,
        schema: Arc<Schema>,
        snap: Snapshot,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
    ) -> MrsScan {
        MrsScan {
            schema,
            snap,
            iter: mrs.range(range),
        }
    }
}

impl Iterator for MrsScan {
    type Item = Result<ScanRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, entry) = self.iter.next()?;
            match MemRowSet::state_at(&self.schema, &entry, &self.snap) {
                Ok(Some(mut state)) => {
                    // rows written under an older schema pad out
                    state.cells.resize(self.schema.len(), Value::Null);

                    break Some(Ok(ScanRow {
                        key,
                        deleted: state.deleted,
                        cells: state.cells,
                    }));
                }
                // insert not visible at this snapshot
                Ok(None) => continue,
                Err(err) => break Some(Err(err)),
            }
        }
    }
}

/// Snapshot iterator over one DiskRowSet: materializes the projected
/// base columns batch-wise, applies UNDO history backward and REDO
/// history forward, and evaluates per-column predicates with the
/// dictionary short-circuit where possible.
pub struct DrsScan {
    drs: Arc<DiskRowSet>,
    schema: Arc<Schema>,
    snap: Snapshot,

    pk_reader: Reader,
    pk_scan: ColumnScan,
    cols: Vec<Option<(Reader, ColumnScan)>>,
    fill: Vec<Option<Value>>,
    preds: Vec<Predicate>,

    next_row: RowId,
    end_row: RowId,
    batch_size: usize,
    batch: VecDeque<ScanRow>,

    stats: ScanStats,
    done: bool,
}

impl DrsScan {
    /// Open an iterator over `drs` for keys within `range`. `needed`
    /// flags the schema positions to materialize; `preds` are the
    /// pushed-down predicates (their columns must be flagged needed).
    pub fn new(
        drs: Arc<DiskRowSet>,
        schema: Arc<Schema>,
        snap: Snapshot,
        range: &(Bound<Vec<u8>>, Bound<Vec<u8>>),
        needed: &[bool],
        preds: Vec<Predicate>,
        batch_size: usize,
    ) -> Result<DrsScan> {
        let mut pk_reader = drs.open_pk_reader()?;

        // resolve the key range onto a row-id range
        let start_row: RowId = match &range.0 {
            Bound::Unbounded => 0,
            Bound::Included(key) => {
                let (scan, _) = pk_reader.seek_at_or_after(&Value::Binary(key.clone()))?;
                scan.to_ordinal() as RowId
            }
            Bound::Excluded(key) => {
                let (scan, exact) =
                    pk_reader.seek_at_or_after(&Value::Binary(key.clone()))?;
                let at = scan.to_ordinal() as RowId;
                if exact {
                    at + 1
                } else {
                    at
                }
            }
        };
        let end_row: RowId = match &range.1 {
            Bound::Unbounded => drs.count_rows() as RowId,
            Bound::Included(key) => {
                let (scan, exact) =
                    pk_reader.seek_at_or_after(&Value::Binary(key.clone()))?;
                let at = scan.to_ordinal() as RowId;
                if exact {
                    at + 1
                } else {
                    at
                }
            }
            Bound::Excluded(key) => {
                let (scan, _) = pk_reader.seek_at_or_after(&Value::Binary(key.clone()))?;
                scan.to_ordinal() as RowId
            }
        };

        let pk_scan = pk_reader.scan_from_ordinal(start_row as u64)?;

        let mut cols = vec![];
        let mut fill = vec![];
        for (pos, col) in schema.cols.iter().enumerate() {
            if !needed.get(pos).copied().unwrap_or(false) {
                cols.push(None);
                fill.push(None);
                continue;
            }
            match drs.open_column_reader(col.id)? {
                Some(mut reader) => {
                    let scan = reader.scan_from_ordinal(start_row as u64)?;
                    cols.push(Some((reader, scan)));
                    fill.push(None);
                }
                None => {
                    // column added after this rowset was written;
                    // rows fill from the column default
                    cols.push(None);
                    fill.push(match &col.default {
                        Some(bytes) => Some(crate::row::decode_cell(&col.ctype, bytes)?),
                        None => None,
                    });
                }
            }
        }

        Ok(DrsScan {
            drs,
            schema,
            snap,

            pk_reader,
            pk_scan,
            cols,
            fill,
            preds,

            next_row: start_row,
            end_row,
            batch_size,
            batch: VecDeque::new(),

            stats: ScanStats::default(),
            done: false,
        })
    }

    pub fn to_stats(&self) -> ScanStats {
        let mut stats = self.stats;
        stats.blocks_read += self.pk_reader.n_blocks_read;
        stats.bytes_read += self.pk_reader.n_bytes_read;
        for entry in self.cols.iter().flatten() {
            stats.blocks_read += entry.0.n_blocks_read;
            stats.bytes_read += entry.0.n_bytes_read;
            stats.dict_materialized += entry.1.to_dict_materialized() as u64;
        }
        stats
    }

    fn fill_batch(&mut self) -> Result<()> {
        if self.next_row >= self.end_row {
            self.done = true;
            return Ok(());
        }
        let n = (self.batch_size as RowId).min(self.end_row - self.next_row) as usize;

        // keys for the batch
        let mut keys = Vec::with_capacity(n);
        if self.pk_scan.next_values(&mut self.pk_reader, n, &mut keys)? != n {
            err_at!(Corruption, msg: "pk index short of base rows")?;
        }

        // selection over the batch; predicate evaluation clears bits
        let mut sel = croaring::Bitmap::create();
        for i in 0..n as u32 {
            sel.add(i);
        }

        // materialize needed columns
        let mut columns: Vec<Option<Vec<Value>>> = vec![None; self.schema.len()];
        for (pos, slot) in self.cols.iter_mut().enumerate() {
            let (reader, scan) = match slot {
                Some(entry) => (&mut entry.0, &mut entry.1),
                None => continue,
            };
            let mut values = Vec::with_capacity(n);
            let pred = self.preds.iter().find(|p| p.to_col() == pos);
            let m = match pred {
                Some(pred) => {
                    scan.next_values_eval(reader, n, pred, 0, &mut sel, &mut values)?
                }
                None => scan.next_values(reader, n, &mut values)?,
            };
            if m != n {
                err_at!(Corruption, msg: "column {} short of base rows", pos)?;
            }
            columns[pos] = Some(values);
        }

        // deltas over the batch's row ids
        let history = self.drs.history_for_range(
            &self.schema,
            self.next_row,
            self.next_row + n as RowId,
        )?;

        for i in 0..n {
            let row_id = self.next_row + i as RowId;
            self.stats.rows_scanned += 1;

            let key = match &keys[i] {
                Value::Binary(key) => key.clone(),
                value => err_at!(Corruption, msg: "pk cell {}", value)?,
            };
            let mut cells = Vec::with_capacity(self.schema.len());
            for (pos, column) in columns.iter().enumerate() {
                match column {
                    Some(values) => cells.push(values[i].clone()),
                    None => match &self.fill[pos] {
                        Some(default) => cells.push(default.clone()),
                        None => cells.push(Value::Null),
                    },
                }
            }

            let mut state = RowState::new(cells);

            // roll back history the snapshot must not see
            if let Some(undos) = history.undo.get(&row_id) {
                for (ts, change) in undos.iter().rev() {
                    if !self.snap.is_visible(*ts) {
                        apply_change(&self.schema, &mut state, change)?;
                    }
                }
            }
            if state.deleted {
                // the row's insert is after the snapshot
                continue;
            }

            // roll forward visible redo history
            let mut touched = vec![];
            let mut any_redo = false;
            if let Some(redos) = history.redo.get(&row_id) {
                for (ts, change) in redos.iter() {
                    if self.snap.is_visible(*ts) {
                        any_redo = true;
                        touched.extend(change.touched_cols());
                        if matches!(change, RowChange::Reinsert { .. }) {
                            touched.extend(self.schema.cols.iter().map(|c| c.id));
                        }
                        apply_change(&self.schema, &mut state, change)?;
                    }
                }
            }

            // re-evaluate predicates whose column a delta rewrote;
            // untouched rows trust the block-level evaluation.
            let mut selected = sel.contains(i as u32);
            if any_redo {
                for pred in self.preds.iter() {
                    let col_id = self.schema.as_col(pred.to_col()).id;
                    if touched.contains(&col_id) {
                        selected = pred.matches(&state.cells[pred.to_col()]);
                        if !selected {
                            break;
                        }
                    }
                }
            }
            if !selected && !state.deleted {
                continue;
            }

            self.batch.push_back(ScanRow {
                key,
                deleted: state.deleted,
                cells: state.cells,
            });
        }

        self.next_row += n as RowId;
        Ok(())
    }
}

impl Iterator for DrsScan {
    type Item = Result<ScanRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.batch.pop_front() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.fill_batch() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}

/// A rowset-level scan source: a key-ordered row iterator that also
/// reports its counters.
pub trait ScanSource: Iterator<Item = Result<ScanRow>> {
    fn source_stats(&self) -> ScanStats {
        ScanStats::default()
    }
}

impl ScanSource for MrsScan {}

impl ScanSource for DrsScan {
    fn source_stats(&self) -> ScanStats {
        self.to_stats()
    }
}

/// Key-ordered merge across rowset iterators. Rowset key ranges may
/// overlap; for a key present in several rowsets the live version
/// wins over ghosts.
pub struct MergeScan {
    sources: Vec<SourceState>,
}

struct SourceState {
    iter: Box<dyn ScanSource>,
    peeked: Option<ScanRow>,
}

impl MergeScan {
    pub fn new(sources: Vec<Box<dyn ScanSource>>) -> MergeScan {
        MergeScan {
            sources: sources
                .into_iter()
                .map(|iter| SourceState { iter, peeked: None })
                .collect(),
        }
    }

    /// Sum of the source-side counters.
    pub fn to_stats(&self) -> ScanStats {
        let mut stats = ScanStats::default();
        for source in self.sources.iter() {
            let s = source.iter.source_stats();
            stats.rows_scanned += s.rows_scanned;
            stats.blocks_read += s.blocks_read;
            stats.bytes_read += s.bytes_read;
            stats.dict_materialized += s.dict_materialized;
        }
        stats
    }

    fn prime(&mut self) -> Result<()> {
        for source in self.sources.iter_mut() {
            if source.peeked.is_none() {
                source.peeked = match source.iter.next() {
                    Some(row) => Some(row?),
                    None => None,
                };
            }
        }
        Ok(())
    }
}

impl Iterator for MergeScan {
    type Item = Result<ScanRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(err) = self.prime() {
            return Some(Err(err));
        }

        let min_key: Vec<u8> = self
            .sources
            .iter()
            .filter_map(|s| s.peeked.as_ref().map(|row| row.key.clone()))
            .min()?;

        // drain every source parked on this key, prefer the live copy
        let mut winner: Option<ScanRow> = None;
        for source in self.sources.iter_mut() {
            let take = matches!(&source.peeked, Some(row) if row.key == min_key);
            if take {
                let row = source.peeked.take().unwrap();
                winner = match winner {
                    None => Some(row),
                    Some(prev) if prev.deleted && !row.deleted => Some(row),
                    Some(prev) => Some(prev),
                };
            }
        }
        winner.map(Ok)
    }
}

#[cfg(test)]
#[path = "scan_test.rs"]
mod scan_test;
