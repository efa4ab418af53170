//! Package implement the DiskRowSet: the immutable, key-range bundle
//! of one CFile per column, a bloom filter and ad-hoc primary-key
//! index over encoded keys, and the delta trackers layering mutations
//! over the base data. The DiskRowSet is the unit of compaction and of
//! flush concurrency.

use log::info;
use xorfilter::{BuildHasherDefault, Xor8};

use std::sync::{Arc, Mutex};

use crate::{
    bstore::{BlockId, BlockStore},
    cache::BlockCache,
    cfile::{block, Reader},
    delta::{
        apply_change, invert_change, DeltaFile, DeltaFileWriter, DeltaKey, DeltaStats,
        DeltaTracker, RowChange, RowHistory, RowState,
    },
    meta::{ColumnBlock, RowSetMeta},
    mvcc::Timestamp,
    row::Value,
    schema::{ColumnId, Schema},
    util::{self, Spinlock},
    Error, LogIndex, Result, RowId,
};

mod writer;

pub use writer::{DrsArtifacts, DrsWriter, FlushRow};

/// Outcome of a delta compaction, feeding the metadata update.
pub struct CompactOutcome {
    pub removed_blocks: Vec<BlockId>,
    pub added_redo_blocks: Vec<BlockId>,
    pub added_undo_blocks: Vec<BlockId>,
    /// Rewritten base columns, major compaction only.
    pub new_column_blocks: Option<Vec<ColumnBlock>>,
}

// base data state that major delta compaction swaps out.
struct BaseState {
    column_blocks: Vec<ColumnBlock>,
}

/// A disk-resident rowset covering one key range.
pub struct DiskRowSet {
    rowset_id: u64,
    store: Arc<BlockStore>,
    cache: Option<Arc<BlockCache>>,

    n_rows: u64,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    bloom: Xor8<BuildHasherDefault>,
    bloom_block: BlockId,
    ad_hoc_index_block: BlockId,
    base: Spinlock<BaseState>,

    pk_reader: Mutex<Reader>,
    tracker: DeltaTracker,

    /// Exclusive over compactions and major flushes of this rowset.
    pub compact_flush_lock: Mutex<()>,
}

impl DiskRowSet {
    /// Open a rowset from its durable description.
    pub fn open(
        store: Arc<BlockStore>,
        cache: Option<Arc<BlockCache>>,
        meta: &RowSetMeta,
    ) -> Result<DiskRowSet> {
        let bloom = {
            let mut data = store.read(meta.bloom_block)?;
            let framed = data.read_at(0, data.len() as usize)?;
            let payload = block::unframe(&framed, crate::schema::Compression::None)?;
            util::from_cbor_bytes::<Xor8<BuildHasherDefault>>(&payload)?.0
        };

        let pk_reader = {
            let data = store.read(meta.ad_hoc_index_block)?;
            Reader::open(data, cache.clone())?
        };

        let name = format!("drs-{}", meta.rowset_id);
        let tracker = DeltaTracker::open(
            &name,
            Arc::clone(&store),
            cache.clone(),
            &meta.redo_blocks,
            &meta.undo_blocks,
        )?;

        Ok(DiskRowSet {
            rowset_id: meta.rowset_id,
            store,
            cache,

            n_rows: meta.n_rows,
            min_key: meta.min_key.clone(),
            max_key: meta.max_key.clone(),
            bloom,
            bloom_block: meta.bloom_block,
            ad_hoc_index_block: meta.ad_hoc_index_block,
            base: Spinlock::new(BaseState {
                column_blocks: meta.column_blocks.clone(),
            }),

            pk_reader: Mutex::new(pk_reader),
            tracker,

            compact_flush_lock: Mutex::new(()),
        })
    }

    pub fn to_rowset_id(&self) -> u64 {
        self.rowset_id
    }

    pub fn as_min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn as_max_key(&self) -> &[u8] {
        &self.max_key
    }

    pub fn as_tracker(&self) -> &DeltaTracker {
        &self.tracker
    }

    /// Number of rows in the base data, live or ghost.
    pub fn count_rows(&self) -> u64 {
        self.n_rows
    }

    /// Approximate count of live rows, net of deletions.
    pub fn count_live_rows(&self) -> u64 {
        let stats = self.tracker.redo_stats();
        (self.n_rows + stats.n_reinserts).saturating_sub(stats.n_deletes)
    }

    /// Bytes of base data plus delta files on disk.
    pub fn on_disk_size(&self) -> u64 {
        let mut size = self.tracker.on_disk_size();
        for cb in self.base.read().column_blocks.iter() {
            size += self.store.on_disk_size(cb.block).unwrap_or(0);
        }
        size += self.store.on_disk_size(self.ad_hoc_index_block).unwrap_or(0);
        size += self.store.on_disk_size(self.bloom_block).unwrap_or(0);
        size
    }

    pub fn delta_memstore_size(&self) -> usize {
        self.tracker.delta_memstore_size()
    }

    pub fn min_unflushed_log_index(&self) -> Option<LogIndex> {
        self.tracker.min_log_index()
    }

    /// Whether the key range of this rowset may contain `key`.
    pub fn range_contains(&self, key: &[u8]) -> bool {
        self.min_key.as_slice() <= key && key <= self.max_key.as_slice()
    }

    /// Bloom-gated primary-key probe; `Some(row_id)` when the key has
    /// a base row here, live or ghost.
    pub fn check_row_present(&self, key: &[u8]) -> Result<Option<RowId>> {
        if !self.bloom.contains(&key.to_vec()) {
            return Ok(None);
        }
        let probe = Value::Binary(key.to_vec());
        let mut reader = self.pk_reader.lock().unwrap();
        let (scan, exact) = reader.seek_at_or_after(&probe)?;
        if !exact {
            return Ok(None);
        }
        Ok(Some(scan.to_ordinal() as RowId))
    }

    /// Latest (unfiltered) state of a base row after its REDO chain.
    pub fn is_live_at_tail(&self, schema: &Schema, row_id: RowId) -> Result<bool> {
        let mut deleted = false;
        for (_ts, change) in self.tracker.redos_for_row(schema, row_id)?.iter() {
            match change {
                RowChange::Delete => deleted = true,
                RowChange::Reinsert { .. } => deleted = false,
                RowChange::Update { .. } => (),
            }
        }
        Ok(!deleted)
    }

    /// Apply an update/delete to the row holding `key`. `Ok(None)`
    /// when the key has no live row here.
    pub fn mutate(
        &self,
        schema: &Schema,
        key: &[u8],
        ts: Timestamp,
        op_id: LogIndex,
        change: &RowChange,
    ) -> Result<Option<RowId>> {
        let row_id = match self.check_row_present(key)? {
            Some(row_id) => row_id,
            None => return Ok(None),
        };
        if !self.is_live_at_tail(schema, row_id)? {
            return Ok(None);
        }
        self.tracker.add_mutation(schema, row_id, ts, op_id, change)?;
        Ok(Some(row_id))
    }

    /// Record a reinsert against a ghost base row.
    pub fn reinsert(
        &self,
        schema: &Schema,
        row_id: RowId,
        ts: Timestamp,
        op_id: LogIndex,
        cells: Vec<Value>,
    ) -> Result<()> {
        let change = RowChange::Reinsert { cells };
        self.tracker.add_mutation(schema, row_id, ts, op_id, &change)
    }

    /// Open a reader over one base column.
    pub fn open_column_reader(&self, col_id: ColumnId) -> Result<Option<Reader>> {
        let block = self
            .base
            .read()
            .column_blocks
            .iter()
            .find(|cb| cb.col_id == col_id)
            .map(|cb| cb.block);
        match block {
            Some(block) => {
                let data = self.store.read(block)?;
                Ok(Some(Reader::open(data, self.cache.clone())?))
            }
            // column added after this rowset was written
            None => Ok(None),
        }
    }

    /// Open a reader over the ad-hoc primary-key index.
    pub fn open_pk_reader(&self) -> Result<Reader> {
        let data = self.store.read(self.ad_hoc_index_block)?;
        Reader::open(data, self.cache.clone())
    }

    /// Redo/undo history for a run of row ids, for the scan path.
    pub fn history_for_range(
        &self,
        schema: &Schema,
        start_row: RowId,
        end_row: RowId,
    ) -> Result<RowHistory> {
        self.tracker.history_for_range(schema, start_row, end_row)
    }

    /// Flush the DeltaMemStore to a REDO file. Returns true when a
    /// file was produced.
    pub fn flush_deltas(&self, schema: &Schema) -> Result<bool> {
        self.tracker.flush_dms(schema)
    }

    /// Merge all REDO delta files into one. `Ok(None)` when fewer than
    /// two files exist.
    pub fn minor_compact_delta_stores(
        &self,
        schema: &Schema,
    ) -> Result<Option<CompactOutcome>> {
        let _guard = self.compact_flush_lock.lock().unwrap();

        let files = self.tracker.redo_files();
        if files.len() < 2 {
            return Ok(None);
        }

        let mut records = vec![];
        for file in files.iter() {
            records.extend(file.iter_all(schema)?);
        }
        records.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut txn = self.store.new_txn();
        let new_file = {
            let bw = txn.create()?;
            let name = format!("drs-{}/redo-minor", self.rowset_id);
            let mut writer = DeltaFileWriter::new(bw, &name)?;
            for (key, change) in records.iter() {
                writer.append(schema, *key, change)?;
            }
            let (id, _stats) = writer.finish()?;
            txn.commit()?;
            Arc::new(DeltaFile::open(&self.store, self.cache.clone(), id)?)
        };

        let removed: Vec<BlockId> = files.iter().map(|f| f.to_id()).collect();
        let added = new_file.to_id();
        self.tracker.swap_redos(&removed, vec![new_file]);

        info!(
            target: "colt::drs",
            "drs-{}: minor compaction {} files -> {}", self.rowset_id, removed.len(), added
        );

        Ok(Some(CompactOutcome {
            removed_blocks: removed,
            added_redo_blocks: vec![added],
            added_undo_blocks: vec![],
            new_column_blocks: None,
        }))
    }

    /// Fold the REDO delta files into the base columns, emitting
    /// equivalent UNDO history and discarding UNDO records older than
    /// `ahm` (the ancient history mark). Row ids are preserved.
    pub fn major_compact_delta_stores(
        &self,
        schema: &Arc<Schema>,
        ahm: Timestamp,
    ) -> Result<Option<CompactOutcome>> {
        let _guard = self.compact_flush_lock.lock().unwrap();

        let redo_files = self.tracker.redo_files();
        let undo_files = self.tracker.undo_files();
        if redo_files.is_empty() && undo_files.is_empty() {
            return Ok(None);
        }

        // group every delta by row id
        let mut redos: RowHistory = RowHistory::default();
        for file in redo_files.iter() {
            for (key, change) in file.iter_all(schema)? {
                redos.redo.entry(key.row_id).or_default().push((key.ts, change));
            }
        }
        for file in undo_files.iter() {
            for (key, change) in file.iter_all(schema)? {
                redos.undo.entry(key.row_id).or_default().push((key.ts, change));
            }
        }
        for deltas in redos.redo.values_mut() {
            deltas.sort_by_key(|(ts, _)| *ts);
        }

        // open scans over every base column
        let mut col_scans = vec![];
        for col in schema.cols.iter() {
            match self.open_column_reader(col.id)? {
                Some(mut reader) => {
                    let scan = reader.scan_from_ordinal(0)?;
                    col_scans.push(Some((reader, scan)));
                }
                None => col_scans.push(None),
            }
        }

        let mut txn = self.store.new_txn();
        let mut col_writers = vec![];
        for col in schema.cols.iter() {
            let opts = crate::cfile::WriterOpts::from_column(col);
            let mut writer = crate::cfile::Writer::new(txn.create()?, opts)?;
            writer.add_metadata(crate::cfile::META_MIN_KEY, &self.min_key);
            writer.add_metadata(crate::cfile::META_MAX_KEY, &self.max_key);
            col_writers.push(writer);
        }
        let mut undo_writer: Option<DeltaFileWriter> = None;
        let mut redo_writer: Option<DeltaFileWriter> = None;

        for row_id in 0..self.n_rows as RowId {
            // materialize the base image
            let mut cells = Vec::with_capacity(schema.len());
            for (pos, col) in schema.cols.iter().enumerate() {
                match &mut col_scans[pos] {
                    Some((reader, scan)) => {
                        let mut out = vec![];
                        if scan.next_values(reader, 1, &mut out)? != 1 {
                            err_at!(Corruption, msg: "short column {}", col.name)?;
                        }
                        cells.push(out.pop().unwrap());
                    }
                    None => cells.push(Value::Null),
                }
            }

            let mut state = RowState::new(cells);
            let mut new_undos: Vec<(Timestamp, RowChange)> = redos
                .undo
                .remove(&row_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|(ts, _)| *ts >= ahm)
                .collect();
            let mut trailing_redo: Option<(Timestamp, RowChange)> = None;

            let row_redos = redos.redo.remove(&row_id).unwrap_or_default();
            let n_redos = row_redos.len();
            for (i, (ts, change)) in row_redos.into_iter().enumerate() {
                let last = i + 1 == n_redos;
                if last && change.is_delete() {
                    // ghost rows keep their deletion as a REDO record
                    trailing_redo = Some((ts, change));
                    break;
                }
                if ts >= ahm {
                    new_undos.push((ts, invert_change(schema, &state, &change)?));
                }
                apply_change(schema, &mut state, &change)?;
            }
            new_undos.sort_by_key(|(ts, _)| *ts);

            for (writer, cell) in col_writers.iter_mut().zip(state.cells.iter()) {
                writer.append(&[cell.clone()])?;
            }
            if !new_undos.is_empty() {
                if undo_writer.is_none() {
                    let bw = txn.create()?;
                    let name = format!("drs-{}/undo-major", self.rowset_id);
                    undo_writer = Some(DeltaFileWriter::new(bw, &name)?);
                }
                let writer = undo_writer.as_mut().unwrap();
                for (ts, change) in new_undos.iter() {
                    writer.append(schema, DeltaKey::new(row_id, *ts), change)?;
                }
            }
            if let Some((ts, change)) = trailing_redo {
                if redo_writer.is_none() {
                    let bw = txn.create()?;
                    let name = format!("drs-{}/redo-major", self.rowset_id);
                    redo_writer = Some(DeltaFileWriter::new(bw, &name)?);
                }
                redo_writer
                    .as_mut()
                    .unwrap()
                    .append(schema, DeltaKey::new(row_id, ts), &change)?;
            }
        }

        let mut new_column_blocks = vec![];
        for (writer, col) in col_writers.into_iter().zip(schema.cols.iter()) {
            let (id, _footer) = writer.finish()?;
            new_column_blocks.push(ColumnBlock {
                col_id: col.id,
                block: id,
            });
        }
        let added_undo = match undo_writer {
            Some(writer) => vec![writer.finish()?.0],
            None => vec![],
        };
        let added_redo = match redo_writer {
            Some(writer) => vec![writer.finish()?.0],
            None => vec![],
        };
        txn.commit()?;

        // swap delta files and base columns
        let mut new_redo_files = vec![];
        for id in added_redo.iter() {
            new_redo_files.push(Arc::new(DeltaFile::open(
                &self.store,
                self.cache.clone(),
                *id,
            )?));
        }
        let mut new_undo_files = vec![];
        for id in added_undo.iter() {
            new_undo_files.push(Arc::new(DeltaFile::open(
                &self.store,
                self.cache.clone(),
                *id,
            )?));
        }

        let removed_redo: Vec<BlockId> = redo_files.iter().map(|f| f.to_id()).collect();
        let removed_undo: Vec<BlockId> = undo_files.iter().map(|f| f.to_id()).collect();
        self.tracker.swap_redos(&removed_redo, new_redo_files);
        self.tracker.swap_undos(&removed_undo, new_undo_files);

        let removed_columns: Vec<BlockId> = {
            let mut base = self.base.write();
            let old = base.column_blocks.iter().map(|cb| cb.block).collect();
            base.column_blocks = new_column_blocks.clone();
            old
        };

        let mut removed_blocks = removed_redo;
        removed_blocks.extend(removed_undo);
        removed_blocks.extend(removed_columns);

        info!(
            target: "colt::drs",
            "drs-{}: major compaction folded {} redo files at {}",
            self.rowset_id, redo_files.len(), ahm
        );

        Ok(Some(CompactOutcome {
            removed_blocks,
            added_redo_blocks: added_redo,
            added_undo_blocks: added_undo,
            new_column_blocks: Some(new_column_blocks),
        }))
    }

    pub fn estimate_bytes_in_ancient_undos(&self, ahm: Timestamp) -> u64 {
        self.tracker.estimate_bytes_in_ancient_undos(ahm)
    }

    /// Drop UNDO files wholly below `ahm`; returns the freed blocks.
    pub fn delete_ancient_undo_deltas(&self, ahm: Timestamp) -> Result<Vec<BlockId>> {
        let _guard = self.compact_flush_lock.lock().unwrap();
        Ok(self.tracker.delete_ancient_undo_deltas(ahm))
    }

    /// Current durable description of this rowset.
    pub fn to_meta(&self) -> RowSetMeta {
        RowSetMeta {
            rowset_id: self.rowset_id,
            column_blocks: self.base.read().column_blocks.clone(),
            bloom_block: self.bloom_block,
            ad_hoc_index_block: self.ad_hoc_index_block,
            undo_blocks: self.tracker.undo_files().iter().map(|f| f.to_id()).collect(),
            redo_blocks: self.tracker.redo_files().iter().map(|f| f.to_id()).collect(),
            dms_min_log_idx: self.tracker.min_log_index(),
            n_rows: self.n_rows,
            min_key: self.min_key.clone(),
            max_key: self.max_key.clone(),
        }
    }

    /// Aggregate REDO stats, for scheduler scoring.
    pub fn redo_stats(&self) -> DeltaStats {
        self.tracker.redo_stats()
    }

    pub fn redo_file_count(&self) -> usize {
        self.tracker.redo_files().len()
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
pub(crate) mod mod_test;
