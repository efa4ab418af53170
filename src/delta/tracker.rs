//! Module `tracker` implement the per-rowset delta bookkeeping: one
//! live DeltaMemStore, the ordered REDO delta files flushed from it,
//! and the UNDO files preserving history below the base data.

use log::info;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use crate::{
    bstore::{BlockId, BlockStore},
    cache::BlockCache,
    delta::{DeltaFile, DeltaFileWriter, DeltaKey, DeltaMemStore, DeltaStats, RowChange},
    mvcc::Timestamp,
    schema::Schema,
    util::Spinlock,
    LogIndex, Result, RowId,
};

/// Redo and undo mutations for a run of row ids, pre-grouped for the
/// scan path.
#[derive(Default)]
pub struct RowHistory {
    /// Timestamp-ascending REDO mutations per row id.
    pub redo: BTreeMap<RowId, Vec<(Timestamp, RowChange)>>,
    /// Timestamp-ascending UNDO mutations per row id.
    pub undo: BTreeMap<RowId, Vec<(Timestamp, RowChange)>>,
}

struct TrackerInner {
    dms: Arc<DeltaMemStore>,
    /// DMS frozen by an in-progress flush; still consulted by reads.
    flushing: Option<Arc<DeltaMemStore>>,
    /// REDO files, oldest first.
    redos: Vec<Arc<DeltaFile>>,
    /// UNDO files, oldest first.
    undos: Vec<Arc<DeltaFile>>,
    /// Generation counter naming successive DMS instances.
    generation: u64,
}

/// Delta state of one DiskRowSet.
pub struct DeltaTracker {
    name: String,
    store: Arc<BlockStore>,
    cache: Option<Arc<BlockCache>>,
    inner: Spinlock<TrackerInner>,
    /// Serializes DMS flushes for this rowset.
    flush_lock: Mutex<()>,
}

impl DeltaTracker {
    /// Open the tracker for a rowset, loading its delta files.
    pub fn open(
        name: &str,
        store: Arc<BlockStore>,
        cache: Option<Arc<BlockCache>>,
        redo_ids: &[BlockId],
        undo_ids: &[BlockId],
    ) -> Result<DeltaTracker> {
        let mut redos = vec![];
        for id in redo_ids.iter() {
            redos.push(Arc::new(DeltaFile::open(&store, cache.clone(), *id)?));
        }
        let mut undos = vec![];
        for id in undo_ids.iter() {
            undos.push(Arc::new(DeltaFile::open(&store, cache.clone(), *id)?));
        }

        Ok(DeltaTracker {
            name: name.to_string(),
            store,
            cache,
            inner: Spinlock::new(TrackerInner {
                dms: Arc::new(DeltaMemStore::new(&format!("{}/dms-0", name))),
                flushing: None,
                redos,
                undos,
                generation: 0,
            }),
            flush_lock: Mutex::new(()),
        })
    }

    /// Record a REDO mutation.
    pub fn add_mutation(
        &self,
        schema: &Schema,
        row_id: RowId,
        ts: Timestamp,
        log_index: LogIndex,
        change: &RowChange,
    ) -> Result<()> {
        let dms = Arc::clone(&self.inner.read().dms);
        dms.add(schema, row_id, ts, log_index, change)
    }

    /// REDO mutations for one row, timestamp ascending, across files,
    /// any flushing store, and the live DMS.
    pub fn redos_for_row(
        &self,
        schema: &Schema,
        row_id: RowId,
    ) -> Result<Vec<(Timestamp, RowChange)>> {
        let (files, flushing, dms) = {
            let inner = self.inner.read();
            (
                inner.redos.clone(),
                inner.flushing.clone(),
                Arc::clone(&inner.dms),
            )
        };

        let mut deltas = vec![];
        for file in files.iter() {
            deltas.extend(file.deltas_for_row(schema, row_id)?);
        }
        if let Some(flushing) = flushing {
            deltas.extend(flushing.deltas_for_row(schema, row_id)?);
        }
        deltas.extend(dms.deltas_for_row(schema, row_id)?);
        deltas.sort_by_key(|(ts, _)| *ts);
        Ok(deltas)
    }

    /// Redo and undo history for rows `[start_row, end_row)`.
    pub fn history_for_range(
        &self,
        schema: &Schema,
        start_row: RowId,
        end_row: RowId,
    ) -> Result<RowHistory> {
        let (redo_files, undo_files, flushing, dms) = {
            let inner = self.inner.read();
            (
                inner.redos.clone(),
                inner.undos.clone(),
                inner.flushing.clone(),
                Arc::clone(&inner.dms),
            )
        };

        let mut history = RowHistory::default();
        for file in undo_files.iter() {
            for (key, change) in file.deltas_in_range(schema, start_row, end_row)? {
                history.undo.entry(key.row_id).or_default().push((key.ts, change));
            }
        }
        for file in redo_files.iter() {
            for (key, change) in file.deltas_in_range(schema, start_row, end_row)? {
                history.redo.entry(key.row_id).or_default().push((key.ts, change));
            }
        }
        if let Some(flushing) = flushing {
            for (key, change) in flushing.deltas_in_range(schema, start_row, end_row)? {
                history.redo.entry(key.row_id).or_default().push((key.ts, change));
            }
        }
        for (key, change) in dms.deltas_in_range(schema, start_row, end_row)? {
            history.redo.entry(key.row_id).or_default().push((key.ts, change));
        }

        for deltas in history.redo.values_mut() {
            deltas.sort_by_key(|(ts, _)| *ts);
        }
        for deltas in history.undo.values_mut() {
            deltas.sort_by_key(|(ts, _)| *ts);
        }
        Ok(history)
    }

    /// Every delta currently living in memory (live and flushing
    /// stores), key ascending.
    pub fn dms_deltas(&self, schema: &Schema) -> Result<Vec<(DeltaKey, RowChange)>> {
        let (flushing, dms) = {
            let inner = self.inner.read();
            (inner.flushing.clone(), Arc::clone(&inner.dms))
        };
        let mut deltas = vec![];
        if let Some(flushing) = flushing {
            deltas.extend(flushing.deltas_in_range(schema, 0, RowId::MAX)?);
        }
        deltas.extend(dms.deltas_in_range(schema, 0, RowId::MAX)?);
        deltas.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(deltas)
    }

    /// Flush the live DMS into an immutable REDO file. Returns false
    /// when there was nothing to flush.
    pub fn flush_dms(&self, schema: &Schema) -> Result<bool> {
        let _flush = self.flush_lock.lock().unwrap();

        // freeze: new mutations land in a fresh store, readers keep
        // seeing the frozen one until the file is attached.
        let frozen = {
            let mut inner = self.inner.write();
            if inner.dms.is_empty() {
                return Ok(false);
            }
            inner.generation += 1;
            let name = format!("{}/dms-{}", self.name, inner.generation);
            let frozen = std::mem::replace(
                &mut inner.dms,
                Arc::new(DeltaMemStore::new(&name)),
            );
            inner.flushing = Some(Arc::clone(&frozen));
            frozen
        };

        let mut txn = self.store.new_txn();
        let file = {
            let bw = txn.create()?;
            let mut writer = DeltaFileWriter::new(bw, &self.name)?;
            for entry in frozen.iter(Arc::new(schema.clone())) {
                let (key, change) = entry?;
                writer.append(schema, key, &change)?;
            }
            let (id, _stats) = writer.finish()?;
            txn.commit()?;
            Arc::new(DeltaFile::open(&self.store, self.cache.clone(), id)?)
        };

        info!(
            target: "colt::delta",
            "{}: flushed dms ({} deltas) to {}", self.name, file.len(), file.to_id()
        );

        let mut inner = self.inner.write();
        inner.flushing = None;
        inner.redos.push(file);
        Ok(true)
    }

    /// Replace `old_ids` REDO files with `new_files`, preserving
    /// order. Used by minor and major delta compaction.
    pub fn swap_redos(&self, old_ids: &[BlockId], new_files: Vec<Arc<DeltaFile>>) {
        let mut inner = self.inner.write();
        let at = inner
            .redos
            .iter()
            .position(|f| old_ids.contains(&f.to_id()))
            .unwrap_or(0);
        inner.redos.retain(|f| !old_ids.contains(&f.to_id()));
        for (i, file) in new_files.into_iter().enumerate() {
            inner.redos.insert(at + i, file);
        }
    }

    /// Replace the UNDO file set.
    pub fn swap_undos(&self, old_ids: &[BlockId], new_files: Vec<Arc<DeltaFile>>) {
        let mut inner = self.inner.write();
        inner.undos.retain(|f| !old_ids.contains(&f.to_id()));
        inner.undos.extend(new_files);
    }

    pub fn redo_files(&self) -> Vec<Arc<DeltaFile>> {
        self.inner.read().redos.clone()
    }

    pub fn undo_files(&self) -> Vec<Arc<DeltaFile>> {
        self.inner.read().undos.clone()
    }

    pub fn delta_memstore_size(&self) -> usize {
        let inner = self.inner.read();
        let mut size = inner.dms.ram_anchored();
        if let Some(flushing) = &inner.flushing {
            size += flushing.ram_anchored();
        }
        size
    }

    pub fn delta_memstore_len(&self) -> usize {
        self.inner.read().dms.len()
    }

    pub fn dms_age_secs(&self) -> u64 {
        self.inner.read().dms.age_secs()
    }

    pub fn dms_is_empty(&self) -> bool {
        let inner = self.inner.read();
        inner.dms.is_empty() && inner.flushing.is_none()
    }

    pub fn min_log_index(&self) -> Option<LogIndex> {
        let inner = self.inner.read();
        let mut min = inner.dms.min_log_index();
        if let Some(flushing) = &inner.flushing {
            min = match (min, flushing.min_log_index()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        min
    }

    /// Aggregate REDO stats across files, for scheduler scoring.
    pub fn redo_stats(&self) -> DeltaStats {
        let mut stats = DeltaStats::default();
        for file in self.inner.read().redos.iter() {
            stats.merge(&file.to_stats());
        }
        stats
    }

    /// Estimated bytes held by UNDO deltas entirely below `ahm`.
    pub fn estimate_bytes_in_ancient_undos(&self, ahm: Timestamp) -> u64 {
        self.inner
            .read()
            .undos
            .iter()
            .filter(|f| f.to_stats().max_ts < ahm.0)
            .map(|f| f.on_disk_size())
            .sum()
    }

    /// Drop UNDO files whose every record is below `ahm`. Returns the
    /// dropped block ids, for metadata update and deletion.
    pub fn delete_ancient_undo_deltas(&self, ahm: Timestamp) -> Vec<BlockId> {
        let mut inner = self.inner.write();
        let (ancient, kept): (Vec<_>, Vec<_>) = inner
            .undos
            .drain(..)
            .partition(|f| f.to_stats().max_ts < ahm.0);
        inner.undos = kept;
        ancient.iter().map(|f| f.to_id()).collect()
    }

    pub fn on_disk_size(&self) -> u64 {
        let inner = self.inner.read();
        let redo: u64 = inner.redos.iter().map(|f| f.on_disk_size()).sum();
        let undo: u64 = inner.undos.iter().map(|f| f.on_disk_size()).sum();
        redo + undo
    }
}

#[cfg(test)]
#[path = "tracker_test.rs"]
mod tracker_test;
