//! Module `tablet` implement the tablet coordinator: the write path
//! applying consensus-ordered batches, the snapshot scan entry point,
//! flushes and compactions, and schema alterations.

use log::{info, warn};

use std::{
    collections::HashSet,
    ffi,
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering::SeqCst},
        Arc, Condvar, Mutex, RwLock,
    },
    time,
};

use crate::{
    bstore::BlockStore,
    cache::BlockCache,
    cfile::{reader::ColumnScan, Reader},
    config::Config,
    delta::{apply_change, invert_change, DeltaFile, RowChange, RowHistory, RowState},
    drs::{DiskRowSet, DrsWriter, FlushRow},
    meta::TabletMeta,
    mrs::{MemRowSet, RowEntry},
    mvcc::{MvccManager, ReadMode, Snapshot, Timestamp},
    row::{decode_cell, Row, RowBlock, Value},
    rowsettree::RowSetTree,
    scan::{DrsScan, MergeScan, MrsScan, Predicate, ScanSource, ScanStats, SCAN_BATCH_ROWS},
    schema::{ColumnSchema, Projection, ProjectedColumn, Schema, AUTO_INCREMENT_COL},
    util::Spinlock,
    Error, LogIndex, Result, RowId,
};

/// Default deadline for MVCC snapshot waits.
pub const SNAPSHOT_WAIT: time::Duration = time::Duration::from_secs(30);

/// One row operation within a write batch, in live-column order.
#[derive(Clone, Debug)]
pub enum WriteOp {
    Insert(Row),
    Update {
        key: Vec<Value>,
        cols: Vec<(crate::schema::ColumnId, Option<Value>)>,
    },
    Delete {
        key: Vec<Value>,
    },
}

/// A consensus-ordered batch: one WAL record's worth of row
/// operations, sharing an op id and a timestamp.
#[derive(Clone, Debug)]
pub struct WriteBatch {
    pub op_id: LogIndex,
    /// Replicated batches carry the leader's timestamp; None mints a
    /// fresh one.
    pub ts: Option<Timestamp>,
    pub ops: Vec<WriteOp>,
}

/// Per-row outcome of a write batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpResult {
    Ok,
    AlreadyPresent,
    NotFound,
    Immutable,
}

/// Schema alterations accepted by [Tablet::alter_schema].
#[derive(Clone, Debug)]
pub enum AlterOp {
    AddColumn(ColumnSchema),
    DropColumn(String),
    RenameColumn { from: String, to: String },
    SetEncoding(String, crate::schema::Encoding),
    SetCompression(String, crate::schema::Compression),
    SetImmutable(String, bool),
    SetDefault(String, Vec<u8>),
}

// sorted-order row locks; writers take them per batch in key order,
// which rules out deadlock between concurrent batches.
struct LockManager {
    locked: Mutex<HashSet<Vec<u8>>>,
    cond: Condvar,
}

impl LockManager {
    fn new() -> LockManager {
        LockManager {
            locked: Mutex::new(HashSet::new()),
            cond: Condvar::new(),
        }
    }

    fn lock_all(&self, mut keys: Vec<Vec<u8>>) -> RowLockGuard {
        keys.sort();
        keys.dedup();
        for key in keys.iter() {
            let mut locked = self.locked.lock().unwrap();
            while locked.contains(key) {
                locked = self.cond.wait(locked).unwrap();
            }
            locked.insert(key.clone());
        }
        RowLockGuard { mgr: self, keys }
    }
}

struct RowLockGuard<'a> {
    mgr: &'a LockManager,
    keys: Vec<Vec<u8>>,
}

impl<'a> Drop for RowLockGuard<'a> {
    fn drop(&mut self) {
        let mut locked = self.mgr.locked.lock().unwrap();
        for key in self.keys.drain(..) {
            locked.remove(&key);
        }
        drop(locked);
        self.mgr.cond.notify_all();
    }
}

/// The rowset population visible to reads and writes; replaced
/// atomically on every flush or compaction swap.
pub struct Components {
    pub tree: Arc<RowSetTree>,
    /// MemRowSet frozen by an in-progress flush; scans read it, the
    /// write path probes it for duplicate keys.
    pub flushing_mrs: Option<Arc<MemRowSet>>,
}

/// A single tablet: the mutable apex over one partition's rowsets.
pub struct Tablet {
    config: Config,
    dir: ffi::OsString,
    store: Arc<BlockStore>,
    cache: Arc<BlockCache>,
    mvcc: MvccManager,

    schema: Spinlock<Arc<Schema>>,
    components: Spinlock<Arc<Components>>,
    meta: Mutex<TabletMeta>,

    row_locks: LockManager,
    /// Writers shared, flush/compaction swaps exclusive.
    swap_lock: RwLock<()>,
    /// At most one MemRowSet flush per tablet.
    flush_mutex: Mutex<()>,
    /// At most one WAL GC per tablet.
    log_gc_gate: AtomicBool,

    mrs_generation: AtomicU64,
    auto_increment: AtomicI64,
    last_applied: AtomicU64,
    ops_applied: AtomicU64,
    stop: Arc<AtomicBool>,
}

impl Tablet {
    /// Create a fresh tablet under `config.dir` with `schema`.
    pub fn create(config: Config, schema: Schema) -> Result<Arc<Tablet>> {
        let dir = ffi::OsString::from(config.dir.clone());
        if TabletMeta::exists(&dir) {
            err_at!(InvalidInput, msg: "tablet exists under {:?}", dir)?;
        }
        err_at!(IOError, std::fs::create_dir_all(&dir))?;
        TabletMeta::new(schema).save(&dir)?;
        Self::open(config)
    }

    /// Open a tablet, reconciling metadata against the block store.
    /// A referenced block missing from the store is fatal.
    pub fn open(config: Config) -> Result<Arc<Tablet>> {
        let dir = ffi::OsString::from(config.dir.clone());
        let meta = TabletMeta::load(&dir)?;
        let store = Arc::new(BlockStore::open(&dir)?);
        let cache = Arc::new(BlockCache::new(config.block_cache_capacity));

        // startup reconciliation
        for rs_meta in meta.rowsets.iter() {
            for id in rs_meta.block_ids() {
                if !store.exists(id) {
                    err_at!(
                        Fatal, msg: "rowset {} references missing {}", rs_meta.rowset_id, id
                    )?;
                }
            }
        }

        let schema = Arc::new(meta.to_schema());
        let mut rowsets = vec![];
        for rs_meta in meta.rowsets.iter() {
            rowsets.push(Arc::new(DiskRowSet::open(
                Arc::clone(&store),
                Some(Arc::clone(&cache)),
                rs_meta,
            )?));
        }

        let mrs = Arc::new(MemRowSet::new(&format!("{}/mrs-0", config.name)));
        let tree = Arc::new(RowSetTree::new(mrs, rowsets));

        info!(
            target: "colt::tablet",
            "{}: opened tablet {} with {} rowsets",
            config.name, meta.tablet_id, tree.as_drs().len()
        );

        let tablet = Tablet {
            auto_increment: AtomicI64::new(meta.next_auto_increment),
            last_applied: AtomicU64::new(meta.last_applied_log_index),
            config,
            dir,
            store,
            cache,
            mvcc: MvccManager::new(),

            schema: Spinlock::new(schema),
            components: Spinlock::new(Arc::new(Components {
                tree,
                flushing_mrs: None,
            })),
            meta: Mutex::new(meta),

            row_locks: LockManager::new(),
            swap_lock: RwLock::new(()),
            flush_mutex: Mutex::new(()),
            log_gc_gate: AtomicBool::new(false),

            mrs_generation: AtomicU64::new(1),
            ops_applied: AtomicU64::new(0),
            stop: Arc::new(AtomicBool::new(false)),
        };
        Ok(Arc::new(tablet))
    }

    pub fn as_config(&self) -> &Config {
        &self.config
    }

    pub fn as_mvcc(&self) -> &MvccManager {
        &self.mvcc
    }

    pub fn to_schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema.read())
    }

    fn to_components(&self) -> Arc<Components> {
        Arc::clone(&self.components.read())
    }

    pub fn as_stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Begin shutdown; subsequent writes fail with ServiceUnavailable
    /// and maintenance ops stand down.
    pub fn stop(&self) {
        self.stop.store(true, SeqCst);
    }

    /// The retention horizon: mutations older than this may lose
    /// their UNDO history.
    pub fn ancient_history_mark(&self) -> Timestamp {
        let horizon_ms = self.config.to_history_max_age_sec() * 1000;
        let now = self.mvcc.as_clock().now();
        Timestamp::new(now.to_wall_ms().saturating_sub(horizon_ms), 0)
    }

    /// Lowest WAL index still anchored by un-flushed state; segments
    /// strictly below it are reclaimable.
    pub fn min_unflushed_log_index(&self) -> LogIndex {
        let comps = self.to_components();
        let mut min: Option<LogIndex> = comps.tree.as_mrs().min_log_index();
        if let Some(flushing) = &comps.flushing_mrs {
            min = min_opt(min, flushing.min_log_index());
        }
        for drs in comps.tree.as_drs() {
            min = min_opt(min, drs.min_unflushed_log_index());
        }
        min.unwrap_or_else(|| self.last_applied.load(SeqCst) + 1)
    }

    // ------------------------------------------------------------------
    // write path
    // ------------------------------------------------------------------

    /// Apply one consensus-ordered batch. Phase 1 takes row locks in
    /// deterministic order, phase 2 routes each operation through the
    /// rowset tree, phase 3 commits the MVCC op, phase 4 reports
    /// per-row outcomes.
    pub fn apply_write_batch(&self, batch: WriteBatch) -> Result<Vec<OpResult>> {
        if self.stop.load(SeqCst) {
            err_at!(ServiceUnavailable, msg: "tablet stopping")?;
        }
        let schema = self.to_schema();

        // normalize rows and encode keys up front
        let mut prepared = vec![];
        for op in batch.ops.into_iter() {
            prepared.push(self.prepare_op(&schema, op)?);
        }

        let ts = match batch.ts {
            Some(ts) => {
                self.mvcc.start_op_at(ts)?;
                ts
            }
            None => self.mvcc.start_op(),
        };

        // phase 1: row locks, sorted
        let keys: Vec<Vec<u8>> = prepared.iter().map(|p| p.key.clone()).collect();
        let _row_guard = self.row_locks.lock_all(keys);
        let _swap_guard = self.swap_lock.read().unwrap();

        // phase 2: route through the rowset tree
        let comps = self.to_components();
        let mut results = Vec::with_capacity(prepared.len());
        for op in prepared.into_iter() {
            let result = self.route_op(&schema, &comps, op, ts, batch.op_id);
            match result {
                Ok(result) => results.push(result),
                Err(err) => {
                    self.mvcc.abort_op(ts);
                    return Err(err);
                }
            }
        }

        // phase 3: commit
        self.mvcc.commit_op(ts);
        self.last_applied.store(batch.op_id, SeqCst);
        self.ops_applied.fetch_add(1, SeqCst);

        Ok(results)
    }

    fn prepare_op(&self, schema: &Schema, op: WriteOp) -> Result<PreparedOp> {
        match op {
            WriteOp::Insert(row) => {
                let mut cells = schema.expand_row(row.cells)?;
                if schema.has_auto_increment() {
                    let pos = schema.position_of(AUTO_INCREMENT_COL).unwrap();
                    if cells[pos].is_null() {
                        cells[pos] = Value::Int64(self.auto_increment.fetch_add(1, SeqCst));
                    }
                }
                let row = Row::new(cells);
                schema.validate_row(&row)?;
                let key = schema.encode_pk(&row)?;
                Ok(PreparedOp {
                    key,
                    kind: PreparedKind::Insert(row.cells),
                })
            }
            WriteOp::Update { key, cols } => {
                for (col_id, _) in cols.iter() {
                    let col = match schema.col_by_id(*col_id) {
                        Some(col) => col,
                        None => err_at!(InvalidInput, msg: "no column id {}", col_id)?,
                    };
                    if col.dropped {
                        err_at!(InvalidInput, msg: "update of dropped {}", col.name)?;
                    }
                    let pos = schema.position_of_id(*col_id).unwrap();
                    if pos < schema.num_key_cols {
                        err_at!(InvalidInput, msg: "update of key column {}", col.name)?;
                    }
                }
                let encoded = schema.encode_pk_cells(&key)?;
                Ok(PreparedOp {
                    key: encoded,
                    kind: PreparedKind::Mutate(RowChange::Update { cols }),
                })
            }
            WriteOp::Delete { key } => {
                let encoded = schema.encode_pk_cells(&key)?;
                Ok(PreparedOp {
                    key: encoded,
                    kind: PreparedKind::Mutate(RowChange::Delete),
                })
            }
        }
    }

    fn route_op(
        &self,
        schema: &Arc<Schema>,
        comps: &Components,
        op: PreparedOp,
        ts: Timestamp,
        op_id: LogIndex,
    ) -> Result<OpResult> {
        let op_bytes = (op.key.len() + 32) as u64;
        match op.kind {
            PreparedKind::Insert(cells) => {
                self.route_insert(schema, comps, op.key, cells, ts, op_id, op_bytes)
            }
            PreparedKind::Mutate(change) => {
                if let RowChange::Update { cols } = &change {
                    for (col_id, _) in cols.iter() {
                        let col = schema.col_by_id(*col_id).unwrap();
                        if col.immutable {
                            return Ok(OpResult::Immutable);
                        }
                    }
                }
                self.route_mutate(schema, comps, &op.key, change, ts, op_id, op_bytes)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn route_insert(
        &self,
        schema: &Arc<Schema>,
        comps: &Components,
        key: Vec<u8>,
        cells: Vec<Value>,
        ts: Timestamp,
        op_id: LogIndex,
        op_bytes: u64,
    ) -> Result<OpResult> {
        let mrs = comps.tree.as_mrs();

        // a frozen, mid-flush MemRowSet still arbitrates duplicates
        if let Some(flushing) = &comps.flushing_mrs {
            if let Some(entry) = flushing.get(&key) {
                if !entry.is_deleted_at_tail() {
                    return Ok(OpResult::AlreadyPresent);
                }
            }
        }

        if mrs.contains_key(&key) {
            return match mrs.insert(key, cells, ts, op_id, op_bytes) {
                Ok(()) => Ok(OpResult::Ok),
                Err(Error::AlreadyPresent(_, _)) => Ok(OpResult::AlreadyPresent),
                Err(err) => Err(err),
            };
        }

        // probe covering DiskRowSets: a live row anywhere rejects the
        // insert, a ghost base row takes it as a reinsert
        for drs in comps.tree.find_drs_containing(&key) {
            if let Some(row_id) = drs.check_row_present(&key)? {
                return if drs.is_live_at_tail(schema, row_id)? {
                    Ok(OpResult::AlreadyPresent)
                } else {
                    drs.reinsert(schema, row_id, ts, op_id, cells)?;
                    Ok(OpResult::Ok)
                };
            }
        }

        match mrs.insert(key, cells, ts, op_id, op_bytes) {
            Ok(()) => Ok(OpResult::Ok),
            Err(Error::AlreadyPresent(_, _)) => Ok(OpResult::AlreadyPresent),
            Err(err) => Err(err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn route_mutate(
        &self,
        schema: &Arc<Schema>,
        comps: &Components,
        key: &[u8],
        change: RowChange,
        ts: Timestamp,
        op_id: LogIndex,
        op_bytes: u64,
    ) -> Result<OpResult> {
        let mrs = comps.tree.as_mrs();
        if mrs.contains_key(key) {
            return match mrs.mutate(key, ts, op_id, change, op_bytes) {
                Ok(()) => Ok(OpResult::Ok),
                Err(Error::KeyNotFound(_, _)) => Ok(OpResult::NotFound),
                Err(err) => Err(err),
            };
        }

        // rows frozen by an in-progress flush keep taking mutations;
        // the flush replays anything past its frontier afterwards
        if let Some(flushing) = &comps.flushing_mrs {
            if flushing.contains_key(key) {
                return match flushing.mutate(key, ts, op_id, change, op_bytes) {
                    Ok(()) => Ok(OpResult::Ok),
                    Err(Error::KeyNotFound(_, _)) => Ok(OpResult::NotFound),
                    Err(err) => Err(err),
                };
            }
        }

        for drs in comps.tree.find_drs_containing(key) {
            if drs.mutate(schema, key, ts, op_id, &change)?.is_some() {
                return Ok(OpResult::Ok);
            }
        }
        Ok(OpResult::NotFound)
    }

    // ------------------------------------------------------------------
    // scan path
    // ------------------------------------------------------------------

    /// Open a snapshot scan. `bounds` are encoded-PK bounds;
    /// `projection` resolves against the live schema and may name the
    /// virtual is_deleted column.
    pub fn new_scan(
        &self,
        projection: Projection,
        predicates: Vec<Predicate>,
        bounds: (Bound<Vec<u8>>, Bound<Vec<u8>>),
        mode: ReadMode,
        deadline: time::Duration,
    ) -> Result<TabletScan> {
        let schema = self.to_schema();

        if let ReadMode::Snapshot { ts, .. } = &mode {
            if *ts < self.ancient_history_mark() {
                err_at!(
                    InvalidInput, msg: "snapshot {} below ancient history mark", ts
                )?;
            }
        }
        let snap = self.mvcc.snapshot_for(&mode, deadline)?;

        // columns to materialize: projected plus predicated
        let mut needed = vec![false; schema.len()];
        for col in projection.cols.iter() {
            if let ProjectedColumn::Base(pos) = col {
                needed[*pos] = true;
            }
        }
        for pred in predicates.iter() {
            needed[pred.to_col()] = true;
        }

        let comps = self.to_components();
        let mut sources: Vec<Box<dyn ScanSource>> = vec![];
        for drs in comps.tree.find_drs_intersecting(&bounds) {
            sources.push(Box::new(DrsScan::new(
                drs,
                Arc::clone(&schema),
                snap.clone(),
                &bounds,
                &needed,
                predicates.clone(),
                SCAN_BATCH_ROWS,
            )?));
        }
        if let Some(flushing) = &comps.flushing_mrs {
            sources.push(Box::new(MrsScan::new(
                flushing,
                Arc::clone(&schema),
                snap.clone(),
                bounds.clone(),
            )));
        }
        sources.push(Box::new(MrsScan::new(
            comps.tree.as_mrs(),
            Arc::clone(&schema),
            snap.clone(),
            bounds,
        )));

        Ok(TabletScan {
            schema,
            projection,
            predicates,
            merge: MergeScan::new(sources),
            capacity: self.config.row_block_capacity,
            deadline: time::Instant::now() + deadline,
            stop: Arc::clone(&self.stop),
            stats: ScanStats::default(),
            done: false,
        })
    }

    // ------------------------------------------------------------------
    // maintenance entry points
    // ------------------------------------------------------------------

    /// Flush the MemRowSet into a new DiskRowSet. Returns false when
    /// there was nothing to flush.
    pub fn flush(&self) -> Result<bool> {
        let _flush_guard = self.flush_mutex.lock().unwrap();

        let old_mrs = Arc::clone(self.to_components().tree.as_mrs());
        if old_mrs.is_empty() {
            return Ok(false);
        }

        // flush frontier: wait out everything at or below it
        let flush_ts = self.mvcc.as_clock().now();
        self.mvcc
            .snapshot_for(&ReadMode::YourWrites { bound: flush_ts }, SNAPSHOT_WAIT)?;
        let snap = Snapshot::at(flush_ts);
        let schema = self.to_schema();

        // publish the frozen MemRowSet and a fresh one for new inserts
        let new_mrs = {
            let generation = self.mrs_generation.fetch_add(1, SeqCst);
            Arc::new(MemRowSet::new(&format!(
                "{}/mrs-{}",
                self.config.name, generation
            )))
        };
        {
            let _swap = self.swap_lock.write().unwrap();
            let comps = self.to_components();
            let tree = Arc::new(RowSetTree::new(
                Arc::clone(&new_mrs),
                comps.tree.as_drs().to_vec(),
            ));
            *self.components.write() = Arc::new(Components {
                tree,
                flushing_mrs: Some(Arc::clone(&old_mrs)),
            });
        }

        // write the frozen rows at the flush frontier
        let rowset_id = {
            let mut meta = self.meta.lock().unwrap();
            let id = meta.next_rowset_id;
            meta.next_rowset_id += 1;
            id
        };
        let name = format!("{}/drs-{}", self.config.name, rowset_id);
        let mut writer = DrsWriter::new(&self.store, Arc::clone(&schema), &name)?;
        let mut n_flushed = 0_u64;
        for (key, entry) in old_mrs.iter() {
            if !snap.is_visible(entry.insert_ts) {
                continue; // carried over in the catch-up phase
            }
            writer.append(flush_row_of(&schema, &snap, key, &entry)?)?;
            n_flushed += 1;
        }

        if n_flushed == 0 {
            // every entry landed after the frontier; put them back
            let _swap = self.swap_lock.write().unwrap();
            self.catch_up(&schema, &snap, &old_mrs, None)?;
            let comps = self.to_components();
            *self.components.write() = Arc::new(Components {
                tree: Arc::clone(&comps.tree),
                flushing_mrs: None,
            });
            return Ok(false);
        }

        let artifacts = writer.finish()?;
        let rs_meta = crate::meta::RowSetMeta {
            rowset_id,
            column_blocks: artifacts
                .column_blocks
                .iter()
                .map(|(col_id, block)| crate::meta::ColumnBlock {
                    col_id: *col_id,
                    block: *block,
                })
                .collect(),
            bloom_block: artifacts.bloom_block,
            ad_hoc_index_block: artifacts.pkidx_block,
            undo_blocks: artifacts.undo_blocks.clone(),
            redo_blocks: artifacts.redo_blocks.clone(),
            dms_min_log_idx: None,
            n_rows: artifacts.n_rows,
            min_key: artifacts.min_key.clone(),
            max_key: artifacts.max_key.clone(),
        };
        let new_drs = Arc::new(DiskRowSet::open(
            Arc::clone(&self.store),
            Some(Arc::clone(&self.cache)),
            &rs_meta,
        )?);

        // attach: swap the new rowset in, replay post-frontier state
        {
            let _swap = self.swap_lock.write().unwrap();
            self.catch_up(&schema, &snap, &old_mrs, Some(&new_drs))?;

            let comps = self.to_components();
            let mut rowsets = comps.tree.as_drs().to_vec();
            rowsets.push(Arc::clone(&new_drs));
            let tree = Arc::new(RowSetTree::new(
                Arc::clone(comps.tree.as_mrs()),
                rowsets,
            ));
            *self.components.write() = Arc::new(Components {
                tree,
                flushing_mrs: None,
            });
        }
        self.persist_meta()?;

        info!(
            target: "colt::tablet",
            "{}: flushed {} rows into drs-{}", self.config.name, n_flushed, rowset_id
        );
        Ok(true)
    }

    // replay entries and mutations the flush frontier did not cover
    // into the live MemRowSet / the new rowset's DeltaMemStore.
    fn catch_up(
        &self,
        schema: &Arc<Schema>,
        snap: &Snapshot,
        old_mrs: &MemRowSet,
        new_drs: Option<&Arc<DiskRowSet>>,
    ) -> Result<()> {
        let comps = self.to_components();
        let mrs = comps.tree.as_mrs();

        for (key, entry) in old_mrs.iter() {
            if !snap.is_visible(entry.insert_ts) {
                mrs.adopt(key, entry, 64)?;
                continue;
            }
            let late: Vec<_> = entry
                .chain
                .iter()
                .filter(|m| !snap.is_visible(m.ts))
                .collect();
            if late.is_empty() {
                continue;
            }
            let drs = match new_drs {
                Some(drs) => drs,
                None => err_at!(Fatal, msg: "late mutations without a rowset")?,
            };
            let row_id = match drs.check_row_present(&key)? {
                Some(row_id) => row_id,
                None => err_at!(Fatal, msg: "flushed row lost its base")?,
            };
            for mutation in late {
                drs.as_tracker().add_mutation(
                    schema,
                    row_id,
                    mutation.ts,
                    mutation.op_id,
                    &mutation.change,
                )?;
            }
        }
        Ok(())
    }

    /// Flush the DeltaMemStore of the rowset with the largest one.
    pub fn flush_biggest_dms(&self) -> Result<bool> {
        let schema = self.to_schema();
        let comps = self.to_components();
        let target = comps
            .tree
            .as_drs()
            .iter()
            .max_by_key(|drs| drs.delta_memstore_size());
        match target {
            Some(drs) if drs.delta_memstore_size() > 0 => {
                let flushed = drs.flush_deltas(&schema)?;
                if flushed {
                    self.persist_meta()?;
                }
                Ok(flushed)
            }
            _ => Ok(false),
        }
    }

    /// Merge several overlapping DiskRowSets into one with a disjoint
    /// key range. Returns false when no overlapping group exists.
    pub fn compact(&self) -> Result<bool> {
        if self.config.disable_compaction {
            return Ok(false);
        }
        let schema = self.to_schema();
        let comps = self.to_components();

        // pick the first group of range-overlapping rowsets
        let all = comps.tree.as_drs().to_vec();
        let mut group: Vec<Arc<DiskRowSet>> = vec![];
        for drs in all.iter() {
            match group.last() {
                None => group.push(Arc::clone(drs)),
                Some(last) if drs.as_min_key() <= last.as_max_key() => {
                    group.push(Arc::clone(drs))
                }
                Some(_) if group.len() >= 2 => break,
                Some(_) => {
                    group.clear();
                    group.push(Arc::clone(drs));
                }
            }
        }
        if group.len() < 2 {
            return Ok(false);
        }

        self.merge_rowsets(&schema, group, self.ancient_history_mark())?;
        Ok(true)
    }

    fn merge_rowsets(
        &self,
        schema: &Arc<Schema>,
        sources: Vec<Arc<DiskRowSet>>,
        ahm: Timestamp,
    ) -> Result<()> {
        // exclusive access to every source
        let guards: Vec<_> = sources
            .iter()
            .map(|drs| drs.compact_flush_lock.lock().unwrap())
            .collect();

        // move DMS contents into files so the merge sees them
        for drs in sources.iter() {
            drs.flush_deltas(schema)?;
        }
        let initial_redo_files: Vec<Vec<Arc<DeltaFile>>> = sources
            .iter()
            .map(|drs| drs.as_tracker().redo_files())
            .collect();
        let initial_redos: Vec<Vec<crate::bstore::BlockId>> = initial_redo_files
            .iter()
            .map(|files| files.iter().map(|f| f.to_id()).collect())
            .collect();

        // raw, unfolded view of every source: base images plus their
        // complete delta history from the immutable files. Mutations
        // racing in through the DeltaMemStores replay at attach time.
        let mut streams = vec![];
        for (drs, redo_files) in sources.iter().zip(initial_redo_files.iter()) {
            streams.push(SourceRows::open(drs, schema, redo_files)?);
        }

        let rowset_id = {
            let mut meta = self.meta.lock().unwrap();
            let id = meta.next_rowset_id;
            meta.next_rowset_id += 1;
            id
        };
        let name = format!("{}/drs-{}", self.config.name, rowset_id);
        let mut writer = DrsWriter::new(&self.store, Arc::clone(schema), &name)?;
        let mut n_rows = 0_u64;

        // key-ordered merge of the raw rows. The live version of a key
        // wins; every version keeps its history: existing UNDOs carry
        // over, folded REDOs invert into fresh UNDOs, and retired
        // incarnations of the same key fold wholesale into UNDO
        // history beneath the winner.
        let mut peeked: Vec<Option<RawRow>> = (0..streams.len()).map(|_| None).collect();
        loop {
            for (at, slot) in peeked.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = streams[at].next(schema)?;
                }
            }
            let min_key: Vec<u8> = match peeked
                .iter()
                .filter_map(|slot| slot.as_ref().map(|row| row.key.clone()))
                .min()
            {
                Some(key) => key,
                None => break,
            };

            let mut parked: Vec<RawRow> = vec![];
            for slot in peeked.iter_mut() {
                if matches!(slot, Some(row) if row.key == min_key) {
                    parked.push(slot.take().unwrap());
                }
            }

            // the live incarnation wins; among ghosts, the one that
            // died last
            let winner_at = match parked.iter().position(|row| row.is_live_at_tail()) {
                Some(at) => at,
                None => {
                    let mut at = 0;
                    let mut best = Timestamp::MIN;
                    for (i, row) in parked.iter().enumerate() {
                        let died = row
                            .redos
                            .last()
                            .map(|(ts, _)| *ts)
                            .unwrap_or(Timestamp::MIN);
                        if died >= best {
                            best = died;
                            at = i;
                        }
                    }
                    at
                }
            };
            let winner = parked.remove(winner_at);
            let folded = fold_history(schema, ahm, winner, true)?;

            let mut undos = folded.undos;
            for loser in parked.into_iter() {
                undos.extend(fold_history(schema, ahm, loser, false)?.undos);
            }
            undos.sort_by_key(|(ts, _)| *ts);

            let redos = match folded.redo {
                Some(redo) => vec![redo],
                None => vec![],
            };
            // ghost rows whose deletion and history fell below the
            // retention horizon are reclaimed here
            if let Some((died, _)) = redos.first() {
                if *died < ahm && undos.is_empty() {
                    continue;
                }
            }

            writer.append(FlushRow {
                key: folded.key,
                cells: folded.state.cells,
                undos,
                redos,
            })?;
            n_rows += 1;
        }

        let new_drs = if n_rows > 0 {
            let artifacts = writer.finish()?;
            let rs_meta = crate::meta::RowSetMeta {
                rowset_id,
                column_blocks: artifacts
                    .column_blocks
                    .iter()
                    .map(|(col_id, block)| crate::meta::ColumnBlock {
                        col_id: *col_id,
                        block: *block,
                    })
                    .collect(),
                bloom_block: artifacts.bloom_block,
                ad_hoc_index_block: artifacts.pkidx_block,
                undo_blocks: artifacts.undo_blocks.clone(),
                redo_blocks: artifacts.redo_blocks.clone(),
                dms_min_log_idx: None,
                n_rows: artifacts.n_rows,
                min_key: artifacts.min_key.clone(),
                max_key: artifacts.max_key.clone(),
            };
            Some(Arc::new(DiskRowSet::open(
                Arc::clone(&self.store),
                Some(Arc::clone(&self.cache)),
                &rs_meta,
            )?))
        } else {
            // every row fell below the retention horizon; the sources
            // retire with no replacement
            None
        };

        // attach under the swap lock; replay mutations that raced in
        {
            let _swap = self.swap_lock.write().unwrap();
            if let Some(new_drs) = &new_drs {
                for (drs, initial) in sources.iter().zip(initial_redos.iter()) {
                    self.replay_new_deltas(schema, drs, initial, new_drs)?;
                }
            }

            let comps = self.to_components();
            let retired: HashSet<u64> =
                sources.iter().map(|drs| drs.to_rowset_id()).collect();
            let mut rowsets: Vec<Arc<DiskRowSet>> = comps
                .tree
                .as_drs()
                .iter()
                .filter(|drs| !retired.contains(&drs.to_rowset_id()))
                .cloned()
                .collect();
            if let Some(new_drs) = &new_drs {
                rowsets.push(Arc::clone(new_drs));
            }
            let tree = Arc::new(RowSetTree::new(
                Arc::clone(comps.tree.as_mrs()),
                rowsets,
            ));
            *self.components.write() = Arc::new(Components {
                tree,
                flushing_mrs: comps.flushing_mrs.clone(),
            });
        }
        drop(guards);
        self.persist_meta()?;

        // retired blocks are garbage once the swap is durable
        for drs in sources.iter() {
            for id in drs.to_meta().block_ids() {
                self.store.delete(id).ok();
            }
        }

        info!(
            target: "colt::tablet",
            "{}: merged {} rowsets into drs-{} ({} rows)",
            self.config.name, sources.len(), rowset_id, n_rows
        );
        Ok(())
    }

    // replay deltas that landed in `drs` after `initial` was captured
    // onto the freshly merged rowset, re-keyed through its pk index.
    fn replay_new_deltas(
        &self,
        schema: &Arc<Schema>,
        drs: &Arc<DiskRowSet>,
        initial: &[crate::bstore::BlockId],
        new_drs: &Arc<DiskRowSet>,
    ) -> Result<()> {
        let mut late: Vec<(crate::delta::DeltaKey, RowChange)> = vec![];
        for file in drs.as_tracker().redo_files() {
            if !initial.contains(&file.to_id()) {
                late.extend(file.iter_all(schema)?);
            }
        }
        for entry in drs.as_tracker().dms_deltas(schema)? {
            late.push(entry);
        }
        if late.is_empty() {
            return Ok(());
        }
        late.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut pk_reader = drs.open_pk_reader()?;
        for (key, change) in late.into_iter() {
            let pk = match pk_reader.read_value_at(key.row_id as u64)? {
                Value::Binary(pk) => pk,
                value => err_at!(Corruption, msg: "pk cell {}", value)?,
            };
            match new_drs.check_row_present(&pk)? {
                Some(row_id) => {
                    new_drs
                        .as_tracker()
                        .add_mutation(schema, row_id, key.ts, 0, &change)?;
                }
                None => warn!(
                    target: "colt::tablet",
                    "{}: dropped late delta for vanished key", self.config.name
                ),
            }
        }
        Ok(())
    }

    /// Minor-compact the rowset with the most REDO files.
    pub fn minor_delta_compact(&self) -> Result<bool> {
        let schema = self.to_schema();
        let comps = self.to_components();
        let target = comps
            .tree
            .as_drs()
            .iter()
            .max_by_key(|drs| drs.redo_file_count());
        let outcome = match target {
            Some(drs) => drs.minor_compact_delta_stores(&schema)?,
            None => None,
        };
        match outcome {
            Some(outcome) => {
                self.persist_meta()?;
                for id in outcome.removed_blocks {
                    self.store.delete(id).ok();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Major-compact the rowset whose REDO files weigh the most.
    pub fn major_delta_compact(&self) -> Result<bool> {
        if self.config.disable_compaction {
            return Ok(false);
        }
        let schema = self.to_schema();
        let ahm = self.ancient_history_mark();
        let comps = self.to_components();
        let target = comps
            .tree
            .as_drs()
            .iter()
            .max_by_key(|drs| drs.redo_stats().update_count() + drs.redo_stats().n_deletes);
        let outcome = match target {
            Some(drs) if drs.redo_file_count() > 0 => {
                drs.major_compact_delta_stores(&schema, ahm)?
            }
            _ => None,
        };
        match outcome {
            Some(outcome) => {
                self.persist_meta()?;
                for id in outcome.removed_blocks {
                    self.store.delete(id).ok();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reclaim UNDO files wholly below the ancient history mark.
    pub fn gc_ancient_history(&self) -> Result<u64> {
        let ahm = self.ancient_history_mark();
        let comps = self.to_components();
        let mut freed = 0_u64;
        for drs in comps.tree.as_drs() {
            let blocks = drs.delete_ancient_undo_deltas(ahm)?;
            if !blocks.is_empty() {
                self.persist_meta()?;
                for id in blocks {
                    freed += self.store.on_disk_size(id).unwrap_or(0);
                    self.store.delete(id).ok();
                }
            }
        }
        Ok(freed)
    }

    /// Publish the WAL GC watermark; the log itself is external.
    /// Guarded so only one GC round runs per tablet.
    pub fn log_gc(&self) -> Result<Option<LogIndex>> {
        if self.log_gc_gate.swap(true, SeqCst) {
            return Ok(None);
        }
        let watermark = self.min_unflushed_log_index();
        self.persist_meta()?;
        self.log_gc_gate.store(false, SeqCst);
        Ok(Some(watermark))
    }

    /// Apply a schema alteration. Data movement is deferred: added
    /// columns fill from defaults on read, dropped columns are
    /// tombstoned until the next rewrite.
    pub fn alter_schema(&self, op: AlterOp) -> Result<()> {
        let mut meta = self.meta.lock().unwrap();
        let mut schema = meta.to_schema();

        match op {
            AlterOp::AddColumn(mut col) => {
                if schema.position_of(&col.name).is_some() {
                    err_at!(InvalidInput, msg: "column {} exists", col.name)?;
                }
                if !col.nullable && col.default.is_none() {
                    err_at!(
                        InvalidInput, msg: "column {} needs a default or null", col.name
                    )?;
                }
                col.id = schema.next_col_id;
                schema.next_col_id += 1;
                schema.cols.push(col);
            }
            AlterOp::DropColumn(name) => {
                let pos = match schema.position_of(&name) {
                    Some(pos) => pos,
                    None => err_at!(InvalidInput, msg: "no column {}", name)?,
                };
                if pos < schema.num_key_cols {
                    err_at!(InvalidInput, msg: "cannot drop key column {}", name)?;
                }
                schema.cols[pos].dropped = true;
            }
            AlterOp::RenameColumn { from, to } => {
                if schema.position_of(&to).is_some() {
                    err_at!(InvalidInput, msg: "column {} exists", to)?;
                }
                let pos = match schema.position_of(&from) {
                    Some(pos) => pos,
                    None => err_at!(InvalidInput, msg: "no column {}", from)?,
                };
                schema.cols[pos].name = to;
            }
            AlterOp::SetEncoding(name, encoding) => {
                let pos = match schema.position_of(&name) {
                    Some(pos) => pos,
                    None => err_at!(InvalidInput, msg: "no column {}", name)?,
                };
                if !encoding.applies_to(&schema.cols[pos].ctype) {
                    err_at!(InvalidInput, msg: "{:?} on column {}", encoding, name)?;
                }
                schema.cols[pos].encoding = encoding;
            }
            AlterOp::SetCompression(name, compression) => {
                let pos = match schema.position_of(&name) {
                    Some(pos) => pos,
                    None => err_at!(InvalidInput, msg: "no column {}", name)?,
                };
                schema.cols[pos].compression = compression;
            }
            AlterOp::SetImmutable(name, immutable) => {
                let pos = match schema.position_of(&name) {
                    Some(pos) => pos,
                    None => err_at!(InvalidInput, msg: "no column {}", name)?,
                };
                schema.cols[pos].immutable = immutable;
            }
            AlterOp::SetDefault(name, default) => {
                let pos = match schema.position_of(&name) {
                    Some(pos) => pos,
                    None => err_at!(InvalidInput, msg: "no column {}", name)?,
                };
                schema.cols[pos].default = Some(default);
            }
        }

        meta.schemas.push(schema.clone());
        meta.save(&self.dir)?;
        drop(meta);

        *self.schema.write() = Arc::new(schema);
        Ok(())
    }

    /// Re-derive the durable superblock from live state and save it.
    fn persist_meta(&self) -> Result<()> {
        let comps = self.to_components();
        let mut meta = self.meta.lock().unwrap();
        meta.rowsets = comps.tree.as_drs().iter().map(|drs| drs.to_meta()).collect();
        meta.next_auto_increment = self.auto_increment.load(SeqCst);
        meta.last_applied_log_index = self.last_applied.load(SeqCst);
        meta.save(&self.dir)
    }

    // stats feeding the maintenance scheduler

    pub fn mrs_ram_anchored(&self) -> u64 {
        let comps = self.to_components();
        let mut bytes = comps.tree.as_mrs().ram_anchored() as u64;
        if let Some(flushing) = &comps.flushing_mrs {
            bytes += flushing.ram_anchored() as u64;
        }
        bytes
    }

    pub fn mrs_age_secs(&self) -> u64 {
        self.to_components().tree.as_mrs().age_secs()
    }

    pub fn logs_retained_bytes(&self) -> u64 {
        let comps = self.to_components();
        let mut bytes = comps.tree.as_mrs().log_replay_size();
        if let Some(flushing) = &comps.flushing_mrs {
            bytes += flushing.log_replay_size();
        }
        bytes
    }

    pub fn dms_ram_anchored(&self) -> u64 {
        self.to_components()
            .tree
            .as_drs()
            .iter()
            .map(|drs| drs.delta_memstore_size() as u64)
            .sum()
    }

    /// Write batches applied so far; the scheduler derives its
    /// workload score from the arrival rate.
    pub fn ops_applied(&self) -> u64 {
        self.ops_applied.load(SeqCst)
    }

    /// Age of the oldest live DeltaMemStore, in seconds.
    pub fn max_dms_age_secs(&self) -> u64 {
        self.to_components()
            .tree
            .as_drs()
            .iter()
            .filter(|drs| !drs.as_tracker().dms_is_empty())
            .map(|drs| drs.as_tracker().dms_age_secs())
            .max()
            .unwrap_or(0)
    }

    /// Highest REDO-file stack across rowsets.
    pub fn max_redo_file_count(&self) -> usize {
        self.to_components()
            .tree
            .as_drs()
            .iter()
            .map(|drs| drs.redo_file_count())
            .max()
            .unwrap_or(0)
    }

    /// `(updates, deletes, rows)` of the rowset whose REDO files weigh
    /// the most, for major-compaction scoring.
    pub fn redo_weight(&self) -> (u64, u64, u64) {
        let comps = self.to_components();
        comps
            .tree
            .as_drs()
            .iter()
            .map(|drs| {
                let stats = drs.redo_stats();
                (stats.update_count(), stats.n_deletes, drs.count_rows())
            })
            .max_by_key(|(updates, deletes, _)| updates + deletes)
            .unwrap_or((0, 0, 0))
    }

    /// Size of the largest group of range-overlapping rowsets.
    pub fn max_overlap_group(&self) -> usize {
        let comps = self.to_components();
        let mut best = 0;
        let mut group_len = 0;
        let mut group_max: Vec<u8> = vec![];
        for drs in comps.tree.as_drs().iter() {
            if group_len > 0 && drs.as_min_key() <= group_max.as_slice() {
                group_len += 1;
                if drs.as_max_key() > group_max.as_slice() {
                    group_max = drs.as_max_key().to_vec();
                }
            } else {
                best = best.max(group_len);
                group_len = 1;
                group_max = drs.as_max_key().to_vec();
            }
        }
        best.max(group_len)
    }

    /// Estimated bytes of UNDO history wholly below the retention
    /// horizon.
    pub fn ancient_undo_bytes(&self) -> u64 {
        let ahm = self.ancient_history_mark();
        self.to_components()
            .tree
            .as_drs()
            .iter()
            .map(|drs| drs.estimate_bytes_in_ancient_undos(ahm))
            .sum()
    }

    pub fn count_live_rows(&self) -> u64 {
        let comps = self.to_components();
        let mut count = comps.tree.as_mrs().count_live_rows() as u64;
        for drs in comps.tree.as_drs() {
            count += drs.count_live_rows();
        }
        count
    }

    /// Walk every rowset checking key order and rowid density.
    pub fn validate(&self) -> Result<()> {
        let comps = self.to_components();
        for drs in comps.tree.as_drs() {
            let mut pk_reader = drs.open_pk_reader()?;
            if pk_reader.to_value_count() != drs.count_rows() {
                err_at!(
                    Fatal, msg: "drs-{} pk index {} rows of {}",
                    drs.to_rowset_id(), pk_reader.to_value_count(), drs.count_rows()
                )?;
            }
            let mut scan = pk_reader.scan_from_ordinal(0)?;
            let mut prev: Option<Vec<u8>> = None;
            loop {
                let mut out = vec![];
                {
                    let n = scan.next_values(&mut pk_reader, 128, &mut out)?;
                    if n == 0 {
                        break;
                    }
                }
                for value in out.into_iter() {
                    let key = match value {
                        Value::Binary(key) => key,
                        value => err_at!(Corruption, msg: "pk cell {}", value)?,
                    };
                    if let Some(prev) = &prev {
                        if *prev >= key {
                            err_at!(Fatal, msg: "unordered pk in drs-{}", drs.to_rowset_id())?;
                        }
                    }
                    prev = Some(key);
                }
            }
        }
        Ok(())
    }
}

struct PreparedOp {
    key: Vec<u8>,
    kind: PreparedKind,
}

enum PreparedKind {
    Insert(Vec<Value>),
    Mutate(RowChange),
}

fn min_opt(a: Option<LogIndex>, b: Option<LogIndex>) -> Option<LogIndex> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

// one source row of a merging compaction, unfolded: the on-disk base
// image plus its complete UNDO/REDO history.
struct RawRow {
    key: Vec<u8>,
    cells: Vec<Value>,
    undos: Vec<(Timestamp, RowChange)>,
    redos: Vec<(Timestamp, RowChange)>,
}

impl RawRow {
    fn is_live_at_tail(&self) -> bool {
        !matches!(self.redos.last(), Some((_, change)) if change.is_delete())
    }
}

// key-ordered reader over one source rowset's raw rows. The delta
// history comes from the immutable files captured when the merge
// started; whatever lands in the DeltaMemStore afterwards replays at
// attach time.
struct SourceRows {
    pk_reader: Reader,
    pk_scan: ColumnScan,
    cols: Vec<Option<(Reader, ColumnScan)>>,
    fill: Vec<Option<Value>>,
    history: RowHistory,
    n_rows: RowId,
    next_row: RowId,
}

impl SourceRows {
    fn open(
        drs: &Arc<DiskRowSet>,
        schema: &Arc<Schema>,
        redo_files: &[Arc<DeltaFile>],
    ) -> Result<SourceRows> {
        let mut pk_reader = drs.open_pk_reader()?;
        let pk_scan = pk_reader.scan_from_ordinal(0)?;

        let mut cols = vec![];
        let mut fill = vec![];
        for col in schema.cols.iter() {
            match drs.open_column_reader(col.id)? {
                Some(mut reader) => {
                    let scan = reader.scan_from_ordinal(0)?;
                    cols.push(Some((reader, scan)));
                    fill.push(None);
                }
                None => {
                    cols.push(None);
                    fill.push(match &col.default {
                        Some(bytes) => Some(decode_cell(&col.ctype, bytes)?),
                        None => None,
                    });
                }
            }
        }

        let mut history = RowHistory::default();
        for file in drs.as_tracker().undo_files() {
            for (key, change) in file.iter_all(schema)? {
                history.undo.entry(key.row_id).or_default().push((key.ts, change));
            }
        }
        for file in redo_files.iter() {
            for (key, change) in file.iter_all(schema)? {
                history.redo.entry(key.row_id).or_default().push((key.ts, change));
            }
        }
        for deltas in history.undo.values_mut() {
            deltas.sort_by_key(|(ts, _)| *ts);
        }
        for deltas in history.redo.values_mut() {
            deltas.sort_by_key(|(ts, _)| *ts);
        }

        Ok(SourceRows {
            pk_reader,
            pk_scan,
            cols,
            fill,
            history,
            n_rows: drs.count_rows() as RowId,
            next_row: 0,
        })
    }

    fn next(&mut self, schema: &Schema) -> Result<Option<RawRow>> {
        if self.next_row >= self.n_rows {
            return Ok(None);
        }
        let row_id = self.next_row;
        self.next_row += 1;

        let mut keys = vec![];
        if self.pk_scan.next_values(&mut self.pk_reader, 1, &mut keys)? != 1 {
            err_at!(Corruption, msg: "pk index short of base rows")?;
        }
        let key = match keys.pop().unwrap() {
            Value::Binary(key) => key,
            value => err_at!(Corruption, msg: "pk cell {}", value)?,
        };

        let mut cells = Vec::with_capacity(schema.len());
        for (pos, slot) in self.cols.iter_mut().enumerate() {
            match slot {
                Some((reader, scan)) => {
                    let mut out = vec![];
                    if scan.next_values(reader, 1, &mut out)? != 1 {
                        err_at!(Corruption, msg: "column {} short of base rows", pos)?;
                    }
                    cells.push(out.pop().unwrap());
                }
                None => cells.push(self.fill[pos].clone().unwrap_or(Value::Null)),
            }
        }

        Ok(Some(RawRow {
            key,
            cells,
            undos: self.history.undo.remove(&row_id).unwrap_or_default(),
            redos: self.history.redo.remove(&row_id).unwrap_or_default(),
        }))
    }
}

struct FoldedRow {
    key: Vec<u8>,
    state: RowState,
    undos: Vec<(Timestamp, RowChange)>,
    redo: Option<(Timestamp, RowChange)>,
}

// fold a raw row's REDO history into its base image, inverting every
// folded mutation into the UNDO list, exactly as major delta
// compaction does. With `keep_trailing_delete` a dead row keeps its
// deletion on the REDO side; without it the deletion inverts like
// everything else, which is how a retired incarnation becomes pure
// UNDO history beneath the incarnation that replaced it. UNDO records
// below `ahm` are dropped.
fn fold_history(
    schema: &Schema,
    ahm: Timestamp,
    row: RawRow,
    keep_trailing_delete: bool,
) -> Result<FoldedRow> {
    let mut state = RowState::new(row.cells);
    let mut undos: Vec<(Timestamp, RowChange)> = row
        .undos
        .into_iter()
        .filter(|(ts, _)| *ts >= ahm)
        .collect();
    let mut trailing_redo = None;

    let n = row.redos.len();
    for (i, (ts, change)) in row.redos.into_iter().enumerate() {
        let last = i + 1 == n;
        if last && change.is_delete() && keep_trailing_delete {
            trailing_redo = Some((ts, change));
            break;
        }
        if ts >= ahm {
            undos.push((ts, invert_change(schema, &state, &change)?));
        }
        apply_change(schema, &mut state, &change)?;
    }
    undos.sort_by_key(|(ts, _)| *ts);

    Ok(FoldedRow {
        key: row.key,
        state,
        undos,
        redo: trailing_redo,
    })
}

// compose the flush image of one MemRowSet entry: the base cells at
// the flush frontier, UNDO history below it, and a trailing REDO
// delete for rows dead at the frontier.
fn flush_row_of(
    schema: &Schema,
    snap: &Snapshot,
    key: Vec<u8>,
    entry: &RowEntry,
) -> Result<FlushRow> {
    let mut cells = entry.cells.clone();
    cells.resize(schema.len(), Value::Null);
    let mut state = RowState::new(cells);
    let mut undos = vec![(entry.insert_ts, RowChange::Delete)];
    let mut redos = vec![];

    let visible: Vec<_> = entry
        .chain
        .iter()
        .filter(|m| snap.is_visible(m.ts))
        .collect();
    let n = visible.len();
    for (i, mutation) in visible.into_iter().enumerate() {
        let last = i + 1 == n;
        if last && mutation.change.is_delete() {
            redos.push((mutation.ts, RowChange::Delete));
            break;
        }
        undos.push((mutation.ts, invert_change(schema, &state, &mutation.change)?));
        apply_change(schema, &mut state, &mutation.change)?;
    }

    Ok(FlushRow {
        key,
        cells: state.cells,
        undos,
        redos,
    })
}

/// Iterator of [RowBlock] values for one scan.
pub struct TabletScan {
    schema: Arc<Schema>,
    projection: Projection,
    predicates: Vec<Predicate>,
    merge: MergeScan,
    capacity: usize,
    deadline: time::Instant,
    stop: Arc<AtomicBool>,
    stats: ScanStats,
    done: bool,
}

impl TabletScan {
    pub fn to_stats(&self) -> ScanStats {
        let mut stats = self.merge.to_stats();
        stats.rows_returned = self.stats.rows_returned;
        stats.rows_scanned += self.stats.rows_scanned;
        stats
    }

    fn project(&self, row: &ScanRow) -> Result<Row> {
        let mut cells = Vec::with_capacity(self.projection.len());
        for col in self.projection.cols.iter() {
            match col {
                ProjectedColumn::IsDeleted => cells.push(Value::Bool(row.deleted)),
                ProjectedColumn::Base(pos) => {
                    let value = match &row.cells[*pos] {
                        // fill from the column default for rows that
                        // predate the column
                        Value::Null => match &self.schema.as_col(*pos).default {
                            Some(bytes) => {
                                decode_cell(&self.schema.as_col(*pos).ctype, bytes)?
                            }
                            None => Value::Null,
                        },
                        value => value.clone(),
                    };
                    cells.push(value);
                }
            }
        }
        Ok(Row::new(cells))
    }

    fn wants_ghosts(&self) -> bool {
        self.projection
            .cols
            .iter()
            .any(|c| matches!(c, ProjectedColumn::IsDeleted))
    }
}

impl Iterator for TabletScan {
    type Item = Result<RowBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.stop.load(SeqCst) {
            self.done = true;
            let prefix = format!("{}:{}", file!(), line!());
            return Some(Err(Error::Aborted(prefix, "tablet stopping".to_string())));
        }
        if time::Instant::now() > self.deadline {
            self.done = true;
            let prefix = format!("{}:{}", file!(), line!());
            return Some(Err(Error::TimedOut(prefix, "scan deadline".to_string())));
        }

        let mut rows = vec![];
        while rows.len() < self.capacity {
            let row = match self.merge.next() {
                Some(Ok(row)) => row,
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    break;
                }
            };
            self.stats.rows_scanned += 1;

            if row.deleted && !self.wants_ghosts() {
                continue;
            }
            let selected = self
                .predicates
                .iter()
                .all(|pred| pred.matches(&row.cells[pred.to_col()]));
            if !selected {
                continue;
            }

            match self.project(&row) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
            self.stats.rows_returned += 1;
        }

        if rows.is_empty() {
            None
        } else {
            Some(Ok(RowBlock { rows }))
        }
    }
}

#[cfg(test)]
#[path = "tablet_test.rs"]
mod tablet_test;
