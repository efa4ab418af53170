use std::sync::Arc;

use super::*;
use crate::{
    mvcc::Timestamp,
    row::Value,
    schema::{ColumnSchema, ColumnType, Schema},
};

pub(crate) fn test_store(name: &str) -> Arc<BlockStore> {
    let dir = std::env::temp_dir().join("colt-drs-test").join(name);
    std::fs::remove_dir_all(&dir).ok();
    Arc::new(BlockStore::open(dir.as_os_str()).unwrap())
}

pub(crate) fn drs_schema() -> Arc<Schema> {
    let cols = vec![
        ColumnSchema::new("id", ColumnType::Int64),
        ColumnSchema::new("word", ColumnType::String),
        ColumnSchema::new("count", ColumnType::Int32).set_nullable(true),
    ];
    Arc::new(Schema::new(cols, 1).unwrap())
}

pub(crate) fn drs_key(i: i64) -> Vec<u8> {
    ((i as u64) ^ 0x8000_0000_0000_0000).to_be_bytes().to_vec()
}

fn drs_cells(i: i64) -> Vec<Value> {
    vec![
        Value::Int64(i),
        Value::String(format!("w{:04}", i)),
        Value::Int32(i as i32),
    ]
}

/// Build a rowset holding `n` rows with keys `first..first+n`, each
/// inserted at ts 10.
pub(crate) fn build_drs(store: &Arc<BlockStore>, rowset_id: u64, first: i64, n: i64) -> DiskRowSet {
    let schema = drs_schema();
    let mut writer =
        DrsWriter::new(store, Arc::clone(&schema), &format!("drs-{}", rowset_id)).unwrap();
    for i in first..first + n {
        writer
            .append(FlushRow {
                key: drs_key(i),
                cells: drs_cells(i),
                undos: vec![(Timestamp(10), RowChange::Delete)],
                redos: vec![],
            })
            .unwrap();
    }
    let artifacts = writer.finish().unwrap();

    let meta = RowSetMeta {
        rowset_id,
        column_blocks: artifacts
            .column_blocks
            .iter()
            .map(|(col_id, block)| ColumnBlock {
                col_id: *col_id,
                block: *block,
            })
            .collect(),
        bloom_block: artifacts.bloom_block,
        ad_hoc_index_block: artifacts.pkidx_block,
        undo_blocks: artifacts.undo_blocks,
        redo_blocks: artifacts.redo_blocks,
        dms_min_log_idx: None,
        n_rows: artifacts.n_rows,
        min_key: artifacts.min_key,
        max_key: artifacts.max_key,
    };
    DiskRowSet::open(Arc::clone(store), None, &meta).unwrap()
}

#[test]
fn test_drs_present_and_mutate() {
    let store = test_store("present");
    let schema = drs_schema();
    let drs = build_drs(&store, 1, 0, 100);

    assert_eq!(drs.count_rows(), 100);
    assert_eq!(drs.count_live_rows(), 100);
    assert!(drs.on_disk_size() > 0);

    // present keys resolve to their dense row ids
    assert_eq!(drs.check_row_present(&drs_key(0)).unwrap(), Some(0));
    assert_eq!(drs.check_row_present(&drs_key(57)).unwrap(), Some(57));
    assert_eq!(drs.check_row_present(&drs_key(1000)).unwrap(), None);

    // update through the tracker
    let change = RowChange::Update {
        cols: vec![(1, Some(Value::String("upd".to_string())))],
    };
    let row_id = drs
        .mutate(&schema, &drs_key(5), Timestamp(20), 3, &change)
        .unwrap();
    assert_eq!(row_id, Some(5));
    assert!(drs.delta_memstore_size() > 0);
    assert_eq!(drs.min_unflushed_log_index(), Some(3));

    // delete, then the row is no longer a mutation target
    drs.mutate(&schema, &drs_key(5), Timestamp(21), 4, &RowChange::Delete)
        .unwrap();
    assert!(!drs.is_live_at_tail(&schema, 5).unwrap());
    let miss = drs
        .mutate(&schema, &drs_key(5), Timestamp(22), 5, &change)
        .unwrap();
    assert_eq!(miss, None);

    // a reinsert resurrects it
    drs.reinsert(&schema, 5, Timestamp(23), 6, drs_cells(5)).unwrap();
    assert!(drs.is_live_at_tail(&schema, 5).unwrap());
}

#[test]
fn test_drs_minor_compaction() {
    let store = test_store("minor");
    let schema = drs_schema();
    let drs = build_drs(&store, 1, 0, 50);

    // two flushed delta files
    for round in 0..2_i64 {
        for i in 0..50 {
            let change = RowChange::Update {
                cols: vec![(2, Some(Value::Int32((round * 100 + i) as i32)))],
            };
            drs.mutate(
                &schema,
                &drs_key(i),
                Timestamp(100 + (round * 50 + i) as u64),
                1,
                &change,
            )
            .unwrap();
        }
        assert!(drs.flush_deltas(&schema).unwrap());
    }
    assert_eq!(drs.redo_file_count(), 2);

    let outcome = drs.minor_compact_delta_stores(&schema).unwrap().unwrap();
    assert_eq!(outcome.removed_blocks.len(), 2);
    assert_eq!(outcome.added_redo_blocks.len(), 1);
    assert!(outcome.new_column_blocks.is_none());
    assert_eq!(drs.redo_file_count(), 1);

    // merged history is intact and ordered
    let history = drs.history_for_range(&schema, 10, 11).unwrap();
    let deltas = history.redo.get(&10).unwrap();
    assert_eq!(deltas.len(), 2);
    assert!(deltas[0].0 < deltas[1].0);

    // nothing left to compact
    assert!(drs.minor_compact_delta_stores(&schema).unwrap().is_none());
}

#[test]
fn test_drs_major_compaction_preserves_history() {
    let store = test_store("major");
    let schema = drs_schema();
    let drs = build_drs(&store, 1, 0, 20);

    // update row 3 at ts 20, delete row 7 at ts 30, flush deltas
    let change = RowChange::Update {
        cols: vec![(1, Some(Value::String("X".to_string())))],
    };
    drs.mutate(&schema, &drs_key(3), Timestamp(20), 1, &change).unwrap();
    drs.mutate(&schema, &drs_key(7), Timestamp(30), 2, &RowChange::Delete)
        .unwrap();
    assert!(drs.flush_deltas(&schema).unwrap());

    let read_at = |drs: &DiskRowSet, ts: u64| -> Vec<(Vec<u8>, Vec<Value>, bool)> {
        use crate::{mvcc::Snapshot, scan::DrsScan};
        use std::ops::Bound;

        let snap = Snapshot::at(Timestamp(ts));
        let range = (Bound::<Vec<u8>>::Unbounded, Bound::<Vec<u8>>::Unbounded);
        let drs = Arc::new(build_reopen(drs));
        let scan = DrsScan::new(
            drs,
            drs_schema(),
            snap,
            &range,
            &[true, true, true],
            vec![],
            128,
        )
        .unwrap();
        scan.map(|row| {
            let row = row.unwrap();
            (row.key, row.cells, row.deleted)
        })
        .collect()
    };

    // keep an ancient-history mark above the update but below the
    // delete, so the update folds while the delete history survives
    let before_25 = read_at(&drs, 25);
    let before_35 = read_at(&drs, 35);

    let ahm = Timestamp(25);
    let outcome = drs.major_compact_delta_stores(&schema, ahm).unwrap().unwrap();
    assert!(outcome.new_column_blocks.is_some());
    assert_eq!(drs.redo_file_count(), 1); // ghost delete retained

    let after_25 = read_at(&drs, 25);
    let after_35 = read_at(&drs, 35);
    assert_eq!(before_25, after_25);
    assert_eq!(before_35, after_35);

    // row ids are stable across the rewrite
    assert_eq!(drs.check_row_present(&drs_key(7)).unwrap(), Some(7));
    assert!(!drs.is_live_at_tail(&schema, 7).unwrap());
}

// reopen through the current meta, sharing the same underlying blocks
fn build_reopen(drs: &DiskRowSet) -> DiskRowSet {
    let meta = drs.to_meta();
    let store = test_store_of(drs);
    DiskRowSet::open(store, None, &meta).unwrap()
}

fn test_store_of(drs: &DiskRowSet) -> Arc<BlockStore> {
    Arc::clone(&drs.store)
}
