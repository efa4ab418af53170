use std::sync::Arc;

use super::*;
use crate::{
    cache::BlockCache,
    cfile::{mod_test::test_store, Writer, WriterOpts},
    schema::{ColumnType, Compression},
};

#[test]
fn test_multi_level_index() {
    // a tiny index block size forces several btree levels
    let store = test_store("multi-level");
    let values: Vec<Value> = (0..50_000_u32)
        .map(|i| Value::Binary(i.to_be_bytes().to_vec()))
        .collect();

    let opts = WriterOpts::new("deep", ColumnType::Binary)
        .set_block_size(256)
        .set_value_index(true)
        .set_compression(Compression::Zstd);
    let mut txn = store.new_txn();
    let mut writer = Writer::new(txn.create().unwrap(), opts).unwrap();
    writer.append(&values).unwrap();
    let (id, _footer) = writer.finish().unwrap();
    txn.commit().unwrap();

    let cache = Arc::new(BlockCache::new(4 * 1024 * 1024));
    let mut reader = Reader::open(store.read(id).unwrap(), Some(cache)).unwrap();

    // ordinal seeks land exactly, across leaf boundaries
    for at in [0_u64, 1, 255, 256, 10_000, 49_999] {
        assert_eq!(
            reader.read_value_at(at).unwrap(),
            Value::Binary((at as u32).to_be_bytes().to_vec()),
            "ordinal {}",
            at
        );
    }

    // value seeks agree with ordinals
    let probe = Value::Binary(31_337_u32.to_be_bytes().to_vec());
    let (scan, exact) = reader.seek_at_or_after(&probe).unwrap();
    assert!(exact);
    assert_eq!(scan.to_ordinal(), 31_337);

    // a scan crossing many blocks stays dense and ordered
    let mut scan = reader.scan_from_ordinal(40_000).unwrap();
    let mut out = vec![];
    assert_eq!(scan.next_values(&mut reader, 10_000, &mut out).unwrap(), 10_000);
    assert_eq!(out[0], Value::Binary(40_000_u32.to_be_bytes().to_vec()));
    assert_eq!(out[9999], Value::Binary(49_999_u32.to_be_bytes().to_vec()));
    assert_eq!(scan.next_values(&mut reader, 1, &mut out).unwrap(), 0);
    assert!(scan.is_done());
}

#[test]
fn test_scan_eval_non_dict() {
    let store = test_store("eval");
    let values: Vec<Value> = (0..1000).map(Value::Int64).collect();

    let opts = WriterOpts::new("v", ColumnType::Int64).set_block_size(512);
    let mut txn = store.new_txn();
    let mut writer = Writer::new(txn.create().unwrap(), opts).unwrap();
    writer.append(&values).unwrap();
    let (id, _) = writer.finish().unwrap();
    txn.commit().unwrap();

    let mut reader = Reader::open(store.read(id).unwrap(), None).unwrap();
    let mut scan = reader.scan_from_ordinal(0).unwrap();

    let pred = crate::scan::Predicate::Range {
        col: 0,
        lo: std::ops::Bound::Included(Value::Int64(100)),
        hi: std::ops::Bound::Excluded(Value::Int64(200)),
    };
    let mut sel = croaring::Bitmap::create();
    for i in 0..1000_u32 {
        sel.add(i);
    }
    let mut out = vec![];
    let n = scan
        .next_values_eval(&mut reader, 1000, &pred, 0, &mut sel, &mut out)
        .unwrap();
    assert_eq!(n, 1000);
    assert_eq!(sel.cardinality(), 100);
    assert!(sel.contains(100) && sel.contains(199));
    assert!(!sel.contains(99) && !sel.contains(200));
}
