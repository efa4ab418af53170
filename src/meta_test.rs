use super::*;
use crate::{
    bstore::BlockId,
    schema::{ColumnSchema, ColumnType, Schema},
};

fn test_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("colt-meta-test").join(name);
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn sample_meta() -> TabletMeta {
    let cols = vec![
        ColumnSchema::new("id", ColumnType::Int64),
        ColumnSchema::new("word", ColumnType::String),
    ];
    let mut meta = TabletMeta::new(Schema::new(cols, 1).unwrap());
    meta.rowsets.push(RowSetMeta {
        rowset_id: 1,
        column_blocks: vec![
            ColumnBlock {
                col_id: 0,
                block: BlockId::new(10),
            },
            ColumnBlock {
                col_id: 1,
                block: BlockId::new(11),
            },
        ],
        bloom_block: BlockId::new(12),
        ad_hoc_index_block: BlockId::new(13),
        undo_blocks: vec![BlockId::new(14)],
        redo_blocks: vec![],
        dms_min_log_idx: Some(42),
        n_rows: 100,
        min_key: vec![0],
        max_key: vec![255],
    });
    meta.next_rowset_id = 2;
    meta.next_auto_increment = 7;
    meta.last_applied_log_index = 99;
    meta
}

#[test]
fn test_meta_roundtrip() {
    let dir = test_dir("roundtrip");
    let meta = sample_meta();

    assert!(!TabletMeta::exists(dir.as_os_str()));
    meta.save(dir.as_os_str()).unwrap();
    assert!(TabletMeta::exists(dir.as_os_str()));

    let out = TabletMeta::load(dir.as_os_str()).unwrap();
    assert_eq!(out.tablet_id, meta.tablet_id);
    assert_eq!(out.to_schema(), meta.to_schema());
    assert_eq!(out.next_rowset_id, 2);
    assert_eq!(out.next_auto_increment, 7);
    assert_eq!(out.last_applied_log_index, 99);

    let rs = out.find_rowset(1).unwrap();
    assert_eq!(rs.n_rows, 100);
    assert_eq!(rs.dms_min_log_idx, Some(42));
    assert_eq!(rs.block_ids().len(), 5);

    // saving again replaces atomically
    let mut meta2 = out.clone();
    meta2.next_rowset_id = 3;
    meta2.save(dir.as_os_str()).unwrap();
    assert_eq!(TabletMeta::load(dir.as_os_str()).unwrap().next_rowset_id, 3);
}

#[test]
fn test_meta_detects_tampering() {
    let dir = test_dir("tamper");
    sample_meta().save(dir.as_os_str()).unwrap();

    let loc = TabletMeta::to_location(dir.as_os_str());
    let mut data = std::fs::read(&loc).unwrap();

    // garble the marker
    let at = data.len() - 1;
    data[at] ^= 0xff;
    std::fs::write(&loc, &data).unwrap();
    match TabletMeta::load(dir.as_os_str()) {
        Err(Error::Corruption(_, _)) => (),
        other => panic!("expected Corruption, got {:?}", other.map(|_| ())),
    }

    // truncation breaks the length trailer
    let data = std::fs::read(&loc).unwrap();
    std::fs::write(&loc, &data[..data.len() / 2]).unwrap();
    assert!(TabletMeta::load(dir.as_os_str()).is_err());
}
