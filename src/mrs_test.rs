use super::*;
use crate::mvcc::Snapshot;

fn sample_schema() -> Schema {
    use crate::schema::{ColumnSchema, ColumnType};

    let cols = vec![
        ColumnSchema::new("id", ColumnType::Int64),
        ColumnSchema::new("word", ColumnType::String),
    ];
    Schema::new(cols, 1).unwrap()
}

fn key(i: i64) -> Vec<u8> {
    (i as u64 ^ 0x8000_0000_0000_0000).to_be_bytes().to_vec()
}

fn cells(i: i64, word: &str) -> Vec<Value> {
    vec![Value::Int64(i), Value::String(word.to_string())]
}

#[test]
fn test_mrs_insert_mutate_visibility() {
    let schema = sample_schema();
    let mrs = MemRowSet::new("test-mrs");

    mrs.insert(key(1), cells(1, "a"), Timestamp(10), 1, 16).unwrap();
    mrs.insert(key(2), cells(2, "b"), Timestamp(11), 1, 16).unwrap();

    // duplicate insert of a live row
    match mrs.insert(key(1), cells(1, "x"), Timestamp(12), 2, 16) {
        Err(Error::AlreadyPresent(_, _)) => (),
        other => panic!("expected AlreadyPresent, got {:?}", other.map(|_| ())),
    }

    // update key 2 at ts 20
    let change = RowChange::Update {
        cols: vec![(1, Some(Value::String("B".to_string())))],
    };
    mrs.mutate(&key(2), Timestamp(20), 3, change, 16).unwrap();

    // snapshot below the insert: row absent
    let entry = mrs.get(&key(2)).unwrap();
    let snap = Snapshot::at(Timestamp(5));
    assert!(MemRowSet::state_at(&schema, &entry, &snap).unwrap().is_none());

    // snapshot between insert and update: pre-mutation image
    let snap = Snapshot::at(Timestamp(15));
    let state = MemRowSet::state_at(&schema, &entry, &snap).unwrap().unwrap();
    assert_eq!(state.cells[1], Value::String("b".to_string()));
    assert!(!state.deleted);

    // snapshot after the update
    let snap = Snapshot::at(Timestamp(25));
    let state = MemRowSet::state_at(&schema, &entry, &snap).unwrap().unwrap();
    assert_eq!(state.cells[1], Value::String("B".to_string()));

    // mutation of a missing key
    match mrs.mutate(&key(9), Timestamp(30), 4, RowChange::Delete, 16) {
        Err(Error::KeyNotFound(_, _)) => (),
        other => panic!("expected KeyNotFound, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_mrs_delete_then_reinsert() {
    let schema = sample_schema();
    let mrs = MemRowSet::new("test-reinsert");

    mrs.insert(key(3), cells(3, "c"), Timestamp(10), 1, 16).unwrap();
    mrs.mutate(&key(3), Timestamp(30), 2, RowChange::Delete, 16).unwrap();

    // further mutations on the dead row miss
    match mrs.mutate(&key(3), Timestamp(31), 3, RowChange::Delete, 16) {
        Err(Error::KeyNotFound(_, _)) => (),
        other => panic!("expected KeyNotFound, got {:?}", other.map(|_| ())),
    }

    // a fresh insert becomes a reinsert mutation on the same entry
    mrs.insert(key(3), cells(3, "C"), Timestamp(31), 4, 16).unwrap();
    assert_eq!(mrs.len(), 1);

    let entry = mrs.get(&key(3)).unwrap();

    // ghost at ts 30, with the pre-delete image
    let snap = Snapshot::at(Timestamp(30));
    let state = MemRowSet::state_at(&schema, &entry, &snap).unwrap().unwrap();
    assert!(state.deleted);
    assert_eq!(state.cells[1], Value::String("c".to_string()));

    // live again at ts 32
    let snap = Snapshot::at(Timestamp(32));
    let state = MemRowSet::state_at(&schema, &entry, &snap).unwrap().unwrap();
    assert!(!state.deleted);
    assert_eq!(state.cells[1], Value::String("C".to_string()));

    assert_eq!(mrs.count_live_rows(), 1);
}

#[test]
fn test_mrs_bookkeeping() {
    let mrs = MemRowSet::new("test-books");
    assert_eq!(mrs.min_log_index(), None);

    mrs.insert(key(1), cells(1, "a"), Timestamp(10), 42, 100).unwrap();
    mrs.insert(key(2), cells(2, "b"), Timestamp(11), 7, 50).unwrap();

    assert_eq!(mrs.min_log_index(), Some(7));
    assert_eq!(mrs.log_replay_size(), 150);
    assert!(mrs.ram_anchored() > 0);
    assert!(mrs.contains_key(&key(1)));
    assert!(!mrs.contains_key(&key(9)));

    // iteration is ordered by encoded key
    let keys: Vec<Vec<u8>> = mrs.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![key(1), key(2)]);
}
