use super::*;
use crate::{
    row::Value,
    schema::{ColumnSchema, ColumnType, Schema},
};

pub(crate) fn sample_schema() -> Schema {
    let cols = vec![
        ColumnSchema::new("id", ColumnType::Int64),
        ColumnSchema::new("word", ColumnType::String),
        ColumnSchema::new("count", ColumnType::Int32).set_nullable(true),
    ];
    Schema::new(cols, 1).unwrap()
}

#[test]
fn test_delta_key_encoding() {
    let a = DeltaKey::new(1, Timestamp(10));
    let b = DeltaKey::new(1, Timestamp(11));
    let c = DeltaKey::new(2, Timestamp(0));

    // encoded form preserves (row_id, ts) order bytewise
    assert!(a.encode() < b.encode());
    assert!(b.encode() < c.encode());

    let out = DeltaKey::decode(&a.encode()).unwrap();
    assert_eq!(out, a);
    assert!(DeltaKey::decode(&[0, 1, 2]).is_err());
}

#[test]
fn test_change_list_roundtrip() {
    let schema = sample_schema();

    let changes = vec![
        RowChange::Delete,
        RowChange::Update {
            cols: vec![
                (1, Some(Value::String("B".to_string()))),
                (2, None), // set to NULL
            ],
        },
        RowChange::Reinsert {
            cells: vec![
                Value::Int64(3),
                Value::String("c".to_string()),
                Value::Null,
            ],
        },
    ];
    for change in changes.into_iter() {
        let buf = change.encode(&schema).unwrap();
        let out = RowChange::decode(&schema, &buf).unwrap();
        assert_eq!(out, change);
    }

    // unknown tags are corruption
    assert!(RowChange::decode(&schema, &[9]).is_err());
    assert!(RowChange::decode(&schema, &[]).is_err());
}

#[test]
fn test_apply_and_invert() {
    let schema = sample_schema();
    let base = RowState::new(vec![
        Value::Int64(1),
        Value::String("a".to_string()),
        Value::Int32(10),
    ]);

    let change = RowChange::Update {
        cols: vec![(1, Some(Value::String("z".to_string()))), (2, None)],
    };

    let mut state = base.clone();
    let inverse = invert_change(&schema, &state, &change).unwrap();
    apply_change(&schema, &mut state, &change).unwrap();
    assert_eq!(state.cells[1], Value::String("z".to_string()));
    assert_eq!(state.cells[2], Value::Null);

    // applying the inverse restores the prior image
    apply_change(&schema, &mut state, &inverse).unwrap();
    assert_eq!(state.cells, base.cells);

    // delete inverts to reinsert of the prior image, and back
    let mut state = base.clone();
    let inverse = invert_change(&schema, &state, &RowChange::Delete).unwrap();
    apply_change(&schema, &mut state, &RowChange::Delete).unwrap();
    assert!(state.deleted);
    apply_change(&schema, &mut state, &inverse).unwrap();
    assert!(!state.deleted);
    assert_eq!(state.cells, base.cells);
}

#[test]
fn test_delta_stats() {
    let mut stats = DeltaStats::default();
    stats.note(
        Timestamp(5),
        &RowChange::Update {
            cols: vec![(1, None), (2, None)],
        },
    );
    stats.note(Timestamp(9), &RowChange::Delete);
    stats.note(Timestamp(2), &RowChange::Reinsert { cells: vec![] });

    assert_eq!(stats.update_count(), 2);
    assert_eq!(stats.n_deletes, 1);
    assert_eq!(stats.n_reinserts, 1);
    assert_eq!(stats.min_ts, 2);
    assert_eq!(stats.max_ts, 9);

    let mut other = DeltaStats::default();
    other.note(Timestamp(20), &RowChange::Update { cols: vec![(1, None)] });
    stats.merge(&other);
    assert_eq!(stats.update_count(), 3);
    assert_eq!(stats.max_ts, 20);
    assert_eq!(stats.min_ts, 2);
}
