use super::*;

pub(crate) fn sample_schema() -> Schema {
    let cols = vec![
        ColumnSchema::new("id", ColumnType::Int64),
        ColumnSchema::new("word", ColumnType::String)
            .set_encoding(Encoding::Dictionary),
        ColumnSchema::new("count", ColumnType::Int32).set_nullable(true),
    ];
    Schema::new(cols, 1).unwrap()
}

#[test]
fn test_schema_compose() {
    let schema = sample_schema();
    assert_eq!(schema.len(), 3);
    assert_eq!(schema.num_key_cols, 1);
    assert_eq!(schema.as_col(0).id, 0);
    assert_eq!(schema.as_col(2).id, 2);
    assert_eq!(schema.position_of("word"), Some(1));
    assert_eq!(schema.next_col_id, 3);

    // duplicate names are rejected
    let cols = vec![
        ColumnSchema::new("a", ColumnType::Int32),
        ColumnSchema::new("a", ColumnType::Int32),
    ];
    assert!(Schema::new(cols, 1).is_err());

    // nullable keys are rejected
    let cols = vec![ColumnSchema::new("a", ColumnType::Int32).set_nullable(true)];
    assert!(Schema::new(cols, 1).is_err());

    // float keys are rejected
    let cols = vec![ColumnSchema::new("a", ColumnType::Float64)];
    assert!(Schema::new(cols, 1).is_err());
}

#[test]
fn test_auto_increment() {
    let cols = vec![
        ColumnSchema::new("host", ColumnType::String),
        ColumnSchema::new("metric", ColumnType::Int64),
    ];
    let schema = Schema::new(cols, 1).unwrap().with_auto_increment().unwrap();

    assert_eq!(schema.num_key_cols, 2);
    assert_eq!(schema.as_col(1).name, AUTO_INCREMENT_COL);
    assert_eq!(schema.as_col(1).id, 2); // fresh id, not a reuse
    assert!(schema.has_auto_increment());
    assert!(schema.clone().with_auto_increment().is_err());
}

#[test]
fn test_validate_row() {
    let schema = sample_schema();

    let ok = Row::new(vec![
        Value::Int64(1),
        Value::String("a".to_string()),
        Value::Null,
    ]);
    schema.validate_row(&ok).unwrap();

    let bad_arity = Row::new(vec![Value::Int64(1)]);
    assert!(schema.validate_row(&bad_arity).is_err());

    let bad_type = Row::new(vec![
        Value::Int64(1),
        Value::Int64(2),
        Value::Null,
    ]);
    assert!(schema.validate_row(&bad_type).is_err());

    let bad_null = Row::new(vec![
        Value::Null,
        Value::String("a".to_string()),
        Value::Null,
    ]);
    assert!(schema.validate_row(&bad_null).is_err());
}

#[test]
fn test_pk_encoding_order() {
    // signed ints order as memcmp on the encoded form
    let schema = sample_schema();
    let keys: Vec<i64> = vec![i64::MIN, -10, -1, 0, 1, 42, i64::MAX];
    let encoded: Vec<Vec<u8>> = keys
        .iter()
        .map(|k| {
            schema
                .encode_pk(&Row::new(vec![
                    Value::Int64(*k),
                    Value::String("x".to_string()),
                    Value::Null,
                ]))
                .unwrap()
        })
        .collect();
    for pair in encoded.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[test]
fn test_pk_encoding_composite() {
    let cols = vec![
        ColumnSchema::new("a", ColumnType::String),
        ColumnSchema::new("b", ColumnType::String),
        ColumnSchema::new("v", ColumnType::Int32).set_nullable(true),
    ];
    let schema = Schema::new(cols, 2).unwrap();

    let encode = |a: &[u8], b: &[u8]| {
        schema
            .encode_pk_cells(&[
                Value::String(String::from_utf8(a.to_vec()).unwrap()),
                Value::String(String::from_utf8(b.to_vec()).unwrap()),
            ])
            .unwrap()
    };

    // ("ab", "c") must sort before ("abc", "") on the encoded form,
    // because component boundaries terminate with 0x00 0x00.
    assert!(encode(b"ab", b"c") < encode(b"abc", b""));
    // embedded NULs escape without breaking the order
    assert!(encode(b"a\x00b", b"") < encode(b"a\x01", b""));
}

#[test]
fn test_projection() {
    let schema = sample_schema();

    let projection = Projection::new(&schema, &["word", "is_deleted"]).unwrap();
    assert_eq!(projection.len(), 2);
    assert_eq!(projection.base_positions(), vec![1]);
    assert!(matches!(projection.cols[1], ProjectedColumn::IsDeleted));

    assert!(Projection::new(&schema, &["nope"]).is_err());

    let full = Projection::full(&schema);
    assert_eq!(full.base_positions(), vec![0, 1, 2]);
}
