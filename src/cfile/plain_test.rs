use super::*;
use crate::schema::ColumnType;

#[test]
fn test_plain_fixed_roundtrip() {
    let mut builder = PlainBuilder::new(&ColumnType::Int64, 1024);
    let values: Vec<Value> = (0..100).map(|i| Value::Int64(i * 3 - 50)).collect();
    assert_eq!(builder.add(&values).unwrap(), 100);
    assert_eq!(builder.count(), 100);
    assert_eq!(builder.to_first_value(), Some(Value::Int64(-50)));
    assert_eq!(builder.to_last_value(), Some(Value::Int64(247)));

    let payload = builder.finish().unwrap();
    assert_eq!(builder.count(), 0); // finish resets

    let mut decoder = PlainDecoder::open(&ColumnType::Int64, &payload).unwrap();
    assert_eq!(decoder.count(), 100);

    let mut out = vec![];
    assert_eq!(decoder.copy_next_values(100, &mut out).unwrap(), 100);
    assert_eq!(out, values);
    assert_eq!(decoder.copy_next_values(1, &mut out).unwrap(), 0);

    decoder.seek_to_position(42).unwrap();
    let mut out = vec![];
    decoder.copy_next_values(1, &mut out).unwrap();
    assert_eq!(out[0], Value::Int64(42 * 3 - 50));
}

#[test]
fn test_plain_varlen_roundtrip() {
    let mut builder = PlainBuilder::new(&ColumnType::String, 4096);
    let values: Vec<Value> = ["", "a", "bb", "códigos", "zzz"]
        .iter()
        .map(|s| Value::String(s.to_string()))
        .collect();
    builder.add(&values).unwrap();
    let payload = builder.finish().unwrap();

    let mut decoder = PlainDecoder::open(&ColumnType::String, &payload).unwrap();
    let mut out = vec![];
    decoder.copy_next_values(5, &mut out).unwrap();
    assert_eq!(out, values);
}

#[test]
fn test_plain_seek_value() {
    let mut builder = PlainBuilder::new(&ColumnType::Binary, 4096);
    let values: Vec<Value> = (0..50_u32)
        .map(|i| Value::Binary((i * 2).to_be_bytes().to_vec()))
        .collect();
    builder.add(&values).unwrap();
    let payload = builder.finish().unwrap();

    let mut decoder = PlainDecoder::open(&ColumnType::Binary, &payload).unwrap();

    // exact hit
    let probe = Value::Binary(20_u32.to_be_bytes().to_vec());
    assert!(decoder.seek_at_or_after_value(&probe).unwrap());
    assert_eq!(decoder.to_position(), 10);

    // between values lands on the next one
    let probe = Value::Binary(21_u32.to_be_bytes().to_vec());
    assert!(!decoder.seek_at_or_after_value(&probe).unwrap());
    assert_eq!(decoder.to_position(), 11);

    // past the end
    let probe = Value::Binary(1000_u32.to_be_bytes().to_vec());
    assert!(!decoder.seek_at_or_after_value(&probe).unwrap());
    assert_eq!(decoder.to_position(), 50);
}

#[test]
fn test_plain_is_full() {
    let mut builder = PlainBuilder::new(&ColumnType::Int32, 16);
    // the first value is always accepted, however small the target
    assert_eq!(builder.add(&[Value::Int32(1)]).unwrap(), 1);
    let accepted = builder
        .add(&(0..10).map(Value::Int32).collect::<Vec<_>>())
        .unwrap();
    assert!(accepted < 10);
    assert!(builder.is_full());
}
