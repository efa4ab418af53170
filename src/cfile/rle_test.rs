use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::schema::ColumnType;

#[test]
fn test_rle_roundtrip() {
    let seed: u128 = random();
    println!("test_rle_roundtrip {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    let mut builder = RleBuilder::new(64 * 1024);
    let mut values = vec![];
    // runs of repeated values, the encoding's home turf
    while values.len() < 10_000 {
        let val = Value::Int32(rng.gen::<i32>() % 16);
        let run = 1 + rng.gen::<usize>() % 100;
        for _ in 0..run {
            values.push(val.clone());
        }
    }
    builder.add(&values).unwrap();
    let payload = builder.finish().unwrap();
    // the run encoding is far smaller than the raw cells
    assert!(payload.len() < values.len() * 4 / 8);

    let mut decoder = RleDecoder::open(&ColumnType::Int32, &payload).unwrap();
    assert_eq!(decoder.count(), values.len());
    let mut out = vec![];
    decoder.copy_next_values(values.len(), &mut out).unwrap();
    assert_eq!(out, values);

    // random positional seeks
    for _ in 0..100 {
        let at = rng.gen::<usize>() % values.len();
        decoder.seek_to_position(at).unwrap();
        let mut out = vec![];
        decoder.copy_next_values(1, &mut out).unwrap();
        assert_eq!(out[0], values[at], "position {}", at);
    }
}

#[test]
fn test_rle_bool() {
    let mut builder = RleBuilder::new(1024);
    let values: Vec<Value> = (0..100).map(|i| Value::Bool(i % 7 == 0)).collect();
    builder.add(&values).unwrap();
    let payload = builder.finish().unwrap();

    let mut decoder = RleDecoder::open(&ColumnType::Bool, &payload).unwrap();
    let mut out = vec![];
    decoder.copy_next_values(100, &mut out).unwrap();
    assert_eq!(out, values);
}

#[test]
fn test_rle_seek_value_sorted() {
    let mut builder = RleBuilder::new(4096);
    // sorted lanes: 0,0,0,1,1,1,2,2,2 ...
    let values: Vec<Value> = (0..300).map(|i| Value::Int64(i / 3)).collect();
    builder.add(&values).unwrap();
    let payload = builder.finish().unwrap();

    let mut decoder = RleDecoder::open(&ColumnType::Int64, &payload).unwrap();
    assert!(decoder.seek_at_or_after_value(&Value::Int64(50)).unwrap());
    assert_eq!(decoder.to_position(), 150);
    assert!(!decoder.seek_at_or_after_value(&Value::Int64(1000)).unwrap());
    assert_eq!(decoder.to_position(), 300);
}

#[test]
fn test_rle_rejects_bad_payload() {
    // run lengths not covering the declared count
    let mut payload = vec![];
    payload.extend_from_slice(&10_u32.to_le_bytes());
    payload.extend_from_slice(&1_u32.to_le_bytes());
    crate::util::encode_varint(0, &mut payload); // lane
    crate::util::encode_varint(3, &mut payload); // covers 3 of 10
    assert!(RleDecoder::open(&ColumnType::Int32, &payload).is_err());
}
