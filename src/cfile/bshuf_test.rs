use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::schema::ColumnType;

#[test]
fn test_transpose_roundtrip() {
    let seed: u128 = random();
    println!("test_transpose_roundtrip {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    for (count, width) in [(1, 8), (7, 4), (64, 8), (1000, 2), (333, 16)] {
        let raw: Vec<u8> = (0..count * width).map(|_| rng.gen()).collect();
        let out = untranspose(&transpose(&raw, count, width), count, width);
        assert_eq!(out, raw, "count {} width {}", count, width);
    }
}

#[test]
fn test_bshuf_roundtrip() {
    let seed: u128 = random();
    println!("test_bshuf_roundtrip {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    // slowly-varying timestamps, near-empty high bit planes
    let base = 1_600_000_000_000_000_i64;
    let values: Vec<Value> = (0..5000)
        .map(|i| Value::Timestamp(base + i * 1000 + (rng.gen::<i64>() % 10)))
        .collect();

    let mut builder = BshufBuilder::new(8, 1024 * 1024);
    builder.add(&values).unwrap();
    let payload = builder.finish().unwrap();
    // transposed bit planes compress well
    assert!(payload.len() < values.len() * 8 / 2);

    let mut decoder = BshufDecoder::open(&ColumnType::TimestampMicros, &payload).unwrap();
    assert_eq!(decoder.count(), values.len());
    let mut out = vec![];
    decoder.copy_next_values(values.len(), &mut out).unwrap();
    assert_eq!(out, values);

    // sorted column: binary search by value
    assert!(decoder.seek_at_or_after_value(&values[1234]).unwrap());
    assert_eq!(decoder.to_position(), 1234);
}

#[test]
fn test_bshuf_rejects_mismatched_width() {
    let mut builder = BshufBuilder::new(4, 1024);
    builder.add(&[Value::Int32(7)]).unwrap();
    let payload = builder.finish().unwrap();

    // decoding through an 8-byte type trips the width check
    assert!(BshufDecoder::open(&ColumnType::Int64, &payload).is_err());
    // a truncated payload trips the length check
    assert!(BshufDecoder::open(&ColumnType::Int32, &payload[..5]).is_err());
}
