use super::*;

#[test]
fn test_lane_roundtrip() {
    use crate::schema::ColumnType as T;

    let cases = vec![
        (T::Bool, Value::Bool(true)),
        (T::Int8, Value::Int8(-1)),
        (T::Int16, Value::Int16(i16::MIN)),
        (T::Int32, Value::Int32(7)),
        (T::Int64, Value::Int64(i64::MAX)),
        (T::UInt8, Value::UInt8(255)),
        (T::UInt32, Value::UInt32(u32::MAX)),
        (T::UInt64, Value::UInt64(u64::MAX)),
        (T::Date, Value::Date(-719162)),
        (T::TimestampMicros, Value::Timestamp(-1)),
        (
            T::Decimal64 {
                precision: 18,
                scale: 4,
            },
            Value::Decimal64(-999_999),
        ),
    ];
    for (ctype, value) in cases.into_iter() {
        let lane = value_to_lane(&value).unwrap();
        assert_eq!(lane_to_value(&ctype, lane).unwrap(), value, "{:?}", ctype);
    }

    // zig-zag keeps small magnitudes small
    assert!(value_to_lane(&Value::Int64(-1)).unwrap() < 8);
    assert!(value_to_lane(&Value::Int64(1)).unwrap() < 8);

    // no lane for varlen or 128-bit cells
    assert!(value_to_lane(&Value::String("x".to_string())).is_err());
    assert!(value_to_lane(&Value::Int128(1)).is_err());
}

#[test]
fn test_builder_dispatch() {
    use crate::schema::{ColumnType as T, Encoding};

    // every encoding builds and round-trips through the enum surface
    let cases: Vec<(T, Encoding, Vec<Value>)> = vec![
        (T::Int64, Encoding::Plain, (0..10).map(Value::Int64).collect()),
        (T::Int64, Encoding::Rle, vec![Value::Int64(5); 10]),
        (T::Int64, Encoding::Bitshuffle, (0..10).map(Value::Int64).collect()),
        (
            T::String,
            Encoding::Prefix,
            (0..10).map(|i| Value::String(format!("k{:03}", i))).collect(),
        ),
    ];

    for (ctype, encoding, values) in cases.into_iter() {
        let mut builder = BlockBuilder::new(&ctype, encoding, 1 << 20, None).unwrap();
        assert_eq!(builder.add(&values).unwrap(), values.len());
        assert_eq!(builder.count(), values.len());
        assert_eq!(builder.to_first_value().as_ref(), values.first());
        assert_eq!(builder.to_last_value().as_ref(), values.last());

        let payload = builder.finish().unwrap();
        let mut decoder = BlockDecoder::open(&ctype, encoding, &payload, None).unwrap();
        assert_eq!(decoder.count(), values.len());
        let mut out = vec![];
        decoder.copy_next_values(values.len(), &mut out).unwrap();
        assert_eq!(out, values, "{:?}", encoding);
    }

    // dictionary without a dictionary handle is refused
    assert!(BlockBuilder::new(&T::String, Encoding::Dictionary, 1024, None).is_err());
    // bitshuffle on varlen is refused
    assert!(BlockBuilder::new(&T::String, Encoding::Bitshuffle, 1024, None).is_err());
}
