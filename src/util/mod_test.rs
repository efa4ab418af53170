use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_varint() {
    let seed: u128 = random();
    println!("test_varint {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    for val in [0_u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
        let mut buf = vec![];
        let n = encode_varint(val, &mut buf);
        assert_eq!(n, buf.len());
        let (out, m) = decode_varint(&buf).unwrap();
        assert_eq!(out, val, "{}", val);
        assert_eq!(m, n);
    }

    for _ in 0..1000 {
        let val: u64 = rng.gen();
        let mut buf = vec![];
        encode_varint(val, &mut buf);
        buf.push(0xde); // trailing garbage shall not be consumed
        let (out, m) = decode_varint(&buf).unwrap();
        assert_eq!(out, val);
        assert_eq!(m, buf.len() - 1);
    }

    // truncated stream
    assert!(decode_varint(&[0x80, 0x80]).is_err());
}

#[test]
fn test_cbor_bytes() {
    let val: Vec<u64> = vec![1, 2, 3, 0xdeadbeef];
    let data = into_cbor_bytes(val.clone()).unwrap();
    let (out, n) = from_cbor_bytes::<Vec<u64>>(&data).unwrap();
    assert_eq!(out, val);
    assert_eq!(n, data.len());
}
