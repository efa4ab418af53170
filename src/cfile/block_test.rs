use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::schema::Compression;

#[test]
fn test_frame_roundtrip() {
    let seed: u128 = random();
    println!("test_frame_roundtrip {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    for compression in [Compression::None, Compression::Zstd, Compression::Lzma] {
        for n in [1_usize, 10, 1000, 100_000] {
            let payload: Vec<u8> = match rng.gen::<u8>() % 2 {
                // compressible
                0 => (0..n).map(|i| (i / 100) as u8).collect(),
                // incompressible
                _ => (0..n).map(|_| rng.gen()).collect(),
            };
            let framed = frame(&payload, compression).unwrap();
            assert!(framed.len() >= FRAME_OVERHEAD);
            let out = unframe(&framed, compression).unwrap();
            assert_eq!(out, payload, "{:?} {}", compression, n);
        }
    }
}

#[test]
fn test_frame_detects_corruption() {
    let seed: u128 = random();
    println!("test_frame_detects_corruption {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    let payload: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    let framed = frame(&payload, Compression::Zstd).unwrap();

    // flipping any byte of the stored payload or checksum trips the
    // crc before anything else is trusted
    for _ in 0..100 {
        let mut garbled = framed.clone();
        let at = 8 + rng.gen::<usize>() % (garbled.len() - 8);
        garbled[at] ^= 1 << (rng.gen::<u8>() % 8);
        match unframe(&garbled, Compression::Zstd) {
            Err(Error::Corruption(_, _)) => (),
            Err(err) => panic!("unexpected error {}", err),
            Ok(_) => panic!("corruption not detected at {}", at),
        }
    }

    // truncation is also corruption
    assert!(matches!(
        unframe(&framed[..framed.len() - 4], Compression::Zstd),
        Err(Error::Corruption(_, _))
    ));
    assert!(matches!(
        unframe(&framed[..4], Compression::Zstd),
        Err(Error::Corruption(_, _))
    ));
}

#[test]
fn test_frame_stores_raw_when_incompressible() {
    let seed: u128 = random();
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    let payload: Vec<u8> = (0..1024).map(|_| rng.gen()).collect();
    let framed = frame(&payload, Compression::Zstd).unwrap();
    let uncompressed_len = u32::from_le_bytes(framed[..4].try_into().unwrap());
    let compressed_len = u32::from_le_bytes(framed[4..8].try_into().unwrap());
    // random bytes do not compress; the frame stores them raw
    assert_eq!(uncompressed_len, compressed_len);
    assert_eq!(unframe(&framed, Compression::Zstd).unwrap(), payload);
}
