use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::schema::ColumnType;

fn sorted_words(rng: &mut SmallRng, n: usize) -> Vec<String> {
    let mut words: Vec<String> = (0..n)
        .map(|_| {
            let stem = ["tab", "table", "tablet", "tabular", "zoo"]
                [rng.gen::<usize>() % 5];
            format!("{}-{:08}", stem, rng.gen::<u32>() % 100_000)
        })
        .collect();
    words.sort();
    words.dedup();
    words
}

#[test]
fn test_prefix_roundtrip() {
    let seed: u128 = random();
    println!("test_prefix_roundtrip {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    let words = sorted_words(&mut rng, 1000);
    let values: Vec<Value> = words.iter().map(|w| Value::String(w.clone())).collect();

    let mut builder = PrefixBuilder::new(1024 * 1024);
    builder.add(&values).unwrap();
    let payload = builder.finish().unwrap();

    let mut decoder = PrefixDecoder::open(&ColumnType::String, &payload).unwrap();
    assert_eq!(decoder.count(), values.len());
    let mut out = vec![];
    decoder.copy_next_values(values.len(), &mut out).unwrap();
    assert_eq!(out, values);

    // positional seeks rewind to the nearest restart then walk
    for _ in 0..100 {
        let at = rng.gen::<usize>() % values.len();
        decoder.seek_to_position(at).unwrap();
        let mut out = vec![];
        decoder.copy_next_values(1, &mut out).unwrap();
        assert_eq!(out[0], values[at], "position {}", at);
    }
}

#[test]
fn test_prefix_seek_value() {
    let values: Vec<Value> = (0..500_u32)
        .map(|i| Value::String(format!("key-{:06}", i * 2)))
        .collect();

    let mut builder = PrefixBuilder::new(1024 * 1024);
    builder.add(&values).unwrap();
    let payload = builder.finish().unwrap();

    let mut decoder = PrefixDecoder::open(&ColumnType::String, &payload).unwrap();

    // exact
    let probe = Value::String("key-000400".to_string());
    assert!(decoder.seek_at_or_after_value(&probe).unwrap());
    let mut out = vec![];
    decoder.copy_next_values(1, &mut out).unwrap();
    assert_eq!(out[0], probe);

    // between entries
    let probe = Value::String("key-000401".to_string());
    assert!(!decoder.seek_at_or_after_value(&probe).unwrap());
    let mut out = vec![];
    decoder.copy_next_values(1, &mut out).unwrap();
    assert_eq!(out[0], Value::String("key-000402".to_string()));

    // before the first entry
    let probe = Value::String("aaa".to_string());
    assert!(!decoder.seek_at_or_after_value(&probe).unwrap());
    let mut out = vec![];
    decoder.copy_next_values(1, &mut out).unwrap();
    assert_eq!(out[0], Value::String("key-000000".to_string()));

    // past the last entry
    let probe = Value::String("zzz".to_string());
    assert!(!decoder.seek_at_or_after_value(&probe).unwrap());
    let mut out = vec![];
    assert_eq!(decoder.copy_next_values(1, &mut out).unwrap(), 0);
}
