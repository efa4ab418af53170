use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{collections::BTreeMap, ops::Bound, thread};

use super::*;

#[test]
fn test_mdb_against_btreemap() {
    let seed: u128 = random();
    println!("test_mdb_against_btreemap {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    let index: Mdb<Vec<u8>, u64> = Mdb::new("test-mdb");
    let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

    for _ in 0..10_000 {
        let key = rng.gen::<u32>().to_be_bytes().to_vec();
        let value: u64 = rng.gen();
        match rng.gen::<u8>() % 3 {
            0 => {
                let res = index.try_insert(key.clone(), value);
                match model.get(&key) {
                    Some(_) => assert!(res.is_err(), "expected AlreadyPresent"),
                    None => {
                        res.unwrap();
                        model.insert(key, value);
                    }
                }
            }
            1 => {
                index.set(key.clone(), value).unwrap();
                model.insert(key, value);
            }
            _ => match model.get_mut(&key) {
                Some(mval) => {
                    *mval += 1;
                    index.modify(&key, |v| v + 1).unwrap();
                }
                None => assert!(index.modify(&key, |v| v + 1).is_err()),
            },
        }
    }

    assert_eq!(index.len(), model.len());

    // point lookups
    for (key, value) in model.iter() {
        assert_eq!(index.get(key).unwrap(), *value);
    }

    // full iteration in key order
    let mut iter = index.iter();
    for (key, value) in model.iter() {
        let (k, v) = iter.next().unwrap();
        assert_eq!(&k, key);
        assert_eq!(&v, value);
    }
    assert!(iter.next().is_none());

    // range iteration
    let lo = rng.gen::<u32>().to_be_bytes().to_vec();
    let hi = rng.gen::<u32>().to_be_bytes().to_vec();
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    let range = (Bound::Included(lo.clone()), Bound::Excluded(hi.clone()));
    let got: Vec<(Vec<u8>, u64)> = index.range(range).collect();
    let expected: Vec<(Vec<u8>, u64)> = model
        .range::<Vec<u8>, _>((Bound::Included(&lo), Bound::Excluded(&hi)))
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    assert_eq!(got, expected);
}

#[test]
fn test_mdb_snapshot_isolation() {
    let index: Mdb<Vec<u8>, u64> = Mdb::new("test-snapshot");
    for i in 0..100_u32 {
        index.try_insert(i.to_be_bytes().to_vec(), 0).unwrap();
    }

    // iterator over the current snapshot shall not observe later
    // writes.
    let mut iter = index.iter();
    for i in 0..100_u32 {
        index.modify(&i.to_be_bytes().to_vec(), |v| v + 1).unwrap();
    }
    index.try_insert(1000_u32.to_be_bytes().to_vec(), 7).unwrap();

    let mut count = 0;
    while let Some((_, value)) = iter.next() {
        assert_eq!(value, 0);
        count += 1;
    }
    assert_eq!(count, 100);
    assert_eq!(index.len(), 101);
}

#[test]
fn test_mdb_concurrent_insert() {
    let index: Mdb<Vec<u8>, u64> = Mdb::new("test-concurrent");

    // concurrent insert of the same key: exactly one winner each round
    let mut handles = vec![];
    for id in 0..8_u64 {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            let mut wins = 0;
            for i in 0..1000_u32 {
                if index.try_insert(i.to_be_bytes().to_vec(), id).is_ok() {
                    wins += 1;
                }
            }
            wins
        }));
    }

    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 1000);
    assert_eq!(index.len(), 1000);
}
