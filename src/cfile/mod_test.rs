use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::sync::Arc;

use super::*;
use crate::{
    bstore::BlockStore,
    cache::BlockCache,
    row::Value,
    schema::{ColumnType, Compression, Encoding},
};

pub(crate) fn test_store(name: &str) -> Arc<BlockStore> {
    let dir = std::env::temp_dir().join("colt-cfile-test").join(name);
    std::fs::remove_dir_all(&dir).ok();
    Arc::new(BlockStore::open(dir.as_os_str()).unwrap())
}

fn write_cfile(
    store: &Arc<BlockStore>,
    opts: writer::WriterOpts,
    values: &[Value],
    metadata: &[(&str, &[u8])],
) -> crate::bstore::BlockId {
    let mut txn = store.new_txn();
    let mut writer = Writer::new(txn.create().unwrap(), opts).unwrap();
    for (key, value) in metadata.iter() {
        writer.add_metadata(key, value);
    }
    writer.append(values).unwrap();
    let (id, footer) = writer.finish().unwrap();
    assert_eq!(footer.value_count, values.len() as u64);
    txn.commit().unwrap();
    id
}

#[test]
fn test_cfile_roundtrip() {
    let seed: u128 = random();
    println!("test_cfile_roundtrip {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    let store = test_store("roundtrip");
    let cache = Arc::new(BlockCache::new(1024 * 1024));

    let values: Vec<Value> = (0..20_000).map(|i| Value::Int64(i * 7)).collect();
    let opts = WriterOpts::new("c1", ColumnType::Int64)
        .set_block_size(1024)
        .set_compression(Compression::Zstd);
    let id = write_cfile(&store, opts, &values, &[("who", b"roundtrip")]);

    let mut reader =
        Reader::open(store.read(id).unwrap(), Some(Arc::clone(&cache))).unwrap();
    assert_eq!(reader.to_value_count(), 20_000);
    assert_eq!(reader.find_metadata("who"), Some(b"roundtrip".as_ref()));
    assert_eq!(reader.find_metadata("nothing"), None);

    // full sequential scan
    let mut scan = reader.scan_from_ordinal(0).unwrap();
    let mut out = vec![];
    assert_eq!(scan.next_values(&mut reader, 20_000, &mut out).unwrap(), 20_000);
    assert_eq!(out, values);

    // random positional reads, served through the cache
    for _ in 0..200 {
        let at = rng.gen::<u64>() % 20_000;
        let value = reader.read_value_at(at).unwrap();
        assert_eq!(value, Value::Int64(at as i64 * 7));
    }
    let (hits, _misses) = cache.to_stats();
    assert!(hits > 0);
}

#[test]
fn test_cfile_value_index() {
    let store = test_store("validx");

    let values: Vec<Value> = (0..5000_u32)
        .map(|i| Value::Binary((i * 2).to_be_bytes().to_vec()))
        .collect();
    let opts = WriterOpts::new("pk", ColumnType::Binary)
        .set_block_size(512)
        .set_value_index(true);
    let id = write_cfile(&store, opts, &values, &[]);

    let mut reader = Reader::open(store.read(id).unwrap(), None).unwrap();
    assert!(reader.as_footer().validx_root.is_some());

    // exact probe anywhere in the file
    let probe = Value::Binary(4096_u32.to_be_bytes().to_vec());
    let (scan, exact) = reader.seek_at_or_after(&probe).unwrap();
    assert!(exact);
    assert_eq!(scan.to_ordinal(), 2048);

    // probe between values
    let probe = Value::Binary(4097_u32.to_be_bytes().to_vec());
    let (scan, exact) = reader.seek_at_or_after(&probe).unwrap();
    assert!(!exact);
    assert_eq!(scan.to_ordinal(), 2049);

    // probe below the first value
    let probe = Value::Binary(vec![]);
    let (scan, exact) = reader.seek_at_or_after(&probe).unwrap();
    assert!(!exact);
    assert_eq!(scan.to_ordinal(), 0);

    // probe past the last value
    let probe = Value::Binary(u32::MAX.to_be_bytes().to_vec());
    let (scan, _exact) = reader.seek_at_or_after(&probe).unwrap();
    assert!(scan.is_done() || scan.to_ordinal() == 5000);
}

#[test]
fn test_cfile_nullable_column() {
    let store = test_store("nullable");

    let values: Vec<Value> = (0..3000)
        .map(|i| {
            if i % 3 == 0 {
                Value::Null
            } else {
                Value::Int32(i)
            }
        })
        .collect();
    let mut opts = WriterOpts::new("n", ColumnType::Int32).set_block_size(256);
    opts.nullable = true;
    let id = write_cfile(&store, opts, &values, &[]);

    let mut reader = Reader::open(store.read(id).unwrap(), None).unwrap();
    let mut scan = reader.scan_from_ordinal(0).unwrap();
    let mut out = vec![];
    scan.next_values(&mut reader, 3000, &mut out).unwrap();
    assert_eq!(out, values);

    // non-nullable writers refuse nulls
    let opts = WriterOpts::new("nn", ColumnType::Int32);
    let mut txn = store.new_txn();
    let mut writer = Writer::new(txn.create().unwrap(), opts).unwrap();
    assert!(writer.append(&[Value::Null]).is_err());
}

#[test]
fn test_cfile_array_column() {
    let store = test_store("array");

    let values: Vec<Value> = (0..500)
        .map(|i| match i % 4 {
            0 => Value::Null,
            n => Value::Array(
                (0..n).map(|j| Value::Int64((i * 10 + j) as i64)).collect(),
            ),
        })
        .collect();
    let mut opts = WriterOpts::new("arr", ColumnType::Int64).set_block_size(512);
    opts.nullable = true;
    opts.array = true;
    opts.encoding = Encoding::Plain;
    let id = write_cfile(&store, opts, &values, &[]);

    let mut reader = Reader::open(store.read(id).unwrap(), None).unwrap();
    let mut scan = reader.scan_from_ordinal(0).unwrap();
    let mut out = vec![];
    scan.next_values(&mut reader, 500, &mut out).unwrap();
    assert_eq!(out, values);
}

#[test]
fn test_cfile_dictionary_column() {
    let seed: u128 = random();
    println!("test_cfile_dictionary_column {}", seed);
    let mut rng = SmallRng::from_seed(seed.to_le_bytes());

    let store = test_store("dict");
    let alphabet = ["ape", "bear", "crow", "deer", "elk"];
    let values: Vec<Value> = (0..10_000)
        .map(|_| Value::String(alphabet[rng.gen::<usize>() % 5].to_string()))
        .collect();

    let opts = WriterOpts::new("d", ColumnType::String).set_block_size(2048);
    assert_eq!(opts.encoding, Encoding::Dictionary);
    let id = write_cfile(&store, opts, &values, &[]);

    let mut reader = Reader::open(store.read(id).unwrap(), None).unwrap();
    assert!(reader.as_footer().dict_ptr.is_some());
    let mut scan = reader.scan_from_ordinal(0).unwrap();
    let mut out = vec![];
    scan.next_values(&mut reader, 10_000, &mut out).unwrap();
    assert_eq!(out, values);
}

#[test]
fn test_cfile_corrupt_trailer() {
    let store = test_store("corrupt");
    let values: Vec<Value> = (0..100).map(Value::Int32).collect();
    let opts = WriterOpts::new("c", ColumnType::Int32);
    let id = write_cfile(&store, opts, &values, &[]);

    // overwrite the tail magic
    let loc = store.to_location(id);
    let mut data = std::fs::read(&loc).unwrap();
    let at = data.len() - 3;
    data[at] ^= 0xff;
    std::fs::write(&loc, &data).unwrap();

    match Reader::open(store.read(id).unwrap(), None) {
        Err(Error::Corruption(_, _)) => (),
        Err(err) => panic!("unexpected error {}", err),
        Ok(_) => panic!("corrupt trailer accepted"),
    }
}
