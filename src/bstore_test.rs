use std::sync::Arc;

use super::*;

fn test_store(name: &str) -> Arc<BlockStore> {
    let dir = std::env::temp_dir().join("colt-bstore-test").join(name);
    std::fs::remove_dir_all(&dir).ok();
    Arc::new(BlockStore::open(dir.as_os_str()).unwrap())
}

#[test]
fn test_block_create_read() {
    let store = test_store("create-read");

    let mut txn = store.new_txn();
    let mut writer = txn.create().unwrap();
    assert_eq!(writer.append(b"hello ").unwrap(), 0);
    assert_eq!(writer.append(b"world").unwrap(), 6);
    let id = writer.finish().unwrap();
    let ids = txn.commit().unwrap();
    assert_eq!(ids, vec![id]);

    let mut data = store.read(id).unwrap();
    assert_eq!(data.len(), 11);
    assert_eq!(data.read_at(0, 11).unwrap(), b"hello world".to_vec());
    assert_eq!(data.read_at(6, 5).unwrap(), b"world".to_vec());
    assert!(data.read_at(6, 6).is_err());

    // id allocation survives re-open
    let store2 = BlockStore::open(&store.dir).unwrap();
    let reopened_next = store2.next_id.load(std::sync::atomic::Ordering::SeqCst);
    assert!(reopened_next > id.id);
}

#[test]
fn test_txn_rollback() {
    let store = test_store("rollback");

    let id = {
        let mut txn = store.new_txn();
        let writer = txn.create().unwrap();
        let id = writer.finish().unwrap();
        // txn dropped without commit
        id
    };
    assert!(!store.exists(id));
    assert!(store.read(id).is_err());
}
