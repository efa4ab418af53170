//! Module `cache` implement the process-wide LRU cache of decompressed
//! CFile blocks, keyed by `(block_id, offset)`.
//!
//! Entries are handed out as `Arc<Vec<u8>>`; an entry whose Arc is
//! still held by an iterator counts as pinned and is skipped by the
//! evictor, never dropped.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use crate::{bstore::BlockId, util::Spinlock};

type Key = (u64, u64);

/// Shared LRU over decompressed block payloads.
pub struct BlockCache {
    inner: Spinlock<Lru>,
}

struct Lru {
    map: HashMap<Key, CacheEntry>,
    // access order, oldest in front; stale epochs are skipped lazily.
    order: VecDeque<(Key, u64)>,
    capacity: usize,
    used: usize,
    epoch: u64,
    n_hits: u64,
    n_misses: u64,
}

struct CacheEntry {
    data: Arc<Vec<u8>>,
    epoch: u64,
}

impl BlockCache {
    pub fn new(capacity: usize) -> BlockCache {
        BlockCache {
            inner: Spinlock::new(Lru {
                map: HashMap::new(),
                order: VecDeque::new(),
                capacity,
                used: 0,
                epoch: 0,
                n_hits: 0,
                n_misses: 0,
            }),
        }
    }

    /// Fetch the cached payload for `(id, offset)`, refreshing its
    /// recency. The returned Arc pins the entry.
    pub fn get(&self, id: BlockId, offset: u64) -> Option<Arc<Vec<u8>>> {
        let key = (id.id, offset);
        let mut lru = self.inner.write();
        lru.epoch += 1;
        let epoch = lru.epoch;
        match lru.map.get_mut(&key) {
            Some(entry) => {
                entry.epoch = epoch;
                let data = Arc::clone(&entry.data);
                lru.order.push_back((key, epoch));
                lru.n_hits += 1;
                Some(data)
            }
            None => {
                lru.n_misses += 1;
                None
            }
        }
    }

    /// Insert a payload, evicting cold unpinned entries to fit.
    pub fn put(&self, id: BlockId, offset: u64, data: Arc<Vec<u8>>) {
        let key = (id.id, offset);
        let mut lru = self.inner.write();
        lru.epoch += 1;
        let epoch = lru.epoch;

        if let Some(old) = lru.map.remove(&key) {
            lru.used -= old.data.len();
        }
        lru.used += data.len();
        lru.map.insert(key, CacheEntry { data, epoch });
        lru.order.push_back((key, epoch));

        // when every survivor is pinned the cache grows past capacity
        // rather than spin, hence the bounded number of attempts.
        let mut attempts = lru.order.len();
        while lru.used > lru.capacity && attempts > 0 {
            attempts -= 1;
            let (key, epoch) = match lru.order.pop_front() {
                Some(front) => front,
                None => break,
            };
            match lru.map.get(&key) {
                // stale order entry, a fresher access exists
                Some(entry) if entry.epoch != epoch => (),
                // pinned by a live reader, re-queue behind everyone
                Some(entry) if Arc::strong_count(&entry.data) > 1 => {
                    lru.epoch += 1;
                    let fresh = lru.epoch;
                    if let Some(entry) = lru.map.get_mut(&key) {
                        entry.epoch = fresh;
                    }
                    lru.order.push_back((key, fresh));
                }
                Some(_) => {
                    if let Some(entry) = lru.map.remove(&key) {
                        lru.used -= entry.data.len();
                    }
                }
                None => (),
            }
        }
    }

    pub fn to_used(&self) -> usize {
        self.inner.read().used
    }

    /// Return (hits, misses).
    pub fn to_stats(&self) -> (u64, u64) {
        let lru = self.inner.read();
        (lru.n_hits, lru.n_misses)
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod cache_test;
