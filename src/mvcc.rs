//! Module `mvcc` implement multi-version-concurrency-control over
//! per-operation timestamps: a hybrid logical clock, the set of
//! in-flight operations, and snapshot predicates deciding the
//! visibility of each mutation.

use std::{
    collections::BTreeSet,
    sync::{Condvar, Mutex},
    time,
};

use crate::{Error, Result};

/// Bits of a [Timestamp] reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 20;

/// Assumed maximum error of the wall clock, used by
/// [MvccManager::commit_wait].
pub const MAX_CLOCK_ERROR_MS: u64 = 10;

/// Hybrid-logical-clock timestamp: wall-clock milliseconds in the
/// high bits, a logical counter in the low [LOGICAL_BITS].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn new(wall_ms: u64, logical: u64) -> Timestamp {
        Timestamp((wall_ms << LOGICAL_BITS) | (logical & ((1 << LOGICAL_BITS) - 1)))
    }

    pub fn to_wall_ms(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn to_logical(&self) -> u64 {
        self.0 & ((1 << LOGICAL_BITS) - 1)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ts<{}:{}>", self.to_wall_ms(), self.to_logical())
    }
}

/// Monotonic hybrid clock. `now()` never goes backward, even when the
/// wall clock does.
pub struct HybridClock {
    last: Mutex<u64>,
}

impl Default for HybridClock {
    fn default() -> Self {
        HybridClock::new()
    }
}

impl HybridClock {
    pub fn new() -> HybridClock {
        HybridClock {
            last: Mutex::new(0),
        }
    }

    fn wall_ms() -> u64 {
        match time::UNIX_EPOCH.elapsed() {
            Ok(elapsed) => elapsed.as_millis() as u64,
            Err(_) => 0,
        }
    }

    /// Mint the next timestamp.
    pub fn now(&self) -> Timestamp {
        let mut last = self.last.lock().unwrap();
        let wall = Self::wall_ms();
        let candidate = Timestamp::new(wall, 0).0;
        let next = if candidate > *last {
            candidate
        } else {
            *last + 1
        };
        *last = next;
        Timestamp(next)
    }

    /// Fold an observed remote timestamp into the clock so that later
    /// `now()` values exceed it.
    pub fn observe(&self, ts: Timestamp) {
        let mut last = self.last.lock().unwrap();
        if ts.0 > *last {
            *last = ts.0;
        }
    }
}

/// MVCC read view: operations below `committed_before` are visible
/// unless still in flight at snapshot time, plus the explicitly
/// committed set.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub committed_before: Timestamp,
    /// Timestamps >= some in-flight boundary that were nonetheless
    /// committed when the snapshot was taken.
    pub committed: BTreeSet<u64>,
    /// In-flight (uncommitted) timestamps below `committed_before`.
    pub inflight: BTreeSet<u64>,
}

impl Snapshot {
    /// Snapshot that sees everything at or below `ts`.
    pub fn at(ts: Timestamp) -> Snapshot {
        Snapshot {
            committed_before: Timestamp(ts.0.saturating_add(1)),
            committed: BTreeSet::new(),
            inflight: BTreeSet::new(),
        }
    }

    /// Is a mutation at `ts` visible in this snapshot?
    pub fn is_visible(&self, ts: Timestamp) -> bool {
        if self.committed.contains(&ts.0) {
            return true;
        }
        ts < self.committed_before && !self.inflight.contains(&ts.0)
    }
}

/// Read mode requested by a scan.
#[derive(Clone, Debug)]
pub enum ReadMode {
    /// Read the newest committed state, no waiting.
    Latest,
    /// Repeatable read at the given timestamp; waits out in-flight
    /// operations below it. The optional propagated signature is
    /// carried but not verified.
    Snapshot {
        ts: Timestamp,
        signature: Option<Vec<u8>>,
    },
    /// Read your own writes: scan at `max(now, bound)`, avoiding the
    /// wait when possible.
    YourWrites { bound: Timestamp },
}

struct Inflights {
    set: BTreeSet<u64>,
    /// Highest timestamp ever handed to an operation.
    high_water: u64,
}

/// Tracks in-flight operations and mints snapshots.
pub struct MvccManager {
    clock: HybridClock,
    inner: Mutex<Inflights>,
    cond: Condvar,
}

impl Default for MvccManager {
    fn default() -> Self {
        MvccManager::new()
    }
}

impl MvccManager {
    pub fn new() -> MvccManager {
        MvccManager {
            clock: HybridClock::new(),
            inner: Mutex::new(Inflights {
                set: BTreeSet::new(),
                high_water: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn as_clock(&self) -> &HybridClock {
        &self.clock
    }

    /// Mint a timestamp for a write operation and mark it in flight.
    pub fn start_op(&self) -> Timestamp {
        let ts = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.set.insert(ts.0);
        inner.high_water = inner.high_water.max(ts.0);
        ts
    }

    /// Register an externally minted (replicated) timestamp in flight.
    pub fn start_op_at(&self, ts: Timestamp) -> Result<()> {
        self.clock.observe(ts);
        let mut inner = self.inner.lock().unwrap();
        if ts.0 <= inner.high_water && inner.set.contains(&ts.0) {
            err_at!(InvalidInput, msg: "duplicate op timestamp {}", ts)?;
        }
        inner.set.insert(ts.0);
        inner.high_water = inner.high_water.max(ts.0);
        Ok(())
    }

    /// Finalize an operation; its mutations become visible to future
    /// snapshots.
    pub fn commit_op(&self, ts: Timestamp) {
        let mut inner = self.inner.lock().unwrap();
        inner.set.remove(&ts.0);
        drop(inner);
        self.cond.notify_all();
    }

    /// Abort an in-flight operation.
    pub fn abort_op(&self, ts: Timestamp) {
        self.commit_op(ts)
    }

    /// Snapshot of the present: everything committed so far is
    /// visible, in-flight operations are not.
    pub fn snapshot_now(&self) -> Snapshot {
        let inner = self.inner.lock().unwrap();
        let boundary = Timestamp(inner.high_water + 1);
        Snapshot {
            committed_before: boundary,
            committed: BTreeSet::new(),
            inflight: inner.set.iter().copied().collect(),
        }
    }

    /// Snapshot for `mode`, waiting out in-flight operations below the
    /// chosen timestamp (bounded by `deadline`).
    pub fn snapshot_for(
        &self,
        mode: &ReadMode,
        deadline: time::Duration,
    ) -> Result<Snapshot> {
        match mode {
            ReadMode::Latest => Ok(self.snapshot_now()),
            ReadMode::Snapshot { ts, .. } => {
                self.clock.observe(*ts);
                self.wait_until_clean(*ts, deadline)?;
                Ok(Snapshot::at(*ts))
            }
            ReadMode::YourWrites { bound } => {
                let now = self.clock.now();
                let ts = (*bound).max(now);
                self.wait_until_clean(ts, deadline)?;
                Ok(Snapshot::at(ts))
            }
        }
    }

    // block until no in-flight operation has a timestamp <= ts.
    fn wait_until_clean(&self, ts: Timestamp, deadline: time::Duration) -> Result<()> {
        let start = time::Instant::now();
        let mut inner = self.inner.lock().unwrap();
        loop {
            let dirty = inner.set.range(..=ts.0).next().is_some();
            if !dirty {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                err_at!(TimedOut, msg: "in-flight ops below {}", ts)?;
            }
            let (guard, timeout) = self
                .cond
                .wait_timeout(inner, deadline - elapsed)
                .unwrap();
            inner = guard;
            if timeout.timed_out() {
                err_at!(TimedOut, msg: "in-flight ops below {}", ts)?;
            }
        }
    }

    /// External-consistency wait: returns once the clock has certainly
    /// passed `ts` on every node, bounded by the clock error.
    pub fn commit_wait(&self, ts: Timestamp) {
        loop {
            let now = self.clock.now();
            if now.to_wall_ms() > ts.to_wall_ms() + MAX_CLOCK_ERROR_MS {
                return;
            }
            std::thread::sleep(time::Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
#[path = "mvcc_test.rs"]
mod mvcc_test;
