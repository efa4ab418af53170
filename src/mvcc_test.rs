use std::{sync::Arc, thread, time::Duration};

use super::*;

#[test]
fn test_clock_monotonic() {
    let clock = HybridClock::new();
    let mut prev = clock.now();
    for _ in 0..10_000 {
        let ts = clock.now();
        assert!(ts > prev);
        prev = ts;
    }

    // observing a remote timestamp pushes the clock past it
    let future = Timestamp::new(prev.to_wall_ms() + 60_000, 0);
    clock.observe(future);
    assert!(clock.now() > future);
}

#[test]
fn test_snapshot_visibility() {
    let mgr = MvccManager::new();

    let t1 = mgr.start_op();
    mgr.commit_op(t1);
    let t2 = mgr.start_op(); // left in flight

    let snap = mgr.snapshot_now();
    assert!(snap.is_visible(t1));
    assert!(!snap.is_visible(t2));

    // ops committed after the snapshot stay invisible to it
    mgr.commit_op(t2);
    assert!(!snap.is_visible(t2));
    let t3 = mgr.start_op();
    mgr.commit_op(t3);
    assert!(!snap.is_visible(t3));

    // a fresh snapshot sees everything
    let snap = mgr.snapshot_now();
    assert!(snap.is_visible(t1) && snap.is_visible(t2) && snap.is_visible(t3));
}

#[test]
fn test_snapshot_at_waits_for_inflight() {
    let mgr = Arc::new(MvccManager::new());

    let t1 = mgr.start_op();

    // a snapshot above the in-flight op blocks until commit
    let handle = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || {
            let mode = ReadMode::Snapshot {
                ts: Timestamp(t1.0 + 1),
                signature: None,
            };
            mgr.snapshot_for(&mode, Duration::from_secs(10))
        })
    };
    thread::sleep(Duration::from_millis(50));
    mgr.commit_op(t1);
    let snap = handle.join().unwrap().unwrap();
    assert!(snap.is_visible(t1));

    // a bounded wait on a stuck op times out
    let t2 = mgr.start_op();
    let mode = ReadMode::Snapshot {
        ts: Timestamp(t2.0 + 1),
        signature: None,
    };
    match mgr.snapshot_for(&mode, Duration::from_millis(50)) {
        Err(Error::TimedOut(_, _)) => (),
        other => panic!("expected TimedOut, got {:?}", other.map(|_| ())),
    }
    mgr.commit_op(t2);
}

#[test]
fn test_read_modes() {
    let mgr = MvccManager::new();

    // latest never waits
    let t1 = mgr.start_op();
    let snap = mgr
        .snapshot_for(&ReadMode::Latest, Duration::from_millis(1))
        .unwrap();
    assert!(!snap.is_visible(t1));
    mgr.commit_op(t1);

    // read-your-writes picks max(now, bound)
    let snap = mgr
        .snapshot_for(
            &ReadMode::YourWrites { bound: Timestamp(0) },
            Duration::from_secs(1),
        )
        .unwrap();
    assert!(snap.is_visible(t1));
}

#[test]
fn test_commit_wait() {
    let mgr = MvccManager::new();
    let ts = mgr.as_clock().now();
    let start = std::time::Instant::now();
    mgr.commit_wait(ts);
    // returns once the wall clock has certainly passed ts everywhere
    assert!(start.elapsed() >= Duration::from_millis(1));
    assert!(mgr.as_clock().now().to_wall_ms() > ts.to_wall_ms() + MAX_CLOCK_ERROR_MS);
}
