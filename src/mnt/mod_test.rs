use super::*;
use crate::config::Config;

#[test]
fn test_flush_score() {
    let mut config = Config::new("/tmp/x", "t");
    config.flush_threshold_mb = 64;
    config.flush_threshold_secs = 120;
    config.flush_upper_bound_ms = 60 * 60 * 1000;

    let mib = 1024 * 1024;

    // below both thresholds: not worth scheduling
    assert_eq!(flush_score(10 * mib, 1000, &config), 0.0);

    // past the size threshold the score grows with the excess
    assert_eq!(flush_score(64 * mib, 0, &config), 1.0);
    assert_eq!(flush_score(100 * mib, 0, &config), 36.0);

    // past the age threshold the score creeps toward 1.0
    let aged = flush_score(10 * mib, 130 * 1000, &config);
    assert!(aged > 0.0 && aged <= 1.0);
    // saturates at the upper bound
    let saturated = flush_score(10 * mib, 2 * 60 * 60 * 1000, &config);
    assert!((saturated - 1.0).abs() < f64::EPSILON);
    // age-based score never exceeds size-based urgency ordering
    assert!(aged < flush_score(60 * mib, 130 * 1000, &config) + f64::EPSILON);
}

#[test]
fn test_manager_lifecycle() {
    // the manager starts, ticks with an empty registry, and drains
    let mut config = Config::new("/tmp/colt-mnt-test", "mnt");
    config.num_maintenance_threads = 2;

    let mgr = MntManager::new(config);
    mgr.start();
    std::thread::sleep(time::Duration::from_millis(400));
    mgr.close_wait().unwrap();

    for (kind, metrics) in mgr.to_metrics() {
        assert_eq!(metrics.n_runs, 0, "{} ran with no tablets", kind);
        assert!(!metrics.running);
    }
}
