//! Package implement the process-wide maintenance scheduler: it
//! polls stats from every registered tablet, ranks the runnable
//! background ops by perf-improvement score, and executes the winner
//! on a bounded worker pool.
//!
//! Per-tablet invariants are enforced by the tablet itself: one
//! MemRowSet flush at a time, one compaction per DiskRowSet, one WAL
//! GC round per tablet.

use log::{info, warn};

use std::{
    fmt,
    sync::{mpsc, Arc, Weak},
    time,
};

use crate::{
    config::{Config, PERF_SCORE_FLOOR},
    tablet::Tablet,
    util::{
        self,
        thread::{Pool, Rx},
        Spinlock,
    },
    Result,
};

/// Scheduler tick interval.
pub const TICK_INTERVAL: time::Duration = time::Duration::from_millis(250);

/// The maintenance op variants, with a fixed capability set each.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OpKind {
    FlushMrs,
    FlushDms,
    MinorDeltaCompact,
    MajorDeltaCompact,
    MergeCompact,
    LogGc,
}

impl OpKind {
    pub const ALL: [OpKind; 6] = [
        OpKind::FlushMrs,
        OpKind::FlushDms,
        OpKind::MinorDeltaCompact,
        OpKind::MajorDeltaCompact,
        OpKind::MergeCompact,
        OpKind::LogGc,
    ];
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OpKind::FlushMrs => "flush-mrs",
            OpKind::FlushDms => "flush-dms",
            OpKind::MinorDeltaCompact => "minor-delta-compact",
            OpKind::MajorDeltaCompact => "major-delta-compact",
            OpKind::MergeCompact => "merge-compact",
            OpKind::LogGc => "log-gc",
        };
        write!(f, "{}", name)
    }
}

/// Pull-only stats snapshot for one candidate op.
#[derive(Clone, Debug, Default)]
pub struct OpStats {
    pub runnable: bool,
    pub ram_anchored: u64,
    pub logs_retained_bytes: u64,
    pub perf_improvement: f64,
    pub workload_score: f64,
    pub data_retained_bytes: u64,
    pub priority: i32,
}

/// Execution metrics per op kind.
#[derive(Clone, Debug, Default)]
pub struct OpMetrics {
    pub n_runs: u64,
    pub n_fails: u64,
    pub total_ms: u64,
    pub max_ms: u64,
    pub running: bool,
    pub last_run: Option<chrono::DateTime<chrono::Local>>,
}

impl fmt::Display for OpMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let last = self
            .last_run
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        write!(
            f,
            "runs={} fails={} total_ms={} max_ms={} last={}",
            self.n_runs, self.n_fails, self.total_ms, self.max_ms, last
        )
    }
}

/// The MemRowSet/DeltaMemStore flush score: size pressure dominates,
/// age keeps idle stores moving.
pub fn flush_score(anchored_bytes: u64, elapsed_ms: u64, config: &Config) -> f64 {
    let anchored_mb = anchored_bytes as f64 / (1024.0 * 1024.0);
    let threshold_mb = config.flush_threshold_mb as f64;

    if anchored_mb >= threshold_mb {
        (anchored_mb - threshold_mb).max(1.0)
    } else if elapsed_ms > config.flush_threshold_secs * 1000 {
        let by_age = elapsed_ms as f64 / config.flush_upper_bound_ms as f64;
        let by_size = anchored_mb / threshold_mb;
        by_age.max(by_size).min(1.0)
    } else {
        0.0
    }
}

struct Registered {
    tablet: Weak<Tablet>,
    /// FIFO order for tie-breaks.
    seq: u64,
    last_ops_applied: u64,
}

struct Work {
    tablet: Weak<Tablet>,
    kind: OpKind,
}

/// Process-wide maintenance manager. Construct one per process, pass
/// it to whichever subsystem owns the tablets; tests construct their
/// own for isolation.
pub struct MntManager {
    config: Config,
    registry: Spinlock<Vec<Registered>>,
    metrics: Spinlock<Vec<(OpKind, OpMetrics)>>,

    pool: Spinlock<Option<Pool<Work, Result<bool>>>>,
    scheduler: Spinlock<Option<util::Thread<(), (), ()>>>,
    next_seq: Spinlock<u64>,
}

impl MntManager {
    pub fn new(config: Config) -> Arc<MntManager> {
        let metrics = OpKind::ALL
            .iter()
            .map(|kind| (*kind, OpMetrics::default()))
            .collect();
        Arc::new(MntManager {
            config,
            registry: Spinlock::new(vec![]),
            metrics: Spinlock::new(metrics),

            pool: Spinlock::new(None),
            scheduler: Spinlock::new(None),
            next_seq: Spinlock::new(0),
        })
    }

    /// Register a tablet for background maintenance.
    pub fn register(&self, tablet: &Arc<Tablet>) {
        let seq = {
            let mut next = self.next_seq.write();
            *next += 1;
            *next
        };
        self.registry.write().push(Registered {
            tablet: Arc::downgrade(tablet),
            seq,
            last_ops_applied: 0,
        });
    }

    /// Spawn the worker pool and the scheduler tick thread.
    pub fn start(self: &Arc<Self>) {
        let mut pool = Pool::new("mnt-worker");
        pool.set_pool_size(self.config.to_pool_size());
        {
            let mgr = Arc::clone(self);
            pool.spawn(move |rx: Rx<Work, Result<bool>>| move || worker_loop(mgr, rx));
        }
        *self.pool.write() = Some(pool);

        let mgr = Arc::clone(self);
        let scheduler = util::Thread::new("mnt-scheduler", move |rx: Rx<(), ()>| {
            move || scheduler_loop(mgr, rx)
        });
        *self.scheduler.write() = Some(scheduler);
    }

    /// Stop the scheduler and wait for the workers to drain.
    pub fn close_wait(&self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.write().take() {
            scheduler.join()?;
        }
        if let Some(pool) = self.pool.write().take() {
            pool.close_wait()?;
        }
        Ok(())
    }

    pub fn to_metrics(&self) -> Vec<(OpKind, OpMetrics)> {
        self.metrics.read().clone()
    }

    /// Stats for one candidate op on one tablet.
    pub fn op_stats(&self, tablet: &Tablet, kind: OpKind, workload: f64) -> OpStats {
        let config = tablet.as_config();
        let mut stats = OpStats {
            priority: config.maintenance_priority,
            workload_score: workload,
            ..OpStats::default()
        };

        match kind {
            OpKind::FlushMrs => {
                let anchored = tablet.mrs_ram_anchored();
                stats.runnable = config.enable_flush_memrowset && anchored > 0;
                stats.ram_anchored = anchored;
                stats.logs_retained_bytes = tablet.logs_retained_bytes();
                stats.perf_improvement =
                    flush_score(anchored, tablet.mrs_age_secs() * 1000, config);
            }
            OpKind::FlushDms => {
                let anchored = tablet.dms_ram_anchored();
                stats.runnable = config.enable_flush_deltamemstores && anchored > 0;
                stats.ram_anchored = anchored;
                stats.perf_improvement =
                    flush_score(anchored, tablet.max_dms_age_secs() * 1000, config);
            }
            OpKind::MinorDeltaCompact => {
                // "height": how many delta files a scan stacks per row
                let height = tablet.max_redo_file_count() as f64;
                stats.runnable = height >= 2.0;
                stats.perf_improvement = (height - 1.0).max(0.0);
            }
            OpKind::MajorDeltaCompact => {
                let (updates, deletes, rows) = tablet.redo_weight();
                stats.runnable = !config.disable_compaction
                    && tablet.max_redo_file_count() >= 1
                    && updates + deletes > 0;
                // fraction of rows a scan re-writes through deltas
                stats.perf_improvement =
                    (updates + deletes) as f64 / (rows.max(1)) as f64;
            }
            OpKind::MergeCompact => {
                let overlap = tablet.max_overlap_group();
                stats.runnable = !config.disable_compaction && overlap >= 2;
                stats.perf_improvement = overlap as f64 - 1.0;
                stats.data_retained_bytes = tablet.ancient_undo_bytes();
            }
            OpKind::LogGc => {
                stats.runnable = config.enable_log_gc;
                stats.logs_retained_bytes = tablet.logs_retained_bytes();
                stats.perf_improvement = 0.0;
            }
        }
        stats
    }
}

// pick and dispatch one op per tick; exits when the manager drops its
// tx side.
fn scheduler_loop(mgr: Arc<MntManager>, rx: Rx<(), ()>) {
    loop {
        match rx.recv_timeout(TICK_INTERVAL) {
            Ok(_) => continue,
            Err(mpsc::RecvTimeoutError::Timeout) => (),
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if let Err(err) = tick(&mgr) {
            warn!(target: "colt::mnt", "scheduler tick: {}", err);
        }
    }
}

fn tick(mgr: &Arc<MntManager>) -> Result<()> {
    let mut candidates: Vec<(OpStats, u64, Weak<Tablet>, OpKind)> = vec![];

    {
        let mut registry = mgr.registry.write();
        registry.retain(|reg| reg.tablet.upgrade().is_some());
        for reg in registry.iter_mut() {
            let tablet = match reg.tablet.upgrade() {
                Some(tablet) => tablet,
                None => continue,
            };
            // workload: write arrivals since the previous tick
            let applied = tablet.ops_applied();
            let delta = applied.saturating_sub(reg.last_ops_applied);
            reg.last_ops_applied = applied;
            let workload = (delta as f64 / 1000.0).min(1.0);

            for kind in OpKind::ALL.iter() {
                let stats = mgr.op_stats(&tablet, *kind, workload);
                if stats.runnable {
                    candidates.push((stats, reg.seq, reg.tablet.clone(), *kind));
                }
            }
        }
    }
    if candidates.is_empty() {
        return Ok(());
    }

    // memory pressure dominates, then log retention, then score
    let total_anchored: u64 = candidates.iter().map(|(s, _, _, _)| s.ram_anchored).sum();
    let chosen = if total_anchored > mgr.config.memory_soft_limit {
        candidates
            .into_iter()
            .max_by_key(|(s, _, _, _)| s.ram_anchored)
    } else if candidates
        .iter()
        .any(|(s, _, _, _)| s.logs_retained_bytes > mgr.config.log_retention_threshold)
    {
        candidates
            .into_iter()
            .max_by_key(|(s, _, _, _)| s.logs_retained_bytes)
    } else {
        let wt = mgr.config.workload_score_wt;
        candidates
            .into_iter()
            .filter(|(s, _, _, _)| {
                s.perf_improvement + s.workload_score * wt >= PERF_SCORE_FLOOR
            })
            .max_by(|(a, sa, _, _), (b, sb, _, _)| {
                let score_a = a.perf_improvement + a.workload_score * wt;
                let score_b = b.perf_improvement + b.workload_score * wt;
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.priority.cmp(&b.priority))
                    .then(sb.cmp(sa)) // FIFO: earlier registration wins
            })
    };

    if let Some((stats, _, tablet, kind)) = chosen {
        info!(
            target: "colt::mnt",
            "scheduling {} (score {:.3}, anchored {})",
            kind, stats.perf_improvement, stats.ram_anchored
        );
        let pool = mgr.pool.read();
        if let Some(pool) = pool.as_ref() {
            pool.post(Work { tablet, kind })?;
        }
    }
    Ok(())
}

fn worker_loop(mgr: Arc<MntManager>, rx: Rx<Work, Result<bool>>) {
    for (work, res_tx) in rx {
        let result = perform(&mgr, &work);
        if let Err(err) = &result {
            if err.is_transient() {
                warn!(target: "colt::mnt", "{} yielded: {}", work.kind, err);
            } else {
                warn!(target: "colt::mnt", "{} failed: {}", work.kind, err);
                if let Some(tablet) = work.tablet.upgrade() {
                    tablet.stop();
                }
            }
        }
        res_tx.map(|tx| tx.send(result).ok());
    }
}

fn perform(mgr: &Arc<MntManager>, work: &Work) -> Result<bool> {
    let tablet = match work.tablet.upgrade() {
        Some(tablet) => tablet,
        None => return Ok(false),
    };

    {
        let mut metrics = mgr.metrics.write();
        if let Some(entry) = metrics.iter_mut().find(|(k, _)| *k == work.kind) {
            entry.1.running = true;
        }
    }
    let start = time::Instant::now();

    let result = match work.kind {
        OpKind::FlushMrs => tablet.flush(),
        OpKind::FlushDms => tablet.flush_biggest_dms(),
        OpKind::MinorDeltaCompact => tablet.minor_delta_compact(),
        OpKind::MajorDeltaCompact => tablet.major_delta_compact(),
        OpKind::MergeCompact => tablet.compact(),
        OpKind::LogGc => tablet.log_gc().map(|w| w.is_some()),
    };

    let elapsed = start.elapsed().as_millis() as u64;
    {
        let mut metrics = mgr.metrics.write();
        if let Some(entry) = metrics.iter_mut().find(|(k, _)| *k == work.kind) {
            let metrics = &mut entry.1;
            metrics.running = false;
            metrics.n_runs += 1;
            metrics.total_ms += elapsed;
            metrics.max_ms = metrics.max_ms.max(elapsed);
            metrics.last_run = Some(chrono::Local::now());
            if result.is_err() {
                metrics.n_fails += 1;
            }
        }
    }
    result
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
