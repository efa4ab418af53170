//! Module `config` implement the runtime tunables for a tablet and for
//! the process-wide maintenance scheduler.

use serde::Deserialize;

use std::{convert::TryFrom, ffi, fs};

use crate::{Error, Result};

/// Default MemRowSet/DeltaMemStore size, in MiB, at which flush becomes
/// strongly preferred.
pub const FLUSH_THRESHOLD_MB: u64 = 64;
/// Default age, in seconds, at which a non-empty MemRowSet or
/// DeltaMemStore becomes flushable with a low score.
pub const FLUSH_THRESHOLD_SECS: u64 = 120;
/// Default age, in milliseconds, at which the time-based flush score
/// saturates at 1.0.
pub const FLUSH_UPPER_BOUND_MS: u64 = 60 * 60 * 1000;
/// Default retention horizon, in seconds, for UNDO history. Scans older
/// than this are rejected.
pub const TABLET_HISTORY_MAX_AGE_SEC: u64 = 15 * 60;
/// Default capacity, in rows, of scan result blocks.
pub const ROW_BLOCK_CAPACITY: usize = 128;
/// Default capacity, in bytes, of the shared block cache.
pub const BLOCK_CACHE_CAPACITY: usize = 512 * 1024 * 1024;
/// Default server-wide soft limit, in bytes, on memory anchored by
/// un-flushed stores.
pub const MEMORY_SOFT_LIMIT: u64 = 1024 * 1024 * 1024;
/// Default threshold, in bytes, of retained WAL above which log-anchor
/// pressure dominates scheduling.
pub const LOG_RETENTION_THRESHOLD: u64 = 128 * 1024 * 1024;
/// Scores below this floor are never scheduled.
pub const PERF_SCORE_FLOOR: f64 = 0.01;

/// Configuration for a tablet instance and its maintenance ops.
///
/// Configuration can be composed through the `set_*` methods or parsed
/// from a toml file via [Config::from_toml].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory under which tablet metadata and blocks are stored.
    pub dir: String,
    /// Uniquely name this tablet.
    pub name: String,
    /// MemRowSet/DeltaMemStore size (MiB) at which flush becomes
    /// strongly preferred. Default: [FLUSH_THRESHOLD_MB].
    pub flush_threshold_mb: u64,
    /// Age (seconds) at which a non-empty store becomes flushable with
    /// low score. Default: [FLUSH_THRESHOLD_SECS].
    pub flush_threshold_secs: u64,
    /// Age (milliseconds) at which the time based flush score saturates
    /// at 1.0. Default: [FLUSH_UPPER_BOUND_MS].
    pub flush_upper_bound_ms: u64,
    /// Per-table clamp added to maintenance op priority, can be
    /// negative.
    pub maintenance_priority: i32,
    /// Retention horizon (seconds) for UNDO deltas of this table.
    /// Overrides [Config::tablet_history_max_age_sec] when set.
    pub history_max_age_sec: Option<u64>,
    /// Server-wide default retention horizon (seconds).
    /// Default: [TABLET_HISTORY_MAX_AGE_SEC].
    pub tablet_history_max_age_sec: u64,
    /// Suppress merging and major-delta compactions for this table.
    pub disable_compaction: bool,
    /// Kill switch for MemRowSet flushes.
    pub enable_flush_memrowset: bool,
    /// Kill switch for DeltaMemStore flushes.
    pub enable_flush_deltamemstores: bool,
    /// Kill switch for WAL garbage collection.
    pub enable_log_gc: bool,
    /// Multiplier combining `workload_score` with `perf_improvement`
    /// when ranking maintenance ops.
    pub workload_score_wt: f64,
    /// Server-wide soft limit (bytes) on anchored memory.
    /// Default: [MEMORY_SOFT_LIMIT].
    pub memory_soft_limit: u64,
    /// Retained-WAL bytes above which log-anchor pressure dominates
    /// scheduling. Default: [LOG_RETENTION_THRESHOLD].
    pub log_retention_threshold: u64,
    /// Number of maintenance worker threads. Zero means number of
    /// cores.
    pub num_maintenance_threads: usize,
    /// Capacity, in rows, of scan result blocks.
    /// Default: [ROW_BLOCK_CAPACITY].
    pub row_block_capacity: usize,
    /// Capacity, in bytes, of the shared block cache.
    /// Default: [BLOCK_CACHE_CAPACITY].
    pub block_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            dir: String::default(),
            name: String::default(),
            flush_threshold_mb: FLUSH_THRESHOLD_MB,
            flush_threshold_secs: FLUSH_THRESHOLD_SECS,
            flush_upper_bound_ms: FLUSH_UPPER_BOUND_MS,
            maintenance_priority: 0,
            history_max_age_sec: None,
            tablet_history_max_age_sec: TABLET_HISTORY_MAX_AGE_SEC,
            disable_compaction: false,
            enable_flush_memrowset: true,
            enable_flush_deltamemstores: true,
            enable_log_gc: true,
            workload_score_wt: 1.0,
            memory_soft_limit: MEMORY_SOFT_LIMIT,
            log_retention_threshold: LOG_RETENTION_THRESHOLD,
            num_maintenance_threads: 0,
            row_block_capacity: ROW_BLOCK_CAPACITY,
            block_cache_capacity: BLOCK_CACHE_CAPACITY,
        }
    }
}

impl<'a> arbitrary::Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        let name: String = u.arbitrary()?;
        let dir = std::env::temp_dir().join(&name);

        let config = Config {
            dir: dir.to_string_lossy().to_string(),
            name,
            flush_threshold_mb: *u.choose(&[1, 8, 64, 1024])?,
            flush_threshold_secs: *u.choose(&[1, 120, 3600])?,
            maintenance_priority: *u.choose(&[-1, 0, 1])?,
            disable_compaction: u.arbitrary()?,
            workload_score_wt: *u.choose(&[0.0, 0.5, 1.0])?,
            ..Config::default()
        };
        Ok(config)
    }
}

impl Config {
    /// Create a new configuration value, use the `set_*` methods to
    /// add more configuration.
    pub fn new(dir: &str, name: &str) -> Config {
        Config {
            dir: dir.to_string(),
            name: name.to_string(),
            ..Config::default()
        }
    }

    /// Parse configuration from a toml file.
    pub fn from_toml(loc: &ffi::OsStr) -> Result<Config> {
        let data = err_at!(IOError, fs::read_to_string(loc))?;
        err_at!(InvalidFile, toml::from_str(&data), "toml file {:?}", loc)
    }

    pub fn set_flush_threshold_mb(&mut self, mb: u64) -> &mut Self {
        self.flush_threshold_mb = mb;
        self
    }

    pub fn set_flush_threshold_secs(&mut self, secs: u64) -> &mut Self {
        self.flush_threshold_secs = secs;
        self
    }

    pub fn set_history_max_age_sec(&mut self, secs: u64) -> &mut Self {
        self.history_max_age_sec = Some(secs);
        self
    }

    pub fn set_disable_compaction(&mut self, disable: bool) -> &mut Self {
        self.disable_compaction = disable;
        self
    }

    pub fn set_maintenance_priority(&mut self, priority: i32) -> &mut Self {
        self.maintenance_priority = priority;
        self
    }

    pub fn set_workload_score_wt(&mut self, wt: f64) -> &mut Self {
        self.workload_score_wt = wt;
        self
    }

    /// Effective UNDO retention horizon for this table, in seconds.
    pub fn to_history_max_age_sec(&self) -> u64 {
        self.history_max_age_sec
            .unwrap_or(self.tablet_history_max_age_sec)
    }

    /// Effective maintenance pool size.
    pub fn to_pool_size(&self) -> usize {
        match self.num_maintenance_threads {
            0 => num_cpus::get(),
            n => n,
        }
    }

    /// Flush threshold in bytes.
    pub fn to_flush_threshold_bytes(&self) -> u64 {
        self.flush_threshold_mb * 1024 * 1024
    }
}

impl TryFrom<&str> for Config {
    type Error = Error;

    fn try_from(data: &str) -> Result<Config> {
        err_at!(InvalidInput, toml::from_str(data))
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
