//! Colt implement the storage core of a columnar tablet: the on-disk
//! and in-memory structures that ingest timestamped row mutations,
//! persist them durably, serve point lookups and range scans with
//! snapshot isolation, and reclaim space via background maintenance.
//!
//! Data within a tablet lives in rowsets. Fresh inserts land in the
//! [mrs::MemRowSet], a copy-on-write ordered index keyed by encoded
//! primary-key. A flush rewrites the MemRowSet as one or more
//! [drs::DiskRowSet] values, each an immutable bundle of per-column
//! [cfile] files, a bloom filter, an ad-hoc primary-key index and two
//! streams of delta files. Updates and deletes against flushed rows are
//! accumulated in per-rowset [delta::DeltaMemStore] values and flushed
//! as REDO delta files; major compactions fold REDO history into the
//! base columns while emitting equivalent UNDO history, so that a scan
//! at any retained timestamp reconstructs the same rows before and
//! after the rewrite.
//!
//! Every mutation carries a [mvcc::Timestamp] minted by a hybrid
//! logical clock. A scan resolves to a [mvcc::Snapshot], which decides
//! the visibility of each mutation; `READ_AT_SNAPSHOT` scans wait for
//! in-flight operations below the chosen timestamp to finalize.
//!
//! Background work - MemRowSet flushes, delta flushes, minor/major
//! delta compactions, merging compactions, log GC - is ranked by a
//! perf-improvement score and executed by the [mnt] scheduler on a
//! bounded worker pool.

#[macro_use]
mod error;
#[macro_use]
pub mod util;

pub mod bstore;
pub mod cache;
pub mod cfile;
pub mod config;
pub mod delta;
pub mod drs;
pub mod mdb;
pub mod meta;
pub mod mnt;
pub mod mrs;
pub mod mvcc;
pub mod row;
pub mod rowsettree;
pub mod scan;
pub mod schema;
pub mod tablet;

pub use crate::error::Error;

/// Type alias for Result return type, used uniformly across the package.
pub type Result<T> = std::result::Result<T, Error>;

/// Dense, rowset-local ordinal of a row within a DiskRowSet's base data.
/// Not stable across compactions.
pub type RowId = u32;

/// Write-ahead-log index of the operation that produced a mutation.
/// Minted by consensus, opaque to the storage core except for GC
/// watermarks.
pub type LogIndex = u64;
