//! Package implement CFile, the immutable single-column file format.
//!
//! A CFile is a single logical file, stored as one block in the
//! [crate::bstore], containing in order:
//!
//! * 8-byte magic, 4-byte header length, header (cbor).
//! * A run of framed data blocks (see [block]).
//! * Optional dictionary block, for dictionary-encoded columns.
//! * Positional-index blocks: a btree keyed by row ordinal.
//! * Optional value-index blocks: a btree keyed by the first value of
//!   each data block; present for key columns and ad-hoc primary-key
//!   indexes.
//! * Footer (cbor), 4-byte footer length, 8-byte magic.
//!
//! All multi-byte integers on disk are little-endian. Each framed
//! block carries a crc32c; readers verify the checksum before
//! trusting any field.

use cbordata::Cborize;

use crate::schema::{ColumnType, Compression, Encoding};

pub mod block;
mod bshuf;
mod dict;
pub mod encoding;
mod index;
mod plain;
mod prefix;
pub mod reader;
mod rle;
pub mod writer;

pub use reader::Reader;
pub use writer::{Writer, WriterOpts};

/// File format magic, current version.
pub const MAGIC_V2: [u8; 8] = *b"coltcfl2";
/// File format magic, older revision; readable, never written.
pub const MAGIC_V1: [u8; 8] = *b"coltcfl1";

/// Default target payload size for data blocks.
pub const BLOCK_SIZE: usize = 32 * 1024;
/// Default target payload size for index blocks.
pub const INDEX_BLOCK_SIZE: usize = 4 * 1024;
/// Budget for the per-CFile dictionary; once crossed the writer
/// switches data blocks to plain encoding.
pub const DICT_BLOCK_BUDGET: usize = 256 * 1024;
/// Restart interval for prefix-encoded blocks.
pub const PREFIX_RESTART_INTERVAL: usize = 16;

const CFILE_VER: u32 = 0x00410002;

/// Format version recorded in header and footer.
pub const CFILE_VERSION: u32 = 2;

/// Location of a framed block within the file: offset and framed
/// length.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Cborize)]
pub struct BlockPointer {
    pub fpos: u64,
    pub len: u32,
}

impl BlockPointer {
    const ID: u32 = CFILE_VER;

    pub fn new(fpos: u64, len: u32) -> BlockPointer {
        BlockPointer { fpos, len }
    }
}

/// Arbitrary key -> value metadata entry, carried in header or footer.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct MetaEntry {
    pub key: String,
    pub value: Vec<u8>,
}

impl MetaEntry {
    const ID: u32 = CFILE_VER;
}

/// CFile header, written before the first data block.
#[derive(Clone, Debug, Cborize)]
pub struct Header {
    pub version: u32,
    pub metadata: Vec<MetaEntry>,
}

impl Header {
    const ID: u32 = CFILE_VER;
}

/// CFile footer: column shape, block pointers and metadata.
#[derive(Clone, Debug, Cborize)]
pub struct Footer {
    pub version: u32,
    pub ctype: ColumnType,
    pub encoding: Encoding,
    pub compression: Compression,
    pub nullable: bool,
    pub array: bool,
    /// Number of rows held by this file.
    pub value_count: u64,
    /// Root of the positional index.
    pub posidx_root: BlockPointer,
    /// Root of the value index, when built.
    pub validx_root: Option<BlockPointer>,
    /// Dictionary block, for dictionary-encoded columns.
    pub dict_ptr: Option<BlockPointer>,
    pub metadata: Vec<MetaEntry>,
}

impl Footer {
    const ID: u32 = CFILE_VER;

    pub fn find_metadata(&self, key: &str) -> Option<&[u8]> {
        self.metadata
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_slice())
    }
}

/// Well-known metadata key: minimum encoded PK in a base-data CFile.
pub const META_MIN_KEY: &str = "min_key";
/// Well-known metadata key: maximum encoded PK in a base-data CFile.
pub const META_MAX_KEY: &str = "max_key";
/// Well-known metadata key: delta-file stats (cbor).
pub const META_DELTA_STATS: &str = "delta_stats";

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
