//! Module `meta` implement the tablet superblock: schema history,
//! rowset metadata and id allocators, persisted as a cbor document
//! with a marker trailer and replaced atomically via rename.

use cbordata::Cborize;
use lazy_static::lazy_static;

use std::{
    convert::{TryFrom, TryInto},
    ffi, fs, path,
};

use crate::{
    bstore::BlockId,
    schema::{ColumnId, Schema},
    util, Error, LogIndex, Result,
};

const META_VER: u32 = 0x00610001;

lazy_static! {
    /// Finger print at the tip of a tablet meta file, not to be
    /// tampered with.
    pub static ref META_MARKER: Vec<u8> = {
        let marker = "ஆறுவது சினம்";
        marker.as_bytes().to_vec()
    };
}

/// Mapping of one column id to its base CFile block.
#[derive(Clone, Debug, Cborize)]
pub struct ColumnBlock {
    pub col_id: ColumnId,
    pub block: BlockId,
}

impl ColumnBlock {
    const ID: u32 = META_VER;
}

/// Durable description of one DiskRowSet.
#[derive(Clone, Debug, Cborize)]
pub struct RowSetMeta {
    pub rowset_id: u64,
    pub column_blocks: Vec<ColumnBlock>,
    pub bloom_block: BlockId,
    pub ad_hoc_index_block: BlockId,
    pub undo_blocks: Vec<BlockId>,
    pub redo_blocks: Vec<BlockId>,
    /// Lowest WAL index whose mutations live only in this rowset's
    /// DeltaMemStore; None when the DMS is clean.
    pub dms_min_log_idx: Option<LogIndex>,
    pub n_rows: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl RowSetMeta {
    const ID: u32 = META_VER;

    /// Every block this rowset references.
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids = vec![self.bloom_block, self.ad_hoc_index_block];
        ids.extend(self.column_blocks.iter().map(|cb| cb.block));
        ids.extend(self.undo_blocks.iter().copied());
        ids.extend(self.redo_blocks.iter().copied());
        ids
    }
}

/// The tablet superblock.
#[derive(Clone, Debug, Cborize)]
pub struct TabletMeta {
    pub tablet_id: String,
    /// Every schema this tablet has carried; the last entry is
    /// current. Column ids are never reused across entries.
    pub schemas: Vec<Schema>,
    pub rowsets: Vec<RowSetMeta>,
    pub next_rowset_id: u64,
    /// Next value of the auto-increment column, when the schema
    /// carries one.
    pub next_auto_increment: i64,
    /// WAL index of the last batch applied before the most recent
    /// flush of this superblock.
    pub last_applied_log_index: LogIndex,
}

impl TabletMeta {
    const ID: u32 = META_VER;

    pub fn new(schema: Schema) -> TabletMeta {
        TabletMeta {
            tablet_id: uuid::Uuid::new_v4().to_string(),
            schemas: vec![schema],
            rowsets: vec![],
            next_rowset_id: 1,
            next_auto_increment: 1,
            last_applied_log_index: 0,
        }
    }

    pub fn to_schema(&self) -> Schema {
        self.schemas.last().cloned().unwrap()
    }

    pub fn find_rowset(&self, rowset_id: u64) -> Option<&RowSetMeta> {
        self.rowsets.iter().find(|rs| rs.rowset_id == rowset_id)
    }

    /// Location of the meta file under `dir`.
    pub fn to_location(dir: &ffi::OsStr) -> ffi::OsString {
        let loc: path::PathBuf = [path::Path::new(dir), path::Path::new("tablet.meta")]
            .iter()
            .collect();
        loc.into_os_string()
    }

    /// Persist atomically: serialize, append the length-prefixed
    /// marker, write to a side file and rename over the live one.
    pub fn save(&self, dir: &ffi::OsStr) -> Result<()> {
        let mut data = util::into_cbor_bytes(self.clone())?;
        let len = err_at!(FailConvert, u64::try_from(data.len()))?;
        data.extend_from_slice(&len.to_be_bytes());
        data.extend_from_slice(&META_MARKER);

        let loc = Self::to_location(dir);
        let tmp = {
            let mut tmp = loc.clone();
            tmp.push(".new");
            tmp
        };
        let mut fd = util::create_file_a(&tmp)?;
        util::sync_write(&mut fd, &data)?;
        err_at!(IOError, fs::rename(&tmp, &loc), "renaming tablet meta")?;
        Ok(())
    }

    /// Load and verify the marker trailer.
    pub fn load(dir: &ffi::OsStr) -> Result<TabletMeta> {
        let loc = Self::to_location(dir);
        let data = err_at!(IOError, fs::read(&loc), "reading tablet meta {:?}", loc)?;

        let marker_len = META_MARKER.len();
        if data.len() < marker_len + 8 {
            err_at!(Corruption, msg: "tablet meta too short {}", data.len())?;
        }
        let tail = &data[data.len() - marker_len..];
        if tail != META_MARKER.as_slice() {
            err_at!(Corruption, msg: "tablet meta marker mismatch")?;
        }
        let at = data.len() - marker_len - 8;
        let len = u64::from_be_bytes(data[at..at + 8].try_into().unwrap()) as usize;
        if len != at {
            err_at!(Corruption, msg: "tablet meta length {} != {}", len, at)?;
        }

        Ok(util::from_cbor_bytes(&data[..at])?.0)
    }

    pub fn exists(dir: &ffi::OsStr) -> bool {
        path::Path::new(&Self::to_location(dir)).is_file()
    }
}

#[cfg(test)]
#[path = "meta_test.rs"]
mod meta_test;
