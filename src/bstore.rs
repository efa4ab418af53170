//! Module `bstore` implement the file-per-block store backing a
//! tablet's CFiles, bloom filters and delta files.
//!
//! A block is an immutable, append-once byte container identified by a
//! 64-bit id. Writers go through a [CreateTxn]: blocks created inside
//! the transaction are deleted on drop unless the transaction is
//! committed, so a failed flush or compaction never leaks half-written
//! blocks into the store.

use cbordata::Cborize;
use fs2::FileExt;

use std::{
    ffi, fmt, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        Arc,
    },
};

use crate::{util, Error, Result};

const BLOCK_ID_VER: u32 = 0x00310001;

/// Identity of a block within the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Cborize)]
pub struct BlockId {
    pub id: u64,
}

impl BlockId {
    const ID: u32 = BLOCK_ID_VER;

    pub fn new(id: u64) -> BlockId {
        BlockId { id }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "blk-{:016x}", self.id)
    }
}

/// File-per-block store rooted at `<dir>/blocks`.
pub struct BlockStore {
    dir: ffi::OsString,
    next_id: AtomicU64,
}

impl BlockStore {
    /// Open, creating the backing directory when missing. Scans
    /// existing block files to seed the id allocator.
    pub fn open(dir: &ffi::OsStr) -> Result<BlockStore> {
        let root = Self::blocks_dir(dir);
        err_at!(IOError, fs::create_dir_all(&root))?;

        let mut max_id = 0_u64;
        for entry in err_at!(IOError, fs::read_dir(&root))? {
            let entry = err_at!(IOError, entry)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(hex) = name.strip_prefix("blk-") {
                match u64::from_str_radix(hex, 16) {
                    Ok(id) => max_id = max_id.max(id),
                    Err(_) => err_at!(InvalidFile, msg: "alien file {:?}", name)?,
                }
            }
        }

        Ok(BlockStore {
            dir: dir.to_os_string(),
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    fn blocks_dir(dir: &ffi::OsStr) -> PathBuf {
        [Path::new(dir), Path::new("blocks")].iter().collect()
    }

    pub fn to_location(&self, id: BlockId) -> ffi::OsString {
        let file: PathBuf = [
            Self::blocks_dir(&self.dir),
            PathBuf::from(format!("blk-{:016x}", id.id)),
        ]
        .iter()
        .collect();
        file.into_os_string()
    }

    fn mint_id(&self) -> BlockId {
        BlockId::new(self.next_id.fetch_add(1, SeqCst))
    }

    /// Start a block-creation transaction.
    pub fn new_txn(self: &Arc<Self>) -> CreateTxn {
        CreateTxn {
            store: Arc::clone(self),
            created: vec![],
            committed: false,
        }
    }

    /// Open `id` for reading.
    pub fn read(&self, id: BlockId) -> Result<BlockData> {
        let loc = self.to_location(id);
        let fd = match util::open_file_r(&loc) {
            Ok(fd) => fd,
            Err(err) => {
                return err_at!(InvalidFile, msg: "missing block {}: {}", id, err)
            }
        };
        let len = err_at!(IOError, fd.metadata())?.len();
        Ok(BlockData { id, fd, len })
    }

    pub fn exists(&self, id: BlockId) -> bool {
        Path::new(&self.to_location(id)).is_file()
    }

    pub fn on_disk_size(&self, id: BlockId) -> Result<u64> {
        let loc = self.to_location(id);
        Ok(err_at!(IOError, fs::metadata(&loc))?.len())
    }

    /// Delete `id` from the store. Callers hold no readers over it.
    pub fn delete(&self, id: BlockId) -> Result<()> {
        let loc = self.to_location(id);
        err_at!(IOError, fs::remove_file(&loc), "deleting {}", id)
    }
}

/// Scope of a set of block creations. Blocks created through the
/// transaction are purged on drop unless [CreateTxn::commit] ran.
pub struct CreateTxn {
    store: Arc<BlockStore>,
    created: Vec<BlockId>,
    committed: bool,
}

impl Drop for CreateTxn {
    fn drop(&mut self) {
        if !self.committed {
            for id in self.created.drain(..) {
                self.store.delete(id).ok();
            }
        }
    }
}

impl CreateTxn {
    /// Create a fresh block for writing.
    pub fn create(&mut self) -> Result<BlockWriter> {
        let id = self.store.mint_id();
        let loc = self.store.to_location(id);
        let fd = util::create_file_a(&loc)?;
        self.created.push(id);

        Ok(BlockWriter {
            id,
            loc,
            fd,
            fpos: 0,
        })
    }

    /// Make the created blocks permanent.
    pub fn commit(mut self) -> Result<Vec<BlockId>> {
        self.committed = true;
        Ok(self.created.drain(..).collect())
    }
}

/// Writable handle for a block under creation. Append-only.
pub struct BlockWriter {
    id: BlockId,
    loc: ffi::OsString,
    fd: fs::File,
    fpos: u64,
}

impl BlockWriter {
    pub fn to_id(&self) -> BlockId {
        self.id
    }

    /// Current append offset.
    pub fn to_fpos(&self) -> u64 {
        self.fpos
    }

    /// Append `data`, return the offset it landed at.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let fpos = self.fpos;
        write_file!(self.fd, data, &self.loc, "block append")?;
        self.fpos += data.len() as u64;
        Ok(fpos)
    }

    /// Sync and close the block. The block becomes readable once the
    /// owning transaction commits.
    pub fn finish(self) -> Result<BlockId> {
        err_at!(IOError, self.fd.sync_all(), "sync {}", self.id)?;
        Ok(self.id)
    }
}

/// Read-only handle on a block.
pub struct BlockData {
    id: BlockId,
    fd: fs::File,
    len: u64,
}

impl BlockData {
    pub fn to_id(&self) -> BlockId {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read `n` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, n: usize) -> Result<Vec<u8>> {
        use std::io::SeekFrom;

        if offset + (n as u64) > self.len {
            err_at!(
                Corruption, msg: "read past block {} {}+{}/{}", self.id, offset, n, self.len
            )?;
        }
        read_file!(self.fd, SeekFrom::Start(offset), n as u64, "block read")
    }

    /// Take a shared advisory lock for long-lived scans.
    pub fn lock_shared(&self) -> Result<()> {
        err_at!(IOError, self.fd.lock_shared())
    }

    pub fn unlock(&self) -> Result<()> {
        err_at!(IOError, self.fd.unlock())
    }
}

#[cfg(test)]
#[path = "bstore_test.rs"]
mod bstore_test;
