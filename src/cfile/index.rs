//! Module `index` implement the btree index blocks of a CFile.
//!
//! Leaf entries point at data blocks; internal entries point at the
//! index block holding their children, keyed by the first key of that
//! subtree. The tree is built bottom-up once all data blocks are on
//! disk, then written level by level, root last. Positional indexes
//! key on the big-endian row ordinal; value indexes key on the first
//! value of each data block, in the cell codec.

use cbordata::Cborize;

use std::convert::TryFrom;

use crate::{
    bstore::BlockWriter,
    cfile::{block, BlockPointer, INDEX_BLOCK_SIZE},
    schema::Compression,
    util, Error, Result,
};

const INDEX_VER: u32 = 0x00420001;

/// One entry of an index block.
#[derive(Clone, Debug, Cborize)]
pub struct IndexEntry {
    /// Big-endian ordinal, or first-value cell bytes.
    pub key: Vec<u8>,
    /// Block this entry covers: a data block for leaf entries, an
    /// index block otherwise.
    pub ptr: BlockPointer,
    pub leaf: bool,
    /// First row ordinal under this entry.
    pub ordinal: u64,
}

impl IndexEntry {
    const ID: u32 = INDEX_VER;
}

/// Compose the big-endian key form of a row ordinal.
pub fn ordinal_key(ordinal: u64) -> Vec<u8> {
    ordinal.to_be_bytes().to_vec()
}

/// Decode an ordinal key.
pub fn key_ordinal(key: &[u8]) -> Result<u64> {
    use std::convert::TryInto;

    match key.try_into() {
        Ok(bytes) => Ok(u64::from_be_bytes(bytes)),
        Err(_) => err_at!(Corruption, msg: "bad ordinal key {}", key.len()),
    }
}

/// Accumulates leaf entries while data blocks stream out, then writes
/// the btree.
pub struct IndexBuilder {
    entries: Vec<IndexEntry>,
}

impl IndexBuilder {
    pub fn new() -> IndexBuilder {
        IndexBuilder { entries: vec![] }
    }

    /// Register a data block keyed by `key`, holding rows starting at
    /// `ordinal`.
    pub fn add(&mut self, key: Vec<u8>, ptr: BlockPointer, ordinal: u64) {
        self.entries.push(IndexEntry {
            key,
            ptr,
            leaf: true,
            ordinal,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write index blocks bottom-up and return the root pointer.
    pub fn write(
        mut self,
        bw: &mut BlockWriter,
        compression: Compression,
    ) -> Result<BlockPointer> {
        if self.entries.is_empty() {
            err_at!(InvalidInput, msg: "empty index")?;
        }

        loop {
            let blocks = Self::chunk(&self.entries)?;
            let mut parents = Vec::with_capacity(blocks.len());
            for entries in blocks.into_iter() {
                let key = entries[0].key.clone();
                let ordinal = entries[0].ordinal;
                let ptr = write_index_block(bw, &entries, compression)?;
                parents.push(IndexEntry {
                    key,
                    ptr,
                    leaf: false,
                    ordinal,
                });
            }
            if parents.len() == 1 {
                break Ok(parents.remove(0).ptr);
            }
            self.entries = parents;
        }
    }

    // split entries into runs fitting the index block budget.
    fn chunk(entries: &[IndexEntry]) -> Result<Vec<Vec<IndexEntry>>> {
        let mut blocks = vec![];
        let mut run: Vec<IndexEntry> = vec![];
        let mut run_bytes = 0;
        for entry in entries.iter() {
            let n = util::into_cbor_bytes(entry.clone())?.len();
            if !run.is_empty() && run_bytes + n > INDEX_BLOCK_SIZE {
                blocks.push(std::mem::take(&mut run));
                run_bytes = 0;
            }
            run.push(entry.clone());
            run_bytes += n;
        }
        if !run.is_empty() {
            blocks.push(run);
        }
        Ok(blocks)
    }
}

impl Default for IndexBuilder {
    fn default() -> Self {
        IndexBuilder::new()
    }
}

fn write_index_block(
    bw: &mut BlockWriter,
    entries: &[IndexEntry],
    compression: Compression,
) -> Result<BlockPointer> {
    let payload = util::into_cbor_bytes(entries.to_vec())?;
    let framed = block::frame(&payload, compression)?;
    let fpos = bw.append(&framed)?;
    let len = err_at!(FailConvert, u32::try_from(framed.len()))?;
    Ok(BlockPointer::new(fpos, len))
}

/// Read one index block back.
pub fn read_index_block(
    data: &mut crate::bstore::BlockData,
    ptr: BlockPointer,
    compression: Compression,
) -> Result<Vec<IndexEntry>> {
    let framed = data.read_at(ptr.fpos, ptr.len as usize)?;
    let payload = block::unframe(&framed, compression)?;
    Ok(util::from_cbor_bytes(&payload)?.0)
}
