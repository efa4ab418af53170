//! Module `reader` implement the CFile read path: footer/trailer
//! parsing, btree index descent, cached block fetch and sequential
//! column scans.

use std::{convert::TryInto, sync::Arc};

use crate::{
    bstore::BlockData,
    cache::BlockCache,
    cfile::{
        block,
        dict::Dictionary,
        encoding::BlockDecoder,
        index::{key_ordinal, ordinal_key, read_index_block, IndexEntry},
        BlockPointer, Footer, Header, MAGIC_V1, MAGIC_V2,
    },
    row::{decode_cell, Value},
    scan::Predicate,
    util, Error, Result,
};

/// Read handle over one CFile. Owns its file descriptor; clone-free.
/// Concurrent scans open their own Reader via [Reader::open].
pub struct Reader {
    data: BlockData,
    header: Header,
    footer: Footer,
    // root block of the positional index
    root: Vec<IndexEntry>,
    // root block of the value index, for key columns
    vroot: Option<Vec<IndexEntry>>,
    dict: Option<Arc<Dictionary>>,
    cache: Option<Arc<BlockCache>>,

    // scan-side counters, pull-only
    pub n_blocks_read: u64,
    pub n_bytes_read: u64,
}

impl Reader {
    pub fn open(mut data: BlockData, cache: Option<Arc<BlockCache>>) -> Result<Reader> {
        let len = data.len();
        if len < 28 {
            err_at!(Corruption, msg: "cfile too short {}", len)?;
        }

        let magic = data.read_at(0, 8)?;
        if magic != MAGIC_V2 && magic != MAGIC_V1 {
            err_at!(Corruption, msg: "bad cfile magic {:?}", magic)?;
        }

        let header: Header = {
            let hlen = data.read_at(8, 4)?;
            let hlen = u32::from_le_bytes(hlen.as_slice().try_into().unwrap()) as u64;
            if 12 + hlen > len {
                err_at!(Corruption, msg: "cfile header len {}", hlen)?;
            }
            let bytes = data.read_at(12, hlen as usize)?;
            util::from_cbor_bytes(&bytes)?.0
        };

        let trailer = data.read_at(len - 12, 12)?;
        let tail_magic = &trailer[4..12];
        if tail_magic != MAGIC_V2 && tail_magic != MAGIC_V1 {
            err_at!(Corruption, msg: "bad cfile tail magic {:?}", tail_magic)?;
        }
        let flen = u32::from_le_bytes(trailer[..4].try_into().unwrap()) as u64;
        if flen + 12 > len {
            err_at!(Corruption, msg: "cfile footer len {}", flen)?;
        }

        let footer: Footer = {
            let bytes = data.read_at(len - 12 - flen, flen as usize)?;
            util::from_cbor_bytes(&bytes)?.0
        };

        let root = read_index_block(&mut data, footer.posidx_root, footer.compression)?;
        let vroot = match footer.validx_root {
            Some(ptr) => Some(read_index_block(&mut data, ptr, footer.compression)?),
            None => None,
        };

        let dict = match footer.dict_ptr {
            Some(ptr) => {
                let framed = data.read_at(ptr.fpos, ptr.len as usize)?;
                let payload = block::unframe(&framed, footer.compression)?;
                Some(Arc::new(Dictionary::from_block_payload(
                    &footer.ctype,
                    &payload,
                )?))
            }
            None => None,
        };

        Ok(Reader {
            data,
            header,
            footer,
            root,
            vroot,
            dict,
            cache,

            n_blocks_read: 0,
            n_bytes_read: 0,
        })
    }

    pub fn as_footer(&self) -> &Footer {
        &self.footer
    }

    pub fn to_value_count(&self) -> u64 {
        self.footer.value_count
    }

    /// Look up metadata, footer entries shadowing header entries.
    pub fn find_metadata(&self, key: &str) -> Option<&[u8]> {
        self.footer.find_metadata(key).or_else(|| {
            self.header
                .metadata
                .iter()
                .find(|entry| entry.key == key)
                .map(|entry| entry.value.as_slice())
        })
    }

    fn fetch_index_block(&mut self, ptr: BlockPointer) -> Result<Vec<IndexEntry>> {
        read_index_block(&mut self.data, ptr, self.footer.compression)
    }

    // unframed data-block payload, through the shared cache when one
    // is attached.
    fn fetch_payload(&mut self, ptr: BlockPointer) -> Result<Arc<Vec<u8>>> {
        if let Some(cache) = &self.cache {
            if let Some(payload) = cache.get(self.data.to_id(), ptr.fpos) {
                return Ok(payload);
            }
        }

        let framed = self.data.read_at(ptr.fpos, ptr.len as usize)?;
        let payload = Arc::new(block::unframe(&framed, self.footer.compression)?);
        self.n_blocks_read += 1;
        self.n_bytes_read += framed.len() as u64;

        if let Some(cache) = &self.cache {
            cache.put(self.data.to_id(), ptr.fpos, Arc::clone(&payload));
        }
        Ok(payload)
    }

    fn decode_block(&mut self, ptr: BlockPointer) -> Result<DataBlock> {
        let payload = self.fetch_payload(ptr)?;
        DataBlock::open(&self.footer, &payload, self.dict.clone())
    }

    // descend the positional index to the leaf whose run covers
    // `ordinal`; return the walk stack, top holding the leaf level.
    fn descend_ordinal(&mut self, ordinal: u64) -> Result<Vec<(Vec<IndexEntry>, usize)>> {
        let probe = ordinal_key(ordinal);
        let mut stack = vec![];
        let mut entries = self.root.clone();
        loop {
            let at = match entries.binary_search_by(|e| e.key.as_slice().cmp(&probe)) {
                Ok(at) => at,
                Err(0) => 0,
                Err(at) => at - 1,
            };
            let leaf = entries[at].leaf;
            let ptr = entries[at].ptr;
            stack.push((entries, at));
            if leaf {
                break Ok(stack);
            }
            entries = self.fetch_index_block(ptr)?;
        }
    }

    // descend the value index to the right-most leaf whose first key
    // is <= probe.
    fn descend_value(&mut self, probe: &Value) -> Result<Vec<(Vec<IndexEntry>, usize)>> {
        let vroot = match &self.vroot {
            Some(vroot) => vroot.clone(),
            None => err_at!(InvalidInput, msg: "cfile has no value index")?,
        };

        let ctype = self.footer.ctype.clone();
        let cmp = |entry: &IndexEntry| -> Result<std::cmp::Ordering> {
            Ok(decode_cell(&ctype, &entry.key)?.cmp(probe))
        };

        let mut stack = vec![];
        let mut entries = vroot;
        loop {
            // right-most entry with key <= probe, else the first
            let mut at = 0;
            for (i, entry) in entries.iter().enumerate() {
                match cmp(entry)? {
                    std::cmp::Ordering::Greater => break,
                    _ => at = i,
                }
            }
            let leaf = entries[at].leaf;
            let ptr = entries[at].ptr;
            stack.push((entries, at));
            if leaf {
                break Ok(stack);
            }
            entries = self.fetch_index_block(ptr)?;
        }
    }

    /// Sequential scan positioned at `ordinal`.
    pub fn scan_from_ordinal(&mut self, ordinal: u64) -> Result<ColumnScan> {
        let ordinal = ordinal.min(self.footer.value_count);
        if ordinal == self.footer.value_count {
            return Ok(ColumnScan::exhausted(self));
        }

        let stack = self.descend_ordinal(ordinal)?;
        let (leaf_entries, at) = stack.last().unwrap();
        let entry = &leaf_entries[*at];
        let first_ordinal = key_ordinal(&entry.key)?;
        let ptr = entry.ptr;

        let mut scan = ColumnScan {
            stack,
            block: None,
            block_first_ordinal: first_ordinal,
            next_ordinal: ordinal,
            reader_done: false,
            n_dict_materialized: 0,
        };
        scan.load_block(self, ptr, (ordinal - first_ordinal) as usize)?;
        Ok(scan)
    }

    /// Position a scan at the first row whose value is `>= probe`.
    /// Only meaningful for sorted, non-null columns (key columns, the
    /// ad-hoc PK index, delta key files). Return `(scan, exact)`.
    pub fn seek_at_or_after(&mut self, probe: &Value) -> Result<(ColumnScan, bool)> {
        let stack = self.descend_value(probe)?;
        let (leaf_entries, at) = stack.last().unwrap();
        let entry = &leaf_entries[*at];
        let first_ordinal = entry.ordinal;
        let ptr = entry.ptr;

        let mut block = self.decode_block(ptr)?;
        let exact = block.decoder.seek_at_or_after_value(probe)?;
        let row = block.decoder.to_position();
        let in_block = block.n_rows;

        let mut scan = ColumnScan {
            stack,
            block: Some(block),
            block_first_ordinal: first_ordinal,
            next_ordinal: first_ordinal + row as u64,
            reader_done: false,
            n_dict_materialized: 0,
        };

        if row >= in_block {
            // probe is past this block; fall to the next one
            scan.advance_block(self)?;
        }
        Ok((scan, exact))
    }

    /// Ordinal-addressed point read: the value of row `ordinal`.
    pub fn read_value_at(&mut self, ordinal: u64) -> Result<Value> {
        let mut scan = self.scan_from_ordinal(ordinal)?;
        let mut out = vec![];
        match scan.next_values(self, 1, &mut out)? {
            1 => Ok(out.pop().unwrap()),
            _ => err_at!(Corruption, msg: "ordinal {} out of range", ordinal),
        }
    }
}

/// One decoded data block: row-level view over the inner decoder,
/// reconstructing nulls and array runs.
pub struct DataBlock {
    pub n_rows: usize,
    nulls: Option<Vec<u8>>,
    // element-count prefix sums for array rows, indexed by non-null
    // ordinal; counts[i] is the element offset of non-null row i.
    count_sums: Option<Vec<u64>>,
    counts: Option<Vec<u64>>,
    pub(crate) decoder: BlockDecoder,
}

impl DataBlock {
    pub fn open(
        footer: &Footer,
        payload: &[u8],
        dict: Option<Arc<Dictionary>>,
    ) -> Result<DataBlock> {
        check_remaining!(payload, 5, "datablock-header")?;
        let n_rows = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
        let has_bitmap = payload[4] != 0;
        let mut off = 5;

        let nulls = if has_bitmap {
            let n = (n_rows + 7) / 8;
            check_remaining!(&payload[off..], n, "datablock-nulls")?;
            let bitmap = payload[off..off + n].to_vec();
            off += n;
            Some(bitmap)
        } else {
            None
        };

        let n_nonnull = match &nulls {
            Some(bitmap) => popcount(bitmap, n_rows),
            None => n_rows,
        };

        let (counts, count_sums) = if footer.array {
            let mut counts = Vec::with_capacity(n_nonnull);
            let mut sums = Vec::with_capacity(n_nonnull);
            let mut total = 0_u64;
            for _ in 0..n_nonnull {
                let (count, n) = util::decode_varint(&payload[off..])?;
                off += n;
                sums.push(total);
                counts.push(count);
                total += count;
            }
            (Some(counts), Some(sums))
        } else {
            (None, None)
        };

        let decoder =
            BlockDecoder::open(&footer.ctype, footer.encoding, &payload[off..], dict)?;

        Ok(DataBlock {
            n_rows,
            nulls,
            count_sums,
            counts,
            decoder,
        })
    }

    fn is_null(&self, row: usize) -> bool {
        match &self.nulls {
            Some(bitmap) => bitmap[row / 8] & (1 << (row % 8)) == 0,
            None => false,
        }
    }

    // count of non-null rows before `row`.
    fn nonnull_before(&self, row: usize) -> usize {
        match &self.nulls {
            Some(bitmap) => {
                let mut n = 0;
                for i in 0..row {
                    if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                        n += 1;
                    }
                }
                n
            }
            None => row,
        }
    }

    /// Materialize rows `[from, from+n)` of this block into `out`.
    pub fn read_rows(&mut self, from: usize, n: usize, out: &mut Vec<Value>) -> Result<usize> {
        let until = (from + n).min(self.n_rows);
        let mut nn = self.nonnull_before(from);

        for row in from..until {
            if self.is_null(row) {
                out.push(Value::Null);
                continue;
            }
            match (&self.counts, &self.count_sums) {
                (Some(counts), Some(sums)) => {
                    self.decoder.seek_to_position(sums[nn] as usize)?;
                    let mut elems = vec![];
                    self.decoder.copy_next_values(counts[nn] as usize, &mut elems)?;
                    out.push(Value::Array(elems));
                }
                _ => {
                    self.decoder.seek_to_position(nn)?;
                    let m = self.decoder.copy_next_values(1, out)?;
                    if m != 1 {
                        err_at!(Corruption, msg: "short block {} {}", row, self.n_rows)?;
                    }
                }
            }
            nn += 1;
        }
        Ok(until.saturating_sub(from))
    }

    /// Materialize rows while evaluating `pred`; rows failing the
    /// predicate clear their `sel` bit and, for dictionary blocks,
    /// skip materialization.
    pub fn read_rows_eval(
        &mut self,
        from: usize,
        n: usize,
        pred: &Predicate,
        base: u32,
        sel: &mut croaring::Bitmap,
        out: &mut Vec<Value>,
    ) -> Result<usize> {
        let until = (from + n).min(self.n_rows);
        if self.nulls.is_none() && self.counts.is_none() {
            let nn = self.nonnull_before(from);
            self.decoder.seek_to_position(nn)?;
            return self
                .decoder
                .copy_next_and_eval(until - from, pred, base, sel, out);
        }

        // nullable or array blocks evaluate row-at-a-time
        let start = out.len();
        let m = self.read_rows(from, until.saturating_sub(from), out)?;
        for (i, value) in out[start..].iter().enumerate() {
            if !pred.matches(value) {
                sel.remove(base + i as u32);
            }
        }
        Ok(m)
    }
}

fn popcount(bitmap: &[u8], n_bits: usize) -> usize {
    let mut n = 0;
    for i in 0..n_bits {
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            n += 1;
        }
    }
    n
}

/// Sequential, forward-only scan over one CFile's rows.
pub struct ColumnScan {
    stack: Vec<(Vec<IndexEntry>, usize)>,
    block: Option<DataBlock>,
    block_first_ordinal: u64,
    next_ordinal: u64,
    reader_done: bool,
    n_dict_materialized: usize,
}

impl ColumnScan {
    fn exhausted(reader: &Reader) -> ColumnScan {
        ColumnScan {
            stack: vec![],
            block: None,
            block_first_ordinal: reader.footer.value_count,
            next_ordinal: reader.footer.value_count,
            reader_done: true,
            n_dict_materialized: 0,
        }
    }

    fn load_block(&mut self, reader: &mut Reader, ptr: BlockPointer, row: usize) -> Result<()> {
        self.retire_block();
        let block = reader.decode_block(ptr)?;
        self.block = Some(block);
        self.next_ordinal = self.block_first_ordinal + row as u64;
        Ok(())
    }

    // fold the outgoing block's dictionary counter into the scan.
    fn retire_block(&mut self) {
        if let Some(block) = &self.block {
            if let crate::cfile::encoding::BlockDecoder::Dict(decoder) = &block.decoder {
                self.n_dict_materialized += decoder.n_materialized;
            }
        }
        self.block = None;
    }

    /// Values materialized through dictionary decode so far; the
    /// codeword short-circuit keeps this below the rows consumed.
    pub fn to_dict_materialized(&self) -> usize {
        let mut n = self.n_dict_materialized;
        if let Some(block) = &self.block {
            if let crate::cfile::encoding::BlockDecoder::Dict(decoder) = &block.decoder {
                n += decoder.n_materialized;
            }
        }
        n
    }

    // advance the stack to the next leaf entry and load its block.
    fn advance_block(&mut self, reader: &mut Reader) -> Result<bool> {
        loop {
            let (entries, at) = match self.stack.last_mut() {
                Some(top) => top,
                None => {
                    self.retire_block();
                    self.reader_done = true;
                    return Ok(false);
                }
            };
            *at += 1;
            if *at >= entries.len() {
                self.stack.pop();
                continue;
            }
            let entry = entries[*at].clone();
            if entry.leaf {
                self.block_first_ordinal = entry.ordinal;
                self.load_block(reader, entry.ptr, 0)?;
                return Ok(true);
            }
            // descend into the left-most child of this subtree
            let mut child = reader.fetch_index_block(entry.ptr)?;
            loop {
                let leaf = child[0].leaf;
                let ptr = child[0].ptr;
                let ordinal = child[0].ordinal;
                self.stack.push((child, 0));
                if leaf {
                    self.block_first_ordinal = ordinal;
                    self.load_block(reader, ptr, 0)?;
                    return Ok(true);
                }
                child = reader.fetch_index_block(ptr)?;
            }
        }
    }

    /// Current absolute row ordinal.
    pub fn to_ordinal(&self) -> u64 {
        self.next_ordinal
    }

    pub fn is_done(&self) -> bool {
        self.reader_done
    }

    /// Copy up to `n` rows into `out`; return the number copied.
    pub fn next_values(
        &mut self,
        reader: &mut Reader,
        n: usize,
        out: &mut Vec<Value>,
    ) -> Result<usize> {
        let mut copied = 0;
        while copied < n {
            let (n_rows, row) = match &self.block {
                Some(block) => {
                    (block.n_rows, (self.next_ordinal - self.block_first_ordinal) as usize)
                }
                None => break,
            };
            if row >= n_rows {
                if !self.advance_block(reader)? {
                    break;
                }
                continue;
            }
            let block = self.block.as_mut().unwrap();
            let m = block.read_rows(row, n - copied, out)?;
            copied += m;
            self.next_ordinal += m as u64;
        }
        Ok(copied)
    }

    /// Copy up to `n` rows, evaluating `pred` and clearing `sel` bits
    /// (indexed from `base`, aligned with the first row copied).
    pub fn next_values_eval(
        &mut self,
        reader: &mut Reader,
        n: usize,
        pred: &Predicate,
        base: u32,
        sel: &mut croaring::Bitmap,
        out: &mut Vec<Value>,
    ) -> Result<usize> {
        let mut copied = 0;
        while copied < n {
            let (n_rows, row) = match &self.block {
                Some(block) => {
                    (block.n_rows, (self.next_ordinal - self.block_first_ordinal) as usize)
                }
                None => break,
            };
            if row >= n_rows {
                if !self.advance_block(reader)? {
                    break;
                }
                continue;
            }
            let block = self.block.as_mut().unwrap();
            let m = block.read_rows_eval(
                row,
                n - copied,
                pred,
                base + copied as u32,
                sel,
                out,
            )?;
            copied += m;
            self.next_ordinal += m as u64;
        }
        Ok(copied)
    }
}

#[cfg(test)]
#[path = "reader_test.rs"]
mod reader_test;
