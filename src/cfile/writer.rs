//! Module `writer` implement the CFile writer: values stream in, data
//! blocks stream out through a [BlockWriter], and the positional /
//! value indexes, dictionary and footer land behind them on finish.

use std::convert::TryFrom;

use crate::{
    bstore::{BlockId, BlockWriter},
    cfile::{
        block,
        dict::{DictHandle, SharedDict},
        encoding::BlockBuilder,
        index::{ordinal_key, IndexBuilder},
        BlockPointer, Footer, Header, MetaEntry, BLOCK_SIZE, CFILE_VERSION,
        DICT_BLOCK_BUDGET, MAGIC_V2,
    },
    row::{encode_cell, Value},
    schema::{ColumnSchema, ColumnType, Compression, Encoding},
    util, Error, Result,
};

/// Writer configuration for one CFile.
#[derive(Clone, Debug)]
pub struct WriterOpts {
    /// Identifies the column in errors and logs.
    pub name: String,
    pub ctype: ColumnType,
    pub encoding: Encoding,
    pub compression: Compression,
    pub nullable: bool,
    pub array: bool,
    /// Build a value index keyed by the first value of each block.
    /// Set for key columns and ad-hoc primary-key indexes.
    pub value_index: bool,
    /// Target payload size for data blocks. Default: [BLOCK_SIZE].
    pub block_size: usize,
    /// Dictionary budget. Default: [DICT_BLOCK_BUDGET].
    pub dict_budget: usize,
}

impl WriterOpts {
    pub fn new(name: &str, ctype: ColumnType) -> WriterOpts {
        WriterOpts {
            name: name.to_string(),
            encoding: Encoding::default_for(&ctype),
            ctype,
            compression: Compression::None,
            nullable: false,
            array: false,
            value_index: false,
            block_size: BLOCK_SIZE,
            dict_budget: DICT_BLOCK_BUDGET,
        }
    }

    /// Writer configuration matching a schema column.
    pub fn from_column(col: &ColumnSchema) -> WriterOpts {
        WriterOpts {
            name: col.name.clone(),
            ctype: col.ctype.clone(),
            encoding: col.encoding,
            compression: col.compression,
            nullable: col.nullable,
            array: col.array,
            value_index: false,
            block_size: BLOCK_SIZE,
            dict_budget: DICT_BLOCK_BUDGET,
        }
    }

    pub fn set_value_index(mut self, value_index: bool) -> WriterOpts {
        self.value_index = value_index;
        self
    }

    pub fn set_block_size(mut self, block_size: usize) -> WriterOpts {
        self.block_size = block_size;
        self
    }

    pub fn set_compression(mut self, compression: Compression) -> WriterOpts {
        self.compression = compression;
        self
    }
}

/// Single-column file writer. Obtain the backing [BlockWriter] from a
/// block-creation transaction; the written file becomes durable when
/// that transaction commits.
pub struct Writer {
    opts: WriterOpts,
    bw: BlockWriter,
    builder: BlockBuilder,
    dict: Option<DictHandle>,

    header_meta: Vec<MetaEntry>,
    footer_meta: Vec<MetaEntry>,
    started: bool,

    posidx: IndexBuilder,
    validx: Option<IndexBuilder>,

    // open-block state
    block_rows: usize,
    null_bitmap: Vec<u8>,
    array_counts: Vec<u8>,
    first_ordinal: u64,

    value_count: u64,
}

impl Writer {
    pub fn new(bw: BlockWriter, opts: WriterOpts) -> Result<Writer> {
        if !opts.encoding.applies_to(&opts.ctype) {
            err_at!(
                InvalidInput, msg: "{:?} on {:?} column {}", opts.encoding, opts.ctype, opts.name
            )?;
        }
        if opts.array && opts.encoding != Encoding::Plain {
            err_at!(InvalidInput, msg: "array column {} must be plain", opts.name)?;
        }

        let dict = match opts.encoding {
            Encoding::Dictionary => Some(SharedDict::new(opts.dict_budget)),
            _ => None,
        };
        let builder =
            BlockBuilder::new(&opts.ctype, opts.encoding, opts.block_size, dict.clone())?;
        let validx = if opts.value_index {
            Some(IndexBuilder::new())
        } else {
            None
        };

        Ok(Writer {
            opts,
            bw,
            builder,
            dict,

            header_meta: vec![],
            footer_meta: vec![],
            started: false,

            posidx: IndexBuilder::new(),
            validx,

            block_rows: 0,
            null_bitmap: vec![],
            array_counts: vec![],
            first_ordinal: 0,

            value_count: 0,
        })
    }

    /// Attach `key` -> `value` metadata. Entries added before the
    /// first append are written into the header, later ones into the
    /// footer.
    pub fn add_metadata(&mut self, key: &str, value: &[u8]) {
        let entry = MetaEntry {
            key: key.to_string(),
            value: value.to_vec(),
        };
        if self.started {
            self.footer_meta.push(entry);
        } else {
            self.header_meta.push(entry);
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let header = Header {
            version: CFILE_VERSION,
            metadata: std::mem::take(&mut self.header_meta),
        };
        let data = util::into_cbor_bytes(header)?;
        let len = err_at!(FailConvert, u32::try_from(data.len()))?;

        self.bw.append(&MAGIC_V2)?;
        self.bw.append(&len.to_le_bytes())?;
        self.bw.append(&data)?;
        Ok(())
    }

    /// Append a run of rows. `Value::Null` is only valid for nullable
    /// columns, `Value::Array` only for array columns.
    pub fn append(&mut self, values: &[Value]) -> Result<()> {
        self.start()?;

        for value in values.iter() {
            if self.builder.is_full() {
                self.cut_block()?;
            }
            match value {
                Value::Null if self.opts.nullable => self.push_null_bit(false),
                Value::Null => {
                    err_at!(InvalidInput, msg: "null in column {}", self.opts.name)?
                }
                Value::Array(vals) if self.opts.array => {
                    self.push_null_bit(true);
                    util::encode_varint(vals.len() as u64, &mut self.array_counts);
                    for val in vals.iter() {
                        self.builder.push(val)?;
                    }
                }
                Value::Array(_) => {
                    err_at!(InvalidInput, msg: "array in column {}", self.opts.name)?
                }
                value if self.opts.array => {
                    err_at!(
                        InvalidInput, msg: "scalar {} in array column {}", value, self.opts.name
                    )?
                }
                value => {
                    self.push_null_bit(true);
                    self.builder.push(value)?;
                }
            }
            self.block_rows += 1;
            self.value_count += 1;
        }
        Ok(())
    }

    fn push_null_bit(&mut self, set: bool) {
        let bit = self.block_rows;
        if bit / 8 >= self.null_bitmap.len() {
            self.null_bitmap.push(0);
        }
        if set {
            self.null_bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }

    // seal the open data block: assemble the row-level payload, frame
    // it, append it and index it.
    fn cut_block(&mut self) -> Result<()> {
        if self.block_rows == 0 {
            return Ok(());
        }

        let first_value = self.builder.to_first_value();
        let inner = self.builder.finish()?;

        let n_rows = err_at!(FailConvert, u32::try_from(self.block_rows))?;
        let mut payload = Vec::with_capacity(5 + self.null_bitmap.len() + inner.len());
        payload.extend_from_slice(&n_rows.to_le_bytes());
        let wrote_bitmap = self.opts.nullable || self.opts.array;
        payload.push(u8::from(wrote_bitmap));
        if wrote_bitmap {
            payload.extend_from_slice(&self.null_bitmap);
        }
        if self.opts.array {
            payload.extend_from_slice(&self.array_counts);
        }
        payload.extend_from_slice(&inner);

        let framed = block::frame(&payload, self.opts.compression)?;
        let fpos = self.bw.append(&framed)?;
        let len = err_at!(FailConvert, u32::try_from(framed.len()))?;
        let ptr = BlockPointer::new(fpos, len);

        self.posidx.add(ordinal_key(self.first_ordinal), ptr, self.first_ordinal);
        if let Some(validx) = &mut self.validx {
            match first_value {
                Some(value) => {
                    let mut key = vec![];
                    encode_cell(&value, &mut key)?;
                    validx.add(key, ptr, self.first_ordinal);
                }
                None => err_at!(
                    InvalidInput, msg: "nulls in value-indexed column {}", self.opts.name
                )?,
            }
        }

        self.block_rows = 0;
        self.null_bitmap.clear();
        self.array_counts.clear();
        self.first_ordinal = self.value_count;
        Ok(())
    }

    /// Seal the file: flush the open block, write dictionary and
    /// index blocks, footer and trailer. Return the block id and the
    /// footer.
    pub fn finish(mut self) -> Result<(BlockId, Footer)> {
        self.start()?;
        if self.value_count == 0 {
            err_at!(InvalidInput, msg: "empty cfile {}", self.opts.name)?;
        }
        self.cut_block()?;

        let dict_ptr = match &self.dict {
            Some(dict) if !dict.borrow().is_empty() => {
                let payload = dict.borrow().to_block_payload()?;
                let framed = block::frame(&payload, self.opts.compression)?;
                let fpos = self.bw.append(&framed)?;
                let len = err_at!(FailConvert, u32::try_from(framed.len()))?;
                Some(BlockPointer::new(fpos, len))
            }
            _ => None,
        };

        let posidx_root = self.posidx.write(&mut self.bw, self.opts.compression)?;
        let validx_root = match self.validx {
            Some(validx) => Some(validx.write(&mut self.bw, self.opts.compression)?),
            None => None,
        };

        let footer = Footer {
            version: CFILE_VERSION,
            ctype: self.opts.ctype.clone(),
            encoding: self.opts.encoding,
            compression: self.opts.compression,
            nullable: self.opts.nullable,
            array: self.opts.array,
            value_count: self.value_count,
            posidx_root,
            validx_root,
            dict_ptr,
            metadata: self.footer_meta.clone(),
        };

        let data = util::into_cbor_bytes(footer.clone())?;
        let len = err_at!(FailConvert, u32::try_from(data.len()))?;
        self.bw.append(&data)?;
        self.bw.append(&len.to_le_bytes())?;
        self.bw.append(&MAGIC_V2)?;

        let id = self.bw.finish()?;
        Ok((id, footer))
    }

    pub fn to_value_count(&self) -> u64 {
        self.value_count
    }
}
