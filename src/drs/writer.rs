//! Module `writer` implement the DiskRowSet writer: a key-ascending
//! stream of rows lands as one CFile per column, an ad-hoc primary-key
//! index, a bloom filter over encoded keys, and the initial UNDO/REDO
//! delta files. All blocks belong to a single creation transaction;
//! nothing survives unless the caller commits it.

use xorfilter::{BuildHasherDefault, Xor8};

use std::{convert::TryFrom, sync::Arc};

use crate::{
    bstore::{BlockId, BlockStore, CreateTxn},
    cfile::{self, block, Writer, WriterOpts},
    delta::{DeltaFileWriter, DeltaKey, RowChange},
    mvcc::Timestamp,
    row::Value,
    schema::{ColumnId, ColumnType, Compression, Encoding, Schema},
    util, Error, Result, RowId,
};

/// One row bound for the base data, with the delta history that keeps
/// older and newer versions readable.
pub struct FlushRow {
    pub key: Vec<u8>,
    /// Base image, schema order.
    pub cells: Vec<Value>,
    /// History below the base image, timestamp ascending.
    pub undos: Vec<(Timestamp, RowChange)>,
    /// History above the base image (a trailing delete for rows dead
    /// at the flush frontier), timestamp ascending.
    pub redos: Vec<(Timestamp, RowChange)>,
}

/// Everything a committed DiskRowSet write produced; feeds the rowset
/// metadata.
pub struct DrsArtifacts {
    pub column_blocks: Vec<(ColumnId, BlockId)>,
    pub pkidx_block: BlockId,
    pub bloom_block: BlockId,
    pub undo_blocks: Vec<BlockId>,
    pub redo_blocks: Vec<BlockId>,
    pub n_rows: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

/// Streaming writer for one DiskRowSet.
pub struct DrsWriter {
    schema: Arc<Schema>,
    name: String,
    txn: CreateTxn,

    col_writers: Vec<(ColumnId, Writer)>,
    pk_writer: Writer,
    undo_writer: Option<DeltaFileWriter>,
    redo_writer: Option<DeltaFileWriter>,

    bloom_keys: Vec<Vec<u8>>,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    n_rows: u64,
}

impl DrsWriter {
    pub fn new(store: &Arc<BlockStore>, schema: Arc<Schema>, name: &str) -> Result<DrsWriter> {
        let mut txn = store.new_txn();

        let mut col_writers = vec![];
        for col in schema.cols.iter() {
            let opts = WriterOpts::from_column(col);
            let writer = Writer::new(txn.create()?, opts)?;
            col_writers.push((col.id, writer));
        }

        let pk_opts = WriterOpts::new(&format!("{}/pkidx", name), ColumnType::Binary)
            .set_value_index(true)
            .set_compression(Compression::Zstd);
        let pk_opts = WriterOpts {
            encoding: Encoding::Prefix,
            ..pk_opts
        };
        let pk_writer = Writer::new(txn.create()?, pk_opts)?;

        Ok(DrsWriter {
            schema,
            name: name.to_string(),
            txn,

            col_writers,
            pk_writer,
            undo_writer: None,
            redo_writer: None,

            bloom_keys: vec![],
            min_key: None,
            max_key: None,
            n_rows: 0,
        })
    }

    /// Append one row; keys must arrive ascending. The row id of the
    /// appended row is returned.
    pub fn append(&mut self, row: FlushRow) -> Result<RowId> {
        if let Some(max) = &self.max_key {
            if *max >= row.key {
                err_at!(InvalidInput, msg: "unordered flush key in {}", self.name)?;
            }
        }
        if row.cells.len() != self.schema.len() {
            err_at!(
                InvalidInput, msg: "row arity {}/{}", row.cells.len(), self.schema.len()
            )?;
        }

        let row_id = err_at!(FailConvert, RowId::try_from(self.n_rows))?;

        for ((_, writer), cell) in self.col_writers.iter_mut().zip(row.cells.iter()) {
            writer.append(&[cell.clone()])?;
        }
        self.pk_writer.append(&[Value::Binary(row.key.clone())])?;

        if !row.undos.is_empty() {
            if self.undo_writer.is_none() {
                let bw = self.txn.create()?;
                let name = format!("{}/undo", self.name);
                self.undo_writer = Some(DeltaFileWriter::new(bw, &name)?);
            }
            let writer = self.undo_writer.as_mut().unwrap();
            for (ts, change) in row.undos.iter() {
                writer.append(&self.schema, DeltaKey::new(row_id, *ts), change)?;
            }
        }
        if !row.redos.is_empty() {
            if self.redo_writer.is_none() {
                let bw = self.txn.create()?;
                let name = format!("{}/redo", self.name);
                self.redo_writer = Some(DeltaFileWriter::new(bw, &name)?);
            }
            let writer = self.redo_writer.as_mut().unwrap();
            for (ts, change) in row.redos.iter() {
                writer.append(&self.schema, DeltaKey::new(row_id, *ts), change)?;
            }
        }

        self.bloom_keys.push(row.key.clone());
        self.min_key.get_or_insert_with(|| row.key.clone());
        self.max_key = Some(row.key);
        self.n_rows += 1;
        Ok(row_id)
    }

    /// Seal every file and commit the block-creation transaction.
    pub fn finish(mut self) -> Result<DrsArtifacts> {
        if self.n_rows == 0 {
            err_at!(InvalidInput, msg: "empty diskrowset {}", self.name)?;
        }
        let (min_key, max_key) = (self.min_key.unwrap(), self.max_key.unwrap());

        let mut column_blocks = vec![];
        for (col_id, mut writer) in self.col_writers.into_iter() {
            writer.add_metadata(cfile::META_MIN_KEY, &min_key);
            writer.add_metadata(cfile::META_MAX_KEY, &max_key);
            let (id, _footer) = writer.finish()?;
            column_blocks.push((col_id, id));
        }

        self.pk_writer.add_metadata(cfile::META_MIN_KEY, &min_key);
        self.pk_writer.add_metadata(cfile::META_MAX_KEY, &max_key);
        let (pkidx_block, _) = self.pk_writer.finish()?;

        let bloom_block = {
            let mut bloom = Xor8::<BuildHasherDefault>::new();
            for key in self.bloom_keys.iter() {
                bloom.insert(key);
            }
            err_at!(Fatal, bloom.build(), "building bloom for {}", self.name)?;

            let payload = util::into_cbor_bytes(bloom)?;
            let framed = block::frame(&payload, Compression::None)?;
            let mut bw = self.txn.create()?;
            bw.append(&framed)?;
            bw.finish()?
        };

        let undo_blocks = match self.undo_writer {
            Some(writer) => vec![writer.finish()?.0],
            None => vec![],
        };
        let redo_blocks = match self.redo_writer {
            Some(writer) => vec![writer.finish()?.0],
            None => vec![],
        };

        self.txn.commit()?;

        Ok(DrsArtifacts {
            column_blocks,
            pkidx_block,
            bloom_block,
            undo_blocks,
            redo_blocks,
            n_rows: self.n_rows,
            min_key,
            max_key,
        })
    }
}
