//! Module `file` implement the on-disk, immutable projection of a
//! DeltaMemStore: a CFile of `(delta_key, change_list)` records with a
//! value index on the delta key, plus store-level stats in the footer
//! for the maintenance scheduler.

use std::sync::{Arc, Mutex};

use crate::{
    bstore::{BlockId, BlockStore, BlockWriter},
    cache::BlockCache,
    cfile::{self, Reader, Writer, WriterOpts},
    delta::{DeltaKey, DeltaStats, RowChange, DELTA_KEY_LEN},
    mvcc::Timestamp,
    row::Value,
    schema::{ColumnType, Compression, Encoding, Schema},
    util, Error, Result, RowId,
};

/// Streams key-ascending delta records into a fresh block.
pub struct DeltaFileWriter {
    writer: Writer,
    stats: DeltaStats,
    last_key: Option<Vec<u8>>,
    n_records: u64,
}

impl DeltaFileWriter {
    pub fn new(bw: BlockWriter, name: &str) -> Result<DeltaFileWriter> {
        let opts = WriterOpts {
            name: name.to_string(),
            ctype: ColumnType::Binary,
            encoding: Encoding::Plain,
            compression: Compression::Zstd,
            nullable: false,
            array: false,
            value_index: true,
            block_size: cfile::BLOCK_SIZE,
            dict_budget: cfile::DICT_BLOCK_BUDGET,
        };
        Ok(DeltaFileWriter {
            writer: Writer::new(bw, opts)?,
            stats: DeltaStats::default(),
            last_key: None,
            n_records: 0,
        })
    }

    /// Append one delta record; keys must arrive ascending.
    pub fn append(
        &mut self,
        schema: &Schema,
        key: DeltaKey,
        change: &RowChange,
    ) -> Result<()> {
        let key_bytes = key.encode();
        if let Some(last) = &self.last_key {
            if *last >= key_bytes {
                err_at!(InvalidInput, msg: "unordered delta key {:?}", key)?;
            }
        }

        let mut record = key_bytes.clone();
        record.extend_from_slice(&change.encode(schema)?);
        self.writer.append(&[Value::Binary(record)])?;

        self.stats.note(key.ts, change);
        self.last_key = Some(key_bytes);
        self.n_records += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.n_records == 0
    }

    /// Seal the file; the block becomes live when the owning
    /// transaction commits.
    pub fn finish(mut self) -> Result<(BlockId, DeltaStats)> {
        let stats_bytes = util::into_cbor_bytes(self.stats.clone())?;
        self.writer.add_metadata(cfile::META_DELTA_STATS, &stats_bytes);
        let (id, _footer) = self.writer.finish()?;
        Ok((id, self.stats))
    }
}

/// Immutable delta file attached to a DiskRowSet.
pub struct DeltaFile {
    id: BlockId,
    stats: DeltaStats,
    n_records: u64,
    on_disk_size: u64,
    reader: Mutex<Reader>,
}

impl DeltaFile {
    pub fn open(
        store: &Arc<BlockStore>,
        cache: Option<Arc<BlockCache>>,
        id: BlockId,
    ) -> Result<DeltaFile> {
        let reader = Reader::open(store.read(id)?, cache)?;
        let stats: DeltaStats = match reader.find_metadata(cfile::META_DELTA_STATS) {
            Some(bytes) => util::from_cbor_bytes(bytes)?.0,
            None => err_at!(Corruption, msg: "delta file {} missing stats", id)?,
        };
        let n_records = reader.to_value_count();
        let on_disk_size = store.on_disk_size(id)?;

        Ok(DeltaFile {
            id,
            stats,
            n_records,
            on_disk_size,
            reader: Mutex::new(reader),
        })
    }

    pub fn to_id(&self) -> BlockId {
        self.id
    }

    pub fn to_stats(&self) -> DeltaStats {
        self.stats.clone()
    }

    pub fn len(&self) -> u64 {
        self.n_records
    }

    pub fn is_empty(&self) -> bool {
        self.n_records == 0
    }

    pub fn on_disk_size(&self) -> u64 {
        self.on_disk_size
    }

    /// Deltas of `row_id`, timestamp ascending.
    pub fn deltas_for_row(
        &self,
        schema: &Schema,
        row_id: RowId,
    ) -> Result<Vec<(Timestamp, RowChange)>> {
        let probe = Value::Binary(DeltaKey::new(row_id, Timestamp::MIN).encode());

        let mut reader = self.reader.lock().unwrap();
        let (mut scan, _exact) = reader.seek_at_or_after(&probe)?;

        let mut deltas = vec![];
        loop {
            let mut values = vec![];
            if scan.next_values(&mut reader, 1, &mut values)? == 0 {
                break;
            }
            let (key, change) = decode_record(schema, &values[0])?;
            if key.row_id != row_id {
                break;
            }
            deltas.push((key.ts, change));
        }
        Ok(deltas)
    }

    /// Deltas of every row in `[start_row, end_row)`, key ascending.
    pub fn deltas_in_range(
        &self,
        schema: &Schema,
        start_row: RowId,
        end_row: RowId,
    ) -> Result<Vec<(DeltaKey, RowChange)>> {
        let probe = Value::Binary(DeltaKey::new(start_row, Timestamp::MIN).encode());

        let mut reader = self.reader.lock().unwrap();
        let (mut scan, _exact) = reader.seek_at_or_after(&probe)?;

        let mut deltas = vec![];
        loop {
            let mut values = vec![];
            if scan.next_values(&mut reader, 1, &mut values)? == 0 {
                break;
            }
            let (key, change) = decode_record(schema, &values[0])?;
            if key.row_id >= end_row {
                break;
            }
            deltas.push((key, change));
        }
        Ok(deltas)
    }

    /// Every record in the file, key ascending.
    pub fn iter_all(&self, schema: &Schema) -> Result<Vec<(DeltaKey, RowChange)>> {
        self.deltas_in_range(schema, 0, RowId::MAX)
    }
}

fn decode_record(schema: &Schema, value: &Value) -> Result<(DeltaKey, RowChange)> {
    let record = match value {
        Value::Binary(record) => record,
        value => err_at!(Corruption, msg: "delta record {}", value)?,
    };
    let key = DeltaKey::decode(record)?;
    let change = RowChange::decode(schema, &record[DELTA_KEY_LEN..])?;
    Ok((key, change))
}

#[cfg(test)]
#[path = "file_test.rs"]
mod file_test;
