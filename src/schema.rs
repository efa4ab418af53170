//! Module `schema` implement the table schema: an ordered sequence of
//! typed columns, a prefix of which forms the primary key.
//!
//! Columns carry a stable numeric id assigned at creation; schema
//! alterations never reuse ids. Besides the cell codec in
//! [crate::row], key columns have a second, memcmp-ordered encoding
//! composed by [Schema::encode_pk]: integers are stored big-endian
//! with the sign bit flipped, byte-strings escape embedded zeros and
//! terminate with `0x00 0x01` for every component except the last.

use cbordata::Cborize;

use std::{collections::HashSet, convert::TryFrom};

use crate::{
    row::{Row, Value},
    Error, Result,
};

/// Name of the virtual column exposing per-row delete status.
pub const IS_DELETED_COL: &str = "is_deleted";
/// Name of the auto-increment column, when present the last PK slot.
pub const AUTO_INCREMENT_COL: &str = "auto_incrementing_id";

const SCHEMA_VER: u32 = 0x00210001;

/// Stable numeric identity of a column, assigned at creation.
pub type ColumnId = u32;

/// Scalar type of a column.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    UInt128,
    Float32,
    Float64,
    String,
    Binary,
    Varchar { max_len: u32 },
    Date,
    TimestampMicros,
    Decimal32 { precision: u8, scale: u8 },
    Decimal64 { precision: u8, scale: u8 },
    Decimal128 { precision: u8, scale: u8 },
}

impl ColumnType {
    const ID: u32 = SCHEMA_VER;

    /// Byte width for fixed-width types, None for string/binary.
    pub fn fixed_width(&self) -> Option<usize> {
        use ColumnType::*;

        match self {
            Bool | Int8 | UInt8 => Some(1),
            Int16 | UInt16 => Some(2),
            Int32 | UInt32 | Float32 | Date | Decimal32 { .. } => Some(4),
            Int64 | UInt64 | Float64 | TimestampMicros | Decimal64 { .. } => Some(8),
            Int128 | UInt128 | Decimal128 { .. } => Some(16),
            String | Binary | Varchar { .. } => None,
        }
    }

    pub fn is_integral(&self) -> bool {
        use ColumnType::*;

        matches!(
            self,
            Bool | Int8
                | Int16
                | Int32
                | Int64
                | Int128
                | UInt8
                | UInt16
                | UInt32
                | UInt64
                | UInt128
                | Date
                | TimestampMicros
                | Decimal32 { .. }
                | Decimal64 { .. }
                | Decimal128 { .. }
        )
    }

    /// Types allowed as primary-key components.
    pub fn is_keyable(&self) -> bool {
        use ColumnType::*;

        !matches!(self, Float32 | Float64)
    }
}

/// Per-column encoding for CFile data blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Cborize)]
pub enum Encoding {
    Plain,
    Bitshuffle,
    Rle,
    Prefix,
    Dictionary,
}

impl Encoding {
    const ID: u32 = SCHEMA_VER;

    /// Default encoding for a column type.
    pub fn default_for(ctype: &ColumnType) -> Encoding {
        use ColumnType::*;

        match ctype {
            String | Binary | Varchar { .. } => Encoding::Dictionary,
            Bool => Encoding::Rle,
            Float32 | Float64 => Encoding::Bitshuffle,
            _ => Encoding::Bitshuffle,
        }
    }

    pub fn applies_to(&self, ctype: &ColumnType) -> bool {
        use ColumnType::*;

        match self {
            Encoding::Plain => true,
            Encoding::Bitshuffle => ctype.fixed_width().is_some() && *ctype != Bool,
            // run-length lanes are 64-bit wide
            Encoding::Rle => ctype.is_integral() && ctype.fixed_width() <= Some(8),
            Encoding::Prefix | Encoding::Dictionary => {
                matches!(ctype, String | Binary | Varchar { .. })
            }
        }
    }
}

/// Per-column block compression.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Cborize)]
pub enum Compression {
    None,
    Zstd,
    Lzma,
}

impl Compression {
    const ID: u32 = SCHEMA_VER;
}

/// A single column of the table schema.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct ColumnSchema {
    pub id: ColumnId,
    pub name: String,
    pub ctype: ColumnType,
    pub nullable: bool,
    pub immutable: bool,
    /// 1-D array of `ctype` elements. Arrays deeper than one dimension
    /// are not expressible.
    pub array: bool,
    /// Write default / fill value for rows that predate the column,
    /// cell-codec encoded.
    pub default: Option<Vec<u8>>,
    pub encoding: Encoding,
    pub compression: Compression,
    /// Tombstoned by a drop-column alteration; the position survives
    /// until the data is rewritten, the name and id are retired.
    pub dropped: bool,
}

impl ColumnSchema {
    const ID: u32 = SCHEMA_VER;

    /// Create a column with type-appropriate encoding, no compression.
    pub fn new(name: &str, ctype: ColumnType) -> ColumnSchema {
        let encoding = Encoding::default_for(&ctype);
        ColumnSchema {
            id: ColumnId::MAX, // assigned when the schema is composed
            name: name.to_string(),
            ctype,
            nullable: false,
            immutable: false,
            array: false,
            default: None,
            encoding,
            compression: Compression::None,
            dropped: false,
        }
    }

    pub fn set_nullable(mut self, nullable: bool) -> ColumnSchema {
        self.nullable = nullable;
        self
    }

    pub fn set_immutable(mut self, immutable: bool) -> ColumnSchema {
        self.immutable = immutable;
        self
    }

    pub fn set_array(mut self, array: bool) -> ColumnSchema {
        self.array = array;
        self
    }

    pub fn set_encoding(mut self, encoding: Encoding) -> ColumnSchema {
        self.encoding = encoding;
        self
    }

    pub fn set_compression(mut self, compression: Compression) -> ColumnSchema {
        self.compression = compression;
        self
    }

    pub fn set_default(mut self, default: Vec<u8>) -> ColumnSchema {
        self.default = Some(default);
        self
    }
}

/// Table schema: ordered columns, the first `num_key_cols` of which
/// form the primary key.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct Schema {
    pub cols: Vec<ColumnSchema>,
    pub num_key_cols: usize,
    /// Next column id to assign; ids of dropped columns are never
    /// reused.
    pub next_col_id: ColumnId,
}

impl Schema {
    const ID: u32 = SCHEMA_VER;

    /// Compose a schema from columns, assigning stable column ids in
    /// declaration order.
    pub fn new(mut cols: Vec<ColumnSchema>, num_key_cols: usize) -> Result<Schema> {
        if num_key_cols == 0 || num_key_cols > cols.len() {
            err_at!(InvalidInput, msg: "bad key prefix {}/{}", num_key_cols, cols.len())?;
        }

        let mut names: HashSet<String> = HashSet::new();
        for (i, col) in cols.iter_mut().enumerate() {
            if !names.insert(col.name.clone()) {
                err_at!(InvalidInput, msg: "duplicate column {}", col.name)?;
            }
            if col.name == IS_DELETED_COL {
                err_at!(InvalidInput, msg: "{} is reserved", IS_DELETED_COL)?;
            }
            if !col.encoding.applies_to(&col.ctype) {
                err_at!(
                    InvalidInput, msg: "{:?} not applicable to {:?}", col.encoding, col.ctype
                )?;
            }
            if i < num_key_cols {
                if col.nullable || col.array || !col.ctype.is_keyable() {
                    err_at!(InvalidInput, msg: "column {} cannot be a key", col.name)?;
                }
            }
            if col.array && col.encoding != Encoding::Plain {
                err_at!(InvalidInput, msg: "array column {} must be plain", col.name)?;
            }
            col.id = u32::try_from(i).unwrap();
        }

        let next_col_id = u32::try_from(cols.len()).unwrap();

        Ok(Schema {
            cols,
            num_key_cols,
            next_col_id,
        })
    }

    /// Append an auto-increment column as the last key slot: Int64,
    /// not null, not immutable, assigned by the tablet.
    pub fn with_auto_increment(mut self) -> Result<Schema> {
        if self.has_auto_increment() {
            err_at!(InvalidInput, msg: "auto-increment column exists")?;
        }
        let mut col = ColumnSchema::new(AUTO_INCREMENT_COL, ColumnType::Int64);
        col.encoding = Encoding::Bitshuffle;
        col.id = self.next_col_id;
        self.next_col_id += 1;
        self.cols.insert(self.num_key_cols, col);
        self.num_key_cols += 1;
        Ok(self)
    }

    pub fn has_auto_increment(&self) -> bool {
        self.cols.iter().any(|c| c.name == AUTO_INCREMENT_COL)
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    pub fn as_col(&self, pos: usize) -> &ColumnSchema {
        &self.cols[pos]
    }

    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.cols.iter().position(|c| c.name == name && !c.dropped)
    }

    /// Positions of columns that are not tombstoned, in order.
    pub fn live_positions(&self) -> Vec<usize> {
        (0..self.cols.len()).filter(|i| !self.cols[*i].dropped).collect()
    }

    /// Expand a row given in live-column order into the full
    /// positional layout, tombstoned slots filled with Null.
    pub fn expand_row(&self, cells: Vec<Value>) -> Result<Vec<Value>> {
        let live = self.live_positions();
        if cells.len() != live.len() {
            err_at!(InvalidInput, msg: "row arity {}/{}", cells.len(), live.len())?;
        }
        let mut full = vec![Value::Null; self.cols.len()];
        for (cell, pos) in cells.into_iter().zip(live.into_iter()) {
            full[pos] = cell;
        }
        Ok(full)
    }

    pub fn col_by_id(&self, id: ColumnId) -> Option<&ColumnSchema> {
        self.cols.iter().find(|c| c.id == id)
    }

    pub fn position_of_id(&self, id: ColumnId) -> Option<usize> {
        self.cols.iter().position(|c| c.id == id)
    }

    /// Check `row` against this schema: arity, types, nullability.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.cells.len() != self.cols.len() {
            err_at!(
                InvalidInput, msg: "row arity {}/{}", row.cells.len(), self.cols.len()
            )?;
        }
        for (cell, col) in row.cells.iter().zip(self.cols.iter()) {
            match cell {
                _ if col.dropped => (),
                Value::Null if col.nullable => (),
                Value::Null if col.name == AUTO_INCREMENT_COL => (), // tablet assigns
                Value::Null => {
                    err_at!(InvalidInput, msg: "null in non-nullable {}", col.name)?
                }
                Value::Array(vals) if col.array => {
                    for val in vals.iter() {
                        if val.is_null() || matches!(val, Value::Array(_)) {
                            err_at!(
                                InvalidInput, msg: "bad array element in {}", col.name
                            )?;
                        }
                        if !val.is_type(&col.ctype) {
                            err_at!(InvalidInput, msg: "type mismatch in {}", col.name)?;
                        }
                    }
                }
                Value::Array(_) => {
                    err_at!(InvalidInput, msg: "array in scalar column {}", col.name)?
                }
                val if col.array => {
                    err_at!(InvalidInput, msg: "scalar {} in array column {}", val, col.name)?
                }
                val => {
                    if !val.is_type(&col.ctype) {
                        err_at!(
                            InvalidInput, msg: "type mismatch {} in {}", val, col.name
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Compose the memcmp-ordered encoded primary key for `row`, given
    /// in schema column order.
    pub fn encode_pk(&self, row: &Row) -> Result<Vec<u8>> {
        self.encode_pk_cells(&row.cells[..self.num_key_cols])
    }

    /// Compose the encoded primary key from the key cells alone.
    pub fn encode_pk_cells(&self, cells: &[Value]) -> Result<Vec<u8>> {
        if cells.len() != self.num_key_cols {
            err_at!(
                InvalidInput, msg: "key arity {}/{}", cells.len(), self.num_key_cols
            )?;
        }
        let mut key = vec![];
        for (i, cell) in cells.iter().enumerate() {
            let last = i == self.num_key_cols - 1;
            encode_key_component(cell, last, &mut key)?;
        }
        Ok(key)
    }
}

/// Append the memcmp-ordered form of a key cell to `buf`.
///
/// Byte-string components other than the last escape `0x00` as
/// `0x00 0x01` and terminate with `0x00 0x00`, preserving prefix
/// ordering across component boundaries.
pub fn encode_key_component(value: &Value, last: bool, buf: &mut Vec<u8>) -> Result<()> {
    use Value::*;

    match value {
        Bool(val) => buf.push(u8::from(*val)),
        Int8(val) => buf.push((*val as u8) ^ 0x80),
        Int16(val) => push_flipped(&val.to_be_bytes(), buf),
        Int32(val) | Date(val) | Decimal32(val) => push_flipped(&val.to_be_bytes(), buf),
        Int64(val) | Timestamp(val) | Decimal64(val) => {
            push_flipped(&val.to_be_bytes(), buf)
        }
        Int128(val) | Decimal128(val) => push_flipped(&val.to_be_bytes(), buf),
        UInt8(val) => buf.push(*val),
        UInt16(val) => buf.extend_from_slice(&val.to_be_bytes()),
        UInt32(val) => buf.extend_from_slice(&val.to_be_bytes()),
        UInt64(val) => buf.extend_from_slice(&val.to_be_bytes()),
        UInt128(val) => buf.extend_from_slice(&val.to_be_bytes()),
        String(val) => encode_key_bytes(val.as_bytes(), last, buf),
        Binary(val) => encode_key_bytes(val, last, buf),
        value => err_at!(InvalidInput, msg: "{} cannot be a key component", value)?,
    }
    Ok(())
}

fn push_flipped(be_bytes: &[u8], buf: &mut Vec<u8>) {
    let mut bytes = be_bytes.to_vec();
    bytes[0] ^= 0x80; // flip sign bit, negatives order below positives
    buf.extend_from_slice(&bytes);
}

fn encode_key_bytes(data: &[u8], last: bool, buf: &mut Vec<u8>) {
    if last {
        buf.extend_from_slice(data);
        return;
    }
    for byte in data.iter() {
        match byte {
            0x00 => buf.extend_from_slice(&[0x00, 0x01]),
            byte => buf.push(*byte),
        }
    }
    buf.extend_from_slice(&[0x00, 0x00]);
}

/// A set of output columns for a scan, resolved against a schema.
///
/// Besides stored columns a projection may name the virtual
/// [IS_DELETED_COL] column, which materializes from delta state rather
/// than disk.
#[derive(Clone, Debug)]
pub struct Projection {
    pub cols: Vec<ProjectedColumn>,
}

#[derive(Clone, Debug)]
pub enum ProjectedColumn {
    /// Position of the column within the tablet schema.
    Base(usize),
    /// Virtual is-deleted column; materialized with a read default of
    /// `false`.
    IsDeleted,
}

impl Projection {
    /// Project all live stored columns, in schema order.
    pub fn full(schema: &Schema) -> Projection {
        let cols = schema
            .live_positions()
            .into_iter()
            .map(ProjectedColumn::Base)
            .collect();
        Projection { cols }
    }

    /// Resolve `names` against `schema`.
    pub fn new(schema: &Schema, names: &[&str]) -> Result<Projection> {
        let mut cols = vec![];
        for name in names.iter() {
            match schema.position_of(name) {
                Some(pos) => cols.push(ProjectedColumn::Base(pos)),
                None if *name == IS_DELETED_COL => cols.push(ProjectedColumn::IsDeleted),
                None => err_at!(InvalidInput, msg: "no such column {}", name)?,
            }
        }
        Ok(Projection { cols })
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// Positions of the stored columns this projection touches.
    pub fn base_positions(&self) -> Vec<usize> {
        self.cols
            .iter()
            .filter_map(|c| match c {
                ProjectedColumn::Base(pos) => Some(*pos),
                ProjectedColumn::IsDeleted => None,
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "schema_test.rs"]
mod schema_test;
