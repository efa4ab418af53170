//! Module `row` implement cell values, their binary codec and the row
//! types exchanged with the tablet.
//!
//! Two byte-level representations exist for a cell:
//!
//! * The _cell codec_, little-endian fixed/variable width bytes, used
//!   inside data blocks, change lists and default values.
//! * The _key codec_, memcmp-ordered bytes, used for encoded primary
//!   keys; implemented in [crate::schema].

use std::{
    cmp,
    convert::{TryFrom, TryInto},
    fmt,
};

use crate::{schema::ColumnType, util, Error, Result};

/// A single cell value. Variants map one-to-one onto [ColumnType],
/// plus `Null` and 1-D `Array`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    UInt128(u128),
    Float32(f32),
    Float64(f64),
    String(String),
    Binary(Vec<u8>),
    Date(i32),
    Timestamp(i64),
    Decimal32(i32),
    Decimal64(i64),
    Decimal128(i128),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Total order across same-typed values. `Null` sorts before
    /// everything; floats use IEEE-754 total ordering.
    pub fn cmp(&self, other: &Value) -> cmp::Ordering {
        use cmp::Ordering::*;
        use Value::*;

        match (self, other) {
            (Null, Null) => Equal,
            (Null, _) => Less,
            (_, Null) => Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int8(a), Int8(b)) => a.cmp(b),
            (Int16(a), Int16(b)) => a.cmp(b),
            (Int32(a), Int32(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (Int128(a), Int128(b)) => a.cmp(b),
            (UInt8(a), UInt8(b)) => a.cmp(b),
            (UInt16(a), UInt16(b)) => a.cmp(b),
            (UInt32(a), UInt32(b)) => a.cmp(b),
            (UInt64(a), UInt64(b)) => a.cmp(b),
            (UInt128(a), UInt128(b)) => a.cmp(b),
            (Float32(a), Float32(b)) => a.total_cmp(b),
            (Float64(a), Float64(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Binary(a), Binary(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Decimal32(a), Decimal32(b)) => a.cmp(b),
            (Decimal64(a), Decimal64(b)) => a.cmp(b),
            (Decimal128(a), Decimal128(b)) => a.cmp(b),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp(y) {
                        Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => panic!("cross-type compare {:?} {:?}", a, b),
        }
    }

    /// Whether this value is an instance of `ctype`.
    pub fn is_type(&self, ctype: &ColumnType) -> bool {
        use ColumnType as T;

        matches!(
            (self, ctype),
            (Value::Bool(_), T::Bool)
                | (Value::Int8(_), T::Int8)
                | (Value::Int16(_), T::Int16)
                | (Value::Int32(_), T::Int32)
                | (Value::Int64(_), T::Int64)
                | (Value::Int128(_), T::Int128)
                | (Value::UInt8(_), T::UInt8)
                | (Value::UInt16(_), T::UInt16)
                | (Value::UInt32(_), T::UInt32)
                | (Value::UInt64(_), T::UInt64)
                | (Value::UInt128(_), T::UInt128)
                | (Value::Float32(_), T::Float32)
                | (Value::Float64(_), T::Float64)
                | (Value::String(_), T::String)
                | (Value::String(_), T::Varchar { .. })
                | (Value::Binary(_), T::Binary)
                | (Value::Date(_), T::Date)
                | (Value::Timestamp(_), T::TimestampMicros)
                | (Value::Decimal32(_), T::Decimal32 { .. })
                | (Value::Decimal64(_), T::Decimal64 { .. })
                | (Value::Decimal128(_), T::Decimal128 { .. })
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Serialize a non-null cell into its little-endian byte form and
/// append to `buf`. Return the number of bytes appended.
pub fn encode_cell(value: &Value, buf: &mut Vec<u8>) -> Result<usize> {
    use Value::*;

    let n = buf.len();
    match value {
        Null => err_at!(InvalidInput, msg: "cannot encode null cell")?,
        Bool(val) => buf.push(u8::from(*val)),
        Int8(val) => buf.extend_from_slice(&val.to_le_bytes()),
        Int16(val) => buf.extend_from_slice(&val.to_le_bytes()),
        Int32(val) | Date(val) | Decimal32(val) => {
            buf.extend_from_slice(&val.to_le_bytes())
        }
        Int64(val) | Timestamp(val) | Decimal64(val) => {
            buf.extend_from_slice(&val.to_le_bytes())
        }
        Int128(val) | Decimal128(val) => buf.extend_from_slice(&val.to_le_bytes()),
        UInt8(val) => buf.push(*val),
        UInt16(val) => buf.extend_from_slice(&val.to_le_bytes()),
        UInt32(val) => buf.extend_from_slice(&val.to_le_bytes()),
        UInt64(val) => buf.extend_from_slice(&val.to_le_bytes()),
        UInt128(val) => buf.extend_from_slice(&val.to_le_bytes()),
        Float32(val) => buf.extend_from_slice(&val.to_le_bytes()),
        Float64(val) => buf.extend_from_slice(&val.to_le_bytes()),
        String(val) => buf.extend_from_slice(val.as_bytes()),
        Binary(val) => buf.extend_from_slice(val),
        Array(vals) => {
            let mut scratch = vec![];
            util::encode_varint(vals.len() as u64, buf);
            for val in vals.iter() {
                scratch.clear();
                encode_cell(val, &mut scratch)?;
                util::encode_varint(scratch.len() as u64, buf);
                buf.extend_from_slice(&scratch);
            }
        }
    }
    Ok(buf.len() - n)
}

/// Deserialize a cell of `ctype` from `buf`, consuming all of it.
pub fn decode_cell(ctype: &ColumnType, buf: &[u8]) -> Result<Value> {
    use ColumnType as T;

    let fixed = |n: usize| -> Result<&[u8]> {
        check_remaining!(buf, n, "decode-cell")?;
        if buf.len() != n {
            err_at!(Corruption, msg: "cell width {} != {}", buf.len(), n)?;
        }
        Ok(&buf[..n])
    };

    let value = match ctype {
        T::Bool => Value::Bool(fixed(1)?[0] != 0),
        T::Int8 => Value::Int8(i8::from_le_bytes(fixed(1)?.try_into().unwrap())),
        T::Int16 => Value::Int16(i16::from_le_bytes(fixed(2)?.try_into().unwrap())),
        T::Int32 => Value::Int32(i32::from_le_bytes(fixed(4)?.try_into().unwrap())),
        T::Int64 => Value::Int64(i64::from_le_bytes(fixed(8)?.try_into().unwrap())),
        T::Int128 => Value::Int128(i128::from_le_bytes(fixed(16)?.try_into().unwrap())),
        T::UInt8 => Value::UInt8(fixed(1)?[0]),
        T::UInt16 => Value::UInt16(u16::from_le_bytes(fixed(2)?.try_into().unwrap())),
        T::UInt32 => Value::UInt32(u32::from_le_bytes(fixed(4)?.try_into().unwrap())),
        T::UInt64 => Value::UInt64(u64::from_le_bytes(fixed(8)?.try_into().unwrap())),
        T::UInt128 => {
            Value::UInt128(u128::from_le_bytes(fixed(16)?.try_into().unwrap()))
        }
        T::Float32 => Value::Float32(f32::from_le_bytes(fixed(4)?.try_into().unwrap())),
        T::Float64 => Value::Float64(f64::from_le_bytes(fixed(8)?.try_into().unwrap())),
        T::String | T::Varchar { .. } => match std::str::from_utf8(buf) {
            Ok(s) => Value::String(s.to_string()),
            Err(err) => err_at!(Corruption, Err(err), "utf8 in string cell")?,
        },
        T::Binary => Value::Binary(buf.to_vec()),
        T::Date => Value::Date(i32::from_le_bytes(fixed(4)?.try_into().unwrap())),
        T::TimestampMicros => {
            Value::Timestamp(i64::from_le_bytes(fixed(8)?.try_into().unwrap()))
        }
        T::Decimal32 { .. } => {
            Value::Decimal32(i32::from_le_bytes(fixed(4)?.try_into().unwrap()))
        }
        T::Decimal64 { .. } => {
            Value::Decimal64(i64::from_le_bytes(fixed(8)?.try_into().unwrap()))
        }
        T::Decimal128 { .. } => {
            Value::Decimal128(i128::from_le_bytes(fixed(16)?.try_into().unwrap()))
        }
    };

    Ok(value)
}

/// Deserialize a 1-D array cell of element type `ctype` from `buf`.
pub fn decode_array_cell(ctype: &ColumnType, buf: &[u8]) -> Result<Value> {
    let (count, mut off) = util::decode_varint(buf)?;
    let mut vals = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
    for _ in 0..count {
        let (len, n) = util::decode_varint(&buf[off..])?;
        off += n;
        let len = err_at!(FailConvert, usize::try_from(len))?;
        check_remaining!(&buf[off..], len, "decode-array-cell")?;
        vals.push(decode_cell(ctype, &buf[off..off + len])?);
        off += len;
    }
    Ok(Value::Array(vals))
}

/// A row in schema column order. Cells for a partial row (projection,
/// update probe) follow the projection's order instead.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub cells: Vec<Value>,
}

impl Row {
    pub fn new(cells: Vec<Value>) -> Row {
        Row { cells }
    }

    pub fn cell(&self, col: usize) -> &Value {
        &self.cells[col]
    }
}

/// Scan output unit: up to `capacity` rows materialized in the
/// projection's column order, with per-row selection flags.
pub struct RowBlock {
    pub rows: Vec<Row>,
}

impl RowBlock {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
#[path = "row_test.rs"]
mod row_test;
