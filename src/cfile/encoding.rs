//! Module `encoding` implement the dispatch layer over block
//! encoders/decoders, plus the lane conversions shared between them.
//!
//! A block holds a run of non-null values for one column. Builders
//! accept values until their target payload size is crossed; the
//! writer then frames and flushes the block. Dispatch is per block,
//! through tagged variants, so no virtual call happens per row.

use std::{cmp, sync::Arc};

use crate::{
    cfile::{bshuf, dict, plain, prefix, rle},
    row::Value,
    scan::Predicate,
    schema::{ColumnType, Encoding},
    Error, Result,
};

/// Convert an integral cell to its unsigned 64-bit lane: zig-zag for
/// signed types, identity for unsigned, 0/1 for bool.
pub fn value_to_lane(value: &Value) -> Result<u64> {
    use Value::*;

    let lane = match value {
        Bool(val) => u64::from(*val),
        Int8(val) => zigzag(*val as i64),
        Int16(val) => zigzag(*val as i64),
        Int32(val) | Date(val) | Decimal32(val) => zigzag(*val as i64),
        Int64(val) | Timestamp(val) | Decimal64(val) => zigzag(*val),
        UInt8(val) => *val as u64,
        UInt16(val) => *val as u64,
        UInt32(val) => *val as u64,
        UInt64(val) => *val,
        value => err_at!(InvalidInput, msg: "no 64-bit lane for {}", value)?,
    };
    Ok(lane)
}

/// Inverse of [value_to_lane].
pub fn lane_to_value(ctype: &ColumnType, lane: u64) -> Result<Value> {
    use ColumnType as T;

    let value = match ctype {
        T::Bool => Value::Bool(lane != 0),
        T::Int8 => Value::Int8(unzigzag(lane) as i8),
        T::Int16 => Value::Int16(unzigzag(lane) as i16),
        T::Int32 => Value::Int32(unzigzag(lane) as i32),
        T::Int64 => Value::Int64(unzigzag(lane)),
        T::UInt8 => Value::UInt8(lane as u8),
        T::UInt16 => Value::UInt16(lane as u16),
        T::UInt32 => Value::UInt32(lane as u32),
        T::UInt64 => Value::UInt64(lane),
        T::Date => Value::Date(unzigzag(lane) as i32),
        T::TimestampMicros => Value::Timestamp(unzigzag(lane)),
        T::Decimal32 { .. } => Value::Decimal32(unzigzag(lane) as i32),
        T::Decimal64 { .. } => Value::Decimal64(unzigzag(lane)),
        ctype => err_at!(Corruption, msg: "no 64-bit lane for {:?}", ctype)?,
    };
    Ok(value)
}

#[inline]
fn zigzag(val: i64) -> u64 {
    ((val << 1) ^ (val >> 63)) as u64
}

#[inline]
fn unzigzag(lane: u64) -> i64 {
    ((lane >> 1) as i64) ^ -((lane & 1) as i64)
}

/// Raw byte form of a varlen cell (string/binary).
pub fn value_to_bytes(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::String(val) => Ok(val.as_bytes().to_vec()),
        Value::Binary(val) => Ok(val.clone()),
        value => err_at!(InvalidInput, msg: "not a varlen cell {}", value),
    }
}

/// Type-parametric block builder, dispatched per block.
pub enum BlockBuilder {
    Plain(plain::PlainBuilder),
    Rle(rle::RleBuilder),
    Prefix(prefix::PrefixBuilder),
    Bshuf(bshuf::BshufBuilder),
    Dict(dict::DictBuilder),
}

impl BlockBuilder {
    /// Compose a builder for `(ctype, encoding)` with a target payload
    /// of `block_size` bytes. Dictionary builders share the per-file
    /// dictionary handle.
    pub fn new(
        ctype: &ColumnType,
        encoding: Encoding,
        block_size: usize,
        dict: Option<dict::DictHandle>,
    ) -> Result<BlockBuilder> {
        let builder = match encoding {
            Encoding::Plain => BlockBuilder::Plain(plain::PlainBuilder::new(ctype, block_size)),
            Encoding::Rle => BlockBuilder::Rle(rle::RleBuilder::new(block_size)),
            Encoding::Prefix => BlockBuilder::Prefix(prefix::PrefixBuilder::new(block_size)),
            Encoding::Bitshuffle => {
                let width = match ctype.fixed_width() {
                    Some(width) => width,
                    None => err_at!(InvalidInput, msg: "bitshuffle on varlen column")?,
                };
                BlockBuilder::Bshuf(bshuf::BshufBuilder::new(width, block_size))
            }
            Encoding::Dictionary => {
                let dict = match dict {
                    Some(dict) => dict,
                    None => err_at!(Fatal, msg: "dictionary builder without dictionary")?,
                };
                BlockBuilder::Dict(dict::DictBuilder::new(dict, block_size))
            }
        };
        Ok(builder)
    }

    /// Add values, return how many were accepted. Acceptance stops
    /// when the block is full.
    pub fn add(&mut self, values: &[Value]) -> Result<usize> {
        match self {
            BlockBuilder::Plain(b) => b.add(values),
            BlockBuilder::Rle(b) => b.add(values),
            BlockBuilder::Prefix(b) => b.add(values),
            BlockBuilder::Bshuf(b) => b.add(values),
            BlockBuilder::Dict(b) => b.add(values),
        }
    }

    /// Append one value unconditionally, past any fullness check; the
    /// writer uses this to keep multi-element rows within one block.
    pub fn push(&mut self, value: &Value) -> Result<()> {
        match self {
            BlockBuilder::Plain(b) => b.push(value),
            BlockBuilder::Rle(b) => b.push(value),
            BlockBuilder::Prefix(b) => b.push(value),
            BlockBuilder::Bshuf(b) => b.push(value),
            BlockBuilder::Dict(b) => b.push(value),
        }
    }

    pub fn is_full(&self) -> bool {
        match self {
            BlockBuilder::Plain(b) => b.is_full(),
            BlockBuilder::Rle(b) => b.is_full(),
            BlockBuilder::Prefix(b) => b.is_full(),
            BlockBuilder::Bshuf(b) => b.is_full(),
            BlockBuilder::Dict(b) => b.is_full(),
        }
    }

    /// Number of values accepted so far.
    pub fn count(&self) -> usize {
        match self {
            BlockBuilder::Plain(b) => b.count(),
            BlockBuilder::Rle(b) => b.count(),
            BlockBuilder::Prefix(b) => b.count(),
            BlockBuilder::Bshuf(b) => b.count(),
            BlockBuilder::Dict(b) => b.count(),
        }
    }

    /// Serialize the accumulated values into the block payload and
    /// reset the builder.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        match self {
            BlockBuilder::Plain(b) => b.finish(),
            BlockBuilder::Rle(b) => b.finish(),
            BlockBuilder::Prefix(b) => b.finish(),
            BlockBuilder::Bshuf(b) => b.finish(),
            BlockBuilder::Dict(b) => b.finish(),
        }
    }

    /// First value accepted into the open block.
    pub fn to_first_value(&self) -> Option<Value> {
        match self {
            BlockBuilder::Plain(b) => b.to_first_value(),
            BlockBuilder::Rle(b) => b.to_first_value(),
            BlockBuilder::Prefix(b) => b.to_first_value(),
            BlockBuilder::Bshuf(b) => b.to_first_value(),
            BlockBuilder::Dict(b) => b.to_first_value(),
        }
    }

    /// Last value accepted into the open block.
    pub fn to_last_value(&self) -> Option<Value> {
        match self {
            BlockBuilder::Plain(b) => b.to_last_value(),
            BlockBuilder::Rle(b) => b.to_last_value(),
            BlockBuilder::Prefix(b) => b.to_last_value(),
            BlockBuilder::Bshuf(b) => b.to_last_value(),
            BlockBuilder::Dict(b) => b.to_last_value(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            BlockBuilder::Plain(b) => b.reset(),
            BlockBuilder::Rle(b) => b.reset(),
            BlockBuilder::Prefix(b) => b.reset(),
            BlockBuilder::Bshuf(b) => b.reset(),
            BlockBuilder::Dict(b) => b.reset(),
        }
    }
}

/// Type-parametric block decoder over one block payload.
pub enum BlockDecoder {
    Plain(plain::PlainDecoder),
    Rle(rle::RleDecoder),
    Prefix(prefix::PrefixDecoder),
    Bshuf(bshuf::BshufDecoder),
    Dict(dict::DictDecoder),
}

impl BlockDecoder {
    /// Parse a block payload produced by the matching builder.
    pub fn open(
        ctype: &ColumnType,
        encoding: Encoding,
        payload: &[u8],
        dict: Option<Arc<dict::Dictionary>>,
    ) -> Result<BlockDecoder> {
        let decoder = match encoding {
            Encoding::Plain => {
                BlockDecoder::Plain(plain::PlainDecoder::open(ctype, payload)?)
            }
            Encoding::Rle => BlockDecoder::Rle(rle::RleDecoder::open(ctype, payload)?),
            Encoding::Prefix => {
                BlockDecoder::Prefix(prefix::PrefixDecoder::open(ctype, payload)?)
            }
            Encoding::Bitshuffle => {
                BlockDecoder::Bshuf(bshuf::BshufDecoder::open(ctype, payload)?)
            }
            Encoding::Dictionary => {
                let dict = match dict {
                    Some(dict) => dict,
                    None => err_at!(Corruption, msg: "dict block without dictionary")?,
                };
                BlockDecoder::Dict(dict::DictDecoder::open(ctype, payload, dict)?)
            }
        };
        Ok(decoder)
    }

    pub fn count(&self) -> usize {
        match self {
            BlockDecoder::Plain(d) => d.count(),
            BlockDecoder::Rle(d) => d.count(),
            BlockDecoder::Prefix(d) => d.count(),
            BlockDecoder::Bshuf(d) => d.count(),
            BlockDecoder::Dict(d) => d.count(),
        }
    }

    /// Current cursor position, in non-null value ordinals.
    pub fn to_position(&self) -> usize {
        match self {
            BlockDecoder::Plain(d) => d.to_position(),
            BlockDecoder::Rle(d) => d.to_position(),
            BlockDecoder::Prefix(d) => d.to_position(),
            BlockDecoder::Bshuf(d) => d.to_position(),
            BlockDecoder::Dict(d) => d.to_position(),
        }
    }

    /// Position the cursor at `pos`, clamped to the value count.
    pub fn seek_to_position(&mut self, pos: usize) -> Result<()> {
        match self {
            BlockDecoder::Plain(d) => d.seek_to_position(pos),
            BlockDecoder::Rle(d) => d.seek_to_position(pos),
            BlockDecoder::Prefix(d) => d.seek_to_position(pos),
            BlockDecoder::Bshuf(d) => d.seek_to_position(pos),
            BlockDecoder::Dict(d) => d.seek_to_position(pos),
        }
    }

    /// Position the cursor at the first value `>= probe`, for sorted
    /// blocks. Return true on an exact match.
    pub fn seek_at_or_after_value(&mut self, probe: &Value) -> Result<bool> {
        match self {
            BlockDecoder::Plain(d) => d.seek_at_or_after_value(probe),
            BlockDecoder::Rle(d) => d.seek_at_or_after_value(probe),
            BlockDecoder::Prefix(d) => d.seek_at_or_after_value(probe),
            BlockDecoder::Bshuf(d) => d.seek_at_or_after_value(probe),
            BlockDecoder::Dict(d) => d.seek_at_or_after_value(probe),
        }
    }

    /// Decode up to `n` values from the cursor into `out`. Return the
    /// number decoded.
    pub fn copy_next_values(&mut self, n: usize, out: &mut Vec<Value>) -> Result<usize> {
        match self {
            BlockDecoder::Plain(d) => d.copy_next_values(n, out),
            BlockDecoder::Rle(d) => d.copy_next_values(n, out),
            BlockDecoder::Prefix(d) => d.copy_next_values(n, out),
            BlockDecoder::Bshuf(d) => d.copy_next_values(n, out),
            BlockDecoder::Dict(d) => d.copy_next_values(n, out),
        }
    }

    /// Decode up to `n` values while evaluating `pred`; values failing
    /// the predicate clear their bit in `sel` (indexed from `base`)
    /// and may skip materialization. Return the number consumed.
    pub fn copy_next_and_eval(
        &mut self,
        n: usize,
        pred: &Predicate,
        base: u32,
        sel: &mut croaring::Bitmap,
        out: &mut Vec<Value>,
    ) -> Result<usize> {
        match self {
            // dictionary codewords short-circuit the decode
            BlockDecoder::Dict(d) => d.copy_next_and_eval(n, pred, base, sel, out),
            decoder => {
                let start = out.len();
                let m = decoder.copy_next_values(n, out)?;
                for (i, value) in out[start..].iter().enumerate() {
                    if !pred.matches(value) {
                        sel.remove(base + i as u32);
                    }
                }
                Ok(m)
            }
        }
    }
}

/// Clamp `n` against the remaining values from `pos`.
pub(crate) fn remaining(pos: usize, count: usize, n: usize) -> usize {
    cmp::min(n, count.saturating_sub(pos))
}

#[cfg(test)]
#[path = "encoding_test.rs"]
mod encoding_test;
