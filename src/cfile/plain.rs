//! Module `plain` implement plain encoding. Fixed-width types are
//! stored as a contiguous little-endian array; variable-width types as
//! a 32-bit offset array followed by the concatenated blob.
//!
//! Payload layout:
//!
//! ```text
//! fixed  : u32 count | cell bytes * count
//! varlen : u32 count | u32 offsets[count] | blob
//! ```

use std::convert::{TryFrom, TryInto};

use crate::{
    cfile::encoding::remaining,
    row::{decode_cell, encode_cell, Value},
    schema::ColumnType,
    Error, Result,
};

pub struct PlainBuilder {
    width: Option<usize>,
    target: usize,

    count: usize,
    data: Vec<u8>,
    offsets: Vec<u32>,
    first: Option<Value>,
    last: Option<Value>,
}

impl PlainBuilder {
    pub fn new(ctype: &ColumnType, target: usize) -> PlainBuilder {
        PlainBuilder {
            width: ctype.fixed_width(),
            target,

            count: 0,
            data: vec![],
            offsets: vec![],
            first: None,
            last: None,
        }
    }

    pub fn add(&mut self, values: &[Value]) -> Result<usize> {
        let mut accepted = 0;
        for value in values.iter() {
            if self.is_full() {
                break;
            }
            self.push(value)?;
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Append one value unconditionally, past any fullness check.
    pub fn push(&mut self, value: &Value) -> Result<()> {
        if self.width.is_none() {
            let off = err_at!(FailConvert, u32::try_from(self.data.len()))?;
            self.offsets.push(off);
        }
        encode_cell(value, &mut self.data)?;
        self.first.get_or_insert_with(|| value.clone());
        self.last = Some(value.clone());
        self.count += 1;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        // a block accepts at least one value, however large
        self.count > 0 && self.data.len() + self.offsets.len() * 4 >= self.target
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn to_first_value(&self) -> Option<Value> {
        self.first.clone()
    }

    pub fn to_last_value(&self) -> Option<Value> {
        self.last.clone()
    }

    pub fn finish(&mut self) -> Result<Vec<u8>> {
        let count = err_at!(FailConvert, u32::try_from(self.count))?;

        let mut payload = Vec::with_capacity(4 + self.offsets.len() * 4 + self.data.len());
        payload.extend_from_slice(&count.to_le_bytes());
        for off in self.offsets.iter() {
            payload.extend_from_slice(&off.to_le_bytes());
        }
        payload.extend_from_slice(&self.data);

        self.reset();
        Ok(payload)
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.data.clear();
        self.offsets.clear();
        self.first = None;
        self.last = None;
    }
}

pub struct PlainDecoder {
    ctype: ColumnType,
    width: Option<usize>,
    count: usize,
    offsets: Vec<u32>,
    data: Vec<u8>,
    pos: usize,
}

impl PlainDecoder {
    pub fn open(ctype: &ColumnType, payload: &[u8]) -> Result<PlainDecoder> {
        check_remaining!(payload, 4, "plain-count")?;
        let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;

        let (offsets, data) = match ctype.fixed_width() {
            Some(width) => {
                check_remaining!(payload, 4 + count * width, "plain-fixed")?;
                (vec![], payload[4..4 + count * width].to_vec())
            }
            None => {
                check_remaining!(payload, 4 + count * 4, "plain-offsets")?;
                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    let at = 4 + i * 4;
                    offsets.push(u32::from_le_bytes(
                        payload[at..at + 4].try_into().unwrap(),
                    ));
                }
                let data = payload[4 + count * 4..].to_vec();
                for (i, off) in offsets.iter().enumerate() {
                    let end = offsets.get(i + 1).copied().unwrap_or(data.len() as u32);
                    if *off > end || end as usize > data.len() {
                        err_at!(Corruption, msg: "plain offsets out of order")?;
                    }
                }
                (offsets, data)
            }
        };

        Ok(PlainDecoder {
            ctype: ctype.clone(),
            width: ctype.fixed_width(),
            count,
            offsets,
            data,
            pos: 0,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn seek_to_position(&mut self, pos: usize) -> Result<()> {
        self.pos = pos.min(self.count);
        Ok(())
    }

    /// Current cursor position, in non-null value ordinals.
    pub fn to_position(&self) -> usize {
        self.pos
    }

    fn value_at(&self, i: usize) -> Result<Value> {
        match self.width {
            Some(width) => decode_cell(&self.ctype, &self.data[i * width..(i + 1) * width]),
            None => {
                let start = self.offsets[i] as usize;
                let end = self
                    .offsets
                    .get(i + 1)
                    .map(|off| *off as usize)
                    .unwrap_or(self.data.len());
                decode_cell(&self.ctype, &self.data[start..end])
            }
        }
    }

    pub fn seek_at_or_after_value(&mut self, probe: &Value) -> Result<bool> {
        let mut lo = 0;
        let mut hi = self.count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.value_at(mid)?.cmp(probe) {
                std::cmp::Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }

        self.pos = lo;
        if lo < self.count {
            Ok(self.value_at(lo)?.cmp(probe) == std::cmp::Ordering::Equal)
        } else {
            Ok(false)
        }
    }

    pub fn copy_next_values(&mut self, n: usize, out: &mut Vec<Value>) -> Result<usize> {
        let m = remaining(self.pos, self.count, n);
        for i in self.pos..self.pos + m {
            out.push(self.value_at(i)?);
        }
        self.pos += m;
        Ok(m)
    }
}

#[cfg(test)]
#[path = "plain_test.rs"]
mod plain_test;
