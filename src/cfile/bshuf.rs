//! Module `bshuf` implement bitshuffle encoding for fixed-width
//! columns: the bit matrix of the block is transposed so that the i-th
//! bit of every value lands contiguously, then squeezed through a fast
//! byte compressor. Columns of slowly-varying integers collapse to
//! near-empty bit planes.
//!
//! Payload layout:
//!
//! ```text
//! u32 count | u8 width | u32 raw_len | u32 comp_len | data
//! ```
//!
//! `data` is the zstd (level 1) form of the transposed bytes, or the
//! transposed bytes themselves when `comp_len == raw_len`.

use std::convert::{TryFrom, TryInto};

use crate::{
    cfile::encoding::remaining,
    row::{decode_cell, encode_cell, Value},
    schema::ColumnType,
    Error, Result,
};

pub struct BshufBuilder {
    width: usize,
    target: usize,

    count: usize,
    raw: Vec<u8>,
    first: Option<Value>,
    last: Option<Value>,
}

impl BshufBuilder {
    pub fn new(width: usize, target: usize) -> BshufBuilder {
        BshufBuilder {
            width,
            target,

            count: 0,
            raw: vec![],
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
        let n = encode_cell(value, &mut self.raw)?;
        if n != self.width {
            err_at!(Fatal, msg: "cell width {}/{}", n, self.width)?;
        }
        self.first.get_or_insert_with(|| value.clone());
        self.last = Some(value.clone());
        self.count += 1;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.count > 0 && self.raw.len() >= self.target
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
        let raw_len = err_at!(FailConvert, u32::try_from(self.raw.len()))?;

        let transposed = transpose(&self.raw, self.count, self.width);
        let compressed = err_at!(IOError, zstd::block::compress(&transposed, 1))?;
        let stored = if compressed.len() < transposed.len() {
            compressed
        } else {
            transposed
        };
        let comp_len = err_at!(FailConvert, u32::try_from(stored.len()))?;

        let mut payload = Vec::with_capacity(13 + stored.len());
        payload.extend_from_slice(&count.to_le_bytes());
        payload.push(u8::try_from(self.width).unwrap());
        payload.extend_from_slice(&raw_len.to_le_bytes());
        payload.extend_from_slice(&comp_len.to_le_bytes());
        payload.extend_from_slice(&stored);

        self.reset();
        Ok(payload)
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.raw.clear();
        self.first = None;
        self.last = None;
    }
}

// transpose the bit matrix: bit `p` of value `i` moves to global bit
// position `p * count + i`.
fn transpose(raw: &[u8], count: usize, width: usize) -> Vec<u8> {
    let planes = width * 8;
    let mut out = vec![0_u8; raw.len()];
    for i in 0..count {
        for p in 0..planes {
            let bit = (raw[i * width + (p / 8)] >> (p % 8)) & 1;
            if bit != 0 {
                let at = p * count + i;
                out[at / 8] |= 1 << (at % 8);
            }
        }
    }
    out
}

fn untranspose(data: &[u8], count: usize, width: usize) -> Vec<u8> {
    let planes = width * 8;
    let mut out = vec![0_u8; count * width];
    for i in 0..count {
        for p in 0..planes {
            let at = p * count + i;
            let bit = (data[at / 8] >> (at % 8)) & 1;
            if bit != 0 {
                out[i * width + (p / 8)] |= 1 << (p % 8);
            }
        }
    }
    out
}

pub struct BshufDecoder {
    ctype: ColumnType,
    width: usize,
    count: usize,
    raw: Vec<u8>,
    pos: usize,
}

impl BshufDecoder {
    pub fn open(ctype: &ColumnType, payload: &[u8]) -> Result<BshufDecoder> {
        check_remaining!(payload, 13, "bshuf-header")?;
        let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
        let width = payload[4] as usize;
        let raw_len = u32::from_le_bytes(payload[5..9].try_into().unwrap()) as usize;
        let comp_len = u32::from_le_bytes(payload[9..13].try_into().unwrap()) as usize;
        check_remaining!(payload, 13 + comp_len, "bshuf-data")?;

        if raw_len != count * width {
            err_at!(Corruption, msg: "bshuf raw len {}/{}", raw_len, count * width)?;
        }
        match ctype.fixed_width() {
            Some(w) if w == width => (),
            _ => err_at!(Corruption, msg: "bshuf width {} for {:?}", width, ctype)?,
        }

        let stored = &payload[13..13 + comp_len];
        let transposed = if comp_len == raw_len {
            stored.to_vec()
        } else {
            err_at!(Corruption, zstd::block::decompress(stored, raw_len))?
        };
        if transposed.len() != raw_len {
            err_at!(Corruption, msg: "bshuf inflate {}/{}", transposed.len(), raw_len)?;
        }

        Ok(BshufDecoder {
            ctype: ctype.clone(),
            width,
            count,
            raw: untranspose(&transposed, count, width),
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
        decode_cell(&self.ctype, &self.raw[i * self.width..(i + 1) * self.width])
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
#[path = "bshuf_test.rs"]
mod bshuf_test;
