//! Module `prefix` implement prefix encoding for string and binary
//! columns. Each entry stores the length of the prefix it shares with
//! the previous entry plus its suffix; every R-th entry is a restart
//! point holding the full value, so lookups binary-search the restart
//! array and walk at most R entries.
//!
//! Payload layout:
//!
//! ```text
//! u32 count
//! { varint(shared_len) varint(suffix_len) suffix } * count
//! u32 restart_offsets[n_restarts]
//! u32 n_restarts
//! ```

use std::convert::{TryFrom, TryInto};

use crate::{
    cfile::{encoding::value_to_bytes, PREFIX_RESTART_INTERVAL},
    row::Value,
    schema::ColumnType,
    util, Error, Result,
};

pub struct PrefixBuilder {
    target: usize,

    count: usize,
    entries: Vec<u8>,
    restarts: Vec<u32>,
    prev: Vec<u8>,
    first: Option<Value>,
    last: Option<Value>,
}

impl PrefixBuilder {
    pub fn new(target: usize) -> PrefixBuilder {
        PrefixBuilder {
            target,

            count: 0,
            entries: vec![],
            restarts: vec![],
            prev: vec![],
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
        let bytes = value_to_bytes(value)?;

        let shared = if self.count % PREFIX_RESTART_INTERVAL == 0 {
            let off = err_at!(FailConvert, u32::try_from(self.entries.len()))?;
            self.restarts.push(off);
            0
        } else {
            common_prefix(&self.prev, &bytes)
        };

        util::encode_varint(shared as u64, &mut self.entries);
        util::encode_varint((bytes.len() - shared) as u64, &mut self.entries);
        self.entries.extend_from_slice(&bytes[shared..]);

        self.prev = bytes;
        self.first.get_or_insert_with(|| value.clone());
        self.last = Some(value.clone());
        self.count += 1;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.count > 0 && self.entries.len() + self.restarts.len() * 4 + 8 >= self.target
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
        let n_restarts = err_at!(FailConvert, u32::try_from(self.restarts.len()))?;

        let mut payload =
            Vec::with_capacity(8 + self.entries.len() + self.restarts.len() * 4);
        payload.extend_from_slice(&count.to_le_bytes());
        payload.extend_from_slice(&self.entries);
        for off in self.restarts.iter() {
            payload.extend_from_slice(&off.to_le_bytes());
        }
        payload.extend_from_slice(&n_restarts.to_le_bytes());

        self.reset();
        Ok(payload)
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.entries.clear();
        self.restarts.clear();
        self.prev.clear();
        self.first = None;
        self.last = None;
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

pub struct PrefixDecoder {
    is_string: bool,
    count: usize,
    entries: Vec<u8>,
    restarts: Vec<u32>,

    pos: usize,
    // cursor into `entries` and the materialized previous value
    cursor: usize,
    prev: Vec<u8>,
}

impl PrefixDecoder {
    /// Current cursor position, in non-null value ordinals.
    pub fn to_position(&self) -> usize {
        self.pos
    }

    pub fn open(ctype: &ColumnType, payload: &[u8]) -> Result<PrefixDecoder> {
        use ColumnType as T;

        let is_string = matches!(ctype, T::String | T::Varchar { .. });

        check_remaining!(payload, 8, "prefix-header")?;
        let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
        let n_restarts = u32::from_le_bytes(
            payload[payload.len() - 4..].try_into().unwrap(),
        ) as usize;

        let restarts_at = payload
            .len()
            .checked_sub(4 + n_restarts * 4)
            .ok_or_else(|| {
                Error::Corruption("prefix".to_string(), "restart array".to_string())
            })?;
        let mut restarts = Vec::with_capacity(n_restarts);
        for i in 0..n_restarts {
            let at = restarts_at + i * 4;
            restarts.push(u32::from_le_bytes(payload[at..at + 4].try_into().unwrap()));
        }

        let entries = payload[4..restarts_at].to_vec();

        let mut decoder = PrefixDecoder {
            is_string,
            count,
            entries,
            restarts,

            pos: 0,
            cursor: 0,
            prev: vec![],
        };
        decoder.seek_to_position(0)?;
        Ok(decoder)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Step the cursor over one entry, updating `prev` to hold its
    /// full value.
    fn step(&mut self) -> Result<()> {
        let (shared, n) = util::decode_varint(&self.entries[self.cursor..])?;
        self.cursor += n;
        let (suffix_len, n) = util::decode_varint(&self.entries[self.cursor..])?;
        self.cursor += n;

        let shared = err_at!(FailConvert, usize::try_from(shared))?;
        let suffix_len = err_at!(FailConvert, usize::try_from(suffix_len))?;
        check_remaining!(&self.entries[self.cursor..], suffix_len, "prefix-suffix")?;
        if shared > self.prev.len() {
            err_at!(Corruption, msg: "shared {} > prev {}", shared, self.prev.len())?;
        }

        self.prev.truncate(shared);
        self.prev
            .extend_from_slice(&self.entries[self.cursor..self.cursor + suffix_len]);
        self.cursor += suffix_len;
        Ok(())
    }

    fn to_value(&self) -> Result<Value> {
        if self.is_string {
            match std::str::from_utf8(&self.prev) {
                Ok(s) => Ok(Value::String(s.to_string())),
                Err(err) => err_at!(Corruption, Err(err), "utf8 in prefix block"),
            }
        } else {
            Ok(Value::Binary(self.prev.clone()))
        }
    }

    pub fn seek_to_position(&mut self, pos: usize) -> Result<()> {
        let pos = pos.min(self.count);
        // rewind to the nearest restart at or before `pos`
        let restart = pos / PREFIX_RESTART_INTERVAL;
        let restart = restart.min(self.restarts.len().saturating_sub(1));
        self.cursor = *self.restarts.get(restart).unwrap_or(&0) as usize;
        self.prev.clear();
        self.pos = restart * PREFIX_RESTART_INTERVAL;

        while self.pos < pos {
            self.step()?;
            self.pos += 1;
        }
        Ok(())
    }

    pub fn seek_at_or_after_value(&mut self, probe: &Value) -> Result<bool> {
        let probe_bytes = value_to_bytes(probe)?;

        // binary search restart points for the right-most restart with
        // value <= probe
        let mut lo = 0_usize;
        let mut hi = self.restarts.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            self.seek_to_position(mid * PREFIX_RESTART_INTERVAL)?;
            self.step()?;
            self.pos += 1;
            if self.prev.as_slice() <= probe_bytes.as_slice() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let restart = lo.saturating_sub(1);

        self.seek_to_position(restart * PREFIX_RESTART_INTERVAL)?;
        while self.pos < self.count {
            let at = self.pos;
            self.step()?;
            self.pos += 1;
            if self.prev.as_slice() >= probe_bytes.as_slice() {
                let exact = self.prev == probe_bytes;
                // park the cursor back on this entry
                self.seek_to_position(at)?;
                return Ok(exact);
            }
        }
        Ok(false)
    }

    pub fn copy_next_values(&mut self, n: usize, out: &mut Vec<Value>) -> Result<usize> {
        let mut m = 0;
        while m < n && self.pos < self.count {
            self.step()?;
            self.pos += 1;
            out.push(self.to_value()?);
            m += 1;
        }
        Ok(m)
    }
}

#[cfg(test)]
#[path = "prefix_test.rs"]
mod prefix_test;
