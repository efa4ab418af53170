//! Module `rle` implement run-length encoding for bool and integer
//! columns up to 64-bit lanes.
//!
//! Payload layout:
//!
//! ```text
//! u32 count | u32 n_runs | { varint(lane) varint(run_len) } * n_runs
//! ```
//!
//! Lanes are the zig-zag/identity mapping of
//! [crate::cfile::encoding::value_to_lane]. Seeks walk the run
//! headers, never the values.

use std::convert::{TryFrom, TryInto};

use crate::{
    cfile::encoding::{lane_to_value, remaining, value_to_lane},
    row::Value,
    schema::ColumnType,
    util, Error, Result,
};

pub struct RleBuilder {
    target: usize,

    count: usize,
    runs: Vec<u8>,
    n_runs: u32,
    open_run: Option<(u64, u64)>, // (lane, length)
    first: Option<Value>,
    last: Option<Value>,
}

impl RleBuilder {
    pub fn new(target: usize) -> RleBuilder {
        RleBuilder {
            target,

            count: 0,
            runs: vec![],
            n_runs: 0,
            open_run: None,
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
        let lane = value_to_lane(value)?;
        match &mut self.open_run {
            Some((run_lane, len)) if *run_lane == lane => *len += 1,
            Some(_) => {
                self.seal_run();
                self.open_run = Some((lane, 1));
            }
            None => self.open_run = Some((lane, 1)),
        }
        self.first.get_or_insert_with(|| value.clone());
        self.last = Some(value.clone());
        self.count += 1;
        Ok(())
    }

    fn seal_run(&mut self) {
        if let Some((lane, len)) = self.open_run.take() {
            util::encode_varint(lane, &mut self.runs);
            util::encode_varint(len, &mut self.runs);
            self.n_runs += 1;
        }
    }

    pub fn is_full(&self) -> bool {
        self.count > 0 && self.runs.len() + 20 >= self.target
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
        self.seal_run();
        let count = err_at!(FailConvert, u32::try_from(self.count))?;

        let mut payload = Vec::with_capacity(8 + self.runs.len());
        payload.extend_from_slice(&count.to_le_bytes());
        payload.extend_from_slice(&self.n_runs.to_le_bytes());
        payload.extend_from_slice(&self.runs);

        self.reset();
        Ok(payload)
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.runs.clear();
        self.n_runs = 0;
        self.open_run = None;
        self.first = None;
        self.last = None;
    }
}

pub struct RleDecoder {
    ctype: ColumnType,
    count: usize,
    // decoded run headers: (lane, start position)
    runs: Vec<(u64, usize)>,
    pos: usize,
}

impl RleDecoder {
    pub fn open(ctype: &ColumnType, payload: &[u8]) -> Result<RleDecoder> {
        check_remaining!(payload, 8, "rle-header")?;
        let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
        let n_runs = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;

        let mut runs = Vec::with_capacity(n_runs);
        let mut off = 8;
        let mut start = 0_usize;
        for _ in 0..n_runs {
            let (lane, n) = util::decode_varint(&payload[off..])?;
            off += n;
            let (len, n) = util::decode_varint(&payload[off..])?;
            off += n;
            runs.push((lane, start));
            start += err_at!(FailConvert, usize::try_from(len))?;
        }
        if start != count {
            err_at!(Corruption, msg: "rle runs cover {}/{}", start, count)?;
        }

        Ok(RleDecoder {
            ctype: ctype.clone(),
            count,
            runs,
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

    fn lane_at(&self, pos: usize) -> u64 {
        // find the run holding `pos`
        let at = match self.runs.binary_search_by(|(_, start)| start.cmp(&pos)) {
            Ok(at) => at,
            Err(at) => at - 1,
        };
        self.runs[at].0
    }

    pub fn seek_at_or_after_value(&mut self, probe: &Value) -> Result<bool> {
        // runs are only sorted for sorted columns; walk them in order.
        for (lane, start) in self.runs.iter() {
            let value = lane_to_value(&self.ctype, *lane)?;
            match value.cmp(probe) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => {
                    self.pos = *start;
                    return Ok(true);
                }
                std::cmp::Ordering::Greater => {
                    self.pos = *start;
                    return Ok(false);
                }
            }
        }
        self.pos = self.count;
        Ok(false)
    }

    pub fn copy_next_values(&mut self, n: usize, out: &mut Vec<Value>) -> Result<usize> {
        let m = remaining(self.pos, self.count, n);
        for pos in self.pos..self.pos + m {
            let lane = self.lane_at(pos);
            out.push(lane_to_value(&self.ctype, lane)?);
        }
        self.pos += m;
        Ok(m)
    }
}

#[cfg(test)]
#[path = "rle_test.rs"]
mod rle_test;
