//! Module `dict` implement dictionary encoding for string and binary
//! columns. A per-CFile dictionary maps each distinct value to an
//! unsigned 32-bit codeword; data blocks hold the codeword stream,
//! bitshuffle-compressed. When the dictionary grows past its budget
//! the writer transparently switches the block being written (and all
//! later blocks) to plain encoding; a 4-byte header on every data
//! block records which mode it is in.
//!
//! Payload layout:
//!
//! ```text
//! u32 mode | mode 0: bshuf payload of codewords
//!          | mode 1: plain payload of values
//! ```
//!
//! Predicate evaluation on a dictionary block tests the predicate
//! against the dictionary once, builds the set of matching codewords,
//! and only materializes rows whose codeword is in the set.

use std::{cell::RefCell, collections::HashMap, convert::TryInto, rc::Rc, sync::Arc};

use crate::{
    cfile::{
        bshuf::{BshufBuilder, BshufDecoder},
        plain::{PlainBuilder, PlainDecoder},
    },
    row::Value,
    scan::Predicate,
    schema::ColumnType,
    Error, Result,
};

const MODE_DICT: u32 = 0;
const MODE_PLAIN: u32 = 1;

/// Writer-side dictionary, shared by every data block of one CFile.
pub struct SharedDict {
    map: HashMap<Vec<u8>, u32>,
    words: Vec<Vec<u8>>,
    bytes: usize,
    budget: usize,
    overflowed: bool,
}

/// Handle threading the per-file dictionary through block builders.
pub type DictHandle = Rc<RefCell<SharedDict>>;

impl SharedDict {
    pub fn new(budget: usize) -> DictHandle {
        Rc::new(RefCell::new(SharedDict {
            map: HashMap::new(),
            words: vec![],
            bytes: 0,
            budget,
            overflowed: false,
        }))
    }

    /// Codeword for `bytes`, inserting when novel. None once the
    /// dictionary is over budget and the word is unknown.
    fn code_of(&mut self, bytes: &[u8]) -> Option<u32> {
        if let Some(code) = self.map.get(bytes) {
            return Some(*code);
        }
        if self.overflowed || self.bytes + bytes.len() > self.budget {
            self.overflowed = true;
            return None;
        }
        let code = self.words.len() as u32;
        self.map.insert(bytes.to_vec(), code);
        self.words.push(bytes.to_vec());
        self.bytes += bytes.len();
        Some(code)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Serialize the dictionary as a plain varlen block payload.
    pub fn to_block_payload(&self) -> Result<Vec<u8>> {
        let mut builder = PlainBuilder::new(&ColumnType::Binary, usize::MAX);
        for word in self.words.iter() {
            builder.add(&[Value::Binary(word.clone())])?;
        }
        builder.finish()
    }
}

/// Reader-side dictionary: codeword to value, decoded once per CFile.
pub struct Dictionary {
    words: Vec<Vec<u8>>,
    is_string: bool,
}

impl Dictionary {
    /// Decode from the dictionary block payload.
    pub fn from_block_payload(ctype: &ColumnType, payload: &[u8]) -> Result<Dictionary> {
        use ColumnType as T;

        let mut decoder = PlainDecoder::open(&T::Binary, payload)?;
        let mut values = vec![];
        decoder.copy_next_values(decoder.count(), &mut values)?;

        let words = values
            .into_iter()
            .map(|value| match value {
                Value::Binary(word) => word,
                _ => unreachable!(),
            })
            .collect();

        Ok(Dictionary {
            words,
            is_string: matches!(ctype, T::String | T::Varchar { .. }),
        })
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn materialize(&self, code: u32) -> Result<Value> {
        let word = match self.words.get(code as usize) {
            Some(word) => word,
            None => err_at!(Corruption, msg: "codeword {} of {}", code, self.words.len())?,
        };
        if self.is_string {
            match std::str::from_utf8(word) {
                Ok(s) => Ok(Value::String(s.to_string())),
                Err(err) => err_at!(Corruption, Err(err), "utf8 dictionary word"),
            }
        } else {
            Ok(Value::Binary(word.clone()))
        }
    }

    /// Codewords whose word satisfies `pred`.
    fn matching_codewords(&self, pred: &Predicate) -> Result<croaring::Bitmap> {
        let mut matches = croaring::Bitmap::create();
        for code in 0..self.words.len() as u32 {
            if pred.matches(&self.materialize(code)?) {
                matches.add(code);
            }
        }
        Ok(matches)
    }
}

enum BuilderMode {
    Dict(BshufBuilder),
    Plain(PlainBuilder),
}

pub struct DictBuilder {
    dict: DictHandle,
    target: usize,
    inner: BuilderMode,

    count: usize,
    first: Option<Value>,
    last: Option<Value>,
    // raw values of the open block, for a mid-block fallback to plain
    pending: Vec<Value>,
}

impl DictBuilder {
    pub fn new(dict: DictHandle, target: usize) -> DictBuilder {
        let inner = if dict.borrow().overflowed {
            BuilderMode::Plain(PlainBuilder::new(&ColumnType::Binary, target))
        } else {
            BuilderMode::Dict(BshufBuilder::new(4, target))
        };

        DictBuilder {
            dict,
            target,
            inner,

            count: 0,
            first: None,
            last: None,
            pending: vec![],
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
        let bytes = match value {
            Value::String(val) => val.as_bytes().to_vec(),
            Value::Binary(val) => val.clone(),
            value => err_at!(InvalidInput, msg: "dict on non varlen {}", value)?,
        };

        if matches!(self.inner, BuilderMode::Dict(_)) {
            let code = self.dict.borrow_mut().code_of(&bytes);
            match code {
                Some(code) => {
                    if let BuilderMode::Dict(inner) = &mut self.inner {
                        inner.push(&Value::UInt32(code))?;
                    }
                }
                None => {
                    // dictionary over budget: rewrite the open block
                    // as plain and continue there
                    self.switch_to_plain()?;
                    if let BuilderMode::Plain(inner) = &mut self.inner {
                        inner.push(&Value::Binary(bytes))?;
                    }
                }
            }
        } else if let BuilderMode::Plain(inner) = &mut self.inner {
            inner.push(&Value::Binary(bytes))?;
        }

        self.pending.push(value.clone());
        self.first.get_or_insert_with(|| value.clone());
        self.last = Some(value.clone());
        self.count += 1;
        Ok(())
    }

    fn switch_to_plain(&mut self) -> Result<()> {
        let mut inner = PlainBuilder::new(&ColumnType::Binary, self.target);
        for value in self.pending.iter() {
            let bytes = match value {
                Value::String(val) => val.as_bytes().to_vec(),
                Value::Binary(val) => val.clone(),
                _ => unreachable!(),
            };
            inner.add(&[Value::Binary(bytes)])?;
        }
        self.inner = BuilderMode::Plain(inner);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        match &self.inner {
            BuilderMode::Dict(inner) => inner.is_full(),
            BuilderMode::Plain(inner) => inner.is_full(),
        }
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
        let (mode, inner_payload) = match &mut self.inner {
            BuilderMode::Dict(inner) => (MODE_DICT, inner.finish()?),
            BuilderMode::Plain(inner) => (MODE_PLAIN, inner.finish()?),
        };

        let mut payload = Vec::with_capacity(4 + inner_payload.len());
        payload.extend_from_slice(&mode.to_le_bytes());
        payload.extend_from_slice(&inner_payload);

        self.reset();
        Ok(payload)
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.first = None;
        self.last = None;
        self.pending.clear();
        self.inner = if self.dict.borrow().overflowed {
            BuilderMode::Plain(PlainBuilder::new(&ColumnType::Binary, self.target))
        } else {
            BuilderMode::Dict(BshufBuilder::new(4, self.target))
        };
    }
}

enum DecoderMode {
    Dict(BshufDecoder),
    Plain(PlainDecoder),
}

pub struct DictDecoder {
    inner: DecoderMode,
    dict: Arc<Dictionary>,

    // matching codewords for the predicate seen by this decoder
    cached_matches: Option<croaring::Bitmap>,
    // rows materialized through the dictionary; predicate evaluation
    // skips the decode path for non-matching codewords.
    pub n_materialized: usize,
}

impl DictDecoder {
    pub fn open(
        _ctype: &ColumnType,
        payload: &[u8],
        dict: Arc<Dictionary>,
    ) -> Result<DictDecoder> {
        check_remaining!(payload, 4, "dict-mode")?;
        let mode = u32::from_le_bytes(payload[..4].try_into().unwrap());

        let inner = match mode {
            MODE_DICT => DecoderMode::Dict(BshufDecoder::open(
                &ColumnType::UInt32,
                &payload[4..],
            )?),
            MODE_PLAIN => {
                DecoderMode::Plain(PlainDecoder::open(&ColumnType::Binary, &payload[4..])?)
            }
            mode => err_at!(Corruption, msg: "dict block mode {}", mode)?,
        };

        Ok(DictDecoder {
            inner,
            dict,
            cached_matches: None,
            n_materialized: 0,
        })
    }

    pub fn count(&self) -> usize {
        match &self.inner {
            DecoderMode::Dict(inner) => inner.count(),
            DecoderMode::Plain(inner) => inner.count(),
        }
    }

    pub fn seek_to_position(&mut self, pos: usize) -> Result<()> {
        match &mut self.inner {
            DecoderMode::Dict(inner) => inner.seek_to_position(pos),
            DecoderMode::Plain(inner) => inner.seek_to_position(pos),
        }
    }

    /// Current cursor position, in non-null value ordinals.
    pub fn to_position(&self) -> usize {
        match &self.inner {
            DecoderMode::Dict(inner) => inner.to_position(),
            DecoderMode::Plain(inner) => inner.to_position(),
        }
    }

    pub fn seek_at_or_after_value(&mut self, probe: &Value) -> Result<bool> {
        // codewords are insertion-ordered, not value-ordered; scan.
        let count = self.count();
        self.seek_to_position(0)?;
        for pos in 0..count {
            let mut values = vec![];
            self.copy_next_values(1, &mut values)?;
            match values[0].cmp(probe) {
                std::cmp::Ordering::Less => continue,
                ord => {
                    self.seek_to_position(pos)?;
                    return Ok(ord == std::cmp::Ordering::Equal);
                }
            }
        }
        Ok(false)
    }

    pub fn copy_next_values(&mut self, n: usize, out: &mut Vec<Value>) -> Result<usize> {
        match &mut self.inner {
            DecoderMode::Dict(inner) => {
                let mut codes = Vec::with_capacity(n);
                let m = inner.copy_next_values(n, &mut codes)?;
                for code in codes.into_iter() {
                    let code = match code {
                        Value::UInt32(code) => code,
                        _ => unreachable!(),
                    };
                    out.push(self.dict.materialize(code)?);
                    self.n_materialized += 1;
                }
                Ok(m)
            }
            DecoderMode::Plain(inner) => {
                let start = out.len();
                let m = inner.copy_next_values(n, out)?;
                self.n_materialized += m;
                // plain fallback stores raw bytes; re-type strings
                if self.dict.is_string {
                    for value in out[start..].iter_mut() {
                        if let Value::Binary(bytes) = value {
                            match std::str::from_utf8(bytes) {
                                Ok(s) => *value = Value::String(s.to_string()),
                                Err(err) => {
                                    err_at!(Corruption, Err(err), "utf8 dict block")?
                                }
                            }
                        }
                    }
                }
                Ok(m)
            }
        }
    }

    pub fn copy_next_and_eval(
        &mut self,
        n: usize,
        pred: &Predicate,
        base: u32,
        sel: &mut croaring::Bitmap,
        out: &mut Vec<Value>,
    ) -> Result<usize> {
        if matches!(self.inner, DecoderMode::Plain(_)) {
            let start = out.len();
            let m = self.copy_next_values(n, out)?;
            for (i, value) in out[start..].iter().enumerate() {
                if !pred.matches(value) {
                    sel.remove(base + i as u32);
                }
            }
            return Ok(m);
        }

        if self.cached_matches.is_none() {
            self.cached_matches = Some(self.dict.matching_codewords(pred)?);
        }

        let inner = match &mut self.inner {
            DecoderMode::Dict(inner) => inner,
            DecoderMode::Plain(_) => unreachable!(),
        };
        let matches = self.cached_matches.as_ref().unwrap();

        let mut codes = Vec::with_capacity(n);
        let m = inner.copy_next_values(n, &mut codes)?;
        for (i, code) in codes.into_iter().enumerate() {
            let code = match code {
                Value::UInt32(code) => code,
                _ => unreachable!(),
            };
            if matches.contains(code) {
                out.push(self.dict.materialize(code)?);
                self.n_materialized += 1;
            } else {
                sel.remove(base + i as u32);
                out.push(Value::Null);
            }
        }
        Ok(m)
    }
}

#[cfg(test)]
#[path = "dict_test.rs"]
mod dict_test;
