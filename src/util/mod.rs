//! Module implement common utility functions, macros and types.

use cbordata::{Cbor, FromCbor, IntoCbor};

use std::{ffi, fs, path};

use crate::{Error, Result};

pub mod spinlock;
pub mod thread;

pub use spinlock::Spinlock;
pub use thread::Thread;

macro_rules! check_remaining {
    ($buf:expr, $want:expr, $msg:expr) => {{
        if $buf.len() < $want {
            err_at!(
                Corruption, msg: "insufficient input {}/{} ({})", $buf.len(), $want, $msg
            )
        } else {
            Ok(())
        }
    }};
}

macro_rules! read_file {
    ($fd:expr, $seek:expr, $n:expr, $msg:expr) => {{
        use std::convert::TryFrom;
        use std::io::{Read, Seek};

        match $fd.seek($seek) {
            Ok(_) => {
                let mut buf = vec![0; usize::try_from($n).unwrap()];
                match $fd.read(&mut buf) {
                    Ok(n) if buf.len() == n => Ok(buf),
                    Ok(n) => {
                        let m = buf.len();
                        err_at!(Fatal, msg: concat!($msg, " {}/{} at {:?}"), m, n, $seek)
                    }
                    Err(err) => err_at!(IOError, Err(err)),
                }
            }
            Err(err) => err_at!(IOError, Err(err)),
        }
    }};
}

macro_rules! write_file {
    ($fd:expr, $buffer:expr, $file:expr, $msg:expr) => {{
        use std::io::Write;

        match err_at!(IOError, $fd.write($buffer))? {
            n if $buffer.len() == n => Ok(n),
            n => err_at!(
                Fatal, msg: "partial-wr {}, {:?}, {}/{}", $msg, $file, $buffer.len(), n
            ),
        }
    }};
}

/// Helper function to serialize value `T` implementing IntoCbor, into
/// byte-string.
pub fn into_cbor_bytes<T>(val: T) -> Result<Vec<u8>>
where
    T: IntoCbor,
{
    let mut data: Vec<u8> = vec![];
    let n = err_at!(
        FailCbor,
        err_at!(FailCbor, val.into_cbor())?.encode(&mut data)
    )?;
    if n != data.len() {
        err_at!(Fatal, msg: "cbor encoding len mistmatch {} {}", n, data.len())
    } else {
        Ok(data)
    }
}

/// Helper function to deserialize value `T` implementing FromCbor, from
/// byte-string. Return (value, bytes-consumed).
pub fn from_cbor_bytes<T>(mut data: &[u8]) -> Result<(T, usize)>
where
    T: FromCbor,
{
    let (val, n) = err_at!(FailCbor, Cbor::decode(&mut data))?;
    Ok((err_at!(FailCbor, T::from_cbor(val))?, n))
}

/// Encode `val` as LEB128 varint into `buf`, return the encoded width.
pub fn encode_varint(mut val: u64, buf: &mut Vec<u8>) -> usize {
    let mut n = 0;
    loop {
        n += 1;
        if val < 0x80 {
            buf.push(val as u8);
            break n;
        }
        buf.push(((val & 0x7f) | 0x80) as u8);
        val >>= 7;
    }
}

/// Decode a LEB128 varint from `buf`, return (value, bytes-consumed).
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut val = 0_u64;
    for (i, byte) in buf.iter().enumerate() {
        if i >= 10 {
            break;
        }
        val |= u64::from(byte & 0x7f) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok((val, i + 1));
        }
    }
    err_at!(Corruption, msg: "truncated or overlong varint")
}

// create a file in append mode for writing.
pub fn create_file_a(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = {
        let os_file = path::Path::new(file);
        fs::remove_file(os_file).ok(); // NOTE: ignore remove errors.
        os_file
    };

    {
        let parent = match os_file.parent() {
            Some(parent) => Ok(parent),
            None => err_at!(InvalidFile, msg: "{:?}", file),
        }?;
        err_at!(IOError, fs::create_dir_all(parent))?;
    };

    let mut opts = fs::OpenOptions::new();
    Ok(err_at!(
        IOError,
        opts.append(true).create_new(true).open(os_file)
    )?)
}

// open existing file in append mode for writing.
pub fn open_file_a(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(file);
    let mut opts = fs::OpenOptions::new();
    Ok(err_at!(IOError, opts.append(true).open(os_file))?)
}

// open file for reading.
pub fn open_file_r(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(file);
    Ok(err_at!(
        IOError,
        fs::OpenOptions::new().read(true).open(os_file)
    )?)
}

pub fn sync_write(file: &mut fs::File, data: &[u8]) -> Result<usize> {
    use std::io::Write;

    let n = err_at!(IOError, file.write(data))?;
    if n != data.len() {
        err_at!(IOError, msg: "partial write to file {} {}", n, data.len())?
    }
    err_at!(IOError, file.sync_all())?;
    Ok(n)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
