//! Module `block` implement the physical framing of CFile blocks:
//! optional compression wrapped with lengths and a crc32c trailer.
//!
//! Frame layout, all little-endian:
//!
//! ```text
//! uncompressed_len:u32 | compressed_len:u32 | payload | crc32c(payload):u32
//! ```
//!
//! A block whose `compressed_len` equals `uncompressed_len` is stored
//! raw. The checksum covers the stored payload bytes and is verified
//! before any other field is trusted.

use crc::{Crc, CRC_32_ISCSI};

use std::convert::{TryFrom, TryInto};

use crate::{schema::Compression, Error, Result};

/// Frame header + trailer overhead, in bytes.
pub const FRAME_OVERHEAD: usize = 12;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Compress (when profitable) and frame `payload`.
pub fn frame(payload: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let uncompressed_len = err_at!(FailConvert, u32::try_from(payload.len()))?;

    let compressed = match compression {
        Compression::None => None,
        Compression::Zstd => {
            let data = err_at!(IOError, zstd::block::compress(payload, 3))?;
            Some(data)
        }
        Compression::Lzma => Some(lzma_compress(payload)?),
    };
    // fall back to raw bytes when compression does not help
    let stored = match compressed {
        Some(data) if data.len() < payload.len() => data,
        _ => payload.to_vec(),
    };
    let compressed_len = err_at!(FailConvert, u32::try_from(stored.len()))?;

    let mut buf = Vec::with_capacity(stored.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&uncompressed_len.to_le_bytes());
    buf.extend_from_slice(&compressed_len.to_le_bytes());
    buf.extend_from_slice(&stored);
    buf.extend_from_slice(&CRC32C.checksum(&stored).to_le_bytes());

    Ok(buf)
}

/// Verify and unframe a block, returning the uncompressed payload.
pub fn unframe(buf: &[u8], compression: Compression) -> Result<Vec<u8>> {
    check_remaining!(buf, FRAME_OVERHEAD, "block frame")?;

    let uncompressed_len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
    let compressed_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
    check_remaining!(buf, FRAME_OVERHEAD + compressed_len, "block payload")?;

    let payload = &buf[8..8 + compressed_len];
    let stored_crc = u32::from_le_bytes(
        buf[8 + compressed_len..FRAME_OVERHEAD + compressed_len]
            .try_into()
            .unwrap(),
    );
    let crc = CRC32C.checksum(payload);
    if crc != stored_crc {
        err_at!(Corruption, msg: "block crc {:x} != {:x}", crc, stored_crc)?;
    }

    if compressed_len == uncompressed_len {
        return Ok(payload.to_vec());
    }

    let data = match compression {
        Compression::None => {
            err_at!(Corruption, msg: "compressed block in uncompressed cfile")?
        }
        Compression::Zstd => {
            err_at!(Corruption, zstd::block::decompress(payload, uncompressed_len))?
        }
        Compression::Lzma => lzma_decompress(payload)?,
    };
    if data.len() != uncompressed_len {
        err_at!(
            Corruption, msg: "block inflates to {}/{}", data.len(), uncompressed_len
        )?;
    }

    Ok(data)
}

fn lzma_compress(payload: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut data = vec![];
    let mut encoder = xz2::read::XzEncoder::new(payload, 6);
    err_at!(IOError, encoder.read_to_end(&mut data))?;
    Ok(data)
}

fn lzma_decompress(payload: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut data = vec![];
    let mut decoder = xz2::read::XzDecoder::new(payload);
    err_at!(Corruption, decoder.read_to_end(&mut data))?;
    Ok(data)
}

#[cfg(test)]
#[path = "block_test.rs"]
mod block_test;
