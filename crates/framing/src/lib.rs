//! # Framing - low-level wire primitives
//!
//! The building blocks every on-disk structure in ZSS is framed with:
//!
//! - **uleb128**: unsigned little-endian base-128 varints with the
//!   continuation bit in the MSB. Encoding is always canonical
//!   (shortest form); the decoder rejects non-canonical input such as
//!   `80 00`, because two different byte sequences must never decode
//!   to the same framed value.
//! - **CRC-64/XZ**: the CRC used by the `.xz` file format
//!   (polynomial `0x42f0e1eba9ea3693`, reflected in/out, init and
//!   xor-out all-ones). Every block and the file header carry one.
//!
//! Fixed-width integers (u64le) are read and written with `byteorder`
//! at the call sites; this crate only owns the variable-length and
//! checksum pieces.

use crc::{Crc, CRC_64_XZ};
use std::io::{self, Read};
use thiserror::Error;

/// Size in bytes of an encoded CRC-64 value.
pub const CRC_LENGTH: usize = 8;

/// Maximum encoded size of a uleb128 carrying a 64-bit value.
pub const MAX_ULEB128_LEN: usize = 10;

const CRC64XZ: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Errors from the framing decoders.
///
/// All of these indicate input that cannot possibly have been produced
/// by the encoder; callers map them to their own format-error type.
#[derive(Debug, Error)]
pub enum FramingError {
    /// An underlying I/O error from a streaming source.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Input ended in the middle of a varint.
    #[error("truncated uleb128")]
    Truncated,

    /// A non-shortest encoding (trailing `0x80.. 0x00` padding).
    #[error("non-canonical uleb128")]
    NonCanonical,

    /// The encoded value does not fit in 64 bits.
    #[error("uleb128 value exceeds 64 bits")]
    Overflow,
}

/// Computes CRC-64/XZ over `data`.
///
/// Check value: `crc64xz(b"123456789") == 0x995d_c9bb_df19_39fa`.
#[must_use]
pub fn crc64xz(data: &[u8]) -> u64 {
    CRC64XZ.checksum(data)
}

/// Appends the canonical uleb128 encoding of `value` to `out`.
pub fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Returns the encoded length of `value` as a canonical uleb128.
#[must_use]
pub fn uleb128_len(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    (64 - value.leading_zeros() as usize).div_ceil(7)
}

/// Decodes one canonical uleb128 from the front of `buf`.
///
/// Returns `(value, bytes_consumed)`.
pub fn decode_uleb128(buf: &[u8]) -> Result<(u64, usize), FramingError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_ULEB128_LEN {
            return Err(FramingError::Overflow);
        }
        // The tenth byte may only carry bit 63.
        if i == MAX_ULEB128_LEN - 1 && byte > 0x01 {
            return Err(FramingError::Overflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if i > 0 && byte == 0 {
                return Err(FramingError::NonCanonical);
            }
            return Ok((value, i + 1));
        }
    }
    Err(FramingError::Truncated)
}

/// Reads one canonical uleb128 from a byte stream.
///
/// Returns `Ok(None)` on clean EOF before the first byte, so callers
/// scanning a sequence of framed items can detect the end; EOF in the
/// *middle* of a varint is [`FramingError::Truncated`].
pub fn read_uleb128<R: Read>(r: &mut R) -> Result<Option<(u64, usize)>, FramingError> {
    let mut value: u64 = 0;
    for i in 0.. {
        let b = match read_byte(r)? {
            Some(b) => b,
            None if i == 0 => return Ok(None),
            None => return Err(FramingError::Truncated),
        };
        if i >= MAX_ULEB128_LEN || (i == MAX_ULEB128_LEN - 1 && b > 0x01) {
            return Err(FramingError::Overflow);
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            if i > 0 && b == 0 {
                return Err(FramingError::NonCanonical);
            }
            return Ok(Some((value, i + 1)));
        }
    }
    unreachable!()
}

/// Reads a single byte, retrying on `Interrupted`; `None` at EOF.
fn read_byte<R: Read>(r: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
