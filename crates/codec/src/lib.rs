//! # Codec - named block compression schemes
//!
//! A ZSS file names its compression scheme once, in the header, as a
//! null-padded 16-byte ASCII string; every block payload in the file
//! is then encoded with that one scheme. Four codecs are defined:
//!
//! | name      | encoding                                          |
//! |-----------|---------------------------------------------------|
//! | `none`    | identity                                          |
//! | `deflate` | raw deflate, RFC 1951 (no zlib/gzip framing)      |
//! | `bz2`     | bzip2 stream (carries 10-20 bytes of own framing) |
//! | `lzma`    | XZ stream                                         |
//!
//! Deflate is used raw because blocks already carry a CRC-64 of their
//! own; the zlib header and Adler-32 trailer would be dead weight.
//! bzip2 has no raw mode, so its double-checksum is an accepted cost.

use std::io::{Read, Write};
use thiserror::Error;

/// Default deflate compression level (same as zlib's default).
const DEFLATE_LEVEL: u32 = 6;
/// Default bzip2 compression level (block size 900k).
const BZ2_LEVEL: u32 = 9;
/// Default XZ preset.
const LZMA_PRESET: u32 = 6;

/// Errors from encoding or decoding a block payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The compressed stream is malformed or truncated.
    #[error("codec error: {0}")]
    Io(#[from] std::io::Error),

    /// Bytes follow the end of the compressed stream.
    #[error("trailing garbage after compressed stream")]
    TrailingGarbage,
}

/// A block compression scheme, identified by its header name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    Deflate,
    Bz2,
    Lzma,
}

impl Codec {
    /// Looks up a codec by its header name. Unknown names return `None`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Codec> {
        match name {
            "none" => Some(Codec::None),
            "deflate" => Some(Codec::Deflate),
            "bz2" => Some(Codec::Bz2),
            "lzma" => Some(Codec::Lzma),
            _ => None,
        }
    }

    /// The name stored in the file header.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Deflate => "deflate",
            Codec::Bz2 => "bz2",
            Codec::Lzma => "lzma",
        }
    }

    /// Compresses `payload` into a self-contained stream.
    pub fn encode(self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::None => Ok(payload.to_vec()),
            Codec::Deflate => {
                let mut enc = flate2::write::DeflateEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(DEFLATE_LEVEL),
                );
                enc.write_all(payload)?;
                Ok(enc.finish()?)
            }
            Codec::Bz2 => {
                let mut enc =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(BZ2_LEVEL));
                enc.write_all(payload)?;
                Ok(enc.finish()?)
            }
            Codec::Lzma => {
                let mut enc = xz2::write::XzEncoder::new(Vec::new(), LZMA_PRESET);
                enc.write_all(payload)?;
                Ok(enc.finish()?)
            }
        }
    }

    /// Decompresses a stream produced by [`encode`](Codec::encode).
    ///
    /// The whole input must be consumed; bytes past the end of the
    /// compressed stream fail with [`CodecError::TrailingGarbage`].
    pub fn decode(self, zpayload: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::None => Ok(zpayload.to_vec()),
            Codec::Deflate => {
                let mut dec = flate2::bufread::DeflateDecoder::new(zpayload);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)?;
                if dec.total_in() != zpayload.len() as u64 {
                    return Err(CodecError::TrailingGarbage);
                }
                Ok(out)
            }
            Codec::Bz2 => {
                let mut dec = bzip2::bufread::BzDecoder::new(zpayload);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)?;
                if dec.total_in() != zpayload.len() as u64 {
                    return Err(CodecError::TrailingGarbage);
                }
                Ok(out)
            }
            Codec::Lzma => {
                let mut dec = xz2::bufread::XzDecoder::new(zpayload);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)?;
                if dec.total_in() != zpayload.len() as u64 {
                    return Err(CodecError::TrailingGarbage);
                }
                Ok(out)
            }
        }
    }
}
