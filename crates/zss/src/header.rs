//! Magic numbers and the file header.
//!
//! The header sits between the 8-byte magic and the block body. Its
//! encoded form is length-prefixed and CRC-tagged so that a reader can
//! fetch it in one speculative range request and trust every field
//! before following any offset out of it.

use byteorder::{ByteOrder, LittleEndian};
use codec::Codec;
use framing::crc64xz;
use serde_json::Value;
use transport::Transport;

use crate::error::{Error, Result};

/// Magic prefix of a complete, valid file.
pub const MAGIC: [u8; 8] = [0x5a, 0x53, 0x53, 0x1c, 0x8e, 0x6c, 0x00, 0x01];

/// Magic prefix of a file still being written (or abandoned mid-write).
/// The first three bytes are rewritten `SSZ` → `ZSS` as the final act
/// of a successful `finish()`.
pub const INCOMPLETE_MAGIC: [u8; 8] = [0x53, 0x53, 0x5a, 0x1c, 0x8e, 0x6c, 0x00, 0x01];

/// How many bytes to read in the first request when opening a file.
/// Headers are almost always smaller than this, so slow transports
/// (HTTP) pay a single round-trip; when the metadata blob is larger we
/// fetch the remainder in a second request.
const HEADER_SIZE_GUESS: usize = 8192;

/// Refuse to allocate for absurd header lengths on corrupt input.
const MAX_HEADER_BYTES: u64 = 64 * 1024 * 1024;

/// Null-padded width of the codec name field.
const CODEC_FIELD_LEN: usize = 16;

/// Parsed file header. Read-only after open.
#[derive(Debug, Clone)]
pub struct Header {
    /// Voffset of the root index block.
    pub root_index_offset: u64,
    /// Full on-disk length of the root index block.
    pub root_index_length: u64,
    /// Total file length; must match the transport.
    pub total_file_length: u64,
    /// SHA-256 over all decompressed data payloads in file order.
    pub data_sha256: [u8; 32],
    /// Codec every block payload is compressed with.
    pub codec: Codec,
    /// Caller-supplied metadata; always a JSON object.
    pub metadata: serde_json::Map<String, Value>,
}

impl Header {
    /// Encodes the header fields (everything between the length field
    /// and the CRC).
    pub fn encode(&self) -> Vec<u8> {
        let metadata = Value::Object(self.metadata.clone()).to_string();
        let mut out = Vec::with_capacity(96 + metadata.len());
        let mut u64buf = [0u8; 8];

        for value in [
            self.root_index_offset,
            self.root_index_length,
            self.total_file_length,
        ] {
            LittleEndian::write_u64(&mut u64buf, value);
            out.extend_from_slice(&u64buf);
        }
        out.extend_from_slice(&self.data_sha256);

        let mut codec_field = [0u8; CODEC_FIELD_LEN];
        codec_field[..self.codec.name().len()].copy_from_slice(self.codec.name().as_bytes());
        out.extend_from_slice(&codec_field);

        LittleEndian::write_u64(&mut u64buf, metadata.len() as u64);
        out.extend_from_slice(&u64buf);
        out.extend_from_slice(metadata.as_bytes());
        out
    }

    /// Decodes header fields from their encoded form. Trailing bytes
    /// past the metadata are ignored (reserved for future fields; the
    /// header CRC still covers them).
    pub fn decode(encoded: &[u8]) -> Result<Header> {
        let mut cur = Cursor::new(encoded);
        let root_index_offset = cur.u64()?;
        let root_index_length = cur.u64()?;
        let total_file_length = cur.u64()?;

        let mut data_sha256 = [0u8; 32];
        data_sha256.copy_from_slice(cur.bytes(32)?);

        let codec_field = cur.bytes(CODEC_FIELD_LEN)?;
        let name_end = codec_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CODEC_FIELD_LEN);
        let name = std::str::from_utf8(&codec_field[..name_end])
            .map_err(|_| Error::bad_format("codec name is not ASCII"))?;
        let codec = Codec::from_name(name)
            .ok_or_else(|| Error::bad_format(format!("unrecognized codec {name:?}")))?;

        let metadata_len = cur.u64()?;
        if metadata_len > encoded.len() as u64 {
            return Err(Error::bad_format("metadata length exceeds header"));
        }
        let metadata_bytes = cur.bytes(metadata_len as usize)?;
        let metadata: Value = serde_json::from_slice(metadata_bytes)
            .map_err(|e| Error::bad_format(format!("bad metadata JSON: {e}")))?;
        let metadata = match metadata {
            Value::Object(map) => map,
            _ => return Err(Error::bad_format("metadata is not a JSON object")),
        };

        Ok(Header {
            root_index_offset,
            root_index_length,
            total_file_length,
            data_sha256,
            codec,
            metadata,
        })
    }
}

/// Reads and verifies magic + header from the start of a transport.
///
/// Returns the parsed header and `header_end`, the absolute offset of
/// voffset 0.
pub(crate) fn read_header(t: &dyn Transport) -> Result<(Header, u64)> {
    let chunk = t.read_at(0, HEADER_SIZE_GUESS)?;
    if chunk.len() < MAGIC.len() + 8 {
        return Err(Error::bad_format(format!(
            "{}: too small to be a ZSS file",
            t.name()
        )));
    }
    if chunk[..8] == INCOMPLETE_MAGIC {
        return Err(Error::corrupt(
            None,
            format!("{}: incomplete file (writer never finished)", t.name()),
        ));
    }
    if chunk[..8] != MAGIC {
        return Err(Error::bad_format(format!(
            "{}: bad magic number (not a ZSS file?)",
            t.name()
        )));
    }

    let header_len = LittleEndian::read_u64(&chunk[8..16]);
    if header_len > MAX_HEADER_BYTES {
        return Err(Error::bad_format(format!(
            "implausible header length {header_len}"
        )));
    }
    let needed = header_len as usize + framing::CRC_LENGTH;
    let header_end = 16 + needed as u64;

    let mut rest = chunk[16..].to_vec();
    if rest.len() < needed {
        let more = t.read_at(chunk.len() as u64, needed - rest.len())?;
        rest.extend_from_slice(&more);
    }
    if rest.len() < needed {
        return Err(Error::bad_format("truncated header"));
    }

    let encoded = &rest[..header_len as usize];
    let stored_crc = LittleEndian::read_u64(&rest[header_len as usize..needed]);
    if crc64xz(encoded) != stored_crc {
        return Err(Error::corrupt(None, "header CRC mismatch"));
    }

    Ok((Header::decode(encoded)?, header_end))
}

/// Minimal slice cursor; every short read is a truncated header.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::bad_format("truncated header"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }
}
