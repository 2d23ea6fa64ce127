//! Block framing and payload packing.
//!
//! Every block on disk is `uleb128 payload_len ‖ level ‖ compressed
//! payload ‖ crc64`, where `payload_len` counts the level byte and the
//! CRC covers everything after the length varint. The decompressed
//! payload is either a run of length-prefixed records (level 0) or a
//! run of `(key, child_voffset, child_length)` entries (levels 1-63).

use byteorder::{ByteOrder, LittleEndian};
use codec::Codec;
use framing::{crc64xz, decode_uleb128, uleb128_len, write_uleb128, FramingError, CRC_LENGTH};
use transport::Transport;

use crate::error::{Error, Result};
use crate::FIRST_EXTENSION_LEVEL;

/// One entry of an index-block payload: the separator key and the
/// on-disk location of the child block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Separator key; at most the first record of the child's span.
    pub key: Vec<u8>,
    /// Child voffset.
    pub voffset: u64,
    /// Child's full on-disk length (length varint through CRC).
    pub length: u64,
}

/// Frames a compressed payload into its on-disk form.
pub fn frame_block(level: u8, zpayload: &[u8]) -> Vec<u8> {
    let payload_len = zpayload.len() as u64 + 1;
    let mut out = Vec::with_capacity(uleb128_len(payload_len) + zpayload.len() + 1 + CRC_LENGTH);
    write_uleb128(&mut out, payload_len);
    let body_start = out.len();
    out.push(level);
    out.extend_from_slice(zpayload);
    let crc = crc64xz(&out[body_start..]);
    let mut crc_buf = [0u8; 8];
    LittleEndian::write_u64(&mut crc_buf, crc);
    out.extend_from_slice(&crc_buf);
    out
}

/// Checks the framing of a complete raw block and returns its level
/// and the still-compressed payload.
pub fn parse_frame(raw: &[u8], voffset: u64) -> Result<(u8, &[u8])> {
    let (payload_len, len_bytes) = match decode_uleb128(raw) {
        Ok(v) => v,
        Err(FramingError::Truncated) => {
            return Err(Error::corrupt(voffset, "unexpected end of block"))
        }
        Err(e) => return Err(e.into()),
    };
    let expected = (len_bytes as u64)
        .checked_add(payload_len)
        .and_then(|v| v.checked_add(CRC_LENGTH as u64));
    if expected != Some(raw.len() as u64) {
        return Err(Error::corrupt(voffset, "block length mismatch"));
    }
    if payload_len == 0 {
        return Err(Error::corrupt(voffset, "block has no level byte"));
    }
    let body = &raw[len_bytes..raw.len() - CRC_LENGTH];
    let stored_crc = LittleEndian::read_u64(&raw[raw.len() - CRC_LENGTH..]);
    if crc64xz(body) != stored_crc {
        return Err(Error::corrupt(voffset, "block CRC mismatch"));
    }
    Ok((body[0], &body[1..]))
}

/// Fetches, checks and decompresses the block at `voffset`.
///
/// This is the one path every traversal read goes through: fetch the
/// exact on-disk range, verify the frame and CRC, refuse reserved
/// extension levels, then decode with the file's codec.
pub fn read_block(
    transport: &dyn Transport,
    header_end: u64,
    voffset: u64,
    length: u64,
    codec: Codec,
) -> Result<(u8, Vec<u8>)> {
    let raw = transport.read_at(header_end + voffset, length as usize)?;
    if raw.len() as u64 != length {
        return Err(Error::corrupt(voffset, "unexpected end of file"));
    }
    let (level, zpayload) = parse_frame(&raw, voffset)?;
    if level >= FIRST_EXTENSION_LEVEL {
        return Err(Error::corrupt(
            voffset,
            format!("reference to reserved level-{level} block"),
        ));
    }
    let payload = codec
        .decode(zpayload)
        .map_err(|e| Error::corrupt(voffset, format!("bad compressed payload: {e}")))?;
    Ok((level, payload))
}

/// Encoded size a record contributes to a data-block payload.
#[must_use]
pub fn record_encoded_len(record: &[u8]) -> usize {
    uleb128_len(record.len() as u64) + record.len()
}

/// Encoded size an entry contributes to an index-block payload.
#[must_use]
pub fn index_entry_encoded_len(entry: &IndexEntry) -> usize {
    uleb128_len(entry.key.len() as u64)
        + entry.key.len()
        + uleb128_len(entry.voffset)
        + uleb128_len(entry.length)
}

/// Packs records into a data-block payload.
pub fn pack_data_records(records: &[Vec<u8>]) -> Vec<u8> {
    let size: usize = records.iter().map(|r| record_encoded_len(r)).sum();
    let mut out = Vec::with_capacity(size);
    for record in records {
        write_uleb128(&mut out, record.len() as u64);
        out.extend_from_slice(record);
    }
    out
}

/// Unpacks a data-block payload into records.
///
/// A valid payload holds at least one record and ends exactly at a
/// record boundary.
pub fn unpack_data_records(payload: &[u8], voffset: u64) -> Result<Vec<Vec<u8>>> {
    let mut records = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let (len, used) = uleb_in_payload(rest, voffset)?;
        rest = &rest[used..];
        if rest.len() < len as usize {
            return Err(Error::corrupt(voffset, "truncated record in data block"));
        }
        records.push(rest[..len as usize].to_vec());
        rest = &rest[len as usize..];
    }
    if records.is_empty() {
        return Err(Error::corrupt(voffset, "empty data block"));
    }
    Ok(records)
}

/// Packs index entries into an index-block payload.
pub fn pack_index_entries(entries: &[IndexEntry]) -> Vec<u8> {
    let size: usize = entries.iter().map(index_entry_encoded_len).sum();
    let mut out = Vec::with_capacity(size);
    for entry in entries {
        write_uleb128(&mut out, entry.key.len() as u64);
        out.extend_from_slice(&entry.key);
        write_uleb128(&mut out, entry.voffset);
        write_uleb128(&mut out, entry.length);
    }
    out
}

/// Unpacks an index-block payload into entries.
pub fn unpack_index_entries(payload: &[u8], voffset: u64) -> Result<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let (key_len, used) = uleb_in_payload(rest, voffset)?;
        rest = &rest[used..];
        if rest.len() < key_len as usize {
            return Err(Error::corrupt(voffset, "truncated key in index block"));
        }
        let key = rest[..key_len as usize].to_vec();
        rest = &rest[key_len as usize..];
        let (child_voffset, used) = uleb_in_payload(rest, voffset)?;
        rest = &rest[used..];
        let (child_length, used) = uleb_in_payload(rest, voffset)?;
        rest = &rest[used..];
        entries.push(IndexEntry {
            key,
            voffset: child_voffset,
            length: child_length,
        });
    }
    if entries.is_empty() {
        return Err(Error::corrupt(voffset, "empty index block"));
    }
    Ok(entries)
}

/// Varint decode inside a payload: truncation is corruption of this
/// block, non-canonical encodings are a format violation.
fn uleb_in_payload(buf: &[u8], voffset: u64) -> Result<(u64, usize)> {
    match decode_uleb128(buf) {
        Ok(v) => Ok(v),
        Err(FramingError::Truncated) => {
            Err(Error::corrupt(voffset, "truncated varint in block payload"))
        }
        Err(e) => Err(e.into()),
    }
}
