//! Exhaustive integrity checking.
//!
//! `validate` re-reads the whole file once, front to back, checking
//! every framing rule and every structural invariant: block CRCs,
//! record order inside and across blocks, index key bounds, the
//! exactly-once reference discipline of the tree, recorded block
//! lengths, and finally the header's SHA-256 over all decompressed
//! data payloads. Invariant violations are collected with their
//! offsets and reported together; framing damage that makes further
//! scanning meaningless aborts immediately.

use std::collections::BTreeMap;
use std::io::Read;

use codec::Codec;
use framing::FramingError;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::block;
use crate::error::{Error, Result};
use crate::pool::Ordered;
use crate::reader::Zss;
use crate::FIRST_EXTENSION_LEVEL;

/// A scanned block, as produced by a decompression worker.
enum Scanned {
    /// A level-0..63 block, decoded.
    Block {
        voffset: u64,
        total_length: u64,
        level: u8,
        payload: Vec<u8>,
    },
    /// A reserved extension block: CRC checked, otherwise ignored.
    Extension,
}

/// A block awaiting a parent reference during the linear scan.
struct UnrefBlock {
    level: u8,
    first_record: Option<Vec<u8>>,
    last_record: Option<Vec<u8>>,
    total_length: u64,
}

impl Zss {
    /// Validates the file against every format invariant.
    ///
    /// Reads and decompresses the entire file; on failure the error
    /// lists every violation found with its body offset.
    pub fn validate(&self) -> Result<()> {
        self.check_closed()?;
        let mut failures: Vec<(u64, String)> = Vec::new();
        let mut unref: BTreeMap<u64, UnrefBlock> = BTreeMap::new();
        let mut sha = Sha256::new();

        let mut stream = self.transport.stream_from(self.header_end)?;
        let mut ordered: Ordered<Result<Scanned>> = Ordered::new();
        let window = 3 * self.parallelism.max(1);
        let mut next_voffset = 0u64;
        let mut done_reading = false;

        loop {
            // Serial IO in this thread; CRC + decompress on the pool.
            while !done_reading && ordered.in_flight() < window {
                match read_raw_frame(&mut stream, next_voffset)? {
                    None => {
                        done_reading = true;
                    }
                    Some(frame) => {
                        let voffset = next_voffset;
                        next_voffset += frame.len() as u64;
                        let codec = self.header.codec;
                        let accepted = ordered
                            .submit(self.pool.as_deref(), move || {
                                check_frame(frame, voffset, codec)
                            });
                        if !accepted {
                            return Err(Error::Cancelled);
                        }
                    }
                }
            }

            match ordered.next(&self.closed)? {
                Some(scanned) => match scanned? {
                    Scanned::Extension => {}
                    Scanned::Block {
                        voffset,
                        total_length,
                        level,
                        payload,
                    } => self.scan_block(
                        voffset,
                        total_length,
                        level,
                        &payload,
                        &mut sha,
                        &mut unref,
                        &mut failures,
                    )?,
                },
                None if done_reading => break,
                None => {}
            }
        }

        self.check_root(&mut unref, &mut failures);
        for (&voffset, _) in unref.iter() {
            failures.push((voffset, "unreferenced block".to_string()));
        }

        let digest: [u8; 32] = sha.finalize().into();
        if digest != self.header.data_sha256 {
            failures.push((
                0,
                format!(
                    "data hash mismatch: header says {}, found {}",
                    hex(&self.header.data_sha256),
                    hex(&digest)
                ),
            ));
        }

        if failures.is_empty() {
            debug!(name = self.name(), "validation passed");
            Ok(())
        } else {
            let mut message = String::from("integrity check failed:");
            for (voffset, reason) in &failures {
                message.push_str(&format!("\n  offset {voffset}: {reason}"));
            }
            Err(Error::corrupt(None, message))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_block(
        &self,
        voffset: u64,
        total_length: u64,
        level: u8,
        payload: &[u8],
        sha: &mut Sha256,
        unref: &mut BTreeMap<u64, UnrefBlock>,
        failures: &mut Vec<(u64, String)>,
    ) -> Result<()> {
        if level == 0 {
            sha.update(payload);
            let records = block::unpack_data_records(payload, voffset)?;
            if records.windows(2).any(|pair| pair[1] < pair[0]) {
                failures.push((voffset, "unsorted records within data block".to_string()));
            }
            unref.insert(
                voffset,
                UnrefBlock {
                    level,
                    first_record: records.first().cloned(),
                    last_record: records.last().cloned(),
                    total_length,
                },
            );
        } else {
            let entries = block::unpack_index_entries(payload, voffset)?;
            if entries.windows(2).any(|pair| pair[1].key < pair[0].key) {
                failures.push((voffset, "unsorted keys within index block".to_string()));
            }
            if entries.windows(2).any(|pair| pair[1].voffset < pair[0].voffset) {
                failures.push((voffset, "unsorted offsets in index block".to_string()));
            }
            let mut summary = check_index(voffset, level, &entries, unref, failures);
            summary.total_length = total_length;
            unref.insert(voffset, summary);
        }
        Ok(())
    }

    fn check_root(
        &self,
        unref: &mut BTreeMap<u64, UnrefBlock>,
        failures: &mut Vec<(u64, String)>,
    ) {
        let root_offset = self.header.root_index_offset;
        match unref.remove(&root_offset) {
            None => {
                failures.push((
                    root_offset,
                    "root block missing or doubly-referenced".to_string(),
                ));
            }
            Some(root) => {
                if root.level == 0 || root.level >= FIRST_EXTENSION_LEVEL {
                    failures.push((root_offset, format!("root index has bad level {}", root.level)));
                }
                if root.total_length != self.header.root_index_length {
                    failures.push((
                        root_offset,
                        format!(
                            "wrong root index length in header ({} != {})",
                            self.header.root_index_length, root.total_length
                        ),
                    ));
                }
            }
        }
    }
}

/// Walks an index block's entries, consuming each referenced child
/// from `unref` exactly once and checking invariants 4-6 against it.
fn check_index(
    voffset: u64,
    level: u8,
    entries: &[block::IndexEntry],
    unref: &mut BTreeMap<u64, UnrefBlock>,
    failures: &mut Vec<(u64, String)>,
) -> UnrefBlock {
    let mut first_record: Option<Vec<u8>> = None;
    let mut last_record: Option<Vec<u8>> = None;
    for entry in entries {
        let Some(child) = unref.remove(&entry.voffset) else {
            failures.push((
                voffset,
                format!("dangling or multiple refs to {}", entry.voffset),
            ));
            continue;
        };
        if first_record.is_none() {
            first_record.clone_from(&child.first_record);
        }
        if child.level != level - 1 {
            failures.push((
                voffset,
                format!("bad index ref from level {level} to level {}", child.level),
            ));
        }
        if let Some(last) = &last_record {
            if entry.key < *last {
                failures.push((
                    voffset,
                    format!(
                        "key {:?} is too small for block at {}",
                        String::from_utf8_lossy(&entry.key),
                        entry.voffset
                    ),
                ));
            }
        }
        if let Some(child_first) = &child.first_record {
            if entry.key > *child_first {
                failures.push((
                    voffset,
                    format!(
                        "key {:?} is too large for block at {}",
                        String::from_utf8_lossy(&entry.key),
                        entry.voffset
                    ),
                ));
            }
        }
        if child.total_length != entry.length {
            failures.push((
                voffset,
                format!(
                    "index length {} != actual length {} for block at {}",
                    entry.length, child.total_length, entry.voffset
                ),
            ));
        }
        last_record = child.last_record;
    }
    UnrefBlock {
        level,
        first_record,
        last_record,
        // the caller records the block's own on-disk length
        total_length: 0,
    }
}

/// Refuse to allocate for absurd block lengths on corrupt input.
const MAX_BLOCK_BYTES: u64 = 1 << 30;

/// Reads one complete raw frame (length varint included) from the
/// body stream. `None` at clean EOF.
fn read_raw_frame<R: Read>(stream: &mut R, voffset: u64) -> Result<Option<Vec<u8>>> {
    let (payload_len, _) = match framing::read_uleb128(stream) {
        Ok(None) => return Ok(None),
        Ok(Some(v)) => v,
        Err(FramingError::Truncated) => {
            return Err(Error::corrupt(voffset, "unexpected end of file"))
        }
        Err(e) => return Err(e.into()),
    };
    if payload_len > MAX_BLOCK_BYTES {
        return Err(Error::corrupt(
            voffset,
            format!("implausible block length {payload_len}"),
        ));
    }
    let body_len = payload_len as usize + framing::CRC_LENGTH;
    let mut frame = Vec::with_capacity(framing::uleb128_len(payload_len) + body_len);
    framing::write_uleb128(&mut frame, payload_len);
    let start = frame.len();
    frame.resize(start + body_len, 0);
    if let Err(e) = stream.read_exact(&mut frame[start..]) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(Error::corrupt(voffset, "unexpected end of file"));
        }
        return Err(Error::Io(e));
    }
    Ok(Some(frame))
}

/// Worker half of the scan: verify framing and CRC, decode.
fn check_frame(frame: Vec<u8>, voffset: u64, codec: Codec) -> Result<Scanned> {
    let (level, zpayload) = block::parse_frame(&frame, voffset)?;
    if level >= FIRST_EXTENSION_LEVEL {
        return Ok(Scanned::Extension);
    }
    let payload = codec
        .decode(zpayload)
        .map_err(|e| Error::corrupt(voffset, format!("bad compressed payload: {e}")))?;
    Ok(Scanned::Block {
        voffset,
        total_length: frame.len() as u64,
        level,
        payload,
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
