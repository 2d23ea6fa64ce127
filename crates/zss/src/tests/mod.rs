use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use codec::Codec;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::block::{frame_block, pack_data_records, pack_index_entries, IndexEntry};
use crate::header::Header;
use crate::reader::{ReaderOptions, Zss};
use crate::writer::{WriterOptions, ZssWriter};
use crate::{Query, Result, MAGIC};

mod validate_tests;
mod writer_tests;

/// Writes `records` to a fresh file under `dir` and returns its path.
fn write_zss(
    dir: &TempDir,
    name: &str,
    records: &[impl AsRef<[u8]>],
    options: WriterOptions,
) -> PathBuf {
    let path = dir.path().join(name);
    let mut writer = ZssWriter::create(&path, options).unwrap();
    for record in records {
        writer.add_record(record.as_ref()).unwrap();
    }
    writer.finish().unwrap();
    path
}

fn options(codec: Codec, approx_block_size: usize) -> WriterOptions {
    WriterOptions {
        codec,
        approx_block_size,
        ..WriterOptions::default()
    }
}

fn open(path: &Path) -> Zss {
    Zss::open(path).unwrap()
}

fn open_serial(path: &Path) -> Zss {
    Zss::with_transport(
        Box::new(transport::FileTransport::open(path).unwrap()),
        ReaderOptions {
            parallelism: Some(0),
            ..ReaderOptions::default()
        },
    )
    .unwrap()
}

fn collect(z: &Zss, query: Query) -> Result<Vec<Vec<u8>>> {
    z.search(query)?.collect()
}

fn range(start: &[u8], stop: &[u8]) -> Query {
    Query::span(Some(start), Some(stop))
}

fn from(start: &[u8]) -> Query {
    Query {
        start: Some(start.to_vec()),
        ..Query::default()
    }
}

fn until(stop: &[u8]) -> Query {
    Query {
        stop: Some(stop.to_vec()),
        ..Query::default()
    }
}

fn records_of(z: &Zss) -> Vec<Vec<u8>> {
    collect(z, Query::everything()).unwrap()
}

/// Hand-assembles a complete file from pre-framed blocks, for
/// constructing deliberately broken trees the writer would refuse to
/// produce. `data_payloads` feeds the header SHA-256 (pass the
/// decompressed level-0 payloads in file order).
fn assemble_file(
    frames: &[Vec<u8>],
    data_payloads: &[Vec<u8>],
    root_offset: u64,
    root_length: u64,
    codec: Codec,
    sha_override: Option<[u8; 32]>,
) -> Vec<u8> {
    let body_len: usize = frames.iter().map(Vec::len).sum();
    let mut sha = Sha256::new();
    for payload in data_payloads {
        sha.update(payload);
    }
    let data_sha256 = sha_override.unwrap_or_else(|| sha.finalize().into());

    let mut header = Header {
        root_index_offset: root_offset,
        root_index_length: root_length,
        total_file_length: 0,
        data_sha256,
        codec,
        metadata: serde_json::Map::new(),
    };
    let encoded_len = header.encode().len();
    header.total_file_length = (16 + encoded_len + 8 + body_len) as u64;
    let encoded = header.encode();
    assert_eq!(encoded.len(), encoded_len);

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    let mut u64buf = [0u8; 8];
    LittleEndian::write_u64(&mut u64buf, encoded.len() as u64);
    out.extend_from_slice(&u64buf);
    out.extend_from_slice(&encoded);
    LittleEndian::write_u64(&mut u64buf, framing::crc64xz(&encoded));
    out.extend_from_slice(&u64buf);
    for frame in frames {
        out.extend_from_slice(frame);
    }
    out
}

/// A tiny two-leaf tree: data [a], data [b], root index over both.
/// Returns (frames, data_payloads, root_offset, root_length) with the
/// root entries produced by `make_root`.
fn two_leaf_tree(
    make_root: impl FnOnce(&[IndexEntry]) -> Vec<IndexEntry>,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>, u64, u64) {
    let payload_a = pack_data_records(&[b"a".to_vec()]);
    let payload_b = pack_data_records(&[b"b".to_vec()]);
    let frame_a = frame_block(0, &payload_a);
    let frame_b = frame_block(0, &payload_b);
    let off_b = frame_a.len() as u64;
    let entries = vec![
        IndexEntry {
            key: b"a".to_vec(),
            voffset: 0,
            length: frame_a.len() as u64,
        },
        IndexEntry {
            key: b"b".to_vec(),
            voffset: off_b,
            length: frame_b.len() as u64,
        },
    ];
    let root_entries = make_root(&entries);
    let root_payload = pack_index_entries(&root_entries);
    let root_frame = frame_block(1, &root_payload);
    let root_offset = off_b + frame_b.len() as u64;
    let root_length = root_frame.len() as u64;
    (
        vec![frame_a, frame_b, root_frame],
        vec![payload_a, payload_b],
        root_offset,
        root_length,
    )
}
