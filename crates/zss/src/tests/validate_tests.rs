use super::*;
use crate::error::Error;
use tempfile::tempdir;

fn write_raw(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn assert_validate_fails(path: &std::path::Path, needle: &str) {
    let z = open(path);
    let err = z.validate().unwrap_err();
    match err {
        Error::Corrupt { reason, .. } => {
            assert!(reason.contains(needle), "missing {needle:?} in: {reason}")
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn writer_output_validates_for_every_codec() {
    let dir = tempdir().unwrap();
    let records: Vec<Vec<u8>> = (0..300u32).map(|i| format!("r{i:04}").into_bytes()).collect();
    let refs: Vec<&[u8]> = records.iter().map(Vec::as_slice).collect();
    for codec in [Codec::None, Codec::Deflate, Codec::Bz2, Codec::Lzma] {
        let path = write_zss(
            &dir,
            &format!("ok-{}.zss", codec.name()),
            &refs,
            options(codec, 96),
        );
        open(&path).validate().unwrap();
        // The serial path exercises the same checks without the pool.
        open_serial(&path).validate().unwrap();
    }
}

#[test]
fn validates_duplicate_heavy_file() {
    let dir = tempdir().unwrap();
    let records: Vec<&[u8]> = std::iter::repeat(&b"x"[..]).take(1000).collect();
    let path = write_zss(&dir, "dups.zss", &records, options(Codec::None, 16));
    open(&path).validate().unwrap();
}

#[test]
fn hand_built_tree_validates() {
    let dir = tempdir().unwrap();
    let (frames, payloads, root_off, root_len) = two_leaf_tree(|entries| entries.to_vec());
    let bytes = assemble_file(&frames, &payloads, root_off, root_len, Codec::None, None);
    let path = write_raw(&dir, "ok.zss", &bytes);
    open(&path).validate().unwrap();
}

#[test]
fn detects_flipped_bit() {
    let dir = tempdir().unwrap();
    let path = write_zss(
        &dir,
        "flip.zss",
        &[b"aaa", b"mmm", b"zzz"],
        options(Codec::None, 1),
    );
    let mut bytes = std::fs::read(&path).unwrap();
    let pos = bytes
        .windows(3)
        .position(|w| w == b"mmm")
        .expect("record bytes present");
    bytes[pos] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();
    assert_validate_fails(&path, "block CRC");
}

#[test]
fn detects_swapped_child_offsets() {
    let dir = tempdir().unwrap();
    let (frames, payloads, root_off, root_len) = two_leaf_tree(|entries| {
        let mut swapped = entries.to_vec();
        swapped.swap(0, 1);
        // Keys back in order; offsets now point at the wrong children.
        let (first, rest) = swapped.split_at_mut(1);
        std::mem::swap(&mut first[0].key, &mut rest[0].key);
        swapped
    });
    let bytes = assemble_file(&frames, &payloads, root_off, root_len, Codec::None, None);
    let path = write_raw(&dir, "swapped.zss", &bytes);
    assert_validate_fails(&path, "unsorted offsets");
}

#[test]
fn detects_duplicate_reference() {
    let dir = tempdir().unwrap();
    let (frames, payloads, root_off, root_len) = two_leaf_tree(|entries| {
        let mut dup = entries[0].clone();
        dup.key = b"b".to_vec();
        vec![entries[0].clone(), dup]
    });
    let bytes = assemble_file(&frames, &payloads, root_off, root_len, Codec::None, None);
    let path = write_raw(&dir, "dupref.zss", &bytes);
    let z = open(&path);
    let err = z.validate().unwrap_err();
    match err {
        Error::Corrupt { reason, .. } => {
            assert!(reason.contains("dangling or multiple refs"), "{reason}");
            assert!(reason.contains("unreferenced block"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn detects_separator_key_above_child_first_record() {
    let dir = tempdir().unwrap();
    let (frames, payloads, root_off, root_len) = two_leaf_tree(|entries| {
        let mut bad = entries.to_vec();
        // Key claims the first child starts at "ab"; it starts at "a".
        bad[0].key = b"ab".to_vec();
        bad
    });
    let bytes = assemble_file(&frames, &payloads, root_off, root_len, Codec::None, None);
    let path = write_raw(&dir, "badkey.zss", &bytes);
    assert_validate_fails(&path, "too large");
}

#[test]
fn detects_wrong_recorded_child_length() {
    let dir = tempdir().unwrap();
    let (frames, payloads, root_off, root_len) = two_leaf_tree(|entries| {
        let mut bad = entries.to_vec();
        bad[1].length += 1;
        bad
    });
    let bytes = assemble_file(&frames, &payloads, root_off, root_len, Codec::None, None);
    let path = write_raw(&dir, "badlen.zss", &bytes);
    assert_validate_fails(&path, "index length");
}

#[test]
fn detects_level_skip() {
    let dir = tempdir().unwrap();
    // A level-2 root directly over level-0 leaves violates the
    // level-(n-1) child rule.
    let (frames, payloads, root_off, _) = two_leaf_tree(|entries| entries.to_vec());
    let root_payload = pack_index_entries(&[
        IndexEntry {
            key: b"a".to_vec(),
            voffset: 0,
            length: frames[0].len() as u64,
        },
        IndexEntry {
            key: b"b".to_vec(),
            voffset: frames[0].len() as u64,
            length: frames[1].len() as u64,
        },
    ]);
    let bad_root = frame_block(2, &root_payload);
    let frames = vec![frames[0].clone(), frames[1].clone(), bad_root.clone()];
    let bytes = assemble_file(
        &frames,
        &payloads,
        root_off,
        bad_root.len() as u64,
        Codec::None,
        None,
    );
    let path = write_raw(&dir, "skip.zss", &bytes);
    assert_validate_fails(&path, "bad index ref from level 2 to level 0");
}

#[test]
fn detects_wrong_root_length_in_header() {
    let dir = tempdir().unwrap();
    let (frames, payloads, root_off, root_len) = two_leaf_tree(|entries| entries.to_vec());
    let bytes = assemble_file(&frames, &payloads, root_off, root_len + 2, Codec::None, None);
    let path = write_raw(&dir, "rootlen.zss", &bytes);
    assert_validate_fails(&path, "wrong root index length");
}

#[test]
fn detects_unreferenced_block() {
    let dir = tempdir().unwrap();
    let (frames, payloads, root_off, root_len) = two_leaf_tree(|entries| {
        // Drop the second child from the root.
        vec![entries[0].clone()]
    });
    let bytes = assemble_file(&frames, &payloads, root_off, root_len, Codec::None, None);
    let path = write_raw(&dir, "unref.zss", &bytes);
    assert_validate_fails(&path, "unreferenced block");
}

#[test]
fn detects_data_hash_mismatch() {
    let dir = tempdir().unwrap();
    let (frames, payloads, root_off, root_len) = two_leaf_tree(|entries| entries.to_vec());
    let bytes = assemble_file(
        &frames,
        &payloads,
        root_off,
        root_len,
        Codec::None,
        Some([0u8; 32]),
    );
    let path = write_raw(&dir, "badsha.zss", &bytes);
    assert_validate_fails(&path, "data hash mismatch");
}

#[test]
fn detects_truncated_final_block() {
    let dir = tempdir().unwrap();
    let (mut frames, payloads, root_off, root_len) = two_leaf_tree(|entries| entries.to_vec());
    // Shear the tail off the root frame, keeping the header's recorded
    // total length consistent with the bytes on disk.
    if let Some(last) = frames.last_mut() {
        last.pop();
    }
    let bytes = assemble_file(&frames, &payloads, root_off, root_len, Codec::None, None);
    let path = write_raw(&dir, "shorted.zss", &bytes);
    assert_validate_fails(&path, "unexpected end of file");
}

#[test]
fn tolerates_unreferenced_extension_block() {
    let dir = tempdir().unwrap();
    let (frames, payloads, _, _) = two_leaf_tree(|entries| entries.to_vec());
    // Splice a reserved level-64 block between the leaves and the
    // root; the scan must CRC-check it but otherwise leave it out of
    // the tree accounting.
    let extension = frame_block(64, b"opaque future bytes");
    let off_ext = (frames[0].len() + frames[1].len()) as u64;
    let root_entries = vec![
        IndexEntry {
            key: b"a".to_vec(),
            voffset: 0,
            length: frames[0].len() as u64,
        },
        IndexEntry {
            key: b"b".to_vec(),
            voffset: frames[0].len() as u64,
            length: frames[1].len() as u64,
        },
    ];
    let root_frame = frame_block(1, &pack_index_entries(&root_entries));
    let root_off = off_ext + extension.len() as u64;
    let all = vec![
        frames[0].clone(),
        frames[1].clone(),
        extension,
        root_frame.clone(),
    ];
    let bytes = assemble_file(
        &all,
        &payloads,
        root_off,
        root_frame.len() as u64,
        Codec::None,
        None,
    );
    let path = write_raw(&dir, "ext.zss", &bytes);
    open(&path).validate().unwrap();
}

#[test]
fn rejects_reference_to_extension_block() {
    let dir = tempdir().unwrap();
    let data_payload = pack_data_records(&[b"a".to_vec()]);
    let data_frame = frame_block(0, &data_payload);
    let extension = frame_block(64, b"future");
    let off_ext = data_frame.len() as u64;
    // Root points at the extension block as if it were a child.
    let root_entries = vec![
        IndexEntry {
            key: b"a".to_vec(),
            voffset: 0,
            length: data_frame.len() as u64,
        },
        IndexEntry {
            key: b"z".to_vec(),
            voffset: off_ext,
            length: extension.len() as u64,
        },
    ];
    let root_frame = frame_block(1, &pack_index_entries(&root_entries));
    let root_off = off_ext + extension.len() as u64;
    let all = vec![data_frame, extension, root_frame.clone()];
    let bytes = assemble_file(
        &all,
        &[data_payload],
        root_off,
        root_frame.len() as u64,
        Codec::None,
        None,
    );
    let path = write_raw(&dir, "extref.zss", &bytes);

    // The linear-scan validator sees it as a dangling reference...
    assert_validate_fails(&path, "dangling or multiple refs");
    // ...and a traversing reader refuses to follow it.
    let z = open(&path);
    let err = collect(&z, from(b"z")).unwrap_err();
    assert!(
        matches!(err, Error::Corrupt { ref reason, .. } if reason.contains("reserved level")),
        "unexpected error: {err}"
    );
}

#[test]
fn rejects_non_utf8_metadata_at_open() {
    use byteorder::{ByteOrder, LittleEndian};
    let dir = tempdir().unwrap();

    // Hand-encode a header whose metadata bytes are not UTF-8; the
    // CRC is valid so only the metadata is at fault.
    let mut encoded = Vec::new();
    let mut u64buf = [0u8; 8];
    for value in [0u64, 0, 0] {
        LittleEndian::write_u64(&mut u64buf, value);
        encoded.extend_from_slice(&u64buf);
    }
    encoded.extend_from_slice(&[0u8; 32]); // sha256
    let mut codec_field = [0u8; 16];
    codec_field[..4].copy_from_slice(b"none");
    encoded.extend_from_slice(&codec_field);
    let metadata = [0xffu8, 0xfe, 0xfd];
    LittleEndian::write_u64(&mut u64buf, metadata.len() as u64);
    encoded.extend_from_slice(&u64buf);
    encoded.extend_from_slice(&metadata);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&MAGIC);
    LittleEndian::write_u64(&mut u64buf, encoded.len() as u64);
    bytes.extend_from_slice(&u64buf);
    bytes.extend_from_slice(&encoded);
    LittleEndian::write_u64(&mut u64buf, framing::crc64xz(&encoded));
    bytes.extend_from_slice(&u64buf);
    // A fixed-up total_file_length would need re-encoding; instead
    // leave total 0 and expect the metadata error to fire first, since
    // header decoding precedes the length cross-check.
    let path = write_raw(&dir, "badmeta.zss", &bytes);

    let err = Zss::open(&path).unwrap_err();
    assert!(
        matches!(err, Error::BadFormat(ref reason) if reason.contains("metadata")),
        "unexpected error: {err}"
    );
}
