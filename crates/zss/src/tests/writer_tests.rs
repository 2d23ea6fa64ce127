use super::*;
use crate::error::Error;
use crate::INCOMPLETE_MAGIC;
use tempfile::tempdir;

#[test]
fn rejects_unsorted_records() {
    let dir = tempdir().unwrap();
    let mut writer =
        ZssWriter::create(dir.path().join("unsorted.zss"), options(Codec::None, 64)).unwrap();
    writer.add_record(b"banana").unwrap();
    let err = writer.add_record(b"apple").unwrap_err();
    match err {
        Error::BadUsage(reason) => {
            // The first out-of-order pair is named.
            assert!(reason.contains("banana"), "{reason}");
            assert!(reason.contains("apple"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn accepts_duplicates() {
    let dir = tempdir().unwrap();
    let path = write_zss(&dir, "dup.zss", &[b"a", b"a", b"a"], options(Codec::None, 64));
    let z = open(&path);
    assert_eq!(records_of(&z).len(), 3);
}

#[test]
fn empty_input_is_bad_usage() {
    let dir = tempdir().unwrap();
    let writer = ZssWriter::create(dir.path().join("empty.zss"), options(Codec::None, 64)).unwrap();
    let err = writer.finish().unwrap_err();
    assert!(matches!(err, Error::BadUsage(_)), "unexpected error: {err}");
}

#[test]
fn refuses_to_overwrite() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("exists.zss");
    std::fs::write(&path, b"already here").unwrap();
    assert!(matches!(
        ZssWriter::create(&path, options(Codec::None, 64)),
        Err(Error::Io(_))
    ));
}

#[test]
fn add_data_block_controls_blocking() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("packed.zss");
    let mut writer = ZssWriter::create(&path, options(Codec::None, 1 << 20)).unwrap();
    // Despite the huge approx_block_size, caller-packed blocks land
    // as-is: three blocks of one record each.
    writer.add_data_block(vec![b"a".to_vec()]).unwrap();
    writer.add_data_block(vec![b"b".to_vec()]).unwrap();
    writer.add_data_block(vec![b"c".to_vec()]).unwrap();
    writer.add_data_block(vec![]).unwrap(); // no-op
    writer.finish().unwrap();

    let z = open(&path);
    let per_block: Vec<usize> = z
        .block_map(|records| records.len(), Query::everything())
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(per_block, vec![1, 1, 1]);
}

#[test]
fn add_data_block_enforces_order() {
    let dir = tempdir().unwrap();
    let mut writer =
        ZssWriter::create(dir.path().join("order.zss"), options(Codec::None, 64)).unwrap();
    // Unsorted inside the block.
    let err = writer
        .add_data_block(vec![b"b".to_vec(), b"a".to_vec()])
        .unwrap_err();
    assert!(matches!(err, Error::BadUsage(_)));
}

#[test]
fn add_data_block_enforces_order_across_calls() {
    let dir = tempdir().unwrap();
    let mut writer =
        ZssWriter::create(dir.path().join("across.zss"), options(Codec::None, 64)).unwrap();
    writer.add_record(b"m").unwrap();
    let err = writer.add_data_block(vec![b"a".to_vec()]).unwrap_err();
    assert!(matches!(err, Error::BadUsage(_)));
}

#[test]
fn mixed_record_and_block_input_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mixed.zss");
    let mut writer = ZssWriter::create(&path, options(Codec::Deflate, 32)).unwrap();
    writer.add_record(b"aa").unwrap();
    writer.add_record(b"ab").unwrap();
    writer
        .add_data_block(vec![b"ba".to_vec(), b"bb".to_vec()])
        .unwrap();
    writer.add_record(b"ca").unwrap();
    writer.finish().unwrap();

    let z = open(&path);
    assert_eq!(
        records_of(&z),
        vec![
            b"aa".to_vec(),
            b"ab".to_vec(),
            b"ba".to_vec(),
            b"bb".to_vec(),
            b"ca".to_vec()
        ]
    );
}

#[test]
fn close_without_finish_leaves_incomplete_magic() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("abandoned.zss");
    let mut writer = ZssWriter::create(&path, options(Codec::None, 64)).unwrap();
    writer.add_record(b"doomed").unwrap();
    writer.close();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..8], &INCOMPLETE_MAGIC);
    let err = Zss::open(&path).unwrap_err();
    assert!(
        matches!(err, Error::Corrupt { ref reason, .. } if reason.contains("incomplete")),
        "unexpected error: {err}"
    );
}

#[test]
fn drop_without_finish_leaves_incomplete_magic() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dropped.zss");
    {
        let mut writer = ZssWriter::create(&path, options(Codec::None, 64)).unwrap();
        writer.add_record(b"doomed").unwrap();
    }
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..8], &INCOMPLETE_MAGIC);
}

#[test]
fn write_after_close_is_bad_usage() {
    let dir = tempdir().unwrap();
    let mut writer =
        ZssWriter::create(dir.path().join("closed.zss"), options(Codec::None, 64)).unwrap();
    writer.close();
    writer.close(); // idempotent
    let err = writer.add_record(b"late").unwrap_err();
    assert!(matches!(err, Error::BadUsage(_)));
}

#[test]
fn good_magic_appears_only_after_finish() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flip.zss");
    let mut writer = ZssWriter::create(&path, options(Codec::None, 64)).unwrap();
    writer.add_record(b"r").unwrap();

    // Mid-write the file must carry the incomplete magic.
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..8], &INCOMPLETE_MAGIC);

    writer.finish().unwrap();
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..8], &MAGIC);
}

#[test]
fn single_record_file_still_has_index_root() {
    let dir = tempdir().unwrap();
    let path = write_zss(&dir, "one.zss", &[b"only"], options(Codec::None, 64));
    let z = open(&path);
    assert_eq!(z.root_index_level().unwrap(), 1);
    assert_eq!(records_of(&z), vec![b"only".to_vec()]);
    z.validate().unwrap();
}

#[test]
fn large_input_builds_multi_level_tree() {
    let dir = tempdir().unwrap();
    let records: Vec<Vec<u8>> = (0..5000u32).map(|i| format!("{i:08}").into_bytes()).collect();
    let refs: Vec<&[u8]> = records.iter().map(Vec::as_slice).collect();
    let path = write_zss(&dir, "deep.zss", &refs, options(Codec::None, 64));
    let z = open(&path);

    assert!(z.root_index_level().unwrap() >= 2, "tree should be deep");
    assert_eq!(records_of(&z), records);
    assert_eq!(
        collect(&z, Query::prefix(b"0000123")).unwrap(),
        vec![b"00001230".to_vec(), b"00001231".to_vec(), b"00001232".to_vec(),
             b"00001233".to_vec(), b"00001234".to_vec(), b"00001235".to_vec(),
             b"00001236".to_vec(), b"00001237".to_vec(), b"00001238".to_vec(),
             b"00001239".to_vec()]
    );
    z.validate().unwrap();
}

#[test]
fn oversized_single_record_gets_own_block() {
    let dir = tempdir().unwrap();
    let big = vec![b'b'; 10_000];
    let mut records: Vec<&[u8]> = vec![b"a"];
    records.push(&big);
    records.push(b"c");
    let path = write_zss(&dir, "big.zss", &records, options(Codec::Deflate, 64));
    let z = open(&path);
    assert_eq!(
        records_of(&z),
        vec![b"a".to_vec(), big.clone(), b"c".to_vec()]
    );
    z.validate().unwrap();
}
