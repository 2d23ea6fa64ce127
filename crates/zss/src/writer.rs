//! Writer engine: pipelined bottom-up construction of a ZSS file.
//!
//! ```text
//! caller ──> packer ──> compressor pool ──> appender ──> file
//!            (order      (pack + codec +     (reorder by seq,
//!             check,      CRC framing,        SHA-256 feed,
//!             bucketing)  pure workers)       index levels)
//! ```
//!
//! The appender is the only thread that touches the output file body
//! and the index level buffers, so on-disk order is deterministic:
//! data blocks in input order, each index level as it fills, the root
//! block last. The header is rewritten and the magic flipped to the
//! good value only after everything below it is synced, so a crash at
//! any earlier point leaves a file every reader rejects.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use byteorder::{ByteOrder, LittleEndian};
use codec::Codec;
use framing::crc64xz;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::block::{self, IndexEntry};
use crate::error::{Error, Result};
use crate::header::{Header, INCOMPLETE_MAGIC, MAGIC};
use crate::pool::effective_parallelism;
use crate::FIRST_EXTENSION_LEVEL;

/// Default target for a block's encoded payload size, before
/// compression. Not a hard limit: a single over-sized record still
/// becomes one block.
pub const DEFAULT_APPROX_BLOCK_SIZE: usize = 384 * 1024;

/// Settings for a [`ZssWriter`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Codec for every block payload.
    pub codec: Codec,
    /// Target encoded payload size per block.
    pub approx_block_size: usize,
    /// Compression worker threads. `None` = one per CPU.
    pub parallelism: Option<usize>,
    /// Arbitrary caller metadata stored in the header.
    pub metadata: serde_json::Map<String, Value>,
}

impl Default for WriterOptions {
    fn default() -> WriterOptions {
        WriterOptions {
            codec: Codec::Bz2,
            approx_block_size: DEFAULT_APPROX_BLOCK_SIZE,
            parallelism: None,
            metadata: serde_json::Map::new(),
        }
    }
}

struct CompressJob {
    seq: u64,
    records: Vec<Vec<u8>>,
}

struct CompressedBlock {
    seq: u64,
    /// First record; becomes the index key for this block.
    first: Vec<u8>,
    /// Uncompressed payload, fed to the SHA-256 in file order.
    payload: Vec<u8>,
    /// Complete on-disk frame (length varint through CRC).
    framed: Vec<u8>,
}

struct BuildOutcome {
    root_offset: u64,
    root_length: u64,
    data_sha256: [u8; 32],
    blocks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Writing,
    Closed,
}

/// Writes a new ZSS file from a sorted record stream.
///
/// Records must arrive in non-decreasing byte order (duplicates are
/// fine — the container is a multiset); anything else fails
/// `BadUsage` naming the offending pair. Call [`finish`](ZssWriter::finish)
/// to produce a valid file; a writer that is dropped or
/// [`close`](ZssWriter::close)d early leaves the incomplete magic in
/// place so readers reject the file.
pub struct ZssWriter {
    path: PathBuf,
    file: Option<File>,
    header: Header,
    encoded_header_len: usize,
    approx_block_size: usize,
    state: State,
    buf: Vec<Vec<u8>>,
    buf_size: usize,
    last_record: Option<Vec<u8>>,
    next_seq: u64,
    jobs: Option<SyncSender<CompressJob>>,
    compressors: Vec<JoinHandle<()>>,
    appender: Option<JoinHandle<Result<BuildOutcome>>>,
    abort: Arc<AtomicBool>,
}

impl ZssWriter {
    /// Creates `path` (which must not exist) and starts the pipeline.
    pub fn create<P: AsRef<Path>>(path: P, options: WriterOptions) -> Result<ZssWriter> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        // Write the incomplete magic and a placeholder header now; the
        // real field values replace them in finish(). The metadata is
        // serialized here, so the encoded length is already final.
        let header = Header {
            root_index_offset: 0,
            root_index_length: 0,
            total_file_length: 0,
            data_sha256: [0u8; 32],
            codec: options.codec,
            metadata: options.metadata,
        };
        let encoded = header.encode();
        let mut u64buf = [0u8; 8];
        LittleEndian::write_u64(&mut u64buf, encoded.len() as u64);
        file.write_all(&INCOMPLETE_MAGIC)?;
        file.write_all(&u64buf)?;
        file.write_all(&encoded)?;
        file.write_all(&[0u8; framing::CRC_LENGTH])?;
        file.flush()?;

        let parallelism = effective_parallelism(options.parallelism).max(1);
        let (jobs_tx, jobs_rx) = sync_channel::<CompressJob>(2 * parallelism);
        let (done_tx, done_rx) = sync_channel::<Result<CompressedBlock>>(2 * parallelism);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let mut compressors = Vec::with_capacity(parallelism);
        for i in 0..parallelism {
            let jobs_rx = Arc::clone(&jobs_rx);
            let done_tx = done_tx.clone();
            let codec = options.codec;
            let handle = std::thread::Builder::new()
                .name(format!("zss-compress-{i}"))
                .spawn(move || compress_worker(codec, &jobs_rx, &done_tx))?;
            compressors.push(handle);
        }
        // The appender learns the stream is over when every
        // compressor's sender is gone; drop the template now.
        drop(done_tx);

        let append_file = OpenOptions::new().append(true).open(&path)?;
        let abort = Arc::new(AtomicBool::new(false));
        let appender = {
            let codec = options.codec;
            let approx_block_size = options.approx_block_size;
            let abort = Arc::clone(&abort);
            std::thread::Builder::new()
                .name("zss-append".to_string())
                .spawn(move || run_appender(append_file, codec, approx_block_size, done_rx, &abort))?
        };

        Ok(ZssWriter {
            path,
            file: Some(file),
            header,
            encoded_header_len: encoded.len(),
            approx_block_size: options.approx_block_size,
            state: State::Writing,
            buf: Vec::new(),
            buf_size: 0,
            last_record: None,
            next_seq: 0,
            jobs: Some(jobs_tx),
            compressors,
            appender: Some(appender),
            abort,
        })
    }

    /// Path of the file being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. Records must arrive in non-decreasing byte
    /// order; buffered records are cut into blocks of roughly
    /// `approx_block_size` encoded bytes.
    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        self.check_writing()?;
        if let Some(last) = &self.last_record {
            if record < last.as_slice() {
                return Err(unsorted(last, record));
            }
        }
        let cost = block::record_encoded_len(record);
        if !self.buf.is_empty() && self.buf_size + cost > self.approx_block_size {
            self.flush_buf()?;
        }
        self.buf_size += cost;
        self.buf.push(record.to_vec());
        self.last_record = Some(record.to_vec());
        Ok(())
    }

    /// Appends a caller-packed data block, bypassing the size-based
    /// bucketing. An empty list is a no-op. Ordering is still
    /// enforced, both inside the block and against everything already
    /// written.
    pub fn add_data_block(&mut self, records: Vec<Vec<u8>>) -> Result<()> {
        self.check_writing()?;
        let Some(first) = records.first() else {
            return Ok(());
        };
        if let Some(last) = &self.last_record {
            if first < last {
                return Err(unsorted(last, first));
            }
        }
        for pair in records.windows(2) {
            if pair[1] < pair[0] {
                return Err(unsorted(&pair[0], &pair[1]));
            }
        }
        // Anything buffered must land on disk before this block.
        self.flush_buf()?;
        self.last_record = records.last().cloned();
        self.send_job(records)
    }

    /// Flushes the residual block, builds the index levels up to a
    /// single root, writes the final header, syncs, and only then
    /// flips the magic to the good value. Consumes the writer.
    pub fn finish(mut self) -> Result<()> {
        self.check_writing()?;
        self.flush_buf()?;
        self.jobs.take();
        for handle in self.compressors.drain(..) {
            handle
                .join()
                .map_err(|_| Error::Io(std::io::Error::other("compression worker panicked")))?;
        }
        let outcome = match self.appender.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Io(std::io::Error::other("appender thread panicked")))??,
            None => return Err(Error::Io(std::io::Error::other("writer pipeline stopped"))),
        };

        let mut file = match self.file.take() {
            Some(f) => f,
            None => return Err(Error::Io(std::io::Error::other("writer lost its file handle"))),
        };
        let total_file_length = file.seek(SeekFrom::End(0))?;

        self.header.root_index_offset = outcome.root_offset;
        self.header.root_index_length = outcome.root_length;
        self.header.total_file_length = total_file_length;
        self.header.data_sha256 = outcome.data_sha256;
        let encoded = self.header.encode();
        if encoded.len() != self.encoded_header_len {
            return Err(Error::Io(std::io::Error::other(
                "header length changed between create and finish",
            )));
        }

        let mut u64buf = [0u8; 8];
        file.seek(SeekFrom::Start(MAGIC.len() as u64))?;
        LittleEndian::write_u64(&mut u64buf, encoded.len() as u64);
        file.write_all(&u64buf)?;
        file.write_all(&encoded)?;
        LittleEndian::write_u64(&mut u64buf, crc64xz(&encoded));
        file.write_all(&u64buf)?;
        file.flush()?;
        file.sync_all()?;

        // Everything below the magic is durable; now make the file
        // visible to readers.
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&MAGIC)?;
        file.flush()?;
        file.sync_all()?;

        debug!(
            path = %self.path.display(),
            blocks = outcome.blocks,
            total_file_length,
            "finished zss file"
        );
        self.state = State::Closed;
        Ok(())
    }

    /// Shuts the pipeline down without finalizing. Idempotent; the
    /// file keeps the incomplete magic, so readers will reject it.
    /// Buffered records are still pushed through the pipeline so the
    /// on-disk prefix is as complete as possible.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        self.abort.store(true, AtomicOrdering::SeqCst);
        if !self.buf.is_empty() {
            let records = std::mem::take(&mut self.buf);
            self.buf_size = 0;
            let seq = self.next_seq;
            self.next_seq += 1;
            if let Some(jobs) = &self.jobs {
                jobs.send(CompressJob { seq, records }).ok();
            }
        }
        self.jobs.take();
        for handle in self.compressors.drain(..) {
            handle.join().ok();
        }
        if let Some(handle) = self.appender.take() {
            handle.join().ok();
        }
    }

    fn check_writing(&self) -> Result<()> {
        if self.state != State::Writing {
            return Err(Error::bad_usage("writer is closed"));
        }
        Ok(())
    }

    fn flush_buf(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.buf);
        self.buf_size = 0;
        self.send_job(records)
    }

    fn send_job(&mut self, records: Vec<Vec<u8>>) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let sent = match &self.jobs {
            Some(jobs) => jobs.send(CompressJob { seq, records }).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            Err(self.pipeline_failure())
        }
    }

    /// The pipeline only refuses work after a worker died; dig out the
    /// original error and close up.
    fn pipeline_failure(&mut self) -> Error {
        self.state = State::Closed;
        self.jobs.take();
        for handle in self.compressors.drain(..) {
            handle.join().ok();
        }
        match self.appender.take().map(JoinHandle::join) {
            Some(Ok(Err(e))) => e,
            Some(Err(_)) => Error::Io(std::io::Error::other("appender thread panicked")),
            _ => Error::Io(std::io::Error::other("writer pipeline stopped unexpectedly")),
        }
    }
}

impl Drop for ZssWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn unsorted(previous: &[u8], next: &[u8]) -> Error {
    Error::bad_usage(format!(
        "records not in sorted order: {:?} then {:?}",
        String::from_utf8_lossy(previous),
        String::from_utf8_lossy(next)
    ))
}

/// Pure worker: pack, compress, frame. Exits when the job channel
/// closes or the appender goes away.
fn compress_worker(
    codec: Codec,
    jobs: &Mutex<Receiver<CompressJob>>,
    done: &SyncSender<Result<CompressedBlock>>,
) {
    loop {
        let job = match jobs.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        let job = match job {
            Ok(job) => job,
            Err(_) => return,
        };
        let Some(first) = job.records.first().cloned() else {
            continue;
        };
        let payload = block::pack_data_records(&job.records);
        match codec.encode(&payload) {
            Ok(zpayload) => {
                let framed = block::frame_block(0, &zpayload);
                let compressed = CompressedBlock {
                    seq: job.seq,
                    first,
                    payload,
                    framed,
                };
                if done.send(Ok(compressed)).is_err() {
                    return;
                }
            }
            Err(e) => {
                done.send(Err(Error::Io(std::io::Error::other(e)))).ok();
                return;
            }
        }
    }
}

/// Single appender thread: restores sequence order, writes blocks,
/// builds index levels, and produces the root on clean shutdown.
fn run_appender(
    file: File,
    codec: Codec,
    approx_block_size: usize,
    done: Receiver<Result<CompressedBlock>>,
    abort: &AtomicBool,
) -> Result<BuildOutcome> {
    let mut builder = TreeBuilder::new(file, codec, approx_block_size);
    let mut pending: BTreeMap<u64, CompressedBlock> = BTreeMap::new();
    let mut wanted: u64 = 0;
    while let Ok(message) = done.recv() {
        let compressed = message?;
        pending.insert(compressed.seq, compressed);
        while let Some(next) = pending.remove(&wanted) {
            builder.append_data_block(next)?;
            wanted += 1;
        }
    }
    if abort.load(AtomicOrdering::SeqCst) {
        return Err(Error::Cancelled);
    }
    if !pending.is_empty() {
        return Err(Error::Io(std::io::Error::other(
            "compression worker died mid-stream",
        )));
    }
    builder.finish()
}

/// Owns the file body and the per-level index buffers.
struct TreeBuilder {
    file: File,
    codec: Codec,
    approx_block_size: usize,
    /// Voffset of the next byte to be written.
    tell: u64,
    /// levels[n]: entries for written level-n blocks awaiting a parent.
    levels: Vec<Vec<IndexEntry>>,
    level_sizes: Vec<usize>,
    sha: Sha256,
    blocks: u64,
}

impl TreeBuilder {
    fn new(file: File, codec: Codec, approx_block_size: usize) -> TreeBuilder {
        TreeBuilder {
            file,
            codec,
            approx_block_size,
            tell: 0,
            levels: Vec::new(),
            level_sizes: Vec::new(),
            sha: Sha256::new(),
            blocks: 0,
        }
    }

    fn append_data_block(&mut self, compressed: CompressedBlock) -> Result<()> {
        self.sha.update(&compressed.payload);
        self.write_framed(0, compressed.first, &compressed.framed)
    }

    fn write_framed(&mut self, level: usize, first: Vec<u8>, framed: &[u8]) -> Result<()> {
        if level >= FIRST_EXTENSION_LEVEL as usize {
            return Err(Error::bad_usage("index tree grew past level 63"));
        }
        let voffset = self.tell;
        self.file.write_all(framed)?;
        self.tell += framed.len() as u64;
        self.blocks += 1;

        if level >= self.levels.len() {
            self.levels.push(Vec::new());
            self.level_sizes.push(0);
        }
        let entry = IndexEntry {
            key: first,
            voffset,
            length: framed.len() as u64,
        };
        self.level_sizes[level] += block::index_entry_encoded_len(&entry);
        self.levels[level].push(entry);
        // Fan-out is dynamic, by encoded index size; require two
        // entries so a tiny approx_block_size cannot cascade
        // single-entry indexes all the way to the level cap.
        if self.levels[level].len() >= 2 && self.level_sizes[level] >= self.approx_block_size {
            self.flush_index(level)?;
        }
        Ok(())
    }

    fn flush_index(&mut self, level: usize) -> Result<()> {
        let entries = std::mem::take(&mut self.levels[level]);
        self.level_sizes[level] = 0;
        let Some(first) = entries.first().map(|e| e.key.clone()) else {
            return Ok(());
        };
        let payload = block::pack_index_entries(&entries);
        let zpayload = self
            .codec
            .encode(&payload)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let framed = block::frame_block(level as u8 + 1, &zpayload);
        self.write_framed(level + 1, first, &framed)
    }

    /// Cascades residual index levels upward until exactly one block
    /// sits alone at the top; that block is the root.
    fn finish(mut self) -> Result<BuildOutcome> {
        if self.levels.is_empty() {
            return Err(Error::bad_usage("cannot create an empty file"));
        }
        while !self.have_root() {
            match self.levels.iter().position(|l| !l.is_empty()) {
                Some(level) => self.flush_index(level)?,
                None => break,
            }
        }
        self.file.flush()?;
        self.file.sync_all()?;

        let root = match self.levels.last().and_then(|l| l.first()) {
            Some(entry) => entry,
            None => return Err(Error::Io(std::io::Error::other("index build lost its root"))),
        };
        Ok(BuildOutcome {
            root_offset: root.voffset,
            root_length: root.length,
            data_sha256: self.sha.finalize().into(),
            blocks: self.blocks,
        })
    }

    fn have_root(&self) -> bool {
        let depth = self.levels.len();
        if depth < 2 {
            return false;
        }
        if self.levels[..depth - 1].iter().any(|l| !l.is_empty()) {
            return false;
        }
        self.levels[depth - 1].len() == 1
    }
}
