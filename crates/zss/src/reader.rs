//! Reader engine: open a file, descend the index tree, stream records.
//!
//! A search runs in three phases. First the query is normalized to a
//! `[start, stop)` byte range (prefixes become ranges). Then the index
//! tree is descended to enumerate the data blocks whose spans can
//! intersect the range: O(log n) interior fetches, and no data block
//! is touched yet. Finally the enumerated blocks are dispatched to the
//! decompression pool; a bounded reorder buffer hands payloads back in
//! file order, so record delivery is always sorted no matter how many
//! workers raced.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use codec::Codec;
use moka::sync::Cache;
use serde_json::Value;
use tracing::debug;
use transport::{FileTransport, HttpTransport, Transport};

use crate::block::{self, IndexEntry};
use crate::error::{Error, Result};
use crate::header::{self, Header};
use crate::pool::{effective_parallelism, Ordered, Pool};

/// A search request: every returned record `r` satisfies
/// `start <= r < stop` and `r.starts_with(prefix)`, for whichever
/// bounds are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Lowest record to return (inclusive).
    pub start: Option<Vec<u8>>,
    /// First record not to return (exclusive).
    pub stop: Option<Vec<u8>>,
    /// Only return records beginning with these bytes.
    pub prefix: Option<Vec<u8>>,
}

impl Query {
    /// Matches every record in the file.
    #[must_use]
    pub fn everything() -> Query {
        Query::default()
    }

    /// Matches records beginning with `prefix`.
    #[must_use]
    pub fn prefix(prefix: &[u8]) -> Query {
        Query {
            prefix: Some(prefix.to_vec()),
            ..Query::default()
        }
    }

    /// Matches records in `[start, stop)`; either bound may be open.
    #[must_use]
    pub fn span(start: Option<&[u8]>, stop: Option<&[u8]>) -> Query {
        Query {
            start: start.map(<[u8]>::to_vec),
            stop: stop.map(<[u8]>::to_vec),
            prefix: None,
        }
    }
}

/// A query normalized to a concrete half-open byte range. The prefix
/// bound folds into `start`/`stop`: records matching `prefix` are
/// exactly those in `[prefix, successor(prefix))`.
#[derive(Debug)]
pub(crate) struct Bounds {
    pub(crate) start: Vec<u8>,
    pub(crate) stop: Option<Vec<u8>>,
}

pub(crate) fn normalize(query: &Query) -> Result<Bounds> {
    if let (Some(start), Some(stop)) = (&query.start, &query.stop) {
        if start > stop {
            return Err(Error::bad_usage(format!(
                "search start {:?} is past stop {:?}",
                String::from_utf8_lossy(start),
                String::from_utf8_lossy(stop)
            )));
        }
    }
    let mut start = query.start.clone().unwrap_or_default();
    let mut stop = query.stop.clone();
    if let Some(prefix) = &query.prefix {
        if prefix.as_slice() > start.as_slice() {
            start = prefix.clone();
        }
        if let Some(prefix_stop) = prefix_successor(prefix) {
            stop = Some(match stop {
                Some(stop) if stop <= prefix_stop => stop,
                _ => prefix_stop,
            });
        }
    }
    Ok(Bounds { start, stop })
}

/// Smallest byte string greater than everything starting with
/// `prefix`, or `None` when no such string exists (all-0xff prefixes
/// are unbounded above).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < 0xff {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

/// Drops records outside `bounds`; input must be sorted.
fn trim_records(mut records: Vec<Vec<u8>>, bounds: &Bounds) -> Vec<Vec<u8>> {
    if let Some(stop) = &bounds.stop {
        let keep = records.partition_point(|r| r.as_slice() < stop.as_slice());
        records.truncate(keep);
    }
    if !bounds.start.is_empty() {
        let skip = records.partition_point(|r| r.as_slice() < bounds.start.as_slice());
        if skip > 0 {
            records.drain(..skip);
        }
    }
    records
}

/// Tuning knobs for a reader.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Decompression worker threads. `None` = one per CPU; `Some(0)`
    /// = decompress in the calling thread (fastest for tiny reads).
    pub parallelism: Option<usize>,
    /// Decoded index blocks to keep cached. Should be at least the
    /// tree depth so the root stays resident across queries.
    pub index_cache_size: u64,
}

impl Default for ReaderOptions {
    fn default() -> ReaderOptions {
        ReaderOptions {
            parallelism: None,
            index_cache_size: 32,
        }
    }
}

struct IndexBlock {
    level: u8,
    entries: Vec<IndexEntry>,
}

/// A ZSS file opened for reading.
///
/// The reader owns its transport and worker pool; dropping it closes
/// both. All query methods take `&self` and may be called from
/// multiple threads.
pub struct Zss {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) header: Header,
    pub(crate) header_end: u64,
    pub(crate) parallelism: usize,
    pub(crate) pool: Option<Arc<Pool>>,
    index_cache: Cache<(u64, u64), Arc<IndexBlock>>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Zss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zss").finish_non_exhaustive()
    }
}

impl Zss {
    /// Opens a local file with default options.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Zss> {
        Zss::with_transport(
            Box::new(FileTransport::open(path)?),
            ReaderOptions::default(),
        )
    }

    /// Opens a file served over HTTP byte ranges.
    pub fn open_url(url: &str) -> Result<Zss> {
        Zss::with_transport(Box::new(HttpTransport::new(url)?), ReaderOptions::default())
    }

    /// Opens a file over an arbitrary transport.
    ///
    /// Verifies the magic, the header CRC, and that the header's
    /// recorded file length matches what the transport reports — a
    /// truncated file must fail here, not halfway through a query.
    pub fn with_transport(transport: Box<dyn Transport>, options: ReaderOptions) -> Result<Zss> {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let (header, header_end) = header::read_header(&*transport)?;

        let actual_length = transport.len()?;
        if actual_length != header.total_file_length {
            return Err(Error::corrupt(
                None,
                format!(
                    "file length mismatch: file is {actual_length} bytes, header says {}",
                    header.total_file_length
                ),
            ));
        }

        let parallelism = effective_parallelism(options.parallelism);
        let pool = if parallelism == 0 {
            None
        } else {
            Some(Arc::new(Pool::new(parallelism)?))
        };
        debug!(
            name = transport.name(),
            codec = header.codec.name(),
            parallelism,
            "opened zss file"
        );

        Ok(Zss {
            transport,
            header,
            header_end,
            parallelism,
            pool,
            index_cache: Cache::new(options.index_cache_size),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The file's codec.
    #[must_use]
    pub fn codec(&self) -> Codec {
        self.header.codec
    }

    /// Caller metadata from the header; always a JSON object.
    #[must_use]
    pub fn metadata(&self) -> &serde_json::Map<String, Value> {
        &self.header.metadata
    }

    /// SHA-256 over all decompressed data payloads, from the header.
    #[must_use]
    pub fn data_sha256(&self) -> &[u8; 32] {
        &self.header.data_sha256
    }

    /// Total file length from the header.
    #[must_use]
    pub fn total_file_length(&self) -> u64 {
        self.header.total_file_length
    }

    /// Voffset of the root index block.
    #[must_use]
    pub fn root_index_offset(&self) -> u64 {
        self.header.root_index_offset
    }

    /// On-disk length of the root index block.
    #[must_use]
    pub fn root_index_length(&self) -> u64 {
        self.header.root_index_length
    }

    /// Level of the root index block. A cold point lookup costs
    /// `root_index_level + 2` fetches (header, root, one per level).
    pub fn root_index_level(&self) -> Result<u8> {
        let root = self.index_block(self.header.root_index_offset, self.header.root_index_length)?;
        Ok(root.level)
    }

    /// Transport name (path or URL).
    #[must_use]
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Iterates every record in the file, in order.
    pub fn records(&self) -> Result<SearchIter<'_>> {
        self.search(Query::everything())
    }

    /// Iterates records matching `query`, in non-decreasing order.
    ///
    /// The returned iterator yields `Result` items: any corruption or
    /// transport failure aborts the iteration, but records already
    /// yielded remain valid.
    pub fn search(&self, query: Query) -> Result<SearchIter<'_>> {
        let scan = self.scan(query, Arc::new(|records: Vec<Vec<u8>>| records))?;
        Ok(SearchIter {
            scan,
            current: Vec::new().into_iter(),
            done: false,
        })
    }

    /// Applies `f` to each matching data block's records, in parallel,
    /// yielding results in file order.
    ///
    /// This is the cheapest way to run bulk computations over a large
    /// range: the per-block records never cross a thread boundary
    /// individually, only `f`'s result does.
    pub fn block_map<T, F>(&self, f: F, query: Query) -> Result<BlockMapIter<'_, T>>
    where
        F: Fn(Vec<Vec<u8>>) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let scan = self.scan(query, Arc::new(f))?;
        Ok(BlockMapIter { scan, done: false })
    }

    /// Like [`block_map`](Zss::block_map), but results are consumed in
    /// whatever order blocks finish and thrown away. The caller
    /// promises `f` is commutative.
    pub fn block_exec<T, F>(&self, f: F, query: Query) -> Result<()>
    where
        F: Fn(Vec<Vec<u8>>) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let mut scan = self.scan(query, Arc::new(f))?;
        while scan.next_block(false)?.is_some() {}
        Ok(())
    }

    /// Closes the reader: in-flight iterations fail `Cancelled`, and
    /// further queries fail `BadUsage`. Also called on drop.
    pub fn close(&self) {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }

    pub(crate) fn check_closed(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(Error::bad_usage("operation on closed reader"));
        }
        Ok(())
    }

    fn scan<T, F>(&self, query: Query, f: Arc<F>) -> Result<BlockScan<'_, T>>
    where
        F: Fn(Vec<Vec<u8>>) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.check_closed()?;
        let bounds = normalize(&query)?;
        let leaves = self.collect_leaves(&bounds)?;
        debug!(leaves = leaves.len(), "query plan");
        let window = match &self.pool {
            Some(_) => 3 * self.parallelism.max(1),
            None => 1,
        };
        Ok(BlockScan {
            zss: self,
            bounds: Arc::new(bounds),
            leaves,
            next_leaf: 0,
            f,
            ordered: Ordered::new(),
            window,
        })
    }

    /// Enumerates the (voffset, length) of every data block whose span
    /// can intersect the bounds, in file order.
    fn collect_leaves(&self, bounds: &Bounds) -> Result<Vec<(u64, u64)>> {
        let mut leaves = Vec::new();
        self.collect_into(
            self.header.root_index_offset,
            self.header.root_index_length,
            None,
            bounds,
            &mut leaves,
        )?;
        Ok(leaves)
    }

    fn collect_into(
        &self,
        voffset: u64,
        length: u64,
        expected_level: Option<u8>,
        bounds: &Bounds,
        out: &mut Vec<(u64, u64)>,
    ) -> Result<()> {
        let index = self.index_block(voffset, length)?;
        if let Some(expected) = expected_level {
            if index.level != expected {
                return Err(Error::corrupt(
                    voffset,
                    format!(
                        "index entry expected a level-{expected} child, found level {}",
                        index.level
                    ),
                ));
            }
        }
        let entries = &index.entries;
        // The child that can contain `start` is the one *before* the
        // first key >= start: a separator key may equal records at the
        // tail of the preceding block, so descending strictly by <=
        // could skip matches.
        let mut lo = entries.partition_point(|e| e.key.as_slice() < bounds.start.as_slice());
        lo = lo.saturating_sub(1);
        let hi = match &bounds.stop {
            // A child whose key is >= stop holds only records >= stop.
            Some(stop) => entries.partition_point(|e| e.key.as_slice() < stop.as_slice()),
            None => entries.len(),
        };
        for entry in &entries[lo.min(hi)..hi] {
            if index.level == 1 {
                out.push((entry.voffset, entry.length));
            } else {
                self.collect_into(
                    entry.voffset,
                    entry.length,
                    Some(index.level - 1),
                    bounds,
                    out,
                )?;
            }
        }
        Ok(())
    }

    /// Fetches an index block through the LRU cache.
    fn index_block(&self, voffset: u64, length: u64) -> Result<Arc<IndexBlock>> {
        if let Some(hit) = self.index_cache.get(&(voffset, length)) {
            return Ok(hit);
        }
        let (level, payload) = block::read_block(
            &*self.transport,
            self.header_end,
            voffset,
            length,
            self.header.codec,
        )?;
        if level == 0 {
            return Err(Error::corrupt(
                voffset,
                "expected an index block, found a data block",
            ));
        }
        let entries = block::unpack_index_entries(&payload, voffset)?;
        let decoded = Arc::new(IndexBlock { level, entries });
        self.index_cache
            .insert((voffset, length), Arc::clone(&decoded));
        Ok(decoded)
    }
}

impl Drop for Zss {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ordered, bounded dispatch of data blocks to the worker pool.
struct BlockScan<'z, T: Send + 'static> {
    zss: &'z Zss,
    bounds: Arc<Bounds>,
    leaves: Vec<(u64, u64)>,
    next_leaf: usize,
    f: Arc<dyn Fn(Vec<Vec<u8>>) -> T + Send + Sync>,
    ordered: Ordered<Result<Option<T>>>,
    window: usize,
}

impl<T: Send + 'static> BlockScan<'_, T> {
    fn fill(&mut self) -> Result<()> {
        while self.ordered.in_flight() < self.window && self.next_leaf < self.leaves.len() {
            let (voffset, length) = self.leaves[self.next_leaf];
            self.next_leaf += 1;
            let transport = Arc::clone(&self.zss.transport);
            let header_end = self.zss.header_end;
            let codec = self.zss.header.codec;
            let bounds = Arc::clone(&self.bounds);
            let f = Arc::clone(&self.f);
            let accepted = self.ordered.submit(self.zss.pool.as_deref(), move || {
                scan_one(&*transport, header_end, voffset, length, codec, &bounds, &*f)
            });
            if !accepted {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    fn next_block(&mut self, in_order: bool) -> Result<Option<T>> {
        loop {
            self.fill()?;
            let next = if in_order {
                self.ordered.next(&self.zss.closed)?
            } else {
                self.ordered.next_any(&self.zss.closed)?
            };
            match next {
                Some(Ok(Some(value))) => return Ok(Some(value)),
                Some(Ok(None)) => continue,
                Some(Err(e)) => return Err(e),
                None => {
                    if self.next_leaf >= self.leaves.len() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Fetch + check + decompress + trim one data block; runs on a worker.
fn scan_one<T>(
    transport: &dyn Transport,
    header_end: u64,
    voffset: u64,
    length: u64,
    codec: Codec,
    bounds: &Bounds,
    f: &dyn Fn(Vec<Vec<u8>>) -> T,
) -> Result<Option<T>> {
    let (level, payload) = block::read_block(transport, header_end, voffset, length, codec)?;
    if level != 0 {
        return Err(Error::corrupt(
            voffset,
            format!("expected a data block, found level {level}"),
        ));
    }
    let records = block::unpack_data_records(&payload, voffset)?;
    let records = trim_records(records, bounds);
    if records.is_empty() {
        return Ok(None);
    }
    Ok(Some(f(records)))
}

/// Lazy record iterator returned by [`Zss::search`].
pub struct SearchIter<'z> {
    scan: BlockScan<'z, Vec<Vec<u8>>>,
    current: std::vec::IntoIter<Vec<u8>>,
    done: bool,
}

impl std::fmt::Debug for SearchIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIter").finish_non_exhaustive()
    }
}

impl Iterator for SearchIter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            match self.scan.next_block(true) {
                Ok(Some(records)) => self.current = records.into_iter(),
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Lazy per-block result iterator returned by [`Zss::block_map`].
pub struct BlockMapIter<'z, T: Send + 'static> {
    scan: BlockScan<'z, T>,
    done: bool,
}

impl<T: Send + 'static> Iterator for BlockMapIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.scan.next_block(true) {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
