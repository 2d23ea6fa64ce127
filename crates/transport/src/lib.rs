//! # Transport - random-access byte sources
//!
//! A ZSS reader never assumes it can see the whole file at once: the
//! same format is served from local disk and over plain HTTP byte
//! ranges. This crate owns that abstraction.
//!
//! Implementations must be safe for concurrent positional reads
//! (`&self` methods, no shared seek state) because decompression
//! workers fetch blocks from multiple threads at once.
//!
//! - [`FileTransport`]: positional reads (`pread` on unix) against a
//!   single open handle.
//! - [`HttpTransport`]: `Range:` GETs through one persistent
//!   [`reqwest::blocking::Client`]. Transient failures are retried
//!   with exponential backoff, at most three attempts, then surfaced
//!   as I/O errors.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use tracing::warn;

/// Attempts per HTTP request before giving up.
const HTTP_ATTEMPTS: u32 = 3;
/// Backoff before the second attempt; doubled each retry.
const HTTP_BACKOFF: Duration = Duration::from_millis(100);
/// Connect/read timeout for HTTP requests.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A random-access byte source.
pub trait Transport: Send + Sync {
    /// Total length of the underlying resource in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Reads up to `len` bytes at absolute `offset`.
    ///
    /// Returns fewer bytes only when the resource ends inside the
    /// requested range; callers decide whether a short read is an
    /// error.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Opens a sequential stream starting at absolute `offset` and
    /// running to the end of the resource.
    fn stream_from(&self, offset: u64) -> io::Result<Box<dyn Read + Send>>;

    /// Human-readable name (path or URL) for error messages.
    fn name(&self) -> &str;
}

/// Local-file transport using positional reads.
pub struct FileTransport {
    file: File,
    name: String,
}

impl FileTransport {
    /// Opens `path` read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileTransport> {
        let name = path.as_ref().display().to_string();
        let file = File::open(path)?;
        Ok(FileTransport { file, name })
    }
}

impl Transport for FileTransport {
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = positional_read(&self.file, &mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn stream_from(&self, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// HTTP transport issuing `Range:` GETs against a single URL.
///
/// The server must honor range requests (respond `206 Partial
/// Content`) and report a `Content-Length`; plain static-file servers
/// and object stores all do.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpTransport {
    /// Creates a transport for `url` with a persistent connection pool.
    pub fn new(url: &str) -> io::Result<HttpTransport> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(io::Error::other)?;
        Ok(HttpTransport {
            client,
            url: url.to_string(),
        })
    }

    /// Issues one request with bounded retry on transport-level and
    /// server-side (5xx) failures.
    fn request_with_retry(
        &self,
        range: Option<String>,
        head: bool,
    ) -> io::Result<reqwest::blocking::Response> {
        let mut backoff = HTTP_BACKOFF;
        let mut last_err: Option<io::Error> = None;
        for attempt in 1..=HTTP_ATTEMPTS {
            let req = if head {
                self.client.head(&self.url)
            } else {
                self.client.get(&self.url)
            };
            let req = match &range {
                Some(r) => req.header(reqwest::header::RANGE, r.clone()),
                None => req,
            };
            match req.send() {
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = Some(io::Error::other(format!(
                        "{}: server returned {}",
                        self.url,
                        resp.status()
                    )));
                }
                Ok(resp) if !resp.status().is_success() => {
                    // Client errors (404, 416, ...) will not improve
                    // with retries.
                    return Err(io::Error::other(format!(
                        "{}: server returned {}",
                        self.url,
                        resp.status()
                    )));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = Some(io::Error::other(e)),
            }
            if attempt < HTTP_ATTEMPTS {
                warn!(url = %self.url, attempt, "http request failed, retrying");
                std::thread::sleep(backoff);
                backoff *= 2;
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::other("http request failed")))
    }

    /// A server that ignores `Range:` replies `200` with the whole
    /// body; for a nonzero offset that would silently hand back the
    /// wrong bytes.
    fn check_range_honored(
        &self,
        resp: &reqwest::blocking::Response,
        offset: u64,
    ) -> io::Result<()> {
        if offset > 0 && resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(io::Error::other(format!(
                "{}: server does not honor Range requests (got {})",
                self.url,
                resp.status()
            )));
        }
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn len(&self) -> io::Result<u64> {
        let resp = self.request_with_retry(None, true)?;
        resp.headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| io::Error::other(format!("{}: no Content-Length", self.url)))
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = offset + len as u64 - 1;
        let resp = self.request_with_retry(Some(format!("bytes={offset}-{end}")), false)?;
        self.check_range_honored(&resp, offset)?;
        let mut body = Vec::with_capacity(len);
        resp.take(len as u64)
            .read_to_end(&mut body)
            .map_err(io::Error::other)?;
        Ok(body)
    }

    fn stream_from(&self, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        let resp = self.request_with_retry(Some(format!("bytes={offset}-")), false)?;
        self.check_range_honored(&resp, offset)?;
        Ok(Box::new(resp))
    }

    fn name(&self) -> &str {
        &self.url
    }
}
