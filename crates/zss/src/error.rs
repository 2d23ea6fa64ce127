use framing::FramingError;
use thiserror::Error;

/// Errors surfaced by readers, writers and the validator.
///
/// The split matters to callers: `BadFormat` means the bytes cannot be
/// a ZSS file at all, `Corrupt` means the file parses but violates an
/// integrity invariant, `Io` is the transport after retries, and
/// `BadUsage` is the caller's bug, not the file's.
#[derive(Debug, Error)]
pub enum Error {
    /// The file cannot be parsed (wrong magic, bad header, unknown
    /// codec, non-canonical varint, truncated framing).
    #[error("bad format: {0}")]
    BadFormat(String),

    /// The file parses but an integrity invariant does not hold.
    #[error("corrupt file{}: {reason}", fmt_offset(*.offset))]
    Corrupt {
        /// Body voffset of the offending block, when known.
        offset: Option<u64>,
        reason: String,
    },

    /// Transport-level failure, after bounded retry.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller misused the API (unsorted input, closed handle,
    /// inverted range).
    #[error("bad usage: {0}")]
    BadUsage(String),

    /// The reader was closed while a query was in flight.
    #[error("cancelled")]
    Cancelled,
}

fn fmt_offset(offset: Option<u64>) -> String {
    match offset {
        Some(o) => format!(" at offset {o}"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn corrupt(offset: impl Into<Option<u64>>, reason: impl Into<String>) -> Error {
        Error::Corrupt {
            offset: offset.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_format(reason: impl Into<String>) -> Error {
        Error::BadFormat(reason.into())
    }

    pub(crate) fn bad_usage(reason: impl Into<String>) -> Error {
        Error::BadUsage(reason.into())
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Error {
        match e {
            FramingError::Io(io) => Error::Io(io),
            other => Error::BadFormat(other.to_string()),
        }
    }
}

impl From<codec::CodecError> for Error {
    fn from(e: codec::CodecError) -> Error {
        Error::corrupt(None, format!("bad compressed payload: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
