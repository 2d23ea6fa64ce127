//! Record framing for CLI input and output.
//!
//! ZSS stores opaque byte records; at the command line they arrive and
//! leave either separated by a terminator (newline by default) or
//! length-prefixed (`uleb128` or `u64le`). Option values like
//! `--start` and `--terminator` accept backslash escapes so binary
//! bounds can be typed in a shell.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};
use clap::ValueEnum;
use zss::{Error, Result};

/// Length-prefix encodings accepted by `--length-prefixed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LengthPrefix {
    U64le,
    Uleb128,
}

/// How records are framed in an input or output byte stream.
#[derive(Debug, Clone)]
pub enum Framing {
    /// Each record is followed by this byte sequence.
    Terminated(Vec<u8>),
    /// Each record is preceded by its length.
    LengthPrefixed(LengthPrefix),
}

/// Decodes backslash escapes (`\n`, `\r`, `\t`, `\0`, `\\`, `\xNN`) in
/// a command-line value into raw bytes.
pub fn unescape(value: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'\\') => out.push(b'\\'),
            Some(b'x') => {
                let hi = bytes.next().and_then(hex_digit);
                let lo = bytes.next().and_then(hex_digit);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                    _ => {
                        return Err(Error::BadUsage(format!(
                            "bad \\x escape in {value:?} (expected two hex digits)"
                        )))
                    }
                }
            }
            other => {
                return Err(Error::BadUsage(format!(
                    "unknown escape \\{} in {value:?}",
                    other.map(|b| (b as char).to_string()).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Streams records out of `reader` according to `framing`, calling
/// `sink` once per record. Input framing problems are user errors.
pub fn read_records<R: Read>(
    reader: &mut R,
    framing: &Framing,
    mut sink: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    match framing {
        Framing::Terminated(terminator) => read_terminated(reader, terminator, &mut sink),
        Framing::LengthPrefixed(mode) => read_length_prefixed(reader, *mode, &mut sink),
    }
}

/// Chunked terminator splitting: read a chunk, emit every complete
/// record in it, carry the tail into the next chunk. A terminator
/// split across two reads is found once its second half arrives.
fn read_terminated<R: Read>(
    reader: &mut R,
    terminator: &[u8],
    sink: &mut impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    if terminator.is_empty() {
        return Err(Error::BadUsage("terminator must not be empty".to_string()));
    }
    const CHUNK: usize = 256 * 1024;
    let mut chunk = vec![0u8; CHUNK];
    let mut partial: Vec<u8> = Vec::new();
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            if !partial.is_empty() {
                return Err(Error::BadUsage(
                    "input did not end with the record terminator".to_string(),
                ));
            }
            return Ok(());
        }
        partial.extend_from_slice(&chunk[..n]);
        let mut consumed = 0;
        while let Some(pos) = find(&partial[consumed..], terminator) {
            sink(&partial[consumed..consumed + pos])?;
            consumed += pos + terminator.len();
        }
        partial.drain(..consumed);
    }
}

fn read_length_prefixed<R: Read>(
    reader: &mut R,
    mode: LengthPrefix,
    sink: &mut impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    loop {
        let length = match mode {
            LengthPrefix::Uleb128 => match framing::read_uleb128(reader) {
                Ok(None) => return Ok(()),
                Ok(Some((length, _))) => length,
                Err(framing::FramingError::Io(e)) => return Err(Error::Io(e)),
                Err(e) => return Err(Error::BadUsage(format!("bad length prefix: {e}"))),
            },
            LengthPrefix::U64le => match read_u64le(reader)? {
                None => return Ok(()),
                Some(length) => length,
            },
        };
        let mut record = vec![0u8; length as usize];
        if let Err(e) = reader.read_exact(&mut record) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(Error::BadUsage(
                    "length-prefixed input ended mid-record".to_string(),
                ));
            }
            return Err(Error::Io(e));
        }
        sink(&record)?;
    }
}

/// Reads a u64le, or `None` at clean EOF; EOF inside the integer is a
/// user error.
fn read_u64le<R: Read>(reader: &mut R) -> Result<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < 8 {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::BadUsage(
                "length-prefixed input ended mid-length".to_string(),
            ));
        }
        filled += n;
    }
    Ok(Some(LittleEndian::read_u64(&buf)))
}

/// Renders one block's records into output bytes. Runs on worker
/// threads during `dump`, so whole blocks cross back to the writer
/// rather than individual records.
pub fn render_records(records: &[Vec<u8>], framing: &Framing) -> Vec<u8> {
    let mut out = Vec::new();
    match framing {
        Framing::Terminated(terminator) => {
            for record in records {
                out.extend_from_slice(record);
                out.extend_from_slice(terminator);
            }
        }
        Framing::LengthPrefixed(LengthPrefix::Uleb128) => {
            for record in records {
                framing::write_uleb128(&mut out, record.len() as u64);
                out.extend_from_slice(record);
            }
        }
        Framing::LengthPrefixed(LengthPrefix::U64le) => {
            let mut u64buf = [0u8; 8];
            for record in records {
                LittleEndian::write_u64(&mut u64buf, record.len() as u64);
                out.extend_from_slice(&u64buf);
                out.extend_from_slice(record);
            }
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
