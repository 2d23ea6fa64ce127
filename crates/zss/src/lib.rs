//! # ZSS - read-only sorted record archives
//!
//! A ZSS file is an immutable container for an ordered multiset of
//! opaque binary records, built for terabyte-scale distribution:
//! point and range lookups descend a compressed B+-tree-like index,
//! bulk reads decompress blocks on all CPUs, every byte handed to the
//! caller is CRC-checked, and the whole format works over a dumb
//! byte-range transport such as HTTP.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ MAGIC (8 bytes)   "ZSS\x1c\x8el\x00\x01" when complete,       │
//! │                   "SSZ..." while a writer is still running    │
//! ├───────────────────────────────────────────────────────────────┤
//! │ HEADER                                                        │
//! │                                                               │
//! │ header_len (u64) | root_offset (u64) | root_length (u64)      │
//! │ total_file_length (u64) | data_sha256 (32) | codec (16)       │
//! │ metadata_len (u64) | metadata JSON | crc64 (u64)              │
//! ├───────────────────────────────────────────────────────────────┤
//! │ BODY (blocks, addressed by voffset = bytes past the header)   │
//! │                                                               │
//! │ uleb128 payload_len | level (u8) | compressed payload         │
//! │ | crc64 (u64)                                                 │
//! │                                                               │
//! │ level 0  = data block:  (uleb128 reclen | record)+            │
//! │ level 1+ = index block: (uleb128 keylen | key                 │
//! │                          | uleb128 child_voffset              │
//! │                          | uleb128 child_length)+             │
//! │                                                               │
//! │ ... level-0 blocks in sort order, index levels as they fill,  │
//! │ the root index block last ...                                 │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The block CRC covers everything after the length varint. The
//! header additionally pins the SHA-256 of all *decompressed* data
//! payloads in file order, so two archives with the same records but
//! different codecs hash identically.
//!
//! ## Crate map
//!
//! | Module       | Purpose                                          |
//! |--------------|--------------------------------------------------|
//! | [`header`]   | magic numbers, header encode/parse               |
//! | [`block`]    | block framing and payload pack/unpack            |
//! | [`reader`]   | [`Zss`]: open, search, block map, parallel scans |
//! | [`writer`]   | [`ZssWriter`]: pipelined bottom-up tree build    |
//! | `validate`   | exhaustive integrity check ([`Zss::validate`])   |
//!
//! ## Writing and reading
//!
//! ```rust,no_run
//! use zss::{Query, WriterOptions, Zss, ZssWriter};
//!
//! let mut w = ZssWriter::create("animals.zss", WriterOptions::default()).unwrap();
//! for record in [&b"cat"[..], b"dog", b"emu"] {
//!     w.add_record(record).unwrap();
//! }
//! w.finish().unwrap();
//!
//! let z = Zss::open("animals.zss").unwrap();
//! for record in z.search(Query::prefix(b"d")).unwrap() {
//!     println!("{:?}", record.unwrap());
//! }
//! ```
//!
//! Records must be added in ASCIIbetical (memcmp) order; the writer
//! refuses anything else. Files are written with the incomplete magic
//! and flipped to the good magic only after a final fsync, so a
//! crashed writer can never leave behind a file a reader will trust.

pub mod block;
mod error;
pub mod header;
mod pool;
pub mod reader;
mod validate;
pub mod writer;

pub use codec::Codec;
pub use error::{Error, Result};
pub use header::{Header, INCOMPLETE_MAGIC, MAGIC};
pub use reader::{BlockMapIter, Query, ReaderOptions, SearchIter, Zss};
pub use writer::{WriterOptions, ZssWriter};

/// Block levels at and above this value are reserved for future
/// format extensions; current indexes may never reference them.
pub const FIRST_EXTENSION_LEVEL: u8 = 64;

#[cfg(test)]
mod tests;
