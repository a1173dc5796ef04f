//! riptide-buffer - Reference-counted byte buffers for network I/O.
//!
//! This crate provides the byte container used across the riptide transport
//! and codec layers: a heap region shared by reference counting, with each
//! handle carrying its own reader and writer indices.
//!
//! # Model
//!
//! - A [`ByteBuf`] is a value-typed handle onto a region: `(region, offset,
//!   capacity)` plus a `reader_index <= writer_index <= capacity` pair.
//! - Slicing ([`ByteBuf::read_retained_slice`], [`ByteBuf::retained_slice`],
//!   [`ByteBuf::duplicate`]) produces a new handle over the same region.
//!   Dropping the last handle releases the region exactly once.
//! - Multi-byte accessors are big-endian by default; `_le` variants are
//!   provided where needed.
//! - [`CompositeBuf`] presents several buffers as one virtual byte sequence
//!   without copying, for zero-copy accumulation.
//!
//! # Quick Start
//!
//! ```
//! use riptide_buffer::ByteBuf;
//!
//! let mut buf = ByteBuf::with_capacity(64);
//! buf.put_slice(b"hello").unwrap();
//! buf.put_u16(0xBEEF).unwrap();
//!
//! assert_eq!(buf.readable_bytes(), 7);
//! let head = buf.read_retained_slice(5).unwrap();
//! assert_eq!(head.readable(), b"hello");
//! assert_eq!(buf.read_u16().unwrap(), 0xBEEF);
//! ```
//!
//! # Ownership
//!
//! Buffers follow a single-writer discipline: the holder that appends to a
//! region must be its only writer for the written range. Handles sharing a
//! region may read concurrently. Compaction
//! ([`ByteBuf::discard_some_read_bytes`]) refuses to move bytes while more
//! than one handle references the region.

mod alloc;
mod bytebuf;
mod composite;
mod error;
mod readable;
mod region;

pub use alloc::BufAllocator;
pub use bytebuf::ByteBuf;
pub use composite::CompositeBuf;
pub use error::BufferError;
pub use readable::Readable;
