//! Object-safe read contract shared by contiguous and composite buffers.

use crate::bytebuf::ByteBuf;
use crate::error::BufferError;

/// Read-side view of a byte sequence with an explicit reader index.
///
/// Implemented by [`ByteBuf`] over its region and by
/// [`CompositeBuf`](crate::CompositeBuf) over the virtual concatenation of
/// its components. Frame extractors are written against this trait so the
/// same decoder runs over either accumulation strategy.
///
/// Index arguments are absolute within the implementor's index space:
/// `[0, writer_index())`, with `[reader_index(), writer_index())` readable.
pub trait Readable {
    fn readable_bytes(&self) -> usize;

    fn reader_index(&self) -> usize;

    fn writer_index(&self) -> usize;

    /// Move the reader to an absolute index, at most `writer_index()`.
    fn set_reader_index(&mut self, index: usize) -> Result<(), BufferError>;

    /// Advance the reader past `n` bytes.
    fn skip(&mut self, n: usize) -> Result<(), BufferError>;

    /// Byte at an absolute index, without moving the reader.
    fn get_u8(&self, index: usize) -> Result<u8, BufferError>;

    /// Take the next `n` readable bytes as an owned [`ByteBuf`], advancing
    /// the reader. Shares storage where the range is contiguous.
    fn read_retained_slice(&mut self, n: usize) -> Result<ByteBuf, BufferError>;

    /// First occurrence of `needle` at or after absolute index `from`.
    fn find_byte(&self, from: usize, needle: u8) -> Option<usize>;

    fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }
}

impl Readable for ByteBuf {
    fn readable_bytes(&self) -> usize {
        ByteBuf::readable_bytes(self)
    }

    fn reader_index(&self) -> usize {
        ByteBuf::reader_index(self)
    }

    fn writer_index(&self) -> usize {
        ByteBuf::writer_index(self)
    }

    fn set_reader_index(&mut self, index: usize) -> Result<(), BufferError> {
        ByteBuf::set_reader_index(self, index)
    }

    fn skip(&mut self, n: usize) -> Result<(), BufferError> {
        ByteBuf::skip(self, n)
    }

    fn get_u8(&self, index: usize) -> Result<u8, BufferError> {
        ByteBuf::get_u8(self, index)
    }

    fn read_retained_slice(&mut self, n: usize) -> Result<ByteBuf, BufferError> {
        ByteBuf::read_retained_slice(self, n)
    }

    fn find_byte(&self, from: usize, needle: u8) -> Option<usize> {
        ByteBuf::find_byte(self, from, needle)
    }
}
