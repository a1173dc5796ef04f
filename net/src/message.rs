//! Messages flowing through the pipeline and write queue.

use riptide_buffer::ByteBuf;
use std::any::Any;
use std::fmt;

/// A unit of data travelling through a channel's pipeline.
///
/// The transport reads and writes `Buf` payloads; decoders and user
/// handlers may exchange arbitrary `Custom` payloads, which pass through
/// byte-oriented stages untouched and are rejected at the socket write
/// boundary.
pub enum Message {
    Buf(ByteBuf),
    Custom(Box<dyn Any + Send>),
}

impl Message {
    #[inline]
    pub fn as_buf(&self) -> Option<&ByteBuf> {
        match self {
            Message::Buf(b) => Some(b),
            Message::Custom(_) => None,
        }
    }

    #[inline]
    pub fn as_buf_mut(&mut self) -> Option<&mut ByteBuf> {
        match self {
            Message::Buf(b) => Some(b),
            Message::Custom(_) => None,
        }
    }

    /// Unwrap a byte payload, handing the message back otherwise.
    pub fn into_buf(self) -> Result<ByteBuf, Message> {
        match self {
            Message::Buf(b) => Ok(b),
            other => Err(other),
        }
    }

    /// Payload size in bytes; zero for non-byte messages.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        match self {
            Message::Buf(b) => b.readable_bytes(),
            Message::Custom(_) => 0,
        }
    }
}

impl From<ByteBuf> for Message {
    fn from(buf: ByteBuf) -> Self {
        Message::Buf(buf)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Buf(b) => f.debug_tuple("Buf").field(b).finish(),
            Message::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
