//! riptide-codec - Frame extraction over accumulated byte streams.
//!
//! TCP delivers bytes with no respect for message boundaries. The
//! [`StreamDecoder`] pipeline handler accumulates inbound fragments and
//! repeatedly drives a user-supplied [`FrameDecoder`] over them, emitting
//! complete frames downstream and keeping partial ones buffered until more
//! bytes arrive.
//!
//! # Quick Start
//!
//! ```
//! use riptide_codec::{LineDecoder, StreamDecoder};
//! use riptide_net::{EmbeddedChannel, Message};
//! use riptide_buffer::ByteBuf;
//!
//! let mut ch = EmbeddedChannel::new();
//! ch.add_handler("frame", StreamDecoder::new(LineDecoder::new(1024)));
//!
//! // A frame split across two reads comes out whole.
//! ch.write_inbound(Message::Buf(ByteBuf::from_slice(b"AB")));
//! assert!(ch.read_inbound().is_none());
//! ch.write_inbound(Message::Buf(ByteBuf::from_slice(b"CD\n")));
//! let frame = ch.read_inbound().unwrap();
//! assert_eq!(frame.as_buf().unwrap().readable(), b"ABCD");
//! ```

mod decoder;
mod error;
mod line;

pub use decoder::{CumulateStrategy, Decoded, DecoderConfig, FrameDecoder, StreamDecoder};
pub use error::DecodeError;
pub use line::LineDecoder;
