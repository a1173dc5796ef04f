//! Newline-delimited frame extraction.

use crate::decoder::{Decoded, FrameDecoder};
use crate::error::DecodeError;
use riptide_buffer::Readable;
use riptide_net::pipeline::Ctx;
use riptide_net::Message;

/// Splits the byte stream on line endings. Both `\n` and `\r\n` are
/// handled.
///
/// A line longer than `max_len` raises
/// [`DecodeError::FrameTooLarge`] and the decoder discards bytes
/// until the next delimiter: immediately when `fail_fast` is set, or once
/// the oversized line has been fully skipped otherwise. Leaving discard
/// mode emits nothing.
pub struct LineDecoder {
    max_len: usize,
    strip_delimiter: bool,
    fail_fast: bool,
    /// Discarding an oversized line until its delimiter shows up.
    discarding: bool,
    discarded: usize,
    /// Bytes already scanned for a delimiter, so an unterminated prefix
    /// is not re-scanned on every read.
    offset: usize,
}

impl LineDecoder {
    /// Delimiters are stripped and over-length errors are raised after
    /// the oversized line has been skipped.
    pub fn new(max_len: usize) -> Self {
        Self::with_options(max_len, true, false)
    }

    pub fn with_options(max_len: usize, strip_delimiter: bool, fail_fast: bool) -> Self {
        Self {
            max_len,
            strip_delimiter,
            fail_fast,
            discarding: false,
            discarded: 0,
            offset: 0,
        }
    }

    /// Absolute index of the line ending, pointing at the `\r` of a
    /// `\r\n` pair. Remembers how far it scanned on a miss.
    fn find_eol(&mut self, buf: &dyn Readable) -> Option<usize> {
        let from = buf.reader_index() + self.offset;
        match buf.find_byte(from, b'\n') {
            Some(mut eol) => {
                self.offset = 0;
                if eol > 0 && buf.get_u8(eol - 1).ok() == Some(b'\r') {
                    eol -= 1;
                }
                Some(eol)
            }
            None => {
                self.offset = buf.readable_bytes();
                None
            }
        }
    }

    fn delimiter_len(buf: &dyn Readable, eol: usize) -> Result<usize, DecodeError> {
        let first = buf
            .get_u8(eol)
            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
        Ok(if first == b'\r' { 2 } else { 1 })
    }
}

impl FrameDecoder for LineDecoder {
    fn decode(
        &mut self,
        _ctx: &mut Ctx<'_>,
        buf: &mut dyn Readable,
    ) -> Result<Decoded, DecodeError> {
        let eol = self.find_eol(buf);
        if !self.discarding {
            match eol {
                Some(eol) => {
                    let len = eol - buf.reader_index();
                    let delim_len = Self::delimiter_len(buf, eol)?;
                    if len > self.max_len {
                        buf.set_reader_index(eol + delim_len)
                            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
                        return Err(DecodeError::FrameTooLarge {
                            len,
                            max: self.max_len,
                        });
                    }
                    let frame = if self.strip_delimiter {
                        let frame = buf
                            .read_retained_slice(len)
                            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
                        buf.skip(delim_len)
                            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
                        frame
                    } else {
                        buf.read_retained_slice(len + delim_len)
                            .map_err(|e| DecodeError::Corrupt(e.to_string()))?
                    };
                    Ok(Decoded::Frame(Message::Buf(frame)))
                }
                None => {
                    let len = buf.readable_bytes();
                    if len > self.max_len {
                        // Too long with no delimiter in sight: drop what
                        // we have and keep dropping until one shows up.
                        self.discarded = len;
                        buf.set_reader_index(buf.writer_index())
                            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
                        self.discarding = true;
                        self.offset = 0;
                        if self.fail_fast {
                            return Err(DecodeError::FrameTooLarge {
                                len: self.discarded,
                                max: self.max_len,
                            });
                        }
                    }
                    Ok(Decoded::NeedMore)
                }
            }
        } else {
            match eol {
                Some(eol) => {
                    let len = self.discarded + eol - buf.reader_index();
                    let delim_len = Self::delimiter_len(buf, eol)?;
                    buf.set_reader_index(eol + delim_len)
                        .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
                    self.discarded = 0;
                    self.discarding = false;
                    if !self.fail_fast {
                        return Err(DecodeError::FrameTooLarge {
                            len,
                            max: self.max_len,
                        });
                    }
                    Ok(Decoded::NeedMore)
                }
                None => {
                    self.discarded += buf.readable_bytes();
                    buf.set_reader_index(buf.writer_index())
                        .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
                    self.offset = 0;
                    Ok(Decoded::NeedMore)
                }
            }
        }
    }
}
