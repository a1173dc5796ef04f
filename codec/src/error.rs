//! Decode error types.

/// Errors raised while extracting frames from the byte stream.
///
/// Running out of bytes is not an error: a decoder signals it by returning
/// [`Decoded::NeedMore`](crate::Decoded::NeedMore), and the accumulator
/// waits for the next read.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The decoder emitted a frame without consuming any input. Surfaced
    /// loudly since such a decoder would spin forever.
    #[error("decoder produced output without consuming input")]
    NoProgress,

    /// A frame exceeded the configured maximum length.
    #[error("frame length {len} exceeds the allowed maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// The byte stream violated the framing rules.
    #[error("corrupt frame: {0}")]
    Corrupt(String),
}
