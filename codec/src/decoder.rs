//! Byte-stream accumulation driving user frame extraction.

use crate::error::DecodeError;
use riptide_buffer::{BufAllocator, ByteBuf, CompositeBuf, Readable};
use riptide_net::pipeline::{Ctx, Handler, UserEvent};
use riptide_net::Message;
use serde::Deserialize;
use tracing::trace;

/// One decode attempt's result.
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame was extracted.
    Frame(Message),
    /// Not enough bytes yet; leave the rest accumulated.
    NeedMore,
}

/// Extracts frames from the accumulated byte stream.
///
/// `decode` is called repeatedly while the accumulation stays readable and
/// the previous call made progress (consumed bytes or produced a frame).
/// Returning a frame without consuming bytes is reported as a decoder bug.
///
/// An `Err` is surfaced through the pipeline's exception path but does not
/// end the pass by itself: a decoder that can recover should consume past
/// the offending bytes before returning the error, and decoding continues
/// over whatever remains.
pub trait FrameDecoder: Send {
    fn decode(
        &mut self,
        ctx: &mut Ctx<'_>,
        buf: &mut dyn Readable,
    ) -> Result<Decoded, DecodeError>;

    /// Final decode when the input side closes. Defaults to a plain
    /// `decode`; override to flush a partial frame.
    fn decode_last(
        &mut self,
        ctx: &mut Ctx<'_>,
        buf: &mut dyn Readable,
    ) -> Result<Decoded, DecodeError> {
        self.decode(ctx, buf)
    }
}

/// How inbound fragments are accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CumulateStrategy {
    /// Append into one contiguous buffer, reallocating when the current
    /// one is out of room or shared.
    #[default]
    Merge,
    /// Chain fragments into a composite view without copying.
    Composite,
}

/// Accumulator tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    /// Reads between compaction attempts on a partially-consumed
    /// accumulation.
    #[serde(default = "default_discard_after_reads")]
    pub discard_after_reads: u32,

    /// Stop after the first frame of each read event.
    #[serde(default)]
    pub single_decode: bool,

    #[serde(default)]
    pub strategy: CumulateStrategy,
}

fn default_discard_after_reads() -> u32 {
    16
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            discard_after_reads: default_discard_after_reads(),
            single_decode: false,
            strategy: CumulateStrategy::default(),
        }
    }
}

enum Cumulation {
    Single(ByteBuf),
    Composite(CompositeBuf),
}

impl Cumulation {
    fn readable_bytes(&self) -> usize {
        match self {
            Cumulation::Single(b) => b.readable_bytes(),
            Cumulation::Composite(c) => Readable::readable_bytes(c),
        }
    }

    fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    fn as_readable(&mut self) -> &mut dyn Readable {
        match self {
            Cumulation::Single(b) => b,
            Cumulation::Composite(c) => c,
        }
    }
}

/// Pipeline handler that accumulates inbound byte fragments and drives a
/// [`FrameDecoder`] over them.
///
/// Non-buffer messages pass through untouched. The accumulation is
/// released as soon as it is fully consumed; while it is partially
/// consumed, it is compacted every `discard_after_reads` reads unless the
/// first inbound fragment is still being used in place or user code holds
/// a retained slice of it.
pub struct StreamDecoder<D: FrameDecoder> {
    decoder: D,
    config: DecoderConfig,
    cumulation: Option<Cumulation>,
    /// The accumulation is the adopted first fragment, not an allocation
    /// of ours: in-place compaction would move bytes the producer may
    /// still reference.
    first_read: bool,
    num_reads: u32,
    /// Recycled output list for decoded frames.
    out: Vec<Message>,
}

impl<D: FrameDecoder> StreamDecoder<D> {
    pub fn new(decoder: D) -> Self {
        Self::with_config(decoder, DecoderConfig::default())
    }

    pub fn with_config(decoder: D, config: DecoderConfig) -> Self {
        Self {
            decoder,
            config,
            cumulation: None,
            first_read: false,
            num_reads: 0,
            out: Vec::new(),
        }
    }

    /// Adopt or append the inbound fragment.
    fn cumulate(&mut self, alloc: &BufAllocator, input: ByteBuf) {
        match self.cumulation.take() {
            None => {
                self.first_read = true;
                self.cumulation = Some(Cumulation::Single(input));
            }
            Some(existing) => {
                let next = match self.config.strategy {
                    CumulateStrategy::Merge => {
                        Cumulation::Single(self.merge(alloc, existing, input))
                    }
                    CumulateStrategy::Composite => self.compose(alloc, existing, input),
                };
                self.cumulation = Some(next);
            }
        }
    }

    /// Contiguous accumulation. Expands into a fresh allocation when the
    /// current buffer is out of room or shared; the input fragment is
    /// always consumed.
    fn merge(&mut self, alloc: &BufAllocator, existing: Cumulation, mut input: ByteBuf) -> ByteBuf {
        let mut buf = match existing {
            Cumulation::Single(b) => b,
            Cumulation::Composite(c) => {
                self.first_read = false;
                c.linearize()
            }
        };
        if buf.writable_bytes() < input.readable_bytes() || buf.ref_count() > 1 {
            let mut fresh = alloc.alloc(buf.readable_bytes() + input.readable_bytes());
            fresh.put_buf(&mut buf).expect("sized to fit");
            fresh.put_buf(&mut input).expect("sized to fit");
            // The old accumulation and the input release here; the
            // accumulation is now our own allocation, so compaction is
            // allowed again.
            self.first_read = false;
            fresh
        } else {
            buf.put_buf(&mut input).expect("room verified");
            buf
        }
    }

    /// Zero-copy accumulation: the input joins a composite view. A shared
    /// single-buffer accumulation falls back to a merge copy.
    fn compose(&mut self, alloc: &BufAllocator, existing: Cumulation, input: ByteBuf) -> Cumulation {
        match existing {
            Cumulation::Single(b) if b.ref_count() > 1 => Cumulation::Single(self.merge(
                alloc,
                Cumulation::Single(b),
                input,
            )),
            Cumulation::Single(b) => {
                let mut composite = CompositeBuf::new();
                composite.add_component(b);
                composite.add_component(input);
                self.first_read = false;
                Cumulation::Composite(composite)
            }
            Cumulation::Composite(mut c) => {
                c.add_component(input);
                Cumulation::Composite(c)
            }
        }
    }

    /// Drive the user decoder while it makes progress.
    fn call_decode(&mut self, ctx: &mut Ctx<'_>, out: &mut Vec<Message>) {
        let Self {
            decoder,
            config,
            cumulation,
            ..
        } = self;
        let Some(cum) = cumulation.as_mut() else {
            return;
        };
        loop {
            if !cum.is_readable() {
                break;
            }
            let buf = cum.as_readable();
            let out_before = out.len();
            let reader_before = buf.reader_index();

            match decoder.decode(ctx, buf) {
                Ok(Decoded::Frame(msg)) => out.push(msg),
                Ok(Decoded::NeedMore) => {}
                // A decode failure is a per-frame event, not the end of
                // the pass: the decoder reports it after consuming the
                // offending bytes (the line decoder skips past an
                // oversized line, for example), so the usual progress
                // check below decides whether to keep going over the
                // remaining input.
                Err(e) => ctx.fire_exception(Box::new(e)),
            }

            // The user decode may have removed this handler; finish the
            // in-flight call but decode no further.
            if ctx.removal_pending() {
                break;
            }

            let produced = out.len() > out_before;
            let consumed = buf.reader_index() != reader_before;
            match (produced, consumed) {
                (false, false) => break,
                (true, false) => {
                    ctx.fire_exception(Box::new(DecodeError::NoProgress));
                    break;
                }
                _ => {}
            }
            if produced && config.single_decode {
                break;
            }
        }
    }

    /// Release the accumulation if it drained; otherwise count the read
    /// toward the next compaction.
    fn trim_cumulation(&mut self) {
        let drained = self
            .cumulation
            .as_ref()
            .is_some_and(|c| !c.is_readable());
        if drained {
            self.cumulation = None;
            self.first_read = false;
            self.num_reads = 0;
        } else if self.cumulation.is_some() {
            self.num_reads += 1;
            if self.num_reads >= self.config.discard_after_reads {
                self.num_reads = 0;
                self.discard_some_read_bytes();
            }
        }
    }

    fn discard_some_read_bytes(&mut self) {
        match self.cumulation.as_mut() {
            // The adopted first fragment is compacted only once replaced
            // by an allocation of ours; the buffer itself additionally
            // refuses while retained slices share the region.
            Some(Cumulation::Single(b)) if !self.first_read => {
                b.discard_some_read_bytes();
            }
            Some(Cumulation::Composite(c)) => {
                c.discard_read_components();
            }
            _ => {}
        }
    }

    /// Final decode pass when no more bytes will arrive.
    fn input_closed(&mut self, ctx: &mut Ctx<'_>, call_inactive: bool) {
        let mut out = std::mem::take(&mut self.out);
        self.call_decode(ctx, &mut out);

        if !ctx.removal_pending() {
            let Self {
                decoder,
                cumulation,
                ..
            } = self;
            if let Some(cum) = cumulation.as_mut() {
                if cum.is_readable() {
                    match decoder.decode_last(ctx, cum.as_readable()) {
                        Ok(Decoded::Frame(msg)) => out.push(msg),
                        Ok(Decoded::NeedMore) => {}
                        Err(e) => ctx.fire_exception(Box::new(e)),
                    }
                }
            }
        }

        self.cumulation = None;
        self.first_read = false;
        self.num_reads = 0;

        let emitted = !out.is_empty();
        for msg in out.drain(..) {
            ctx.fire_channel_read(msg);
        }
        self.out = out;
        if emitted {
            ctx.fire_channel_read_complete();
        }
        if call_inactive {
            ctx.fire_channel_inactive();
        }
    }
}

impl<D: FrameDecoder> Handler for StreamDecoder<D> {
    fn channel_read(&mut self, ctx: &mut Ctx<'_>, msg: Message) {
        let input = match msg {
            Message::Buf(buf) => buf,
            other => {
                // Not ours; pass through untouched.
                ctx.fire_channel_read(other);
                return;
            }
        };
        self.cumulate(ctx.alloc(), input);

        let mut out = std::mem::take(&mut self.out);
        self.call_decode(ctx, &mut out);
        self.trim_cumulation();

        trace!(frames = out.len(), "decode pass");
        for msg in out.drain(..) {
            ctx.fire_channel_read(msg);
        }
        self.out = out;
    }

    fn channel_read_complete(&mut self, ctx: &mut Ctx<'_>) {
        self.num_reads = 0;
        self.discard_some_read_bytes();
        ctx.fire_channel_read_complete();
    }

    fn channel_inactive(&mut self, ctx: &mut Ctx<'_>) {
        self.input_closed(ctx, true);
    }

    fn user_event(&mut self, ctx: &mut Ctx<'_>, event: UserEvent) {
        if matches!(event, UserEvent::InputShutdown) {
            self.input_closed(ctx, false);
        }
        ctx.fire_user_event(event);
    }

    /// Hand any undecoded bytes downstream as one raw read before the
    /// handler disappears.
    fn handler_removed(&mut self, ctx: &mut Ctx<'_>) {
        let Some(cumulation) = self.cumulation.take() else {
            return;
        };
        self.first_read = false;
        self.num_reads = 0;
        if !cumulation.is_readable() {
            return;
        }
        let buf = match cumulation {
            Cumulation::Single(b) => b,
            Cumulation::Composite(c) => c.linearize(),
        };
        ctx.fire_channel_read(Message::Buf(buf));
        ctx.fire_channel_read_complete();
    }
}
