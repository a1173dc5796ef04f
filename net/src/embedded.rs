//! An in-memory channel for exercising pipelines without sockets.
//!
//! Events are fed in synchronously and everything that would go to the
//! wire or fall off the pipeline tail is captured for inspection. Codec
//! and handler tests drive this instead of a live event loop.

use crate::channel::ChannelId;
use crate::message::Message;
use crate::outbound::OutboundShared;
use crate::pipeline::{Actions, BoxError, Pipeline, Resources, UserEvent};
use crate::promise::Promise;
use riptide_buffer::BufAllocator;
use std::sync::Arc;

/// A pipeline harness with no I/O underneath.
pub struct EmbeddedChannel {
    pipeline: Pipeline,
    actions: Actions,
    alloc: BufAllocator,
    outbound_state: Arc<OutboundShared>,
    /// Writes staged but not yet flushed.
    staged: Vec<(Message, Promise)>,
    /// Flushed writes, in order.
    outbound: Vec<Message>,
    active: bool,
    closed: bool,
}

impl EmbeddedChannel {
    pub fn new() -> Self {
        Self {
            pipeline: Pipeline::new(),
            actions: Actions::default(),
            alloc: BufAllocator::default(),
            outbound_state: Arc::new(OutboundShared::default()),
            staged: Vec::new(),
            outbound: Vec::new(),
            active: false,
            closed: false,
        }
    }

    /// Append a handler to the pipeline.
    pub fn add_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl crate::pipeline::Handler + 'static,
    ) -> &mut Self {
        self.pipeline.add_last(name, handler);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.pipeline.names()
    }

    /// Feed one inbound message through the pipeline, firing the
    /// activation event first if this is the first interaction, and a
    /// read-complete after.
    pub fn write_inbound(&mut self, msg: Message) {
        self.ensure_active();
        let res = Resources {
            alloc: &self.alloc,
            outbound: &self.outbound_state,
            channel_id: ChannelId(0),
        };
        self.pipeline.fire_channel_read(&mut self.actions, &res, msg);
        self.pipeline
            .fire_channel_read_complete(&mut self.actions, &res);
        self.run_actions();
    }

    /// Deliver an out-of-band event.
    pub fn fire_user_event(&mut self, event: UserEvent) {
        self.ensure_active();
        let res = Resources {
            alloc: &self.alloc,
            outbound: &self.outbound_state,
            channel_id: ChannelId(0),
        };
        self.pipeline.fire_user_event(&mut self.actions, &res, event);
        self.run_actions();
    }

    /// Remove a handler by name, honoring in-dispatch deferral.
    pub fn remove_handler(&mut self, name: &str) -> bool {
        let res = Resources {
            alloc: &self.alloc,
            outbound: &self.outbound_state,
            channel_id: ChannelId(0),
        };
        let removed = self.pipeline.remove(name, &mut self.actions, &res);
        self.run_actions();
        removed
    }

    /// Close the channel: fires the inactive event through the pipeline.
    pub fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.active {
            self.active = false;
            let res = Resources {
                alloc: &self.alloc,
                outbound: &self.outbound_state,
                channel_id: ChannelId(0),
            };
            self.pipeline.fire_channel_inactive(&mut self.actions, &res);
            self.run_actions();
        }
    }

    /// Next message that traversed the whole pipeline inbound.
    pub fn read_inbound(&mut self) -> Option<Message> {
        if self.pipeline.sink.messages.is_empty() {
            None
        } else {
            Some(self.pipeline.sink.messages.remove(0))
        }
    }

    /// Next message written and flushed outbound.
    pub fn read_outbound(&mut self) -> Option<Message> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.remove(0))
        }
    }

    /// Errors that fell off the exception path uncaught.
    pub fn take_errors(&mut self) -> Vec<BoxError> {
        std::mem::take(&mut self.pipeline.sink.errors)
    }

    /// Read-complete events that reached the tail.
    pub fn read_complete_count(&self) -> u32 {
        self.pipeline.sink.read_completes
    }

    fn ensure_active(&mut self) {
        if self.active || self.closed {
            return;
        }
        self.active = true;
        let res = Resources {
            alloc: &self.alloc,
            outbound: &self.outbound_state,
            channel_id: ChannelId(0),
        };
        self.pipeline.fire_channel_active(&mut self.actions, &res);
        self.run_actions();
    }

    fn run_actions(&mut self) {
        loop {
            if !self.actions.has_any() {
                return;
            }
            let Actions {
                writes,
                flush,
                close,
            } = std::mem::take(&mut self.actions);
            self.staged.extend(writes);
            if flush {
                for (msg, promise) in self.staged.drain(..) {
                    if promise.set_uncancellable() {
                        self.outbound.push(msg);
                        promise.try_success();
                    }
                }
            }
            if close {
                self.finish();
            }
        }
    }
}

impl Default for EmbeddedChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Ctx, Handler};
    use riptide_buffer::ByteBuf;

    /// Uppercases inbound bytes and forwards them.
    struct Upcase;

    impl Handler for Upcase {
        fn channel_read(&mut self, ctx: &mut Ctx<'_>, msg: Message) {
            let buf = match msg {
                Message::Buf(buf) => buf,
                other => {
                    ctx.fire_channel_read(other);
                    return;
                }
            };
            let mut out = ctx.alloc().alloc(buf.readable_bytes());
            for b in buf.readable() {
                out.put_u8(b.to_ascii_uppercase()).unwrap();
            }
            ctx.fire_channel_read(Message::Buf(out));
        }
    }

    /// Echoes inbound buffers back as writes.
    struct Echo;

    impl Handler for Echo {
        fn channel_read(&mut self, ctx: &mut Ctx<'_>, msg: Message) {
            ctx.write_and_flush(msg);
        }
    }

    #[test]
    fn test_inbound_traverses_handlers_in_order() {
        let mut ch = EmbeddedChannel::new();
        ch.add_handler("upcase", Upcase);

        ch.write_inbound(Message::Buf(ByteBuf::from_slice(b"hello")));
        let msg = ch.read_inbound().unwrap();
        assert_eq!(msg.as_buf().unwrap().readable(), b"HELLO");
        assert_eq!(ch.read_complete_count(), 1);
    }

    #[test]
    fn test_write_and_flush_reaches_outbound() {
        let mut ch = EmbeddedChannel::new();
        ch.add_handler("echo", Echo);

        ch.write_inbound(Message::Buf(ByteBuf::from_slice(b"ping")));
        let out = ch.read_outbound().unwrap();
        assert_eq!(out.as_buf().unwrap().readable(), b"ping");
        assert!(ch.read_inbound().is_none());
    }

    #[test]
    fn test_unhandled_message_falls_to_tail() {
        let mut ch = EmbeddedChannel::new();
        ch.write_inbound(Message::Buf(ByteBuf::from_slice(b"x")));
        assert!(ch.read_inbound().is_some());
    }

    /// Removes itself upon the first read, mid-dispatch.
    struct RemoveSelfOnRead {
        removed_during_call: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Handler for RemoveSelfOnRead {
        fn channel_read(&mut self, ctx: &mut Ctx<'_>, msg: Message) {
            ctx.remove_self();
            // Deferred: the slot is only marked, we still run to
            // completion.
            self.removed_during_call
                .store(ctx.removal_pending(), std::sync::atomic::Ordering::SeqCst);
            ctx.fire_channel_read(msg);
        }

        fn handler_removed(&mut self, _ctx: &mut Ctx<'_>) {}
    }

    #[test]
    fn test_self_removal_is_deferred_to_unwind() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut ch = EmbeddedChannel::new();
        ch.add_handler(
            "once",
            RemoveSelfOnRead {
                removed_during_call: flag.clone(),
            },
        );

        ch.write_inbound(Message::Buf(ByteBuf::from_slice(b"a")));
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
        assert!(ch.handler_names().is_empty());

        // Subsequent reads skip the removed slot.
        ch.write_inbound(Message::Buf(ByteBuf::from_slice(b"b")));
        assert_eq!(ch.read_inbound().unwrap().as_buf().unwrap().readable(), b"a");
        assert_eq!(ch.read_inbound().unwrap().as_buf().unwrap().readable(), b"b");
    }
}
