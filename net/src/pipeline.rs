//! Handler pipeline dispatch.
//!
//! Inbound events travel head to tail through the installed handlers; a
//! handler forwards an event by calling the matching `fire_*` method on its
//! [`Ctx`]. Outbound operations (`write`, `flush`, `close`) are buffered as
//! actions and applied by the channel after the dispatch unwinds, so a
//! handler never re-enters channel state mid-event.
//!
//! Removal of a handler that is currently being dispatched into is
//! deferred: the slot is marked removal-pending and the handler's
//! `handler_removed` hook runs when its call returns. A handler therefore
//! never observes itself half-removed.

use crate::channel::ChannelId;
use crate::message::Message;
use crate::outbound::OutboundShared;
use crate::promise::Promise;
use riptide_buffer::BufAllocator;
use std::any::Any;
use std::fmt;

/// Errors carried through the pipeline's exception path.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Out-of-band events delivered to handlers.
pub enum UserEvent {
    /// The peer shut down its write half; no more bytes will arrive, but
    /// the channel stays open for writing.
    InputShutdown,
    /// Application-defined event.
    Custom(Box<dyn Any + Send>),
}

impl fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserEvent::InputShutdown => f.write_str("InputShutdown"),
            UserEvent::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A stage in a channel's pipeline.
///
/// Default implementations forward every event to the next handler, so a
/// handler overrides only the events it cares about.
pub trait Handler: Send {
    /// The channel became active (connected or accepted).
    fn channel_active(&mut self, ctx: &mut Ctx<'_>) {
        ctx.fire_channel_active();
    }

    /// An inbound message arrived.
    fn channel_read(&mut self, ctx: &mut Ctx<'_>, msg: Message) {
        ctx.fire_channel_read(msg);
    }

    /// The current inbound batch was fully delivered.
    fn channel_read_complete(&mut self, ctx: &mut Ctx<'_>) {
        ctx.fire_channel_read_complete();
    }

    /// The channel closed.
    fn channel_inactive(&mut self, ctx: &mut Ctx<'_>) {
        ctx.fire_channel_inactive();
    }

    /// The channel's writability signal flipped.
    fn writability_changed(&mut self, ctx: &mut Ctx<'_>, writable: bool) {
        ctx.fire_writability_changed(writable);
    }

    /// An out-of-band event arrived.
    fn user_event(&mut self, ctx: &mut Ctx<'_>, event: UserEvent) {
        ctx.fire_user_event(event);
    }

    /// An error was raised by an earlier stage.
    fn exception_caught(&mut self, ctx: &mut Ctx<'_>, error: BoxError) {
        ctx.fire_exception(error);
    }

    /// The handler was removed from the pipeline.
    fn handler_removed(&mut self, _ctx: &mut Ctx<'_>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    /// An event is currently dispatched into this handler.
    Dispatching,
    /// Removal was requested mid-dispatch; applied on unwind.
    RemovalPending,
    Removed,
}

struct Slot {
    name: String,
    handler: Option<Box<dyn Handler>>,
    state: SlotState,
}

/// What falls off the tail of the pipeline: unclaimed messages, uncaught
/// errors, and batch-completion counts. The channel drains and logs these;
/// test channels inspect them.
#[derive(Default)]
pub(crate) struct TailSink {
    pub(crate) messages: Vec<Message>,
    pub(crate) errors: Vec<BoxError>,
    pub(crate) read_completes: u32,
}

/// Outbound operations buffered during dispatch, applied by the channel
/// afterwards.
#[derive(Default)]
pub(crate) struct Actions {
    pub(crate) writes: Vec<(Message, Promise)>,
    pub(crate) flush: bool,
    pub(crate) close: bool,
}

impl Actions {
    pub(crate) fn has_any(&self) -> bool {
        !self.writes.is_empty() || self.flush || self.close
    }
}

/// Per-dispatch channel facilities exposed to handlers.
pub(crate) struct Resources<'a> {
    pub(crate) alloc: &'a BufAllocator,
    pub(crate) outbound: &'a OutboundShared,
    pub(crate) channel_id: ChannelId,
}

/// The ordered set of handlers attached to one channel.
pub struct Pipeline {
    slots: Vec<Slot>,
    pub(crate) sink: TailSink,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            sink: TailSink::default(),
        }
    }

    /// Append a handler at the tail end.
    pub fn add_last(&mut self, name: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.slots.push(Slot {
            name: name.into(),
            handler: Some(Box::new(handler)),
            state: SlotState::Idle,
        });
        self
    }

    /// Names of the live handlers, head to tail.
    pub fn names(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| s.handler.is_some() && s.state != SlotState::Removed)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub(crate) fn fire_channel_active(&mut self, actions: &mut Actions, res: &Resources<'_>) {
        self.dispatch_active(0, actions, res);
    }

    pub(crate) fn fire_channel_read(
        &mut self,
        actions: &mut Actions,
        res: &Resources<'_>,
        msg: Message,
    ) {
        self.dispatch_read(0, actions, res, msg);
    }

    pub(crate) fn fire_channel_read_complete(&mut self, actions: &mut Actions, res: &Resources<'_>) {
        self.dispatch_read_complete(0, actions, res);
    }

    pub(crate) fn fire_channel_inactive(&mut self, actions: &mut Actions, res: &Resources<'_>) {
        self.dispatch_inactive(0, actions, res);
    }

    pub(crate) fn fire_writability_changed(
        &mut self,
        actions: &mut Actions,
        res: &Resources<'_>,
        writable: bool,
    ) {
        self.dispatch_writability(0, actions, res, writable);
    }

    pub(crate) fn fire_user_event(
        &mut self,
        actions: &mut Actions,
        res: &Resources<'_>,
        event: UserEvent,
    ) {
        self.dispatch_user_event(0, actions, res, event);
    }

    pub(crate) fn fire_exception(
        &mut self,
        actions: &mut Actions,
        res: &Resources<'_>,
        error: BoxError,
    ) {
        self.dispatch_exception(0, actions, res, error);
    }

    /// Remove a handler by name. Immediate when the handler is idle;
    /// deferred to unwind when it is currently being dispatched into.
    pub(crate) fn remove(
        &mut self,
        name: &str,
        actions: &mut Actions,
        res: &Resources<'_>,
    ) -> bool {
        match self.index_of(name) {
            Some(idx) => self.remove_at(idx, actions, res),
            None => false,
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.name == name && !matches!(s.state, SlotState::Removed | SlotState::RemovalPending)
        })
    }

    fn remove_at(&mut self, idx: usize, actions: &mut Actions, res: &Resources<'_>) -> bool {
        match self.slots[idx].state {
            SlotState::Idle => {
                let Some(mut handler) = self.slots[idx].handler.take() else {
                    return false;
                };
                self.slots[idx].state = SlotState::Removed;
                let mut ctx = Ctx {
                    pipeline: self,
                    actions,
                    res,
                    index: idx,
                };
                handler.handler_removed(&mut ctx);
                true
            }
            SlotState::Dispatching => {
                self.slots[idx].state = SlotState::RemovalPending;
                true
            }
            SlotState::RemovalPending | SlotState::Removed => false,
        }
    }

    fn next_live(&self, from: usize) -> Option<usize> {
        (from..self.slots.len())
            .find(|&i| self.slots[i].state == SlotState::Idle && self.slots[i].handler.is_some())
    }

    fn invoke<F>(&mut self, idx: usize, actions: &mut Actions, res: &Resources<'_>, f: F)
    where
        F: FnOnce(&mut dyn Handler, &mut Ctx<'_>),
    {
        let Some(mut handler) = self.slots[idx].handler.take() else {
            return;
        };
        self.slots[idx].state = SlotState::Dispatching;
        {
            let mut ctx = Ctx {
                pipeline: self,
                actions,
                res,
                index: idx,
            };
            f(handler.as_mut(), &mut ctx);
        }
        match self.slots[idx].state {
            SlotState::RemovalPending => {
                self.slots[idx].state = SlotState::Removed;
                let mut ctx = Ctx {
                    pipeline: self,
                    actions,
                    res,
                    index: idx,
                };
                handler.handler_removed(&mut ctx);
            }
            _ => {
                self.slots[idx].handler = Some(handler);
                self.slots[idx].state = SlotState::Idle;
            }
        }
    }

    fn dispatch_active(&mut self, from: usize, actions: &mut Actions, res: &Resources<'_>) {
        if let Some(idx) = self.next_live(from) {
            self.invoke(idx, actions, res, |h, ctx| h.channel_active(ctx));
        }
    }

    fn dispatch_read(
        &mut self,
        from: usize,
        actions: &mut Actions,
        res: &Resources<'_>,
        msg: Message,
    ) {
        match self.next_live(from) {
            Some(idx) => self.invoke(idx, actions, res, |h, ctx| h.channel_read(ctx, msg)),
            None => self.sink.messages.push(msg),
        }
    }

    fn dispatch_read_complete(&mut self, from: usize, actions: &mut Actions, res: &Resources<'_>) {
        match self.next_live(from) {
            Some(idx) => self.invoke(idx, actions, res, |h, ctx| h.channel_read_complete(ctx)),
            None => self.sink.read_completes += 1,
        }
    }

    fn dispatch_inactive(&mut self, from: usize, actions: &mut Actions, res: &Resources<'_>) {
        if let Some(idx) = self.next_live(from) {
            self.invoke(idx, actions, res, |h, ctx| h.channel_inactive(ctx));
        }
    }

    fn dispatch_writability(
        &mut self,
        from: usize,
        actions: &mut Actions,
        res: &Resources<'_>,
        writable: bool,
    ) {
        if let Some(idx) = self.next_live(from) {
            self.invoke(idx, actions, res, |h, ctx| {
                h.writability_changed(ctx, writable)
            });
        }
    }

    fn dispatch_user_event(
        &mut self,
        from: usize,
        actions: &mut Actions,
        res: &Resources<'_>,
        event: UserEvent,
    ) {
        if let Some(idx) = self.next_live(from) {
            self.invoke(idx, actions, res, |h, ctx| h.user_event(ctx, event));
        }
    }

    fn dispatch_exception(
        &mut self,
        from: usize,
        actions: &mut Actions,
        res: &Resources<'_>,
        error: BoxError,
    ) {
        match self.next_live(from) {
            Some(idx) => self.invoke(idx, actions, res, |h, ctx| h.exception_caught(ctx, error)),
            None => self.sink.errors.push(error),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// The view a handler gets of its pipeline position and channel during one
/// event dispatch.
pub struct Ctx<'a> {
    pipeline: &'a mut Pipeline,
    actions: &'a mut Actions,
    res: &'a Resources<'a>,
    index: usize,
}

impl<'a> Ctx<'a> {
    /// This handler's registered name.
    pub fn name(&self) -> &str {
        &self.pipeline.slots[self.index].name
    }

    pub fn channel_id(&self) -> ChannelId {
        self.res.channel_id
    }

    /// The channel's buffer allocator.
    pub fn alloc(&self) -> &BufAllocator {
        self.res.alloc
    }

    /// Current writability signal of the channel's write queue.
    pub fn is_writable(&self) -> bool {
        self.res.outbound.is_writable()
    }

    /// Pending outbound bytes, including per-entry overhead.
    pub fn pending_outbound_bytes(&self) -> usize {
        self.res.outbound.total_pending_bytes()
    }

    /// Queue a write. Not transmitted until a flush.
    pub fn write(&mut self, msg: Message) -> Promise {
        let promise = Promise::new();
        self.actions.writes.push((msg, promise.clone()));
        promise
    }

    /// Request promotion and transmission of queued writes.
    pub fn flush(&mut self) {
        self.actions.flush = true;
    }

    pub fn write_and_flush(&mut self, msg: Message) -> Promise {
        let promise = self.write(msg);
        self.flush();
        promise
    }

    /// Request the channel be closed once dispatch unwinds.
    pub fn close(&mut self) {
        self.actions.close = true;
    }

    /// Remove this handler. Deferred until the current event returns.
    pub fn remove_self(&mut self) -> bool {
        self.pipeline.remove_at(self.index, self.actions, self.res)
    }

    /// Remove a handler by name.
    pub fn remove_handler(&mut self, name: &str) -> bool {
        self.pipeline.remove(name, self.actions, self.res)
    }

    /// Whether removal of this handler was requested during the current
    /// dispatch and is waiting for it to unwind.
    pub fn removal_pending(&self) -> bool {
        self.pipeline.slots[self.index].state == SlotState::RemovalPending
    }

    pub fn fire_channel_active(&mut self) {
        self.pipeline
            .dispatch_active(self.index + 1, self.actions, self.res);
    }

    pub fn fire_channel_read(&mut self, msg: Message) {
        self.pipeline
            .dispatch_read(self.index + 1, self.actions, self.res, msg);
    }

    pub fn fire_channel_read_complete(&mut self) {
        self.pipeline
            .dispatch_read_complete(self.index + 1, self.actions, self.res);
    }

    pub fn fire_channel_inactive(&mut self) {
        self.pipeline
            .dispatch_inactive(self.index + 1, self.actions, self.res);
    }

    pub fn fire_writability_changed(&mut self, writable: bool) {
        self.pipeline
            .dispatch_writability(self.index + 1, self.actions, self.res, writable);
    }

    pub fn fire_user_event(&mut self, event: UserEvent) {
        self.pipeline
            .dispatch_user_event(self.index + 1, self.actions, self.res, event);
    }

    pub fn fire_exception(&mut self, error: BoxError) {
        self.pipeline
            .dispatch_exception(self.index + 1, self.actions, self.res, error);
    }
}
