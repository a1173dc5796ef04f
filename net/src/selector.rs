//! Selector abstraction over the OS readiness API.
//!
//! The event loop drives a boxed [`Selector`] so busy-spin recovery can
//! swap in a fresh instance, and so tests can script readiness without
//! touching the OS. The production implementation, [`PollSelector`], wraps
//! `mio::Poll` (epoll/kqueue).
//!
//! Sockets register edge-triggered for both readability and writability;
//! the logical interest ops ([`Ops`]) a channel tracks decide which
//! readiness bits the loop acts on. Readiness transitions arrive once,
//! state is cached per channel, and interest never needs reregistration on
//! the hot path.

use crate::ops::Ops;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Token the selector reserves for its own wakeup channel. `usize::MAX`
/// itself is reserved by mio.
pub const WAKER_TOKEN: usize = usize::MAX - 1;

/// One readiness report: which channel, and which of its interest ops the
/// OS satisfied. `ops` may be empty; the loop treats that as readable to
/// defuse spurious-wakeup loops.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: usize,
    pub ops: Ops,
}

/// Cross-thread wakeup handle for a blocked selector.
pub trait Wake: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

impl Wake for mio::Waker {
    fn wake(&self) -> io::Result<()> {
        mio::Waker::wake(self)
    }
}

/// OS readiness multiplexer owned by one event loop.
pub trait Selector: Send {
    /// Block until readiness, wakeup, or timeout. `None` blocks
    /// indefinitely. Returns the number of channel readiness events.
    fn select(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Poll readiness without blocking.
    fn select_now(&mut self) -> io::Result<usize>;

    /// Move the ready set gathered by the last select into `out`,
    /// replacing its contents.
    fn drain_ready(&mut self, out: &mut Vec<Ready>);

    /// Register a source under `token` with the given logical interest.
    fn register(
        &mut self,
        source: &mut dyn mio::event::Source,
        token: usize,
        ops: Ops,
    ) -> io::Result<()>;

    /// Remove a source's registration.
    fn deregister(&mut self, source: &mut dyn mio::event::Source) -> io::Result<()>;

    /// Handle that unblocks a pending or future `select` from any thread.
    fn wake_handle(&self) -> Arc<dyn Wake>;

    /// Open a fresh selector of the same kind, for busy-spin recovery.
    /// The caller re-registers every live source before swapping.
    fn replacement(&self) -> io::Result<Box<dyn Selector>>;
}

/// `mio::Poll`-backed selector.
pub struct PollSelector {
    poll: mio::Poll,
    events: mio::Events,
    ready: Vec<Ready>,
    waker: Arc<mio::Waker>,
}

impl PollSelector {
    pub fn open() -> io::Result<Self> {
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(WAKER_TOKEN))?);
        Ok(Self {
            poll,
            events: mio::Events::with_capacity(1024),
            ready: Vec::with_capacity(1024),
            waker,
        })
    }

    fn gather(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.ready.clear();
        self.poll.poll(&mut self.events, timeout)?;
        for event in self.events.iter() {
            let token = event.token().0;
            if token == WAKER_TOKEN {
                continue;
            }
            let mut ops = Ops::NONE;
            if event.is_readable() {
                ops.insert(Ops::READ);
            }
            if event.is_writable() {
                ops.insert(Ops::WRITE);
            }
            self.ready.push(Ready { token, ops });
        }
        Ok(self.ready.len())
    }
}

impl Selector for PollSelector {
    fn select(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.gather(timeout)
    }

    fn select_now(&mut self) -> io::Result<usize> {
        self.gather(Some(Duration::ZERO))
    }

    fn drain_ready(&mut self, out: &mut Vec<Ready>) {
        out.clear();
        out.append(&mut self.ready);
    }

    fn register(
        &mut self,
        source: &mut dyn mio::event::Source,
        token: usize,
        ops: Ops,
    ) -> io::Result<()> {
        // Accept-only sources never need writability; everything else is
        // registered for both edges and gated by the logical ops.
        let interest = if ops.contains(Ops::ACCEPT) {
            mio::Interest::READABLE
        } else {
            mio::Interest::READABLE | mio::Interest::WRITABLE
        };
        self.poll
            .registry()
            .register(source, mio::Token(token), interest)
    }

    fn deregister(&mut self, source: &mut dyn mio::event::Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    fn wake_handle(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }

    fn replacement(&self) -> io::Result<Box<dyn Selector>> {
        Ok(Box::new(PollSelector::open()?))
    }
}
