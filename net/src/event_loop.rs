//! The reactor event loop.
//!
//! A single thread owns one selector and every channel registered with it.
//! Each iteration selects for readiness, services ready channels, then
//! drains queued tasks under a time budget derived from the configured
//! I/O ratio. Cross-thread callers never touch loop state directly; they
//! submit tasks through a [`LoopHandle`] and wake the selector.
//!
//! # Wake-up discipline
//!
//! `wakeup_pending` is reset to `false` immediately before the blocking
//! select. A producer that wins the CAS from `false` to `true` issues one
//! selector wakeup. A wakeup can land between the reset and the block,
//! leaving the flag set while the selector still unblocked for another
//! reason; the loop repairs that race by re-issuing the wakeup right after
//! the select returns, so the flag and the selector never deadlock.
//!
//! # Busy-spin recovery
//!
//! A selector bug can make the blocking select return instantly with no
//! readiness, no wakeup, and time left on its timeout. The loop counts
//! consecutive premature returns and, at the configured threshold,
//! transplants every registration onto a freshly opened selector and
//! swaps it in.

use crate::channel::{bind_listener, ChannelId, ReadOutcome, Registered, ServerChannel, TcpChannel};
use crate::config::ReactorConfig;
use crate::error::NetError;
use crate::message::Message;
use crate::metrics::{
    CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, SELECTOR_REBUILDS, SELECTOR_WAKEUPS, TASKS_EXECUTED,
};
use crate::ops::Ops;
use crate::pipeline::Pipeline;
use crate::promise::Promise;
use crate::selector::{PollSelector, Ready, Selector, Wake};
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use riptide_buffer::BufAllocator;
use slab::Slab;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Cancelled keys tolerated before forcing a fresh select mid-iteration.
const CLEANUP_INTERVAL: u32 = 256;

/// Tasks drained between clock checks while a budget is active.
const TASK_CLOCK_CHECK_INTERVAL: u64 = 64;

/// Back-off after a failed selector rebuild to avoid a hot error loop.
const REBUILD_BACKOFF: Duration = Duration::from_secs(1);

/// A unit of work executed on the loop thread.
pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Wakeup flag and the waker for the loop's current selector. The waker
/// slot is swapped on selector rebuild.
pub(crate) struct WakeupState {
    pending: AtomicBool,
    waker: Mutex<Arc<dyn Wake>>,
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    task: Option<Task>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Single-threaded reactor driving one selector.
pub struct EventLoop {
    selector: Box<dyn Selector>,
    channels: Slab<Registered>,
    tasks: Arc<Injector<Task>>,
    scheduled: BinaryHeap<Reverse<Scheduled>>,
    wakeup: Arc<WakeupState>,
    shutdown: Arc<AtomicBool>,
    thread: Arc<OnceLock<ThreadId>>,
    config: ReactorConfig,
    alloc: BufAllocator,
    ready: Vec<Ready>,
    /// Consecutive premature selector returns.
    select_count: u32,
    cancelled_keys: u32,
    needs_reselect: bool,
    timer_seq: u64,
}

impl EventLoop {
    /// Create an event loop over the OS selector.
    pub fn new(config: ReactorConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let selector = PollSelector::open()?;
        Ok(Self::with_selector(config, Box::new(selector)))
    }

    /// Create an event loop over a custom selector implementation.
    pub fn with_selector(config: ReactorConfig, selector: Box<dyn Selector>) -> Self {
        let read_buffer_size = config.read_buffer_size;
        let wakeup = Arc::new(WakeupState {
            pending: AtomicBool::new(false),
            waker: Mutex::new(selector.wake_handle()),
        });
        Self {
            selector,
            channels: Slab::new(),
            tasks: Arc::new(Injector::new()),
            scheduled: BinaryHeap::new(),
            wakeup,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Arc::new(OnceLock::new()),
            config,
            alloc: BufAllocator::new(read_buffer_size),
            ready: Vec::with_capacity(1024),
            select_count: 0,
            cancelled_keys: 0,
            needs_reselect: false,
            timer_seq: 0,
        }
    }

    /// A cloneable, `Send` handle for submitting work from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tasks: self.tasks.clone(),
            wakeup: self.wakeup.clone(),
            shutdown: self.shutdown.clone(),
            thread: self.thread.clone(),
        }
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    /// Number of registered channels (connections and listeners).
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Run until shutdown is requested and every channel has closed.
    pub fn run(mut self) {
        let _ = self.thread.set(std::thread::current().id());
        debug!(io_ratio = self.config.io_ratio, "event loop started");
        while self.run_once() {}
        debug!("event loop stopped");
    }

    /// One loop iteration. Returns `false` once shutdown completed.
    pub(crate) fn run_once(&mut self) -> bool {
        if self.has_tasks() {
            // Tasks are waiting: peek at readiness without blocking so
            // neither side starves.
            if let Err(e) = self.selector.select_now() {
                warn!(%e, "non-blocking select failed");
            }
        } else {
            self.blocking_select();
        }

        // Race repair: a wakeup that landed after the flag reset but
        // before the block must not be absorbed silently, or the flag
        // stays set while the selector sleeps on the next iteration.
        if self.wakeup.pending.load(Ordering::Acquire) {
            let _ = self.wakeup.waker.lock().wake();
        }

        let io_start = Instant::now();
        self.process_ready();
        let io_time = io_start.elapsed();

        self.run_tasks(task_budget(self.config.io_ratio, io_time));

        if self.shutdown.load(Ordering::Acquire) {
            self.close_all(NetError::LoopShutDown);
            self.scheduled.clear();
            if self.channels.is_empty() && self.tasks.is_empty() {
                return false;
            }
        }
        true
    }

    fn has_tasks(&self) -> bool {
        if !self.tasks.is_empty() {
            return true;
        }
        match self.scheduled.peek() {
            Some(Reverse(s)) => s.deadline <= Instant::now(),
            None => false,
        }
    }

    fn blocking_select(&mut self) {
        let timeout = self.next_timeout();
        self.wakeup.pending.store(false, Ordering::Release);

        // A task enqueued in the window between the caller's emptiness
        // check and the flag reset would otherwise wait out the whole
        // timeout: claim the wakeup and poll instead.
        if self.has_tasks()
            && self
                .wakeup
                .pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            if let Err(e) = self.selector.select_now() {
                warn!(%e, "non-blocking select failed");
            }
            return;
        }

        let start = Instant::now();
        match self.selector.select(timeout) {
            Ok(n) => {
                let woken = self.wakeup.pending.load(Ordering::Acquire);
                let premature = n == 0
                    && !woken
                    && match timeout {
                        Some(t) => start.elapsed() < t,
                        None => true,
                    };
                if premature {
                    self.select_count += 1;
                } else {
                    self.select_count = 0;
                }

                let threshold = self.config.rebuild_threshold;
                if threshold > 0 && self.select_count >= threshold {
                    warn!(
                        count = self.select_count,
                        "selector returned prematurely too often, rebuilding"
                    );
                    self.rebuild_selector();
                    self.select_count = 0;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                // Interrupt is not a spin; keep the counter primed so a
                // real spin right after is still caught promptly.
                self.select_count = 1;
            }
            Err(e) => {
                warn!(%e, "select failed, replacing selector");
                self.rebuild_selector();
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.scheduled
            .peek()
            .map(|Reverse(s)| s.deadline.saturating_duration_since(Instant::now()))
    }

    fn process_ready(&mut self) {
        let mut ready = std::mem::take(&mut self.ready);
        self.selector.drain_ready(&mut ready);
        let mut i = 0;
        while i < ready.len() {
            self.process_key(ready[i]);
            if self.needs_reselect {
                // Enough keys were cancelled that the ready set may be
                // stale; select again and restart from the top.
                self.needs_reselect = false;
                self.cancelled_keys = 0;
                trace!("re-selecting after cancelled-key threshold");
                if self.selector.select_now().is_ok() {
                    self.selector.drain_ready(&mut ready);
                    i = 0;
                    continue;
                }
            }
            i += 1;
        }
        ready.clear();
        self.ready = ready;
    }

    fn process_key(&mut self, ready: Ready) {
        enum Kind {
            Listener,
            Tcp,
        }
        let kind = match self.channels.get(ready.token) {
            Some(Registered::Listener(_)) => Kind::Listener,
            Some(Registered::Tcp(_)) => Kind::Tcp,
            None => {
                trace!(token = ready.token, "readiness for cancelled key");
                return;
            }
        };
        match kind {
            Kind::Listener => {
                if ready.ops.intersects(Ops::READ | Ops::ACCEPT) || ready.ops.is_empty() {
                    self.process_accept(ready.token);
                }
            }
            Kind::Tcp => self.process_stream(ready),
        }
    }

    /// Service a connection's readiness in CONNECT, WRITE, READ order. An
    /// empty ready set is treated as readable so a misbehaving selector
    /// cannot loop the channel forever without progress.
    fn process_stream(&mut self, ready: Ready) {
        let token = ready.token;
        let ops = ready.ops;
        let mut error: Option<io::Error> = None;
        let mut eof = false;
        let mut close_requested = false;

        if let Some(Registered::Tcp(ch)) = self.channels.get_mut(token) {
            // A failed connect can surface as an error-only event with no
            // readiness bits; try to finish the connect either way.
            if ch.connecting && (ops.intersects(Ops::WRITE | Ops::CONNECT) || ops.is_empty()) {
                if let Err(e) = ch.finish_connect() {
                    error = Some(e);
                }
            }
            if error.is_none() && !ch.connecting {
                if ops.contains(Ops::WRITE) {
                    if let Err(e) = ch.do_write() {
                        error = Some(e);
                    }
                }
                if error.is_none()
                    && (ops.contains(Ops::READ) || ops.is_empty())
                    && ch.interest.contains(Ops::READ)
                {
                    match ch.do_read() {
                        Ok(ReadOutcome::Eof) => eof = true,
                        Ok(ReadOutcome::Open) => {}
                        Err(e) => error = Some(e),
                    }
                }
            }
            close_requested = ch.close_requested;
        } else {
            return;
        }

        if let Some(e) = error {
            debug!(token, %e, "channel error");
            if let Some(Registered::Tcp(ch)) = self.channels.get_mut(token) {
                ch.fire_error(Box::new(io::Error::new(e.kind(), e.to_string())));
            }
            self.close_channel(token, NetError::Io(e));
            return;
        }
        if eof {
            let should_close = match self.channels.get_mut(token) {
                Some(Registered::Tcp(ch)) => ch.on_input_closed(),
                _ => return,
            };
            if should_close {
                self.close_channel(token, NetError::ClosedChannel);
                return;
            }
        }
        if close_requested {
            self.close_channel(token, NetError::ClosedChannel);
        }
    }

    fn process_accept(&mut self, token: usize) {
        let (accepted, init) = match self.channels.get_mut(token) {
            Some(Registered::Listener(server)) => (server.accept_batch(), server.init()),
            _ => return,
        };
        for (stream, addr) in accepted {
            CONNECTIONS_ACCEPTED.increment();
            let init = init.clone();
            match self.register_stream(stream, Some(addr), false, move |p| init(p)) {
                Ok(id) => trace!(token = id.as_usize(), peer = %addr, "accepted"),
                Err(e) => warn!(%e, peer = %addr, "failed to register accepted connection"),
            }
        }
    }

    /// Register an established connection with this loop.
    pub fn register(
        &mut self,
        stream: mio::net::TcpStream,
        init: impl FnOnce(&mut Pipeline),
    ) -> io::Result<ChannelId> {
        let peer = stream.peer_addr().ok();
        self.register_stream(stream, peer, false, init)
    }

    fn register_stream(
        &mut self,
        stream: mio::net::TcpStream,
        peer: Option<SocketAddr>,
        connecting: bool,
        init: impl FnOnce(&mut Pipeline),
    ) -> io::Result<ChannelId> {
        let entry = self.channels.vacant_entry();
        let token = entry.key();
        let id = ChannelId(token);
        let mut ch = TcpChannel::new(stream, id, &self.config, self.alloc.clone(), connecting);
        init(ch.pipeline_mut());
        self.selector.register(&mut ch.stream, token, ch.interest)?;
        entry.insert(Registered::Tcp(Box::new(ch)));
        CONNECTIONS_ACTIVE.increment();

        if !connecting {
            let close = match self.channels.get_mut(token) {
                Some(Registered::Tcp(ch)) => {
                    ch.set_active(peer);
                    ch.close_requested
                }
                _ => false,
            };
            if close {
                self.close_channel(token, NetError::ClosedChannel);
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "channel closed during activation",
                ));
            }
        }
        Ok(id)
    }

    /// Bind a listener. Accepted connections get a pipeline built by
    /// `init` and register with this loop.
    pub fn bind(
        &mut self,
        addr: SocketAddr,
        init: impl Fn(&mut Pipeline) + Send + Sync + 'static,
    ) -> io::Result<SocketAddr> {
        let mut listener = bind_listener(addr, self.config.backlog)?;
        let local = listener.local_addr()?;
        let entry = self.channels.vacant_entry();
        let token = entry.key();
        self.selector.register(&mut listener, token, Ops::ACCEPT)?;
        entry.insert(Registered::Listener(ServerChannel::new(
            listener,
            Arc::new(init),
        )));
        debug!(%local, token, "listening");
        Ok(local)
    }

    /// Start a non-blocking connect. The promise completes when the
    /// connection is established or fails.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        init: impl FnOnce(&mut Pipeline),
        promise: Promise,
    ) -> io::Result<ChannelId> {
        let stream = mio::net::TcpStream::connect(addr)?;
        let id = self.register_stream(stream, None, true, init)?;
        if let Some(Registered::Tcp(ch)) = self.channels.get_mut(id.as_usize()) {
            ch.set_connect_promise(promise);
        }
        Ok(id)
    }

    /// Queue a write on a channel and flush it. Fails the returned promise
    /// with `ClosedChannel` if the channel is gone.
    pub fn write_and_flush(&mut self, id: ChannelId, msg: Message) -> Promise {
        let promise = Promise::new();
        let token = id.as_usize();
        let result = match self.channels.get_mut(token) {
            Some(Registered::Tcp(ch)) => ch.queue_write(msg, promise.clone(), true),
            _ => {
                promise.try_failure(Arc::new(NetError::ClosedChannel));
                return promise;
            }
        };
        match result {
            Ok(()) => {
                let close = matches!(
                    self.channels.get(token),
                    Some(Registered::Tcp(ch)) if ch.close_requested
                );
                if close {
                    self.close_channel(token, NetError::ClosedChannel);
                }
            }
            Err(e) => {
                debug!(token, %e, "write failed");
                self.close_channel(token, NetError::Io(e));
            }
        }
        promise
    }

    /// Close a channel and release its registration.
    pub fn close_channel(&mut self, token: usize, cause: NetError) {
        let Some(mut kind) = self.channels.try_remove(token) else {
            return;
        };
        match &mut kind {
            Registered::Tcp(ch) => {
                ch.on_closed(cause);
                let _ = self.selector.deregister(&mut ch.stream);
                CONNECTIONS_ACTIVE.decrement();
            }
            Registered::Listener(server) => {
                let _ = self.selector.deregister(&mut server.listener);
            }
        }
        debug!(token, "channel closed");
        self.cancelled_keys += 1;
        if self.cancelled_keys >= CLEANUP_INTERVAL {
            self.needs_reselect = true;
        }
    }

    fn close_all(&mut self, cause: NetError) {
        let tokens: Vec<usize> = self.channels.iter().map(|(k, _)| k).collect();
        for token in tokens {
            self.close_channel(
                token,
                match &cause {
                    NetError::LoopShutDown => NetError::LoopShutDown,
                    _ => NetError::ClosedChannel,
                },
            );
        }
    }

    /// Schedule a task for an absolute deadline.
    pub fn schedule_at(&mut self, deadline: Instant, task: Task) {
        self.timer_seq += 1;
        self.scheduled.push(Reverse(Scheduled {
            deadline,
            seq: self.timer_seq,
            task: Some(task),
        }));
    }

    fn drain_due_scheduled(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(s)) = self.scheduled.peek() {
            if s.deadline > now {
                break;
            }
            let Reverse(mut due) = self.scheduled.pop().expect("peeked entry");
            if let Some(task) = due.task.take() {
                self.tasks.push(task);
            }
        }
    }

    fn run_tasks(&mut self, budget: Option<Duration>) {
        self.drain_due_scheduled();
        let deadline = budget.map(|b| Instant::now() + b);
        let mut ran: u64 = 0;
        loop {
            let task = match self.tasks.steal() {
                Steal::Success(task) => task,
                Steal::Empty => break,
                Steal::Retry => continue,
            };
            task(self);
            TASKS_EXECUTED.increment();
            ran += 1;
            if let Some(deadline) = deadline {
                if ran % TASK_CLOCK_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                    trace!(ran, "task budget exhausted");
                    break;
                }
            }
        }
    }

    fn rebuild_selector(&mut self) {
        match self.try_rebuild() {
            Ok(migrated) => {
                SELECTOR_REBUILDS.increment();
                warn!(channels = migrated, "migrated registrations to a new selector");
            }
            Err(e) => {
                warn!(%e, "selector rebuild failed, backing off");
                std::thread::sleep(REBUILD_BACKOFF);
            }
        }
    }

    /// Open a fresh selector, transplant every registration preserving
    /// token and interest, swap wakers, and retire the old selector.
    fn try_rebuild(&mut self) -> io::Result<usize> {
        let mut fresh = self.selector.replacement()?;
        let mut migrated = 0;
        for (token, kind) in self.channels.iter_mut() {
            match kind {
                Registered::Tcp(ch) => fresh.register(&mut ch.stream, token, ch.interest)?,
                Registered::Listener(server) => {
                    fresh.register(&mut server.listener, token, Ops::ACCEPT)?
                }
            }
            migrated += 1;
        }
        *self.wakeup.waker.lock() = fresh.wake_handle();
        self.selector = fresh;
        Ok(migrated)
    }
}

/// Task-drain time budget for one iteration: unlimited at ratio 100, else
/// proportional to the time I/O just took.
fn task_budget(io_ratio: u32, io_time: Duration) -> Option<Duration> {
    if io_ratio >= 100 {
        return None;
    }
    let ratio = io_ratio.max(1) as u64;
    let io_nanos = io_time.as_nanos().min(u64::MAX as u128) as u64;
    Some(Duration::from_nanos(
        io_nanos.saturating_mul(100 - ratio) / ratio,
    ))
}

/// Cloneable submission handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    tasks: Arc<Injector<Task>>,
    wakeup: Arc<WakeupState>,
    shutdown: Arc<AtomicBool>,
    thread: Arc<OnceLock<ThreadId>>,
}

impl LoopHandle {
    /// True when called from the loop's own thread.
    pub fn in_event_loop(&self) -> bool {
        self.thread
            .get()
            .is_some_and(|id| *id == std::thread::current().id())
    }

    /// Submit a task. From outside the loop thread this wakes the
    /// selector; from inside it simply appends, since the loop drains its
    /// queue before blocking again.
    pub fn execute(&self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.tasks.push(Box::new(f));
        if !self.in_event_loop() {
            self.wakeup();
        }
    }

    /// Run a task after a delay, on the loop thread.
    pub fn schedule(&self, delay: Duration, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        let deadline = Instant::now() + delay;
        self.execute(move |lp| lp.schedule_at(deadline, Box::new(f)));
    }

    /// Bind a listener on the loop. The promise completes once the
    /// listener is registered.
    pub fn bind(
        &self,
        addr: SocketAddr,
        init: impl Fn(&mut Pipeline) + Send + Sync + 'static,
    ) -> Promise {
        let promise = Promise::new();
        let done = promise.clone();
        self.execute(move |lp| match lp.bind(addr, init) {
            Ok(_) => {
                done.try_success();
            }
            Err(e) => {
                done.try_failure(Arc::new(NetError::Io(e)));
            }
        });
        promise
    }

    /// Open a connection from the loop. The promise completes when the
    /// connect finishes.
    pub fn connect(
        &self,
        addr: SocketAddr,
        init: impl FnOnce(&mut Pipeline) + Send + 'static,
    ) -> Promise {
        let promise = Promise::new();
        let done = promise.clone();
        self.execute(move |lp| {
            if let Err(e) = lp.connect(addr, init, done.clone()) {
                done.try_failure(Arc::new(NetError::Io(e)));
            }
        });
        promise
    }

    /// Request shutdown: every channel closes, then the loop exits.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wakeup();
    }

    fn wakeup(&self) {
        if self
            .wakeup
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            SELECTOR_WAKEUPS.increment();
            let waker = self.wakeup.waker.lock().clone();
            if let Err(e) = waker.wake() {
                warn!(%e, "selector wakeup failed");
            }
        }
    }
}
