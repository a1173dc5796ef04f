//! TCP channels driven by the event loop.

use crate::config::ReactorConfig;
use crate::error::NetError;
use crate::message::Message;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT};
use crate::ops::Ops;
use crate::outbound::{OutboundBuffer, OutboundShared, MAX_GATHER_VIEWS};
use crate::pipeline::{Actions, Pipeline, Resources, UserEvent};
use crate::promise::Promise;
use riptide_buffer::BufAllocator;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Byte cap per gathering write pass.
const MAX_WRITE_BYTES: usize = 1 << 20;

/// Opaque channel identifier: the channel's registration token in its
/// event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) usize);

impl ChannelId {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Channels registered with an event loop.
pub(crate) enum Registered {
    Tcp(Box<TcpChannel>),
    Listener(ServerChannel),
}

/// What the read path observed about the connection's remote end.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Open,
    /// The peer shut down its write half (or closed).
    Eof,
}

/// A connected TCP stream plus its pipeline and write queue.
pub(crate) struct TcpChannel {
    pub(crate) stream: mio::net::TcpStream,
    pub(crate) interest: Ops,
    id: ChannelId,
    pipeline: Pipeline,
    outbound: OutboundBuffer,
    shared: Arc<OutboundShared>,
    actions: Actions,
    alloc: BufAllocator,
    read_buffer_size: usize,
    allow_half_closure: bool,
    pub(crate) connecting: bool,
    connect_promise: Option<Promise>,
    peer_addr: Option<SocketAddr>,
    active: bool,
    input_shutdown: bool,
    pub(crate) close_requested: bool,
}

impl TcpChannel {
    pub(crate) fn new(
        stream: mio::net::TcpStream,
        id: ChannelId,
        config: &ReactorConfig,
        alloc: BufAllocator,
        connecting: bool,
    ) -> Self {
        let outbound = OutboundBuffer::new(
            config.entry_overhead,
            config.high_water_mark,
            config.low_water_mark,
        );
        let shared = outbound.shared();
        let mut interest = Ops::READ | Ops::WRITE;
        if connecting {
            interest.insert(Ops::CONNECT);
        }
        Self {
            stream,
            interest,
            id,
            pipeline: Pipeline::new(),
            outbound,
            shared,
            actions: Actions::default(),
            alloc,
            read_buffer_size: config.read_buffer_size,
            allow_half_closure: config.allow_half_closure,
            connecting,
            connect_promise: None,
            peer_addr: None,
            active: false,
            input_shutdown: false,
            close_requested: false,
        }
    }

    pub(crate) fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub(crate) fn set_connect_promise(&mut self, promise: Promise) {
        self.connect_promise = Some(promise);
    }

    /// Mark active and tell the pipeline. Called once registration (and
    /// for outbound connections, the connect) completed.
    pub(crate) fn set_active(&mut self, peer: Option<SocketAddr>) {
        self.peer_addr = peer;
        self.active = true;
        let res = Resources {
            alloc: &self.alloc,
            outbound: &self.shared,
            channel_id: self.id,
        };
        self.pipeline.fire_channel_active(&mut self.actions, &res);
        let _ = self.process_actions();
    }

    /// Drain the socket until it would block, feeding each buffer through
    /// the pipeline. One read-complete event is fired per batch.
    pub(crate) fn do_read(&mut self) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::Open;
        loop {
            if self.input_shutdown || self.close_requested {
                break;
            }
            let mut buf = self.alloc.alloc(self.read_buffer_size);
            let n = match self.stream.read(buf.writable_slice()) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                outcome = ReadOutcome::Eof;
                break;
            }
            buf.advance_writer(n).expect("read fits writable space");
            BYTES_RECEIVED.add(n as u64);
            trace!(channel = self.id.as_usize(), bytes = n, "socket read");

            let res = Resources {
                alloc: &self.alloc,
                outbound: &self.shared,
                channel_id: self.id,
            };
            self.pipeline
                .fire_channel_read(&mut self.actions, &res, Message::Buf(buf));
            self.process_actions()?;
        }

        let res = Resources {
            alloc: &self.alloc,
            outbound: &self.shared,
            channel_id: self.id,
        };
        self.pipeline
            .fire_channel_read_complete(&mut self.actions, &res);
        self.process_actions()?;
        self.drain_tail();
        Ok(outcome)
    }

    /// Handle end-of-input. Returns `true` when the channel should close.
    pub(crate) fn on_input_closed(&mut self) -> bool {
        if self.allow_half_closure && !self.input_shutdown {
            self.input_shutdown = true;
            self.interest.remove(Ops::READ);
            debug!(channel = self.id.as_usize(), "input shutdown, half-closure");
            let res = Resources {
                alloc: &self.alloc,
                outbound: &self.shared,
                channel_id: self.id,
            };
            self.pipeline
                .fire_user_event(&mut self.actions, &res, UserEvent::InputShutdown);
            let _ = self.process_actions();
            self.close_requested
        } else {
            true
        }
    }

    /// Finish a non-blocking connect after the selector reported the
    /// socket writable. CONNECT interest is cleared first.
    pub(crate) fn finish_connect(&mut self) -> io::Result<()> {
        self.interest.remove(Ops::CONNECT);
        if let Some(e) = self.stream.take_error()? {
            self.fail_connect(&e);
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(addr) => {
                self.connecting = false;
                debug!(channel = self.id.as_usize(), peer = %addr, "connected");
                if let Some(promise) = self.connect_promise.take() {
                    promise.try_success();
                }
                self.set_active(Some(addr));
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                // Spurious wakeup before the handshake settled.
                self.interest.insert(Ops::CONNECT);
                Ok(())
            }
            Err(e) => {
                self.fail_connect(&e);
                Err(e)
            }
        }
    }

    fn fail_connect(&mut self, error: &io::Error) {
        warn!(channel = self.id.as_usize(), %error, "connect failed");
        if let Some(promise) = self.connect_promise.take() {
            promise.try_failure(Arc::new(NetError::Io(io::Error::new(
                error.kind(),
                error.to_string(),
            ))));
        }
    }

    /// Push flushed writes to the socket as gathering writes until the
    /// queue drains or the socket refuses more.
    pub(crate) fn do_write(&mut self) -> io::Result<()> {
        loop {
            if !self.outbound.has_flushed() {
                break;
            }
            let (views, expected) = self.outbound.gather_views(MAX_GATHER_VIEWS, MAX_WRITE_BYTES);
            if views.is_empty() {
                drop(views);
                // Only empty or cancelled entries left; complete them.
                let flip = self.outbound.remove_bytes(0);
                self.apply_writability(flip);
                break;
            }
            let written = match self.stream.write_vectored(&views) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "vectored write returned zero",
                    ))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            drop(views);
            BYTES_SENT.add(written as u64);
            trace!(channel = self.id.as_usize(), bytes = written, "socket write");
            let flip = self.outbound.remove_bytes(written);
            self.apply_writability(flip);
            if written < expected {
                // Socket buffer is full; wait for the next writable edge.
                break;
            }
        }
        Ok(())
    }

    /// Stage a write from outside the pipeline (cross-thread callers go
    /// through the event loop's task queue to get here).
    pub(crate) fn queue_write(&mut self, msg: Message, promise: Promise, flush: bool) -> io::Result<()> {
        self.actions.writes.push((msg, promise));
        if flush {
            self.actions.flush = true;
        }
        self.process_actions()
    }

    /// Apply outbound operations buffered during pipeline dispatch.
    fn process_actions(&mut self) -> io::Result<()> {
        loop {
            if !self.actions.has_any() {
                return Ok(());
            }
            let Actions {
                writes,
                flush,
                close,
            } = std::mem::take(&mut self.actions);

            // Writability transitions fire as they happen, before any
            // socket write can flip the signal back.
            for (msg, promise) in writes {
                if self.close_requested {
                    promise.try_failure(Arc::new(NetError::ClosedChannel));
                    continue;
                }
                match msg {
                    Message::Buf(buf) => {
                        let size = buf.readable_bytes();
                        let flip = self.outbound.add_message(Message::Buf(buf), size, promise);
                        self.apply_writability(flip);
                    }
                    other => {
                        drop(other);
                        promise.try_failure(Arc::new(NetError::UnsupportedMessage));
                    }
                }
            }
            if flush && !self.close_requested {
                let flip = self.outbound.mark_flush();
                self.apply_writability(flip);
                self.do_write()?;
            }
            if close {
                self.close_requested = true;
            }
        }
    }

    fn apply_writability(&mut self, flip: Option<bool>) {
        if let Some(writable) = flip {
            self.fire_writability(writable);
        }
    }

    fn fire_writability(&mut self, writable: bool) {
        let res = Resources {
            alloc: &self.alloc,
            outbound: &self.shared,
            channel_id: self.id,
        };
        self.pipeline
            .fire_writability_changed(&mut self.actions, &res, writable);
    }

    /// Surface a transport failure through the pipeline's exception path.
    pub(crate) fn fire_error(&mut self, error: crate::pipeline::BoxError) {
        let res = Resources {
            alloc: &self.alloc,
            outbound: &self.shared,
            channel_id: self.id,
        };
        self.pipeline
            .fire_exception(&mut self.actions, &res, error);
        let _ = self.process_actions();
    }

    /// Tear down: fail pending writes and notify the pipeline. The loop
    /// deregisters and drops the channel afterwards.
    pub(crate) fn on_closed(&mut self, cause: NetError) {
        debug!(
            channel = self.id.as_usize(),
            peer = ?self.peer_addr,
            %cause,
            "tearing down channel"
        );
        let cause = Arc::new(cause);
        self.close_requested = true;
        self.outbound.fail_flushed(cause.clone(), false);
        self.outbound.close(cause);
        if self.active {
            self.active = false;
            let res = Resources {
                alloc: &self.alloc,
                outbound: &self.shared,
                channel_id: self.id,
            };
            self.pipeline.fire_channel_inactive(&mut self.actions, &res);
        }
        if let Some(promise) = self.connect_promise.take() {
            promise.try_failure(Arc::new(NetError::ClosedChannel));
        }
        // Writes staged during teardown have nowhere to go.
        for (_, promise) in std::mem::take(&mut self.actions).writes {
            promise.try_failure(Arc::new(NetError::ClosedChannel));
        }
        self.drain_tail();
    }

    /// Log and drop whatever reached the pipeline tail.
    fn drain_tail(&mut self) {
        for msg in self.pipeline.sink.messages.drain(..) {
            debug!(
                channel = self.id.as_usize(),
                bytes = msg.readable_bytes(),
                "discarded inbound message that reached the pipeline tail"
            );
        }
        for error in self.pipeline.sink.errors.drain(..) {
            warn!(
                channel = self.id.as_usize(),
                %error,
                "unhandled pipeline exception"
            );
        }
        self.pipeline.sink.read_completes = 0;
    }
}

/// A bound listener accepting connections for its event loop.
pub(crate) struct ServerChannel {
    pub(crate) listener: mio::net::TcpListener,
    init: Arc<dyn Fn(&mut Pipeline) + Send + Sync>,
}

impl ServerChannel {
    pub(crate) fn new(
        listener: mio::net::TcpListener,
        init: Arc<dyn Fn(&mut Pipeline) + Send + Sync>,
    ) -> Self {
        Self { listener, init }
    }

    pub(crate) fn init(&self) -> Arc<dyn Fn(&mut Pipeline) + Send + Sync> {
        self.init.clone()
    }

    /// Accept every pending connection.
    pub(crate) fn accept_batch(&mut self) -> Vec<(mio::net::TcpStream, SocketAddr)> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => accepted.push((stream, addr)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(%e, "accept failed");
                    break;
                }
            }
        }
        accepted
    }
}

/// Bind a listener socket with address reuse, matching the options used
/// for production listeners: SO_REUSEADDR always, SO_REUSEPORT on unix for
/// multi-loop load balancing.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<mio::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = socket.as_raw_fd();
        let optval: libc::c_int = 1;
        // Safety: plain setsockopt on a socket we own; failure is benign.
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(mio::net::TcpListener::from_std(std_listener))
}
