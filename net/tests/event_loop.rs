//! Event loop integration tests over loopback sockets.

use riptide_net::pipeline::{Ctx, Handler, UserEvent};
use riptide_net::{ChannelId, EventLoop, LoopHandle, Message, ReactorConfig};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Echoes raw buffers straight back.
struct Echo;

impl Handler for Echo {
    fn channel_read(&mut self, ctx: &mut Ctx<'_>, msg: Message) {
        ctx.write_and_flush(msg);
    }
}

fn start_loop(config: ReactorConfig) -> (LoopHandle, std::thread::JoinHandle<()>) {
    let event_loop = EventLoop::new(config).unwrap();
    let handle = event_loop.handle();
    let worker = std::thread::spawn(move || event_loop.run());
    (handle, worker)
}

fn bind_on(
    handle: &LoopHandle,
    init: impl Fn(&mut riptide_net::Pipeline) + Send + Sync + 'static,
) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    handle.execute(move |lp| {
        let bound = lp.bind("127.0.0.1:0".parse().unwrap(), init);
        tx.send(bound).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("bind result")
        .expect("bind succeeds")
}

fn read_until(stream: &mut std::net::TcpStream, wanted: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut chunk = [0u8; 65536];
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    while out.len() < wanted && Instant::now() < deadline {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => panic!("read failed: {}", e),
        }
    }
    out
}

#[test]
fn test_echo_round_trip() {
    let (handle, worker) = start_loop(ReactorConfig::default());
    let addr = bind_on(&handle, |p| {
        p.add_last("echo", Echo);
    });

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    client.write_all(b"hello reactor").unwrap();
    let reply = read_until(&mut client, 13);
    assert_eq!(&reply, b"hello reactor");

    handle.shutdown();
    worker.join().unwrap();
}

/// Reports the channel id of each accepted connection.
struct ActiveProbe(mpsc::Sender<ChannelId>);

impl Handler for ActiveProbe {
    fn channel_active(&mut self, ctx: &mut Ctx<'_>) {
        let _ = self.0.send(ctx.channel_id());
        ctx.fire_channel_active();
    }
}

#[test]
fn test_cross_thread_write_and_flush() {
    let (handle, worker) = start_loop(ReactorConfig::default());
    let (tx, rx) = mpsc::channel();
    let addr = bind_on(&handle, move |p| {
        p.add_last("probe", ActiveProbe(tx.clone()));
    });

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    let id = rx.recv_timeout(Duration::from_secs(5)).expect("accepted");

    // Writes from a foreign thread go through the task queue.
    let writer = handle.clone();
    let (done_tx, done_rx) = mpsc::channel();
    writer.execute(move |lp| {
        let promise = lp.write_and_flush(
            id,
            Message::Buf(riptide_buffer::ByteBuf::from_slice(b"pushed")),
        );
        promise.on_complete(move |outcome| {
            let _ = done_tx.send(outcome.is_success());
        });
    });

    let reply = read_until(&mut client, 6);
    assert_eq!(&reply, b"pushed");
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());

    handle.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_graceful_shutdown_closes_connections() {
    let (handle, worker) = start_loop(ReactorConfig::default());
    let (tx, rx) = mpsc::channel();
    let addr = bind_on(&handle, move |p| {
        p.add_last("probe", ActiveProbe(tx.clone()));
    });

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).expect("accepted");

    handle.shutdown();
    worker.join().unwrap();

    // The server side closed our connection.
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut chunk = [0u8; 16];
    assert_eq!(client.read(&mut chunk).unwrap(), 0);
}

/// Writes one large payload on activation and records writability flips.
struct BurstWriter {
    payload: usize,
    events: mpsc::Sender<bool>,
}

impl Handler for BurstWriter {
    fn channel_active(&mut self, ctx: &mut Ctx<'_>) {
        let mut buf = ctx.alloc().alloc(self.payload);
        buf.put_slice(&vec![b'#'; self.payload]).unwrap();
        ctx.write_and_flush(Message::Buf(buf));
    }

    fn writability_changed(&mut self, ctx: &mut Ctx<'_>, writable: bool) {
        let _ = self.events.send(writable);
        ctx.fire_writability_changed(writable);
    }
}

#[test]
fn test_water_mark_flips_once_each_way_under_backpressure() {
    const PAYLOAD: usize = 4 * 1024 * 1024;

    let config = ReactorConfig {
        high_water_mark: 64 * 1024,
        low_water_mark: 32 * 1024,
        ..Default::default()
    };
    let (handle, worker) = start_loop(config);
    let (events_tx, events_rx) = mpsc::channel();
    let addr = bind_on(&handle, move |p| {
        p.add_last(
            "burst",
            BurstWriter {
                payload: PAYLOAD,
                events: events_tx.clone(),
            },
        );
    });

    let mut client = std::net::TcpStream::connect(addr).unwrap();

    // Queueing four megabytes crosses the high mark immediately.
    let first = events_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!first);

    // Reading everything drains the queue below the low mark.
    let received = read_until(&mut client, PAYLOAD);
    assert_eq!(received.len(), PAYLOAD);

    let second = events_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(second);

    // Exactly one notification per transition.
    assert!(events_rx.try_recv().is_err());

    handle.shutdown();
    worker.join().unwrap();
}

/// Says goodbye when the peer half-closes, then closes.
struct HalfCloseResponder;

impl Handler for HalfCloseResponder {
    fn channel_read(&mut self, _ctx: &mut Ctx<'_>, _msg: Message) {
        // Consume quietly; the interesting part is the shutdown event.
    }

    fn user_event(&mut self, ctx: &mut Ctx<'_>, event: UserEvent) {
        if matches!(event, UserEvent::InputShutdown) {
            let mut bye = ctx.alloc().alloc(4);
            bye.put_slice(b"bye\n").unwrap();
            ctx.write_and_flush(Message::Buf(bye));
            ctx.close();
        }
    }
}

#[test]
fn test_half_closure_surfaces_input_shutdown() {
    let config = ReactorConfig {
        allow_half_closure: true,
        ..Default::default()
    };
    let (handle, worker) = start_loop(config);
    let addr = bind_on(&handle, |p| {
        p.add_last("responder", HalfCloseResponder);
    });

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    client.write_all(b"some data").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    // The server can still write after our input shut down.
    let reply = read_until(&mut client, 4);
    assert_eq!(&reply, b"bye\n");

    handle.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_connect_to_dead_port_fails_promise() {
    let (handle, worker) = start_loop(ReactorConfig::default());

    // Grab a port and release it so nothing is listening there.
    let dead_addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let promise = handle.connect(dead_addr, |_| {});
    let outcome = promise
        .wait_timeout(Duration::from_secs(5))
        .expect("connect settles");
    assert!(!outcome.is_success());

    handle.shutdown();
    worker.join().unwrap();
}
