//! Full-stack test: event loop, line framing, echo handler, real sockets.

use riptide_buffer::ByteBuf;
use riptide_codec::{LineDecoder, StreamDecoder};
use riptide_net::pipeline::{Ctx, Handler};
use riptide_net::{EventLoop, Message, ReactorConfig};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Echoes each decoded line back with a trailing newline.
struct LineEcho;

impl Handler for LineEcho {
    fn channel_read(&mut self, ctx: &mut Ctx<'_>, msg: Message) {
        let Message::Buf(frame) = msg else {
            return;
        };
        let mut reply = ctx.alloc().alloc(frame.readable_bytes() + 1);
        reply.put_slice(frame.readable()).unwrap();
        reply.put_u8(b'\n').unwrap();
        ctx.write_and_flush(Message::Buf(reply));
    }
}

fn start_echo_server() -> (SocketAddr, riptide_net::LoopHandle, std::thread::JoinHandle<()>) {
    let event_loop = EventLoop::new(ReactorConfig::default()).unwrap();
    let handle = event_loop.handle();
    let worker = std::thread::spawn(move || event_loop.run());

    let (tx, rx) = mpsc::channel();
    handle.execute(move |lp| {
        let bound = lp.bind("127.0.0.1:0".parse().unwrap(), |pipeline| {
            pipeline
                .add_last("frame", StreamDecoder::new(LineDecoder::new(1024)))
                .add_last("echo", LineEcho);
        });
        tx.send(bound).unwrap();
    });
    let addr = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("bind result")
        .expect("bind succeeds");
    (addr, handle, worker)
}

fn read_until(stream: &mut std::net::TcpStream, wanted: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut chunk = [0u8; 4096];
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
fn test_split_frame_echo_round_trip() {
    let (addr, handle, worker) = start_echo_server();

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    client.write_all(b"AB").unwrap();
    client.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    client.write_all(b"CD\n").unwrap();

    let reply = read_until(&mut client, 5);
    assert_eq!(&reply, b"ABCD\n");

    handle.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_pipelined_lines_echo_in_order() {
    let (addr, handle, worker) = start_echo_server();

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    client.write_all(b"one\ntwo\nthree\n").unwrap();

    let reply = read_until(&mut client, 14);
    assert_eq!(&reply, b"one\ntwo\nthree\n");

    handle.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_many_clients_round_trip() {
    let (addr, handle, worker) = start_echo_server();

    let mut clients: Vec<std::net::TcpStream> = (0..8)
        .map(|_| std::net::TcpStream::connect(addr).unwrap())
        .collect();
    for (i, client) in clients.iter_mut().enumerate() {
        client.write_all(format!("hello-{}\n", i).as_bytes()).unwrap();
    }
    for (i, client) in clients.iter_mut().enumerate() {
        let expected = format!("hello-{}\n", i);
        let reply = read_until(client, expected.len());
        assert_eq!(reply, expected.as_bytes());
    }

    handle.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_loop_client_connect_and_echo() {
    let (addr, handle, worker) = start_echo_server();

    // A second pipeline acts as the client, connected from the same loop.
    let (tx, rx) = mpsc::channel::<Vec<u8>>();

    struct CollectFrames(mpsc::Sender<Vec<u8>>);
    impl Handler for CollectFrames {
        fn channel_active(&mut self, ctx: &mut Ctx<'_>) {
            let mut hello = ctx.alloc().alloc(16);
            hello.put_slice(b"roundtrip\n").unwrap();
            ctx.write_and_flush(Message::Buf(hello));
        }

        fn channel_read(&mut self, _ctx: &mut Ctx<'_>, msg: Message) {
            if let Message::Buf(frame) = msg {
                let _ = self.0.send(frame.readable().to_vec());
            }
        }
    }

    let connected = handle.connect(addr, move |pipeline| {
        pipeline
            .add_last("frame", StreamDecoder::new(LineDecoder::new(1024)))
            .add_last("collect", CollectFrames(tx));
    });
    assert!(connected
        .wait_timeout(Duration::from_secs(5))
        .expect("connect completes")
        .is_success());

    let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(&frame, b"roundtrip");

    handle.shutdown();
    worker.join().unwrap();
}

#[test]
fn test_byte_buf_round_trip_identity() {
    // Encoding a decoded frame reproduces the original wire bytes.
    let wire = b"payload line\n";
    let mut ch = riptide_net::EmbeddedChannel::new();
    ch.add_handler(
        "frame",
        StreamDecoder::new(LineDecoder::with_options(64, false, false)),
    );
    ch.write_inbound(Message::Buf(ByteBuf::from_slice(wire)));

    let frame = ch.read_inbound().unwrap();
    assert_eq!(frame.as_buf().unwrap().readable(), wire);
}
