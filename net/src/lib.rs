//! riptide-net - Single-threaded reactor transport.
//!
//! An [`EventLoop`] owns one OS selector and every channel registered with
//! it. Inbound bytes flow through a per-channel handler [`Pipeline`];
//! outbound writes queue in a per-channel [write buffer](outbound) that
//! enforces high/low water marks and drains to the socket with gathering
//! writes.
//!
//! # Quick Start
//!
//! ```no_run
//! use riptide_net::{EventLoop, LoopHandle, Message, ReactorConfig};
//! use riptide_net::pipeline::{Ctx, Handler};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn channel_read(&mut self, ctx: &mut Ctx<'_>, msg: Message) {
//!         ctx.write_and_flush(msg);
//!     }
//! }
//!
//! # fn main() -> std::io::Result<()> {
//! let event_loop = EventLoop::new(ReactorConfig::default())?;
//! let handle = event_loop.handle();
//! let worker = std::thread::spawn(move || event_loop.run());
//!
//! handle.bind("127.0.0.1:9000".parse().unwrap(), |pipeline| {
//!     pipeline.add_last("echo", Echo);
//! });
//!
//! // ... later:
//! handle.shutdown();
//! worker.join().unwrap();
//! # Ok(())
//! # }
//! ```
//!
//! # Threading
//!
//! The loop thread is the single writer for selector state, channel state,
//! and the task queue's consumer end. Other threads interact through a
//! [`LoopHandle`], which posts tasks and wakes the selector; the only
//! state they read directly is the atomic pending-byte and writability
//! counters a channel shares.

pub mod channel;
pub mod config;
pub mod embedded;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod ops;
pub mod outbound;
pub mod pipeline;
pub mod promise;
pub mod selector;

pub use channel::ChannelId;
pub use config::{ConfigError, LogFormat, LoggingConfig, ReactorConfig};
pub use embedded::EmbeddedChannel;
pub use error::NetError;
pub use event_loop::{EventLoop, LoopHandle};
pub use message::Message;
pub use ops::Ops;
pub use outbound::OutboundBuffer;
pub use pipeline::{BoxError, Ctx, Handler, Pipeline, UserEvent};
pub use promise::{Outcome, Promise};
