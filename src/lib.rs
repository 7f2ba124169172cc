//! Muxio is a multi-reactor TCP networking library for Linux.
//!
//! The design is one-loop-per-thread: an [`EventLoop`] is a
//! single-threaded reactor polling an epoll instance and dispatching
//! readiness to [`Channel`]s; an [`EventLoopThreadPool`] runs N such
//! loops; a [`TcpServer`] accepts on the base loop and hands each
//! connection to a worker loop, which owns every callback for it from
//! then on. Cross-thread work enters a loop only as a closure posted
//! through its [`LoopHandle`].
//!
//! Applications register three callbacks on a server: connection
//! (up/down edges), message (bytes arrived), and optionally
//! write-complete; protocol codecs are layered by wrapping the message
//! callback.
//!
//! ```no_run
//! use std::time::Duration;
//! use muxio::{EventLoop, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let base = EventLoop::new()?;
//!     let server = TcpServer::new(
//!         base.handle(),
//!         "127.0.0.1:7000".parse().unwrap(),
//!         "echo",
//!         false,
//!     )?;
//!     server.set_thread_num(4);
//!     server.set_message_callback(std::sync::Arc::new(|conn, buf, _when| {
//!         let bytes = buf.retrieve_as_bytes(buf.readable_bytes());
//!         conn.send(&bytes);
//!     }));
//!     server.start()?;
//!
//!     // Stop the whole thing after a minute, for the example's sake.
//!     let handle = base.handle();
//!     base.run_after(Duration::from_secs(60), move || handle.quit());
//!     base.run();
//!     Ok(())
//! }
//! ```

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod event_loop;
mod interest;
pub mod logging;
mod loop_thread;
mod poller;
mod server;
mod sys;
mod timer;

pub use buffer::Buffer;
pub use channel::{Channel, EventCallback, ReadEventCallback};
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use event_loop::{EventLoop, LoopHandle};
pub use interest::Interest;
pub use loop_thread::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use server::TcpServer;
pub use timer::TimerId;
