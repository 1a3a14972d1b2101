//! A non-blocking, multi-reactor TCP server framework: one acceptor loop
//! plus a pool of worker event loops, each a single-threaded cooperative
//! executor pinned to the thread that constructs it.
//!
//! ## Usage
//!
//! ```no_run
//! use std::rc::Rc;
//! use std::sync::Arc;
//!
//! use reactor::{EventLoop, ServerOptions, TcpServer};
//!
//! let main_loop = Rc::new(EventLoop::new().unwrap());
//! let addr = "127.0.0.1:0".parse().unwrap();
//! let mut options = ServerOptions::new(addr, "echo");
//! options.num_threads = 4;
//!
//! let server = TcpServer::new(main_loop.clone(), options).unwrap();
//! server.set_message_callback(Arc::new(
//!     |conn: &reactor::TcpConnectionHandle, buf: &mut reactor::Buffer, _time: reactor::Timestamp| {
//!         conn.send(buf.peek());
//!         buf.retrieve_all();
//!     },
//! ));
//! server.start().unwrap();
//! // main_loop.run();
//! ```

mod acceptor;
mod buffer;
mod channel;
mod clock;
mod connection;
mod error;
mod event_loop;
mod hash_ring;
mod log_sink;
mod poll;
mod server;
mod sys;
mod thread_pool;
mod timer;

pub use buffer::Buffer;
pub use clock::{Clock, SystemClock, Timestamp};
pub use connection::{ConnectionState, TcpConnectionHandle};
pub use error::{ReactorError, Result};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use hash_ring::ConsistentHashRing;
pub use log_sink::{LogCrateSink, LogSink, Severity};
pub use server::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, ServerOptions, TcpServer,
    WriteCompleteCallback,
};
pub use thread_pool::{EventLoopThreadPool, ThreadInitCallback};
pub use timer::TimerId;
