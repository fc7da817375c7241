//! A non-blocking TCP networking library built on the
//! one-loop-per-thread reactor pattern.
//!
//! Each [`EventLoop`] multiplexes readiness with epoll on its own
//! thread, runs expired timers, and executes tasks queued from other
//! threads. [`TcpServer`] accepts on one loop and partitions
//! connections across a pool; [`TcpClient`] drives an outbound
//! connection with exponential-backoff reconnect. All callbacks of a
//! connection run serialized on its loop.
//!
//! # Example
//!
//! An echo server on a single loop:
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactor_net::{EventLoop, TcpConnectionPtr, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:7000".parse().unwrap();
//!
//! let server = TcpServer::new(&event_loop, &addr, "echo", false).unwrap();
//! server.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buf, _time| {
//!     let data = buf.retrieve_all_as_bytes();
//!     conn.send(&data);
//! }));
//!
//! server.start();
//! event_loop.run();
//! ```

#[macro_use]
pub mod sys;

pub mod acceptor;
pub mod connector;
pub mod logging;

mod buffer;
mod channel;
mod client;
mod connection;
mod event_loop;
mod pool;
mod poller;
mod ready;
mod server;
mod timer_queue;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::Channel;
pub use client::TcpClient;
pub use connection::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, State, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use connector::Connector;
pub use event_loop::EventLoop;
pub use pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use ready::Ready;
pub use server::TcpServer;
pub use timer_queue::TimerId;
