//! io-driver - reactor, socket and TLS plumbing for a blocking-style client.
//!
//! This crate provides the I/O layer underneath the HTTP/2 transport: one
//! reactor thread multiplexing readiness for many sockets, a worker pool that
//! runs every handler, and connections that can be driven either
//! asynchronously (receivers and write queues) or synchronously (blocking
//! calls parked on a completion).
//!
//! # Components
//!
//! - **Reactor**: a mio `Poll` on a dedicated thread, with one-shot and
//!   repeating interest registrations and a timer set
//! - **Executor**: the [`ThreadPool`] that runs reactor handlers
//! - **AsyncWriteQueue**: ordered grouped writes with a single-writer flush
//! - **AsyncSocketConnection**: a non-blocking TCP socket with a per
//!   connection [`BufferPool`]
//! - **TlsPipe**: a TLS engine between a socket and an upper receiver whose
//!   handshakes run on the executor
//! - **NetConnection**: the cleartext and TLS variants behind one surface
//!
//! # Quick Start
//!
//! ```ignore
//! use io_driver::{CacheKey, ConnectOptions, NetConnection, Reactor, ReactorConfig, ThreadPool};
//! use std::sync::Arc;
//!
//! let pool = Arc::new(ThreadPool::new("worker", 4)?);
//! let reactor = Reactor::start(ReactorConfig::default(), pool)?;
//!
//! let key = CacheKey::new(false, "127.0.0.1:8080".parse()?, None);
//! let conn = NetConnection::connect(key, "localhost", true, &reactor.handle(), &ConnectOptions::default())?;
//! conn.put(vec![bytes::Bytes::from_static(b"hello")])?;
//! conn.flush()?;
//! ```
//!
//! Dropping the [`Reactor`] stops its thread and aborts every pending event.

mod buffer_pool;
mod completion;
mod executor;
mod socket;
mod types;
mod write_queue;

pub mod reactor;
pub mod transport;

// Re-exports
pub use buffer_pool::{BufferPool, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FREE};
pub use completion::Completion;
pub use executor::{Executor, Task, ThreadPool};
pub use reactor::{
    AsyncEvent, CallbackEvent, DEFAULT_NODEADLINE, Reactor, ReactorConfig, ReactorHandle,
    TimeoutEvent,
};
pub use socket::{AsyncSocketConnection, SocketConfig, SocketSink};
pub use types::{Channel, EventFlags, Interest, TimerId, set_nonblocking};
pub use write_queue::{AsyncWriteQueue, WriteSink};

// Transport re-exports
pub use transport::{
    CacheKey, ConnectOptions, Downstream, EngineResult, HandshakeStatus, NetConnection,
    PlainConnection, Receiver, RustlsEngine, Status, TlsConfig, TlsConnection, TlsEngine,
    TlsError, TlsPipe,
};
