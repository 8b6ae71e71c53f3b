//! http2 - HTTP/2 client connections over io-driver.
//!
//! This crate multiplexes blocking-style requests over one connection. It
//! does not use async/await or tokio: inbound frames are dispatched on the
//! reactor's worker pool and callers block on completions.
//!
//! # Features
//!
//! - Frame encoding and decoding
//! - HPACK header compression
//! - Connection and stream flow control, with WINDOW_UPDATEs sent as
//!   response bodies are consumed
//! - Prior knowledge (h2c), ALPN over TLS, and HTTP/1.1 `Upgrade: h2c`
//! - Server push through a per-request [`PushHandler`]
//! - Demand-driven body channels with pull and push consumers
//!
//! # Architecture
//!
//! - `frame`: frame types, encoding, and decoding
//! - `hpack`: HPACK header compression
//! - `connection`: the [`Http2Connection`] state machine, streams and flow
//!   control
//! - `body`: body channels for request uploads and response downloads
//! - `message`: requests, responses and push promises
//!
//! Sockets, TLS and the reactor are provided by the `io-driver` crate.
//!
//! ```ignore
//! let net = NetConnection::connect(key, "localhost", true, &reactor.handle(), &options)?;
//! let conn = Http2Connection::with_prior_knowledge(ConnectionContext::default(), net)?;
//! let handle = conn.send_request(Request::get("http", "localhost:8080", "/"))?;
//! let response = handle.response()?;
//! let body = response.body.collect()?;
//! ```

pub mod body;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod hpack;
pub mod message;

// Re-export commonly used types
pub use body::{Body, BodyConsumer, BodyDemand, BodySender, RequestBody};
pub use config::{CloseHook, ConnectionContext, Http2Config};
pub use connection::{
    ConnectionSettings, ConnectionState, FlowController, FlowError, Http2Connection,
    PushHandler, ResponseHandle, Stream, StreamState, WindowUpdateSender,
};
pub use error::{AlpnDowngrade, Error};
pub use frame::{
    CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_MAX_FRAME_SIZE, ErrorCode, FRAME_HEADER_SIZE, Frame,
    FrameDecoder, FrameEncoder, FrameError, SettingId, SettingsFrame, StreamId,
};
pub use hpack::{HeaderField, HpackDecoder, HpackEncoder};
pub use message::{Headers, PushPromise, Request, Response};
