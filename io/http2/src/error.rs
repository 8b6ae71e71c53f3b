//! Errors surfaced to users of a connection.

use std::fmt;
use std::io;
use std::sync::Arc;

use io_driver::{TlsConnection, TlsError};

use crate::connection::FlowError;
use crate::frame::{ErrorCode, FrameError, StreamId};
use crate::hpack::HpackError;

/// HTTP/2 connection or stream failure.
///
/// Cloneable so one connection failure can be delivered to every pending
/// stream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
    #[error("tls error: {0}")]
    Tls(Arc<TlsError>),
    /// The TLS handshake settled on a protocol other than `h2`.
    #[error("{0}")]
    AlpnDowngrade(AlpnDowngrade),
    /// The peer violated the protocol. Sent as GOAWAY, or as RST_STREAM
    /// when only one stream was affected.
    #[error("protocol error ({code}): {reason}")]
    Protocol { code: ErrorCode, reason: String },
    #[error("stream reset by peer ({0})")]
    StreamReset(ErrorCode),
    #[error("connection closed by peer ({code}, last stream {last_stream_id})")]
    GoAway {
        code: ErrorCode,
        last_stream_id: StreamId,
    },
    /// The peer never processed the request; it is safe to send again.
    #[error("request not processed by peer")]
    Unprocessed,
    #[error("cancelled")]
    Cancelled,
    #[error("timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("peer stream limit reached")]
    TooManyStreams,
    #[error("body error: {0}")]
    Body(String),
}

impl Error {
    pub(crate) fn protocol(code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            reason: reason.into(),
        }
    }

    /// Whether the request can be sent again, on this or a new connection,
    /// without risk of it having been acted on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unprocessed | Error::StreamReset(ErrorCode::RefusedStream) | Error::TooManyStreams
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Tls(Arc::new(e))
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Protocol {
            code: e.error_code(),
            reason: e.to_string(),
        }
    }
}

impl From<HpackError> for Error {
    fn from(e: HpackError) -> Self {
        Error::Protocol {
            code: ErrorCode::CompressionError,
            reason: e.to_string(),
        }
    }
}

impl From<FlowError> for Error {
    fn from(e: FlowError) -> Self {
        match e {
            FlowError::StreamClosed => Error::Cancelled,
            FlowError::ConnectionClosed => Error::ConnectionClosed,
        }
    }
}

/// A TLS connection whose ALPN negotiation did not select `h2`.
///
/// The session is fully established, so the HTTP/1.1 path can use it
/// instead of reconnecting.
#[derive(Clone)]
pub struct AlpnDowngrade {
    pub connection: TlsConnection,
    /// The protocol the server picked, if any.
    pub protocol: Option<String>,
}

impl fmt::Debug for AlpnDowngrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlpnDowngrade")
            .field("key", self.connection.cache_key())
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl fmt::Display for AlpnDowngrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.protocol {
            Some(protocol) => write!(f, "server selected {protocol} instead of h2"),
            None => write!(f, "server did not negotiate h2"),
        }
    }
}
