//! Record-level TLS engine contract.
//!
//! The pipe drives the engine through two operations, `wrap` (plaintext to
//! ciphertext) and `unwrap` (ciphertext to plaintext), each reporting how
//! many bytes it consumed and produced plus what the handshake needs next.

use std::io;

use bytes::BytesMut;

/// Outcome of one `wrap` or `unwrap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// The destination had no room; grow it and retry.
    BufferOverflow,
    /// The source did not hold a complete record; supply more bytes.
    BufferUnderflow,
    /// The engine is closed.
    Closed,
}

/// What the handshake needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Run the tasks returned by `delegated_task`.
    NeedTask,
    /// Produce a record with `wrap`.
    NeedWrap,
    /// Consume a record with `unwrap`.
    NeedUnwrap,
    /// Call `unwrap` again on data already buffered by the engine.
    NeedUnwrapAgain,
    /// The call that returned this finished the handshake.
    Finished,
    NotHandshaking,
}

impl HandshakeStatus {
    /// True while more handshake work is outstanding.
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            HandshakeStatus::NeedTask
                | HandshakeStatus::NeedWrap
                | HandshakeStatus::NeedUnwrap
                | HandshakeStatus::NeedUnwrapAgain
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: Status,
    pub handshake: HandshakeStatus,
    pub consumed: usize,
    pub produced: usize,
}

/// TLS engine failure.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("tls protocol error: {0}")]
    Protocol(#[from] rustls::Error),
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error("tls engine closed")]
    Closed,
    #[error("tls handshake timed out")]
    HandshakeTimeout,
    #[error("tls engine error: {0}")]
    Engine(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<TlsError> for io::Error {
    fn from(e: TlsError) -> Self {
        match e {
            TlsError::Io(e) => e,
            TlsError::HandshakeTimeout => {
                io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out")
            }
            TlsError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, "tls engine closed"),
            other => io::Error::other(other),
        }
    }
}

/// A TLS state machine driven by a [`TlsPipe`](super::TlsPipe).
pub trait TlsEngine: Send {
    /// Encrypt bytes from `src` into `dst`. During a handshake no plaintext is
    /// consumed and `dst` receives handshake records instead.
    fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError>;

    /// Decrypt bytes from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError>;

    /// Current handshake requirement.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Next delegated task, if any.
    fn delegated_task(&mut self) -> Option<Box<dyn FnOnce() + Send>>;

    /// Negotiated application protocol, once the handshake is done.
    fn alpn_protocol(&self) -> Option<Vec<u8>>;

    /// Queue a close notification; the next `wrap` emits it.
    fn close_outbound(&mut self);
}
