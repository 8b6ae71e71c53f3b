//! TLS engine backed by rustls, and the TLS connection variant.

use super::engine::{EngineResult, HandshakeStatus, Status, TlsEngine, TlsError};
use super::pipe::{PipeReceiver, TlsPipe};
use super::{CacheKey, Receiver};
use crate::socket::AsyncSocketConnection;
use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// TLS configuration for client connections.
#[derive(Clone)]
pub struct TlsConfig {
    config: Arc<rustls::ClientConfig>,
}

impl TlsConfig {
    /// Create a new TLS configuration with the webpki root certificates.
    pub fn new() -> io::Result<Self> {
        Self::with_alpn(Vec::new())
    }

    /// Create a TLS configuration advertising the given ALPN protocols.
    pub fn with_alpn(protocols: Vec<Vec<u8>>) -> io::Result<Self> {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        config.alpn_protocols = protocols;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Create a TLS configuration for HTTP/2 (`h2`, then `http/1.1`).
    pub fn http2() -> io::Result<Self> {
        Self::with_alpn(vec![b"h2".to_vec(), b"http/1.1".to_vec()])
    }

    /// Wrap an existing rustls configuration, e.g. one with custom roots.
    pub fn from_rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self { config }
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.config.alpn_protocols
    }

    /// A copy of this configuration that offers `h2` first.
    pub fn prefer_h2(&self) -> Self {
        if self.config.alpn_protocols.first().map(Vec::as_slice) == Some(b"h2".as_slice()) {
            return self.clone();
        }
        let mut config = (*self.config).clone();
        config.alpn_protocols.retain(|p| p != b"h2");
        config.alpn_protocols.insert(0, b"h2".to_vec());
        Self {
            config: Arc::new(config),
        }
    }

    /// Create an engine for a session with `server_name`.
    pub fn engine(&self, server_name: &str) -> Result<RustlsEngine, TlsError> {
        RustlsEngine::new(self, server_name)
    }
}

/// [`TlsEngine`] over a rustls `ClientConnection`.
///
/// rustls buffers partial records internally, so `unwrap` always consumes
/// all of its input and only reports `BufferUnderflow` for empty input.
pub struct RustlsEngine {
    conn: rustls::ClientConnection,
    /// `Finished` has been reported.
    finished: bool,
    outbound_closed: bool,
}

impl RustlsEngine {
    pub fn new(config: &TlsConfig, server_name: &str) -> Result<Self, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;

        let conn = rustls::ClientConnection::new(config.config.clone(), name)?;

        Ok(Self {
            conn,
            finished: false,
            outbound_closed: false,
        })
    }

    /// Status after a wrap or unwrap, reporting `Finished` exactly once.
    fn observe(&mut self) -> HandshakeStatus {
        let status = self.handshake_status();
        if status == HandshakeStatus::NotHandshaking && !self.finished {
            self.finished = true;
            return HandshakeStatus::Finished;
        }
        status
    }
}

impl TlsEngine for RustlsEngine {
    fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError> {
        let mut consumed = 0;
        if !src.is_empty() {
            if self.outbound_closed {
                return Ok(EngineResult {
                    status: Status::Closed,
                    handshake: self.handshake_status(),
                    consumed: 0,
                    produced: 0,
                });
            }
            if !self.conn.is_handshaking() {
                consumed = self.conn.writer().write(src)?;
            }
        }

        let mut out = Vec::new();
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut out)? == 0 {
                break;
            }
        }
        dst.extend_from_slice(&out);

        let status = if self.outbound_closed && out.is_empty() {
            Status::Closed
        } else {
            Status::Ok
        };

        Ok(EngineResult {
            status,
            handshake: self.observe(),
            consumed,
            produced: out.len(),
        })
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError> {
        if src.is_empty() {
            return Ok(EngineResult {
                status: Status::BufferUnderflow,
                handshake: self.handshake_status(),
                consumed: 0,
                produced: 0,
            });
        }

        let start = dst.len();
        let mut consumed = 0;
        let mut cursor = io::Cursor::new(src);
        while consumed < src.len() {
            match self.conn.read_tls(&mut cursor)? {
                0 => break,
                n => consumed += n,
            }
            let state = self.conn.process_new_packets()?;
            drain_plaintext(&mut self.conn, state.plaintext_bytes_to_read(), dst)?;
        }
        let state = self.conn.process_new_packets()?;
        drain_plaintext(&mut self.conn, state.plaintext_bytes_to_read(), dst)?;

        let status = if state.peer_has_closed() && dst.len() == start {
            Status::Closed
        } else if consumed == 0 {
            Status::BufferUnderflow
        } else {
            Status::Ok
        };

        Ok(EngineResult {
            status,
            handshake: self.observe(),
            consumed,
            produced: dst.len() - start,
        })
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if !self.finished && self.conn.wants_write() {
            // The final handshake flight is still buffered.
            HandshakeStatus::NeedWrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn delegated_task(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
        None
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.conn.alpn_protocol().map(<[u8]>::to_vec)
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.outbound_closed = true;
            self.conn.send_close_notify();
        }
    }
}

fn drain_plaintext(
    conn: &mut rustls::ClientConnection,
    available: usize,
    dst: &mut BytesMut,
) -> Result<(), TlsError> {
    if available == 0 {
        return Ok(());
    }
    let start = dst.len();
    dst.resize(start + available, 0);
    match conn.reader().read(&mut dst[start..]) {
        Ok(n) => {
            dst.truncate(start + n);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            dst.truncate(start);
            Ok(())
        }
        Err(e) => {
            dst.truncate(start);
            Err(e.into())
        }
    }
}

/// A TLS session over a socket.
#[derive(Clone)]
pub struct TlsConnection {
    socket: AsyncSocketConnection,
    pipe: Arc<TlsPipe>,
    key: CacheKey,
}

impl TlsConnection {
    /// Run a handshake with `engine` over a connected socket, blocking the
    /// caller until it completes or `handshake_timeout` passes.
    pub fn handshake(
        socket: AsyncSocketConnection,
        engine: Box<dyn TlsEngine>,
        key: CacheKey,
        handshake_timeout: Duration,
    ) -> io::Result<Self> {
        let executor = socket.reactor().executor().clone();
        let pipe = TlsPipe::new(
            engine,
            Arc::new(socket.clone()),
            executor,
            handshake_timeout,
        );
        socket.start_reading(Arc::new(PipeReceiver(pipe.clone())));
        pipe.start_handshake()?;
        if let Err(e) = pipe.handshake(handshake_timeout) {
            socket.close();
            return Err(e);
        }
        Ok(Self { socket, pipe, key })
    }

    pub fn socket(&self) -> &AsyncSocketConnection {
        &self.socket
    }

    pub fn pipe(&self) -> &Arc<TlsPipe> {
        &self.pipe
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.pipe.alpn_protocol()
    }

    pub fn put(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        self.pipe.plaintext_queue().put(bufs)
    }

    pub fn put_first(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        self.pipe.plaintext_queue().put_first(bufs)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.pipe.plaintext_queue().flush()
    }

    /// Deliver decrypted bytes to `receiver`.
    pub fn start_reading(&self, receiver: Arc<dyn Receiver>) {
        self.pipe.attach(receiver);
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.is_closed() || self.socket.is_closed()
    }

    pub fn close(&self) {
        self.pipe.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_config_http2() {
        let config = TlsConfig::http2().unwrap();
        assert_eq!(config.alpn_protocols()[0], b"h2".to_vec());
    }

    #[test]
    fn test_tls_config_prefer_h2() {
        let config = TlsConfig::with_alpn(vec![b"http/1.1".to_vec(), b"h2".to_vec()]).unwrap();
        let preferred = config.prefer_h2();
        assert_eq!(
            preferred.alpn_protocols(),
            &[b"h2".to_vec(), b"http/1.1".to_vec()]
        );

        let empty = TlsConfig::new().unwrap().prefer_h2();
        assert_eq!(empty.alpn_protocols(), &[b"h2".to_vec()]);
    }

    #[test]
    fn test_engine_starts_with_client_hello() {
        let config = TlsConfig::http2().unwrap();
        let mut engine = config.engine("example.com").unwrap();
        assert_eq!(engine.handshake_status(), HandshakeStatus::NeedWrap);

        let mut out = BytesMut::new();
        let result = engine.wrap(&[], &mut out).unwrap();
        assert_eq!(result.status, Status::Ok);
        assert!(result.produced > 0);
        // Handshake record content type.
        assert_eq!(out[0], 0x16);
        assert_eq!(result.handshake, HandshakeStatus::NeedUnwrap);
    }

    #[test]
    fn test_engine_withholds_plaintext_during_handshake() {
        let config = TlsConfig::new().unwrap();
        let mut engine = config.engine("example.com").unwrap();
        let mut out = BytesMut::new();
        let result = engine.wrap(b"GET / HTTP/1.1\r\n", &mut out).unwrap();
        assert_eq!(result.consumed, 0);
    }

    #[test]
    fn test_engine_invalid_server_name() {
        let config = TlsConfig::new().unwrap();
        let result = config.engine("");
        assert!(matches!(result, Err(TlsError::InvalidServerName(_))));
    }

    #[test]
    fn test_engine_unwrap_empty_underflows() {
        let config = TlsConfig::new().unwrap();
        let mut engine = config.engine("example.com").unwrap();
        let mut out = BytesMut::new();
        engine.wrap(&[], &mut out).unwrap();

        let mut plain = BytesMut::new();
        let result = engine.unwrap(&[], &mut plain).unwrap();
        assert_eq!(result.status, Status::BufferUnderflow);
        assert_eq!(result.consumed, 0);
    }

    #[test]
    fn test_engine_unwrap_garbage_fails() {
        let config = TlsConfig::new().unwrap();
        let mut engine = config.engine("example.com").unwrap();
        let mut out = BytesMut::new();
        engine.wrap(&[], &mut out).unwrap();

        let mut plain = BytesMut::new();
        let garbage = [0xffu8; 64];
        assert!(engine.unwrap(&garbage, &mut plain).is_err());
    }

    #[test]
    fn test_engine_no_alpn_before_handshake() {
        let config = TlsConfig::http2().unwrap();
        let engine = config.engine("example.com").unwrap();
        assert!(engine.alpn_protocol().is_none());
    }
}
