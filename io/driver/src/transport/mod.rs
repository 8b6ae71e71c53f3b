//! Connection variants.
//!
//! A [`NetConnection`] is either a cleartext socket or a TLS session over a
//! socket. Both expose the same surface: grouped writes with a
//! jump-the-queue lane, an inbound [`Receiver`], and the [`CacheKey`] the
//! connection is pooled under. Protocol layers use it without caring which
//! variant they hold.

mod engine;
mod pipe;
mod plain;
mod tls;

pub use engine::{EngineResult, HandshakeStatus, Status, TlsEngine, TlsError};
pub use pipe::{Downstream, PipeReceiver, PipeSink, PipeState, TlsPipe};
pub use plain::PlainConnection;
pub use tls::{RustlsEngine, TlsConfig, TlsConnection};

use crate::reactor::ReactorHandle;
use crate::socket::{AsyncSocketConnection, SocketConfig};
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Consumer of inbound bytes.
///
/// Calls for one connection are serialized and arrive in order.
pub trait Receiver: Send + Sync {
    fn on_bytes(&self, data: Bytes);

    /// End of stream or a read failure. No further calls follow.
    fn on_error(&self, error: io::Error);
}

/// Identity of a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub secure: bool,
    pub address: SocketAddr,
    pub proxy: Option<SocketAddr>,
}

impl CacheKey {
    pub fn new(secure: bool, address: SocketAddr, proxy: Option<SocketAddr>) -> Self {
        Self {
            secure,
            address,
            proxy,
        }
    }

    /// Where the socket actually connects.
    pub fn connect_address(&self) -> SocketAddr {
        self.proxy.unwrap_or(self.address)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        match self.proxy {
            Some(proxy) => write!(f, "{scheme}://{} via {proxy}", self.address),
            None => write!(f, "{scheme}://{}", self.address),
        }
    }
}

/// Settings used to open a connection.
#[derive(Clone)]
pub struct ConnectOptions {
    pub socket: SocketConfig,
    pub tls: Option<TlsConfig>,
    pub handshake_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            tls: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// A cleartext or TLS connection.
#[derive(Clone)]
pub enum NetConnection {
    Plain(PlainConnection),
    Tls(TlsConnection),
}

impl NetConnection {
    /// Open a connection for `key`, picking the variant from
    /// `(secure, proxied, http2)`.
    ///
    /// TLS through a proxy needs a CONNECT tunnel, which belongs to the
    /// HTTP/1.1 layer, and is rejected with `Unsupported`. For HTTP/2 over
    /// TLS `h2` is offered first in ALPN.
    pub fn connect(
        key: CacheKey,
        server_name: &str,
        http2: bool,
        reactor: &ReactorHandle,
        options: &ConnectOptions,
    ) -> io::Result<Self> {
        match (key.secure, key.proxy.is_some()) {
            (true, true) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "tls through a proxy requires an http/1.1 tunnel",
            )),
            (false, _) => {
                let socket =
                    AsyncSocketConnection::connect(key.connect_address(), reactor, &options.socket)?;
                debug!(%key, "plain connection open");
                Ok(NetConnection::Plain(PlainConnection::new(socket, key)))
            }
            (true, false) => {
                let tls = match &options.tls {
                    Some(tls) => tls.clone(),
                    None => TlsConfig::new()?,
                };
                let tls = if http2 { tls.prefer_h2() } else { tls };
                let engine = tls.engine(server_name)?;
                let socket = AsyncSocketConnection::connect(key.address, reactor, &options.socket)?;
                let conn = TlsConnection::handshake(
                    socket,
                    Box::new(engine),
                    key,
                    options.handshake_timeout,
                )?;
                debug!(key = %conn.cache_key(), "tls connection open");
                Ok(NetConnection::Tls(conn))
            }
        }
    }

    pub fn put(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        match self {
            NetConnection::Plain(c) => c.put(bufs),
            NetConnection::Tls(c) => c.put(bufs),
        }
    }

    /// Queue a group ahead of everything queued with `put`.
    pub fn put_first(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        match self {
            NetConnection::Plain(c) => c.put_first(bufs),
            NetConnection::Tls(c) => c.put_first(bufs),
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        match self {
            NetConnection::Plain(c) => c.flush(),
            NetConnection::Tls(c) => c.flush(),
        }
    }

    pub fn start_reading(&self, receiver: Arc<dyn Receiver>) {
        match self {
            NetConnection::Plain(c) => c.start_reading(receiver),
            NetConnection::Tls(c) => c.start_reading(receiver),
        }
    }

    pub fn close(&self) {
        match self {
            NetConnection::Plain(c) => c.close(),
            NetConnection::Tls(c) => c.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            NetConnection::Plain(c) => c.is_closed(),
            NetConnection::Tls(c) => c.is_closed(),
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        match self {
            NetConnection::Plain(c) => c.cache_key(),
            NetConnection::Tls(c) => c.cache_key(),
        }
    }

    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match self {
            NetConnection::Plain(_) => None,
            NetConnection::Tls(c) => c.alpn_protocol(),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, NetConnection::Tls(_))
    }

    /// The underlying socket.
    pub fn socket(&self) -> &AsyncSocketConnection {
        match self {
            NetConnection::Plain(c) => c.socket(),
            NetConnection::Tls(c) => c.socket(),
        }
    }

    pub fn reactor(&self) -> &ReactorHandle {
        self.socket().reactor()
    }
}

impl From<PlainConnection> for NetConnection {
    fn from(conn: PlainConnection) -> Self {
        NetConnection::Plain(conn)
    }
}

impl From<TlsConnection> for NetConnection {
    fn from(conn: TlsConnection) -> Self {
        NetConnection::Tls(conn)
    }
}
