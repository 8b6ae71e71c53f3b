//! Blocking HTTP/2 client on the io-driver reactor.
//!
//! A [`Client`] owns a worker pool and a reactor, keeps one multiplexed
//! HTTP/2 connection per origin, and parks TLS sessions that negotiated
//! HTTP/1.1 in a [`ConnectionPool`] for a non-multiplexed layer to reuse.
//!
//! # Example
//!
//! ```no_run
//! use http2_client::{Client, ClientConfig, Target};
//!
//! # fn example() -> Result<(), http2_client::ClientError> {
//! let client = Client::new(ClientConfig::default())?;
//! let target = Target::parse("127.0.0.1:8080", false)?;
//!
//! let response = client.get(&target, "/")?;
//! println!("{} {} bytes", response.status, response.body.collect()?.len());
//!
//! client.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
mod latency;
pub mod logging;
mod pool;
mod target;

pub use config::{ClientConfig, LogFormat, LoggingConfig};
pub use error::{ClientError, ConfigError};
pub use latency::ClientLatency;
pub use pool::{ConnectionPool, SimplePool};
pub use target::Target;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use http2::{ConnectionContext, Http2Connection, Request, Response, ResponseHandle};
use io_driver::{
    CacheKey, ConnectOptions, NetConnection, Reactor, ReactorHandle, ThreadPool, TlsConfig,
};
use parking_lot::Mutex;
use tracing::{debug, info};

type ConnectionMap = Mutex<HashMap<CacheKey, Http2Connection>>;

/// HTTP/2 client. Clone-able, Send + Sync; all clones share the same
/// reactor, workers and connections.
///
/// The last clone to drop shuts everything down, as does [`shutdown`].
///
/// [`shutdown`]: Client::shutdown
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    options: ConnectOptions,
    executor: Arc<ThreadPool>,
    reactor: Mutex<Option<Reactor>>,
    handle: ReactorHandle,
    http2: Arc<ConnectionMap>,
    pool: Arc<SimplePool>,
    latency: ClientLatency,
    closed: AtomicBool,
}

impl Client {
    /// Start a client with the webpki roots and the configured ALPN list.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let tls = TlsConfig::with_alpn(config.tls.alpn_protocols())?;
        Self::with_tls(config, tls)
    }

    /// Start a client with a caller-supplied TLS configuration, e.g. one
    /// trusting a private CA.
    pub fn with_tls(config: ClientConfig, tls: TlsConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let threads = config.threads();
        let executor = Arc::new(ThreadPool::new("h2-worker", threads)?);
        let reactor = Reactor::start(config.reactor_config(), executor.clone())?;
        let handle = reactor.handle();

        let mut options = config.connect_options();
        options.tls = Some(tls);

        let pool = Arc::new(SimplePool::new(config.connection.max_idle_per_origin));
        info!(threads, "client started");

        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                options,
                executor,
                reactor: Mutex::new(Some(reactor)),
                handle,
                http2: Arc::new(Mutex::new(HashMap::new())),
                pool,
                latency: ClientLatency::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The HTTP/2 connection for `target`, reusing an open one.
    ///
    /// A TLS session that negotiates anything but `h2` is returned to the
    /// [`pool`](Client::pool) and reported as [`ClientError::Downgraded`].
    pub fn connect(&self, target: &Target) -> Result<Http2Connection, ClientError> {
        self.check_open()?;
        let address = target.resolve()?;
        let key = CacheKey::new(target.secure, address, target.proxy);
        if let Some(conn) = self.cached(&key) {
            return Ok(conn);
        }

        let start = Instant::now();
        let net = NetConnection::connect(
            key.clone(),
            target.server_name(),
            true,
            &self.inner.handle,
            &self.inner.options,
        )?;
        let conn = match net {
            NetConnection::Plain(_) => Http2Connection::with_prior_knowledge(self.context(), net)?,
            NetConnection::Tls(tls) => match Http2Connection::negotiated(self.context(), tls) {
                Ok(conn) => conn,
                Err(http2::Error::AlpnDowngrade(downgrade)) => {
                    debug!(%key, protocol = ?downgrade.protocol, "server declined h2");
                    let protocol = downgrade.protocol;
                    self.inner
                        .pool
                        .return_to_pool(NetConnection::Tls(downgrade.connection));
                    return Err(ClientError::Downgraded { key, protocol });
                }
                Err(e) => return Err(e.into()),
            },
        };
        self.inner.latency.record_connect(start.elapsed());
        debug!(%key, "http2 connection established");

        // Another thread may have connected to the same origin meanwhile.
        let existing = {
            let mut map = self.inner.http2.lock();
            match map.get(&key) {
                Some(existing) if existing.is_open() => Some(existing.clone()),
                _ => {
                    map.insert(key, conn.clone());
                    None
                }
            }
        };
        if let Some(existing) = existing {
            conn.close();
            return Ok(existing);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            conn.close();
            return Err(ClientError::Closed);
        }
        Ok(conn)
    }

    /// Send `request` to `target`. The response is awaited on the returned
    /// handle.
    pub fn send(&self, target: &Target, request: Request) -> Result<ResponseHandle, ClientError> {
        let conn = self.connect(target)?;
        Ok(conn.send_request(request)?)
    }

    /// Send `request` and wait for the final response headers.
    pub fn fetch(&self, target: &Target, request: Request) -> Result<Response, ClientError> {
        let start = Instant::now();
        let handle = self.send(target, request)?;
        let response = handle.response()?;
        self.inner.latency.record_request(start.elapsed());
        Ok(response)
    }

    /// `GET path` on `target`.
    pub fn get(&self, target: &Target, path: &str) -> Result<Response, ClientError> {
        let request = Request::get(target.scheme(), &target.authority(), path);
        self.fetch(target, request)
    }

    /// Idle non-multiplexed connections, such as TLS sessions that
    /// negotiated HTTP/1.1.
    pub fn pool(&self) -> &dyn ConnectionPool {
        self.inner.pool.as_ref()
    }

    pub fn latency(&self) -> &ClientLatency {
        &self.inner.latency
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.inner.handle
    }

    /// Open HTTP/2 connections.
    pub fn connection_count(&self) -> usize {
        self.inner
            .http2
            .lock()
            .values()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Close every connection, then stop the reactor and the workers.
    /// Pending requests fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn check_open(&self) -> Result<(), ClientError> {
        if self.inner.closed.load(Ordering::Acquire) || self.inner.handle.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    fn cached(&self, key: &CacheKey) -> Option<Http2Connection> {
        self.inner
            .http2
            .lock()
            .get(key)
            .filter(|c| c.is_open())
            .cloned()
    }

    fn context(&self) -> ConnectionContext {
        let c = &self.inner.config.connection;
        let mut ctx = ConnectionContext::new(self.inner.config.http2.clone());
        ctx.idle_timeout = c.idle_timeout();
        ctx.request_timeout = c.request_timeout();

        let map: Weak<ConnectionMap> = Arc::downgrade(&self.inner.http2);
        ctx.on_close(move |key| {
            let Some(map) = map.upgrade() else {
                return;
            };
            let mut map = map.lock();
            if map.get(key).is_some_and(Http2Connection::is_closed) {
                map.remove(key);
                debug!(%key, "connection evicted");
            }
        })
    }
}

impl ClientInner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let conns = std::mem::take(&mut *self.http2.lock());
        for conn in conns.into_values() {
            conn.close();
        }
        self.pool.close();

        if let Some(mut reactor) = self.reactor.lock().take() {
            reactor.shutdown();
        }
        self.executor.shutdown();
        info!("client shut down");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
