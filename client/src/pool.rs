//! Reusable connections for protocols that cannot multiplex.
//!
//! HTTP/2 connections are shared across requests and live in the client's
//! own map. Everything else (HTTP/1.1 over a downgraded TLS session, for
//! example) is checked out for one exchange at a time and returned here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use io_driver::{CacheKey, NetConnection};
use parking_lot::Mutex;
use tracing::trace;

/// A cache of idle connections.
pub trait ConnectionPool: Send + Sync {
    /// Check out an idle connection for the origin, if one is available.
    fn get(&self, secure: bool, address: SocketAddr, proxy: Option<SocketAddr>)
    -> Option<NetConnection>;

    /// Return a connection after use. Closed connections are dropped.
    fn return_to_pool(&self, conn: NetConnection);

    /// Close every idle connection and refuse new ones.
    fn close(&self);
}

/// A pool keyed by [`CacheKey`] with a per-origin limit.
pub struct SimplePool {
    idle: Mutex<HashMap<CacheKey, Vec<NetConnection>>>,
    max_idle_per_origin: usize,
    closed: AtomicBool,
}

impl SimplePool {
    pub fn new(max_idle_per_origin: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_origin,
            closed: AtomicBool::new(false),
        }
    }

    /// Idle connections across all origins.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }
}

impl ConnectionPool for SimplePool {
    fn get(
        &self,
        secure: bool,
        address: SocketAddr,
        proxy: Option<SocketAddr>,
    ) -> Option<NetConnection> {
        let key = CacheKey::new(secure, address, proxy);
        let mut idle = self.idle.lock();
        let conns = idle.get_mut(&key)?;
        // Most recently returned first; skip any the peer closed meanwhile.
        let found = loop {
            match conns.pop() {
                Some(conn) if conn.is_closed() => continue,
                other => break other,
            }
        };
        if conns.is_empty() {
            idle.remove(&key);
        }
        found
    }

    fn return_to_pool(&self, conn: NetConnection) {
        if conn.is_closed() {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            conn.close();
            return;
        }

        let surplus = {
            let mut idle = self.idle.lock();
            let conns = idle.entry(conn.cache_key().clone()).or_default();
            conns.retain(|c| !c.is_closed());
            if conns.len() < self.max_idle_per_origin {
                trace!(key = %conn.cache_key(), "connection returned to pool");
                conns.push(conn);
                None
            } else {
                Some(conn)
            }
        };
        if let Some(conn) = surplus {
            conn.close();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let idle = std::mem::take(&mut *self.idle.lock());
        for conn in idle.into_values().flatten() {
            conn.close();
        }
    }
}
