//! Plain (unencrypted) connection for h2c and cleartext proxies.

use super::{CacheKey, Receiver};
use crate::socket::AsyncSocketConnection;
use bytes::Bytes;
use std::io;
use std::sync::Arc;

/// A cleartext TCP connection.
///
/// Writes go straight to the socket's write queue.
#[derive(Clone)]
pub struct PlainConnection {
    socket: AsyncSocketConnection,
    key: CacheKey,
}

impl PlainConnection {
    pub fn new(socket: AsyncSocketConnection, key: CacheKey) -> Self {
        Self { socket, key }
    }

    pub fn socket(&self) -> &AsyncSocketConnection {
        &self.socket
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn put(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        self.socket.write_queue().put(bufs)
    }

    pub fn put_first(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        self.socket.write_queue().put_first(bufs)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.socket.write_queue().flush()
    }

    pub fn start_reading(&self, receiver: Arc<dyn Receiver>) {
        self.socket.start_reading(receiver);
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    pub fn close(&self) {
        self.socket.close();
    }
}
