//! Non-blocking TCP connection driven by the reactor.
//!
//! [`AsyncSocketConnection`] supports two read modes and two write modes:
//!
//! - asynchronous reads: a one-shot READ event re-armed after every drain,
//!   delivering chunks to a [`Receiver`] in order
//! - synchronous reads: a one-shot READ event with blocking-after-fire, the
//!   handler performs exactly one blocking read for a waiting caller
//! - asynchronous writes: an [`AsyncWriteQueue`] whose sink is the socket
//! - synchronous writes: the same queue, waiting until it has drained

use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer_pool::{BufferPool, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FREE};
use crate::completion::Completion;
use crate::reactor::{CallbackEvent, ReactorHandle};
use crate::transport::Receiver;
use crate::types::{Channel, EventFlags, Interest, set_nonblocking};
use crate::write_queue::{AsyncWriteQueue, WriteSink};

/// Socket settings.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub connect_timeout: Duration,
    /// Timeout for synchronous reads and writes.
    pub io_timeout: Duration,
    pub tcp_nodelay: bool,
    /// Capacity of each pooled read buffer.
    pub read_buffer_size: usize,
    /// Idle read buffers retained per connection.
    pub max_free_buffers: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            tcp_nodelay: true,
            read_buffer_size: DEFAULT_CHUNK_SIZE,
            max_free_buffers: DEFAULT_MAX_FREE,
        }
    }
}

struct SocketIo {
    stream: TcpStream,
    channel: Channel,
    reactor: ReactorHandle,
    closed: AtomicBool,
}

/// The write side of a socket, as seen by its queue.
pub struct SocketSink {
    io: Arc<SocketIo>,
}

impl WriteSink for SocketSink {
    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        if self.io.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket closed"));
        }
        (&self.io.stream).write_vectored(bufs)
    }

    fn await_writable(&self, resume: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        let resume = Arc::new(Mutex::new(Some(resume)));
        let on_abort = resume.clone();
        let event = CallbackEvent::new(self.io.channel, Interest::WRITE, move || {
            if let Some(resume) = resume.lock().take() {
                resume();
            }
        })
        .on_abort(move |_| {
            // The resumed flush observes the failure and closes the queue.
            if let Some(resume) = on_abort.lock().take() {
                resume();
            }
        });
        self.io.reactor.register(Arc::new(event));
        Ok(())
    }
}

/// A connected TCP socket registered with the reactor.
#[derive(Clone)]
pub struct AsyncSocketConnection {
    io: Arc<SocketIo>,
    queue: Arc<AsyncWriteQueue<SocketSink>>,
    pool: Arc<Mutex<BufferPool>>,
    reading: Arc<AtomicBool>,
    peer: SocketAddr,
    config: Arc<SocketConfig>,
}

impl AsyncSocketConnection {
    /// Connect to `addr`, blocking the caller until the connect completes
    /// or the connect timeout passes. The reactor thread is never blocked.
    pub fn connect(
        addr: SocketAddr,
        reactor: &ReactorHandle,
        config: &SocketConfig,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let channel = stream.as_raw_fd();
        let io = Arc::new(SocketIo {
            stream,
            channel,
            reactor: reactor.clone(),
            closed: AtomicBool::new(false),
        });

        let done: Completion<io::Result<()>> = Completion::new();
        let on_ready = {
            let io = io.clone();
            let done = done.clone();
            move || {
                done.complete(connect_result(&io.stream));
            }
        };
        let on_abort = {
            let done = done.clone();
            move |e: io::Error| {
                done.complete(Err(e));
            }
        };
        let event = CallbackEvent::new(channel, Interest::CONNECT, on_ready).on_abort(on_abort);
        reactor.register(Arc::new(event));

        match done.wait_timeout(config.connect_timeout) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                reactor.cancel(channel);
                return Err(e);
            }
            None => {
                reactor.cancel(channel);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
        }

        if config.tcp_nodelay {
            io.stream.set_nodelay(true)?;
        }

        debug!(%addr, channel, "connected");
        Ok(Self::from_io(io, addr, config))
    }

    fn from_io(io: Arc<SocketIo>, peer: SocketAddr, config: &SocketConfig) -> Self {
        let queue = AsyncWriteQueue::new(SocketSink { io: io.clone() });
        Self {
            io,
            queue,
            pool: Arc::new(Mutex::new(BufferPool::new(
                config.read_buffer_size,
                config.max_free_buffers,
            ))),
            reading: Arc::new(AtomicBool::new(false)),
            peer,
            config: Arc::new(config.clone()),
        }
    }

    /// The descriptor registered with the reactor.
    pub fn channel(&self) -> Channel {
        self.io.channel
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.stream.local_addr()
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.io.reactor
    }

    /// The outbound queue for this socket.
    pub fn write_queue(&self) -> &Arc<AsyncWriteQueue<SocketSink>> {
        &self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.io.closed.load(Ordering::Acquire)
    }

    // === Asynchronous mode ===

    /// Start delivering inbound bytes to `receiver`. End of stream and read
    /// errors are delivered through `Receiver::on_error` and stop reading.
    pub fn start_reading(&self, receiver: Arc<dyn Receiver>) {
        if self.reading.swap(true, Ordering::AcqRel) {
            return;
        }
        self.arm_read(receiver);
    }

    /// Stop delivering inbound bytes after the current drain.
    pub fn stop_reading(&self) {
        self.reading.store(false, Ordering::Release);
    }

    fn arm_read(&self, receiver: Arc<dyn Receiver>) {
        let conn = self.clone();
        let on_abort = receiver.clone();
        let event = CallbackEvent::new(self.io.channel, Interest::READ, move || {
            conn.read_ready(&receiver);
        })
        .on_abort(move |e| on_abort.on_error(e));
        self.io.reactor.register(Arc::new(event));
    }

    fn read_ready(&self, receiver: &Arc<dyn Receiver>) {
        loop {
            if !self.reading.load(Ordering::Acquire) || self.is_closed() {
                return;
            }

            let mut buf = self.pool.lock().checkout();
            let capacity = buf.capacity();
            buf.resize(capacity, 0);

            match (&self.io.stream).read(&mut buf[..]) {
                Ok(0) => {
                    self.pool.lock().checkin(buf);
                    self.reading.store(false, Ordering::Release);
                    trace!(channel = self.io.channel, "end of stream");
                    receiver.on_error(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ));
                    return;
                }
                Ok(n) => {
                    let data = self.pool.lock().split_filled(buf, n);
                    trace!(channel = self.io.channel, bytes = n, "read");
                    receiver.on_bytes(data);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pool.lock().checkin(buf);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.pool.lock().checkin(buf);
                }
                Err(e) => {
                    self.pool.lock().checkin(buf);
                    self.reading.store(false, Ordering::Release);
                    receiver.on_error(e);
                    return;
                }
            }
        }

        if self.reading.load(Ordering::Acquire) {
            self.arm_read(receiver.clone());
        }
    }

    /// Queue bytes for writing and start a flush.
    pub fn write_async(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        self.queue.put(bufs)?;
        self.queue.flush()
    }

    // === Synchronous mode ===

    /// Perform one blocking read of at most `max` bytes.
    ///
    /// Must not be mixed with [`start_reading`](Self::start_reading).
    pub fn read_blocking(&self, max: usize) -> io::Result<Bytes> {
        if self.reading.load(Ordering::Acquire) {
            return Err(io::Error::other("asynchronous reading is active"));
        }

        let done: Completion<io::Result<Bytes>> = Completion::new();
        let on_ready = {
            let io = self.io.clone();
            let done = done.clone();
            move || {
                let mut buf = vec![0u8; max];
                let result = (&io.stream).read(&mut buf).map(|n| {
                    buf.truncate(n);
                    Bytes::from(buf)
                });
                let restored = set_nonblocking(io.channel, true);
                done.complete(restored.and(result));
            }
        };
        let on_abort = {
            let done = done.clone();
            move |e: io::Error| {
                done.complete(Err(e));
            }
        };
        let event = CallbackEvent::new(self.io.channel, Interest::READ, on_ready)
            .with_flags(EventFlags::ONE_SHOT.blocking())
            .on_abort(on_abort);
        self.io.reactor.register(Arc::new(event));

        match done.wait_timeout(self.config.io_timeout) {
            Some(result) => result,
            None => {
                self.io.reactor.cancel(self.io.channel);
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
            }
        }
    }

    /// Write every buffer, blocking until the queue has drained.
    pub fn write_blocking(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        self.write_async(bufs)?;
        if self.queue.wait_drained(self.config.io_timeout) {
            Ok(())
        } else if self.queue.is_closed() {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket closed"))
        } else {
            Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))
        }
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        if self.io.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reading.store(false, Ordering::Release);
        self.queue.close();
        self.io.reactor.cancel(self.io.channel);
        let _ = self.io.stream.shutdown(Shutdown::Both);
        debug!(channel = self.io.channel, peer = %self.peer, "socket closed");
    }
}

fn connect_result(stream: &TcpStream) -> io::Result<()> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connect failed",
        )),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPool;
    use crate::reactor::{Reactor, ReactorConfig};
    use std::net::TcpListener;

    struct ChannelReceiver {
        tx: crossbeam_channel::Sender<Result<Bytes, io::ErrorKind>>,
    }

    impl Receiver for ChannelReceiver {
        fn on_bytes(&self, data: Bytes) {
            let _ = self.tx.send(Ok(data));
        }

        fn on_error(&self, error: io::Error) {
            let _ = self.tx.send(Err(error.kind()));
        }
    }

    fn setup() -> (Reactor, Arc<ThreadPool>, TcpListener) {
        let pool = Arc::new(ThreadPool::new("socket-test", 2).unwrap());
        let reactor = Reactor::start(ReactorConfig::default(), pool.clone()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        (reactor, pool, listener)
    }

    #[test]
    fn test_connect_write_and_async_read() {
        let (reactor, _pool, listener) = setup();
        let addr = listener.local_addr().unwrap();

        let conn =
            AsyncSocketConnection::connect(addr, &reactor.handle(), &SocketConfig::default())
                .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        conn.start_reading(Arc::new(ChannelReceiver { tx }));

        conn.write_blocking(vec![Bytes::from_static(b"ping")]).unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").unwrap();
        let mut received = Vec::new();
        while received.len() < 4 {
            let chunk = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(&received[..], b"pong");

        drop(peer);
        let mut saw_eof = false;
        while let Ok(item) = rx.recv_timeout(Duration::from_secs(5)) {
            if item == Err(io::ErrorKind::UnexpectedEof) {
                saw_eof = true;
                break;
            }
        }
        assert!(saw_eof);
        conn.close();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_read_blocking() {
        let (reactor, _pool, listener) = setup();
        let addr = listener.local_addr().unwrap();

        let conn =
            AsyncSocketConnection::connect(addr, &reactor.handle(), &SocketConfig::default())
                .unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(b"hello").unwrap();

        let data = conn.read_blocking(16).unwrap();
        assert!(!data.is_empty());
        assert!(b"hello".starts_with(&data));

        let flags = unsafe { libc::fcntl(conn.channel(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_connect_refused() {
        let (reactor, _pool, listener) = setup();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result =
            AsyncSocketConnection::connect(addr, &reactor.handle(), &SocketConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_write_after_close_fails() {
        let (reactor, _pool, listener) = setup();
        let addr = listener.local_addr().unwrap();
        let conn =
            AsyncSocketConnection::connect(addr, &reactor.handle(), &SocketConfig::default())
                .unwrap();
        conn.close();
        conn.close();
        let err = conn.write_async(vec![Bytes::from_static(b"x")]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
