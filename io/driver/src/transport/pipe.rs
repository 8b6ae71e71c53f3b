//! Asynchronous TLS layer between a socket and an application protocol.
//!
//! A [`TlsPipe`] sits on top of a [`Downstream`] (normally the socket's write
//! queue) and under an upper [`Receiver`]. Ciphertext arrives through
//! [`async_receive`](TlsPipe::async_receive) in socket order and is unwrapped
//! by a single drainer. Whenever the engine asks for handshake work the
//! drainer stops, pushes the unconsumed remainder back to the front of the
//! input queue and schedules the handshake on the executor. The handshake
//! loop consumes input directly until the engine is done, then drainage
//! resumes. The reactor thread never blocks on a handshake.
//!
//! Outbound plaintext goes through a second [`AsyncWriteQueue`] whose sink is
//! the pipe itself. While the first handshake is running that sink reports
//! itself full, so application writes queue up and are flushed once the
//! handshake finishes.
//!
//! The handshake loop blocks a worker while it waits for input, so the
//! executor needs at least two threads.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::Receiver;
use super::engine::{HandshakeStatus, Status, TlsEngine, TlsError};
use crate::executor::Executor;
use crate::socket::AsyncSocketConnection;
use crate::write_queue::{AsyncWriteQueue, WriteSink};

/// How long `close` waits for the close notification to reach the socket.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Where the pipe sends ciphertext.
pub trait Downstream: Send + Sync + 'static {
    /// Queue ciphertext and start writing it. Must not block.
    fn send(&self, bufs: Vec<Bytes>) -> io::Result<()>;

    /// Wait until everything sent so far has been written.
    fn drain(&self, timeout: Duration) -> bool;

    fn close(&self);
}

impl Downstream for AsyncSocketConnection {
    fn send(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        self.write_async(bufs)
    }

    fn drain(&self, timeout: Duration) -> bool {
        self.write_queue().wait_drained(timeout)
    }

    fn close(&self) {
        AsyncSocketConnection::close(self)
    }
}

/// Lifecycle of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Handshaking,
    ApplicationData,
    Closed,
}

struct PipeStatus {
    state: PipeState,
    /// Plaintext queue flushes waiting for the first handshake.
    resumes: Vec<Box<dyn FnOnce() + Send>>,
    failure: Option<(io::ErrorKind, String)>,
}

#[derive(Default)]
struct Input {
    bufs: VecDeque<Bytes>,
    /// A handshake owns the input; the drainer stays away.
    handshaking: bool,
    closed: bool,
}

#[derive(Default)]
struct Upper {
    receiver: Option<Arc<dyn Receiver>>,
    /// Plaintext received before a receiver was attached.
    buffered: Vec<Bytes>,
    error: Option<io::Error>,
}

/// See the module documentation.
pub struct TlsPipe {
    this: Weak<TlsPipe>,
    engine: Mutex<Box<dyn TlsEngine>>,
    downstream: Arc<dyn Downstream>,
    executor: Arc<dyn Executor>,
    handshake_timeout: Duration,

    status: Mutex<PipeStatus>,
    status_changed: Condvar,

    input: Mutex<Input>,
    input_ready: Condvar,
    draining: AtomicBool,

    handshake_permit: Mutex<()>,
    upper: Mutex<Upper>,
    plaintext: Arc<AsyncWriteQueue<PipeSink>>,
}

/// The pipe as the sink of its own plaintext queue.
pub struct PipeSink {
    pipe: Weak<TlsPipe>,
}

impl WriteSink for PipeSink {
    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.pipe.upgrade() {
            Some(pipe) => pipe.upper_write(bufs),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "tls pipe dropped")),
        }
    }

    fn await_writable(&self, resume: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        let Some(pipe) = self.pipe.upgrade() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tls pipe dropped"));
        };
        {
            let mut status = pipe.status.lock();
            match status.state {
                PipeState::Handshaking => {
                    status.resumes.push(resume);
                    return Ok(());
                }
                PipeState::Closed => return Err(pipe.failure(&status)),
                PipeState::ApplicationData => {}
            }
        }
        pipe.executor.execute(resume)
    }
}

/// Feeds socket input into a pipe.
pub struct PipeReceiver(pub Arc<TlsPipe>);

impl Receiver for PipeReceiver {
    fn on_bytes(&self, data: Bytes) {
        self.0.async_receive(data);
    }

    fn on_error(&self, error: io::Error) {
        self.0.fail(TlsError::Io(error));
    }
}

impl TlsPipe {
    /// Create a pipe in the `Handshaking` state. Nothing is sent until
    /// [`start_handshake`](Self::start_handshake).
    pub fn new(
        engine: Box<dyn TlsEngine>,
        downstream: Arc<dyn Downstream>,
        executor: Arc<dyn Executor>,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            engine: Mutex::new(engine),
            downstream,
            executor,
            handshake_timeout,
            status: Mutex::new(PipeStatus {
                state: PipeState::Handshaking,
                resumes: Vec::new(),
                failure: None,
            }),
            status_changed: Condvar::new(),
            input: Mutex::new(Input {
                handshaking: true,
                ..Input::default()
            }),
            input_ready: Condvar::new(),
            draining: AtomicBool::new(false),
            handshake_permit: Mutex::new(()),
            upper: Mutex::new(Upper::default()),
            plaintext: AsyncWriteQueue::new(PipeSink { pipe: this.clone() }),
        })
    }

    pub fn state(&self) -> PipeState {
        self.status.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PipeState::Closed
    }

    /// Negotiated application protocol.
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.engine.lock().alpn_protocol()
    }

    /// Queue for outbound plaintext.
    pub fn plaintext_queue(&self) -> &Arc<AsyncWriteQueue<PipeSink>> {
        &self.plaintext
    }

    /// Run the first handshake on the executor.
    pub fn start_handshake(&self) -> io::Result<()> {
        self.schedule_handshake()
    }

    /// Block until the first handshake finished, the pipe failed, or
    /// `timeout` passed.
    pub fn handshake(&self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while status.state == PipeState::Handshaking {
            if self
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                drop(status);
                self.fail(TlsError::HandshakeTimeout);
                return Err(TlsError::HandshakeTimeout.into());
            }
        }
        match status.state {
            PipeState::ApplicationData => Ok(()),
            _ => Err(self.failure(&status)),
        }
    }

    /// Attach the receiver for plaintext. Anything received earlier is
    /// delivered first, as is an earlier failure.
    ///
    /// The receiver is never called with `upper` held, so it may write
    /// back into the pipe.
    pub fn attach(&self, receiver: Arc<dyn Receiver>) {
        loop {
            let (buffered, error) = {
                let mut upper = self.upper.lock();
                if upper.buffered.is_empty() {
                    let error = upper.error.take();
                    if error.is_none() {
                        upper.receiver = Some(receiver);
                        return;
                    }
                    (Vec::new(), error)
                } else {
                    (std::mem::take(&mut upper.buffered), None)
                }
            };
            for data in buffered {
                receiver.on_bytes(data);
            }
            if let Some(error) = error {
                receiver.on_error(error);
                return;
            }
        }
    }

    // === Inbound ===

    /// Accept ciphertext from the socket, in order.
    pub fn async_receive(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        {
            let mut input = self.input.lock();
            if input.closed {
                return;
            }
            input.bufs.push_back(data);
        }
        self.input_ready.notify_all();
        self.drain_input();
    }

    fn drain_input(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let result = self.drain_once();
            self.draining.store(false, Ordering::Release);

            if let Err(e) = result {
                self.fail(e);
                return;
            }

            let input = self.input.lock();
            if input.handshaking || input.closed || input.bufs.is_empty() {
                return;
            }
        }
    }

    fn drain_once(&self) -> Result<(), TlsError> {
        loop {
            let mut src = {
                let mut input = self.input.lock();
                if input.handshaking || input.closed {
                    return Ok(());
                }
                match input.bufs.pop_front() {
                    Some(buf) => buf,
                    None => return Ok(()),
                }
            };

            loop {
                let mut out = BytesMut::new();
                let result = self.engine.lock().unwrap(&src, &mut out)?;
                src.advance(result.consumed);
                self.deliver(out);

                match result.status {
                    Status::Closed => {
                        debug!("tls peer closed the session");
                        return Err(TlsError::Closed);
                    }
                    Status::BufferUnderflow => {
                        let mut input = self.input.lock();
                        match input.bufs.pop_front() {
                            Some(next) => {
                                src = merge(src, next);
                                continue;
                            }
                            None => {
                                if !src.is_empty() {
                                    input.bufs.push_front(src);
                                }
                                return Ok(());
                            }
                        }
                    }
                    Status::Ok | Status::BufferOverflow => {}
                }

                if result.handshake.is_handshaking() {
                    {
                        let mut input = self.input.lock();
                        if !src.is_empty() {
                            input.bufs.push_front(src);
                        }
                        input.handshaking = true;
                    }
                    trace!(status = ?result.handshake, "handshake requested by peer");
                    self.schedule_handshake()
                        .map_err(|e| TlsError::Engine(e.to_string()))?;
                    return Ok(());
                }

                if src.is_empty() {
                    break;
                }
            }
        }
    }

    fn deliver(&self, data: BytesMut) {
        if data.is_empty() {
            return;
        }
        let data = data.freeze();
        let receiver = {
            let mut upper = self.upper.lock();
            match upper.receiver.clone() {
                Some(receiver) => receiver,
                None => {
                    upper.buffered.push(data);
                    return;
                }
            }
        };
        receiver.on_bytes(data);
    }

    // === Handshake ===

    fn schedule_handshake(&self) -> io::Result<()> {
        let Some(pipe) = self.this.upgrade() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tls pipe dropped"));
        };
        self.executor.execute(Box::new(move || {
            let deadline = Instant::now() + pipe.handshake_timeout;
            if let Err(e) = pipe.run_handshake(deadline) {
                debug!(error = %e, "tls handshake failed");
            }
        }))
    }

    fn run_handshake(&self, deadline: Instant) -> io::Result<()> {
        let _permit = self.handshake_permit.lock();
        self.input.lock().handshaking = true;

        let result = self.handshake_loop(deadline);

        self.input.lock().handshaking = false;

        if let Err(e) = result {
            self.fail(e);
            return Err(self.failure(&self.status.lock()));
        }

        let alpn = self.engine.lock().alpn_protocol();
        let resumes = {
            let mut status = self.status.lock();
            if status.state == PipeState::Handshaking {
                status.state = PipeState::ApplicationData;
                debug!(
                    alpn = ?alpn.as_deref().map(String::from_utf8_lossy),
                    "tls handshake finished"
                );
            }
            std::mem::take(&mut status.resumes)
        };
        self.status_changed.notify_all();

        for resume in resumes {
            resume();
        }
        self.drain_input();
        Ok(())
    }

    fn handshake_loop(&self, deadline: Instant) -> Result<(), TlsError> {
        // Bytes left over from an underflowing unwrap.
        let mut carry = Bytes::new();

        loop {
            let status = self.engine.lock().handshake_status();
            match status {
                HandshakeStatus::NeedTask => loop {
                    let task = self.engine.lock().delegated_task();
                    let Some(task) = task else {
                        break;
                    };
                    task();
                },
                HandshakeStatus::NeedWrap => {
                    let mut engine = self.engine.lock();
                    let mut out = BytesMut::new();
                    let result = engine.wrap(&[], &mut out)?;
                    if !out.is_empty() {
                        self.downstream.send(vec![out.freeze()])?;
                    }
                    drop(engine);
                    if result.status == Status::Closed {
                        return Err(TlsError::Closed);
                    }
                    if result.handshake == HandshakeStatus::Finished {
                        return self.finish_handshake(carry);
                    }
                }
                HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedUnwrapAgain => {
                    let mut src = if status == HandshakeStatus::NeedUnwrapAgain && carry.is_empty()
                    {
                        Bytes::new()
                    } else {
                        let next = self.next_input(deadline)?;
                        merge(std::mem::take(&mut carry), next)
                    };

                    let mut out = BytesMut::new();
                    let result = self.engine.lock().unwrap(&src, &mut out)?;
                    src.advance(result.consumed);
                    self.deliver(out);

                    match result.status {
                        Status::Closed => return Err(TlsError::Closed),
                        Status::BufferUnderflow => carry = src,
                        Status::Ok | Status::BufferOverflow => {
                            if !src.is_empty() {
                                self.input.lock().bufs.push_front(src);
                            }
                        }
                    }
                    if result.handshake == HandshakeStatus::Finished {
                        return self.finish_handshake(carry);
                    }
                }
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    return self.finish_handshake(carry);
                }
            }
        }
    }

    fn finish_handshake(&self, carry: Bytes) -> Result<(), TlsError> {
        if !carry.is_empty() {
            self.input.lock().bufs.push_front(carry);
        }
        Ok(())
    }

    /// Take the next input buffer, waiting until `deadline`.
    fn next_input(&self, deadline: Instant) -> Result<Bytes, TlsError> {
        let mut input = self.input.lock();
        loop {
            if input.closed {
                return Err(TlsError::Closed);
            }
            if let Some(buf) = input.bufs.pop_front() {
                return Ok(buf);
            }
            if self.input_ready.wait_until(&mut input, deadline).timed_out() {
                return Err(TlsError::HandshakeTimeout);
            }
        }
    }

    // === Outbound ===

    /// Encrypt application bytes and hand the records to the downstream.
    ///
    /// If the engine starts a handshake mid-stream it is run synchronously on
    /// the calling thread.
    pub fn upper_write(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.state() {
            PipeState::Closed => return Err(self.failure(&self.status.lock())),
            PipeState::Handshaking => return Err(io::ErrorKind::WouldBlock.into()),
            PipeState::ApplicationData => {}
        }

        let mut written = 0;
        for buf in bufs {
            let mut src: &[u8] = buf;
            while !src.is_empty() {
                let mut engine = self.engine.lock();
                let mut out = BytesMut::new();
                let result = match engine.wrap(src, &mut out) {
                    Ok(result) => result,
                    Err(e) => {
                        drop(engine);
                        let error = io::Error::other(e.to_string());
                        self.fail(e);
                        return Err(error);
                    }
                };
                if !out.is_empty() {
                    self.downstream.send(vec![out.freeze()])?;
                }
                drop(engine);

                if result.status == Status::Closed {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tls session closed"));
                }
                written += result.consumed;
                src = &src[result.consumed..];

                if result.handshake.is_handshaking() {
                    let deadline = Instant::now() + self.handshake_timeout;
                    self.run_handshake(deadline)?;
                } else if result.consumed == 0 {
                    return Ok(written);
                }
            }
        }
        Ok(written)
    }

    // === Teardown ===

    /// Send a close notification and close the downstream.
    pub fn close(&self) {
        {
            let mut status = self.status.lock();
            if status.state == PipeState::Closed {
                return;
            }
            status.state = PipeState::Closed;
            status.failure = Some((io::ErrorKind::BrokenPipe, "tls pipe closed".to_string()));
        }
        self.status_changed.notify_all();

        {
            let mut engine = self.engine.lock();
            engine.close_outbound();
            let mut out = BytesMut::new();
            if engine.wrap(&[], &mut out).is_ok() && !out.is_empty() {
                let _ = self.downstream.send(vec![out.freeze()]);
            }
        }
        self.downstream.drain(CLOSE_DRAIN_TIMEOUT);
        self.teardown();
        debug!("tls pipe closed");
    }

    /// Close everything after an error and report it upstream.
    pub fn fail(&self, error: TlsError) {
        let (kind, message) = match &error {
            TlsError::Io(e) => (e.kind(), e.to_string()),
            TlsError::HandshakeTimeout => (io::ErrorKind::TimedOut, error.to_string()),
            TlsError::Closed => (io::ErrorKind::UnexpectedEof, error.to_string()),
            _ => (io::ErrorKind::Other, error.to_string()),
        };
        {
            let mut status = self.status.lock();
            if status.state == PipeState::Closed {
                return;
            }
            status.state = PipeState::Closed;
            status.failure = Some((kind, message.clone()));
            status.resumes.clear();
        }
        self.status_changed.notify_all();
        if matches!(error, TlsError::Closed) {
            debug!("tls pipe closed by peer");
        } else {
            warn!(error = %message, "tls pipe failed");
        }

        self.teardown();

        let error = io::Error::new(kind, message);
        let receiver = {
            let mut upper = self.upper.lock();
            match upper.receiver.take() {
                Some(receiver) => receiver,
                None => {
                    upper.error = Some(error);
                    return;
                }
            }
        };
        receiver.on_error(error);
    }

    fn teardown(&self) {
        {
            let mut input = self.input.lock();
            input.closed = true;
            input.bufs.clear();
        }
        self.input_ready.notify_all();
        self.plaintext.close();
        self.downstream.close();
    }

    fn failure(&self, status: &PipeStatus) -> io::Error {
        match &status.failure {
            Some((kind, message)) => io::Error::new(*kind, message.clone()),
            None => io::Error::new(io::ErrorKind::BrokenPipe, "tls pipe closed"),
        }
    }
}

fn merge(front: Bytes, back: Bytes) -> Bytes {
    if front.is_empty() {
        return back;
    }
    let mut merged = BytesMut::with_capacity(front.len() + back.len());
    merged.extend_from_slice(&front);
    merged.extend_from_slice(&back);
    merged.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPool;
    use crate::transport::engine::EngineResult;

    /// Handshake: send `HI`, expect `OK`. Records afterwards are plaintext
    /// behind a one-byte length prefix.
    struct MockEngine {
        sent_hello: bool,
        got_ok: bool,
        finished_reported: bool,
        closed: bool,
    }

    impl MockEngine {
        fn new() -> Self {
            Self {
                sent_hello: false,
                got_ok: false,
                finished_reported: false,
                closed: false,
            }
        }

        fn after(&mut self) -> HandshakeStatus {
            let status = self.handshake_status();
            if status == HandshakeStatus::NotHandshaking && !self.finished_reported {
                self.finished_reported = true;
                return HandshakeStatus::Finished;
            }
            status
        }
    }

    impl TlsEngine for MockEngine {
        fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError> {
            if !self.sent_hello {
                self.sent_hello = true;
                dst.extend_from_slice(b"HI");
                return Ok(EngineResult {
                    status: Status::Ok,
                    handshake: self.after(),
                    consumed: 0,
                    produced: 2,
                });
            }
            if self.closed {
                return Ok(EngineResult {
                    status: Status::Closed,
                    handshake: self.after(),
                    consumed: 0,
                    produced: 0,
                });
            }
            let n = src.len().min(255);
            dst.extend_from_slice(&[n as u8]);
            dst.extend_from_slice(&src[..n]);
            Ok(EngineResult {
                status: Status::Ok,
                handshake: self.after(),
                consumed: n,
                produced: n + 1,
            })
        }

        fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError> {
            let underflow = |handshake| EngineResult {
                status: Status::BufferUnderflow,
                handshake,
                consumed: 0,
                produced: 0,
            };
            if !self.got_ok {
                if src.len() < 2 {
                    return Ok(underflow(self.handshake_status()));
                }
                if &src[..2] != b"OK" {
                    return Err(TlsError::Engine("bad server hello".to_string()));
                }
                self.got_ok = true;
                return Ok(EngineResult {
                    status: Status::Ok,
                    handshake: self.after(),
                    consumed: 2,
                    produced: 0,
                });
            }
            let Some(&len) = src.first() else {
                return Ok(underflow(self.handshake_status()));
            };
            let len = len as usize;
            if src.len() < len + 1 {
                return Ok(underflow(self.handshake_status()));
            }
            dst.extend_from_slice(&src[1..len + 1]);
            Ok(EngineResult {
                status: Status::Ok,
                handshake: self.after(),
                consumed: len + 1,
                produced: len,
            })
        }

        fn handshake_status(&self) -> HandshakeStatus {
            if !self.sent_hello {
                HandshakeStatus::NeedWrap
            } else if !self.got_ok {
                HandshakeStatus::NeedUnwrap
            } else {
                HandshakeStatus::NotHandshaking
            }
        }

        fn delegated_task(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
            None
        }

        fn alpn_protocol(&self) -> Option<Vec<u8>> {
            self.got_ok.then(|| b"h2".to_vec())
        }

        fn close_outbound(&mut self) {
            self.closed = true;
        }
    }

    #[derive(Default)]
    struct MemoryDownstream {
        sent: Mutex<Vec<u8>>,
        closed: AtomicBool,
    }

    impl Downstream for MemoryDownstream {
        fn send(&self, bufs: Vec<Bytes>) -> io::Result<()> {
            let mut sent = self.sent.lock();
            for buf in bufs {
                sent.extend_from_slice(&buf);
            }
            Ok(())
        }

        fn drain(&self, _timeout: Duration) -> bool {
            true
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Collect {
        tx: crossbeam_channel::Sender<Result<Bytes, io::ErrorKind>>,
    }

    impl Receiver for Collect {
        fn on_bytes(&self, data: Bytes) {
            let _ = self.tx.send(Ok(data));
        }

        fn on_error(&self, error: io::Error) {
            let _ = self.tx.send(Err(error.kind()));
        }
    }

    fn setup(timeout: Duration) -> (Arc<TlsPipe>, Arc<MemoryDownstream>, Arc<ThreadPool>) {
        let pool = Arc::new(ThreadPool::new("pipe-test", 3).unwrap());
        let downstream = Arc::new(MemoryDownstream::default());
        let pipe = TlsPipe::new(
            Box::new(MockEngine::new()),
            downstream.clone(),
            pool.clone(),
            timeout,
        );
        (pipe, downstream, pool)
    }

    #[test]
    fn test_handshake_then_application_data() {
        let (pipe, downstream, _pool) = setup(Duration::from_secs(5));
        pipe.start_handshake().unwrap();

        // The server answer arrives split across two reads.
        pipe.async_receive(Bytes::from_static(b"O"));
        pipe.async_receive(Bytes::from_static(b"K"));
        pipe.handshake(Duration::from_secs(5)).unwrap();
        assert_eq!(pipe.state(), PipeState::ApplicationData);
        assert_eq!(pipe.alpn_protocol(), Some(b"h2".to_vec()));
        assert_eq!(&downstream.sent.lock()[..], b"HI");

        let queue = pipe.plaintext_queue().clone();
        queue.put(vec![Bytes::from_static(b"abc")]).unwrap();
        queue.flush().unwrap();
        assert!(queue.wait_drained(Duration::from_secs(5)));
        assert_eq!(&downstream.sent.lock()[..], b"HI\x03abc");
    }

    #[test]
    fn test_plaintext_buffered_until_attach() {
        let (pipe, _downstream, _pool) = setup(Duration::from_secs(5));
        pipe.start_handshake().unwrap();
        // Handshake answer and a record in one read, the record split over two.
        pipe.async_receive(Bytes::from_static(b"OK\x05hel"));
        pipe.async_receive(Bytes::from_static(b"lo\x01!"));
        pipe.handshake(Duration::from_secs(5)).unwrap();

        // Leftover input may still be draining; attach sees it either way.
        let (tx, rx) = crossbeam_channel::unbounded();
        pipe.attach(Arc::new(Collect { tx }));
        let mut received = Vec::new();
        while received.len() < 6 {
            let chunk = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(&received[..], b"hello!");
    }

    #[test]
    fn test_writes_wait_for_handshake() {
        let (pipe, downstream, _pool) = setup(Duration::from_secs(5));
        let queue = pipe.plaintext_queue().clone();
        queue.put(vec![Bytes::from_static(b"early")]).unwrap();
        queue.flush().unwrap();
        assert!(downstream.sent.lock().is_empty());

        pipe.start_handshake().unwrap();
        pipe.async_receive(Bytes::from_static(b"OK"));
        pipe.handshake(Duration::from_secs(5)).unwrap();
        assert!(queue.wait_drained(Duration::from_secs(5)));
        assert_eq!(&downstream.sent.lock()[..], b"HI\x05early");
    }

    #[test]
    fn test_handshake_timeout_fails_pipe() {
        let (pipe, downstream, _pool) = setup(Duration::from_millis(100));
        pipe.start_handshake().unwrap();
        let err = pipe.handshake(Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(pipe.is_closed());
        assert!(downstream.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_engine_error_reported_to_receiver() {
        let (pipe, downstream, _pool) = setup(Duration::from_secs(5));
        let (tx, rx) = crossbeam_channel::unbounded();
        pipe.attach(Arc::new(Collect { tx }));
        pipe.start_handshake().unwrap();
        pipe.async_receive(Bytes::from_static(b"NO"));

        assert!(pipe.handshake(Duration::from_secs(5)).is_err());
        let item = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(item.is_err());
        assert!(downstream.closed.load(Ordering::SeqCst));
        assert!(pipe.plaintext_queue().is_closed());
    }

    /// Fails the pipe from inside `on_bytes`, as a protocol layer does when
    /// it rejects what it just read.
    struct FailOnBytes {
        pipe: Weak<TlsPipe>,
        tx: crossbeam_channel::Sender<Result<Bytes, io::ErrorKind>>,
    }

    impl Receiver for FailOnBytes {
        fn on_bytes(&self, data: Bytes) {
            let _ = self.tx.send(Ok(data));
            if let Some(pipe) = self.pipe.upgrade() {
                pipe.fail(TlsError::Engine("rejected".to_string()));
            }
        }

        fn on_error(&self, error: io::Error) {
            let _ = self.tx.send(Err(error.kind()));
        }
    }

    #[test]
    fn test_receiver_may_fail_pipe_from_callback() {
        let (pipe, downstream, _pool) = setup(Duration::from_secs(5));
        let (tx, rx) = crossbeam_channel::unbounded();
        pipe.attach(Arc::new(FailOnBytes {
            pipe: Arc::downgrade(&pipe),
            tx,
        }));
        pipe.start_handshake().unwrap();
        pipe.async_receive(Bytes::from_static(b"OK"));
        pipe.handshake(Duration::from_secs(5)).unwrap();
        pipe.async_receive(Bytes::from_static(b"\x02hi"));

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, Ok(Bytes::from_static(b"hi")));
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second, Err(io::ErrorKind::Other));
        assert!(pipe.is_closed());
        assert!(downstream.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_peer_close_reported_as_eof() {
        let (pipe, _downstream, _pool) = setup(Duration::from_secs(5));
        pipe.start_handshake().unwrap();
        pipe.async_receive(Bytes::from_static(b"OK"));
        pipe.handshake(Duration::from_secs(5)).unwrap();

        pipe.fail(TlsError::Closed);
        let (tx, rx) = crossbeam_channel::unbounded();
        pipe.attach(Arc::new(Collect { tx }));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(io::ErrorKind::UnexpectedEof)
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let (pipe, downstream, _pool) = setup(Duration::from_secs(5));
        pipe.start_handshake().unwrap();
        pipe.async_receive(Bytes::from_static(b"OK"));
        pipe.handshake(Duration::from_secs(5)).unwrap();

        pipe.close();
        pipe.close();
        assert!(pipe.is_closed());
        assert!(downstream.closed.load(Ordering::SeqCst));
        let err = pipe.plaintext_queue().put(vec![Bytes::from_static(b"x")]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
