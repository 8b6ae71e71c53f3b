//! Ordered outbound buffer queue with a single-writer flush.
//!
//! Producers on any thread `put` buffer groups and call `flush`. Exactly one
//! caller at a time becomes the writer (decided by a non-blocking
//! compare-and-swap) and drains the queue; everyone else returns immediately.
//! The writer re-checks the queue after releasing writer status so items
//! added by losers during its drain are never stranded.
//!
//! A group is the unit of ordering: its buffers are written back to back and
//! never interleaved with another group. `put_first` groups jump ahead of
//! queued `put` groups but keep their own relative order, and never split a
//! group that is already partially written.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// Maximum number of slices handed to one vectored write.
const MAX_IOVECS: usize = 64;

/// Destination of an [`AsyncWriteQueue`].
pub trait WriteSink: Send + Sync + 'static {
    /// Write as much of `bufs` as possible without blocking.
    ///
    /// `WouldBlock` or a zero-length write means the sink is full.
    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Arrange for `resume` to run once the sink accepts bytes again.
    fn await_writable(&self, resume: Box<dyn FnOnce() + Send>) -> io::Result<()>;
}

#[derive(Default)]
struct QueueState {
    /// Remainder of the group currently being written.
    stash: VecDeque<Bytes>,
    /// Groups queued with `put_first`.
    urgent: VecDeque<Vec<Bytes>>,
    /// Groups queued with `put`.
    ordered: VecDeque<Vec<Bytes>>,
    queued_bytes: usize,
    /// A writable-interest registration is outstanding.
    waiting: bool,
    closed: bool,
}

impl QueueState {
    fn is_empty(&self) -> bool {
        self.stash.is_empty() && self.urgent.is_empty() && self.ordered.is_empty()
    }
}

enum Drain {
    Empty,
    Blocked,
}

/// See the module documentation.
pub struct AsyncWriteQueue<S: WriteSink> {
    sink: S,
    state: Mutex<QueueState>,
    drained: Condvar,
    writing: AtomicBool,
}

impl<S: WriteSink> AsyncWriteQueue<S> {
    pub fn new(sink: S) -> Arc<Self> {
        Arc::new(Self {
            sink,
            state: Mutex::new(QueueState::default()),
            drained: Condvar::new(),
            writing: AtomicBool::new(false),
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Append a group at the tail.
    pub fn put(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        self.enqueue(bufs, false)
    }

    /// Insert a group ahead of every group queued with `put`.
    pub fn put_first(&self, bufs: Vec<Bytes>) -> io::Result<()> {
        self.enqueue(bufs, true)
    }

    fn enqueue(&self, bufs: Vec<Bytes>, urgent: bool) -> io::Result<()> {
        let bytes: usize = bufs.iter().map(Bytes::len).sum();
        if bytes == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed());
        }
        state.queued_bytes += bytes;
        if urgent {
            state.urgent.push_back(bufs);
        } else {
            state.ordered.push_back(bufs);
        }
        Ok(())
    }

    /// Bytes queued but not yet accepted by the sink.
    pub fn queued_bytes(&self) -> usize {
        self.state.lock().queued_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Drop everything queued; later puts fail with `BrokenPipe`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.stash.clear();
        state.urgent.clear();
        state.ordered.clear();
        state.queued_bytes = 0;
        self.drained.notify_all();
    }

    /// Write queued groups until the queue is empty or the sink is full.
    ///
    /// Returns immediately if another thread is already writing or a
    /// writable notification is pending; that writer will pick up anything
    /// queued before this call.
    pub fn flush(self: &Arc<Self>) -> io::Result<()> {
        loop {
            if self.state.lock().waiting {
                return Ok(());
            }
            if self
                .writing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }

            let result = self.drain();
            self.writing.store(false, Ordering::Release);

            match result {
                Ok(Drain::Empty) => {
                    let state = self.state.lock();
                    if state.is_empty() || state.closed {
                        self.drained.notify_all();
                        return Ok(());
                    }
                    // Something arrived after the writer saw an empty queue.
                }
                Ok(Drain::Blocked) => return self.await_writable(),
                Err(e) => {
                    debug!(error = %e, "write failed, closing queue");
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    /// Block until the queue has been drained, closed, or `timeout` passed.
    /// Returns `true` if the queue is empty.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.is_empty() && !state.closed {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.is_empty()
    }

    fn await_writable(self: &Arc<Self>) -> io::Result<()> {
        {
            let mut state = self.state.lock();
            if state.waiting {
                return Ok(());
            }
            state.waiting = true;
        }
        trace!("sink full, waiting for writability");

        let queue = Arc::clone(self);
        let resume = Box::new(move || {
            queue.state.lock().waiting = false;
            if let Err(e) = queue.flush() {
                debug!(error = %e, "resumed flush failed");
            }
        });

        if let Err(e) = self.sink.await_writable(resume) {
            self.state.lock().waiting = false;
            self.close();
            return Err(e);
        }
        Ok(())
    }

    fn drain(&self) -> io::Result<Drain> {
        loop {
            let mut bufs = {
                let mut state = self.state.lock();
                if state.closed {
                    return Ok(Drain::Empty);
                }
                if state.stash.is_empty() {
                    match state.urgent.pop_front().or_else(|| state.ordered.pop_front()) {
                        Some(group) => state.stash.extend(group),
                        None => return Ok(Drain::Empty),
                    }
                }
                std::mem::take(&mut state.stash)
            };

            while !bufs.is_empty() {
                let written = {
                    let slices: Vec<IoSlice<'_>> = bufs
                        .iter()
                        .take(MAX_IOVECS)
                        .map(|b| IoSlice::new(b))
                        .collect();
                    self.sink.write_vectored(&slices)
                };

                match written {
                    Ok(0) => {
                        self.state.lock().stash = bufs;
                        return Ok(Drain::Blocked);
                    }
                    Ok(n) => {
                        advance(&mut bufs, n);
                        let mut state = self.state.lock();
                        state.queued_bytes = state.queued_bytes.saturating_sub(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.state.lock().stash = bufs;
                        return Ok(Drain::Blocked);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// Drop `n` written bytes from the front of `bufs`.
fn advance(bufs: &mut VecDeque<Bytes>, mut n: usize) {
    while n > 0 {
        let Some(front) = bufs.front_mut() else {
            return;
        };
        if front.len() <= n {
            n -= front.len();
            bufs.pop_front();
        } else {
            front.advance(n);
            n = 0;
        }
    }
    while bufs.front().is_some_and(Bytes::is_empty) {
        bufs.pop_front();
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "write queue closed")
}
