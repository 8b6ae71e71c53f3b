//! HTTP/2 stream state tracking.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use io_driver::{Completion, TimerId};
use parking_lot::Mutex;

use super::Http2Connection;
use super::window_update::WindowUpdateSender;
use crate::body::{Body, BodySender};
use crate::error::Error;
use crate::frame::{ErrorCode, StreamId};
use crate::message::{Headers, PushPromise, Response};

pub type ResponseSlot = Completion<Result<Response, Error>>;

/// Stream state (RFC 7540 Section 5.1), as seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing sent yet.
    Idle,
    /// Request headers sent, no response headers yet.
    HeadersSent,
    /// Both directions open.
    Open,
    /// We sent END_STREAM.
    HalfClosedLocal,
    /// The peer sent END_STREAM.
    HalfClosedRemote,
    Closed,
}

/// Decides what to do with a server push.
pub trait PushHandler: Send + Sync {
    /// Accept or refuse the pushed stream promised for `promise.parent`.
    /// An accepted push delivers its response through `response`; a refused
    /// one is reset with CANCEL.
    ///
    /// Runs on the connection's reader and must not block.
    fn on_push(&self, promise: PushPromise, response: ResponseHandle) -> bool;
}

impl<F> PushHandler for F
where
    F: Fn(PushPromise, ResponseHandle) -> bool + Send + Sync,
{
    fn on_push(&self, promise: PushPromise, response: ResponseHandle) -> bool {
        self(promise, response)
    }
}

#[derive(Default)]
struct Flags {
    headers_sent: bool,
    local_closed: bool,
    remote_closed: bool,
    /// A final (non-1xx) response header block arrived.
    response_received: bool,
    closed: bool,
}

struct Inner {
    flags: Flags,
    /// Responses that arrived with nobody waiting, oldest first.
    responses: VecDeque<ResponseSlot>,
    /// Slots handed out to callers and not yet completed, oldest first.
    waiters: VecDeque<ResponseSlot>,
    /// Served once `responses` runs dry.
    error: Option<Error>,
    /// Shared so pushes happen outside the stream lock.
    body: Option<Arc<BodySender>>,
    /// Request body being uploaded, cancelled when the stream closes.
    upload: Option<Arc<Body>>,
    timer: Option<TimerId>,
}

/// One request/response exchange, or a pushed response.
pub struct Stream {
    id: StreamId,
    inner: Mutex<Inner>,
    /// Credit handed back to the peer as the response body is consumed.
    recv_window: WindowUpdateSender,
    push_handler: Option<Arc<dyn PushHandler>>,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        recv_window: u32,
        push_handler: Option<Arc<dyn PushHandler>>,
    ) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner {
                flags: Flags::default(),
                responses: VecDeque::new(),
                waiters: VecDeque::new(),
                error: None,
                body: None,
                upload: None,
                timer: None,
            }),
            recv_window: WindowUpdateSender::new(recv_window),
            push_handler,
        }
    }

    /// A promised stream: the request side is the server's, so the only
    /// direction left is the response.
    pub(crate) fn pushed(id: StreamId, recv_window: u32) -> Self {
        let stream = Self::new(id, recv_window, None);
        {
            let mut inner = stream.inner.lock();
            inner.flags.headers_sent = true;
            inner.flags.local_closed = true;
        }
        stream
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        let inner = self.inner.lock();
        let flags = &inner.flags;
        match (flags.headers_sent, flags.local_closed, flags.remote_closed) {
            _ if flags.closed => StreamState::Closed,
            (false, _, _) => StreamState::Idle,
            (true, true, true) => StreamState::Closed,
            (true, true, false) => StreamState::HalfClosedLocal,
            (true, false, true) => StreamState::HalfClosedRemote,
            (true, false, false) if flags.response_received => StreamState::Open,
            (true, false, false) => StreamState::HeadersSent,
        }
    }

    pub(crate) fn push_handler(&self) -> Option<&Arc<dyn PushHandler>> {
        self.push_handler.as_ref()
    }

    pub(crate) fn recv_window(&self) -> &WindowUpdateSender {
        &self.recv_window
    }

    pub(crate) fn headers_sent(&self, end_stream: bool) {
        let mut inner = self.inner.lock();
        inner.flags.headers_sent = true;
        inner.flags.local_closed |= end_stream;
    }

    /// Record our END_STREAM. Returns `true` if both directions are now done.
    pub(crate) fn local_closed(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.flags.local_closed = true;
        inner.flags.remote_closed && !inner.flags.closed
    }

    /// Record the peer's END_STREAM. Returns `true` if both directions are
    /// now done.
    pub(crate) fn remote_closed(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.flags.remote_closed = true;
        inner.flags.local_closed && !inner.flags.closed
    }

    pub(crate) fn is_remote_closed(&self) -> bool {
        self.inner.lock().flags.remote_closed
    }

    pub(crate) fn is_response_received(&self) -> bool {
        self.inner.lock().flags.response_received
    }

    pub(crate) fn set_timer(&self, timer: TimerId) {
        self.inner.lock().timer = Some(timer);
    }

    pub(crate) fn take_timer(&self) -> Option<TimerId> {
        self.inner.lock().timer.take()
    }

    /// Mark the stream closed. Returns `false` if it already was, so the
    /// caller's cleanup runs exactly once.
    pub(crate) fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.flags.closed {
            return false;
        }
        inner.flags.closed = true;
        let upload = inner.upload.take();
        drop(inner);
        self.recv_window.close();
        if let Some(upload) = upload {
            upload.cancel();
        }
        true
    }

    /// Track the request body being uploaded so closing the stream wakes
    /// the uploader.
    pub(crate) fn set_upload(&self, body: Arc<Body>) {
        let mut inner = self.inner.lock();
        if inner.flags.closed {
            drop(inner);
            body.cancel();
        } else {
            inner.upload = Some(body);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().flags.closed
    }

    /// Slot for the next response: the oldest one already delivered, the
    /// stream's failure, or a new pending one.
    pub(crate) fn next_response(&self) -> ResponseSlot {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.responses.pop_front() {
            return slot;
        }
        if let Some(error) = &inner.error {
            return ResponseSlot::completed(Err(error.clone()));
        }
        let slot = ResponseSlot::new();
        inner.waiters.push_back(slot.clone());
        slot
    }

    /// Deliver a response header block to the oldest waiter, or queue it if
    /// nobody is waiting. A final response also installs the body sender.
    pub(crate) fn complete_response(&self, response: Response, body: Option<BodySender>) {
        let mut inner = self.inner.lock();
        if body.is_some() {
            inner.flags.response_received = true;
            inner.body = body.map(Arc::new);
        }
        match inner.waiters.pop_front() {
            Some(slot) => {
                slot.complete(Ok(response));
            }
            None => inner
                .responses
                .push_back(ResponseSlot::completed(Ok(response))),
        }
    }

    pub(crate) fn push_data(&self, data: Bytes) {
        let body = self.inner.lock().body.clone();
        if let Some(body) = body {
            body.push(data);
        }
    }

    /// End the response body. Returns `false` if there is no body to end.
    pub(crate) fn finish_body(&self, trailers: Option<Headers>) -> bool {
        let body = self.inner.lock().body.take();
        match body {
            Some(body) => {
                body.finish(trailers);
                true
            }
            None => false,
        }
    }

    /// Fail whatever is still outstanding: every pending response and the
    /// body. Returns the request timer so the caller can cancel it.
    pub(crate) fn fail(&self, error: Error) -> Option<TimerId> {
        let (body, timer) = {
            let mut inner = self.inner.lock();
            for slot in inner.waiters.drain(..) {
                slot.complete(Err(error.clone()));
            }
            if inner.error.is_none() {
                inner.error = Some(error.clone());
            }
            (inner.body.take(), inner.timer.take())
        };
        if let Some(body) = body {
            body.fail(error);
        }
        timer
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Caller's side of a stream: wait for the response or cancel it.
pub struct ResponseHandle {
    stream: Arc<Stream>,
    connection: Http2Connection,
    /// A slot whose wait timed out, reused by the next call.
    waiting: Mutex<Option<ResponseSlot>>,
}

impl ResponseHandle {
    pub(crate) fn new(stream: Arc<Stream>, connection: Http2Connection) -> Self {
        Self {
            stream,
            connection,
            waiting: Mutex::new(None),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    /// Block for the final response, skipping informational (1xx) ones.
    pub fn response(&self) -> Result<Response, Error> {
        loop {
            let response = self.next_response()?;
            if !response.is_informational() {
                return Ok(response);
            }
        }
    }

    /// Like [`response`](Self::response) with a deadline. Expiry leaves the
    /// stream running; call [`cancel`](Self::cancel) to abandon it.
    pub fn response_timeout(&self, timeout: Duration) -> Result<Response, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = self.wait(Some(remaining))?;
            if !response.is_informational() {
                return Ok(response);
            }
        }
    }

    /// Block for the next response header block, informational ones
    /// included.
    pub fn next_response(&self) -> Result<Response, Error> {
        self.wait(None)
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Response, Error> {
        loop {
            let slot = self
                .waiting
                .lock()
                .take()
                .unwrap_or_else(|| self.stream.next_response());
            let result = match timeout {
                Some(timeout) => slot.wait_timeout(timeout),
                None => slot.wait(),
            };
            match result {
                Some(result) => return result,
                // Already taken through another clone; move on to the next.
                None if slot.is_complete() => continue,
                None => {
                    *self.waiting.lock() = Some(slot);
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// Reset the stream with CANCEL and fail anything still pending.
    pub fn cancel(&self) {
        self.connection
            .reset_stream(&self.stream, ErrorCode::Cancel, Error::Cancelled);
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("stream", &self.stream)
            .finish()
    }
}
