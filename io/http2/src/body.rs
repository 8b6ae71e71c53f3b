//! Body channel between a producer and a consumer thread.
//!
//! A [`BodySender`] produces chunks; a [`Body`] consumes them either by
//! pulling ([`Body::next_chunk`]) or by subscribing a [`BodyConsumer`] that
//! has chunks pushed to it. The channel is an explicit state machine:
//!
//! - `demand` counts chunks the consumer asked for and has not received.
//!   [`BodySender::send`] blocks until there is unfilled demand, so a slow
//!   consumer throttles the producer.
//! - At most one thread delivers to a subscriber at a time. A thread that
//!   finds delivery in progress leaves its work to the owner, so a consumer
//!   calling back into the channel from `on_chunk` never recurses.
//! - Cancellation is checked before every delivery.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::message::Headers;

/// Receives pushed body events. Calls are never concurrent.
pub trait BodyConsumer: Send + 'static {
    /// Called once before anything else. Nothing is delivered until demand
    /// is requested through the handle.
    fn on_subscribe(&mut self, demand: BodyDemand);

    fn on_chunk(&mut self, chunk: Bytes);

    /// End of body, with trailers if the peer sent any.
    fn on_complete(&mut self, trailers: Option<&Headers>);

    fn on_error(&mut self, error: Error);
}

/// Called with the length of every chunk the consumer takes, or drops
/// unread on cancel.
pub(crate) type ConsumeHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Called once if the consumer cancels before the body ends.
pub(crate) type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
enum End {
    Complete(Option<Headers>),
    Failed(Error),
}

struct State {
    queue: VecDeque<Bytes>,
    demand: u64,
    end: Option<End>,
    cancelled: bool,
    delivering: bool,
    end_delivered: bool,
    subscribed: bool,
    subscriber: Option<Box<dyn BodyConsumer>>,
    on_cancel: Option<CancelHook>,
}

struct Channel {
    state: Mutex<State>,
    changed: Condvar,
    on_consume: Option<ConsumeHook>,
}

impl Channel {
    fn new(on_consume: Option<ConsumeHook>, on_cancel: Option<CancelHook>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                demand: 0,
                end: None,
                cancelled: false,
                delivering: false,
                end_delivered: false,
                subscribed: false,
                subscriber: None,
                on_cancel,
            }),
            changed: Condvar::new(),
            on_consume,
        })
    }

    fn consumed(&self, len: usize) {
        if len > 0
            && let Some(hook) = &self.on_consume
        {
            hook(len);
        }
    }

    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            state.demand = state.demand.saturating_add(n);
        }
        self.changed.notify_all();
        self.drain();
    }

    fn cancel(&self) {
        let (dropped, hook) = {
            let mut state = self.state.lock();
            if state.cancelled || state.end_delivered {
                return;
            }
            state.cancelled = true;
            let dropped: usize = state.queue.drain(..).map(|c| c.len()).sum();
            // A body that already ended needs no reset.
            let hook = match state.end {
                Some(End::Complete(_)) => None,
                _ => state.on_cancel.take(),
            };
            (dropped, hook)
        };
        self.changed.notify_all();
        self.consumed(dropped);
        if let Some(hook) = hook {
            hook();
        }
    }

    fn finish(&self, end: End) {
        {
            let mut state = self.state.lock();
            if state.end.is_some() {
                return;
            }
            state.end = Some(end);
            state.on_cancel = None;
        }
        self.changed.notify_all();
        self.drain();
    }

    /// Push delivery loop. Only the thread that claims `delivering` runs it;
    /// everyone else returns and the owner picks up their changes on its
    /// next pass.
    fn drain(&self) {
        let mut state = self.state.lock();
        if state.delivering || state.subscriber.is_none() {
            return;
        }
        state.delivering = true;
        let Some(mut subscriber) = state.subscriber.take() else {
            state.delivering = false;
            return;
        };

        loop {
            if state.cancelled || state.end_delivered {
                break;
            }
            if state.demand > 0
                && let Some(chunk) = state.queue.pop_front()
            {
                state.demand -= 1;
                drop(state);
                let len = chunk.len();
                subscriber.on_chunk(chunk);
                self.consumed(len);
                state = self.state.lock();
                continue;
            }
            if state.queue.is_empty() && state.end.is_some() {
                state.end_delivered = true;
                let end = state.end.clone();
                drop(state);
                match end {
                    Some(End::Complete(trailers)) => subscriber.on_complete(trailers.as_ref()),
                    Some(End::Failed(e)) => subscriber.on_error(e),
                    None => {}
                }
                state = self.state.lock();
                continue;
            }
            break;
        }

        if !state.cancelled && !state.end_delivered {
            state.subscriber = Some(subscriber);
        }
        state.delivering = false;
    }
}

/// Create a connected producer and consumer pair.
pub fn channel() -> (BodySender, Body) {
    let channel = Channel::new(None, None);
    (
        BodySender {
            channel: channel.clone(),
        },
        Body { channel },
    )
}

/// A channel whose consumption and cancellation are reported back to the
/// connection (window updates, stream reset).
pub(crate) fn channel_with_hooks(
    on_consume: ConsumeHook,
    on_cancel: CancelHook,
) -> (BodySender, Body) {
    let channel = Channel::new(Some(on_consume), Some(on_cancel));
    (
        BodySender {
            channel: channel.clone(),
        },
        Body { channel },
    )
}

/// Producing half of a body channel.
///
/// Dropping it without calling [`finish`](Self::finish) fails the body.
pub struct BodySender {
    channel: Arc<Channel>,
}

impl BodySender {
    /// Queue a chunk once the consumer has asked for one.
    ///
    /// Blocks while there is no unfilled demand. Fails with
    /// [`Error::Cancelled`] if the consumer went away.
    pub fn send(&self, chunk: Bytes) -> Result<(), Error> {
        {
            let mut state = self.channel.state.lock();
            loop {
                if state.cancelled {
                    return Err(Error::Cancelled);
                }
                if state.end.is_some() {
                    return Err(Error::Body("body already finished".into()));
                }
                if (state.queue.len() as u64) < state.demand {
                    break;
                }
                self.channel.changed.wait(&mut state);
            }
            state.queue.push_back(chunk);
        }
        self.channel.changed.notify_all();
        self.channel.drain();
        Ok(())
    }

    /// Queue a chunk without waiting for demand. Used for inbound DATA,
    /// which the peer's flow control window already bounds. A chunk pushed
    /// after cancel is dropped and counted as consumed.
    pub(crate) fn push(&self, chunk: Bytes) {
        let dropped = {
            let mut state = self.channel.state.lock();
            if state.cancelled || state.end.is_some() {
                chunk.len()
            } else {
                state.queue.push_back(chunk);
                0
            }
        };
        if dropped > 0 {
            self.channel.consumed(dropped);
            return;
        }
        self.channel.changed.notify_all();
        self.channel.drain();
    }

    /// End the body, optionally with trailers.
    pub fn finish(&self, trailers: Option<Headers>) {
        self.channel.finish(End::Complete(trailers));
    }

    /// End the body with an error.
    pub fn fail(&self, error: Error) {
        self.channel.finish(End::Failed(error));
    }

    /// Whether the consumer cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.channel.state.lock().cancelled
    }
}

impl Drop for BodySender {
    fn drop(&mut self) {
        self.channel
            .finish(End::Failed(Error::Body("body sender dropped".into())));
    }
}

impl fmt::Debug for BodySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySender").finish_non_exhaustive()
    }
}

/// Handle a subscribed [`BodyConsumer`] uses to ask for more chunks.
#[derive(Clone)]
pub struct BodyDemand {
    channel: Arc<Channel>,
}

impl BodyDemand {
    pub fn request(&self, n: u64) {
        self.channel.request(n);
    }

    pub fn cancel(&self) {
        self.channel.cancel();
    }
}

/// Consuming half of a body channel.
///
/// Dropping it before the end of the body cancels it.
pub struct Body {
    channel: Arc<Channel>,
}

impl Body {
    /// A body that is already complete.
    pub fn empty() -> Self {
        let (sender, body) = channel();
        sender.finish(None);
        body
    }

    /// A complete body holding one chunk.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let (sender, body) = channel();
        if !data.is_empty() {
            let mut state = sender.channel.state.lock();
            state.queue.push_back(data);
        }
        sender.finish(None);
        body
    }

    /// Grant the producer `n` more chunks.
    pub fn request(&self, n: u64) {
        self.channel.request(n);
    }

    /// Block for the next chunk. `Ok(None)` at the end of the body.
    pub fn next_chunk(&self) -> Result<Option<Bytes>, Error> {
        self.next_chunk_inner(None)
    }

    /// Like [`next_chunk`](Self::next_chunk), failing with
    /// [`Error::Timeout`] if nothing arrives in time.
    pub fn next_chunk_timeout(&self, timeout: Duration) -> Result<Option<Bytes>, Error> {
        self.next_chunk_inner(Some(timeout))
    }

    fn next_chunk_inner(&self, timeout: Option<Duration>) -> Result<Option<Bytes>, Error> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let chunk = {
            let mut state = self.channel.state.lock();
            if state.subscribed {
                return Err(Error::Body("body has a subscriber".into()));
            }
            loop {
                if let Some(chunk) = state.queue.pop_front() {
                    state.demand = state.demand.saturating_sub(1);
                    break chunk;
                }
                if state.cancelled {
                    return Err(Error::Cancelled);
                }
                let end = match &state.end {
                    Some(End::Complete(_)) => Some(Ok(None)),
                    Some(End::Failed(e)) => Some(Err(e.clone())),
                    None => None,
                };
                if let Some(end) = end {
                    state.end_delivered = true;
                    return end;
                }
                if state.demand == 0 {
                    state.demand = 1;
                    self.channel.changed.notify_all();
                }
                match deadline {
                    Some(deadline) => {
                        if self
                            .channel
                            .changed
                            .wait_until(&mut state, deadline)
                            .timed_out()
                            && state.queue.is_empty()
                            && state.end.is_none()
                        {
                            return Err(Error::Timeout);
                        }
                    }
                    None => self.channel.changed.wait(&mut state),
                }
            }
        };
        self.channel.consumed(chunk.len());
        Ok(Some(chunk))
    }

    /// Read the rest of the body into one buffer.
    pub fn collect(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk()? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Trailers, once the body has completed.
    pub fn trailers(&self) -> Option<Headers> {
        match &self.channel.state.lock().end {
            Some(End::Complete(trailers)) => trailers.clone(),
            _ => None,
        }
    }

    /// Switch to push delivery. Pulling afterwards is an error.
    pub fn subscribe(&self, consumer: impl BodyConsumer) {
        let mut consumer: Box<dyn BodyConsumer> = Box::new(consumer);
        {
            let mut state = self.channel.state.lock();
            if state.subscribed {
                drop(state);
                consumer.on_error(Error::Body("body already subscribed".into()));
                return;
            }
            state.subscribed = true;
        }
        consumer.on_subscribe(BodyDemand {
            channel: self.channel.clone(),
        });
        self.channel.state.lock().subscriber = Some(consumer);
        self.channel.drain();
    }

    /// Stop consuming. Queued chunks are dropped and the producer is
    /// told; a body that already completed is unaffected.
    pub fn cancel(&self) {
        self.channel.cancel();
    }

    /// Whether the end of the body has been reached by the consumer.
    pub fn is_end(&self) -> bool {
        self.channel.state.lock().end_delivered
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        let subscribed = self.channel.state.lock().subscribed;
        if !subscribed {
            self.channel.cancel();
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.channel.state.lock();
        f.debug_struct("Body")
            .field("queued", &state.queue.len())
            .field("demand", &state.demand)
            .field("ended", &state.end.is_some())
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

/// Request payload.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    /// Chunks produced by the caller through a [`BodySender`].
    Stream(Body),
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Bytes(b) => b.is_empty(),
            RequestBody::Stream(_) => false,
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(data: Bytes) -> Self {
        RequestBody::Bytes(data)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(data: Vec<u8>) -> Self {
        RequestBody::Bytes(data.into())
    }
}

impl From<&'static str> for RequestBody {
    fn from(data: &'static str) -> Self {
        RequestBody::Bytes(Bytes::from_static(data.as_bytes()))
    }
}

impl From<Body> for RequestBody {
    fn from(body: Body) -> Self {
        RequestBody::Stream(body)
    }
}
