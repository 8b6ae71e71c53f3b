//! HTTP/2 client connection.
//!
//! An [`Http2Connection`] multiplexes request/response streams over one
//! [`NetConnection`]. It is a cheap handle; clones share one connection.
//!
//! - Inbound bytes arrive on the reactor's executor through a [`Receiver`],
//!   are decoded into frames and dispatched (see `inbound`).
//! - Request HEADERS are written under the send lock, which owns stream id
//!   allocation and the HPACK encoder, so header blocks never interleave
//!   and stream ids go out in order (see `outbound`).
//! - DATA and control frames (ACKs, resets, window updates) bypass the send
//!   lock. Control frames that must not wait behind queued DATA use the
//!   write queue's jump-the-queue lane.
//!
//! Lock order: reader, then send, then state, then an individual stream.

mod flow_control;
mod inbound;
mod outbound;
mod settings;
mod stream;
mod window_update;

pub use flow_control::{FlowController, FlowError};
pub use settings::ConnectionSettings;
pub use stream::{PushHandler, ResponseHandle, ResponseSlot, Stream, StreamState};
pub use window_update::WindowUpdateSender;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use io_driver::{CacheKey, NetConnection, ReactorHandle, Receiver, TimerId, TlsConnection};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ConnectionContext;
use crate::error::{AlpnDowngrade, Error};
use crate::frame::{self, ErrorCode, Frame, FrameEncoder, StreamId};
use crate::hpack::HpackEncoder;
use inbound::ReadHalf;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Preface not yet written.
    PrefacePending,
    Established,
    /// We sent GOAWAY; no new streams.
    GoAwaySent,
    /// The peer sent GOAWAY; no new streams.
    GoAwayReceived,
    Closed,
}

/// Owns HPACK encoder state and stream id allocation. Held while a header
/// block is encoded and queued.
struct SendHalf {
    hpack: HpackEncoder,
    frames: FrameEncoder,
}

struct State {
    phase: ConnectionState,
    streams: HashMap<u32, Arc<Stream>>,
    peer: ConnectionSettings,
    next_push_id: u32,
    /// Highest peer-initiated stream we accepted, reported in our GOAWAY.
    last_peer_stream: StreamId,
    /// From the peer's GOAWAY.
    goaway_last_stream: Option<StreamId>,
    idle_timer: Option<TimerId>,
}

struct Shared {
    net: NetConnection,
    ctx: ConnectionContext,
    local: ConnectionSettings,
    flow: FlowController,
    /// Receive credit for the whole connection.
    conn_window: WindowUpdateSender,
    /// Stateless encoder for frames written outside the send lock.
    control: FrameEncoder,
    /// Next client stream id. Written under the send lock; read by the
    /// reader to recognise frames for idle streams.
    next_stream_id: AtomicU32,
    /// The peer's SETTINGS_MAX_FRAME_SIZE, for slicing DATA.
    peer_max_frame_size: AtomicU32,
    send: Mutex<SendHalf>,
    state: Mutex<State>,
    reader: Mutex<ReadHalf>,
    closed: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.flow.close();
        self.net.close();
    }
}

/// A multiplexed HTTP/2 client connection.
#[derive(Clone)]
pub struct Http2Connection {
    shared: Arc<Shared>,
}

/// Delivers socket bytes to the connection without keeping it alive.
struct ConnectionReader {
    shared: Weak<Shared>,
}

impl Receiver for ConnectionReader {
    fn on_bytes(&self, data: Bytes) {
        if let Some(shared) = self.shared.upgrade() {
            Http2Connection { shared }.on_bytes(data);
        }
    }

    fn on_error(&self, error: io::Error) {
        if let Some(shared) = self.shared.upgrade() {
            let conn = Http2Connection { shared };
            if !conn.is_closed() {
                debug!(key = %conn.cache_key(), error = %error, "transport closed");
            }
            conn.shutdown(error.into());
        }
    }
}

impl Http2Connection {
    /// Start HTTP/2 on a connection known to speak it (h2c prior knowledge,
    /// or TLS where the caller already checked ALPN).
    pub fn with_prior_knowledge(ctx: ConnectionContext, net: NetConnection) -> Result<Self, Error> {
        Self::establish(ctx, net, None).map(|(conn, _)| conn)
    }

    /// Start HTTP/2 on a TLS connection whose ALPN negotiation must have
    /// selected `h2`. Otherwise the connection is handed back inside
    /// [`Error::AlpnDowngrade`] for the HTTP/1.1 path to use.
    pub fn negotiated(ctx: ConnectionContext, tls: TlsConnection) -> Result<Self, Error> {
        match tls.alpn_protocol() {
            Some(protocol) if protocol == b"h2" => {}
            protocol => {
                let protocol = protocol.map(|p| String::from_utf8_lossy(&p).into_owned());
                debug!(key = %tls.cache_key(), ?protocol, "alpn did not select h2");
                return Err(Error::AlpnDowngrade(AlpnDowngrade {
                    connection: tls,
                    protocol,
                }));
            }
        }
        Self::with_prior_knowledge(ctx, NetConnection::Tls(tls))
    }

    /// Continue as HTTP/2 after an HTTP/1.1 `101 Switching Protocols`.
    ///
    /// The upgraded request is stream 1, already half-closed (local); its
    /// response arrives on the returned handle. `leftover` is whatever the
    /// HTTP/1.1 reader consumed past the 101 response.
    pub fn upgraded(
        ctx: ConnectionContext,
        net: NetConnection,
        leftover: Bytes,
    ) -> Result<(Self, ResponseHandle), Error> {
        let (conn, handle) = Self::establish(ctx, net, Some(leftover))?;
        match handle {
            Some(handle) => Ok((conn, handle)),
            None => Err(Error::ConnectionClosed),
        }
    }

    fn establish(
        ctx: ConnectionContext,
        net: NetConnection,
        upgrade: Option<Bytes>,
    ) -> Result<(Self, Option<ResponseHandle>), Error> {
        let local = ConnectionSettings::local(&ctx.config);
        let peer = ConnectionSettings::default();
        let first_stream = if upgrade.is_some() { 3 } else { 1 };

        let shared = Arc::new(Shared {
            flow: FlowController::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            conn_window: WindowUpdateSender::new(
                ctx.config
                    .connection_window_size
                    .max(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            ),
            control: FrameEncoder::new(),
            next_stream_id: AtomicU32::new(first_stream),
            peer_max_frame_size: AtomicU32::new(peer.max_frame_size),
            send: Mutex::new(SendHalf {
                hpack: HpackEncoder::new(),
                frames: FrameEncoder::new(),
            }),
            state: Mutex::new(State {
                phase: ConnectionState::PrefacePending,
                streams: HashMap::new(),
                peer,
                next_push_id: 2,
                last_peer_stream: StreamId::CONNECTION,
                goaway_last_stream: None,
                idle_timer: None,
            }),
            reader: Mutex::new(ReadHalf::new(&local)),
            closed: AtomicBool::new(false),
            local,
            net,
            ctx,
        });
        let conn = Http2Connection { shared };

        let handle = upgrade.map(|leftover| {
            let stream = Arc::new(Stream::new(
                StreamId::new(1),
                conn.shared.local.initial_window_size,
                None,
            ));
            stream.headers_sent(true);
            conn.shared
                .flow
                .register_stream(1, peer.initial_window_size);
            conn.shared.state.lock().streams.insert(1, stream.clone());
            conn.shared.reader.lock().buffer_early(leftover);
            ResponseHandle::new(stream, conn.clone())
        });

        conn.shared.net.start_reading(Arc::new(ConnectionReader {
            shared: Arc::downgrade(&conn.shared),
        }));

        if let Err(e) = conn.send_preface() {
            let error = Error::from(e);
            conn.shutdown(error.clone());
            return Err(error);
        }
        conn.open_gate();
        if handle.is_none() {
            conn.arm_idle_timer();
        }
        Ok((conn, handle))
    }

    /// Preface and SETTINGS, then credit beyond the default connection
    /// window, all on the jump-the-queue lane.
    fn send_preface(&self) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(128);
        self.shared.control.encode_connection_preface(&mut buf);
        self.shared
            .control
            .encode(&Frame::Settings(self.shared.local.to_frame()), &mut buf);
        let extra = self
            .shared
            .ctx
            .config
            .connection_window_size
            .saturating_sub(frame::DEFAULT_INITIAL_WINDOW_SIZE)
            .min(frame::MAX_WINDOW_SIZE);
        if extra > 0 {
            self.shared
                .control
                .write_window_update(StreamId::CONNECTION, extra, &mut buf);
        }
        self.shared.net.put_first(vec![buf.freeze()])?;
        self.shared.net.flush()?;

        self.shared.state.lock().phase = ConnectionState::Established;
        debug!(key = %self.cache_key(), window_update = extra, "preface sent");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().phase
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether new requests can be sent.
    pub fn is_open(&self) -> bool {
        !self.is_closed() && self.state() == ConnectionState::Established
    }

    pub fn cache_key(&self) -> &CacheKey {
        self.shared.net.cache_key()
    }

    /// Streams currently open, pushed ones included.
    pub fn active_streams(&self) -> usize {
        self.shared.state.lock().streams.len()
    }

    pub fn local_settings(&self) -> ConnectionSettings {
        self.shared.local
    }

    pub fn peer_settings(&self) -> ConnectionSettings {
        self.shared.state.lock().peer
    }

    fn reactor(&self) -> &ReactorHandle {
        self.shared.net.reactor()
    }

    /// Close gracefully: send GOAWAY(NO_ERROR), then shut down. Streams still
    /// open fail with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let last = {
            let mut state = self.shared.state.lock();
            state.phase = ConnectionState::GoAwaySent;
            state.last_peer_stream
        };
        debug!(key = %self.cache_key(), "sending GOAWAY");
        self.write_goaway(last, ErrorCode::NoError, b"");
        self.shutdown(Error::ConnectionClosed);
    }

    /// Tear the connection down: fail every stream, then close the socket.
    /// Only the first call has any effect.
    pub fn shutdown(&self, error: Error) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(key = %self.cache_key(), error = %error, "connection shutdown");

        let (streams, idle_timer) = {
            let mut state = self.shared.state.lock();
            state.phase = ConnectionState::Closed;
            let streams: Vec<_> = state.streams.drain().map(|(_, s)| s).collect();
            (streams, state.idle_timer.take())
        };
        if let Some(timer) = idle_timer {
            self.reactor().cancel_timer(timer);
        }
        self.shared.flow.close();
        self.shared.conn_window.close();

        for stream in streams {
            if stream.close()
                && let Some(timer) = stream.fail(error.clone())
            {
                self.reactor().cancel_timer(timer);
            }
        }

        self.shared.net.close();
        if let Some(on_close) = &self.shared.ctx.on_close {
            on_close(self.cache_key());
        }
    }

    /// Connection error: GOAWAY with the error's code, then shutdown.
    fn connection_error(&self, error: Error) {
        if self.is_closed() {
            return;
        }
        let code = match &error {
            Error::Protocol { code, .. } => *code,
            _ => ErrorCode::InternalError,
        };
        warn!(key = %self.cache_key(), code = %code, error = %error, "connection error");
        let last = {
            let mut state = self.shared.state.lock();
            state.phase = ConnectionState::GoAwaySent;
            state.last_peer_stream
        };
        let reason = match &error {
            Error::Protocol { reason, .. } => reason.as_bytes(),
            _ => b"",
        };
        self.write_goaway(last, code, reason);
        self.shutdown(error);
    }

    fn write_goaway(&self, last: StreamId, code: ErrorCode, debug_data: &[u8]) {
        let mut buf = BytesMut::new();
        self.shared
            .control
            .write_goaway(last, code.to_u32(), debug_data, &mut buf);
        self.queue(buf);
    }

    /// Reset a stream with `code` and fail its response with `error`.
    pub(crate) fn reset_stream(&self, stream: &Arc<Stream>, code: ErrorCode, error: Error) {
        if stream.is_closed() {
            return;
        }
        debug!(stream_id = %stream.id(), code = %code, "resetting stream");
        self.write_rst(stream.id(), code);
        self.finish_stream(stream, Some(error));
    }

    fn write_rst(&self, stream_id: StreamId, code: ErrorCode) {
        let mut buf = BytesMut::new();
        self.shared
            .control
            .write_rst_stream(stream_id, code.to_u32(), &mut buf);
        self.queue(buf);
    }

    /// Remove a stream for good. Runs once per stream; `error` fails
    /// whatever the stream still has outstanding.
    fn finish_stream(&self, stream: &Arc<Stream>, error: Option<Error>) {
        if !stream.close() {
            return;
        }
        let timer = match error {
            Some(error) => stream.fail(error),
            None => stream.take_timer(),
        };
        if let Some(timer) = timer {
            self.reactor().cancel_timer(timer);
        }
        let id = stream.id().value();
        if id % 2 == 1 {
            self.shared.flow.remove_stream(id);
        }
        let idle = {
            let mut state = self.shared.state.lock();
            state.streams.remove(&id);
            state.streams.is_empty() && state.phase == ConnectionState::Established
        };
        if idle {
            self.arm_idle_timer();
        }
    }

    /// Ordered write of control frames.
    fn queue(&self, buf: BytesMut) {
        if let Err(e) = self
            .shared
            .net
            .put(vec![buf.freeze()])
            .and_then(|_| self.shared.net.flush())
        {
            self.shutdown(e.into());
        }
    }

    /// Jump-the-queue write for frames that must not wait behind DATA.
    fn queue_first(&self, buf: BytesMut) {
        if let Err(e) = self
            .shared
            .net
            .put_first(vec![buf.freeze()])
            .and_then(|_| self.shared.net.flush())
        {
            self.shutdown(e.into());
        }
    }

    /// Credit consumed response bytes back to the peer.
    fn on_consumed(&self, stream: Option<&Stream>, n: usize) {
        let n = n.min(u32::MAX as usize) as u32;
        let mut buf = BytesMut::new();
        if let Some(increment) = self.shared.conn_window.consumed(n) {
            self.shared
                .control
                .write_window_update(StreamId::CONNECTION, increment, &mut buf);
        }
        if let Some(stream) = stream
            && !stream.is_remote_closed()
            && let Some(increment) = stream.recv_window().consumed(n)
        {
            self.shared
                .control
                .write_window_update(stream.id(), increment, &mut buf);
        }
        if !buf.is_empty() && !self.is_closed() {
            self.queue_first(buf);
        }
    }

    fn arm_idle_timer(&self) {
        let Some(timeout) = self.shared.ctx.idle_timeout else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        let timer = self.reactor().schedule_after(timeout, move || {
            if let Some(shared) = weak.upgrade() {
                Http2Connection { shared }.handle_idle_timeout();
            }
        });
        let replaced = {
            let mut state = self.shared.state.lock();
            if !state.streams.is_empty() || state.phase != ConnectionState::Established {
                Some(timer)
            } else {
                state.idle_timer.replace(timer)
            }
        };
        if let Some(timer) = replaced {
            self.reactor().cancel_timer(timer);
        }
    }

    fn disarm_idle_timer(&self, state: &mut State) {
        if let Some(timer) = state.idle_timer.take() {
            self.reactor().cancel_timer(timer);
        }
    }

    fn handle_idle_timeout(&self) {
        let idle = {
            let mut state = self.shared.state.lock();
            state.idle_timer = None;
            state.streams.is_empty() && state.phase == ConnectionState::Established
        };
        if idle {
            debug!(key = %self.cache_key(), "idle timeout");
            self.close();
        }
    }
}

impl fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Connection")
            .field("key", self.cache_key())
            .field("state", &self.state())
            .field("streams", &self.active_streams())
            .finish()
    }
}
