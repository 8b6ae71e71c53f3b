//! Inbound frame processing.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::{ConnectionSettings, ConnectionState, Http2Connection, ResponseHandle, Stream};
use crate::body::{self, Body, BodySender, CancelHook, ConsumeHook};
use crate::error::Error;
use crate::frame::{
    DataFrame, ErrorCode, Frame, FrameDecoder, GoAwayFrame, MalformedFrame, PingFrame,
    RstStreamFrame, SettingsFrame, StreamId, WindowUpdateFrame,
};
use crate::hpack::HpackDecoder;
use crate::message::{Headers, PushPromise, Response};

enum BlockKind {
    Headers { end_stream: bool },
    Promise { promised: StreamId },
}

/// A header block waiting for its CONTINUATION frames.
struct HeaderBlock {
    stream_id: StreamId,
    kind: BlockKind,
    fields: Headers,
}

/// Reader-side connection state. Only touched with the reader lock held,
/// which also serializes frame dispatch.
pub(super) struct ReadHalf {
    buf: BytesMut,
    decoder: FrameDecoder,
    hpack: HpackDecoder,
    block: Option<HeaderBlock>,
    /// Closed until our preface is on the wire.
    open: bool,
    early: Vec<Bytes>,
}

impl ReadHalf {
    pub(super) fn new(local: &ConnectionSettings) -> Self {
        let mut decoder = FrameDecoder::new();
        decoder.set_max_frame_size(local.max_frame_size);
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
            decoder,
            hpack: HpackDecoder::with_table_size(local.header_table_size as usize),
            block: None,
            open: false,
            early: Vec::new(),
        }
    }

    /// Hold bytes that arrived before the preface went out.
    pub(super) fn buffer_early(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.early.push(data);
        }
    }
}

impl Http2Connection {
    pub(super) fn on_bytes(&self, data: Bytes) {
        let mut reader = self.shared.reader.lock();
        if !reader.open {
            reader.buffer_early(data);
            return;
        }
        reader.buf.extend_from_slice(&data);
        self.process_frames(&mut reader);
    }

    /// Replay anything that arrived while the preface was being sent, then
    /// let bytes through directly.
    pub(super) fn open_gate(&self) {
        let mut reader = self.shared.reader.lock();
        reader.open = true;
        for data in std::mem::take(&mut reader.early) {
            reader.buf.extend_from_slice(&data);
        }
        if !reader.buf.is_empty() {
            self.process_frames(&mut reader);
        }
    }

    fn process_frames(&self, reader: &mut ReadHalf) {
        while !self.is_closed() {
            let frame = match reader.decoder.decode(&mut reader.buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.connection_error(e.into());
                    break;
                }
            };
            trace!(frame = frame.name(), stream_id = %frame.stream_id(), "frame received");
            if let Err(e) = self.handle_frame(reader, frame) {
                self.connection_error(e);
            }
        }
        if self.is_closed() {
            reader.buf.clear();
            reader.block = None;
        }
    }

    /// Dispatch one frame. An `Err` is a connection error.
    fn handle_frame(&self, reader: &mut ReadHalf, frame: Frame) -> Result<(), Error> {
        if let Some(block) = &reader.block {
            match &frame {
                Frame::Continuation(f) if f.stream_id == block.stream_id => {}
                _ => {
                    return Err(Error::protocol(
                        ErrorCode::ProtocolError,
                        format!("expected CONTINUATION on stream {}", block.stream_id),
                    ));
                }
            }
        }

        match frame {
            Frame::Settings(f) => self.handle_settings(f),
            Frame::Ping(f) => {
                self.handle_ping(f);
                Ok(())
            }
            Frame::GoAway(f) => {
                self.handle_goaway(f);
                Ok(())
            }
            Frame::WindowUpdate(f) => self.handle_window_update(f),
            Frame::Headers(f) => {
                let kind = BlockKind::Headers {
                    end_stream: f.end_stream,
                };
                self.begin_block(reader, f.stream_id, kind, &f.header_block, f.end_headers)
            }
            Frame::PushPromise(f) => {
                if !self.shared.local.enable_push {
                    return Err(Error::protocol(
                        ErrorCode::ProtocolError,
                        "PUSH_PROMISE with push disabled",
                    ));
                }
                let kind = BlockKind::Promise {
                    promised: f.promised_stream_id,
                };
                self.begin_block(reader, f.stream_id, kind, &f.header_block, f.end_headers)
            }
            Frame::Continuation(f) => self.continue_block(reader, &f.header_block, f.end_headers),
            Frame::Data(f) => self.handle_data(f),
            Frame::RstStream(f) => self.handle_rst_stream(f),
            Frame::Malformed(f) => self.handle_malformed(f),
            Frame::Priority(_) | Frame::Unknown(_) => Ok(()),
        }
    }

    fn handle_settings(&self, frame: SettingsFrame) -> Result<(), Error> {
        if frame.ack {
            debug!(key = %self.cache_key(), "settings acknowledged");
            return Ok(());
        }

        let peer = {
            let mut state = self.shared.state.lock();
            let delta = state.peer.apply(&frame);
            // Under the state lock so a stream registered concurrently is
            // adjusted exactly once.
            if delta != 0 && !self.shared.flow.adjust_active_streams(delta) {
                return Err(Error::protocol(
                    ErrorCode::FlowControlError,
                    "initial window size change overflows a stream window",
                ));
            }
            state.peer
        };
        {
            let mut send = self.shared.send.lock();
            send.frames.set_max_frame_size(peer.max_frame_size);
            send.hpack
                .set_max_table_size(peer.header_table_size as usize);
        }
        self.shared
            .peer_max_frame_size
            .store(peer.max_frame_size, Ordering::Release);

        debug!(
            key = %self.cache_key(),
            max_concurrent_streams = peer.max_concurrent_streams,
            initial_window_size = peer.initial_window_size,
            max_frame_size = peer.max_frame_size,
            header_table_size = peer.header_table_size,
            "peer settings applied"
        );

        let mut buf = BytesMut::with_capacity(9);
        self.shared.control.encode_settings_ack(&mut buf);
        self.queue(buf);
        Ok(())
    }

    fn handle_ping(&self, frame: PingFrame) {
        if frame.ack {
            trace!("ping acknowledged");
            return;
        }
        let mut buf = BytesMut::with_capacity(17);
        self.shared.control.encode_ping_ack(frame.data, &mut buf);
        self.queue_first(buf);
    }

    /// Streams the peer never saw fail as retryable; the rest fail with the
    /// GOAWAY itself.
    fn handle_goaway(&self, frame: GoAwayFrame) {
        let code = ErrorCode::from_u32(frame.error_code);
        let (last, unprocessed) = {
            let mut state = self.shared.state.lock();
            let last = match state.goaway_last_stream {
                Some(previous) => previous.min(frame.last_stream_id),
                None => frame.last_stream_id,
            };
            state.goaway_last_stream = Some(last);
            if state.phase == ConnectionState::Established {
                state.phase = ConnectionState::GoAwayReceived;
            }
            let unprocessed: Vec<Arc<Stream>> = state
                .streams
                .values()
                .filter(|s| s.id().is_client_initiated() && s.id() > last)
                .cloned()
                .collect();
            (last, unprocessed)
        };

        debug!(
            key = %self.cache_key(),
            code = %code,
            last_stream_id = %last,
            unprocessed = unprocessed.len(),
            debug_data = %String::from_utf8_lossy(&frame.debug_data),
            "GOAWAY received"
        );

        for stream in &unprocessed {
            self.finish_stream(stream, Some(Error::Unprocessed));
        }
        self.shutdown(Error::GoAway {
            code,
            last_stream_id: last,
        });
    }

    fn handle_window_update(&self, frame: WindowUpdateFrame) -> Result<(), Error> {
        let id = frame.stream_id;
        if frame.increment == 0 {
            if self.shared.ctx.config.tolerate_zero_window_update {
                debug!(stream_id = %id, "ignoring WINDOW_UPDATE with zero increment");
                return Ok(());
            }
            if id == StreamId::CONNECTION {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    "WINDOW_UPDATE with zero increment",
                ));
            }
            if let Some(stream) = self.lookup(id)? {
                self.reset_stream(
                    &stream,
                    ErrorCode::ProtocolError,
                    Error::protocol(ErrorCode::ProtocolError, "WINDOW_UPDATE with zero increment"),
                );
            }
            return Ok(());
        }

        if id == StreamId::CONNECTION {
            if !self.shared.flow.increase_connection_window(frame.increment) {
                return Err(Error::protocol(
                    ErrorCode::FlowControlError,
                    "connection window overflow",
                ));
            }
            return Ok(());
        }

        if let Some(stream) = self.lookup(id)?
            && !self
                .shared
                .flow
                .increase_stream_window(id.value(), frame.increment)
        {
            self.reset_stream(
                &stream,
                ErrorCode::FlowControlError,
                Error::protocol(ErrorCode::FlowControlError, "stream window overflow"),
            );
        }
        Ok(())
    }

    fn begin_block(
        &self,
        reader: &mut ReadHalf,
        stream_id: StreamId,
        kind: BlockKind,
        fragment: &[u8],
        end_headers: bool,
    ) -> Result<(), Error> {
        reader.block = Some(HeaderBlock {
            stream_id,
            kind,
            fields: Vec::new(),
        });
        self.continue_block(reader, fragment, end_headers)
    }

    /// Decode a fragment. HPACK state is shared by the whole connection, so
    /// blocks are decoded even for streams we no longer track.
    fn continue_block(
        &self,
        reader: &mut ReadHalf,
        fragment: &[u8],
        end_headers: bool,
    ) -> Result<(), Error> {
        let ReadHalf { hpack, block, .. } = &mut *reader;
        let Some(current) = block.as_mut() else {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                "CONTINUATION without a header block",
            ));
        };
        hpack.decode(fragment, end_headers, |name, value| {
            current.fields.push((
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            ));
        })?;
        if !end_headers {
            return Ok(());
        }

        let Some(block) = reader.block.take() else {
            return Ok(());
        };
        match block.kind {
            BlockKind::Headers { end_stream } => {
                self.handle_headers(block.stream_id, block.fields, end_stream)
            }
            BlockKind::Promise { promised } => {
                self.handle_push_promise(block.stream_id, promised, block.fields)
            }
        }
    }

    /// Find the stream a frame is addressed to. `None` for streams that
    /// already closed; a frame on a stream that was never opened is a
    /// connection error.
    fn lookup(&self, id: StreamId) -> Result<Option<Arc<Stream>>, Error> {
        let state = self.shared.state.lock();
        if let Some(stream) = state.streams.get(&id.value()) {
            return Ok(Some(stream.clone()));
        }
        let idle = if id.is_client_initiated() {
            id.value() >= self.shared.next_stream_id.load(Ordering::Acquire)
        } else {
            id.value() >= state.next_push_id
        };
        if idle {
            return Err(Error::protocol(
                ErrorCode::ProtocolError,
                format!("frame on idle stream {id}"),
            ));
        }
        Ok(None)
    }

    fn handle_headers(
        &self,
        stream_id: StreamId,
        fields: Headers,
        end_stream: bool,
    ) -> Result<(), Error> {
        let Some(stream) = self.lookup(stream_id)? else {
            trace!(%stream_id, "headers for closed stream");
            return Ok(());
        };
        if stream.is_remote_closed() {
            self.stream_error(&stream, ErrorCode::StreamClosed, "HEADERS after END_STREAM");
            return Ok(());
        }

        if stream.is_response_received() {
            if !end_stream {
                self.stream_error(&stream, ErrorCode::ProtocolError, "trailers without END_STREAM");
            } else if fields.iter().any(|(name, _)| name.starts_with(':')) {
                self.stream_error(&stream, ErrorCode::ProtocolError, "pseudo-header in trailers");
            } else {
                trace!(%stream_id, count = fields.len(), "trailers received");
                stream.finish_body(Some(fields));
                self.remote_end(&stream);
            }
            return Ok(());
        }

        let mut status: Option<u16> = None;
        let mut malformed = false;
        let mut headers = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            if name == ":status" && status.is_none() && !malformed {
                status = value.parse::<u16>().ok().filter(|s| (100..1000).contains(s));
                malformed = status.is_none();
            } else if name.starts_with(':') {
                malformed = true;
            } else {
                headers.push((name, value));
            }
        }
        let status = match status {
            Some(status) if !malformed => status,
            _ => {
                self.stream_error(&stream, ErrorCode::ProtocolError, "invalid response pseudo-headers");
                return Ok(());
            }
        };

        if (100..200).contains(&status) {
            if end_stream {
                self.stream_error(
                    &stream,
                    ErrorCode::ProtocolError,
                    "END_STREAM on informational response",
                );
                return Ok(());
            }
            trace!(%stream_id, status, "informational response");
            stream.complete_response(
                Response {
                    stream_id,
                    status,
                    headers,
                    body: Body::empty(),
                },
                None,
            );
            return Ok(());
        }

        if let Some(timer) = stream.take_timer() {
            self.reactor().cancel_timer(timer);
        }
        trace!(%stream_id, status, end_stream, "response headers");
        let (sender, body) = self.response_body(&stream);
        stream.complete_response(
            Response {
                stream_id,
                status,
                headers,
                body,
            },
            Some(sender),
        );
        if end_stream {
            stream.finish_body(None);
            self.remote_end(&stream);
        }
        Ok(())
    }

    /// Body channel whose consumption sends WINDOW_UPDATEs and whose
    /// cancellation resets the stream.
    fn response_body(&self, stream: &Arc<Stream>) -> (BodySender, Body) {
        let on_consume: ConsumeHook = {
            let shared = Arc::downgrade(&self.shared);
            let stream = Arc::downgrade(stream);
            Arc::new(move |n| {
                if let Some(shared) = shared.upgrade() {
                    let stream = stream.upgrade();
                    Http2Connection { shared }.on_consumed(stream.as_deref(), n);
                }
            })
        };
        let on_cancel: CancelHook = {
            let shared = Arc::downgrade(&self.shared);
            let stream = Arc::downgrade(stream);
            Box::new(move || {
                if let (Some(shared), Some(stream)) = (shared.upgrade(), stream.upgrade()) {
                    Http2Connection { shared }.reset_stream(
                        &stream,
                        ErrorCode::Cancel,
                        Error::Cancelled,
                    );
                }
            })
        };
        body::channel_with_hooks(on_consume, on_cancel)
    }

    fn handle_data(&self, frame: DataFrame) -> Result<(), Error> {
        let flow_len = frame.flow_len as usize;
        let Some(stream) = self.lookup(frame.stream_id)? else {
            self.on_consumed(None, flow_len);
            return Ok(());
        };
        if stream.is_remote_closed() {
            self.on_consumed(None, flow_len);
            self.stream_error(&stream, ErrorCode::StreamClosed, "DATA after END_STREAM");
            return Ok(());
        }
        if !stream.is_response_received() {
            self.on_consumed(None, flow_len);
            self.stream_error(&stream, ErrorCode::ProtocolError, "DATA before response headers");
            return Ok(());
        }

        trace!(stream_id = %frame.stream_id, len = frame.data.len(), end_stream = frame.end_stream, "data received");
        let padding = flow_len.saturating_sub(frame.data.len());
        if padding > 0 {
            self.on_consumed(Some(&stream), padding);
        }
        if !frame.data.is_empty() {
            stream.push_data(frame.data);
        }
        if frame.end_stream {
            stream.finish_body(None);
            self.remote_end(&stream);
        }
        Ok(())
    }

    fn handle_rst_stream(&self, frame: RstStreamFrame) -> Result<(), Error> {
        let Some(stream) = self.lookup(frame.stream_id)? else {
            return Ok(());
        };
        let code = ErrorCode::from_u32(frame.error_code);
        debug!(stream_id = %frame.stream_id, code = %code, "stream reset by peer");
        if code == ErrorCode::NoError && stream.is_remote_closed() {
            // The response is complete; the peer just doesn't want the rest
            // of the request.
            self.finish_stream(&stream, None);
        } else {
            self.finish_stream(&stream, Some(Error::StreamReset(code)));
        }
        Ok(())
    }

    fn handle_push_promise(
        &self,
        parent_id: StreamId,
        promised: StreamId,
        fields: Headers,
    ) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock();
            if promised.value() != state.next_push_id {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!(
                        "promised stream {promised}, expected {}",
                        state.next_push_id
                    ),
                ));
            }
            state.next_push_id += 2;
            state.last_peer_stream = promised;
        }

        let handler = self
            .lookup(parent_id)?
            .and_then(|parent| parent.push_handler().cloned());
        let Some(handler) = handler else {
            debug!(parent = %parent_id, %promised, "refusing push");
            self.write_rst(promised, ErrorCode::RefusedStream);
            return Ok(());
        };

        let stream = Arc::new(Stream::pushed(
            promised,
            self.shared.local.initial_window_size,
        ));
        {
            let mut state = self.shared.state.lock();
            state.streams.insert(promised.value(), stream.clone());
            self.disarm_idle_timer(&mut state);
        }

        let promise = PushPromise::from_fields(parent_id, promised, fields);
        debug!(parent = %parent_id, %promised, path = %promise.path, "push promised");
        let response = ResponseHandle::new(stream.clone(), self.clone());
        let accepted = match panic::catch_unwind(AssertUnwindSafe(|| {
            handler.on_push(promise, response)
        })) {
            Ok(accepted) => accepted,
            Err(_) => {
                warn!(parent = %parent_id, %promised, "push handler panicked");
                false
            }
        };
        if !accepted {
            self.reset_stream(&stream, ErrorCode::Cancel, Error::Cancelled);
        }
        Ok(())
    }

    fn handle_malformed(&self, frame: MalformedFrame) -> Result<(), Error> {
        if frame.stream_id == StreamId::CONNECTION {
            return Err(Error::Protocol {
                code: frame.error_code,
                reason: frame.reason,
            });
        }
        warn!(
            stream_id = %frame.stream_id,
            code = %frame.error_code,
            reason = %frame.reason,
            "malformed frame"
        );
        match self.lookup(frame.stream_id)? {
            Some(stream) => self.reset_stream(
                &stream,
                frame.error_code,
                Error::Protocol {
                    code: frame.error_code,
                    reason: frame.reason,
                },
            ),
            None => self.write_rst(frame.stream_id, frame.error_code),
        }
        Ok(())
    }

    fn stream_error(&self, stream: &Arc<Stream>, code: ErrorCode, reason: &str) {
        warn!(stream_id = %stream.id(), code = %code, reason, "stream error");
        self.reset_stream(stream, code, Error::protocol(code, reason));
    }

    fn remote_end(&self, stream: &Arc<Stream>) {
        if stream.remote_closed() {
            self.finish_stream(stream, None);
        }
    }
}
