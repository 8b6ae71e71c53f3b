//! Outbound requests and body upload.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::{ConnectionState, Http2Connection, ResponseHandle, SendHalf, Stream};
use crate::body::{Body, RequestBody};
use crate::error::Error;
use crate::frame::{ErrorCode, FRAME_HEADER_SIZE, StreamId};
use crate::hpack::HeaderField;
use crate::message::{Headers, Request, request_headers};

impl Http2Connection {
    /// Open a stream and send `request` on it.
    ///
    /// HEADERS go out before this returns. A request body is uploaded on a
    /// separate thread, paced by the peer's flow control windows. Fails with
    /// [`Error::TooManyStreams`] at the peer's concurrency limit and with
    /// [`Error::Unprocessed`] after the peer sent GOAWAY.
    pub fn send_request(&self, request: Request) -> Result<ResponseHandle, Error> {
        let fields = request.header_fields();
        let end_stream = request.body.is_empty();

        let stream = {
            let mut send = self.shared.send.lock();
            let stream = self.open_stream(&request)?;

            let mut block = Vec::with_capacity(256);
            let SendHalf { hpack, frames } = &mut *send;
            hpack.encode(&fields, &mut block);
            let mut buf = BytesMut::with_capacity(block.len() + 2 * FRAME_HEADER_SIZE);
            frames.encode_header_block(stream.id(), &Bytes::from(block), end_stream, None, &mut buf);
            stream.headers_sent(end_stream);

            if let Err(e) = self.shared.net.put(vec![buf.freeze()]) {
                drop(send);
                let error = Error::from(e);
                self.shutdown(error.clone());
                return Err(error);
            }
            stream
        };
        if let Err(e) = self.shared.net.flush() {
            let error = Error::from(e);
            self.shutdown(error.clone());
            return Err(error);
        }
        trace!(stream_id = %stream.id(), method = %request.method, path = %request.path, end_stream, "request headers sent");

        self.arm_request_timer(&stream, request.timeout.or(self.shared.ctx.request_timeout));
        if !end_stream {
            self.spawn_upload(stream.clone(), request.body)?;
        }
        Ok(ResponseHandle::new(stream, self.clone()))
    }

    /// Allocate the next stream id and register the stream. Called with the
    /// send lock held, so ids reach the wire in order.
    fn open_stream(&self, request: &Request) -> Result<Arc<Stream>, Error> {
        let mut state = self.shared.state.lock();
        match state.phase {
            ConnectionState::Established => {}
            ConnectionState::GoAwayReceived => return Err(Error::Unprocessed),
            _ => return Err(Error::ConnectionClosed),
        }
        let active = state.streams.keys().filter(|id| *id % 2 == 1).count();
        if active >= state.peer.max_concurrent_streams as usize {
            return Err(Error::TooManyStreams);
        }
        let id = self.shared.next_stream_id.load(Ordering::Acquire);
        if id > StreamId::MAX.value() {
            debug!(key = %self.cache_key(), "stream ids exhausted");
            return Err(Error::Unprocessed);
        }

        let stream = Arc::new(Stream::new(
            StreamId::new(id),
            self.shared.local.initial_window_size,
            request.push_handler.clone(),
        ));
        state.streams.insert(id, stream.clone());
        self.shared
            .flow
            .register_stream(id, state.peer.initial_window_size);
        self.disarm_idle_timer(&mut state);
        self.shared.next_stream_id.store(id + 2, Ordering::Release);
        Ok(stream)
    }

    /// Cancel the stream with [`Error::Timeout`] unless response headers
    /// arrive first.
    fn arm_request_timer(&self, stream: &Arc<Stream>, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return;
        };
        let shared = Arc::downgrade(&self.shared);
        let weak = Arc::downgrade(stream);
        let timer = self.reactor().schedule_after(timeout, move || {
            if let (Some(shared), Some(stream)) = (shared.upgrade(), weak.upgrade())
                && !stream.is_response_received()
            {
                debug!(stream_id = %stream.id(), "request timed out");
                Http2Connection { shared }.reset_stream(&stream, ErrorCode::Cancel, Error::Timeout);
            }
        });
        stream.set_timer(timer);
    }

    /// Uploads block on flow control and on the body source, so each gets
    /// its own thread rather than a reactor worker.
    fn spawn_upload(&self, stream: Arc<Stream>, body: RequestBody) -> Result<(), Error> {
        let conn = self.clone();
        let uploading = stream.clone();
        let spawned = thread::Builder::new()
            .name(format!("h2-upload-{}", stream.id()))
            .spawn(move || conn.upload(&uploading, body));
        if let Err(e) = spawned {
            let error = Error::from(e);
            self.reset_stream(&stream, ErrorCode::InternalError, error.clone());
            return Err(error);
        }
        Ok(())
    }

    fn upload(&self, stream: &Arc<Stream>, body: RequestBody) {
        let result = match body {
            RequestBody::Empty => Ok(None),
            RequestBody::Bytes(data) => self.write_data(stream, data).map(|_| None),
            RequestBody::Stream(body) => {
                let body = Arc::new(body);
                stream.set_upload(body.clone());
                self.upload_stream(stream, &body)
            }
        };
        let result = result.and_then(|trailers| self.end_request(stream, trailers));

        match result {
            Ok(()) => {}
            Err(Error::Io(e)) => self.shutdown(Error::Io(e)),
            Err(error) => {
                if !stream.is_closed() {
                    debug!(stream_id = %stream.id(), error = %error, "request body failed");
                }
                self.reset_stream(stream, ErrorCode::Cancel, error);
            }
        }
    }

    fn upload_stream(&self, stream: &Stream, body: &Body) -> Result<Option<Headers>, Error> {
        while let Some(chunk) = body.next_chunk()? {
            self.write_data(stream, chunk)?;
        }
        Ok(body.trailers())
    }

    /// Send `data` as DATA frames, each no larger than the peer's frame size
    /// or the flow control grant.
    fn write_data(&self, stream: &Stream, mut data: Bytes) -> Result<(), Error> {
        let id = stream.id();
        while !data.is_empty() {
            let max_frame = self.shared.peer_max_frame_size.load(Ordering::Acquire) as usize;
            let wanted = data.len().min(max_frame) as u32;
            let granted = self.shared.flow.try_acquire(wanted, id.value())? as usize;

            let chunk = data.split_to(granted);
            let mut header = BytesMut::with_capacity(FRAME_HEADER_SIZE);
            self.shared
                .control
                .write_data_header(id, chunk.len(), false, &mut header);
            self.shared.net.put(vec![header.freeze(), chunk])?;
            self.shared.net.flush()?;
            trace!(stream_id = %id, len = granted, "data sent");
        }
        Ok(())
    }

    /// END_STREAM: trailers as a final HEADERS block, or an empty DATA frame.
    fn end_request(&self, stream: &Arc<Stream>, trailers: Option<Headers>) -> Result<(), Error> {
        match trailers.filter(|t| !t.is_empty()) {
            Some(trailers) => {
                let fields: Vec<HeaderField> = request_headers(&trailers).collect();
                let mut send = self.shared.send.lock();
                if stream.is_closed() {
                    return Ok(());
                }
                let mut block = Vec::with_capacity(64);
                let SendHalf { hpack, frames } = &mut *send;
                hpack.encode(&fields, &mut block);
                let mut buf = BytesMut::with_capacity(block.len() + 2 * FRAME_HEADER_SIZE);
                frames.encode_header_block(stream.id(), &Bytes::from(block), true, None, &mut buf);
                self.shared.net.put(vec![buf.freeze()])?;
            }
            None => {
                if stream.is_closed() {
                    return Ok(());
                }
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE);
                self.shared
                    .control
                    .write_data_header(stream.id(), 0, true, &mut buf);
                self.shared.net.put(vec![buf.freeze()])?;
            }
        }
        self.shared.net.flush()?;
        trace!(stream_id = %stream.id(), "request complete");

        if stream.local_closed() {
            self.finish_stream(stream, None);
        }
        Ok(())
    }
}
