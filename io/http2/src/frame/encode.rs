//! HTTP/2 frame encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::types::*;
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, flags};

/// Frame encoder that writes HTTP/2 frames to a byte buffer.
///
/// `max_frame_size` is the peer's limit; header blocks larger than it are
/// split into HEADERS plus CONTINUATION frames.
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum frame size the peer accepts.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE);
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Encode a frame to the buffer.
    ///
    /// Malformed frames only exist on the receive side and encode to
    /// nothing.
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) {
        match frame {
            Frame::Data(f) => self.encode_data(f, buf),
            Frame::Headers(f) => self.encode_headers(f, buf),
            Frame::Priority(f) => self.encode_priority(f, buf),
            Frame::RstStream(f) => {
                self.write_rst_stream(f.stream_id, f.error_code, buf);
            }
            Frame::Settings(f) => self.encode_settings(f, buf),
            Frame::PushPromise(f) => self.encode_push_promise(f, buf),
            Frame::Ping(f) => self.encode_ping(f, buf),
            Frame::GoAway(f) => {
                self.write_goaway(f.last_stream_id, f.error_code, &f.debug_data, buf);
            }
            Frame::WindowUpdate(f) => {
                self.write_window_update(f.stream_id, f.increment, buf);
            }
            Frame::Continuation(f) => {
                let flags = if f.end_headers { flags::END_HEADERS } else { 0 };
                write_header(
                    buf,
                    f.header_block.len() as u32,
                    FrameType::Continuation as u8,
                    flags,
                    f.stream_id,
                );
                buf.extend_from_slice(&f.header_block);
            }
            Frame::Unknown(f) => {
                write_header(buf, f.payload.len() as u32, f.frame_type, f.flags, f.stream_id);
                buf.extend_from_slice(&f.payload);
            }
            Frame::Malformed(_) => {}
        }
    }

    fn encode_data(&self, frame: &DataFrame, buf: &mut BytesMut) {
        let flags = if frame.end_stream { flags::END_STREAM } else { 0 };
        let length = frame.data.len() as u32;
        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        write_header(buf, length, FrameType::Data as u8, flags, frame.stream_id);
        buf.extend_from_slice(&frame.data);
    }

    fn encode_headers(&self, frame: &HeadersFrame, buf: &mut BytesMut) {
        let mut frame_flags = 0u8;
        if frame.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if frame.end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        if frame.priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }

        let priority_len = if frame.priority.is_some() { 5 } else { 0 };
        let length = priority_len + frame.header_block.len() as u32;
        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        write_header(
            buf,
            length,
            FrameType::Headers as u8,
            frame_flags,
            frame.stream_id,
        );
        if let Some(priority) = &frame.priority {
            write_priority(priority, buf);
        }
        buf.extend_from_slice(&frame.header_block);
    }

    fn encode_priority(&self, frame: &PriorityFrame, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + 5);
        write_header(buf, 5, FrameType::Priority as u8, 0, frame.stream_id);
        write_priority(&frame.priority, buf);
    }

    fn encode_settings(&self, frame: &SettingsFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.ack { flags::ACK } else { 0 };
        let length = if frame.ack {
            0
        } else {
            (frame.settings.len() * 6) as u32
        };
        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        write_header(
            buf,
            length,
            FrameType::Settings as u8,
            frame_flags,
            StreamId::CONNECTION,
        );
        if !frame.ack {
            for setting in &frame.settings {
                buf.put_u16(u16::from(setting.id));
                buf.put_u32(setting.value);
            }
        }
    }

    fn encode_push_promise(&self, frame: &PushPromiseFrame, buf: &mut BytesMut) {
        let flags = if frame.end_headers { flags::END_HEADERS } else { 0 };
        let length = 4 + frame.header_block.len() as u32;
        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        write_header(buf, length, FrameType::PushPromise as u8, flags, frame.stream_id);
        buf.put_u32(frame.promised_stream_id.value());
        buf.extend_from_slice(&frame.header_block);
    }

    fn encode_ping(&self, frame: &PingFrame, buf: &mut BytesMut) {
        let flags = if frame.ack { flags::ACK } else { 0 };
        buf.reserve(FRAME_HEADER_SIZE + 8);
        write_header(buf, 8, FrameType::Ping as u8, flags, StreamId::CONNECTION);
        buf.extend_from_slice(&frame.data);
    }
}

/// Helpers for frames the connection writes directly.
impl FrameEncoder {
    /// Write an encoded header block as one HEADERS frame followed by as many
    /// CONTINUATION frames as the peer's frame size requires.
    ///
    /// END_STREAM rides on the HEADERS frame; END_HEADERS on the last frame.
    pub fn encode_header_block(
        &self,
        stream_id: StreamId,
        block: &Bytes,
        end_stream: bool,
        priority: Option<Priority>,
        buf: &mut BytesMut,
    ) {
        let max = self.max_frame_size as usize;
        let priority_len = if priority.is_some() { 5 } else { 0 };
        let first_len = block.len().min(max - priority_len);
        let (first, rest) = block.split_at(first_len);
        let mut chunks = rest.chunks(max).peekable();

        let mut frame_flags = if end_stream { flags::END_STREAM } else { 0 };
        if chunks.peek().is_none() {
            frame_flags |= flags::END_HEADERS;
        }
        if priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }
        buf.reserve(block.len() + FRAME_HEADER_SIZE * (2 + block.len() / max));
        write_header(
            buf,
            (priority_len + first.len()) as u32,
            FrameType::Headers as u8,
            frame_flags,
            stream_id,
        );
        if let Some(priority) = &priority {
            write_priority(priority, buf);
        }
        buf.extend_from_slice(first);

        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() {
                flags::END_HEADERS
            } else {
                0
            };
            write_header(
                buf,
                chunk.len() as u32,
                FrameType::Continuation as u8,
                flags,
                stream_id,
            );
            buf.extend_from_slice(chunk);
        }
    }

    pub fn encode_connection_preface(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(super::CONNECTION_PREFACE);
    }

    pub fn encode_settings_ack(&self, buf: &mut BytesMut) {
        self.encode_settings(&SettingsFrame::ack(), buf);
    }

    pub fn encode_ping_ack(&self, data: [u8; 8], buf: &mut BytesMut) {
        self.encode_ping(&PingFrame { ack: true, data }, buf);
    }

    /// Header of a DATA frame whose payload is written separately, so a
    /// body chunk can go out without being copied.
    pub fn write_data_header(
        &self,
        stream_id: StreamId,
        length: usize,
        end_stream: bool,
        buf: &mut BytesMut,
    ) {
        let flags = if end_stream { flags::END_STREAM } else { 0 };
        buf.reserve(FRAME_HEADER_SIZE);
        write_header(buf, length as u32, FrameType::Data as u8, flags, stream_id);
    }

    pub fn write_window_update(&self, stream_id: StreamId, increment: u32, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + 4);
        write_header(buf, 4, FrameType::WindowUpdate as u8, 0, stream_id);
        buf.put_u32(increment & 0x7FFF_FFFF);
    }

    pub fn write_rst_stream(&self, stream_id: StreamId, error_code: u32, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + 4);
        write_header(buf, 4, FrameType::RstStream as u8, 0, stream_id);
        buf.put_u32(error_code);
    }

    pub fn write_goaway(
        &self,
        last_stream_id: StreamId,
        error_code: u32,
        debug_data: &[u8],
        buf: &mut BytesMut,
    ) {
        let length = 8 + debug_data.len() as u32;
        buf.reserve(FRAME_HEADER_SIZE + length as usize);
        write_header(buf, length, FrameType::GoAway as u8, 0, StreamId::CONNECTION);
        buf.put_u32(last_stream_id.value());
        buf.put_u32(error_code);
        buf.extend_from_slice(debug_data);
    }
}

#[inline]
fn write_header(buf: &mut BytesMut, length: u32, frame_type: u8, flags: u8, stream_id: StreamId) {
    // Length (24 bits, big-endian)
    buf.put_u8((length >> 16) as u8);
    buf.put_u8((length >> 8) as u8);
    buf.put_u8(length as u8);
    buf.put_u8(frame_type);
    buf.put_u8(flags);
    buf.put_u32(stream_id.value() & 0x7FFF_FFFF);
}

fn write_priority(priority: &Priority, buf: &mut BytesMut) {
    let mut dep = priority.dependency.value();
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    buf.put_u32(dep);
    buf.put_u8(priority.weight);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode::FrameDecoder;
    use crate::frame::{ErrorCode, FrameError, MAX_WINDOW_SIZE};

    fn decode_all(mut buf: BytesMut) -> Vec<Frame> {
        let decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert!(buf.is_empty());
        frames
    }

    const MAX: usize = DEFAULT_MAX_FRAME_SIZE as usize;

    fn filled(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn one_frame(frame: &Frame) -> (usize, Frame) {
        let mut buf = BytesMut::new();
        FrameEncoder::new().encode(frame, &mut buf);
        let len = buf.len() - FRAME_HEADER_SIZE;
        match &decode_all(buf)[..] {
            [decoded] => (len, decoded.clone()),
            other => panic!("expected one frame, got {:?}", other),
        }
    }

    #[test]
    fn test_every_frame_type_round_trips_at_size_limits() {
        let stream = StreamId::new(7);
        for size in [0, 1, MAX] {
            let data = filled(size);
            match one_frame(&Frame::Data(DataFrame::new(stream, data.clone(), true))) {
                (len, Frame::Data(f)) => {
                    assert_eq!(len, size);
                    assert_eq!(f.data, data);
                    assert_eq!(f.flow_len as usize, size);
                    assert!(f.end_stream);
                }
                other => panic!("DATA {size}: {:?}", other),
            }

            let frame = HeadersFrame {
                stream_id: stream,
                end_stream: false,
                end_headers: true,
                priority: None,
                header_block: data.clone(),
            };
            match one_frame(&Frame::Headers(frame)) {
                (len, Frame::Headers(f)) => {
                    assert_eq!(len, size);
                    assert_eq!(f.header_block, data);
                    assert!(f.end_headers && !f.end_stream);
                }
                other => panic!("HEADERS {size}: {:?}", other),
            }

            let frame = ContinuationFrame {
                stream_id: stream,
                end_headers: size == MAX,
                header_block: data.clone(),
            };
            match one_frame(&Frame::Continuation(frame)) {
                (len, Frame::Continuation(f)) => {
                    assert_eq!(len, size);
                    assert_eq!(f.header_block, data);
                    assert_eq!(f.end_headers, size == MAX);
                }
                other => panic!("CONTINUATION {size}: {:?}", other),
            }

            // The promised id takes the first four bytes.
            let block = filled(size.saturating_sub(4));
            let frame = PushPromiseFrame {
                stream_id: stream,
                end_headers: true,
                promised_stream_id: StreamId::new(2),
                header_block: block.clone(),
            };
            match one_frame(&Frame::PushPromise(frame)) {
                (len, Frame::PushPromise(f)) => {
                    assert_eq!(len, size.max(4));
                    assert_eq!(f.promised_stream_id, StreamId::new(2));
                    assert_eq!(f.header_block, block);
                }
                other => panic!("PUSH_PROMISE {size}: {:?}", other),
            }

            let debug_data = filled(size.saturating_sub(8));
            let frame = GoAwayFrame {
                last_stream_id: stream,
                error_code: ErrorCode::EnhanceYourCalm.to_u32(),
                debug_data: debug_data.clone(),
            };
            match one_frame(&Frame::GoAway(frame)) {
                (len, Frame::GoAway(f)) => {
                    assert_eq!(len, size.max(8));
                    assert_eq!(f.last_stream_id, stream);
                    assert_eq!(f.error_code, ErrorCode::EnhanceYourCalm.to_u32());
                    assert_eq!(f.debug_data, debug_data);
                }
                other => panic!("GOAWAY {size}: {:?}", other),
            }

            let settings: Vec<Setting> = (0..size / 6)
                .map(|i| Setting {
                    id: SettingId::MaxHeaderListSize,
                    value: i as u32,
                })
                .collect();
            let frame = SettingsFrame {
                ack: false,
                settings: settings.clone(),
            };
            match one_frame(&Frame::Settings(frame)) {
                (len, Frame::Settings(f)) => {
                    assert_eq!(len, size / 6 * 6);
                    assert_eq!(f.settings, settings);
                }
                other => panic!("SETTINGS {size}: {:?}", other),
            }
        }

        let priority = Priority {
            exclusive: true,
            dependency: StreamId::new(3),
            weight: 200,
        };
        match one_frame(&Frame::Priority(PriorityFrame {
            stream_id: stream,
            priority,
        })) {
            (5, Frame::Priority(f)) => assert_eq!(f.priority, priority),
            other => panic!("PRIORITY: {:?}", other),
        }

        match one_frame(&Frame::RstStream(RstStreamFrame {
            stream_id: stream,
            error_code: ErrorCode::Cancel.to_u32(),
        })) {
            (4, Frame::RstStream(f)) => {
                assert_eq!(f.stream_id, stream);
                assert_eq!(f.error_code, ErrorCode::Cancel.to_u32());
            }
            other => panic!("RST_STREAM: {:?}", other),
        }

        match one_frame(&Frame::Ping(PingFrame {
            ack: true,
            data: *b"12345678",
        })) {
            (8, Frame::Ping(f)) => {
                assert!(f.ack);
                assert_eq!(&f.data, b"12345678");
            }
            other => panic!("PING: {:?}", other),
        }

        match one_frame(&Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: stream,
            increment: MAX_WINDOW_SIZE,
        })) {
            (4, Frame::WindowUpdate(f)) => assert_eq!(f.increment, MAX_WINDOW_SIZE),
            other => panic!("WINDOW_UPDATE: {:?}", other),
        }

        match one_frame(&Frame::Settings(SettingsFrame::ack())) {
            (0, Frame::Settings(f)) => assert!(f.ack),
            other => panic!("SETTINGS ack: {:?}", other),
        }
    }

    #[test]
    fn test_padded_data_round_trips_at_size_limits() {
        // One pad-length byte only, then the largest pad with the rest data.
        for (pad, data_len) in [(0usize, 0usize), (255, MAX - 256)] {
            let data = filled(data_len);
            let mut buf = BytesMut::new();
            write_header(
                &mut buf,
                (1 + pad + data_len) as u32,
                FrameType::Data as u8,
                flags::PADDED,
                StreamId::new(1),
            );
            buf.put_u8(pad as u8);
            buf.extend_from_slice(&data);
            buf.put_bytes(0, pad);

            match &decode_all(buf)[..] {
                [Frame::Data(f)] => {
                    assert_eq!(f.data, data);
                    assert_eq!(f.flow_len as usize, 1 + pad + data_len);
                    assert!(!f.end_stream);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_one_byte_over_max_frame_size_is_rejected() {
        let frame = DataFrame::new(StreamId::new(1), filled(MAX + 1), false);
        let mut buf = BytesMut::new();
        FrameEncoder::new().encode(&Frame::Data(frame), &mut buf);

        let decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::FrameTooLarge { size, max }) if size as usize == MAX + 1 && max as usize == MAX
        ));
    }

    #[test]
    fn test_settings_round_trip() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        let frame = SettingsFrame {
            ack: false,
            settings: vec![
                Setting {
                    id: SettingId::EnablePush,
                    value: 0,
                },
                Setting {
                    id: SettingId::InitialWindowSize,
                    value: 1 << 20,
                },
            ],
        };
        encoder.encode(&Frame::Settings(frame), &mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 12);

        match &decode_all(buf)[..] {
            [Frame::Settings(f)] => {
                assert!(!f.ack);
                assert_eq!(f.get(SettingId::EnablePush), Some(0));
                assert_eq!(f.get(SettingId::InitialWindowSize), Some(1 << 20));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_small_header_block_is_one_frame() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode_header_block(
            StreamId::new(1),
            &Bytes::from_static(b"abc"),
            true,
            None,
            &mut buf,
        );

        match &decode_all(buf)[..] {
            [Frame::Headers(f)] => {
                assert!(f.end_headers);
                assert!(f.end_stream);
                assert_eq!(&f.header_block[..], b"abc");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_header_block() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode_header_block(StreamId::new(3), &Bytes::new(), false, None, &mut buf);
        match &decode_all(buf)[..] {
            [Frame::Headers(f)] => {
                assert!(f.end_headers);
                assert!(f.header_block.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_large_header_block_splits_into_continuations() {
        let encoder = FrameEncoder::new();
        let block: Bytes = (0..40_000u32).map(|i| i as u8).collect::<Vec<_>>().into();
        let mut buf = BytesMut::new();
        encoder.encode_header_block(StreamId::new(5), &block, false, None, &mut buf);

        let frames = decode_all(buf);
        assert_eq!(frames.len(), 3);

        let mut joined = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let last = i == frames.len() - 1;
            match frame {
                Frame::Headers(f) if i == 0 => {
                    assert!(!f.end_headers);
                    assert!(!f.end_stream);
                    assert_eq!(f.header_block.len(), 16_384);
                    joined.extend_from_slice(&f.header_block);
                }
                Frame::Continuation(f) if i > 0 => {
                    assert_eq!(f.stream_id, StreamId::new(5));
                    assert_eq!(f.end_headers, last);
                    joined.extend_from_slice(&f.header_block);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(Bytes::from(joined), block);
    }

    #[test]
    fn test_header_block_exactly_max_size() {
        let encoder = FrameEncoder::new();
        let block = Bytes::from(vec![0u8; 16_384]);
        let mut buf = BytesMut::new();
        encoder.encode_header_block(StreamId::new(1), &block, false, None, &mut buf);
        match &decode_all(buf)[..] {
            [Frame::Headers(f)] => assert!(f.end_headers),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_priority_counts_against_first_frame() {
        let encoder = FrameEncoder::new();
        let block = Bytes::from(vec![1u8; 16_384]);
        let priority = Priority {
            exclusive: true,
            dependency: StreamId::new(1),
            weight: 7,
        };
        let mut buf = BytesMut::new();
        encoder.encode_header_block(StreamId::new(3), &block, true, Some(priority), &mut buf);

        match &decode_all(buf)[..] {
            [Frame::Headers(h), Frame::Continuation(c)] => {
                assert_eq!(h.priority, Some(priority));
                assert!(h.end_stream);
                assert!(!h.end_headers);
                assert_eq!(h.header_block.len(), 16_379);
                assert_eq!(c.header_block.len(), 5);
                assert!(c.end_headers);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_control_helpers() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.write_window_update(StreamId::CONNECTION, 983_041, &mut buf);
        encoder.write_rst_stream(StreamId::new(7), 0x8, &mut buf);
        encoder.write_goaway(StreamId::new(9), 0x1, b"bye", &mut buf);
        encoder.encode_ping_ack([1, 2, 3, 4, 5, 6, 7, 8], &mut buf);
        encoder.encode_settings_ack(&mut buf);

        let frames = decode_all(buf);
        assert!(matches!(
            frames[0],
            Frame::WindowUpdate(WindowUpdateFrame {
                increment: 983_041,
                ..
            })
        ));
        assert!(matches!(
            frames[1],
            Frame::RstStream(RstStreamFrame { error_code: 0x8, .. })
        ));
        match &frames[2] {
            Frame::GoAway(f) => {
                assert_eq!(f.last_stream_id, StreamId::new(9));
                assert_eq!(&f.debug_data[..], b"bye");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(frames[3], Frame::Ping(PingFrame { ack: true, .. })));
        assert!(matches!(&frames[4], Frame::Settings(f) if f.ack));
    }

    #[test]
    fn test_headers_with_priority_round_trip() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        let frame = HeadersFrame {
            stream_id: StreamId::new(3),
            end_stream: false,
            end_headers: true,
            priority: Some(Priority {
                exclusive: false,
                dependency: StreamId::new(1),
                weight: 200,
            }),
            header_block: Bytes::from_static(b"xyz"),
        };
        encoder.encode(&Frame::Headers(frame), &mut buf);
        match &decode_all(buf)[..] {
            [Frame::Headers(f)] => {
                assert_eq!(f.priority.map(|p| p.weight), Some(200));
                assert_eq!(&f.header_block[..], b"xyz");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_data_header() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.write_data_header(StreamId::new(5), 4, true, &mut buf);
        buf.extend_from_slice(b"body");
        match &decode_all(buf)[..] {
            [Frame::Data(f)] => {
                assert_eq!(f.stream_id, StreamId::new(5));
                assert!(f.end_stream);
                assert_eq!(&f.data[..], b"body");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_max_frame_size_is_clamped() {
        let mut encoder = FrameEncoder::new();
        encoder.set_max_frame_size(10);
        assert_eq!(encoder.max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
        encoder.set_max_frame_size(u32::MAX);
        assert_eq!(encoder.max_frame_size(), MAX_FRAME_SIZE);
    }
}
