//! HTTP/2 frame decoding.

use bytes::{Buf, Bytes, BytesMut};

use super::error::{ErrorCode, FrameError};
use super::types::*;
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, MAX_WINDOW_SIZE, flags};

/// Frame decoder that parses HTTP/2 frames from a byte buffer.
///
/// Violations scoped to a single stream come back as [`Frame::Malformed`];
/// everything else is a [`FrameError`] and ends the connection.
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new frame decoder with default settings.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum frame size we are willing to receive.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE);
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Try to decode a frame from the buffer.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on a connection error.
    ///
    /// On success, the consumed bytes are removed from the buffer.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let header = peek_header(buf);

        if header.length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: header.length,
                max: self.max_frame_size,
            });
        }

        let total_len = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize).freeze();

        self.parse_frame(header, payload).map(Some)
    }

    fn parse_frame(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        match FrameType::try_from(header.frame_type) {
            Ok(FrameType::Data) => self.parse_data(header, payload),
            Ok(FrameType::Headers) => self.parse_headers(header, payload),
            Ok(FrameType::Priority) => self.parse_priority(header, payload),
            Ok(FrameType::RstStream) => self.parse_rst_stream(header, payload),
            Ok(FrameType::Settings) => self.parse_settings(header, payload),
            Ok(FrameType::PushPromise) => self.parse_push_promise(header, payload),
            Ok(FrameType::Ping) => self.parse_ping(header, payload),
            Ok(FrameType::GoAway) => self.parse_goaway(header, payload),
            Ok(FrameType::WindowUpdate) => self.parse_window_update(header, payload),
            Ok(FrameType::Continuation) => self.parse_continuation(header, payload),
            Err(frame_type) => Ok(Frame::Unknown(UnknownFrame {
                frame_type,
                flags: header.flags,
                stream_id: header.stream_id,
                payload,
            })),
        }
    }

    fn parse_data(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        require_stream(&header)?;

        let flow_len = payload.len() as u32;
        let data = if header.has_flag(flags::PADDED) {
            remove_padding(payload)?
        } else {
            payload
        };

        Ok(Frame::Data(DataFrame {
            stream_id: header.stream_id,
            end_stream: header.has_flag(flags::END_STREAM),
            data,
            flow_len,
        }))
    }

    fn parse_headers(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        require_stream(&header)?;

        let mut data = if header.has_flag(flags::PADDED) {
            remove_padding(payload)?
        } else {
            payload
        };

        let priority = if header.has_flag(flags::PRIORITY) {
            if data.len() < 5 {
                return Err(FrameError::InvalidPayloadLength {
                    frame_type: header.frame_type,
                    expected: 5,
                    actual: data.len(),
                });
            }
            let priority = read_priority(&mut data);
            if priority.dependency == header.stream_id {
                return Ok(malformed(
                    &header,
                    ErrorCode::ProtocolError,
                    "stream depends on itself",
                ));
            }
            Some(priority)
        } else {
            None
        };

        Ok(Frame::Headers(HeadersFrame {
            stream_id: header.stream_id,
            end_stream: header.has_flag(flags::END_STREAM),
            end_headers: header.has_flag(flags::END_HEADERS),
            priority,
            header_block: data,
        }))
    }

    fn parse_priority(&self, header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        require_stream(&header)?;

        if payload.len() != 5 {
            return Ok(malformed(
                &header,
                ErrorCode::FrameSizeError,
                "PRIORITY payload must be 5 bytes",
            ));
        }

        let priority = read_priority(&mut payload);
        if priority.dependency == header.stream_id {
            return Ok(malformed(
                &header,
                ErrorCode::ProtocolError,
                "stream depends on itself",
            ));
        }

        Ok(Frame::Priority(PriorityFrame {
            stream_id: header.stream_id,
            priority,
        }))
    }

    fn parse_rst_stream(&self, header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        require_stream(&header)?;
        expect_len(&header, &payload, 4)?;

        Ok(Frame::RstStream(RstStreamFrame {
            stream_id: header.stream_id,
            error_code: payload.get_u32(),
        }))
    }

    fn parse_settings(&self, header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        forbid_stream(&header)?;

        let ack = header.has_flag(flags::ACK);
        if ack {
            expect_len(&header, &payload, 0)?;
            return Ok(Frame::Settings(SettingsFrame::ack()));
        }

        if payload.len() % 6 != 0 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: payload.len() - payload.len() % 6,
                actual: payload.len(),
            });
        }

        let mut settings = Vec::with_capacity(payload.len() / 6);
        while payload.has_remaining() {
            let raw = payload.get_u16();
            let value = payload.get_u32();
            let id = SettingId::from(raw);
            validate_setting(id, value)?;
            settings.push(Setting { id, value });
        }

        Ok(Frame::Settings(SettingsFrame { ack, settings }))
    }

    fn parse_push_promise(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        require_stream(&header)?;

        let mut data = if header.has_flag(flags::PADDED) {
            remove_padding(payload)?
        } else {
            payload
        };

        if data.len() < 4 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 4,
                actual: data.len(),
            });
        }
        let promised_stream_id = StreamId::new(data.get_u32());

        Ok(Frame::PushPromise(PushPromiseFrame {
            stream_id: header.stream_id,
            end_headers: header.has_flag(flags::END_HEADERS),
            promised_stream_id,
            header_block: data,
        }))
    }

    fn parse_ping(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        forbid_stream(&header)?;
        expect_len(&header, &payload, 8)?;

        let mut data = [0u8; 8];
        data.copy_from_slice(&payload);

        Ok(Frame::Ping(PingFrame {
            ack: header.has_flag(flags::ACK),
            data,
        }))
    }

    fn parse_goaway(&self, header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        forbid_stream(&header)?;

        if payload.len() < 8 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 8,
                actual: payload.len(),
            });
        }

        let last_stream_id = StreamId::new(payload.get_u32());
        let error_code = payload.get_u32();

        Ok(Frame::GoAway(GoAwayFrame {
            last_stream_id,
            error_code,
            debug_data: payload,
        }))
    }

    fn parse_window_update(
        &self,
        header: FrameHeader,
        mut payload: Bytes,
    ) -> Result<Frame, FrameError> {
        expect_len(&header, &payload, 4)?;

        Ok(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: header.stream_id,
            increment: payload.get_u32() & MAX_WINDOW_SIZE,
        }))
    }

    fn parse_continuation(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        require_stream(&header)?;

        Ok(Frame::Continuation(ContinuationFrame {
            stream_id: header.stream_id,
            end_headers: header.has_flag(flags::END_HEADERS),
            header_block: payload,
        }))
    }
}

fn peek_header(buf: &[u8]) -> FrameHeader {
    debug_assert!(buf.len() >= FRAME_HEADER_SIZE);

    let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
    let stream_id = StreamId::new(u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]));

    FrameHeader {
        length,
        frame_type: buf[3],
        flags: buf[4],
        stream_id,
    }
}

fn require_stream(header: &FrameHeader) -> Result<(), FrameError> {
    if header.stream_id.is_connection_level() {
        return Err(FrameError::StreamIdRequired {
            frame_type: header.frame_type,
        });
    }
    Ok(())
}

fn forbid_stream(header: &FrameHeader) -> Result<(), FrameError> {
    if !header.stream_id.is_connection_level() {
        return Err(FrameError::InvalidStreamZero {
            frame_type: header.frame_type,
        });
    }
    Ok(())
}

fn expect_len(header: &FrameHeader, payload: &Bytes, expected: usize) -> Result<(), FrameError> {
    if payload.len() != expected {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn malformed(header: &FrameHeader, error_code: ErrorCode, reason: &str) -> Frame {
    Frame::Malformed(MalformedFrame {
        stream_id: header.stream_id,
        error_code,
        reason: reason.to_string(),
    })
}

/// Strip the pad length byte and trailing padding.
///
/// The padding may fill the rest of the payload exactly, leaving no data.
fn remove_padding(mut payload: Bytes) -> Result<Bytes, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::InvalidPadding {
            pad_length: 0,
            payload_length: 0,
        });
    }

    let pad_length = payload.get_u8();
    if pad_length as usize > payload.len() {
        return Err(FrameError::InvalidPadding {
            pad_length,
            payload_length: payload.len(),
        });
    }

    payload.truncate(payload.len() - pad_length as usize);
    Ok(payload)
}

fn read_priority(data: &mut Bytes) -> Priority {
    let raw = data.get_u32();
    let weight = data.get_u8();
    Priority {
        exclusive: raw & 0x8000_0000 != 0,
        dependency: StreamId::new(raw),
        weight,
    }
}

fn validate_setting(id: SettingId, value: u32) -> Result<(), FrameError> {
    let valid = match id {
        SettingId::EnablePush => value <= 1,
        SettingId::InitialWindowSize => value <= MAX_WINDOW_SIZE,
        SettingId::MaxFrameSize => (DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&value),
        _ => true,
    };
    if valid {
        Ok(())
    } else {
        Err(FrameError::InvalidSettingValue {
            id: id.into(),
            value,
        })
    }
}
