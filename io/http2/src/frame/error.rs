//! HTTP/2 error codes and frame decoding errors.

use std::fmt;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Unknown codes map to INTERNAL_ERROR.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        };
        f.write_str(name)
    }
}

/// Connection-fatal frame decoding errors.
///
/// Each maps to the GOAWAY code sent for it via [`FrameError::error_code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame exceeds the advertised maximum frame size.
    FrameTooLarge { size: u32, max: u32 },
    /// Frame type that is only valid on stream 0 arrived on a stream.
    InvalidStreamZero { frame_type: u8 },
    /// Frame type that needs a stream arrived on stream 0.
    StreamIdRequired { frame_type: u8 },
    InvalidPayloadLength {
        frame_type: u8,
        expected: usize,
        actual: usize,
    },
    /// Padding at least as long as the payload that carries it.
    InvalidPadding {
        pad_length: u8,
        payload_length: usize,
    },
    InvalidSettingValue { id: u16, value: u32 },
}

impl FrameError {
    /// Error code for the GOAWAY this error causes.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FrameError::FrameTooLarge { .. } | FrameError::InvalidPayloadLength { .. } => {
                ErrorCode::FrameSizeError
            }
            // SETTINGS_INITIAL_WINDOW_SIZE above 2^31-1.
            FrameError::InvalidSettingValue { id: 0x4, .. } => ErrorCode::FlowControlError,
            _ => ErrorCode::ProtocolError,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::FrameTooLarge { size, max } => {
                write!(f, "frame size {} exceeds maximum {}", size, max)
            }
            FrameError::InvalidStreamZero { frame_type } => {
                write!(f, "frame type 0x{:02x} must be sent on stream 0", frame_type)
            }
            FrameError::StreamIdRequired { frame_type } => {
                write!(
                    f,
                    "frame type 0x{:02x} requires non-zero stream ID",
                    frame_type
                )
            }
            FrameError::InvalidPayloadLength {
                frame_type,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "frame type 0x{:02x} expected {} bytes, got {}",
                    frame_type, expected, actual
                )
            }
            FrameError::InvalidPadding {
                pad_length,
                payload_length,
            } => {
                write!(
                    f,
                    "padding length {} exceeds payload length {}",
                    pad_length, payload_length
                )
            }
            FrameError::InvalidSettingValue { id, value } => {
                write!(f, "invalid value {} for setting 0x{:04x}", value, id)
            }
        }
    }
}

impl std::error::Error for FrameError {}
