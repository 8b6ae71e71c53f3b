//! Frame layer: the 9-byte header, typed payloads, and a codec in each
//! direction.
//!
//! The decoder splits failures by scope. Anything that breaks the
//! connection is a [`FrameError`]; a payload that only breaks its own
//! stream comes back as [`Frame::Malformed`] so the caller can reset that
//! stream and keep going.
//!
//! ```text
//! length (24) | type (8) | flags (8) | R | stream id (31) | payload ...
//! ```

mod decode;
mod encode;
mod error;
mod types;

pub use decode::FrameDecoder;
pub use encode::FrameEncoder;
pub use error::{ErrorCode, FrameError};
pub use types::*;

/// Sent by the client before anything else.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame payload bounds. Every endpoint accepts at least the default;
/// SETTINGS_MAX_FRAME_SIZE can raise it up to the maximum.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1 << 14;
pub const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Flow control windows start at 65535 and never exceed 2^31-1.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;

/// Advertised for pushed streams; the peer's limit on ours starts
/// unbounded.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;
