//! HPACK header compression (RFC 7541).
//!
//! One encoder and one decoder live for the lifetime of a connection; both
//! carry dynamic table state that must stay in step with the peer, so every
//! header block is processed in the order it is sent or received.

mod decode;
mod encode;
mod huffman;
mod table;

pub use decode::{HpackDecoder, HpackError};
pub use encode::HpackEncoder;
pub use huffman::HuffmanError;
pub use table::{HeaderField, StaticTable};

/// Default dynamic table size (4096 bytes).
pub const DEFAULT_TABLE_SIZE: usize = 4096;
