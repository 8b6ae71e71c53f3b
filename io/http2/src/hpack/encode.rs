//! HPACK header encoding.

use super::huffman;
use super::table::{DynamicTable, HeaderField, StaticTable};

/// Headers that are never added to either side's dynamic table.
const SENSITIVE: &[&[u8]] = &[b"authorization", b"proxy-authorization", b"cookie", b"set-cookie"];

/// HPACK encoder.
pub struct HpackEncoder {
    dynamic_table: DynamicTable,
    use_huffman: bool,
    /// Table size update to announce at the start of the next block.
    pending_size_update: Option<usize>,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self::with_table_size(super::DEFAULT_TABLE_SIZE)
    }

    pub fn with_table_size(size: usize) -> Self {
        Self {
            dynamic_table: DynamicTable::new(size),
            use_huffman: true,
            pending_size_update: None,
        }
    }

    pub fn set_huffman(&mut self, use_huffman: bool) {
        self.use_huffman = use_huffman;
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE.
    ///
    /// The table never grows past the default size; any change is announced
    /// with a size update at the start of the next header block.
    pub fn set_max_table_size(&mut self, size: usize) {
        let size = size.min(super::DEFAULT_TABLE_SIZE);
        if size != self.dynamic_table.max_size() {
            self.dynamic_table.set_max_size(size);
            self.pending_size_update = Some(size);
        }
    }

    /// Encode a list of headers into one header block.
    pub fn encode(&mut self, headers: &[HeaderField], buf: &mut Vec<u8>) {
        if let Some(size) = self.pending_size_update.take() {
            encode_integer(size, 5, 0x20, buf);
        }
        for header in headers {
            self.encode_header(header, buf);
        }
    }

    fn encode_header(&mut self, header: &HeaderField, buf: &mut Vec<u8>) {
        let static_match = StaticTable::find(&header.name, &header.value);
        let dynamic_match = self
            .dynamic_table
            .find(&header.name, &header.value)
            .map(|(i, exact)| (StaticTable::len() + 1 + i, exact));

        let exact = static_match
            .filter(|m| m.1)
            .or(dynamic_match.filter(|m| m.1));
        if let Some((index, _)) = exact {
            // Indexed Header Field (Section 6.1)
            encode_integer(index, 7, 0x80, buf);
            return;
        }

        let name_index = static_match.or(dynamic_match).map(|(i, _)| i);

        if SENSITIVE.contains(&header.name.as_slice()) {
            // Literal Never Indexed (Section 6.2.3)
            self.encode_literal(name_index, header, 4, 0x10, buf);
            return;
        }

        // Literal with Incremental Indexing (Section 6.2.1)
        self.encode_literal(name_index, header, 6, 0x40, buf);
        self.dynamic_table.insert(header.clone());
    }

    fn encode_literal(
        &self,
        name_index: Option<usize>,
        header: &HeaderField,
        prefix_bits: u8,
        prefix: u8,
        buf: &mut Vec<u8>,
    ) {
        match name_index {
            Some(index) => encode_integer(index, prefix_bits, prefix, buf),
            None => {
                buf.push(prefix);
                self.encode_string(&header.name, buf);
            }
        }
        self.encode_string(&header.value, buf);
    }

    fn encode_string(&self, data: &[u8], buf: &mut Vec<u8>) {
        if self.use_huffman {
            let huffman_len = huffman::encoded_len(data);
            if huffman_len < data.len() {
                encode_integer(huffman_len, 7, 0x80, buf);
                huffman::encode(data, buf);
                return;
            }
        }
        encode_integer(data.len(), 7, 0x00, buf);
        buf.extend_from_slice(data);
    }
}

/// Encode an integer with an N-bit prefix (RFC 7541 Section 5.1).
pub(super) fn encode_integer(mut value: usize, prefix_bits: u8, prefix: u8, buf: &mut Vec<u8>) {
    let max_prefix: usize = (1 << prefix_bits) - 1;

    if value < max_prefix {
        buf.push(prefix | (value as u8));
    } else {
        buf.push(prefix | (max_prefix as u8));
        value -= max_prefix;
        while value >= 128 {
            buf.push((value % 128) as u8 | 0x80);
            value /= 128;
        }
        buf.push(value as u8);
    }
}
