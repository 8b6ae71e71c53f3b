//! HPACK header decoding.
//!
//! Header blocks arrive split across HEADERS / PUSH_PROMISE and CONTINUATION
//! frames. The decoder accepts each fragment as it arrives; a representation
//! cut by a fragment boundary waits for the next fragment.

use super::huffman;
use super::table::{DynamicTable, HeaderField, StaticTable};

/// HPACK decoding error. Any of these is a COMPRESSION_ERROR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HpackError {
    /// The block ended in the middle of a representation.
    Incomplete,
    InvalidInteger,
    InvalidHuffman(huffman::HuffmanError),
    InvalidIndex(usize),
    /// Size update above the limit we advertised.
    InvalidTableSize(usize),
    /// Size update after the first field of a block.
    MisplacedTableSizeUpdate,
}

impl std::fmt::Display for HpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HpackError::Incomplete => write!(f, "truncated header block"),
            HpackError::InvalidInteger => write!(f, "invalid HPACK integer encoding"),
            HpackError::InvalidHuffman(e) => write!(f, "invalid Huffman encoding: {}", e),
            HpackError::InvalidIndex(idx) => write!(f, "invalid table index: {}", idx),
            HpackError::InvalidTableSize(size) => write!(f, "invalid table size update: {}", size),
            HpackError::MisplacedTableSizeUpdate => {
                write!(f, "table size update after header field")
            }
        }
    }
}

impl std::error::Error for HpackError {}

impl From<huffman::HuffmanError> for HpackError {
    fn from(e: huffman::HuffmanError) -> Self {
        HpackError::InvalidHuffman(e)
    }
}

/// Streaming HPACK decoder, one per connection.
pub struct HpackDecoder {
    dynamic_table: DynamicTable,
    /// Limit from our SETTINGS_HEADER_TABLE_SIZE.
    max_table_size: usize,
    /// Unconsumed tail of the previous fragment.
    pending: Vec<u8>,
    /// A field has been emitted in the current block.
    in_fields: bool,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self::with_table_size(super::DEFAULT_TABLE_SIZE)
    }

    pub fn with_table_size(size: usize) -> Self {
        Self {
            dynamic_table: DynamicTable::new(size),
            max_table_size: size,
            pending: Vec::new(),
            in_fields: false,
        }
    }

    pub fn set_max_table_size(&mut self, size: usize) {
        self.max_table_size = size;
        if self.dynamic_table.max_size() > size {
            self.dynamic_table.set_max_size(size);
        }
    }

    /// Decode one fragment of a header block, calling `emit` per field.
    ///
    /// With `end_of_block` set, leftover bytes are an error. After an error
    /// the dynamic table is out of sync with the peer and the connection
    /// must be torn down.
    pub fn decode<F>(&mut self, fragment: &[u8], end_of_block: bool, mut emit: F) -> Result<(), HpackError>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let result = self.decode_fragment(fragment, end_of_block, &mut emit);
        if end_of_block || result.is_err() {
            self.pending.clear();
            self.in_fields = false;
        }
        result
    }

    /// Decode a complete block into a list.
    pub fn decode_block(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut fields = Vec::new();
        self.decode(block, true, |name, value| {
            fields.push(HeaderField::new(name, value))
        })?;
        Ok(fields)
    }

    fn decode_fragment(
        &mut self,
        fragment: &[u8],
        end_of_block: bool,
        emit: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<(), HpackError> {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(fragment);

        let mut pos = 0;
        while pos < input.len() {
            match self.decode_field(&input[pos..]) {
                Ok((field, consumed)) => {
                    if let Some(field) = field {
                        emit(&field.name, &field.value);
                    }
                    pos += consumed;
                }
                Err(HpackError::Incomplete) if !end_of_block => break,
                Err(e) => return Err(e),
            }
        }

        input.drain(..pos);
        self.pending = input;
        Ok(())
    }

    /// Decode one representation; `Ok((None, n))` for a size update.
    fn decode_field(&mut self, data: &[u8]) -> Result<(Option<HeaderField>, usize), HpackError> {
        let first = data[0];

        let decoded = if first & 0x80 != 0 {
            // Indexed Header Field (Section 6.1)
            let (index, consumed) = decode_integer(data, 7)?;
            (Some(self.lookup(index)?), consumed)
        } else if first & 0x40 != 0 {
            // Literal with Incremental Indexing (Section 6.2.1)
            let (field, consumed) = self.decode_literal(data, 6)?;
            self.dynamic_table.insert(field.clone());
            (Some(field), consumed)
        } else if first & 0x20 != 0 {
            // Dynamic Table Size Update (Section 6.3)
            if self.in_fields {
                return Err(HpackError::MisplacedTableSizeUpdate);
            }
            let (size, consumed) = decode_integer(data, 5)?;
            if size > self.max_table_size {
                return Err(HpackError::InvalidTableSize(size));
            }
            self.dynamic_table.set_max_size(size);
            (None, consumed)
        } else {
            // Literal without Indexing / Never Indexed (Sections 6.2.2, 6.2.3)
            self.decode_literal(data, 4)
                .map(|(field, consumed)| (Some(field), consumed))?
        };

        if decoded.0.is_some() {
            self.in_fields = true;
        }
        Ok(decoded)
    }

    fn decode_literal(&self, data: &[u8], prefix_bits: u8) -> Result<(HeaderField, usize), HpackError> {
        let (name_index, mut consumed) = decode_integer(data, prefix_bits)?;

        let name = if name_index > 0 {
            self.lookup(name_index)?.name
        } else {
            let (name, n) = decode_string(&data[consumed..])?;
            consumed += n;
            name
        };

        let (value, n) = decode_string(&data[consumed..])?;
        consumed += n;

        Ok((HeaderField { name, value }, consumed))
    }

    fn lookup(&self, index: usize) -> Result<HeaderField, HpackError> {
        if index <= StaticTable::len() {
            return StaticTable::get(index)
                .map(|(name, value)| HeaderField::new(name, value))
                .ok_or(HpackError::InvalidIndex(index));
        }
        self.dynamic_table
            .get(index - StaticTable::len() - 1)
            .cloned()
            .ok_or(HpackError::InvalidIndex(index))
    }
}

/// Decode an HPACK integer (RFC 7541 Section 5.1).
fn decode_integer(data: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    let Some(&first) = data.first() else {
        return Err(HpackError::Incomplete);
    };

    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = (first as usize) & max_prefix;
    if value < max_prefix {
        return Ok((value, 1));
    }

    let mut consumed = 1;
    let mut shift = 0;
    loop {
        let Some(&byte) = data.get(consumed) else {
            return Err(HpackError::Incomplete);
        };
        consumed += 1;

        value += ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, consumed));
        }

        shift += 7;
        if shift > 28 {
            return Err(HpackError::InvalidInteger);
        }
    }
}

/// Decode an HPACK string literal (RFC 7541 Section 5.2).
fn decode_string(data: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    let Some(&first) = data.first() else {
        return Err(HpackError::Incomplete);
    };
    let (length, consumed) = decode_integer(data, 7)?;
    let end = consumed + length;
    if end > data.len() {
        return Err(HpackError::Incomplete);
    }

    let raw = &data[consumed..end];
    let value = if first & 0x80 != 0 {
        let mut decoded = Vec::with_capacity(length * 8 / 5);
        huffman::decode(raw, &mut decoded)?;
        decoded
    } else {
        raw.to_vec()
    };
    Ok((value, end))
}
