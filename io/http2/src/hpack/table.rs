//! HPACK static and dynamic tables.

use std::collections::VecDeque;

/// Per-entry overhead counted against the table size (RFC 7541 Section 4.1).
const ENTRY_OVERHEAD: usize = 32;

/// A header field (name-value pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Size of this field for table accounting.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// The HPACK static table (RFC 7541 Appendix A), indices 1 through 61.
pub struct StaticTable;

const STATIC: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

impl StaticTable {
    /// Entry at a 1-based index.
    pub fn get(index: usize) -> Option<(&'static [u8], &'static [u8])> {
        index.checked_sub(1).and_then(|i| STATIC.get(i)).copied()
    }

    /// Find an entry. Returns `(index, exact_match)`; a name-only match
    /// reports the first entry with that name.
    pub fn find(name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_match = None;
        for (i, (n, v)) in STATIC.iter().enumerate() {
            if *n == name {
                if *v == value {
                    return Some((i + 1, true));
                }
                name_match.get_or_insert(i + 1);
            }
        }
        name_match.map(|i| (i, false))
    }

    pub const fn len() -> usize {
        STATIC.len()
    }
}

/// The HPACK dynamic table, newest entry first.
pub(super) struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub(super) fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub(super) fn max_size(&self) -> usize {
        self.max_size
    }

    /// Resize, evicting the oldest entries until the table fits.
    pub(super) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    /// Entry at a 0-based dynamic index (0 = newest).
    pub(super) fn get(&self, index: usize) -> Option<&HeaderField> {
        self.entries.get(index)
    }

    /// An entry larger than the whole table empties it and is not stored.
    pub(super) fn insert(&mut self, field: HeaderField) {
        let entry_size = field.size();
        if entry_size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - entry_size);
        self.size += entry_size;
        self.entries.push_front(field);
    }

    /// Returns `(index, exact_match)` with a 0-based dynamic index.
    pub(super) fn find(&self, name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_match = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name == name {
                if entry.value == value {
                    return Some((i, true));
                }
                name_match.get_or_insert(i);
            }
        }
        name_match.map(|i| (i, false))
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            match self.entries.pop_back() {
                Some(evicted) => self.size -= evicted.size(),
                None => break,
            }
        }
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(super) fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_table_bounds() {
        assert_eq!(StaticTable::get(0), None);
        assert_eq!(StaticTable::get(1), Some((&b":authority"[..], &b""[..])));
        assert_eq!(StaticTable::get(2), Some((&b":method"[..], &b"GET"[..])));
        assert_eq!(StaticTable::get(61).map(|e| e.0), Some(&b"www-authenticate"[..]));
        assert_eq!(StaticTable::get(62), None);
    }

    #[test]
    fn test_static_table_find() {
        assert_eq!(StaticTable::find(b":method", b"POST"), Some((3, true)));
        assert_eq!(StaticTable::find(b":method", b"PUT"), Some((2, false)));
        assert_eq!(StaticTable::find(b":status", b"200"), Some((8, true)));
        assert_eq!(StaticTable::find(b"x-custom", b""), None);
    }

    #[test]
    fn test_dynamic_table_eviction() {
        // Each entry is 1 + 1 + 32 = 34 bytes.
        let mut table = DynamicTable::new(100);
        table.insert(HeaderField::new("a", "1"));
        table.insert(HeaderField::new("b", "2"));
        table.insert(HeaderField::new("c", "3"));
        assert_eq!(table.len(), 2);
        assert_eq!(table.size(), 68);
        assert_eq!(table.get(0).map(|f| f.name.clone()), Some(b"c".to_vec()));
        assert_eq!(table.get(1).map(|f| f.name.clone()), Some(b"b".to_vec()));
    }

    #[test]
    fn test_dynamic_table_oversized_entry_clears() {
        let mut table = DynamicTable::new(40);
        table.insert(HeaderField::new("a", "1"));
        table.insert(HeaderField::new("long-name", "long-value"));
        assert_eq!(table.len(), 0);
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn test_dynamic_table_shrink() {
        let mut table = DynamicTable::new(4096);
        table.insert(HeaderField::new("a", "1"));
        table.insert(HeaderField::new("b", "2"));
        table.set_max_size(34);
        assert_eq!(table.len(), 1);
        table.set_max_size(0);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_dynamic_table_find() {
        let mut table = DynamicTable::new(4096);
        table.insert(HeaderField::new("x", "1"));
        table.insert(HeaderField::new("x", "2"));
        assert_eq!(table.find(b"x", b"1"), Some((1, true)));
        assert_eq!(table.find(b"x", b"3"), Some((0, false)));
        assert_eq!(table.find(b"y", b"1"), None);
    }
}
