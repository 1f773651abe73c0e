//! Retained entry codec
//!
//! Entries are packed back to back: `id:u8, length:u8, payload[length]`.
//! An entry with `id == 0` or `length == 0` marks the end of data; block
//! alignment padding is zero-filled so it always reads as that marker.

use std::fmt;

/// Size of the `{id, length}` prefix
pub const ENTRY_HEADER_SIZE: usize = 2;

/// Largest payload an entry can describe
pub const MAX_ENTRY_PAYLOAD: usize = u8::MAX as usize;

/// Id reserved for "no entry"
pub const NONE_ID: u8 = 0;

/// One decoded entry, borrowing its payload from the scanned buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub id: u8,
    pub data: &'a [u8],
}

/// An entry header claims more bytes than the region holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated {
    /// Offset of the entry header within the scanned buffer
    pub offset: usize,
    pub id: u8,
    pub length: u8,
}

impl fmt::Display for Truncated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry id=0x{:02x} length={} at offset {} runs past the end of data",
            self.id, self.length, self.offset
        )
    }
}

/// Append an entry to `out`. Callers guarantee `id != 0` and a payload of
/// 1..=255 bytes.
pub fn encode_entry(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    debug_assert!(id != NONE_ID);
    debug_assert!(!data.is_empty() && data.len() <= MAX_ENTRY_PAYLOAD);
    out.push(id);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

/// Bytes an entry with `len` payload bytes occupies
pub fn encoded_len(len: usize) -> usize {
    ENTRY_HEADER_SIZE + len
}

/// Iterator over the entries of a payload buffer.
///
/// Stops at the first end marker or when no full entry header remains.
/// A header whose payload runs past the buffer yields `Err(Truncated)` once
/// and then the iterator is exhausted.
pub struct EntryIter<'a> {
    buf: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> EntryIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, done: false }
    }

    /// Offset of the next unread byte
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = Result<Entry<'a>, Truncated>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos + ENTRY_HEADER_SIZE > self.buf.len() {
            self.done = true;
            return None;
        }
        let id = self.buf[self.pos];
        let length = self.buf[self.pos + 1];
        if id == NONE_ID || length == 0 {
            self.done = true;
            return None;
        }

        let start = self.pos + ENTRY_HEADER_SIZE;
        let end = start + length as usize;
        if end > self.buf.len() {
            self.done = true;
            return Some(Err(Truncated { offset: self.pos, id, length }));
        }

        self.pos = end;
        Some(Ok(Entry { id, data: &self.buf[start..end] }))
    }
}

/// Find the payload for `id`; a truncated tail hides later ids.
pub fn find(buf: &[u8], id: u8) -> Option<&[u8]> {
    EntryIter::new(buf)
        .map_while(Result::ok)
        .find(|e| e.id == id)
        .map(|e| e.data)
}
