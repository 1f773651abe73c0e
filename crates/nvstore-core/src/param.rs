//! Parameter kinds, typed value encoding and the in-memory descriptor

use std::fmt;

use crate::buffer::ValueBuffer;
use crate::error::StoreResult;
use crate::format::{align4, ParamHeader};

/// Type tag stored with every parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParamKind {
    String = 1,
    Binary = 2,
    Byte = 3,
    Word = 4,
    Dword = 5,
    Qword = 6,
    Float = 7,
    Double = 8,
    Int8 = 9,
    Int16 = 10,
    Int32 = 11,
    Int64 = 12,
}

impl ParamKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => ParamKind::String,
            2 => ParamKind::Binary,
            3 => ParamKind::Byte,
            4 => ParamKind::Word,
            5 => ParamKind::Dword,
            6 => ParamKind::Qword,
            7 => ParamKind::Float,
            8 => ParamKind::Double,
            9 => ParamKind::Int8,
            10 => ParamKind::Int16,
            11 => ParamKind::Int32,
            12 => ParamKind::Int64,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamKind::String => "STRING",
            ParamKind::Binary => "BINARY",
            ParamKind::Byte => "BYTE",
            ParamKind::Word => "WORD",
            ParamKind::Dword => "DWORD",
            ParamKind::Qword => "QWORD",
            ParamKind::Float => "FLOAT",
            ParamKind::Double => "DOUBLE",
            ParamKind::Int8 => "INT8",
            ParamKind::Int16 => "INT16",
            ParamKind::Int32 => "INT32",
            ParamKind::Int64 => "INT64",
        }
    }

    /// Bytes a value of `length` occupies on the medium; strings carry a NUL.
    pub fn storage_size(self, length: usize) -> usize {
        match self {
            ParamKind::String => length + 1,
            _ => length,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fixed-size value that can be stored as a parameter.
pub trait Persist: Sized {
    const KIND: ParamKind;
    const SIZE: usize;

    /// Write exactly `SIZE` bytes into `out`
    fn encode(&self, out: &mut [u8]);

    /// Decode from exactly `SIZE` bytes
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_persist_le {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl Persist for $ty {
                const KIND: ParamKind = ParamKind::$kind;
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn encode(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_persist_le! {
    u8 => Byte,
    u16 => Word,
    u32 => Dword,
    u64 => Qword,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float,
    f64 => Double,
}

impl Persist for bool {
    const KIND: ParamKind = ParamKind::Byte;
    const SIZE: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl<const N: usize> Persist for [u8; N] {
    const KIND: ParamKind = ParamKind::Binary;
    const SIZE: usize = N;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; N];
        raw.copy_from_slice(bytes);
        raw
    }
}

/// Identity of a parameter: the same handle may exist once per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamKey {
    pub kind: ParamKind,
    pub handle: u16,
}

/// In-memory state of one parameter
///
/// `offset`/`stored_length` describe the copy on the medium (if any). The
/// value buffer is materialized lazily and doubles as the pending value once
/// the descriptor is writable. A writable stored descriptor keeps the bytes it
/// was loaded with in `baseline`.
#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    key: ParamKey,
    stored_length: usize,
    stride: usize,
    offset: Option<usize>,
    value: Option<ValueBuffer>,
    writable: bool,
    baseline: Option<ValueBuffer>,
}

impl ParamDescriptor {
    /// Descriptor for an entry found in the stored table
    pub fn stored(key: ParamKey, length: usize, stride: usize, offset: usize) -> Self {
        Self {
            key,
            stored_length: length,
            stride,
            offset: Some(offset),
            value: None,
            writable: false,
            baseline: None,
        }
    }

    /// Descriptor that exists only in RAM so far
    pub fn fresh(key: ParamKey) -> Self {
        Self {
            key,
            stored_length: 0,
            stride: 0,
            offset: None,
            value: None,
            writable: false,
            baseline: None,
        }
    }

    pub fn key(&self) -> ParamKey {
        self.key
    }

    pub fn kind(&self) -> ParamKind {
        self.key.kind
    }

    pub fn handle(&self) -> u16 {
        self.key.handle
    }

    /// Offset of the stored payload, relative to the start of the region
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }

    pub fn stored_length(&self) -> usize {
        self.stored_length
    }

    pub fn stored_stride(&self) -> usize {
        self.stride
    }

    /// Current length: the pending value if materialized, else the stored one
    pub fn length(&self) -> usize {
        self.value.as_ref().map_or(self.stored_length, ValueBuffer::len)
    }

    pub fn is_stored(&self) -> bool {
        self.offset.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_materialized(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_ref().map(ValueBuffer::as_slice)
    }

    /// Pending bytes to persist: writable and materialized
    pub fn pending(&self) -> Option<&[u8]> {
        if self.writable { self.value() } else { None }
    }

    /// Writable and different from what the medium holds
    pub fn is_dirty(&self) -> bool {
        match (&self.value, self.writable) {
            (Some(value), true) => match (self.offset, &self.baseline) {
                (Some(_), Some(base)) => value.as_slice() != base.as_slice(),
                _ => true,
            },
            _ => false,
        }
    }

    /// Install bytes read from the medium
    pub fn materialize(&mut self, stored: &[u8]) -> StoreResult<()> {
        self.value = Some(ValueBuffer::from_slice(stored)?);
        Ok(())
    }

    /// Turn the descriptor into a pending value of `len` bytes.
    /// The caller materializes stored data first when it exists.
    pub fn make_writable(&mut self, len: usize) -> StoreResult<&mut [u8]> {
        if !self.writable && self.offset.is_some() {
            if let Some(stored) = &self.value {
                self.baseline = Some(stored.clone());
            }
        }
        self.writable = true;
        let value = self.value.get_or_insert_with(ValueBuffer::new);
        value.resize(len)?;
        Ok(value.as_mut_slice())
    }

    pub fn value_mut(&mut self) -> Option<&mut [u8]> {
        self.value.as_mut().map(ValueBuffer::as_mut_slice)
    }

    /// Drop the RAM copy, including any pending modification
    pub fn release(&mut self) {
        self.value = None;
        self.writable = false;
        self.baseline = None;
    }

    /// Forget the stored copy after the medium was wiped.
    /// A value held in RAM becomes pending so the next write persists it.
    pub fn detach(&mut self) {
        self.offset = None;
        self.stored_length = 0;
        self.stride = 0;
        self.baseline = None;
        self.writable = self.value.is_some();
    }

    /// Storage header for the next image, with its payload stride
    pub fn next_header(&self) -> ParamHeader {
        let length = self.length();
        let stride = align4(self.kind().storage_size(length));
        ParamHeader {
            handle: self.handle(),
            kind: self.kind() as u8,
            length: length as u16,
            stride: stride as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: ParamKind, handle: u16) -> ParamKey {
        ParamKey { kind, handle }
    }

    #[test]
    fn test_kind_tags_round_trip() {
        for tag in 1..=12u8 {
            let kind = ParamKind::from_u8(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert!(ParamKind::from_u8(0).is_none());
        assert!(ParamKind::from_u8(13).is_none());
    }

    #[test]
    fn test_persist_primitives() {
        let mut out = [0u8; 4];
        0x1234_5678u32.encode(&mut out);
        assert_eq!(out, [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(u32::decode(&out), 0x1234_5678);

        let mut out = [0u8; 8];
        1.5f64.encode(&mut out);
        assert_eq!(f64::decode(&out), 1.5);

        assert_eq!(<bool as Persist>::KIND, ParamKind::Byte);
        assert_eq!(<[u8; 6] as Persist>::SIZE, 6);
    }

    #[test]
    fn test_string_storage_size() {
        assert_eq!(ParamKind::String.storage_size(5), 6);
        assert_eq!(ParamKind::Binary.storage_size(5), 5);
    }

    #[test]
    fn test_fresh_descriptor_is_dirty_once_writable() {
        let mut d = ParamDescriptor::fresh(key(ParamKind::Word, 7));
        assert!(!d.is_dirty());
        d.make_writable(2).unwrap().copy_from_slice(&[1, 2]);
        assert!(d.is_dirty());
    }

    #[test]
    fn test_stored_descriptor_dirty_tracking() {
        let mut d = ParamDescriptor::stored(key(ParamKind::Dword, 1), 4, 4, 24);
        d.materialize(&[1, 2, 3, 4]).unwrap();
        d.make_writable(4).unwrap();
        assert!(!d.is_dirty());

        d.value_mut().unwrap()[0] = 9;
        assert!(d.is_dirty());

        d.value_mut().unwrap()[0] = 1;
        assert!(!d.is_dirty());

        d.make_writable(6).unwrap();
        assert!(d.is_dirty());
    }

    #[test]
    fn test_dirty_compares_exact_bytes() {
        // equal CRC32C, different bytes
        let a = 0x9f3c_d6b8_37fa_ac9au64.to_le_bytes();
        let b = 0x0e34_3b3c_0f87_1528u64.to_le_bytes();

        let mut d = ParamDescriptor::stored(key(ParamKind::Qword, 1), 8, 8, 24);
        d.materialize(&a).unwrap();
        d.make_writable(8).unwrap().copy_from_slice(&b);
        assert!(d.is_dirty());

        d.value_mut().unwrap().copy_from_slice(&a);
        assert!(!d.is_dirty());
    }

    #[test]
    fn test_read_only_descriptor_keeps_no_baseline() {
        let mut d = ParamDescriptor::stored(key(ParamKind::Dword, 1), 4, 4, 24);
        d.materialize(&[1, 2, 3, 4]).unwrap();
        assert!(d.baseline.is_none());
        d.make_writable(4).unwrap()[0] = 7;
        d.make_writable(4).unwrap();
        assert_eq!(d.baseline.as_ref().map(ValueBuffer::as_slice), Some(&[1u8, 2, 3, 4][..]));
        assert!(d.is_dirty());
    }

    #[test]
    fn test_release_drops_pending_value() {
        let mut d = ParamDescriptor::stored(key(ParamKind::Byte, 1), 1, 4, 24);
        d.materialize(&[1]).unwrap();
        d.make_writable(1).unwrap()[0] = 2;
        d.release();
        assert!(!d.is_materialized());
        assert!(!d.is_writable());
        assert!(!d.is_dirty());
        assert_eq!(d.length(), 1);
    }

    #[test]
    fn test_detach_turns_value_pending() {
        let mut d = ParamDescriptor::stored(key(ParamKind::Word, 1), 2, 4, 24);
        d.materialize(&[5, 6]).unwrap();
        d.detach();
        assert!(!d.is_stored());
        assert_eq!(d.pending(), Some(&[5u8, 6][..]));
        assert!(d.is_dirty());
    }

    #[test]
    fn test_next_header_alignment() {
        let mut d = ParamDescriptor::fresh(key(ParamKind::String, 3));
        d.make_writable(5).unwrap();
        let h = d.next_header();
        assert_eq!(h.length, 5);
        assert_eq!(h.stride, 8);
    }
}
