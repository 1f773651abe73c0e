//! Dual-mode value buffer
//!
//! Most parameters are a few bytes wide, so values up to `INLINE_CAPACITY`
//! live inside the descriptor. Larger values move to the heap and stay there
//! until `reset()`, even if later shrunk.

use crate::error::{StoreError, StoreResult};

/// Largest value kept without a heap allocation
pub const INLINE_CAPACITY: usize = 8;

#[derive(Clone, PartialEq, Eq)]
pub enum ValueBuffer {
    Inline { bytes: [u8; INLINE_CAPACITY], len: u8 },
    Heap(Vec<u8>),
}

impl ValueBuffer {
    pub fn new() -> Self {
        ValueBuffer::Inline { bytes: [0; INLINE_CAPACITY], len: 0 }
    }

    /// Zero-filled buffer of `len` bytes
    pub fn zeroed(len: usize) -> StoreResult<Self> {
        let mut buf = Self::new();
        buf.resize(len)?;
        Ok(buf)
    }

    pub fn from_slice(data: &[u8]) -> StoreResult<Self> {
        let mut buf = Self::zeroed(data.len())?;
        buf.as_mut_slice().copy_from_slice(data);
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        match self {
            ValueBuffer::Inline { len, .. } => *len as usize,
            ValueBuffer::Heap(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, ValueBuffer::Inline { .. })
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ValueBuffer::Inline { bytes, len } => &bytes[..*len as usize],
            ValueBuffer::Heap(v) => v,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            ValueBuffer::Inline { bytes, len } => &mut bytes[..*len as usize],
            ValueBuffer::Heap(v) => v,
        }
    }

    /// Change the length, keeping the overlapping prefix and zero-filling
    /// any new bytes.
    pub fn resize(&mut self, new_len: usize) -> StoreResult<()> {
        match self {
            ValueBuffer::Inline { bytes, len } if new_len <= INLINE_CAPACITY => {
                let old = *len as usize;
                if new_len > old {
                    bytes[old..new_len].fill(0);
                }
                *len = new_len as u8;
            }
            ValueBuffer::Inline { bytes, len } => {
                let mut heap = Vec::new();
                heap.try_reserve_exact(new_len)
                    .map_err(|_| StoreError::AllocationFailure { requested: new_len })?;
                heap.extend_from_slice(&bytes[..*len as usize]);
                heap.resize(new_len, 0);
                *self = ValueBuffer::Heap(heap);
            }
            ValueBuffer::Heap(v) => {
                if new_len > v.len() {
                    v.try_reserve_exact(new_len - v.len())
                        .map_err(|_| StoreError::AllocationFailure { requested: new_len })?;
                }
                v.resize(new_len, 0);
            }
        }
        Ok(())
    }

    /// Replace the contents, resizing as needed
    pub fn assign(&mut self, data: &[u8]) -> StoreResult<()> {
        self.resize(data.len())?;
        self.as_mut_slice().copy_from_slice(data);
        Ok(())
    }

    /// Drop any heap block and return to an empty inline buffer
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for ValueBuffer {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for ValueBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.is_inline() { "Inline" } else { "Heap" };
        f.debug_struct(mode).field("data", &self.as_slice()).finish()
    }
}
