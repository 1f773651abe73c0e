//! Storage media the stores run on
//!
//! Each trait is the smallest surface a store needs from its medium. The
//! `mem` module provides in-memory implementations with fault injection;
//! the `nvstore-host` crate provides file-backed ones.

pub mod mem;

use crate::error::{MediumError, PartitionStatus};

pub use mem::{MemFlash, MemPartition, MemRetained};

/// Small always-powered memory addressed in blocks
///
/// Survives reset and deep sleep, not power-off. Reads and writes start at
/// a block boundary; lengths need not be block multiples.
pub trait RetainedMemory: Send {
    /// Bytes per block
    fn block_size(&self) -> usize;

    fn read(&mut self, block: usize, buf: &mut [u8]) -> Result<(), MediumError>;

    fn write(&mut self, block: usize, data: &[u8]) -> Result<(), MediumError>;
}

/// Raw NOR flash: byte reads, 1→0 writes, sector erase back to 0xFF
pub trait FlashRegion: Send {
    fn sector_size(&self) -> usize;

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), MediumError>;

    /// Program `data`; the target must have been erased
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MediumError>;

    /// Erase `size` bytes starting at a sector-aligned `address`
    fn erase(&mut self, address: u32, size: usize) -> Result<(), MediumError>;
}

/// Vendor key/blob store layered over flash
///
/// Blobs set through an open read/write handle become durable on `commit`.
/// `close` drops the handle and anything not committed.
pub trait PartitionService: Send {
    fn open(&mut self, namespace: &str, read_write: bool) -> Result<(), PartitionStatus>;

    /// `Ok(None)` when the key does not exist
    fn get_blob(&mut self, key: &str) -> Result<Option<Vec<u8>>, PartitionStatus>;

    fn set_blob(&mut self, key: &str, data: &[u8]) -> Result<(), PartitionStatus>;

    fn commit(&mut self) -> Result<(), PartitionStatus>;

    fn close(&mut self);

    /// Remove every key of the open namespace
    fn erase_all(&mut self) -> Result<(), PartitionStatus>;
}
