//! In-memory media for tests and simulation
//!
//! Each medium supports fault injection so the stores' error paths can be
//! driven deterministically: failing reads/writes/erases, power loss in the
//! middle of a write, and bit corruption.

use hashbrown::HashMap;

use crate::config::Config;
use crate::error::{MediumError, PartitionStatus};

use super::{FlashRegion, PartitionService, RetainedMemory};

/// Retained memory simulated as a flat byte array
#[derive(Debug, Clone)]
pub struct MemRetained {
    data: Vec<u8>,
    block_size: usize,
    base_block: usize,
    fail_writes: bool,
    writes: usize,
}

impl MemRetained {
    pub fn new(block_size: usize, base_block: usize, size: usize) -> Self {
        Self {
            data: vec![0; size],
            block_size,
            base_block,
            fail_writes: false,
            writes: 0,
        }
    }

    /// Medium matching the retained region described by `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.retained_block_size,
            config.retained_base_block,
            config.retained_region_size,
        )
    }

    /// Raw contents of the region (for test verification)
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Flip bits at `offset` within the region
    pub fn inject_corruption(&mut self, offset: usize, mask: u8) {
        self.data[offset] ^= mask;
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Number of successful write calls
    pub fn write_count(&self) -> usize {
        self.writes
    }

    fn range(&self, block: usize, len: usize) -> Result<std::ops::Range<usize>, MediumError> {
        let out_of_bounds = MediumError::OutOfBounds {
            address: (block * self.block_size) as u32,
            len,
            capacity: self.data.len(),
        };
        if block < self.base_block {
            return Err(out_of_bounds);
        }
        let start = (block - self.base_block) * self.block_size;
        if len == 0 || start + len > self.data.len() {
            return Err(out_of_bounds);
        }
        Ok(start..start + len)
    }
}

impl RetainedMemory for MemRetained {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read(&mut self, block: usize, buf: &mut [u8]) -> Result<(), MediumError> {
        let range = self.range(block, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, block: usize, data: &[u8]) -> Result<(), MediumError> {
        let range = self.range(block, data.len())?;
        if self.fail_writes {
            return Err(MediumError::WriteFailed { address: range.start as u32 });
        }
        self.data[range].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }
}

/// NOR flash simulated in memory
///
/// Writes can only clear bits, so programming without an erase corrupts
/// data the way real flash does.
#[derive(Debug, Clone)]
pub struct MemFlash {
    base: u32,
    storage: Vec<u8>,
    sector_size: usize,
    erase_counts: Vec<u32>,
    writes: usize,
    fail_reads: bool,
    fail_erases: bool,
    /// Remaining successful writes before every write fails
    fail_writes_after: Option<usize>,
    power_loss: bool,
}

impl MemFlash {
    /// Erased flash covering `[base, base + size)`
    pub fn new(base: u32, size: usize, sector_size: usize) -> Self {
        let sectors = size.div_ceil(sector_size);
        Self {
            base,
            storage: vec![0xFF; size],
            sector_size,
            erase_counts: vec![0; sectors],
            writes: 0,
            fail_reads: false,
            fail_erases: false,
            fail_writes_after: None,
            power_loss: false,
        }
    }

    /// Flash covering the configuration region described by `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.config_base_address,
            config.config_region_size,
            config.flash_sector_size,
        )
    }

    /// Get flash contents (for test verification)
    pub fn contents(&self, address: u32, len: usize) -> Vec<u8> {
        let start = (address - self.base) as usize;
        self.storage[start..start + len].to_vec()
    }

    /// Overwrite bytes with a corrupt pattern, bypassing flash semantics
    pub fn inject_corruption(&mut self, address: u32, len: usize) {
        let start = (address - self.base) as usize;
        for byte in &mut self.storage[start..start + len] {
            *byte ^= 0xAA;
        }
    }

    pub fn erase_count(&self, address: u32) -> u32 {
        let sector = (address - self.base) as usize / self.sector_size;
        self.erase_counts[sector]
    }

    pub fn total_erase_count(&self) -> u32 {
        self.erase_counts.iter().sum()
    }

    /// Number of successful write calls
    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    pub fn set_fail_erases(&mut self, fail: bool) {
        self.fail_erases = fail;
    }

    /// Let `count` more writes succeed, then fail every write
    pub fn fail_writes_after(&mut self, count: Option<usize>) {
        self.fail_writes_after = count;
    }

    /// The next write only programs the first half of its data
    pub fn simulate_power_loss(&mut self) {
        self.power_loss = true;
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, MediumError> {
        let out_of_bounds = MediumError::OutOfBounds {
            address,
            len,
            capacity: self.storage.len(),
        };
        if address < self.base {
            return Err(out_of_bounds);
        }
        let start = (address - self.base) as usize;
        if start + len > self.storage.len() {
            return Err(out_of_bounds);
        }
        Ok(start..start + len)
    }
}

impl FlashRegion for MemFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), MediumError> {
        let range = self.range(address, buf.len())?;
        if self.fail_reads {
            return Err(MediumError::ReadFailed { address });
        }
        buf.copy_from_slice(&self.storage[range]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MediumError> {
        let range = self.range(address, data.len())?;
        match self.fail_writes_after {
            Some(0) => return Err(MediumError::WriteFailed { address }),
            Some(ref mut n) => *n -= 1,
            None => {}
        }

        let write_len = if self.power_loss {
            self.power_loss = false;
            data.len() / 2
        } else {
            data.len()
        };
        for (dst, src) in self.storage[range].iter_mut().zip(&data[..write_len]) {
            *dst &= *src;
        }
        self.writes += 1;
        Ok(())
    }

    fn erase(&mut self, address: u32, size: usize) -> Result<(), MediumError> {
        let range = self.range(address, size)?;
        if range.start % self.sector_size != 0 || size % self.sector_size != 0 {
            return Err(MediumError::Unaligned { address, sector_size: self.sector_size });
        }
        if self.fail_erases {
            return Err(MediumError::EraseFailed { address });
        }
        let first = range.start / self.sector_size;
        let count = size / self.sector_size;
        self.storage[range].fill(0xFF);
        for n in &mut self.erase_counts[first..first + count] {
            *n += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct OpenHandle {
    namespace: String,
    read_write: bool,
    staged: HashMap<String, Vec<u8>>,
}

/// Partition service keeping every namespace in a hash map
#[derive(Debug, Clone, Default)]
pub struct MemPartition {
    namespaces: HashMap<String, HashMap<String, Vec<u8>>>,
    handle: Option<OpenHandle>,
    fail_open: Option<PartitionStatus>,
    fail_set_blob: Option<PartitionStatus>,
    fail_commit: Option<PartitionStatus>,
    commits: usize,
    blob_writes: usize,
}

impl MemPartition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed blob (for test verification)
    pub fn blob(&self, namespace: &str, key: &str) -> Option<&[u8]> {
        self.namespaces.get(namespace)?.get(key).map(Vec::as_slice)
    }

    /// Committed keys and blobs of a namespace, sorted by key
    pub fn snapshot(&self, namespace: &str) -> Vec<(String, Vec<u8>)> {
        let mut all: Vec<_> = self
            .namespaces
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        all.sort();
        all
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Number of successful `set_blob` calls
    pub fn set_blob_count(&self) -> usize {
        self.blob_writes
    }

    pub fn set_fail_open(&mut self, status: Option<PartitionStatus>) {
        self.fail_open = status;
    }

    pub fn set_fail_set_blob(&mut self, status: Option<PartitionStatus>) {
        self.fail_set_blob = status;
    }

    pub fn set_fail_commit(&mut self, status: Option<PartitionStatus>) {
        self.fail_commit = status;
    }

    fn writable_handle(&mut self) -> Result<&mut OpenHandle, PartitionStatus> {
        match self.handle.as_mut() {
            Some(h) if h.read_write => Ok(h),
            _ => Err(PartitionStatus::INVALID_HANDLE),
        }
    }
}

impl PartitionService for MemPartition {
    fn open(&mut self, namespace: &str, read_write: bool) -> Result<(), PartitionStatus> {
        if let Some(status) = self.fail_open {
            return Err(status);
        }
        let staged = match self.namespaces.get(namespace) {
            Some(ns) => ns.clone(),
            None if read_write => HashMap::new(),
            None => return Err(PartitionStatus::NAMESPACE_NOT_FOUND),
        };
        self.handle = Some(OpenHandle {
            namespace: namespace.to_string(),
            read_write,
            staged,
        });
        Ok(())
    }

    fn get_blob(&mut self, key: &str) -> Result<Option<Vec<u8>>, PartitionStatus> {
        let handle = self.handle.as_ref().ok_or(PartitionStatus::INVALID_HANDLE)?;
        Ok(handle.staged.get(key).cloned())
    }

    fn set_blob(&mut self, key: &str, data: &[u8]) -> Result<(), PartitionStatus> {
        if let Some(status) = self.fail_set_blob {
            return Err(status);
        }
        let handle = self.writable_handle()?;
        handle.staged.insert(key.to_string(), data.to_vec());
        self.blob_writes += 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), PartitionStatus> {
        if let Some(status) = self.fail_commit {
            return Err(status);
        }
        let handle = self.writable_handle()?;
        let (namespace, staged) = (handle.namespace.clone(), handle.staged.clone());
        self.namespaces.insert(namespace, staged);
        self.commits += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.handle = None;
    }

    fn erase_all(&mut self) -> Result<(), PartitionStatus> {
        let handle = self.writable_handle()?;
        handle.staged.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_write_only_clears_bits() {
        let mut flash = MemFlash::new(0x1000, 4096, 4096);
        flash.write(0x1000, &[0x0F]).unwrap();
        flash.write(0x1000, &[0xF0]).unwrap();
        assert_eq!(flash.contents(0x1000, 1), vec![0x00]);

        flash.erase(0x1000, 4096).unwrap();
        assert_eq!(flash.contents(0x1000, 1), vec![0xFF]);
        assert_eq!(flash.erase_count(0x1000), 1);
    }

    #[test]
    fn test_flash_bounds_and_alignment() {
        let mut flash = MemFlash::new(0x1000, 4096, 4096);
        let mut buf = [0u8; 4];
        assert!(flash.read(0x0FFF, &mut buf).is_err());
        assert!(flash.read(0x1FFD, &mut buf).is_err());
        assert!(matches!(
            flash.erase(0x1004, 4096),
            Err(MediumError::OutOfBounds { .. })
        ));
        assert!(matches!(
            flash.erase(0x1000, 100),
            Err(MediumError::Unaligned { .. })
        ));
    }

    #[test]
    fn test_flash_power_loss_writes_half() {
        let mut flash = MemFlash::new(0, 4096, 4096);
        flash.simulate_power_loss();
        flash.write(0, &[0, 0, 0, 0]).unwrap();
        assert_eq!(flash.contents(0, 4), vec![0, 0, 0xFF, 0xFF]);
    }

    #[test]
    fn test_flash_fail_writes_after() {
        let mut flash = MemFlash::new(0, 4096, 4096);
        flash.fail_writes_after(Some(1));
        assert!(flash.write(0, &[1]).is_ok());
        assert!(flash.write(1, &[1]).is_err());
    }

    #[test]
    fn test_retained_block_addressing() {
        let mut mem = MemRetained::new(4, 128, 256);
        mem.write(129, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&mem.contents()[4..8], &[1, 2, 3, 4]);

        let mut buf = [0u8; 4];
        assert!(mem.read(127, &mut buf).is_err());
        assert!(mem.read(128 + 63, &mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_partition_commit_and_close() {
        let mut p = MemPartition::new();
        assert_eq!(p.open("ns", false), Err(PartitionStatus::NAMESPACE_NOT_FOUND));

        p.open("ns", true).unwrap();
        p.set_blob("a", &[1]).unwrap();
        p.close();
        assert!(p.blob("ns", "a").is_none());

        p.open("ns", true).unwrap();
        p.set_blob("a", &[1]).unwrap();
        p.commit().unwrap();
        p.close();
        assert_eq!(p.blob("ns", "a"), Some(&[1u8][..]));

        p.open("ns", false).unwrap();
        assert_eq!(p.set_blob("b", &[2]), Err(PartitionStatus::INVALID_HANDLE));
        assert_eq!(p.get_blob("a").unwrap(), Some(vec![1]));
    }
}
