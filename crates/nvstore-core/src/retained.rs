//! Retained-memory store
//!
//! Keeps a handful of small records in a region that survives reset and
//! deep sleep. The region is packed from the top down:
//!
//! ```text
//!   [0 .. region_size - length)          unused
//!   [region_size - length .. -4)         entries, zero padded to the block size
//!   [region_size - 4 .. region_size)     header: length:u16, crc:u16
//! ```
//!
//! `length` includes the header. The CRC covers the entries and the length
//! field. Nothing is cached: every call re-reads and re-validates the region,
//! and every write rewrites it in one medium call.

use std::fmt;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::backend::RetainedMemory;
use crate::checksum::retained_crc;
use crate::config::Config;
use crate::entry::{self, encode_entry, EntryIter, MAX_ENTRY_PAYLOAD, NONE_ID};

/// Size of the trailing region header
pub const RETAINED_HEADER_SIZE: usize = 4;

/// Trailing header of the retained region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainedHeader {
    /// Bytes in use, header included
    pub length: u16,
    pub crc: u16,
}

impl RetainedHeader {
    pub fn data_length(&self) -> usize {
        self.length as usize - RETAINED_HEADER_SIZE
    }

    pub fn from_bytes(bytes: &[u8; RETAINED_HEADER_SIZE]) -> Self {
        Self {
            length: u16::from_le_bytes([bytes[0], bytes[1]]),
            crc: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

/// Validated copy of the region: entries followed by the length field
struct Image {
    header: RetainedHeader,
    covered: Vec<u8>,
}

impl Image {
    fn entries(&self) -> &[u8] {
        &self.covered[..self.header.data_length()]
    }
}

/// Store of small `{id, payload}` records in retained memory
pub struct RetainedStore<M: RetainedMemory> {
    memory: Mutex<M>,
    region_size: usize,
    block_size: usize,
    base_block: usize,
    lock_timeout: Option<Duration>,
}

impl<M: RetainedMemory> RetainedStore<M> {
    /// Manage the retained region described by `config` on `memory`.
    ///
    /// A region too small for the header and one record header is widened to
    /// that minimum; accesses past the end of `memory` then fail as usual.
    pub fn new(memory: M, config: &Config) -> Self {
        if let Err(reason) = config.validate() {
            warn!("retained store with invalid config: {}", reason);
        }
        let block_size = memory.block_size().max(1);
        let region_size = config
            .retained_region_size
            .max(RETAINED_HEADER_SIZE + entry::ENTRY_HEADER_SIZE);
        Self {
            memory: Mutex::new(memory),
            region_size,
            block_size,
            base_block: config.retained_base_block,
            lock_timeout: config.lock_timeout,
        }
    }

    /// Largest payload a single record may have in an otherwise empty region
    pub fn max_payload(&self) -> usize {
        let usable = self.region_size - RETAINED_HEADER_SIZE - entry::ENTRY_HEADER_SIZE;
        usable.min(MAX_ENTRY_PAYLOAD)
    }

    /// Copy the payload of `id` into `out`.
    ///
    /// `out` is zero-filled first. Returns the number of bytes copied,
    /// `min(stored, out.len())`, or 0 when the id is absent or the region
    /// is invalid.
    pub fn read(&self, id: u8, out: &mut [u8]) -> usize {
        out.fill(0);
        if id == NONE_ID {
            return 0;
        }
        let Some(mut memory) = self.lock() else {
            return 0;
        };
        let Some(image) = self.read_image(&mut *memory) else {
            return 0;
        };
        match entry::find(image.entries(), id) {
            Some(data) => {
                let n = data.len().min(out.len());
                out[..n].copy_from_slice(&data[..n]);
                debug!("retained read id=0x{:02x} len={} copied={}", id, data.len(), n);
                n
            }
            None => {
                debug!("retained read id=0x{:02x} not found", id);
                0
            }
        }
    }

    /// Owned copy of the payload of `id`
    pub fn read_vec(&self, id: u8) -> Option<Vec<u8>> {
        if id == NONE_ID {
            return None;
        }
        let mut memory = self.lock()?;
        let image = self.read_image(&mut *memory)?;
        entry::find(image.entries(), id).map(<[u8]>::to_vec)
    }

    /// Insert or replace the record for `id`.
    ///
    /// Empty `data` or the NONE id removes the record instead. Fails without
    /// touching the medium when the result would not fit, the payload is
    /// longer than 255 bytes, or the stored entries are truncated.
    pub fn write(&self, id: u8, data: &[u8]) -> bool {
        let Some(mut memory) = self.lock() else {
            return false;
        };
        self.write_locked(&mut *memory, id, data)
    }

    pub fn remove(&self, id: u8) -> bool {
        self.write(id, &[])
    }

    /// Fill the whole region with 0xFF, then store an empty header.
    pub fn clear(&self) -> bool {
        let Some(mut memory) = self.lock() else {
            return false;
        };
        let erased = vec![0xFF; self.region_size];
        if let Err(e) = memory.write(self.base_block, &erased) {
            warn!("retained clear failed: {}", e);
            return false;
        }
        debug!("retained clear region={} bytes", self.region_size);
        self.write_locked(&mut *memory, NONE_ID, &[])
    }

    /// All live records in stored order
    pub fn entries(&self) -> Vec<(u8, Vec<u8>)> {
        let Some(mut memory) = self.lock() else {
            return Vec::new();
        };
        let Some(image) = self.read_image(&mut *memory) else {
            return Vec::new();
        };
        EntryIter::new(image.entries())
            .map_while(Result::ok)
            .map(|e| (e.id, e.data.to_vec()))
            .collect()
    }

    /// Bytes in use including the header, `None` if the region is invalid
    pub fn used(&self) -> Option<usize> {
        let mut memory = self.lock()?;
        self.read_image(&mut *memory).map(|image| image.header.length as usize)
    }

    /// Write a listing of the region to `out`.
    ///
    /// With `filter` set only that id is listed. Returns the number of
    /// listed records, or `None` if the region is unset or invalid.
    pub fn dump<W: fmt::Write>(&self, out: &mut W, filter: Option<u8>) -> Option<usize> {
        let mut memory = self.lock()?;
        let Some(image) = self.read_image(&mut *memory) else {
            let _ = writeln!(out, "retained data not set or invalid");
            return None;
        };
        let _ = writeln!(out, "retained data length: {}", image.header.data_length());

        let mut listed = 0;
        for entry in EntryIter::new(image.entries()) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(t) => {
                    let _ = writeln!(out, "{}", t);
                    break;
                }
            };
            if filter.map_or(true, |id| id == entry.id) {
                let _ = write!(out, "id: 0x{:02x}, length {}", entry.id, entry.data.len());
                for (i, byte) in entry.data.iter().enumerate() {
                    let sep = if i % 4 == 0 { " " } else { "" };
                    let _ = write!(out, "{}{:02x}", sep, byte);
                }
                let _ = writeln!(out);
                listed += 1;
            }
        }
        Some(listed)
    }

    /// Run `f` with exclusive access to the underlying medium
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        f(&mut *self.memory.lock())
    }

    fn lock(&self) -> Option<MutexGuard<'_, M>> {
        match self.lock_timeout {
            Some(timeout) => {
                let guard = self.memory.try_lock_for(timeout);
                if guard.is_none() {
                    warn!("retained store lock not acquired within {:?}", timeout);
                }
                guard
            }
            None => Some(self.memory.lock()),
        }
    }

    fn header_block(&self) -> usize {
        self.base_block + (self.region_size - RETAINED_HEADER_SIZE) / self.block_size
    }

    fn start_block(&self, length: usize) -> usize {
        self.base_block + (self.region_size - length) / self.block_size
    }

    fn read_image(&self, memory: &mut M) -> Option<Image> {
        let mut raw = [0u8; RETAINED_HEADER_SIZE];
        if let Err(e) = memory.read(self.header_block(), &mut raw) {
            debug!("retained header read failed: {}", e);
            return None;
        }
        let header = RetainedHeader::from_bytes(&raw);
        let length = header.length as usize;
        if length < RETAINED_HEADER_SIZE || length > self.region_size || length % self.block_size != 0 {
            debug!("retained header invalid length={} region={}", length, self.region_size);
            return None;
        }

        let mut covered = vec![0u8; header.data_length() + 2];
        if let Err(e) = memory.read(self.start_block(length), &mut covered) {
            debug!("retained data read failed: {}", e);
            return None;
        }
        let crc = retained_crc(&covered);
        if crc != header.crc {
            warn!(
                "retained CRC mismatch 0x{:04x} != 0x{:04x} length={}",
                crc, header.crc, length
            );
            return None;
        }
        Some(Image { header, covered })
    }

    fn write_locked(&self, memory: &mut M, id: u8, data: &[u8]) -> bool {
        let data = if id == NONE_ID { &[][..] } else { data };
        if data.len() > MAX_ENTRY_PAYLOAD {
            warn!("retained write id=0x{:02x} len={} exceeds {}", id, data.len(), MAX_ENTRY_PAYLOAD);
            return false;
        }

        let mut out = Vec::with_capacity(self.region_size);
        if let Some(image) = self.read_image(memory) {
            for entry in EntryIter::new(image.entries()) {
                match entry {
                    Ok(e) if e.id == id => debug!("retained skip id=0x{:02x} len={}", e.id, e.data.len()),
                    Ok(e) => encode_entry(&mut out, e.id, e.data),
                    Err(t) => {
                        warn!("retained data truncated: {}", t);
                        return false;
                    }
                }
            }
        }
        if !data.is_empty() {
            encode_entry(&mut out, id, data);
        }
        while out.len() % self.block_size != 0 {
            out.push(0);
        }

        let length = out.len() + RETAINED_HEADER_SIZE;
        if length > self.region_size {
            warn!(
                "retained write id=0x{:02x} needs {} bytes, region holds {}",
                id, length, self.region_size
            );
            return false;
        }
        out.extend_from_slice(&(length as u16).to_le_bytes());
        let crc = retained_crc(&out);
        out.extend_from_slice(&crc.to_le_bytes());

        match memory.write(self.start_block(length), &out) {
            Ok(()) => {
                debug!("retained write id=0x{:02x} len={} region length={} crc=0x{:04x}", id, data.len(), length, crc);
                true
            }
            Err(e) => {
                warn!("retained write failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemRetained;

    fn store(block_size: usize) -> RetainedStore<MemRetained> {
        let config = if block_size == 4 { Config::esp8266() } else { Config::host() };
        RetainedStore::new(MemRetained::from_config(&config), &config)
    }

    fn contents(store: &RetainedStore<MemRetained>) -> Vec<u8> {
        store.memory.lock().contents().to_vec()
    }

    #[test]
    fn test_write_read_clear_scenario() {
        let s = store(4);
        assert!(s.write(0x11, &[1, 2, 3, 4]));
        assert!(s.write(0x22, &[0x44]));

        let mut buf = [0u8; 4];
        assert_eq!(s.read(0x11, &mut buf), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        let mut one = [0u8; 1];
        assert_eq!(s.read(0x22, &mut one), 1);
        assert_eq!(one, [0x44]);

        assert!(s.clear());
        assert_eq!(s.read(0x11, &mut buf), 0);
        assert_eq!(buf, [0; 4]);
        assert_eq!(s.used(), Some(RETAINED_HEADER_SIZE));
    }

    #[test]
    fn test_fresh_region_is_empty() {
        let s = store(1);
        let mut buf = [0xAAu8; 3];
        assert_eq!(s.read(1, &mut buf), 0);
        assert_eq!(buf, [0; 3]);
        assert!(s.entries().is_empty());
        assert_eq!(s.used(), None);
    }

    #[test]
    fn test_read_truncates_to_buffer() {
        let s = store(1);
        assert!(s.write(5, &[1, 2, 3, 4, 5, 6]));
        let mut buf = [0u8; 3];
        assert_eq!(s.read(5, &mut buf), 3);
        assert_eq!(buf, [1, 2, 3]);

        let mut big = [0xEEu8; 8];
        assert_eq!(s.read(5, &mut big), 6);
        assert_eq!(big, [1, 2, 3, 4, 5, 6, 0, 0]);
    }

    #[test]
    fn test_replace_compacts_others() {
        let s = store(4);
        assert!(s.write(1, &[1]));
        assert!(s.write(2, &[2, 2]));
        assert!(s.write(3, &[3, 3, 3]));
        assert!(s.write(2, &[9; 10]));

        let entries = s.entries();
        assert_eq!(
            entries,
            vec![(1, vec![1]), (3, vec![3, 3, 3]), (2, vec![9; 10])]
        );
    }

    #[test]
    fn test_remove_and_none_id() {
        let s = store(1);
        assert!(s.write(1, &[1]));
        assert!(s.write(2, &[2]));
        assert!(s.remove(1));
        assert_eq!(s.read_vec(1), None);
        assert_eq!(s.read_vec(2), Some(vec![2]));

        assert!(s.write(NONE_ID, &[7, 7]));
        assert_eq!(s.entries(), vec![(2, vec![2])]);
        assert_eq!(s.read_vec(NONE_ID), None);
    }

    #[test]
    fn test_block_alignment_padding() {
        let s = store(4);
        assert!(s.write(1, &[1]));
        // 2 header bytes + 1 payload, padded to 4, plus region header
        assert_eq!(s.used(), Some(8));
        let raw = contents(&s);
        assert_eq!(&raw[248..252], &[1, 1, 1, 0]);
    }

    #[test]
    fn test_capacity_boundary() {
        let s = store(1);
        // 2 + 250 + 4 == 256
        assert!(s.write(1, &[0x5A; 250]));
        assert_eq!(s.used(), Some(256));

        let s = store(1);
        assert!(s.write(1, &[0x11; 100]));
        let before = contents(&s);
        // 2 + 100 + 2 + 149 + 4 == 257
        assert!(!s.write(2, &[0x22; 149]));
        assert_eq!(contents(&s), before);
        assert!(s.write(2, &[0x22; 148]));
    }

    #[test]
    fn test_undersized_region_is_clamped() {
        let config = Config::host().with_retained_region(2);
        let s = RetainedStore::new(MemRetained::from_config(&config), &config);
        assert_eq!(s.max_payload(), 0);
        assert_eq!(s.read_vec(1), None);
        assert_eq!(s.used(), None);
        assert!(!s.write(1, &[1]));
        assert!(!s.clear());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let s = store(1);
        assert!(!s.write(1, &[0u8; 256]));
        assert_eq!(s.max_payload(), 250);
    }

    #[test]
    fn test_crc_corruption_hides_everything() {
        let s = store(1);
        assert!(s.write(1, &[1, 2, 3]));
        assert!(s.write(2, &[4, 5, 6]));
        let used = s.used().unwrap();

        s.memory.lock().inject_corruption(256 - used + 3, 0x01);
        assert_eq!(s.read_vec(1), None);
        assert_eq!(s.read_vec(2), None);
        assert!(s.entries().is_empty());

        // first write after corruption starts from an empty region
        assert!(s.write(3, &[3]));
        assert_eq!(s.entries(), vec![(3, vec![3])]);
    }

    #[test]
    fn test_header_corruption() {
        let s = store(1);
        assert!(s.write(1, &[1]));
        s.memory.lock().inject_corruption(254, 0x80);
        assert_eq!(s.read_vec(1), None);
    }

    #[test]
    fn test_truncated_entry_blocks_write() {
        let config = Config::host();
        let mut mem = MemRetained::from_config(&config);
        // entry claims 10 bytes but only 2 follow
        let mut raw = vec![0x11, 10, 1, 2];
        raw.extend_from_slice(&8u16.to_le_bytes());
        let crc = retained_crc(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());
        mem.write(248, &raw).unwrap();

        let s = RetainedStore::new(mem, &config);
        assert_eq!(s.used(), Some(8));
        let before = contents(&s);
        assert!(!s.write(0x22, &[1]));
        assert_eq!(contents(&s), before);
        assert_eq!(s.read_vec(0x11), None);
    }

    #[test]
    fn test_write_failure_reported() {
        let s = store(1);
        s.memory.lock().set_fail_writes(true);
        assert!(!s.write(1, &[1]));
        assert!(!s.clear());
    }

    #[test]
    fn test_dump() {
        let s = store(4);
        let mut out = String::new();
        assert_eq!(s.dump(&mut out, None), None);
        assert!(out.contains("not set or invalid"));

        assert!(s.write(0x11, &[1, 2, 3, 4, 5]));
        assert!(s.write(0x22, &[0x44]));
        let mut out = String::new();
        assert_eq!(s.dump(&mut out, None), Some(2));
        assert!(out.contains("id: 0x11, length 5 01020304 05"));

        let mut out = String::new();
        assert_eq!(s.dump(&mut out, Some(0x22)), Some(1));
        assert!(!out.contains("0x11"));
    }
}
