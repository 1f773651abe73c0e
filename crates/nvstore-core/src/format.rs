//! Binary layout of the configuration image
//!
//! Raw flash layout (little-endian):
//!
//! ```text
//!   [0..4)    magic:       u32  - 0x4E564346
//!   [4..8)    crc:         u32  - CRC32C(version|count|length) continued over table + payload
//!   [8..12)   version:     u32  - bumped by every committing write
//!   [12..14)  param_count: u16
//!   [14..16)  length:      u16  - bytes of table + payload
//!   [16..16+8N)                 - parameter headers
//!   [16+8N..16+length)          - payloads, one stride each
//! ```
//!
//! The partition backend stores the same header and table as two blobs.

use crate::checksum::config_crc;

/// Magic identifying a configuration image
pub const CONFIG_MAGIC: u32 = 0x4E56_4346;

pub const CONFIG_HEADER_SIZE: usize = 16;

pub const PARAM_HEADER_SIZE: usize = 8;

/// CRC read back from an erased header
pub const ERASED_CRC: u32 = 0xFFFF_FFFF;

/// Round up to the 4-byte payload alignment
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Fixed-size header at the start of the configuration image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigHeader {
    pub magic: u32,
    pub crc: u32,
    pub version: u32,
    pub param_count: u16,
    pub length: u16,
}

impl ConfigHeader {
    /// Header for `body` (table + payload), checksum included
    pub fn new(version: u32, param_count: u16, body: &[u8]) -> Self {
        let mut header = Self {
            magic: CONFIG_MAGIC,
            crc: 0,
            version,
            param_count,
            length: body.len() as u16,
        };
        header.crc = header.checksum(body);
        header
    }

    /// The fields folded into the CRC ahead of the body
    fn crc_fields(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..6].copy_from_slice(&self.param_count.to_le_bytes());
        buf[6..8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn checksum(&self, body: &[u8]) -> u32 {
        config_crc(&self.crc_fields(), body)
    }

    pub fn has_magic(&self) -> bool {
        self.magic == CONFIG_MAGIC
    }

    /// Bytes of the parameter table
    pub fn table_len(&self) -> usize {
        self.param_count as usize * PARAM_HEADER_SIZE
    }

    /// Cheap checks that need no body: magic, erased CRC, length bounds
    pub fn check_bounds(&self, region_size: usize) -> Result<(), String> {
        if !self.has_magic() {
            return Err(format!("bad magic 0x{:08x}", self.magic));
        }
        if self.crc == ERASED_CRC {
            return Err("erased header".into());
        }
        if CONFIG_HEADER_SIZE + self.length as usize > region_size {
            return Err(format!(
                "length {} exceeds region of {} bytes",
                self.length, region_size
            ));
        }
        if self.table_len() > self.length as usize {
            return Err(format!(
                "table of {} entries does not fit length {}",
                self.param_count, self.length
            ));
        }
        Ok(())
    }

    /// Full validation against the body the header covers
    pub fn validate(&self, body: &[u8], region_size: usize) -> Result<(), String> {
        self.check_bounds(region_size)?;
        let actual = self.checksum(body);
        if actual != self.crc {
            return Err(format!(
                "checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
                self.crc, actual
            ));
        }
        Ok(())
    }

    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; CONFIG_HEADER_SIZE] {
        let mut buf = [0u8; CONFIG_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.crc.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..14].copy_from_slice(&self.param_count.to_le_bytes());
        buf[14..16].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8; CONFIG_HEADER_SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            crc: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            version: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            param_count: u16::from_le_bytes([bytes[12], bytes[13]]),
            length: u16::from_le_bytes([bytes[14], bytes[15]]),
        }
    }

    /// Parse from a blob of unknown size (partition service)
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: &[u8; CONFIG_HEADER_SIZE] = bytes.try_into().ok()?;
        Some(Self::from_bytes(raw))
    }
}

/// One entry of the parameter table
///
/// Layout: `handle:u16, kind:u8, reserved:u8, length:u16, stride:u16`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamHeader {
    pub handle: u16,
    pub kind: u8,
    pub length: u16,
    /// Payload bytes reserved on the medium, storage size rounded up to 4
    pub stride: u16,
}

impl ParamHeader {
    pub fn to_bytes(&self) -> [u8; PARAM_HEADER_SIZE] {
        let mut buf = [0u8; PARAM_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.handle.to_le_bytes());
        buf[2] = self.kind;
        buf[4..6].copy_from_slice(&self.length.to_le_bytes());
        buf[6..8].copy_from_slice(&self.stride.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; PARAM_HEADER_SIZE]) -> Self {
        Self {
            handle: u16::from_le_bytes([bytes[0], bytes[1]]),
            kind: bytes[2],
            length: u16::from_le_bytes([bytes[4], bytes[5]]),
            stride: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// Serialize the parameter table
pub fn encode_table(params: &[ParamHeader]) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.len() * PARAM_HEADER_SIZE);
    for p in params {
        out.extend_from_slice(&p.to_bytes());
    }
    out
}

/// Parse `count` table entries from the start of `bytes`
pub fn parse_table(bytes: &[u8], count: usize) -> Result<Vec<ParamHeader>, String> {
    let needed = count * PARAM_HEADER_SIZE;
    if bytes.len() < needed {
        return Err(format!("table needs {} bytes, {} available", needed, bytes.len()));
    }
    Ok(bytes[..needed]
        .chunks_exact(PARAM_HEADER_SIZE)
        .map(|chunk| {
            let mut raw = [0u8; PARAM_HEADER_SIZE];
            raw.copy_from_slice(chunk);
            ParamHeader::from_bytes(&raw)
        })
        .collect())
}
