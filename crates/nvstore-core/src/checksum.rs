//! Checksums used by the two stores
//!
//! The retained region uses CRC-16/MODBUS (reflected 0xA001, init 0xFFFF),
//! which is cheap enough for a 256 byte area read on every call. The
//! configuration image uses CRC32C seeded with the header fields.

use crc::{Crc, CRC_16_MODBUS};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC over retained payload bytes followed by the header length field.
pub fn retained_crc(covered: &[u8]) -> u16 {
    CRC16.checksum(covered)
}

/// CRC of a configuration image: header fields first, then table + payload.
pub fn config_crc(header_fields: &[u8], body: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(header_fields), body)
}
