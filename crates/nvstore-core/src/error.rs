//! Error types for nvstore operations
//!
//! Collaborators (flash, retained memory, partition service) report
//! `MediumError` or a raw `PartitionStatus`. The configuration store folds
//! those into `StoreError`, which carries enough context to tell which step
//! of a read or write cycle failed.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by a storage medium
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediumError {
    /// Access outside the medium
    #[error("address 0x{address:08x} + {len} bytes is outside the medium ({capacity} bytes)")]
    OutOfBounds {
        /// First address of the access
        address: u32,
        /// Number of bytes requested
        len: usize,
        /// Size of the medium in bytes
        capacity: usize,
    },

    /// Erase address or size not aligned to the sector size
    #[error("erase at 0x{address:08x} is not aligned to sector size {sector_size}")]
    Unaligned {
        address: u32,
        sector_size: usize,
    },

    #[error("read failed at 0x{address:08x}")]
    ReadFailed { address: u32 },

    #[error("write failed at 0x{address:08x}")]
    WriteFailed { address: u32 },

    #[error("erase failed at 0x{address:08x}")]
    EraseFailed { address: u32 },

    /// Host file backing the medium failed
    #[error("I/O error: {message} ({kind:?})")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl From<std::io::Error> for MediumError {
    fn from(err: std::io::Error) -> Self {
        MediumError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Raw status code returned by a partition service call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("partition status 0x{0:04x}")]
pub struct PartitionStatus(pub i32);

impl PartitionStatus {
    /// Generic failure
    pub const FAIL: PartitionStatus = PartitionStatus(-1);
    /// Operation on a handle that was not opened, or opened read-only
    pub const INVALID_HANDLE: PartitionStatus = PartitionStatus(0x1107);
    /// Partition has no room left for the blob
    pub const NOT_ENOUGH_SPACE: PartitionStatus = PartitionStatus(0x1105);
    /// Namespace does not exist and the handle was opened read-only
    pub const NAMESPACE_NOT_FOUND: PartitionStatus = PartitionStatus(0x1102);
}

/// Partition service call that produced a `StoreError::Partition`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionOp {
    Open,
    GetBlob,
    SetBlob,
    Commit,
    EraseAll,
}

impl fmt::Display for PartitionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionOp::Open => "open",
            PartitionOp::GetBlob => "get_blob",
            PartitionOp::SetBlob => "set_blob",
            PartitionOp::Commit => "commit",
            PartitionOp::EraseAll => "erase_all",
        };
        f.write_str(name)
    }
}

/// Configuration store error types with detailed context
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The stored header could not be read
    #[error("reading header at 0x{address:08x} failed: {source}")]
    ReadFailure {
        address: u32,
        #[source]
        source: MediumError,
    },

    /// An unchanged value could not be copied forward from the old image
    #[error("reading previous value of handle 0x{handle:04x} failed: {source}")]
    ReadPreviousFailure {
        handle: u16,
        #[source]
        source: MediumError,
    },

    /// The freshly written image did not validate on reload
    #[error("stored configuration failed validation: {reason}")]
    ValidationFailure { reason: String },

    /// Serialized configuration does not fit the region
    #[error("configuration needs {required} bytes, region holds {capacity}")]
    CapacityExceeded { required: usize, capacity: usize },

    /// Scratch buffer for the new image could not be allocated
    #[error("cannot allocate {requested} bytes")]
    AllocationFailure { requested: usize },

    #[error("erasing sector at 0x{address:08x} failed: {source}")]
    EraseFailure {
        address: u32,
        #[source]
        source: MediumError,
    },

    #[error("writing at 0x{address:08x} failed: {source}")]
    WriteFailure {
        address: u32,
        #[source]
        source: MediumError,
    },

    /// A partition service call returned a non-success status
    #[error("partition {op} failed with status {code}")]
    Partition { op: PartitionOp, code: i32 },

    /// The store lock could not be acquired in time
    #[error("store lock not acquired within {waited:?}")]
    LockTimeout { waited: Duration },

    /// A JSON document handed to `import_json` was malformed
    #[error("invalid import document: {reason}")]
    InvalidImport { reason: String },
}

impl StoreError {
    pub(crate) fn partition(op: PartitionOp, status: PartitionStatus) -> Self {
        StoreError::Partition { op, code: status.0 }
    }

    /// Stable identifier for logs and remote diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::ReadFailure { .. } => "READING_HEADER_FAILED",
            StoreError::ReadPreviousFailure { .. } => "READING_PREV_CONF_FAILED",
            StoreError::ValidationFailure { .. } => "READING_CONF_FAILED",
            StoreError::CapacityExceeded { .. } => "MAX_SIZE_EXCEEDED",
            StoreError::AllocationFailure { .. } => "OUT_OF_MEMORY",
            StoreError::EraseFailure { .. } => "FLASH_ERASE_ERROR",
            StoreError::WriteFailure { .. } => "FLASH_WRITE_ERROR",
            StoreError::Partition { op, .. } => match op {
                PartitionOp::Open => "NVS_OPEN",
                PartitionOp::GetBlob => "FLASH_READ_ERROR",
                PartitionOp::SetBlob => "NVS_SET_BLOB_ERROR",
                PartitionOp::Commit => "NVS_COMMIT_ERROR",
                PartitionOp::EraseAll => "NVS_ERASE_ALL",
            },
            StoreError::LockTimeout { .. } => "LOCK_TIMEOUT",
            StoreError::InvalidImport { .. } => "INVALID_IMPORT",
        }
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
