//! File-backed media for nvstore
//!
//! Lets the retained and configuration stores run on a development host:
//!
//! - `FileFlash`: a raw flash region kept in an image file
//! - `DirPartition`: a partition service keeping one file per blob
//!
//! Both sync data with `durable_sync` before reporting success.

pub mod dir_partition;
pub mod file_flash;
pub mod platform_durability;

pub use dir_partition::DirPartition;
pub use file_flash::FileFlash;
pub use platform_durability::durable_sync;
