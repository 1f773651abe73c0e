//! nvstore Core: persistent parameter storage for small devices
//!
//! Two independent stores share this crate:
//!
//! - **Retained store** (`retained`): a few hundred bytes of memory that
//!   survive a warm reset, holding small `{id, length, payload}` entries under
//!   a CRC-16 protected header. Used for boot counters, the clock and other
//!   volatile state.
//! - **Configuration store** (`store`): typed parameters addressed by a
//!   16-bit handle, persisted either to a raw flash region (`flash`) or to a
//!   key/value partition service (`partition`). The image is a CRC-32C
//!   protected header plus a parameter table; values are loaded on demand.
//!
//! Media are reached through the traits in `backend`. In-memory
//! implementations with fault injection live in `backend::mem`; file backed
//! ones in the `nvstore-host` crate.

pub mod backend;
pub mod buffer;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod export;
pub mod flash;
pub mod format;
pub mod global;
pub mod param;
pub mod partition;
pub mod retained;
pub mod store;

pub use backend::{FlashRegion, MemFlash, MemPartition, MemRetained, PartitionService, RetainedMemory};
pub use clock::{RetainedClock, RtcTime, SyncStatus};
pub use config::Config;
pub use error::{MediumError, PartitionStatus, StoreError, StoreResult};
pub use flash::{FlashBackend, FlashConfigStore};
pub use global::Global;
pub use param::{ParamKind, Persist};
pub use partition::{PartitionBackend, PartitionConfigStore};
pub use retained::RetainedStore;
pub use store::{ConfigBackend, ConfigStore, DumpFilter, Writeable, WriteableBytes, WriteableString};
