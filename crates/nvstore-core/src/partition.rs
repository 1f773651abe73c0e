//! Partition service backend
//!
//! Stores the configuration as blobs in a vendor key/value partition:
//!
//! - `"header"`: the 16 byte configuration header
//! - `"params"`: the parameter table; the header CRC covers it
//! - one blob per parameter under `format!("{:08x}", kind << 16 | handle)`
//!
//! Only modified values are rewritten. New blobs become visible together on
//! `commit`, so an interrupted write leaves the previous configuration.

use log::{debug, warn};

use crate::backend::PartitionService;
use crate::config::Config;
use crate::error::{PartitionOp, PartitionStatus, StoreError, StoreResult};
use crate::format::{encode_table, parse_table, ConfigHeader, ParamHeader, CONFIG_HEADER_SIZE};
use crate::param::{ParamDescriptor, ParamKind};
use crate::store::{persisted, ConfigBackend, ConfigStore, StoredTable};

pub const HEADER_KEY: &str = "header";
pub const PARAMS_KEY: &str = "params";

/// Configuration store on a partition service
pub type PartitionConfigStore<P> = ConfigStore<PartitionBackend<P>>;

/// Blob key of a parameter
pub fn param_key(kind: ParamKind, handle: u16) -> String {
    format!("{:08x}", ((kind as u32) << 16) | handle as u32)
}

pub struct PartitionBackend<P: PartitionService> {
    service: P,
    namespace: String,
    region_size: usize,
    /// `Some(read_write)` while a handle is open
    open: Option<bool>,
}

impl<P: PartitionService> PartitionBackend<P> {
    pub fn new(service: P, config: &Config) -> Self {
        Self {
            service,
            namespace: config.partition_namespace.clone(),
            region_size: config.config_region_size,
            open: None,
        }
    }

    pub fn service(&self) -> &P {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut P {
        &mut self.service
    }

    /// Open the namespace. `Ok(false)` when it does not exist yet and a
    /// read-only handle was requested.
    fn ensure_open(&mut self, read_write: bool) -> StoreResult<bool> {
        match self.open {
            Some(true) => return Ok(true),
            Some(false) if !read_write => return Ok(true),
            _ => self.close(),
        }
        match self.service.open(&self.namespace, read_write) {
            Ok(()) => {
                self.open = Some(read_write);
                Ok(true)
            }
            Err(PartitionStatus::NAMESPACE_NOT_FOUND) if !read_write => Ok(false),
            Err(status) => Err(StoreError::partition(PartitionOp::Open, status)),
        }
    }

    fn close(&mut self) {
        if self.open.take().is_some() {
            self.service.close();
        }
    }

    fn get_blob(&mut self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        if !self.ensure_open(false)? {
            return Ok(None);
        }
        self.service
            .get_blob(key)
            .map_err(|status| StoreError::partition(PartitionOp::GetBlob, status))
    }

    fn set_blob(&mut self, key: &str, data: &[u8]) -> StoreResult<()> {
        self.service
            .set_blob(key, data)
            .map_err(|status| StoreError::partition(PartitionOp::SetBlob, status))
    }

    fn store_open(&mut self, params: &[ParamDescriptor], version: u32) -> StoreResult<()> {
        let mut headers: Vec<ParamHeader> = Vec::new();
        let mut written = 0;
        for param in persisted(params) {
            headers.push(param.next_header());
            if !param.is_dirty() {
                continue;
            }
            if let Some(value) = param.pending() {
                let key = param_key(param.kind(), param.handle());
                let mut blob = value.to_vec();
                if param.kind() == ParamKind::String {
                    blob.push(0);
                }
                self.set_blob(&key, &blob)?;
                written += 1;
            }
        }

        let table = encode_table(&headers);
        if table.len() > u16::MAX as usize || CONFIG_HEADER_SIZE + table.len() > self.region_size {
            return Err(StoreError::CapacityExceeded {
                required: CONFIG_HEADER_SIZE + table.len(),
                capacity: self.region_size,
            });
        }
        let header = ConfigHeader::new(version, headers.len() as u16, &table);
        self.set_blob(PARAMS_KEY, &table)?;
        self.set_blob(HEADER_KEY, &header.to_bytes())?;
        self.service
            .commit()
            .map_err(|status| StoreError::partition(PartitionOp::Commit, status))?;
        debug!(
            "partition write version={} params={} blobs={}",
            version,
            headers.len(),
            written
        );
        Ok(())
    }
}

impl<P: PartitionService> PartitionConfigStore<P> {
    pub fn with_partition(service: P, config: &Config) -> Self {
        ConfigStore::new(PartitionBackend::new(service, config), config)
    }
}

impl<P: PartitionService> ConfigBackend for PartitionBackend<P> {
    fn name(&self) -> &'static str {
        "partition"
    }

    fn read_header(&mut self) -> StoreResult<Option<ConfigHeader>> {
        let Some(blob) = self.get_blob(HEADER_KEY)? else {
            return Ok(None);
        };
        match ConfigHeader::from_slice(&blob) {
            Some(header) if header.has_magic() => Ok(Some(header)),
            _ => {
                warn!("partition header blob of {} bytes is invalid", blob.len());
                Ok(None)
            }
        }
    }

    fn load(&mut self) -> StoreResult<StoredTable> {
        let header = self.read_header()?.ok_or_else(|| StoreError::ValidationFailure {
            reason: "no configuration header".into(),
        })?;
        let table = self.get_blob(PARAMS_KEY)?.unwrap_or_default();
        if table.len() != header.length as usize || table.len() != header.table_len() {
            return Err(StoreError::ValidationFailure {
                reason: format!(
                    "params blob of {} bytes, header expects {} entries in {} bytes",
                    table.len(),
                    header.param_count,
                    header.length
                ),
            });
        }
        header
            .validate(&table, self.region_size)
            .map_err(|reason| StoreError::ValidationFailure { reason })?;
        let entries = parse_table(&table, header.param_count as usize)
            .map_err(|reason| StoreError::ValidationFailure { reason })?;
        self.close();

        // offsets only order the values; blobs are addressed by key
        let mut offset = 0;
        let params = entries
            .into_iter()
            .map(|ph| {
                let at = offset;
                offset += ph.stride as usize;
                (ph, at)
            })
            .collect();
        Ok(StoredTable { header, params })
    }

    fn read_value(&mut self, param: &ParamDescriptor) -> StoreResult<Vec<u8>> {
        let key = param_key(param.kind(), param.handle());
        let mut blob = self.get_blob(&key)?.ok_or_else(|| StoreError::ValidationFailure {
            reason: format!("blob {} missing", key),
        })?;
        if blob.len() < param.stored_length() {
            return Err(StoreError::ValidationFailure {
                reason: format!(
                    "blob {} has {} bytes, table says {}",
                    key,
                    blob.len(),
                    param.stored_length()
                ),
            });
        }
        blob.truncate(param.stored_length());
        Ok(blob)
    }

    fn store(&mut self, params: &[ParamDescriptor], version: u32) -> StoreResult<()> {
        self.close();
        self.ensure_open(true)?;
        let result = self.store_open(params, version);
        self.close();
        result
    }

    fn erase(&mut self) -> StoreResult<()> {
        self.close();
        self.ensure_open(true)?;
        let result = self
            .service
            .erase_all()
            .map_err(|status| StoreError::partition(PartitionOp::EraseAll, status))
            .and_then(|()| {
                self.service
                    .commit()
                    .map_err(|status| StoreError::partition(PartitionOp::Commit, status))
            });
        self.close();
        result
    }

    fn release(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemPartition;

    const NAME: u16 = 0x0101;
    const LEVEL: u16 = 0x0102;

    fn store() -> PartitionConfigStore<MemPartition> {
        let config = Config::esp32();
        PartitionConfigStore::with_partition(MemPartition::new(), &config)
    }

    fn partition<R>(s: &PartitionConfigStore<MemPartition>, f: impl FnOnce(&mut MemPartition) -> R) -> R {
        s.with_backend(|b| f(b.service_mut())).unwrap()
    }

    #[test]
    fn test_param_key_format() {
        assert_eq!(param_key(ParamKind::String, 0x6f10), "00016f10");
        assert_eq!(param_key(ParamKind::Int64, 0x0001), "000c0001");
    }

    #[test]
    fn test_missing_namespace_reads_empty() {
        let s = store();
        assert!(!s.read());
        assert_eq!(s.version(), 0);
    }

    #[test]
    fn test_write_read_round_trip() {
        let s = store();
        s.set_string(NAME, "device").unwrap();
        s.set::<i32>(LEVEL, -5).unwrap();
        s.write().unwrap();
        assert!(!partition(&s, |p| p.is_open()));
        assert_eq!(s.version(), 1);

        let blob = partition(&s, |p| p.blob("kfcfw", &param_key(ParamKind::String, NAME)).map(<[u8]>::to_vec));
        assert_eq!(blob, Some(b"device\0".to_vec()));

        assert!(s.read());
        assert_eq!(s.get_string(NAME), "device");
        assert_eq!(s.get::<i32>(LEVEL), -5);
    }

    #[test]
    fn test_noop_write_leaves_blobs_identical() {
        let s = store();
        s.set::<u16>(LEVEL, 3).unwrap();
        s.write().unwrap();
        let before = partition(&s, |p| p.snapshot("kfcfw"));
        let commits = partition(&s, |p| p.commit_count());

        assert!(s.read());
        s.set::<u16>(LEVEL, 3).unwrap();
        s.write().unwrap();
        assert_eq!(partition(&s, |p| p.snapshot("kfcfw")), before);
        assert_eq!(partition(&s, |p| p.commit_count()), commits);
        assert_eq!(s.version(), 1);
    }

    #[test]
    fn test_only_changed_values_rewritten() {
        let s = store();
        s.set::<u16>(LEVEL, 1).unwrap();
        s.set_string(NAME, "a").unwrap();
        s.write().unwrap();

        assert!(s.read());
        s.set::<u16>(LEVEL, 2).unwrap();
        let blobs = partition(&s, |p| p.set_blob_count());
        s.write().unwrap();
        // one value plus table and header
        assert_eq!(partition(&s, |p| p.set_blob_count()), blobs + 3);
        assert_eq!(s.version(), 2);
        assert!(s.read());
        assert_eq!(s.get_string(NAME), "a");
        assert_eq!(s.get::<u16>(LEVEL), 2);
    }

    #[test]
    fn test_commit_failure_keeps_previous() {
        let s = store();
        s.set::<u16>(LEVEL, 1).unwrap();
        s.write().unwrap();

        s.set::<u16>(LEVEL, 2).unwrap();
        partition(&s, |p| p.set_fail_commit(Some(PartitionStatus::FAIL)));
        let err = s.write().unwrap_err();
        assert_eq!(err.code(), "NVS_COMMIT_ERROR");

        partition(&s, |p| p.set_fail_commit(None));
        assert!(s.read());
        assert_eq!(s.get::<u16>(LEVEL), 1);
    }

    #[test]
    fn test_set_blob_and_open_errors() {
        let s = store();
        s.set::<u8>(LEVEL, 1).unwrap();
        partition(&s, |p| p.set_fail_set_blob(Some(PartitionStatus::NOT_ENOUGH_SPACE)));
        let err = s.write().unwrap_err();
        assert_eq!(err, StoreError::Partition { op: PartitionOp::SetBlob, code: 0x1105 });

        partition(&s, |p| {
            p.set_fail_set_blob(None);
            p.set_fail_open(Some(PartitionStatus::FAIL));
        });
        assert_eq!(s.write().unwrap_err().code(), "NVS_OPEN");
    }

    #[test]
    fn test_erase() {
        let s = store();
        s.set::<u8>(LEVEL, 1).unwrap();
        s.write().unwrap();
        s.erase().unwrap();
        assert!(partition(&s, |p| p.snapshot("kfcfw").is_empty()));
        assert!(!s.read());
    }

    #[test]
    fn test_release_closes_handle() {
        let s = store();
        s.set::<u8>(LEVEL, 1).unwrap();
        s.write().unwrap();
        assert!(s.read());
        assert_eq!(s.get::<u8>(LEVEL), 1);
        assert!(partition(&s, |p| p.is_open()));
        s.release();
        assert!(!partition(&s, |p| p.is_open()));
    }
}
