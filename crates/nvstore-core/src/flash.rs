//! Raw flash backend
//!
//! The configuration image lives in one erase unit at a fixed address. A
//! write assembles the complete new image in RAM, erases the region and
//! programs header, table and payload in that order.
//!
//! Once the erase has happened there is no copy of the old image left: a
//! failed program step leaves the region invalid and the next `read()`
//! starts empty. Everything that can fail without touching the medium
//! (header read, allocation, copy-forward of unchanged values, size check)
//! is done before the erase.

use log::{debug, error};

use crate::backend::FlashRegion;
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::format::{
    encode_table, parse_table, ConfigHeader, ParamHeader, CONFIG_HEADER_SIZE, PARAM_HEADER_SIZE,
};
use crate::param::{ParamDescriptor, ParamKind};
use crate::store::{persisted, ConfigBackend, ConfigStore, StoredTable};

/// Configuration store on raw flash
pub type FlashConfigStore<F> = ConfigStore<FlashBackend<F>>;

pub struct FlashBackend<F: FlashRegion> {
    flash: F,
    base: u32,
    region_size: usize,
}

impl<F: FlashRegion> FlashBackend<F> {
    pub fn new(flash: F, config: &Config) -> Self {
        Self {
            flash,
            base: config.config_base_address,
            region_size: config.config_region_size,
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn address(&self, offset: usize) -> u32 {
        self.base + offset as u32
    }

    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> StoreResult<()> {
        let address = self.address(offset);
        self.flash
            .read(address, buf)
            .map_err(|source| StoreError::ReadFailure { address, source })
    }

    fn program(&mut self, offset: usize, data: &[u8]) -> StoreResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let address = self.address(offset);
        self.flash.write(address, data).map_err(|source| {
            error!("flash write at 0x{:08x} failed after erase, configuration lost", address);
            StoreError::WriteFailure { address, source }
        })
    }
}

impl<F: FlashRegion> FlashConfigStore<F> {
    pub fn with_flash(flash: F, config: &Config) -> Self {
        ConfigStore::new(FlashBackend::new(flash, config), config)
    }
}

impl<F: FlashRegion> ConfigBackend for FlashBackend<F> {
    fn name(&self) -> &'static str {
        "flash"
    }

    fn read_header(&mut self) -> StoreResult<Option<ConfigHeader>> {
        let mut raw = [0u8; CONFIG_HEADER_SIZE];
        self.read_at(0, &mut raw)?;
        let header = ConfigHeader::from_bytes(&raw);
        Ok(header.has_magic().then_some(header))
    }

    fn load(&mut self) -> StoreResult<StoredTable> {
        let header = self.read_header()?.ok_or_else(|| StoreError::ValidationFailure {
            reason: "no configuration header".into(),
        })?;
        header
            .check_bounds(self.region_size)
            .map_err(|reason| StoreError::ValidationFailure { reason })?;

        let mut body = vec![0u8; header.length as usize];
        self.read_at(CONFIG_HEADER_SIZE, &mut body)?;
        header
            .validate(&body, self.region_size)
            .map_err(|reason| StoreError::ValidationFailure { reason })?;

        let table = parse_table(&body, header.param_count as usize)
            .map_err(|reason| StoreError::ValidationFailure { reason })?;
        let end = CONFIG_HEADER_SIZE + header.length as usize;
        let mut offset = CONFIG_HEADER_SIZE + header.table_len();
        let mut params = Vec::with_capacity(table.len());
        for ph in table {
            let storage = ParamKind::from_u8(ph.kind)
                .map_or(ph.length as usize, |kind| kind.storage_size(ph.length as usize));
            if storage > ph.stride as usize || offset + ph.stride as usize > end {
                return Err(StoreError::ValidationFailure {
                    reason: format!(
                        "parameter 0x{:04x} at offset {} stride {} exceeds image",
                        ph.handle, offset, ph.stride
                    ),
                });
            }
            params.push((ph, offset));
            offset += ph.stride as usize;
        }
        Ok(StoredTable { header, params })
    }

    fn read_value(&mut self, param: &ParamDescriptor) -> StoreResult<Vec<u8>> {
        let offset = param.offset().ok_or_else(|| StoreError::ValidationFailure {
            reason: format!("parameter 0x{:04x} is not stored", param.handle()),
        })?;
        let mut buf = vec![0u8; param.stored_length()];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn store(&mut self, params: &[ParamDescriptor], version: u32) -> StoreResult<()> {
        let entries: Vec<(&ParamDescriptor, ParamHeader)> =
            persisted(params).map(|d| (d, d.next_header())).collect();

        let table_len = entries.len() * PARAM_HEADER_SIZE;
        let data_len: usize = entries.iter().map(|(_, h)| h.stride as usize).sum();
        let required = CONFIG_HEADER_SIZE + table_len + data_len;
        if required > self.region_size {
            return Err(StoreError::CapacityExceeded {
                required,
                capacity: self.region_size,
            });
        }

        let mut body = Vec::new();
        body.try_reserve_exact(table_len + data_len)
            .map_err(|_| StoreError::AllocationFailure { requested: table_len + data_len })?;
        let headers: Vec<ParamHeader> = entries.iter().map(|(_, h)| *h).collect();
        body.extend_from_slice(&encode_table(&headers));

        for (param, header) in &entries {
            let start = body.len();
            body.resize(start + header.stride as usize, 0);
            match param.pending() {
                Some(value) => body[start..start + value.len()].copy_from_slice(value),
                None => {
                    // unchanged: copy forward from the current image
                    let Some(old_offset) = param.offset() else {
                        continue;
                    };
                    let n = (header.stride as usize).min(param.stored_stride());
                    let address = self.address(old_offset);
                    self.flash
                        .read(address, &mut body[start..start + n])
                        .map_err(|source| StoreError::ReadPreviousFailure {
                            handle: param.handle(),
                            source,
                        })?;
                }
            }
        }

        let header = ConfigHeader::new(version, entries.len() as u16, &body);
        debug!(
            "flash write version={} params={} length={} crc=0x{:08x}",
            version, header.param_count, header.length, header.crc
        );

        self.flash
            .erase(self.base, self.region_size)
            .map_err(|source| StoreError::EraseFailure { address: self.base, source })?;
        self.program(0, &header.to_bytes())?;
        self.program(CONFIG_HEADER_SIZE, &body[..table_len])?;
        self.program(CONFIG_HEADER_SIZE + table_len, &body[table_len..])?;
        Ok(())
    }

    fn erase(&mut self) -> StoreResult<()> {
        self.flash
            .erase(self.base, self.region_size)
            .map_err(|source| StoreError::EraseFailure { address: self.base, source })
    }
}
