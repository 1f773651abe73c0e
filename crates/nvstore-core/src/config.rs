//! Configuration management for nvstore
//!
//! Provides hardware presets for the supported targets and the knobs
//! shared by the retained-memory store and the configuration store.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Handles whose buffers survive `ConfigStore::release`
pub const DEFAULT_HOT_HANDLES: [u16; 4] = [0x6f10, 0x2531, 0x7ff7, 0xdb24];

/// nvstore configuration with hardware presets
///
/// Serializable so a host tool can keep the board description in a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Bytes of retained memory owned by the retained store
    pub retained_region_size: usize,
    /// Addressing granularity of the retained memory (bytes per block)
    pub retained_block_size: usize,
    /// First block of the retained region
    pub retained_base_block: usize,
    /// Start address of the configuration region in flash
    pub config_base_address: u32,
    /// Size of the configuration region (header + table + payload)
    pub config_region_size: usize,
    /// Erase granularity of the flash
    pub flash_sector_size: usize,
    /// Namespace used with the partition service
    pub partition_namespace: String,
    /// Handles exempt from `release()`
    pub hot_handles: Vec<u16>,
    /// Bounded wait for the store lock, `None` blocks indefinitely
    pub lock_timeout: Option<Duration>,
}

impl Config {
    /// ESP8266-class: 4-byte RTC blocks, user area at the top of 768 bytes,
    /// configuration in a raw flash sector.
    pub fn esp8266() -> Self {
        Self {
            retained_region_size: 256,
            retained_block_size: 4,
            retained_base_block: (768 - 256) / 4,
            config_base_address: 0x003F_A000,
            config_region_size: 4096,
            flash_sector_size: 4096,
            partition_namespace: "kfcfw".into(),
            hot_handles: DEFAULT_HOT_HANDLES.to_vec(),
            lock_timeout: None,
        }
    }

    /// ESP32-class: byte-addressed retained memory, configuration kept in
    /// the partition service.
    pub fn esp32() -> Self {
        Self {
            retained_region_size: 256,
            retained_block_size: 1,
            retained_base_block: 0,
            config_base_address: 0x0000_9000,
            config_region_size: 8192,
            flash_sector_size: 4096,
            partition_namespace: "kfcfw".into(),
            hot_handles: DEFAULT_HOT_HANDLES.to_vec(),
            lock_timeout: None,
        }
    }

    /// Desktop/test host: file-backed media at address zero.
    pub fn host() -> Self {
        Self {
            retained_region_size: 256,
            retained_block_size: 1,
            retained_base_block: 0,
            config_base_address: 0,
            config_region_size: 4096,
            flash_sector_size: 4096,
            partition_namespace: "nvstore".into(),
            hot_handles: DEFAULT_HOT_HANDLES.to_vec(),
            lock_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Retained store budget, header included
    pub fn with_retained_region(mut self, size: usize) -> Self {
        self.retained_region_size = size;
        self
    }

    pub fn with_config_region(mut self, base_address: u32, size: usize) -> Self {
        self.config_base_address = base_address;
        self.config_region_size = size;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_hot_handles(mut self, handles: &[u16]) -> Self {
        self.hot_handles = handles.to_vec();
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.retained_block_size, 1 | 2 | 4) {
            return Err("retained_block_size must be 1, 2 or 4".into());
        }
        if self.retained_region_size < 8 || self.retained_region_size > 512 {
            return Err("retained_region_size must be in [8, 512]".into());
        }
        if self.retained_region_size % 4 != 0 {
            return Err("retained_region_size must be a multiple of 4".into());
        }
        if self.flash_sector_size == 0 || !self.flash_sector_size.is_power_of_two() {
            return Err("flash_sector_size must be a power of two".into());
        }
        if self.config_region_size == 0 || self.config_region_size % self.flash_sector_size != 0 {
            return Err("config_region_size must be a non-zero multiple of flash_sector_size".into());
        }
        // header.length is a u16 covering table + payload
        if self.config_region_size > crate::format::CONFIG_HEADER_SIZE + u16::MAX as usize {
            return Err("config_region_size must fit a 16-bit length field".into());
        }
        if self.config_base_address as usize % self.flash_sector_size != 0 {
            return Err("config_base_address must be sector aligned".into());
        }
        if self.partition_namespace.is_empty() || self.partition_namespace.len() > 15 {
            return Err("partition_namespace must be 1..=15 bytes".into());
        }
        if let Some(timeout) = self.lock_timeout {
            if timeout.is_zero() {
                return Err("lock_timeout must be > 0 when set".into());
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::esp8266() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::esp8266().validate().is_ok());
        assert!(Config::esp32().validate().is_ok());
        assert!(Config::host().validate().is_ok());
    }

    #[test]
    fn test_esp8266_rtc_layout() {
        let c = Config::esp8266();
        assert_eq!(c.retained_base_block, 128);
        assert_eq!(c.retained_base_block * c.retained_block_size + c.retained_region_size, 768);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut c = Config::host();
        c.retained_block_size = 3;
        assert!(c.validate().is_err());

        let c = Config::host().with_config_region(0x100, 4096);
        assert!(c.validate().is_err());

        let c = Config::host().with_lock_timeout(Some(Duration::ZERO));
        assert!(c.validate().is_err());

        let c = Config::host().with_config_region(0, 4096 * 17);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let c = Config::esp32().with_hot_handles(&[0x0001]);
        let text = serde_json::to_string(&c).unwrap();
        assert!(text.contains("\"partition_namespace\":\"kfcfw\""));
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back, c);
    }
}
