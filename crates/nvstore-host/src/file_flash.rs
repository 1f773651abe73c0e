//! Flash region backed by an image file
//!
//! The file holds the region byte for byte. Programming ANDs into the
//! existing contents and erasing fills whole sectors with 0xFF, so the
//! configuration store sees the same medium semantics as on a device.
//! Every write and erase is synced before it returns.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;

use nvstore_core::backend::FlashRegion;
use nvstore_core::{Config, MediumError};

use crate::platform_durability::durable_sync;

pub struct FileFlash {
    file: File,
    path: PathBuf,
    base: u32,
    size: usize,
    sector_size: usize,
}

impl FileFlash {
    /// Open the image for the configuration region of `config`,
    /// creating it erased when missing.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> Result<Self, MediumError> {
        Self::open_region(
            path,
            config.config_base_address,
            config.config_region_size,
            config.flash_sector_size,
        )
    }

    /// Open an image covering `[base, base + size)`. A shorter file is
    /// extended with erased sectors.
    pub fn open_region(
        path: impl AsRef<Path>,
        base: u32,
        size: usize,
        sector_size: usize,
    ) -> Result<Self, MediumError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let current = file.metadata()?.len() as usize;
        if current < size {
            file.seek(SeekFrom::Start(current as u64))?;
            file.write_all(&vec![0xFF; size - current])?;
            durable_sync(&file)?;
            debug!("flash image {} extended from {} to {} bytes", path.display(), current, size);
        }

        Ok(Self { file, path, base, size, sector_size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn position(&self, address: u32, len: usize) -> Result<u64, MediumError> {
        let out_of_bounds = MediumError::OutOfBounds { address, len, capacity: self.size };
        let start = address.checked_sub(self.base).ok_or(out_of_bounds.clone())? as usize;
        if start + len > self.size {
            return Err(out_of_bounds);
        }
        Ok(start as u64)
    }

    fn read_raw(&mut self, position: u64, buf: &mut [u8]) -> Result<(), MediumError> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_raw(&mut self, position: u64, data: &[u8]) -> Result<(), MediumError> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(data)?;
        durable_sync(&self.file)?;
        Ok(())
    }
}

impl FlashRegion for FileFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), MediumError> {
        let position = self.position(address, buf.len())?;
        self.read_raw(position, buf)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MediumError> {
        let position = self.position(address, data.len())?;
        let mut cells = vec![0u8; data.len()];
        self.read_raw(position, &mut cells)?;
        for (cell, byte) in cells.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.write_raw(position, &cells)
    }

    fn erase(&mut self, address: u32, size: usize) -> Result<(), MediumError> {
        let position = self.position(address, size)?;
        if position as usize % self.sector_size != 0 || size % self.sector_size != 0 {
            return Err(MediumError::Unaligned { address, sector_size: self.sector_size });
        }
        self.write_raw(position, &vec![0xFF; size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn image(dir: &TempDir) -> FileFlash {
        FileFlash::open_region(dir.path().join("flash.bin"), 0x9000, 8192, 4096).unwrap()
    }

    #[test]
    fn test_new_image_is_erased() {
        let dir = TempDir::new().unwrap();
        let mut flash = image(&dir);
        let mut buf = [0u8; 16];
        flash.read(0x9000 + 8176, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
        assert_eq!(std::fs::metadata(flash.path()).unwrap().len(), 8192);
    }

    #[test]
    fn test_program_clears_bits_only() {
        let dir = TempDir::new().unwrap();
        let mut flash = image(&dir);
        flash.write(0x9010, &[0x0F, 0xF0]).unwrap();
        flash.write(0x9010, &[0xFF, 0x3C]).unwrap();
        let mut buf = [0u8; 2];
        flash.read(0x9010, &mut buf).unwrap();
        assert_eq!(buf, [0x0F, 0x30]);

        flash.erase(0x9000, 4096).unwrap();
        flash.read(0x9010, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF]);
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut flash = image(&dir);
            flash.write(0x9000, b"persist").unwrap();
        }
        let mut flash = image(&dir);
        let mut buf = [0u8; 7];
        flash.read(0x9000, &mut buf).unwrap();
        assert_eq!(&buf, b"persist");
    }

    #[test]
    fn test_bounds_and_alignment() {
        let dir = TempDir::new().unwrap();
        let mut flash = image(&dir);
        let mut buf = [0u8; 4];
        assert!(matches!(flash.read(0x8FFF, &mut buf), Err(MediumError::OutOfBounds { .. })));
        assert!(matches!(flash.write(0x9000 + 8190, &buf), Err(MediumError::OutOfBounds { .. })));
        assert!(matches!(flash.erase(0x9100, 4096), Err(MediumError::Unaligned { .. })));
        assert!(matches!(flash.erase(0x9000, 100), Err(MediumError::Unaligned { .. })));
    }
}
