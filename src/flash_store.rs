//! Flash-backed record storage
//!
//! Each record owns one 4 KiB sector starting at `config::FLASH_RECORD_BASE`.
//! A sector starts with an 8-byte header (`magic`, `len`, little endian)
//! followed by the record bytes. Anything without the magic is absent.

use crate::BoardError;
use crate::store::{RecordKey, RecordStorage};
use alloc::vec;
use alloc::vec::Vec;
use embedded_storage::{ReadStorage, Storage};
use esp_storage::FlashStorage;
use log::{debug, warn};

const SECTOR_SIZE: u32 = 4096;
const HEADER_LEN: usize = 8;
const RECORD_MAGIC: u32 = 0x534F_494C;

/// Largest record a sector can hold
pub const MAX_RECORD_LEN: usize = SECTOR_SIZE as usize - HEADER_LEN;

pub struct FlashRecordStorage {
    flash: FlashStorage,
    base: u32,
}

impl FlashRecordStorage {
    pub fn new(flash: FlashStorage, base: u32) -> Self {
        Self { flash, base }
    }

    fn offset(&self, key: RecordKey) -> u32 {
        self.base + key.slot() * SECTOR_SIZE
    }

    /// Record length, `None` when the sector holds no record
    fn header(&mut self, key: RecordKey) -> Result<Option<usize>, BoardError> {
        let mut header = [0u8; HEADER_LEN];
        self.flash
            .read(self.offset(key), &mut header)
            .map_err(|_| BoardError::IoError)?;

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != RECORD_MAGIC {
            return Ok(None);
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_RECORD_LEN {
            warn!("[STORE] {} header claims {} bytes", key.path(), len);
            return Err(BoardError::StructuralParseError);
        }
        Ok(Some(len))
    }
}

impl RecordStorage for FlashRecordStorage {
    fn read(&mut self, key: RecordKey) -> Result<Option<Vec<u8>>, BoardError> {
        let Some(len) = self.header(key)? else {
            return Ok(None);
        };

        let mut data = vec![0u8; len];
        if len > 0 {
            self.flash
                .read(self.offset(key) + HEADER_LEN as u32, &mut data)
                .map_err(|_| BoardError::IoError)?;
        }
        Ok(Some(data))
    }

    fn write(&mut self, key: RecordKey, data: &[u8]) -> Result<(), BoardError> {
        if data.len() > MAX_RECORD_LEN {
            warn!("[STORE] {} bytes do not fit {}", data.len(), key.path());
            return Err(BoardError::IoError);
        }

        let mut sector = Vec::with_capacity(HEADER_LEN + data.len());
        sector.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        sector.extend_from_slice(&(data.len() as u32).to_le_bytes());
        sector.extend_from_slice(data);

        self.flash
            .write(self.offset(key), &sector)
            .map_err(|_| BoardError::IoError)?;
        debug!("[STORE] Wrote {} bytes to {}", data.len(), key.path());
        Ok(())
    }

    fn remove(&mut self, key: RecordKey) -> Result<bool, BoardError> {
        match self.header(key) {
            Ok(None) => return Ok(false),
            Ok(Some(_)) | Err(BoardError::StructuralParseError) => {}
            Err(e) => return Err(e),
        }
        self.flash
            .write(self.offset(key), &[0xFF; HEADER_LEN])
            .map_err(|_| BoardError::IoError)?;
        Ok(true)
    }
}
