//! Persistent record store
//!
//! Line-oriented access to the four records the provisioning flow keeps
//! across boots. The raw blobs live behind [`RecordStorage`] so the same
//! store runs on flash on the device and in memory in tests.

use crate::BoardError;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::{debug, warn};

/// Logical record names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordKey {
    /// WiFi credentials
    WifiSession,
    /// Correlation id of the last successful binding
    SelfBinding,
    /// User identity
    UserEntry,
    /// Sensor credential set
    Typing,
}

impl RecordKey {
    pub const ALL: [RecordKey; 4] = [
        RecordKey::WifiSession,
        RecordKey::SelfBinding,
        RecordKey::UserEntry,
        RecordKey::Typing,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            RecordKey::WifiSession => "/cache/session.txt",
            RecordKey::SelfBinding => "/cache/self.txt",
            RecordKey::UserEntry => "/cache/entry.txt",
            RecordKey::Typing => "/cache/typing.txt",
        }
    }

    /// Position of the record in a fixed-slot backend
    pub fn slot(&self) -> u32 {
        match self {
            RecordKey::WifiSession => 0,
            RecordKey::SelfBinding => 1,
            RecordKey::UserEntry => 2,
            RecordKey::Typing => 3,
        }
    }
}

/// Raw blob backend
pub trait RecordStorage {
    /// `Ok(None)` when the record does not exist
    fn read(&mut self, key: RecordKey) -> Result<Option<Vec<u8>>, BoardError>;

    /// Replace the record content, creating it if needed
    fn write(&mut self, key: RecordKey, data: &[u8]) -> Result<(), BoardError>;

    /// Returns whether a record was removed
    fn remove(&mut self, key: RecordKey) -> Result<bool, BoardError>;
}

/// RAM backend
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    records: BTreeMap<RecordKey, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStorage for MemoryStorage {
    fn read(&mut self, key: RecordKey) -> Result<Option<Vec<u8>>, BoardError> {
        Ok(self.records.get(&key).cloned())
    }

    fn write(&mut self, key: RecordKey, data: &[u8]) -> Result<(), BoardError> {
        self.records.insert(key, data.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: RecordKey) -> Result<bool, BoardError> {
        Ok(self.records.remove(&key).is_some())
    }
}

/// Line-oriented view over a [`RecordStorage`]
pub struct RecordStore<S: RecordStorage> {
    storage: S,
}

impl<S: RecordStorage> RecordStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// True when the record is absent, zero-length or cannot be read
    pub fn is_empty(&mut self, key: RecordKey) -> bool {
        match self.storage.read(key) {
            Ok(Some(data)) => data.is_empty(),
            Ok(None) => true,
            Err(e) => {
                warn!("[STORE] Cannot open {}: {}", key.path(), e);
                true
            }
        }
    }

    pub fn exists(&mut self, key: RecordKey) -> bool {
        matches!(self.storage.read(key), Ok(Some(_)))
    }

    /// Read the record split on `separator`
    ///
    /// One trailing `\r` is stripped from each line and the empty tail after a
    /// final separator is not reported as a line.
    pub fn read_lines(&mut self, key: RecordKey, separator: char) -> Result<Vec<String>, BoardError> {
        let data = self.storage.read(key)?.ok_or(BoardError::NotFound)?;
        let text = core::str::from_utf8(&data).map_err(|_| BoardError::StructuralParseError)?;

        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut lines: Vec<String> = text
            .split(separator)
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect();
        if text.ends_with(separator) {
            lines.pop();
        }

        debug!("[STORE] Read {} lines from {}", lines.len(), key.path());
        Ok(lines)
    }

    /// Write each line `\n`-terminated, replacing or extending the record
    pub fn write_lines<L: AsRef<str>>(
        &mut self,
        key: RecordKey,
        lines: &[L],
        append: bool,
    ) -> Result<(), BoardError> {
        let mut data = if append {
            self.storage.read(key)?.unwrap_or_default()
        } else {
            Vec::new()
        };

        for line in lines {
            data.extend_from_slice(line.as_ref().as_bytes());
            data.push(b'\n');
        }

        self.storage.write(key, &data)?;
        debug!("[STORE] Wrote {} lines to {}", lines.len(), key.path());
        Ok(())
    }

    /// Truncate the record to zero length
    pub fn clear(&mut self, key: RecordKey) -> Result<(), BoardError> {
        if self.storage.read(key)?.is_none() {
            return Err(BoardError::NotFound);
        }
        self.storage.write(key, &[])?;
        debug!("[STORE] Cleared {}", key.path());
        Ok(())
    }

    pub fn delete(&mut self, key: RecordKey) -> Result<(), BoardError> {
        if self.storage.remove(key)? {
            debug!("[STORE] Deleted {}", key.path());
            Ok(())
        } else {
            Err(BoardError::NotFound)
        }
    }

    /// Create an empty record
    pub fn create(&mut self, key: RecordKey) -> Result<(), BoardError> {
        match self.storage.read(key)? {
            Some(data) if !data.is_empty() => Err(BoardError::AlreadyExists),
            Some(_) => Ok(()),
            None => self.storage.write(key, &[]),
        }
    }
}
