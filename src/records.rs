//! Persisted record types
//!
//! Each record knows how to turn itself into the lines written to its store
//! entry and back. Line decoding is strict: a record with the wrong number of
//! lines or an empty field is a structural error, never a partial value.

use crate::BoardError;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// WiFi network the node joins in station mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, BoardError> {
        if ssid.is_empty() || password.is_empty() {
            return Err(BoardError::StructuralParseError);
        }
        Ok(Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }

    /// Decode the session record: ssid, password
    pub fn from_lines(lines: &[String]) -> Result<Self, BoardError> {
        match lines {
            [ssid, password] => Self::new(ssid, password),
            _ => Err(BoardError::StructuralParseError),
        }
    }

    pub fn to_lines(&self) -> Vec<String> {
        alloc::vec![self.ssid.clone(), self.password.clone()]
    }
}

/// User identity bound to this node
///
/// `id` is the correlation token of the request that carries the identity.
/// It is assigned per attempt and is not part of the persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub id: String,
    pub name: String,
    pub password: String,
    pub serial_code: String,
    pub cpf: String,
}

impl UserEntry {
    /// Number of lines in the persisted record
    pub const FIELD_COUNT: usize = 4;

    pub fn new(name: &str, password: &str, serial_code: &str, cpf: &str) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            password: password.to_string(),
            serial_code: serial_code.to_string(),
            cpf: cpf.to_string(),
        }
    }

    /// Decode the entry record: cpf, name, password, serialCode
    pub fn from_lines(lines: &[String]) -> Result<Self, BoardError> {
        let [cpf, name, password, serial_code] = lines else {
            return Err(BoardError::StructuralParseError);
        };
        if [cpf, name, password, serial_code].iter().any(|f| f.is_empty()) {
            return Err(BoardError::StructuralParseError);
        }
        Ok(Self::new(name, password, serial_code, cpf))
    }

    pub fn to_lines(&self) -> Vec<String> {
        alloc::vec![
            self.cpf.clone(),
            self.name.clone(),
            self.password.clone(),
            self.serial_code.clone(),
        ]
    }

    /// Same identity, tagged with the token of a new request
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }
}

/// One sensor type bound to this node and the id the broker assigned to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorType {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

/// Ordered set of sensor bindings, unique by type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorCredentials {
    entries: Vec<SensorType>,
}

impl SensorCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding. A type that is already present keeps its position and
    /// takes the new id.
    pub fn insert(&mut self, kind: &str, id: &str) {
        match self.entries.iter_mut().find(|e| e.kind == kind) {
            Some(existing) => existing.id = id.to_string(),
            None => self.entries.push(SensorType {
                kind: kind.to_string(),
                id: id.to_string(),
            }),
        }
    }

    pub fn get(&self, kind: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorType> {
        self.entries.iter()
    }

    /// Decode the typing record: one JSON array line
    pub fn from_lines(lines: &[String]) -> Result<Self, BoardError> {
        let [line] = lines else {
            return Err(BoardError::StructuralParseError);
        };
        let decoded: Vec<SensorType> =
            serde_json::from_str(line).map_err(|_| BoardError::StructuralParseError)?;

        let mut credentials = Self::new();
        for entry in &decoded {
            if entry.kind.is_empty() {
                return Err(BoardError::StructuralParseError);
            }
            credentials.insert(&entry.kind, &entry.id);
        }
        Ok(credentials)
    }

    pub fn to_lines(&self) -> Result<Vec<String>, BoardError> {
        let line = serde_json::to_string(&self.entries).map_err(|_| BoardError::IoError)?;
        Ok(alloc::vec![line])
    }
}
