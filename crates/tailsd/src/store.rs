//! JSON file holding the persisted device list.

use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::device::Device;

/// Persisted subset of a [`Device`]. Missing fields default to empty/false.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub event: String,
}

impl From<&Device> for DeviceRecord {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            enabled: device.enabled,
            event: device.event.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read {}: {}", .0.display(), .1)]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] serde_json::Error),

    #[error("Failed to write {}: {}", .0.display(), .1)]
    Write(PathBuf, #[source] std::io::Error),

    #[error("Failed to serialize device list: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// File-backed device list
#[derive(Debug, Clone)]
pub struct DeviceStore {
    path: PathBuf,
}

impl DeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the device list. A missing file is an empty list.
    pub fn load(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Read(self.path.clone(), e)),
        };

        serde_json::from_slice(&data).map_err(|e| StoreError::Parse(self.path.clone(), e))
    }

    /// Write the device list, replacing the file atomically
    pub fn save(&self, records: &[DeviceRecord]) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(records)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, data).map_err(|e| StoreError::Write(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Write(self.path.clone(), e))
    }
}
