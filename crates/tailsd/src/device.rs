//! Device records and identity helpers.

use strum::AsRefStr;
use strum::Display;
use strum::EnumString;

use crate::transport::Handle;

/// A peripheral managed by tailsd.
///
/// `id`, `name`, `enabled` and `event` are persisted; `online` and `transport` are runtime
/// state owned by the device's connection supervisor and are never written to disk.
#[derive(Debug, Clone)]
pub struct Device {
    /// Normalized transport address, unique key
    pub id: String,

    /// User-editable display label
    pub name: String,

    /// Whether a connection should be maintained
    pub enabled: bool,

    /// Name of the external event this device reacts to, empty when unbound
    pub event: String,

    /// True while a heartbeat-confirmed connection exists
    pub online: bool,

    /// Active connection, if any
    pub transport: Option<Handle>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            event: String::new(),
            online: false,
            transport: None,
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Presentation label derived from the current state
    pub fn status(&self) -> DeviceStatus {
        if !self.enabled {
            DeviceStatus::Disabled
        } else if self.online {
            DeviceStatus::Online
        } else {
            DeviceStatus::Pending
        }
    }

    /// Drop runtime state, leaving only the persisted fields
    pub(crate) fn reset_runtime(&mut self) {
        self.online = false;
        self.transport = None;
    }
}

/// Status label shown next to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
pub enum DeviceStatus {
    Online,
    Offline,
    Malfunction,
    Disabled,
    Pending,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeviceIdError {
    #[error("device address is empty")]
    Empty,

    #[error("'{0}' is neither a MAC address nor a UUID")]
    Malformed(String),
}

/// Normalize a platform-specific transport address.
///
/// MAC addresses (Linux/Windows) are upper-cased with `:` separators; UUIDs (macOS) are
/// kept whole and lower-cased, since the transport needs the full identifier to connect.
pub fn parse_device_id(raw: &str) -> Result<String, DeviceIdError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DeviceIdError::Empty);
    }

    if is_mac(raw) {
        return Ok(raw.replace('-', ":").to_ascii_uppercase());
    }

    if is_uuid(raw) {
        return Ok(raw.to_ascii_lowercase());
    }

    Err(DeviceIdError::Malformed(raw.to_string()))
}

fn is_mac(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if bytes.len() != 17 {
        return false;
    }
    let sep = bytes[2];
    if sep != b':' && sep != b'-' {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| {
        if i % 3 == 2 {
            *b == sep
        } else {
            b.is_ascii_hexdigit()
        }
    })
}

fn is_uuid(raw: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    let parts: Vec<&str> = raw.split('-').collect();
    parts.len() == GROUPS.len()
        && parts
            .iter()
            .zip(GROUPS)
            .all(|(part, len)| part.len() == len && part.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// First free auto-generated label: "Device A" through "Device Z", then "Device <count+1>".
pub fn next_device_name(taken: impl Fn(&str) -> bool, count: usize) -> String {
    ('A'..='Z')
        .map(|letter| format!("Device {}", letter))
        .find(|name| !taken(name))
        .unwrap_or_else(|| format!("Device {}", count + 1))
}
