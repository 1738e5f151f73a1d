//! Shared device registry.
//!
//! Every read and mutation of the device list goes through [`Registry`]. All accessors take
//! one registry-wide lock for the in-memory update only; transport I/O (disconnects in
//! particular) always happens after the lock is released.

use std::sync::Mutex;
use std::sync::MutexGuard;

use tracing::debug;
use tracing::info;

use crate::console::Console;
use crate::device;
use crate::device::Device;
use crate::device::parse_device_id;
use crate::store::DeviceRecord;
use crate::store::DeviceStore;
use crate::store::StoreError;
use crate::transport::Handle;

/// A device an event should be written to
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub name: String,
    pub handle: Handle,
}

#[derive(Debug, Default)]
pub struct Registry {
    devices: Mutex<Vec<Device>>,
    store: Option<DeviceStore>,
}

impl Registry {
    /// In-memory registry without persistence
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: DeviceStore) -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            store: Some(store),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Device>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_device<R>(&self, id: &str, f: impl FnOnce(&mut Device) -> R) -> Option<R> {
        self.lock().iter_mut().find(|d| d.id == id).map(f)
    }

    /// Snapshot of every device. Later mutations are not reflected in the copies.
    pub fn all(&self) -> Vec<Device> {
        self.lock().clone()
    }

    pub fn find(&self, id: &str) -> Option<Device> {
        self.lock().iter().find(|d| d.id == id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Device> {
        self.lock().iter().find(|d| d.name == name).cloned()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().iter().any(|d| d.id == id)
    }

    /// False for unknown devices
    pub fn is_enabled(&self, id: &str) -> bool {
        self.with_device(id, |d| d.enabled).unwrap_or(false)
    }

    /// Insert `device` unless its id is already present. Returns whether it was inserted.
    pub fn add(&self, mut device: Device) -> bool {
        let mut devices = self.lock();
        if devices.iter().any(|d| d.id == device.id) {
            return false;
        }
        device.reset_runtime();
        devices.push(device);
        true
    }

    /// Register a newly discovered address under the next free auto-generated name.
    ///
    /// Returns the assigned name, or `None` if the address is already registered.
    pub fn adopt(&self, id: &str) -> Option<String> {
        let mut devices = self.lock();
        if devices.iter().any(|d| d.id == id) {
            return None;
        }
        let name = device::next_device_name(
            |name| devices.iter().any(|d| d.name == name),
            devices.len(),
        );
        devices.push(Device::new(id, name.clone()));
        Some(name)
    }

    /// Remove a device, disconnecting its transport first if it has one.
    ///
    /// Removing an unknown id is a no-op. The device's supervisor observes the removal as a
    /// disable and exits.
    pub async fn remove(&self, id: &str) -> Option<Device> {
        let mut device = {
            let mut devices = self.lock();
            let index = devices.iter().position(|d| d.id == id)?;
            devices.remove(index)
        };

        if let Some(handle) = device.transport.take() {
            handle.disconnect().await;
        }
        device.reset_runtime();
        info!("Removed device {} ({})", device.name, device.id);
        Some(device)
    }

    /// Attach an open connection. Returns false (and stores nothing) for unknown devices.
    pub fn set_transport(&self, id: &str, handle: Handle) -> bool {
        self.with_device(id, |d| d.transport = Some(handle)).is_some()
    }

    /// Detach the device's connection and mark it offline, returning the handle so the
    /// caller can disconnect it outside the lock
    pub fn clear_transport(&self, id: &str) -> Option<Handle> {
        self.with_device(id, |d| {
            d.online = false;
            d.transport.take()
        })
        .flatten()
    }

    /// Set the online flag. Going online requires an attached transport; otherwise the
    /// call is ignored and false is returned.
    pub fn set_online(&self, id: &str, online: bool) -> bool {
        self.with_device(id, |d| {
            if online && d.transport.is_none() {
                debug!("Ignoring online=true for {} without a transport", d.id);
                return false;
            }
            d.online = online;
            true
        })
        .unwrap_or(false)
    }

    /// Returns false for unknown devices
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        self.with_device(id, |d| d.enabled = enabled).is_some()
    }

    pub fn set_name(&self, id: &str, name: &str) -> bool {
        self.with_device(id, |d| d.name = name.to_string()).is_some()
    }

    pub fn set_event(&self, id: &str, event: &str) -> bool {
        self.with_device(id, |d| d.event = event.to_string()).is_some()
    }

    /// Devices that should receive `event`: enabled, online, bound to it, with a transport
    pub fn routes_for(&self, event: &str) -> Vec<Route> {
        if event.is_empty() {
            return Vec::new();
        }

        self.lock()
            .iter()
            .filter(|d| d.enabled && d.online && d.event == event)
            .filter_map(|d| {
                d.transport.as_ref().map(|handle| Route {
                    id: d.id.clone(),
                    name: d.name.clone(),
                    handle: handle.clone(),
                })
            })
            .collect()
    }

    /// Detach every connection and mark every device offline
    pub fn release_all_transports(&self) -> Vec<Handle> {
        self.lock()
            .iter_mut()
            .filter_map(|d| {
                d.online = false;
                d.transport.take()
            })
            .collect()
    }

    pub fn next_device_name(&self) -> String {
        let devices = self.lock();
        device::next_device_name(
            |name| devices.iter().any(|d| d.name == name),
            devices.len(),
        )
    }

    /// Replace the device list with the persisted one.
    ///
    /// Errors are reported to `console` and leave the list empty. Records with malformed
    /// or duplicate ids are skipped and reported. Stored fields are kept as written.
    /// Returns the number of devices loaded.
    pub fn load(&self, console: &dyn Console) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let records = match store.load() {
            Ok(records) => records,
            Err(e) => {
                console.append(&format!("Failed to load devices: {}", e));
                self.lock().clear();
                return 0;
            }
        };

        let mut devices = Vec::with_capacity(records.len());
        for record in records {
            let id = match parse_device_id(&record.id) {
                Ok(id) => id,
                Err(e) => {
                    console.append(&format!("Skipping stored device '{}': {}", record.name, e));
                    continue;
                }
            };
            if devices.iter().any(|d: &Device| d.id == id) {
                console.append(&format!(
                    "Skipping stored device '{}': duplicate id {}",
                    record.name, id
                ));
                continue;
            }

            devices.push(
                Device::new(id, record.name)
                    .with_enabled(record.enabled)
                    .with_event(record.event),
            );
        }

        let loaded = devices.len();
        *self.lock() = devices;
        info!("Loaded {} devices from {}", loaded, store.path().display());
        loaded
    }

    /// Persist the four stored fields of every device. A registry without a store
    /// saves nothing.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let records: Vec<DeviceRecord> = self.lock().iter().map(DeviceRecord::from).collect();
        store.save(&records)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::console::RecordingConsole;
    use crate::transport::sim::SimTransport;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    async fn connected(registry: &Registry, sim: &SimTransport, id: &str) -> Handle {
        let handle = Handle::open(sim, id, Duration::from_secs(10)).await.unwrap();
        assert!(registry.set_transport(id, handle.clone()));
        assert!(registry.set_online(id, true));
        handle
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = Registry::new();
        assert!(registry.add(Device::new(ADDR, "Device A")));
        assert!(!registry.add(Device::new(ADDR, "Other")));

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.find(ADDR).unwrap().name, "Device A");
    }

    #[test]
    fn test_adopt_picks_next_free_name() {
        let registry = Registry::new();
        registry.add(Device::new("AA:BB:CC:DD:EE:09", "Device A"));

        assert_eq!(registry.adopt(ADDR).as_deref(), Some("Device B"));
        assert_eq!(registry.adopt(ADDR), None);
        assert_eq!(registry.find_by_name("Device B").unwrap().id, ADDR);
    }

    #[test]
    fn test_online_requires_transport() {
        let registry = Registry::new();
        registry.add(Device::new(ADDR, "Device A"));

        assert!(!registry.set_online(ADDR, true));
        assert!(!registry.find(ADDR).unwrap().online);
        assert!(!registry.set_online("AA:BB:CC:DD:EE:02", false));
    }

    #[tokio::test]
    async fn test_remove_disconnects_and_is_idempotent() {
        let sim = SimTransport::new();
        sim.add_peripheral(ADDR, "TouchyTails");
        let registry = Registry::new();
        registry.add(Device::new(ADDR, "Device A"));
        connected(&registry, &sim, ADDR).await;
        assert_eq!(sim.live_connections(ADDR), 1);

        let removed = registry.remove(ADDR).await.unwrap();
        assert!(!removed.online);
        assert!(removed.transport.is_none());
        assert_eq!(sim.live_connections(ADDR), 0);

        assert!(registry.remove(ADDR).await.is_none());
        assert!(!registry.exists(ADDR));
    }

    #[tokio::test]
    async fn test_clear_transport_marks_offline() {
        let sim = SimTransport::new();
        sim.add_peripheral(ADDR, "TouchyTails");
        let registry = Registry::new();
        registry.add(Device::new(ADDR, "Device A"));
        connected(&registry, &sim, ADDR).await;

        let handle = registry.clear_transport(ADDR).unwrap();
        handle.disconnect().await;
        let device = registry.find(ADDR).unwrap();
        assert!(!device.online);
        assert!(device.transport.is_none());

        assert!(registry.clear_transport(ADDR).is_none());
    }

    #[tokio::test]
    async fn test_routes_for_filters_devices() {
        let sim = SimTransport::new();
        let registry = Registry::new();
        let ids = [
            "AA:BB:CC:DD:EE:01",
            "AA:BB:CC:DD:EE:02",
            "AA:BB:CC:DD:EE:03",
            "AA:BB:CC:DD:EE:04",
        ];
        for id in ids {
            sim.add_peripheral(id, "TouchyTails");
        }

        // Online and bound
        registry.add(Device::new(ids[0], "A").with_event("Touch"));
        connected(&registry, &sim, ids[0]).await;
        // Bound to another event
        registry.add(Device::new(ids[1], "B").with_event("Wag"));
        connected(&registry, &sim, ids[1]).await;
        // Bound but offline
        registry.add(Device::new(ids[2], "C").with_event("Touch"));
        // Bound, online, but disabled
        registry.add(Device::new(ids[3], "D").with_event("Touch"));
        connected(&registry, &sim, ids[3]).await;
        registry.set_enabled(ids[3], false);

        let routes = registry.routes_for("Touch");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].id, ids[0]);
        assert!(registry.routes_for("").is_empty());
    }

    #[tokio::test]
    async fn test_save_load_round_trip_resets_runtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        let sim = SimTransport::new();
        sim.add_peripheral(ADDR, "TouchyTails");

        let registry = Registry::with_store(DeviceStore::new(&path));
        registry.add(Device::new(ADDR, "Left ear").with_event("Touch"));
        registry.add(
            Device::new("5e1f0c2a-9b7d-4c3e-8f10-0123456789ab", "Device B").with_enabled(false),
        );
        connected(&registry, &sim, ADDR).await;
        registry.save().unwrap();

        let console = RecordingConsole::default();
        let reloaded = Registry::with_store(DeviceStore::new(&path));
        assert_eq!(reloaded.load(&console), 2);

        let before: Vec<DeviceRecord> = registry.all().iter().map(DeviceRecord::from).collect();
        let after: Vec<DeviceRecord> = reloaded.all().iter().map(DeviceRecord::from).collect();
        assert_eq!(before, after);
        for device in reloaded.all() {
            assert!(!device.online);
            assert!(device.transport.is_none());
        }
        assert!(console.lines().is_empty());
    }

    #[test]
    fn test_load_skips_malformed_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "aa-bb-cc-dd-ee-01", "name": "Device A", "enabled": true, "event": "Touch"},
                {"id": "garbage", "name": "Broken", "enabled": true, "event": ""},
                {"id": "AA:BB:CC:DD:EE:01", "name": "Duplicate", "enabled": true, "event": ""}
            ]"#,
        )
        .unwrap();

        let console = RecordingConsole::default();
        let registry = Registry::with_store(DeviceStore::new(&path));
        assert_eq!(registry.load(&console), 1);

        assert_eq!(registry.find(ADDR).unwrap().event, "Touch");
        assert_eq!(console.count_containing("Skipping stored device 'Broken'"), 1);
        assert_eq!(
            console.count_containing("Skipping stored device 'Duplicate': duplicate id"),
            1
        );
    }

    #[test]
    fn test_load_keeps_empty_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        let store = DeviceStore::new(&path);
        let record = DeviceRecord {
            id: ADDR.to_string(),
            name: String::new(),
            enabled: false,
            event: "Wag".to_string(),
        };
        store.save(std::slice::from_ref(&record)).unwrap();

        let registry = Registry::with_store(DeviceStore::new(&path));
        assert_eq!(registry.load(&RecordingConsole::default()), 1);
        registry.save().unwrap();

        assert_eq!(store.load().unwrap(), vec![record]);
    }

    #[test]
    fn test_load_error_reports_and_empties() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "not json").unwrap();

        let console = RecordingConsole::default();
        let registry = Registry::with_store(DeviceStore::new(&path));
        registry.add(Device::new(ADDR, "Device A"));

        assert_eq!(registry.load(&console), 0);
        assert_eq!(registry.count(), 0);
        assert_eq!(console.count_containing("Failed to load devices"), 1);
    }
}
