//! In-memory simulated peripherals.
//!
//! Backs the daemon when no radio transport is wired in, and every test that needs a
//! transport. Each peripheral can be told to fail connects, hang or fail writes, drop its
//! link, or hide its write target; the simulator records writes and live connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Link;
use super::Transport;
use super::TransportError;
use super::WriteTarget;
use crate::device::parse_device_id;
use crate::discovery::Advertisement;
use crate::discovery::Scanner;

/// Channel capacity for advertisements of one scan
const SCAN_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Default)]
struct Peripheral {
    /// Address as the radio reports it, before normalization
    advertised: String,
    name: String,
    failing_connects: u32,
    unreachable: bool,
    connect_delay: Duration,
    missing_target: bool,
    discovery_hang: bool,
    write_hang: bool,
    write_fail: bool,
    /// Bumped by `drop_link`; links from an older generation report not-ready
    generation: u64,
    writes: Vec<String>,
    connects: u32,
    live: usize,
    max_live: usize,
}

#[derive(Debug)]
struct SimState {
    peripherals: HashMap<String, Peripheral>,
    advertise_interval: Duration,
    /// Bumped by `stop_scan`; scan tasks from an older epoch exit
    scan_epoch: u64,
    scans_started: u32,
}

/// Simulated transport and scanner
#[derive(Debug, Clone)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                peripherals: HashMap::new(),
                advertise_interval: Duration::from_millis(100),
                scan_epoch: 0,
                scans_started: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // Poisoning is ignored; state stays usable after a panicking test
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_peripheral<R>(&self, address: &str, f: impl FnOnce(&mut Peripheral) -> R) -> Option<R> {
        self.lock().peripherals.get_mut(&peripheral_key(address)).map(f)
    }

    /// Add a peripheral advertising `name`. It answers under its normalized address, so
    /// `aa-bb-..` and `AA:BB:..` refer to the same peripheral.
    pub fn add_peripheral(&self, address: &str, name: &str) {
        self.lock().peripherals.insert(
            peripheral_key(address),
            Peripheral {
                advertised: address.to_string(),
                name: name.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn set_advertise_interval(&self, interval: Duration) {
        self.lock().advertise_interval = interval;
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, address: &str, count: u32) {
        self.with_peripheral(address, |p| p.failing_connects = count);
    }

    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        self.with_peripheral(address, |p| p.unreachable = unreachable);
    }

    pub fn set_connect_delay(&self, address: &str, delay: Duration) {
        self.with_peripheral(address, |p| p.connect_delay = delay);
    }

    pub fn set_missing_target(&self, address: &str, missing: bool) {
        self.with_peripheral(address, |p| p.missing_target = missing);
    }

    /// Make write-target discovery never complete
    pub fn set_discovery_hang(&self, address: &str, hang: bool) {
        self.with_peripheral(address, |p| p.discovery_hang = hang);
    }

    pub fn set_write_hang(&self, address: &str, hang: bool) {
        self.with_peripheral(address, |p| p.write_hang = hang);
    }

    pub fn set_write_fail(&self, address: &str, fail: bool) {
        self.with_peripheral(address, |p| p.write_fail = fail);
    }

    /// Silently drop every current link to `address`; their liveness checks turn false
    pub fn drop_link(&self, address: &str) {
        self.with_peripheral(address, |p| p.generation += 1);
    }

    /// Payloads written to `address`, oldest first
    pub fn writes(&self, address: &str) -> Vec<String> {
        self.with_peripheral(address, |p| p.writes.clone())
            .unwrap_or_default()
    }

    /// Payloads written to `address`, excluding heartbeats
    pub fn command_writes(&self, address: &str) -> Vec<String> {
        self.writes(address)
            .into_iter()
            .filter(|w| w != crate::supervisor::HEARTBEAT_PAYLOAD)
            .collect()
    }

    pub fn connect_count(&self, address: &str) -> u32 {
        self.with_peripheral(address, |p| p.connects).unwrap_or(0)
    }

    pub fn live_connections(&self, address: &str) -> usize {
        self.with_peripheral(address, |p| p.live).unwrap_or(0)
    }

    /// Highest number of simultaneously live connections ever seen for `address`
    pub fn max_live_connections(&self, address: &str) -> usize {
        self.with_peripheral(address, |p| p.max_live).unwrap_or(0)
    }

    pub fn scans_started(&self) -> u32 {
        self.lock().scans_started
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Link>, TransportError> {
        let delay = self
            .with_peripheral(address, |p| p.connect_delay)
            .ok_or_else(|| TransportError::Connect(format!("no peripheral at {}", address)))?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let peripheral = state
            .peripherals
            .get_mut(&peripheral_key(address))
            .ok_or_else(|| TransportError::Connect(format!("no peripheral at {}", address)))?;

        if peripheral.unreachable {
            return Err(TransportError::Connect("peripheral unreachable".to_string()));
        }
        if peripheral.failing_connects > 0 {
            peripheral.failing_connects -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        peripheral.connects += 1;
        peripheral.live += 1;
        peripheral.max_live = peripheral.max_live.max(peripheral.live);

        Ok(Arc::new(SimLink {
            address: address.to_string(),
            generation: peripheral.generation,
            connected: Arc::new(AtomicBool::new(true)),
            sim: self.clone(),
        }))
    }
}

struct SimLink {
    address: String,
    generation: u64,
    connected: Arc<AtomicBool>,
    sim: SimTransport,
}

#[async_trait]
impl Link for SimLink {
    async fn discover_write_target(&self) -> Result<Arc<dyn WriteTarget>, TransportError> {
        let (missing, hang) = self
            .sim
            .with_peripheral(&self.address, |p| (p.missing_target, p.discovery_hang))
            .unwrap_or((true, false));
        if hang {
            std::future::pending::<()>().await;
        }
        if missing {
            return Err(TransportError::NotFound("write characteristic"));
        }

        Ok(Arc::new(SimTarget {
            address: self.address.clone(),
            connected: self.connected.clone(),
            sim: self.sim.clone(),
        }))
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.sim.with_peripheral(&self.address, |p| {
                p.live = p.live.saturating_sub(1);
            });
        }
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::Acquire)
            && self
                .sim
                .with_peripheral(&self.address, |p| p.generation == self.generation)
                .unwrap_or(false)
    }
}

struct SimTarget {
    address: String,
    connected: Arc<AtomicBool>,
    sim: SimTransport,
}

#[async_trait]
impl WriteTarget for SimTarget {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Write("not connected".to_string()));
        }

        let (hang, fail) = self
            .sim
            .with_peripheral(&self.address, |p| (p.write_hang, p.write_fail))
            .unwrap_or((false, true));

        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(TransportError::Write("gatt error".to_string()));
        }

        let payload = String::from_utf8_lossy(bytes).to_string();
        self.sim
            .with_peripheral(&self.address, |p| p.writes.push(payload));
        Ok(())
    }
}

#[async_trait]
impl Scanner for SimTransport {
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_SIZE);
        let epoch = {
            let mut state = self.lock();
            state.scans_started += 1;
            state.scan_epoch
        };

        let sim = self.clone();
        tokio::spawn(async move {
            loop {
                let (adverts, interval) = {
                    let state = sim.lock();
                    if state.scan_epoch != epoch {
                        break;
                    }
                    let mut adverts: Vec<Advertisement> = state
                        .peripherals
                        .values()
                        .map(|p| Advertisement {
                            address: p.advertised.clone(),
                            local_name: p.name.clone(),
                        })
                        .collect();
                    adverts.sort_by(|a, b| a.address.cmp(&b.address));
                    (adverts, state.advertise_interval)
                };

                for advert in adverts {
                    if tx.send(advert).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        Ok(rx)
    }

    async fn stop_scan(&self) {
        self.lock().scan_epoch += 1;
    }
}

/// Map key for `address`; unparseable addresses are kept verbatim
fn peripheral_key(address: &str) -> String {
    parse_device_id(address).unwrap_or_else(|_| address.to_string())
}
