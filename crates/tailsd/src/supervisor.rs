//! Per-device connection supervisor.
//!
//! One [`ConnectionSupervisor`] drives one device through
//! `Idle -> Connecting -> Ready -> Heartbeating -> Disconnecting -> Idle`, retrying failed
//! connects indefinitely while the device stays enabled. It reads and writes device state
//! only through the [`Registry`] and owns the device's `online` flag and transport.
//!
//! Cancellation is cooperative: the enabled flag is checked before every connect attempt
//! and on every heartbeat tick, so a disabled or removed device is torn down within one
//! heartbeat or retry period.

use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Timings;
use crate::console::Console;
use crate::device::DeviceStatus;
use crate::registry::Registry;
use crate::transport::Handle;
use crate::transport::Transport;

/// Keep-alive payload written on every heartbeat tick
pub const HEARTBEAT_PAYLOAD: &str = "ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Ready,
    Heartbeating,
    Disconnecting,
    Disabled,
}

/// Why a supervisor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The device was disabled; the fleet supervisor restarts it once re-enabled
    Disabled,

    /// The device no longer exists
    Removed,
}

pub struct ConnectionSupervisor {
    id: String,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    console: Arc<dyn Console>,
    timings: Timings,
    state: State,
    handle: Option<Handle>,
}

impl ConnectionSupervisor {
    pub fn new(
        id: impl Into<String>,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        console: Arc<dyn Console>,
        timings: Timings,
    ) -> Self {
        Self {
            id: id.into(),
            registry,
            transport,
            console,
            timings,
            state: State::Idle,
            handle: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn transition(&mut self, next: State) {
        debug!("{}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    fn name(&self) -> String {
        self.registry
            .find(&self.id)
            .map(|d| d.name)
            .unwrap_or_else(|| self.id.clone())
    }

    /// Run until the device is disabled or removed
    pub async fn run(mut self) -> SupervisorExit {
        loop {
            match self.state {
                State::Idle => {
                    let next = if self.registry.is_enabled(&self.id) {
                        State::Connecting
                    } else {
                        State::Disabled
                    };
                    self.transition(next);
                }
                State::Connecting => {
                    let next = self.connect().await;
                    self.transition(next);
                }
                State::Ready => self.transition(State::Heartbeating),
                State::Heartbeating => {
                    self.heartbeat().await;
                    self.transition(State::Disconnecting);
                }
                State::Disconnecting => {
                    let next = self.disconnect().await;
                    self.transition(next);
                }
                State::Disabled => return self.finish(),
            }
        }
    }

    async fn connect(&mut self) -> State {
        let name = self.name();
        self.console
            .append(&format!("Scanning/connecting to {} ({})...", name, self.id));
        self.console.apply_status(&self.id, DeviceStatus::Pending);

        let handle =
            match Handle::open(self.transport.as_ref(), &self.id, self.timings.connect_timeout)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Failed to connect {} ({}): {}", name, self.id, e);
                    self.console
                        .append(&format!("Failed to connect {}: {}", name, e));
                    self.console
                        .apply_status(&self.id, DeviceStatus::Malfunction);

                    tokio::time::sleep(self.timings.retry_delay).await;
                    return State::Idle;
                }
            };

        // Disabled or removed while the connect was in flight
        if !self.registry.is_enabled(&self.id)
            || !self.registry.set_transport(&self.id, handle.clone())
        {
            self.handle = Some(handle);
            return State::Disconnecting;
        }

        self.registry.set_online(&self.id, true);
        self.handle = Some(handle);

        info!("Connected to {} ({})", name, self.id);
        self.console.append(&format!("{} connected!", name));
        self.console.apply_status(&self.id, DeviceStatus::Online);
        State::Ready
    }

    /// Returns when the device is disabled or the connection is lost
    async fn heartbeat(&mut self) {
        let Some(handle) = self.handle.clone() else {
            return;
        };

        loop {
            tokio::time::sleep(self.timings.heartbeat_interval).await;

            if !self.registry.is_enabled(&self.id) {
                return;
            }

            if !handle.is_ready() {
                self.console
                    .append(&format!("Lost connection to {}", self.name()));
                return;
            }

            if let Err(e) = handle
                .write_bounded(HEARTBEAT_PAYLOAD, self.timings.write_timeout)
                .await
            {
                self.console
                    .append(&format!("Lost connection to {}: {}", self.name(), e));
                return;
            }
        }
    }

    async fn disconnect(&mut self) -> State {
        if let Some(handle) = self.registry.clear_transport(&self.id) {
            handle.disconnect().await;
        }
        if let Some(handle) = self.handle.take() {
            handle.disconnect().await;
        }

        if self.registry.is_enabled(&self.id) {
            self.console.apply_status(&self.id, DeviceStatus::Offline);
            State::Idle
        } else {
            State::Disabled
        }
    }

    fn finish(&self) -> SupervisorExit {
        if self.registry.exists(&self.id) {
            info!("Supervisor for {} stopped: device disabled", self.id);
            self.console.apply_status(&self.id, DeviceStatus::Disabled);
            SupervisorExit::Disabled
        } else {
            info!("Supervisor for {} stopped: device removed", self.id);
            SupervisorExit::Removed
        }
    }
}
