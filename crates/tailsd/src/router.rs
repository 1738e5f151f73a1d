//! Event router.
//!
//! Drains the single-slot event queue and turns each `(name, value)` event into one
//! bounded write per enabled, online device bound to `name`. Writes for one event run
//! concurrently and are all joined before the next event is taken, so two deliveries to
//! the same device are never reordered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::console::Console;
use crate::events::EventReceiver;
use crate::events::InboundEvent;
use crate::registry::Registry;
use crate::transport::TransportError;

/// Lowest intensity the hardware reacts to
pub const MIN_INTENSITY: f32 = 0.4;

/// Map an event value in `(0, 1]` onto the device range `[0.4, 1.0]`
pub fn remap(value: f32) -> f32 {
    // The floor only matters for values the router already filters out
    (MIN_INTENSITY + value * (1.0 - MIN_INTENSITY)).max(MIN_INTENSITY)
}

/// Wire form of an intensity
pub fn format_intensity(intensity: f32) -> String {
    format!("{:.2}", intensity)
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("device {0} not found")]
    UnknownDevice(String),

    #[error("device offline, cannot beep: {0}")]
    Offline(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct EventRouter {
    registry: Arc<Registry>,
    console: Arc<dyn Console>,
    write_timeout: Duration,
}

impl EventRouter {
    pub fn new(registry: Arc<Registry>, console: Arc<dyn Console>, write_timeout: Duration) -> Self {
        Self {
            registry,
            console,
            write_timeout,
        }
    }

    /// Deliver one event. Returns the number of devices written successfully.
    pub async fn dispatch(&self, event: &InboundEvent) -> usize {
        // Also rejects NaN
        if !(event.value > 0.0) {
            debug!("Ignoring non-positive event {} = {}", event.name, event.value);
            return 0;
        }

        let payload = format_intensity(remap(event.value));
        let routes = self.registry.routes_for(&event.name);
        if routes.is_empty() {
            debug!("No online device bound to {}", event.name);
            return 0;
        }

        let mut writes = JoinSet::new();
        for route in routes {
            let payload = payload.clone();
            let timeout = self.write_timeout;
            writes.spawn(async move {
                let result = route.handle.write_bounded(payload, timeout).await;
                (route, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((route, Ok(()))) => {
                    delivered += 1;
                    self.console
                        .append(&format!("{}: {} -> {}", route.name, event.name, payload));
                }
                Ok((route, Err(e))) => {
                    warn!("Failed to deliver {} to {} ({}): {}", event.name, route.name, route.id, e);
                }
                Err(e) => warn!("Write task failed: {}", e),
            }
        }
        delivered
    }

    /// Dispatch events until the queue closes or `shutdown` resolves
    pub async fn run(&self, mut events: EventReceiver, shutdown: impl Future<Output = ()>) {
        info!("Event router started");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch(&event).await;
                }
                _ = &mut shutdown => break,
            }
        }

        let dropped = events.replaced();
        info!("Event router stopped ({} superseded events dropped)", dropped);
    }

    /// Send a single intensity to one device regardless of its event binding
    pub async fn beep(&self, id: &str, value: f32) -> Result<String, DeliveryError> {
        let device = self
            .registry
            .find(id)
            .ok_or_else(|| DeliveryError::UnknownDevice(id.to_string()))?;

        let handle = match (&device.transport, device.online) {
            (Some(handle), true) => handle.clone(),
            _ => {
                self.console
                    .append(&format!("Device offline, cannot beep: {}", id));
                return Err(DeliveryError::Offline(id.to_string()));
            }
        };

        let payload = format_intensity(remap(value.clamp(0.0, 1.0)));
        handle.write_bounded(payload.clone(), self.write_timeout).await?;
        self.console
            .append(&format!("Beep: {} for {}", payload, id));
        Ok(payload)
    }
}
