//! Fleet supervisor.
//!
//! The only component that creates [`ConnectionSupervisor`]s. Every poll it walks a
//! registry snapshot and spawns a supervisor for each enabled device that has no transport
//! and is not already in the active set. Membership is claimed under the active-set lock
//! before the spawn and released when the supervisor task ends, however it ends, so a
//! device never has two supervisors.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Timings;
use crate::console::Console;
use crate::registry::Registry;
use crate::supervisor::ConnectionSupervisor;
use crate::supervisor::SupervisorExit;
use crate::transport::Transport;

type ActiveSet = Arc<Mutex<HashSet<String>>>;

fn lock_active(active: &ActiveSet) -> MutexGuard<'_, HashSet<String>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

/// Active-set membership for one device; released on drop
struct ActiveGuard {
    id: String,
    active: ActiveSet,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock_active(&self.active).remove(&self.id);
    }
}

pub struct FleetSupervisor {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    console: Arc<dyn Console>,
    timings: Timings,
    active: ActiveSet,
    tasks: Mutex<JoinSet<(String, SupervisorExit)>>,
}

impl FleetSupervisor {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        console: Arc<dyn Console>,
        timings: Timings,
    ) -> Self {
        Self {
            registry,
            transport,
            console,
            timings,
            active: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<(String, SupervisorExit)>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically claim `id`; `None` if a supervisor already owns it
    fn try_activate(&self, id: &str) -> Option<ActiveGuard> {
        let mut active = lock_active(&self.active);
        if !active.insert(id.to_string()) {
            return None;
        }
        Some(ActiveGuard {
            id: id.to_string(),
            active: self.active.clone(),
        })
    }

    pub fn is_active(&self, id: &str) -> bool {
        lock_active(&self.active).contains(id)
    }

    pub fn active_count(&self) -> usize {
        lock_active(&self.active).len()
    }

    /// One supervision pass. Returns the number of supervisors spawned.
    pub fn poll_once(&self) -> usize {
        let mut tasks = self.tasks();
        while let Some(result) = tasks.try_join_next() {
            match result {
                Ok((id, exit)) => debug!("Supervisor for {} exited: {:?}", id, exit),
                Err(e) => warn!("Supervisor task failed: {}", e),
            }
        }

        let mut spawned = 0;
        for device in self.registry.all() {
            if !device.enabled || device.transport.is_some() {
                continue;
            }
            let Some(guard) = self.try_activate(&device.id) else {
                continue;
            };

            debug!("Spawning supervisor for {} ({})", device.name, device.id);
            let supervisor = ConnectionSupervisor::new(
                device.id.clone(),
                self.registry.clone(),
                self.transport.clone(),
                self.console.clone(),
                self.timings,
            );
            tasks.spawn(async move {
                let exit = supervisor.run().await;
                (guard.id.clone(), exit)
            });
            spawned += 1;
        }
        spawned
    }

    /// Poll every `poll_interval` until `shutdown` resolves, then stop all supervisors
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        info!(
            "Fleet supervisor started (poll every {:?})",
            self.timings.poll_interval
        );
        let mut ticker = tokio::time::interval(self.timings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once();
                }
                _ = &mut shutdown => break,
            }
        }

        self.shutdown().await;
    }

    /// Abort every supervisor and wait for them to finish.
    ///
    /// Transports attached to devices stay in the registry; the caller releases them.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        info!("Fleet supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::Instant;

    use super::*;
    use crate::console::RecordingConsole;
    use crate::device::Device;
    use crate::transport::sim::SimTransport;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    fn fleet(sim: &SimTransport, registry: &Arc<Registry>) -> Arc<FleetSupervisor> {
        Arc::new(FleetSupervisor::new(
            registry.clone(),
            Arc::new(sim.clone()),
            Arc::new(RecordingConsole::default()),
            Timings::default(),
        ))
    }

    fn setup() -> (SimTransport, Arc<Registry>) {
        let sim = SimTransport::new();
        sim.add_peripheral(ADDR, "TouchyTails");
        let registry = Arc::new(Registry::new());
        registry.add(Device::new(ADDR, "Device A"));
        (sim, registry)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(120), "condition never held");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_spawns_one_supervisor_per_device() {
        let (sim, registry) = setup();
        registry.add(Device::new("AA:BB:CC:DD:EE:02", "Device B").with_enabled(false));
        let fleet = fleet(&sim, &registry);

        assert_eq!(fleet.poll_once(), 1);
        assert_eq!(fleet.poll_once(), 0);
        assert!(fleet.is_active(ADDR));
        assert!(!fleet.is_active("AA:BB:CC:DD:EE:02"));

        wait_until(|| registry.find(ADDR).is_some_and(|d| d.online)).await;
        assert_eq!(fleet.poll_once(), 0);
        assert_eq!(sim.connect_count(ADDR), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_toggles_never_duplicate_connections() {
        let (sim, registry) = setup();
        sim.set_connect_delay(ADDR, Duration::from_millis(300));
        let fleet = fleet(&sim, &registry);

        for round in 0..40u64 {
            registry.set_enabled(ADDR, false);
            fleet.poll_once();
            tokio::time::sleep(Duration::from_millis(round * 37 % 500)).await;

            registry.set_enabled(ADDR, true);
            fleet.poll_once();
            fleet.poll_once();
            tokio::time::sleep(Duration::from_millis(round * 53 % 2500)).await;

            assert!(fleet.active_count() <= 1);
        }

        wait_until(|| registry.find(ADDR).is_some_and(|d| d.online)).await;
        assert_eq!(sim.max_live_connections(ADDR), 1);
        assert_eq!(sim.live_connections(ADDR), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reenabled_device_gets_new_supervisor() {
        let (sim, registry) = setup();
        let fleet = fleet(&sim, &registry);
        fleet.poll_once();
        wait_until(|| registry.find(ADDR).is_some_and(|d| d.online)).await;

        registry.set_enabled(ADDR, false);
        wait_until(|| !fleet.is_active(ADDR)).await;
        assert_eq!(sim.live_connections(ADDR), 0);

        registry.set_enabled(ADDR, true);
        assert_eq!(fleet.poll_once(), 1);
        wait_until(|| registry.find(ADDR).is_some_and(|d| d.online)).await;
        assert_eq!(sim.connect_count(ADDR), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (sim, registry) = setup();
        let fleet = fleet(&sim, &registry);
        let (tx, rx) = oneshot::channel::<()>();

        let runner = tokio::spawn({
            let fleet = fleet.clone();
            async move {
                fleet
                    .run(async {
                        rx.await.ok();
                    })
                    .await
            }
        });

        wait_until(|| registry.find(ADDR).is_some_and(|d| d.online)).await;
        tx.send(()).unwrap();
        runner.await.unwrap();

        assert_eq!(fleet.active_count(), 0);
    }
}
