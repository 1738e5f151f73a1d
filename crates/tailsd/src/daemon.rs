//! Process wiring.
//!
//! [`Daemon`] owns the shared pieces, loads the device list, and runs the fleet
//! supervisor, event router, event sources and HTTP API until shutdown. [`Context`] is the
//! subset shared with the API and the CLI.

use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::ApiConfig;
use crate::config::Config;
use crate::config::Timings;
use crate::console::Console;
use crate::console::FanoutConsole;
use crate::console::RecordingConsole;
use crate::device::Device;
use crate::discovery::ConsoleReporter;
use crate::discovery::Discovery;
use crate::discovery::Scanner;
use crate::events;
use crate::events::EventReceiver;
use crate::events::EventSender;
use crate::events::EventSource;
use crate::fleet::FleetSupervisor;
use crate::registry::Registry;
use crate::router::EventRouter;
use crate::store::DeviceStore;
use crate::transport::Transport;

/// Result of one discovery pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    Added { id: String, name: String },
    AlreadyKnown { id: String },
    NotFound,
    Busy,
}

/// User edits to a device; absent fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub event: Option<String>,
    pub enabled: Option<bool>,
}

/// State shared between the daemon's tasks, the API and the CLI
pub struct Context {
    pub registry: Arc<Registry>,
    pub console: Arc<dyn Console>,
    /// Recent console lines, also fed by `console`
    pub recent: Arc<RecordingConsole>,
    pub router: Arc<EventRouter>,
    pub events: EventSender,
    pub discovery: Discovery,
    pub device_name: String,
    pub timings: Timings,
    scan_lock: tokio::sync::Mutex<()>,
}

impl Context {
    /// Persist the device list, reporting failures to the console
    pub fn persist(&self) {
        if let Err(e) = self.registry.save() {
            error!("{}", e);
            self.console
                .append(&format!("Failed to save devices: {}", e));
        }
    }

    /// Run one discovery pass and register the device it finds, if new.
    ///
    /// Only one scan runs at a time; a concurrent call returns [`ScanOutcome::Busy`].
    pub async fn scan_and_adopt(&self) -> ScanOutcome {
        let Ok(_scanning) = self.scan_lock.try_lock() else {
            return ScanOutcome::Busy;
        };

        let mut reporter = ConsoleReporter::new(self.console.clone());
        let found = self
            .discovery
            .scan(&self.device_name, self.timings.scan_timeout)
            .drive(&mut reporter)
            .await;
        let Some(id) = found else {
            return ScanOutcome::NotFound;
        };

        match self.registry.adopt(&id) {
            Some(name) => {
                self.console
                    .append(&format!("Added {} ({})", name, id));
                self.persist();
                ScanOutcome::Added { id, name }
            }
            None => {
                self.console
                    .append(&format!("{} is already registered", id));
                ScanOutcome::AlreadyKnown { id }
            }
        }
    }

    /// Apply user edits and persist them. Returns the updated device, or `None` if it
    /// does not exist.
    ///
    /// Disabling only clears intent; the device's supervisor tears the connection down on
    /// its next tick.
    pub fn update_device(&self, id: &str, update: &DeviceUpdate) -> Option<Device> {
        if !self.registry.exists(id) {
            return None;
        }

        if let Some(name) = &update.name {
            self.registry.set_name(id, name.trim());
        }
        if let Some(event) = &update.event {
            self.registry.set_event(id, event.trim());
        }
        if let Some(enabled) = update.enabled {
            self.registry.set_enabled(id, enabled);
        }

        let device = self.registry.find(id)?;
        if update.enabled.is_some() {
            let status = device.status();
            self.console.apply_status(id, status);
            self.console
                .append(&format!("{} for {}", status, id));
        }
        self.persist();
        Some(device)
    }

    /// Remove a device, disconnecting it first. Unknown ids are a no-op.
    pub async fn remove_device(&self, id: &str) -> Option<Device> {
        let device = self.registry.remove(id).await?;
        self.console
            .append(&format!("Removed {} ({})", device.name, device.id));
        self.persist();
        Some(device)
    }
}

pub struct Daemon {
    ctx: Arc<Context>,
    transport: Arc<dyn Transport>,
    event_rx: EventReceiver,
    sources: Vec<Box<dyn EventSource>>,
    api: Option<ApiConfig>,
    scan_on_start: bool,
}

impl Daemon {
    /// Build a daemon from `config`. Console output goes to `console` and to the in-memory
    /// buffer served by the API.
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        scanner: Arc<dyn Scanner>,
        console: Arc<dyn Console>,
    ) -> Self {
        let timings = config.timing.timings();
        let registry = Arc::new(Registry::with_store(DeviceStore::new(
            &config.storage.devices_path,
        )));
        let recent = Arc::new(RecordingConsole::default());
        let console: Arc<dyn Console> = Arc::new(FanoutConsole::new(vec![
            recent.clone() as Arc<dyn Console>,
            console,
        ]));
        let router = Arc::new(EventRouter::new(
            registry.clone(),
            console.clone(),
            timings.write_timeout,
        ));
        let (event_tx, event_rx) = events::slot::channel();

        let ctx = Arc::new(Context {
            registry,
            console,
            recent,
            router,
            events: event_tx,
            discovery: Discovery::new(scanner),
            device_name: config.discovery.device_name.clone(),
            timings,
            scan_lock: tokio::sync::Mutex::new(()),
        });

        Self {
            ctx,
            transport,
            event_rx,
            sources: events::build_sources(config),
            api: config.api.clone(),
            scan_on_start: config.discovery.scan_on_start,
        }
    }

    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    /// Replace the configured event sources
    pub fn with_sources(mut self, sources: Vec<Box<dyn EventSource>>) -> Self {
        self.sources = sources;
        self
    }

    /// Run until `shutdown` resolves, then stop every task, disconnect every device and
    /// save the device list
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let Self {
            ctx,
            transport,
            event_rx,
            sources,
            api,
            scan_on_start,
        } = self;

        let loaded = ctx.registry.load(ctx.console.as_ref());
        info!("tailsd starting with {} devices", loaded);

        let fleet = Arc::new(FleetSupervisor::new(
            ctx.registry.clone(),
            transport,
            ctx.console.clone(),
            ctx.timings,
        ));
        let (fleet_tx, fleet_rx) = oneshot::channel::<()>();
        let fleet_task = tokio::spawn({
            let fleet = fleet.clone();
            async move {
                fleet
                    .run(async {
                        fleet_rx.await.ok();
                    })
                    .await
            }
        });

        let (router_tx, router_rx) = oneshot::channel::<()>();
        let router_task = tokio::spawn({
            let router = ctx.router.clone();
            async move {
                router
                    .run(event_rx, async {
                        router_rx.await.ok();
                    })
                    .await
            }
        });

        let source_tasks: Vec<JoinHandle<()>> = sources
            .into_iter()
            .map(|source| {
                let events = ctx.events.clone();
                tokio::spawn(async move {
                    let name = source.name().to_string();
                    if let Err(e) = source.run(events).await {
                        error!("Event source {} stopped: {:#}", name, e);
                    }
                })
            })
            .collect();

        let mut api_task = None;
        if let Some(api) = api {
            let (api_tx, api_rx) = oneshot::channel();
            let ctx = ctx.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = crate::api::serve(api.listen, api.port, ctx, api_rx).await {
                    error!("HTTP API server failed: {}", e);
                }
            });
            api_task = Some((api_tx, task));
        }

        let scan_task = scan_on_start.then(|| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.scan_and_adopt().await;
            })
        });

        shutdown.await;
        info!("tailsd shutting down");

        for task in source_tasks.iter().chain(scan_task.as_ref()) {
            task.abort();
        }
        if let Some(task) = scan_task {
            // Cancellation is the expected outcome
            let _ = task.await;
        }
        let _ = router_tx.send(());
        let _ = fleet_tx.send(());
        if let Some((api_tx, task)) = api_task {
            let _ = api_tx.send(());
            if let Err(e) = task.await {
                warn!("HTTP API task failed: {}", e);
            }
        }
        if let Err(e) = router_task.await {
            warn!("Event router task failed: {}", e);
        }
        if let Err(e) = fleet_task.await {
            warn!("Fleet supervisor task failed: {}", e);
        }

        for handle in ctx.registry.release_all_transports() {
            handle.disconnect().await;
        }
        ctx.registry.save()?;
        info!("Device list saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::Instant;

    use super::*;
    use crate::events::InboundEvent;
    use crate::store::DeviceRecord;
    use crate::transport::sim::SimTransport;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.devices_path = dir.path().join("devices.json");
        config
    }

    fn daemon(config: &Config, sim: &SimTransport) -> Daemon {
        Daemon::new(
            config,
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            Arc::new(RecordingConsole::default()),
        )
        .with_sources(Vec::new())
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(120), "condition never held");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_connects_routes_and_saves() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        DeviceStore::new(&config.storage.devices_path)
            .save(&[DeviceRecord {
                id: ADDR.to_string(),
                name: "D".to_string(),
                enabled: true,
                event: "Touch".to_string(),
            }])
            .unwrap();

        let sim = SimTransport::new();
        sim.add_peripheral(ADDR, "TouchyTails");
        let daemon = daemon(&config, &sim);
        let ctx = daemon.context();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(daemon.run(async {
            stop_rx.await.ok();
        }));

        wait_until(|| ctx.registry.find(ADDR).is_some_and(|d| d.online)).await;
        ctx.events.send(InboundEvent::new("Touch", 0.5));
        wait_until(|| ctx.recent.count_containing("D: Touch -> 0.70") == 1).await;
        assert_eq!(sim.command_writes(ADDR), vec!["0.70"]);

        ctx.update_device(
            ADDR,
            &DeviceUpdate {
                name: Some("Left".to_string()),
                ..Default::default()
            },
        );

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(sim.live_connections(ADDR), 0);
        let saved = DeviceStore::new(&config.storage.devices_path).load().unwrap();
        assert_eq!(saved[0].name, "Left");
        assert_eq!(saved[0].event, "Touch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_and_adopt() {
        let dir = TempDir::new().unwrap();
        let sim = SimTransport::new();
        sim.add_peripheral("aa:bb:cc:dd:ee:01", "TouchyTails");
        let config = config(&dir);
        let ctx = daemon(&config, &sim).context();

        assert_eq!(
            ctx.scan_and_adopt().await,
            ScanOutcome::Added {
                id: ADDR.to_string(),
                name: "Device A".to_string(),
            }
        );
        assert_eq!(
            ctx.scan_and_adopt().await,
            ScanOutcome::AlreadyKnown {
                id: ADDR.to_string()
            }
        );

        let saved = DeviceStore::new(&config.storage.devices_path).load().unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].enabled);
        assert_eq!(ctx.recent.count_containing("Added Device A"), 1);
    }

    async fn stop(daemon_task: JoinHandle<anyhow::Result<()>>, stop_tx: oneshot::Sender<()>) {
        stop_tx.send(()).unwrap();
        daemon_task.await.unwrap().unwrap();
    }

    fn spawn_run(daemon: Daemon) -> (JoinHandle<anyhow::Result<()>>, oneshot::Sender<()>) {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(daemon.run(async {
            stop_rx.await.ok();
        }));
        (task, stop_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_on_start_adopts_and_connects_dash_address() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.discovery.scan_on_start = true;
        let sim = SimTransport::new();
        sim.add_peripheral("aa-bb-cc-dd-ee-01", "TouchyTails");

        let daemon = daemon(&config, &sim);
        let ctx = daemon.context();
        let (task, stop_tx) = spawn_run(daemon);

        wait_until(|| ctx.registry.find(ADDR).is_some_and(|d| d.online)).await;
        assert_eq!(ctx.recent.count_containing("Failed to connect"), 0);
        assert_eq!(sim.live_connections(ADDR), 1);

        stop(task, stop_tx).await;
        let saved = DeviceStore::new(&config.storage.devices_path).load().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, ADDR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_startup_scan() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.discovery.scan_on_start = true;
        let sim = SimTransport::new();

        let daemon = daemon(&config, &sim);
        let ctx = daemon.context();
        let (task, stop_tx) = spawn_run(daemon);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sim.scans_started(), 1);
        stop(task, stop_tx).await;

        // A peripheral appearing after shutdown must not be adopted
        sim.add_peripheral(ADDR, "TouchyTails");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ctx.registry.count(), 0);
        assert!(DeviceStore::new(&config.storage.devices_path).load().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_not_found() {
        let dir = TempDir::new().unwrap();
        let sim = SimTransport::new();
        let ctx = daemon(&config(&dir), &sim).context();

        assert_eq!(ctx.scan_and_adopt().await, ScanOutcome::NotFound);
        assert_eq!(ctx.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_update_and_remove_device() {
        let dir = TempDir::new().unwrap();
        let sim = SimTransport::new();
        let config = config(&dir);
        let ctx = daemon(&config, &sim).context();
        ctx.registry.add(Device::new(ADDR, "Device A"));

        let device = ctx
            .update_device(
                ADDR,
                &DeviceUpdate {
                    event: Some(" Wag ".to_string()),
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(device.event, "Wag");
        assert!(!device.enabled);
        assert_eq!(ctx.recent.count_containing(&format!("Disabled for {}", ADDR)), 1);
        assert!(ctx.update_device("AA:BB:CC:DD:EE:02", &DeviceUpdate::default()).is_none());

        assert!(ctx.remove_device(ADDR).await.is_some());
        assert!(ctx.remove_device(ADDR).await.is_none());
        assert!(DeviceStore::new(&config.storage.devices_path).load().unwrap().is_empty());
    }
}
