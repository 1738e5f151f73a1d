//! Time-bounded discovery of peripherals by advertised name.
//!
//! [`Discovery::scan`] starts a background scan and returns a [`DiscoveryScan`], a lazy
//! stream of [`DiscoveryEvent`]s. The scan stops on the first match, on timeout, or when
//! the caller cancels or drops the handle. Callers decide whether a found address is new;
//! discovery does not consult the registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::console::Console;
use crate::device::parse_device_id;
use crate::transport::TransportError;

const EVENT_CHANNEL_SIZE: usize = 32;

/// One advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Raw platform address, not yet normalized
    pub address: String,
    pub local_name: String,
}

/// Radio scanning capability
#[async_trait]
pub trait Scanner: Send + Sync + 'static {
    /// Begin scanning. Advertisements arrive on the returned channel until
    /// [`Scanner::stop_scan`] is called or the receiver is dropped.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError>;

    async fn stop_scan(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Human-readable progress line
    Progress(String),

    /// Normalized address of the matching peripheral. Emitted at most once per scan.
    Found(String),

    /// No match before the timeout
    TimedOut,

    /// The scan could not run
    Failed(String),
}

/// Caller-supplied reactions to discovery events
pub trait DiscoveryHandler: Send {
    fn on_progress(&mut self, _message: &str) {}
    fn on_found(&mut self, _address: &str) {}
    fn on_timeout(&mut self) {}
    fn on_failed(&mut self, _error: &str) {}
}

/// Mirrors every discovery event to a console
pub struct ConsoleReporter {
    console: Arc<dyn Console>,
}

impl ConsoleReporter {
    pub fn new(console: Arc<dyn Console>) -> Self {
        Self { console }
    }
}

impl DiscoveryHandler for ConsoleReporter {
    fn on_progress(&mut self, message: &str) {
        self.console.append(message);
    }

    fn on_timeout(&mut self) {
        self.console.append("No matching device found");
    }

    fn on_failed(&mut self, error: &str) {
        self.console.append(&format!("Failed to start scan: {}", error));
    }
}

#[derive(Clone)]
pub struct Discovery {
    scanner: Arc<dyn Scanner>,
}

impl Discovery {
    pub fn new(scanner: Arc<dyn Scanner>) -> Self {
        Self { scanner }
    }

    /// Scan for a peripheral advertising `target_name`, for at most `timeout`
    pub fn scan(&self, target_name: &str, timeout: Duration) -> DiscoveryScan {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let task = tokio::spawn(run_scan(
            self.scanner.clone(),
            target_name.to_string(),
            timeout,
            events_tx,
            cancel_rx,
        ));

        DiscoveryScan {
            events: events_rx,
            cancel: Some(cancel_tx),
            task,
        }
    }
}

/// A running scan. Dropping it cancels the scan.
pub struct DiscoveryScan {
    events: mpsc::Receiver<DiscoveryEvent>,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DiscoveryScan {
    /// Next event, or `None` once the scan has stopped
    pub async fn next(&mut self) -> Option<DiscoveryEvent> {
        self.events.recv().await
    }

    /// Stop scanning early. Remaining events still drain through [`Self::next`].
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Feed every event to `handler` until the scan stops, returning the found address
    pub async fn drive(mut self, handler: &mut dyn DiscoveryHandler) -> Option<String> {
        let mut found = None;
        while let Some(event) = self.next().await {
            match event {
                DiscoveryEvent::Progress(message) => handler.on_progress(&message),
                DiscoveryEvent::Found(address) => {
                    handler.on_found(&address);
                    found = Some(address);
                }
                DiscoveryEvent::TimedOut => handler.on_timeout(),
                DiscoveryEvent::Failed(error) => handler.on_failed(&error),
            }
        }
        found
    }

    /// Wait for the background task to finish
    pub async fn join(self) {
        let Self { task, .. } = self;
        if let Err(e) = task.await {
            debug!("Discovery task ended abnormally: {}", e);
        }
    }
}

async fn run_scan(
    scanner: Arc<dyn Scanner>,
    target_name: String,
    timeout: Duration,
    events: mpsc::Sender<DiscoveryEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    let emit = |event: DiscoveryEvent| {
        let events = events.clone();
        async move {
            // A dropped receiver means nobody is listening; the scan still stops on its own
            let _ = events.send(event).await;
        }
    };

    emit(DiscoveryEvent::Progress(format!(
        "Starting scan for {}...",
        target_name
    )))
    .await;

    let mut adverts = match scanner.start_scan().await {
        Ok(adverts) => adverts,
        Err(e) => {
            emit(DiscoveryEvent::Failed(e.to_string())).await;
            return;
        }
    };

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut seen = HashSet::new();

    loop {
        tokio::select! {
            _ = &mut deadline => {
                emit(DiscoveryEvent::Progress("Scanning done (timeout)".to_string())).await;
                emit(DiscoveryEvent::TimedOut).await;
                break;
            }
            _ = &mut cancel => {
                emit(DiscoveryEvent::Progress("Scan cancelled".to_string())).await;
                break;
            }
            advert = adverts.recv() => {
                let Some(advert) = advert else {
                    emit(DiscoveryEvent::Failed("scanner stopped unexpectedly".to_string())).await;
                    break;
                };

                if !seen.insert(advert.address.clone()) {
                    continue;
                }
                emit(DiscoveryEvent::Progress(format!(
                    "Found: {} [{}]",
                    advert.local_name, advert.address
                )))
                .await;

                if advert.local_name != target_name {
                    continue;
                }

                match parse_device_id(&advert.address) {
                    Ok(address) => {
                        emit(DiscoveryEvent::Progress(format!(
                            "Found target: {} [{}]",
                            advert.local_name, address
                        )))
                        .await;
                        emit(DiscoveryEvent::Found(address)).await;
                        break;
                    }
                    Err(e) => {
                        emit(DiscoveryEvent::Progress(format!("Ignoring {}: {}", advert.address, e)))
                            .await;
                    }
                }
            }
        }
    }

    scanner.stop_scan().await;
}
