//! Inbound events and the sources that produce them.
//!
//! Sources register a factory in [`EVENT_SOURCES`]; the daemon builds every configured
//! source at startup and hands each an [`EventSender`] into the single-slot queue the
//! event router drains.

#[cfg(feature = "source_mqtt")]
pub mod mqtt;
pub mod osc;
pub mod slot;

use async_trait::async_trait;
use linkme::distributed_slice;
use tracing::error;
use tracing::info;

pub use self::slot::EventReceiver;
pub use self::slot::EventSender;
use crate::config::Config;

/// A named value from an external source
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub name: String,
    pub value: f32,
}

impl InboundEvent {
    pub fn new(name: impl Into<String>, value: f32) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Parse a textual float payload. Returns `None` for empty names and for absent,
    /// non-numeric or non-finite values.
    pub fn from_payload(name: &str, payload: &[u8]) -> Option<Self> {
        if name.is_empty() {
            return None;
        }
        let text = std::str::from_utf8(payload).ok()?.trim();
        let value: f32 = text.parse().ok()?;
        value.is_finite().then(|| Self::new(name, value))
    }
}

/// Result type for event source factory functions
pub type SourceFactoryResult = anyhow::Result<Option<Box<dyn EventSource>>>;

pub struct SourceContext<'a> {
    pub config: &'a Config,
}

/// Factories for every compiled-in event source. A factory returns `Ok(None)` when its
/// source is not configured.
#[distributed_slice]
pub static EVENT_SOURCES: [fn(&SourceContext) -> SourceFactoryResult];

/// Producer of inbound events
#[async_trait]
pub trait EventSource: Send {
    fn name(&self) -> &str;

    /// Deliver events into `events` until the source fails or the task is aborted
    async fn run(self: Box<Self>, events: EventSender) -> anyhow::Result<()>;
}

/// Instantiate every configured source. Factory errors are logged and skipped.
pub fn build_sources(config: &Config) -> Vec<Box<dyn EventSource>> {
    let ctx = SourceContext { config };
    let mut sources = Vec::new();

    for factory in EVENT_SOURCES {
        match factory(&ctx) {
            Ok(Some(source)) => {
                info!("Configured event source: {}", source.name());
                sources.push(source);
            }
            Ok(None) => {}
            Err(e) => error!("Failed to create event source: {:#}", e),
        }
    }

    sources
}
