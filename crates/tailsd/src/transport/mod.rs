//! Transport capability consumed by the supervisors and the event router.
//!
//! The wire protocol lives behind these traits. A [`Transport`] opens a [`Link`] to an
//! address, the link resolves the one [`WriteTarget`] tails accept commands on, and the
//! pair is bundled into a cloneable [`Handle`] that the registry stores for the device.

pub mod sim;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("write failed: {0}")]
    Write(String),

    #[error("link is not ready")]
    NotReady,

    #[error("scan failed: {0}")]
    Scan(String),
}

/// Opens connections to peripherals by address
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the peripheral at `address`.
    ///
    /// Implementations need not bound the call; callers wrap it in a timeout.
    async fn connect(&self, address: &str) -> Result<Arc<dyn Link>, TransportError>;
}

/// One physical connection to a peripheral
#[async_trait]
pub trait Link: Send + Sync {
    /// Resolve the service/characteristic commands are written to.
    ///
    /// Called once after connect; a missing target counts as a connect failure.
    async fn discover_write_target(&self) -> Result<Arc<dyn WriteTarget>, TransportError>;

    /// Tear the connection down. Must be safe to call more than once.
    async fn disconnect(&self);

    /// Liveness check
    fn is_ready(&self) -> bool;
}

/// Destination for command bytes on a connected peripheral
#[async_trait]
pub trait WriteTarget: Send + Sync {
    /// Write `bytes`. May block indefinitely; callers bound it with
    /// [`Handle::write_bounded`].
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Active connection for one device.
///
/// Clones share the link and the ready flag, so a failed write through any clone (router or
/// heartbeat) is observed by the owning supervisor on its next tick.
#[derive(Clone)]
pub struct Handle {
    address: Arc<str>,
    link: Arc<dyn Link>,
    target: Arc<dyn WriteTarget>,
    ready: Arc<AtomicBool>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("address", &self.address)
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish()
    }
}

impl Handle {
    pub fn new(address: &str, link: Arc<dyn Link>, target: Arc<dyn WriteTarget>) -> Self {
        Self {
            address: Arc::from(address),
            link,
            target,
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Connect to `address` and resolve its write target, both within `timeout`.
    ///
    /// A link whose target cannot be resolved in time is disconnected before returning.
    /// If the returned future is dropped mid-resolution, the link is disconnected on a
    /// background task.
    pub async fn open(
        transport: &dyn Transport,
        address: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;

        let link = tokio::time::timeout_at(deadline, transport.connect(address))
            .await
            .map_err(|_| TransportError::ConnectTimeout(timeout))??;
        let mut guard = LinkGuard(Some(link.clone()));

        let error = match tokio::time::timeout_at(deadline, link.discover_write_target()).await {
            Ok(Ok(target)) => {
                guard.disarm();
                return Ok(Self::new(address, link, target));
            }
            Ok(Err(e)) => e,
            Err(_) => TransportError::ConnectTimeout(timeout),
        };

        link.disconnect().await;
        guard.disarm();
        Err(error)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// True until a write fails or the link reports it gone
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.link.is_ready()
    }

    pub fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Write `bytes` on a fresh task, giving up after `timeout`.
    ///
    /// A timeout or error marks the handle not-ready. A write still in flight when the
    /// timeout fires is abandoned, not cancelled.
    pub async fn write_bounded(
        &self,
        bytes: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }

        let bytes = bytes.into();
        let target = self.target.clone();
        let task = tokio::spawn(async move { target.write(&bytes).await });

        let result = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(TransportError::Write(join_error.to_string())),
            Err(_) => Err(TransportError::WriteTimeout(timeout)),
        };

        if let Err(e) = &result {
            debug!("write to {} failed: {}", self.address, e);
            self.mark_not_ready();
        }
        result
    }

    /// Release the connection. Idempotent.
    pub async fn disconnect(&self) {
        self.mark_not_ready();
        self.link.disconnect().await;
    }
}

/// Disconnects a half-opened link if `Handle::open` is dropped before it finishes
struct LinkGuard(Option<Arc<dyn Link>>);

impl LinkGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        let Some(link) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { link.disconnect().await });
            }
            Err(_) => debug!("No runtime to disconnect abandoned link"),
        }
    }
}
