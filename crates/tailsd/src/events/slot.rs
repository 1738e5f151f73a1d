//! Single-slot, overwrite-on-full event queue.
//!
//! Holds at most one pending event. Sending never blocks: a new event replaces one that
//! has not been received yet, so the receiver always sees the latest value.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;

use super::InboundEvent;

#[derive(Debug, Default)]
struct Shared {
    slot: Mutex<Option<InboundEvent>>,
    notify: Notify,
    replaced: AtomicU64,
    senders: AtomicUsize,
    closed: AtomicBool,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<InboundEvent>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a connected sender/receiver pair
pub fn channel() -> (EventSender, EventReceiver) {
    let shared = Arc::new(Shared {
        senders: AtomicUsize::new(1),
        ..Default::default()
    });
    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

/// Producer half. The queue closes when the last sender is dropped.
#[derive(Debug)]
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Store `event`, replacing any pending one. Returns true if an event was replaced.
    pub fn send(&self, event: InboundEvent) -> bool {
        let replaced = self.shared.slot().replace(event).is_some();
        if replaced {
            self.shared.replaced.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        replaced
    }

    /// Number of events discarded because a newer one arrived first
    pub fn replaced(&self) -> u64 {
        self.shared.replaced.load(Ordering::Relaxed)
    }
}

impl Clone for EventSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.closed.store(true, Ordering::Release);
            self.shared.notify.notify_one();
        }
    }
}

/// Consumer half
#[derive(Debug)]
pub struct EventReceiver {
    shared: Arc<Shared>,
}

impl EventReceiver {
    /// Wait for the next event. Returns `None` once every sender is gone and the slot is
    /// empty.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the pending event, if any
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.shared.slot().take()
    }

    pub fn replaced(&self) -> u64 {
        self.shared.replaced.load(Ordering::Relaxed)
    }
}
