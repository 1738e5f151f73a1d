//! Notification sinks.
//!
//! The core reports connection progress as console lines and status-label changes. It owns
//! no rendering; a frontend (or the log) decides what to do with them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tracing::info;

use crate::device::DeviceStatus;

/// Sink for user-facing notifications
pub trait Console: Send + Sync {
    /// Append one line to the console
    fn append(&self, message: &str);

    /// Change the status label shown for a device
    fn apply_status(&self, device_id: &str, status: DeviceStatus);
}

/// Forwards notifications to the `tailsd::console` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogConsole;

impl Console for LogConsole {
    fn append(&self, message: &str) {
        info!(target: "tailsd::console", "{}", message);
    }

    fn apply_status(&self, device_id: &str, status: DeviceStatus) {
        info!(target: "tailsd::console", device = device_id, "status: {}", status);
    }
}

/// Keeps the most recent lines and status changes in memory, each bounded to `limit`
#[derive(Debug)]
pub struct RecordingConsole {
    limit: usize,
    lines: Mutex<VecDeque<String>>,
    statuses: Mutex<VecDeque<(String, DeviceStatus)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) {
    queue.push_back(item);
    while queue.len() > limit {
        queue.pop_front();
    }
}

/// Lines kept by default
pub const DEFAULT_CONSOLE_LINES: usize = 200;

impl Default for RecordingConsole {
    fn default() -> Self {
        Self::new(DEFAULT_CONSOLE_LINES)
    }
}

impl RecordingConsole {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            lines: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
        }
    }

    /// Retained lines, oldest first
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).iter().cloned().collect()
    }

    /// Number of retained lines containing `needle`
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }

    /// Retained status changes, oldest first
    pub fn statuses(&self) -> Vec<(String, DeviceStatus)> {
        lock(&self.statuses).iter().cloned().collect()
    }

    /// Most recent status applied to `device_id`
    pub fn status_of(&self, device_id: &str) -> Option<DeviceStatus> {
        self.statuses()
            .into_iter()
            .rev()
            .find(|(id, _)| id == device_id)
            .map(|(_, status)| status)
    }
}

impl Console for RecordingConsole {
    fn append(&self, message: &str) {
        push_bounded(&mut lock(&self.lines), message.to_string(), self.limit);
    }

    fn apply_status(&self, device_id: &str, status: DeviceStatus) {
        push_bounded(
            &mut lock(&self.statuses),
            (device_id.to_string(), status),
            self.limit,
        );
    }
}

/// Sends every notification to each inner sink in order
#[derive(Clone, Default)]
pub struct FanoutConsole {
    sinks: Vec<Arc<dyn Console>>,
}

impl FanoutConsole {
    pub fn new(sinks: Vec<Arc<dyn Console>>) -> Self {
        Self { sinks }
    }
}

impl Console for FanoutConsole {
    fn append(&self, message: &str) {
        for sink in &self.sinks {
            sink.append(message);
        }
    }

    fn apply_status(&self, device_id: &str, status: DeviceStatus) {
        for sink in &self.sinks {
            sink.apply_status(device_id, status);
        }
    }
}
