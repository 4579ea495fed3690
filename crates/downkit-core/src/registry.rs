//! Task registry - at most one active transfer per locator
//!
//! The registry is the single source of truth for "is this locator
//! currently active". Admission is an atomic insert-if-absent; pause and
//! cancel signal the engine handle, detach the entry, and return the task
//! to the caller. Every operation is a total function over the map and is
//! non-blocking.

use crate::task::DownloadTask;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Why the stop signal was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Pause,
    Cancel,
}

const REASON_NONE: u8 = 0;
const REASON_PAUSE: u8 = 1;
const REASON_CANCEL: u8 = 2;

/// Best-effort stop flag polled by the transfer loop, with the reason the
/// completion path uses to tell a user pause from a cancel.
pub struct StopSignal {
    reason: AtomicU8,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            reason: AtomicU8::new(REASON_NONE),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.reason.load(Ordering::Acquire) != REASON_NONE
    }

    pub fn reason(&self) -> Option<StopReason> {
        match self.reason.load(Ordering::Acquire) {
            REASON_PAUSE => Some(StopReason::Pause),
            REASON_CANCEL => Some(StopReason::Cancel),
            _ => None,
        }
    }

    fn raise(&self, reason: StopReason) {
        let value = match reason {
            StopReason::Pause => REASON_PAUSE,
            StopReason::Cancel => REASON_CANCEL,
        };
        // First signal wins; a pause racing a cancel keeps whichever
        // registry removal happened first.
        let _ = self
            .reason
            .compare_exchange(REASON_NONE, value, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime reference to an executing engine, allowing the registry to
/// signal stop/cancel to an in-progress transfer.
#[derive(Clone)]
pub struct EngineHandle {
    stop: Arc<StopSignal>,
}

impl EngineHandle {
    pub fn new(stop: Arc<StopSignal>) -> Self {
        Self { stop }
    }

    pub fn stop_for_pause(&self) {
        self.stop.raise(StopReason::Pause);
    }

    pub fn stop_for_cancel(&self) {
        self.stop.raise(StopReason::Cancel);
    }
}

struct ActiveEntry {
    task: Arc<DownloadTask>,
    handle: EngineHandle,
}

/// Concurrent map from locator to in-flight task + engine handle.
pub struct TaskRegistry {
    entries: Mutex<HashMap<String, ActiveEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically insert the task keyed by its locator iff absent.
    /// Returns `false` (and starts nothing) if the locator is already
    /// active: at most one concurrently executing transfer per locator.
    pub fn admit(&self, task: Arc<DownloadTask>, handle: EngineHandle) -> bool {
        let url = task.url();
        let mut entries = self.entries.lock();
        if entries.contains_key(&url) {
            debug!(%url, "admission rejected, locator already active");
            return false;
        }
        entries.insert(url, ActiveEntry { task, handle });
        true
    }

    /// Detach and return the entry if present. Used on natural completion.
    pub fn remove(&self, url: &str) -> Option<Arc<DownloadTask>> {
        self.entries.lock().remove(url).map(|entry| entry.task)
    }

    /// Signal cancel, detach, and return the task with its status
    /// untouched; the terminal `Cancelled` transition belongs to the
    /// completion path once the engine has honored the signal.
    pub fn cancel_one(&self, url: &str) -> Option<Arc<DownloadTask>> {
        let entry = self.entries.lock().remove(url)?;
        entry.handle.stop_for_cancel();
        Some(entry.task)
    }

    /// Cancel every active entry; returns the affected tasks.
    pub fn cancel_all(&self) -> Vec<Arc<DownloadTask>> {
        let entries: Vec<ActiveEntry> = {
            let mut map = self.entries.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        entries
            .into_iter()
            .map(|entry| {
                entry.handle.stop_for_cancel();
                entry.task
            })
            .collect()
    }

    /// Signal pause, detach, stamp the pause time, and return the task as
    /// `Paused`. The caller takes ownership of what happens next.
    pub fn pause_one(&self, url: &str) -> Option<Arc<DownloadTask>> {
        let entry = self.entries.lock().remove(url)?;
        entry.handle.stop_for_pause();
        entry.task.mark_paused(Instant::now());
        Some(entry.task)
    }

    /// Pause every active entry; returns the affected tasks.
    pub fn pause_all(&self) -> Vec<Arc<DownloadTask>> {
        let entries: Vec<ActiveEntry> = {
            let mut map = self.entries.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        let now = Instant::now();
        entries
            .into_iter()
            .map(|entry| {
                entry.handle.stop_for_pause();
                entry.task.mark_paused(now);
                entry.task
            })
            .collect()
    }

    pub fn exists(&self, url: &str) -> bool {
        self.entries.lock().contains_key(url)
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
