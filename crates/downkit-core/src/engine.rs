//! Engine-facing seam of the core
//!
//! The byte-level transfer engine is an external collaborator: the core
//! hands it a task plus a [`TransferControl`] and expects it to honor the
//! stop signal at its next safe checkpoint. Lifecycle notifications flow
//! back through a [`ProgressSink`].

use crate::error::EngineError;
use crate::registry::StopSignal;
use crate::task::DownloadTask;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// How an engine run ended, short of an error.
#[derive(Debug)]
pub enum TransferOutcome {
    /// The whole body landed in the returned file.
    Completed(PathBuf),
    /// The engine observed the stop signal and quit at a safe checkpoint.
    Stopped,
}

/// A byte-level transfer engine.
///
/// Implementations must poll [`TransferControl::is_stopped`] between blocks
/// and return [`TransferOutcome::Stopped`] promptly once it is raised; after
/// returning they must not touch the task again.
#[async_trait]
pub trait TransferEngine: Send + Sync + 'static {
    async fn transfer(
        &self,
        task: Arc<DownloadTask>,
        ctrl: TransferControl,
    ) -> Result<TransferOutcome, EngineError>;
}

/// Receives lifecycle callbacks for a task, keyed by its locator.
///
/// All methods default to no-ops so sinks implement only what they need.
pub trait ProgressSink: Send + Sync + 'static {
    fn on_start(&self, _task: &DownloadTask) {}
    fn on_progress(&self, _task: &DownloadTask, _downloaded: u64, _total: Option<u64>) {}
    fn on_complete(&self, _task: &DownloadTask, _target: &Path) {}
    fn on_error(&self, _task: &DownloadTask, _error: &EngineError) {}
}

/// Sink that ignores every callback.
pub struct NoopSink;

impl ProgressSink for NoopSink {}

/// Control surface handed to the engine for one run: stop polling plus the
/// task- and sink-updating half of the lifecycle callbacks.
pub struct TransferControl {
    stop: Arc<StopSignal>,
    task: Arc<DownloadTask>,
    sink: Arc<dyn ProgressSink>,
    started: AtomicBool,
}

impl TransferControl {
    pub(crate) fn new(
        stop: Arc<StopSignal>,
        task: Arc<DownloadTask>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            stop,
            task,
            sink,
            started: AtomicBool::new(false),
        }
    }

    /// Best-effort stop signal; poll between blocks.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Call once the connection is established and the first bytes are
    /// about to flow. Transitions the task to `Downloading` and fires
    /// `on_start` exactly once per run; safe to call again on reconnects.
    pub fn mark_connected(&self) {
        self.task.mark_started(Instant::now());
        if !self.started.swap(true, Ordering::AcqRel) {
            self.sink.on_start(&self.task);
        }
    }

    /// Record transferred bytes and, when known, the expected total.
    pub fn report_progress(&self, downloaded: u64, total: Option<u64>) {
        if let Some(total) = total {
            self.task.set_total_length(total);
        }
        self.sink.on_progress(&self.task, downloaded, total);
    }

    /// Count one connection attempt (initial connect or retry).
    pub fn record_connect_attempt(&self) {
        self.task.record_connect_attempt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;
    use downkit_types::TaskStatus;
    use parking_lot::Mutex;

    struct CountingSink {
        starts: Mutex<u32>,
    }

    impl ProgressSink for CountingSink {
        fn on_start(&self, _task: &DownloadTask) {
            *self.starts.lock() += 1;
        }
    }

    #[test]
    fn mark_connected_fires_on_start_once() {
        let task = TaskBuilder::new("http://example.com/a").build();
        let sink = Arc::new(CountingSink {
            starts: Mutex::new(0),
        });
        let ctrl = TransferControl::new(Arc::new(StopSignal::new()), task.clone(), sink.clone());

        ctrl.mark_connected();
        ctrl.mark_connected();

        assert_eq!(*sink.starts.lock(), 1);
        assert_eq!(task.status(), TaskStatus::Downloading);
    }

    #[test]
    fn report_progress_records_total_length() {
        let task = TaskBuilder::new("http://example.com/a").build();
        let ctrl =
            TransferControl::new(Arc::new(StopSignal::new()), task.clone(), Arc::new(NoopSink));
        ctrl.report_progress(128, Some(4096));
        assert_eq!(task.total_length(), 4096);
    }
}
