//! Download task entity and state machine
//!
//! A [`DownloadTask`] is the mutable record for one download: identity
//! (monotonic id + locator), target path, immutable transfer configuration,
//! and live state (status, time accounting, captured failure). Live state
//! sits behind a single lock so timestamp stamping and status transitions
//! are atomic with respect to concurrent `used_time()` readers.

use crate::engine::ProgressSink;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use downkit_types::{TaskSnapshot, TaskStatus, TransferConfig};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Id carried by a task after `destroy()`; never produced by the generator.
pub const INVALID_TASK_ID: u64 = 0;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

struct TaskInner {
    id: u64,
    url: String,
    target: Option<PathBuf>,
    authority: String,
    custom_target: bool,
    config: TransferConfig,
    status: TaskStatus,
    begin: Option<Instant>,
    pause: Option<Instant>,
    end: Option<Instant>,
    pause_delta: Duration,
    error: Option<EngineError>,
    sink: Option<Arc<dyn ProgressSink>>,
    created_at: DateTime<Utc>,
}

/// One download's identity, configuration, and live state.
///
/// Shared as `Arc<DownloadTask>` between the dispatcher, the registry, and
/// the executing engine. Once admitted, only the engine and the orchestrator
/// mutate it; callers read.
pub struct DownloadTask {
    inner: RwLock<TaskInner>,
    total_length: AtomicU64,
    connect_attempts: AtomicU32,
}

impl DownloadTask {
    fn from_parts(
        url: String,
        target: Option<PathBuf>,
        authority: String,
        config: TransferConfig,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        Self {
            inner: RwLock::new(TaskInner {
                id: next_task_id(),
                url,
                target,
                authority,
                custom_target: false,
                config,
                status: TaskStatus::New,
                begin: None,
                pause: None,
                end: None,
                pause_delta: Duration::ZERO,
                error: None,
                sink,
                created_at: Utc::now(),
            }),
            total_length: AtomicU64::new(0),
            connect_attempts: AtomicU32::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.inner.read().id
    }

    pub fn url(&self) -> String {
        self.inner.read().url.clone()
    }

    pub fn target(&self) -> Option<PathBuf> {
        self.inner.read().target.clone()
    }

    pub fn authority(&self) -> String {
        self.inner.read().authority.clone()
    }

    pub fn is_custom_target(&self) -> bool {
        self.inner.read().custom_target
    }

    pub fn config(&self) -> TransferConfig {
        self.inner.read().config.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.read().status
    }

    pub fn total_length(&self) -> u64 {
        self.total_length.load(Ordering::Acquire)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<EngineError> {
        self.inner.read().error.clone()
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn ProgressSink>> {
        self.inner.read().sink.clone()
    }

    /// A task is viable while it still has an identity and a locator.
    /// `destroy()` makes it non-viable.
    pub fn is_viable(&self) -> bool {
        let inner = self.inner.read();
        inner.id != INVALID_TASK_ID && !inner.url.is_empty()
    }

    // ------------------------------------------------------------------
    // Engine-side mutation
    // ------------------------------------------------------------------

    pub(crate) fn set_total_length(&self, total: u64) {
        self.total_length.store(total, Ordering::Release);
    }

    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_failure(&self, error: EngineError) {
        self.inner.write().error = Some(error);
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    pub(crate) fn mark_pending(&self) {
        let mut inner = self.inner.write();
        inner.status = TaskStatus::Pending;
        inner.error = None;
    }

    /// First byte / connection established: fold any paused interval into
    /// the accumulated delta and move to `Downloading`.
    pub(crate) fn mark_started(&self, now: Instant) {
        let mut inner = self.inner.write();
        if inner.status.is_terminal() {
            warn!(id = inner.id, "ignoring start on a terminal task");
            return;
        }
        update_time(&mut inner, now);
        inner.status = TaskStatus::Downloading;
    }

    /// Stamp the pause time and move to `Paused` in one step.
    pub(crate) fn mark_paused(&self, now: Instant) {
        let mut inner = self.inner.write();
        inner.pause = Some(now);
        inner.status = TaskStatus::Paused;
    }

    /// Stamp the end time and move to `Completed` in one step.
    pub(crate) fn mark_completed(&self, now: Instant) {
        let mut inner = self.inner.write();
        inner.end = Some(now);
        inner.status = TaskStatus::Completed;
    }

    pub(crate) fn mark_cancelled(&self) {
        self.inner.write().status = TaskStatus::Cancelled;
    }

    /// Elapsed transfer time, excluding every paused interval.
    pub fn used_time(&self) -> Duration {
        self.used_time_at(Instant::now())
    }

    /// Like [`used_time`](Self::used_time) with an injected "now", for
    /// deterministic accounting.
    pub fn used_time_at(&self, now: Instant) -> Duration {
        let inner = self.inner.read();
        match inner.status {
            TaskStatus::Downloading => match inner.begin {
                Some(begin) => now
                    .saturating_duration_since(begin)
                    .saturating_sub(inner.pause_delta),
                None => Duration::ZERO,
            },
            TaskStatus::Completed => match (inner.begin, inner.end) {
                (Some(begin), Some(end)) => end
                    .saturating_duration_since(begin)
                    .saturating_sub(inner.pause_delta),
                _ => Duration::ZERO,
            },
            _ => Duration::ZERO,
        }
    }

    /// Full reset to the NEW baseline: id invalidated, locator cleared,
    /// configuration back to defaults. Used when a task object is recycled.
    pub fn destroy(&self) {
        let mut inner = self.inner.write();
        inner.id = INVALID_TASK_ID;
        inner.url.clear();
        inner.target = None;
        inner.authority.clear();
        inner.custom_target = false;
        inner.config = TransferConfig::default();
        inner.status = TaskStatus::New;
        inner.begin = None;
        inner.pause = None;
        inner.end = None;
        inner.pause_delta = Duration::ZERO;
        inner.error = None;
        inner.sink = None;
        self.total_length.store(0, Ordering::Release);
        self.connect_attempts.store(0, Ordering::Release);
    }

    /// Derive a fresh task from this one's configuration: new id, zeroed
    /// live state, and deliberately **no** listener reference.
    pub fn derive(&self) -> Arc<DownloadTask> {
        let inner = self.inner.read();
        Arc::new(DownloadTask::from_parts(
            inner.url.clone(),
            inner.target.clone(),
            inner.authority.clone(),
            inner.config.clone(),
            None,
        ))
    }

    /// Resolve the destination at admission time: fill in a default path
    /// under the storage root, flag custom paths, and enforce the rule that
    /// a progress indicator on a custom path requires an authority token.
    pub(crate) fn finalize_target(&self, storage_root: &Path) {
        let mut inner = self.inner.write();
        if inner.target.is_none() {
            let name = default_file_name(&inner.url);
            inner.target = Some(storage_root.join(name));
        }
        let custom = inner
            .target
            .as_ref()
            .map(|p| !p.starts_with(storage_root))
            .unwrap_or(false);
        inner.custom_target = custom;
        if custom && inner.config.enable_indicator && inner.authority.is_empty() {
            warn!(
                url = %inner.url,
                "custom target without an authority token, disabling the progress indicator"
            );
            inner.config.enable_indicator = false;
        }
    }

    /// Serializable point-in-time view.
    pub fn snapshot(&self) -> TaskSnapshot {
        let used_time = self.used_time();
        let inner = self.inner.read();
        TaskSnapshot {
            id: inner.id,
            url: inner.url.clone(),
            target: inner.target.clone(),
            status: inner.status,
            total_length: self.total_length.load(Ordering::Acquire),
            used_time,
            connect_attempts: self.connect_attempts.load(Ordering::Acquire),
            error: inner.error.as_ref().map(|e| e.to_string()),
            created_at: inner.created_at,
        }
    }
}

/// Time bookkeeping on (re)start. First start stamps `begin`; a restart
/// after a pause folds `|now - pause|` into the accumulated pause delta.
/// The pause stamp is consumed by the fold: a reconnect mid-run restarts
/// again without a fresh pause and must not re-count the old gap.
fn update_time(inner: &mut TaskInner, now: Instant) {
    match inner.begin {
        None => inner.begin = Some(now),
        Some(begin) if begin != now => {
            if let Some(pause) = inner.pause.take() {
                let gap = now
                    .checked_duration_since(pause)
                    .or_else(|| pause.checked_duration_since(now))
                    .unwrap_or_default();
                inner.pause_delta += gap;
            }
        }
        _ => {}
    }
}

fn default_file_name(url: &str) -> String {
    let tail = url.split('?').next().unwrap_or(url);
    let name = tail.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        "download".to_string()
    } else {
        name.to_string()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder-style request for one download, finalized by `build()`.
pub struct TaskBuilder {
    url: String,
    target: Option<PathBuf>,
    authority: String,
    config: TransferConfig,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl TaskBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            target: None,
            authority: String::new(),
            config: TransferConfig::default(),
            sink: None,
        }
    }

    /// Destination file path.
    pub fn target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self.authority.clear();
        self
    }

    /// Destination file path plus the authority token required for a
    /// progress indicator on a custom path.
    pub fn target_with_authority(
        mut self,
        target: impl Into<PathBuf>,
        authority: impl Into<String>,
    ) -> Self {
        self.target = Some(target.into());
        self.authority = authority.into();
        self
    }

    /// Add one request header; later values replace earlier ones per key.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(key.into(), value.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.config.transfer_timeout = Some(timeout);
        self
    }

    pub fn block_timeout(mut self, timeout: Duration) -> Self {
        self.config.block_timeout = timeout;
        self
    }

    pub fn force_redownload(mut self, force: bool) -> Self {
        self.config.force_redownload = force;
        self
    }

    pub fn parallel_segments(mut self, parallel: bool) -> Self {
        self.config.parallel_segments = parallel;
        self
    }

    pub fn breakpoint_resume(mut self, resume: bool) -> Self {
        self.config.breakpoint_resume = resume;
        self
    }

    pub fn unique_target(mut self, unique: bool) -> Self {
        self.config.unique_target = unique;
        self
    }

    pub fn auto_open(mut self, auto_open: bool) -> Self {
        self.config.auto_open = auto_open;
        self
    }

    pub fn enable_indicator(mut self, enable: bool) -> Self {
        self.config.enable_indicator = enable;
        self
    }

    /// Per-task progress sink, overriding the dispatcher's global sink.
    pub fn sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Arc<DownloadTask> {
        Arc::new(DownloadTask::from_parts(
            self.url,
            self.target,
            self.authority,
            self.config,
            self.sink,
        ))
    }
}
