//! Downkit Core - download orchestration
//!
//! This crate provides the task registry, task state machine, and the
//! sync/async bridging protocol for a client-side download manager. The
//! byte-level transfer engine and the progress UI are external
//! collaborators: the core drives a [`TransferEngine`] it does not
//! implement and emits lifecycle events into a [`ProgressSink`].

mod bridge;
mod engine;
mod error;
mod registry;
mod task;

pub use engine::{NoopSink, ProgressSink, TransferControl, TransferEngine, TransferOutcome};
pub use error::{DownkitError, EngineError};
pub use registry::{EngineHandle, StopReason, StopSignal, TaskRegistry};
pub use task::{DownloadTask, TaskBuilder, INVALID_TASK_ID};

pub use downkit_types::{TaskSnapshot, TaskStatus, TransferConfig};

use bridge::{CompletionGate, FetchOutcome};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

/// Dispatcher-level configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Default storage root; targets outside it are flagged as custom
    /// paths.
    pub storage_root: PathBuf,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            storage_root: dirs::download_dir()
                .map(|d| d.join("downkit"))
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// Public entry point: validates requests, routes them to async or sync
/// execution, and coordinates the registry and the paused-task store.
///
/// Explicitly constructed at the composition root (no global singleton);
/// cheap to clone, all state is shared behind `Arc`s.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    /// Tasks pulled out of the registry by a pause, pending resume.
    paused: Arc<Mutex<HashMap<String, Arc<DownloadTask>>>>,
    engine: Arc<dyn TransferEngine>,
    sink: Arc<dyn ProgressSink>,
    config: Arc<DispatcherConfig>,
    /// The designated dispatch runtime; every engine run is spawned here.
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        sink: Arc<dyn ProgressSink>,
        config: DispatcherConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            registry: Arc::new(TaskRegistry::new()),
            paused: Arc::new(Mutex::new(HashMap::new())),
            engine,
            sink,
            config: Arc::new(config),
            runtime,
        }
    }

    // ========================================================================
    // Async path
    // ========================================================================

    /// Admit the task and start a transfer for it. Returns `Ok(false)`
    /// without starting an engine if the locator is already active.
    pub fn enqueue(&self, task: Arc<DownloadTask>) -> Result<bool, DownkitError> {
        self.validate(&task)?;
        Ok(self.start_transfer(task, None))
    }

    /// Signal pause, detach the task, and stash it for a later resume.
    /// This is the only path that populates the paused-task store.
    pub fn pause(&self, url: &str) -> Option<Arc<DownloadTask>> {
        let task = self.registry.pause_one(url)?;
        self.paused.lock().insert(task.url(), task.clone());
        info!(%url, "download paused");
        Some(task)
    }

    /// Pause every active transfer; returns the affected tasks.
    pub fn pause_all(&self) -> Vec<Arc<DownloadTask>> {
        let tasks = self.registry.pause_all();
        let mut paused = self.paused.lock();
        for task in &tasks {
            paused.insert(task.url(), task.clone());
        }
        tasks
    }

    /// Re-enqueue a previously paused task. The stored entry is claimed
    /// before re-admission, so a pause of the freshly re-admitted run can
    /// never be wiped out by the resume that started it; a rejected
    /// admission reinstates the entry without clobbering a newer pause.
    /// Returns `false` if nothing resumable is stored for the locator or
    /// admission is rejected.
    pub fn resume(&self, url: &str) -> bool {
        let task = {
            let mut paused = self.paused.lock();
            match paused.entry(url.to_string()) {
                Entry::Vacant(_) => {
                    error!(%url, "no paused download to resume");
                    return false;
                }
                Entry::Occupied(entry) => {
                    if !entry.get().is_viable() {
                        error!(%url, "paused download task is dead");
                        return false;
                    }
                    entry.remove()
                }
            }
        };
        if self.start_transfer(task.clone(), None) {
            true
        } else {
            self.paused.lock().entry(url.to_string()).or_insert(task);
            false
        }
    }

    /// Re-enqueue every stored task from a point-in-time snapshot of the
    /// store's locators. Dead entries are logged and skipped; one bad task
    /// never aborts the rest. Returns the number of tasks re-admitted.
    pub fn resume_all(&self) -> usize {
        let urls: Vec<String> = self.paused.lock().keys().cloned().collect();
        urls.into_iter().filter(|url| self.resume(url)).count()
    }

    /// Signal cancel and detach the task; the terminal `Cancelled`
    /// transition happens once the engine honors the stop signal.
    pub fn cancel(&self, url: &str) -> Option<Arc<DownloadTask>> {
        self.registry.cancel_one(url)
    }

    /// Cancel every active transfer; returns the affected tasks.
    pub fn cancel_all(&self) -> Vec<Arc<DownloadTask>> {
        self.registry.cancel_all()
    }

    pub fn exists(&self, url: &str) -> bool {
        self.registry.exists(url)
    }

    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    pub fn paused_count(&self) -> usize {
        self.paused.lock().len()
    }

    // ========================================================================
    // Blocking path (sync bridge)
    // ========================================================================

    /// Drive a transfer to completion and block the calling thread until it
    /// resolves. Must not be called from a runtime thread.
    pub fn blocking_fetch(&self, task: Arc<DownloadTask>) -> Result<PathBuf, DownkitError> {
        if Handle::try_current().is_ok() {
            return Err(DownkitError::Precondition(
                "blocking_fetch must not be called from the dispatch runtime".into(),
            ));
        }
        self.validate(&task)?;

        let url = task.url();
        let gate = Arc::new(CompletionGate::new());
        let (verdict_tx, verdict_rx) = tokio::sync::oneshot::channel();
        {
            let this = self.clone();
            let task = task.clone();
            let gate = gate.clone();
            self.runtime.spawn(async move {
                let admitted = this.start_transfer(task, Some(gate));
                let _ = verdict_tx.send(admitted);
            });
        }

        let admitted = verdict_rx.blocking_recv().map_err(|_| {
            DownkitError::Precondition("dispatch runtime shut down before admission".into())
        })?;
        if !admitted {
            return Err(DownkitError::DuplicateTask(url));
        }

        match gate.wait() {
            FetchOutcome::Completed(path) => Ok(path),
            FetchOutcome::Failed(cause) => Err(DownkitError::Engine(cause)),
            FetchOutcome::Cancelled => Err(DownkitError::Cancelled),
            FetchOutcome::Paused => Err(DownkitError::Paused),
        }
    }

    /// Non-raising variant of [`blocking_fetch`](Self::blocking_fetch):
    /// failures are logged and swallowed into `None`.
    pub fn blocking_fetch_or_none(&self, task: Arc<DownloadTask>) -> Option<PathBuf> {
        match self.blocking_fetch(task) {
            Ok(path) => Some(path),
            Err(cause) => {
                warn!(%cause, "blocking fetch failed");
                None
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn validate(&self, task: &DownloadTask) -> Result<(), DownkitError> {
        if !task.is_viable() {
            return Err(DownkitError::Precondition(
                "task has no identity or locator".into(),
            ));
        }
        let url = task.url();
        url::Url::parse(&url)
            .map_err(|e| DownkitError::Precondition(format!("invalid locator {url:?}: {e}")))?;
        Ok(())
    }

    /// Admit the task and spawn an engine run for it. Returns `false`
    /// without side effects if the locator is already active.
    fn start_transfer(&self, task: Arc<DownloadTask>, gate: Option<Arc<CompletionGate>>) -> bool {
        let stop = Arc::new(StopSignal::new());
        if !self.registry.admit(task.clone(), EngineHandle::new(stop.clone())) {
            // The caller learns about the rejection through the admission
            // verdict; the gate is never armed for a rejected task.
            return false;
        }
        task.finalize_target(&self.config.storage_root);
        task.mark_pending();
        info!(url = %task.url(), id = task.id(), "download admitted");

        let sink = task.sink().unwrap_or_else(|| self.sink.clone());
        let ctrl = TransferControl::new(stop.clone(), task.clone(), sink.clone());
        let engine = self.engine.clone();
        let registry = self.registry.clone();
        self.runtime.spawn(async move {
            let result = engine.transfer(task.clone(), ctrl).await;
            Self::finish(&registry, &task, &stop, sink.as_ref(), gate, result);
        });
        true
    }

    /// Single place that maps an engine result plus the stop reason to the
    /// terminal state, registry removal, sink callbacks, and gate
    /// resolution. Runs exactly once per admission, so a blocked sync
    /// caller always wakes up.
    fn finish(
        registry: &TaskRegistry,
        task: &Arc<DownloadTask>,
        stop: &StopSignal,
        sink: &dyn ProgressSink,
        gate: Option<Arc<CompletionGate>>,
        result: Result<TransferOutcome, EngineError>,
    ) {
        let url = task.url();
        // Pause and cancel detach the entry themselves; if the signal was
        // raised, any entry now present belongs to a newer admission and
        // must be left alone.
        let detached = stop.reason().is_some();
        let outcome = match result {
            Ok(TransferOutcome::Completed(path)) => {
                if !detached {
                    registry.remove(&url);
                }
                task.mark_completed(Instant::now());
                info!(%url, "download completed");
                sink.on_complete(task, &path);
                FetchOutcome::Completed(path)
            }
            Ok(TransferOutcome::Stopped) => match stop.reason() {
                Some(StopReason::Pause) => {
                    // The registry already detached and stamped the task;
                    // the engine must not touch it past this point.
                    FetchOutcome::Paused
                }
                Some(StopReason::Cancel) => {
                    task.mark_cancelled();
                    info!(%url, "download cancelled");
                    FetchOutcome::Cancelled
                }
                None => {
                    // An engine must not report Stopped unsignalled; treat
                    // it as a cancel so a blocked waiter still resolves.
                    warn!(%url, "engine stopped without a stop signal");
                    registry.remove(&url);
                    task.mark_cancelled();
                    FetchOutcome::Cancelled
                }
            },
            Err(cause) => {
                if !detached {
                    registry.remove(&url);
                }
                task.record_failure(cause.clone());
                warn!(%url, %cause, "download failed");
                sink.on_error(task, &cause);
                FetchOutcome::Failed(cause)
            }
        };
        if let Some(gate) = gate {
            gate.complete(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Engine that "transfers" for a fixed duration, polling the stop
    /// signal, then completes with the task's target (or fails).
    struct MockEngine {
        work: Duration,
        fail: Option<EngineError>,
        starts: AtomicUsize,
    }

    impl MockEngine {
        fn completing(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                work,
                fail: None,
                starts: AtomicUsize::new(0),
            })
        }

        fn failing(work: Duration, cause: EngineError) -> Arc<Self> {
            Arc::new(Self {
                work,
                fail: Some(cause),
                starts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TransferEngine for MockEngine {
        async fn transfer(
            &self,
            task: Arc<DownloadTask>,
            ctrl: TransferControl,
        ) -> Result<TransferOutcome, EngineError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            ctrl.record_connect_attempt();
            ctrl.mark_connected();
            let deadline = Instant::now() + self.work;
            while Instant::now() < deadline {
                if ctrl.is_stopped() {
                    return Ok(TransferOutcome::Stopped);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                ctrl.report_progress(1, Some(100));
            }
            if let Some(cause) = &self.fail {
                return Err(cause.clone());
            }
            Ok(TransferOutcome::Completed(
                task.target()
                    .unwrap_or_else(|| std::env::temp_dir().join("downkit-mock.bin")),
            ))
        }
    }

    fn dispatcher_with(engine: Arc<MockEngine>) -> (Dispatcher, tokio::runtime::Runtime) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let config = DispatcherConfig {
            storage_root: std::env::temp_dir(),
        };
        let dispatcher = Dispatcher::new(engine, Arc::new(NoopSink), config, rt.handle().clone());
        (dispatcher, rt)
    }

    fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn enqueue_rejects_duplicate_locator() {
        let engine = MockEngine::completing(Duration::from_secs(5));
        let (dispatcher, _rt) = dispatcher_with(engine.clone());

        let task = TaskBuilder::new("http://example.com/dup.bin").build();
        assert!(dispatcher.enqueue(task).unwrap());
        assert!(wait_until(Duration::from_secs(2), || {
            dispatcher.exists("http://example.com/dup.bin")
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            engine.starts.load(Ordering::SeqCst) == 1
        }));

        let dup = TaskBuilder::new("http://example.com/dup.bin").build();
        assert!(!dispatcher.enqueue(dup).unwrap());
        assert_eq!(engine.starts.load(Ordering::SeqCst), 1);

        dispatcher.cancel_all();
    }

    #[test]
    fn enqueue_fails_fast_on_bad_preconditions() {
        let engine = MockEngine::completing(Duration::from_millis(10));
        let (dispatcher, _rt) = dispatcher_with(engine);

        let destroyed = TaskBuilder::new("http://example.com/a").build();
        destroyed.destroy();
        assert!(matches!(
            dispatcher.enqueue(destroyed),
            Err(DownkitError::Precondition(_))
        ));

        let malformed = TaskBuilder::new("not a locator").build();
        assert!(matches!(
            dispatcher.enqueue(malformed),
            Err(DownkitError::Precondition(_))
        ));
        assert_eq!(dispatcher.active_count(), 0);
    }

    #[test]
    fn pause_resume_round_trip() {
        let engine = MockEngine::completing(Duration::from_secs(10));
        let (dispatcher, _rt) = dispatcher_with(engine);
        let url = "http://example.com/roundtrip.bin";

        let task = TaskBuilder::new(url).build();
        assert!(dispatcher.enqueue(task.clone()).unwrap());
        assert!(wait_until(Duration::from_secs(2), || {
            task.status() == TaskStatus::Downloading
        }));

        let paused = dispatcher.pause(url).expect("pause detaches the task");
        assert_eq!(paused.status(), TaskStatus::Paused);
        assert!(!dispatcher.exists(url));
        assert_eq!(dispatcher.paused_count(), 1);

        assert!(dispatcher.resume(url));
        assert_eq!(dispatcher.paused_count(), 0);
        assert!(dispatcher.exists(url));
        assert!(wait_until(Duration::from_secs(2), || {
            task.status() == TaskStatus::Downloading
        }));

        dispatcher.cancel_all();
    }

    #[test]
    fn pause_right_after_resume_keeps_the_stored_entry() {
        let engine = MockEngine::completing(Duration::from_secs(10));
        let (dispatcher, _rt) = dispatcher_with(engine);
        let url = "http://example.com/churn.bin";

        let task = TaskBuilder::new(url).build();
        assert!(dispatcher.enqueue(task).unwrap());
        assert!(wait_until(Duration::from_secs(2), || dispatcher.exists(url)));

        // Rapid pause/resume churn: a pause landing right after a resume
        // re-admitted the task must survive in the store every time.
        for _ in 0..10 {
            assert!(dispatcher.pause(url).is_some());
            assert_eq!(dispatcher.paused_count(), 1);
            assert!(dispatcher.resume(url));
            assert_eq!(dispatcher.paused_count(), 0);
            assert!(dispatcher.exists(url));
        }
        dispatcher.cancel_all();
    }

    #[test]
    fn rejected_admission_leaves_the_duplicate_untouched() {
        let engine = MockEngine::completing(Duration::from_secs(5));
        let (dispatcher, _rt) = dispatcher_with(engine);
        let url = "http://example.com/side.bin";

        assert!(dispatcher.enqueue(TaskBuilder::new(url).build()).unwrap());
        assert!(wait_until(Duration::from_secs(2), || dispatcher.exists(url)));

        let dup = TaskBuilder::new(url).build();
        assert!(!dispatcher.enqueue(dup.clone()).unwrap());
        assert_eq!(dup.target(), None);
        assert_eq!(dup.status(), TaskStatus::New);

        dispatcher.cancel_all();
    }

    #[test]
    fn cancel_is_idempotent_and_terminal() {
        let engine = MockEngine::completing(Duration::from_secs(10));
        let (dispatcher, _rt) = dispatcher_with(engine);
        let url = "http://example.com/cancel.bin";

        let task = TaskBuilder::new(url).build();
        assert!(dispatcher.enqueue(task.clone()).unwrap());
        assert!(wait_until(Duration::from_secs(2), || dispatcher.exists(url)));

        assert!(dispatcher.cancel(url).is_some());
        assert!(dispatcher.cancel(url).is_none());
        assert!(wait_until(Duration::from_secs(2), || {
            task.status() == TaskStatus::Cancelled
        }));
    }

    #[test]
    fn blocking_fetch_returns_the_file() {
        let engine = MockEngine::completing(Duration::from_millis(50));
        let (dispatcher, _rt) = dispatcher_with(engine);
        let target = std::env::temp_dir().join("downkit-sync.bin");

        let task = TaskBuilder::new("http://example.com/sync.bin")
            .target(&target)
            .build();
        let path = dispatcher.blocking_fetch(task.clone()).unwrap();
        assert_eq!(path, target);
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(!dispatcher.exists("http://example.com/sync.bin"));
    }

    #[test]
    fn blocking_fetch_reraises_engine_failure() {
        let engine = MockEngine::failing(
            Duration::from_millis(20),
            EngineError::Server { status: 503 },
        );
        let (dispatcher, _rt) = dispatcher_with(engine);

        let task = TaskBuilder::new("http://example.com/fail.bin").build();
        match dispatcher.blocking_fetch(task.clone()) {
            Err(DownkitError::Engine(EngineError::Server { status })) => assert_eq!(status, 503),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(task.error(), Some(EngineError::Server { status: 503 }));

        // The swallowing variant converts the same failure into None.
        let again = TaskBuilder::new("http://example.com/fail.bin").build();
        assert!(dispatcher.blocking_fetch_or_none(again).is_none());
    }

    #[test]
    fn blocking_fetch_rejects_duplicate_without_second_engine_start() {
        let engine = MockEngine::completing(Duration::from_secs(10));
        let (dispatcher, _rt) = dispatcher_with(engine.clone());
        let url = "http://example.com/busy.bin";

        let task = TaskBuilder::new(url).build();
        assert!(dispatcher.enqueue(task).unwrap());
        assert!(wait_until(Duration::from_secs(2), || dispatcher.exists(url)));

        let second = TaskBuilder::new(url).build();
        match dispatcher.blocking_fetch(second) {
            Err(DownkitError::DuplicateTask(dup)) => assert_eq!(dup, url),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(engine.starts.load(Ordering::SeqCst), 1);

        dispatcher.cancel_all();
    }

    #[test]
    fn blocking_fetch_returns_when_cancelled_from_another_thread() {
        let engine = MockEngine::completing(Duration::from_secs(30));
        let (dispatcher, _rt) = dispatcher_with(engine);
        let url = "http://example.com/hang.bin";

        let canceller = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                assert!(wait_until(Duration::from_secs(2), || dispatcher.exists(url)));
                thread::sleep(Duration::from_millis(100));
                dispatcher.cancel(url)
            })
        };

        let task = TaskBuilder::new(url).build();
        let started = Instant::now();
        match dispatcher.blocking_fetch(task) {
            Err(DownkitError::Cancelled) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(canceller.join().unwrap().is_some());
    }

    #[test]
    fn blocking_fetch_refuses_runtime_threads() {
        let engine = MockEngine::completing(Duration::from_millis(10));
        let (dispatcher, rt) = dispatcher_with(engine);

        let task = TaskBuilder::new("http://example.com/wrongthread.bin").build();
        let result = rt.block_on({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.blocking_fetch(task) }
        });
        assert!(matches!(result, Err(DownkitError::Precondition(_))));
    }

    #[test]
    fn resume_all_skips_dead_tasks_and_resumes_the_rest() {
        let engine = MockEngine::completing(Duration::from_secs(10));
        let (dispatcher, _rt) = dispatcher_with(engine);

        let alive = TaskBuilder::new("http://example.com/alive.bin").build();
        let doomed = TaskBuilder::new("http://example.com/doomed.bin").build();
        assert!(dispatcher.enqueue(alive.clone()).unwrap());
        assert!(dispatcher.enqueue(doomed.clone()).unwrap());
        assert!(wait_until(Duration::from_secs(2), || {
            dispatcher.active_count() == 2
        }));

        assert_eq!(dispatcher.pause_all().len(), 2);
        assert_eq!(dispatcher.paused_count(), 2);

        doomed.destroy();

        assert_eq!(dispatcher.resume_all(), 1);
        assert!(dispatcher.exists("http://example.com/alive.bin"));
        assert!(!dispatcher.exists("http://example.com/doomed.bin"));
        // The dead entry stays behind; it is skipped, never fatal.
        assert_eq!(dispatcher.paused_count(), 1);

        dispatcher.cancel_all();
    }
}
