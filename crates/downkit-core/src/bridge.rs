//! Sync bridge primitives
//!
//! Bridges the asynchronous engine into a single blocking call. The
//! protocol (driven by `Dispatcher::blocking_fetch`):
//!
//! 1. the caller must not be on a runtime thread;
//! 2. the admit-and-start operation is posted to the dispatch runtime and
//!    the caller latches on a one-shot channel for the admission verdict;
//! 3. a duplicate-locator rejection fails the whole call immediately;
//! 4. otherwise the caller blocks on the [`CompletionGate`] until the
//!    completion path resolves it - exactly once, whatever the outcome -
//!    so the waiter never blocks forever on a normal outcome. Cancellation
//!    from another thread resolves the gate too.

use crate::error::EngineError;
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;

/// Terminal outcome of one bridged transfer.
#[derive(Debug, Clone)]
pub(crate) enum FetchOutcome {
    Completed(PathBuf),
    Failed(EngineError),
    Cancelled,
    Paused,
}

/// One-shot mutex + condvar cell the completion path resolves and the
/// blocked caller waits on.
pub(crate) struct CompletionGate {
    outcome: Mutex<Option<FetchOutcome>>,
    cond: Condvar,
}

impl CompletionGate {
    pub(crate) fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Resolve the gate. The first outcome wins; later calls are ignored.
    pub(crate) fn complete(&self, outcome: FetchOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// Block until the gate is resolved.
    pub(crate) fn wait(&self) -> FetchOutcome {
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            self.cond.wait(&mut slot);
        }
        slot.clone().expect("gate resolved")
    }

    /// Block until resolved or the timeout elapses.
    #[cfg(test)]
    pub(crate) fn wait_timeout(&self, timeout: std::time::Duration) -> Option<FetchOutcome> {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            let _ = self.cond.wait_for(&mut slot, timeout);
        }
        slot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_once_resolved_from_another_thread() {
        let gate = Arc::new(CompletionGate::new());
        let resolver = gate.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            resolver.complete(FetchOutcome::Cancelled);
        });
        let outcome = gate.wait();
        assert!(matches!(outcome, FetchOutcome::Cancelled));
        handle.join().unwrap();
    }

    #[test]
    fn first_outcome_wins() {
        let gate = CompletionGate::new();
        gate.complete(FetchOutcome::Completed(PathBuf::from("/tmp/a")));
        gate.complete(FetchOutcome::Cancelled);
        match gate.wait() {
            FetchOutcome::Completed(path) => assert_eq!(path, PathBuf::from("/tmp/a")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn wait_timeout_reports_unresolved_gate() {
        let gate = CompletionGate::new();
        assert!(gate.wait_timeout(Duration::from_millis(20)).is_none());
    }
}
