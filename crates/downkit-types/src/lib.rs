//! Shared types for Downkit
//!
//! This crate contains the plain data structures shared between the
//! orchestration core, engines, and frontends: task status, transfer
//! configuration, and the serializable task snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Task Status
// ============================================================================

/// Lifecycle status of a download task.
///
/// `Cancelled` is an explicit terminal state: a cancelled task is
/// distinguishable from one the user paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created but not yet admitted.
    New,
    /// Admitted; waiting for the engine to open a connection.
    Pending,
    /// Bytes are flowing.
    Downloading,
    /// Pulled out of the active set by an explicit pause; resumable.
    Paused,
    /// Finished successfully.
    Completed,
    /// Stopped by an explicit cancel.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

// ============================================================================
// Transfer Configuration
// ============================================================================

/// Per-task transfer configuration, immutable once the task is admitted.
///
/// All of this is passed through to the engine; the core itself only reads
/// `enable_indicator` (for the custom-path authority rule).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Extra request headers; keys are unique, order is irrelevant.
    pub headers: HashMap<String, String>,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Overall transfer timeout; `None` means unlimited.
    pub transfer_timeout: Option<Duration>,
    /// Maximum silence tolerated between two blocks of the body.
    pub block_timeout: Duration,
    /// Discard any previously downloaded bytes and start over.
    pub force_redownload: bool,
    /// Allow the engine to fetch the body in parallel segments.
    pub parallel_segments: bool,
    /// Allow resuming from a previously downloaded byte offset.
    pub breakpoint_resume: bool,
    /// Derive a non-clobbering destination path if the target exists.
    pub unique_target: bool,
    /// Open the file when the transfer completes.
    pub auto_open: bool,
    /// Show a progress indicator for this task.
    pub enable_indicator: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            connect_timeout: Duration::from_secs(10),
            transfer_timeout: None,
            block_timeout: Duration::from_secs(10 * 60),
            force_redownload: false,
            parallel_segments: true,
            breakpoint_resume: true,
            unique_target: true,
            auto_open: false,
            enable_indicator: true,
        }
    }
}

// ============================================================================
// Task Snapshot
// ============================================================================

/// Point-in-time, serializable view of a task.
///
/// Produced by the core for frontends that want to display or export task
/// state without holding a reference into the live task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: u64,
    pub url: String,
    pub target: Option<PathBuf>,
    pub status: TaskStatus,
    pub total_length: u64,
    pub used_time: Duration,
    pub connect_attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
