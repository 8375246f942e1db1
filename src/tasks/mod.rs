//! Cooperative cancellation and progress reporting for long-running scans.
//!
//! Scans check a shared flag between items and stop with
//! [`EngineError::Cancelled`] once it is raised. Progress goes out over an
//! optional channel; a dropped receiver never stops the scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Type of long-running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    ScanPeople,
    ScanOutliers,
}

impl TaskType {
    /// Full display name for progress output.
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskType::ScanPeople => "Scan People",
            TaskType::ScanOutliers => "Scan Outliers",
        }
    }
}

/// Progress information for a task.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<String>,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self {
            current,
            total,
            current_item: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    /// Calculate progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// Update messages sent from scans via channels.
#[derive(Debug, Clone)]
pub enum TaskUpdate {
    /// Task has started with total items to process.
    Started { task: TaskType, total: usize },
    /// Progress update during processing.
    Progress(TaskProgress),
    /// Task completed successfully.
    Completed { message: String },
    /// Task was cancelled.
    Cancelled,
    /// Task failed with error.
    Failed { error: String },
}

/// Optional progress sink handed to scans.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<Sender<TaskUpdate>>,
}

impl Progress {
    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn channel(tx: Sender<TaskUpdate>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn send(&self, update: TaskUpdate) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(update);
        }
    }

    /// Report the terminal state of a scan from its result.
    pub fn finish<T>(&self, result: &Result<T>, message: impl FnOnce(&T) -> String) {
        match result {
            Ok(value) => self.send(TaskUpdate::Completed {
                message: message(value),
            }),
            Err(EngineError::Cancelled) => self.send(TaskUpdate::Cancelled),
            Err(e) => self.send(TaskUpdate::Failed {
                error: e.to_string(),
            }),
        }
    }
}
