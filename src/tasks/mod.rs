//! Scan-phase scheduling: bounded worker pools with progress reporting
//! and cooperative cancellation.

pub mod scheduler;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use scheduler::{ScanHandle, ScanOutcome, TaskScheduler};

/// Progress snapshot for a scan run.
///
/// `completed` counts every finished task unit, failures included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProgress {
    pub completed: usize,
    pub total: usize,
    pub failures: usize,
}

impl ScanProgress {
    /// Progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.completed as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// Callback invoked after each completed task unit with the path that was
/// processed and the counters so far. The core makes no assumption about
/// how it is rendered.
pub type ProgressFn = dyn Fn(&Path, ScanProgress) + Send + Sync;

/// Shared scan counters, updated as units complete.
#[derive(Debug)]
pub(crate) struct ScanCounters {
    total: usize,
    completed: AtomicUsize,
    failures: AtomicUsize,
}

impl ScanCounters {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_success(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> ScanProgress {
        ScanProgress {
            completed: self.completed.load(Ordering::SeqCst),
            total: self.total,
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}
