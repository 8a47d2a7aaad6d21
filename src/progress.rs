//! Progress reporting seam.
//!
//! The session reports batch progress into a [`ProgressSink`]; rendering
//! (a terminal bar, a log line, nothing at all) is the caller's concern.

use std::fmt;

/// Receives progress updates while a batch of requests is dispatched
pub trait ProgressSink: Send + Sync + fmt::Debug {
    /// Called after each request finishes, with the number of completed
    /// requests and the batch total
    fn tick(&self, completed: usize, total: usize);

    /// Called once when the batch is done
    fn close(&self) {}
}

/// Discards all progress updates
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn tick(&self, _completed: usize, _total: usize) {}
}
