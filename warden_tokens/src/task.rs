//! Ownership of background tasks

use std::future::Future;

use tokio::task::JoinHandle;

/// A handle to a spawned background task that aborts the task when dropped
///
/// Every long-running task in these crates is owned by one of these so that
/// dropping the owning component tears the task down.
#[derive(Debug)]
#[must_use = "dropping the handle aborts the task"]
pub struct TaskHandle {
    name: &'static str,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawns `future` on the current tokio runtime
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::trace!(task = name, "spawning background task");
        Self {
            name,
            join: tokio::spawn(future),
        }
    }

    /// Aborts the task immediately
    pub fn abort(&self) {
        self.join.abort();
    }

    /// Whether the task has run to completion or been aborted
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if !self.join.is_finished() {
            tracing::debug!(task = self.name, "aborting background task");
            self.join.abort();
        }
    }
}
