//! Background job tracking.
//!
//! Generation requests are acknowledged immediately and run as tokio tasks.
//! The supervisor keeps their handles in a bounded registry so jobs can be
//! counted, named in logs and awaited. When the registry is full the oldest
//! handle is released; its task keeps running, it is just no longer tracked.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default number of tracked jobs.
pub const DEFAULT_CAPACITY: usize = 64;

struct TrackedTask {
    label: String,
    handle: JoinHandle<()>,
}

/// Spawns and tracks background jobs.
pub struct TaskSupervisor {
    registry: Mutex<VecDeque<TrackedTask>>,
    capacity: usize,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TaskSupervisor {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TrackedTask>> {
        // A panic while holding the lock leaves the deque intact
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Run `job` in the background. Never blocks and never refuses.
    pub fn spawn<F>(&self, label: impl Into<String>, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let handle = tokio::spawn(job);

        let mut registry = self.lock();
        registry.retain(|task| !task.handle.is_finished());
        if registry.len() >= self.capacity {
            if let Some(oldest) = registry.pop_front() {
                warn!(task = %oldest.label, "Task registry full, no longer tracking oldest job");
            }
        }
        debug!(task = %label, in_flight = registry.len() + 1, "Job spawned");
        registry.push_back(TrackedTask { label, handle });
    }

    /// Tracked jobs that have not finished yet.
    pub fn in_flight(&self) -> usize {
        let mut registry = self.lock();
        registry.retain(|task| !task.handle.is_finished());
        registry.len()
    }

    /// Wait for every tracked job to finish.
    ///
    /// Jobs spawned while draining are awaited too.
    pub async fn drain(&self) {
        loop {
            let tasks: Vec<TrackedTask> = self.lock().drain(..).collect();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.handle.await {
                    warn!(task = %task.label, error = %e, "Job did not complete cleanly");
                }
            }
        }
    }
}
