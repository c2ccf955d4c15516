//! Application state for the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use crate::db::repository::FullRepository;
use crate::services::job_queue::JobQueue;
use crate::services::job_tracker::JobTracker;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Repository instance for plan operations
    pub repository: Arc<dyn FullRepository>,
    /// Queue receiving the first unit of every submitted plan
    pub queue: Arc<dyn JobQueue>,
    pub job_tracker: JobTracker,
    pub task_timeout: Duration,
    /// Idle time after which an active task is listed as stale.
    pub stale_after: Duration,
}

impl AppState {
    pub fn new(
        repository: Arc<dyn FullRepository>,
        queue: Arc<dyn JobQueue>,
        job_tracker: JobTracker,
    ) -> Self {
        Self {
            repository,
            queue,
            job_tracker,
            task_timeout: Duration::from_secs(172_800),
            stale_after: Duration::from_secs(120),
        }
    }

    pub fn with_timeouts(mut self, task_timeout: Duration, stale_after: Duration) -> Self {
        self.task_timeout = task_timeout;
        self.stale_after = stale_after;
        self
    }
}
