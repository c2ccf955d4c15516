//! Job queue and bounded worker pool.
//!
//! A plan advances one feature per task. The handler of a task enqueues the
//! next one, so a plan never holds a worker for longer than one feature while
//! different plans share the pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job_tracker::JobTracker;

/// Task name of one unit of plan calculation.
pub const CALCULATE_PIECE_TASK: &str = "calculate_piece";

const KNOWN_TASKS: [&str; 1] = [CALCULATE_PIECE_TASK];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub ui_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub payload: TaskPayload,
    /// Advisory; an in-flight task is never cancelled.
    pub timeout: Duration,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: impl Into<String>, payload: TaskPayload, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            timeout,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Job queue is closed")]
    Closed,
    #[error("Unknown task: {0}")]
    UnknownTask(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a task and return its id.
    async fn enqueue(
        &self,
        task_name: &str,
        payload: TaskPayload,
        timeout: Duration,
    ) -> Result<Uuid, QueueError>;
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task);
}

/// In-process queue feeding a [`WorkerPool`].
///
/// Enqueuing a plan that already has a task waiting returns the waiting
/// task's id instead of queueing a second one.
#[derive(Clone)]
pub struct LocalJobQueue {
    sender: mpsc::UnboundedSender<Task>,
    tracker: JobTracker,
}

impl LocalJobQueue {
    pub fn new(tracker: JobTracker) -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, tracker }, receiver)
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue(
        &self,
        task_name: &str,
        payload: TaskPayload,
        timeout: Duration,
    ) -> Result<Uuid, QueueError> {
        if !KNOWN_TASKS.contains(&task_name) {
            return Err(QueueError::UnknownTask(task_name.to_string()));
        }
        let task = Task::new(task_name, payload, timeout);
        if let Some(existing) = self.tracker.register_unique(&task) {
            debug!(ui_id = %payload.ui_id, task_id = %existing, "Task already queued");
            return Ok(existing);
        }

        let id = task.id;
        if self.sender.send(task).is_err() {
            self.tracker.fail(id, "queue closed before the task was sent");
            return Err(QueueError::Closed);
        }
        debug!(ui_id = %payload.ui_id, task_id = %id, task = task_name, "Task enqueued");
        Ok(id)
    }
}

/// Runs queued tasks with at most `concurrency` in flight.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn the dispatcher. It ends when every queue handle has been dropped
    /// and the channel is drained.
    pub fn spawn(
        mut receiver: mpsc::UnboundedReceiver<Task>,
        handler: Arc<dyn TaskHandler>,
        tracker: JobTracker,
        concurrency: usize,
    ) -> JoinHandle<()> {
        let concurrency = concurrency.max(1);
        tokio::spawn(async move {
            info!(concurrency, "Worker pool started");
            let semaphore = Arc::new(Semaphore::new(concurrency));
            while let Some(task) = receiver.recv().await {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let handler = Arc::clone(&handler);
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    run_task(handler, tracker, task).await;
                    drop(permit);
                });
            }
            info!("Worker pool stopped");
        })
    }
}

async fn run_task(handler: Arc<dyn TaskHandler>, tracker: JobTracker, task: Task) {
    let task_id = task.id;
    let ui_id = task.payload.ui_id;
    tracker.start(task_id);

    // A panicking handler must not take the permit or the tracker entry with it.
    let outcome = tokio::spawn(async move { handler.handle(task).await }).await;
    match outcome {
        Ok(()) => tracker.complete(task_id),
        Err(e) if e.is_panic() => {
            error!(%ui_id, %task_id, "Task panicked");
            tracker.fail(task_id, "task panicked");
        }
        Err(e) => {
            warn!(%ui_id, %task_id, error = %e, "Task aborted");
            tracker.fail(task_id, e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        seen: Mutex<Vec<Uuid>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, task: Task) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.seen.lock().push(task.payload.ui_id);
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_unknown_task_is_rejected() {
        let (queue, _rx) = LocalJobQueue::new(JobTracker::new());
        let err = queue
            .enqueue(
                "refresh_everything",
                TaskPayload { ui_id: Uuid::new_v4() },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::UnknownTask("refresh_everything".to_string()));
    }

    #[tokio::test]
    async fn test_closed_queue_reports_closed() {
        let (queue, rx) = LocalJobQueue::new(JobTracker::new());
        drop(rx);
        let err = queue
            .enqueue(
                CALCULATE_PIECE_TASK,
                TaskPayload { ui_id: Uuid::new_v4() },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Closed);
        assert_eq!(queue.tracker().failed_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_pool_runs_every_task_within_concurrency() {
        let tracker = JobTracker::new();
        let (queue, rx) = LocalJobQueue::new(tracker.clone());
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let plans: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
        for ui_id in &plans {
            queue
                .enqueue(CALCULATE_PIECE_TASK, TaskPayload { ui_id: *ui_id }, Duration::from_secs(5))
                .await
                .unwrap();
        }
        drop(queue);

        let pool = WorkerPool::spawn(rx, recorder.clone(), tracker.clone(), 2);
        pool.await.unwrap();
        // The dispatcher ends before its last workers do.
        for _ in 0..100 {
            if tracker.active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(recorder.seen.lock().len(), 6);
        assert!(recorder.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_returns_waiting_task() {
        let (queue, _rx) = LocalJobQueue::new(JobTracker::new());
        let payload = TaskPayload { ui_id: Uuid::new_v4() };
        let first = queue
            .enqueue(CALCULATE_PIECE_TASK, payload, Duration::from_secs(5))
            .await
            .unwrap();
        let second = queue
            .enqueue(CALCULATE_PIECE_TASK, payload, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
