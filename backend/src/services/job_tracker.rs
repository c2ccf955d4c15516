//! Task tracking for the calculation worker pool.
//!
//! An in-memory record of every queued and running unit of work, with the
//! timestamps an external watchdog needs to spot stuck tasks: the last time a
//! task was touched and its deadline derived from the enqueue timeout.
//!
//! Completed tasks are dropped; failed ones are kept with their logs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::job_queue::Task;

/// A single log entry with timestamp and message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Failed,
}

/// Metadata and logs of one task.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrackedTask {
    pub task_id: Uuid,
    pub task_name: String,
    pub ui_id: Uuid,
    pub state: TaskState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Last sign of life: enqueue, start or an explicit touch.
    pub touched_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub logs: Vec<LogEntry>,
}

impl TrackedTask {
    /// Active and either untouched for longer than `threshold` or past its deadline.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.state == TaskState::Failed {
            return false;
        }
        let idle = now.signed_duration_since(self.touched_at);
        let over_threshold = idle
            .to_std()
            .map(|idle| idle > threshold)
            .unwrap_or(false);
        let past_deadline = self.deadline.is_some_and(|d| now > d);
        over_threshold || past_deadline
    }
}

/// In-memory task tracker, cheap to clone.
#[derive(Clone)]
pub struct JobTracker {
    tasks: Arc<RwLock<HashMap<Uuid, TrackedTask>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record a freshly enqueued task.
    pub fn register(&self, task: &Task) {
        self.tasks.write().insert(task.id, Self::tracked(task));
    }

    /// Record `task` unless a task for the same plan is already queued, in
    /// which case the queued task's id is returned.
    pub fn register_unique(&self, task: &Task) -> Option<Uuid> {
        let mut tasks = self.tasks.write();
        if let Some(existing) = tasks
            .values()
            .find(|t| t.ui_id == task.payload.ui_id && t.state == TaskState::Queued)
        {
            return Some(existing.task_id);
        }
        tasks.insert(task.id, Self::tracked(task));
        None
    }

    fn tracked(task: &Task) -> TrackedTask {
        let deadline = chrono::Duration::from_std(task.timeout)
            .ok()
            .and_then(|timeout| task.enqueued_at.checked_add_signed(timeout));
        TrackedTask {
            task_id: task.id,
            task_name: task.name.clone(),
            ui_id: task.payload.ui_id,
            state: TaskState::Queued,
            enqueued_at: task.enqueued_at,
            started_at: None,
            touched_at: task.enqueued_at,
            deadline,
            logs: vec![],
        }
    }

    pub fn start(&self, task_id: Uuid) {
        let now = Utc::now();
        if let Some(task) = self.tasks.write().get_mut(&task_id) {
            task.state = TaskState::Running;
            task.started_at = Some(now);
            task.touched_at = now;
        }
    }

    /// Refresh the last-touched timestamp.
    pub fn touch(&self, task_id: Uuid) {
        if let Some(task) = self.tasks.write().get_mut(&task_id) {
            task.touched_at = Utc::now();
        }
    }

    /// Add a log entry to a task.
    pub fn log(&self, task_id: Uuid, level: LogLevel, message: impl Into<String>) {
        let now = Utc::now();
        if let Some(task) = self.tasks.write().get_mut(&task_id) {
            task.touched_at = now;
            task.logs.push(LogEntry {
                timestamp: now,
                level,
                message: message.into(),
            });
        }
    }

    pub fn complete(&self, task_id: Uuid) {
        self.tasks.write().remove(&task_id);
    }

    pub fn fail(&self, task_id: Uuid, error_message: impl Into<String>) {
        let now = Utc::now();
        if let Some(task) = self.tasks.write().get_mut(&task_id) {
            task.state = TaskState::Failed;
            task.touched_at = now;
            task.logs.push(LogEntry {
                timestamp: now,
                level: LogLevel::Error,
                message: error_message.into(),
            });
        }
    }

    pub fn get(&self, task_id: Uuid) -> Option<TrackedTask> {
        self.tasks.read().get(&task_id).cloned()
    }

    /// True when a task for this plan is waiting in the queue.
    pub fn has_queued(&self, ui_id: Uuid) -> bool {
        self.tasks
            .read()
            .values()
            .any(|t| t.ui_id == ui_id && t.state == TaskState::Queued)
    }

    /// Queued and running tasks.
    pub fn active_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.state != TaskState::Failed)
            .count()
    }

    pub fn failed_tasks(&self) -> Vec<TrackedTask> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.state == TaskState::Failed)
            .cloned()
            .collect()
    }

    /// Active tasks a watchdog should look at, oldest touch first.
    pub fn stale_tasks(&self, threshold: Duration) -> Vec<TrackedTask> {
        let now = Utc::now();
        let mut stale: Vec<TrackedTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.is_stale(now, threshold))
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.touched_at);
        stale
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}
