//! Background processing services.
//!
//! The job queue hands units of work to a bounded worker pool, the tracker
//! keeps per-task metadata for monitoring, and the job controller advances a
//! plan by one feature per unit of work.

pub mod job_controller;
pub mod job_queue;
pub mod job_tracker;

pub use job_controller::{FeatureCalculator, JobController, JobError, JobSettings, StepOutcome};
pub use job_queue::{JobQueue, LocalJobQueue, QueueError, Task, TaskHandler, TaskPayload, WorkerPool};
pub use job_tracker::JobTracker;
