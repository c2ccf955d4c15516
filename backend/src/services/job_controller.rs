//! Incremental job controller.
//!
//! Each call to [`JobController::calculate_piece`] performs exactly one unit of
//! work for a plan, decided from the persisted plan alone:
//!
//! | Persisted state                         | Unit of work                                |
//! |-----------------------------------------|---------------------------------------------|
//! | status `FINISHED` / `ERROR`             | nothing ([`StepOutcome::Halted`])           |
//! | every feature processed                 | aggregate totals, set `FINISHED`            |
//! | retries of the next feature > max       | record a skip, advance `last_index`         |
//! | otherwise                               | count an attempt, calculate the next feature|
//!
//! Progress is persisted before and after every calculation, so a crashed
//! worker leaves the plan resumable from its stored `last_index`.
//! [`JobController::process`] wraps one unit with the rescheduling of the next.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job_queue::{JobQueue, QueueError, Task, TaskHandler, TaskPayload, CALCULATE_PIECE_TASK};
use crate::calculator::{aggregate_totals, CalculationError};
use crate::config::WorkerSettings;
use crate::db::repository::{ErrorContext, FullRepository, RepositoryError};
use crate::models::{CalculationStatus, FeatureRow, Plan, PlanFeature, SkippedFeature};

/// Failed attempts of one feature before it is skipped.
pub const MAX_RETRIES: u32 = 2;

/// Calculates the row of a single feature.
#[async_trait]
pub trait FeatureCalculator: Send + Sync {
    async fn calculate(&self, feature: &PlanFeature) -> Result<FeatureRow, CalculationError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub max_retries: u32,
    /// Passed along with every enqueued unit.
    pub task_timeout: Duration,
    /// Pause before rescheduling after a transient store failure.
    pub store_retry_delay: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            task_timeout: Duration::from_secs(172_800),
            store_retry_delay: Duration::from_secs(5),
        }
    }
}

impl From<&WorkerSettings> for JobSettings {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            task_timeout: settings.task_timeout(),
            ..Self::default()
        }
    }
}

/// What one unit of work did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The feature's row was stored and `last_index` advanced.
    Calculated { index: i64 },
    /// The attempt failed; the same feature is tried again.
    Failed {
        index: i64,
        retries: u32,
        error: String,
    },
    /// The feature ran out of retries and was skipped.
    Skipped { index: i64 },
    /// Totals were written; the plan is `FINISHED`.
    Finished,
    /// The plan is in a terminal state; nothing was done.
    Halted,
}

impl StepOutcome {
    /// Whether another unit of work must follow.
    pub fn needs_followup(&self) -> bool {
        !matches!(self, Self::Finished | Self::Halted)
    }
}

/// Plan-level failure of a unit of work.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Plan {0} not found")]
    PlanNotFound(Uuid),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("Aggregation failed: {0}")]
    Aggregation(String),
}

impl JobError {
    /// Transient store trouble: the plan stays `PROCESSING` and is rescheduled.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Repository(e) if e.is_retryable())
    }
}

pub struct JobController {
    repository: Arc<dyn FullRepository>,
    calculator: Arc<dyn FeatureCalculator>,
    queue: Arc<dyn JobQueue>,
    settings: JobSettings,
}

impl JobController {
    pub fn new(
        repository: Arc<dyn FullRepository>,
        calculator: Arc<dyn FeatureCalculator>,
        queue: Arc<dyn JobQueue>,
        settings: JobSettings,
    ) -> Self {
        Self {
            repository,
            calculator,
            queue,
            settings,
        }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Perform one unit of work for the plan.
    pub async fn calculate_piece(&self, ui_id: Uuid) -> Result<StepOutcome, JobError> {
        let mut plan = self
            .repository
            .get_plan_by_ui_id(ui_id)
            .await?
            .ok_or(JobError::PlanNotFound(ui_id))?;

        if plan.calculation_status.is_terminal() {
            debug!(%ui_id, status = %plan.calculation_status, "Plan is terminal, nothing to do");
            return Ok(StepOutcome::Halted);
        }

        if plan.all_features_processed() {
            return self.finish(plan).await;
        }

        let index = plan.next_index();
        if plan.last_area_calculation_retries > self.settings.max_retries {
            return self.skip(plan, index).await;
        }

        plan.last_area_calculation_status = Some(CalculationStatus::Processing);
        plan.last_area_calculation_retries += 1;
        plan.calculation_status = CalculationStatus::Processing;
        plan.calculation_updated_ts = Some(Utc::now());
        let mut plan = self.repository.update_plan(&plan).await?;
        let retries = plan.last_area_calculation_retries;
        debug!(%ui_id, index, retries, "Calculating feature");

        match self.attempt(&plan, index).await {
            Ok(()) => {
                plan.last_area_calculation_status = Some(CalculationStatus::Finished);
                plan.last_area_calculation_error = None;
                plan.last_index = index;
                plan.last_area_calculation_retries = 0;
                plan.calculation_updated_ts = Some(Utc::now());
                self.repository.update_plan(&plan).await?;
                info!(%ui_id, index, total = plan.total_indices, "Feature calculated");
                Ok(StepOutcome::Calculated { index })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(%ui_id, index, retries, error = %message, "Feature calculation failed");
                plan.last_area_calculation_status = Some(CalculationStatus::Error);
                plan.last_area_calculation_error = Some(message.clone());
                plan.calculation_updated_ts = Some(Utc::now());
                self.repository.update_plan(&plan).await?;
                Ok(StepOutcome::Failed {
                    index,
                    retries,
                    error: message,
                })
            }
        }
    }

    /// Calculate and store the row of feature `index`.
    async fn attempt(&self, plan: &Plan, index: i64) -> Result<(), CalculationError> {
        let feature = self
            .repository
            .get_feature_at_index(plan.id, index)
            .await?
            .ok_or_else(|| {
                RepositoryError::not_found_with_context(
                    format!("Feature {} of plan {} not found", index, plan.ui_id),
                    ErrorContext::new("get_feature_at_index")
                        .with_entity("feature")
                        .with_entity_id(index),
                )
            })?;
        // A panic counts as a failed attempt so the feature is retried, then skipped.
        let row = AssertUnwindSafe(self.calculator.calculate(&feature))
            .catch_unwind()
            .await
            .map_err(|payload| CalculationError::Task(panic_message(&*payload)))??;
        let appended = self.repository.append_feature_rows(plan.id, vec![row]).await?;
        if appended == 0 {
            debug!(ui_id = %plan.ui_id, index, "Row already stored, kept the existing one");
        }
        Ok(())
    }

    async fn skip(&self, mut plan: Plan, index: i64) -> Result<StepOutcome, JobError> {
        let reason = plan
            .last_area_calculation_error
            .clone()
            .unwrap_or_else(|| "retries exhausted".to_string());
        warn!(
            ui_id = %plan.ui_id,
            index,
            retries = plan.last_area_calculation_retries,
            reason = %reason,
            "Skipping feature after retries"
        );
        self.repository
            .record_skipped_feature(
                plan.id,
                SkippedFeature {
                    index,
                    reason,
                    skipped_at: Utc::now(),
                },
            )
            .await?;

        plan.advance();
        plan.last_area_calculation_status = None;
        plan.last_area_calculation_error = None;
        plan.calculation_updated_ts = Some(Utc::now());
        self.repository.update_plan(&plan).await?;
        Ok(StepOutcome::Skipped { index })
    }

    async fn finish(&self, mut plan: Plan) -> Result<StepOutcome, JobError> {
        let rows = self.repository.list_feature_rows(plan.id).await?;
        let skipped = self.repository.list_skipped_features(plan.id).await?;
        let now = Utc::now();

        let skipped_count = skipped.len();
        let totals = tokio::task::spawn_blocking(move || aggregate_totals(&rows, skipped_count, now))
            .await
            .map_err(|e| JobError::Aggregation(e.to_string()))?;

        info!(
            ui_id = %plan.ui_id,
            features = totals.feature_count,
            skipped = totals.skipped_count,
            area_m2 = totals.area_m2,
            "Plan finished"
        );
        plan.report_totals = Some(totals);
        plan.calculation_status = CalculationStatus::Finished;
        plan.calculated_ts = Some(now);
        plan.calculation_updated_ts = Some(now);
        self.repository.update_plan(&plan).await?;
        Ok(StepOutcome::Finished)
    }

    /// Run one unit of work and enqueue the next one when the plan needs it.
    ///
    /// Transient store failures are rescheduled after a pause; any other
    /// plan-level failure marks the plan `ERROR`.
    pub async fn process(&self, ui_id: Uuid) -> Result<StepOutcome, JobError> {
        match self.calculate_piece(ui_id).await {
            Ok(outcome) => {
                if outcome.needs_followup() {
                    self.schedule(ui_id).await?;
                }
                Ok(outcome)
            }
            Err(e) if e.is_transient() => {
                warn!(%ui_id, error = %e, "Plan store unavailable, rescheduling");
                tokio::time::sleep(self.settings.store_retry_delay).await;
                self.schedule(ui_id).await?;
                Err(e)
            }
            Err(e) => {
                error!(%ui_id, error = %e, "Plan calculation failed");
                self.mark_error(ui_id, &e).await;
                Err(e)
            }
        }
    }

    /// Enqueue the next unit of work for a plan.
    pub async fn schedule(&self, ui_id: Uuid) -> Result<Uuid, QueueError> {
        self.queue
            .enqueue(
                CALCULATE_PIECE_TASK,
                TaskPayload { ui_id },
                self.settings.task_timeout,
            )
            .await
    }

    /// Enqueue every plan left in `PROCESSING` by a previous process.
    pub async fn resume_processing_plans(&self) -> Result<usize, JobError> {
        let plans = self
            .repository
            .list_plans_with_status(CalculationStatus::Processing)
            .await?;
        for plan in &plans {
            info!(
                ui_id = %plan.ui_id,
                last_index = plan.last_index,
                total = plan.total_indices,
                "Resuming plan"
            );
            self.schedule(plan.ui_id).await?;
        }
        Ok(plans.len())
    }

    async fn mark_error(&self, ui_id: Uuid, cause: &JobError) {
        let mut plan = match self.repository.get_plan_by_ui_id(ui_id).await {
            Ok(Some(plan)) => plan,
            Ok(None) => return,
            Err(e) => {
                error!(%ui_id, error = %e, "Could not load plan to record the error");
                return;
            }
        };
        plan.calculation_status = CalculationStatus::Error;
        plan.message = Some(cause.to_string());
        plan.calculation_updated_ts = Some(Utc::now());
        if let Err(e) = self.repository.update_plan(&plan).await {
            error!(%ui_id, error = %e, "Could not record the plan error");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("calculation panicked: {}", detail)
}

#[async_trait]
impl TaskHandler for JobController {
    async fn handle(&self, task: Task) {
        if task.name != CALCULATE_PIECE_TASK {
            warn!(task = %task.name, "Ignoring unknown task");
            return;
        }
        // Outcomes and errors are logged and persisted by `process`.
        let _ = self.process(task.payload.ui_id).await;
    }
}

#[cfg(test)]
#[path = "job_controller_tests.rs"]
mod job_controller_tests;
