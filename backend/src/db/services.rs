//! High-level plan service layer.
//!
//! Repository-agnostic operations used by the HTTP surface and the binary.
//! These functions own the submission rules (conflicts, re-uploads, first
//! enqueue) and the shape of the status answer, so they stay the same
//! whatever store backs the plans.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use forest_carbon::db::{services, repositories::LocalRepository};
//! use forest_carbon::services::job_queue::LocalJobQueue;
//! use forest_carbon::services::job_tracker::JobTracker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repo = LocalRepository::new();
//!     let (queue, _tasks) = LocalJobQueue::new(JobTracker::new());
//!     # let plan: forest_carbon::models::NewPlan = unimplemented!();
//!
//!     let stored = services::submit_plan(&repo, &queue, plan, Duration::from_secs(60)).await?;
//!     let status = services::get_plan_status(&repo, stored.ui_id, None).await?;
//!     println!("{} of {} features done", status.last_index + 1, status.total_indices);
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use super::repository::{ErrorContext, FullRepository, RepositoryError, RepositoryResult};
use crate::geometry::projection::is_supported;
use crate::models::{
    CalculationStatus, FeatureRow, FeatureState, NewPlan, Plan, ReportTotals, SkippedFeature,
};
use crate::services::job_queue::{JobQueue, QueueError, TaskPayload, CALCULATE_PIECE_TASK};

/// Failure of a submission.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Answer of the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatus {
    pub ui_id: Uuid,
    pub status: CalculationStatus,
    pub last_index: i64,
    pub total_indices: i64,
    /// Outcome of every feature, in collection order.
    pub features: Vec<FeatureState>,
    pub skipped_features: Vec<SkippedFeature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_rows: Option<Vec<FeatureRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_totals: Option<ReportTotals>,
    pub message: Option<String>,
    pub calculated_ts: Option<DateTime<Utc>>,
}

// ==================== Health & Connection ====================

/// Check if the plan store is healthy.
///
/// This is a simple pass-through to the repository's health check.
pub async fn health_check<R: FullRepository + ?Sized>(repo: &R) -> RepositoryResult<bool> {
    repo.health_check().await
}

// ==================== Plan Operations ====================

/// Accept a plan and enqueue its first unit of work.
///
/// This function orchestrates the submission:
/// 1. Validate the feature collection and its coordinate system
/// 2. Refuse a plan whose previous submission is still `PROCESSING`
/// 3. Create the plan, or fully re-upload an existing one (rows, skips and
///    totals are cleared and progress restarts at `last_index = -1`)
/// 4. Mark it `PROCESSING` and enqueue the first unit
///
/// # Arguments
/// * `repo` - Repository implementation
/// * `queue` - Queue the first unit of work is sent to
/// * `plan` - The submission
/// * `timeout` - Timeout passed along with the enqueued unit
///
/// # Returns
/// * `Ok(Plan)` - The stored plan, already `PROCESSING`
/// * `Err(SubmitError::Repository)` with a validation error for bad input, or
///   a conflict when the plan is still being calculated
/// * `Err(SubmitError::Queue)` if the first unit could not be enqueued; the
///   plan is then marked `ERROR`
pub async fn submit_plan<R, Q>(
    repo: &R,
    queue: &Q,
    plan: NewPlan,
    timeout: Duration,
) -> Result<Plan, SubmitError>
where
    R: FullRepository + ?Sized,
    Q: JobQueue + ?Sized,
{
    validate_submission(&plan)?;
    let ui_id = plan.ui_id;
    let features = plan.features.len();

    let mut stored = match repo.get_plan_by_ui_id(ui_id).await? {
        Some(existing) if existing.calculation_status == CalculationStatus::Processing => {
            return Err(RepositoryError::conflict_with_context(
                format!("Plan {} is still being calculated", ui_id),
                ErrorContext::new("submit_plan")
                    .with_entity("plan")
                    .with_entity_id(ui_id),
            )
            .into());
        }
        Some(existing) if existing.user_id != plan.user_id => {
            return Err(RepositoryError::conflict_with_context(
                format!("Plan {} belongs to another user", ui_id),
                ErrorContext::new("submit_plan")
                    .with_entity("plan")
                    .with_entity_id(ui_id),
            )
            .into());
        }
        Some(existing) => {
            info!(%ui_id, features, "Re-uploading plan");
            repo.reset_plan(existing.id, plan).await?
        }
        None => {
            info!(%ui_id, features, "Creating plan");
            repo.create_plan(plan).await?
        }
    };

    stored.calculation_status = CalculationStatus::Processing;
    stored.calculation_updated_ts = Some(Utc::now());
    let mut stored = repo.update_plan(&stored).await?;

    if let Err(e) = queue
        .enqueue(CALCULATE_PIECE_TASK, TaskPayload { ui_id }, timeout)
        .await
    {
        error!(%ui_id, error = %e, "Could not enqueue the first unit of work");
        stored.calculation_status = CalculationStatus::Error;
        stored.message = Some(e.to_string());
        repo.update_plan(&stored).await?;
        return Err(e.into());
    }
    Ok(stored)
}

fn validate_submission(plan: &NewPlan) -> RepositoryResult<()> {
    let context = || {
        ErrorContext::new("submit_plan")
            .with_entity("plan")
            .with_entity_id(plan.ui_id)
    };
    if plan.features.is_empty() {
        return Err(RepositoryError::validation_with_context(
            "Feature collection is empty",
            context(),
        ));
    }
    if !is_supported(plan.source_crs) {
        return Err(RepositoryError::validation_with_context(
            format!("Unsupported coordinate system EPSG:{}", plan.source_crs),
            context(),
        ));
    }
    Ok(())
}

/// Progress and results of a plan.
///
/// A plan owned by another user is reported exactly like an unknown one.
///
/// # Arguments
/// * `repo` - Repository implementation
/// * `ui_id` - External plan id
/// * `user_id` - Requesting user; must match the plan's owner when it has one
///
/// # Returns
/// * `Ok(PlanStatus)` - Status, per-feature outcomes, rows so far and totals
/// * `Err(RepositoryError::NotFound)` for unknown or foreign plans
pub async fn get_plan_status<R: FullRepository + ?Sized>(
    repo: &R,
    ui_id: Uuid,
    user_id: Option<&str>,
) -> RepositoryResult<PlanStatus> {
    let not_found = || {
        RepositoryError::not_found_with_context(
            format!("Plan {} not found", ui_id),
            ErrorContext::new("get_plan_status")
                .with_entity("plan")
                .with_entity_id(ui_id),
        )
    };
    let plan = repo.get_plan_by_ui_id(ui_id).await?.ok_or_else(not_found)?;
    if let Some(owner) = plan.user_id.as_deref() {
        if user_id != Some(owner) {
            return Err(not_found());
        }
    }

    let rows = repo.list_feature_rows(plan.id).await?;
    let skipped = repo.list_skipped_features(plan.id).await?;
    let features = feature_states(plan.total_indices, &rows, &skipped);

    Ok(PlanStatus {
        ui_id: plan.ui_id,
        status: plan.calculation_status,
        last_index: plan.last_index,
        total_indices: plan.total_indices,
        features,
        skipped_features: skipped,
        report_rows: (!rows.is_empty()).then_some(rows),
        report_totals: plan.report_totals,
        message: plan.message,
        calculated_ts: plan.calculated_ts,
    })
}

/// Tri-state outcome per feature index.
pub fn feature_states(
    total_indices: i64,
    rows: &[FeatureRow],
    skipped: &[SkippedFeature],
) -> Vec<FeatureState> {
    let done: HashSet<i64> = rows.iter().map(|r| r.index).collect();
    let skipped: HashSet<i64> = skipped.iter().map(|s| s.index).collect();
    (0..total_indices.max(0))
        .map(|index| {
            if done.contains(&index) {
                FeatureState::Ok
            } else if skipped.contains(&index) {
                FeatureState::Skipped
            } else {
                FeatureState::Pending
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "services_tests.rs"]
mod services_tests;
