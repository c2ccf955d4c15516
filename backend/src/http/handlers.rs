//! HTTP handlers for the REST API.
//!
//! Each handler corresponds to an API endpoint and delegates to the
//! service layer for business logic.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;
use uuid::Uuid;

use super::dto::{
    HealthResponse, PlanStatus, StaleTasksResponse, StatusQuery, SubmitPlanRequest,
    SubmitPlanResponse,
};
use super::error::AppError;
use super::state::AppState;
use crate::db::services as db_services;
use crate::models::CalculationStatus;

/// Result type for handlers.
pub type HandlerResult<T> = Result<Json<T>, AppError>;

// =============================================================================
// Health Check
// =============================================================================

/// GET /health
///
/// Health check endpoint to verify the service is running and the plan store is reachable.
pub async fn health_check(State(state): State<AppState>) -> HandlerResult<HealthResponse> {
    let db_status = match db_services::health_check(state.repository.as_ref()).await {
        Ok(true) => "connected".to_string(),
        Ok(false) => "disconnected".to_string(),
        Err(e) => format!("error: {}", e),
    };

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: "v1".to_string(),
        database: db_status,
        active_tasks: state.job_tracker.active_count(),
    }))
}

// =============================================================================
// Plans
// =============================================================================

/// POST /v1/plans
///
/// Accept a plan and start its calculation. Progress is polled through
/// `GET /v1/plans/{ui_id}`.
pub async fn submit_plan(
    State(state): State<AppState>,
    Json(request): Json<SubmitPlanRequest>,
) -> Result<(StatusCode, Json<SubmitPlanResponse>), AppError> {
    let plan = db_services::submit_plan(
        state.repository.as_ref(),
        state.queue.as_ref(),
        request.into(),
        state.task_timeout,
    )
    .await?;
    info!(ui_id = %plan.ui_id, features = plan.total_indices, "Plan accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitPlanResponse {
            ui_id: plan.ui_id,
            status: plan.calculation_status,
            total_indices: plan.total_indices,
            message: format!(
                "Calculation started. Track progress at /v1/plans/{}",
                plan.ui_id
            ),
        }),
    ))
}

/// GET /v1/plans/{ui_id}?user_id=
///
/// `202` while the plan is pending or processing, `200` once finished and
/// `422` when the calculation failed. Unknown and foreign plans are `404`.
pub async fn get_plan_status(
    State(state): State<AppState>,
    Path(ui_id): Path<Uuid>,
    Query(query): Query<StatusQuery>,
) -> Result<(StatusCode, Json<PlanStatus>), AppError> {
    let status =
        db_services::get_plan_status(state.repository.as_ref(), ui_id, query.user_id.as_deref())
            .await?;
    Ok((status_code(status.status), Json(status)))
}

fn status_code(status: CalculationStatus) -> StatusCode {
    match status {
        CalculationStatus::NotStarted | CalculationStatus::Processing => StatusCode::ACCEPTED,
        CalculationStatus::Finished => StatusCode::OK,
        CalculationStatus::Error => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

// =============================================================================
// Task monitoring
// =============================================================================

/// GET /v1/tasks/stale
///
/// Active tasks idle longer than the configured threshold, plus failed ones.
pub async fn list_stale_tasks(State(state): State<AppState>) -> HandlerResult<StaleTasksResponse> {
    let stale = state.job_tracker.stale_tasks(state.stale_after);
    let failed = state.job_tracker.failed_tasks();
    if !stale.is_empty() {
        info!(count = stale.len(), "Stale tasks reported");
    }
    Ok(Json(StaleTasksResponse { stale, failed }))
}
