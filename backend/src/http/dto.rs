//! Data Transfer Objects for the HTTP API.
//!
//! The status answer is [`PlanStatus`] from the service layer, which already
//! derives Serialize/Deserialize.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::db::services::PlanStatus;
use crate::geometry::projection::EPSG_TM35FIN;
use crate::models::{CalculationStatus, NewPlan};
use crate::services::job_tracker::TrackedTask;

/// Request body for submitting a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPlanRequest {
    pub ui_id: Uuid,
    #[serde(default)]
    pub user_id: Option<String>,
    /// EPSG code of the submitted geometries (default: 3067)
    #[serde(default = "default_crs")]
    pub crs: u32,
    /// Feature property holding the zoning code
    #[serde(default)]
    pub zoning_col: Option<String>,
    pub feature_collection: geojson::FeatureCollection,
}

fn default_crs() -> u32 {
    EPSG_TM35FIN
}

impl From<SubmitPlanRequest> for NewPlan {
    fn from(request: SubmitPlanRequest) -> Self {
        NewPlan {
            ui_id: request.ui_id,
            user_id: request.user_id,
            source_crs: request.crs,
            zoning_col: request.zoning_col,
            features: request.feature_collection.features,
        }
    }
}

/// Response for an accepted submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPlanResponse {
    pub ui_id: Uuid,
    pub status: CalculationStatus,
    pub total_indices: i64,
    pub message: String,
}

/// Query parameters of the status endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    /// Queued and running units of work
    pub active_tasks: usize,
}

/// Tasks an external watchdog should look at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleTasksResponse {
    pub stale: Vec<TrackedTask>,
    pub failed: Vec<TrackedTask>,
}
