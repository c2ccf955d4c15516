//! Plan store trait.

use async_trait::async_trait;
use uuid::Uuid;

use super::error::RepositoryResult;
use crate::models::{CalculationStatus, FeatureRow, NewPlan, Plan, PlanFeature, PlanId, SkippedFeature};

/// Repository trait for plans, their features and their result rows.
///
/// Writes that follow a feature's progress are monotonic: rows and skip
/// records are only ever appended, and the feature collection changes only
/// through a full re-upload.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` to work with async Rust.
#[async_trait]
pub trait PlanRepository: Send + Sync {
    /// Check if the store is reachable.
    async fn health_check(&self) -> RepositoryResult<bool>;

    /// Store a new plan in `NOT_STARTED` with `last_index = -1`.
    async fn create_plan(&self, plan: NewPlan) -> RepositoryResult<Plan>;

    /// Replace the features of an existing plan and clear everything derived
    /// from them: rows, skip records, totals and progress.
    async fn reset_plan(&self, plan_id: PlanId, plan: NewPlan) -> RepositoryResult<Plan>;

    async fn get_plan(&self, plan_id: PlanId) -> RepositoryResult<Plan>;

    async fn get_plan_by_ui_id(&self, ui_id: Uuid) -> RepositoryResult<Option<Plan>>;

    /// Merge the bookkeeping fields of `plan` into the stored record.
    ///
    /// Features, rows and skip records are never touched. Returns the stored
    /// record with its refreshed `updated_ts`.
    async fn update_plan(&self, plan: &Plan) -> RepositoryResult<Plan>;

    /// Append rows keyed by feature index. Rows whose index is already stored
    /// are ignored; returns the number of rows added.
    async fn append_feature_rows(
        &self,
        plan_id: PlanId,
        rows: Vec<FeatureRow>,
    ) -> RepositoryResult<usize>;

    async fn get_feature_at_index(
        &self,
        plan_id: PlanId,
        index: i64,
    ) -> RepositoryResult<Option<PlanFeature>>;

    /// All rows of a plan ordered by feature index.
    async fn list_feature_rows(&self, plan_id: PlanId) -> RepositoryResult<Vec<FeatureRow>>;

    /// Record a skipped feature. Returns `false` if that index was already recorded.
    async fn record_skipped_feature(
        &self,
        plan_id: PlanId,
        skipped: SkippedFeature,
    ) -> RepositoryResult<bool>;

    async fn list_skipped_features(&self, plan_id: PlanId)
        -> RepositoryResult<Vec<SkippedFeature>>;

    async fn list_plans_with_status(
        &self,
        status: CalculationStatus,
    ) -> RepositoryResult<Vec<Plan>>;
}
