//! Per-feature carbon accounting.
//!
//! - [`overlap`]: fractional cell coverage of a geometry over a raster
//! - [`growth`]: growth-curve projection of stand categories into yearly deltas
//! - [`carbon`]: the per-feature calculator tying fetches, overlap and growth together
//! - [`totals`]: aggregation of finished rows into plan totals

pub mod carbon;
pub mod growth;
pub mod overlap;
pub mod totals;

pub use carbon::{CalculationContext, CarbonCalculator};
pub use growth::{GrowthProjector, ProjectionBatch};
pub use overlap::{compute_overlap, weighted_sum};
pub use totals::aggregate_totals;

use crate::db::repository::RepositoryError;
use crate::geometry::GeometryError;

/// Failure of one feature's calculation. Never fatal for the plan.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CalculationError {
    #[error("no data for geometry")]
    NoData,
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("Calculation task failed: {0}")]
    Task(String),
}
