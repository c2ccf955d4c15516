//! GIS collaborator trait: raster and stand-variable fetches.

use async_trait::async_trait;
use geo::MultiPolygon;

use super::error::RepositoryResult;
use crate::models::{RasterGrid, StandVariables};

/// Read-only access to the carbon rasters and the stand inventory.
///
/// Regions are polygons in the EPSG code passed alongside. Rasters come back
/// clipped to the bounding box of the region; `None` means the source has no
/// cells there.
#[async_trait]
pub trait GisRepository: Send + Sync {
    /// Above-ground (biomass) carbon raster, tC/ha.
    async fn fetch_growth_carbon_raster(
        &self,
        region: &MultiPolygon<f64>,
        crs: u32,
    ) -> RepositoryResult<Option<RasterGrid>>;

    /// Below-ground (soil) carbon raster, tC/ha.
    async fn fetch_ground_carbon_raster(
        &self,
        region: &MultiPolygon<f64>,
        crs: u32,
    ) -> RepositoryResult<Option<RasterGrid>>;

    /// Categorical variables of the given stands. Unknown ids are omitted.
    async fn fetch_categorical_variables(
        &self,
        stand_ids: &[i64],
    ) -> RepositoryResult<Vec<StandVariables>>;

    /// Stand-id rasters for several regions, aligned with `regions`.
    async fn fetch_rasters_for_regions(
        &self,
        regions: &[MultiPolygon<f64>],
        crs: u32,
    ) -> RepositoryResult<Vec<Option<RasterGrid>>>;
}
