//! Per-feature carbon calculator.
//!
//! A feature's row is built in three stages:
//!
//! 1. **Fetch**: biomass and soil carbon rasters per feature, stand-id rasters
//!    for every feature of the batch in one call, then the categorical variables
//!    of every stand id that overlaps a feature.
//! 2. **Measure**: overlap-weighted carbon sums and the stand overlap mask
//!    ([`measure_carbon`]). CPU bound, runs on the blocking pool.
//! 3. **Project**: growth projection and scenario columns
//!    ([`compute_feature_row`]).
//!
//! Stages 2 and 3 are pure; [`calculate_feature`] runs them on rasters that
//! were fetched already.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use geo::MultiPolygon;
use tracing::{debug, warn};

use super::growth::GrowthProjector;
use super::overlap::{compute_overlap, weighted_sum};
use super::CalculationError;
use crate::config::CalculationSettings;
use crate::db::repository::{GisRepository, RepositoryError};
use crate::geometry::{GeometryError, GeometryPreparer, PreparedGeometry};
use crate::models::{
    CarbonColumns, FeatureRow, OverlapMask, PlanFeature, RasterGrid, StandCategory, YearSeries,
    M2_PER_HECTARE,
};
use crate::reference::{AreaMultiplierTable, ReferenceData};
use crate::services::job_controller::FeatureCalculator;

/// Edge length of one raster cell in metres.
pub const CELL_SIZE_M: f64 = 16.0;

/// Hectares covered by one raster cell.
pub const HA_PER_CELL: f64 = CELL_SIZE_M * CELL_SIZE_M / M2_PER_HECTARE;

/// Carbon fraction of dry biomass.
pub const BIOMASS_TO_CARBON: f64 = 0.5;

/// Mass ratio of CO2 to carbon.
pub const CO2_PER_CARBON: f64 = 44.0 / 12.0;

/// Time inputs of a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalculationContext {
    pub current_year: i32,
    /// Year the stand variables describe.
    pub variables_base_year: i32,
    pub horizon_end_year: i32,
    pub horizon_step: i32,
}

impl CalculationContext {
    pub fn new(settings: &CalculationSettings, current_year: i32) -> Self {
        Self {
            current_year,
            variables_base_year: settings.variables_base_year,
            horizon_end_year: settings.horizon_end_year,
            horizon_step: settings.horizon_step,
        }
    }

    /// Context for the current calendar year (UTC).
    pub fn for_now(settings: &CalculationSettings) -> Self {
        Self::new(settings, Utc::now().year())
    }

    /// The current year followed by every multiple of the step up to the
    /// horizon end.
    pub fn horizon_years(&self) -> Vec<i32> {
        let mut years = vec![self.current_year];
        if self.horizon_step > 0 {
            years.extend(
                (self.current_year + 1..=self.horizon_end_year)
                    .filter(|y| y % self.horizon_step == 0),
            );
        }
        years
    }
}

/// Rasters fetched for one feature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureRasters {
    pub growth_carbon: Option<RasterGrid>,
    pub ground_carbon: Option<RasterGrid>,
    pub stands: Option<RasterGrid>,
}

/// Overlap-weighted measurements of one feature.
#[derive(Debug, Clone, PartialEq)]
pub struct CarbonMeasurement {
    /// Biomass carbon inside the geometry, tC.
    pub bio_tc: f64,
    /// Soil carbon inside the geometry, tC.
    pub ground_tc: f64,
    pub stands: Option<RasterGrid>,
    pub stand_mask: Option<OverlapMask>,
    /// Stand ids of cells with a positive overlap.
    pub stand_ids: BTreeSet<i64>,
}

/// Weight the fetched rasters by the feature's geometry.
///
/// Fails with [`CalculationError::NoData`] when either carbon raster is
/// missing or empty. A missing stand raster only means no growth.
pub fn measure_carbon(
    prepared: &PreparedGeometry,
    rasters: FeatureRasters,
) -> Result<CarbonMeasurement, CalculationError> {
    let bio = usable(rasters.growth_carbon).ok_or(CalculationError::NoData)?;
    let ground = usable(rasters.ground_carbon).ok_or(CalculationError::NoData)?;

    let bio_tc = carbon_tonnes(&bio, &prepared.geometry);
    let ground_tc = carbon_tonnes(&ground, &prepared.geometry);

    let stands = usable(rasters.stands);
    let stand_mask = stands
        .as_ref()
        .map(|grid| compute_overlap(grid, &prepared.geometry));
    let stand_ids = match (&stands, &stand_mask) {
        (Some(grid), Some(mask)) => overlapping_stand_ids(grid, mask),
        _ => BTreeSet::new(),
    };

    Ok(CarbonMeasurement {
        bio_tc,
        ground_tc,
        stands,
        stand_mask,
        stand_ids,
    })
}

fn usable(grid: Option<RasterGrid>) -> Option<RasterGrid> {
    grid.filter(|g| !g.is_empty())
}

fn carbon_tonnes(grid: &RasterGrid, geometry: &MultiPolygon<f64>) -> f64 {
    let cleaned = grid.without_sentinels();
    let mask = compute_overlap(&cleaned, geometry);
    weighted_sum(&cleaned, &mask) * HA_PER_CELL
}

fn overlapping_stand_ids(grid: &RasterGrid, mask: &OverlapMask) -> BTreeSet<i64> {
    grid.values
        .iter()
        .enumerate()
        .filter(|(idx, value)| {
            !grid.is_no_data(**value)
                && value.is_finite()
                && mask.fraction_at(*idx).is_some_and(|f| f > 0.0)
        })
        .map(|(_, value)| *value as i64)
        .collect()
}

/// Build the row of one feature from its measured carbon and growth.
pub fn compute_feature_row(
    ctx: &CalculationContext,
    multipliers: &AreaMultiplierTable,
    feature: &PlanFeature,
    prepared: &PreparedGeometry,
    measurement: &CarbonMeasurement,
    growth: Option<&YearSeries>,
    growth_found: bool,
) -> FeatureRow {
    let bio_carbon = measurement.bio_tc * CO2_PER_CARBON;
    let ground_carbon = measurement.ground_tc * CO2_PER_CARBON;
    let total_carbon = bio_carbon + ground_carbon;

    let zoning_code = feature.zoning_code();
    let multiplier = multipliers.lookup(zoning_code.as_deref());

    let mut nochange = YearSeries::new();
    let mut planned = YearSeries::new();
    for year in ctx.horizon_years() {
        let growth_term = growth
            .and_then(|series| series.get(&year))
            .map(|delta| delta * BIOMASS_TO_CARBON * HA_PER_CELL * CO2_PER_CARBON)
            .unwrap_or(0.0);
        let value = total_carbon + growth_term;
        nochange.insert(year, value);
        if year == ctx.current_year {
            planned.insert(year, value);
        } else {
            planned.insert(year, value * (1.0 - multiplier));
        }
    }

    let totals = CarbonColumns {
        bio_carbon,
        ground_carbon,
        total_carbon,
        nochange,
        planned,
    };
    let per_hectare = totals.per_hectare(prepared.area_m2);

    FeatureRow {
        index: feature.index,
        feature_id: feature.feature_id(),
        zoning_code,
        area_m2: prepared.area_m2,
        area_multiplier: multiplier,
        growth_found,
        geometry: Some(prepared.to_geojson()),
        totals,
        per_hectare,
    }
}

/// Calculate one feature from rasters and variables that are already at hand.
pub fn calculate_feature(
    ctx: &CalculationContext,
    reference: &ReferenceData,
    feature: &PlanFeature,
    prepared: &PreparedGeometry,
    rasters: FeatureRasters,
    variables: &HashMap<i64, StandCategory>,
) -> Result<FeatureRow, CalculationError> {
    let measurement = measure_carbon(prepared, rasters)?;
    build_rows(
        ctx,
        reference,
        vec![(feature.clone(), prepared.clone())],
        vec![Ok(measurement)],
        variables,
    )
    .pop()
    .unwrap_or(Err(CalculationError::NoData))
}

/// Project growth for every measured feature and build its row.
///
/// `items` and `measurements` are aligned; the result is aligned with both.
fn build_rows(
    ctx: &CalculationContext,
    reference: &ReferenceData,
    items: Vec<(PlanFeature, PreparedGeometry)>,
    mut measurements: Vec<Result<CarbonMeasurement, CalculationError>>,
    variables: &HashMap<i64, StandCategory>,
) -> Vec<Result<FeatureRow, CalculationError>> {
    let years = ctx.horizon_years();
    let (stand_rasters, masks): (Vec<_>, Vec<_>) = measurements
        .iter_mut()
        .map(|m| match m {
            Ok(m) => (m.stands.take(), m.stand_mask.take()),
            Err(_) => (None, None),
        })
        .unzip();

    let projector = GrowthProjector::new(
        &reference.growth_curves,
        ctx.current_year,
        ctx.variables_base_year,
    );
    let batch = projector.project(&stand_rasters, &years, variables, &masks);

    items
        .into_iter()
        .zip(measurements)
        .zip(batch.year_deltas.into_iter().zip(batch.found))
        .map(|(((feature, prepared), measurement), (growth, found))| {
            measurement.map(|m| {
                compute_feature_row(
                    ctx,
                    &reference.area_multipliers,
                    &feature,
                    &prepared,
                    &m,
                    growth.as_ref(),
                    found,
                )
            })
        })
        .collect()
}

struct PendingFeature {
    slot: usize,
    feature: PlanFeature,
    prepared: PreparedGeometry,
}

/// Calculator fetching its rasters through a [`GisRepository`].
pub struct CarbonCalculator<G: GisRepository + ?Sized> {
    gis: Arc<G>,
    reference: Arc<ReferenceData>,
    preparer: GeometryPreparer,
    settings: CalculationSettings,
    current_year: Option<i32>,
}

impl<G: GisRepository + ?Sized> CarbonCalculator<G> {
    pub fn new(gis: Arc<G>, reference: Arc<ReferenceData>, settings: CalculationSettings) -> Self {
        Self {
            gis,
            reference,
            preparer: GeometryPreparer::new(&settings),
            settings,
            current_year: None,
        }
    }

    /// Pin the current year for features that do not carry their plan's year.
    pub fn with_current_year(mut self, year: i32) -> Self {
        self.current_year = Some(year);
        self
    }

    /// Time inputs of a feature: its plan's calculation year, else the pinned
    /// year, else the clock.
    pub fn context_for(&self, feature: &PlanFeature) -> CalculationContext {
        match feature.calculation_year.or(self.current_year) {
            Some(year) => CalculationContext::new(&self.settings, year),
            None => CalculationContext::for_now(&self.settings),
        }
    }

    /// Calculate a single feature.
    pub async fn calculate(&self, feature: &PlanFeature) -> Result<FeatureRow, CalculationError> {
        self.calculate_batch(std::slice::from_ref(feature))
            .await
            .pop()
            .unwrap_or(Err(CalculationError::NoData))
    }

    /// Calculate several features; the result is aligned with the input.
    ///
    /// Stand rasters are fetched with one call per calculation year, which is
    /// a single call for the features of one plan. A failing shared fetch
    /// fails every feature it covered.
    pub async fn calculate_batch(
        &self,
        features: &[PlanFeature],
    ) -> Vec<Result<FeatureRow, CalculationError>> {
        let mut results: Vec<Option<Result<FeatureRow, CalculationError>>> =
            features.iter().map(|_| None).collect();

        let mut by_year: BTreeMap<i32, (CalculationContext, Vec<PendingFeature>)> =
            BTreeMap::new();
        for (slot, (feature, prepared)) in features
            .iter()
            .zip(self.prepare_all(features))
            .enumerate()
        {
            match prepared {
                Ok(prepared) => {
                    let ctx = self.context_for(feature);
                    by_year
                        .entry(ctx.current_year)
                        .or_insert_with(|| (ctx, Vec::new()))
                        .1
                        .push(PendingFeature {
                            slot,
                            feature: feature.clone(),
                            prepared,
                        });
                }
                Err(e) => {
                    warn!(index = feature.index, error = %e, "Geometry preparation failed");
                    results[slot] = Some(Err(e.into()));
                }
            }
        }

        for (ctx, pending) in by_year.into_values() {
            let slots: Vec<usize> = pending.iter().map(|p| p.slot).collect();
            match self.calculate_pending(ctx, pending).await {
                Ok(rows) => {
                    for (slot, row) in slots.into_iter().zip(rows) {
                        results[slot] = Some(row);
                    }
                }
                Err(e) => {
                    warn!(error = %e, features = slots.len(), "Batch fetch failed");
                    for slot in slots {
                        results[slot] = Some(Err(e.clone()));
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(CalculationError::NoData)))
            .collect()
    }

    /// Prepare geometries, one collection per source CRS. Small-area
    /// buffering is decided on the area of the features passed in together.
    fn prepare_all(
        &self,
        features: &[PlanFeature],
    ) -> Vec<Result<PreparedGeometry, GeometryError>> {
        let mut results: Vec<Option<Result<PreparedGeometry, GeometryError>>> =
            features.iter().map(|_| None).collect();
        let mut by_crs: HashMap<u32, Vec<usize>> = HashMap::new();

        for (i, feature) in features.iter().enumerate() {
            if feature.feature.geometry.is_some() {
                by_crs.entry(feature.source_crs).or_default().push(i);
            } else {
                results[i] = Some(Err(GeometryError::NotPolygonal));
            }
        }

        for (crs, indices) in by_crs {
            let geometries: Vec<geojson::Geometry> = indices
                .iter()
                .filter_map(|&i| features[i].feature.geometry.clone())
                .collect();
            for (i, prepared) in indices
                .into_iter()
                .zip(self.preparer.prepare_collection(&geometries, crs))
            {
                results[i] = Some(prepared);
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(GeometryError::NotPolygonal)))
            .collect()
    }

    async fn fetch_carbon(
        &self,
        region: &MultiPolygon<f64>,
        crs: u32,
    ) -> Result<(Option<RasterGrid>, Option<RasterGrid>), RepositoryError> {
        futures::future::try_join(
            self.gis.fetch_growth_carbon_raster(region, crs),
            self.gis.fetch_ground_carbon_raster(region, crs),
        )
        .await
    }

    async fn calculate_pending(
        &self,
        ctx: CalculationContext,
        pending: Vec<PendingFeature>,
    ) -> Result<Vec<Result<FeatureRow, CalculationError>>, CalculationError> {
        let crs = self.preparer.working_crs();
        let regions: Vec<MultiPolygon<f64>> = pending
            .iter()
            .map(|p| p.prepared.fetch_region.clone())
            .collect();

        let stand_rasters = self.gis.fetch_rasters_for_regions(&regions, crs).await?;
        if stand_rasters.len() != pending.len() {
            return Err(RepositoryError::internal(format!(
                "Expected {} stand rasters, got {}",
                pending.len(),
                stand_rasters.len()
            ))
            .with_operation("fetch_rasters_for_regions")
            .into());
        }

        let carbon = futures::future::join_all(
            regions.iter().map(|region| self.fetch_carbon(region, crs)),
        )
        .await;

        let inputs: Vec<Result<(PreparedGeometry, FeatureRasters), CalculationError>> = pending
            .iter()
            .zip(carbon)
            .zip(stand_rasters)
            .map(|((p, carbon), stands)| {
                let (growth_carbon, ground_carbon) = carbon?;
                Ok((
                    p.prepared.clone(),
                    FeatureRasters {
                        growth_carbon,
                        ground_carbon,
                        stands,
                    },
                ))
            })
            .collect();

        let measurements = tokio::task::spawn_blocking(move || {
            inputs
                .into_iter()
                .map(|input| input.and_then(|(prepared, rasters)| measure_carbon(&prepared, rasters)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| CalculationError::Task(e.to_string()))?;

        let stand_ids: Vec<i64> = measurements
            .iter()
            .flatten()
            .flat_map(|m| m.stand_ids.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let variables: HashMap<i64, StandCategory> = if stand_ids.is_empty() {
            HashMap::new()
        } else {
            self.gis
                .fetch_categorical_variables(&stand_ids)
                .await?
                .into_iter()
                .map(|v| (v.stand_id, v.category))
                .collect()
        };
        debug!(
            stands = stand_ids.len(),
            matched = variables.len(),
            "Fetched stand variables"
        );

        let reference = Arc::clone(&self.reference);
        let items: Vec<(PlanFeature, PreparedGeometry)> = pending
            .into_iter()
            .map(|p| (p.feature, p.prepared))
            .collect();
        tokio::task::spawn_blocking(move || {
            build_rows(&ctx, &reference, items, measurements, &variables)
        })
        .await
        .map_err(|e| CalculationError::Task(e.to_string()))
    }
}

#[async_trait]
impl<G: GisRepository + ?Sized + 'static> FeatureCalculator for CarbonCalculator<G> {
    async fn calculate(&self, feature: &PlanFeature) -> Result<FeatureRow, CalculationError> {
        CarbonCalculator::calculate(self, feature).await
    }
}

#[cfg(test)]
#[path = "carbon_tests.rs"]
mod carbon_tests;
