//! Per-feature result rows and the aggregated plan totals.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Square metres in one hectare.
pub const M2_PER_HECTARE: f64 = 10_000.0;

/// Year-indexed values of one scenario (tCO2e).
pub type YearSeries = BTreeMap<i32, f64>;

/// Derived carbon metrics, either as totals or per hectare.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CarbonColumns {
    /// Above-ground (biomass) carbon, tCO2e.
    pub bio_carbon: f64,
    /// Below-ground (soil) carbon, tCO2e.
    pub ground_carbon: f64,
    pub total_carbon: f64,
    /// No-change scenario per horizon year.
    pub nochange: YearSeries,
    /// Planned scenario per horizon year.
    pub planned: YearSeries,
}

impl CarbonColumns {
    /// Every column multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |series: &YearSeries| -> YearSeries {
            series.iter().map(|(y, v)| (*y, v * factor)).collect()
        };
        Self {
            bio_carbon: self.bio_carbon * factor,
            ground_carbon: self.ground_carbon * factor,
            total_carbon: self.total_carbon * factor,
            nochange: scale(&self.nochange),
            planned: scale(&self.planned),
        }
    }

    /// Column-wise sum; years missing on one side count as zero.
    pub fn accumulate(&mut self, other: &Self) {
        self.bio_carbon += other.bio_carbon;
        self.ground_carbon += other.ground_carbon;
        self.total_carbon += other.total_carbon;
        for (year, value) in &other.nochange {
            *self.nochange.entry(*year).or_insert(0.0) += value;
        }
        for (year, value) in &other.planned {
            *self.planned.entry(*year).or_insert(0.0) += value;
        }
    }

    /// Per-hectare columns for an area in m². A zero area yields zeros.
    pub fn per_hectare(&self, area_m2: f64) -> Self {
        let hectares = area_m2 / M2_PER_HECTARE;
        if hectares > 0.0 && hectares.is_finite() {
            self.scaled(1.0 / hectares)
        } else {
            self.scaled(0.0)
        }
    }
}

/// One calculated feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    /// Position of the feature in the plan's collection.
    pub index: i64,
    pub feature_id: Option<String>,
    pub zoning_code: Option<String>,
    pub area_m2: f64,
    /// Area multiplier applied to the planned scenario.
    pub area_multiplier: f64,
    /// False when no stand matched the growth-curve table.
    pub growth_found: bool,
    /// Prepared geometry in the working CRS.
    pub geometry: Option<geojson::Geometry>,
    pub totals: CarbonColumns,
    pub per_hectare: CarbonColumns,
}

/// Aggregate of all rows of a finished plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportTotals {
    /// Area of the combined geometry.
    pub area_m2: f64,
    pub feature_count: usize,
    pub skipped_count: usize,
    /// True when features were skipped and the totals miss their share.
    pub partial: bool,
    pub geometry: Option<geojson::Geometry>,
    pub totals: CarbonColumns,
    pub per_hectare: CarbonColumns,
    pub calculated_at: DateTime<Utc>,
}
