//! Growth-curve projection.
//!
//! Each stand-id cell of a feature is resolved to its categorical variables,
//! the variables to a growth-curve row, and the row's Mabp rate is accumulated
//! per requested year, weighted by the cell's overlap:
//!
//! `delta(year) += overlap × Mabp × (year − current + (current − base))`
//!
//! A feature without any matched cell, or whose deltas sum to exactly zero,
//! has no projection (`None`), which is distinct from a zero series.

use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::models::raster::{OverlapMask, RasterGrid};
use crate::models::report::YearSeries;
use crate::models::stand::StandCategory;
use crate::reference::GrowthCurveTable;

/// Output of [`GrowthProjector::project`], aligned with its inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionBatch {
    /// Growth delta per requested year, `None` when there is no growth data.
    pub year_deltas: Vec<Option<YearSeries>>,
    /// True when at least one covered cell matched a growth curve.
    pub found: Vec<bool>,
}

#[derive(Debug, Clone, Copy)]
pub struct GrowthProjector<'a> {
    table: &'a GrowthCurveTable,
    current_year: i32,
    base_year: i32,
}

impl<'a> GrowthProjector<'a> {
    pub fn new(table: &'a GrowthCurveTable, current_year: i32, base_year: i32) -> Self {
        Self {
            table,
            current_year,
            base_year,
        }
    }

    /// Years of growth between the variables' base year and `year`.
    pub fn year_offset(&self, year: i32) -> i32 {
        year - self.current_year + (self.current_year - self.base_year)
    }

    /// Project every feature.
    ///
    /// `stand_rasters[i]` holds the stand ids of feature `i` and
    /// `overlap_masks[i]` its overlap over that raster. A missing raster or
    /// mask yields no projection for that feature.
    pub fn project(
        &self,
        stand_rasters: &[Option<RasterGrid>],
        years: &[i32],
        variables: &HashMap<i64, StandCategory>,
        overlap_masks: &[Option<OverlapMask>],
    ) -> ProjectionBatch {
        let results: Vec<(Option<YearSeries>, bool)> = stand_rasters
            .par_iter()
            .enumerate()
            .map(|(i, raster)| {
                match (raster, overlap_masks.get(i).and_then(Option::as_ref)) {
                    (Some(raster), Some(mask)) => {
                        self.project_feature(i, raster, years, variables, mask)
                    }
                    _ => (None, false),
                }
            })
            .collect();

        let (year_deltas, found) = results.into_iter().unzip();
        ProjectionBatch { year_deltas, found }
    }

    fn project_feature(
        &self,
        feature: usize,
        raster: &RasterGrid,
        years: &[i32],
        variables: &HashMap<i64, StandCategory>,
        mask: &OverlapMask,
    ) -> (Option<YearSeries>, bool) {
        let offsets: Vec<(i32, f64)> = years
            .iter()
            .map(|&y| (y, f64::from(self.year_offset(y))))
            .collect();
        let mut sums: YearSeries = years.iter().map(|&y| (y, 0.0)).collect();
        let mut matched_cells = 0usize;
        let mut unmatched_cells = 0usize;
        let mut ambiguous = BTreeSet::new();

        for (idx, &value) in raster.values.iter().enumerate() {
            if raster.is_no_data(value) || !value.is_finite() {
                continue;
            }
            let Some(overlap) = mask.fraction_at(idx) else {
                warn!(feature, idx, "Stand cell outside the overlap mask, skipped");
                continue;
            };
            if overlap <= 0.0 {
                continue;
            }

            let stand_id = value as i64;
            let Some(row) = variables
                .get(&stand_id)
                .and_then(|category| self.table.lookup(category))
            else {
                unmatched_cells += 1;
                continue;
            };
            if self.table.is_ambiguous(&row.category) {
                ambiguous.insert(stand_id);
            }

            matched_cells += 1;
            for (year, offset) in &offsets {
                if let Some(sum) = sums.get_mut(year) {
                    *sum += overlap * row.mabp * offset;
                }
            }
        }

        if !ambiguous.is_empty() {
            warn!(
                feature,
                stands = ambiguous.len(),
                tie_break = ?self.table.tie_break(),
                "Stands matched several growth curves, tie-break applied"
            );
        }
        if matched_cells == 0 {
            warn!(
                feature,
                unmatched_cells, "No growth curve matched the feature's stands"
            );
            return (None, false);
        }
        debug!(feature, matched_cells, unmatched_cells, "Growth projected");

        if sums.values().sum::<f64>() == 0.0 {
            return (None, true);
        }
        (Some(sums), true)
    }
}

#[cfg(test)]
#[path = "growth_tests.rs"]
mod growth_tests;
