//! Overlap weighting.
//!
//! For every data cell of a raster the rectangular footprint is intersected
//! with the geometry; the covered fraction of the footprint becomes the cell's
//! weight. No-data cells are never computed and keep weight 0.

use std::panic::{catch_unwind, AssertUnwindSafe};

use geo::{Area, BooleanOps, BoundingRect, Intersects, MultiPolygon, Rect};
use rayon::prelude::*;
use tracing::warn;

use crate::models::raster::{OverlapMask, RasterGrid};

/// Fractions this close to 1 are reported as fully covered.
const FULL_COVER_TOLERANCE: f64 = 1e-9;
/// Fractions below this are intersection noise.
const EMPTY_COVER_TOLERANCE: f64 = 1e-12;

/// Per-cell covered fraction of `grid` by `geometry`, same shape as `grid`.
pub fn compute_overlap(grid: &RasterGrid, geometry: &MultiPolygon<f64>) -> OverlapMask {
    let mut mask = OverlapMask::zeros(grid.width, grid.height);
    if grid.is_empty() {
        return mask;
    }
    let Some(bounds) = geometry.bounding_rect() else {
        return mask;
    };
    let width = grid.width;

    mask.fractions
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(row, fractions)| {
            for (col, fraction) in fractions.iter_mut().enumerate() {
                if grid.is_no_data(grid.get(row, col)) {
                    continue;
                }
                let footprint = grid.transform.cell_footprint(row, col);
                if !bounds.intersects(&footprint) {
                    continue;
                }
                *fraction = cell_fraction(&footprint, geometry, row, col);
            }
        });
    mask
}

fn cell_fraction(footprint: &Rect<f64>, geometry: &MultiPolygon<f64>, row: usize, col: usize) -> f64 {
    let footprint_area = footprint.unsigned_area();
    if footprint_area <= 0.0 {
        return 0.0;
    }
    let cell = MultiPolygon::new(vec![footprint.to_polygon()]);

    let covered = catch_unwind(AssertUnwindSafe(|| cell.intersection(geometry).unsigned_area()));
    let covered = match covered {
        Ok(area) if area.is_finite() => area,
        Ok(area) => {
            warn!(row, col, area, "Non-finite cell intersection, counted as zero");
            return 0.0;
        }
        Err(_) => {
            warn!(row, col, "Cell intersection failed, counted as zero");
            return 0.0;
        }
    };

    let fraction = (covered / footprint_area).clamp(0.0, 1.0);
    if fraction >= 1.0 - FULL_COVER_TOLERANCE {
        1.0
    } else if fraction < EMPTY_COVER_TOLERANCE {
        0.0
    } else {
        fraction
    }
}

/// Sum of cell values weighted by their overlap; no-data cells are excluded.
pub fn weighted_sum(grid: &RasterGrid, mask: &OverlapMask) -> f64 {
    if !mask.matches_shape(grid) {
        warn!(
            grid_width = grid.width,
            grid_height = grid.height,
            mask_width = mask.width,
            mask_height = mask.height,
            "Overlap mask does not match raster shape"
        );
        return 0.0;
    }
    grid.values
        .iter()
        .zip(&mask.fractions)
        .filter(|(value, fraction)| **fraction > 0.0 && !grid.is_no_data(**value))
        .map(|(value, fraction)| value * fraction)
        .sum()
}

#[cfg(test)]
#[path = "overlap_tests.rs"]
mod overlap_tests;
