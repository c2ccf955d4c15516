//! Aggregation of a plan's rows into its totals record.

use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use geo::{Area, BooleanOps, Geometry, MultiPolygon};
use tracing::warn;

use crate::geometry::polygonal_parts;
use crate::models::{CarbonColumns, FeatureRow, ReportTotals};

/// Sum every total column of `rows` and re-derive per-hectare values from the
/// area of the combined geometry.
///
/// Overlapping features count once towards the area. When no row carries a
/// usable geometry, or the union fails, the row areas are summed instead.
pub fn aggregate_totals(
    rows: &[FeatureRow],
    skipped_count: usize,
    calculated_at: DateTime<Utc>,
) -> ReportTotals {
    let mut totals = CarbonColumns::default();
    for row in rows {
        totals.accumulate(&row.totals);
    }

    let combined = combined_geometry(rows);
    let area_m2 = match &combined {
        Some(geometry) => geometry.unsigned_area(),
        None => rows.iter().map(|r| r.area_m2).sum(),
    };
    let per_hectare = totals.per_hectare(area_m2);

    ReportTotals {
        area_m2,
        feature_count: rows.len(),
        skipped_count,
        partial: skipped_count > 0,
        geometry: combined
            .as_ref()
            .map(|g| geojson::Geometry::new(geojson::Value::from(g))),
        totals,
        per_hectare,
        calculated_at,
    }
}

fn combined_geometry(rows: &[FeatureRow]) -> Option<MultiPolygon<f64>> {
    let parts: Vec<MultiPolygon<f64>> = rows
        .iter()
        .filter_map(|row| row.geometry.clone())
        .filter_map(|g| Geometry::<f64>::try_from(g).ok())
        .filter_map(|g| polygonal_parts(&g))
        .collect();
    if parts.is_empty() {
        return None;
    }

    let union = catch_unwind(AssertUnwindSafe(|| {
        parts
            .iter()
            .skip(1)
            .fold(parts[0].clone(), |acc, part| acc.union(part))
    }));
    match union {
        Ok(union) => Some(union),
        Err(_) => {
            warn!(parts = parts.len(), "Union of feature geometries failed");
            None
        }
    }
}
