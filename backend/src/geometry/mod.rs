//! Geometry preparation.
//!
//! Turns submitted GeoJSON geometries into valid polygonal geometries in the
//! working CRS:
//!
//! 1. non-polygonal members (points, lines) are dropped,
//! 2. the remaining polygons are reprojected,
//! 3. invalid results get one zero-distance buffer repair and are re-validated,
//! 4. small collections additionally get a buffered fetch region so raster
//!    queries do not miss boundary pixels. The collection is whatever is
//!    prepared together; the job controller calculates one feature per unit of
//!    work, so there the threshold applies to that feature's own area.
//!
//! A geometry that stays invalid fails with [`GeometryError`]; that only
//! affects the feature it belongs to.

pub mod projection;

use std::panic::{catch_unwind, AssertUnwindSafe};

use geo::{Area, BooleanOps, BoundingRect, Buffer, Geometry, MultiPolygon, Polygon, Rect, Validation};
use tracing::{debug, warn};

use crate::config::CalculationSettings;
pub use projection::{CoordTransformer, SUPPORTED_EPSG};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("Geometry has no polygonal parts")]
    NotPolygonal,
    #[error("Geometry is invalid after repair: {0}")]
    Unrepairable(String),
    #[error("Unsupported coordinate system EPSG:{0}")]
    UnsupportedCrs(u32),
    #[error("Reprojection failed: {0}")]
    Projection(String),
    #[error("Could not read geometry: {0}")]
    Conversion(String),
}

/// A geometry ready for raster overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedGeometry {
    /// Valid polygonal geometry in the working CRS.
    pub geometry: MultiPolygon<f64>,
    /// Region used for raster fetches; `geometry` itself unless buffered.
    pub fetch_region: MultiPolygon<f64>,
    pub area_m2: f64,
    /// True when the zero-distance buffer repair was applied.
    pub repaired: bool,
}

impl PreparedGeometry {
    pub fn fetch_bounds(&self) -> Option<Rect<f64>> {
        self.fetch_region.bounding_rect()
    }

    pub fn to_geojson(&self) -> geojson::Geometry {
        geojson::Geometry::new(geojson::Value::from(&self.geometry))
    }
}

#[derive(Debug, Clone)]
pub struct GeometryPreparer {
    working_crs: u32,
    small_area_threshold_m2: f64,
    fetch_buffer_m: f64,
}

impl GeometryPreparer {
    pub fn new(settings: &CalculationSettings) -> Self {
        Self {
            working_crs: settings.working_crs,
            small_area_threshold_m2: settings.small_area_threshold_m2,
            fetch_buffer_m: settings.fetch_buffer_m,
        }
    }

    pub fn working_crs(&self) -> u32 {
        self.working_crs
    }

    /// Prepare one geometry on its own.
    pub fn prepare(
        &self,
        geometry: &geojson::Geometry,
        source_crs: u32,
    ) -> Result<PreparedGeometry, GeometryError> {
        self.prepare_collection(std::slice::from_ref(geometry), source_crs)
            .pop()
            .unwrap_or(Err(GeometryError::NotPolygonal))
    }

    /// Prepare every geometry of a collection.
    ///
    /// Results are aligned with the input. The buffered fetch region is used
    /// when the combined area of the successfully prepared geometries is below
    /// the small-area threshold.
    pub fn prepare_collection(
        &self,
        geometries: &[geojson::Geometry],
        source_crs: u32,
    ) -> Vec<Result<PreparedGeometry, GeometryError>> {
        let transformer = match CoordTransformer::new(source_crs, self.working_crs) {
            Ok(t) => t,
            Err(e) => return geometries.iter().map(|_| Err(e.clone())).collect(),
        };

        let mut prepared: Vec<_> = geometries
            .iter()
            .map(|g| self.prepare_one(g, &transformer))
            .collect();

        let total_area: f64 = prepared
            .iter()
            .filter_map(|p| p.as_ref().ok())
            .map(|p| p.area_m2)
            .sum();

        if total_area < self.small_area_threshold_m2 && self.fetch_buffer_m > 0.0 {
            debug!(
                total_area,
                buffer_m = self.fetch_buffer_m,
                "Small collection, buffering fetch regions"
            );
            for p in prepared.iter_mut().flatten() {
                let buffered =
                    catch_unwind(AssertUnwindSafe(|| p.geometry.buffer(self.fetch_buffer_m)));
                match buffered {
                    Ok(region) => p.fetch_region = region,
                    Err(_) => warn!("Fetch region buffer failed, using the geometry itself"),
                }
            }
        }
        prepared
    }

    fn prepare_one(
        &self,
        geometry: &geojson::Geometry,
        transformer: &CoordTransformer,
    ) -> Result<PreparedGeometry, GeometryError> {
        let geometry = Geometry::<f64>::try_from(geometry.clone())
            .map_err(|e| GeometryError::Conversion(e.to_string()))?;
        let polygons = polygonal_parts(&geometry).ok_or(GeometryError::NotPolygonal)?;
        let projected = transformer.transform_multi_polygon(&polygons)?;
        let (geometry, repaired) = ensure_valid(projected)?;
        let area_m2 = geometry.unsigned_area();

        Ok(PreparedGeometry {
            fetch_region: geometry.clone(),
            geometry,
            area_m2,
            repaired,
        })
    }
}

/// The polygonal members of a geometry, or `None` if there are none.
pub fn polygonal_parts(geometry: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    let mut polygons = Vec::new();
    collect_polygons(geometry, &mut polygons);
    if polygons.is_empty() {
        None
    } else {
        Some(MultiPolygon::new(polygons))
    }
}

fn collect_polygons(geometry: &Geometry<f64>, out: &mut Vec<Polygon<f64>>) {
    match geometry {
        Geometry::Polygon(p) => out.push(p.clone()),
        Geometry::MultiPolygon(mp) => out.extend(mp.0.iter().cloned()),
        Geometry::Rect(r) => out.push(r.to_polygon()),
        Geometry::Triangle(t) => out.push(t.to_polygon()),
        Geometry::GeometryCollection(gc) => {
            for member in gc.iter() {
                collect_polygons(member, out);
            }
        }
        Geometry::Point(_)
        | Geometry::Line(_)
        | Geometry::LineString(_)
        | Geometry::MultiPoint(_)
        | Geometry::MultiLineString(_) => {}
    }
}

/// Validate, applying one zero-distance buffer repair when needed.
pub fn ensure_valid(geometry: MultiPolygon<f64>) -> Result<(MultiPolygon<f64>, bool), GeometryError> {
    if geometry.is_valid() {
        return Ok((geometry, false));
    }

    let repaired = catch_unwind(AssertUnwindSafe(|| zero_buffer(&geometry))).map_err(|_| {
        GeometryError::Unrepairable("zero-distance buffer failed on degenerate input".to_string())
    })?;
    if repaired.0.is_empty() {
        return Err(GeometryError::Unrepairable(
            "repair produced an empty geometry".to_string(),
        ));
    }
    if !repaired.is_valid() {
        return Err(GeometryError::Unrepairable(
            "geometry still invalid after zero-distance buffer".to_string(),
        ));
    }
    warn!("Repaired invalid geometry with a zero-distance buffer");
    Ok((repaired, true))
}

/// Zero-distance buffer: re-noding every part through a union resolves
/// self-intersections and merges overlapping parts.
fn zero_buffer(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    geometry
        .0
        .iter()
        .fold(MultiPolygon::new(vec![]), |acc, polygon| {
            acc.union(&MultiPolygon::new(vec![polygon.clone()]))
        })
}
