//! EPSG reprojection of geometries through proj4rs.

use geo::{Coord, MapCoords, MultiPolygon};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use super::GeometryError;

/// ETRS89 / TM35FIN, the working system of the carbon rasters.
pub const EPSG_TM35FIN: u32 = 3067;
pub const EPSG_WGS84: u32 = 4326;
pub const EPSG_ETRS89: u32 = 4258;
pub const EPSG_WEB_MERCATOR: u32 = 3857;

/// EPSG codes a submission may use.
pub const SUPPORTED_EPSG: [u32; 4] = [EPSG_TM35FIN, EPSG_WGS84, EPSG_ETRS89, EPSG_WEB_MERCATOR];

fn proj_string(epsg: u32) -> Option<&'static str> {
    match epsg {
        EPSG_TM35FIN => Some(
            "+proj=utm +zone=35 +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs",
        ),
        EPSG_WGS84 => Some("+proj=longlat +datum=WGS84 +no_defs"),
        EPSG_ETRS89 => Some("+proj=longlat +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +no_defs"),
        EPSG_WEB_MERCATOR => Some(
            "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs",
        ),
        _ => None,
    }
}

fn is_geographic(epsg: u32) -> bool {
    matches!(epsg, EPSG_WGS84 | EPSG_ETRS89)
}

pub fn is_supported(epsg: u32) -> bool {
    proj_string(epsg).is_some()
}

/// Reusable transformer between two supported EPSG codes.
pub struct CoordTransformer {
    source: Proj,
    target: Proj,
    source_epsg: u32,
    target_epsg: u32,
}

impl std::fmt::Debug for CoordTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordTransformer")
            .field("source_epsg", &self.source_epsg)
            .field("target_epsg", &self.target_epsg)
            .finish_non_exhaustive()
    }
}

impl CoordTransformer {
    pub fn new(source_epsg: u32, target_epsg: u32) -> Result<Self, GeometryError> {
        Ok(Self {
            source: build_proj(source_epsg)?,
            target: build_proj(target_epsg)?,
            source_epsg,
            target_epsg,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.source_epsg == self.target_epsg
    }

    /// Transform one coordinate, handling degree/radian conversion.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), GeometryError> {
        if self.is_identity() {
            return Ok((x, y));
        }
        let mut point = if is_geographic(self.source_epsg) {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };

        transform(&self.source, &self.target, &mut point).map_err(|e| {
            GeometryError::Projection(format!(
                "EPSG:{} -> EPSG:{} failed for ({x}, {y}): {e:?}",
                self.source_epsg, self.target_epsg
            ))
        })?;

        if is_geographic(self.target_epsg) {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }

    pub fn transform_multi_polygon(
        &self,
        geometry: &MultiPolygon<f64>,
    ) -> Result<MultiPolygon<f64>, GeometryError> {
        if self.is_identity() {
            return Ok(geometry.clone());
        }
        geometry.try_map_coords(|c| {
            let (x, y) = self.transform(c.x, c.y)?;
            if x.is_finite() && y.is_finite() {
                Ok(Coord { x, y })
            } else {
                Err(GeometryError::Projection(format!(
                    "non-finite coordinate for ({}, {})",
                    c.x, c.y
                )))
            }
        })
    }
}

fn build_proj(epsg: u32) -> Result<Proj, GeometryError> {
    let definition = proj_string(epsg).ok_or(GeometryError::UnsupportedCrs(epsg))?;
    Proj::from_proj_string(definition)
        .map_err(|e| GeometryError::Projection(format!("invalid projection EPSG:{epsg}: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_central_meridian_maps_to_false_easting() {
        let t = CoordTransformer::new(EPSG_WGS84, EPSG_TM35FIN).unwrap();
        let (x, y) = t.transform(27.0, 60.0).unwrap();
        assert_abs_diff_eq!(x, 500_000.0, epsilon = 1.0);
        assert_abs_diff_eq!(y, 6_651_411.0, epsilon = 1_000.0);
    }

    #[test]
    fn test_round_trip_through_working_crs() {
        let forward = CoordTransformer::new(EPSG_WGS84, EPSG_TM35FIN).unwrap();
        let back = CoordTransformer::new(EPSG_TM35FIN, EPSG_WGS84).unwrap();
        let (x, y) = forward.transform(24.94, 60.17).unwrap();
        let (lon, lat) = back.transform(x, y).unwrap();
        assert_abs_diff_eq!(lon, 24.94, epsilon = 1e-6);
        assert_abs_diff_eq!(lat, 60.17, epsilon = 1e-6);
    }

    #[test]
    fn test_unsupported_code_is_rejected() {
        assert!(matches!(
            CoordTransformer::new(2393, EPSG_TM35FIN),
            Err(GeometryError::UnsupportedCrs(2393))
        ));
        assert!(is_supported(EPSG_WEB_MERCATOR));
    }
}
