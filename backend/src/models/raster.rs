//! Raster cell grids and the overlap masks computed against them.

use geo::{coord, Rect};
use serde::{Deserialize, Serialize};

/// Carbon raster value marking a cell without measurement.
pub const NO_DATA_SENTINEL: f64 = 32766.0;
/// Carbon raster value marking a non-forest cell.
pub const NON_FOREST_SENTINEL: f64 = 32767.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RasterError {
    #[error("Raster of {width}x{height} cells needs {expected} values, got {actual}")]
    ShapeMismatch {
        width: usize,
        height: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Raster cell size must be non-zero")]
    DegenerateTransform,
}

/// Affine transform from (col, row) grid indices to map coordinates.
///
/// Follows the GDAL/rasterio layout:
/// `x = a * col + b * row + c`, `y = d * col + e * row + f`.
/// North-up grids have `b == d == 0` and a negative `e`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    /// North-up transform with square cells and the upper-left corner at `(origin_x, origin_y)`.
    pub fn north_up(origin_x: f64, origin_y: f64, cell_size: f64) -> Self {
        Self {
            a: cell_size,
            b: 0.0,
            c: origin_x,
            d: 0.0,
            e: -cell_size,
            f: origin_y,
        }
    }

    /// Map coordinate of a fractional grid position.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Map coordinate of the center of cell `(row, col)`.
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    pub fn cell_width(&self) -> f64 {
        self.a
    }

    /// Positive for north-up grids.
    pub fn cell_height(&self) -> f64 {
        -self.e
    }

    /// Rectangular footprint of cell `(row, col)`, centered on the cell center.
    pub fn cell_footprint(&self, row: usize, col: usize) -> Rect<f64> {
        let (x, y) = self.cell_center(row, col);
        let half_w = self.cell_width().abs() / 2.0;
        let half_h = self.cell_height().abs() / 2.0;
        Rect::new(
            coord! { x: x - half_w, y: y - half_h },
            coord! { x: x + half_w, y: y + half_h },
        )
    }
}

/// A 2-D grid of scalar values in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    pub values: Vec<f64>,
}

impl RasterGrid {
    pub fn new(
        width: usize,
        height: usize,
        transform: GeoTransform,
        nodata: Option<f64>,
        values: Vec<f64>,
    ) -> Result<Self, RasterError> {
        let expected = width * height;
        if values.len() != expected {
            return Err(RasterError::ShapeMismatch {
                width,
                height,
                expected,
                actual: values.len(),
            });
        }
        if transform.cell_width() == 0.0 || transform.cell_height() == 0.0 {
            return Err(RasterError::DegenerateTransform);
        }
        Ok(Self {
            width,
            height,
            transform,
            nodata,
            values,
        })
    }

    /// Grid with every cell set to `value`.
    pub fn filled(width: usize, height: usize, transform: GeoTransform, value: f64) -> Self {
        Self {
            width,
            height,
            transform,
            nodata: None,
            values: vec![value; width * height],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.width + col]
    }

    /// True for NaN and for the grid's declared no-data value.
    #[inline]
    pub fn is_no_data(&self, value: f64) -> bool {
        value.is_nan() || self.nodata == Some(value)
    }

    /// Copy of a carbon raster with the no-data and non-forest sentinels turned into NaN.
    pub fn without_sentinels(&self) -> Self {
        let values = self
            .values
            .iter()
            .map(|&v| {
                if self.is_no_data(v) || v >= NO_DATA_SENTINEL {
                    f64::NAN
                } else {
                    v
                }
            })
            .collect();
        Self {
            values,
            nodata: None,
            ..self.clone()
        }
    }

    /// Map-space bounds of the whole grid.
    pub fn bounds(&self) -> Rect<f64> {
        let (x0, y0) = self.transform.apply(0.0, 0.0);
        let (x1, y1) = self
            .transform
            .apply(self.width as f64, self.height as f64);
        Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 })
    }

    /// Sub-grid of the cells whose footprint touches `region`, or `None` when
    /// the region misses the grid. Only north-up grids are clipped.
    pub fn clip_to(&self, region: &Rect<f64>) -> Option<RasterGrid> {
        let t = &self.transform;
        if t.b != 0.0 || t.d != 0.0 || self.is_empty() {
            return None;
        }
        let col_of = |x: f64| (x - t.c) / t.a;
        let row_of = |y: f64| (y - t.f) / t.e;

        let (c0, c1) = ordered(col_of(region.min().x), col_of(region.max().x));
        let (r0, r1) = ordered(row_of(region.min().y), row_of(region.max().y));

        let col_start = c0.floor().max(0.0) as usize;
        let row_start = r0.floor().max(0.0) as usize;
        let col_end = (c1.ceil().min(self.width as f64)).max(0.0) as usize;
        let row_end = (r1.ceil().min(self.height as f64)).max(0.0) as usize;
        if col_start >= col_end || row_start >= row_end {
            return None;
        }

        let width = col_end - col_start;
        let height = row_end - row_start;
        let mut values = Vec::with_capacity(width * height);
        for row in row_start..row_end {
            let offset = row * self.width;
            values.extend_from_slice(&self.values[offset + col_start..offset + col_end]);
        }
        let (origin_x, origin_y) = t.apply(col_start as f64, row_start as f64);
        Some(RasterGrid {
            width,
            height,
            transform: GeoTransform {
                c: origin_x,
                f: origin_y,
                ..*t
            },
            nodata: self.nodata,
            values,
        })
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Per-cell fraction (0.0..=1.0) of a raster cell covered by one geometry.
///
/// Same shape as the raster it was computed from; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapMask {
    pub width: usize,
    pub height: usize,
    pub fractions: Vec<f64>,
}

impl OverlapMask {
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            fractions: vec![0.0; width * height],
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.fractions[row * self.width + col]
    }

    /// Fraction by flat index; `None` when the index is outside the mask.
    #[inline]
    pub fn fraction_at(&self, idx: usize) -> Option<f64> {
        self.fractions.get(idx).copied()
    }

    pub fn matches_shape(&self, grid: &RasterGrid) -> bool {
        self.width == grid.width && self.height == grid.height
    }

    /// Total covered area expressed in cells.
    pub fn covered_cells(&self) -> f64 {
        self.fractions.iter().sum()
    }
}
