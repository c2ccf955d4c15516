//! Process-wide reference tables.
//!
//! The growth-curve table and the area-multiplier table are loaded once at
//! startup into an immutable [`ReferenceData`] shared behind an `Arc`. Workers
//! only ever read them, so no locking is involved after initialization.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use polars::prelude::*;
use tracing::{info, warn};

use crate::config::ReferenceSettings;
use crate::models::stand::{GrowthCurveRow, StandCategory, CATEGORY_COLUMNS};

/// Column of the growth-curve table holding the mean annual biomass production.
pub const MABP_COLUMN: &str = "Mabp";
pub const ZONE_ID_COLUMN: &str = "zone_id";
pub const MULTIPLIER_COLUMN: &str = "multiplier";

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("Failed to read reference table {path}: {source}")]
    Read { path: String, source: PolarsError },
    #[error("Reference table {path} is malformed: {source}")]
    Schema { path: String, source: PolarsError },
}

/// Rule deciding which of several growth-curve rows with the same category wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// The row that appears first in the table file.
    #[default]
    FirstInTableOrder,
}

impl TieBreak {
    /// True when the row at `candidate` should replace the row at `incumbent`.
    pub fn prefers(&self, candidate: usize, incumbent: usize) -> bool {
        match self {
            Self::FirstInTableOrder => candidate < incumbent,
        }
    }
}

/// Growth-curve rows indexed by their full category.
#[derive(Debug, Clone, Default)]
pub struct GrowthCurveTable {
    rows: Vec<GrowthCurveRow>,
    index: HashMap<StandCategory, usize>,
    ambiguous: HashSet<StandCategory>,
    tie_break: TieBreak,
}

impl GrowthCurveTable {
    pub fn from_rows(rows: Vec<GrowthCurveRow>, tie_break: TieBreak) -> Self {
        let mut index: HashMap<StandCategory, usize> = HashMap::with_capacity(rows.len());
        let mut ambiguous = HashSet::new();

        for (position, row) in rows.iter().enumerate() {
            match index.get_mut(&row.category) {
                Some(incumbent) => {
                    ambiguous.insert(row.category);
                    if tie_break.prefers(position, *incumbent) {
                        *incumbent = position;
                    }
                }
                None => {
                    index.insert(row.category, position);
                }
            }
        }

        if !ambiguous.is_empty() {
            warn!(
                ambiguous_keys = ambiguous.len(),
                tie_break = ?tie_break,
                "Growth-curve table has categories matching more than one row"
            );
        }

        Self {
            rows,
            index,
            ambiguous,
            tie_break,
        }
    }

    /// Load the table from a CSV with the eight category columns and `Mabp`.
    pub fn from_csv(path: &Path) -> Result<Self, ReferenceError> {
        let df = read_csv(path)?;
        let rows = growth_rows_from_frame(&df).map_err(|source| ReferenceError::Schema {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_rows(rows, TieBreak::default()))
    }

    /// The row selected for `category` under the table's tie-break rule.
    pub fn lookup(&self, category: &StandCategory) -> Option<&GrowthCurveRow> {
        self.index.get(category).map(|&i| &self.rows[i])
    }

    /// Number of categories that match more than one row.
    pub fn ambiguous_keys(&self) -> usize {
        self.ambiguous.len()
    }

    /// True when `category` matches more than one row.
    pub fn is_ambiguous(&self, category: &StandCategory) -> bool {
        self.ambiguous.contains(category)
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn growth_rows_from_frame(df: &DataFrame) -> PolarsResult<Vec<GrowthCurveRow>> {
    let mut category_columns = Vec::with_capacity(CATEGORY_COLUMNS.len());
    for name in CATEGORY_COLUMNS {
        category_columns.push(df.column(name)?.cast(&DataType::Int64)?);
    }
    let category_values = category_columns
        .iter()
        .map(|c| c.i64())
        .collect::<PolarsResult<Vec<_>>>()?;
    let mabp_column = df.column(MABP_COLUMN)?.cast(&DataType::Float64)?;
    let mabp = mabp_column.f64()?;

    let mut rows = Vec::with_capacity(df.height());
    let mut incomplete = 0usize;
    'rows: for i in 0..df.height() {
        let mut values = [0i64; 8];
        for (slot, column) in values.iter_mut().zip(&category_values) {
            match column.get(i) {
                Some(v) => *slot = v,
                None => {
                    incomplete += 1;
                    continue 'rows;
                }
            }
        }
        let Some(rate) = mabp.get(i) else {
            incomplete += 1;
            continue;
        };
        rows.push(GrowthCurveRow {
            category: StandCategory::from_columns(values),
            mabp: rate,
        });
    }

    if incomplete > 0 {
        warn!(incomplete, "Skipped growth-curve rows with missing values");
    }
    Ok(rows)
}

/// Zoning code to planned-scenario efficiency multiplier.
#[derive(Debug, Clone, Default)]
pub struct AreaMultiplierTable {
    multipliers: HashMap<String, f64>,
}

impl AreaMultiplierTable {
    /// Build from `(zone_id, multiplier)` pairs. Values are clamped to `[0, 1]`.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let multipliers = pairs
            .into_iter()
            .map(|(zone, value)| {
                let zone = zone.into();
                let clamped = if value.is_finite() {
                    value.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                if clamped != value {
                    warn!(zone = %zone, value, clamped, "Area multiplier outside [0, 1]");
                }
                (zone, clamped)
            })
            .collect();
        Self { multipliers }
    }

    /// Load the table from a CSV with `zone_id` and `multiplier` columns.
    pub fn from_csv(path: &Path) -> Result<Self, ReferenceError> {
        let df = read_csv(path)?;
        let pairs = multiplier_pairs_from_frame(&df).map_err(|source| ReferenceError::Schema {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_pairs(pairs))
    }

    /// Multiplier for a zoning code; 0 when the code is absent or unknown.
    pub fn lookup(&self, zoning_code: Option<&str>) -> f64 {
        zoning_code
            .and_then(|code| self.multipliers.get(code.trim()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.multipliers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.multipliers.is_empty()
    }
}

fn multiplier_pairs_from_frame(df: &DataFrame) -> PolarsResult<Vec<(String, f64)>> {
    let zone_column = df.column(ZONE_ID_COLUMN)?.cast(&DataType::String)?;
    let zones = zone_column.str()?;
    let value_column = df.column(MULTIPLIER_COLUMN)?.cast(&DataType::Float64)?;
    let values = value_column.f64()?;

    Ok(zones
        .into_iter()
        .zip(values)
        .filter_map(|(zone, value)| Some((zone?.trim().to_string(), value?)))
        .collect())
}

fn read_csv(path: &Path) -> Result<DataFrame, ReferenceError> {
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.into()))
        .and_then(|reader| reader.finish())
        .map_err(|source| ReferenceError::Read {
            path: path.display().to_string(),
            source,
        })
}

/// Both reference tables, shared read-only by every worker.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub growth_curves: GrowthCurveTable,
    pub area_multipliers: AreaMultiplierTable,
}

impl ReferenceData {
    pub fn new(growth_curves: GrowthCurveTable, area_multipliers: AreaMultiplierTable) -> Self {
        Self {
            growth_curves,
            area_multipliers,
        }
    }

    /// Load both tables from the configured data directory.
    pub fn load(settings: &ReferenceSettings) -> Result<Self, ReferenceError> {
        let growth_curves = GrowthCurveTable::from_csv(&settings.growth_curves_path())?;
        let area_multipliers = AreaMultiplierTable::from_csv(&settings.area_multipliers_path())?;
        info!(
            growth_rows = growth_curves.len(),
            zones = area_multipliers.len(),
            "Reference tables loaded"
        );
        Ok(Self::new(growth_curves, area_multipliers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "Region,Maingroup,Soiltype,Drainage,Fertility,Species,Structure,Regime,Mabp";

    fn category(species: i64) -> StandCategory {
        StandCategory::from_columns([1, 1, 2, 1, 3, species, 1, 0])
    }

    fn write_csv(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_first_row_wins_for_duplicate_category() {
        let rows = vec![
            GrowthCurveRow { category: category(1), mabp: 2.5 },
            GrowthCurveRow { category: category(2), mabp: 4.0 },
            GrowthCurveRow { category: category(1), mabp: 9.0 },
        ];
        let table = GrowthCurveTable::from_rows(rows, TieBreak::FirstInTableOrder);

        assert_eq!(table.lookup(&category(1)).map(|r| r.mabp), Some(2.5));
        assert_eq!(table.ambiguous_keys(), 1);
        assert!(table.is_ambiguous(&category(1)));
        assert!(!table.is_ambiguous(&category(2)));
        assert!(table.lookup(&category(7)).is_none());
    }

    #[test]
    fn test_growth_curves_load_from_csv() {
        let file = write_csv(&format!(
            "{HEADER}\n1,1,2,1,3,1,1,0,2.5\n1,1,2,1,3,2,1,0,4\n1,1,2,1,3,1,1,0,9.0\n"
        ));
        let table = GrowthCurveTable::from_csv(file.path()).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.lookup(&category(2)).map(|r| r.mabp), Some(4.0));
        assert_eq!(table.lookup(&category(1)).map(|r| r.mabp), Some(2.5));
    }

    #[test]
    fn test_growth_curves_missing_column_is_schema_error() {
        let file = write_csv("Region,Mabp\n1,2.0\n");
        assert!(matches!(
            GrowthCurveTable::from_csv(file.path()),
            Err(ReferenceError::Schema { .. })
        ));
    }

    #[test]
    fn test_area_multiplier_defaults_to_zero() {
        let table = AreaMultiplierTable::from_pairs([("M", 0.25), ("AP", 1.7)]);
        assert_eq!(table.lookup(Some("M")), 0.25);
        assert_eq!(table.lookup(Some("AP")), 1.0);
        assert_eq!(table.lookup(Some("unknown")), 0.0);
        assert_eq!(table.lookup(None), 0.0);
    }

    #[test]
    fn test_area_multipliers_load_from_csv() {
        let file = write_csv("zone_id,multiplier\nM,0.5\nV,0.1\n");
        let table = AreaMultiplierTable::from_csv(file.path()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(Some("V")), 0.1);
    }
}
