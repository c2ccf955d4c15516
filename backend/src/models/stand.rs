//! Forest stand descriptions and growth-curve reference records.

use serde::{Deserialize, Serialize};

/// Column names of the categorical attributes, in [`StandCategory`] field order.
pub const CATEGORY_COLUMNS: [&str; 8] = [
    "Region",
    "Maingroup",
    "Soiltype",
    "Drainage",
    "Fertility",
    "Species",
    "Structure",
    "Regime",
];

/// The fixed set of categorical attributes a growth curve is keyed by.
///
/// Two categories match only when all eight attributes are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StandCategory {
    pub region: i64,
    pub main_group: i64,
    pub soil_type: i64,
    pub drainage: i64,
    pub fertility: i64,
    pub species: i64,
    pub structure: i64,
    pub regime: i64,
}

impl StandCategory {
    /// Build from values given in [`CATEGORY_COLUMNS`] order.
    pub fn from_columns(values: [i64; 8]) -> Self {
        let [region, main_group, soil_type, drainage, fertility, species, structure, regime] =
            values;
        Self {
            region,
            main_group,
            soil_type,
            drainage,
            fertility,
            species,
            structure,
            regime,
        }
    }
}

/// Categorical variables of one stand, as fetched for the stand-id raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandVariables {
    pub stand_id: i64,
    pub category: StandCategory,
}

/// One row of the growth-curve table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthCurveRow {
    pub category: StandCategory,
    /// Mean annual biomass production.
    pub mabp: f64,
}
