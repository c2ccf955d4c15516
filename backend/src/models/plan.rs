//! Plan records: one user submission and its incremental calculation progress.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::report::ReportTotals;

/// Store-assigned plan key. External callers address plans by `ui_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub i64);

impl PlanId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `last_index` value of a plan on which no feature has been processed yet.
pub const NO_INDEX: i64 = -1;

/// Overall plan status, also reused for the per-feature sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalculationStatus {
    NotStarted,
    Processing,
    Finished,
    Error,
}

impl CalculationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Processing => "PROCESSING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
        }
    }

    /// `FINISHED` and `ERROR` are never left by the job controller.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

impl fmt::Display for CalculationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalculationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "PROCESSING" => Ok(Self::Processing),
            "FINISHED" => Ok(Self::Finished),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("Unknown calculation status: {}", other)),
        }
    }
}

/// Stored plan without its feature collection and report rows.
///
/// Features, rows and skip records live next to the plan in the store and are
/// only reachable through the append/index operations of
/// [`PlanRepository`](crate::db::repository::PlanRepository).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub ui_id: Uuid,
    pub user_id: Option<String>,
    /// EPSG code the submitted geometries are expressed in.
    pub source_crs: u32,
    /// Feature property holding the zoning code.
    pub zoning_col: Option<String>,
    /// Year every row's horizon is counted from, fixed when the plan is
    /// submitted so a run crossing New Year keeps one set of year columns.
    pub calculation_year: i32,
    pub total_indices: i64,
    /// Index of the last fully processed feature, [`NO_INDEX`] when none.
    pub last_index: i64,
    pub last_area_calculation_status: Option<CalculationStatus>,
    pub last_area_calculation_retries: u32,
    /// Message of the most recent failed feature attempt.
    pub last_area_calculation_error: Option<String>,
    pub calculation_status: CalculationStatus,
    pub report_totals: Option<ReportTotals>,
    /// Plan-level error message, set together with `ERROR`.
    pub message: Option<String>,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
    pub calculation_updated_ts: Option<DateTime<Utc>>,
    pub calculated_ts: Option<DateTime<Utc>>,
}

impl Plan {
    /// Index of the next feature to process.
    pub fn next_index(&self) -> i64 {
        self.last_index + 1
    }

    /// True once every feature has been processed or skipped.
    pub fn all_features_processed(&self) -> bool {
        self.next_index() >= self.total_indices
    }

    /// Move past the next feature and reset the attempt bookkeeping.
    pub fn advance(&mut self) {
        if !self.all_features_processed() {
            self.last_index += 1;
        }
        self.last_area_calculation_retries = 0;
    }
}

/// A submission as accepted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlan {
    pub ui_id: Uuid,
    pub user_id: Option<String>,
    pub source_crs: u32,
    pub zoning_col: Option<String>,
    pub features: Vec<geojson::Feature>,
}

/// One feature of a plan, together with what is needed to calculate it alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFeature {
    pub index: i64,
    pub source_crs: u32,
    pub zoning_col: Option<String>,
    /// The plan's calculation year; `None` for features calculated outside a plan.
    #[serde(default)]
    pub calculation_year: Option<i32>,
    pub feature: geojson::Feature,
}

impl PlanFeature {
    /// The GeoJSON `id` member, stringified.
    pub fn feature_id(&self) -> Option<String> {
        self.feature.id.as_ref().map(|id| match id {
            geojson::feature::Id::String(s) => s.clone(),
            geojson::feature::Id::Number(n) => n.to_string(),
        })
    }

    /// Zoning code read from the configured property. Numbers are stringified.
    pub fn zoning_code(&self) -> Option<String> {
        let column = self.zoning_col.as_deref()?;
        let value = self.feature.properties.as_ref()?.get(column)?;
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Feature that exhausted its retries and was skipped without a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFeature {
    pub index: i64,
    pub reason: String,
    pub skipped_at: DateTime<Utc>,
}

/// Per-feature outcome surfaced by the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureState {
    Ok,
    Skipped,
    Pending,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_with_properties(props: serde_json::Value) -> PlanFeature {
        PlanFeature {
            index: 0,
            source_crs: 3067,
            zoning_col: Some("zone".to_string()),
            calculation_year: None,
            feature: geojson::Feature {
                bbox: None,
                geometry: None,
                id: Some(geojson::feature::Id::Number(7.into())),
                properties: props.as_object().cloned(),
                foreign_members: None,
            },
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            CalculationStatus::NotStarted,
            CalculationStatus::Processing,
            CalculationStatus::Finished,
            CalculationStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<CalculationStatus>(), Ok(status));
        }
        assert!("done".parse::<CalculationStatus>().is_err());
    }

    #[test]
    fn test_zoning_code_reads_strings_and_numbers() {
        let f = feature_with_properties(serde_json::json!({"zone": "M1"}));
        assert_eq!(f.zoning_code().as_deref(), Some("M1"));

        let f = feature_with_properties(serde_json::json!({"zone": 12}));
        assert_eq!(f.zoning_code().as_deref(), Some("12"));

        let f = feature_with_properties(serde_json::json!({"other": 12}));
        assert_eq!(f.zoning_code(), None);
        assert_eq!(f.feature_id().as_deref(), Some("7"));
    }
}
