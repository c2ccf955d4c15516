#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forest_carbon::db::repositories::LocalRepository;
use forest_carbon::db::repository::PlanRepository;
use forest_carbon::models::{
    CalculationStatus, GeoTransform, GrowthCurveRow, NewPlan, Plan, RasterGrid, StandCategory,
    StandVariables,
};
use forest_carbon::reference::{AreaMultiplierTable, GrowthCurveTable, ReferenceData, TieBreak};
use uuid::Uuid;

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Runs `f` with environment variables temporarily modified.
///
/// This is panic-safe (restores variables on unwind) and also serializes access to
/// process-global env vars to avoid flaky tests when Rust runs tests in parallel.
///
/// `changes` is a list of `(key, value)` pairs:
/// - `Some(v)` sets the variable to `v`
/// - `None` removes the variable
pub fn with_scoped_env<F, R>(changes: &[(&str, Option<&str>)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _guard = ScopedEnv::new(changes);
    f()
}

struct ScopedEnv {
    snapshot: Vec<(String, Option<String>)>,
}

impl ScopedEnv {
    fn new(changes: &[(&str, Option<&str>)]) -> Self {
        let keys: HashSet<&str> = changes.iter().map(|(k, _)| *k).collect();
        let snapshot = keys
            .into_iter()
            .map(|k| (k.to_string(), std::env::var(k).ok()))
            .collect::<Vec<_>>();

        for (k, v) in changes {
            match v {
                Some(val) => std::env::set_var(k, val),
                None => std::env::remove_var(k),
            }
        }

        Self { snapshot }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        for (k, v) in self.snapshot.drain(..) {
            match v {
                Some(val) => std::env::set_var(&k, val),
                None => std::env::remove_var(&k),
            }
        }
    }
}

// ==================== Synthetic layers ====================

pub const STAND_ID: i64 = 11;
pub const ZONE: &str = "M1";
pub const ZONE_MULTIPLIER: f64 = 0.25;
pub const MABP: f64 = 2.0;

pub fn stand_category() -> StandCategory {
    StandCategory::from_columns([1, 2, 1, 1, 3, 1, 2, 0])
}

pub fn reference_data() -> Arc<ReferenceData> {
    Arc::new(ReferenceData::new(
        GrowthCurveTable::from_rows(
            vec![GrowthCurveRow {
                category: stand_category(),
                mabp: MABP,
            }],
            TieBreak::FirstInTableOrder,
        ),
        AreaMultiplierTable::from_pairs([(ZONE, ZONE_MULTIPLIER)]),
    ))
}

/// 6x6 grid of 16 m cells covering x 0..96, y 0..96 in EPSG:3067.
pub fn grid(value: f64) -> RasterGrid {
    RasterGrid::filled(6, 6, GeoTransform::north_up(0.0, 96.0, 16.0), value)
}

/// Local repository with uniform carbon layers and one stand everywhere.
pub fn synthetic_repository() -> Arc<LocalRepository> {
    let repo = carbon_layers_only();
    repo.set_stand_variables([StandVariables {
        stand_id: STAND_ID,
        category: stand_category(),
    }]);
    Arc::new(repo)
}

/// Carbon and stand layers, but no inventory record for the stand.
pub fn carbon_layers_only() -> LocalRepository {
    let repo = LocalRepository::new();
    repo.set_growth_carbon_layer(grid(10.0));
    repo.set_ground_carbon_layer(grid(5.0));
    repo.set_stand_layer(grid(STAND_ID as f64));
    repo
}

pub fn square(x0: f64, y0: f64, size: f64) -> geojson::Geometry {
    geojson::Geometry::new(geojson::Value::Polygon(vec![vec![
        vec![x0, y0],
        vec![x0 + size, y0],
        vec![x0 + size, y0 + size],
        vec![x0, y0 + size],
        vec![x0, y0],
    ]]))
}

pub fn feature(geometry: Option<geojson::Geometry>) -> geojson::Feature {
    geojson::Feature {
        bbox: None,
        geometry,
        id: None,
        properties: serde_json::json!({ "zone": ZONE }).as_object().cloned(),
        foreign_members: None,
    }
}

pub fn new_plan(ui_id: Uuid, features: Vec<geojson::Feature>) -> NewPlan {
    NewPlan {
        ui_id,
        user_id: Some("owner".to_string()),
        source_crs: 3067,
        zoning_col: Some("zone".to_string()),
        features,
    }
}

/// Poll the store until the plan reaches a terminal status.
pub async fn wait_for_terminal(repo: &LocalRepository, ui_id: Uuid) -> Plan {
    let poll = async {
        loop {
            if let Some(plan) = repo.get_plan_by_ui_id(ui_id).await.unwrap() {
                if matches!(
                    plan.calculation_status,
                    CalculationStatus::Finished | CalculationStatus::Error
                ) {
                    return plan;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("plan did not reach a terminal status in time")
}
