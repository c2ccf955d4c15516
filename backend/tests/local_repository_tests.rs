mod support;

use chrono::Datelike;
use forest_carbon::db::repositories::LocalRepository;
use forest_carbon::db::repository::{GisRepository, PlanRepository, RepositoryError};
use forest_carbon::models::{
    CalculationStatus, CarbonColumns, FeatureRow, SkippedFeature, NO_INDEX,
};
use geo::{polygon, MultiPolygon};
use support::{feature, new_plan, square, synthetic_repository, STAND_ID};
use uuid::Uuid;

fn row(index: i64, total_carbon: f64) -> FeatureRow {
    FeatureRow {
        index,
        feature_id: None,
        zoning_code: None,
        area_m2: 1.0,
        area_multiplier: 0.0,
        growth_found: false,
        geometry: None,
        totals: CarbonColumns {
            total_carbon,
            ..CarbonColumns::default()
        },
        per_hectare: CarbonColumns::default(),
    }
}

fn region(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
    MultiPolygon(vec![polygon![
        (x: x0, y: y0),
        (x: x1, y: y0),
        (x: x1, y: y1),
        (x: x0, y: y1),
        (x: x0, y: y0),
    ]])
}

fn features(count: usize) -> Vec<geojson::Feature> {
    (0..count)
        .map(|i| feature(Some(square(i as f64 * 16.0, 0.0, 16.0))))
        .collect()
}

#[tokio::test]
async fn test_create_plan_starts_before_first_feature() {
    let repo = LocalRepository::new();
    let ui_id = Uuid::new_v4();
    let plan = repo.create_plan(new_plan(ui_id, features(3))).await.unwrap();

    assert_eq!(plan.calculation_status, CalculationStatus::NotStarted);
    assert_eq!(plan.last_index, NO_INDEX);
    assert_eq!(plan.total_indices, 3);
    assert_eq!(plan.last_area_calculation_retries, 0);
    assert_eq!(plan.calculation_year, plan.created_ts.year());

    let by_ui_id = repo.get_plan_by_ui_id(ui_id).await.unwrap().unwrap();
    assert_eq!(by_ui_id.id, plan.id);
    assert!(repo.get_plan_by_ui_id(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_ui_id_is_conflict() {
    let repo = LocalRepository::new();
    let ui_id = Uuid::new_v4();
    repo.create_plan(new_plan(ui_id, features(1))).await.unwrap();

    let err = repo
        .create_plan(new_plan(ui_id, features(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::Conflict { .. }));
}

#[tokio::test]
async fn test_get_feature_carries_plan_settings() {
    let repo = LocalRepository::new();
    let plan = repo
        .create_plan(new_plan(Uuid::new_v4(), features(2)))
        .await
        .unwrap();

    let feature = repo.get_feature_at_index(plan.id, 1).await.unwrap().unwrap();
    assert_eq!(feature.index, 1);
    assert_eq!(feature.calculation_year, Some(plan.calculation_year));
    assert_eq!(feature.source_crs, 3067);
    assert_eq!(feature.zoning_col.as_deref(), Some("zone"));
    assert!(repo.get_feature_at_index(plan.id, 2).await.unwrap().is_none());
    assert!(repo.get_feature_at_index(plan.id, -1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_append_is_keyed_by_index() {
    let repo = LocalRepository::new();
    let plan = repo
        .create_plan(new_plan(Uuid::new_v4(), features(3)))
        .await
        .unwrap();

    let added = repo
        .append_feature_rows(plan.id, vec![row(2, 1.0), row(0, 1.0)])
        .await
        .unwrap();
    assert_eq!(added, 2);
    let added = repo
        .append_feature_rows(plan.id, vec![row(0, 99.0)])
        .await
        .unwrap();
    assert_eq!(added, 0);

    let rows = repo.list_feature_rows(plan.id).await.unwrap();
    assert_eq!(rows.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 2]);
    assert_eq!(rows[0].totals.total_carbon, 1.0);
}

#[tokio::test]
async fn test_update_rejects_out_of_range_progress() {
    let repo = LocalRepository::new();
    let mut plan = repo
        .create_plan(new_plan(Uuid::new_v4(), features(2)))
        .await
        .unwrap();

    plan.last_index = 2;
    let err = repo.update_plan(&plan).await.unwrap_err();
    assert!(matches!(err, RepositoryError::ValidationError { .. }));

    plan.last_index = 1;
    plan.calculation_status = CalculationStatus::Processing;
    let stored = repo.update_plan(&plan).await.unwrap();
    assert_eq!(stored.last_index, 1);
    assert_eq!(stored.calculation_status, CalculationStatus::Processing);
}

#[tokio::test]
async fn test_skip_records_are_idempotent() {
    let repo = LocalRepository::new();
    let plan = repo
        .create_plan(new_plan(Uuid::new_v4(), features(2)))
        .await
        .unwrap();
    let skipped = SkippedFeature {
        index: 1,
        reason: "no data for geometry".to_string(),
        skipped_at: chrono::Utc::now(),
    };

    assert!(repo
        .record_skipped_feature(plan.id, skipped.clone())
        .await
        .unwrap());
    assert!(!repo.record_skipped_feature(plan.id, skipped).await.unwrap());
    assert_eq!(repo.list_skipped_features(plan.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reset_clears_derived_data() {
    let repo = LocalRepository::new();
    let mut plan = repo
        .create_plan(new_plan(Uuid::new_v4(), features(2)))
        .await
        .unwrap();
    repo.append_feature_rows(plan.id, vec![row(0, 1.0)])
        .await
        .unwrap();
    plan.last_index = 0;
    repo.update_plan(&plan).await.unwrap();

    let reset = repo
        .reset_plan(plan.id, new_plan(plan.ui_id, features(4)))
        .await
        .unwrap();
    assert_eq!(reset.id, plan.id);
    assert_eq!(reset.created_ts, plan.created_ts);
    assert_eq!(reset.total_indices, 4);
    assert_eq!(reset.last_index, NO_INDEX);
    assert!(repo.list_feature_rows(plan.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unhealthy_store_refuses_operations() {
    let repo = LocalRepository::new();
    repo.set_healthy(false);

    assert!(!repo.health_check().await.unwrap());
    let err = repo
        .create_plan(new_plan(Uuid::new_v4(), features(1)))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_list_plans_with_status_filters() {
    let repo = LocalRepository::new();
    let mut first = repo
        .create_plan(new_plan(Uuid::new_v4(), features(1)))
        .await
        .unwrap();
    repo.create_plan(new_plan(Uuid::new_v4(), features(1)))
        .await
        .unwrap();
    first.calculation_status = CalculationStatus::Processing;
    repo.update_plan(&first).await.unwrap();

    let processing = repo
        .list_plans_with_status(CalculationStatus::Processing)
        .await
        .unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id, first.id);
}

#[tokio::test]
async fn test_rasters_are_clipped_to_region_bounds() {
    let repo = synthetic_repository();

    let grid = repo
        .fetch_growth_carbon_raster(&region(0.0, 0.0, 32.0, 32.0), 3067)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((grid.width, grid.height), (2, 2));
    assert!(grid.values.iter().all(|v| *v == 10.0));

    let outside = repo
        .fetch_ground_carbon_raster(&region(500.0, 500.0, 600.0, 600.0), 3067)
        .await
        .unwrap();
    assert!(outside.is_none());
}

#[tokio::test]
async fn test_gis_rejects_foreign_crs_and_counts_failures() {
    let repo = synthetic_repository();
    let area = region(0.0, 0.0, 32.0, 32.0);

    let err = repo
        .fetch_growth_carbon_raster(&area, 4326)
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::ValidationError { .. }));

    repo.fail_next_gis_fetches(1);
    assert!(repo.fetch_rasters_for_regions(&[area.clone()], 3067).await.is_err());
    let stands = repo
        .fetch_rasters_for_regions(&[area.clone(), area], 3067)
        .await
        .unwrap();
    assert_eq!(stands.len(), 2);
}

#[tokio::test]
async fn test_categorical_variables_omit_unknown_ids() {
    let repo = synthetic_repository();
    let variables = repo
        .fetch_categorical_variables(&[STAND_ID, 404])
        .await
        .unwrap();
    assert_eq!(variables.len(), 1);
    assert_eq!(variables[0].stand_id, STAND_ID);
}
