//! In-memory local repository implementation.
//!
//! Stores plans, their features, rows and skip records in memory, and serves
//! raster fetches from whole-extent layers set up by the caller. Suitable for
//! unit testing and local development.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use geo::{BoundingRect, MultiPolygon};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::repository::*;
use crate::geometry::projection::EPSG_TM35FIN;
use crate::models::*;

/// In-memory local repository.
///
/// # Example
/// ```
/// use forest_carbon::db::repositories::LocalRepository;
/// use forest_carbon::models::{GeoTransform, RasterGrid};
///
/// let repo = LocalRepository::new();
/// repo.set_ground_carbon_layer(RasterGrid::filled(
///     4,
///     4,
///     GeoTransform::north_up(0.0, 64.0, 16.0),
///     100.0,
/// ));
/// assert_eq!(repo.plan_count(), 0);
/// ```
#[derive(Clone)]
pub struct LocalRepository {
    data: Arc<RwLock<LocalData>>,
}

struct StoredPlan {
    plan: Plan,
    features: Vec<geojson::Feature>,
    rows: BTreeMap<i64, FeatureRow>,
    skipped: BTreeMap<i64, SkippedFeature>,
}

#[derive(Default)]
struct GisLayers {
    growth_carbon: Option<RasterGrid>,
    ground_carbon: Option<RasterGrid>,
    stands: Option<RasterGrid>,
    variables: HashMap<i64, StandCategory>,
}

struct LocalData {
    plans: HashMap<PlanId, StoredPlan>,
    ui_ids: HashMap<Uuid, PlanId>,
    next_plan_id: i64,
    layers: GisLayers,
    /// EPSG code of every layer.
    layer_crs: u32,
    is_healthy: bool,
    gis_available: bool,
    /// Number of upcoming GIS calls that fail with a connection error.
    gis_failures_remaining: usize,
}

impl Default for LocalData {
    fn default() -> Self {
        Self {
            plans: HashMap::new(),
            ui_ids: HashMap::new(),
            next_plan_id: 1,
            layers: GisLayers::default(),
            layer_crs: EPSG_TM35FIN,
            is_healthy: true,
            gis_available: true,
            gis_failures_remaining: 0,
        }
    }
}

impl LocalRepository {
    /// Create a new empty local repository.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(LocalData::default())),
        }
    }

    pub fn set_growth_carbon_layer(&self, layer: RasterGrid) {
        self.data.write().layers.growth_carbon = Some(layer);
    }

    pub fn set_ground_carbon_layer(&self, layer: RasterGrid) {
        self.data.write().layers.ground_carbon = Some(layer);
    }

    pub fn set_stand_layer(&self, layer: RasterGrid) {
        self.data.write().layers.stands = Some(layer);
    }

    pub fn set_stand_variables(&self, variables: impl IntoIterator<Item = StandVariables>) {
        let mut data = self.data.write();
        for v in variables {
            data.layers.variables.insert(v.stand_id, v.category);
        }
    }

    pub fn set_layer_crs(&self, epsg: u32) {
        self.data.write().layer_crs = epsg;
    }

    /// Set the health status for testing connection failures.
    pub fn set_healthy(&self, healthy: bool) {
        self.data.write().is_healthy = healthy;
    }

    /// Make every GIS call fail (or succeed again) with a connection error.
    pub fn set_gis_available(&self, available: bool) {
        self.data.write().gis_available = available;
    }

    /// Make the next `count` GIS calls fail with a connection error.
    pub fn fail_next_gis_fetches(&self, count: usize) {
        self.data.write().gis_failures_remaining = count;
    }

    /// Clear all plans, keeping layers and health flags.
    pub fn clear(&self) {
        let mut data = self.data.write();
        data.plans.clear();
        data.ui_ids.clear();
        data.next_plan_id = 1;
    }

    pub fn plan_count(&self) -> usize {
        self.data.read().plans.len()
    }

    fn check_health(&self, operation: &str) -> RepositoryResult<()> {
        if !self.data.read().is_healthy {
            return Err(RepositoryError::connection_with_context(
                "Plan store is not healthy",
                ErrorContext::new(operation),
            ));
        }
        Ok(())
    }

    fn check_gis(&self, operation: &str, crs: Option<u32>) -> RepositoryResult<()> {
        let mut data = self.data.write();
        if !data.gis_available {
            return Err(RepositoryError::connection_with_context(
                "GIS source is not available",
                ErrorContext::new(operation).with_entity("raster"),
            ));
        }
        if data.gis_failures_remaining > 0 {
            data.gis_failures_remaining -= 1;
            return Err(RepositoryError::connection_with_context(
                "GIS fetch failed",
                ErrorContext::new(operation).with_entity("raster"),
            ));
        }
        if let Some(crs) = crs {
            if crs != data.layer_crs {
                return Err(RepositoryError::validation_with_context(
                    format!("Layers are in EPSG:{}, got EPSG:{}", data.layer_crs, crs),
                    ErrorContext::new(operation).with_entity("raster"),
                ));
            }
        }
        Ok(())
    }

    fn with_plan<T>(
        &self,
        plan_id: PlanId,
        operation: &str,
        f: impl FnOnce(&mut StoredPlan) -> RepositoryResult<T>,
    ) -> RepositoryResult<T> {
        let mut data = self.data.write();
        let stored = data.plans.get_mut(&plan_id).ok_or_else(|| {
            RepositoryError::not_found_with_context(
                format!("Plan {} not found", plan_id),
                ErrorContext::new(operation)
                    .with_entity("plan")
                    .with_entity_id(plan_id),
            )
        })?;
        f(stored)
    }

    fn clip(layer: Option<&RasterGrid>, region: &MultiPolygon<f64>) -> Option<RasterGrid> {
        let bounds = region.bounding_rect()?;
        layer?.clip_to(&bounds)
    }
}

impl Default for LocalRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_new_plan(plan: &NewPlan, operation: &str) -> RepositoryResult<()> {
    if plan.features.is_empty() {
        return Err(RepositoryError::validation_with_context(
            "Feature collection is empty",
            ErrorContext::new(operation)
                .with_entity("plan")
                .with_entity_id(plan.ui_id),
        ));
    }
    Ok(())
}

fn fresh_plan(id: PlanId, new_plan: &NewPlan) -> Plan {
    let now = Utc::now();
    Plan {
        id,
        ui_id: new_plan.ui_id,
        user_id: new_plan.user_id.clone(),
        source_crs: new_plan.source_crs,
        zoning_col: new_plan.zoning_col.clone(),
        calculation_year: now.year(),
        total_indices: new_plan.features.len() as i64,
        last_index: NO_INDEX,
        last_area_calculation_status: None,
        last_area_calculation_retries: 0,
        last_area_calculation_error: None,
        calculation_status: CalculationStatus::NotStarted,
        report_totals: None,
        message: None,
        created_ts: now,
        updated_ts: now,
        calculation_updated_ts: None,
        calculated_ts: None,
    }
}

#[async_trait]
impl PlanRepository for LocalRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        Ok(self.data.read().is_healthy)
    }

    async fn create_plan(&self, new_plan: NewPlan) -> RepositoryResult<Plan> {
        self.check_health("create_plan")?;
        validate_new_plan(&new_plan, "create_plan")?;

        let mut data = self.data.write();
        if data.ui_ids.contains_key(&new_plan.ui_id) {
            return Err(RepositoryError::conflict_with_context(
                format!("Plan {} already exists", new_plan.ui_id),
                ErrorContext::new("create_plan")
                    .with_entity("plan")
                    .with_entity_id(new_plan.ui_id),
            ));
        }

        let id = PlanId::new(data.next_plan_id);
        data.next_plan_id += 1;
        let plan = fresh_plan(id, &new_plan);
        data.ui_ids.insert(new_plan.ui_id, id);
        data.plans.insert(
            id,
            StoredPlan {
                plan: plan.clone(),
                features: new_plan.features,
                rows: BTreeMap::new(),
                skipped: BTreeMap::new(),
            },
        );
        Ok(plan)
    }

    async fn reset_plan(&self, plan_id: PlanId, new_plan: NewPlan) -> RepositoryResult<Plan> {
        self.check_health("reset_plan")?;
        validate_new_plan(&new_plan, "reset_plan")?;

        self.with_plan(plan_id, "reset_plan", |stored| {
            let created_ts = stored.plan.created_ts;
            stored.plan = Plan {
                created_ts,
                ..fresh_plan(plan_id, &new_plan)
            };
            stored.features = new_plan.features;
            stored.rows.clear();
            stored.skipped.clear();
            Ok(stored.plan.clone())
        })
    }

    async fn get_plan(&self, plan_id: PlanId) -> RepositoryResult<Plan> {
        self.check_health("get_plan")?;
        self.with_plan(plan_id, "get_plan", |stored| Ok(stored.plan.clone()))
    }

    async fn get_plan_by_ui_id(&self, ui_id: Uuid) -> RepositoryResult<Option<Plan>> {
        self.check_health("get_plan_by_ui_id")?;
        let data = self.data.read();
        Ok(data
            .ui_ids
            .get(&ui_id)
            .and_then(|id| data.plans.get(id))
            .map(|stored| stored.plan.clone()))
    }

    async fn update_plan(&self, plan: &Plan) -> RepositoryResult<Plan> {
        self.check_health("update_plan")?;
        self.with_plan(plan.id, "update_plan", |stored| {
            if plan.last_index < NO_INDEX || plan.last_index >= stored.plan.total_indices {
                return Err(RepositoryError::validation_with_context(
                    format!(
                        "last_index {} outside [-1, {})",
                        plan.last_index, stored.plan.total_indices
                    ),
                    ErrorContext::new("update_plan")
                        .with_entity("plan")
                        .with_entity_id(plan.id),
                ));
            }

            let current = &mut stored.plan;
            current.last_index = plan.last_index;
            current.last_area_calculation_status = plan.last_area_calculation_status;
            current.last_area_calculation_retries = plan.last_area_calculation_retries;
            current.last_area_calculation_error = plan.last_area_calculation_error.clone();
            current.calculation_status = plan.calculation_status;
            current.report_totals = plan.report_totals.clone();
            current.message = plan.message.clone();
            current.calculation_updated_ts = plan.calculation_updated_ts;
            current.calculated_ts = plan.calculated_ts;
            current.updated_ts = Utc::now();
            Ok(current.clone())
        })
    }

    async fn append_feature_rows(
        &self,
        plan_id: PlanId,
        rows: Vec<FeatureRow>,
    ) -> RepositoryResult<usize> {
        self.check_health("append_feature_rows")?;
        self.with_plan(plan_id, "append_feature_rows", |stored| {
            let mut added = 0;
            for row in rows {
                if let std::collections::btree_map::Entry::Vacant(slot) = stored.rows.entry(row.index) {
                    slot.insert(row);
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    async fn get_feature_at_index(
        &self,
        plan_id: PlanId,
        index: i64,
    ) -> RepositoryResult<Option<PlanFeature>> {
        self.check_health("get_feature_at_index")?;
        self.with_plan(plan_id, "get_feature_at_index", |stored| {
            let feature = usize::try_from(index)
                .ok()
                .and_then(|i| stored.features.get(i))
                .map(|feature| PlanFeature {
                    index,
                    source_crs: stored.plan.source_crs,
                    zoning_col: stored.plan.zoning_col.clone(),
                    calculation_year: Some(stored.plan.calculation_year),
                    feature: feature.clone(),
                });
            Ok(feature)
        })
    }

    async fn list_feature_rows(&self, plan_id: PlanId) -> RepositoryResult<Vec<FeatureRow>> {
        self.check_health("list_feature_rows")?;
        self.with_plan(plan_id, "list_feature_rows", |stored| {
            Ok(stored.rows.values().cloned().collect())
        })
    }

    async fn record_skipped_feature(
        &self,
        plan_id: PlanId,
        skipped: SkippedFeature,
    ) -> RepositoryResult<bool> {
        self.check_health("record_skipped_feature")?;
        self.with_plan(plan_id, "record_skipped_feature", |stored| {
            if stored.skipped.contains_key(&skipped.index) {
                return Ok(false);
            }
            stored.skipped.insert(skipped.index, skipped);
            Ok(true)
        })
    }

    async fn list_skipped_features(
        &self,
        plan_id: PlanId,
    ) -> RepositoryResult<Vec<SkippedFeature>> {
        self.check_health("list_skipped_features")?;
        self.with_plan(plan_id, "list_skipped_features", |stored| {
            Ok(stored.skipped.values().cloned().collect())
        })
    }

    async fn list_plans_with_status(
        &self,
        status: CalculationStatus,
    ) -> RepositoryResult<Vec<Plan>> {
        self.check_health("list_plans_with_status")?;
        let data = self.data.read();
        let mut plans: Vec<Plan> = data
            .plans
            .values()
            .filter(|stored| stored.plan.calculation_status == status)
            .map(|stored| stored.plan.clone())
            .collect();
        plans.sort_by_key(|p| p.id);
        Ok(plans)
    }
}

#[async_trait]
impl GisRepository for LocalRepository {
    async fn fetch_growth_carbon_raster(
        &self,
        region: &MultiPolygon<f64>,
        crs: u32,
    ) -> RepositoryResult<Option<RasterGrid>> {
        self.check_gis("fetch_growth_carbon_raster", Some(crs))?;
        let data = self.data.read();
        Ok(Self::clip(data.layers.growth_carbon.as_ref(), region))
    }

    async fn fetch_ground_carbon_raster(
        &self,
        region: &MultiPolygon<f64>,
        crs: u32,
    ) -> RepositoryResult<Option<RasterGrid>> {
        self.check_gis("fetch_ground_carbon_raster", Some(crs))?;
        let data = self.data.read();
        Ok(Self::clip(data.layers.ground_carbon.as_ref(), region))
    }

    async fn fetch_categorical_variables(
        &self,
        stand_ids: &[i64],
    ) -> RepositoryResult<Vec<StandVariables>> {
        self.check_gis("fetch_categorical_variables", None)?;
        let data = self.data.read();
        Ok(stand_ids
            .iter()
            .filter_map(|id| {
                data.layers.variables.get(id).map(|category| StandVariables {
                    stand_id: *id,
                    category: *category,
                })
            })
            .collect())
    }

    async fn fetch_rasters_for_regions(
        &self,
        regions: &[MultiPolygon<f64>],
        crs: u32,
    ) -> RepositoryResult<Vec<Option<RasterGrid>>> {
        self.check_gis("fetch_rasters_for_regions", Some(crs))?;
        let data = self.data.read();
        Ok(regions
            .iter()
            .map(|region| Self::clip(data.layers.stands.as_ref(), region))
            .collect())
    }
}
