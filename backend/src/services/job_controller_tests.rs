#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;

    use crate::calculator::CalculationError;
    use crate::db::repositories::LocalRepository;
    use crate::db::repository::PlanRepository;
    use crate::models::{
        CalculationStatus, CarbonColumns, FeatureRow, NewPlan, Plan, PlanFeature, NO_INDEX,
    };
    use crate::services::job_controller::{
        FeatureCalculator, JobController, JobError, JobSettings, StepOutcome, MAX_RETRIES,
    };
    use crate::services::job_queue::{JobQueue, QueueError, TaskPayload};

    #[derive(Default)]
    struct RecordingQueue {
        enqueued: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(
            &self,
            _task_name: &str,
            payload: TaskPayload,
            _timeout: Duration,
        ) -> Result<Uuid, QueueError> {
            self.enqueued.lock().push(payload.ui_id);
            Ok(Uuid::new_v4())
        }
    }

    /// Succeeds for every feature except the failing indices.
    struct ScriptedCalculator {
        failing: HashSet<i64>,
        calls: Mutex<Vec<i64>>,
    }

    impl ScriptedCalculator {
        fn failing(indices: &[i64]) -> Arc<Self> {
            Arc::new(Self {
                failing: indices.iter().copied().collect(),
                calls: Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl FeatureCalculator for ScriptedCalculator {
        async fn calculate(&self, feature: &PlanFeature) -> Result<FeatureRow, CalculationError> {
            self.calls.lock().push(feature.index);
            if self.failing.contains(&feature.index) {
                return Err(CalculationError::NoData);
            }
            Ok(row(feature.index))
        }
    }

    struct PanickingCalculator;

    #[async_trait]
    impl FeatureCalculator for PanickingCalculator {
        async fn calculate(&self, _feature: &PlanFeature) -> Result<FeatureRow, CalculationError> {
            panic!("degenerate ring");
        }
    }

    fn row(index: i64) -> FeatureRow {
        let total = (index + 1) as f64;
        let totals = CarbonColumns {
            bio_carbon: total,
            ground_carbon: 0.0,
            total_carbon: total,
            nochange: [(2025, total)].into_iter().collect(),
            planned: [(2025, total)].into_iter().collect(),
        };
        FeatureRow {
            index,
            feature_id: None,
            zoning_code: None,
            area_m2: 10_000.0,
            area_multiplier: 0.0,
            growth_found: false,
            geometry: None,
            per_hectare: totals.per_hectare(10_000.0),
            totals,
        }
    }

    fn new_plan(features: usize) -> NewPlan {
        NewPlan {
            ui_id: Uuid::new_v4(),
            user_id: Some("user-1".to_string()),
            source_crs: 3067,
            zoning_col: None,
            features: (0..features)
                .map(|i| geojson::Feature {
                    bbox: None,
                    geometry: Some(geojson::Geometry::new(geojson::Value::Point(vec![
                        i as f64, 0.0,
                    ]))),
                    id: None,
                    properties: None,
                    foreign_members: None,
                })
                .collect(),
        }
    }

    struct Fixture {
        repo: Arc<LocalRepository>,
        queue: Arc<RecordingQueue>,
        calculator: Arc<ScriptedCalculator>,
        controller: JobController,
    }

    fn fixture(failing: &[i64]) -> Fixture {
        let repo = Arc::new(LocalRepository::new());
        let queue = Arc::new(RecordingQueue::default());
        let calculator = ScriptedCalculator::failing(failing);
        let controller = JobController::new(
            repo.clone(),
            calculator.clone(),
            queue.clone(),
            JobSettings {
                store_retry_delay: Duration::ZERO,
                ..JobSettings::default()
            },
        );
        Fixture {
            repo,
            queue,
            calculator,
            controller,
        }
    }

    async fn processing_plan(repo: &LocalRepository, features: usize) -> Plan {
        let mut plan = repo.create_plan(new_plan(features)).await.unwrap();
        plan.calculation_status = CalculationStatus::Processing;
        repo.update_plan(&plan).await.unwrap()
    }

    async fn stored(repo: &LocalRepository, plan: &Plan) -> Plan {
        repo.get_plan(plan.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_failure_is_persisted_for_retry() {
        let f = fixture(&[0]);
        let plan = processing_plan(&f.repo, 2).await;

        let outcome = f.controller.calculate_piece(plan.ui_id).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Failed {
                index: 0,
                retries: 1,
                error: "no data for geometry".to_string()
            }
        );

        let plan = stored(&f.repo, &plan).await;
        assert_eq!(plan.last_area_calculation_retries, 1);
        assert_eq!(plan.last_index, NO_INDEX);
        assert_eq!(
            plan.last_area_calculation_status,
            Some(CalculationStatus::Error)
        );
        assert_eq!(plan.calculation_status, CalculationStatus::Processing);
        assert!(outcome.needs_followup());
    }

    #[tokio::test]
    async fn test_retries_are_bounded_then_feature_is_skipped() {
        let f = fixture(&[0]);
        let plan = processing_plan(&f.repo, 2).await;

        for attempt in 1..=MAX_RETRIES + 1 {
            let outcome = f.controller.calculate_piece(plan.ui_id).await.unwrap();
            assert!(matches!(outcome, StepOutcome::Failed { retries, .. } if retries == attempt));
            let current = stored(&f.repo, &plan).await;
            assert!(current.last_area_calculation_retries <= MAX_RETRIES + 1);
            assert_eq!(current.last_index, NO_INDEX);
        }

        let outcome = f.controller.calculate_piece(plan.ui_id).await.unwrap();
        assert_eq!(outcome, StepOutcome::Skipped { index: 0 });
        let current = stored(&f.repo, &plan).await;
        assert_eq!(current.last_index, 0);
        assert_eq!(current.last_area_calculation_retries, 0);

        let skipped = f.repo.list_skipped_features(plan.id).await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].index, 0);
        assert_eq!(skipped[0].reason, "no data for geometry");
        assert!(f.repo.list_feature_rows(plan.id).await.unwrap().is_empty());

        assert_eq!(
            f.controller.calculate_piece(plan.ui_id).await.unwrap(),
            StepOutcome::Calculated { index: 1 }
        );
        assert_eq!(
            f.controller.calculate_piece(plan.ui_id).await.unwrap(),
            StepOutcome::Finished
        );

        let finished = stored(&f.repo, &plan).await;
        let totals = finished.report_totals.unwrap();
        assert_eq!(totals.feature_count, 1);
        assert_eq!(totals.skipped_count, 1);
        assert!(totals.partial);
        assert_eq!(f.calculator.calls.lock().as_slice(), &[0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_totals_sum_rows() {
        let f = fixture(&[]);
        let plan = processing_plan(&f.repo, 4).await;

        let mut last_index = NO_INDEX;
        loop {
            let outcome = f.controller.calculate_piece(plan.ui_id).await.unwrap();
            let current = stored(&f.repo, &plan).await;
            assert!(current.last_index >= last_index);
            assert!(current.last_index < current.total_indices);
            last_index = current.last_index;
            if outcome == StepOutcome::Finished {
                break;
            }
        }

        let finished = stored(&f.repo, &plan).await;
        assert_eq!(finished.calculation_status, CalculationStatus::Finished);
        assert_eq!(finished.last_index, 3);
        assert!(finished.calculated_ts.is_some());

        let rows = f.repo.list_feature_rows(plan.id).await.unwrap();
        let row_sum: f64 = rows.iter().map(|r| r.totals.total_carbon).sum();
        let totals = finished.report_totals.unwrap();
        assert_eq!(totals.feature_count, 4);
        assert!((totals.totals.total_carbon - row_sum).abs() < 1e-9);
        assert!((totals.totals.nochange[&2025] - row_sum).abs() < 1e-9);
        assert!(!totals.partial);
    }

    #[tokio::test]
    async fn test_process_reschedules_until_finished() {
        let f = fixture(&[]);
        let plan = processing_plan(&f.repo, 1).await;

        let outcome = f.controller.process(plan.ui_id).await.unwrap();
        assert_eq!(outcome, StepOutcome::Calculated { index: 0 });
        assert_eq!(f.queue.enqueued.lock().as_slice(), &[plan.ui_id]);

        let outcome = f.controller.process(plan.ui_id).await.unwrap();
        assert_eq!(outcome, StepOutcome::Finished);
        assert_eq!(f.queue.enqueued.lock().len(), 1);

        let outcome = f.controller.process(plan.ui_id).await.unwrap();
        assert_eq!(outcome, StepOutcome::Halted);
        assert_eq!(f.queue.enqueued.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_rescheduled() {
        let f = fixture(&[0]);
        let plan = processing_plan(&f.repo, 1).await;

        let outcome = f.controller.process(plan.ui_id).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
        assert_eq!(f.queue.enqueued.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_calculation_is_a_failed_attempt() {
        let repo = Arc::new(LocalRepository::new());
        let queue = Arc::new(RecordingQueue::default());
        let controller = JobController::new(
            repo.clone(),
            Arc::new(PanickingCalculator),
            queue.clone(),
            JobSettings::default(),
        );
        let plan = processing_plan(&repo, 1).await;

        let outcome = controller.process(plan.ui_id).await.unwrap();
        match outcome {
            StepOutcome::Failed { index, retries, error } => {
                assert_eq!((index, retries), (0, 1));
                assert!(error.contains("degenerate ring"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(queue.enqueued.lock().as_slice(), &[plan.ui_id]);

        let current = stored(&repo, &plan).await;
        assert_eq!(current.last_index, NO_INDEX);
        assert_eq!(current.last_area_calculation_retries, 1);
        assert_eq!(
            current.last_area_calculation_status,
            Some(CalculationStatus::Error)
        );
        assert_eq!(current.calculation_status, CalculationStatus::Processing);
    }

    #[tokio::test]
    async fn test_missing_plan_is_fatal_and_not_rescheduled() {
        let f = fixture(&[]);
        let err = f.controller.process(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, JobError::PlanNotFound(_)));
        assert!(!err.is_transient());
        assert!(f.queue.enqueued.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_is_transient() {
        let f = fixture(&[]);
        let plan = processing_plan(&f.repo, 1).await;
        f.repo.set_healthy(false);

        let err = f.controller.process(plan.ui_id).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(f.queue.enqueued.lock().as_slice(), &[plan.ui_id]);

        f.repo.set_healthy(true);
        let current = stored(&f.repo, &plan).await;
        assert_eq!(current.calculation_status, CalculationStatus::Processing);
    }

    #[tokio::test]
    async fn test_resume_enqueues_processing_plans_only() {
        let f = fixture(&[]);
        let running = processing_plan(&f.repo, 2).await;
        let mut done = processing_plan(&f.repo, 1).await;
        done.calculation_status = CalculationStatus::Finished;
        f.repo.update_plan(&done).await.unwrap();
        f.repo.create_plan(new_plan(1)).await.unwrap();

        let resumed = f.controller.resume_processing_plans().await.unwrap();
        assert_eq!(resumed, 1);
        assert_eq!(f.queue.enqueued.lock().as_slice(), &[running.ui_id]);
    }
}
