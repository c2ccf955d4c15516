#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::calculator::growth::GrowthProjector;
    use crate::models::raster::{GeoTransform, OverlapMask, RasterGrid};
    use crate::models::stand::{GrowthCurveRow, StandCategory};
    use crate::reference::{GrowthCurveTable, TieBreak};
    use approx::assert_abs_diff_eq;

    fn category(species: i64) -> StandCategory {
        StandCategory::from_columns([1, 2, 1, 1, 3, species, 2, 0])
    }

    fn table(rows: &[(i64, f64)]) -> GrowthCurveTable {
        let rows = rows
            .iter()
            .map(|&(species, mabp)| GrowthCurveRow {
                category: category(species),
                mabp,
            })
            .collect();
        GrowthCurveTable::from_rows(rows, TieBreak::FirstInTableOrder)
    }

    fn stands(ids: Vec<f64>) -> RasterGrid {
        let mut grid =
            RasterGrid::new(2, 1, GeoTransform::north_up(0.0, 16.0, 16.0), None, ids).unwrap();
        grid.nodata = Some(0.0);
        grid
    }

    fn mask(fractions: Vec<f64>) -> OverlapMask {
        OverlapMask {
            width: 2,
            height: 1,
            fractions,
        }
    }

    fn variables() -> HashMap<i64, StandCategory> {
        [(11, category(1)), (12, category(2))].into_iter().collect()
    }

    #[test]
    fn test_year_offset_counts_from_base_year() {
        let t = table(&[]);
        let projector = GrowthProjector::new(&t, 2025, 2021);
        assert_eq!(projector.year_offset(2025), 4);
        assert_eq!(projector.year_offset(2030), 9);
    }

    #[test]
    fn test_weighted_growth_accumulates_per_year() {
        let t = table(&[(1, 2.0), (2, 4.0)]);
        let projector = GrowthProjector::new(&t, 2025, 2021);
        let batch = projector.project(
            &[Some(stands(vec![11.0, 12.0]))],
            &[2025, 2030],
            &variables(),
            &[Some(mask(vec![1.0, 0.5]))],
        );

        let deltas = batch.year_deltas[0].as_ref().unwrap();
        // (1.0 * 2.0 + 0.5 * 4.0) * offset
        assert_abs_diff_eq!(deltas[&2025], 4.0 * 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(deltas[&2030], 4.0 * 9.0, epsilon = 1e-12);
        assert!(batch.found[0]);
    }

    #[test]
    fn test_unmatched_stands_give_absent_projection() {
        let t = table(&[(5, 2.0)]);
        let projector = GrowthProjector::new(&t, 2025, 2021);
        let batch = projector.project(
            &[Some(stands(vec![11.0, 99.0]))],
            &[2025, 2030],
            &variables(),
            &[Some(mask(vec![1.0, 1.0]))],
        );
        assert_eq!(batch.year_deltas, vec![None]);
        assert_eq!(batch.found, vec![false]);
    }

    #[test]
    fn test_zero_sum_is_absent_but_found() {
        let t = table(&[(1, 0.0)]);
        let projector = GrowthProjector::new(&t, 2025, 2021);
        let batch = projector.project(
            &[Some(stands(vec![11.0, 11.0]))],
            &[2025],
            &variables(),
            &[Some(mask(vec![1.0, 1.0]))],
        );
        assert_eq!(batch.year_deltas, vec![None]);
        assert_eq!(batch.found, vec![true]);
    }

    #[test]
    fn test_cells_outside_geometry_and_no_data_are_ignored() {
        let t = table(&[(1, 2.0), (2, 4.0)]);
        let projector = GrowthProjector::new(&t, 2021, 2021);
        let batch = projector.project(
            &[Some(stands(vec![0.0, 12.0]))],
            &[2026],
            &variables(),
            &[Some(mask(vec![1.0, 0.0]))],
        );
        assert_eq!(batch.year_deltas, vec![None]);
        assert_eq!(batch.found, vec![false]);
    }

    #[test]
    fn test_duplicate_curve_always_resolves_to_first_row() {
        let t = table(&[(1, 2.0), (1, 7.0)]);
        let projector = GrowthProjector::new(&t, 2021, 2021);
        for _ in 0..5 {
            let batch = projector.project(
                &[Some(stands(vec![11.0, 11.0]))],
                &[2022],
                &variables(),
                &[Some(mask(vec![1.0, 0.0]))],
            );
            assert_abs_diff_eq!(batch.year_deltas[0].as_ref().unwrap()[&2022], 2.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_results_are_aligned_with_inputs() {
        let t = table(&[(1, 1.0)]);
        let projector = GrowthProjector::new(&t, 2021, 2021);
        let batch = projector.project(
            &[None, Some(stands(vec![11.0, 11.0]))],
            &[2022],
            &variables(),
            &[None, Some(mask(vec![0.25, 0.25]))],
        );
        assert_eq!(batch.year_deltas.len(), 2);
        assert!(batch.year_deltas[0].is_none());
        assert_abs_diff_eq!(batch.year_deltas[1].as_ref().unwrap()[&2022], 0.5, epsilon = 1e-12);
    }
}
