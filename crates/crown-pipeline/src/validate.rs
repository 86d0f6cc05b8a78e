//! Reconcile the watershed and allocation segmentations.
//!
//! A cell keeps its tree id only when both segmentations agree on it and
//! its height is plausible for a crown of that tree:
//!
//! - **Rule A**: `distance * cell_size * rule_a <= height`; crowns narrow
//!   with distance from the apex.
//! - **Rule B**: `rule_b * apex_height <= height`; a crown does not drop
//!   far below its own apex.

use log::debug;

use crate::allocation::Allocation;
use crate::grid::{Grid, Label, NO_LABEL};
use crate::types::{Marker, PipelineConfig};

/// Rule coefficients applied by [`validate_segments`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationRules {
    pub rule_a_coefficient: f64,
    pub rule_b_coefficient: f64,
}

impl ValidationRules {
    /// The rule coefficients of `config`.
    #[must_use]
    pub const fn from_config(config: &PipelineConfig) -> Self {
        Self {
            rule_a_coefficient: config.rule_a_coefficient,
            rule_b_coefficient: config.rule_b_coefficient,
        }
    }
}

/// Produce the final segmentation.
///
/// `markers` must be in id order (ids `1..=n`), as produced by
/// [`detect_maxima`](crate::maxima::detect_maxima). `height` is the
/// converted canopy height; nodata there rejects the cell.
#[must_use = "returns the final segmentation"]
pub fn validate_segments(
    watershed: &Grid<Label>,
    allocation: &Allocation,
    height: &Grid<f64>,
    markers: &[Marker],
    rules: ValidationRules,
) -> Grid<Label> {
    let cell_size = height.cell_size();
    let apex_height = |label: Label| {
        usize::try_from(label)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|i| markers.get(i))
            .filter(|m| m.id == label)
            .map(|m| m.height)
    };

    let segmentation = Grid::par_from_fn(*height.geometry(), |row, col| {
        let (Some(label), Some(allocated), Some(distance), Some(h)) = (
            watershed.get(row, col),
            allocation.labels.get(row, col),
            allocation.distance.get(row, col),
            height.get(row, col),
        ) else {
            return NO_LABEL;
        };
        if label != allocated {
            return NO_LABEL;
        }
        if distance * cell_size * rules.rule_a_coefficient > h {
            return NO_LABEL;
        }
        match apex_height(label) {
            Some(apex) if rules.rule_b_coefficient * apex <= h => label,
            _ => NO_LABEL,
        }
    });

    debug!(
        "validation: {} of {} watershed cells kept",
        segmentation.valid_count(),
        watershed.valid_count()
    );
    segmentation
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_precision_loss)]
mod tests {
    use super::*;
    use crate::allocation::allocate;
    use crate::grid::GridGeometry;

    const RULES: ValidationRules = ValidationRules {
        rule_a_coefficient: 0.6,
        rule_b_coefficient: 0.3,
    };

    fn marker(id: Label, row: usize, col: usize, height: f64) -> Marker {
        Marker {
            id,
            row,
            col,
            x: col as f64 + 0.5,
            y: row as f64 + 0.5,
            height,
        }
    }

    fn row_grid<T: crate::grid::CellValue>(values: Vec<T>) -> Grid<T> {
        Grid::from_vec(GridGeometry::unit(values.len(), 1), values).unwrap()
    }

    #[test]
    fn disagreement_is_rejected() {
        let markers = [marker(1, 0, 0, 10.0), marker(2, 0, 3, 10.0)];
        let geometry = GridGeometry::unit(4, 1);
        let alloc = allocate(&geometry, &markers, 100.0);
        // Allocation says [1, 1, 2, 2].
        let watershed = row_grid(vec![1, 2, 2, 2]);
        let height = row_grid(vec![10.0; 4]);
        let out = validate_segments(&watershed, &alloc, &height, &markers, RULES);
        assert_eq!(out.as_slice(), &[1, 0, 2, 2]);
    }

    #[test]
    fn rule_a_rejects_far_low_cells() {
        // Distances 0..4 with cell size 1; heights chosen so that cell 3
        // (3 * 0.6 = 1.8 > 1.7) fails and cell 2 (1.2 <= 5) passes.
        let markers = [marker(1, 0, 0, 5.0)];
        let geometry = GridGeometry::unit(4, 1);
        let alloc = allocate(&geometry, &markers, 100.0);
        let watershed = row_grid(vec![1, 1, 1, 1]);
        let height = row_grid(vec![5.0, 5.0, 5.0, 1.7]);
        let rules = ValidationRules {
            rule_b_coefficient: 0.0,
            ..RULES
        };
        let out = validate_segments(&watershed, &alloc, &height, &markers, rules);
        assert_eq!(out.as_slice(), &[1, 1, 1, 0]);
    }

    #[test]
    fn rule_a_scales_with_cell_size() {
        let markers = [marker(1, 0, 0, 5.0)];
        let geometry = GridGeometry {
            cell_size: 2.0,
            ..GridGeometry::unit(2, 1)
        };
        let alloc = allocate(&geometry, &markers, 100.0);
        // Ground distance 2, times cell size 2, times 0.6 = 2.4.
        let watershed = Grid::from_vec(geometry, vec![1, 1]).unwrap();
        let height = Grid::from_vec(geometry, vec![5.0, 2.3]).unwrap();
        let out = validate_segments(&watershed, &alloc, &height, &markers, RULES);
        assert_eq!(out.as_slice(), &[1, 0]);
    }

    #[test]
    fn rule_b_rejects_cells_far_below_apex() {
        // 0.3 * 20 = 6: the 5.0 cell fails, the 6.0 cell passes.
        let markers = [marker(1, 0, 1, 20.0)];
        let geometry = GridGeometry::unit(3, 1);
        let alloc = allocate(&geometry, &markers, 100.0);
        let watershed = row_grid(vec![1, 1, 1]);
        let height = row_grid(vec![5.0, 20.0, 6.0]);
        let out = validate_segments(&watershed, &alloc, &height, &markers, RULES);
        assert_eq!(out.as_slice(), &[0, 1, 1]);
    }

    #[test]
    fn rule_b_uses_each_cells_own_apex() {
        // Apexes 50 (tree 1, col 0) and 30 (tree 2, col 7); thresholds
        // 0.3 * 50 = 15 and 0.3 * 30 = 9. Allocation splits at col 3/4.
        let markers = [marker(1, 0, 0, 50.0), marker(2, 0, 7, 30.0)];
        let geometry = GridGeometry::unit(8, 1);
        let alloc = allocate(&geometry, &markers, 100.0);
        let watershed = row_grid(vec![1, 1, 1, 1, 2, 2, 2, 2]);
        let height = row_grid(vec![50.0, 40.0, 20.0, 12.0, 12.0, 8.0, 25.0, 30.0]);
        let rules = ValidationRules {
            rule_a_coefficient: 0.0,
            ..RULES
        };
        let out = validate_segments(&watershed, &alloc, &height, &markers, rules);
        // 12 fails under tree 1 (col 3) and survives under tree 2 (col 4);
        // 8 falls below tree 2's threshold.
        assert_eq!(out.as_slice(), &[1, 1, 1, 0, 2, 0, 2, 2]);
    }

    #[test]
    fn nodata_anywhere_rejects() {
        let markers = [marker(1, 0, 0, 10.0)];
        let geometry = GridGeometry::unit(3, 1);
        let alloc = allocate(&geometry, &markers, 1.0);
        let watershed = row_grid(vec![1, 0, 1]);
        let height = row_grid(vec![10.0, 10.0, 10.0]);
        let out = validate_segments(&watershed, &alloc, &height, &markers, RULES);
        // Cell 1: no watershed label. Cell 2: beyond the allocation radius.
        assert_eq!(out.as_slice(), &[1, 0, 0]);

        let height = row_grid(vec![f64::NAN, 10.0, 10.0]);
        let out = validate_segments(&watershed, &alloc, &height, &markers, RULES);
        assert!(out.is_all_nodata());
    }

    #[test]
    fn surviving_cells_are_a_subset_of_both_inputs() {
        let geometry = GridGeometry::unit(12, 12);
        let markers = [marker(1, 3, 3, 12.0), marker(2, 8, 9, 9.0)];
        let alloc = allocate(&geometry, &markers, 5.0);
        let height = Grid::from_fn(geometry, |r, c| ((r * 7 + c * 3) % 13) as f64);
        let out = validate_segments(&alloc.labels, &alloc, &height, &markers, RULES);
        for i in 0..geometry.cell_count() {
            if let Some(label) = out.at(i) {
                assert_eq!(alloc.labels.at(i), Some(label));
            }
        }
    }
}
