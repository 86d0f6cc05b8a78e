//! Focal (moving-window) statistics over a height grid.
//!
//! Used twice in the pipeline: a mean filter to pre-smooth the canopy
//! surface, and a maximum filter whose output is compared against the
//! surface to find tree tops.
//!
//! Windows are centred on the output cell. Cells of the window that fall
//! off the grid or hold nodata are skipped, so edge and gap cells are
//! computed from whatever valid neighbours remain. A window with no valid
//! cell produces nodata.

use serde::{Deserialize, Serialize};

use crate::grid::Grid;
use crate::types::Window;

/// Statistic computed over each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocalStatistic {
    /// Arithmetic mean of the valid cells.
    Mean,
    /// Largest valid cell.
    Maximum,
}

/// Apply a focal statistic to every cell of `grid`.
///
/// The output always has the input's geometry. Rows are computed in
/// parallel; the input is only read.
#[must_use = "returns the filtered grid"]
#[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
pub fn focal(grid: &Grid<f64>, window: Window, statistic: FocalStatistic) -> Grid<f64> {
    let half_rows = window.half_rows() as isize;
    let half_cols = window.half_cols() as isize;

    Grid::par_from_fn(*grid.geometry(), |row, col| {
        let (row, col) = (row as isize, col as isize);
        let mut count = 0_usize;
        let mut acc = match statistic {
            FocalStatistic::Mean => 0.0,
            FocalStatistic::Maximum => f64::NEG_INFINITY,
        };

        for dr in -half_rows..=half_rows {
            for dc in -half_cols..=half_cols {
                let Some(v) = grid.get_signed(row + dr, col + dc) else {
                    continue;
                };
                count += 1;
                acc = match statistic {
                    FocalStatistic::Mean => acc + v,
                    FocalStatistic::Maximum => acc.max(v),
                };
            }
        }

        match (count, statistic) {
            (0, _) => f64::NAN,
            (n, FocalStatistic::Mean) => acc / n as f64,
            (_, FocalStatistic::Maximum) => acc,
        }
    })
}

/// Mean filter; shorthand for [`focal`] with [`FocalStatistic::Mean`].
#[must_use = "returns the smoothed grid"]
pub fn focal_mean(grid: &Grid<f64>, window: Window) -> Grid<f64> {
    focal(grid, window, FocalStatistic::Mean)
}

/// Maximum filter; shorthand for [`focal`] with [`FocalStatistic::Maximum`].
#[must_use = "returns the filtered grid"]
pub fn focal_max(grid: &Grid<f64>, window: Window) -> Grid<f64> {
    focal(grid, window, FocalStatistic::Maximum)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::grid::GridGeometry;

    fn grid(width: usize, height: usize, values: &[f64]) -> Grid<f64> {
        Grid::from_vec(GridGeometry::unit(width, height), values.to_vec()).unwrap()
    }

    #[test]
    fn output_dimensions_preserved() {
        let nan = f64::NAN;
        let g = grid(4, 3, &[1.0, nan, 3.0, 4.0, nan, nan, nan, 8.0, 9.0, 10.0, nan, 12.0]);
        for size in [1, 3, 5, 7] {
            for statistic in [FocalStatistic::Mean, FocalStatistic::Maximum] {
                let out = focal(&g, Window::square(size), statistic);
                assert_eq!(out.geometry(), g.geometry());
                assert_eq!(out.as_slice().len(), 12);
            }
        }
    }

    #[test]
    fn mean_of_interior_cell() {
        let g = grid(3, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let out = focal_mean(&g, Window::square(3));
        assert!((out.value(1, 1) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn corner_uses_only_in_bounds_cells() {
        let g = grid(3, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let out = focal_mean(&g, Window::square(3));
        // (1 + 2 + 4 + 5) / 4
        assert!((out.value(0, 0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn nodata_cells_are_skipped() {
        let nan = f64::NAN;
        let g = grid(3, 1, &[2.0, nan, 4.0]);
        let out = focal_mean(&g, Window::square(3));
        assert!((out.value(0, 1) - 3.0).abs() < 1e-12);
        let out = focal_max(&g, Window::square(3));
        assert!((out.value(0, 1) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn all_nodata_window_is_nodata() {
        let nan = f64::NAN;
        let g = grid(5, 1, &[1.0, nan, nan, nan, 2.0]);
        let out = focal_max(&g, Window::square(3));
        assert!(out.value(0, 2).is_nan());
        assert!((out.value(0, 1) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rectangular_window() {
        let g = grid(5, 1, &[1.0, 2.0, 9.0, 2.0, 1.0]);
        let wide = focal_max(&g, Window { rows: 1, cols: 5 });
        assert!(wide.as_slice().iter().all(|&v| (v - 9.0).abs() < 1e-12));
        let tall = focal_max(&g, Window { rows: 5, cols: 1 });
        assert_eq!(tall.as_slice(), g.as_slice());
    }

    #[test]
    fn max_returns_exact_input_value() {
        let g = grid(3, 1, &[0.1, 0.2 + 0.1, 0.3]);
        let out = focal_max(&g, Window::square(3));
        assert_eq!(out.value(0, 0).to_bits(), (0.2_f64 + 0.1).to_bits());
    }

    #[test]
    fn input_not_modified() {
        let g = grid(3, 1, &[1.0, 5.0, 1.0]);
        let before = g.clone();
        let _ = focal_mean(&g, Window::square(3));
        assert_eq!(g.as_slice(), before.as_slice());
    }
}
