//! Cell-wise transforms of the canopy height surface.
//!
//! Clipping, unit conversion, minimum-height masking and inversion. Each
//! returns a new grid and leaves nodata cells as nodata.

use crate::grid::Grid;

/// Null out every cell outside the clip mask.
///
/// A mask cell counts as "inside" when it holds data and is non-zero.
/// The caller guarantees both grids share a geometry.
#[must_use = "returns the clipped grid"]
pub fn clip(height: &Grid<f64>, mask: &Grid<f64>) -> Grid<f64> {
    debug_assert_eq!(height.geometry(), mask.geometry());
    Grid::from_fn(*height.geometry(), |row, col| match mask.get(row, col) {
        Some(m) if m != 0.0 => height.value(row, col),
        _ => f64::NAN,
    })
}

/// Keep `values` only where `reference` holds data.
///
/// Focal smoothing fills nodata cells from their valid neighbours; this
/// restores the clip footprint afterwards.
#[must_use = "returns the masked grid"]
pub fn restrict_to(values: &Grid<f64>, reference: &Grid<f64>) -> Grid<f64> {
    debug_assert_eq!(values.geometry(), reference.geometry());
    Grid::from_fn(*values.geometry(), |row, col| {
        reference
            .get(row, col)
            .map_or(f64::NAN, |_| values.value(row, col))
    })
}

/// Multiply every valid height by `factor`.
#[must_use = "returns the converted grid"]
pub fn convert_units(height: &Grid<f64>, factor: f64) -> Grid<f64> {
    height.map_valid(|v| v * factor)
}

/// Null out cells lower than `min_height`.
#[must_use = "returns the masked grid"]
pub fn mask_below(height: &Grid<f64>, min_height: f64) -> Grid<f64> {
    height.map_valid(|v| if v < min_height { f64::NAN } else { v })
}

/// Turn peaks into pits: `constant - height` for every valid cell.
#[must_use = "returns the inverted surface"]
pub fn invert(height: &Grid<f64>, constant: f64) -> Grid<f64> {
    height.map_valid(|v| constant - v)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::grid::GridGeometry;

    fn row(values: &[f64]) -> Grid<f64> {
        Grid::from_vec(GridGeometry::unit(values.len(), 1), values.to_vec()).unwrap()
    }

    #[test]
    fn clip_keeps_nonzero_mask_cells() {
        let h = row(&[1.0, 2.0, 3.0, 4.0]);
        let m = row(&[1.0, 0.0, f64::NAN, 7.0]);
        let out = clip(&h, &m);
        assert_eq!(out.get(0, 0), Some(1.0));
        assert_eq!(out.get(0, 1), None);
        assert_eq!(out.get(0, 2), None);
        assert_eq!(out.get(0, 3), Some(4.0));
    }

    #[test]
    fn restrict_to_follows_reference_footprint() {
        let smoothed = row(&[1.5, 2.5, 3.5]);
        let reference = row(&[1.0, f64::NAN, 4.0]);
        let out = restrict_to(&smoothed, &reference);
        assert_eq!(out.get(0, 0), Some(1.5));
        assert_eq!(out.get(0, 1), None);
        assert_eq!(out.get(0, 2), Some(3.5));
    }

    #[test]
    fn convert_scales_valid_cells() {
        let out = convert_units(&row(&[2.0, f64::NAN]), 3.281);
        assert!((out.value(0, 0) - 6.562).abs() < 1e-12);
        assert!(out.value(0, 1).is_nan());
    }

    #[test]
    fn mask_below_threshold() {
        let out = mask_below(&row(&[4.9, 5.0, 12.0]), 5.0);
        assert_eq!(out.get(0, 0), None);
        assert_eq!(out.get(0, 1), Some(5.0));
        assert_eq!(out.get(0, 2), Some(12.0));
    }

    #[test]
    fn invert_turns_peak_into_pit() {
        let out = invert(&row(&[0.0, 30.0, f64::NAN]), 1000.0);
        assert_eq!(out.get(0, 0), Some(1000.0));
        assert_eq!(out.get(0, 1), Some(970.0));
        assert_eq!(out.get(0, 2), None);
    }
}
