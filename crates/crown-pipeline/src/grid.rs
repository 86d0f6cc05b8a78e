//! Immutable 2-D raster grids shared by every pipeline stage.
//!
//! A [`Grid`] is a row-major block of cells plus a [`GridGeometry`]
//! describing where it sits on the ground. Every grid produced during one
//! pipeline run carries the same geometry, so cells line up one-to-one
//! between stages.
//!
//! Missing cells are encoded with a per-type sentinel (see
//! [`CellValue`]) rather than `Option<T>`, which keeps height grids at
//! eight bytes per cell.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Marker label stored in label grids. `0` means "no marker".
pub type Label = u32;

/// The nodata sentinel for [`Label`] grids.
pub const NO_LABEL: Label = 0;

/// A value that can be stored in a [`Grid`] cell.
///
/// Each implementation names the sentinel written into cells that hold
/// no data.
pub trait CellValue: Copy + PartialEq + Send + Sync {
    /// Sentinel written into nodata cells.
    const NODATA: Self;

    /// Whether this value is the nodata sentinel.
    #[must_use]
    fn is_nodata(self) -> bool {
        self == Self::NODATA
    }
}

impl CellValue for f64 {
    const NODATA: Self = Self::NAN;

    /// Any NaN counts as nodata, not just the canonical sentinel.
    fn is_nodata(self) -> bool {
        self.is_nan()
    }
}

impl CellValue for Label {
    const NODATA: Self = NO_LABEL;
}

/// Placement of a grid on the ground.
///
/// `origin_x` is the x coordinate of the left edge and `origin_y` the y
/// coordinate of the top edge. Rows run top to bottom (decreasing y).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// Number of columns.
    pub width: usize,
    /// Number of rows.
    pub height: usize,
    /// Side length of a (square) cell in ground units.
    pub cell_size: f64,
    /// Ground x of the left edge.
    pub origin_x: f64,
    /// Ground y of the top edge.
    pub origin_y: f64,
}

impl GridGeometry {
    /// Geometry with unit cells and the origin at `(0, height)`, so that
    /// cell `(row, col)` covers `[col, col + 1] x [height - row - 1, height - row]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn unit(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cell_size: 1.0,
            origin_x: 0.0,
            origin_y: height as f64,
        }
    }

    /// Total number of cells.
    #[must_use]
    pub const fn cell_count(&self) -> usize {
        self.width * self.height
    }

    /// Row-major index of `(row, col)`. The caller guarantees bounds.
    #[must_use]
    pub const fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    /// Inverse of [`index`](Self::index).
    #[must_use]
    pub const fn row_col(&self, index: usize) -> (usize, usize) {
        (index / self.width, index % self.width)
    }

    /// Row-major index of a signed position, or `None` when off-grid.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub const fn checked_index(&self, row: isize, col: isize) -> Option<usize> {
        if row < 0 || col < 0 || row as usize >= self.height || col as usize >= self.width {
            None
        } else {
            Some(self.index(row as usize, col as usize))
        }
    }

    /// Ground coordinates of the centre of `(row, col)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let x = (col as f64 + 0.5).mul_add(self.cell_size, self.origin_x);
        let y = (row as f64 + 0.5).mul_add(-self.cell_size, self.origin_y);
        (x, y)
    }

    /// Ground coordinates of the top-left corner of `(row, col)`.
    ///
    /// `row == height` or `col == width` give the far edges.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cell_corner(&self, row: usize, col: usize) -> (f64, f64) {
        let x = (col as f64).mul_add(self.cell_size, self.origin_x);
        let y = (row as f64).mul_add(-self.cell_size, self.origin_y);
        (x, y)
    }

    /// Check that the geometry describes a usable, non-empty grid.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidGridGeometry`] for zero dimensions
    /// or a non-positive / non-finite cell size.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::InvalidGridGeometry(format!(
                "grid must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(PipelineError::InvalidGridGeometry(format!(
                "cell size must be positive, got {}",
                self.cell_size
            )));
        }
        Ok(())
    }
}

/// An immutable row-major raster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grid<T> {
    geometry: GridGeometry,
    data: Vec<T>,
}

impl<T: CellValue> Grid<T> {
    /// Create a grid with every cell set to `value`.
    #[must_use]
    pub fn filled(geometry: GridGeometry, value: T) -> Self {
        Self {
            geometry,
            data: vec![value; geometry.cell_count()],
        }
    }

    /// Create a grid with every cell set to nodata.
    #[must_use]
    pub fn nodata(geometry: GridGeometry) -> Self {
        Self::filled(geometry, T::NODATA)
    }

    /// Wrap existing row-major cell values.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidGridGeometry`] when `data.len()`
    /// does not match the geometry's cell count.
    pub fn from_vec(geometry: GridGeometry, data: Vec<T>) -> Result<Self, PipelineError> {
        if data.len() != geometry.cell_count() {
            return Err(PipelineError::InvalidGridGeometry(format!(
                "{} values supplied for a {}x{} grid",
                data.len(),
                geometry.width,
                geometry.height
            )));
        }
        Ok(Self { geometry, data })
    }

    /// Build a grid by evaluating `f(row, col)` for every cell.
    #[must_use]
    pub fn from_fn(geometry: GridGeometry, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(geometry.cell_count());
        for row in 0..geometry.height {
            for col in 0..geometry.width {
                data.push(f(row, col));
            }
        }
        Self { geometry, data }
    }

    /// Like [`from_fn`](Self::from_fn), evaluating rows in parallel.
    #[must_use]
    pub fn par_from_fn(geometry: GridGeometry, f: impl Fn(usize, usize) -> T + Sync) -> Self {
        let mut data = vec![T::NODATA; geometry.cell_count()];
        if geometry.width > 0 {
            data.par_chunks_mut(geometry.width)
                .enumerate()
                .for_each(|(row, cells)| {
                    for (col, cell) in cells.iter_mut().enumerate() {
                        *cell = f(row, col);
                    }
                });
        }
        Self { geometry, data }
    }

    /// The grid's placement on the ground.
    #[must_use]
    pub const fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// Number of columns.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.geometry.width
    }

    /// Number of rows.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.geometry.height
    }

    /// Cell side length in ground units.
    #[must_use]
    pub const fn cell_size(&self) -> f64 {
        self.geometry.cell_size
    }

    /// Raw value at `(row, col)`, including the nodata sentinel.
    ///
    /// # Panics
    ///
    /// Panics if `(row, col)` is out of bounds.
    #[must_use]
    pub fn value(&self, row: usize, col: usize) -> T {
        self.data[self.geometry.index(row, col)]
    }

    /// Valid value at `(row, col)`; `None` when nodata or out of bounds.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        if row >= self.geometry.height || col >= self.geometry.width {
            return None;
        }
        self.at(self.geometry.index(row, col))
    }

    /// Valid value at a signed position; `None` when nodata or off-grid.
    #[must_use]
    pub fn get_signed(&self, row: isize, col: isize) -> Option<T> {
        self.geometry
            .checked_index(row, col)
            .and_then(|i| self.at(i))
    }

    /// Valid value at a row-major index; `None` when nodata.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<T> {
        let v = self.data[index];
        if v.is_nodata() { None } else { Some(v) }
    }

    /// All cells in row-major order.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Consume the grid and return its cells.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Apply `f` to every valid cell; nodata stays nodata.
    #[must_use]
    pub fn map_valid<U: CellValue>(&self, f: impl Fn(T) -> U) -> Grid<U> {
        Grid {
            geometry: self.geometry,
            data: self
                .data
                .iter()
                .map(|&v| if v.is_nodata() { U::NODATA } else { f(v) })
                .collect(),
        }
    }

    /// Number of cells holding data.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nodata()).count()
    }

    /// Whether every cell is nodata.
    #[must_use]
    pub fn is_all_nodata(&self) -> bool {
        self.data.iter().all(|v| v.is_nodata())
    }
}

impl Grid<f64> {
    /// Largest valid value, or `None` for an all-nodata grid.
    #[must_use]
    pub fn max_valid(&self) -> Option<f64> {
        self.data
            .iter()
            .copied()
            .filter(|v| !v.is_nodata())
            .reduce(f64::max)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Grid<f64> {
        Grid::from_fn(GridGeometry::unit(3, 2), |r, c| {
            if (r, c) == (1, 1) {
                f64::NAN
            } else {
                #[allow(clippy::cast_precision_loss)]
                let v = (r * 3 + c) as f64;
                v
            }
        })
    }

    #[test]
    fn get_filters_nodata_and_bounds() {
        let g = sample();
        assert_eq!(g.get(0, 2), Some(2.0));
        assert_eq!(g.get(1, 1), None);
        assert_eq!(g.get(2, 0), None);
        assert_eq!(g.get_signed(-1, 0), None);
        assert_eq!(g.get_signed(1, 2), Some(5.0));
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        let result = Grid::from_vec(GridGeometry::unit(2, 2), vec![1.0; 3]);
        assert!(matches!(result, Err(PipelineError::InvalidGridGeometry(_))));
    }

    #[test]
    fn map_valid_keeps_nodata() {
        let doubled = sample().map_valid(|v| v * 2.0);
        assert_eq!(doubled.get(0, 1), Some(2.0));
        assert!(doubled.value(1, 1).is_nan());
    }

    #[test]
    fn par_from_fn_matches_from_fn() {
        let geometry = GridGeometry::unit(7, 5);
        #[allow(clippy::cast_possible_truncation)]
        let f = |r: usize, c: usize| (r * 100 + c) as Label;
        assert_eq!(Grid::from_fn(geometry, f), Grid::par_from_fn(geometry, f));
    }

    #[test]
    fn cell_center_uses_top_left_origin() {
        let geometry = GridGeometry {
            width: 4,
            height: 3,
            cell_size: 2.0,
            origin_x: 100.0,
            origin_y: 50.0,
        };
        assert_eq!(geometry.cell_center(0, 0), (101.0, 49.0));
        assert_eq!(geometry.cell_center(2, 3), (107.0, 45.0));
    }

    #[test]
    fn cell_corner_brackets_the_centre() {
        let geometry = GridGeometry {
            width: 4,
            height: 3,
            cell_size: 2.0,
            origin_x: 100.0,
            origin_y: 50.0,
        };
        assert_eq!(geometry.cell_corner(0, 0), (100.0, 50.0));
        assert_eq!(geometry.cell_corner(2, 3), (106.0, 46.0));
        assert_eq!(geometry.cell_corner(3, 4), (108.0, 44.0));
    }

    #[test]
    fn label_zero_is_nodata() {
        let g = Grid::from_vec(GridGeometry::unit(2, 1), vec![0, 7]).unwrap();
        assert_eq!(g.get(0, 0), None);
        assert_eq!(g.get(0, 1), Some(7));
        assert_eq!(g.valid_count(), 1);
    }

    #[test]
    fn max_valid_skips_nan() {
        assert_eq!(sample().max_valid(), Some(5.0));
        assert_eq!(Grid::<f64>::nodata(GridGeometry::unit(2, 2)).max_valid(), None);
    }

    #[test]
    fn validate_rejects_empty_and_bad_cell_size() {
        assert!(GridGeometry::unit(0, 3).validate().is_err());
        let mut g = GridGeometry::unit(2, 2);
        g.cell_size = 0.0;
        assert!(g.validate().is_err());
        assert!(GridGeometry::unit(2, 2).validate().is_ok());
    }
}
