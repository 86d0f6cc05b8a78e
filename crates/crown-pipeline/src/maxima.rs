//! Fixed-window local maxima: candidate tree tops.
//!
//! A cell is a tree top when it equals the focal maximum of its own
//! window. Cells tied for the maximum of a flat crown top all qualify;
//! they are kept as separate markers rather than merged.

use log::debug;

use crate::focal::focal_max;
use crate::grid::{Grid, Label};
use crate::types::{Marker, Window};

/// Find every cell of `masked` that is the maximum of its `window`.
///
/// `masked` is the canopy surface with cells below the minimum tree
/// height already set to nodata. Markers are returned in row-major order
/// with ids `1..=n` in that same order.
#[must_use = "returns the detected markers"]
#[allow(clippy::float_cmp)]
pub fn detect_maxima(masked: &Grid<f64>, window: Window) -> Vec<Marker> {
    let peaks = focal_max(masked, window);
    let geometry = masked.geometry();
    let mut markers = Vec::new();

    for row in 0..geometry.height {
        for col in 0..geometry.width {
            let Some(height) = masked.get(row, col) else {
                continue;
            };
            // Exact comparison: the focal max returns one of the window's
            // own values.
            if peaks.value(row, col) != height {
                continue;
            }
            let (x, y) = geometry.cell_center(row, col);
            markers.push(Marker {
                id: next_id(markers.len()),
                row,
                col,
                x,
                y,
                height,
            });
        }
    }

    debug!("maxima: {} markers in {window} window", markers.len());
    markers
}

/// Id for the marker at position `index` of the scan.
#[allow(clippy::cast_possible_truncation)]
const fn next_id(index: usize) -> Label {
    index as Label + 1
}
