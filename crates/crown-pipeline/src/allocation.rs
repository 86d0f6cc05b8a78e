//! Euclidean allocation: nearest tree top and distance to it, per cell.
//!
//! Markers are loaded into an R\*-tree and every cell queries its nearest
//! neighbours in order of distance. The query is exact (no chamfer or
//! two-pass approximation): downstream rules compare these distances
//! against heights directly.
//!
//! Distances between cell centres are evaluated in cell units, where
//! squared distances are small integers and therefore compare exactly.
//! That makes ties between equidistant markers deterministic; they go to
//! the lowest id.

use log::debug;
use rstar::RTree;
use rstar::primitives::GeomWithData;

use crate::grid::{CellValue, Grid, GridGeometry, Label, NO_LABEL};
use crate::types::Marker;

/// A marker position in (col, row) cell coordinates, tagged with its id.
type IndexedMarker = GeomWithData<[f64; 2], Label>;

/// Output of [`allocate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Nearest marker id within the radius, or nodata.
    pub labels: Grid<Label>,
    /// Ground distance to that marker; nodata exactly where `labels` is.
    pub distance: Grid<f64>,
}

/// Nearest-marker result for one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Nearest {
    label: Label,
    distance: f64,
}

impl CellValue for Nearest {
    const NODATA: Self = Self {
        label: NO_LABEL,
        distance: f64::NAN,
    };

    fn is_nodata(self) -> bool {
        self.label == NO_LABEL
    }
}

/// Allocate every cell of `geometry` to its nearest marker.
///
/// Cells farther than `radius` ground units from every marker, and all
/// cells when `markers` is empty, are nodata in both output grids.
#[must_use = "returns the allocation grids"]
#[allow(clippy::cast_precision_loss)]
pub fn allocate(geometry: &GridGeometry, markers: &[Marker], radius: f64) -> Allocation {
    let tree: RTree<IndexedMarker> = RTree::bulk_load(
        markers
            .iter()
            .map(|m| GeomWithData::new([m.col as f64, m.row as f64], m.id))
            .collect(),
    );
    let cell_size = geometry.cell_size;

    let nearest = Grid::par_from_fn(*geometry, |row, col| {
        nearest_marker(&tree, [col as f64, row as f64])
            .map(|(label, d2)| Nearest {
                label,
                distance: d2.sqrt() * cell_size,
            })
            .filter(|n| n.distance <= radius)
            .unwrap_or(Nearest::NODATA)
    });

    let labels = nearest.map_valid(|n| n.label);
    let distance = nearest.map_valid(|n| n.distance);
    debug!(
        "allocation: {} of {} cells within {radius} of {} markers",
        labels.valid_count(),
        geometry.cell_count(),
        markers.len()
    );
    Allocation { labels, distance }
}

/// Lowest-id marker among those nearest to `query`, with its squared
/// distance in cell units.
fn nearest_marker(tree: &RTree<IndexedMarker>, query: [f64; 2]) -> Option<(Label, f64)> {
    let mut best: Option<(Label, f64)> = None;
    for candidate in tree.nearest_neighbor_iter(&query) {
        let [x, y] = *candidate.geom();
        let (dx, dy) = (x - query[0], y - query[1]);
        let d2 = dx.mul_add(dx, dy * dy);
        match best {
            None => best = Some((candidate.data, d2)),
            Some((_, best_d2)) if d2 > best_d2 => break,
            Some((label, _)) if candidate.data < label => best = Some((candidate.data, d2)),
            Some(_) => {}
        }
    }
    best
}
