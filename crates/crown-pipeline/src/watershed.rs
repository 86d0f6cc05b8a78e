//! Watershed delineation: which tree top does each cell drain to?
//!
//! Every marker is a pour point labelled with its own id. A cell belongs
//! to the first pour point on its downstream path, itself included. Paths
//! that end in an unlabelled sink, or never leave nodata, resolve to
//! nodata.
//!
//! Paths are followed with an explicit stack and each cell is resolved
//! exactly once, so run time is linear in the cell count and path length
//! never touches the call stack.
//!
//! A path that loops back onto itself (possible when flow is forced across
//! flats) is a [`FlowCycle`]. Cells on the cycle fall back to their
//! nearest-marker allocation label; cells upstream of the cycle inherit
//! from the cycle as usual.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::flow::{Flow, downstream};
use crate::grid::{Grid, Label, NO_LABEL};
use crate::types::Marker;

/// A closed flow loop found and recovered from during delineation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCycle {
    /// `(row, col)` of the cell where the walk re-entered its own path.
    pub closed_at: (usize, usize),
    /// Number of cells on the loop.
    pub length: usize,
    /// Allocation label of the closing cell (`0` when unallocated).
    pub label: Label,
}

/// Output of [`delineate`].
#[derive(Debug, Clone, PartialEq)]
pub struct WatershedOutcome {
    /// Basin id per cell, or nodata.
    pub labels: Grid<Label>,
    /// Every cycle recovered, in discovery order.
    pub cycles: Vec<FlowCycle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unvisited,
    /// On the current walk, at this position of the path stack.
    OnPath(usize),
    Resolved(Label),
}

/// Resolve every cell of `flow` to the pour point it drains into.
///
/// `allocation` supplies the fallback label for cells on a flow cycle and
/// must share `flow`'s geometry.
#[must_use = "returns the watershed labels"]
pub fn delineate(flow: &Grid<Flow>, markers: &[Marker], allocation: &Grid<Label>) -> WatershedOutcome {
    let geometry = *flow.geometry();
    debug_assert_eq!(&geometry, allocation.geometry());

    let mut pour_points = vec![NO_LABEL; geometry.cell_count()];
    for marker in markers {
        pour_points[geometry.index(marker.row, marker.col)] = marker.id;
    }
    let flow = flow.as_slice();
    let allocation = allocation.as_slice();

    let mut state = vec![State::Unvisited; geometry.cell_count()];
    let mut path: Vec<usize> = Vec::new();
    let mut cycles = Vec::new();

    for start in 0..geometry.cell_count() {
        if state[start] != State::Unvisited {
            continue;
        }

        let mut cell = start;
        let label = loop {
            match state[cell] {
                State::Resolved(label) => break label,
                State::OnPath(position) => {
                    // Everything from `position` on is the loop.
                    for &member in &path[position..] {
                        state[member] = State::Resolved(allocation[member]);
                    }
                    let cycle = FlowCycle {
                        closed_at: geometry.row_col(cell),
                        length: path.len() - position,
                        label: allocation[cell],
                    };
                    warn!(
                        "flow cycle of {} cells closed at {:?}; falling back to allocation label {}",
                        cycle.length, cycle.closed_at, cycle.label
                    );
                    cycles.push(cycle);
                    path.truncate(position);
                    break allocation[cell];
                }
                State::Unvisited => {
                    if pour_points[cell] != NO_LABEL {
                        state[cell] = State::Resolved(pour_points[cell]);
                        break pour_points[cell];
                    }
                    let next = match flow[cell] {
                        Flow::Toward(direction) => downstream(&geometry, cell, direction),
                        Flow::Sink | Flow::NoData => None,
                    };
                    let Some(next) = next else {
                        state[cell] = State::Resolved(NO_LABEL);
                        break NO_LABEL;
                    };
                    state[cell] = State::OnPath(path.len());
                    path.push(cell);
                    cell = next;
                }
            }
        };

        for member in path.drain(..) {
            state[member] = State::Resolved(label);
        }
    }

    let labels = state
        .into_iter()
        .map(|s| match s {
            State::Resolved(label) => label,
            State::Unvisited | State::OnPath(_) => NO_LABEL,
        })
        .collect();
    let labels = Grid::from_vec(geometry, labels).unwrap_or_else(|_| Grid::nodata(geometry));

    debug!(
        "watershed: {} of {} cells in {} basins, {} cycles",
        labels.valid_count(),
        geometry.cell_count(),
        markers.len(),
        cycles.len()
    );
    WatershedOutcome { labels, cycles }
}
