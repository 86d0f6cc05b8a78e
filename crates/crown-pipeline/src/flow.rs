//! D8 flow routing over the inverted canopy surface.
//!
//! After inversion, tree tops are pits, so water running downhill on the
//! inverted surface climbs towards an apex on the real canopy. Each cell
//! drains to the one neighbour (of eight) with the steepest descent.
//!
//! Ties between equally steep neighbours go to the first direction in
//! [`Direction::PRIORITY`]: E, SE, S, SW, W, NW, N, NE. Off-grid and
//! nodata neighbours never receive flow.

use std::f64::consts::SQRT_2;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::grid::{CellValue, Grid, GridGeometry};

/// One of the eight compass neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
    North,
    NorthEast,
}

impl Direction {
    /// Tie-break order: earlier entries win equally steep descents.
    pub const PRIORITY: [Self; 8] = [
        Self::East,
        Self::SouthEast,
        Self::South,
        Self::SouthWest,
        Self::West,
        Self::NorthWest,
        Self::North,
        Self::NorthEast,
    ];

    /// `(row, col)` step towards this neighbour. Rows grow southwards.
    #[must_use]
    pub const fn offset(self) -> (isize, isize) {
        match self {
            Self::East => (0, 1),
            Self::SouthEast => (1, 1),
            Self::South => (1, 0),
            Self::SouthWest => (1, -1),
            Self::West => (0, -1),
            Self::NorthWest => (-1, -1),
            Self::North => (-1, 0),
            Self::NorthEast => (-1, 1),
        }
    }

    /// Centre-to-centre distance in cells.
    #[must_use]
    pub const fn length(self) -> f64 {
        match self {
            Self::East | Self::South | Self::West | Self::North => 1.0,
            Self::SouthEast | Self::SouthWest | Self::NorthWest | Self::NorthEast => SQRT_2,
        }
    }

    /// Conventional D8 raster code (1 = E, doubling clockwise to 128 = NE).
    #[must_use]
    pub const fn d8_code(self) -> u8 {
        match self {
            Self::East => 1,
            Self::SouthEast => 2,
            Self::South => 4,
            Self::SouthWest => 8,
            Self::West => 16,
            Self::NorthWest => 32,
            Self::North => 64,
            Self::NorthEast => 128,
        }
    }
}

/// Flow state of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flow {
    /// Drains into the neighbour in this direction.
    Toward(Direction),
    /// No neighbour is lower: flow terminates here.
    Sink,
    /// The surface has no data here.
    NoData,
}

impl CellValue for Flow {
    const NODATA: Self = Self::NoData;
}

impl Flow {
    /// D8 raster code; `0` for sinks and `255` for nodata.
    #[must_use]
    pub const fn d8_code(self) -> u8 {
        match self {
            Self::Toward(d) => d.d8_code(),
            Self::Sink => 0,
            Self::NoData => 255,
        }
    }
}

/// How cells with no strictly lower neighbour are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlatRouting {
    /// Every such cell is a sink.
    #[default]
    Sink,
    /// Drain across flats: a cell with an equal neighbour flows to the
    /// first one in priority order. Plateaus can then form cycles, which
    /// watershed resolution detects and recovers from.
    Drain,
}

/// Compute the flow direction of every cell of `surface`.
#[must_use = "returns the flow direction grid"]
pub fn route_flow(surface: &Grid<f64>, flat: FlatRouting) -> Grid<Flow> {
    let flow = Grid::par_from_fn(*surface.geometry(), |row, col| {
        surface
            .get(row, col)
            .map_or(Flow::NoData, |z| cell_flow(surface, row, col, z, flat))
    });
    debug!(
        "flow: {} sinks",
        flow.as_slice().iter().filter(|f| **f == Flow::Sink).count()
    );
    flow
}

#[allow(clippy::cast_possible_wrap, clippy::float_cmp)]
fn cell_flow(surface: &Grid<f64>, row: usize, col: usize, z: f64, flat: FlatRouting) -> Flow {
    let (row, col) = (row as isize, col as isize);
    let mut steepest: Option<(Direction, f64)> = None;
    let mut first_equal: Option<Direction> = None;

    for direction in Direction::PRIORITY {
        let (dr, dc) = direction.offset();
        let Some(neighbour) = surface.get_signed(row + dr, col + dc) else {
            continue;
        };
        let drop = z - neighbour;
        if drop > 0.0 {
            let slope = drop / direction.length();
            if steepest.is_none_or(|(_, best)| slope > best) {
                steepest = Some((direction, slope));
            }
        } else if drop == 0.0 && first_equal.is_none() {
            first_equal = Some(direction);
        }
    }

    match (steepest, flat, first_equal) {
        (Some((direction, _)), _, _) => Flow::Toward(direction),
        (None, FlatRouting::Drain, Some(direction)) => Flow::Toward(direction),
        _ => Flow::Sink,
    }
}

/// Index of the cell that `index` drains into, if it is on the grid.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn downstream(geometry: &GridGeometry, index: usize, direction: Direction) -> Option<usize> {
    let (row, col) = geometry.row_col(index);
    let (dr, dc) = direction.offset();
    geometry.checked_index(row as isize + dr, col as isize + dc)
}
