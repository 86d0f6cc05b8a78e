//! Region extraction: turn the final segmentation into crown polygons.
//!
//! This module defines the [`RegionVectorizer`] trait for pluggable
//! raster-to-polygon conversion and the [`VectorizerKind`] enum for
//! selecting an implementation at runtime. [`extract_regions`] is the
//! adapter the pipeline calls: it builds the request, runs the vectorizer
//! and tags each polygon with its tree's apex height.
//!
//! # Border following
//!
//! The default vectorizer traces each label's cells with
//! `imageproc::contours::find_contours` (Suzuki-Abe). Every connected
//! part becomes its own polygon, with hole borders as interior rings.
//!
//! Tracing runs on a mask upsampled 2x, so every border pixel falls on a
//! cell corner. Rings follow cell edges and an `N`-cell part covers
//! exactly `N` cells of area.
//!
//! Parts below the minimum area are dropped on that exact area. The
//! survivors are simplified with topology-preserving Visvalingam-Whyatt
//! (`geo::SimplifyVwPreserve`) and smoothed by Chaikin corner cutting.

use std::collections::BTreeMap;

use geo::{Area, ChaikinSmoothing, Coord, LineString, Polygon, SimplifyVwPreserve};
use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, Contour, find_contours};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::grid::{Grid, GridGeometry, Label};
use crate::types::{Marker, PipelineError};

/// Polygon post-processing options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorizeOptions {
    /// Weighted-area tolerance in ground units. Vertices spanning a
    /// triangle smaller than its square are removed; `0` keeps every
    /// traced corner.
    pub simplify_tolerance: f64,
    /// Parts with a smaller area (square ground units) are dropped.
    pub min_area: f64,
    /// Chaikin smoothing passes; `0` disables smoothing.
    pub smoothing_iterations: usize,
}

impl VectorizeOptions {
    /// Default simplification tolerance.
    pub const DEFAULT_SIMPLIFY_TOLERANCE: f64 = 2.0;
    /// Default minimum part area.
    pub const DEFAULT_MIN_AREA: f64 = 1.0;
    /// Default number of smoothing passes.
    pub const DEFAULT_SMOOTHING_ITERATIONS: usize = 2;

    /// Check option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for a negative or
    /// non-finite tolerance or area.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, value) in [
            ("vectorize.simplify_tolerance", self.simplify_tolerance),
            ("vectorize.min_area", self.min_area),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for VectorizeOptions {
    fn default() -> Self {
        Self {
            simplify_tolerance: Self::DEFAULT_SIMPLIFY_TOLERANCE,
            min_area: Self::DEFAULT_MIN_AREA,
            smoothing_iterations: Self::DEFAULT_SMOOTHING_ITERATIONS,
        }
    }
}

/// Selects which vectorizer turns the segmentation into polygons.
///
/// Additional variants can be added without changing `PipelineConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VectorizerKind {
    /// Suzuki-Abe border following via `imageproc::contours::find_contours`.
    #[default]
    BorderFollowing,
}

/// Everything a vectorizer needs.
#[derive(Debug, Clone, Copy)]
pub struct VectorizeRequest<'a> {
    /// Final per-cell tree id, nodata outside crowns.
    pub segmentation: &'a Grid<Label>,
    /// Post-processing options.
    pub options: VectorizeOptions,
}

/// One polygon produced by a vectorizer, in ground coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledPolygon {
    pub label: Label,
    pub polygon: Polygon<f64>,
}

/// A crown outline tagged with its tree.
#[derive(Debug, Clone, PartialEq)]
pub struct CrownPolygon {
    /// Id of the tree (marker) the crown belongs to.
    pub tree_id: Label,
    /// Apex height of that tree.
    pub height: f64,
    /// Outline in ground coordinates; a tree may own several parts.
    pub polygon: Polygon<f64>,
}

/// Trait for raster-to-polygon strategies.
///
/// Implementations return polygons in ground coordinates, each tagged with
/// the label of the cells it encloses.
pub trait RegionVectorizer {
    /// Vectorize every labelled region of the request's segmentation.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ExternalService`] when conversion fails.
    fn vectorize(&self, request: &VectorizeRequest<'_>) -> Result<Vec<LabeledPolygon>, PipelineError>;
}

impl RegionVectorizer for VectorizerKind {
    fn vectorize(&self, request: &VectorizeRequest<'_>) -> Result<Vec<LabeledPolygon>, PipelineError> {
        match *self {
            Self::BorderFollowing => vectorize_border_following(request),
        }
    }
}

/// Vectorize `segmentation` and attach each tree's apex height.
///
/// `markers` must contain every label present in the segmentation.
///
/// # Errors
///
/// Returns [`PipelineError::ExternalService`] when the vectorizer fails or
/// returns a polygon for a label that is not a marker id.
pub fn extract_regions(
    segmentation: &Grid<Label>,
    markers: &[Marker],
    vectorizer: &dyn RegionVectorizer,
    options: VectorizeOptions,
) -> Result<Vec<CrownPolygon>, PipelineError> {
    let heights: BTreeMap<Label, f64> = markers.iter().map(|m| (m.id, m.height)).collect();
    let request = VectorizeRequest {
        segmentation,
        options,
    };

    let crowns = vectorizer
        .vectorize(&request)?
        .into_iter()
        .map(|LabeledPolygon { label, polygon }| {
            heights
                .get(&label)
                .map(|&height| CrownPolygon {
                    tree_id: label,
                    height,
                    polygon,
                })
                .ok_or_else(|| {
                    PipelineError::ExternalService(format!(
                        "vectorizer returned a polygon for unknown tree {label}"
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    debug!("regions: {} crown polygons", crowns.len());
    Ok(crowns)
}

/// Inclusive cell bounds of one label.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_row: usize,
    min_col: usize,
    max_row: usize,
    max_col: usize,
}

fn label_bounds(segmentation: &Grid<Label>) -> BTreeMap<Label, Bounds> {
    let mut bounds: BTreeMap<Label, Bounds> = BTreeMap::new();
    for row in 0..segmentation.height() {
        for col in 0..segmentation.width() {
            let Some(label) = segmentation.get(row, col) else {
                continue;
            };
            bounds
                .entry(label)
                .and_modify(|b| {
                    b.min_row = b.min_row.min(row);
                    b.min_col = b.min_col.min(col);
                    b.max_row = b.max_row.max(row);
                    b.max_col = b.max_col.max(col);
                })
                .or_insert(Bounds {
                    min_row: row,
                    min_col: col,
                    max_row: row,
                    max_col: col,
                });
        }
    }
    bounds
}

fn vectorize_border_following(
    request: &VectorizeRequest<'_>,
) -> Result<Vec<LabeledPolygon>, PipelineError> {
    let segmentation = request.segmentation;
    let options = request.options;
    let regions: Vec<(Label, Bounds)> = label_bounds(segmentation).into_iter().collect();

    let per_label = regions
        .par_iter()
        .map(|&(label, bounds)| trace_label(segmentation, label, bounds, options))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(per_label.into_iter().flatten().collect())
}

/// Trace every part of `label` inside `bounds`.
fn trace_label(
    segmentation: &Grid<Label>,
    label: Label,
    bounds: Bounds,
    options: VectorizeOptions,
) -> Result<Vec<LabeledPolygon>, PipelineError> {
    let mask = label_mask(segmentation, label, bounds)?;
    let contours: Vec<Contour<u32>> = find_contours(&mask);
    let geometry = segmentation.geometry();

    let mut parts: BTreeMap<usize, (LineString<f64>, Vec<LineString<f64>>)> = BTreeMap::new();
    for (i, contour) in contours.iter().enumerate() {
        if contour.border_type == BorderType::Outer
            && let Some(ring) = corner_ring(contour, geometry, bounds)
        {
            parts.insert(i, (ring, Vec::new()));
        }
    }
    for contour in &contours {
        if contour.border_type != BorderType::Hole {
            continue;
        }
        let Some(part) = contour.parent.and_then(|p| parts.get_mut(&p)) else {
            continue;
        };
        if let Some(ring) = corner_ring(contour, geometry, bounds) {
            part.1.push(ring);
        }
    }

    let epsilon = options.simplify_tolerance * options.simplify_tolerance;
    Ok(parts
        .into_values()
        .map(|(exterior, holes)| Polygon::new(exterior, holes))
        .filter(|polygon| polygon.unsigned_area() >= options.min_area)
        .map(|polygon| {
            let polygon = polygon.simplify_vw_preserve(epsilon);
            let polygon = if options.smoothing_iterations > 0 {
                polygon.chaikin_smoothing(options.smoothing_iterations)
            } else {
                polygon
            };
            LabeledPolygon { label, polygon }
        })
        .collect())
}

/// Binary mask of `label` over `bounds` at twice the cell resolution, with
/// a one-pixel empty margin.
///
/// Local cell `(r, c)` covers pixels `2r + 1..=2r + 2` by `2c + 1..=2c + 2`.
fn label_mask(segmentation: &Grid<Label>, label: Label, bounds: Bounds) -> Result<GrayImage, PipelineError> {
    let too_large = || PipelineError::ExternalService(format!("region of tree {label} is too large to trace"));
    let span = |cells: usize| {
        cells
            .checked_mul(2)
            .and_then(|n| n.checked_add(2))
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(too_large)
    };
    let width = span(bounds.max_col - bounds.min_col + 1)?;
    let height = span(bounds.max_row - bounds.min_row + 1)?;

    let mut mask = GrayImage::new(width, height);
    for row in bounds.min_row..=bounds.max_row {
        for col in bounds.min_col..=bounds.max_col {
            if segmentation.get(row, col) != Some(label) {
                continue;
            }
            // Offsets fit: both are below the u32 dimensions above.
            #[allow(clippy::cast_possible_truncation)]
            let (x, y) = (
                2 * (col - bounds.min_col) as u32 + 1,
                2 * (row - bounds.min_row) as u32 + 1,
            );
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                mask.put_pixel(x + dx, y + dy, Luma([255]));
            }
        }
    }
    Ok(mask)
}

/// Closed ground-coordinate ring along the cell edges of a traced border,
/// or `None` when it encloses nothing.
///
/// Mask pixel `p` sits on cell corner `p / 2`: outer border pixels land on
/// the outer edges of their cells and hole border pixels on the edges of
/// the enclosed cells. Pixels sharing a corner collapse into one vertex.
fn corner_ring(contour: &Contour<u32>, geometry: &GridGeometry, bounds: Bounds) -> Option<LineString<f64>> {
    let mut ring: Vec<Coord<f64>> = Vec::with_capacity(contour.points.len() + 1);
    for p in &contour.points {
        let row = bounds.min_row + (p.y / 2) as usize;
        let col = bounds.min_col + (p.x / 2) as usize;
        let (x, y) = geometry.cell_corner(row, col);
        let corner = Coord { x, y };
        if ring.last() != Some(&corner) {
            ring.push(corner);
        }
    }
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return None;
    }
    ring.push(ring[0]);
    Some(LineString::new(ring))
}
