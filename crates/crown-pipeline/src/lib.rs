//! crown-pipeline: marker-controlled watershed segmentation of tree
//! crowns (sans-IO).
//!
//! Locates individual tree tops in a canopy height grid and delineates
//! each tree's crown through:
//! clip -> smooth -> unit conversion -> local maxima -> nearest-marker
//! allocation -> flow routing -> watershed -> validation -> polygons.
//!
//! This crate has **no I/O dependencies**: it operates on in-memory
//! [`Grid`]s and returns structured data. Reading and writing rasters
//! lives in `crown-io`, output formats in `crown-export`.

pub mod allocation;
pub mod diagnostics;
pub mod flow;
pub mod focal;
pub mod grid;
pub mod maxima;
pub mod pipeline;
pub mod region;
pub mod surface;
pub mod types;
pub mod validate;
pub mod watershed;

pub use allocation::Allocation;
pub use flow::{Direction, FlatRouting, Flow};
pub use grid::{CellValue, Grid, GridGeometry, Label, NO_LABEL};
pub use pipeline::Pipeline;
pub use region::{CrownPolygon, RegionVectorizer, VectorizeOptions, VectorizerKind};
pub use types::{DetectionStatus, Marker, PipelineConfig, PipelineError, ProcessResult, Window};
pub use watershed::FlowCycle;

/// Run the full crown segmentation pipeline.
///
/// Takes a canopy height grid, an optional clip mask sharing its
/// geometry, and a configuration. Returns the prepared heights, the tree
/// tops, the final segmentation and the crown polygons.
///
/// # Pipeline steps
///
/// 1. Clip to the mask (nodata or zero mask cells become nodata)
/// 2. Optional mean smoothing
/// 3. Optional unit conversion
/// 4. Tree tops: fixed-window local maxima above the minimum height
/// 5. Nearest-marker allocation within the allocation radius
/// 6. D8 flow routing over the inverted surface
/// 7. Watershed delineation with the tree tops as pour points
/// 8. Agreement and height rules
/// 9. Polygon extraction (pluggable strategy)
///
/// Finding no trees is not an error; see [`DetectionStatus`].
///
/// # Errors
///
/// Returns [`PipelineError::InvalidGridGeometry`] or
/// [`PipelineError::InvalidConfig`] for unusable inputs, checked before
/// any stage runs, and [`PipelineError::ExternalService`] if the
/// vectorizer fails.
pub fn process(
    height: Grid<f64>,
    clip: Option<Grid<f64>>,
    config: &PipelineConfig,
) -> Result<ProcessResult, PipelineError> {
    Ok(Pipeline::new(height, clip, config.clone())?
        .prepare()
        .detect_maxima()
        .allocate()
        .route_flow()
        .delineate_watersheds()
        .validate()
        .extract_regions()?
        .into_result())
}
