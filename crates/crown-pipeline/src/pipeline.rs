//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate grid before continuing.
//!
//! Unlike [`crate::process`] which runs the entire pipeline in one call,
//! [`Pipeline`] lets the caller drive execution one step at a time:
//!
//! ```rust
//! # use crown_pipeline::{Grid, GridGeometry, Pipeline, PipelineConfig, PipelineError};
//! # fn run(height: Grid<f64>) -> Result<(), PipelineError> {
//! let validated = Pipeline::new(height, None, PipelineConfig::default())?
//!     .prepare()
//!     .detect_maxima()
//!     .allocate()
//!     .route_flow()
//!     .delineate_watersheds()
//!     .validate();
//!
//! println!("{} trees", validated.markers().len());
//! let result = validated.extract_regions()?.into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline state,
//! carrying forward the intermediates later stages still need. Grids a
//! later stage no longer reads (the minimum-height mask, the inverted
//! surface, the flow field) are dropped as soon as they are consumed.
//!
//! All input checks happen in [`Pipeline::new`]; once a [`Pending`]
//! exists, only the vectorizer can fail.

use log::info;

use crate::allocation::{Allocation, allocate};
use crate::diagnostics::StageMetrics;
use crate::flow::{Flow, route_flow};
use crate::focal::focal_mean;
use crate::grid::{Grid, Label};
use crate::maxima::detect_maxima;
use crate::region::{CrownPolygon, RegionVectorizer, extract_regions};
use crate::surface::{clip, convert_units, invert, mask_below, restrict_to};
use crate::types::{DetectionStatus, Marker, PipelineConfig, PipelineError, ProcessResult};
use crate::validate::{ValidationRules, validate_segments};
use crate::watershed::{WatershedOutcome, delineate};

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Call [`prepare`](Self::prepare) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing: call .prepare() to continue"]
pub struct Pending {
    config: PipelineConfig,
    height: Grid<f64>,
    clip: Option<Grid<f64>>,
}

impl Pending {
    /// The input canopy height grid.
    #[must_use]
    pub const fn height(&self) -> &Grid<f64> {
        &self.height
    }

    /// The clip mask, if one was supplied.
    #[must_use]
    pub const fn clip(&self) -> Option<&Grid<f64>> {
        self.clip.as_ref()
    }

    /// Clip, smooth and convert the surface, then mask it to the minimum
    /// tree height.
    pub fn prepare(self) -> Prepared {
        let Self {
            config,
            height,
            clip: mask,
        } = self;

        let clipped = match mask {
            Some(mask) => clip(&height, &mask),
            None => height,
        };
        let smoothed = match config.smoothing_window {
            Some(window) => restrict_to(&focal_mean(&clipped, window), &clipped),
            None => clipped,
        };
        let height = match config.height_conversion_factor {
            Some(factor) => convert_units(&smoothed, factor),
            None => smoothed,
        };
        let masked = mask_below(&height, config.min_tree_height);

        Prepared {
            config,
            height,
            masked,
        }
    }
}

// ───────────────────────── Stage 1: Prepared ─────────────────────────

/// Pipeline state after surface preparation.
///
/// Call [`detect_maxima`](Self::detect_maxima) to advance.
#[must_use = "pipeline stages are consumed by advancing: call .detect_maxima() to continue"]
pub struct Prepared {
    config: PipelineConfig,
    height: Grid<f64>,
    masked: Grid<f64>,
}

impl Prepared {
    /// Clipped, smoothed and converted heights.
    #[must_use]
    pub const fn height(&self) -> &Grid<f64> {
        &self.height
    }

    /// Heights with cells below the minimum tree height nulled out.
    #[must_use]
    pub const fn masked(&self) -> &Grid<f64> {
        &self.masked
    }

    /// Find tree tops in the masked surface.
    pub fn detect_maxima(self) -> MaximaDetected {
        let markers = detect_maxima(&self.masked, self.config.maxima_window);
        MaximaDetected {
            config: self.config,
            height: self.height,
            markers,
        }
    }
}

// ───────────────────────── Stage 2: MaximaDetected ───────────────────

/// Pipeline state after tree-top detection.
///
/// Call [`allocate`](Self::allocate) to advance.
#[must_use = "pipeline stages are consumed by advancing: call .allocate() to continue"]
pub struct MaximaDetected {
    config: PipelineConfig,
    height: Grid<f64>,
    markers: Vec<Marker>,
}

impl MaximaDetected {
    /// Detected tree tops in id order.
    #[must_use]
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Allocate every cell to its nearest tree top.
    pub fn allocate(self) -> Allocated {
        let allocation = allocate(
            self.height.geometry(),
            &self.markers,
            self.config.allocation_radius,
        );
        Allocated {
            config: self.config,
            height: self.height,
            markers: self.markers,
            allocation,
        }
    }
}

// ───────────────────────── Stage 3: Allocated ────────────────────────

/// Pipeline state after nearest-marker allocation.
///
/// Call [`route_flow`](Self::route_flow) to advance.
#[must_use = "pipeline stages are consumed by advancing: call .route_flow() to continue"]
pub struct Allocated {
    config: PipelineConfig,
    height: Grid<f64>,
    markers: Vec<Marker>,
    allocation: Allocation,
}

impl Allocated {
    /// Nearest-marker labels and distances.
    #[must_use]
    pub const fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Invert the surface and compute flow directions on it.
    pub fn route_flow(self) -> FlowRouted {
        let inverted = invert(&self.height, self.config.inversion_constant);
        let flow = route_flow(&inverted, self.config.flat_routing);
        FlowRouted {
            config: self.config,
            height: self.height,
            markers: self.markers,
            allocation: self.allocation,
            inverted,
            flow,
        }
    }
}

// ───────────────────────── Stage 4: FlowRouted ───────────────────────

/// Pipeline state after flow routing.
///
/// Call [`delineate_watersheds`](Self::delineate_watersheds) to advance.
#[must_use = "pipeline stages are consumed by advancing: call .delineate_watersheds() to continue"]
pub struct FlowRouted {
    config: PipelineConfig,
    height: Grid<f64>,
    markers: Vec<Marker>,
    allocation: Allocation,
    inverted: Grid<f64>,
    flow: Grid<Flow>,
}

impl FlowRouted {
    /// The inverted surface flow was routed over.
    #[must_use]
    pub const fn inverted(&self) -> &Grid<f64> {
        &self.inverted
    }

    /// Per-cell flow direction.
    #[must_use]
    pub const fn flow(&self) -> &Grid<Flow> {
        &self.flow
    }

    /// Resolve every cell to the tree top it drains into.
    pub fn delineate_watersheds(self) -> Delineated {
        let watershed = delineate(&self.flow, &self.markers, &self.allocation.labels);
        Delineated {
            config: self.config,
            height: self.height,
            markers: self.markers,
            allocation: self.allocation,
            watershed,
        }
    }
}

// ───────────────────────── Stage 5: Delineated ───────────────────────

/// Pipeline state after watershed delineation.
///
/// Call [`validate`](Self::validate) to advance.
#[must_use = "pipeline stages are consumed by advancing: call .validate() to continue"]
pub struct Delineated {
    config: PipelineConfig,
    height: Grid<f64>,
    markers: Vec<Marker>,
    allocation: Allocation,
    watershed: WatershedOutcome,
}

impl Delineated {
    /// Watershed labels and recovered flow cycles.
    #[must_use]
    pub const fn watershed(&self) -> &WatershedOutcome {
        &self.watershed
    }

    /// Apply the agreement and height rules.
    pub fn validate(self) -> Validated {
        let segmentation = validate_segments(
            &self.watershed.labels,
            &self.allocation,
            &self.height,
            &self.markers,
            ValidationRules::from_config(&self.config),
        );
        let rejected = self
            .watershed
            .labels
            .valid_count()
            .saturating_sub(segmentation.valid_count());
        Validated {
            config: self.config,
            height: self.height,
            markers: self.markers,
            watershed: self.watershed,
            segmentation,
            rejected,
        }
    }
}

// ───────────────────────── Stage 6: Validated ────────────────────────

/// Pipeline state holding the final segmentation.
///
/// Call [`extract_regions`](Self::extract_regions) to vectorize it.
#[must_use = "pipeline stages are consumed by advancing: call .extract_regions() to continue"]
pub struct Validated {
    config: PipelineConfig,
    height: Grid<f64>,
    markers: Vec<Marker>,
    watershed: WatershedOutcome,
    segmentation: Grid<Label>,
    rejected: usize,
}

impl Validated {
    /// Detected tree tops in id order.
    #[must_use]
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Final per-cell tree id.
    #[must_use]
    pub const fn segmentation(&self) -> &Grid<Label> {
        &self.segmentation
    }

    /// Vectorize with the configured vectorizer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ExternalService`] if vectorization fails.
    pub fn extract_regions(self) -> Result<Extracted, PipelineError> {
        let vectorizer = self.config.vectorizer;
        self.extract_regions_with(&vectorizer)
    }

    /// Vectorize with a caller-supplied vectorizer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ExternalService`] if vectorization fails.
    pub fn extract_regions_with(
        self,
        vectorizer: &dyn RegionVectorizer,
    ) -> Result<Extracted, PipelineError> {
        let crowns = extract_regions(
            &self.segmentation,
            &self.markers,
            vectorizer,
            self.config.vectorize,
        )?;
        Ok(Extracted {
            config: self.config,
            height: self.height,
            markers: self.markers,
            watershed: self.watershed,
            segmentation: self.segmentation,
            crowns,
        })
    }
}

// ───────────────────────── Stage 7: Extracted ────────────────────────

/// Final pipeline state: segmentation plus crown polygons.
#[must_use = "call .into_result() to obtain the pipeline output"]
pub struct Extracted {
    config: PipelineConfig,
    height: Grid<f64>,
    markers: Vec<Marker>,
    watershed: WatershedOutcome,
    segmentation: Grid<Label>,
    crowns: Vec<CrownPolygon>,
}

impl Extracted {
    /// Crown polygons tagged with tree id and height.
    #[must_use]
    pub fn crowns(&self) -> &[CrownPolygon] {
        &self.crowns
    }

    /// Whether trees were found.
    #[must_use]
    pub fn status(&self) -> DetectionStatus {
        if self.height.is_all_nodata() {
            DetectionStatus::AllBackground
        } else if self.markers.is_empty() {
            DetectionStatus::NoMarkers
        } else {
            DetectionStatus::Trees {
                count: self.markers.len(),
            }
        }
    }

    /// Consume the pipeline and return the [`ProcessResult`].
    pub fn into_result(self) -> ProcessResult {
        let status = self.status();
        info!(
            "detection: {status:?}, {} crown cells, {} crown polygons",
            self.segmentation.valid_count(),
            self.crowns.len()
        );
        ProcessResult {
            height: self.height,
            markers: self.markers,
            segmentation: self.segmentation,
            crowns: self.crowns,
            status,
            flow_cycles: self.watershed.cycles,
        }
    }
}

// ──────────────────── PipelineStage trait + StageOutput ────────────────

/// Total number of stages in the pipeline, `Pending` included.
pub const STAGE_COUNT: usize = 8;

/// The output produced by a single pipeline stage.
///
/// Each variant borrows the data that the corresponding stage computed.
#[must_use]
pub enum StageOutput<'a> {
    /// Unprocessed inputs.
    Source {
        /// Input heights.
        height: &'a Grid<f64>,
        /// Clip mask, if any.
        clip: Option<&'a Grid<f64>>,
    },
    /// Prepared surface.
    Prepared {
        /// Clipped, smoothed and converted heights.
        height: &'a Grid<f64>,
        /// Heights at or above the minimum tree height.
        masked: &'a Grid<f64>,
    },
    /// Tree tops.
    Maxima {
        /// Markers in id order.
        markers: &'a [Marker],
    },
    /// Nearest-marker allocation.
    Allocated {
        /// Labels and distances.
        allocation: &'a Allocation,
    },
    /// Flow field.
    FlowRouted {
        /// The inverted surface.
        inverted: &'a Grid<f64>,
        /// Flow directions over it.
        flow: &'a Grid<Flow>,
    },
    /// Watershed basins.
    Delineated {
        /// Labels and recovered cycles.
        watershed: &'a WatershedOutcome,
    },
    /// Final segmentation.
    Validated {
        /// Per-cell tree id.
        segmentation: &'a Grid<Label>,
    },
    /// Crown polygons.
    Extracted {
        /// Polygons tagged with tree id and height.
        crowns: &'a [CrownPolygon],
    },
}

/// Trait implemented by every pipeline stage.
///
/// Lets generic code (such as the diagnostics collector) name, index and
/// inspect any stage without knowing its concrete type.
pub trait PipelineStage: Sized {
    /// Human-readable name of this stage (e.g. `"maxima"`).
    const NAME: &str;

    /// Zero-based index of this stage (`0` for [`Pending`] through `7`
    /// for [`Extracted`]).
    const INDEX: usize;

    /// The output this stage produced.
    fn output(&self) -> StageOutput<'_>;

    /// Metrics describing the work done to reach this stage; `None` for
    /// [`Pending`].
    fn metrics(&self) -> Option<StageMetrics>;
}

impl PipelineStage for Pending {
    const NAME: &str = "source";
    const INDEX: usize = 0;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Source {
            height: &self.height,
            clip: self.clip.as_ref(),
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        None
    }
}

impl PipelineStage for Prepared {
    const NAME: &str = "prepare";
    const INDEX: usize = 1;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Prepared {
            height: &self.height,
            masked: &self.masked,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::Prepare {
            valid_cells: self.height.valid_count(),
            smoothing_window: self.config.smoothing_window,
            conversion_factor: self.config.height_conversion_factor,
            max_height: self.height.max_valid(),
            candidate_cells: self.masked.valid_count(),
        })
    }
}

impl PipelineStage for MaximaDetected {
    const NAME: &str = "maxima";
    const INDEX: usize = 2;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Maxima {
            markers: &self.markers,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::Maxima {
            window: self.config.maxima_window,
            marker_count: self.markers.len(),
        })
    }
}

impl PipelineStage for Allocated {
    const NAME: &str = "allocation";
    const INDEX: usize = 3;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Allocated {
            allocation: &self.allocation,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::Allocation {
            radius: self.config.allocation_radius,
            allocated_cells: self.allocation.labels.valid_count(),
        })
    }
}

impl PipelineStage for FlowRouted {
    const NAME: &str = "flow";
    const INDEX: usize = 4;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::FlowRouted {
            inverted: &self.inverted,
            flow: &self.flow,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::FlowRouting {
            flat_routing: self.config.flat_routing,
            sink_count: self
                .flow
                .as_slice()
                .iter()
                .filter(|f| **f == Flow::Sink)
                .count(),
        })
    }
}

impl PipelineStage for Delineated {
    const NAME: &str = "watershed";
    const INDEX: usize = 5;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Delineated {
            watershed: &self.watershed,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::Watershed {
            labelled_cells: self.watershed.labels.valid_count(),
            cycle_count: self.watershed.cycles.len(),
        })
    }
}

impl PipelineStage for Validated {
    const NAME: &str = "validate";
    const INDEX: usize = 6;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Validated {
            segmentation: &self.segmentation,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::Validation {
            kept_cells: self.segmentation.valid_count(),
            rejected_cells: self.rejected,
        })
    }
}

impl PipelineStage for Extracted {
    const NAME: &str = "regions";
    const INDEX: usize = 7;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Extracted {
            crowns: &self.crowns,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(StageMetrics::RegionExtraction {
            strategy: format!("{:?}", self.config.vectorizer),
            polygon_count: self.crowns.len(),
            vertex_count: self
                .crowns
                .iter()
                .map(|c| c.polygon.exterior().0.len())
                .sum(),
        })
    }
}

// ───────────────────────── Entry point ───────────────────────────────

/// Entry point for the incremental pipeline API.
pub struct Pipeline;

impl Pipeline {
    /// Check the inputs and create a pipeline ready to run.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidGridGeometry`] if the height grid
    /// is empty or has a bad cell size, if `clip` does not share its
    /// geometry, or if `config.inversion_constant` does not exceed the
    /// highest (clipped, converted) height. Returns
    /// [`PipelineError::InvalidConfig`] for out-of-range options.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        height: Grid<f64>,
        clip: Option<Grid<f64>>,
        config: PipelineConfig,
    ) -> Result<Pending, PipelineError> {
        height.geometry().validate()?;
        if let Some(mask) = &clip
            && mask.geometry() != height.geometry()
        {
            return Err(PipelineError::InvalidGridGeometry(format!(
                "clip mask geometry {:?} differs from height geometry {:?}",
                mask.geometry(),
                height.geometry()
            )));
        }
        config.validate()?;

        // Smoothing never raises the maximum, so the clipped maximum
        // bounds the prepared surface.
        let highest = clip
            .as_ref()
            .map_or_else(|| height.max_valid(), |mask| clip_max(&height, mask));
        if let Some(highest) = highest {
            let highest = highest * config.height_conversion_factor.unwrap_or(1.0);
            if config.inversion_constant <= highest {
                return Err(PipelineError::InvalidGridGeometry(format!(
                    "inversion constant {} must exceed the highest height {highest}",
                    config.inversion_constant
                )));
            }
        }

        Ok(Pending {
            config,
            height,
            clip,
        })
    }
}

/// Highest height inside the clip mask.
fn clip_max(height: &Grid<f64>, mask: &Grid<f64>) -> Option<f64> {
    height
        .as_slice()
        .iter()
        .zip(mask.as_slice())
        .filter(|&(h, m)| !h.is_nan() && !m.is_nan() && *m != 0.0)
        .map(|(&h, _)| h)
        .reduce(f64::max)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_precision_loss)]
mod tests {
    use super::*;
    use crate::grid::GridGeometry;
    use crate::types::Window;

    fn cone(size: usize, peak: f64) -> Grid<f64> {
        let centre = (size / 2) as f64;
        Grid::from_fn(GridGeometry::unit(size, size), |r, c| {
            let d = ((r as f64 - centre).powi(2) + (c as f64 - centre).powi(2)).sqrt();
            (peak - d).max(0.0)
        })
    }

    #[test]
    fn stages_advance_in_order() {
        let pending = Pipeline::new(cone(11, 20.0), None, PipelineConfig::default()).unwrap();
        assert_eq!(pending.height().width(), 11);

        let prepared = pending.prepare();
        assert_eq!(prepared.height().valid_count(), 121);
        let detected = prepared.detect_maxima();
        assert_eq!(detected.markers().len(), 1);
        assert_eq!((detected.markers()[0].row, detected.markers()[0].col), (5, 5));

        let allocated = detected.allocate();
        assert_eq!(allocated.allocation().labels.valid_count(), 121);
        let routed = allocated.route_flow();
        assert_eq!(routed.flow().value(5, 5), Flow::Sink);
        let delineated = routed.delineate_watersheds();
        assert!(delineated.watershed().cycles.is_empty());

        let validated = delineated.validate();
        assert_eq!(validated.segmentation().get(5, 5), Some(1));
        let extracted = validated.extract_regions().unwrap();
        assert_eq!(extracted.crowns().len(), 1);
        assert_eq!(extracted.status(), DetectionStatus::Trees { count: 1 });
    }

    #[test]
    fn validation_metrics_count_rejected_cells() {
        // 0.9 * 20 = 18: only the cells next to the apex survive Rule B.
        let config = PipelineConfig {
            rule_b_coefficient: 0.9,
            ..PipelineConfig::default()
        };
        let delineated = Pipeline::new(cone(11, 20.0), None, config)
            .unwrap()
            .prepare()
            .detect_maxima()
            .allocate()
            .route_flow()
            .delineate_watersheds();
        let labelled = delineated.watershed().labels.valid_count();
        let validated = delineated.validate();
        let kept = validated.segmentation().valid_count();
        assert!(kept > 0 && kept < labelled);
        assert_eq!(
            validated.metrics(),
            Some(StageMetrics::Validation {
                kept_cells: kept,
                rejected_cells: labelled - kept,
            })
        );

        let extracted = validated.extract_regions().unwrap();
        assert_eq!(extracted.into_result().segmentation.valid_count(), kept);
    }

    #[test]
    fn stage_indices_are_sequential() {
        let indices = [
            Pending::INDEX,
            Prepared::INDEX,
            MaximaDetected::INDEX,
            Allocated::INDEX,
            FlowRouted::INDEX,
            Delineated::INDEX,
            Validated::INDEX,
            Extracted::INDEX,
        ];
        assert_eq!(indices.len(), STAGE_COUNT);
        for (i, index) in indices.iter().enumerate() {
            assert_eq!(i, *index);
        }
    }

    #[test]
    fn pending_has_no_metrics() {
        let pending = Pipeline::new(cone(5, 10.0), None, PipelineConfig::default()).unwrap();
        assert!(pending.metrics().is_none());
        assert!(matches!(
            pending.output(),
            StageOutput::Source { clip: None, .. }
        ));
        assert!(pending.prepare().metrics().is_some());
    }

    #[test]
    fn mismatched_clip_rejected() {
        let clip = Grid::filled(GridGeometry::unit(4, 5), 1.0);
        let result = Pipeline::new(cone(5, 10.0), Some(clip), PipelineConfig::default());
        assert!(matches!(result, Err(PipelineError::InvalidGridGeometry(_))));
    }

    #[test]
    fn empty_grid_rejected() {
        let height = Grid::<f64>::nodata(GridGeometry::unit(0, 0));
        let result = Pipeline::new(height, None, PipelineConfig::default());
        assert!(matches!(result, Err(PipelineError::InvalidGridGeometry(_))));
    }

    #[test]
    fn inversion_constant_must_exceed_converted_heights() {
        let config = PipelineConfig {
            height_conversion_factor: Some(3.281),
            inversion_constant: 50.0,
            ..PipelineConfig::default()
        };
        // 20 * 3.281 > 50.
        let result = Pipeline::new(cone(5, 20.0), None, config.clone());
        assert!(matches!(result, Err(PipelineError::InvalidGridGeometry(_))));
        // 10 * 3.281 < 50.
        assert!(Pipeline::new(cone(5, 10.0), None, config).is_ok());
    }

    #[test]
    fn inversion_check_only_sees_clipped_cells() {
        let mut values = vec![1.0; 25];
        values[0] = 5000.0;
        let height = Grid::from_vec(GridGeometry::unit(5, 5), values).unwrap();
        let mut mask = vec![1.0; 25];
        mask[0] = 0.0;
        let clip = Grid::from_vec(GridGeometry::unit(5, 5), mask).unwrap();
        assert!(Pipeline::new(height, Some(clip), PipelineConfig::default()).is_ok());
    }

    #[test]
    fn invalid_config_rejected() {
        let config = PipelineConfig {
            maxima_window: Window::square(4),
            ..PipelineConfig::default()
        };
        let result = Pipeline::new(cone(5, 10.0), None, config);
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn smoothing_stays_inside_clip() {
        let height = Grid::filled(GridGeometry::unit(6, 6), 8.0);
        let clip = Grid::from_fn(GridGeometry::unit(6, 6), |_, c| if c < 3 { 1.0 } else { 0.0 });
        let config = PipelineConfig {
            smoothing_window: Some(PipelineConfig::DEFAULT_SMOOTHING_WINDOW),
            ..PipelineConfig::default()
        };
        let prepared = Pipeline::new(height, Some(clip), config).unwrap().prepare();
        assert_eq!(prepared.height().valid_count(), 18);
        assert_eq!(prepared.height().get(0, 3), None);
        assert_eq!(prepared.height().get(0, 2), Some(8.0));
    }

    #[test]
    fn conversion_applies_before_masking() {
        // 2 m = 6.562 ft: below a 5 m threshold, above a 5 ft one.
        let height = Grid::filled(GridGeometry::unit(3, 3), 2.0);
        let config = PipelineConfig {
            height_conversion_factor: Some(PipelineConfig::DEFAULT_HEIGHT_CONVERSION_FACTOR),
            min_tree_height: 5.0,
            ..PipelineConfig::default()
        };
        let prepared = Pipeline::new(height, None, config).unwrap().prepare();
        assert_eq!(prepared.masked().valid_count(), 9);
        assert!((prepared.height().value(1, 1) - 6.562).abs() < 1e-9);
    }
}
