//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! These diagnostics are permanent instrumentation intended for parameter
//! tuning on real canopy grids. [`process_with_diagnostics`] runs the
//! same stages as [`process`](crate::process) and records how long each
//! took and what it produced.
//!
//! The crate never reads a clock itself. Callers supply a [`Clock`], so
//! the pipeline stays free of platform timing concerns and tests can use
//! a fake one.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flow::FlatRouting;
use crate::grid::Grid;
use crate::pipeline::{Pipeline, PipelineStage};
use crate::types::{PipelineConfig, PipelineError, ProcessResult, Window};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Source of timestamps for stage timing.
pub trait Clock {
    /// Opaque timestamp.
    type Instant;

    /// The current time.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Stage 1: clip, smoothing, unit conversion, minimum-height mask.
    pub prepare: StageDiagnostics,
    /// Stage 2: tree-top detection.
    pub maxima: StageDiagnostics,
    /// Stage 3: nearest-marker allocation.
    pub allocation: StageDiagnostics,
    /// Stage 4: surface inversion and flow routing.
    pub flow_routing: StageDiagnostics,
    /// Stage 5: watershed delineation.
    pub watershed: StageDiagnostics,
    /// Stage 6: agreement and height rules.
    pub validation: StageDiagnostics,
    /// Stage 7: polygon extraction.
    pub region_extraction: StageDiagnostics,
    /// Total wall-clock duration of the entire pipeline (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Surface preparation.
    Prepare {
        /// Cells with a height after clipping.
        valid_cells: usize,
        /// Mean smoothing window, if smoothing ran.
        smoothing_window: Option<Window>,
        /// Unit conversion factor, if conversion ran.
        conversion_factor: Option<f64>,
        /// Highest prepared height.
        max_height: Option<f64>,
        /// Cells at or above the minimum tree height.
        candidate_cells: usize,
    },
    /// Tree-top detection.
    Maxima {
        /// Focal maximum window.
        window: Window,
        /// Number of markers found.
        marker_count: usize,
    },
    /// Nearest-marker allocation.
    Allocation {
        /// Allocation radius in ground units.
        radius: f64,
        /// Cells within the radius of some marker.
        allocated_cells: usize,
    },
    /// Flow routing.
    FlowRouting {
        /// Flat handling in effect.
        flat_routing: FlatRouting,
        /// Cells with no downhill neighbour.
        sink_count: usize,
    },
    /// Watershed delineation.
    Watershed {
        /// Cells that drain into a tree top.
        labelled_cells: usize,
        /// Flow cycles recovered.
        cycle_count: usize,
    },
    /// Segmentation validation.
    Validation {
        /// Cells kept in the final segmentation.
        kept_cells: usize,
        /// Watershed cells the rules rejected.
        rejected_cells: usize,
    },
    /// Polygon extraction.
    RegionExtraction {
        /// Which vectorizer was used.
        strategy: String,
        /// Crown polygons produced.
        polygon_count: usize,
        /// Exterior ring vertices across all polygons.
        vertex_count: usize,
    },
}

/// High-level summary counts for the entire pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Grid width in cells.
    pub width: usize,
    /// Grid height in cells.
    pub height: usize,
    /// Cell side length in ground units.
    pub cell_size: f64,
    /// Trees detected.
    pub tree_count: usize,
    /// Cells assigned to a crown.
    pub segmented_cells: usize,
    /// Crown polygons produced.
    pub crown_count: usize,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Grid: {}x{} cells of {} units",
            self.summary.width, self.summary.height, self.summary.cell_size,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        let stages = [
            ("Prepare", &self.prepare),
            ("Maxima", &self.maxima),
            ("Allocation", &self.allocation),
            ("Flow Routing", &self.flow_routing),
            ("Watershed", &self.watershed),
            ("Validation", &self.validation),
            ("Region Extraction", &self.region_extraction),
        ];

        for (name, diag) in stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Trees: {}  |  Segmented cells: {}  |  Crowns: {}",
            self.summary.tree_count, self.summary.segmented_cells, self.summary.crown_count,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Prepare {
            valid_cells,
            smoothing_window,
            conversion_factor,
            max_height,
            candidate_cells,
        } => {
            let smoothing = smoothing_window.map_or_else(|| "off".to_string(), |w| w.to_string());
            let factor = conversion_factor.map_or_else(|| "off".to_string(), |f| format!("x{f}"));
            let max = max_height.map_or_else(|| "-".to_string(), |h| format!("{h:.2}"));
            format!(
                "{valid_cells} cells, smooth={smoothing} convert={factor} max={max}, {candidate_cells} candidates",
            )
        }
        StageMetrics::Maxima {
            window,
            marker_count,
        } => format!("window={window} markers={marker_count}"),
        StageMetrics::Allocation {
            radius,
            allocated_cells,
        } => format!("radius={radius} allocated={allocated_cells}"),
        StageMetrics::FlowRouting {
            flat_routing,
            sink_count,
        } => format!("flats={flat_routing:?} sinks={sink_count}"),
        StageMetrics::Watershed {
            labelled_cells,
            cycle_count,
        } => format!("labelled={labelled_cells} cycles={cycle_count}"),
        StageMetrics::Validation {
            kept_cells,
            rejected_cells,
        } => format!("kept={kept_cells} rejected={rejected_cells}"),
        StageMetrics::RegionExtraction {
            strategy,
            polygon_count,
            vertex_count,
        } => format!("{strategy} {polygon_count} polygons, {vertex_count} vertices"),
    }
}

/// Run `stage` through `advance`, timing it and reading its metrics.
fn timed<S, T, C>(
    clock: &C,
    stage: S,
    advance: impl FnOnce(S) -> Result<T, PipelineError>,
) -> Result<(T, StageDiagnostics), PipelineError>
where
    T: PipelineStage,
    C: Clock,
{
    let start = clock.now();
    let next = advance(stage)?;
    let duration = clock.elapsed(&start);
    let metrics = next.metrics().ok_or_else(|| {
        PipelineError::ExternalService(format!("stage {} reported no metrics", T::NAME))
    })?;
    Ok((next, StageDiagnostics { duration, metrics }))
}

/// Run the full pipeline and collect per-stage diagnostics.
///
/// # Errors
///
/// Returns the same errors as [`process`](crate::process).
pub fn process_with_diagnostics<C: Clock>(
    height: Grid<f64>,
    clip: Option<Grid<f64>>,
    config: &PipelineConfig,
    clock: &C,
) -> Result<(ProcessResult, PipelineDiagnostics), PipelineError> {
    let start = clock.now();
    let pending = Pipeline::new(height, clip, config.clone())?;

    let (prepared, prepare) = timed(clock, pending, |s| Ok(s.prepare()))?;
    let (detected, maxima) = timed(clock, prepared, |s| Ok(s.detect_maxima()))?;
    let (allocated, allocation) = timed(clock, detected, |s| Ok(s.allocate()))?;
    let (routed, flow_routing) = timed(clock, allocated, |s| Ok(s.route_flow()))?;
    let (delineated, watershed) = timed(clock, routed, |s| Ok(s.delineate_watersheds()))?;
    let (validated, validation) = timed(clock, delineated, |s| Ok(s.validate()))?;
    let (extracted, region_extraction) = timed(clock, validated, |s| s.extract_regions())?;

    let result = extracted.into_result();
    let geometry = result.height.geometry();
    let summary = PipelineSummary {
        width: geometry.width,
        height: geometry.height,
        cell_size: geometry.cell_size,
        tree_count: result.status.tree_count(),
        segmented_cells: result.segmentation.valid_count(),
        crown_count: result.crowns.len(),
    };

    let diagnostics = PipelineDiagnostics {
        prepare,
        maxima,
        allocation,
        flow_routing,
        watershed,
        validation,
        region_extraction,
        total_duration: clock.elapsed(&start),
        summary,
    };
    Ok((result, diagnostics))
}
