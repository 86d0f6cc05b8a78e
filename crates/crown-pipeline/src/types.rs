//! Shared types for the crown segmentation pipeline.

use serde::{Deserialize, Serialize};

use crate::flow::FlatRouting;
use crate::grid::{Grid, Label};
use crate::region::{CrownPolygon, VectorizeOptions, VectorizerKind};
use crate::watershed::FlowCycle;

/// An odd-sized rectangular neighbourhood, in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Window height in cells (odd).
    pub rows: usize,
    /// Window width in cells (odd).
    pub cols: usize,
}

impl Window {
    /// A `size x size` window.
    #[must_use]
    pub const fn square(size: usize) -> Self {
        Self {
            rows: size,
            cols: size,
        }
    }

    /// Rows on each side of the centre cell.
    #[must_use]
    pub const fn half_rows(self) -> usize {
        self.rows / 2
    }

    /// Columns on each side of the centre cell.
    #[must_use]
    pub const fn half_cols(self) -> usize {
        self.cols / 2
    }

    /// Reject windows that have no centre cell.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if either side is zero or
    /// even. `name` identifies the offending option in the message.
    pub fn validate(self, name: &str) -> Result<(), PipelineError> {
        if self.rows % 2 == 0 || self.cols % 2 == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "{name} must have odd, non-zero sides, got {}x{}",
                self.rows, self.cols
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// A candidate tree apex found by the maxima detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// Tree id, 1-based, assigned in row-major scan order.
    pub id: Label,
    /// Source cell row.
    pub row: usize,
    /// Source cell column.
    pub col: usize,
    /// Ground x of the cell centre.
    pub x: f64,
    /// Ground y of the cell centre.
    pub y: f64,
    /// Canopy height at the apex, in converted units.
    pub height: f64,
}

/// Configuration for the crown segmentation pipeline.
///
/// Every empirical constant is exposed as a field with a named default
/// (`PipelineConfig::DEFAULT_*`). Missing fields fall back to those
/// defaults when deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Mean pre-smoothing window; `None` disables smoothing.
    pub smoothing_window: Option<Window>,

    /// Factor applied to every height (e.g. metres to feet); `None`
    /// leaves heights unchanged.
    pub height_conversion_factor: Option<f64>,

    /// Cells lower than this (converted units) cannot hold a tree top.
    pub min_tree_height: f64,

    /// Window of the focal maximum used for tree-top detection.
    pub maxima_window: Window,

    /// Largest ground distance a cell may be from its allocated tree top.
    pub allocation_radius: f64,

    /// Rule A: reject a cell when `distance * cell_size * coefficient`
    /// exceeds its height.
    pub rule_a_coefficient: f64,

    /// Rule B: reject a cell lower than `coefficient * apex height` of
    /// its tree.
    pub rule_b_coefficient: f64,

    /// Constant the height surface is subtracted from before flow
    /// routing. Must exceed the highest converted height.
    pub inversion_constant: f64,

    /// How flow routing treats cells with no strictly lower neighbour.
    pub flat_routing: FlatRouting,

    /// Which vectorizer turns the segmentation into polygons.
    pub vectorizer: VectorizerKind,

    /// Simplification, filtering and smoothing of crown polygons.
    pub vectorize: VectorizeOptions,
}

impl PipelineConfig {
    /// Default mean pre-smoothing window, when smoothing is enabled.
    pub const DEFAULT_SMOOTHING_WINDOW: Window = Window::square(3);
    /// Default metres-to-feet factor, when conversion is enabled.
    pub const DEFAULT_HEIGHT_CONVERSION_FACTOR: f64 = 3.281;
    /// Default minimum tree height.
    pub const DEFAULT_MIN_TREE_HEIGHT: f64 = 5.0;
    /// Default tree-top detection window.
    pub const DEFAULT_MAXIMA_WINDOW: Window = Window::square(5);
    /// Default allocation radius in ground units.
    pub const DEFAULT_ALLOCATION_RADIUS: f64 = 40.0;
    /// Default Rule A coefficient.
    pub const DEFAULT_RULE_A_COEFFICIENT: f64 = 0.6;
    /// Default Rule B coefficient.
    pub const DEFAULT_RULE_B_COEFFICIENT: f64 = 0.3;
    /// Default surface inversion constant.
    pub const DEFAULT_INVERSION_CONSTANT: f64 = 1000.0;

    /// Check option values that do not depend on the input grid.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] describing the first
    /// offending option.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let Some(window) = self.smoothing_window {
            window.validate("smoothing_window")?;
        }
        self.maxima_window.validate("maxima_window")?;
        if let Some(factor) = self.height_conversion_factor
            && (!factor.is_finite() || factor <= 0.0)
        {
            return Err(PipelineError::InvalidConfig(format!(
                "height_conversion_factor must be positive, got {factor}"
            )));
        }
        if !self.min_tree_height.is_finite() {
            return Err(PipelineError::InvalidConfig(format!(
                "min_tree_height must be finite, got {}",
                self.min_tree_height
            )));
        }
        if !self.allocation_radius.is_finite() || self.allocation_radius <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "allocation_radius must be positive, got {}",
                self.allocation_radius
            )));
        }
        for (name, value) in [
            ("rule_a_coefficient", self.rule_a_coefficient),
            ("rule_b_coefficient", self.rule_b_coefficient),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if !self.inversion_constant.is_finite() {
            return Err(PipelineError::InvalidConfig(format!(
                "inversion_constant must be finite, got {}",
                self.inversion_constant
            )));
        }
        self.vectorize.validate()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            smoothing_window: None,
            height_conversion_factor: None,
            min_tree_height: Self::DEFAULT_MIN_TREE_HEIGHT,
            maxima_window: Self::DEFAULT_MAXIMA_WINDOW,
            allocation_radius: Self::DEFAULT_ALLOCATION_RADIUS,
            rule_a_coefficient: Self::DEFAULT_RULE_A_COEFFICIENT,
            rule_b_coefficient: Self::DEFAULT_RULE_B_COEFFICIENT,
            inversion_constant: Self::DEFAULT_INVERSION_CONSTANT,
            flat_routing: FlatRouting::default(),
            vectorizer: VectorizerKind::default(),
            vectorize: VectorizeOptions::default(),
        }
    }
}

/// Overall outcome of tree detection.
///
/// Empty outcomes are not errors: a clip that removes everything and a
/// canopy too low to hold a tree are both valid answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionStatus {
    /// The clipped height grid holds no valid cell.
    AllBackground,
    /// Height data exists but no cell qualifies as a tree top.
    NoMarkers,
    /// At least one tree top was found.
    Trees {
        /// Number of tree tops.
        count: usize,
    },
}

impl DetectionStatus {
    /// Number of trees found (zero for the empty outcomes).
    #[must_use]
    pub const fn tree_count(self) -> usize {
        match self {
            Self::AllBackground | Self::NoMarkers => 0,
            Self::Trees { count } => count,
        }
    }
}

/// Result of running the full pipeline.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Clipped, smoothed and converted canopy heights.
    pub height: Grid<f64>,
    /// Detected tree tops in id order.
    pub markers: Vec<Marker>,
    /// Final per-cell tree id (crown membership).
    pub segmentation: Grid<Label>,
    /// Crown polygons tagged with tree id and height.
    pub crowns: Vec<CrownPolygon>,
    /// Whether any trees were found, and why not.
    pub status: DetectionStatus,
    /// Flow cycles recovered during watershed resolution.
    pub flow_cycles: Vec<FlowCycle>,
}

/// Errors that abort a pipeline run.
///
/// Empty inputs and flow cycles are reported through
/// [`DetectionStatus`] and [`FlowCycle`] instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// Grids do not share a geometry, a grid is empty, or the inversion
    /// constant does not exceed the highest height.
    #[error("invalid grid geometry: {0}")]
    InvalidGridGeometry(String),

    /// A configuration option is out of range.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// A collaborator (vectorizer, reader, writer) failed.
    #[error("external service failed: {0}")]
    ExternalService(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn default_constants_match_fields() {
        let config = PipelineConfig::default();
        assert_eq!(config.maxima_window, Window::square(5));
        assert!((config.allocation_radius - 40.0).abs() < f64::EPSILON);
        assert!((config.rule_a_coefficient - 0.6).abs() < f64::EPSILON);
        assert!((config.rule_b_coefficient - 0.3).abs() < f64::EPSILON);
        assert!((config.inversion_constant - 1000.0).abs() < f64::EPSILON);
        assert_eq!(config.smoothing_window, None);
        assert_eq!(config.height_conversion_factor, None);
    }

    #[test]
    fn even_window_rejected() {
        let config = PipelineConfig {
            maxima_window: Window { rows: 4, cols: 5 },
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_window_rejected() {
        let config = PipelineConfig {
            smoothing_window: Some(Window::square(0)),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_radius_rejected() {
        let config = PipelineConfig {
            allocation_radius: -1.0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_json_round_trip_with_missing_fields() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"min_tree_height": 12.5, "smoothing_window": {"rows": 3, "cols": 3}}"#)
                .unwrap();
        assert!((config.min_tree_height - 12.5).abs() < f64::EPSILON);
        assert_eq!(config.smoothing_window, Some(Window::square(3)));
        assert_eq!(config.maxima_window, PipelineConfig::DEFAULT_MAXIMA_WINDOW);
    }

    #[test]
    fn status_tree_count() {
        assert_eq!(DetectionStatus::AllBackground.tree_count(), 0);
        assert_eq!(DetectionStatus::NoMarkers.tree_count(), 0);
        assert_eq!(DetectionStatus::Trees { count: 3 }.tree_count(), 3);
    }

    #[test]
    fn window_display() {
        assert_eq!(Window { rows: 3, cols: 5 }.to_string(), "3x5");
    }
}
