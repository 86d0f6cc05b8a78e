//! crown-export: Pure format serializers (sans-IO)
//!
//! Converts pipeline results into output formats: tree tops as CSV,
//! crowns as GeoJSON, and an SVG preview of crowns and tree tops.
//! Every function returns a `String`; writing it anywhere is the
//! caller's business.

pub mod geojson;
pub mod svg;
pub mod treetops;

pub use geojson::to_crowns_geojson;
pub use svg::{SvgMetadata, to_svg};
pub use treetops::to_treetops_csv;

/// Errors raised while serializing results.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// A CSV record could not be written.
    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),

    /// A JSON document could not be written.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Flushing an in-memory buffer failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
