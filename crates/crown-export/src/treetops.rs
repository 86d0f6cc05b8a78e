//! Tree-top point table as CSV.
//!
//! One row per marker, in id order: `id,row,col,x,y,height`. Coordinates
//! are cell centres in the grid's ground units; heights are the
//! converted canopy heights the markers were detected on.

use crown_pipeline::{Label, Marker};
use serde::Serialize;

use crate::ExportError;

#[derive(Serialize)]
struct TreeTopRecord {
    id: Label,
    row: usize,
    col: usize,
    x: f64,
    y: f64,
    height: f64,
}

impl From<&Marker> for TreeTopRecord {
    fn from(m: &Marker) -> Self {
        Self {
            id: m.id,
            row: m.row,
            col: m.col,
            x: m.x,
            y: m.y,
            height: m.height,
        }
    }
}

/// Serialize tree tops into a CSV document with a header row.
///
/// An empty slice yields just the header.
///
/// # Errors
///
/// Returns [`ExportError::Csv`] if a record cannot be written.
pub fn to_treetops_csv(markers: &[Marker]) -> Result<String, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if markers.is_empty() {
        writer.write_record(["id", "row", "col", "x", "y", "height"])?;
    }
    for marker in markers {
        writer.serialize(TreeTopRecord::from(marker))?;
    }
    let bytes = writer.into_inner().map_err(|e| ExportError::Io(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
