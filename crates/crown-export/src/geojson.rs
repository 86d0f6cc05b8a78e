//! Crown polygons as a GeoJSON `FeatureCollection`.
//!
//! Each crown part becomes one `Polygon` feature whose properties carry
//! the tree id, the apex height and the part's planar area. A tree split
//! into several parts yields several features sharing a `tree_id`.
//! Coordinates are written untouched, in the grid's ground units.

use crown_pipeline::CrownPolygon;
use geo::{Area, LineString, Polygon};
use serde_json::{Value, json};

use crate::ExportError;

fn ring_coordinates(ring: &LineString<f64>) -> Value {
    Value::Array(ring.coords().map(|c| json!([c.x, c.y])).collect())
}

fn polygon_coordinates(polygon: &Polygon<f64>) -> Value {
    let mut rings = vec![ring_coordinates(polygon.exterior())];
    rings.extend(polygon.interiors().iter().map(ring_coordinates));
    Value::Array(rings)
}

fn feature(crown: &CrownPolygon) -> Value {
    json!({
        "type": "Feature",
        "properties": {
            "tree_id": crown.tree_id,
            "height": crown.height,
            "area": crown.polygon.unsigned_area(),
        },
        "geometry": {
            "type": "Polygon",
            "coordinates": polygon_coordinates(&crown.polygon),
        },
    })
}

/// Serialize crowns into a pretty-printed GeoJSON `FeatureCollection`.
///
/// # Errors
///
/// Returns [`ExportError::Json`] if serialization fails.
pub fn to_crowns_geojson(crowns: &[CrownPolygon]) -> Result<String, ExportError> {
    let collection = json!({
        "type": "FeatureCollection",
        "features": crowns.iter().map(feature).collect::<Vec<_>>(),
    });
    Ok(serde_json::to_string_pretty(&collection)?)
}
