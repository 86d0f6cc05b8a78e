//! SVG preview serializer.
//!
//! Draws crown polygons and tree tops over a dark background using the
//! [`svg`] crate for document construction, XML escaping, and path data
//! formatting.
//!
//! The `viewBox` is the grid itself: one user unit per cell, `y` growing
//! downwards with the rows. Ground coordinates are mapped back into that
//! space, so the preview lines up with a raster view of the input.
//!
//! Each crown part becomes a filled `<path>` (exterior and holes as
//! closed subpaths, `evenodd` fill), coloured by tree id. Each tree top
//! becomes a `<circle>`. Both carry a `data-tree-id` attribute.
//!
//! This is a pure function with no I/O -- it returns a `String`.

use svg::Document;
use svg::node::element::path::Data;
use svg::node::element::{Circle, Description, Element, Group, Path, Rectangle, Title};
use svg::node::{Node, Text, Value};

use crown_pipeline::{CrownPolygon, GridGeometry, Label, Marker};
use geo::{Coord, LineString, Polygon};

/// Fill colours cycled through by tree id.
const CROWN_COLORS: &[&str] = &[
    "#e6550d", "#31a354", "#3182bd", "#d6616b", "#8c6d31", "#756bb1", "#e7ba52", "#17becf",
];

/// Tree-top circle radius in cells.
const TREE_TOP_RADIUS: f64 = 0.35;

/// Metadata to embed in the SVG document.
///
/// All fields are optional. When present, a `<title>`, `<desc>` and/or
/// `<metadata>` element is emitted immediately after the opening
/// `<svg>` tag.
///
/// Text values are XML-escaped automatically by the `svg` crate.
#[derive(Debug, Clone, Default)]
pub struct SvgMetadata<'a> {
    /// Document title, emitted as `<title>`.
    ///
    /// Typically the input raster's file name.
    pub title: Option<&'a str>,

    /// Document description, emitted as `<desc>`.
    pub description: Option<&'a str>,

    /// Serialized pipeline configuration, emitted as the text of a
    /// `<metadata>` element so previews record the settings that made
    /// them.
    pub config_json: Option<&'a str>,
}

/// Colour for a tree id.
fn crown_color(tree_id: Label) -> &'static str {
    CROWN_COLORS[tree_id as usize % CROWN_COLORS.len()]
}

/// Map a ground coordinate into grid (column, row) space.
fn to_view(geometry: &GridGeometry, c: Coord<f64>) -> (f64, f64) {
    (
        (c.x - geometry.origin_x) / geometry.cell_size,
        (geometry.origin_y - c.y) / geometry.cell_size,
    )
}

fn append_ring(mut data: Data, ring: &LineString<f64>, geometry: &GridGeometry) -> Data {
    let coords = ring.0.as_slice();
    // Closed rings repeat the first coordinate; `z` closes instead.
    let open = match coords {
        [first, rest @ .., last] if first == last => &coords[..=rest.len()],
        _ => coords,
    };
    let Some((first, rest)) = open.split_first() else {
        return data;
    };
    if rest.is_empty() {
        return data;
    }
    data = data.move_to(to_view(geometry, *first));
    for c in rest {
        data = data.line_to(to_view(geometry, *c));
    }
    data.close()
}

/// Build an SVG path `d` attribute string for a crown polygon.
///
/// The exterior and every hole become closed subpaths. Returns an empty
/// string for a polygon whose exterior has fewer than 2 distinct points.
#[must_use]
pub fn build_path_data(polygon: &Polygon<f64>, geometry: &GridGeometry) -> String {
    let mut data = append_ring(Data::new(), polygon.exterior(), geometry);
    if data.is_empty() {
        return String::new();
    }
    for hole in polygon.interiors() {
        data = append_ring(data, hole, geometry);
    }
    String::from(Value::from(data))
}

/// Serialize crowns and tree tops into an SVG preview document.
///
/// `geometry` is the grid the results came from; it fixes the document
/// size and the mapping from ground coordinates.
#[must_use]
pub fn to_svg(
    geometry: &GridGeometry,
    crowns: &[CrownPolygon],
    markers: &[Marker],
    metadata: &SvgMetadata<'_>,
) -> String {
    let (w, h) = (geometry.width, geometry.height);
    let mut doc = Document::new()
        .set("width", w.to_string())
        .set("height", h.to_string())
        .set("viewBox", format!("0 0 {w} {h}"));

    if let Some(title) = metadata.title {
        doc = doc.add(Title::new(title));
    }
    if let Some(description) = metadata.description {
        doc = doc.add(Description::new().add(Text::new(description)));
    }
    if let Some(config_json) = metadata.config_json {
        let mut metadata_el = Element::new("metadata");
        metadata_el.append(Text::new(config_json));
        doc = doc.add(metadata_el);
    }

    doc = doc.add(
        Rectangle::new()
            .set("width", w.to_string())
            .set("height", h.to_string())
            .set("fill", "#1a1a1a"),
    );

    let mut crown_group = Group::new()
        .set("id", "crowns")
        .set("fill-rule", "evenodd")
        .set("fill-opacity", 0.6)
        .set("stroke", "white")
        .set("stroke-width", 0.1);
    for crown in crowns {
        let d = build_path_data(&crown.polygon, geometry);
        if d.is_empty() {
            continue;
        }
        crown_group = crown_group.add(
            Path::new()
                .set("d", d)
                .set("fill", crown_color(crown.tree_id))
                .set("data-tree-id", crown.tree_id),
        );
    }
    doc = doc.add(crown_group);

    let mut top_group = Group::new()
        .set("id", "tree-tops")
        .set("fill", "white")
        .set("stroke", "black")
        .set("stroke-width", 0.05);
    for marker in markers {
        let (cx, cy) = to_view(geometry, Coord { x: marker.x, y: marker.y });
        top_group = top_group.add(
            Circle::new()
                .set("cx", cx)
                .set("cy", cy)
                .set("r", TREE_TOP_RADIUS)
                .set("data-tree-id", marker.id),
        );
    }
    doc = doc.add(top_group);

    // The svg crate omits the XML declaration, so we prepend it.
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{doc}\n")
}
