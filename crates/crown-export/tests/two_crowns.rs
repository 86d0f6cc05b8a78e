//! Integration test: run a synthetic two-tree canopy through the full
//! pipeline and export tree tops, crowns and the preview.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_precision_loss)]

use std::path::PathBuf;

use crown_pipeline::{DetectionStatus, Grid, GridGeometry, PipelineConfig};

/// 40x30 grid with 0.5 m cells: a 24 m tree and an 18 m tree.
fn canopy() -> Grid<f64> {
    let geometry = GridGeometry {
        width: 40,
        height: 30,
        cell_size: 0.5,
        origin_x: 350_000.0,
        origin_y: 5_200_015.0,
    };
    let bump = |r: usize, c: usize, (pr, pc): (f64, f64), peak: f64| {
        let d2 = (r as f64 - pr).powi(2) + (c as f64 - pc).powi(2);
        peak * (-d2 / 30.0).exp()
    };
    Grid::from_fn(geometry, |r, c| {
        bump(r, c, (12.0, 11.0), 24.0).max(bump(r, c, (17.0, 28.0), 18.0))
    })
}

#[test]
fn synthetic_canopy_pipeline_to_exports() {
    let config = PipelineConfig::default();
    let result = crown_pipeline::process(canopy(), None, &config).expect("pipeline should succeed");

    eprintln!(
        "Pipeline found {} trees and {} crown parts",
        result.markers.len(),
        result.crowns.len()
    );
    assert_eq!(result.status, DetectionStatus::Trees { count: 2 });

    // Tree tops
    let csv = crown_export::to_treetops_csv(&result.markers).unwrap();
    let mut reader = csv::Reader::from_reader(csv.as_bytes());
    let headers: Vec<&str> = reader.headers().unwrap().iter().collect();
    assert_eq!(headers, ["id", "row", "col", "x", "y", "height"]);
    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(&rows[0][0], "1");
    assert_eq!((&rows[0][1], &rows[0][2]), ("12", "11"));
    assert_eq!((&rows[1][1], &rows[1][2]), ("17", "28"));
    let x: f64 = rows[0][3].parse().unwrap();
    assert!((x - 350_005.75).abs() < 1e-9);

    // Crowns
    let geojson = crown_export::to_crowns_geojson(&result.crowns).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&geojson).unwrap();
    let features = doc["features"].as_array().unwrap();
    assert!(!features.is_empty());
    for feature in features {
        let id = feature["properties"]["tree_id"].as_u64().unwrap();
        assert!(id == 1 || id == 2);
        assert!(feature["properties"]["area"].as_f64().unwrap() > 0.0);
    }

    // Preview
    let svg = crown_export::to_svg(
        result.height.geometry(),
        &result.crowns,
        &result.markers,
        &crown_export::SvgMetadata {
            title: Some("synthetic canopy"),
            ..crown_export::SvgMetadata::default()
        },
    );
    assert!(svg.contains("<svg"));
    assert!(svg.contains("<path"));
    assert_eq!(svg.matches("<circle").count(), 2);
    assert!(svg.contains("</svg>"));

    // Write the preview to the target directory so it can be inspected.
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf();
    let output_dir = workspace_root.join("target");
    std::fs::create_dir_all(&output_dir).unwrap();
    let output_path = output_dir.join("synthetic-canopy-crowns.svg");
    std::fs::write(&output_path, &svg).unwrap();
    eprintln!("SVG written to {output_path:?} ({} bytes)", svg.len());
}
