//! crown-bench: CLI tool for crown segmentation runs and diagnostics.
//!
//! Runs the crown segmentation pipeline on a canopy height GeoTIFF with
//! configurable parameters, printing detailed per-stage diagnostics and
//! optionally writing the results. Useful for:
//!
//! - Tuning the tree-top window, minimum height and crown rules
//! - Comparing flat routing strategies (`sink` vs `drain`)
//! - Measuring per-stage durations to identify bottlenecks
//! - Producing the converted height raster, tree-top table and crowns
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin crown-bench -- [OPTIONS] <HEIGHT_PATH>
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use crown_pipeline::diagnostics::{Clock, PipelineDiagnostics};
use crown_pipeline::{FlatRouting, PipelineConfig, ProcessResult, VectorizeOptions, Window};
use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};
use log::{error, info};

/// Tree-top detection and crown delineation for canopy height grids.
///
/// Runs the segmentation pipeline on a single-band GeoTIFF and prints
/// per-stage timing and count diagnostics.
#[derive(Parser)]
#[command(name = "crown-bench", version)]
struct Cli {
    /// Path to the canopy height GeoTIFF.
    height_path: PathBuf,

    /// Clip mask GeoTIFF on the same grid; nodata or zero cells are
    /// excluded.
    #[arg(long)]
    clip: Option<PathBuf>,

    /// Apply mean pre-smoothing.
    #[arg(long)]
    smooth: bool,

    /// Side of the square smoothing window (odd).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SMOOTHING_WINDOW.rows)]
    smoothing_window: usize,

    /// Multiply heights by the conversion factor (e.g. metres to feet).
    #[arg(long)]
    convert_units: bool,

    /// Height conversion factor, used with `--convert-units`.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_HEIGHT_CONVERSION_FACTOR)]
    conversion_factor: f64,

    /// Lowest height, in converted units, that can hold a tree top.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MIN_TREE_HEIGHT)]
    min_tree_height: f64,

    /// Side of the square tree-top detection window (odd).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MAXIMA_WINDOW.rows)]
    maxima_window: usize,

    /// Largest ground distance from a cell to its tree top.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_ALLOCATION_RADIUS)]
    allocation_radius: f64,

    /// Rule A coefficient (distance against height).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_RULE_A_COEFFICIENT)]
    rule_a: f64,

    /// Rule B coefficient (fraction of apex height).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_RULE_B_COEFFICIENT)]
    rule_b: f64,

    /// Constant the heights are subtracted from before flow routing.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_INVERSION_CONSTANT)]
    inversion_constant: f64,

    /// How cells without a strictly lower neighbour are routed.
    #[arg(long, value_enum, default_value_t = Flats::Sink)]
    flat_routing: Flats,

    /// Weighted-area simplification tolerance for crown outlines, in ground units.
    #[arg(long, default_value_t = VectorizeOptions::DEFAULT_SIMPLIFY_TOLERANCE)]
    simplify_tolerance: f64,

    /// Smallest crown part area kept, in square ground units.
    #[arg(long, default_value_t = VectorizeOptions::DEFAULT_MIN_AREA)]
    min_area: f64,

    /// Chaikin smoothing passes over crown outlines.
    #[arg(long, default_value_t = VectorizeOptions::DEFAULT_SMOOTHING_ITERATIONS)]
    smoothing_iterations: usize,

    /// Write the prepared (clipped, smoothed, converted) heights as GeoTIFF.
    #[arg(long)]
    height_out: Option<PathBuf>,

    /// Write the crown segmentation as a label GeoTIFF.
    #[arg(long)]
    segmentation_out: Option<PathBuf>,

    /// Write tree tops as CSV.
    #[arg(long)]
    treetops: Option<PathBuf>,

    /// Write crown polygons as GeoJSON.
    #[arg(long)]
    crowns: Option<PathBuf>,

    /// Write an SVG preview of crowns and tree tops.
    #[arg(long)]
    svg: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,
}

/// Flat routing selection.
#[derive(Clone, Copy, ValueEnum)]
enum Flats {
    /// Cells without a strictly lower neighbour are sinks.
    Sink,
    /// Drain across flats to the first equal neighbour.
    Drain,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.  Otherwise, a config is
/// assembled from the individual flags.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(PipelineConfig {
        smoothing_window: cli.smooth.then(|| Window::square(cli.smoothing_window)),
        height_conversion_factor: cli.convert_units.then_some(cli.conversion_factor),
        min_tree_height: cli.min_tree_height,
        maxima_window: Window::square(cli.maxima_window),
        allocation_radius: cli.allocation_radius,
        rule_a_coefficient: cli.rule_a,
        rule_b_coefficient: cli.rule_b,
        inversion_constant: cli.inversion_constant,
        flat_routing: match cli.flat_routing {
            Flats::Sink => FlatRouting::Sink,
            Flats::Drain => FlatRouting::Drain,
        },
        vectorize: VectorizeOptions {
            simplify_tolerance: cli.simplify_tolerance,
            min_area: cli.min_area,
            smoothing_iterations: cli.smoothing_iterations,
        },
        ..PipelineConfig::default()
    })
}

fn init_logging() -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str("info")?.log_to_stderr().start()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _logger = match init_logging() {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let height = match crown_io::read_height_grid_path(&cli.height_path) {
        Ok(grid) => grid,
        Err(e) => {
            eprintln!("Error reading {}: {e}", cli.height_path.display());
            return ExitCode::FAILURE;
        }
    };
    let clip = match cli.clip.as_deref().map(crown_io::read_height_grid_path).transpose() {
        Ok(clip) => clip,
        Err(e) => {
            eprintln!("Error reading clip mask: {e}");
            return ExitCode::FAILURE;
        }
    };

    let geometry = *height.geometry();
    eprintln!(
        "Heights: {} ({}x{} cells, cell size {})",
        cli.height_path.display(),
        geometry.width,
        geometry.height,
        geometry.cell_size,
    );
    eprintln!("Config: {config:#?}");
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match crown_pipeline::diagnostics::process_with_diagnostics(
            height.clone(),
            clip.clone(),
            &config,
            &StdClock,
        ) {
            Ok((result, diagnostics)) => {
                if cli.json {
                    match serde_json::to_string_pretty(&diagnostics) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing diagnostics: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                }

                // Write outputs on the first run only.
                if run == 0 && !write_outputs(&cli, &config, &result) {
                    return ExitCode::FAILURE;
                }

                all_diagnostics.push(diagnostics);
            }
            Err(e) => {
                eprintln!("Pipeline error: {e}");
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    // Print summary when multiple runs.
    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Write every requested output. Returns `false` if any write failed;
/// each failure is logged and the remaining outputs are still attempted.
fn write_outputs(cli: &Cli, config: &PipelineConfig, result: &ProcessResult) -> bool {
    let mut ok = true;

    if let Some(ref path) = cli.height_out {
        ok &= report_write(path, "heights", crown_io::write_height_grid_path(path, &result.height));
    }
    if let Some(ref path) = cli.segmentation_out {
        ok &= report_write(
            path,
            "segmentation",
            crown_io::write_label_grid_path(path, &result.segmentation),
        );
    }
    if let Some(ref path) = cli.treetops {
        let written = crown_export::to_treetops_csv(&result.markers)
            .map_err(|e| e.to_string())
            .and_then(|csv| std::fs::write(path, csv).map_err(|e| e.to_string()));
        ok &= report_write(path, "tree tops", written);
    }
    if let Some(ref path) = cli.crowns {
        let written = crown_export::to_crowns_geojson(&result.crowns)
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
        ok &= report_write(path, "crowns", written);
    }
    if let Some(ref path) = cli.svg {
        let title = cli
            .height_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("crowns");
        let desc = format!("{} trees, {} crown parts", result.markers.len(), result.crowns.len());
        let config_json = serde_json::to_string(config).ok();
        let metadata = crown_export::SvgMetadata {
            title: Some(title),
            description: Some(&desc),
            config_json: config_json.as_deref(),
        };
        let svg = crown_export::to_svg(
            result.height.geometry(),
            &result.crowns,
            &result.markers,
            &metadata,
        );
        ok &= report_write(path, "SVG preview", std::fs::write(path, &svg));
    }

    ok
}

fn report_write<E: std::fmt::Display>(path: &Path, what: &str, written: Result<(), E>) -> bool {
    match written {
        Ok(()) => {
            info!("{what} written to {}", path.display());
            true
        }
        Err(e) => {
            error!("writing {what} to {}: {e}", path.display());
            false
        }
    }
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Function pointer type for extracting a stage duration from diagnostics.
type StageExtractor = fn(&PipelineDiagnostics) -> Duration;

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[PipelineDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();
    let Some((min, mean, max)) = duration_stats(&durations) else {
        println!("Warning: no diagnostics to summarize");
        return;
    };

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    // Per-stage means.
    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let stage_extractors: &[(&str, StageExtractor)] = &[
        ("Prepare", |d| d.prepare.duration),
        ("Maxima", |d| d.maxima.duration),
        ("Allocation", |d| d.allocation.duration),
        ("Flow Routing", |d| d.flow_routing.duration),
        ("Watershed", |d| d.watershed.duration),
        ("Validation", |d| d.validation.duration),
        ("Region Extraction", |d| d.region_extraction.duration),
    ];

    for (name, extractor) in stage_extractors {
        let stage_mean = all_diagnostics
            .iter()
            .map(|d| extractor(d).as_secs_f64() * 1000.0)
            .sum::<f64>()
            / all_diagnostics.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}

/// Minimum, mean and maximum of `values`, or `None` when empty.
#[allow(clippy::cast_precision_loss)]
fn duration_stats(values: &[f64]) -> Option<(f64, f64, f64)> {
    let min = values.iter().copied().reduce(f64::min)?;
    let max = values.iter().copied().reduce(f64::max)?;
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some((min, mean, max))
}
