//! Single-band GeoTIFF reading and writing.
//!
//! Placement on the ground comes from the `ModelPixelScale` (33550) and
//! `ModelTiepoint` (33922) tags; the nodata value from GDAL's ASCII
//! `GDAL_NODATA` tag (42113). Projection keys are neither read nor
//! written: grids are used in whatever coordinate system they arrive in.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use crown_pipeline::{Grid, GridGeometry, Label, PipelineError};
use log::{debug, warn};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind, colortype};
use tiff::tags::Tag;

/// Errors that can occur while reading or writing rasters.
#[derive(Debug, thiserror::Error)]
pub enum RasterIoError {
    /// The file could not be opened, read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The TIFF structure could not be decoded or encoded.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// The TIFF is valid but not a raster this tool can use.
    #[error("unsupported raster: {0}")]
    Unsupported(String),

    /// The decoded raster does not form a usable grid.
    #[error(transparent)]
    Grid(#[from] PipelineError),
}

/// Read a single-band GeoTIFF as a height grid.
///
/// Integer samples are widened to `f64`. Cells equal to the file's
/// nodata value become NaN. Files without georeferencing tags get unit
/// cells with the bottom-left corner at the origin.
///
/// # Errors
///
/// Returns [`RasterIoError::Tiff`] for undecodable data,
/// [`RasterIoError::Unsupported`] for multi-band, 64-bit integer or
/// non-square-cell rasters, and [`RasterIoError::Grid`] for an empty
/// raster or bad cell size.
pub fn read_height_grid<R: Read + Seek>(reader: R) -> Result<Grid<f64>, RasterIoError> {
    let mut decoder = Decoder::new(reader)?;
    let (width, height) = decoder.dimensions()?;
    let geometry = read_geometry(&mut decoder, width as usize, height as usize)?;
    let nodata = read_nodata(&mut decoder);

    let mut values: Vec<f64> = match decoder.read_image()? {
        DecodingResult::F64(v) => v,
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        _ => {
            return Err(RasterIoError::Unsupported(
                "64-bit integer samples".to_string(),
            ));
        }
    };

    if values.len() != geometry.cell_count() {
        return Err(RasterIoError::Unsupported(format!(
            "expected one band of {width}x{height} samples, got {}",
            values.len()
        )));
    }

    if let Some(nodata) = nodata.filter(|v| !v.is_nan()) {
        #[allow(clippy::float_cmp)]
        for v in &mut values {
            if *v == nodata {
                *v = f64::NAN;
            }
        }
    }

    debug!(
        "read {width}x{height} raster, cell size {}, nodata {nodata:?}",
        geometry.cell_size
    );
    Ok(Grid::from_vec(geometry, values)?)
}

/// Open and read a GeoTIFF height grid from `path`.
///
/// # Errors
///
/// See [`read_height_grid`].
pub fn read_height_grid_path(path: impl AsRef<Path>) -> Result<Grid<f64>, RasterIoError> {
    read_height_grid(BufReader::new(File::open(path)?))
}

/// Write a height grid as a 64-bit float GeoTIFF with NaN nodata.
///
/// # Errors
///
/// Returns [`RasterIoError::Unsupported`] for grids too large for TIFF
/// dimensions, and I/O or TIFF errors from the writer.
pub fn write_height_grid<W: Write + Seek>(writer: W, grid: &Grid<f64>) -> Result<(), RasterIoError> {
    let (width, height) = tiff_dimensions(grid.geometry())?;
    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image::<colortype::Gray64Float>(width, height)?;
    write_georeference(image.encoder(), grid.geometry(), "nan")?;
    image.write_data(grid.as_slice())?;
    Ok(())
}

/// Write a label grid (e.g. the crown segmentation) as a 32-bit unsigned
/// GeoTIFF with `0` as nodata.
///
/// # Errors
///
/// See [`write_height_grid`].
pub fn write_label_grid<W: Write + Seek>(writer: W, grid: &Grid<Label>) -> Result<(), RasterIoError> {
    let (width, height) = tiff_dimensions(grid.geometry())?;
    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image::<colortype::Gray32>(width, height)?;
    write_georeference(image.encoder(), grid.geometry(), "0")?;
    image.write_data(grid.as_slice())?;
    Ok(())
}

/// Create `path` and write a height grid to it.
///
/// # Errors
///
/// See [`write_height_grid`].
pub fn write_height_grid_path(path: impl AsRef<Path>, grid: &Grid<f64>) -> Result<(), RasterIoError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_height_grid(&mut writer, grid)?;
    writer.flush()?;
    Ok(())
}

/// Create `path` and write a label grid to it.
///
/// # Errors
///
/// See [`write_label_grid`].
pub fn write_label_grid_path(path: impl AsRef<Path>, grid: &Grid<Label>) -> Result<(), RasterIoError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_label_grid(&mut writer, grid)?;
    writer.flush()?;
    Ok(())
}

/// Grid placement from the georeferencing tags, with unit defaults.
#[allow(clippy::cast_precision_loss)]
fn read_geometry<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    width: usize,
    height: usize,
) -> Result<GridGeometry, RasterIoError> {
    let scale = decoder
        .find_tag(Tag::ModelPixelScaleTag)?
        .map(tiff::decoder::ifd::Value::into_f64_vec)
        .transpose()?;
    let tiepoint = decoder
        .find_tag(Tag::ModelTiepointTag)?
        .map(tiff::decoder::ifd::Value::into_f64_vec)
        .transpose()?;

    let (scale_x, scale_y) = if let Some([x, y, ..]) = scale.as_deref() {
        (*x, *y)
    } else {
        warn!("ModelPixelScale tag (33550) missing; assuming unit cells");
        (1.0, 1.0)
    };
    if (scale_x - scale_y).abs() > 1e-9 * scale_x.abs().max(1.0) {
        return Err(RasterIoError::Unsupported(format!(
            "non-square cells {scale_x} x {scale_y}"
        )));
    }

    // The tiepoint maps raster (i, j) to ground (x, y).
    let (origin_x, origin_y) = if let Some([i, j, _, x, y, ..]) = tiepoint.as_deref() {
        (i.mul_add(-scale_x, *x), j.mul_add(scale_y, *y))
    } else {
        warn!("ModelTiepoint tag (33922) missing; placing the grid at the origin");
        (0.0, height as f64 * scale_y)
    };

    let geometry = GridGeometry {
        width,
        height,
        cell_size: scale_x,
        origin_x,
        origin_y,
    };
    geometry.validate()?;
    Ok(geometry)
}

/// The GDAL nodata value, if present and numeric.
fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    decoder
        .find_tag(Tag::GdalNodata)
        .ok()
        .flatten()
        .and_then(|v| v.into_string().ok())
        .and_then(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '\0').parse().ok())
}

fn write_georeference<W: Write + Seek, K: TiffKind>(
    directory: &mut DirectoryEncoder<'_, W, K>,
    geometry: &GridGeometry,
    nodata: &str,
) -> Result<(), RasterIoError> {
    let scale = [geometry.cell_size, geometry.cell_size, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, geometry.origin_x, geometry.origin_y, 0.0];
    directory.write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    directory.write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    directory.write_tag(Tag::GdalNodata, nodata)?;
    Ok(())
}

fn tiff_dimensions(geometry: &GridGeometry) -> Result<(u32, u32), RasterIoError> {
    let too_large = |_| {
        RasterIoError::Unsupported(format!(
            "{}x{} grid exceeds TIFF dimensions",
            geometry.width, geometry.height
        ))
    };
    Ok((
        u32::try_from(geometry.width).map_err(too_large)?,
        u32::try_from(geometry.height).map_err(too_large)?,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_precision_loss)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample() -> Grid<f64> {
        let geometry = GridGeometry {
            width: 4,
            height: 3,
            cell_size: 0.5,
            origin_x: 512_000.0,
            origin_y: 4_100_000.0,
        };
        Grid::from_fn(geometry, |r, c| {
            if (r, c) == (1, 2) {
                f64::NAN
            } else {
                (r * 4 + c) as f64 * 1.25
            }
        })
    }

    fn encode(f: impl FnOnce(&mut Cursor<Vec<u8>>)) -> Cursor<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        f(&mut cursor);
        cursor.set_position(0);
        cursor
    }

    #[test]
    fn height_grid_survives_write_and_read() {
        let grid = sample();
        let bytes = encode(|c| write_height_grid(c, &grid).unwrap());
        let back = read_height_grid(bytes).unwrap();

        assert_eq!(back.geometry(), grid.geometry());
        for (a, b) in back.as_slice().iter().zip(grid.as_slice()) {
            assert!(a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()));
        }
        assert_eq!(back.get(1, 2), None);
    }

    #[test]
    fn label_grid_reads_back_with_zero_as_nodata() {
        let geometry = GridGeometry::unit(3, 2);
        let labels = Grid::from_vec(geometry, vec![0, 1, 1, 2, 0, 2]).unwrap();
        let bytes = encode(|c| write_label_grid(c, &labels).unwrap());
        let back = read_height_grid(bytes).unwrap();

        assert_eq!(back.geometry(), &geometry);
        assert_eq!(back.get(0, 0), None);
        assert_eq!(back.get(0, 1), Some(1.0));
        assert_eq!(back.get(1, 0), Some(2.0));
        assert_eq!(back.valid_count(), 4);
    }

    #[test]
    fn gdal_nodata_sentinel_becomes_nodata() {
        let bytes = encode(|c| {
            let mut encoder = TiffEncoder::new(c).unwrap();
            let mut image = encoder.new_image::<colortype::Gray32Float>(3, 1).unwrap();
            image.encoder().write_tag(Tag::GdalNodata, "-9999").unwrap();
            image.write_data(&[-9999.0, 4.0, -9999.0]).unwrap();
        });
        let grid = read_height_grid(bytes).unwrap();
        assert_eq!(grid.get(0, 0), None);
        assert_eq!(grid.get(0, 1), Some(4.0));
        assert_eq!(grid.get(0, 2), None);
        assert_eq!(grid.valid_count(), 1);
    }

    #[test]
    fn untagged_tiff_gets_unit_geometry() {
        let bytes = encode(|c| {
            let mut encoder = TiffEncoder::new(c).unwrap();
            encoder
                .write_image::<colortype::Gray32Float>(2, 2, &[1.0, 2.0, 3.0, 4.0])
                .unwrap();
        });
        let grid = read_height_grid(bytes).unwrap();
        assert_eq!(grid.geometry(), &GridGeometry::unit(2, 2));
        assert_eq!(grid.get(1, 1), Some(4.0));
    }

    #[test]
    fn multi_band_rejected() {
        let bytes = encode(|c| {
            let mut encoder = TiffEncoder::new(c).unwrap();
            encoder
                .write_image::<colortype::RGB8>(2, 1, &[1, 2, 3, 4, 5, 6])
                .unwrap();
        });
        let result = read_height_grid(bytes);
        assert!(matches!(result, Err(RasterIoError::Unsupported(_))));
    }

    #[test]
    fn non_square_cells_rejected() {
        let bytes = encode(|c| {
            let mut encoder = TiffEncoder::new(c).unwrap();
            let mut image = encoder.new_image::<colortype::Gray32Float>(2, 2).unwrap();
            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &[1.0, 2.0, 0.0][..])
                .unwrap();
            image.write_data(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        });
        let result = read_height_grid(bytes);
        assert!(matches!(result, Err(RasterIoError::Unsupported(_))));
    }

    #[test]
    fn garbage_is_a_tiff_error() {
        let result = read_height_grid(Cursor::new(b"not a tiff".to_vec()));
        assert!(matches!(result, Err(RasterIoError::Tiff(_))));
    }
}
