//! crown-io: GeoTIFF I/O for canopy height and crown label grids.
//!
//! Reads single-band height rasters into [`crown_pipeline::Grid`]s and
//! writes prepared heights and segmentations back out with their ground
//! placement, so results line up with the input in any GIS.

pub mod raster;

pub use raster::{
    RasterIoError, read_height_grid, read_height_grid_path, write_height_grid,
    write_height_grid_path, write_label_grid, write_label_grid_path,
};
