//! Incremental tile merge.
//!
//! A merge starts from the previously published raster (if any), keeps every
//! pixel the palette recognises, then paints the changed points over it. The
//! painted layer always wins.

use std::collections::BTreeMap;
use std::io::Cursor;

use cleanup_map_geo::projection::pixel_within_tile;
use cleanup_map_geo_models::{GeoKey, PointState, TILE_SIZE, TileAddress};
use image::{ImageFormat, Rgba as Pixel, RgbaImage};

use crate::palette::Palette;

/// Errors from encoding or decoding tiles.
#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    /// PNG decoding failed.
    #[error("Failed to decode PNG: {source}")]
    Decode {
        /// Underlying image error.
        source: image::ImageError,
    },

    /// The raster is not `TILE_SIZE` × `TILE_SIZE`.
    #[error("Unexpected raster size {width}x{height}")]
    Dimensions {
        /// Actual width.
        width: u32,
        /// Actual height.
        height: u32,
    },

    /// PNG encoding failed.
    #[error("Failed to encode tile {tile}: {source}")]
    Encode {
        /// Tile being encoded.
        tile: TileAddress,
        /// Underlying image error.
        source: image::ImageError,
    },
}

/// Counters describing one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Visible pixels kept from the previous raster.
    pub carried_over: usize,
    /// Points painted from the change set.
    pub painted: usize,
    /// Points that do not project into this tile.
    pub outside_tile: usize,
    /// Keys that could not be parsed.
    pub unparseable: usize,
    /// Previous pixels dropped because their colour is not in the palette.
    pub foreign_pixels: usize,
    /// The previous raster was unreadable or the wrong size and was ignored.
    pub existing_discarded: bool,
}

/// Output of [`RasterMergeEngine::merge`].
#[derive(Debug, Clone)]
pub struct MergedRaster {
    /// Encoded RGBA PNG.
    pub png: Vec<u8>,
    /// Merge counters.
    pub stats: MergeStats,
    /// Non-transparent pixels in the result.
    pub visible_pixels: usize,
}

impl MergedRaster {
    /// Returns `true` if every pixel is fully transparent.
    #[must_use]
    pub const fn is_transparent(&self) -> bool {
        self.visible_pixels == 0
    }
}

/// Merges changed point states into tile rasters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterMergeEngine {
    palette: Palette,
}

impl RasterMergeEngine {
    /// Creates an engine using `palette`.
    #[must_use]
    pub const fn new(palette: Palette) -> Self {
        Self { palette }
    }

    /// Produces the new raster for `tile`.
    ///
    /// `existing` is the tile's PNG from the previous version. An unreadable
    /// or wrongly sized raster is logged and replaced with a transparent one.
    ///
    /// # Errors
    ///
    /// Returns [`RasterError::Encode`] if the result cannot be encoded.
    pub fn merge(
        &self,
        tile: &TileAddress,
        existing: Option<&[u8]>,
        states: &BTreeMap<GeoKey, PointState>,
    ) -> Result<MergedRaster, RasterError> {
        let mut stats = MergeStats::default();
        let mut canvas = blank();

        if let Some(bytes) = existing {
            match decode(bytes) {
                Ok(previous) => {
                    for (x, y, pixel) in previous.enumerate_pixels() {
                        match self.palette.state_for(pixel.0) {
                            Some(PointState::Undefined) => {}
                            Some(_) => {
                                canvas.put_pixel(x, y, *pixel);
                                stats.carried_over += 1;
                            }
                            None => stats.foreign_pixels += 1,
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Discarding previous raster for tile {tile}: {e}");
                    stats.existing_discarded = true;
                }
            }
        }

        if stats.foreign_pixels > 0 {
            log::warn!(
                "Tile {tile}: dropped {} pixel(s) with colours outside the palette",
                stats.foreign_pixels
            );
        }

        for (key, state) in states {
            let point = match key.parse() {
                Ok(point) => point,
                Err(e) => {
                    log::warn!("Tile {tile}: {e}");
                    stats.unparseable += 1;
                    continue;
                }
            };

            match pixel_within_tile(point.lat, point.lon, tile) {
                Ok((x, y)) => {
                    canvas.put_pixel(x, y, Pixel(self.palette.color_for(*state)));
                    stats.painted += 1;
                }
                Err(e) => {
                    log::debug!("{e}");
                    stats.outside_tile += 1;
                }
            }
        }

        let visible_pixels = canvas.pixels().filter(|p| p.0[3] != 0).count();

        let mut png = Cursor::new(Vec::new());
        canvas
            .write_to(&mut png, ImageFormat::Png)
            .map_err(|source| RasterError::Encode {
                tile: *tile,
                source,
            })?;

        Ok(MergedRaster {
            png: png.into_inner(),
            stats,
            visible_pixels,
        })
    }
}

/// Reverse-maps a tile into the states of its visible pixels, keyed by
/// `(x, y)` pixel offset. Pixels with colours outside the palette are
/// skipped.
///
/// # Errors
///
/// Returns [`RasterError::Decode`] or [`RasterError::Dimensions`] if `png`
/// is not a valid tile.
pub fn decode_states(
    png: &[u8],
    palette: &Palette,
) -> Result<BTreeMap<(u32, u32), PointState>, RasterError> {
    let raster = decode(png)?;

    Ok(raster
        .enumerate_pixels()
        .filter_map(|(x, y, pixel)| match palette.state_for(pixel.0) {
            Some(PointState::Undefined) | None => None,
            Some(state) => Some(((x, y), state)),
        })
        .collect())
}

fn blank() -> RgbaImage {
    RgbaImage::from_pixel(TILE_SIZE, TILE_SIZE, Pixel(Palette::TRANSPARENT))
}

fn decode(bytes: &[u8]) -> Result<RgbaImage, RasterError> {
    let raster = image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .map_err(|source| RasterError::Decode { source })?
        .to_rgba8();

    if raster.width() != TILE_SIZE || raster.height() != TILE_SIZE {
        return Err(RasterError::Dimensions {
            width: raster.width(),
            height: raster.height(),
        });
    }

    Ok(raster)
}
