//! Web Mercator projection between geographic coordinates, global pixel
//! coordinates and tile addresses.
//!
//! Every function here is pure. Tile edges are derived from a single pair of
//! edge functions (`lng_edge`, `lat_edge`) so two neighbouring tiles
//! always report bit-identical shared edges.

use std::f64::consts::PI;

use cleanup_map_geo_models::{AreaBounds, GeoPoint, MAX_MERCATOR_LAT, TILE_SIZE, TileAddress};

/// Errors from pixel placement.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProjectionError {
    /// The point projects outside the requested tile.
    #[error("Point ({lat}, {lon}) lies outside tile {tile} (offset {offset_x:.3}, {offset_y:.3})")]
    OutOfTileBounds {
        /// Latitude of the point.
        lat: f64,
        /// Longitude of the point.
        lon: f64,
        /// The tile the point was placed into.
        tile: TileAddress,
        /// Horizontal offset from the tile's pixel origin.
        offset_x: f64,
        /// Vertical offset from the tile's pixel origin.
        offset_y: f64,
    },
}

/// Offsets this far below zero are treated as landing on the tile's first
/// row or column.
const EDGE_TOLERANCE: f64 = 1e-9;

/// A position in the global pixel space of one zoom level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelCoord {
    /// Pixels east of the antimeridian.
    pub x: f64,
    /// Pixels south of the north edge.
    pub y: f64,
}

/// An inclusive rectangle of tile addresses at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    /// Zoom level.
    pub zoom: u8,
    /// Westernmost column.
    pub min_x: u32,
    /// Easternmost column.
    pub max_x: u32,
    /// Northernmost row.
    pub min_y: u32,
    /// Southernmost row.
    pub max_y: u32,
}

impl TileRange {
    /// Number of tiles in the range.
    #[must_use]
    pub fn count(&self) -> u64 {
        u64::from(self.max_x - self.min_x + 1) * u64::from(self.max_y - self.min_y + 1)
    }

    /// Returns `true` if the tile is inside the range.
    #[must_use]
    pub fn contains(&self, tile: &TileAddress) -> bool {
        tile.zoom == self.zoom
            && (self.min_x..=self.max_x).contains(&tile.x)
            && (self.min_y..=self.max_y).contains(&tile.y)
    }

    /// Iterates the range row by row.
    pub fn iter(&self) -> impl Iterator<Item = TileAddress> + '_ {
        (self.min_y..=self.max_y)
            .flat_map(move |y| (self.min_x..=self.max_x).map(move |x| TileAddress::new(x, y, self.zoom)))
    }
}

/// Number of tiles along one axis at `zoom`.
#[inline]
fn tiles_per_axis(zoom: u8) -> f64 {
    2.0_f64.powi(i32::from(zoom))
}

/// Width of the whole world in pixels at `zoom`.
#[inline]
fn world_size(zoom: u8) -> f64 {
    tiles_per_axis(zoom) * f64::from(TILE_SIZE)
}

/// Longitude of the vertical line `x` tiles east of the antimeridian.
#[inline]
fn lng_edge(x: f64, zoom: u8) -> f64 {
    x / tiles_per_axis(zoom) * 360.0 - 180.0
}

/// Latitude of the horizontal line `y` tiles south of the north edge.
#[inline]
fn lat_edge(y: f64, zoom: u8) -> f64 {
    (PI * (1.0 - 2.0 * y / tiles_per_axis(zoom)))
        .sinh()
        .atan()
        .to_degrees()
}

/// Projects a coordinate into global pixel space at `zoom`.
///
/// Latitude is clamped to the Web Mercator limit first.
#[must_use]
pub fn project(lat: f64, lon: f64, zoom: u8) -> PixelCoord {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let size = world_size(zoom);
    let phi = lat.to_radians();

    let x = (lon + 180.0) / 360.0 * size;
    let y = (1.0 - (phi.tan() + 1.0 / phi.cos()).ln() / PI) / 2.0 * size;

    PixelCoord { x, y }
}

/// Inverse of [`project`].
#[must_use]
pub fn unproject(pixel: PixelCoord, zoom: u8) -> GeoPoint {
    let tile_size = f64::from(TILE_SIZE);
    GeoPoint::new(
        lat_edge(pixel.y / tile_size, zoom),
        lng_edge(pixel.x / tile_size, zoom),
    )
}

/// Converts a global pixel position to the tile containing it.
///
/// Positions on or beyond the world's east/south edge are clamped into the
/// last column/row.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn pixel_to_tile(pixel: PixelCoord, zoom: u8) -> (u32, u32) {
    let max_index = tiles_per_axis(zoom) - 1.0;
    let tile_size = f64::from(TILE_SIZE);

    let tx = (pixel.x / tile_size).floor().clamp(0.0, max_index);
    let ty = (pixel.y / tile_size).floor().clamp(0.0, max_index);

    (tx as u32, ty as u32)
}

/// Returns the tile containing a coordinate at `zoom`.
#[must_use]
pub fn tile_address(lat: f64, lon: f64, zoom: u8) -> TileAddress {
    let (x, y) = pixel_to_tile(project(lat, lon, zoom), zoom);
    TileAddress::new(x, y, zoom)
}

/// Returns the geographic rectangle covered by a tile.
#[must_use]
pub fn tile_bounds(tile: &TileAddress) -> AreaBounds {
    let x = f64::from(tile.x);
    let y = f64::from(tile.y);

    AreaBounds {
        min_lat: lat_edge(y + 1.0, tile.zoom),
        max_lat: lat_edge(y, tile.zoom),
        min_lng: lng_edge(x, tile.zoom),
        max_lng: lng_edge(x + 1.0, tile.zoom),
    }
}

/// Places a coordinate on a pixel of `tile`.
///
/// The offset from the tile's pixel origin is truncated toward zero. The
/// tile's west and north edges are inside, the east and south edges are not.
///
/// # Errors
///
/// Returns [`ProjectionError::OutOfTileBounds`] if the point does not fall
/// inside the tile.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn pixel_within_tile(lat: f64, lon: f64, tile: &TileAddress) -> Result<(u32, u32), ProjectionError> {
    let pixel = project(lat, lon, tile.zoom);
    let tile_size = f64::from(TILE_SIZE);

    let snap = |offset: f64| {
        if (-EDGE_TOLERANCE..0.0).contains(&offset) {
            0.0
        } else {
            offset
        }
    };
    let offset_x = snap(f64::from(tile.x).mul_add(-tile_size, pixel.x));
    let offset_y = snap(f64::from(tile.y).mul_add(-tile_size, pixel.y));

    let inside = |offset: f64| (0.0..tile_size).contains(&offset);
    if !inside(offset_x) || !inside(offset_y) {
        return Err(ProjectionError::OutOfTileBounds {
            lat,
            lon,
            tile: *tile,
            offset_x,
            offset_y,
        });
    }

    Ok((offset_x as u32, offset_y as u32))
}

/// Returns the inclusive range of tiles that intersect `bounds` at `zoom`.
#[must_use]
pub fn tiles_covering(bounds: &AreaBounds, zoom: u8) -> TileRange {
    let north_west = tile_address(bounds.max_lat, bounds.min_lng, zoom);
    let south_east = tile_address(bounds.min_lat, bounds.max_lng, zoom);

    TileRange {
        zoom,
        min_x: north_west.x,
        max_x: south_east.x,
        min_y: north_west.y,
        max_y: south_east.y,
    }
}
