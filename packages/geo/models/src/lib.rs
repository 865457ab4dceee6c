#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Geographic point, tile address and area types for the cleanup map.
//!
//! Reports arrive as 4-decimal `lat_lon` keys ([`GeoKey`]). Each key carries
//! a [`PointState`] derived from two accumulated trust scores, and is
//! rendered as one pixel of a 256×256 Web Mercator tile ([`TileAddress`])
//! at a single primary zoom level.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Width and height of every raster tile, in pixels.
pub const TILE_SIZE: u32 = 256;

/// Number of decimal places kept in a [`GeoKey`] (≈11 m at the equator).
pub const COORD_PRECISION: usize = 4;

/// Default primary zoom level (~0.3 m/pixel at mid latitudes).
pub const PRIMARY_ZOOM: u8 = 19;

/// Highest zoom level the projection accepts.
pub const MAX_ZOOM: u8 = 24;

/// Web Mercator latitude limit, in degrees. Latitudes are clamped to
/// `[-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT]` before projecting.
pub const MAX_MERCATOR_LAT: f64 = 85.0511;

/// Errors produced when parsing a [`GeoKey`] or [`TileAddress`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeoKeyError {
    /// The key does not have exactly two `_`-separated parts.
    #[error("Invalid coordinate key format: {key}")]
    Format {
        /// The offending key.
        key: String,
    },

    /// One of the parts is not a finite decimal number.
    #[error("Invalid coordinate value '{value}' in key {key}")]
    Value {
        /// The offending key.
        key: String,
        /// The part that failed to parse.
        value: String,
    },

    /// A tile fragment was not of the form `x/y`.
    #[error("Invalid tile fragment: {fragment}")]
    TileFragment {
        /// The offending fragment.
        fragment: String,
    },
}

/// Rendered state of a single reported point.
///
/// The numeric codes match the values used by the reporting backend
/// (`0` = clear, `1` = muddy, `-1` = unreported).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PointState {
    /// Mud has been cleared.
    Clear,
    /// Mud is still present.
    Muddy,
    /// No information; rendered fully transparent.
    Undefined,
}

impl PointState {
    /// Classifies a point from its accumulated trust scores.
    ///
    /// `Muddy` wins only if its score strictly exceeds the clear score.
    /// A missing score counts as `0.0`; if both are missing the point is
    /// [`PointState::Undefined`].
    #[must_use]
    pub fn from_scores(clear: Option<f64>, muddy: Option<f64>) -> Self {
        if clear.is_none() && muddy.is_none() {
            return Self::Undefined;
        }
        if muddy.unwrap_or(0.0) > clear.unwrap_or(0.0) {
            Self::Muddy
        } else {
            Self::Clear
        }
    }

    /// Returns the backend's numeric code for this state.
    #[must_use]
    pub const fn code(self) -> i8 {
        match self {
            Self::Clear => 0,
            Self::Muddy => 1,
            Self::Undefined => -1,
        }
    }

    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Clear, Self::Muddy, Self::Undefined]
    }
}

/// A geographic point in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    #[serde(alias = "lng")]
    pub lon: f64,
}

impl GeoPoint {
    /// Creates a new point.
    #[must_use]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Formats this point as a 4-decimal [`GeoKey`].
    #[must_use]
    pub fn key(&self) -> GeoKey {
        GeoKey::from_coords(self.lat, self.lon)
    }
}

/// A change-set key of the form `"{lat}_{lon}"` with both parts at
/// [`COORD_PRECISION`] decimals.
///
/// Two reports inside the same 4-decimal cell share one key. Keys read from
/// the store are kept verbatim, so a `GeoKey` may be malformed until
/// [`GeoKey::parse`] is called.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeoKey(String);

impl GeoKey {
    /// Formats coordinates into a key.
    #[must_use]
    pub fn from_coords(lat: f64, lon: f64) -> Self {
        Self(format!(
            "{lat:.prec$}_{lon:.prec$}",
            prec = COORD_PRECISION
        ))
    }

    /// Wraps a raw key string as read from the change-tracking store.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the key back into a [`GeoPoint`].
    ///
    /// # Errors
    ///
    /// Returns [`GeoKeyError::Format`] if the key is not two `_`-separated
    /// parts, or [`GeoKeyError::Value`] if either part is not a finite
    /// number.
    pub fn parse(&self) -> Result<GeoPoint, GeoKeyError> {
        let mut parts = self.0.split('_');
        let (Some(lat), Some(lon), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(GeoKeyError::Format {
                key: self.0.clone(),
            });
        };

        let parse_part = |value: &str| {
            value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| GeoKeyError::Value {
                    key: self.0.clone(),
                    value: value.to_string(),
                })
        };

        Ok(GeoPoint::new(parse_part(lat)?, parse_part(lon)?))
    }
}

impl fmt::Display for GeoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GeoKey {
    fn from(value: &str) -> Self {
        Self::from_raw(value)
    }
}

/// Address of one tile in the power-of-two Web Mercator tiling scheme.
///
/// Ordering is `(zoom, x, y)` so sorted collections are deterministic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TileAddress {
    /// Zoom level.
    pub zoom: u8,
    /// Column, counted eastward from the antimeridian.
    pub x: u32,
    /// Row, counted southward from the north edge.
    pub y: u32,
}

impl TileAddress {
    /// Creates a new tile address.
    #[must_use]
    pub const fn new(x: u32, y: u32, zoom: u8) -> Self {
        Self { zoom, x, y }
    }

    /// Returns the `"x/y"` fragment used in coverage lists.
    #[must_use]
    pub fn fragment(&self) -> String {
        format!("{}/{}", self.x, self.y)
    }

    /// Parses an `"x/y"` fragment at the given zoom.
    ///
    /// # Errors
    ///
    /// Returns [`GeoKeyError::TileFragment`] if the fragment is malformed.
    pub fn from_fragment(fragment: &str, zoom: u8) -> Result<Self, GeoKeyError> {
        let err = || GeoKeyError::TileFragment {
            fragment: fragment.to_string(),
        };
        let (x, y) = fragment.split_once('/').ok_or_else(err)?;
        let x = x.parse::<u32>().map_err(|_| err())?;
        let y = y.parse::<u32>().map_err(|_| err())?;
        Ok(Self::new(x, y, zoom))
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Axis-aligned geographic rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaBounds {
    /// Southern edge.
    pub min_lat: f64,
    /// Northern edge.
    pub max_lat: f64,
    /// Western edge.
    pub min_lng: f64,
    /// Eastern edge.
    pub max_lng: f64,
}

impl AreaBounds {
    /// Builds the bounding rectangle of a (possibly skewed) quadrilateral
    /// given by its four corners.
    #[must_use]
    pub fn from_corners(
        north_west: GeoPoint,
        north_east: GeoPoint,
        south_west: GeoPoint,
        south_east: GeoPoint,
    ) -> Self {
        let corners = [north_west, north_east, south_west, south_east];
        let mut bounds = Self {
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
            min_lng: f64::INFINITY,
            max_lng: f64::NEG_INFINITY,
        };
        for corner in &corners {
            bounds.min_lat = bounds.min_lat.min(corner.lat);
            bounds.max_lat = bounds.max_lat.max(corner.lat);
            bounds.min_lng = bounds.min_lng.min(corner.lon);
            bounds.max_lng = bounds.max_lng.max(corner.lon);
        }
        bounds
    }

    /// Returns `true` if the point lies inside the rectangle (edges
    /// included).
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lng..=self.max_lng).contains(&lon)
    }

    /// Returns the midpoint of the rectangle.
    #[must_use]
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Returns `[minLng, minLat, maxLng, maxLat]`, the order used by
    /// `TileJSON`-style metadata.
    #[must_use]
    pub const fn as_lng_lat_array(&self) -> [f64; 4] {
        [self.min_lng, self.min_lat, self.max_lng, self.max_lat]
    }
}

/// A named area whose reports are rendered into one tile set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaConfig {
    /// Machine name, used in store keys (e.g. `"guangfu"`).
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Reports outside these bounds are ignored.
    pub bounds: AreaBounds,
    /// Map center shown by viewers.
    pub center: GeoPoint,
}

/// The four corners of an area as surveyed, before reduction to an
/// [`AreaBounds`] rectangle.
///
/// Accepts both `snake_case` (TOML registry) and `camelCase` (remote JSON)
/// field names.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AreaCorners {
    /// North-west corner.
    #[serde(alias = "northWest")]
    pub north_west: GeoPoint,
    /// North-east corner.
    #[serde(alias = "northEast")]
    pub north_east: GeoPoint,
    /// South-west corner.
    #[serde(alias = "southWest")]
    pub south_west: GeoPoint,
    /// South-east corner.
    #[serde(alias = "southEast")]
    pub south_east: GeoPoint,
}

impl AreaCorners {
    /// Reduces the corners to their bounding rectangle.
    #[must_use]
    pub fn to_bounds(&self) -> AreaBounds {
        AreaBounds::from_corners(
            self.north_west,
            self.north_east,
            self.south_west,
            self.south_east,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geo_key_formats_to_four_decimals() {
        let key = GeoKey::from_coords(23.667_749, 121.437);
        assert_eq!(key.as_str(), "23.6677_121.4370");
    }

    #[test]
    fn nearby_points_collapse_to_one_key() {
        let a = GeoPoint::new(23.667_71, 121.437_01).key();
        let b = GeoPoint::new(23.667_74, 121.437_04).key();
        assert_eq!(a, b);
    }

    #[test]
    fn geo_key_parses_negative_coordinates() {
        let point = GeoKey::from("-33.8688_-151.2093").parse().unwrap();
        assert!((point.lat - -33.8688).abs() < 1e-12);
        assert!((point.lon - -151.2093).abs() < 1e-12);
    }

    #[test]
    fn geo_key_rejects_malformed_keys() {
        assert!(matches!(
            GeoKey::from("23.6677").parse(),
            Err(GeoKeyError::Format { .. })
        ));
        assert!(matches!(
            GeoKey::from("1_2_3").parse(),
            Err(GeoKeyError::Format { .. })
        ));
        assert!(matches!(
            GeoKey::from("abc_121.0").parse(),
            Err(GeoKeyError::Value { .. })
        ));
        assert!(matches!(
            GeoKey::from("NaN_121.0").parse(),
            Err(GeoKeyError::Value { .. })
        ));
    }

    #[test]
    fn point_state_from_scores() {
        assert_eq!(
            PointState::from_scores(Some(1.0), Some(2.0)),
            PointState::Muddy
        );
        assert_eq!(
            PointState::from_scores(Some(2.0), Some(2.0)),
            PointState::Clear
        );
        assert_eq!(PointState::from_scores(None, Some(0.5)), PointState::Muddy);
        assert_eq!(PointState::from_scores(Some(0.5), None), PointState::Clear);
        assert_eq!(PointState::from_scores(None, None), PointState::Undefined);
    }

    #[test]
    fn point_state_codes() {
        let codes: Vec<i8> = PointState::all().iter().map(|s| s.code()).collect();
        assert_eq!(codes, vec![0, 1, -1]);
        assert_eq!(PointState::Muddy.to_string(), "MUDDY");
    }

    #[test]
    fn tile_fragment_roundtrip() {
        let tile = TileAddress::new(438_283, 228_402, 19);
        assert_eq!(tile.fragment(), "438283/228402");
        assert_eq!(TileAddress::from_fragment("438283/228402", 19).unwrap(), tile);
        assert!(TileAddress::from_fragment("438283", 19).is_err());
        assert!(TileAddress::from_fragment("a/b", 19).is_err());
    }

    #[test]
    fn bounds_from_skewed_corners() {
        let bounds = AreaBounds::from_corners(
            GeoPoint::new(23.681_37, 121.417_71),
            GeoPoint::new(23.681_08, 121.456_39),
            GeoPoint::new(23.653_97, 121.417_60),
            GeoPoint::new(23.653_96, 121.456_57),
        );
        assert!((bounds.min_lat - 23.653_96).abs() < 1e-12);
        assert!((bounds.max_lat - 23.681_37).abs() < 1e-12);
        assert!((bounds.min_lng - 121.417_60).abs() < 1e-12);
        assert!((bounds.max_lng - 121.456_57).abs() < 1e-12);
        assert!(bounds.contains(23.6677, 121.4370));
        assert!(bounds.contains(bounds.min_lat, bounds.max_lng));
        assert!(!bounds.contains(23.70, 121.4370));
    }

    #[test]
    fn area_config_uses_camel_case() {
        let json = serde_json::json!({
            "name": "guangfu",
            "displayName": "Guangfu",
            "bounds": {"minLat": 1.0, "maxLat": 2.0, "minLng": 3.0, "maxLng": 4.0},
            "center": {"lat": 1.5, "lon": 3.5}
        });
        let area: AreaConfig = serde_json::from_value(json).unwrap();
        assert_eq!(area.display_name, "Guangfu");
        assert!((area.bounds.max_lng - 4.0).abs() < f64::EPSILON);
    }
}
