//! JSON metadata documents published alongside the tiles.
//!
//! Shapes follow the OGC Two Dimensional Tile Matrix Set conventions used by
//! the map frontend. All field names are camelCase.

use serde::{Deserialize, Serialize};

use crate::Version;
use crate::keys;

/// `dataType` of every tile set.
pub const DATA_TYPE: &str = "raster";

/// Coordinate reference system of `bounds` and `center`.
pub const CRS: &str = "http://www.opengis.net/def/crs/OGC/1.3/CRS84";

/// Tiling scheme URI.
pub const TILE_MATRIX_SET_URI: &str =
    "http://www.opengis.net/def/tilematrixset/OGC/1.0/WebMercatorQuad";

/// Version of these document schemas.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// MIME type of the tiles.
pub const TILE_FORMAT: &str = "image/png";

/// Area-level description of the tile set, rewritten on every publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilesetDescriptor {
    /// Always [`DATA_TYPE`].
    pub data_type: String,
    /// Always [`CRS`].
    pub crs: String,
    /// Always [`TILE_MATRIX_SET_URI`].
    pub tile_matrix_set_uri: String,
    /// Human-readable title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Data attribution.
    pub attribution: String,
    /// Data license.
    pub license: String,
    /// `[minLng, minLat, maxLng, maxLat]`.
    pub bounds: [f64; 4],
    /// `[lng, lat]`.
    pub center: [f64; 2],
    /// Lowest zoom with tiles.
    pub minzoom: u8,
    /// Highest zoom with tiles.
    pub maxzoom: u8,
    /// Tile edge length in pixels.
    pub tile_size: u32,
    /// Always [`SCHEMA_VERSION`].
    pub schema_version: String,
    /// Latest published version.
    pub latest_version: Version,
}

/// Point-state counts of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCoverage {
    /// Number of tiles regenerated.
    pub affected_tile_count: usize,
    /// Regenerated tiles as `"x/y"`.
    pub affected_tiles: Vec<String>,
    /// Changed points rendered clear.
    pub clear_count: usize,
    /// Changed points rendered muddy.
    pub muddy_count: usize,
    /// Changed points with no reports.
    pub undefined_count: usize,
    /// Changed points with at least one report.
    pub reported_count: usize,
}

/// Counters from the publish that produced a version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    /// Tiles merged and uploaded.
    pub tiles_processed: u64,
    /// Unchanged tiles copied from the previous version.
    pub tiles_copied: u64,
    /// Previous tiles downloaded for merging.
    pub tiles_downloaded: u64,
    /// Bytes of tile data uploaded.
    pub bytes_uploaded: u64,
    /// Wall-clock time of the tile phase.
    pub execution_time_seconds: f64,
}

/// Paths (relative to the area root) for one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessUrls {
    /// Tile URL template with `{x}` and `{y}` placeholders.
    pub tile_pattern: String,
    /// Version descriptor path.
    pub metadata: String,
    /// Coverage descriptor path.
    pub bounds: String,
}

impl AccessUrls {
    /// Builds the paths for `version` at `zoom`.
    #[must_use]
    pub fn new(version: Version, zoom: u8) -> Self {
        Self {
            tile_pattern: format!("{version}/{zoom}/{{x}}/{{y}}.png"),
            metadata: keys::relative_version_metadata(version),
            bounds: keys::relative_coverage(version, zoom),
        }
    }
}

/// Immutable description of one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDescriptor {
    /// The version.
    pub version: Version,
    /// Creation time, `YYYY-MM-DDTHH:MM:SSZ`.
    pub created: String,
    /// Human-readable title.
    pub title: String,
    /// `[minLng, minLat, maxLng, maxLat]`.
    pub bounds: [f64; 4],
    /// Lowest zoom with tiles.
    pub minzoom: u8,
    /// Highest zoom with tiles.
    pub maxzoom: u8,
    /// Always [`TILE_FORMAT`].
    pub tile_format: String,
    /// Tile URL template, `{version}/{z}/{x}/{y}.png`.
    pub access_url_pattern: String,
    /// Point-state counts.
    pub coverage: VersionCoverage,
    /// Publish counters.
    pub generation_stats: GenerationStats,
    /// Paths to this version's documents.
    pub access_urls: AccessUrls,
}

/// Tile extent actually present in a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActualCoverage {
    /// Westernmost column.
    pub min_tile_x: u32,
    /// Easternmost column.
    pub max_tile_x: u32,
    /// Northernmost row.
    pub min_tile_y: u32,
    /// Southernmost row.
    pub max_tile_y: u32,
}

/// Which tiles exist in a version at one zoom level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageDescriptor {
    /// Zoom level described.
    pub zoom: u8,
    /// `[minLng, minLat, maxLng, maxLat]` of the area.
    pub bounds: [f64; 4],
    /// Number of tiles present.
    pub tile_count: usize,
    /// Number of tiles intersecting the area bounds.
    pub total_possible_tiles: u64,
    /// `tile_count / total_possible_tiles`, as a percentage with two
    /// decimals.
    pub coverage_percentage: f64,
    /// Extent of the present tiles; absent when there are none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_coverage: Option<ActualCoverage>,
    /// Present tiles as `"x/y"`, sorted.
    pub tiles: Vec<String>,
    /// Always `true`: only tiles listed in `tiles` exist in the version,
    /// every other tile of the area range is absent.
    pub sparse_coverage: bool,
}

/// Entry of the version index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    /// The version.
    pub version: Version,
    /// Same as `version`, as a number.
    pub timestamp: u64,
    /// `YYYY-MM-DDTHH:MM:SSZ`.
    pub iso_datetime: String,
    /// Version root, `"{version}/"`.
    pub url: String,
    /// Version descriptor path.
    pub metadata_url: String,
}

impl VersionEntry {
    /// Builds the entry for `version`.
    #[must_use]
    pub fn new(version: Version) -> Self {
        Self {
            version,
            timestamp: version.as_secs(),
            iso_datetime: version.iso_datetime(),
            url: format!("{version}/"),
            metadata_url: keys::relative_version_metadata(version),
        }
    }
}

/// Every published version of an area, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionIndex {
    /// Entries, newest first.
    pub versions: Vec<VersionEntry>,
    /// `versions.len()`.
    pub total_versions: usize,
    /// Newest version, if any.
    pub latest_version: Option<Version>,
}

impl VersionIndex {
    /// Builds an index from any collection of versions.
    #[must_use]
    pub fn from_versions(versions: impl IntoIterator<Item = Version>) -> Self {
        let mut index = Self::default();
        for version in versions {
            index.insert(version);
        }
        index
    }

    /// Adds `version`, keeping entries deduplicated and newest first.
    pub fn insert(&mut self, version: Version) {
        if !self.versions.iter().any(|e| e.version == version) {
            self.versions.push(VersionEntry::new(version));
        }
        self.versions.sort_by(|a, b| b.version.cmp(&a.version));
        self.total_versions = self.versions.len();
        self.latest_version = self.versions.first().map(|e| e.version);
    }
}
