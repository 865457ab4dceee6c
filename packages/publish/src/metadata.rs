//! Builders for the JSON documents written next to each version.

use std::collections::{BTreeMap, BTreeSet};

use cleanup_map_geo::projection::tiles_covering;
use cleanup_map_geo::resolver::ResolvedChangeSet;
use cleanup_map_geo_models::{AreaConfig, GeoKey, PointState, TILE_SIZE, TileAddress};
use cleanup_map_publish_models::documents::{
    CRS, DATA_TYPE, SCHEMA_VERSION, TILE_FORMAT, TILE_MATRIX_SET_URI,
};
use cleanup_map_publish_models::{
    AccessUrls, ActualCoverage, CoverageDescriptor, GenerationStats, TilesetDescriptor, Version,
    VersionCoverage, VersionDescriptor,
};

use crate::PublishConfig;

/// Area-level tileset descriptor pointing at `latest`.
#[must_use]
pub fn tileset_descriptor(
    area: &AreaConfig,
    config: &PublishConfig,
    latest: Version,
) -> TilesetDescriptor {
    TilesetDescriptor {
        data_type: DATA_TYPE.to_string(),
        crs: CRS.to_string(),
        tile_matrix_set_uri: TILE_MATRIX_SET_URI.to_string(),
        title: format!("{} 清淤進度地圖", area.display_name),
        description: format!(
            "即時顯示{}清淤工作進度的互動式地圖，包含民眾回報和清理狀態資訊",
            area.display_name
        ),
        attribution: config.attribution.clone(),
        license: config.license.clone(),
        bounds: area.bounds.as_lng_lat_array(),
        center: [area.center.lon, area.center.lat],
        minzoom: config.zoom,
        maxzoom: config.zoom,
        tile_size: TILE_SIZE,
        schema_version: SCHEMA_VERSION.to_string(),
        latest_version: latest,
    }
}

/// Counts the states of the changed points behind a version.
#[must_use]
pub fn version_coverage(
    resolved: &ResolvedChangeSet,
    states: &BTreeMap<GeoKey, PointState>,
) -> VersionCoverage {
    let count = |wanted: PointState| states.values().filter(|s| **s == wanted).count();
    let clear_count = count(PointState::Clear);
    let muddy_count = count(PointState::Muddy);

    VersionCoverage {
        affected_tile_count: resolved.tile_count(),
        affected_tiles: resolved.tiles().map(TileAddress::fragment).collect(),
        clear_count,
        muddy_count,
        undefined_count: count(PointState::Undefined),
        reported_count: clear_count + muddy_count,
    }
}

/// Immutable descriptor of `version`.
#[must_use]
pub fn version_descriptor(
    area: &AreaConfig,
    config: &PublishConfig,
    version: Version,
    coverage: VersionCoverage,
    generation_stats: GenerationStats,
) -> VersionDescriptor {
    VersionDescriptor {
        version,
        created: version.iso_datetime(),
        title: format!("{} 清淤地圖 - {}", area.display_name, version.display_datetime()),
        bounds: area.bounds.as_lng_lat_array(),
        minzoom: config.zoom,
        maxzoom: config.zoom,
        tile_format: TILE_FORMAT.to_string(),
        access_url_pattern: "{version}/{z}/{x}/{y}.png".to_string(),
        coverage,
        generation_stats,
        access_urls: AccessUrls::new(version, config.zoom),
    }
}

/// Describes which tiles exist in a version at `zoom`.
#[must_use]
pub fn coverage_descriptor(
    area: &AreaConfig,
    zoom: u8,
    tiles: &BTreeSet<TileAddress>,
) -> CoverageDescriptor {
    let total_possible_tiles = tiles_covering(&area.bounds, zoom).count();

    #[allow(clippy::cast_precision_loss)]
    let coverage_percentage = if total_possible_tiles == 0 {
        0.0
    } else {
        let raw = tiles.len() as f64 / total_possible_tiles as f64 * 100.0;
        (raw * 100.0).round() / 100.0
    };

    let actual_coverage = tiles.first().map(|first| {
        tiles.iter().fold(
            ActualCoverage {
                min_tile_x: first.x,
                max_tile_x: first.x,
                min_tile_y: first.y,
                max_tile_y: first.y,
            },
            |acc, t| ActualCoverage {
                min_tile_x: acc.min_tile_x.min(t.x),
                max_tile_x: acc.max_tile_x.max(t.x),
                min_tile_y: acc.min_tile_y.min(t.y),
                max_tile_y: acc.max_tile_y.max(t.y),
            },
        )
    });

    let mut fragments: Vec<String> = tiles.iter().map(TileAddress::fragment).collect();
    fragments.sort();

    CoverageDescriptor {
        zoom,
        bounds: area.bounds.as_lng_lat_array(),
        tile_count: tiles.len(),
        total_possible_tiles,
        coverage_percentage,
        actual_coverage,
        tiles: fragments,
        sparse_coverage: true,
    }
}

#[cfg(test)]
mod tests {
    use cleanup_map_geo::resolver::resolve;
    use cleanup_map_geo_models::{AreaBounds, GeoPoint};

    use super::*;

    fn area() -> AreaConfig {
        AreaConfig {
            name: "guangfu".to_string(),
            display_name: "花蓮光復鄉".to_string(),
            bounds: AreaBounds {
                min_lat: 23.653_96,
                max_lat: 23.681_37,
                min_lng: 121.417_60,
                max_lng: 121.456_57,
            },
            center: GeoPoint::new(23.667_67, 121.437_09),
        }
    }

    #[test]
    fn coverage_reports_extent_and_percentage() {
        let tiles: BTreeSet<TileAddress> = [(438_999, 226_651), (439_000, 226_650), (438_980, 226_660)]
            .into_iter()
            .map(|(x, y)| TileAddress::new(x, y, 19))
            .collect();

        let descriptor = coverage_descriptor(&area(), 19, &tiles);
        assert_eq!(descriptor.tile_count, 3);
        assert_eq!(descriptor.total_possible_tiles, 2508);
        assert!((descriptor.coverage_percentage - 0.12).abs() < 1e-9);
        assert_eq!(
            descriptor.actual_coverage,
            Some(ActualCoverage {
                min_tile_x: 438_980,
                max_tile_x: 439_000,
                min_tile_y: 226_650,
                max_tile_y: 226_660,
            })
        );
        assert_eq!(descriptor.tiles[0], "438980/226660");
    }

    #[test]
    fn empty_coverage_has_no_extent() {
        let descriptor = coverage_descriptor(&area(), 19, &BTreeSet::new());
        assert_eq!(descriptor.tile_count, 0);
        assert!(descriptor.actual_coverage.is_none());
        assert!(descriptor.coverage_percentage.abs() < f64::EPSILON);
    }

    #[test]
    fn version_coverage_counts_states() {
        let keys: Vec<GeoKey> = ["23.6677_121.4370", "23.6600_121.4300", "23.6650_121.4400"]
            .into_iter()
            .map(GeoKey::from)
            .collect();
        let resolved = resolve(&keys, &area().bounds, 19);
        let states = BTreeMap::from([
            (keys[0].clone(), PointState::Muddy),
            (keys[1].clone(), PointState::Clear),
            (keys[2].clone(), PointState::Undefined),
        ]);

        let coverage = version_coverage(&resolved, &states);
        assert_eq!(coverage.affected_tile_count, resolved.tile_count());
        assert_eq!(coverage.muddy_count, 1);
        assert_eq!(coverage.clear_count, 1);
        assert_eq!(coverage.undefined_count, 1);
        assert_eq!(coverage.reported_count, 2);
    }

    #[test]
    fn descriptors_use_area_geometry() {
        let config = PublishConfig::default();
        let version = Version::new(1_759_299_905);

        let tileset = tileset_descriptor(&area(), &config, version);
        assert_eq!(tileset.bounds, [121.417_60, 23.653_96, 121.456_57, 23.681_37]);
        assert_eq!(tileset.center, [121.437_09, 23.667_67]);
        assert_eq!(tileset.minzoom, 19);
        assert_eq!(tileset.license, "CC BY 4.0");

        let descriptor = version_descriptor(
            &area(),
            &config,
            version,
            VersionCoverage::default(),
            GenerationStats::default(),
        );
        assert_eq!(descriptor.created, "2025-10-01T06:25:05Z");
        assert!(descriptor.title.ends_with("2025-10-01 06:25:05"));
        assert_eq!(descriptor.access_urls.metadata, "1759299905/metadata.json");
    }
}
