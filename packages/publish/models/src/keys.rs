//! Object store key layout.
//!
//! Everything an area publishes lives under `{area}/`:
//!
//! ```text
//! {area}/{version}/{zoom}/{x}/{y}.png
//! {area}/{version}/metadata.json
//! {area}/{version}/bounds/{zoom}.json
//! {area}/tilesetmetadata.json
//! {area}/versions/versions.json
//! ```

use cleanup_map_geo_models::TileAddress;

use crate::Version;

/// Cache-Control for immutable, versioned objects.
pub const VERSIONED_CACHE_CONTROL: &str = "public, max-age=3600";

/// Cache-Control for mutable pointers.
pub const MUTABLE_CACHE_CONTROL: &str = "no-cache";

/// Content type of tiles.
pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Content type of metadata documents.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// `{area}/{version}/{zoom}/{x}/{y}.png`
#[must_use]
pub fn tile(area: &str, version: Version, tile: &TileAddress) -> String {
    format!("{area}/{version}/{}/{}/{}.png", tile.zoom, tile.x, tile.y)
}

/// `{area}/{version}/{zoom}/`: every tile of one zoom level.
#[must_use]
pub fn zoom_prefix(area: &str, version: Version, zoom: u8) -> String {
    format!("{area}/{version}/{zoom}/")
}

/// `{area}/`: every version of an area.
#[must_use]
pub fn area_prefix(area: &str) -> String {
    format!("{area}/")
}

/// `{area}/{version}/metadata.json`
#[must_use]
pub fn version_metadata(area: &str, version: Version) -> String {
    format!("{area}/{}", relative_version_metadata(version))
}

/// `{area}/{version}/bounds/{zoom}.json`
#[must_use]
pub fn coverage(area: &str, version: Version, zoom: u8) -> String {
    format!("{area}/{}", relative_coverage(version, zoom))
}

/// `{area}/tilesetmetadata.json`
#[must_use]
pub fn tileset(area: &str) -> String {
    format!("{area}/tilesetmetadata.json")
}

/// `{area}/versions/versions.json`
#[must_use]
pub fn version_index(area: &str) -> String {
    format!("{area}/versions/versions.json")
}

/// `{version}/metadata.json`, relative to the area root.
#[must_use]
pub fn relative_version_metadata(version: Version) -> String {
    format!("{version}/metadata.json")
}

/// `{version}/bounds/{zoom}.json`, relative to the area root.
#[must_use]
pub fn relative_coverage(version: Version, zoom: u8) -> String {
    format!("{version}/bounds/{zoom}.json")
}

/// Parses a key under [`zoom_prefix`] back into a tile address.
///
/// Returns `None` for anything that is not `{prefix}{x}/{y}.png`.
#[must_use]
pub fn parse_tile(prefix: &str, zoom: u8, key: &str) -> Option<TileAddress> {
    let fragment = key.strip_prefix(prefix)?.strip_suffix(".png")?;
    TileAddress::from_fragment(fragment, zoom).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_namespaced_by_area() {
        let v = Version::new(1_700_000_000);
        let t = TileAddress::new(438_999, 226_651, 19);
        assert_eq!(tile("guangfu", v, &t), "guangfu/1700000000/19/438999/226651.png");
        assert_eq!(version_metadata("guangfu", v), "guangfu/1700000000/metadata.json");
        assert_eq!(coverage("guangfu", v, 19), "guangfu/1700000000/bounds/19.json");
        assert_eq!(tileset("guangfu"), "guangfu/tilesetmetadata.json");
        assert_eq!(version_index("guangfu"), "guangfu/versions/versions.json");
    }

    #[test]
    fn parses_tile_keys_under_prefix() {
        let v = Version::new(5);
        let prefix = zoom_prefix("a", v, 19);
        let t = TileAddress::new(10, 20, 19);
        assert_eq!(parse_tile(&prefix, 19, &tile("a", v, &t)), Some(t));
        assert_eq!(parse_tile(&prefix, 19, "a/5/19/10/20.json"), None);
        assert_eq!(parse_tile(&prefix, 19, "a/5/19/10/20/1.png"), None);
        assert_eq!(parse_tile(&prefix, 19, "a/6/19/10/20.png"), None);
    }
}
