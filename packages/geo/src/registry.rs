//! Area registry, loaded from embedded TOML configs.
//!
//! Each `.toml` file in `packages/geo/areas/` is baked into the binary at
//! compile time via [`include_str!`]. Adding an area means adding a TOML
//! file and listing it below.

use cleanup_map_geo_models::{AreaConfig, AreaCorners, GeoPoint};
use serde::Deserialize;

/// TOML configs embedded at compile time.
const AREA_TOMLS: &[(&str, &str)] = &[
    ("guangfu", include_str!("../areas/guangfu.toml")),
    ("preview", include_str!("../areas/preview.toml")),
];

/// Area used when nothing else is requested.
pub const DEFAULT_AREA: &str = "guangfu";

#[cfg(test)]
const EXPECTED_AREA_COUNT: usize = 2;

/// On-disk shape of an area definition.
#[derive(Debug, Deserialize)]
struct AreaDefinition {
    name: String,
    display_name: String,
    corners: AreaCorners,
    center: GeoPoint,
}

impl From<AreaDefinition> for AreaConfig {
    fn from(def: AreaDefinition) -> Self {
        Self {
            name: def.name,
            display_name: def.display_name,
            bounds: def.corners.to_bounds(),
            center: def.center,
        }
    }
}

/// Parses one area definition.
///
/// # Errors
///
/// Returns the TOML error message if the config is malformed.
pub fn parse_area_toml(toml_str: &str) -> Result<AreaConfig, String> {
    toml::de::from_str::<AreaDefinition>(toml_str)
        .map(AreaConfig::from)
        .map_err(|e| e.to_string())
}

/// Returns all built-in areas.
///
/// # Panics
///
/// Panics if any TOML config is malformed (the configs are embedded, so
/// this is caught by the tests below).
#[must_use]
pub fn all_areas() -> Vec<AreaConfig> {
    AREA_TOMLS
        .iter()
        .map(|(name, toml)| {
            parse_area_toml(toml).unwrap_or_else(|e| panic!("Failed to parse {name}.toml: {e}"))
        })
        .collect()
}

/// Looks up a built-in area by name.
#[must_use]
pub fn find_area(name: &str) -> Option<AreaConfig> {
    all_areas().into_iter().find(|area| area.name == name)
}
