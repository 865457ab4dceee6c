//! Groups a change set by the tile each changed point falls in.

use std::collections::{BTreeMap, BTreeSet};

use cleanup_map_geo_models::{AreaBounds, GeoKey, TileAddress};

use crate::projection::tile_address;

/// A change set filtered to one area and bucketed by tile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedChangeSet {
    /// Zoom level the tiles were resolved at.
    pub zoom: u8,
    /// Retained keys per affected tile, sorted and deduplicated.
    pub by_tile: BTreeMap<TileAddress, Vec<GeoKey>>,
    /// Keys that could not be parsed into coordinates.
    pub unparseable: usize,
    /// Keys that parsed but lie outside the area bounds.
    pub out_of_bounds: usize,
}

impl ResolvedChangeSet {
    /// Affected tiles in ascending order.
    pub fn tiles(&self) -> impl Iterator<Item = &TileAddress> {
        self.by_tile.keys()
    }

    /// Every retained key across all tiles.
    #[must_use]
    pub fn retained_keys(&self) -> BTreeSet<GeoKey> {
        self.by_tile.values().flatten().cloned().collect()
    }

    /// Number of affected tiles.
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.by_tile.len()
    }

    /// Returns `true` if no tile needs regenerating.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_tile.is_empty()
    }
}

/// Resolves raw change-set keys into affected tiles.
///
/// Malformed keys are logged and counted in
/// [`ResolvedChangeSet::unparseable`]; points outside `bounds` are counted in
/// [`ResolvedChangeSet::out_of_bounds`]. An empty result is valid.
pub fn resolve<'a>(
    keys: impl IntoIterator<Item = &'a GeoKey>,
    bounds: &AreaBounds,
    zoom: u8,
) -> ResolvedChangeSet {
    let mut grouped: BTreeMap<TileAddress, BTreeSet<GeoKey>> = BTreeMap::new();
    let mut unparseable = 0;
    let mut out_of_bounds = 0;

    for key in keys {
        let point = match key.parse() {
            Ok(point) => point,
            Err(e) => {
                log::warn!("Skipping change-set entry: {e}");
                unparseable += 1;
                continue;
            }
        };

        if !bounds.contains(point.lat, point.lon) {
            log::debug!("Skipping {key}: outside area bounds");
            out_of_bounds += 1;
            continue;
        }

        grouped
            .entry(tile_address(point.lat, point.lon, zoom))
            .or_default()
            .insert(key.clone());
    }

    if out_of_bounds > 0 {
        log::info!("{out_of_bounds} changed point(s) outside area bounds ignored");
    }

    ResolvedChangeSet {
        zoom,
        by_tile: grouped
            .into_iter()
            .map(|(tile, keys)| (tile, keys.into_iter().collect()))
            .collect(),
        unparseable,
        out_of_bounds,
    }
}
