//! Read-only inspection of published versions.

use cleanup_map_geo_models::{PointState, TileAddress};
use cleanup_map_publish_models::{Version, VersionIndex, keys};
use cleanup_map_r2::ObjectStore;
use cleanup_map_raster::{Palette, decode_states};

/// Prints the version index of `area`.
///
/// # Errors
///
/// Returns an error if the index cannot be read or parsed.
pub async fn list(store: &dyn ObjectStore, area: &str) -> Result<(), Box<dyn std::error::Error>> {
    let index = load_index(store, area).await?;

    if index.versions.is_empty() {
        println!("{area}: no published versions");
        return Ok(());
    }

    println!("{area}: {} version(s)", index.total_versions);
    for entry in &index.versions {
        let marker = if Some(entry.version) == index.latest_version {
            " (latest)"
        } else {
            ""
        };
        println!("  {}  {}{marker}", entry.version, entry.iso_datetime);
    }

    Ok(())
}

/// Prints the states painted in one tile of `version` (or the latest
/// version).
///
/// # Errors
///
/// Returns an error if the tile fragment is malformed, no version exists,
/// or the tile cannot be read or decoded.
pub async fn inspect_tile(
    store: &dyn ObjectStore,
    area: &str,
    version: Option<Version>,
    fragment: &str,
    zoom: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let tile = TileAddress::from_fragment(fragment, zoom)?;
    let version = match version {
        Some(version) => version,
        None => load_index(store, area)
            .await?
            .latest_version
            .ok_or_else(|| format!("{area} has no published versions"))?,
    };

    let key = keys::tile(area, version, &tile);
    let Some(png) = store.get(&key).await? else {
        println!("{key}: not present");
        return Ok(());
    };

    let states = decode_states(&png, &Palette::default())?;
    let count = |wanted: PointState| states.values().filter(|s| **s == wanted).count();

    println!("{key}: {} bytes", png.len());
    println!("  clear: {}", count(PointState::Clear));
    println!("  muddy: {}", count(PointState::Muddy));
    for ((x, y), state) in &states {
        println!("  {x:>3},{y:>3}  {state} ({})", state.code());
    }

    Ok(())
}

async fn load_index(
    store: &dyn ObjectStore,
    area: &str,
) -> Result<VersionIndex, Box<dyn std::error::Error>> {
    match store.get(&keys::version_index(area)).await? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(VersionIndex::default()),
    }
}
