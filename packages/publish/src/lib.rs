#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Incremental, versioned tile publishing.
//!
//! A cycle for one area reads the pending change set, groups the changed
//! points into tiles, merges each tile with its raster from the previous
//! version, uploads the result under a fresh [`Version`], copies every
//! untouched tile forward, writes the metadata documents, announces the
//! version and finally clears the change set.
//!
//! Published versions are immutable. A cycle that fails before the
//! announcement leaves the change set in place so the next run retries it.
//! So does a published cycle in which some tiles failed; those tiles keep
//! their previous raster in the new version until they render cleanly.
//!
//! [`Version`]: cleanup_map_publish_models::Version

pub mod metadata;
pub mod progress;
pub mod publisher;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cleanup_map_geo_models::PRIMARY_ZOOM;
use cleanup_map_r2::R2Error;
use cleanup_map_raster::Palette;
use cleanup_map_tracker::TrackerError;

pub use publisher::VersionPublisher;

/// Tiles merged concurrently unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Attribution written into the tileset descriptor.
pub const DEFAULT_ATTRIBUTION: &str = "Citizen Reporting System";

/// License written into the tileset descriptor.
pub const DEFAULT_LICENSE: &str = "CC BY 4.0";

/// Errors from the steps of a publish cycle.
///
/// These never escape [`VersionPublisher::publish_area`]; they become the
/// reason of a failed [`CycleOutcome`](cleanup_map_publish_models::CycleOutcome).
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Key-value store failure.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// Object store failure.
    #[error(transparent)]
    Store(#[from] R2Error),

    /// A metadata document could not be serialized.
    #[error("Failed to serialize {document}: {source}")]
    Serialize {
        /// Which document.
        document: &'static str,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// What to do with a merged tile that has no visible pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyTilePolicy {
    /// Upload it like any other tile.
    #[default]
    Upload,
    /// Leave it out of the new version.
    Skip,
}

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Zoom level tiles are rendered at.
    pub zoom: u8,
    /// Maximum tiles in flight.
    pub concurrency: usize,
    /// Copy tiles without changes from the previous version.
    pub copy_unchanged: bool,
    /// Handling of fully transparent tiles.
    pub empty_tiles: EmptyTilePolicy,
    /// Colours tiles are painted and read back with.
    pub palette: Palette,
    /// Tileset attribution.
    pub attribution: String,
    /// Tileset license.
    pub license: String,
    /// Announce the version and clear the change set. When `false` the
    /// key-value store is only read.
    pub commit: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            zoom: PRIMARY_ZOOM,
            concurrency: DEFAULT_CONCURRENCY,
            copy_unchanged: true,
            empty_tiles: EmptyTilePolicy::default(),
            palette: Palette::default(),
            attribution: DEFAULT_ATTRIBUTION.to_string(),
            license: DEFAULT_LICENSE.to_string(),
            commit: true,
        }
    }
}

/// Cooperative cancellation flag shared between the caller and the tile
/// workers. Once triggered no new tile is started.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`trigger`](Self::trigger) was called on any clone.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_shared_between_clones() {
        let signal = ShutdownSignal::new();
        let worker = signal.clone();
        assert!(!worker.is_triggered());
        signal.trigger();
        assert!(worker.is_triggered());
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = PublishConfig::default();
        assert_eq!(config.zoom, 19);
        assert_eq!(config.concurrency, 8);
        assert!(config.copy_unchanged);
        assert_eq!(config.empty_tiles, EmptyTilePolicy::Upload);
        assert!(config.commit);
    }
}
