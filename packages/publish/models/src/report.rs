//! Per-cycle outcome reporting.

use std::time::Duration;

use cleanup_map_geo_models::TileAddress;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::Version;

/// Stages of a publish cycle, in order.
///
/// A cycle's [`CycleReport::stage_reached`] is the last stage it completed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishStage {
    /// Nothing done yet.
    #[default]
    Idle,
    /// The change set was read.
    ChangesetRead,
    /// Changed points were grouped into tiles.
    TilesResolved,
    /// Tiles were merged with their previous rasters.
    TilesMerged,
    /// Tiles were uploaded under the new version.
    TilesUploaded,
    /// Metadata documents were written and the version announced.
    MetadataPublished,
    /// The change set was deleted.
    ChangesetCleared,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleOutcome {
    /// The change set was empty.
    NoChanges,
    /// Changes existed but none fell inside the area.
    NoTilesToUpdate,
    /// A new version was published.
    Published {
        /// The new version.
        version: Version,
    },
    /// The cycle stopped early.
    Failed {
        /// Stage that failed.
        stage: PublishStage,
        /// Human-readable reason.
        reason: String,
    },
}

impl CycleOutcome {
    /// Returns `true` for every outcome except [`CycleOutcome::Failed`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// The published version, if any.
    #[must_use]
    pub const fn version(&self) -> Option<Version> {
        match self {
            Self::Published { version } => Some(*version),
            _ => None,
        }
    }
}

/// Tile-level step that can fail without failing the cycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TileOperation {
    /// Fetching the previous raster.
    Download,
    /// Decoding, painting or encoding.
    Merge,
    /// Writing the new raster.
    Upload,
    /// Duplicating an unchanged raster.
    Copy,
}

/// A tile that was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileFailure {
    /// The tile.
    pub tile: TileAddress,
    /// What failed.
    pub operation: TileOperation,
    /// Error message.
    pub reason: String,
}

/// Counters collected during a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub pending_keys: usize,
    pub unparseable_keys: usize,
    pub out_of_bounds_keys: usize,
    pub affected_tiles: usize,
    pub tiles_processed: u64,
    pub tiles_skipped_empty: u64,
    pub tiles_downloaded: u64,
    pub tiles_copied: u64,
    pub bytes_uploaded: u64,
    pub foreign_pixels: u64,
    pub discarded_rasters: u64,
}

/// Everything known about one area's cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Area name.
    pub area: String,
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Last completed stage.
    pub stage_reached: PublishStage,
    /// Version the cycle built on.
    pub previous_version: Option<Version>,
    /// Counters.
    pub stats: CycleStats,
    /// Tiles that were skipped.
    pub failures: Vec<TileFailure>,
    /// Whether the change set was deleted.
    pub changeset_cleared: bool,
    /// Wall-clock time of the cycle.
    pub elapsed: Duration,
}

impl CycleReport {
    /// Starts a report for `area` at [`PublishStage::Idle`].
    #[must_use]
    pub fn new(area: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            outcome: CycleOutcome::NoChanges,
            stage_reached: PublishStage::Idle,
            previous_version: None,
            stats: CycleStats::default(),
            failures: Vec::new(),
            changeset_cleared: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Marks `stage` as completed.
    pub fn reach(&mut self, stage: PublishStage) {
        self.stage_reached = stage;
    }
}

/// Reports for every area of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// One report per area, in run order.
    pub reports: Vec<CycleReport>,
}

impl RunSummary {
    /// Number of areas that published a new version.
    #[must_use]
    pub fn published(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.version().is_some())
            .count()
    }

    /// Number of areas whose cycle failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| !r.outcome.is_success())
            .count()
    }

    /// Returns `true` if no cycle failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}
