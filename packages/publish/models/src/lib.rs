#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Types shared by the tile publisher and its callers.
//!
//! - [`Version`]: the Unix-seconds identifier of one immutable tile set
//! - [`documents`]: the JSON metadata written next to each version
//! - [`report`]: per-cycle outcome and counters
//! - [`keys`]: object store key layout

pub mod documents;
pub mod keys;
pub mod report;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use documents::{
    AccessUrls, ActualCoverage, CoverageDescriptor, GenerationStats, TilesetDescriptor,
    VersionCoverage, VersionDescriptor, VersionEntry, VersionIndex,
};
pub use report::{
    CycleOutcome, CycleReport, CycleStats, PublishStage, RunSummary, TileFailure, TileOperation,
};

/// Error returned when a string is not a valid [`Version`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid version: {value}")]
pub struct InvalidVersionError {
    /// The rejected input.
    pub value: String,
}

/// Identifier of one published tile set: whole seconds since the Unix
/// epoch, rendered in decimal.
///
/// Versions order numerically and are never reused. Serialized as a JSON
/// string (`"1759299905"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(u64);

impl Version {
    /// Wraps a raw seconds value.
    #[must_use]
    pub const fn new(seconds: u64) -> Self {
        Self(seconds)
    }

    /// Raw seconds value.
    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0
    }

    /// Picks the version for a new publish: the current time, or one past
    /// the previous version if the clock has not moved beyond it.
    #[must_use]
    pub fn allocate(now: u64, previous: Option<Self>) -> Self {
        match previous {
            Some(prev) => Self(now.max(prev.0.saturating_add(1))),
            None => Self(now),
        }
    }

    /// Current wall-clock time in whole seconds.
    #[must_use]
    pub fn now_secs() -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }

    /// The version's timestamp as `YYYY-MM-DDTHH:MM:SSZ` (UTC).
    #[must_use]
    pub fn iso_datetime(self) -> String {
        i64::try_from(self.0)
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_default()
    }

    /// The version's timestamp as `YYYY-MM-DD HH:MM:SS` (UTC), for titles.
    #[must_use]
    pub fn display_datetime(self) -> String {
        i64::try_from(self.0)
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = InvalidVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidVersionError {
                value: s.to_string(),
            });
        }
        s.parse::<u64>().map(Self).map_err(|_| InvalidVersionError {
            value: s.to_string(),
        })
    }
}

impl TryFrom<String> for Version {
    type Error = InvalidVersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}
