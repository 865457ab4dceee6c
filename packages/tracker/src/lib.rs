#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Change-set tracking for the cleanup map.
//!
//! The reporting backend records every point whose state changed in a Redis
//! set per area and keeps two trust scores per point in a hash. This crate
//! reads those through the [`KeyValueStore`] seam and exposes them as typed
//! operations on [`ChangeTracker`].
//!
//! ## Key layout
//!
//! | Key | Type | Meaning |
//! |---|---|---|
//! | `changed_coords:{area}` | set | pending change set |
//! | `geo:{area}:{geoKey}` | hash (`Score_0`, `Score_1`) | clear / muddy trust scores |
//! | `tile_version:{area}` | string | latest announced version |
//! | `test_areas:list` | set | ids of remotely defined test areas |
//! | `test_areas:{id}` | string | base64-encoded JSON area definition |

mod memory;
mod tracker;
mod upstash;

use cleanup_map_retry::{TimeoutError, Transient};

pub use memory::MemoryKeyValueStore;
pub use tracker::{ChangeTracker, CLEAR_SCORE_FIELD, MUDDY_SCORE_FIELD};
pub use upstash::{UpstashClient, UpstashConfig};

/// Errors that can occur while talking to the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// The HTTP request could not be completed.
    #[error("{command} request failed: {source}")]
    Http {
        /// Redis command being sent.
        command: String,
        /// Underlying HTTP error.
        source: reqwest::Error,
    },

    /// The store answered with a non-success HTTP status.
    #[error("{command} returned HTTP {status}: {body}")]
    Status {
        /// Redis command being sent.
        command: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The store rejected the command.
    #[error("{command} failed: {message}")]
    Command {
        /// Redis command being sent.
        command: String,
        /// Error message returned by the store.
        message: String,
    },

    /// The response did not have the expected shape.
    #[error("Unexpected response to {command}: {message}")]
    UnexpectedResponse {
        /// Redis command being sent.
        command: String,
        /// Description of the mismatch.
        message: String,
    },

    /// An attempt exceeded the retry policy's timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

impl Transient for TrackerError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
            }
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Timeout(_) => true,
            Self::MissingEnv { .. } | Self::Command { .. } | Self::UnexpectedResponse { .. } => {
                false
            }
        }
    }
}

/// Minimal Redis command surface used by the tracker.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `SMEMBERS key`. A missing key is an empty set.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the command fails.
    async fn members_of(&self, key: &str) -> Result<Vec<String>, TrackerError>;

    /// `HMGET key field...`, one entry per requested field.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the command fails.
    async fn hash_fields_of(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, TrackerError>;

    /// `HMGET` over many keys. Implementations may batch the requests.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if any command fails.
    async fn hash_fields_of_many(
        &self,
        keys: &[String],
        fields: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, TrackerError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.hash_fields_of(key, fields).await?);
        }
        Ok(out)
    }

    /// `GET key`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the command fails.
    async fn get(&self, key: &str) -> Result<Option<String>, TrackerError>;

    /// `SET key value`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the command fails.
    async fn set(&self, key: &str, value: &str) -> Result<(), TrackerError>;

    /// `DEL key`. Returns `true` if a key was removed.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the command fails.
    async fn delete(&self, key: &str) -> Result<bool, TrackerError>;
}

/// Reads a required environment variable.
///
/// # Errors
///
/// Returns [`TrackerError::MissingEnv`] if the variable is unset or empty.
pub fn require_env(name: &str) -> Result<String, TrackerError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| TrackerError::MissingEnv {
            name: name.to_string(),
        })
}
