#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Object storage for published tiles and metadata.
//!
//! [`ObjectStore`] is the seam the publisher talks to. Two implementations
//! are provided:
//!
//! * [`R2Client`]: Cloudflare R2 through the S3 API
//! * [`MemoryStore`]: an in-process map, used by tests and `--dry-run`
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `CLOUDFLARE_R2_ACCESS_KEY_ID` | Yes | S3-compatible access key for R2 |
//! | `CLOUDFLARE_R2_SECRET_ACCESS_KEY` | Yes | S3-compatible secret key for R2 |
//! | `CLOUDFLARE_R2_BUCKET_NAME` | Yes | Bucket holding the tile sets |
//! | `CLOUDFLARE_R2_ENDPOINT` | One of | Full endpoint URL |
//! | `CLOUDFLARE_ACCOUNT_ID` | One of | Builds `https://{id}.r2.cloudflarestorage.com` |

mod client;
mod memory;

use std::collections::BTreeSet;

use cleanup_map_retry::{TimeoutError, Transient};

pub use client::{R2Client, R2Config};
pub use memory::{FailOn, MemoryStore, StoredObject};

/// Errors that can occur during object store operations.
#[derive(Debug, thiserror::Error)]
pub enum R2Error {
    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// `GetObject` failed.
    #[error("Failed to download s3://{bucket}/{key}: {source}")]
    Download {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Whether a retry might succeed.
        transient: bool,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `PutObject` failed.
    #[error("Failed to upload s3://{bucket}/{key}: {source}")]
    Upload {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Whether a retry might succeed.
        transient: bool,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `CopyObject` failed.
    #[error("Failed to copy s3://{bucket}/{source_key} -> {destination_key}: {source}")]
    Copy {
        /// Bucket name.
        bucket: String,
        /// Key copied from.
        source_key: String,
        /// Key copied to.
        destination_key: String,
        /// Whether a retry might succeed.
        transient: bool,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `ListObjectsV2` failed.
    #[error("Failed to list s3://{bucket}/{prefix}: {source}")]
    List {
        /// Bucket name.
        bucket: String,
        /// Key prefix.
        prefix: String,
        /// Whether a retry might succeed.
        transient: bool,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An attempt exceeded the retry policy's timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

impl Transient for R2Error {
    fn is_transient(&self) -> bool {
        match self {
            Self::MissingEnv { .. } => false,
            Self::Download { transient, .. }
            | Self::Upload { transient, .. }
            | Self::Copy { transient, .. }
            | Self::List { transient, .. } => *transient,
            Self::Timeout(_) => true,
        }
    }
}

/// A flat key/value blob store with prefix listing.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches an object. Returns `None` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`R2Error::Download`] if the request fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, R2Error>;

    /// Writes an object, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns [`R2Error::Upload`] if the request fails.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        cache_control: &str,
    ) -> Result<(), R2Error>;

    /// Duplicates an object inside the store without transferring it
    /// through the client. Content type and cache control are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`R2Error::Copy`] if the request fails or `source` does not
    /// exist.
    async fn copy(&self, source: &str, destination: &str) -> Result<(), R2Error>;

    /// Lists every key starting with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`R2Error::List`] if the request fails.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, R2Error>;

    /// Lists the distinct path segments directly below `prefix`.
    ///
    /// For keys `a/1/x` and `a/2/y`, `list_child_prefixes("a/")` returns
    /// `{"1", "2"}`. Keys with no `/` after the prefix are not included.
    ///
    /// # Errors
    ///
    /// Returns [`R2Error::List`] if the request fails.
    async fn list_child_prefixes(&self, prefix: &str) -> Result<BTreeSet<String>, R2Error> {
        let keys = self.list_by_prefix(prefix).await?;
        Ok(child_segments(prefix, keys.iter().map(String::as_str)))
    }
}

/// Extracts the distinct first path segment under `prefix` from `keys`.
fn child_segments<'a>(prefix: &str, keys: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    keys.filter_map(|key| key.strip_prefix(prefix))
        .filter_map(|rest| rest.split_once('/'))
        .map(|(segment, _)| segment)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads a required environment variable.
///
/// # Errors
///
/// Returns [`R2Error::MissingEnv`] if the variable is unset or empty.
pub fn require_env(name: &str) -> Result<String, R2Error> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| R2Error::MissingEnv {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_segments_skip_leaf_objects() {
        let keys = [
            "guangfu/1700000000/19/1/2.png",
            "guangfu/1700000100/metadata.json",
            "guangfu/tilesetmetadata.json",
            "other/1/x",
        ];
        let children = child_segments("guangfu/", keys.into_iter());
        assert_eq!(
            children.into_iter().collect::<Vec<_>>(),
            vec!["1700000000".to_string(), "1700000100".to_string()]
        );
    }

    #[test]
    fn timeouts_are_transient() {
        let err = R2Error::from(TimeoutError {
            label: "get".to_string(),
            timeout: std::time::Duration::from_secs(1),
        });
        assert!(err.is_transient());
        assert!(
            !R2Error::MissingEnv {
                name: "X".to_string()
            }
            .is_transient()
        );
    }
}
