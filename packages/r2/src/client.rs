//! Cloudflare R2 implementation of [`ObjectStore`].

use std::collections::BTreeSet;

use aws_config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use cleanup_map_retry::RetryPolicy;

use crate::{ObjectStore, R2Error, require_env};

/// Connection settings for [`R2Client`].
#[derive(Debug, Clone)]
pub struct R2Config {
    /// S3 endpoint URL.
    pub endpoint: String,
    /// Bucket holding all tile sets.
    pub bucket: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Retry policy applied to every request.
    pub retry: RetryPolicy,
}

impl R2Config {
    /// Reads the configuration from the environment.
    ///
    /// The endpoint comes from `CLOUDFLARE_R2_ENDPOINT` (or the first entry
    /// of the comma-separated `CLOUDFLARE_R2_ENDPOINTS`), falling back to
    /// one built from `CLOUDFLARE_ACCOUNT_ID`.
    ///
    /// # Errors
    ///
    /// Returns [`R2Error::MissingEnv`] if any required variable is unset.
    pub fn from_env() -> Result<Self, R2Error> {
        let access_key_id = require_env("CLOUDFLARE_R2_ACCESS_KEY_ID")?;
        let secret_access_key = require_env("CLOUDFLARE_R2_SECRET_ACCESS_KEY")?;
        let bucket = require_env("CLOUDFLARE_R2_BUCKET_NAME")?;

        let endpoint = match require_env("CLOUDFLARE_R2_ENDPOINT") {
            Ok(endpoint) => endpoint,
            Err(_) => match require_env("CLOUDFLARE_R2_ENDPOINTS") {
                Ok(list) => list
                    .split(',')
                    .map(str::trim)
                    .find(|e| !e.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| R2Error::MissingEnv {
                        name: "CLOUDFLARE_R2_ENDPOINTS".to_string(),
                    })?,
                Err(_) => {
                    let account_id = require_env("CLOUDFLARE_ACCOUNT_ID")?;
                    format!("https://{account_id}.r2.cloudflarestorage.com")
                }
            },
        };

        Ok(Self {
            endpoint,
            bucket,
            access_key_id,
            secret_access_key,
            retry: RetryPolicy::default(),
        })
    }
}

/// Client for reading and writing tile sets in Cloudflare R2.
pub struct R2Client {
    client: aws_sdk_s3::Client,
    bucket: String,
    retry: RetryPolicy,
}

impl R2Client {
    /// Creates a client from explicit settings.
    #[must_use]
    pub fn new(config: &R2Config) -> Self {
        let creds = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "r2-env",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .endpoint_url(&config.endpoint)
            .region(Region::new("auto"))
            .credentials_provider(creds)
            .force_path_style(true)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            retry: config.retry,
        }
    }

    /// Creates a client from environment variables (see [`R2Config::from_env`]).
    ///
    /// # Errors
    ///
    /// Returns [`R2Error::MissingEnv`] if any required variable is unset.
    pub fn from_env() -> Result<Self, R2Error> {
        Ok(Self::new(&R2Config::from_env()?))
    }

    /// Bucket this client writes to.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get_once(&self, key: &str) -> Result<Option<Vec<u8>>, R2Error> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                // NoSuchKey: the object does not exist
                if err
                    .as_service_error()
                    .is_some_and(GetObjectError::is_no_such_key)
                {
                    return Ok(None);
                }
                return Err(R2Error::Download {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    transient: is_transient_sdk(&err),
                    source: Box::new(err),
                });
            }
        };

        let bytes = output.body.collect().await.map_err(|e| R2Error::Download {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            transient: true,
            source: Box::new(e),
        })?;

        Ok(Some(bytes.into_bytes().to_vec()))
    }

    async fn put_once(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        cache_control: &str,
    ) -> Result<(), R2Error> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .content_type(content_type)
            .cache_control(cache_control)
            .send()
            .await
            .map_err(|e| R2Error::Upload {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                transient: is_transient_sdk(&e),
                source: Box::new(e),
            })?;

        Ok(())
    }

    async fn copy_once(&self, source: &str, destination: &str) -> Result<(), R2Error> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{source}", self.bucket))
            .key(destination)
            .send()
            .await
            .map_err(|e| R2Error::Copy {
                bucket: self.bucket.clone(),
                source_key: source.to_string(),
                destination_key: destination.to_string(),
                transient: is_transient_sdk(&e),
                source: Box::new(e),
            })?;

        Ok(())
    }

    /// Pages through `ListObjectsV2`, collecting keys and (with a
    /// delimiter) common prefixes.
    async fn list_once(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<(Vec<String>, Vec<String>), R2Error> {
        let mut keys = Vec::new();
        let mut common_prefixes = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(delimiter) = delimiter {
                request = request.delimiter(delimiter);
            }
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(|e| R2Error::List {
                bucket: self.bucket.clone(),
                prefix: prefix.to_string(),
                transient: is_transient_sdk(&e),
                source: Box::new(e),
            })?;

            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            for common in output.common_prefixes() {
                if let Some(p) = common.prefix() {
                    common_prefixes.push(p.to_string());
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        Ok((keys, common_prefixes))
    }
}

#[async_trait::async_trait]
impl ObjectStore for R2Client {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, R2Error> {
        log::debug!("Fetching s3://{}/{key}", self.bucket);
        self.retry
            .run(&format!("get {key}"), || self.get_once(key))
            .await
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        cache_control: &str,
    ) -> Result<(), R2Error> {
        log::debug!(
            "Uploading s3://{}/{key} ({} bytes, {content_type})",
            self.bucket,
            body.len()
        );
        self.retry
            .run(&format!("put {key}"), || {
                self.put_once(key, body.clone(), content_type, cache_control)
            })
            .await
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<(), R2Error> {
        log::debug!("Copying s3://{}/{source} -> {destination}", self.bucket);
        self.retry
            .run(&format!("copy {source}"), || {
                self.copy_once(source, destination)
            })
            .await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, R2Error> {
        log::info!("Listing s3://{}/{prefix}*", self.bucket);
        let (mut keys, _) = self
            .retry
            .run(&format!("list {prefix}"), || self.list_once(prefix, None))
            .await?;
        keys.sort();
        log::info!("  found {} objects", keys.len());
        Ok(keys)
    }

    async fn list_child_prefixes(&self, prefix: &str) -> Result<BTreeSet<String>, R2Error> {
        let (_, common) = self
            .retry
            .run(&format!("list {prefix}"), || {
                self.list_once(prefix, Some("/"))
            })
            .await?;

        Ok(common
            .iter()
            .filter_map(|p| p.strip_prefix(prefix))
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Timeouts, dispatch failures, throttling and 5xx responses are retried.
fn is_transient_sdk<E>(err: &SdkError<E, HttpResponse>) -> bool {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        _ => err.raw_response().is_some_and(|response| {
            let status = response.status().as_u16();
            status == 429 || status >= 500
        }),
    }
}
