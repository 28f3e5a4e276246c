//! Blob store backed by Amazon S3 or an S3-compatible service.

use crate::backend::BlobStore;
use crate::error::{StorageError, StorageResult};
use crate::key::{logical_name, normalize_prefix, object_key, validate_name};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const BACKEND: &str = "s3";

/// Connection settings for [`S3BlobStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Bucket holding the database blobs.
    pub bucket: String,
    /// Region override. Falls back to the ambient AWS configuration.
    pub region: Option<String>,
    /// Key prefix applied to every blob.
    pub prefix: Option<String>,
    /// Custom endpoint for S3-compatible services such as MinIO.
    pub endpoint: Option<String>,
    /// Use path-style addressing (`endpoint/bucket/key`).
    pub force_path_style: bool,
}

impl S3Config {
    /// Creates a configuration for the given bucket.
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets the key prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets a custom endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn validate(&self) -> StorageResult<()> {
        if self.bucket.trim().is_empty() {
            return Err(StorageError::Config("s3 bucket is required".into()));
        }
        Ok(())
    }
}

/// A blob store that keeps each database as `<prefix><name>.sqlite` in a bucket.
///
/// Credentials come from the standard AWS provider chain (environment,
/// profile files, instance metadata).
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl std::fmt::Debug for S3BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobStore")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3BlobStore {
    /// Builds a client from the ambient AWS configuration and `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the bucket or prefix is invalid.
    pub async fn connect(config: &S3Config) -> StorageResult<Self> {
        config.validate()?;
        let prefix = normalize_prefix(config.prefix.as_deref())?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(normalize_endpoint(endpoint));
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        debug!(bucket = %config.bucket, prefix = %prefix, "s3 blob store configured");
        Ok(Self::with_client(
            Client::from_conf(builder.build()),
            config.bucket.clone(),
            prefix,
        ))
    }

    /// Wraps an existing client. `prefix` must already be normalized.
    #[must_use]
    pub fn with_client(client: Client, bucket: impl Into<String>, prefix: String) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    fn key(&self, name: &str) -> StorageResult<String> {
        validate_name(name)?;
        Ok(object_key(&self.prefix, name))
    }
}

/// Adds a scheme to bare `host:port` endpoints.
fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::ServiceError(service) => service.raw().status().as_u16() == 404,
        _ => false,
    }
}

fn sdk_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::backend(BACKEND, DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn download(&self, name: &str) -> StorageResult<Option<Bytes>> {
        let key = self.key(name)?;
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(sdk_error(err)),
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend(BACKEND, e.to_string()))?
            .into_bytes();
        Ok(Some(data))
    }

    #[instrument(skip(self, data), fields(backend = "s3", bucket = %self.bucket, size = data.len()))]
    async fn upload(&self, name: &str, data: Bytes) -> StorageResult<()> {
        let key = self.key(name)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/vnd.sqlite3")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if !self.prefix.is_empty() {
                request = request.prefix(&self.prefix);
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(sdk_error)?;
            for object in output.contents() {
                if let Some(name) = object.key().and_then(|k| logical_name(&self.prefix, k)) {
                    names.push(name.to_string());
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn delete(&self, name: &str) -> StorageResult<()> {
        let key = self.key(name)?;
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(sdk_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn exists(&self, name: &str) -> StorageResult<bool> {
        let key = self.key(name)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(sdk_error(err)),
        }
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
