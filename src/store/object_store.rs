//! S3-compatible object store client.
//!
//! Wraps the AWS SDK client with the operations the pipeline needs: tile and
//! preview uploads with long-lived cache headers, existence probes, whole-
//! object reads for proxying, paginated prefix deletion, and small JSON
//! metadata documents for demo datasets.
//!
//! When the tier is disabled (`USE_S3=false`) every operation is a cheap
//! no-op: writes succeed without effect, probes report absence.

use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::StoreError;

/// Cache-Control applied to every tile and preview upload (1 year).
const OBJECT_CACHE_CONTROL: &str = "public, max-age=31536000";

/// Bounded retry for transient failures: attempts 0..3, backoff 0.3 * 2^n s.
pub const MAX_PUT_ATTEMPTS: u32 = 3;

/// Maximum keys per batch-delete request.
const DELETE_BATCH_SIZE: usize = 1000;

/// Create an S3 client with optional custom endpoint and region.
///
/// S3-compatible services (R2, MinIO) need a custom endpoint and path-style
/// addressing; AWS S3 itself takes neither.
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    let s3_config = if endpoint_url.is_some() {
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build()
    } else {
        aws_sdk_s3::config::Builder::from(&sdk_config).build()
    };

    Client::from_conf(s3_config)
}

/// S3-compatible persistent blob tier for tiles, previews and metadata.
#[derive(Clone)]
pub struct ObjectStore {
    client: Option<Client>,
    bucket: String,
    public_url: Option<String>,
}

impl ObjectStore {
    /// Connect using the application configuration.
    ///
    /// Returns a disabled store when `use_s3` is off.
    pub async fn connect(config: &Config) -> Self {
        if !config.use_s3 {
            return Self::disabled();
        }

        let client =
            create_s3_client(config.s3_endpoint_url.as_deref(), &config.aws_region).await;

        Self {
            client: Some(client),
            bucket: config.bucket_name.clone(),
            public_url: config
                .public_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// Build a store from an existing client (integration tests, MinIO).
    pub fn from_client(client: Client, bucket: String, public_url: Option<String>) -> Self {
        Self {
            client: Some(client),
            bucket,
            public_url: public_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// A store with the tier switched off. All operations are no-ops.
    pub fn disabled() -> Self {
        Self {
            client: None,
            bucket: String::new(),
            public_url: None,
        }
    }

    /// Whether the tier is active.
    pub fn enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Whether redirects and public-URL fetches are possible.
    pub fn has_public_url(&self) -> bool {
        self.enabled() && self.public_url.is_some()
    }

    /// Absolute public URL for an object key, if a public base is configured.
    pub fn public_url(&self, key: &str) -> Option<String> {
        if !self.enabled() {
            return None;
        }
        self.public_url
            .as_ref()
            .map(|base| format!("{}/{}", base, key))
    }

    /// Upload raw bytes under `key` with the given content type.
    ///
    /// Idempotent for the same key. Retries transient failures up to
    /// [`MAX_PUT_ATTEMPTS`] times with exponential backoff (0.3 * 2^n s).
    /// Returns `Ok(false)` when the tier is disabled.
    pub async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<bool, StoreError> {
        let Some(client) = &self.client else {
            return Ok(false);
        };

        let mut attempt = 0u32;
        loop {
            let result = client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .cache_control(OBJECT_CACHE_CONTROL)
                .body(body.clone().into())
                .send()
                .await;

            match result {
                Ok(_) => {
                    debug!(key, "uploaded object");
                    return Ok(true);
                }
                Err(e) if attempt + 1 < MAX_PUT_ATTEMPTS => {
                    let delay = Duration::from_millis(300 * (1 << attempt));
                    warn!(key, attempt, error = %e, "put failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(StoreError::S3(e.to_string())),
            }
        }
    }

    /// Upload a local file under `key`.
    pub async fn put_file(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<bool, StoreError> {
        if !self.enabled() {
            return Ok(false);
        }
        let body = tokio::fs::read(local_path)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        self.put(key, Bytes::from(body), content_type).await
    }

    /// Check whether an object exists.
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let Some(client) = &self.client else {
            return Ok(false);
        };

        match client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false)
                    || e.raw_response()
                        .map(|r| r.status().as_u16() == 404)
                        .unwrap_or(false);
                if not_found {
                    Ok(false)
                } else {
                    Err(StoreError::S3(e.to_string()))
                }
            }
        }
    }

    /// Fetch an object's bytes and content type.
    ///
    /// Tiles are small, so the body is collected rather than streamed; the
    /// server proxies the collected bytes.
    pub async fn get(&self, key: &str) -> Result<(Bytes, Option<String>), StoreError> {
        let Some(client) = &self.client else {
            return Err(StoreError::NotFound(key.to_string()));
        };

        let resp = client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| matches!(se, aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)))
                    .unwrap_or(false);
                if not_found {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::S3(e.to_string())
                }
            })?;

        let content_type = resp.content_type().map(|s| s.to_string());
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .into_bytes();

        Ok((data, content_type))
    }

    /// Delete a single object. Idempotent.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let Some(client) = &self.client else {
            return Ok(());
        };

        client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::S3(e.to_string()))?;
        Ok(())
    }

    /// Delete every object under `prefix`. Paginates and batch-deletes.
    ///
    /// Returns the number of objects removed. Idempotent.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let Some(client) = &self.client else {
            return Ok(0);
        };

        let mut deleted = 0usize;
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(DELETE_BATCH_SIZE as i32);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let page = request
                .send()
                .await
                .map_err(|e| StoreError::S3(e.to_string()))?;

            let identifiers: Vec<ObjectIdentifier> = page
                .contents()
                .iter()
                .filter_map(|obj| obj.key())
                .filter_map(|key| ObjectIdentifier::builder().key(key).build().ok())
                .collect();

            if !identifiers.is_empty() {
                let count = identifiers.len();
                let delete = Delete::builder()
                    .set_objects(Some(identifiers))
                    .build()
                    .map_err(|e| StoreError::S3(e.to_string()))?;

                client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| StoreError::S3(e.to_string()))?;
                deleted += count;
            }

            if page.is_truncated() == Some(true) {
                continuation_token = page.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        debug!(prefix, deleted, "deleted prefix");
        Ok(deleted)
    }

    /// Persist a small JSON metadata document.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<bool, StoreError> {
        let body = serde_json::to_vec_pretty(value)?;
        self.put(key, Bytes::from(body), "application/json").await
    }

    /// List and parse every JSON document under `prefix`.
    ///
    /// Documents that fail to parse are skipped with a warning rather than
    /// failing the whole listing.
    pub async fn list_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<T>, StoreError> {
        let Some(client) = &self.client else {
            return Ok(Vec::new());
        };

        let mut documents = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(1000);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let page = request
                .send()
                .await
                .map_err(|e| StoreError::S3(e.to_string()))?;

            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                if !key.ends_with(".json") {
                    continue;
                }
                let (bytes, _) = self.get(key).await?;
                match serde_json::from_slice::<T>(&bytes) {
                    Ok(doc) => documents.push(doc),
                    Err(e) => warn!(key, error = %e, "skipping unparsable metadata document"),
                }
            }

            if page.is_truncated() == Some(true) {
                continuation_token = page.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(documents)
    }
}

// =============================================================================
// Tests
// =============================================================================
