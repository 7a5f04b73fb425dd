//! S3-compatible object store tier
//!
//! [`ObjectStore`] is the seam between the cache layers and the shared tier;
//! [`S3Store`] is the production implementation, [`super::MemoryStore`] backs
//! the tests. A missing object is an expected miss (`Ok(None)`), never an
//! error. Transient failures retry with backoff; an auth failure disables
//! uploads for the rest of the process while reads keep being attempted.

use crate::retry_with_backoff;
use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use buildstash_core::config::{RetryConfig, StoreConfig};
use buildstash_core::{Error, Result};
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Shared object-storage tier
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the object at `key`; `None` when it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `data` at `key`.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Stream the local file at `path` to `key`.
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;

    /// Size of the object at `key`; `None` when it does not exist.
    async fn head(&self, key: &str) -> Result<Option<u64>>;
}

/// Object store backed by an S3-compatible service
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    retry: RetryConfig,
    uploads_disabled: AtomicBool,
}

impl S3Store {
    /// Connect using the ambient AWS environment plus the given config.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        if cfg.bucket.is_empty() {
            return Err(Error::configuration("object store bucket must not be empty"));
        }
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(cfg.region.clone()));
        if let Some(endpoint) = &cfg.endpoint {
            info!(endpoint = %endpoint, "Using object store endpoint override");
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(cfg.path_style)
            .build();

        info!(bucket = %cfg.bucket, region = %cfg.region, "Object store configured");
        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: cfg.bucket.clone(),
            retry: cfg.retry.clone(),
            uploads_disabled: AtomicBool::new(false),
        })
    }

    /// Whether uploads were disabled after an auth failure.
    #[must_use]
    pub fn uploads_disabled(&self) -> bool {
        self.uploads_disabled.load(Ordering::Relaxed)
    }

    /// Record an upload error, latching the disable flag on auth failures.
    fn note_upload_error(&self, err: &Error) {
        if matches!(err, Error::RemoteAuth { .. })
            && !self.uploads_disabled.swap(true, Ordering::Relaxed)
        {
            warn!(
                error = %err,
                "Object store denied an upload; uploads disabled, reads continue"
            );
        }
    }

    fn check_uploads_enabled(&self) -> Result<()> {
        if self.uploads_disabled() {
            Err(Error::UploadsDisabled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        retry_with_backoff(&self.retry, "GetObject", || async {
            let result = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await;
            match result {
                Ok(output) => {
                    let data = output
                        .body
                        .collect()
                        .await
                        .map_err(|e| Error::remote("GetObject", e.to_string()))?;
                    Ok(Some(data.into_bytes()))
                }
                Err(err) => {
                    if err
                        .as_service_error()
                        .is_some_and(|e| e.is_no_such_key())
                    {
                        return Ok(None);
                    }
                    Err(classify_sdk_error("GetObject", &err))
                }
            }
        })
        .await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.check_uploads_enabled()?;
        let result = retry_with_backoff(&self.retry, "PutObject", || {
            let body = ByteStream::from(data.clone());
            async {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(body)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_sdk_error("PutObject", &e))
            }
        })
        .await;
        if let Err(err) = &result {
            self.note_upload_error(err);
        }
        result
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        self.check_uploads_enabled()?;
        let result = retry_with_backoff(&self.retry, "PutObject", || async {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|e| Error::remote_fatal("PutObject", e.to_string()))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk_error("PutObject", &e))
        })
        .await;
        if let Err(err) = &result {
            self.note_upload_error(err);
        }
        result
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        retry_with_backoff(&self.retry, "HeadObject", || async {
            let result = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await;
            match result {
                Ok(output) => {
                    let size = output.content_length().unwrap_or(0).max(0) as u64;
                    Ok(Some(size))
                }
                Err(err) => {
                    if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                        return Ok(None);
                    }
                    Err(classify_sdk_error("HeadObject", &err))
                }
            }
        })
        .await
    }
}

/// Map an SDK error to the workspace error taxonomy.
///
/// Timeouts, dispatch failures, 429s, and 5xx responses are retryable;
/// 401/403 (or an `AccessDenied` error code) is an auth failure; anything
/// else is fatal and surfaces unchanged.
fn classify_sdk_error<E>(operation: &str, err: &SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let message = err
        .as_service_error()
        .and_then(|e| e.message())
        .map_or_else(|| err.to_string(), str::to_string);

    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Error::remote(operation, message)
        }
        SdkError::ConstructionFailure(_) => Error::remote_fatal(operation, message),
        SdkError::ServiceError(_) => {
            let status = err.raw_response().map(|r| r.status().as_u16());
            let code = err
                .as_service_error()
                .and_then(|e| e.code())
                .unwrap_or_default();
            debug!(
                operation,
                status = ?status,
                code,
                "Object store service error"
            );
            match status {
                Some(401 | 403) => Error::remote_auth(operation, message),
                Some(429) | Some(500..=599) => Error::remote(operation, message),
                _ if code == "AccessDenied" || code == "InvalidAccessKeyId" => {
                    Error::remote_auth(operation, message)
                }
                _ => Error::remote_fatal(operation, message),
            }
        }
        _ => Error::remote(operation, message),
    }
}
