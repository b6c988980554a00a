//! Object storage backends (S3 + local filesystem) and retry utilities.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0:#}")]
    Transient(anyhow::Error),
    #[error("store failure: {0:#}")]
    Permanent(anyhow::Error),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) | Self::Timeout(_) => RetryDisposition::Retryable,
            Self::Permanent(_) => RetryDisposition::NonRetryable,
        }
    }
}

pub fn classify_io_error(err: &std::io::Error) -> RetryDisposition {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

fn io_store_error(err: std::io::Error, what: String) -> StoreError {
    let disposition = classify_io_error(&err);
    let err = anyhow::Error::new(err).context(what);
    match disposition {
        RetryDisposition::Retryable => StoreError::Transient(err),
        RetryDisposition::NonRetryable => StoreError::Permanent(err),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` under the policy's per-attempt timeout, retrying transient failures
/// with exponential backoff. Permanent failures are returned immediately.
pub async fn with_retries<T, F, Fut>(policy: &BackoffPolicy, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        let result = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(policy.attempt_timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < policy.max_retries =>
            {
                let delay = policy.delay_for_attempt(attempt);
                warn!(what, attempt, ?delay, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Create `key` only when nothing exists there yet. Exactly one concurrent
    /// caller observes `Created` for a given key.
    async fn put_object_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<PutOutcome, StoreError>;

    async fn head_object(&self, key: &str) -> Result<bool, StoreError>;

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn delete_object(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let conf = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::new(aws_sdk_s3::Client::new(&conf), bucket)
    }
}

fn sdk_status<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|resp| resp.status().as_u16())
}

fn classify_sdk_error<E>(err: SdkError<E, HttpResponse>, what: String) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let disposition = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            RetryDisposition::Retryable
        }
        _ => match sdk_status(&err) {
            Some(status) if status >= 500 || status == 429 => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        },
    };
    let err = anyhow!("{what}: {}", DisplayErrorContext(err));
    match disposition {
        RetryDisposition::Retryable => StoreError::Transient(err),
        RetryDisposition::NonRetryable => StoreError::Permanent(err),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, format!("put s3://{}/{key}", self.bucket)))?;
        Ok(())
    }

    async fn put_object_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<PutOutcome, StoreError> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(ByteStream::from(bytes))
            .send()
            .await;

        match result {
            Ok(_) => Ok(PutOutcome::Created),
            Err(err) => match sdk_status(&err) {
                Some(412) => Ok(PutOutcome::AlreadyExists),
                // A concurrent conditional write on the same key; safe to retry.
                Some(409) => Err(StoreError::transient(anyhow!(
                    "conditional put conflict on s3://{}/{key}",
                    self.bucket
                ))),
                _ => Err(classify_sdk_error(
                    err,
                    format!("conditional put s3://{}/{key}", self.bucket),
                )),
            },
        }
    }

    async fn head_object(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                    || sdk_status(&err) == Some(404);
                if not_found {
                    Ok(false)
                } else {
                    Err(classify_sdk_error(err, format!("head s3://{}/{key}", self.bucket)))
                }
            }
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let missing = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                    || sdk_status(&err) == Some(404);
                if missing {
                    return Ok(None);
                }
                return Err(classify_sdk_error(err, format!("get s3://{}/{key}", self.bucket)));
            }
        };

        let body = output.body.collect().await.map_err(|e| {
            StoreError::transient(anyhow!("reading body of s3://{}/{key}: {e}", self.bucket))
        })?;
        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(t) = &token {
                req = req.continuation_token(t);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| classify_sdk_error(e, format!("list s3://{}/{prefix}", self.bucket)))?;

            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(ToString::to_string)),
            );

            token = resp.next_continuation_token().map(ToString::to_string);
            if !resp.is_truncated().unwrap_or(false) || token.is_none() {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, format!("delete s3://{}/{key}", self.bucket)))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    fn bucket_dir(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::permanent(anyhow!("invalid object key {key:?}")));
        }
        Ok(self.bucket_dir().join(relative))
    }

    async fn write_temp(&self, path: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::permanent(anyhow!("object path {} has no parent", path.display())))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_store_error(e, format!("creating directory {}", parent.display())))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| io_store_error(e, format!("opening temp file {}", temp_path.display())))?;
        file.write_all(bytes)
            .await
            .map_err(|e| io_store_error(e, format!("writing temp file {}", temp_path.display())))?;
        file.flush()
            .await
            .map_err(|e| io_store_error(e, format!("flushing temp file {}", temp_path.display())))?;
        drop(file);
        Ok(temp_path)
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        let temp_path = self.write_temp(&path, &bytes).await?;
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_store_error(
                err,
                format!("renaming {} -> {}", temp_path.display(), path.display()),
            ));
        }
        Ok(())
    }

    async fn put_object_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<PutOutcome, StoreError> {
        let path = self.object_path(key)?;
        let temp_path = self.write_temp(&path, &bytes).await?;
        // hard_link refuses to replace an existing file, which makes it the atomic create step.
        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(PutOutcome::Created),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(PutOutcome::AlreadyExists),
            Err(err) => Err(io_store_error(err, format!("linking {}", path.display()))),
        }
    }

    async fn head_object(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.object_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| io_store_error(e, format!("checking {}", path.display())))
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_store_error(err, format!("reading {}", path.display()))),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = self.bucket_dir();
        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_store_error(err, format!("listing {}", dir.display()))),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_store_error(e, format!("listing {}", dir.display())))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_store_error(e, format!("inspecting {}", path.display())))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if is_temp_file(&entry.file_name().to_string_lossy()) {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&base) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        debug!(bucket = %self.bucket, prefix, count = keys.len(), "listed local objects");
        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_store_error(err, format!("removing {}", path.display()))),
        }
    }
}
