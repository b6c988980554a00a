//! Run ingestion: identity resolution, image migration and the per-run orchestrator.

use std::collections::BTreeMap;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use fod_adapters::{report_draft_from_run, DestinationStore, FieldMapper, OfflineStore};
use fod_core::{
    fod_identity_key, fods_map_key, identity_prefix, image_key, object_uri, record_subject,
    report_identity_key, report_map_key, FodId, ImageRef, MigrationError, OfflineRecord,
    OnlineRecord, OnlineValue, ReportDraft, ReportId, RunId, DEFAULT_BUCKET,
};
use fod_storage::{with_retries, BackoffPolicy, ObjectStore, PutOutcome, StoreError};
use futures::stream::{self, StreamExt};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub bucket_name: String,
    pub user_id: u64,
    pub backoff: BackoffPolicy,
    /// How long to wait on a reservation held by another worker.
    pub identity_wait: BackoffPolicy,
    pub image_workers: usize,
    pub write_workers: usize,
    pub reports_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bucket_name: DEFAULT_BUCKET.to_string(),
            user_id: 0,
            backoff: BackoffPolicy::default(),
            identity_wait: BackoffPolicy {
                max_retries: 8,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
                attempt_timeout: Duration::from_secs(30),
            },
            image_workers: 5,
            write_workers: 8,
            reports_dir: None,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bucket_name: std::env::var("BUCKET_NAME").unwrap_or(defaults.bucket_name),
            user_id: env_parse("FOD_USER_ID", defaults.user_id),
            backoff: BackoffPolicy {
                max_retries: env_parse("FOD_MAX_RETRIES", defaults.backoff.max_retries),
                base_delay: Duration::from_millis(env_parse("FOD_RETRY_BASE_MS", 250)),
                max_delay: Duration::from_millis(env_parse("FOD_RETRY_MAX_MS", 5_000)),
                attempt_timeout: Duration::from_secs(env_parse("FOD_CALL_TIMEOUT_SECS", 30)),
            },
            identity_wait: defaults.identity_wait,
            image_workers: env_parse("FOD_IMAGE_WORKERS", defaults.image_workers).max(1),
            write_workers: env_parse("FOD_WRITE_WORKERS", defaults.write_workers).max(1),
            reports_dir: std::env::var("REPORTS_DIR").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreKind {
    S3,
    Local,
}

/// Where the collaborators live. Destination credentials are read separately
/// (`fod_adapters::DbCredentials::from_env`) since only `ingest` needs them.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub offline_database_url: String,
    pub object_store: ObjectStoreKind,
    pub local_object_root: PathBuf,
}

impl ConnectionSettings {
    pub fn from_env() -> Result<Self> {
        let object_store = match std::env::var("OBJECT_STORE")
            .unwrap_or_else(|_| "s3".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "s3" => ObjectStoreKind::S3,
            "local" => ObjectStoreKind::Local,
            other => bail!("OBJECT_STORE must be `s3` or `local`, got {other:?}"),
        };
        Ok(Self {
            offline_database_url: std::env::var("OFFLINE_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://app/offline-db/idra.sqlite".to_string()),
            object_store,
            local_object_root: std::env::var("LOCAL_OBJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./object-store")),
        })
    }
}

/// Content of one per-key identity object. `Pending` is the create-if-absent
/// reservation; only its owner may mint the destination ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdentityEntry {
    Pending {
        owner: Uuid,
        reserved_at: DateTime<Utc>,
    },
    Assigned {
        offline_id: String,
        online_id: u64,
        assigned_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub id: u64,
    /// True when this call minted the destination entity.
    pub created: bool,
}

pub struct IdentityMapper {
    objects: Arc<dyn ObjectStore>,
    destination: Arc<dyn DestinationStore>,
    backoff: BackoffPolicy,
    wait: BackoffPolicy,
    owner: Uuid,
}

fn identity_error(subject: &str, reason: impl Into<String>) -> MigrationError {
    MigrationError::IdentityResolution {
        subject: subject.to_string(),
        reason: reason.into(),
    }
}

impl IdentityMapper {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        destination: Arc<dyn DestinationStore>,
        backoff: BackoffPolicy,
        wait: BackoffPolicy,
    ) -> Self {
        Self {
            objects,
            destination,
            backoff,
            wait,
            owner: Uuid::new_v4(),
        }
    }

    pub fn with_owner(mut self, owner: Uuid) -> Self {
        self.owner = owner;
        self
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub async fn resolve_report_id(&self, draft: &ReportDraft) -> Result<Resolution, MigrationError> {
        let run_id = &draft.run_id;
        let subject = format!("run {run_id}");
        self.resolve(&report_identity_key(run_id), run_id.as_str(), &subject, || {
            self.destination.create_report(draft)
        })
        .await
    }

    pub async fn resolve_fod_id(
        &self,
        run_id: &RunId,
        report_id: ReportId,
        offline_id: &str,
    ) -> Result<Resolution, MigrationError> {
        let subject = record_subject(offline_id);
        self.resolve(&fod_identity_key(run_id, offline_id), offline_id, &subject, || {
            self.destination.create_fod(report_id, offline_id)
        })
        .await
    }

    async fn resolve<F, Fut>(
        &self,
        key: &str,
        offline_id: &str,
        subject: &str,
        mint: F,
    ) -> Result<Resolution, MigrationError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<u64, StoreError>> + Send,
    {
        let mut contended = 0usize;
        loop {
            match self.read_entry(key, subject).await? {
                Some(IdentityEntry::Assigned { online_id, .. }) => {
                    debug!(key, online_id, "reusing assigned identity");
                    return Ok(Resolution {
                        id: online_id,
                        created: false,
                    });
                }
                // Our own reservation whose put acknowledgement was lost.
                Some(IdentityEntry::Pending { owner, .. }) if owner == self.owner => {
                    debug!(key, %owner, "resuming own identity reservation");
                    return self.mint_and_assign(key, offline_id, subject, mint).await;
                }
                Some(IdentityEntry::Pending { owner, reserved_at }) => {
                    if contended >= self.wait.max_retries {
                        return Err(identity_error(
                            subject,
                            format!(
                                "reservation {key} held by {owner} since {reserved_at} never completed"
                            ),
                        ));
                    }
                    let delay = self.wait.delay_for_attempt(contended);
                    debug!(key, %owner, ?delay, "identity reserved by another worker, waiting");
                    tokio::time::sleep(delay).await;
                    contended += 1;
                }
                None => {
                    let reservation = IdentityEntry::Pending {
                        owner: self.owner,
                        reserved_at: Utc::now(),
                    };
                    let bytes = encode_entry(&reservation, subject)?;
                    let outcome = with_retries(&self.backoff, "reserve identity", || {
                        self.objects.put_object_if_absent(key, bytes.clone())
                    })
                    .await
                    .map_err(|e| identity_error(subject, format!("reserving {key}: {e}")))?;

                    match outcome {
                        PutOutcome::Created => {
                            return self.mint_and_assign(key, offline_id, subject, mint).await;
                        }
                        // Re-read on the next pass; the entry may be ours.
                        PutOutcome::AlreadyExists => {
                            if contended >= self.wait.max_retries {
                                return Err(identity_error(
                                    subject,
                                    format!("lost every reservation race for {key}"),
                                ));
                            }
                            contended += 1;
                        }
                    }
                }
            }
        }
    }

    async fn mint_and_assign<F, Fut>(
        &self,
        key: &str,
        offline_id: &str,
        subject: &str,
        mint: F,
    ) -> Result<Resolution, MigrationError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<u64, StoreError>> + Send,
    {
        let online_id = match with_retries(&self.backoff, "mint destination id", mint).await {
            Ok(id) => id,
            Err(err) => {
                // Drop the reservation so the next attempt starts clean.
                if let Err(cleanup) = with_retries(&self.backoff, "release identity", || {
                    self.objects.delete_object(key)
                })
                .await
                {
                    error!(key, error = %cleanup, "failed to release identity reservation");
                }
                return Err(identity_error(subject, format!("destination create failed: {err}")));
            }
        };

        let assigned = IdentityEntry::Assigned {
            offline_id: offline_id.to_string(),
            online_id,
            assigned_at: Utc::now(),
        };
        let bytes = encode_entry(&assigned, subject)?;
        with_retries(&self.backoff, "record identity", || {
            self.objects.put_object(key, bytes.clone())
        })
        .await
        .map_err(|e| {
            identity_error(
                subject,
                format!("destination id {online_id} minted but {key} could not be recorded: {e}"),
            )
        })?;

        info!(key, online_id, "assigned destination identity");
        Ok(Resolution {
            id: online_id,
            created: true,
        })
    }

    async fn read_entry(&self, key: &str, subject: &str) -> Result<Option<IdentityEntry>, MigrationError> {
        fetch_entry(self.objects.as_ref(), &self.backoff, key, subject).await
    }

    pub async fn assigned_fods(&self, run_id: &RunId) -> Result<BTreeMap<String, FodId>> {
        let entries = identity_entries(self.objects.as_ref(), &self.backoff, run_id).await?;
        let fods = entries
            .into_iter()
            .filter(|(key, _)| is_fod_identity_key(run_id, key))
            .filter_map(|(_, entry)| match entry {
                IdentityEntry::Assigned {
                    offline_id,
                    online_id,
                    ..
                } => Some((offline_id, online_id)),
                IdentityEntry::Pending { .. } => None,
            })
            .collect();
        Ok(fods)
    }

    /// Rebuilds the two lookup files from the identity entries. The content is
    /// a pure function of the assignments so rewriting is idempotent.
    pub async fn persist_lookup_artifacts(&self, run_id: &RunId, report_id: ReportId) -> Result<Vec<String>> {
        let report_map = BTreeMap::from([(run_id.to_string(), report_id)]);
        let fods = self.assigned_fods(run_id).await?;

        let mut written = Vec::new();
        for (key, body) in [
            (
                report_map_key(run_id, report_id),
                serde_json::to_vec_pretty(&report_map).context("serializing report map")?,
            ),
            (
                fods_map_key(run_id, report_id),
                serde_json::to_vec_pretty(&fods).context("serializing fod map")?,
            ),
        ] {
            with_retries(&self.backoff, "write lookup artifact", || {
                self.objects.put_object(&key, body.clone())
            })
            .await
            .with_context(|| format!("writing {key}"))?;
            written.push(key);
        }
        Ok(written)
    }
}

fn encode_entry(entry: &IdentityEntry, subject: &str) -> Result<Vec<u8>, MigrationError> {
    serde_json::to_vec(entry).map_err(|e| identity_error(subject, format!("encoding identity entry: {e}")))
}

async fn fetch_entry(
    objects: &dyn ObjectStore,
    backoff: &BackoffPolicy,
    key: &str,
    subject: &str,
) -> Result<Option<IdentityEntry>, MigrationError> {
    let bytes = with_retries(backoff, "read identity", || objects.get_object(key))
        .await
        .map_err(|e| identity_error(subject, format!("reading {key}: {e}")))?;
    bytes
        .map(|bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|e| identity_error(subject, format!("corrupt identity entry {key}: {e}")))
        })
        .transpose()
}

fn is_fod_identity_key(run_id: &RunId, key: &str) -> bool {
    key.strip_prefix(&identity_prefix(run_id))
        .map(|name| name.starts_with("fod-") && name.ends_with(".json"))
        .unwrap_or(false)
}

pub async fn identity_entries(
    objects: &dyn ObjectStore,
    backoff: &BackoffPolicy,
    run_id: &RunId,
) -> Result<Vec<(String, IdentityEntry)>> {
    let prefix = identity_prefix(run_id);
    let keys = with_retries(backoff, "list identities", || objects.list_keys(&prefix))
        .await
        .with_context(|| format!("listing {prefix}"))?;

    let subject = format!("run {run_id}");
    let mut entries = Vec::new();
    for key in keys {
        if key != report_identity_key(run_id) && !is_fod_identity_key(run_id, &key) {
            continue;
        }
        if let Some(entry) = fetch_entry(objects, backoff, &key, &subject).await? {
            entries.push((key, entry));
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Deletes `key` if it still holds a `Pending` reservation. Returns whether
/// anything was removed; assigned entries are never touched.
pub async fn clear_pending_reservation(objects: &dyn ObjectStore, backoff: &BackoffPolicy, key: &str) -> Result<bool> {
    match fetch_entry(objects, backoff, key, key).await? {
        Some(IdentityEntry::Pending { owner, reserved_at }) => {
            with_retries(backoff, "clear reservation", || objects.delete_object(key))
                .await
                .with_context(|| format!("deleting {key}"))?;
            warn!(key, %owner, %reserved_at, "cleared identity reservation");
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Uploaded { bytes: u64 },
    Skipped,
    Failed { error: MigrationError },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageResult {
    pub image: ImageRef,
    pub key: String,
    pub outcome: ImageOutcome,
}

pub struct ImageMigrator {
    offline: Arc<dyn OfflineStore>,
    objects: Arc<dyn ObjectStore>,
    backoff: BackoffPolicy,
    workers: usize,
}

impl ImageMigrator {
    pub fn new(
        offline: Arc<dyn OfflineStore>,
        objects: Arc<dyn ObjectStore>,
        backoff: BackoffPolicy,
        workers: usize,
    ) -> Self {
        Self {
            offline,
            objects,
            backoff,
            workers: workers.max(1),
        }
    }

    /// Copies every image of the run, skipping keys that already exist.
    /// Failures are reported per image and never stop the others.
    pub async fn migrate(&self, run_id: &RunId, report_id: ReportId, images: &[ImageRef]) -> Vec<ImageResult> {
        let mut results = stream::iter(images.iter().cloned())
            .map(|image| self.migrate_one(run_id, report_id, image))
            .buffer_unordered(self.workers)
            .collect::<Vec<_>>()
            .await;
        results.sort_by(|a, b| a.image.cmp(&b.image));
        results
    }

    async fn migrate_one(&self, run_id: &RunId, report_id: ReportId, image: ImageRef) -> ImageResult {
        let key = image_key(run_id, &image);
        let span = info_span!("image_upload", %run_id, report_id, image = %image.image_name);
        let outcome = self
            .transfer(run_id, &image, &key)
            .instrument(span)
            .await
            .unwrap_or_else(|reason| {
                warn!(%run_id, image = %image.image_name, %reason, "image transfer failed");
                ImageOutcome::Failed {
                    error: MigrationError::ImageTransfer {
                        image: image.image_name.clone(),
                        reason,
                    },
                }
            });
        ImageResult { image, key, outcome }
    }

    async fn transfer(&self, run_id: &RunId, image: &ImageRef, key: &str) -> Result<ImageOutcome, String> {
        let exists = with_retries(&self.backoff, "head image", || self.objects.head_object(key))
            .await
            .map_err(|e| format!("checking {key}: {e}"))?;
        if exists {
            debug!(key, "image already present, skipping");
            return Ok(ImageOutcome::Skipped);
        }

        let bytes = with_retries(&self.backoff, "read image", || self.offline.read_image(run_id, image))
            .await
            .map_err(|e| format!("reading offline blob: {e}"))?;
        let size = bytes.len() as u64;
        with_retries(&self.backoff, "upload image", || {
            self.objects.put_object(key, bytes.clone())
        })
        .await
        .map_err(|e| format!("uploading {key}: {e}"))?;

        debug!(key, bytes = size, "image uploaded");
        Ok(ImageOutcome::Uploaded { bytes: size })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Mapping,
    IdentityResolution,
    ImageMigration,
    Writing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
}

impl RunStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::PartialSuccess => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Succeeded,
    Failed,
}

impl RecordStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    pub record_id: String,
    pub fod_id: Option<FodId>,
    pub status: RecordStatus,
    pub error: Option<MigrationError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub error: MigrationError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageFailure {
    pub record_id: String,
    pub image_name: String,
    pub error: MigrationError,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub ingest_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub bucket: String,
    pub report_id: ReportId,
    pub report_created: bool,
    pub fods_created: usize,
    pub records_total: usize,
    pub records_succeeded: usize,
    pub records_failed: usize,
    pub failed_records: Vec<RecordFailure>,
    pub images_uploaded: usize,
    pub images_skipped: usize,
    pub images_failed: usize,
    pub failed_images: Vec<ImageFailure>,
    pub artifacts: Vec<String>,
    pub stages: Vec<RunStage>,
    pub reports_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

struct StageLog {
    run_id: RunId,
    stages: Vec<RunStage>,
}

impl StageLog {
    fn enter(&mut self, stage: RunStage) {
        info!(run_id = %self.run_id, ?stage, "entering stage");
        self.stages.push(stage);
    }

    fn current(&self) -> RunStage {
        self.stages.last().copied().unwrap_or(RunStage::Fetching)
    }
}

fn fatal(stage: RunStage, run_id: &RunId, err: impl Into<anyhow::Error>) -> anyhow::Error {
    err.into()
        .context(format!("run {run_id} failed during {stage:?}"))
}

pub struct IngestPipeline {
    config: IngestConfig,
    offline: Arc<dyn OfflineStore>,
    destination: Arc<dyn DestinationStore>,
    objects: Arc<dyn ObjectStore>,
    mapper: FieldMapper,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        offline: Arc<dyn OfflineStore>,
        destination: Arc<dyn DestinationStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            offline,
            destination,
            objects,
            mapper: FieldMapper::default(),
        }
    }

    pub fn with_field_mapper(mut self, mapper: FieldMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Ingests one run. `Err` means the run failed fatally (run missing,
    /// store unreachable, report identity unresolved); per-record and
    /// per-image failures are returned inside the summary instead.
    pub async fn run_once(&self, run_id: &RunId) -> Result<RunSummary> {
        let ingest_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, %ingest_id);
        let mut log = StageLog {
            run_id: run_id.clone(),
            stages: Vec::new(),
        };
        let result = self.execute(run_id, ingest_id, &mut log).instrument(span).await;
        if let Err(err) = &result {
            error!(%run_id, stage = ?log.current(), error = %format!("{err:#}"), "run failed");
            log.enter(RunStage::Failed);
        }
        result
    }

    async fn execute(&self, run_id: &RunId, ingest_id: Uuid, log: &mut StageLog) -> Result<RunSummary> {
        let started_at = Utc::now();
        let backoff = &self.config.backoff;

        log.enter(RunStage::Fetching);
        let run = with_retries(backoff, "fetch run", || self.offline.fetch_run(run_id))
            .await
            .map_err(|e| fatal(RunStage::Fetching, run_id, e))?
            .ok_or_else(|| {
                fatal(
                    RunStage::Fetching,
                    run_id,
                    MigrationError::RunNotFound {
                        run_id: run_id.to_string(),
                    },
                )
            })?;
        let records = with_retries(backoff, "fetch records", || self.offline.fetch_records(run_id))
            .await
            .map_err(|e| fatal(RunStage::Fetching, run_id, e))?;
        let draft = report_draft_from_run(&run, self.config.user_id)
            .map_err(|e| fatal(RunStage::Fetching, run_id, e))?;
        info!(%run_id, records = records.len(), "fetched offline run");

        log.enter(RunStage::Mapping);
        let mut failures: BTreeMap<String, MigrationError> = BTreeMap::new();
        let mut mapped: Vec<(&OfflineRecord, OnlineRecord)> = Vec::new();
        for record in &records {
            match self.mapper.map(record) {
                Ok(online) => mapped.push((record, online)),
                Err(err) => {
                    warn!(%run_id, record_id = %record.id, error = %err, "record mapping failed");
                    failures.insert(record.id.clone(), err);
                }
            }
        }

        log.enter(RunStage::IdentityResolution);
        let identity = IdentityMapper::new(
            Arc::clone(&self.objects),
            Arc::clone(&self.destination),
            self.config.backoff,
            self.config.identity_wait,
        )
        .with_owner(ingest_id);
        let report = identity
            .resolve_report_id(&draft)
            .await
            .map_err(|e| fatal(RunStage::IdentityResolution, run_id, e))?;
        let report_id = report.id;
        info!(%run_id, report_id, created = report.created, "report identity resolved");

        let resolved = stream::iter(mapped)
            .map(|(record, online)| {
                let identity = &identity;
                async move {
                    let resolution = identity.resolve_fod_id(run_id, report_id, &record.id).await;
                    (record, online, resolution)
                }
            })
            .buffer_unordered(self.config.write_workers.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut fods_created = 0usize;
        let mut identified = Vec::new();
        for (record, online, resolution) in resolved {
            match resolution {
                Ok(fod) => {
                    fods_created += usize::from(fod.created);
                    identified.push((record, online.with_identity(report_id, fod.id)));
                }
                Err(err) => {
                    warn!(%run_id, record_id = %record.id, error = %err, "fod identity failed");
                    failures.insert(record.id.clone(), err);
                }
            }
        }

        log.enter(RunStage::ImageMigration);
        log.enter(RunStage::Writing);
        let images = records.iter().filter_map(OfflineRecord::image_ref).collect::<Vec<_>>();
        let migrator = ImageMigrator::new(
            Arc::clone(&self.offline),
            Arc::clone(&self.objects),
            self.config.backoff,
            self.config.image_workers,
        );
        let (image_results, write_results) = tokio::join!(
            migrator.migrate(run_id, report_id, &images),
            self.write_records(run_id, identified)
        );

        let mut written: BTreeMap<String, FodId> = BTreeMap::new();
        for (record_id, fod_id, result) in write_results {
            match result {
                Ok(()) => {
                    written.insert(record_id, fod_id);
                }
                Err(err) => {
                    warn!(%run_id, %record_id, error = %err, "record write failed");
                    failures.insert(record_id, err);
                }
            }
        }

        let artifacts = identity
            .persist_lookup_artifacts(run_id, report_id)
            .await
            .map_err(|e| fatal(RunStage::Writing, run_id, e))?;

        let outcomes = records
            .iter()
            .map(|record| match failures.get(&record.id) {
                Some(err) => RecordOutcome {
                    record_id: record.id.clone(),
                    fod_id: None,
                    status: RecordStatus::Failed,
                    error: Some(err.clone()),
                },
                None => RecordOutcome {
                    record_id: record.id.clone(),
                    fod_id: written.get(&record.id).copied(),
                    status: RecordStatus::Succeeded,
                    error: None,
                },
            })
            .collect::<Vec<_>>();

        let failed_records = outcomes
            .iter()
            .filter_map(|o| {
                o.error.clone().map(|error| RecordFailure {
                    record_id: o.record_id.clone(),
                    error,
                })
            })
            .collect::<Vec<_>>();
        let failed_images = image_results
            .iter()
            .filter_map(|r| match &r.outcome {
                ImageOutcome::Failed { error } => Some(ImageFailure {
                    record_id: r.image.record_id.clone(),
                    image_name: r.image.image_name.clone(),
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect::<Vec<_>>();
        let count = |pred: fn(&ImageOutcome) -> bool| image_results.iter().filter(|r| pred(&r.outcome)).count();

        let status = if failed_records.is_empty() && failed_images.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::PartialSuccess
        };
        log.enter(RunStage::Done);

        let mut summary = RunSummary {
            run_id: run_id.clone(),
            ingest_id,
            started_at,
            finished_at: Utc::now(),
            status,
            bucket: self.objects.bucket().to_string(),
            report_id,
            report_created: report.created,
            fods_created,
            records_total: records.len(),
            records_succeeded: records.len() - failed_records.len(),
            records_failed: failed_records.len(),
            failed_records,
            images_uploaded: count(|o| matches!(o, ImageOutcome::Uploaded { .. })),
            images_skipped: count(|o| matches!(o, ImageOutcome::Skipped)),
            images_failed: failed_images.len(),
            failed_images,
            artifacts,
            stages: log.stages.clone(),
            reports_dir: None,
        };

        if let Some(root) = &self.config.reports_dir {
            let dir = write_run_reports(root, &summary, &outcomes, &image_results).await?;
            summary.reports_dir = Some(dir.display().to_string());
        }

        info!(
            %run_id,
            status = ?summary.status,
            succeeded = summary.records_succeeded,
            failed = summary.records_failed,
            images_uploaded = summary.images_uploaded,
            images_skipped = summary.images_skipped,
            images_failed = summary.images_failed,
            "run finished"
        );
        Ok(summary)
    }

    async fn write_records(
        &self,
        run_id: &RunId,
        identified: Vec<(&OfflineRecord, OnlineRecord)>,
    ) -> Vec<(String, FodId, Result<(), MigrationError>)> {
        let bucket = self.objects.bucket().to_string();
        stream::iter(identified)
            .map(|(record, mut online)| {
                let bucket = bucket.clone();
                async move {
                    if let Some(image) = record.image_ref() {
                        let uri = object_uri(&bucket, &image_key(run_id, &image));
                        online.set("fodImageUri", OnlineValue::Text(uri));
                    }
                    let fod_id = online.fod_id.unwrap_or_default();
                    let result = with_retries(&self.config.backoff, "write record", || {
                        self.destination.write_record(&online)
                    })
                    .await
                    .map_err(|e| MigrationError::Write {
                        subject: record_subject(&record.id),
                        reason: e.to_string(),
                    });
                    (record.id.clone(), fod_id, result)
                }
            })
            .buffer_unordered(self.config.write_workers.max(1))
            .collect()
            .await
    }
}

pub fn run_reports_dir(root: &Path, run_id: &RunId) -> PathBuf {
    root.join(format!("run_{run_id}"))
}

async fn write_run_reports(
    root: &Path,
    summary: &RunSummary,
    outcomes: &[RecordOutcome],
    images: &[ImageResult],
) -> Result<PathBuf> {
    let reports_dir = run_reports_dir(root, &summary.run_id);
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), summary_json)
        .await
        .context("writing summary.json")?;
    fs::write(reports_dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;

    export_parquet_snapshots(&reports_dir, outcomes, images).await?;
    Ok(reports_dir)
}

fn render_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# FOD Ingest Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Ingest ID: `{}`", summary.ingest_id),
        format!("- Status: {:?}", summary.status),
        format!(
            "- Report ID: {}{}",
            summary.report_id,
            if summary.report_created { " (created)" } else { " (reused)" }
        ),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Records: {} succeeded, {} failed ({} total, {} fods created)",
            summary.records_succeeded, summary.records_failed, summary.records_total, summary.fods_created
        ),
        format!(
            "- Images: {} uploaded, {} skipped, {} failed",
            summary.images_uploaded, summary.images_skipped, summary.images_failed
        ),
    ];

    if !summary.failed_records.is_empty() {
        lines.push(String::new());
        lines.push("## Failed Records".to_string());
        for failure in &summary.failed_records {
            lines.push(format!("- {} ({}): {}", failure.record_id, failure.error.kind(), failure.error));
        }
    }
    if !summary.failed_images.is_empty() {
        lines.push(String::new());
        lines.push("## Failed Images".to_string());
        for failure in &summary.failed_images {
            lines.push(format!("- {} (record {}): {}", failure.image_name, failure.record_id, failure.error));
        }
    }

    lines.push(String::new());
    lines.push("## Identity Artifacts".to_string());
    for key in &summary.artifacts {
        lines.push(format!("- `{}/{}`", summary.bucket, key));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub fn read_run_brief(root: &Path, run_id: &RunId) -> Result<String> {
    let path = run_reports_dir(root, run_id).join("brief.md");
    std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
}

async fn export_parquet_snapshots(
    reports_dir: &Path,
    outcomes: &[RecordOutcome],
    images: &[ImageResult],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let records_path = snapshot_dir.join("records.parquet");
    let images_path = snapshot_dir.join("images.parquet");
    write_records_parquet(&records_path, outcomes)?;
    write_images_parquet(&images_path, images)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("records", reports_dir, &records_path)?,
            manifest_entry("images", reports_dir, &images_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_records_parquet(path: &Path, outcomes: &[RecordOutcome]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("fod_id", DataType::UInt64, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("error_kind", DataType::Utf8, true),
        ArrowField::new("error", DataType::Utf8, true),
    ]));

    let messages = outcomes
        .iter()
        .map(|o| o.error.as_ref().map(ToString::to_string))
        .collect::<Vec<_>>();
    let record_ids = StringArray::from(outcomes.iter().map(|o| Some(o.record_id.as_str())).collect::<Vec<_>>());
    let fod_ids = UInt64Array::from(outcomes.iter().map(|o| o.fod_id).collect::<Vec<_>>());
    let statuses = StringArray::from(outcomes.iter().map(|o| Some(o.status.as_str())).collect::<Vec<_>>());
    let kinds = StringArray::from(
        outcomes
            .iter()
            .map(|o| o.error.as_ref().map(MigrationError::kind))
            .collect::<Vec<_>>(),
    );
    let errors = StringArray::from(messages.iter().map(|m| m.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(record_ids),
            Arc::new(fod_ids),
            Arc::new(statuses),
            Arc::new(kinds),
            Arc::new(errors),
        ],
    )
    .context("building records record batch")?;
    write_parquet(path, batch)
}

fn write_images_parquet(path: &Path, images: &[ImageResult]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("image_name", DataType::Utf8, false),
        ArrowField::new("key", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("bytes", DataType::UInt64, true),
    ]));

    let status = |outcome: &ImageOutcome| match outcome {
        ImageOutcome::Uploaded { .. } => "uploaded",
        ImageOutcome::Skipped => "skipped",
        ImageOutcome::Failed { .. } => "failed",
    };
    let record_ids = StringArray::from(images.iter().map(|r| Some(r.image.record_id.as_str())).collect::<Vec<_>>());
    let names = StringArray::from(images.iter().map(|r| Some(r.image.image_name.as_str())).collect::<Vec<_>>());
    let keys = StringArray::from(images.iter().map(|r| Some(r.key.as_str())).collect::<Vec<_>>());
    let statuses = StringArray::from(images.iter().map(|r| Some(status(&r.outcome))).collect::<Vec<_>>());
    let sizes = UInt64Array::from(
        images
            .iter()
            .map(|r| match r.outcome {
                ImageOutcome::Uploaded { bytes } => Some(bytes),
                _ => None,
            })
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(record_ids),
            Arc::new(names),
            Arc::new(keys),
            Arc::new(statuses),
            Arc::new(sizes),
        ],
    )
    .context("building images record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

pub fn migration_error(err: &anyhow::Error) -> Option<&MigrationError> {
    err.downcast_ref::<MigrationError>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use fod_adapters::{MemoryDestinationStore, MemoryOfflineStore};
    use fod_core::OfflineRun;
    use fod_storage::LocalObjectStore;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn wait_policy(polls: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: polls,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(20),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn run_id() -> RunId {
        RunId::parse("R100").unwrap()
    }

    fn draft() -> ReportDraft {
        ReportDraft {
            run_id: run_id(),
            user_id: 7,
            report_type: "Daily".into(),
            unit: "VMFA-232".into(),
            number_of_officers: 2,
            number_of_snco: 1,
            number_of_enlisted_officers: 12,
            number_of_fods: 3,
            start_time: "2023-05-01 14:00:00".into(),
            end_time: "2023-05-01 15:10:00".into(),
        }
    }

    fn local_store(dir: &tempfile::TempDir) -> Arc<dyn ObjectStore> {
        Arc::new(LocalObjectStore::new(dir.path(), "idra-commercial"))
    }

    // Destination whose `create_report` fails a configurable number of times.
    struct FlakyDestination {
        inner: MemoryDestinationStore,
        failures_left: AtomicUsize,
        permanent: bool,
        report_calls: AtomicUsize,
    }

    impl FlakyDestination {
        fn new(failures: usize, permanent: bool) -> Self {
            Self {
                inner: MemoryDestinationStore::new(),
                failures_left: AtomicUsize::new(failures),
                permanent,
                report_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DestinationStore for FlakyDestination {
        async fn create_report(&self, report: &ReportDraft) -> Result<ReportId, StoreError> {
            self.report_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                let err = anyhow!("destination unavailable");
                return Err(if self.permanent {
                    StoreError::permanent(err)
                } else {
                    StoreError::transient(err)
                });
            }
            self.inner.create_report(report).await
        }

        async fn create_fod(&self, report_id: ReportId, offline_id: &str) -> Result<FodId, StoreError> {
            self.inner.create_fod(report_id, offline_id).await
        }

        async fn write_record(&self, record: &OnlineRecord) -> Result<(), StoreError> {
            self.inner.write_record(record).await
        }
    }

    #[tokio::test]
    async fn report_identity_is_minted_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let destination = Arc::new(MemoryDestinationStore::new());
        let mapper = IdentityMapper::new(local_store(&dir), destination.clone(), fast_policy(), wait_policy(3));

        let first = mapper.resolve_report_id(&draft()).await.unwrap();
        let second = mapper.resolve_report_id(&draft()).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(destination.snapshot().await.reports.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_workers_agree_on_one_identity() {
        let dir = tempfile::tempdir().unwrap();
        let objects = local_store(&dir);
        let destination: Arc<MemoryDestinationStore> = Arc::new(MemoryDestinationStore::new());
        let a = IdentityMapper::new(objects.clone(), destination.clone(), fast_policy(), wait_policy(50));
        let b = IdentityMapper::new(objects.clone(), destination.clone(), fast_policy(), wait_policy(50));
        assert_ne!(a.owner(), b.owner());

        let report = draft();
        let (ra, rb) = tokio::join!(a.resolve_report_id(&report), b.resolve_report_id(&report));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.id, rb.id);
        assert_eq!(usize::from(ra.created) + usize::from(rb.created), 1);

        let rid = run_id();
        let (fa, fb) = tokio::join!(
            a.resolve_fod_id(&rid, ra.id, "7"),
            b.resolve_fod_id(&rid, ra.id, "7")
        );
        assert_eq!(fa.unwrap().id, fb.unwrap().id);

        let state = destination.snapshot().await;
        assert_eq!(state.reports.len(), 1);
        assert_eq!(state.fods.len(), 1);
    }

    #[tokio::test]
    async fn failed_mint_leaves_no_mapping_behind() {
        let dir = tempfile::tempdir().unwrap();
        let objects = local_store(&dir);
        let flaky = Arc::new(FlakyDestination::new(usize::MAX, false));
        let mapper = IdentityMapper::new(objects.clone(), flaky.clone(), fast_policy(), wait_policy(3));

        let err = mapper.resolve_report_id(&draft()).await.unwrap_err();
        assert_eq!(err.kind(), "identity_resolution");
        // Initial attempt plus bounded retries.
        assert_eq!(flaky.report_calls.load(Ordering::SeqCst), 4);
        assert!(objects.get_object(&report_identity_key(&run_id())).await.unwrap().is_none());

        let healthy = Arc::new(MemoryDestinationStore::new());
        let retry = IdentityMapper::new(objects.clone(), healthy.clone(), fast_policy(), wait_policy(3));
        let resolved = retry.resolve_report_id(&draft()).await.unwrap();
        assert!(resolved.created);
        assert_eq!(healthy.snapshot().await.reports.len(), 1);
    }

    #[tokio::test]
    async fn transient_mint_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(FlakyDestination::new(2, false));
        let mapper = IdentityMapper::new(local_store(&dir), flaky.clone(), fast_policy(), wait_policy(3));

        let resolved = mapper.resolve_report_id(&draft()).await.unwrap();
        assert!(resolved.created);
        assert_eq!(flaky.report_calls.load(Ordering::SeqCst), 3);
        assert_eq!(flaky.inner.snapshot().await.reports.len(), 1);
    }

    #[tokio::test]
    async fn permanent_mint_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(FlakyDestination::new(1, true));
        let mapper = IdentityMapper::new(local_store(&dir), flaky.clone(), fast_policy(), wait_policy(3));

        assert!(mapper.resolve_report_id(&draft()).await.is_err());
        assert_eq!(flaky.report_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_foreign_reservation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let objects = local_store(&dir);
        let stale = IdentityEntry::Pending {
            owner: Uuid::new_v4(),
            reserved_at: Utc::now(),
        };
        objects
            .put_object(&report_identity_key(&run_id()), serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        let destination = Arc::new(MemoryDestinationStore::new());
        let mapper = IdentityMapper::new(objects, destination.clone(), fast_policy(), wait_policy(2));
        let err = mapper.resolve_report_id(&draft()).await.unwrap_err();
        assert!(matches!(err, MigrationError::IdentityResolution { .. }));
        assert!(destination.snapshot().await.reports.is_empty());
    }

    #[tokio::test]
    async fn lookup_artifacts_reflect_assignments() {
        let dir = tempfile::tempdir().unwrap();
        let objects = local_store(&dir);
        let destination = Arc::new(MemoryDestinationStore::new());
        let mapper = IdentityMapper::new(objects.clone(), destination, fast_policy(), wait_policy(3));

        let report = mapper.resolve_report_id(&draft()).await.unwrap();
        let f1 = mapper.resolve_fod_id(&run_id(), report.id, "1").await.unwrap();
        let f2 = mapper.resolve_fod_id(&run_id(), report.id, "2").await.unwrap();

        let keys = mapper.persist_lookup_artifacts(&run_id(), report.id).await.unwrap();
        assert_eq!(
            keys,
            vec![report_map_key(&run_id(), report.id), fods_map_key(&run_id(), report.id)]
        );
        let fods: BTreeMap<String, FodId> =
            serde_json::from_slice(&objects.get_object(&keys[1]).await.unwrap().unwrap()).unwrap();
        assert_eq!(fods, BTreeMap::from([("1".into(), f1.id), ("2".into(), f2.id)]));
        let reports: BTreeMap<String, ReportId> =
            serde_json::from_slice(&objects.get_object(&keys[0]).await.unwrap().unwrap()).unwrap();
        assert_eq!(reports, BTreeMap::from([("R100".into(), report.id)]));
    }

    fn image(record_id: &str, name: &str) -> ImageRef {
        ImageRef {
            record_id: record_id.into(),
            image_name: name.into(),
        }
    }

    #[tokio::test]
    async fn present_images_are_skipped_and_missing_blobs_fail_alone() {
        let dir = tempfile::tempdir().unwrap();
        let objects = local_store(&dir);
        let offline = Arc::new(
            MemoryOfflineStore::new()
                .with_run(
                    OfflineRun {
                        run_id: run_id(),
                        columns: BTreeMap::new(),
                    },
                    Vec::new(),
                )
                .with_image(&run_id(), "1", b"new-1".to_vec())
                .with_image(&run_id(), "2", b"new-2".to_vec()),
        );
        objects
            .put_object(&image_key(&run_id(), &image("2", "b.jpg")), b"already-there".to_vec())
            .await
            .unwrap();

        let migrator = ImageMigrator::new(offline, objects.clone(), fast_policy(), 2);
        let results = migrator
            .migrate(
                &run_id(),
                1,
                &[image("1", "a.jpg"), image("2", "b.jpg"), image("3", "c.jpg")],
            )
            .await;

        assert_eq!(results[0].outcome, ImageOutcome::Uploaded { bytes: 5 });
        assert_eq!(results[1].outcome, ImageOutcome::Skipped);
        assert!(matches!(
            results[2].outcome,
            ImageOutcome::Failed {
                error: MigrationError::ImageTransfer { .. }
            }
        ));
        assert_eq!(
            objects.get_object(&image_key(&run_id(), &image("2", "b.jpg"))).await.unwrap(),
            Some(b"already-there".to_vec())
        );

        let again = migrator.migrate(&run_id(), 1, &[image("1", "a.jpg")]).await;
        assert_eq!(again[0].outcome, ImageOutcome::Skipped);
    }

    #[tokio::test]
    async fn missing_run_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = IngestPipeline::new(
            IngestConfig {
                backoff: fast_policy(),
                ..IngestConfig::default()
            },
            Arc::new(MemoryOfflineStore::new()),
            Arc::new(MemoryDestinationStore::new()),
            local_store(&dir),
        );
        let err = pipeline.run_once(&RunId::parse("R404").unwrap()).await.unwrap_err();
        assert_eq!(
            migration_error(&err),
            Some(&MigrationError::RunNotFound {
                run_id: "R404".into()
            })
        );
    }

    // Object store whose first conditional put lands but reports a transient failure.
    struct LostAckStore {
        inner: Arc<dyn ObjectStore>,
        drop_next_ack: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for LostAckStore {
        fn bucket(&self) -> &str {
            self.inner.bucket()
        }

        async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
            self.inner.put_object(key, bytes).await
        }

        async fn put_object_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<PutOutcome, StoreError> {
            let outcome = self.inner.put_object_if_absent(key, bytes).await?;
            if self.drop_next_ack.swap(false, Ordering::SeqCst) {
                return Err(StoreError::transient(anyhow!("connection reset before response")));
            }
            Ok(outcome)
        }

        async fn head_object(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.head_object(key).await
        }

        async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get_object(key).await
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list_keys(prefix).await
        }

        async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete_object(key).await
        }
    }

    #[tokio::test]
    async fn lost_reservation_ack_is_resumed_by_its_owner() {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(LostAckStore {
            inner: local_store(&dir),
            drop_next_ack: AtomicBool::new(true),
        });
        let destination = Arc::new(MemoryDestinationStore::new());
        let mapper = IdentityMapper::new(objects.clone(), destination.clone(), fast_policy(), wait_policy(2));

        let first = mapper.resolve_report_id(&draft()).await.unwrap();
        assert!(first.created);
        assert!(!objects.drop_next_ack.load(Ordering::SeqCst));

        let entry: IdentityEntry = serde_json::from_slice(
            &objects
                .get_object(&report_identity_key(&run_id()))
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert!(matches!(entry, IdentityEntry::Assigned { online_id, .. } if online_id == first.id));

        let again = mapper.resolve_report_id(&draft()).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.id, first.id);
        assert_eq!(destination.snapshot().await.reports.len(), 1);
    }

    #[tokio::test]
    async fn pending_reservations_are_listed_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let objects = local_store(&dir);
        let mapper = IdentityMapper::new(
            objects.clone(),
            Arc::new(MemoryDestinationStore::new()),
            fast_policy(),
            wait_policy(1),
        );
        let rid = run_id();
        let report = mapper.resolve_report_id(&draft()).await.unwrap();
        mapper.resolve_fod_id(&rid, report.id, "1").await.unwrap();
        let stale = IdentityEntry::Pending {
            owner: Uuid::new_v4(),
            reserved_at: Utc::now(),
        };
        objects
            .put_object(&fod_identity_key(&rid, "2"), serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();
        assert!(mapper.resolve_fod_id(&rid, report.id, "2").await.is_err());

        let entries = identity_entries(objects.as_ref(), &fast_policy(), &rid).await.unwrap();
        assert_eq!(entries.len(), 3);
        let pending = entries
            .iter()
            .filter(|(_, entry)| matches!(entry, IdentityEntry::Pending { .. }))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        assert_eq!(pending, vec![fod_identity_key(&rid, "2")]);

        assert!(clear_pending_reservation(objects.as_ref(), &fast_policy(), &pending[0])
            .await
            .unwrap());
        assert!(!clear_pending_reservation(objects.as_ref(), &fast_policy(), &report_identity_key(&rid))
            .await
            .unwrap());

        let resumed = mapper.resolve_fod_id(&rid, report.id, "2").await.unwrap();
        assert!(resumed.created);
        assert_eq!(mapper.assigned_fods(&rid).await.unwrap().len(), 2);
    }

    // Destination that rejects `create_fod` for some records and keeps timing
    // out `write_record` for others.
    struct RecordFaults {
        inner: MemoryDestinationStore,
        fail_create: BTreeSet<String>,
        fail_write: BTreeSet<String>,
        write_calls: AtomicUsize,
    }

    impl RecordFaults {
        fn new(fail_create: &[&str], fail_write: &[&str]) -> Self {
            Self {
                inner: MemoryDestinationStore::new(),
                fail_create: fail_create.iter().map(|id| id.to_string()).collect(),
                fail_write: fail_write.iter().map(|id| id.to_string()).collect(),
                write_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DestinationStore for RecordFaults {
        async fn create_report(&self, report: &ReportDraft) -> Result<ReportId, StoreError> {
            self.inner.create_report(report).await
        }

        async fn create_fod(&self, report_id: ReportId, offline_id: &str) -> Result<FodId, StoreError> {
            if self.fail_create.contains(offline_id) {
                return Err(StoreError::permanent(anyhow!("fod insert rejected")));
            }
            self.inner.create_fod(report_id, offline_id).await
        }

        async fn write_record(&self, record: &OnlineRecord) -> Result<(), StoreError> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_write.contains(&record.offline_id) {
                return Err(StoreError::transient(anyhow!("lock wait timeout exceeded")));
            }
            self.inner.write_record(record).await
        }
    }

    fn offline_run() -> OfflineRun {
        let columns = [
            ("ID", "R100"),
            ("reportType", "daily"),
            ("unit", "VMFA-232"),
            ("nbreOfOfficers", "2"),
            ("snco", "1"),
            ("enlisted", "12"),
            ("fodCount", "2"),
            ("startTime", "2023-05-01T14:00:00Z"),
            ("endTime", "2023-05-01T15:10:00Z"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        OfflineRun {
            run_id: run_id(),
            columns,
        }
    }

    fn fod_record(id: &str) -> OfflineRecord {
        let mut columns: BTreeMap<String, String> = [
            ("modelType", "runway"),
            ("type", "runway"),
            ("modelColor", "gray"),
            ("color", "gray"),
            ("modelSize", "small"),
            ("size", "4 inch"),
            ("modelMaterial", "metal"),
            ("material", "steel"),
            ("comment", "bolt"),
            ("createdTime", "2023-05-01T14:30:00Z"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        columns.insert("imageName".into(), format!("fod_{id}.jpg"));
        OfflineRecord {
            id: id.into(),
            run_id: run_id(),
            columns,
        }
    }

    fn offline_with(records: Vec<OfflineRecord>, blobs: &[&str]) -> Arc<dyn OfflineStore> {
        let mut store = MemoryOfflineStore::new().with_run(offline_run(), records);
        for id in blobs {
            store = store.with_image(&run_id(), id, format!("jpeg-{id}").into_bytes());
        }
        Arc::new(store)
    }

    fn pipeline(
        offline: Arc<dyn OfflineStore>,
        destination: Arc<dyn DestinationStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> IngestPipeline {
        IngestPipeline::new(
            IngestConfig {
                backoff: fast_policy(),
                identity_wait: wait_policy(2),
                ..IngestConfig::default()
            },
            offline,
            destination,
            objects,
        )
    }

    #[tokio::test]
    async fn exhausted_write_retries_fail_only_that_record() {
        let dir = tempfile::tempdir().unwrap();
        let destination = Arc::new(RecordFaults::new(&[], &["2"]));
        let summary = pipeline(
            offline_with(vec![fod_record("1"), fod_record("2")], &["1", "2"]),
            destination.clone(),
            local_store(&dir),
        )
        .run_once(&run_id())
        .await
        .unwrap();

        assert_eq!(summary.status, RunStatus::PartialSuccess);
        assert_eq!(summary.records_succeeded, 1);
        assert_eq!(summary.failed_records.len(), 1);
        assert_eq!(summary.failed_records[0].record_id, "2");
        assert!(matches!(summary.failed_records[0].error, MigrationError::Write { .. }));
        // One write for record 1, initial attempt plus three retries for record 2.
        assert_eq!(destination.write_calls.load(Ordering::SeqCst), 5);
        assert_eq!(summary.images_uploaded, 2);
        assert_eq!(summary.stages.last(), Some(&RunStage::Done));

        let state = destination.inner.snapshot().await;
        assert_eq!(state.records.len(), 1);
        assert!(state.records.values().all(|r| r.offline_id == "1"));
    }

    #[tokio::test]
    async fn image_failure_alone_makes_the_run_partial() {
        let dir = tempfile::tempdir().unwrap();
        let destination = Arc::new(MemoryDestinationStore::new());
        let summary = pipeline(
            offline_with(vec![fod_record("1"), fod_record("2")], &["1"]),
            destination.clone(),
            local_store(&dir),
        )
        .run_once(&run_id())
        .await
        .unwrap();

        assert!(summary.failed_records.is_empty());
        assert_eq!(summary.records_succeeded, 2);
        assert_eq!(summary.status, RunStatus::PartialSuccess);
        assert_eq!(summary.images_uploaded, 1);
        assert_eq!(summary.images_failed, 1);
        assert_eq!(summary.failed_images[0].record_id, "2");
        assert!(matches!(
            summary.failed_images[0].error,
            MigrationError::ImageTransfer { .. }
        ));
        assert_eq!(destination.snapshot().await.records.len(), 2);
    }

    #[tokio::test]
    async fn fod_identity_failure_spares_sibling_records() {
        let dir = tempfile::tempdir().unwrap();
        let objects = local_store(&dir);
        let destination = Arc::new(RecordFaults::new(&["1"], &[]));
        let summary = pipeline(
            offline_with(vec![fod_record("1"), fod_record("2")], &["1", "2"]),
            destination.clone(),
            objects.clone(),
        )
        .run_once(&run_id())
        .await
        .unwrap();

        assert_eq!(summary.status, RunStatus::PartialSuccess);
        assert_eq!(summary.fods_created, 1);
        assert_eq!(summary.records_succeeded, 1);
        assert_eq!(summary.failed_records[0].record_id, "1");
        assert!(matches!(
            summary.failed_records[0].error,
            MigrationError::IdentityResolution { .. }
        ));
        assert!(objects
            .get_object(&fod_identity_key(&run_id(), "1"))
            .await
            .unwrap()
            .is_none());

        let fods: BTreeMap<String, FodId> = serde_json::from_slice(
            &objects
                .get_object(&fods_map_key(&run_id(), summary.report_id))
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(fods.keys().collect::<Vec<_>>(), vec!["2"]);
        assert_eq!(destination.inner.snapshot().await.records.len(), 1);
    }

    #[tokio::test]
    async fn missing_required_column_is_reported_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut incomplete = fod_record("2");
        incomplete.columns.remove("createdTime");
        let destination = Arc::new(MemoryDestinationStore::new());
        let summary = pipeline(
            offline_with(vec![fod_record("1"), incomplete], &["1", "2"]),
            destination.clone(),
            local_store(&dir),
        )
        .run_once(&run_id())
        .await
        .unwrap();

        assert_eq!(summary.status, RunStatus::PartialSuccess);
        assert_eq!(summary.records_succeeded, 1);
        assert_eq!(
            summary.failed_records[0].error,
            MigrationError::MissingField {
                subject: record_subject("2"),
                field: "createdTime".into(),
            }
        );
        assert_eq!(summary.fods_created, 1);
        assert_eq!(destination.snapshot().await.fods.len(), 1);
    }

    #[test]
    fn partial_status_exits_with_two() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        assert_eq!(RunStatus::PartialSuccess.exit_code(), 2);
    }
}
