//! Offline/online store adapters and the declarative offline -> online field mapping.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use fod_core::{
    record_subject, FodId, ImageRef, MigrationError, OfflineRecord, OfflineRun, OnlineRecord,
    OnlineValue, ReportDraft, ReportId, RunId,
};
use fod_storage::{RetryDisposition, StoreError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const OFFLINE_RUNS_TABLE: &str = "runsIdra";
pub const OFFLINE_FODS_TABLE: &str = "fodDataIdra";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransform {
    #[default]
    Copy,
    UnitStrippedFloat,
    CompactTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub offline: String,
    pub online: String,
    #[serde(default)]
    pub transform: FieldTransform,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl FieldRule {
    fn new(offline: &str, online: &str, transform: FieldTransform) -> Self {
        Self {
            offline: offline.to_string(),
            online: online.to_string(),
            transform,
            required: true,
        }
    }

    fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Columns the orchestrator owns on the destination side.
const RESERVED_ONLINE_COLUMNS: &[&str] = &["fodID", "reportID", "fodImageUri"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMappingTable {
    pub version: u32,
    pub rules: Vec<FieldRule>,
}

impl FieldMappingTable {
    pub fn builtin() -> Self {
        use FieldTransform as T;
        Self {
            version: 1,
            rules: vec![
                FieldRule::new("modelType", "source", T::Copy),
                FieldRule::new("type", "finalSource", T::Copy),
                FieldRule::new("modelColor", "color", T::Copy),
                FieldRule::new("color", "finalColor", T::Copy),
                FieldRule::new("modelSize", "size", T::Copy),
                FieldRule::new("size", "finalSize", T::UnitStrippedFloat),
                FieldRule::new("modelMaterial", "material", T::Copy),
                FieldRule::new("material", "finalMaterial", T::Copy),
                FieldRule::new("comment", "Comment", T::Copy),
                FieldRule::new("createdTime", "createdTime", T::CompactTimestamp),
                FieldRule::new("imageName", "fodImageName", T::Copy).optional(),
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let table: Self = serde_yaml::from_str(text).context("parsing field mapping table")?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for rule in &self.rules {
            if !is_sql_identifier(&rule.online) {
                bail!("online column {:?} is not a plain identifier", rule.online);
            }
            if RESERVED_ONLINE_COLUMNS.contains(&rule.online.as_str()) {
                bail!("online column {:?} is assigned by the pipeline", rule.online);
            }
            if !seen.insert(rule.online.as_str()) {
                bail!("online column {:?} is mapped more than once", rule.online);
            }
            if rule.offline.trim().is_empty() {
                bail!("rule for {:?} has an empty offline column", rule.online);
            }
        }
        Ok(())
    }
}

pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
pub struct FieldMapper {
    table: FieldMappingTable,
}

impl Default for FieldMapper {
    fn default() -> Self {
        Self {
            table: FieldMappingTable::builtin(),
        }
    }
}

impl FieldMapper {
    pub fn new(table: FieldMappingTable) -> Result<Self> {
        table.validate()?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &FieldMappingTable {
        &self.table
    }

    pub fn map(&self, record: &OfflineRecord) -> Result<OnlineRecord, MigrationError> {
        let mut online = OnlineRecord::new(record.id.clone(), record.run_id.clone());

        for rule in &self.table.rules {
            let Some(raw) = record.column(&rule.offline) else {
                if rule.required {
                    return Err(MigrationError::MissingField {
                        subject: record_subject(&record.id),
                        field: rule.offline.clone(),
                    });
                }
                continue;
            };

            let value = match rule.transform {
                FieldTransform::Copy => OnlineValue::text(raw),
                FieldTransform::UnitStrippedFloat => parse_unit_stripped_float(raw)
                    .map(OnlineValue::Float)
                    .map_err(|reason| MigrationError::Validation {
                        subject: record_subject(&record.id),
                        field: rule.online.clone(),
                        reason,
                    })?,
                FieldTransform::CompactTimestamp => compact_timestamp(raw)
                    .map(OnlineValue::Text)
                    .map_err(|reason| MigrationError::Validation {
                        subject: record_subject(&record.id),
                        field: rule.online.clone(),
                        reason,
                    })?,
            };
            online.set(rule.online.clone(), value);
        }

        Ok(online)
    }
}

// Longest first so "inches" is not left as "es".
const SIZE_UNIT_SUFFIXES: &[&str] = &["inches", "inch", "in", "\"", "\u{2033}", "\u{201d}"];

pub fn parse_unit_stripped_float(raw: &str) -> Result<f64, String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let numeric = SIZE_UNIT_SUFFIXES
        .iter()
        .find(|suffix| lower.ends_with(*suffix))
        .map(|suffix| &trimmed[..trimmed.len() - suffix.len()])
        .unwrap_or(trimmed)
        .trim();

    if numeric.is_empty() {
        return Err(format!("no numeric value in {raw:?}"));
    }
    match numeric.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(format!("no numeric value in {raw:?}")),
    }
}

pub fn compact_timestamp(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_suffix('Z')
        .or_else(|| trimmed.strip_suffix('z'))
        .unwrap_or(trimmed);

    NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(body, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| format!("{raw:?} is not a UTC timestamp: {e}"))?;

    Ok(body.replacen('T', "", 1))
}

fn normalize_report_time(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let parsed = DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.naive_local())
        .ok()
        .or_else(|| {
            let body = trimmed.strip_suffix('Z').unwrap_or(trimmed);
            NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(body, "%Y-%m-%d %H:%M:%S%.f"))
                .ok()
        })?;
    Some(parsed.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn capitalize(value: &str) -> String {
    let lower = value.trim().to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn report_draft_from_run(run: &OfflineRun, user_id: u64) -> Result<ReportDraft, MigrationError> {
    let subject = format!("run {}", run.run_id);
    let required = |field: &str| {
        run.column(field)
            .map(str::trim)
            .ok_or_else(|| MigrationError::MissingField {
                subject: subject.clone(),
                field: field.to_string(),
            })
    };
    let integer = |field: &str| -> Result<i64, MigrationError> {
        let raw = required(field)?;
        raw.parse::<i64>().map_err(|_| MigrationError::Validation {
            subject: subject.clone(),
            field: field.to_string(),
            reason: format!("{raw:?} is not an integer"),
        })
    };
    let time = |field: &str| -> Result<String, MigrationError> {
        let raw = required(field)?;
        normalize_report_time(raw).ok_or_else(|| MigrationError::Validation {
            subject: subject.clone(),
            field: field.to_string(),
            reason: format!("{raw:?} is not a timestamp"),
        })
    };

    Ok(ReportDraft {
        run_id: run.run_id.clone(),
        user_id,
        report_type: capitalize(required("reportType")?),
        unit: required("unit")?.to_string(),
        number_of_officers: integer("nbreOfOfficers")?,
        number_of_snco: integer("snco")?,
        number_of_enlisted_officers: integer("enlisted")?,
        number_of_fods: integer("fodCount")?,
        start_time: time("startTime")?,
        end_time: time("endTime")?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImageCount {
    pub run_id: String,
    pub images: u64,
}

#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn fetch_run(&self, run_id: &RunId) -> Result<Option<OfflineRun>, StoreError>;

    async fn fetch_records(&self, run_id: &RunId) -> Result<Vec<OfflineRecord>, StoreError>;

    async fn read_image(&self, run_id: &RunId, image: &ImageRef) -> Result<Vec<u8>, StoreError>;

    async fn image_counts(&self) -> Result<Vec<RunImageCount>, StoreError>;
}

/// Destination analytics database. `write_record` is an upsert keyed by fodID.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn create_report(&self, report: &ReportDraft) -> Result<ReportId, StoreError>;

    async fn create_fod(&self, report_id: ReportId, offline_id: &str) -> Result<FodId, StoreError>;

    async fn write_record(&self, record: &OnlineRecord) -> Result<(), StoreError>;
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
            RetryDisposition::Retryable
        }
        // SQLSTATE 40001 (MySQL deadlock), SQLITE_BUSY / SQLITE_LOCKED.
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("5") | Some("6") | Some("517") => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

fn sqlx_store_error(err: sqlx::Error, what: impl fmt::Display) -> StoreError {
    let disposition = classify_sqlx_error(&err);
    let err = anyhow::Error::new(err).context(what.to_string());
    match disposition {
        RetryDisposition::Retryable => StoreError::Transient(err),
        RetryDisposition::NonRetryable => StoreError::Permanent(err),
    }
}

#[derive(Debug, Clone)]
pub struct SqliteOfflineStore {
    pool: SqlitePool,
}

impl SqliteOfflineStore {
    /// Opens the database read-only; the offline store is never written to.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("parsing offline database url {url}"))?
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to offline database {url}"))?;
        info!(url, "connected to offline database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn column_text(row: &SqliteRow, ordinal: usize) -> Result<Option<String>, sqlx::Error> {
    let raw = row.try_get_raw(ordinal)?;
    if raw.is_null() {
        return Ok(None);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();
    let text = match storage.as_str() {
        "INTEGER" => row.try_get_unchecked::<i64, _>(ordinal)?.to_string(),
        "REAL" => row.try_get_unchecked::<f64, _>(ordinal)?.to_string(),
        "BLOB" => return Ok(None),
        _ => row.try_get_unchecked::<String, _>(ordinal)?,
    };
    Ok(Some(text))
}

fn row_columns(row: &SqliteRow) -> Result<BTreeMap<String, String>, sqlx::Error> {
    let mut columns = BTreeMap::new();
    for column in row.columns() {
        if let Some(text) = column_text(row, column.ordinal())? {
            columns.insert(column.name().to_string(), text);
        }
    }
    Ok(columns)
}

#[async_trait]
impl OfflineStore for SqliteOfflineStore {
    async fn fetch_run(&self, run_id: &RunId) -> Result<Option<OfflineRun>, StoreError> {
        let sql = format!("SELECT * FROM {OFFLINE_RUNS_TABLE} WHERE ID = ?");
        let row = sqlx::query(&sql)
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_store_error(e, format!("fetching run {run_id}")))?;

        row.map(|row| {
            row_columns(&row)
                .map(|columns| OfflineRun {
                    run_id: run_id.clone(),
                    columns,
                })
                .map_err(|e| sqlx_store_error(e, format!("decoding run {run_id}")))
        })
        .transpose()
    }

    async fn fetch_records(&self, run_id: &RunId) -> Result<Vec<OfflineRecord>, StoreError> {
        let sql = format!("SELECT * FROM {OFFLINE_FODS_TABLE} WHERE runID = ? ORDER BY ID");
        let rows = sqlx::query(&sql)
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sqlx_store_error(e, format!("fetching records of run {run_id}")))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let columns = row_columns(row)
                .map_err(|e| sqlx_store_error(e, format!("decoding records of run {run_id}")))?;
            let id = columns.get("ID").cloned().ok_or_else(|| {
                StoreError::permanent(anyhow!("{OFFLINE_FODS_TABLE} row without ID in run {run_id}"))
            })?;
            records.push(OfflineRecord {
                id,
                run_id: run_id.clone(),
                columns,
            });
        }
        debug!(%run_id, count = records.len(), "fetched offline records");
        Ok(records)
    }

    async fn read_image(&self, run_id: &RunId, image: &ImageRef) -> Result<Vec<u8>, StoreError> {
        let sql = format!("SELECT fodImage FROM {OFFLINE_FODS_TABLE} WHERE runID = ? AND ID = ?");
        let blob: Option<Option<Vec<u8>>> = sqlx::query_scalar(&sql)
            .bind(run_id.as_str())
            .bind(image.record_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_store_error(e, format!("reading image {}", image.image_name)))?;

        blob.flatten().ok_or_else(|| {
            StoreError::permanent(anyhow!(
                "no image blob for record {} ({})",
                image.record_id,
                image.image_name
            ))
        })
    }

    async fn image_counts(&self) -> Result<Vec<RunImageCount>, StoreError> {
        let sql = format!(
            "SELECT runID, COUNT(*) AS images FROM {OFFLINE_FODS_TABLE} GROUP BY runID ORDER BY images DESC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sqlx_store_error(e, "counting images per run"))?;

        rows.iter()
            .map(|row| {
                let run_id = column_text(row, 0)?.unwrap_or_default();
                let images: i64 = row.try_get(1)?;
                Ok(RunImageCount {
                    run_id,
                    images: images.max(0) as u64,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| sqlx_store_error(e, "decoding image counts"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryOfflineStore {
    runs: BTreeMap<RunId, OfflineRun>,
    records: BTreeMap<RunId, Vec<OfflineRecord>>,
    images: BTreeMap<(RunId, String), Vec<u8>>,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run(mut self, run: OfflineRun, records: Vec<OfflineRecord>) -> Self {
        self.records.insert(run.run_id.clone(), records);
        self.runs.insert(run.run_id.clone(), run);
        self
    }

    pub fn with_image(mut self, run_id: &RunId, record_id: &str, bytes: Vec<u8>) -> Self {
        self.images
            .insert((run_id.clone(), record_id.to_string()), bytes);
        self
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn fetch_run(&self, run_id: &RunId) -> Result<Option<OfflineRun>, StoreError> {
        Ok(self.runs.get(run_id).cloned())
    }

    async fn fetch_records(&self, run_id: &RunId) -> Result<Vec<OfflineRecord>, StoreError> {
        Ok(self.records.get(run_id).cloned().unwrap_or_default())
    }

    async fn read_image(&self, run_id: &RunId, image: &ImageRef) -> Result<Vec<u8>, StoreError> {
        self.images
            .get(&(run_id.clone(), image.record_id.clone()))
            .cloned()
            .ok_or_else(|| {
                StoreError::permanent(anyhow!(
                    "no image blob for record {} ({})",
                    image.record_id,
                    image.image_name
                ))
            })
    }

    async fn image_counts(&self) -> Result<Vec<RunImageCount>, StoreError> {
        let mut counts = self
            .records
            .iter()
            .map(|(run_id, records)| RunImageCount {
                run_id: run_id.to_string(),
                images: records.len() as u64,
            })
            .collect::<Vec<_>>();
        counts.sort_by(|a, b| b.images.cmp(&a.images).then(a.run_id.cmp(&b.run_id)));
        Ok(counts)
    }
}

/// JSON fixture describing one offline run, its FOD rows and image files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub run: BTreeMap<String, String>,
    pub records: Vec<BTreeMap<String, String>>,
    /// Offline record ID -> image path relative to the bundle file.
    #[serde(default)]
    pub images: BTreeMap<String, String>,
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<MemoryOfflineStore> {
    let path = path.as_ref();
    let bundle: FixtureBundle = read_json_file(path)?;
    let run_id = bundle
        .run
        .get("ID")
        .ok_or_else(|| anyhow!("fixture {} has no run ID", path.display()))
        .and_then(|id| RunId::parse(id).map_err(anyhow::Error::new))?;

    let records = bundle
        .records
        .iter()
        .map(|columns| {
            let id = columns
                .get("ID")
                .cloned()
                .ok_or_else(|| anyhow!("fixture {} has a record without ID", path.display()))?;
            Ok(OfflineRecord {
                id,
                run_id: run_id.clone(),
                columns: columns.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut store = MemoryOfflineStore::new().with_run(
        OfflineRun {
            run_id: run_id.clone(),
            columns: bundle.run.clone(),
        },
        records,
    );
    for (record_id, rel_path) in &bundle.images {
        let image_path = base.join(rel_path);
        let bytes = std::fs::read(&image_path)
            .with_context(|| format!("reading fixture image {}", image_path.display()))?;
        store = store.with_image(&run_id, record_id, bytes);
    }
    Ok(store)
}

#[derive(Clone)]
pub struct DbCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl DbCredentials {
    pub fn from_env() -> Result<Self> {
        let var = |key: &str| std::env::var(key).map_err(|_| anyhow!("missing env var {key}"));
        Ok(Self {
            host: var("HOST")?,
            port: var("PORT")?
                .parse()
                .context("PORT is not a valid port number")?,
            username: var("USERNAME")?,
            password: var("PASSWORD")?,
            database: var("DATABASE")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MySqlDestinationStore {
    pool: MySqlPool,
}

impl MySqlDestinationStore {
    pub async fn connect(credentials: &DbCredentials, acquire_timeout: Duration) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&credentials.host)
            .port(credentials.port)
            .username(&credentials.username)
            .password(&credentials.password)
            .database(&credentials.database);
        let pool = MySqlPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await
            .with_context(|| {
                format!(
                    "connecting to destination database {}:{}/{}",
                    credentials.host, credentials.port, credentials.database
                )
            })?;
        info!(host = %credentials.host, database = %credentials.database, "connected to destination database");
        Ok(Self { pool })
    }
}

#[async_trait]
impl DestinationStore for MySqlDestinationStore {
    async fn create_report(&self, report: &ReportDraft) -> Result<ReportId, StoreError> {
        let result = sqlx::query(
            "INSERT INTO tblReport (userID, reportType, unit, numberOfOfficers, numberOfSNCO, \
             numberOfEnlistedOfficers, numberOfFods, startTime, endTime) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(report.user_id)
        .bind(&report.report_type)
        .bind(&report.unit)
        .bind(report.number_of_officers)
        .bind(report.number_of_snco)
        .bind(report.number_of_enlisted_officers)
        .bind(report.number_of_fods)
        .bind(&report.start_time)
        .bind(&report.end_time)
        .execute(&self.pool)
        .await
        .map_err(|e| sqlx_store_error(e, format!("creating report for run {}", report.run_id)))?;
        Ok(result.last_insert_id())
    }

    async fn create_fod(&self, report_id: ReportId, offline_id: &str) -> Result<FodId, StoreError> {
        let result = sqlx::query("INSERT INTO tblFod (reportID) VALUES (?)")
            .bind(report_id)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_store_error(e, format!("creating fod for offline record {offline_id}")))?;
        Ok(result.last_insert_id())
    }

    async fn write_record(&self, record: &OnlineRecord) -> Result<(), StoreError> {
        let (Some(report_id), Some(fod_id)) = (record.report_id, record.fod_id) else {
            return Err(StoreError::permanent(anyhow!(
                "record {} has no destination identifiers",
                record.offline_id
            )));
        };
        if let Some(bad) = record.fields.keys().find(|name| !is_sql_identifier(name)) {
            return Err(StoreError::permanent(anyhow!("refusing to write column {bad:?}")));
        }

        let assignments = record
            .fields
            .keys()
            .map(|name| format!("`{name}` = ?"))
            .chain(std::iter::once("reportID = ?".to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE tblFod SET {assignments} WHERE fodID = ?");

        let mut query = sqlx::query(&sql);
        for value in record.fields.values() {
            query = match value {
                OnlineValue::Null => query.bind(None::<String>),
                OnlineValue::Float(v) => query.bind(*v),
                OnlineValue::Text(v) => query.bind(v.clone()),
            };
        }
        query
            .bind(report_id)
            .bind(fod_id)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_store_error(e, format!("writing fod {fod_id}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDestinationState {
    pub reports: BTreeMap<ReportId, ReportDraft>,
    pub fods: BTreeMap<FodId, (ReportId, String)>,
    pub records: BTreeMap<FodId, OnlineRecord>,
    pub record_writes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryDestinationStore {
    state: Mutex<MemoryDestinationState>,
}

impl MemoryDestinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryDestinationState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl DestinationStore for MemoryDestinationStore {
    async fn create_report(&self, report: &ReportDraft) -> Result<ReportId, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.reports.keys().next_back().copied().unwrap_or(0) + 1;
        state.reports.insert(id, report.clone());
        Ok(id)
    }

    async fn create_fod(&self, report_id: ReportId, offline_id: &str) -> Result<FodId, StoreError> {
        let mut state = self.state.lock().await;
        if !state.reports.contains_key(&report_id) {
            return Err(StoreError::permanent(anyhow!("unknown reportID {report_id}")));
        }
        let id = state.fods.keys().next_back().copied().unwrap_or(0) + 1;
        state.fods.insert(id, (report_id, offline_id.to_string()));
        Ok(id)
    }

    async fn write_record(&self, record: &OnlineRecord) -> Result<(), StoreError> {
        let Some(fod_id) = record.fod_id else {
            return Err(StoreError::permanent(anyhow!(
                "record {} has no fodID",
                record.offline_id
            )));
        };
        let mut state = self.state.lock().await;
        if !state.fods.contains_key(&fod_id) {
            return Err(StoreError::permanent(anyhow!("unknown fodID {fod_id}")));
        }
        state.records.insert(fod_id, record.clone());
        state.record_writes += 1;
        Ok(())
    }
}
