//! Core domain model for the FOD offline-to-online migration.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BUCKET: &str = "idra-commercial";
pub const IMAGE_PREFIX: &str = "FOD Images";
pub const MAP_PREFIX: &str = "FOD-Images-Map";

/// Destination-side identifiers are auto-increment keys minted by the online store.
pub type ReportId = u64;
pub type FodId = u64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Run IDs end up inside object keys, so path separators and blanks are rejected.
    pub fn parse(raw: &str) -> Result<Self, MigrationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MigrationError::Validation {
                subject: "run".to_string(),
                field: "runID".to_string(),
                reason: "run id is empty".to_string(),
            });
        }
        if trimmed.contains('/') || trimmed.chars().any(char::is_whitespace) {
            return Err(MigrationError::Validation {
                subject: format!("run {trimmed}"),
                field: "runID".to_string(),
                reason: "run id must not contain '/' or whitespace".to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineRun {
    pub run_id: RunId,
    pub columns: BTreeMap<String, String>,
}

impl OfflineRun {
    pub fn column(&self, name: &str) -> Option<&str> {
        self.columns.get(name).map(String::as_str)
    }
}

/// One row of the offline `fodDataIdra` table, blob columns excluded.
///
/// Columns are kept by their offline names so that the field-mapping table,
/// not this type, decides what reaches the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineRecord {
    pub id: String,
    pub run_id: RunId,
    pub columns: BTreeMap<String, String>,
}

impl OfflineRecord {
    pub fn column(&self, name: &str) -> Option<&str> {
        self.columns.get(name).map(String::as_str)
    }

    pub fn image_ref(&self) -> Option<ImageRef> {
        self.column("imageName")
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| ImageRef {
                record_id: self.id.clone(),
                image_name: name.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub record_id: String,
    pub image_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OnlineValue {
    Null,
    Float(f64),
    Text(String),
}

impl OnlineValue {
    /// Empty source strings are stored as NULL in the destination.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            Self::Null
        } else {
            Self::Text(value)
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineRecord {
    pub offline_id: String,
    pub run_id: RunId,
    pub report_id: Option<ReportId>,
    pub fod_id: Option<FodId>,
    pub fields: BTreeMap<String, OnlineValue>,
}

impl OnlineRecord {
    pub fn new(offline_id: impl Into<String>, run_id: RunId) -> Self {
        Self {
            offline_id: offline_id.into(),
            run_id,
            report_id: None,
            fod_id: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&OnlineValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(OnlineValue::as_str)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(OnlineValue::as_f64)
    }

    pub fn set(&mut self, name: impl Into<String>, value: OnlineValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn with_identity(mut self, report_id: ReportId, fod_id: FodId) -> Self {
        self.report_id = Some(report_id);
        self.fod_id = Some(fod_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDraft {
    pub run_id: RunId,
    pub user_id: u64,
    pub report_type: String,
    pub unit: String,
    pub number_of_officers: i64,
    pub number_of_snco: i64,
    pub number_of_enlisted_officers: i64,
    pub number_of_fods: i64,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationError {
    #[error("{subject}: invalid {field}: {reason}")]
    Validation {
        subject: String,
        field: String,
        reason: String,
    },
    #[error("{subject}: missing required field {field}")]
    MissingField { subject: String, field: String },
    #[error("identity resolution failed for {subject}: {reason}")]
    IdentityResolution { subject: String, reason: String },
    #[error("write failed for {subject}: {reason}")]
    Write { subject: String, reason: String },
    #[error("image transfer failed for {image}: {reason}")]
    ImageTransfer { image: String, reason: String },
    #[error("run {run_id} not found in offline store")]
    RunNotFound { run_id: String },
}

impl MigrationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::MissingField { .. } => "missing_field",
            Self::IdentityResolution { .. } => "identity_resolution",
            Self::Write { .. } => "write",
            Self::ImageTransfer { .. } => "image_transfer",
            Self::RunNotFound { .. } => "run_not_found",
        }
    }
}

pub fn record_subject(record_id: &str) -> String {
    format!("record {record_id}")
}

pub fn run_map_prefix(run_id: &RunId) -> String {
    format!("{MAP_PREFIX}/run_{run_id}/")
}

pub fn identity_prefix(run_id: &RunId) -> String {
    format!("{}identity/", run_map_prefix(run_id))
}

pub fn report_identity_key(run_id: &RunId) -> String {
    format!("{}report.json", identity_prefix(run_id))
}

pub fn fod_identity_key(run_id: &RunId, record_id: &str) -> String {
    format!("{}fod-{record_id}.json", identity_prefix(run_id))
}

pub fn report_map_key(run_id: &RunId, report_id: ReportId) -> String {
    format!(
        "{}report-offline-{run_id}-online-{report_id}.json",
        run_map_prefix(run_id)
    )
}

pub fn fods_map_key(run_id: &RunId, report_id: ReportId) -> String {
    format!(
        "{}fods-offline-{run_id}-online-{report_id}.json",
        run_map_prefix(run_id)
    )
}

/// Keyed by the owning record too, so two records sharing an image name never
/// collide on one object.
pub fn image_key(run_id: &RunId, image: &ImageRef) -> String {
    format!("{IMAGE_PREFIX}/run_{run_id}/{}/{}", image.record_id, image.image_name)
}

pub fn object_uri(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}
