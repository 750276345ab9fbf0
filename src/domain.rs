use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::IngestError;

pub const INDEX_SUFFIX: &str = ".bai";

pub const INGEST_LEASE_PREFIX: &str = "ingest/current";

pub const BACKUP_LEASE_PREFIX: &str = "backup/current";

static MD5_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{32}$").expect("static md5 pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Submitted,
    Uploading,
    Uploaded,
    Validating,
    Live,
    Invalid,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Submitted => "submitted",
            FileState::Uploading => "uploading",
            FileState::Uploaded => "uploaded",
            FileState::Validating => "validating",
            FileState::Live => "live",
            FileState::Invalid => "invalid",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Live | FileState::Invalid)
    }

    pub fn recovered(&self) -> FileState {
        match self {
            FileState::Uploading => FileState::Submitted,
            FileState::Validating => FileState::Uploaded,
            other => *other,
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "submitted" => Ok(FileState::Submitted),
            "uploading" => Ok(FileState::Uploading),
            "uploaded" => Ok(FileState::Uploaded),
            "validating" => Ok(FileState::Validating),
            "live" => Ok(FileState::Live),
            "invalid" => Ok(FileState::Invalid),
            other => Err(IngestError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnalysisId(String);

impl AnalysisId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn lease_key(&self) -> String {
        format!("{INGEST_LEASE_PREFIX}/{}", self.0)
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AnalysisId {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !is_valid {
            return Err(IngestError::InvalidAnalysisId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceTag(String);

impl SourceTag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Md5Hex(String);

impl Md5Hex {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_digest(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // validated on construction
        hex::decode(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for Md5Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Md5Hex {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        if !MD5_PATTERN.is_match(&normalized) {
            return Err(IngestError::InvalidMd5(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Backuped,
    Failed,
}

impl BackupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupState::Backuped => "backuped",
            BackupState::Failed => "failed",
        }
    }
}

impl FromStr for BackupState {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "backuped" => Ok(BackupState::Backuped),
            "failed" => Ok(BackupState::Failed),
            other => Err(IngestError::InvalidAnnotation {
                key: "backup".to_string(),
                message: format!("unknown backup status {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    ImportCompleted(i64),
    ImportTook(u64),
    BackupStatus { driver: String, status: BackupState },
    LastError(String),
    Other { key: String, value: Value },
}

const IMPORT_COMPLETED: &str = "import_completed";
const IMPORT_TOOK: &str = "import_took";
const LAST_ERROR: &str = "last_error";
const BACKUP_PREFIX: &str = "backup.";

impl Annotation {
    pub fn key(&self) -> String {
        match self {
            Annotation::ImportCompleted(_) => IMPORT_COMPLETED.to_string(),
            Annotation::ImportTook(_) => IMPORT_TOOK.to_string(),
            Annotation::BackupStatus { driver, .. } => format!("{BACKUP_PREFIX}{driver}"),
            Annotation::LastError(_) => LAST_ERROR.to_string(),
            Annotation::Other { key, .. } => key.clone(),
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Annotation::ImportCompleted(secs) => Value::from(*secs),
            Annotation::ImportTook(secs) => Value::from(*secs),
            Annotation::BackupStatus { status, .. } => Value::from(status.as_str()),
            Annotation::LastError(message) => Value::from(message.as_str()),
            Annotation::Other { value, .. } => value.clone(),
        }
    }

    pub fn parse(key: &str, value: &Value) -> Result<Self, IngestError> {
        let invalid = |message: &str| IngestError::InvalidAnnotation {
            key: key.to_string(),
            message: message.to_string(),
        };
        match key {
            IMPORT_COMPLETED => value
                .as_i64()
                .map(Annotation::ImportCompleted)
                .ok_or_else(|| invalid("expected unix seconds")),
            IMPORT_TOOK => value
                .as_u64()
                .map(Annotation::ImportTook)
                .ok_or_else(|| invalid("expected seconds")),
            LAST_ERROR => value
                .as_str()
                .map(|message| Annotation::LastError(message.to_string()))
                .ok_or_else(|| invalid("expected a string")),
            _ if key.starts_with(BACKUP_PREFIX) => {
                let driver = &key[BACKUP_PREFIX.len()..];
                if driver.is_empty() {
                    return Err(invalid("missing driver name"));
                }
                let status = value
                    .as_str()
                    .ok_or_else(|| invalid("expected a string"))?
                    .parse()?;
                Ok(Annotation::BackupStatus {
                    driver: driver.to_string(),
                    status,
                })
            }
            _ => Ok(Annotation::Other {
                key: key.to_string(),
                value: value.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations(BTreeMap<String, Annotation>);

impl Annotations {
    pub fn from_json(map: &serde_json::Map<String, Value>) -> Result<Self, IngestError> {
        let mut entries = BTreeMap::new();
        for (key, value) in map {
            entries.insert(key.clone(), Annotation::parse(key, value)?);
        }
        Ok(Self(entries))
    }

    pub fn to_json(&self) -> serde_json::Map<String, Value> {
        self.0
            .iter()
            .map(|(key, annotation)| (key.clone(), annotation.value()))
            .collect()
    }

    pub fn insert(&mut self, annotation: Annotation) {
        self.0.insert(annotation.key(), annotation);
    }

    pub fn merge(&mut self, annotations: &[Annotation]) {
        for annotation in annotations {
            self.insert(annotation.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Annotation> {
        self.0.get(key)
    }

    pub fn import_completed(&self) -> Option<i64> {
        match self.0.get(IMPORT_COMPLETED) {
            Some(Annotation::ImportCompleted(secs)) => Some(*secs),
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self.0.get(LAST_ERROR) {
            Some(Annotation::LastError(message)) => Some(message),
            _ => None,
        }
    }

    pub fn backup_status(&self, driver: &str) -> Option<BackupState> {
        match self.0.get(&format!("{BACKUP_PREFIX}{driver}")) {
            Some(Annotation::BackupStatus { status, .. }) => Some(*status),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub node_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub md5sum: String,
    pub state: FileState,
    pub source: SourceTag,
    pub analysis_id: AnalysisId,
    pub acl: Vec<String>,
    pub annotations: Annotations,
}

impl FileRecord {
    pub fn is_sidecar(&self) -> bool {
        self.file_name.ends_with(INDEX_SUFFIX)
    }

    pub fn object_key(&self) -> String {
        format!("{}/{}", self.analysis_id, self.file_name)
    }

    pub fn backup_lease_key(&self) -> String {
        format!("{BACKUP_LEASE_PREFIX}/{}", self.node_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeasePhase {
    Claimed,
    Downloading,
    Uploading,
    Validating,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub host: String,
    pub started: i64,
    pub state: LeasePhase,
}

impl ClaimLease {
    pub fn to_payload(&self) -> String {
        // plain struct of strings and integers
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn s3_url(host: &str, bucket: &str, record: &FileRecord) -> String {
    format!(
        "s3://{host}/{bucket}/{}/{}",
        record.analysis_id, record.file_name
    )
}
