use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::AnalysisId;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid md5 checksum: {0}")]
    InvalidMd5(String),

    #[error("invalid file state: {0}")]
    InvalidState(String),

    #[error("invalid analysis id: {0}")]
    InvalidAnalysisId(String),

    #[error("invalid annotation {key}: {message}")]
    InvalidAnnotation { key: String, message: String },

    #[error("missing configuration key {0}")]
    #[diagnostic(help("keys are read from the coordination service under the worker prefix"))]
    MissingConfigKey(String),

    #[error("invalid configuration value for {key}: {message}")]
    ConfigValue { key: String, message: String },

    #[error("staging root is not a directory: {0}")]
    StagingRoot(PathBuf),

    #[error("analysis {0} is already claimed by another worker")]
    ClaimRaceLost(AnalysisId),

    #[error("no submitted files available for source {0}")]
    NoWork(String),

    #[error("gave up locking rows for analysis {analysis_id} after {attempts} attempts")]
    ClaimLockTimeout {
        analysis_id: AnalysisId,
        attempts: usize,
    },

    #[error("analysis {analysis_id} is in a mixed state: {message}")]
    MixedAnalysisState {
        analysis_id: AnalysisId,
        message: String,
    },

    #[error(
        "expected {expected} downloaded files for {analysis_id}, found {found} (missing: [{}], unexpected: [{}])",
        .missing.join(", "),
        .unexpected.join(", ")
    )]
    DownloadCountMismatch {
        analysis_id: AnalysisId,
        expected: usize,
        found: usize,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("server reports {found} parts for upload {upload_id}, expected {expected}")]
    PartCountMismatch {
        upload_id: String,
        expected: usize,
        found: usize,
    },

    #[error("part {part} timed out after {seconds}s")]
    PartUploadTimeout { part: i32, seconds: u64 },

    #[error("part {part} failed after {attempts} attempts: {message}")]
    PartUploadFailed {
        part: i32,
        attempts: usize,
        message: String,
    },

    #[error("checksum mismatch for {key}: {message}")]
    InvalidChecksum { key: String, message: String },

    #[error("identifier service request failed: {0}")]
    IdentifierServiceError(String),

    #[error("identifier service returned status {status}: {message}")]
    IdentifierServiceStatus { status: u16, message: String },

    #[error("coordination session lost: {0}")]
    SessionLost(String),

    #[error("interrupted by operator")]
    Interrupted,

    #[error("coordination service request failed: {0}")]
    Coordination(String),

    #[error("coordination service returned status {status}: {message}")]
    CoordinationStatus { status: u16, message: String },

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("bulk download failed: {0}")]
    Download(String),

    #[error("insufficient space in {path}: need {needed} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl IngestError {
    pub fn is_retryable_claim(&self) -> bool {
        matches!(
            self,
            IngestError::ClaimRaceLost(_)
                | IngestError::NoWork(_)
                | IngestError::ClaimLockTimeout { .. }
                | IngestError::MixedAnalysisState { .. }
        )
    }

    pub fn contested_analysis(&self) -> Option<&AnalysisId> {
        match self {
            IngestError::ClaimRaceLost(analysis_id)
            | IngestError::ClaimLockTimeout { analysis_id, .. }
            | IngestError::MixedAnalysisState { analysis_id, .. } => Some(analysis_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::InvalidMd5(_)
            | IngestError::InvalidState(_)
            | IngestError::InvalidAnalysisId(_)
            | IngestError::InvalidAnnotation { .. } => "InvalidRecord",
            IngestError::MissingConfigKey(_)
            | IngestError::ConfigValue { .. }
            | IngestError::StagingRoot(_) => "Config",
            IngestError::ClaimRaceLost(_) => "ClaimRaceLost",
            IngestError::NoWork(_) => "NoWork",
            IngestError::ClaimLockTimeout { .. } => "ClaimLockTimeout",
            IngestError::MixedAnalysisState { .. } => "MixedAnalysisState",
            IngestError::DownloadCountMismatch { .. } => "DownloadCountMismatch",
            IngestError::PartCountMismatch { .. } => "PartCountMismatch",
            IngestError::PartUploadTimeout { .. } => "PartUploadTimeout",
            IngestError::PartUploadFailed { .. } => "PartUploadFailed",
            IngestError::InvalidChecksum { .. } => "InvalidChecksum",
            IngestError::IdentifierServiceError(_) | IngestError::IdentifierServiceStatus { .. } => {
                "IdentifierServiceError"
            }
            IngestError::SessionLost(_) => "SessionLost",
            IngestError::Interrupted => "Interrupted",
            IngestError::Coordination(_) | IngestError::CoordinationStatus { .. } => "Coordination",
            IngestError::Metadata(_) => "Metadata",
            IngestError::ObjectStore(_) => "ObjectStore",
            IngestError::Download(_) => "Download",
            IngestError::InsufficientSpace { .. } => "InsufficientSpace",
            IngestError::MissingTool(_) => "MissingTool",
            IngestError::Filesystem(_) => "Filesystem",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            IngestError::Interrupted => 130,
            IngestError::MissingConfigKey(_)
            | IngestError::ConfigValue { .. }
            | IngestError::StagingRoot(_) => 2,
            IngestError::MissingTool(_)
            | IngestError::Coordination(_)
            | IngestError::CoordinationStatus { .. }
            | IngestError::Metadata(_) => 3,
            _ => 1,
        }
    }
}
