use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use postgres::error::SqlState;
use postgres::{Client, GenericClient, NoTls, Row};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    AnalysisId, Annotation, Annotations, FileRecord, FileState, INDEX_SUFFIX, SourceTag,
};
use crate::error::IngestError;

pub const CLAIM_LOCK_ATTEMPTS: usize = 5;
pub const CLAIM_LOCK_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub source: SourceTag,
    pub analysis_id: Option<AnalysisId>,
    pub exclude: Vec<AnalysisId>,
}

impl ClaimRequest {
    pub fn new(source: SourceTag) -> Self {
        Self {
            source,
            analysis_id: None,
            exclude: Vec::new(),
        }
    }

    pub fn targeted(source: SourceTag, analysis_id: AnalysisId) -> Self {
        Self {
            source,
            analysis_id: Some(analysis_id),
            exclude: Vec::new(),
        }
    }
}

pub type AcquireLock<'a> = dyn FnMut(&AnalysisId) -> Result<bool, IngestError> + 'a;

pub trait MetadataStore: Send + Sync {
    fn claim_analysis(
        &self,
        request: &ClaimRequest,
        acquire: &mut AcquireLock<'_>,
    ) -> Result<Vec<FileRecord>, IngestError>;
    fn set_state(&self, node_id: Uuid, state: FileState) -> Result<(), IngestError>;
    fn annotate(&self, node_id: Uuid, annotations: &[Annotation]) -> Result<(), IngestError>;
    fn get_file(&self, node_id: Uuid) -> Result<Option<FileRecord>, IngestError>;
    fn backup_candidates(
        &self,
        source: &SourceTag,
        drivers: &[String],
        limit: usize,
    ) -> Result<Vec<FileRecord>, IngestError>;
}

pub fn verify_claim(
    request: &ClaimRequest,
    analysis_id: &AnalysisId,
    rows: &[FileRecord],
) -> Result<Vec<(Uuid, FileState)>, IngestError> {
    let mixed = |message: String| IngestError::MixedAnalysisState {
        analysis_id: analysis_id.clone(),
        message,
    };

    if rows.is_empty() {
        return Err(IngestError::NoWork(request.source.to_string()));
    }
    if let Some(row) = rows.iter().find(|row| row.source != request.source) {
        return Err(mixed(format!(
            "{} belongs to source {}",
            row.file_name, row.source
        )));
    }

    let recoveries = rows
        .iter()
        .filter(|row| row.state.recovered() != row.state)
        .map(|row| (row.node_id, row.state.recovered()))
        .collect();
    if rows.iter().all(|row| row.state.is_terminal()) {
        return Err(mixed("every file is already terminal".to_string()));
    }
    Ok(recoveries)
}

pub enum LockAttempt<T> {
    Locked(T),
    Busy(AnalysisId),
}

// Runs `attempt` until it gets the row locks, sleeping `backoff * n` after
// the n-th busy answer.
pub fn retry_row_locks<T>(
    source: &SourceTag,
    attempts: usize,
    backoff: Duration,
    mut attempt: impl FnMut(usize) -> Result<LockAttempt<T>, IngestError>,
) -> Result<T, IngestError> {
    let mut last_analysis = None;
    for n in 1..=attempts {
        match attempt(n)? {
            LockAttempt::Locked(value) => return Ok(value),
            LockAttempt::Busy(analysis_id) => {
                debug!(%analysis_id, attempt = n, "rows locked by another worker");
                last_analysis = Some(analysis_id);
                if n < attempts {
                    thread::sleep(backoff * n as u32);
                }
            }
        }
    }
    match last_analysis {
        Some(analysis_id) => Err(IngestError::ClaimLockTimeout {
            analysis_id,
            attempts,
        }),
        None => Err(IngestError::NoWork(source.to_string())),
    }
}

pub struct PgMetadataStore {
    client: Mutex<Client>,
}

const FILE_COLUMNS: &str =
    "node_id, file_name, file_size, md5sum, state, acl, system_annotations";

impl PgMetadataStore {
    pub fn connect(connection_string: &str) -> Result<Self, IngestError> {
        let client = Client::connect(connection_string, NoTls)
            .map_err(|err| IngestError::Metadata(err.to_string()))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    fn with_client<T>(
        &self,
        op: impl FnOnce(&mut Client) -> Result<T, IngestError>,
    ) -> Result<T, IngestError> {
        let mut guard = self
            .client
            .lock()
            .map_err(|_| IngestError::Metadata("metadata connection poisoned".to_string()))?;
        op(&mut guard)
    }

    fn pick_candidate(
        client: &mut impl GenericClient,
        request: &ClaimRequest,
    ) -> Result<Option<AnalysisId>, IngestError> {
        let states = [
            FileState::Submitted,
            FileState::Uploading,
            FileState::Uploaded,
            FileState::Validating,
        ]
        .iter()
        .map(|state| state.as_str())
        .collect::<Vec<_>>();
        let excluded = request
            .exclude
            .iter()
            .map(|id| id.as_str().to_string())
            .collect::<Vec<_>>();
        let row = client
            .query_opt(
                "SELECT system_annotations->>'analysis_id' FROM file \
                 WHERE state = ANY($1) \
                   AND system_annotations->>'source' = $2 \
                   AND file_name NOT LIKE '%' || $3 \
                   AND NOT (system_annotations->>'analysis_id' = ANY($4)) \
                 ORDER BY random() LIMIT 1",
                &[
                    &states,
                    &request.source.as_str(),
                    &INDEX_SUFFIX,
                    &excluded,
                ],
            )
            .map_err(|err| IngestError::Metadata(err.to_string()))?;
        row.map(|row| {
            let value: Option<String> = row.get(0);
            value
                .ok_or_else(|| IngestError::Metadata("candidate without analysis_id".to_string()))?
                .parse()
        })
        .transpose()
    }

    fn claim_attempt(
        client: &mut Client,
        request: &ClaimRequest,
        acquire: &mut AcquireLock<'_>,
    ) -> Result<LockAttempt<Vec<FileRecord>>, IngestError> {
        let mut tx = client
            .transaction()
            .map_err(|err| IngestError::Metadata(err.to_string()))?;

        let analysis_id = match &request.analysis_id {
            Some(id) => id.clone(),
            None => Self::pick_candidate(&mut tx, request)?
                .ok_or_else(|| IngestError::NoWork(request.source.to_string()))?,
        };

        let lock_sql = format!(
            "SELECT {FILE_COLUMNS} FROM file \
             WHERE system_annotations->>'analysis_id' = $1 \
             ORDER BY file_name FOR UPDATE NOWAIT"
        );
        let rows = match tx.query(lock_sql.as_str(), &[&analysis_id.as_str()]) {
            Ok(rows) => rows,
            Err(err) if err.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => {
                let _ = tx.rollback();
                return Ok(LockAttempt::Busy(analysis_id));
            }
            Err(err) => return Err(IngestError::Metadata(err.to_string())),
        };
        let mut files = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()?;

        let recoveries = verify_claim(request, &analysis_id, &files)?;
        if !acquire(&analysis_id)? {
            let _ = tx.rollback();
            return Err(IngestError::ClaimRaceLost(analysis_id));
        }

        for (node_id, state) in &recoveries {
            warn!(%analysis_id, %node_id, %state, "recovering file from abandoned attempt");
            tx.execute(
                "UPDATE file SET state = $2 WHERE node_id = $1",
                &[node_id, &state.as_str()],
            )
            .map_err(|err| IngestError::Metadata(err.to_string()))?;
            if let Some(file) = files.iter_mut().find(|file| file.node_id == *node_id) {
                file.state = *state;
            }
        }
        tx.commit()
            .map_err(|err| IngestError::Metadata(err.to_string()))?;
        info!(%analysis_id, files = files.len(), "claimed analysis");
        Ok(LockAttempt::Locked(files))
    }
}

impl MetadataStore for PgMetadataStore {
    fn claim_analysis(
        &self,
        request: &ClaimRequest,
        acquire: &mut AcquireLock<'_>,
    ) -> Result<Vec<FileRecord>, IngestError> {
        self.with_client(|client| {
            retry_row_locks(
                &request.source,
                CLAIM_LOCK_ATTEMPTS,
                CLAIM_LOCK_BACKOFF,
                |_| Self::claim_attempt(client, request, acquire),
            )
        })
    }

    fn set_state(&self, node_id: Uuid, state: FileState) -> Result<(), IngestError> {
        self.with_client(|client| {
            let updated = client
                .execute(
                    "UPDATE file SET state = $2 WHERE node_id = $1",
                    &[&node_id, &state.as_str()],
                )
                .map_err(|err| IngestError::Metadata(err.to_string()))?;
            if updated == 0 {
                return Err(IngestError::Metadata(format!("file {node_id} not found")));
            }
            Ok(())
        })
    }

    fn annotate(&self, node_id: Uuid, annotations: &[Annotation]) -> Result<(), IngestError> {
        let patch = Value::Object(
            annotations
                .iter()
                .map(|annotation| (annotation.key(), annotation.value()))
                .collect(),
        );
        self.with_client(|client| {
            client
                .execute(
                    "UPDATE file SET system_annotations = \
                     coalesce(system_annotations, '{}'::jsonb) || $2 WHERE node_id = $1",
                    &[&node_id, &patch],
                )
                .map_err(|err| IngestError::Metadata(err.to_string()))?;
            Ok(())
        })
    }

    fn get_file(&self, node_id: Uuid) -> Result<Option<FileRecord>, IngestError> {
        self.with_client(|client| {
            let sql = format!("SELECT {FILE_COLUMNS} FROM file WHERE node_id = $1");
            client
                .query_opt(sql.as_str(), &[&node_id])
                .map_err(|err| IngestError::Metadata(err.to_string()))?
                .as_ref()
                .map(row_to_record)
                .transpose()
        })
    }

    fn backup_candidates(
        &self,
        source: &SourceTag,
        drivers: &[String],
        limit: usize,
    ) -> Result<Vec<FileRecord>, IngestError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_client(|client| {
            let sql = format!(
                "SELECT {FILE_COLUMNS} FROM file \
                 WHERE state = 'live' \
                   AND system_annotations->>'source' = $3 \
                   AND EXISTS ( \
                   SELECT 1 FROM unnest($1::text[]) AS d(driver) \
                   WHERE coalesce(system_annotations->>('backup.' || d.driver), '') \
                         <> 'backuped') \
                 ORDER BY random() LIMIT $2"
            );
            let rows = client
                .query(sql.as_str(), &[&drivers, &limit, &source.as_str()])
                .map_err(|err| IngestError::Metadata(err.to_string()))?;
            rows.iter().map(row_to_record).collect()
        })
    }
}

fn row_to_record(row: &Row) -> Result<FileRecord, IngestError> {
    let file_size: i64 = row.get("file_size");
    let file_size = u64::try_from(file_size)
        .map_err(|_| IngestError::Metadata(format!("negative file_size {file_size}")))?;
    let state: String = row.get("state");
    let acl: Option<Vec<String>> = row.get("acl");
    let system: Option<Value> = row.get("system_annotations");
    let mut system = match system {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };

    let source = system
        .remove("source")
        .and_then(|value| value.as_str().map(SourceTag::new))
        .ok_or_else(|| IngestError::Metadata("file row without source".to_string()))?;
    let analysis_id = system
        .remove("analysis_id")
        .and_then(|value| value.as_str().map(str::to_string))
        .ok_or_else(|| IngestError::Metadata("file row without analysis_id".to_string()))?
        .parse()?;

    Ok(FileRecord {
        node_id: row.get("node_id"),
        file_name: row.get("file_name"),
        file_size,
        md5sum: row.get("md5sum"),
        state: state.parse()?,
        source,
        analysis_id,
        acl: acl.unwrap_or_default(),
        annotations: Annotations::from_json(&system)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, state: FileState) -> FileRecord {
        FileRecord {
            node_id: Uuid::new_v4(),
            file_name: name.to_string(),
            file_size: 1,
            md5sum: String::new(),
            state,
            source: SourceTag::new("tcga_cghub"),
            analysis_id: "aid".parse().unwrap(),
            acl: Vec::new(),
            annotations: Annotations::default(),
        }
    }

    #[test]
    fn partially_uploaded_analysis_is_resumed_by_any_claim() {
        let request = ClaimRequest::new(SourceTag::new("tcga_cghub"));
        let aid: AnalysisId = "aid".parse().unwrap();
        let rows = vec![
            row("foo.bam", FileState::Submitted),
            row("foo.bam.bai", FileState::Submitted),
        ];
        assert!(verify_claim(&request, &aid, &rows).unwrap().is_empty());

        let rows = vec![
            row("foo.bam", FileState::Uploaded),
            row("foo.bam.bai", FileState::Submitted),
        ];
        assert!(verify_claim(&request, &aid, &rows).unwrap().is_empty());
    }

    #[test]
    fn finished_analysis_is_rejected() {
        let request = ClaimRequest::new(SourceTag::new("tcga_cghub"));
        let aid: AnalysisId = "aid".parse().unwrap();
        let rows = vec![
            row("foo.bam", FileState::Live),
            row("foo.bam.bai", FileState::Invalid),
        ];
        assert!(matches!(
            verify_claim(&request, &aid, &rows),
            Err(IngestError::MixedAnalysisState { .. })
        ));
    }

    #[test]
    fn abandoned_upload_reverts_to_submitted() {
        let request = ClaimRequest::new(SourceTag::new("tcga_cghub"));
        let aid: AnalysisId = "aid".parse().unwrap();
        let rows = vec![row("foo.bam", FileState::Uploading)];
        let recoveries = verify_claim(&request, &aid, &rows).unwrap();
        assert_eq!(recoveries, vec![(rows[0].node_id, FileState::Submitted)]);
    }

    #[test]
    fn targeted_claim_resumes_partial_analysis() {
        let aid: AnalysisId = "aid".parse().unwrap();
        let request = ClaimRequest::targeted(SourceTag::new("tcga_cghub"), aid.clone());
        let rows = vec![
            row("foo.bam", FileState::Validating),
            row("foo.bam.bai", FileState::Submitted),
        ];
        let recoveries = verify_claim(&request, &aid, &rows).unwrap();
        assert_eq!(recoveries, vec![(rows[0].node_id, FileState::Uploaded)]);
    }

    #[test]
    fn foreign_source_is_rejected() {
        let request = ClaimRequest::new(SourceTag::new("target_cghub"));
        let aid: AnalysisId = "aid".parse().unwrap();
        let rows = vec![row("foo.bam", FileState::Submitted)];
        assert!(verify_claim(&request, &aid, &rows).is_err());
    }

    #[test]
    fn busy_rows_time_out_after_every_attempt() {
        let aid: AnalysisId = "aid".parse().unwrap();
        let mut calls = 0;
        let result: Result<(), _> = retry_row_locks(
            &SourceTag::new("tcga_cghub"),
            CLAIM_LOCK_ATTEMPTS,
            Duration::ZERO,
            |_| {
                calls += 1;
                Ok(LockAttempt::Busy(aid.clone()))
            },
        );
        assert_eq!(calls, CLAIM_LOCK_ATTEMPTS);
        assert!(matches!(
            result,
            Err(IngestError::ClaimLockTimeout { attempts: 5, ref analysis_id }) if *analysis_id == aid
        ));
    }

    #[test]
    fn rows_locked_on_third_attempt_are_returned() {
        let aid: AnalysisId = "aid".parse().unwrap();
        let rows = vec![row("foo.bam", FileState::Submitted)];
        let mut attempts = Vec::new();
        let claimed = retry_row_locks(
            &SourceTag::new("tcga_cghub"),
            CLAIM_LOCK_ATTEMPTS,
            Duration::ZERO,
            |n| {
                attempts.push(n);
                if n < 3 {
                    Ok(LockAttempt::Busy(aid.clone()))
                } else {
                    Ok(LockAttempt::Locked(rows.clone()))
                }
            },
        )
        .unwrap();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].node_id, rows[0].node_id);
    }

    #[test]
    fn lock_attempt_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = retry_row_locks(
            &SourceTag::new("tcga_cghub"),
            CLAIM_LOCK_ATTEMPTS,
            Duration::ZERO,
            |_| {
                calls += 1;
                Err(IngestError::Metadata("connection reset".to_string()))
            },
        );
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(IngestError::Metadata(_))));
    }
}
