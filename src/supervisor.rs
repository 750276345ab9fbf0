use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checksum::verify_remote;
use crate::consul::{
    Coordinator, DEFAULT_LOCK_DELAY, DEFAULT_SESSION_TTL, HEARTBEAT_INTERVAL,
    HEARTBEAT_JOIN_DEADLINE, Heartbeat, SessionBehavior, SessionId, clear_lock,
};
use crate::domain::{
    AnalysisId, Annotation, ClaimLease, FileRecord, FileState, LeasePhase, SourceTag, s3_url,
};
use crate::download::{BulkDownloader, Staging};
use crate::error::IngestError;
use crate::metadata::{ClaimRequest, MetadataStore};
use crate::multipart::{MultipartUploader, UploaderOptions};
use crate::object_store::ObjectStoreConnector;
use crate::shutdown;
use crate::signpost::{IdentifierClient, register_url};
use crate::state::{Transition, invalid_on_checksum, revert_all, scoped_transition};

pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

pub const CLAIM_ROUNDS: usize = 20;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            current: initial,
            cap,
        }
    }

    pub fn advance(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current_ms(&self) -> u128 {
        self.current.as_millis()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub source: SourceTag,
    pub analysis_id: Option<AnalysisId>,
    pub once: bool,
    pub host: String,
    pub session_ttl: Duration,
    pub lock_delay: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_deadline: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
    pub uploader: UploaderOptions,
}

impl WorkerOptions {
    pub fn new(source: SourceTag, host: impl Into<String>) -> Self {
        Self {
            source,
            analysis_id: None,
            once: false,
            host: host.into(),
            session_ttl: DEFAULT_SESSION_TTL,
            lock_delay: DEFAULT_LOCK_DELAY,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_deadline: HEARTBEAT_JOIN_DEADLINE,
            backoff_initial: BACKOFF_INITIAL,
            backoff_cap: BACKOFF_CAP,
            uploader: UploaderOptions::default(),
        }
    }

    fn single_iteration(&self) -> bool {
        self.once || self.analysis_id.is_some()
    }
}

pub struct Environment<M, C, I, D> {
    pub metadata: Arc<M>,
    pub coordinator: Arc<C>,
    pub identifiers: I,
    pub downloader: D,
    pub objects: Arc<dyn ObjectStoreConnector>,
    pub staging: Staging,
    pub buckets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisReport {
    pub uploaded: Vec<String>,
    pub live: Vec<String>,
    pub invalid: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Completed {
        analysis_id: AnalysisId,
        report: AnalysisReport,
    },
    NoWork,
}

pub struct Downloader<M, C, I, D> {
    env: Environment<M, C, I, D>,
    options: WorkerOptions,
    uploader: MultipartUploader,
    cancel: CancellationToken,
}

impl<M, C, I, D> Downloader<M, C, I, D>
where
    M: MetadataStore,
    C: Coordinator + 'static,
    I: IdentifierClient,
    D: BulkDownloader,
{
    pub fn new(env: Environment<M, C, I, D>, options: WorkerOptions, cancel: CancellationToken) -> Self {
        let uploader = MultipartUploader::new(env.objects.clone(), options.uploader, cancel.clone());
        Self {
            env,
            options,
            uploader,
            cancel,
        }
    }

    pub fn sanity_check(&self) -> Result<(), IngestError> {
        let tool = self.env.downloader.locate()?;
        self.env.staging.check_root()?;
        info!(tool = %tool.display(), staging = %self.env.staging.root(), "sanity checks passed");
        Ok(())
    }

    pub fn run(&self) -> Result<(), IngestError> {
        self.sanity_check()?;
        let mut backoff = Backoff::new(self.options.backoff_initial, self.options.backoff_cap);
        loop {
            shutdown::check(&self.cancel)?;
            let delay = match self.run_session() {
                Ok(ClaimOutcome::Completed { analysis_id, report }) => {
                    info!(
                        %analysis_id,
                        uploaded = report.uploaded.len(),
                        live = report.live.len(),
                        invalid = report.invalid.len(),
                        "analysis processed"
                    );
                    backoff.reset();
                    if self.options.single_iteration() {
                        return Ok(());
                    }
                    continue;
                }
                Ok(ClaimOutcome::NoWork) => {
                    if self.options.single_iteration() {
                        info!(source = %self.options.source, "no work available");
                        return Ok(());
                    }
                    let delay = backoff.advance();
                    info!(source = %self.options.source, backoff_ms = delay.as_millis() as u64, "no work available");
                    delay
                }
                Err(IngestError::Interrupted) => return Err(IngestError::Interrupted),
                Err(err) => {
                    if self.options.single_iteration() {
                        return Err(err);
                    }
                    let delay = backoff.advance();
                    error!(kind = err.kind(), error = %err, backoff_ms = delay.as_millis() as u64, "claim aborted");
                    delay
                }
            };
            if !shutdown::sleep(&self.cancel, delay) {
                return Err(IngestError::Interrupted);
            }
        }
    }

    pub fn run_session(&self) -> Result<ClaimOutcome, IngestError> {
        let session = self.env.coordinator.open_session(
            SessionBehavior::Delete,
            self.options.session_ttl,
            self.options.lock_delay,
        )?;
        let heartbeat = match Heartbeat::spawn(
            self.env.coordinator.clone(),
            session.clone(),
            self.options.heartbeat_interval,
        ) {
            Ok(heartbeat) => heartbeat,
            Err(err) => {
                self.destroy_session(&session);
                return Err(err);
            }
        };

        let result = self.claim_and_process(&heartbeat);

        heartbeat.stop(self.options.heartbeat_deadline);
        self.destroy_session(&session);
        result
    }

    fn destroy_session(&self, session: &SessionId) {
        if let Err(err) = self.env.coordinator.destroy(session) {
            warn!(%session, error = %err, "failed to destroy coordination session");
        }
    }

    fn claim_and_process(&self, heartbeat: &Heartbeat) -> Result<ClaimOutcome, IngestError> {
        let session = heartbeat.session();
        let started_at = Utc::now().timestamp();
        let Some(mut files) = self.claim(session, started_at)? else {
            return Ok(ClaimOutcome::NoWork);
        };
        let Some(analysis_id) = files.first().map(|file| file.analysis_id.clone()) else {
            return Ok(ClaimOutcome::NoWork);
        };

        let result = self.process(&analysis_id, &mut files, heartbeat, started_at);
        if let Err(err) = &result {
            self.record_error(&files, err);
        }

        self.env.staging.cleanup(&analysis_id);
        clear_lock(self.env.coordinator.as_ref(), &analysis_id.lease_key(), session);
        result.map(|report| ClaimOutcome::Completed {
            analysis_id,
            report,
        })
    }

    fn claim(
        &self,
        session: &SessionId,
        started_at: i64,
    ) -> Result<Option<Vec<FileRecord>>, IngestError> {
        let mut request = match &self.options.analysis_id {
            Some(analysis_id) => {
                ClaimRequest::targeted(self.options.source.clone(), analysis_id.clone())
            }
            None => ClaimRequest::new(self.options.source.clone()),
        };
        let payload = self.lease(started_at, LeasePhase::Claimed).to_payload();

        for _ in 0..CLAIM_ROUNDS {
            shutdown::check(&self.cancel)?;
            let mut acquire = |analysis_id: &AnalysisId| {
                self.env
                    .coordinator
                    .try_lock(&analysis_id.lease_key(), session, &payload)
            };
            match self.env.metadata.claim_analysis(&request, &mut acquire) {
                Ok(files) => return Ok(Some(files)),
                Err(IngestError::NoWork(_)) => return Ok(None),
                Err(err) if request.analysis_id.is_none() && err.is_retryable_claim() => {
                    let Some(analysis_id) = err.contested_analysis().cloned() else {
                        return Err(err);
                    };
                    info!(%analysis_id, kind = err.kind(), "skipping analysis");
                    request.exclude.push(analysis_id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn lease(&self, started_at: i64, state: LeasePhase) -> ClaimLease {
        ClaimLease {
            host: self.options.host.clone(),
            started: started_at,
            state,
        }
    }

    fn publish(
        &self,
        analysis_id: &AnalysisId,
        heartbeat: &Heartbeat,
        started_at: i64,
        phase: LeasePhase,
    ) -> Result<(), IngestError> {
        heartbeat.check()?;
        shutdown::check(&self.cancel)?;
        let payload = self.lease(started_at, phase).to_payload();
        let held = self.env.coordinator.try_lock(
            &analysis_id.lease_key(),
            heartbeat.session(),
            &payload,
        )?;
        if !held {
            return Err(IngestError::SessionLost(heartbeat.session().to_string()));
        }
        Ok(())
    }

    fn process(
        &self,
        analysis_id: &AnalysisId,
        files: &mut [FileRecord],
        heartbeat: &Heartbeat,
        started_at: i64,
    ) -> Result<AnalysisReport, IngestError> {
        let started = Instant::now();
        let bucket = self
            .env
            .buckets
            .get(self.options.source.as_str())
            .ok_or_else(|| {
                IngestError::MissingConfigKey(format!("s3/buckets/{}", self.options.source))
            })?;
        let mut report = AnalysisReport::default();

        if files.iter().any(|file| file.state == FileState::Submitted) {
            self.publish(analysis_id, heartbeat, started_at, LeasePhase::Downloading)?;
            self.env
                .staging
                .download(&self.env.downloader, analysis_id, files)?;

            self.publish(analysis_id, heartbeat, started_at, LeasePhase::Uploading)?;
            for file in files.iter_mut() {
                if file.state != FileState::Submitted {
                    info!(node_id = %file.node_id, file = %file.file_name, state = %file.state, "upload skipped");
                    continue;
                }
                heartbeat.check()?;
                shutdown::check(&self.cancel)?;
                self.upload_file(file, bucket)?;
                report.uploaded.push(file.file_name.clone());
            }
        }

        self.publish(analysis_id, heartbeat, started_at, LeasePhase::Validating)?;
        let store = self.env.objects.connect()?;
        for file in files.iter_mut() {
            if file.state != FileState::Uploaded {
                continue;
            }
            heartbeat.check()?;
            shutdown::check(&self.cancel)?;
            let outcome = scoped_transition(
                self.env.metadata.as_ref(),
                file,
                FileState::Validating,
                FileState::Live,
                invalid_on_checksum,
                |file| {
                    verify_remote(
                        store.as_ref(),
                        bucket,
                        &file.object_key(),
                        &file.md5sum,
                        file.file_size,
                    )
                },
            )?;
            match outcome {
                Transition::Completed(_) => report.live.push(file.file_name.clone()),
                Transition::Diverted { error, .. } => {
                    self.annotate(file, &[last_error(&error)]);
                    report.invalid.push(file.file_name.clone());
                }
            }
        }

        let took = started.elapsed().as_secs();
        let completed = Utc::now().timestamp();
        for file in files.iter().filter(|file| report.live.contains(&file.file_name)) {
            self.env.metadata.annotate(
                file.node_id,
                &[
                    Annotation::ImportCompleted(completed),
                    Annotation::ImportTook(took),
                ],
            )?;
        }
        Ok(report)
    }

    fn upload_file(&self, file: &mut FileRecord, bucket: &str) -> Result<(), IngestError> {
        let path = self.env.staging.file_path(file);
        let url = s3_url(self.env.objects.host(), bucket, file);
        scoped_transition(
            self.env.metadata.as_ref(),
            file,
            FileState::Uploading,
            FileState::Uploaded,
            revert_all,
            |file| {
                let summary = self
                    .uploader
                    .upload(path.as_std_path(), bucket, &file.object_key())?;
                register_url(&self.env.identifiers, file.node_id, &url)?;
                Ok(summary)
            },
        )?;
        Ok(())
    }

    fn record_error(&self, files: &[FileRecord], err: &IngestError) {
        let annotation = last_error(err);
        for file in files {
            self.annotate(file, std::slice::from_ref(&annotation));
        }
    }

    fn annotate(&self, file: &FileRecord, annotations: &[Annotation]) {
        if let Err(err) = self.env.metadata.annotate(file.node_id, annotations) {
            warn!(node_id = %file.node_id, error = %err, "failed to annotate file");
        }
    }
}

pub fn last_error(err: &IngestError) -> Annotation {
    Annotation::LastError(format!("{}: {err}", err.kind()))
}
