use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checksum::verify_remote;
use crate::config::DEFAULT_BLOCK_SIZE;
use crate::consul::{
    Coordinator, DEFAULT_LOCK_DELAY, DEFAULT_SESSION_TTL, HEARTBEAT_INTERVAL,
    HEARTBEAT_JOIN_DEADLINE, Heartbeat, SessionBehavior, SessionId, clear_lock,
};
use crate::domain::{
    Annotation, BackupState, ClaimLease, FileRecord, FileState, LeasePhase, Md5Hex,
    SourceTag,
};
use crate::error::IngestError;
use crate::metadata::MetadataStore;
use crate::multipart::{abort, finish_upload};
use crate::object_store::{MultipartUpload, ObjectStore, ObjectStoreConnector};
use crate::shutdown;
use crate::supervisor::{BACKOFF_CAP, BACKOFF_INITIAL, Backoff};

pub const BACKUP_BATCH: usize = 50;

#[derive(Clone)]
pub struct BackupDriver {
    pub name: String,
    pub connector: Arc<dyn ObjectStoreConnector>,
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub source: SourceTag,
    pub processes: usize,
    pub host: String,
    pub once: bool,
    pub batch: usize,
    pub block_size: u64,
    pub session_ttl: Duration,
    pub lock_delay: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_deadline: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
}

impl BackupOptions {
    pub fn new(source: SourceTag, host: impl Into<String>) -> Self {
        Self {
            source,
            processes: 1,
            host: host.into(),
            once: false,
            batch: BACKUP_BATCH,
            block_size: DEFAULT_BLOCK_SIZE,
            session_ttl: DEFAULT_SESSION_TTL,
            lock_delay: DEFAULT_LOCK_DELAY,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_deadline: HEARTBEAT_JOIN_DEADLINE,
            backoff_initial: BACKOFF_INITIAL,
            backoff_cap: BACKOFF_CAP,
        }
    }
}

pub struct BackupEnvironment<M, C> {
    pub metadata: Arc<M>,
    pub coordinator: Arc<C>,
    pub source: Arc<dyn ObjectStoreConnector>,
    pub buckets: BTreeMap<String, String>,
    pub drivers: Vec<BackupDriver>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupRound {
    pub backuped: usize,
    pub failed: usize,
    pub contended: usize,
}

impl BackupRound {
    // Failed copies come straight back as candidates, so only completed
    // copies count as progress.
    fn is_idle(&self) -> bool {
        self.backuped == 0
    }
}

pub struct BackupWorker<M, C> {
    env: BackupEnvironment<M, C>,
    options: BackupOptions,
    cancel: CancellationToken,
}

impl<M, C> BackupWorker<M, C>
where
    M: MetadataStore,
    C: Coordinator + 'static,
{
    pub fn new(env: BackupEnvironment<M, C>, options: BackupOptions, cancel: CancellationToken) -> Self {
        Self {
            env,
            options,
            cancel,
        }
    }

    fn driver_names(&self) -> Vec<String> {
        self.env
            .drivers
            .iter()
            .map(|driver| driver.name.clone())
            .collect()
    }

    pub fn run(&self) -> Result<(), IngestError> {
        let workers = self.options.processes.max(1);
        info!(workers, drivers = ?self.driver_names(), "backup worker starting");
        let results = thread::scope(|scope| {
            let handles = (0..workers)
                .map(|index| scope.spawn(move || self.run_loop(index)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(IngestError::Metadata("backup thread panicked".to_string())))
                })
                .collect::<Vec<_>>()
        });
        results.into_iter().collect()
    }

    fn run_loop(&self, index: usize) -> Result<(), IngestError> {
        let mut backoff = Backoff::new(self.options.backoff_initial, self.options.backoff_cap);
        loop {
            shutdown::check(&self.cancel)?;
            let delay = match self.run_session() {
                Ok(round) if !round.is_idle() => {
                    info!(worker = index, backuped = round.backuped, failed = round.failed, "backup round finished");
                    backoff.reset();
                    if self.options.once {
                        return Ok(());
                    }
                    continue;
                }
                Ok(round) => {
                    if self.options.once {
                        return Ok(());
                    }
                    let delay = backoff.advance();
                    debug!(
                        worker = index,
                        failed = round.failed,
                        backoff_ms = delay.as_millis() as u64,
                        "nothing backed up"
                    );
                    delay
                }
                Err(IngestError::Interrupted) => return Err(IngestError::Interrupted),
                Err(err) => {
                    if self.options.once {
                        return Err(err);
                    }
                    let delay = backoff.advance();
                    error!(worker = index, kind = err.kind(), error = %err, "backup round aborted");
                    delay
                }
            };
            if !shutdown::sleep(&self.cancel, delay) {
                return Err(IngestError::Interrupted);
            }
        }
    }

    pub fn run_session(&self) -> Result<BackupRound, IngestError> {
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

        let result = self.process_batch(&heartbeat);

        heartbeat.stop(self.options.heartbeat_deadline);
        self.destroy_session(&session);
        result
    }

    fn destroy_session(&self, session: &SessionId) {
        if let Err(err) = self.env.coordinator.destroy(session) {
            warn!(%session, error = %err, "failed to destroy coordination session");
        }
    }

    fn process_batch(&self, heartbeat: &Heartbeat) -> Result<BackupRound, IngestError> {
        let mut candidates = self
            .env
            .metadata
            .backup_candidates(&self.options.source, &self.driver_names(), self.options.batch)?;
        candidates.shuffle(&mut rand::thread_rng());

        let session = heartbeat.session();
        let payload = ClaimLease {
            host: self.options.host.clone(),
            started: Utc::now().timestamp(),
            state: LeasePhase::Backup,
        }
        .to_payload();

        let mut round = BackupRound::default();
        for candidate in candidates {
            heartbeat.check()?;
            shutdown::check(&self.cancel)?;
            let lease_key = candidate.backup_lease_key();
            if !self.env.coordinator.try_lock(&lease_key, session, &payload)? {
                debug!(node_id = %candidate.node_id, "backup held by another worker");
                round.contended += 1;
                continue;
            }
            let result = self.backup_record(&candidate, &mut round);
            clear_lock(self.env.coordinator.as_ref(), &lease_key, session);
            result?;
        }
        Ok(round)
    }

    fn backup_record(&self, candidate: &FileRecord, round: &mut BackupRound) -> Result<(), IngestError> {
        // Another worker may have finished this file since the candidate query.
        let Some(file) = self.env.metadata.get_file(candidate.node_id)? else {
            return Ok(());
        };
        if file.state != FileState::Live {
            return Ok(());
        }
        for driver in &self.env.drivers {
            if file.annotations.backup_status(&driver.name) == Some(BackupState::Backuped) {
                continue;
            }
            let status = match self.backup_file(&file, driver) {
                Ok(()) => {
                    info!(node_id = %file.node_id, driver = %driver.name, "file backed up");
                    round.backuped += 1;
                    BackupState::Backuped
                }
                Err(IngestError::Interrupted) => return Err(IngestError::Interrupted),
                Err(err) => {
                    warn!(node_id = %file.node_id, driver = %driver.name, error = %err, "backup failed");
                    round.failed += 1;
                    BackupState::Failed
                }
            };
            self.env.metadata.annotate(
                file.node_id,
                &[Annotation::BackupStatus {
                    driver: driver.name.clone(),
                    status,
                }],
            )?;
        }
        Ok(())
    }

    pub fn backup_file(&self, file: &FileRecord, driver: &BackupDriver) -> Result<(), IngestError> {
        let bucket = self
            .env
            .buckets
            .get(file.source.as_str())
            .ok_or_else(|| IngestError::MissingConfigKey(format!("s3/buckets/{}", file.source)))?;
        let key = file.object_key();
        let source = self.env.source.connect()?;
        let destination = driver.connector.connect()?;

        let Some(info) = source.head(bucket, &key)? else {
            return Err(IngestError::ObjectStore(format!("source object {key} does not exist")));
        };
        if info.size != file.file_size {
            return Err(IngestError::InvalidChecksum {
                key,
                message: format!("source is {} bytes, expected {}", info.size, file.file_size),
            });
        }
        if !destination.bucket_exists(bucket)? {
            return Err(IngestError::ObjectStore(format!(
                "bucket {bucket} does not exist on {}",
                driver.name
            )));
        }

        let reader = source.open(bucket, &key)?;
        copy_stream(
            reader,
            destination.as_ref(),
            bucket,
            &key,
            file,
            self.options.block_size,
            &self.cancel,
        )?;

        if let Err(err) = verify_remote(destination.as_ref(), bucket, &key, &file.md5sum, file.file_size) {
            if let Err(delete_err) = destination.delete(bucket, &key) {
                warn!(key, error = %delete_err, "failed to delete unverified copy");
            }
            return Err(err);
        }
        Ok(())
    }
}

fn read_block<R: Read + ?Sized>(reader: &mut R, limit: u64) -> Result<Vec<u8>, IngestError> {
    let mut block = Vec::new();
    reader
        .take(limit)
        .read_to_end(&mut block)
        .map_err(|err| IngestError::ObjectStore(format!("read source: {err}")))?;
    Ok(block)
}

pub fn copy_stream(
    mut reader: Box<dyn Read + Send>,
    destination: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    file: &FileRecord,
    block_size: u64,
    cancel: &CancellationToken,
) -> Result<(), IngestError> {
    if file.file_size <= block_size {
        let body = read_block(&mut reader, block_size)?;
        let content_md5 = file.md5sum.parse::<Md5Hex>().ok();
        return destination.put_object(bucket, key, Bytes::from(body), content_md5.as_ref());
    }

    let upload = destination.initiate_multipart(bucket, key)?;
    let copied = upload_blocks(&mut reader, destination, &upload, block_size, cancel)
        .and_then(|parts| finish_upload(destination, &upload, parts).map(|()| parts));
    match copied {
        Ok(parts) => {
            debug!(key, parts, "streamed multipart copy");
            Ok(())
        }
        Err(err) => {
            abort(destination, &upload);
            Err(err)
        }
    }
}

fn upload_blocks(
    reader: &mut Box<dyn Read + Send>,
    destination: &dyn ObjectStore,
    upload: &MultipartUpload,
    block_size: u64,
    cancel: &CancellationToken,
) -> Result<usize, IngestError> {
    let mut parts = 0usize;
    loop {
        shutdown::check(cancel)?;
        let block = read_block(reader, block_size)?;
        if block.is_empty() {
            return Ok(parts);
        }
        parts += 1;
        let part_number = i32::try_from(parts)
            .map_err(|_| IngestError::ObjectStore(format!("too many parts for {}", upload.key)))?;
        destination.upload_part(upload, part_number, Bytes::from(block))?;
    }
}
