use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::RecvTimeoutError;
use memmap2::MmapOptions;
use nix::unistd::{SysconfVar, sysconf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MIN_BLOCK_SIZE, MultipartSettings};
use crate::error::IngestError;
use crate::object_store::{MultipartUpload, ObjectStore, ObjectStoreConnector};

pub const PROPAGATION_DELAY: Duration = Duration::from_secs(5);
pub const PART_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const PART_ATTEMPTS: usize = 30;
pub const PART_RETRY_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploaderOptions {
    pub processes: usize,
    pub block_size: u64,
    pub part_timeout: Duration,
    pub part_attempts: usize,
    pub retry_sleep: Duration,
    // Lets every gateway node learn about a freshly initiated upload.
    pub propagation_delay: Duration,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self::from_settings(&MultipartSettings::default())
    }
}

impl UploaderOptions {
    pub fn from_settings(settings: &MultipartSettings) -> Self {
        Self {
            processes: settings.processes.max(1),
            block_size: settings.block_size.max(MIN_BLOCK_SIZE),
            part_timeout: PART_TIMEOUT,
            part_attempts: PART_ATTEMPTS,
            retry_sleep: PART_RETRY_SLEEP,
            propagation_delay: PROPAGATION_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartJob {
    pub part_number: i32,
    pub offset: u64,
    pub length: u64,
}

pub fn plan_parts(file_size: u64, block_size: u64) -> Vec<PartJob> {
    if file_size == 0 {
        return vec![PartJob {
            part_number: 1,
            offset: 0,
            length: 0,
        }];
    }
    let count = file_size.div_ceil(block_size);
    (0..count)
        .map(|index| {
            let offset = index * block_size;
            PartJob {
                part_number: (index + 1) as i32,
                offset,
                length: block_size.min(file_size - offset),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Mapped,
    Buffered,
}

pub fn read_strategy(job: &PartJob, page_size: u64) -> ReadStrategy {
    if job.length > 0 && job.length % page_size == 0 && job.offset % page_size == 0 {
        ReadStrategy::Mapped
    } else {
        ReadStrategy::Buffered
    }
}

pub fn page_size() -> u64 {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|size| u64::try_from(size).ok())
        .unwrap_or(4096)
}

pub fn read_part(path: &Path, job: &PartJob) -> Result<Bytes, IngestError> {
    let fs_err = |err: std::io::Error| {
        IngestError::Filesystem(format!(
            "read part {} of {}: {err}",
            job.part_number,
            path.display()
        ))
    };
    let length = usize::try_from(job.length)
        .map_err(|_| IngestError::Filesystem(format!("part {} too large", job.part_number)))?;
    let mut file = File::open(path).map_err(fs_err)?;
    match read_strategy(job, page_size()) {
        ReadStrategy::Mapped => {
            // SAFETY: staged files are not modified while they are uploaded.
            let map = unsafe {
                MmapOptions::new()
                    .offset(job.offset)
                    .len(length)
                    .map(&file)
            }
            .map_err(fs_err)?;
            Ok(Bytes::from_owner(map))
        }
        ReadStrategy::Buffered => {
            file.seek(SeekFrom::Start(job.offset)).map_err(fs_err)?;
            let mut buffer = vec![0u8; length];
            file.read_exact(&mut buffer).map_err(fs_err)?;
            Ok(Bytes::from(buffer))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub upload_id: String,
    pub parts: usize,
    pub bytes: u64,
}

pub struct MultipartUploader {
    connector: Arc<dyn ObjectStoreConnector>,
    options: UploaderOptions,
    cancel: CancellationToken,
}

impl MultipartUploader {
    pub fn new(
        connector: Arc<dyn ObjectStoreConnector>,
        options: UploaderOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            options,
            cancel,
        }
    }

    pub fn upload(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
    ) -> Result<UploadSummary, IngestError> {
        let size = fs::metadata(path)
            .map_err(|err| IngestError::Filesystem(format!("stat {}: {err}", path.display())))?
            .len();
        let store = self.connector.connect()?;
        let upload = store.initiate_multipart(bucket, key)?;
        info!(
            bucket,
            key,
            upload_id = %upload.upload_id,
            bytes = size,
            "multipart upload started"
        );
        thread::sleep(self.options.propagation_delay);

        let jobs = plan_parts(size, self.options.block_size);
        let started = Instant::now();
        let finished = self
            .run_jobs(path, &upload, &jobs)
            .and_then(|()| finish_upload(store.as_ref(), &upload, jobs.len()));
        if let Err(err) = finished {
            abort(store.as_ref(), &upload);
            return Err(err);
        }
        info!(
            key,
            upload_id = %upload.upload_id,
            parts = jobs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "multipart upload completed"
        );
        Ok(UploadSummary {
            upload_id: upload.upload_id,
            parts: jobs.len(),
            bytes: size,
        })
    }

    fn run_jobs(
        &self,
        path: &Path,
        upload: &MultipartUpload,
        jobs: &[PartJob],
    ) -> Result<(), IngestError> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        for job in jobs {
            let _ = job_tx.send(job.clone());
        }
        drop(job_tx);

        let failure: Mutex<Option<IngestError>> = Mutex::new(None);
        let workers = self.options.processes.min(jobs.len()).max(1);
        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let failure = &failure;
                scope.spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        if self.cancel.is_cancelled() || has_failed(failure) {
                            break;
                        }
                        if let Err(err) = self.upload_part_with_retries(path, upload, &job) {
                            if let Ok(mut slot) = failure.lock() {
                                slot.get_or_insert(err);
                            }
                            break;
                        }
                    }
                });
            }
        });

        if let Some(err) = failure.into_inner().ok().flatten() {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(IngestError::Interrupted);
        }
        Ok(())
    }

    fn upload_part_with_retries(
        &self,
        path: &Path,
        upload: &MultipartUpload,
        job: &PartJob,
    ) -> Result<String, IngestError> {
        let mut last_error = None;
        for attempt in 1..=self.options.part_attempts {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Interrupted);
            }
            match self.attempt_part(path, upload, job) {
                Ok(e_tag) => {
                    debug!(part = job.part_number, attempt, "part uploaded");
                    return Ok(e_tag);
                }
                Err(err) => {
                    warn!(part = job.part_number, attempt, error = %err, "part upload failed");
                    last_error = Some(err);
                    thread::sleep(self.options.retry_sleep);
                }
            }
        }
        Err(IngestError::PartUploadFailed {
            part: job.part_number,
            attempts: self.options.part_attempts,
            message: last_error.map(|err| err.to_string()).unwrap_or_default(),
        })
    }

    fn attempt_part(
        &self,
        path: &Path,
        upload: &MultipartUpload,
        job: &PartJob,
    ) -> Result<String, IngestError> {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let connector = self.connector.clone();
        let path: PathBuf = path.to_path_buf();
        let upload = upload.clone();
        let part = job.clone();
        thread::Builder::new()
            .name(format!("part-{}", job.part_number))
            .spawn(move || {
                let result = read_part(&path, &part).and_then(|body| {
                    let store = connector.connect()?;
                    store.upload_part(&upload, part.part_number, body)
                });
                let _ = result_tx.send(result);
            })
            .map_err(|err| IngestError::ObjectStore(err.to_string()))?;

        match result_rx.recv_timeout(self.options.part_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(IngestError::PartUploadTimeout {
                part: job.part_number,
                seconds: self.options.part_timeout.as_secs(),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(IngestError::ObjectStore(format!(
                "part {} worker exited without a result",
                job.part_number
            ))),
        }
    }
}

fn has_failed(failure: &Mutex<Option<IngestError>>) -> bool {
    failure.lock().map(|slot| slot.is_some()).unwrap_or(true)
}

pub fn finish_upload(
    store: &dyn ObjectStore,
    upload: &MultipartUpload,
    expected: usize,
) -> Result<(), IngestError> {
    let parts = store.list_parts(upload)?;
    if parts.len() != expected {
        return Err(IngestError::PartCountMismatch {
            upload_id: upload.upload_id.clone(),
            expected,
            found: parts.len(),
        });
    }
    store.complete_multipart(upload, &parts)
}

pub fn abort(store: &dyn ObjectStore, upload: &MultipartUpload) {
    match store.cancel_multipart(upload) {
        Ok(()) => info!(key = %upload.key, upload_id = %upload.upload_id, "multipart upload cancelled"),
        Err(err) => warn!(
            key = %upload.key,
            upload_id = %upload.upload_id,
            error = %err,
            "failed to cancel multipart upload"
        ),
    }
}
