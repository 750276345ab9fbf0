#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use md5::{Digest, Md5};
use uuid::Uuid;

use bam_ingest::consul::{Coordinator, SessionBehavior, SessionId};
use bam_ingest::domain::{
    AnalysisId, Annotation, Annotations, BackupState, FileRecord, FileState, Md5Hex, SourceTag,
};
use bam_ingest::download::BulkDownloader;
use bam_ingest::error::IngestError;
use bam_ingest::metadata::{AcquireLock, ClaimRequest, MetadataStore, verify_claim};
use bam_ingest::multipart::UploaderOptions;
use bam_ingest::object_store::{
    MultipartUpload, ObjectInfo, ObjectStore, ObjectStoreConnector, PartInfo,
};
use bam_ingest::signpost::{IdentifierClient, IdentifierRecord};

pub const SOURCE: &str = "tcga_cghub";
pub const BUCKET: &str = "tcga_cghub_protected";
pub const HOST: &str = "s3.test";

pub fn md5_hex(content: &[u8]) -> String {
    format!("{:x}", Md5::digest(content))
}

pub fn record(analysis_id: &str, file_name: &str, content: &[u8], state: FileState) -> FileRecord {
    FileRecord {
        node_id: Uuid::new_v4(),
        file_name: file_name.to_string(),
        file_size: content.len() as u64,
        md5sum: md5_hex(content),
        state,
        source: SourceTag::new(SOURCE),
        analysis_id: analysis_id.parse().unwrap(),
        acl: vec!["phs000178".to_string()],
        annotations: Annotations::default(),
    }
}

pub fn fast_uploader(block_size: u64) -> UploaderOptions {
    UploaderOptions {
        processes: 3,
        block_size,
        part_timeout: Duration::from_secs(10),
        part_attempts: 30,
        retry_sleep: Duration::from_millis(1),
        propagation_delay: Duration::ZERO,
    }
}

/// Metadata store over an in-memory row set.
#[derive(Default)]
pub struct MemoryMetadata {
    files: Mutex<BTreeMap<Uuid, FileRecord>>,
    history: Mutex<Vec<(Uuid, FileState)>>,
}

impl MemoryMetadata {
    pub fn new(files: Vec<FileRecord>) -> Self {
        Self {
            files: Mutex::new(files.into_iter().map(|file| (file.node_id, file)).collect()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn file(&self, node_id: Uuid) -> FileRecord {
        self.files.lock().unwrap()[&node_id].clone()
    }

    pub fn state(&self, node_id: Uuid) -> FileState {
        self.file(node_id).state
    }

    /// Every state written for `node_id`, in order.
    pub fn history(&self, node_id: Uuid) -> Vec<FileState> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == node_id)
            .map(|(_, state)| *state)
            .collect()
    }

    fn write_state(&self, files: &mut BTreeMap<Uuid, FileRecord>, node_id: Uuid, state: FileState) {
        if let Some(file) = files.get_mut(&node_id) {
            file.state = state;
            self.history.lock().unwrap().push((node_id, state));
        }
    }
}

impl MetadataStore for MemoryMetadata {
    fn claim_analysis(
        &self,
        request: &ClaimRequest,
        acquire: &mut AcquireLock<'_>,
    ) -> Result<Vec<FileRecord>, IngestError> {
        let mut files = self.files.lock().unwrap();
        let analysis_id = match &request.analysis_id {
            Some(analysis_id) => analysis_id.clone(),
            None => files
                .values()
                .filter(|file| !file.state.is_terminal())
                .filter(|file| file.source == request.source && !file.is_sidecar())
                .filter(|file| !request.exclude.contains(&file.analysis_id))
                .map(|file| file.analysis_id.clone())
                .min()
                .ok_or_else(|| IngestError::NoWork(request.source.to_string()))?,
        };
        let mut rows = files
            .values()
            .filter(|file| file.analysis_id == analysis_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.file_name.cmp(&b.file_name));

        let recoveries = verify_claim(request, &analysis_id, &rows)?;
        if !acquire(&analysis_id)? {
            return Err(IngestError::ClaimRaceLost(analysis_id));
        }
        for (node_id, state) in recoveries {
            self.write_state(&mut files, node_id, state);
            if let Some(row) = rows.iter_mut().find(|row| row.node_id == node_id) {
                row.state = state;
            }
        }
        Ok(rows)
    }

    fn set_state(&self, node_id: Uuid, state: FileState) -> Result<(), IngestError> {
        let mut files = self.files.lock().unwrap();
        if !files.contains_key(&node_id) {
            return Err(IngestError::Metadata(format!("file {node_id} not found")));
        }
        self.write_state(&mut files, node_id, state);
        Ok(())
    }

    fn annotate(&self, node_id: Uuid, annotations: &[Annotation]) -> Result<(), IngestError> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(&node_id)
            .ok_or_else(|| IngestError::Metadata(format!("file {node_id} not found")))?;
        file.annotations.merge(annotations);
        Ok(())
    }

    fn get_file(&self, node_id: Uuid) -> Result<Option<FileRecord>, IngestError> {
        Ok(self.files.lock().unwrap().get(&node_id).cloned())
    }

    fn backup_candidates(
        &self,
        source: &SourceTag,
        drivers: &[String],
        limit: usize,
    ) -> Result<Vec<FileRecord>, IngestError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .values()
            .filter(|file| file.state == FileState::Live && &file.source == source)
            .filter(|file| {
                drivers
                    .iter()
                    .any(|driver| file.annotations.backup_status(driver) != Some(BackupState::Backuped))
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Coordination service with sessions and advisory locks held in memory.
#[derive(Default)]
pub struct MemoryCoordinator {
    next_session: AtomicUsize,
    sessions: Mutex<BTreeSet<String>>,
    destroyed: Mutex<Vec<String>>,
    locks: Mutex<BTreeMap<String, String>>,
    payloads: Mutex<Vec<(String, String)>>,
    kv: Mutex<BTreeMap<String, String>>,
    failing_renewals: AtomicBool,
}

impl MemoryCoordinator {
    /// Marks `key` as held by a session of another worker.
    pub fn hold(&self, key: &str, session: &str) {
        self.locks
            .lock()
            .unwrap()
            .insert(key.to_string(), session.to_string());
    }

    pub fn holder(&self, key: &str) -> Option<String> {
        self.locks.lock().unwrap().get(key).cloned()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn destroyed_sessions(&self) -> usize {
        self.destroyed.lock().unwrap().len()
    }

    /// Makes every later renewal fail as if the session had expired.
    pub fn fail_renewals(&self) {
        self.failing_renewals.store(true, Ordering::SeqCst);
    }

    /// Lease payloads written under `key`, in order.
    pub fn payloads(&self, key: &str) -> Vec<String> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .filter(|(written, _)| written == key)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl Coordinator for MemoryCoordinator {
    fn open_session(
        &self,
        _behavior: SessionBehavior,
        _ttl: Duration,
        _lock_delay: Duration,
    ) -> Result<SessionId, IngestError> {
        let id = format!("session-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().unwrap().insert(id.clone());
        Ok(SessionId::new(id))
    }

    fn renew(&self, session: &SessionId) -> Result<(), IngestError> {
        if self.failing_renewals.load(Ordering::SeqCst) {
            return Err(IngestError::SessionLost(session.to_string()));
        }
        if self.sessions.lock().unwrap().contains(session.as_str()) {
            Ok(())
        } else {
            Err(IngestError::SessionLost(session.to_string()))
        }
    }

    fn try_lock(&self, key: &str, session: &SessionId, payload: &str) -> Result<bool, IngestError> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(key) {
            Some(holder) if holder != session.as_str() => Ok(false),
            _ => {
                locks.insert(key.to_string(), session.to_string());
                self.kv
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), payload.to_string());
                self.payloads
                    .lock()
                    .unwrap()
                    .push((key.to_string(), payload.to_string()));
                Ok(true)
            }
        }
    }

    fn release(&self, key: &str, session: &SessionId) -> Result<(), IngestError> {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(key).map(String::as_str) == Some(session.as_str()) {
            locks.remove(key);
        }
        Ok(())
    }

    fn delete_held(&self, key: &str, session: &SessionId) -> Result<bool, IngestError> {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(key).map(String::as_str) != Some(session.as_str()) {
            return Ok(false);
        }
        locks.remove(key);
        self.kv.lock().unwrap().remove(key);
        Ok(true)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), IngestError> {
        self.kv
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, IngestError> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, IngestError> {
        Ok(self
            .kv
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .map(|relative| (relative.to_string(), value.clone()))
            })
            .collect())
    }

    fn destroy(&self, session: &SessionId) -> Result<(), IngestError> {
        self.sessions.lock().unwrap().remove(session.as_str());
        let mut locks = self.locks.lock().unwrap();
        let mut kv = self.kv.lock().unwrap();
        locks.retain(|key, holder| {
            let held = holder.as_str() == session.as_str();
            if held {
                kv.remove(key);
            }
            !held
        });
        self.destroyed.lock().unwrap().push(session.to_string());
        Ok(())
    }
}

/// Identifier service; clones share state.
#[derive(Clone, Default)]
pub struct MemoryIdentifiers {
    records: Arc<Mutex<BTreeMap<Uuid, Vec<String>>>>,
    failures: Arc<AtomicUsize>,
}

impl MemoryIdentifiers {
    pub fn urls(&self, node_id: Uuid) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn register(&self, node_id: Uuid, url: &str) {
        self.records
            .lock()
            .unwrap()
            .entry(node_id)
            .or_default()
            .push(url.to_string());
    }

    /// Makes the next `count` patches fail with a server error.
    pub fn fail_patches(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl IdentifierClient for MemoryIdentifiers {
    fn get(&self, node_id: Uuid) -> Result<IdentifierRecord, IngestError> {
        Ok(IdentifierRecord {
            did: Some(node_id.to_string()),
            urls: self.urls(node_id),
            rev: Some("rev-1".to_string()),
        })
    }

    fn patch(&self, node_id: Uuid, _rev: Option<&str>, urls: &[String]) -> Result<(), IngestError> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(IngestError::IdentifierServiceStatus {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        self.records.lock().unwrap().insert(node_id, urls.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

#[derive(Default)]
struct ObjectsState {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), Vec<u8>>,
    uploads: BTreeMap<String, PendingUpload>,
    next_upload: usize,
    initiated: Vec<String>,
    completed: BTreeMap<String, usize>,
    cancelled: Vec<String>,
    part_failures: BTreeMap<i32, usize>,
    part_attempts: BTreeMap<i32, usize>,
    part_stalls: BTreeMap<i32, (usize, Duration)>,
    truncated_reads: usize,
    hidden_parts: usize,
}

/// S3-compatible store with fault injection.
#[derive(Default)]
pub struct MemoryObjects {
    state: Mutex<ObjectsState>,
}

impl MemoryObjects {
    pub fn with_bucket(bucket: &str) -> Arc<Self> {
        let objects = Self::default();
        objects
            .state
            .lock()
            .unwrap()
            .buckets
            .insert(bucket.to_string());
        Arc::new(objects)
    }

    pub fn insert(&self, bucket: &str, key: &str, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((bucket.to_string(), key.to_string()), content.to_vec());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys a multipart upload was started for, in order.
    pub fn initiated(&self) -> Vec<String> {
        self.state.lock().unwrap().initiated.clone()
    }

    /// Part count of the completed multipart upload of `key`.
    pub fn completed_parts(&self, key: &str) -> Option<usize> {
        self.state.lock().unwrap().completed.get(key).copied()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn part_attempts(&self, part_number: i32) -> usize {
        self.state
            .lock()
            .unwrap()
            .part_attempts
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    /// Makes the next `times` uploads of `part_number` fail.
    pub fn fail_part(&self, part_number: i32, times: usize) {
        self.state
            .lock()
            .unwrap()
            .part_failures
            .insert(part_number, times);
    }

    /// Makes the next `times` uploads of `part_number` hang for `delay`
    /// before answering.
    pub fn stall_part(&self, part_number: i32, times: usize, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .part_stalls
            .insert(part_number, (times, delay));
    }

    /// Makes the next `count` reads stop halfway through the object.
    pub fn truncate_reads(&self, count: usize) {
        self.state.lock().unwrap().truncated_reads = count;
    }

    /// Makes part listings omit `count` parts.
    pub fn hide_parts(&self, count: usize) {
        self.state.lock().unwrap().hidden_parts = count;
    }
}

fn e_tag(content: &[u8]) -> String {
    format!("\"{}\"", md5_hex(content))
}

impl ObjectStore for MemoryObjects {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, IngestError> {
        Ok(self.state.lock().unwrap().buckets.contains(bucket))
    }

    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, IngestError> {
        Ok(self.object(bucket, key).map(|content| ObjectInfo {
            size: content.len() as u64,
            e_tag: Some(e_tag(&content)),
        }))
    }

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>, IngestError> {
        let mut state = self.state.lock().unwrap();
        let mut content = state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| IngestError::ObjectStore(format!("NoSuchKey: {key}")))?;
        if state.truncated_reads > 0 {
            state.truncated_reads -= 1;
            content.truncate(content.len() / 2);
        }
        Ok(Box::new(Cursor::new(content)))
    }

    fn initiate_multipart(&self, bucket: &str, key: &str) -> Result<MultipartUpload, IngestError> {
        let mut state = self.state.lock().unwrap();
        if !state.buckets.contains(bucket) {
            return Err(IngestError::ObjectStore(format!("NoSuchBucket: {bucket}")));
        }
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        state.initiated.push(key.to_string());
        Ok(MultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
        })
    }

    fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, IngestError> {
        let stall = {
            let mut state = self.state.lock().unwrap();
            *state.part_attempts.entry(part_number).or_default() += 1;
            match state.part_stalls.get_mut(&part_number) {
                Some((remaining, delay)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*delay)
                }
                _ => None,
            }
        };
        if let Some(delay) = stall {
            thread::sleep(delay);
        }
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.part_failures.get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IngestError::ObjectStore("500 Internal Server Error".to_string()));
            }
        }
        let pending = state
            .uploads
            .get_mut(&upload.upload_id)
            .ok_or_else(|| IngestError::ObjectStore("NoSuchUpload".to_string()))?;
        let tag = e_tag(&body);
        pending.parts.insert(part_number, body.to_vec());
        Ok(tag)
    }

    fn list_parts(&self, upload: &MultipartUpload) -> Result<Vec<PartInfo>, IngestError> {
        let state = self.state.lock().unwrap();
        let pending = state
            .uploads
            .get(&upload.upload_id)
            .ok_or_else(|| IngestError::ObjectStore("NoSuchUpload".to_string()))?;
        let visible = pending.parts.len().saturating_sub(state.hidden_parts);
        Ok(pending
            .parts
            .iter()
            .take(visible)
            .map(|(number, content)| PartInfo {
                part_number: *number,
                e_tag: e_tag(content),
                size: content.len() as u64,
            })
            .collect())
    }

    fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[PartInfo],
    ) -> Result<(), IngestError> {
        let mut state = self.state.lock().unwrap();
        let pending = state
            .uploads
            .remove(&upload.upload_id)
            .ok_or_else(|| IngestError::ObjectStore("NoSuchUpload".to_string()))?;
        let mut content = Vec::new();
        for part in parts {
            let body = pending
                .parts
                .get(&part.part_number)
                .ok_or_else(|| IngestError::ObjectStore("InvalidPart".to_string()))?;
            content.extend_from_slice(body);
        }
        state.completed.insert(pending.key.clone(), parts.len());
        state.objects.insert((pending.bucket, pending.key), content);
        Ok(())
    }

    fn cancel_multipart(&self, upload: &MultipartUpload) -> Result<(), IngestError> {
        let mut state = self.state.lock().unwrap();
        state.uploads.remove(&upload.upload_id);
        state.cancelled.push(upload.key.clone());
        Ok(())
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: Option<&Md5Hex>,
    ) -> Result<(), IngestError> {
        if let Some(expected) = content_md5 {
            if expected.as_str() != md5_hex(&body) {
                return Err(IngestError::ObjectStore("BadDigest".to_string()));
            }
        }
        let mut state = self.state.lock().unwrap();
        if !state.buckets.contains(bucket) {
            return Err(IngestError::ObjectStore(format!("NoSuchBucket: {bucket}")));
        }
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), body.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), IngestError> {
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

pub struct MemoryConnector {
    pub objects: Arc<MemoryObjects>,
    pub connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(objects: Arc<MemoryObjects>) -> Arc<Self> {
        Arc::new(Self {
            objects,
            connects: AtomicUsize::new(0),
        })
    }
}

impl ObjectStoreConnector for MemoryConnector {
    fn connect(&self) -> Result<Arc<dyn ObjectStore>, IngestError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.clone())
    }

    fn host(&self) -> &str {
        HOST
    }
}

/// Bulk downloader that writes the given contents into the staging tree.
#[derive(Clone, Default)]
pub struct FakeDownloader {
    contents: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    omitted: Arc<Mutex<BTreeSet<String>>>,
    calls: Arc<AtomicUsize>,
    hook: Arc<Mutex<Option<Box<dyn Fn() + Send>>>>,
}

impl FakeDownloader {
    pub fn serve(&self, file_name: &str, content: &[u8]) {
        self.contents
            .lock()
            .unwrap()
            .insert(file_name.to_string(), content.to_vec());
    }

    pub fn omit(&self, file_name: &str) {
        self.omitted.lock().unwrap().insert(file_name.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Runs `hook` at the end of every download.
    pub fn on_download(&self, hook: impl Fn() + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl BulkDownloader for FakeDownloader {
    fn download(&self, analysis_id: &AnalysisId, staging_root: &Utf8Path) -> Result<(), IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let dir = staging_root.join(analysis_id.as_str());
        fs::create_dir_all(&dir).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let omitted = self.omitted.lock().unwrap();
        for (name, content) in self.contents.lock().unwrap().iter() {
            if omitted.contains(name) {
                continue;
            }
            fs::write(dir.join(name), content).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook();
        }
        Ok(())
    }

    fn locate(&self) -> Result<PathBuf, IngestError> {
        Ok(PathBuf::from("/usr/local/bin/gtdownload"))
    }
}

pub fn utf8_root(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}
