mod support;

use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio_util::sync::CancellationToken;

use bam_ingest::checksum::{md5_local, md5_remote};
use bam_ingest::error::IngestError;
use bam_ingest::multipart::MultipartUploader;
use bam_ingest::object_store::ObjectStore;

use support::{BUCKET, MemoryConnector, MemoryObjects, fast_uploader};

fn staged_file(dir: &tempfile::TempDir, content: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join("sample.bam");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn remote_digest_matches_local_after_multipart_upload() {
    let dir = tempfile::tempdir().unwrap();
    let content = (0..10_000u32).map(|n| (n % 251) as u8).collect::<Vec<_>>();
    let path = staged_file(&dir, &content);
    let objects = MemoryObjects::with_bucket(BUCKET);
    let uploader = MultipartUploader::new(
        MemoryConnector::new(objects.clone()),
        fast_uploader(4096),
        CancellationToken::new(),
    );

    let summary = uploader.upload(&path, BUCKET, "aid/sample.bam").unwrap();

    assert_eq!(summary.parts, 3);
    assert_eq!(summary.bytes, 10_000);
    let local = md5_local(&path).unwrap();
    let remote = md5_remote(objects.as_ref() as &dyn ObjectStore, BUCKET, "aid/sample.bam").unwrap();
    assert_eq!(local, remote);
}

#[test]
fn empty_file_is_uploaded_as_one_part() {
    let dir = tempfile::tempdir().unwrap();
    let path = staged_file(&dir, b"");
    let objects = MemoryObjects::with_bucket(BUCKET);
    let uploader = MultipartUploader::new(
        MemoryConnector::new(objects.clone()),
        fast_uploader(8),
        CancellationToken::new(),
    );

    let summary = uploader.upload(&path, BUCKET, "aid/empty.bam").unwrap();

    assert_eq!(summary.parts, 1);
    assert_eq!(objects.completed_parts("aid/empty.bam"), Some(1));
    assert_eq!(objects.object(BUCKET, "aid/empty.bam").unwrap(), Vec::<u8>::new());
}

#[test]
fn part_exhausting_attempts_aborts_upload() {
    let dir = tempfile::tempdir().unwrap();
    let path = staged_file(&dir, b"0123456789abcdef");
    let objects = MemoryObjects::with_bucket(BUCKET);
    let mut options = fast_uploader(8);
    options.part_attempts = 3;
    objects.fail_part(1, 10);
    let uploader = MultipartUploader::new(
        MemoryConnector::new(objects.clone()),
        options,
        CancellationToken::new(),
    );

    let err = uploader.upload(&path, BUCKET, "aid/sample.bam").unwrap_err();

    assert_matches!(err, IngestError::PartUploadFailed { part: 1, attempts: 3, .. });
    assert_eq!(objects.part_attempts(1), 3);
    assert_eq!(objects.cancelled(), vec!["aid/sample.bam".to_string()]);
    assert_eq!(objects.object(BUCKET, "aid/sample.bam"), None);
}

#[test]
fn cancelled_upload_is_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let path = staged_file(&dir, b"0123456789abcdef");
    let objects = MemoryObjects::with_bucket(BUCKET);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut options = fast_uploader(8);
    options.retry_sleep = Duration::ZERO;
    let uploader = MultipartUploader::new(MemoryConnector::new(objects.clone()), options, cancel);

    let err = uploader.upload(&path, BUCKET, "aid/sample.bam").unwrap_err();

    assert_matches!(err, IngestError::Interrupted);
    assert_eq!(objects.cancelled(), vec!["aid/sample.bam".to_string()]);
}
