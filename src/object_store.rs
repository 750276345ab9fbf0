use std::io::{self, Read};
use std::sync::Arc;

use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::config::S3Settings;
use crate::domain::Md5Hex;
use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: i32,
    pub e_tag: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub e_tag: Option<String>,
}

pub trait ObjectStore: Send + Sync {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, IngestError>;
    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, IngestError>;
    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>, IngestError>;
    fn initiate_multipart(&self, bucket: &str, key: &str)
    -> Result<MultipartUpload, IngestError>;
    fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, IngestError>;
    fn list_parts(&self, upload: &MultipartUpload) -> Result<Vec<PartInfo>, IngestError>;
    fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[PartInfo],
    ) -> Result<(), IngestError>;
    fn cancel_multipart(&self, upload: &MultipartUpload) -> Result<(), IngestError>;
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: Option<&Md5Hex>,
    ) -> Result<(), IngestError>;
    fn delete(&self, bucket: &str, key: &str) -> Result<(), IngestError>;
}

// Every job opens its own connection, so a broken one fails only that job.
pub trait ObjectStoreConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn ObjectStore>, IngestError>;
    fn host(&self) -> &str;
}

fn s3_error(op: &str, err: impl std::error::Error) -> IngestError {
    IngestError::ObjectStore(format!("{op}: {}", DisplayErrorContext(&err)))
}

pub struct S3Connector {
    settings: S3Settings,
    runtime: Arc<Runtime>,
}

impl S3Connector {
    pub fn with_runtime(settings: S3Settings, runtime: Arc<Runtime>) -> Self {
        Self { settings, runtime }
    }
}

impl ObjectStoreConnector for S3Connector {
    fn connect(&self) -> Result<Arc<dyn ObjectStore>, IngestError> {
        Ok(Arc::new(S3ObjectStore::new(
            &self.settings,
            self.runtime.clone(),
        )))
    }

    fn host(&self) -> &str {
        &self.settings.host
    }
}

pub struct S3ObjectStore {
    client: Client,
    runtime: Arc<Runtime>,
}

impl S3ObjectStore {
    pub fn new(settings: &S3Settings, runtime: Arc<Runtime>) -> Self {
        let credentials = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "bam-ingest",
        );
        // Non-AWS gateways only understand path-style addressing.
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(settings.endpoint_url())
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            runtime,
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, IngestError> {
        let result = self
            .runtime
            .block_on(self.client.head_bucket().bucket(bucket).send());
        match result {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(s3_error("HeadBucket", err)),
        }
    }

    fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, IngestError> {
        let result = self
            .runtime
            .block_on(self.client.head_object().bucket(bucket).key(key).send());
        match result {
            Ok(output) => Ok(Some(ObjectInfo {
                size: output
                    .content_length()
                    .and_then(|len| u64::try_from(len).ok())
                    .unwrap_or(0),
                e_tag: output.e_tag().map(str::to_string),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(s3_error("HeadObject", err)),
        }
    }

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>, IngestError> {
        let output = self
            .runtime
            .block_on(self.client.get_object().bucket(bucket).key(key).send())
            .map_err(|err| s3_error("GetObject", err))?;
        Ok(Box::new(BodyReader {
            runtime: self.runtime.clone(),
            body: output.body,
            pending: Bytes::new(),
        }))
    }

    fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<MultipartUpload, IngestError> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .create_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .send(),
            )
            .map_err(|err| s3_error("CreateMultipartUpload", err))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| IngestError::ObjectStore("response missing upload_id".to_string()))?;
        debug!(bucket, key, upload_id, "initiated multipart upload");
        Ok(MultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }

    fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, IngestError> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .upload_part()
                    .bucket(&upload.bucket)
                    .key(&upload.key)
                    .upload_id(&upload.upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(body))
                    .send(),
            )
            .map_err(|err| s3_error("UploadPart", err))?;
        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| IngestError::ObjectStore(format!("part {part_number} missing e_tag")))
    }

    fn list_parts(&self, upload: &MultipartUpload) -> Result<Vec<PartInfo>, IngestError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .runtime
                .block_on(
                    self.client
                        .list_parts()
                        .bucket(&upload.bucket)
                        .key(&upload.key)
                        .upload_id(&upload.upload_id)
                        .set_part_number_marker(marker.clone())
                        .send(),
                )
                .map_err(|err| s3_error("ListParts", err))?;
            for part in output.parts() {
                parts.push(PartInfo {
                    part_number: part.part_number().unwrap_or_default(),
                    e_tag: part.e_tag().unwrap_or_default().to_string(),
                    size: part
                        .size()
                        .and_then(|size| u64::try_from(size).ok())
                        .unwrap_or(0),
                });
            }
            match (output.is_truncated(), output.next_part_number_marker()) {
                (Some(true), Some(next)) => marker = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(parts)
    }

    fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[PartInfo],
    ) -> Result<(), IngestError> {
        let mut completed = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(&part.e_tag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect::<Vec<_>>();
        completed.sort_by_key(|part| part.part_number());
        self.runtime
            .block_on(
                self.client
                    .complete_multipart_upload()
                    .bucket(&upload.bucket)
                    .key(&upload.key)
                    .upload_id(&upload.upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(completed))
                            .build(),
                    )
                    .send(),
            )
            .map_err(|err| s3_error("CompleteMultipartUpload", err))?;
        Ok(())
    }

    fn cancel_multipart(&self, upload: &MultipartUpload) -> Result<(), IngestError> {
        self.runtime
            .block_on(
                self.client
                    .abort_multipart_upload()
                    .bucket(&upload.bucket)
                    .key(&upload.key)
                    .upload_id(&upload.upload_id)
                    .send(),
            )
            .map_err(|err| s3_error("AbortMultipartUpload", err))?;
        Ok(())
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: Option<&Md5Hex>,
    ) -> Result<(), IngestError> {
        let content_md5 = content_md5.map(|md5| STANDARD.encode(md5.to_bytes()));
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .set_content_md5(content_md5)
                    .body(ByteStream::from(body))
                    .send(),
            )
            .map_err(|err| s3_error("PutObject", err))?;
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), IngestError> {
        self.runtime
            .block_on(self.client.delete_object().bucket(bucket).key(key).send())
            .map_err(|err| s3_error("DeleteObject", err))?;
        Ok(())
    }
}

struct BodyReader {
    runtime: Arc<Runtime>,
    body: ByteStream,
    pending: Bytes,
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.runtime.block_on(self.body.try_next()) {
                Ok(Some(chunk)) => self.pending = chunk,
                Ok(None) => return Ok(0),
                Err(err) => return Err(io::Error::other(err)),
            }
        }
        let len = buf.len().min(self.pending.len());
        buf[..len].copy_from_slice(&self.pending.split_to(len));
        Ok(len)
    }
}
