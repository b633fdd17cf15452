use crate::error::StorageError;
use crate::ports::storage::{ByteStream, StoragePort, StoredObject, UrlOperation};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Smallest part S3 accepts, except for the last one.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// S3Storage implements StoragePort for AWS S3 (or any S3-compatible API).
#[derive(Clone, Debug)]
pub struct S3Storage {
    client: Client,
    part_size: usize,
    aborts: TaskTracker,
}

fn backend<E: std::error::Error>(err: E) -> StorageError {
    StorageError::Backend(DisplayErrorContext(err).to_string())
}

async fn abort_upload(client: &Client, bucket: &str, key: &str, upload_id: &str) {
    match client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await
    {
        Ok(_) => debug!(bucket, key, "aborted multipart upload"),
        Err(err) => {
            warn!(bucket, key, error = %DisplayErrorContext(err), "failed to abort multipart upload")
        }
    }
}

/// A started multipart upload, aborted when dropped before [`disarm`].
///
/// A `put` future dropped mid-upload (job deadline, fail-fast) never reaches
/// its error path, so the abort also runs from `Drop`.
///
/// [`disarm`]: PendingUpload::disarm
struct PendingUpload {
    abort: Option<Box<dyn FnOnce() + Send>>,
}

impl PendingUpload {
    fn new(abort: impl FnOnce() + Send + 'static) -> Self {
        Self {
            abort: Some(Box::new(abort)),
        }
    }

    fn disarm(mut self) {
        self.abort = None;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort();
        }
    }
}

impl S3Storage {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            part_size: DEFAULT_PART_SIZE,
            aborts: TaskTracker::new(),
        }
    }

    /// Client configured from the standard AWS environment.
    pub async fn from_env() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::new(Client::new(&config))
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(MIN_PART_SIZE);
        self
    }

    /// Wait for the aborts of uploads that were dropped mid-flight.
    ///
    /// Call before the runtime shuts down, which would cancel them.
    pub async fn settle(&self) {
        self.aborts.close();
        self.aborts.wait().await;
    }

    fn abort_on_drop(&self, bucket: &str, key: &str, upload_id: &str) -> PendingUpload {
        let client = self.client.clone();
        let aborts = self.aborts.clone();
        let (bucket, key, upload_id) = (bucket.to_string(), key.to_string(), upload_id.to_string());
        PendingUpload::new(move || match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                aborts.spawn_on(
                    async move { abort_upload(&client, &bucket, &key, &upload_id).await },
                    &runtime,
                );
            }
            Err(_) => warn!(%bucket, %key, %upload_id, "no runtime left to abort multipart upload"),
        })
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first: Bytes,
        mut body: ByteStream,
    ) -> Result<u64, StorageError> {
        let mut parts = Vec::new();
        let mut size = 0u64;
        let mut buf = BytesMut::from(&first[..]);
        let mut finished = false;

        while !finished {
            while buf.len() < self.part_size {
                match body.next().await {
                    Some(chunk) => buf.extend_from_slice(&chunk?),
                    None => {
                        finished = true;
                        break;
                    }
                }
            }
            if buf.is_empty() {
                break;
            }
            let part = buf.split().freeze();
            let part_number = parts.len() as i32 + 1;
            size += part.len() as u64;
            let uploaded = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(S3Body::from(part))
                .send()
                .await
                .map_err(backend)?;
            debug!(bucket, key, part_number, "uploaded part");
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(backend)?;
        Ok(size)
    }
}

#[async_trait]
impl StoragePort for S3Storage {
    async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(service) if service.is_no_such_key() => StorageError::not_found(bucket, key),
                _ => backend(err),
            })?;
        Ok(Box::pin(ReaderStream::new(response.body.into_async_read())))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
    ) -> Result<StoredObject, StorageError> {
        let location = format!("s3://{bucket}/{key}");

        // Small bodies go up in one request; anything larger is streamed in parts.
        let mut first = BytesMut::new();
        let mut exhausted = false;
        while first.len() < self.part_size {
            match body.next().await {
                Some(chunk) => first.extend_from_slice(&chunk?),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if exhausted {
            let size = first.len() as u64;
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type("video/mp4")
                .body(S3Body::from(first.freeze()))
                .send()
                .await
                .map_err(backend)?;
            return Ok(StoredObject { location, size });
        }

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type("video/mp4")
            .send()
            .await
            .map_err(backend)?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| StorageError::Backend("multipart upload without an id".to_string()))?
            .to_string();

        let pending = self.abort_on_drop(bucket, key, &upload_id);
        let uploaded = self
            .upload_parts(bucket, key, &upload_id, first.freeze(), body)
            .await;
        pending.disarm();
        match uploaded {
            Ok(size) => Ok(StoredObject { location, size }),
            Err(err) => {
                abort_upload(&self.client, bucket, key, &upload_id).await;
                Err(err)
            }
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => match err.as_service_error() {
                Some(service) if service.is_not_found() => Ok(false),
                _ => Err(backend(err)),
            },
        }
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        operation: UrlOperation,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let presign_config = PresigningConfig::expires_in(ttl).map_err(backend)?;
        let presigned = match operation {
            UrlOperation::Get => self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .presigned(presign_config)
                .await
                .map_err(backend)?,
            UrlOperation::Put => self
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .presigned(presign_config)
                .await
                .map_err(backend)?,
        };
        Ok(presigned.uri().to_string())
    }
}
