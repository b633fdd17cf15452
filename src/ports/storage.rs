use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::time::Duration;

/// A streamed object body.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Wrap an in-memory buffer as a single-chunk stream.
pub fn once(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlOperation {
    Get,
    Put,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Backend-specific location, e.g. `s3://bucket/key`
    pub location: String,
    /// Bytes written
    pub size: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Open an object for streaming reads
    async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream, StorageError>;

    /// Stream `body` into an object, replacing any previous content.
    /// The object only becomes visible once the whole body was written.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
    ) -> Result<StoredObject, StorageError>;

    /// Delete an object
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether an object is visible
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;

    /// URL the external tools can fetch (or write) directly
    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        operation: UrlOperation,
        ttl: Duration,
    ) -> Result<String, StorageError>;
}
