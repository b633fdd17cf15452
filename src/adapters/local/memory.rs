use crate::error::StorageError;
use crate::ports::storage::{ByteStream, StoragePort, StoredObject, UrlOperation};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Objects = BTreeMap<(String, String), Bytes>;

/// In-process object store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<Objects>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, Objects> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects()
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys of every object in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Resolve a URL produced by [`StoragePort::signed_url`].
    pub fn resolve_url(&self, url: &str) -> Option<Bytes> {
        let (bucket, key) = url.strip_prefix("memory://")?.split_once('/')?;
        self.object(bucket, key)
    }
}

#[async_trait]
impl StoragePort for MemoryStorage {
    async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream, StorageError> {
        let data = self
            .object(bucket, key)
            .ok_or_else(|| StorageError::not_found(bucket, key))?;
        Ok(crate::ports::storage::once(data))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
    ) -> Result<StoredObject, StorageError> {
        let data = body
            .try_fold(BytesMut::new(), |mut buf, chunk| async move {
                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await?
            .freeze();
        let size = data.len() as u64;
        self.insert(bucket, key, data);
        Ok(StoredObject {
            location: format!("memory://{bucket}/{key}"),
            size,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.objects()
            .remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(bucket, key))
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.object(bucket, key).is_some())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        _operation: UrlOperation,
        _ttl: Duration,
    ) -> Result<String, StorageError> {
        Ok(format!("memory://{bucket}/{key}"))
    }
}
