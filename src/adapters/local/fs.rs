use crate::error::StorageError;
use crate::ports::storage::{ByteStream, StoragePort, StoredObject, UrlOperation};
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

/// Buckets are directories below `root`, keys are relative paths inside them.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        if !path_is_valid(Path::new(bucket)) {
            return Err(StorageError::InvalidKey(bucket.to_string()));
        }
        if !path_is_valid(Path::new(key)) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

/// Only plain relative paths: no `..`, no root, no drive prefix.
fn path_is_valid(path: &Path) -> bool {
    let mut components = path.components().peekable();
    components.peek().is_some()
        && components.all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn map_not_found(err: io::Error, bucket: &str, key: &str) -> StorageError {
    if err.kind() == io::ErrorKind::NotFound {
        StorageError::not_found(bucket, key)
    } else {
        StorageError::Io(err)
    }
}

/// Removes a half-written temp file unless the write completed.
struct PartialFile {
    path: Option<PathBuf>,
}

impl PartialFile {
    fn commit(mut self) {
        self.path = None;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait]
impl StoragePort for FsStorage {
    async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream, StorageError> {
        let path = self.path_of(bucket, key)?;
        let file = File::open(&path)
            .await
            .map_err(|err| map_not_found(err, bucket, key))?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
    ) -> Result<StoredObject, StorageError> {
        let path = self.path_of(bucket, key)?;
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(dir).await?;

        let file_name = path
            .file_name()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?
            .to_string_lossy();
        let temp_path = dir.join(format!(".{}.{}.part", file_name, Uuid::new_v4()));
        let guard = PartialFile {
            path: Some(temp_path.clone()),
        };

        let mut body_reader = StreamReader::new(body);
        let mut file = BufWriter::new(File::create(&temp_path).await?);
        let size = tokio::io::copy(&mut body_reader, &mut file).await?;
        file.flush().await?;
        file.into_inner().sync_all().await?;

        tokio::fs::rename(&temp_path, &path).await?;
        guard.commit();

        Ok(StoredObject {
            location: format!("file://{}", path.display()),
            size,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let path = self.path_of(bucket, key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| map_not_found(err, bucket, key))
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.path_of(bucket, key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        _operation: UrlOperation,
        _ttl: Duration,
    ) -> Result<String, StorageError> {
        // Local files need no signature; ffmpeg reads them directly.
        let path = self.path_of(bucket, key)?;
        let path = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::storage::once;
    use bytes::Bytes;
    use futures::{stream, TryStreamExt};
    use std::fs;
    use tempfile::tempdir;

    async fn read_all(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut buf, chunk| async move {
                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let temp_dir = tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path());

        let stored = storage
            .put("media", "clips/a.mov", once("Hello, world!"))
            .await
            .unwrap();
        assert_eq!(stored.size, 13);
        assert!(stored.location.ends_with("media/clips/a.mov"));
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("media/clips/a.mov")).unwrap(),
            "Hello, world!"
        );

        let body = storage.get("media", "clips/a.mov").await.unwrap();
        assert_eq!(read_all(body).await, b"Hello, world!");
        assert!(storage.exists("media", "clips/a.mov").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_replaces_previous_content() {
        let temp_dir = tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path());
        storage.put("b", "k", once("first version")).await.unwrap();
        storage.put("b", "k", once("second")).await.unwrap();
        let body = storage.get("b", "k").await.unwrap();
        assert_eq!(read_all(body).await, b"second");
    }

    #[tokio::test]
    async fn test_failed_put_leaves_nothing_behind() {
        let temp_dir = tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path());
        let body: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"half")),
            Err(io::Error::new(io::ErrorKind::Other, "encoder crashed")),
        ]));

        assert!(storage.put("b", "out.mp4", body).await.is_err());
        assert!(!storage.exists("b", "out.mp4").await.unwrap());
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path().join("b")).unwrap().collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_missing_object() {
        let temp_dir = tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path());
        assert!(matches!(
            storage.get("b", "missing").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            storage.delete("b", "missing").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(!storage.exists("b", "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp_dir = tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path());
        for key in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(
                    storage.put("b", key, once("x")).await,
                    Err(StorageError::InvalidKey(_))
                ),
                "{key:?} should be rejected"
            );
        }
        assert!(matches!(
            storage.exists("..", "k").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path());
        storage.put("b", "0-5-a.mov", once("seg")).await.unwrap();
        storage.delete("b", "0-5-a.mov").await.unwrap();
        assert!(!storage.exists("b", "0-5-a.mov").await.unwrap());
    }

    #[tokio::test]
    async fn test_signed_url_is_absolute_file_url() {
        let temp_dir = tempdir().unwrap();
        let storage = FsStorage::new(temp_dir.path());
        let url = storage
            .signed_url("b", "0-5-a.mov", UrlOperation::Get, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("file:///"), "{url}");
        assert!(url.ends_with("b/0-5-a.mov"));
    }
}
