use crate::domain::jobs::{CleanupReport, FailedDeletion};
use crate::error::CleanupError;
use crate::ports::storage::StoragePort;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

/// Best-effort removal of intermediate artifacts. Never fails a job.
pub struct Cleanup<S: ?Sized> {
    storage: Arc<S>,
}

impl<S> Cleanup<S>
where
    S: StoragePort + ?Sized,
{
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub async fn run(&self, bucket: &str, keys: &[String]) -> CleanupReport {
        let deletions = keys.iter().cloned().map(|key| async move {
            match self.storage.delete(bucket, &key).await {
                Ok(()) => Ok(key),
                Err(source) => Err(CleanupError { key, source }),
            }
        });

        let mut report = CleanupReport::default();
        for outcome in join_all(deletions).await {
            match outcome {
                Ok(key) => report.deleted.push(key),
                Err(err) => {
                    warn!(key = %err.key, error = %err, "cleanup failed");
                    report.failed.push(FailedDeletion {
                        message: err.to_string(),
                        key: err.key,
                    });
                }
            }
        }
        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "cleanup finished"
        );
        report
    }
}
