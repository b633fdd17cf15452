use crate::domain::jobs::Job;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("job repository backend error: {0}")]
    Backend(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStateRepository: Send + Sync {
    /// Save a job snapshot, replacing the previous one
    async fn save_job(&self, job: &Job) -> Result<(), RepositoryError>;

    /// Get the latest snapshot of a job
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, RepositoryError>;
}
