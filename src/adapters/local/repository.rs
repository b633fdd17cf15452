use crate::domain::jobs::Job;
use crate::ports::repository::{JobStateRepository, RepositoryError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Keeps the latest snapshot of every job in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobRepository {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStateRepository for MemoryJobRepository {
    async fn save_job(&self, job: &Job) -> Result<(), RepositoryError> {
        self.jobs
            .lock()
            .map_err(|err| RepositoryError::Backend(err.to_string()))?
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, RepositoryError> {
        Ok(self
            .jobs
            .lock()
            .map_err(|err| RepositoryError::Backend(err.to_string()))?
            .get(&id)
            .cloned())
    }
}
