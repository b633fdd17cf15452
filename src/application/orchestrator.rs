use crate::application::assembler::Assembler;
use crate::application::cleanup::Cleanup;
use crate::application::dispatcher::Dispatcher;
use crate::application::prober::Prober;
use crate::application::worker::TranscodeWorker;
use crate::config::PipelineConfig;
use crate::domain::av::segments::segments;
use crate::domain::jobs::{Job, JobInput, JobOutput, JobState};
use crate::error::{JobError, JobFailure};
use crate::ports::repository::JobStateRepository;
use crate::ports::storage::StoragePort;
use crate::ports::tools::ToolRunner;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

/// Drives one job through probe, segment, transcode, assemble and cleanup.
pub struct OrchestratorService<S, T, R> {
    prober: Prober<S, T>,
    dispatcher: Dispatcher<TranscodeWorker<S, T>>,
    assembler: Assembler<S, T>,
    cleanup: Cleanup<S>,
    repo: R,
    deadline: Duration,
}

impl<S, T, R> OrchestratorService<S, T, R>
where
    S: StoragePort + 'static,
    T: ToolRunner + 'static,
    R: JobStateRepository,
{
    pub fn new(storage: Arc<S>, tools: Arc<T>, repo: R, config: &PipelineConfig) -> Self {
        let worker = TranscodeWorker::new(storage.clone(), tools.clone(), config.transcode.clone());
        Self {
            prober: Prober::new(storage.clone(), tools.clone()),
            dispatcher: Dispatcher::from_config(Arc::new(worker), config),
            assembler: Assembler::from_config(storage.clone(), tools, config),
            cleanup: Cleanup::new(storage),
            repo,
            deadline: config.job_deadline,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub async fn run(&self, input: JobInput) -> Result<JobOutput, JobFailure> {
        input
            .validate()
            .map_err(|err| JobFailure::new(None, JobState::Created, err.into()))?;

        let mut job = Job::new(&input);
        let span = tracing::info_span!("job", job_id = %job.id, key = %input.key);
        self.execute(&mut job).instrument(span).await
    }

    async fn execute(&self, job: &mut Job) -> Result<JobOutput, JobFailure> {
        info!(bucket = %job.source.bucket, segment_size = job.segment_size, "job created");
        self.persist(job).await;

        let cancel = CancellationToken::new();
        let outcome = tokio::select! {
            biased;
            outcome = self.run_stages(job, &cancel) => outcome,
            _ = tokio::time::sleep(self.deadline) => Err(JobError::Timeout(self.deadline)),
        };
        // Whatever is still running belongs to an abandoned attempt.
        cancel.cancel();

        let final_key = match outcome {
            Ok(final_key) => final_key,
            Err(err) => return Err(self.fail(job, err).await),
        };
        if let Err(err) = job.advance(JobState::CleaningUp) {
            return Err(self.fail(job, err.into()).await);
        }
        let cleanup = self
            .cleanup
            .run(&job.source.bucket, &job.intermediate_artifacts())
            .await;
        if let Err(err) = job.advance(JobState::Done) {
            return Err(self.fail(job, err.into()).await);
        }
        self.persist(job).await;

        info!(final_key = %final_key, segments = job.segments.len(), "job done");
        Ok(JobOutput {
            job_id: job.id,
            final_artifact_location: final_key,
            segment_count: job.segments.len(),
            cleanup,
        })
    }

    async fn run_stages(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
    ) -> Result<String, JobError> {
        job.advance(JobState::Probing)?;
        let probed = self.prober.probe(&job.source, cancel).await?;
        // Segmenting cannot fail once entered, so the plan is made while probing.
        let planned = segments(probed.asset.duration, job.segment_size)?;
        job.asset = Some(probed.asset.clone());

        job.advance(JobState::Segmenting)?;
        job.segments = planned;
        info!(segments = job.segments.len(), "segmented");

        job.advance(JobState::Transcoding)?;
        job.results = self
            .dispatcher
            .dispatch(&probed.asset, &job.segments, cancel)
            .await?;

        job.advance(JobState::Assembling)?;
        let final_key = self
            .assembler
            .assemble(&probed.asset, &job.results, cancel)
            .await?;
        job.final_artifact_location = Some(final_key.clone());
        Ok(final_key)
    }

    /// Move the job to `Failed` and describe where it broke.
    async fn fail(&self, job: &mut Job, err: JobError) -> JobFailure {
        let stage = job.state();
        if let Err(transition) = job.advance(JobState::Failed) {
            warn!(error = %transition, "job failed outside of a failable stage");
        }
        let failure = JobFailure::new(Some(job.id), stage, err);
        error!(
            stage = %failure.stage,
            segment = ?failure.segment_index,
            error = %failure.message,
            "job failed"
        );
        self.persist(job).await;
        failure
    }

    async fn persist(&self, job: &Job) {
        if let Err(err) = self.repo.save_job(job).await {
            warn!(state = %job.state(), error = %err, "failed to persist job state");
        }
    }
}
