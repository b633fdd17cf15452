//! Transcode Job Binary
//!
//! Runs one segmented transcode job and prints its outcome as JSON on stdout.
//! Intended to be started by an external scheduler, one process per source.
//!
//! Environment Variables:
//! - JOB_BUCKET: bucket holding the source
//! - JOB_KEY: key of the source inside the bucket
//! - JOB_SEGMENT_SIZE: segment length in seconds (defaults to ET_SEGMENT_SIZE)
//! - ET_STORAGE: `fs` (default) or `s3`
//! - ET_STORAGE_ROOT: directory holding the buckets when ET_STORAGE=fs
//! - RUST_LOG: log filter, e.g. `elastic_transcode=debug`

use elastic_transcode::adapters::local::{FsStorage, MemoryJobRepository};
use elastic_transcode::adapters::process::ProcessRunner;
use elastic_transcode::config::{PipelineConfig, StorageBackend};
use elastic_transcode::ports::storage::StoragePort;
use elastic_transcode::{JobInput, OrchestratorService};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn run_job<S>(storage: Arc<S>, config: &PipelineConfig, input: JobInput) -> ExitCode
where
    S: StoragePort + 'static,
{
    let tools = ProcessRunner::from_config(&config.tools);
    let orchestrator = OrchestratorService::new(
        storage,
        Arc::new(tools),
        MemoryJobRepository::new(),
        config,
    );

    let (json, code) = match orchestrator.run(input).await {
        Ok(output) => (serde_json::to_string(&output), ExitCode::SUCCESS),
        Err(failure) => (serde_json::to_string(&failure), ExitCode::FAILURE),
    };
    match json {
        Ok(json) => println!("{json}"),
        Err(err) => error!(error = %err, "failed to serialize job outcome"),
    }
    code
}

fn job_input(config: &PipelineConfig) -> Result<JobInput, String> {
    let bucket = std::env::var("JOB_BUCKET").map_err(|_| "JOB_BUCKET env var required")?;
    let key = std::env::var("JOB_KEY").map_err(|_| "JOB_KEY env var required")?;
    let segment_size_seconds = match std::env::var("JOB_SEGMENT_SIZE") {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| format!("JOB_SEGMENT_SIZE {raw:?}: {err}"))?,
        Err(_) => config.segment_size,
    };
    Ok(JobInput {
        bucket,
        key,
        segment_size_seconds,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let input = match job_input(&config) {
        Ok(input) => input,
        Err(err) => {
            error!(error = %err, "invalid job input");
            return ExitCode::FAILURE;
        }
    };
    let backend = match StorageBackend::from_env() {
        Ok(backend) => backend,
        Err(err) => {
            error!(error = %err, "invalid storage configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(bucket = %input.bucket, key = %input.key, ?backend, concurrency = config.concurrency, "starting job");
    match backend {
        StorageBackend::Fs(root) => run_job(Arc::new(FsStorage::new(root)), &config, input).await,
        #[cfg(feature = "aws")]
        StorageBackend::S3 => {
            let storage = Arc::new(elastic_transcode::adapters::aws::S3Storage::from_env().await);
            let code = run_job(storage.clone(), &config, input).await;
            storage.settle().await;
            code
        }
        #[cfg(not(feature = "aws"))]
        StorageBackend::S3 => {
            error!("ET_STORAGE=s3 requires the `aws` feature");
            ExitCode::FAILURE
        }
    }
}
