use crate::config::{FailurePolicy, PipelineConfig};
use crate::domain::av::encoding::FRAGMENTED_MP4_FLAGS;
use crate::domain::av::segments::final_artifact_key;
use crate::domain::jobs::{MediaAsset, SegmentResult};
use crate::error::{AssemblyError, ToolError};
use crate::ports::storage::{once, StoragePort, UrlOperation};
use crate::ports::tools::{Tool, ToolInvocation, ToolRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Concatenates segment artifacts, in index order, without re-encoding.
pub struct Assembler<S: ?Sized, T: ?Sized> {
    storage: Arc<S>,
    tools: Arc<T>,
    failure_policy: FailurePolicy,
    poll_attempts: u32,
    poll_interval: Duration,
    url_ttl: Duration,
}

impl<S, T> Assembler<S, T>
where
    S: StoragePort + ?Sized,
    T: ToolRunner + ?Sized,
{
    pub fn new(storage: Arc<S>, tools: Arc<T>, failure_policy: FailurePolicy) -> Self {
        Self {
            storage,
            tools,
            failure_policy,
            poll_attempts: 1,
            poll_interval: Duration::ZERO,
            url_ttl: Duration::from_secs(900),
        }
    }

    pub fn from_config(storage: Arc<S>, tools: Arc<T>, config: &PipelineConfig) -> Self {
        Self::new(storage, tools, config.failure_policy)
            .with_polling(config.artifact_poll_attempts, config.artifact_poll_interval)
            .with_url_ttl(config.signed_url_ttl)
    }

    /// Look an artifact up `attempts` times, `interval` apart, before giving up.
    pub fn with_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.poll_attempts = attempts.max(1);
        self.poll_interval = interval;
        self
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    /// Results that go into the output, checked for order and completeness.
    pub fn plan<'a>(
        &self,
        results: &'a [SegmentResult],
    ) -> Result<Vec<&'a SegmentResult>, AssemblyError> {
        let planned = match self.failure_policy {
            FailurePolicy::FailFast => {
                for (expected, result) in results.iter().enumerate() {
                    let found = result.segment.index;
                    if found < expected {
                        return Err(AssemblyError::OutOfOrder(found));
                    }
                    if found > expected {
                        return Err(AssemblyError::Gap { expected, found });
                    }
                    if !result.is_success() {
                        return Err(AssemblyError::SegmentFailed(found));
                    }
                }
                results.iter().collect::<Vec<_>>()
            }
            FailurePolicy::BestEffort => {
                let planned: Vec<_> = results.iter().filter(|result| result.is_success()).collect();
                if let Some(pair) = planned
                    .windows(2)
                    .find(|pair| pair[1].segment.index <= pair[0].segment.index)
                {
                    return Err(AssemblyError::OutOfOrder(pair[1].segment.index));
                }
                planned
            }
        };
        if planned.is_empty() {
            return Err(AssemblyError::NoSegments);
        }
        Ok(planned)
    }

    /// ffmpeg arguments reading a concat listing from stdin.
    pub fn invocation() -> ToolInvocation {
        ToolInvocation::new(Tool::Ffmpeg)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "concat", "-safe", "0"])
            .args(["-protocol_whitelist", "file,http,https,tcp,tls,crypto,pipe"])
            .args(["-i", "pipe:0", "-c", "copy"])
            .args(["-movflags", FRAGMENTED_MP4_FLAGS, "-f", "mp4", "pipe:1"])
    }

    async fn await_artifact(&self, bucket: &str, index: usize, key: &str) -> Result<(), AssemblyError> {
        for attempt in 1..=self.poll_attempts {
            if self.storage.exists(bucket, key).await? {
                return Ok(());
            }
            debug!(segment = index, key, attempt, "artifact not visible yet");
            if attempt < self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Err(AssemblyError::ArtifactUnavailable {
            index,
            key: key.to_string(),
        })
    }

    /// Concatenate the artifacts into the final output and return its key.
    pub async fn assemble(
        &self,
        asset: &MediaAsset,
        results: &[SegmentResult],
        cancel: &CancellationToken,
    ) -> Result<String, AssemblyError> {
        let planned = self.plan(results)?;
        let bucket = asset.bucket();

        let mut listing = String::new();
        for result in &planned {
            self.await_artifact(bucket, result.segment.index, &result.artifact_location)
                .await?;
            let url = self
                .storage
                .signed_url(bucket, &result.artifact_location, UrlOperation::Get, self.url_ttl)
                .await?;
            listing.push_str(&concat_entry(&url));
        }

        let final_key = final_artifact_key(asset.key());
        let (output, report) = self
            .tools
            .run(Self::invocation(), Some(once(listing)), cancel.child_token())?
            .checked_output();

        // Nothing reaches `final_key` unless the concat exited cleanly with
        // output; a failed run leaves any earlier object there as it was.
        let object = match self.storage.put(bucket, &final_key, output).await {
            Ok(object) => object,
            Err(err) => {
                let err = match report.take() {
                    Some(ToolError::NoOutput { .. }) => AssemblyError::EmptyOutput(final_key),
                    Some(tool) => AssemblyError::Tool(tool),
                    None => AssemblyError::Storage(err),
                };
                warn!(error = %err, "assembly failed");
                return Err(err);
            }
        };
        debug!(key = %final_key, size = object.size, "final artifact uploaded");

        if !self.storage.exists(bucket, &final_key).await? {
            return Err(AssemblyError::FinalArtifactMissing(final_key));
        }
        info!(key = %final_key, segments = planned.len(), "assembled final artifact");
        Ok(final_key)
    }
}

/// One concat demuxer line; single quotes are closed, escaped and reopened.
fn concat_entry(url: &str) -> String {
    format!("file '{}'\n", url.replace('\'', r"'\''"))
}
