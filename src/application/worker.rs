use crate::domain::av::encoding::TranscodeOptions;
use crate::domain::av::segments::segment_artifact_key;
use crate::domain::jobs::{MediaAsset, Segment};
use crate::error::{TranscodeCause, TranscodeError};
use crate::ports::storage::StoragePort;
use crate::ports::tools::{Tool, ToolInvocation, ToolRunner};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Transcodes one segment into an independent artifact and returns its key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SegmentTranscoder: Send + Sync {
    async fn transcode(
        &self,
        asset: &MediaAsset,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Result<String, TranscodeError>;
}

pub struct TranscodeWorker<S: ?Sized, T: ?Sized> {
    storage: Arc<S>,
    tools: Arc<T>,
    options: TranscodeOptions,
}

impl<S, T> TranscodeWorker<S, T>
where
    S: StoragePort + ?Sized,
    T: ToolRunner + ?Sized,
{
    pub fn new(storage: Arc<S>, tools: Arc<T>, options: TranscodeOptions) -> Self {
        Self {
            storage,
            tools,
            options,
        }
    }

    /// ffmpeg arguments cutting `segment` out of the piped source.
    pub fn invocation(&self, asset: &MediaAsset, segment: &Segment) -> ToolInvocation {
        ToolInvocation::new(Tool::Ffmpeg)
            .args(["-hide_banner", "-loglevel", "error"])
            .arg("-f")
            .arg(&asset.container_format)
            .args(["-i", "pipe:0"])
            .arg("-ss")
            .arg(segment.start.to_string())
            .arg("-t")
            .arg(segment.duration().to_string())
            .args(self.options.output_args())
            .arg("pipe:1")
    }
}

#[async_trait]
impl<S, T> SegmentTranscoder for TranscodeWorker<S, T>
where
    S: StoragePort + ?Sized,
    T: ToolRunner + ?Sized,
{
    async fn transcode(
        &self,
        asset: &MediaAsset,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Result<String, TranscodeError> {
        let key = segment_artifact_key(segment, asset.key());
        let fail = |cause: TranscodeCause| TranscodeError::new(*segment, cause);

        if cancel.is_cancelled() {
            return Err(fail(TranscodeCause::Cancelled));
        }
        let source = self
            .storage
            .get(asset.bucket(), asset.key())
            .await
            .map_err(|err| fail(err.into()))?;
        let (output, report) = self
            .tools
            .run(
                self.invocation(asset, segment),
                Some(source),
                cancel.child_token(),
            )
            .map_err(|err| fail(err.into()))?
            .checked_output();

        // The upload only commits once ffmpeg exited cleanly, so a failed
        // attempt leaves whatever was at `key` before untouched.
        match self.storage.put(asset.bucket(), &key, output).await {
            Ok(object) => {
                debug!(segment = segment.index, key = %key, size = object.size, "segment stored");
                Ok(key)
            }
            Err(err) => {
                let cause = match report.take() {
                    Some(tool) => TranscodeCause::from(tool),
                    None => TranscodeCause::from(err),
                };
                warn!(segment = segment.index, error = %cause, "segment transcode failed");
                Err(fail(cause))
            }
        }
    }
}
