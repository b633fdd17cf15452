use crate::domain::av::probe::ProbeOutput;
use crate::domain::jobs::{AssetLocation, MediaAsset};
use crate::error::ProbeError;
use crate::ports::storage::StoragePort;
use crate::ports::tools::{Tool, ToolInvocation, ToolRunner};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A probed asset together with everything the probing tool reported.
#[derive(Debug, Clone)]
pub struct ProbedAsset {
    pub asset: MediaAsset,
    pub output: ProbeOutput,
}

pub struct Prober<S: ?Sized, T: ?Sized> {
    storage: Arc<S>,
    tools: Arc<T>,
}

impl<S, T> Prober<S, T>
where
    S: StoragePort + ?Sized,
    T: ToolRunner + ?Sized,
{
    pub fn new(storage: Arc<S>, tools: Arc<T>) -> Self {
        Self { storage, tools }
    }

    pub fn invocation() -> ToolInvocation {
        ToolInvocation::new(Tool::Ffprobe).args([
            "-v",
            "error",
            "-show_streams",
            "-show_format",
            "-print_format",
            "json",
            "pipe:0",
        ])
    }

    /// Stream the source through ffprobe and read its duration and container.
    pub async fn probe(
        &self,
        location: &AssetLocation,
        cancel: &CancellationToken,
    ) -> Result<ProbedAsset, ProbeError> {
        let source = self.storage.get(&location.bucket, &location.key).await?;
        let process = self
            .tools
            .run(Self::invocation(), Some(source), cancel.child_token())?;
        let (stdout, exit) = process.collect().await?;
        if !exit.stderr.is_empty() {
            debug!(key = %location.key, stderr = %exit.stderr, "ffprobe diagnostics");
        }

        let output = ProbeOutput::from_json(&stdout)?;
        let asset = output.to_asset(location.clone())?;
        info!(
            key = %asset.key(),
            duration = asset.duration,
            format = %asset.container_format,
            streams = output.streams.len(),
            "probed source"
        );
        Ok(ProbedAsset { asset, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::av::probe::StreamKind;
    use crate::error::{StorageError, ToolError};
    use crate::ports::storage::{once, MockStoragePort};
    use crate::ports::tools::{MockToolRunner, ToolExit, ToolProcess};
    use futures::FutureExt;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080},
            {"index": 1, "codec_type": "audio", "codec_name": "aac", "sample_rate": "48000", "channels": 2}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "23.280000"}
    }"#;

    fn storage_with_source() -> MockStoragePort {
        let mut storage = MockStoragePort::new();
        storage
            .expect_get()
            .withf(|bucket, key| bucket == "media" && key == "clips/test.mov")
            .times(1)
            .returning(|_, _| Ok(once("not really a movie")));
        storage
    }

    fn tools_printing(stdout: &'static str, exit: Result<(), &'static str>) -> MockToolRunner {
        let mut tools = MockToolRunner::new();
        tools
            .expect_run()
            .withf(|invocation, stdin, _| {
                invocation.tool == Tool::Ffprobe
                    && invocation.args.last().map(String::as_str) == Some("pipe:0")
                    && stdin.is_some()
            })
            .times(1)
            .returning(move |invocation, _, _| {
                let exit = match exit {
                    Ok(()) => Ok(ToolExit::default()),
                    Err(stderr) => Err(ToolError::Failed {
                        tool: invocation.tool,
                        status: "exit status: 1".to_string(),
                        stderr: stderr.to_string(),
                    }),
                };
                Ok(ToolProcess {
                    tool: invocation.tool,
                    stdout: once(stdout),
                    exit: async move { exit }.boxed(),
                })
            });
        tools
    }

    fn location() -> AssetLocation {
        AssetLocation::new("media", "clips/test.mov")
    }

    #[tokio::test]
    async fn test_probe_reads_duration_and_format() {
        let prober = Prober::new(
            Arc::new(storage_with_source()),
            Arc::new(tools_printing(PROBE_JSON, Ok(()))),
        );
        let probed = prober
            .probe(&location(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(probed.asset.duration, 23.28);
        assert_eq!(probed.asset.container_format, "mov");
        assert_eq!(probed.asset.location, location());
        assert_eq!(probed.output.streams_of(StreamKind::Audio).count(), 1);
    }

    #[tokio::test]
    async fn test_tool_failure_is_a_probe_error() {
        let prober = Prober::new(
            Arc::new(storage_with_source()),
            Arc::new(tools_printing("", Err("Invalid data found when processing input"))),
        );
        let err = prober
            .probe(&location(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Tool(ToolError::Failed { .. })));
        assert!(err.to_string().contains("Invalid data"));
    }

    #[tokio::test]
    async fn test_unparsable_output() {
        let prober = Prober::new(
            Arc::new(storage_with_source()),
            Arc::new(tools_printing("duration=12.0", Ok(()))),
        );
        let err = prober
            .probe(&location(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Parse(_)));
    }

    #[tokio::test]
    async fn test_zero_duration_is_rejected() {
        let prober = Prober::new(
            Arc::new(storage_with_source()),
            Arc::new(tools_printing(
                r#"{"format": {"format_name": "mov", "duration": "0.000000"}, "streams": []}"#,
                Ok(()),
            )),
        );
        let err = prober
            .probe(&location(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::EmptySource { .. }));
    }

    #[tokio::test]
    async fn test_missing_source_never_starts_the_tool() {
        let mut storage = MockStoragePort::new();
        storage
            .expect_get()
            .returning(|bucket, key| Err(StorageError::not_found(bucket, key)));
        let mut tools = MockToolRunner::new();
        tools.expect_run().never();

        let prober = Prober::new(Arc::new(storage), Arc::new(tools));
        let err = prober
            .probe(&location(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Storage(StorageError::NotFound { .. })
        ));
    }
}
