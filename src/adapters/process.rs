//! Runs ffmpeg / ffprobe as child processes with piped stdin/stdout.

use crate::config::ToolPaths;
use crate::error::ToolError;
use crate::ports::storage::ByteStream;
use crate::ports::tools::{Tool, ToolExit, ToolInvocation, ToolProcess, ToolRunner};
use futures::{FutureExt, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl ProcessRunner {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn from_config(tools: &ToolPaths) -> Self {
        Self::new(&tools.ffmpeg, &tools.ffprobe)
    }

    fn program(&self, tool: Tool) -> &Path {
        match tool {
            Tool::Ffmpeg => &self.ffmpeg,
            Tool::Ffprobe => &self.ffprobe,
        }
    }
}

impl ToolRunner for ProcessRunner {
    fn run(
        &self,
        invocation: ToolInvocation,
        stdin: Option<ByteStream>,
        cancel: CancellationToken,
    ) -> Result<ToolProcess, ToolError> {
        let tool = invocation.tool;
        let mut child = Command::new(self.program(tool))
            .args(&invocation.args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn { tool, source })?;
        debug!(%tool, args = ?invocation.args, pid = ?child.id(), "spawned");

        let pump = match (stdin, child.stdin.take()) {
            (Some(body), Some(pipe)) => Some(tokio::spawn(pump_stdin(body, pipe))),
            _ => None,
        };

        let stdout = child.stdout.take().ok_or_else(|| ToolError::Io {
            tool,
            source: io::Error::new(io::ErrorKind::Other, "stdout was not captured"),
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| ToolError::Io {
            tool,
            source: io::Error::new(io::ErrorKind::Other, "stderr was not captured"),
        })?;
        let diagnostics = tokio::spawn(async move {
            let mut buf = Vec::new();
            // Whatever was read before an error is still worth reporting.
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).trim().to_string()
        });

        let exit = async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancel.cancelled() => None,
            };
            let Some(status) = status else {
                let _ = child.kill().await;
                if let Some(pump) = pump {
                    pump.abort();
                }
                diagnostics.abort();
                debug!(%tool, "killed after cancellation");
                return Err(ToolError::Cancelled { tool });
            };
            let status = status.map_err(|source| ToolError::Io { tool, source })?;

            let pumped = match pump {
                Some(pump) => pump.await.unwrap_or_else(|join| {
                    Err(io::Error::new(io::ErrorKind::Other, join.to_string()))
                }),
                None => Ok(()),
            };
            let stderr = diagnostics.await.unwrap_or_default();

            if !status.success() {
                return Err(ToolError::Failed {
                    tool,
                    status: status.to_string(),
                    stderr,
                });
            }
            pumped.map_err(|source| ToolError::Io { tool, source })?;
            Ok(ToolExit { stderr })
        }
        .boxed();

        Ok(ToolProcess {
            tool,
            stdout: Box::pin(ReaderStream::new(stdout)),
            exit,
        })
    }
}

/// Copy `body` into the child's stdin, then close it.
///
/// A tool that stops reading early (ffprobe after the header, ffmpeg after
/// `-t`) closes the pipe; that ends the pump without error.
async fn pump_stdin(mut body: ByteStream, mut pipe: ChildStdin) -> io::Result<()> {
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        match pipe.write_all(&chunk).await {
            Ok(()) => {}
            Err(err) if is_closed_pipe(&err) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
    match pipe.shutdown().await {
        Err(err) if !is_closed_pipe(&err) => Err(err),
        _ => Ok(()),
    }
}

fn is_closed_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}
