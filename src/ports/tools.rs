//! The "run an external tool with piped I/O, honoring cancellation" primitive
//! shared by the prober, the transcode worker and the assembler.

use crate::error::ToolError;
use crate::ports::storage::ByteStream;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt, TryStreamExt};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Ffmpeg => f.write_str("ffmpeg"),
            Tool::Ffprobe => f.write_str("ffprobe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: Tool,
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new(tool: Tool) -> Self {
        Self {
            tool,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value following `flag`, if present.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|at| self.args.get(at + 1))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolExit {
    /// Diagnostics printed by the tool
    pub stderr: String,
}

pub type ExitFuture = BoxFuture<'static, Result<ToolExit, ToolError>>;

/// A running tool.
///
/// `stdout` must be consumed concurrently with `exit`: a tool blocked on a
/// full stdout pipe never exits. [`ToolProcess::checked_output`] does both.
pub struct ToolProcess {
    pub tool: Tool,
    pub stdout: ByteStream,
    pub exit: ExitFuture,
}

impl ToolProcess {
    /// Buffer stdout in memory while waiting for exit. Only for small outputs.
    pub async fn collect(self) -> Result<(Vec<u8>, ToolExit), ToolError> {
        let tool = self.tool;
        let read = self.stdout.try_fold(Vec::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok(buf)
        });
        let (stdout, exit) = tokio::join!(read, self.exit);
        let exit = exit?;
        let stdout = stdout.map_err(|source| ToolError::Io { tool, source })?;
        Ok((stdout, exit))
    }

    /// Stdout that only ends cleanly once the tool exited successfully after
    /// printing something.
    ///
    /// A failed, cancelled or silent run ends the stream with an error instead,
    /// so a storage backend never commits its output. The [`ToolError`] behind
    /// that error is left in the returned [`ExitReport`].
    pub fn checked_output(self) -> (ByteStream, ExitReport) {
        let report = ExitReport::default();
        let output = CheckedOutput {
            tool: self.tool,
            stdout: Some(self.stdout),
            exit: Some(self.exit),
            produced: false,
            finished: false,
            report: report.clone(),
        };
        (Box::pin(output), report)
    }
}

/// Tool-side reason a [`ToolProcess::checked_output`] stream failed.
#[derive(Debug, Clone, Default)]
pub struct ExitReport(Arc<Mutex<Option<ToolError>>>);

impl ExitReport {
    /// The tool error, if the tool (not the consumer) ended the stream.
    pub fn take(&self) -> Option<ToolError> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn record(&self, err: ToolError) -> io::Error {
        let surfaced = io::Error::new(io::ErrorKind::Other, err.to_string());
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        surfaced
    }
}

struct CheckedOutput {
    tool: Tool,
    stdout: Option<ByteStream>,
    exit: Option<ExitFuture>,
    produced: bool,
    finished: bool,
    report: ExitReport,
}

impl CheckedOutput {
    fn fail(&mut self, err: ToolError) -> Poll<Option<io::Result<Bytes>>> {
        self.finished = true;
        self.stdout = None;
        self.exit = None;
        Poll::Ready(Some(Err(self.report.record(err))))
    }
}

impl Stream for CheckedOutput {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        // Exit is polled on every wakeup, not only after stdout ended, so a
        // failure or cancellation stops the consumer mid-stream.
        if let Some(exit) = this.exit.as_mut() {
            if let Poll::Ready(result) = exit.poll_unpin(cx) {
                this.exit = None;
                if let Err(err) = result {
                    return this.fail(err);
                }
            }
        }

        if let Some(stdout) = this.stdout.as_mut() {
            match stdout.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.produced |= !chunk.is_empty();
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Poll::Ready(Some(Err(source))) => {
                    let tool = this.tool;
                    return this.fail(ToolError::Io { tool, source });
                }
                Poll::Ready(None) => this.stdout = None,
                Poll::Pending => return Poll::Pending,
            }
        }

        if this.exit.is_some() {
            // Registered with the waker above.
            return Poll::Pending;
        }
        if !this.produced {
            let tool = this.tool;
            return this.fail(ToolError::NoOutput { tool });
        }
        this.finished = true;
        Poll::Ready(None)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ToolRunner: Send + Sync {
    /// Start `invocation`, streaming `stdin` into the tool.
    ///
    /// Cancelling `cancel` terminates the process and resolves `exit` with
    /// [`ToolError::Cancelled`].
    fn run(
        &self,
        invocation: ToolInvocation,
        stdin: Option<ByteStream>,
        cancel: CancellationToken,
    ) -> Result<ToolProcess, ToolError>;
}
