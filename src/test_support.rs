//! In-process stand-ins for ffprobe / ffmpeg used by pipeline tests.

use crate::adapters::local::MemoryStorage;
use crate::error::ToolError;
use crate::ports::storage::{once, ByteStream};
use crate::ports::tools::{Tool, ToolExit, ToolInvocation, ToolProcess, ToolRunner};
use bytes::{Bytes, BytesMut};
use futures::{stream, FutureExt, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Behaves like the real tools, closely enough for the pipeline:
///
/// * ffprobe prints a fixed duration and container
/// * a segment transcode prints `<{ss}>` after `delay`
/// * concat resolves the `memory://` URLs of its listing and joins the objects
pub struct ScriptedRunner {
    storage: MemoryStorage,
    duration: f64,
    delay: Duration,
    concat_failure: Option<Duration>,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<ToolInvocation>>,
}

impl ScriptedRunner {
    pub fn new(storage: MemoryStorage, duration: f64) -> Self {
        Self {
            storage,
            duration,
            delay: Duration::from_millis(1),
            concat_failure: None,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Transcodes starting at `start` fail `times` times before succeeding.
    pub fn failing(self, start: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(start.to_string(), times);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Concat prints its output, then exits with an error `after` later.
    pub fn failing_concat_after(mut self, after: Duration) -> Self {
        self.concat_failure = Some(after);
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// `-ss` of every transcode attempt, in start order.
    pub fn transcode_starts(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|call| call.value_of("-ss").map(str::to_string))
            .collect()
    }

    pub fn concat_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.value_of("-f") == Some("concat"))
            .count()
    }

    fn probe(&self) -> ToolProcess {
        let json = format!(
            r#"{{"format": {{"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "{:.6}"}}, "streams": [{{"index": 0, "codec_type": "video", "codec_name": "h264"}}]}}"#,
            self.duration
        );
        ToolProcess {
            tool: Tool::Ffprobe,
            stdout: once(json),
            exit: async { Ok(ToolExit::default()) }.boxed(),
        }
    }

    fn transcode(&self, start: String, cancel: CancellationToken) -> ToolProcess {
        let failing = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&start) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if failing {
            return ToolProcess {
                tool: Tool::Ffmpeg,
                stdout: Box::pin(stream::empty::<io::Result<Bytes>>()),
                exit: async move {
                    Err(ToolError::Failed {
                        tool: Tool::Ffmpeg,
                        status: "exit status: 1".to_string(),
                        stderr: format!("scripted failure at {start}"),
                    })
                }
                .boxed(),
            };
        }

        let delay = self.delay;
        let output_cancel = cancel.clone();
        let output = format!("<{start}>");
        let stdout: ByteStream = Box::pin(
            stream::once(async move {
                tokio::select! {
                    _ = output_cancel.cancelled() => None,
                    _ = tokio::time::sleep(delay) => Some(Ok::<_, io::Error>(Bytes::from(output))),
                }
            })
            .filter_map(|chunk| async move { chunk }),
        );
        let exit = async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(ToolError::Cancelled { tool: Tool::Ffmpeg }),
                _ = tokio::time::sleep(delay) => Ok(ToolExit::default()),
            }
        }
        .boxed();
        ToolProcess {
            tool: Tool::Ffmpeg,
            stdout,
            exit,
        }
    }

    fn concat(&self, stdin: Option<ByteStream>, cancel: CancellationToken) -> ToolProcess {
        let storage = self.storage.clone();
        let stdout: ByteStream = Box::pin(stream::once(async move {
            let listing = match stdin {
                Some(stdin) => {
                    stdin
                        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
                            buf.extend_from_slice(&chunk);
                            Ok(buf)
                        })
                        .await?
                }
                None => BytesMut::new(),
            };
            let listing = String::from_utf8_lossy(&listing).into_owned();
            let mut joined = BytesMut::new();
            for line in listing.lines() {
                let url = line
                    .strip_prefix("file '")
                    .and_then(|rest| rest.strip_suffix('\''))
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, line.to_string()))?;
                let object = storage
                    .resolve_url(url)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, url.to_string()))?;
                joined.extend_from_slice(&object);
            }
            Ok::<_, io::Error>(joined.freeze())
        }));
        let exit = match self.concat_failure {
            None => async { Ok(ToolExit::default()) }.boxed(),
            Some(after) => async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ToolError::Cancelled { tool: Tool::Ffmpeg }),
                    _ = tokio::time::sleep(after) => Err(ToolError::Failed {
                        tool: Tool::Ffmpeg,
                        status: "exit status: 1".to_string(),
                        stderr: "trailer write failed".to_string(),
                    }),
                }
            }
            .boxed(),
        };
        ToolProcess {
            tool: Tool::Ffmpeg,
            stdout,
            exit,
        }
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(
        &self,
        invocation: ToolInvocation,
        stdin: Option<ByteStream>,
        cancel: CancellationToken,
    ) -> Result<ToolProcess, ToolError> {
        self.calls.lock().unwrap().push(invocation.clone());
        if invocation.tool == Tool::Ffprobe {
            return Ok(self.probe());
        }
        if invocation.value_of("-f") == Some("concat") {
            return Ok(self.concat(stdin, cancel));
        }
        let start = invocation
            .value_of("-ss")
            .map(str::to_string)
            .unwrap_or_default();
        Ok(self.transcode(start, cancel))
    }
}
