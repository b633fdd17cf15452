//! Configuration loaded from the environment (and `.env` when present).

use crate::domain::av::encoding::{rendition, TranscodeOptions};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// What happens when a segment is still failing after all retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the whole job. A missing segment would corrupt order and duration.
    #[default]
    FailFast,
    /// Keep going and assemble without the failed segments.
    BestEffort,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "fail_fast" | "failfast" => Ok(FailurePolicy::FailFast),
            "best-effort" | "best_effort" | "besteffort" => Ok(FailurePolicy::BestEffort),
            other => Err(format!("unknown failure policy {other:?}")),
        }
    }
}

/// Exponential backoff between transcode attempts of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempts`-th failure: `base * 2^(n-1)`, capped.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// Configuration of the segment / transcode / assemble pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Default segment length in seconds
    pub segment_size: f64,
    /// Maximum number of concurrent segment transcodes
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    /// Deadline covering probing through assembly
    pub job_deadline: Duration,
    /// Lifetime of URLs handed to the concat demuxer
    pub signed_url_ttl: Duration,
    /// How often a segment artifact is looked up before assembly gives up
    pub artifact_poll_attempts: u32,
    pub artifact_poll_interval: Duration,
    pub tools: ToolPaths,
    pub transcode: TranscodeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segment_size: 5.0,
            concurrency: num_cpus::get().max(1),
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            job_deadline: Duration::from_secs(180),
            signed_url_ttl: Duration::from_secs(900),
            artifact_poll_attempts: 5,
            artifact_poll_interval: Duration::from_millis(200),
            tools: ToolPaths::default(),
            transcode: TranscodeOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from any variable source; unset variables keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let segment_size: f64 = parse_var(&lookup, "ET_SEGMENT_SIZE", defaults.segment_size)?;
        if !(segment_size.is_finite() && segment_size > 0.0) {
            return Err(invalid("ET_SEGMENT_SIZE", segment_size, "must be positive"));
        }

        let concurrency: usize = parse_var(&lookup, "ET_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(invalid("ET_CONCURRENCY", concurrency, "must be at least 1"));
        }

        let retry = RetryPolicy {
            max_retries: parse_var(&lookup, "ET_MAX_RETRIES", defaults.retry.max_retries)?,
            base_delay: millis(&lookup, "ET_RETRY_BASE_MS", defaults.retry.base_delay)?,
            max_delay: millis(&lookup, "ET_RETRY_MAX_MS", defaults.retry.max_delay)?,
        };

        let mut transcode = defaults.transcode.clone();
        if let Some(codec) = lookup("ET_VIDEO_CODEC") {
            transcode.video_codec = codec;
        }
        if let Some(codec) = lookup("ET_AUDIO_CODEC") {
            transcode.audio_codec = codec;
        }
        if let Some(quality) = lookup("ET_RENDITION") {
            transcode.rendition = Some(
                rendition(&quality)
                    .ok_or_else(|| invalid("ET_RENDITION", &quality, "unknown rendition"))?,
            );
        }

        Ok(Self {
            segment_size,
            concurrency,
            retry,
            failure_policy: parse_var(&lookup, "ET_FAILURE_POLICY", defaults.failure_policy)?,
            job_deadline: seconds(&lookup, "ET_JOB_DEADLINE_SECS", defaults.job_deadline)?,
            signed_url_ttl: seconds(&lookup, "ET_SIGNED_URL_TTL_SECS", defaults.signed_url_ttl)?,
            artifact_poll_attempts: parse_var(
                &lookup,
                "ET_ARTIFACT_POLL_ATTEMPTS",
                defaults.artifact_poll_attempts,
            )?,
            artifact_poll_interval: millis(
                &lookup,
                "ET_ARTIFACT_POLL_INTERVAL_MS",
                defaults.artifact_poll_interval,
            )?,
            tools: ToolPaths {
                ffmpeg: lookup("ET_FFMPEG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.tools.ffmpeg),
                ffprobe: lookup("ET_FFPROBE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.tools.ffprobe),
            },
            transcode,
        })
    }
}

/// Which storage backend the entry point wires up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    /// Buckets are directories below this root
    Fs(PathBuf),
    S3,
}

impl StorageBackend {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = lookup("ET_STORAGE").unwrap_or_else(|| String::from("fs"));
        match backend.trim().to_ascii_lowercase().as_str() {
            "fs" => Ok(StorageBackend::Fs(PathBuf::from(
                lookup("ET_STORAGE_ROOT").unwrap_or_else(|| String::from("./")),
            ))),
            "s3" => Ok(StorageBackend::S3),
            _ => Err(invalid("ET_STORAGE", &backend, "expected fs or s3")),
        }
    }
}

fn invalid(name: &'static str, value: impl Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err: T::Err| invalid(name, &raw, &err.to_string())),
        None => Ok(default),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_var(lookup, name, default.as_millis() as u64).map(Duration::from_millis)
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_var(lookup, name, default.as_secs()).map(Duration::from_secs)
}
