//! Structured output of the probing tool (`ffprobe -print_format json`).

use crate::domain::jobs::{AssetLocation, MediaAsset};
use crate::error::ProbeError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub format: Option<ProbeFormat>,
    #[serde(default)]
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeFormat {
    /// Comma separated demuxer names, e.g. "mov,mp4,m4a,3gp,3g2,mj2"
    #[serde(default)]
    pub format_name: Option<String>,
    /// ffprobe reports durations as strings; some builds emit numbers.
    #[serde(default)]
    pub duration: Option<Number>,
    #[serde(default)]
    pub size: Option<Number>,
    #[serde(default)]
    pub bit_rate: Option<Number>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Float(f64),
    Text(String),
}

impl Number {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Number::Float(value) => Some(*value),
            Number::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Data,
    Attachment,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub codec_type: StreamKind,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub pix_fmt: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<String>,
    #[serde(default)]
    pub channels: Option<u32>,
}

impl ProbeOutput {
    pub fn from_json(data: &[u8]) -> Result<Self, ProbeError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn duration(&self) -> Result<f64, ProbeError> {
        let raw = self
            .format
            .as_ref()
            .and_then(|format| format.duration.as_ref())
            .ok_or(ProbeError::MissingDuration)?;
        match raw.as_f64() {
            Some(duration) if duration.is_finite() && duration >= 0.0 => Ok(duration),
            _ => Err(ProbeError::InvalidDuration(format!("{raw:?}"))),
        }
    }

    /// First demuxer name of `format_name`, usable as an input format hint.
    pub fn container_format(&self) -> Result<String, ProbeError> {
        self.format
            .as_ref()
            .and_then(|format| format.format_name.as_deref())
            .and_then(|names| names.split(',').next())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or(ProbeError::MissingFormat)
    }

    pub fn streams_of(&self, kind: StreamKind) -> impl Iterator<Item = &StreamInfo> {
        self.streams
            .iter()
            .filter(move |stream| stream.codec_type == kind)
    }

    /// Build the probed asset. A zero duration means there is nothing to transcode.
    pub fn to_asset(&self, location: AssetLocation) -> Result<MediaAsset, ProbeError> {
        let duration = self.duration()?;
        if duration == 0.0 {
            return Err(ProbeError::EmptySource { key: location.key });
        }
        Ok(MediaAsset {
            location,
            duration,
            container_format: self.container_format()?,
        })
    }
}
