//! Output encoding settings for segment transcodes.

use serde::Serialize;

/// Fragmented MP4 flags: the muxer never seeks back, so output can be piped.
pub const FRAGMENTED_MP4_FLAGS: &str = "frag_keyframe+empty_moov+default_base_moof";

/// One rung of the rendition ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rendition {
    pub quality: &'static str,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_low_kbps: u32,
    pub video_bitrate_high_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

/// Fixture ladder. Only single renditions are applied; no ladder is generated.
pub const LADDER: &[Rendition] = &[
    Rendition {
        quality: "240p",
        width: 426,
        height: 240,
        video_bitrate_low_kbps: 400,
        video_bitrate_high_kbps: 600,
        audio_bitrate_kbps: 64,
    },
    Rendition {
        quality: "360p",
        width: 640,
        height: 360,
        video_bitrate_low_kbps: 700,
        video_bitrate_high_kbps: 900,
        audio_bitrate_kbps: 96,
    },
    Rendition {
        quality: "480p",
        width: 854,
        height: 480,
        video_bitrate_low_kbps: 1250,
        video_bitrate_high_kbps: 1600,
        audio_bitrate_kbps: 128,
    },
    Rendition {
        quality: "HD 720p",
        width: 1280,
        height: 720,
        video_bitrate_low_kbps: 2500,
        video_bitrate_high_kbps: 3200,
        audio_bitrate_kbps: 128,
    },
    Rendition {
        quality: "HD 720p 60fps",
        width: 1280,
        height: 720,
        video_bitrate_low_kbps: 3500,
        video_bitrate_high_kbps: 4400,
        audio_bitrate_kbps: 128,
    },
    Rendition {
        quality: "Full HD 1080p",
        width: 1920,
        height: 1080,
        video_bitrate_low_kbps: 4500,
        video_bitrate_high_kbps: 5300,
        audio_bitrate_kbps: 192,
    },
    Rendition {
        quality: "Full HD 1080p 60fps",
        width: 1920,
        height: 1080,
        video_bitrate_low_kbps: 5800,
        video_bitrate_high_kbps: 7400,
        audio_bitrate_kbps: 192,
    },
    Rendition {
        quality: "4k",
        width: 3840,
        height: 2160,
        video_bitrate_low_kbps: 14000,
        video_bitrate_high_kbps: 18200,
        audio_bitrate_kbps: 192,
    },
    Rendition {
        quality: "4k 60fps",
        width: 3840,
        height: 2160,
        video_bitrate_low_kbps: 23000,
        video_bitrate_high_kbps: 29500,
        audio_bitrate_kbps: 192,
    },
];

/// Look up a rendition by its quality label, ignoring case.
pub fn rendition(quality: &str) -> Option<&'static Rendition> {
    LADDER
        .iter()
        .find(|rendition| rendition.quality.eq_ignore_ascii_case(quality.trim()))
}

impl Rendition {
    pub fn ffmpeg_args(&self) -> Vec<String> {
        vec![
            "-vf".to_string(),
            format!("scale={}:{}", self.width, self.height),
            "-b:v".to_string(),
            format!("{}k", self.video_bitrate_low_kbps),
            "-maxrate".to_string(),
            format!("{}k", self.video_bitrate_high_kbps),
            "-bufsize".to_string(),
            format!("{}k", self.video_bitrate_high_kbps * 2),
            "-b:a".to_string(),
            format!("{}k", self.audio_bitrate_kbps),
        ]
    }
}

/// Encoder settings applied to every segment of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeOptions {
    pub video_codec: String,
    pub audio_codec: String,
    pub rendition: Option<&'static Rendition>,
    pub extra_args: Vec<String>,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            rendition: None,
            extra_args: Vec::new(),
        }
    }
}

impl TranscodeOptions {
    /// Codec, rendition and muxer arguments, placed between input and output.
    pub fn output_args(&self) -> Vec<String> {
        let mut args = vec![
            "-c:v".to_string(),
            self.video_codec.clone(),
            "-c:a".to_string(),
            self.audio_codec.clone(),
        ];
        if let Some(rendition) = self.rendition {
            args.extend(rendition.ffmpeg_args());
        }
        args.extend(self.extra_args.iter().cloned());
        args.extend([
            "-movflags".to_string(),
            FRAGMENTED_MP4_FLAGS.to_string(),
            "-f".to_string(),
            "mp4".to_string(),
        ]);
        args
    }
}
