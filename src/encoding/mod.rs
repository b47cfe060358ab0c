// Video encoding and pixel format support
//
// This module defines the codecs the external encoder can be asked for and the
// raw pixel layouts cameras deliver. To add a new codec:
// 1. Add variant to VideoCodec enum
// 2. Add the encoder name in ffmpeg_encoder()
// 3. Add its quality/preset flags in quality_args() and preset_args()

pub mod encoder;

pub use encoder::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Supported video codecs for recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// Motion JPEG - each frame is a complete JPEG image
    Mjpeg,
    /// H.264/AVC - widely supported, good compression
    H264,
    /// H.265/HEVC - better compression than H.264
    H265,
    /// AV1 - royalty-free, excellent compression
    Av1,
}

impl VideoCodec {
    /// All supported codecs (for iteration)
    pub const ALL: &'static [VideoCodec] = &[
        VideoCodec::Mjpeg,
        VideoCodec::H264,
        VideoCodec::H265,
        VideoCodec::Av1,
    ];

    /// ffmpeg encoder name for this codec
    pub fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            VideoCodec::Mjpeg => "mjpeg",
            VideoCodec::H264 => "libx264",
            VideoCodec::H265 => "libx265",
            VideoCodec::Av1 => "libsvtav1",
        }
    }

    /// Output pixel format handed to the encoder
    pub fn output_pix_fmt(&self) -> &'static str {
        match self {
            VideoCodec::Mjpeg => "yuvj420p",
            _ => "yuv420p",
        }
    }

    /// Quality flags. MJPEG uses a qscale, the others a constant rate factor.
    pub fn quality_args(&self, quality: u32) -> Vec<String> {
        match self {
            VideoCodec::Mjpeg => vec!["-q:v".into(), quality.clamp(2, 31).to_string()],
            _ => vec!["-crf".into(), quality.to_string()],
        }
    }

    /// Speed preset flags, empty when the encoder has no preset knob
    pub fn preset_args(&self, preset: &str) -> Vec<String> {
        if preset.is_empty() {
            return Vec::new();
        }
        match self {
            VideoCodec::Mjpeg => Vec::new(),
            _ => vec!["-preset".into(), preset.to_string()],
        }
    }

    /// Human-readable display name
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::Mjpeg => "MJPEG",
            VideoCodec::H264 => "H.264",
            VideoCodec::H265 => "H.265",
            VideoCodec::Av1 => "AV1",
        }
    }
}

/// Raw pixel layouts delivered by camera devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit monochrome (Mono8)
    Gray8,
    /// 16-bit little-endian monochrome (Mono16)
    Gray16,
    /// Packed 8-bit RGB
    Rgb24,
    /// Packed 8-bit BGR
    Bgr24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Gray16 => 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }

    /// ffmpeg `-pix_fmt` name for raw input
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "gray",
            PixelFormat::Gray16 => "gray16le",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
        }
    }

    /// Size in bytes of one frame at the given dimensions
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::Gray8
    }
}

/// Encoder process configuration shared by every recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// Encoder executable
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Arguments placed before the generated ffmpeg arguments
    /// (e.g. when `program` is a wrapper such as `nice`)
    #[serde(default)]
    pub program_args: Vec<String>,

    /// Target codec
    #[serde(default = "default_codec")]
    pub codec: VideoCodec,

    /// Quality parameter (CRF for H.264/H.265/AV1, qscale for MJPEG)
    #[serde(default = "default_quality")]
    pub quality: u32,

    /// Encoder speed preset, passed through verbatim
    #[serde(default = "default_preset")]
    pub preset: String,

    /// How long `finish()` waits for the encoder to exit before killing it
    #[serde(default = "default_finish_timeout_secs")]
    pub finish_timeout_secs: u64,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            program_args: Vec::new(),
            codec: default_codec(),
            quality: default_quality(),
            preset: default_preset(),
            finish_timeout_secs: default_finish_timeout_secs(),
        }
    }
}

fn default_program() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_codec() -> VideoCodec {
    VideoCodec::H264
}

fn default_quality() -> u32 {
    23
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_finish_timeout_secs() -> u64 {
    30
}
