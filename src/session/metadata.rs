// Session metadata structures

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::encoding::{PixelFormat, VideoCodec};

/// Format a timestamp as ISO 8601 with millisecond precision and UTC offset
pub fn format_timestamp(time: &DateTime<Local>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}

/// Where a recording stands, as recorded in its metadata file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingOutcome {
    /// Still being written
    Recording,
    /// Finalized without errors
    Complete,
    /// Finalized after an encoder or write failure; counts are still accurate
    Failed,
}

/// Encoder parameters recorded alongside the video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderInfo {
    pub codec: VideoCodec,
    pub quality: u32,
    pub preset: String,
}

/// Complete session metadata, rewritten wholesale at start and at stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Unique recording ID
    pub recording_id: String,

    /// Operator-provided subject label
    pub subject_id: String,

    pub camera_id: String,
    pub camera_name: String,

    /// Requested acquisition settings
    pub fps: f64,
    pub exposure_us: Option<f64>,
    pub gain_db: Option<f64>,
    pub pixel_format: PixelFormat,
    pub downsampling_factor: u32,

    /// Dimensions of the encoded frames (after downsampling)
    pub frame_width: u32,
    pub frame_height: u32,

    pub device_model: String,
    pub serial_number: String,

    /// GPIO log column names
    pub gpio_lines: Vec<String>,

    pub encoder: EncoderInfo,

    /// File names relative to the metadata file's folder
    pub video_file: String,
    pub gpio_file: String,

    pub recorded_frame_count: u64,
    pub dropped_frame_count: u64,

    pub start_time: String,
    pub end_time: Option<String>,

    pub status: RecordingOutcome,

    /// Failure description when `status` is `failed`
    pub error: Option<String>,
}

impl SessionMetadata {
    /// Replace the metadata file atomically (write to a temp file, then rename)
    pub fn write_atomic(&self, path: &Path) -> std::io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionMetadata {
        SessionMetadata {
            recording_id: "r1".into(),
            subject_id: "mouse_1".into(),
            camera_id: "cam0".into(),
            camera_name: "Top".into(),
            fps: 30.0,
            exposure_us: Some(5000.0),
            gain_db: None,
            pixel_format: PixelFormat::Gray8,
            downsampling_factor: 2,
            frame_width: 320,
            frame_height: 240,
            device_model: "Synthetic".into(),
            serial_number: "SYN-cam0".into(),
            gpio_lines: vec!["Line0".into(), "Line1".into()],
            encoder: EncoderInfo {
                codec: VideoCodec::H264,
                quality: 23,
                preset: "veryfast".into(),
            },
            video_file: "mouse_1.mp4".into(),
            gpio_file: "mouse_1_GPIO_data.csv".into(),
            recorded_frame_count: 0,
            dropped_frame_count: 0,
            start_time: "2024-03-09T14:05:07.042+00:00".into(),
            end_time: None,
            status: RecordingOutcome::Recording,
            error: None,
        }
    }

    #[test]
    fn rewrite_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m_metadata.json");
        let mut meta = sample();
        meta.write_atomic(&path).unwrap();

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(json["end_time"].is_null());
        assert_eq!(json["status"], "recording");
        assert_eq!(json["encoder"]["codec"], "h264");

        meta.recorded_frame_count = 120;
        meta.end_time = Some("2024-03-09T14:05:11.042+00:00".into());
        meta.status = RecordingOutcome::Complete;
        meta.write_atomic(&path).unwrap();

        assert_eq!(SessionMetadata::read(&path).unwrap(), meta);
        // Only the metadata file remains; the temp file was renamed over it
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn timestamps_carry_milliseconds() {
        use chrono::TimeZone;
        let t = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().unwrap();
        let formatted = format_timestamp(&t);
        assert!(formatted.starts_with("2024-01-02T03:04:05.000"));
        assert!(DateTime::parse_from_rfc3339(&formatted).is_ok());
    }
}
