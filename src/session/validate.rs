use std::path::Path;

use super::gpio::split_csv_line;
use super::metadata::{RecordingOutcome, SessionMetadata};

// ── Recording validation ─────────────────────────────────────────────

#[derive(Debug)]
pub struct RecordingValidation {
    pub gpio_rows: u64,
    pub recorded_frames: u64,
    pub dropped_frames: u64,
    pub video_bytes: u64,
    pub outcome: RecordingOutcome,
}

/// Re-read a finished recording and check that its files agree with each other.
///
/// Checks: metadata is finalized, GPIO header matches the recorded line names,
/// every row holds one 0/1 per line, row count equals the recorded frame count,
/// and the video file exists.
pub fn validate_recording(metadata_path: &Path) -> Result<RecordingValidation, String> {
    let meta = SessionMetadata::read(metadata_path)
        .map_err(|e| format!("Failed to read metadata: {}", e))?;

    if meta.status == RecordingOutcome::Recording || meta.end_time.is_none() {
        return Err("Recording was never finalized".into());
    }

    let dir = metadata_path.parent().unwrap_or_else(|| Path::new("."));

    let gpio_text = std::fs::read_to_string(dir.join(&meta.gpio_file))
        .map_err(|e| format!("Failed to read GPIO log: {}", e))?;
    let mut lines = gpio_text.lines();

    let header = lines.next().ok_or("GPIO log is empty")?;
    let header_fields = if meta.gpio_lines.is_empty() && header.is_empty() {
        Vec::new()
    } else {
        split_csv_line(header)
    };
    if header_fields != meta.gpio_lines {
        return Err(format!(
            "GPIO header {:?} does not match metadata lines {:?}",
            header_fields, meta.gpio_lines
        ));
    }

    let mut gpio_rows = 0u64;
    for (index, row) in lines.enumerate() {
        let fields: Vec<&str> = if meta.gpio_lines.is_empty() {
            if !row.is_empty() {
                return Err(format!("Row {} has values but no lines are defined", index + 1));
            }
            Vec::new()
        } else {
            row.split(',').collect()
        };
        if fields.len() != meta.gpio_lines.len() {
            return Err(format!(
                "Row {} has {} fields, expected {}",
                index + 1,
                fields.len(),
                meta.gpio_lines.len()
            ));
        }
        if let Some(bad) = fields.iter().find(|f| **f != "0" && **f != "1") {
            return Err(format!("Row {} has non-binary value {:?}", index + 1, bad));
        }
        gpio_rows += 1;
    }

    if gpio_rows != meta.recorded_frame_count {
        return Err(format!(
            "GPIO log has {} rows but metadata records {} frames",
            gpio_rows, meta.recorded_frame_count
        ));
    }

    let video_bytes = std::fs::metadata(dir.join(&meta.video_file))
        .map(|m| m.len())
        .map_err(|e| format!("Video file missing: {}", e))?;

    Ok(RecordingValidation {
        gpio_rows,
        recorded_frames: meta.recorded_frame_count,
        dropped_frames: meta.dropped_frame_count,
        video_bytes,
        outcome: meta.status,
    })
}
