// Output file naming for a recording

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const VIDEO_SUFFIX: &str = ".mp4";
pub const GPIO_SUFFIX: &str = "_GPIO_data.csv";
pub const METADATA_SUFFIX: &str = "_metadata.json";

/// Characters that cannot appear in a file name on at least one supported platform
const PATH_HOSTILE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Sanitize a device name for use in filenames.
/// Replaces spaces, slashes, backslashes, and colons with underscores.
pub fn sanitize_device_name(name: &str) -> String {
    name.replace(' ', "_")
        .replace('/', "_")
        .replace('\\', "_")
        .replace(':', "_")
}

/// Check that a subject id can be used verbatim as a file name prefix.
/// Returns the reason it cannot.
pub fn validate_subject_id(subject_id: &str) -> Result<(), &'static str> {
    if subject_id.trim().is_empty() {
        return Err("must not be empty");
    }
    if subject_id != subject_id.trim() {
        return Err("must not start or end with whitespace");
    }
    if subject_id == "." || subject_id == ".." {
        return Err("must not be a relative path component");
    }
    if subject_id.chars().any(|c| PATH_HOSTILE_CHARS.contains(&c)) {
        return Err("must not contain any of / \\ : * ? \" < > |");
    }
    if subject_id.chars().any(char::is_control) {
        return Err("must not contain control characters");
    }
    Ok(())
}

/// The three files one recording produces, fixed at start time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionPaths {
    /// Shared file name prefix: `<subject>_<YYYYMMDD>_<HHMMSS>_<mmm>`
    pub stem: String,
    pub video: PathBuf,
    pub gpio_log: PathBuf,
    pub metadata: PathBuf,
}

impl SessionPaths {
    /// Derive the output paths from the subject id and the session start time.
    /// The subject id must already have passed `validate_subject_id`.
    pub fn derive(save_dir: &Path, subject_id: &str, start_time: &DateTime<Local>) -> Self {
        let stem = format!("{}_{}", subject_id, start_time.format("%Y%m%d_%H%M%S_%3f"));
        Self {
            video: save_dir.join(format!("{}{}", stem, VIDEO_SUFFIX)),
            gpio_log: save_dir.join(format!("{}{}", stem, GPIO_SUFFIX)),
            metadata: save_dir.join(format!("{}{}", stem, METADATA_SUFFIX)),
            stem,
        }
    }

    /// Bare file name of a path inside the save directory
    pub fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}
