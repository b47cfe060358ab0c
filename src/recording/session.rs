// Recording session: one camera's Idle -> Armed -> Recording -> Stopping -> Idle cycle
//
// A session owns the three output files of the active recording (video via the
// encoder subprocess, GPIO log, metadata). Every write path failure finalizes
// the files with accurate counts before the error is handed back, so whatever
// is on disk after an error is always a consistent, closed recording.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::downsample::Downsampler;
use super::RecordingStatus;
use crate::config::CameraConfig;
use crate::devices::{DeviceError, DeviceInfo, Frame};
use crate::encoding::{EncoderError, EncoderPipe, EncoderSettings, PixelFormat, RawVideoInput};
use crate::session::{
    format_timestamp, validate_subject_id, EncoderInfo, GpioLogWriter, RecordingOutcome,
    SessionMetadata, SessionPaths,
};

/// Error type for recording operations
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("Invalid subject id {subject_id:?}: {reason}")]
    InvalidSubjectId {
        subject_id: String,
        reason: &'static str,
    },

    #[error("A recording is already active")]
    AlreadyRecording,

    #[error("Failed to start encoder: {0}")]
    EncoderStart(#[source] EncoderError),

    #[error("Encoding failed: {0}")]
    EncodeFailed(#[source] EncoderError),

    #[error("Failed to write {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Device fault: {0}")]
    DeviceFault(#[from] DeviceError),

    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    #[error("Camera already attached: {0}")]
    DuplicateCamera(String),

    #[error("Write worker pool is not running")]
    WorkerUnavailable,

    #[error("Failed to start thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecordingError>;

/// Everything a session needs to know about its camera at start time
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub camera_id: String,
    pub camera_name: String,
    pub device: DeviceInfo,
    pub fps: f64,
    pub exposure_us: Option<f64>,
    pub gain_db: Option<f64>,
    pub downsampling_factor: u32,
    pub encoder: EncoderSettings,
}

impl RecordingSettings {
    pub fn new(camera: &CameraConfig, device: &DeviceInfo, encoder: &EncoderSettings) -> Self {
        Self {
            camera_id: camera.id.clone(),
            camera_name: camera.name.clone(),
            device: device.clone(),
            fps: camera.fps,
            exposure_us: camera.exposure_us,
            gain_db: camera.gain_db,
            downsampling_factor: camera.downsampling_factor.max(1),
            encoder: encoder.clone(),
        }
    }

    /// Pixel layout is fixed by the device, not by the requested settings
    pub fn pixel_format(&self) -> PixelFormat {
        self.device.pixel_format
    }
}

/// Outcome of one finalized recording
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub recording_id: String,
    pub subject_id: String,
    pub camera_id: String,
    pub paths: SessionPaths,
    pub recorded_frame_count: u64,
    pub dropped_frame_count: u64,
    pub start_time: String,
    pub end_time: String,
    /// Set when the recording ended because of a failure
    pub error: Option<String>,
}

impl RecordingSummary {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

struct ActiveRecording {
    paths: SessionPaths,
    metadata: SessionMetadata,
    encoder: EncoderPipe,
    gpio: GpioLogWriter,
    downsampler: Downsampler,
    recorded: u64,
    dropped: u64,
}

/// One camera's recording state machine
pub struct RecordingSession {
    status: RecordingStatus,
    active: Option<ActiveRecording>,
    generation: u64,
    last_summary: Option<RecordingSummary>,
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSession {
    pub fn new() -> Self {
        Self {
            status: RecordingStatus::Idle,
            active: None,
            generation: 0,
            last_summary: None,
        }
    }

    pub fn status(&self) -> RecordingStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Incremented by every successful start
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn recorded_frame_count(&self) -> u64 {
        self.active.as_ref().map(|a| a.recorded).unwrap_or(0)
    }

    pub fn dropped_frame_count(&self) -> u64 {
        self.active.as_ref().map(|a| a.dropped).unwrap_or(0)
    }

    /// Summary of the most recently finalized recording
    pub fn last_summary(&self) -> Option<&RecordingSummary> {
        self.last_summary.as_ref()
    }

    /// Open the output files and launch the encoder
    ///
    /// # Arguments
    /// * `subject_id` - Operator label, used verbatim as the file name prefix
    /// * `save_dir` - Folder for the three output files, created if missing
    /// * `settings` - Camera and encoder parameters for this recording
    pub fn start_recording(
        &mut self,
        subject_id: &str,
        save_dir: &Path,
        settings: &RecordingSettings,
    ) -> Result<SessionPaths> {
        if self.active.is_some() {
            return Err(RecordingError::AlreadyRecording);
        }

        validate_subject_id(subject_id).map_err(|reason| RecordingError::InvalidSubjectId {
            subject_id: subject_id.to_string(),
            reason,
        })?;

        let start_time = Local::now();
        let paths = SessionPaths::derive(save_dir, subject_id, &start_time);

        std::fs::create_dir_all(save_dir).map_err(|source| RecordingError::WriteFailed {
            path: save_dir.to_path_buf(),
            source,
        })?;

        let device = &settings.device;
        let downsampler = Downsampler::new(
            settings.downsampling_factor,
            device.width,
            device.height,
            device.pixel_format,
        );

        let gpio = GpioLogWriter::create(&paths.gpio_log, &device.gpio_lines).map_err(|source| {
            RecordingError::WriteFailed {
                path: paths.gpio_log.clone(),
                source,
            }
        })?;

        let metadata = initial_metadata(subject_id, settings, &downsampler, &paths, &start_time);
        if let Err(source) = metadata.write_atomic(&paths.metadata) {
            drop(gpio);
            remove_quietly(&paths.gpio_log);
            return Err(RecordingError::WriteFailed {
                path: paths.metadata.clone(),
                source,
            });
        }

        let input = RawVideoInput {
            width: downsampler.output_width(),
            height: downsampler.output_height(),
            pixel_format: device.pixel_format,
            fps: settings.fps,
        };
        let encoder = match EncoderPipe::spawn(&settings.encoder, input, &paths.video) {
            Ok(encoder) => encoder,
            Err(e) => {
                log::error!("[Recorder] {}: encoder failed to start: {}", settings.camera_id, e);
                drop(gpio);
                remove_quietly(&paths.gpio_log);
                remove_quietly(&paths.metadata);
                return Err(RecordingError::EncoderStart(e));
            }
        };

        log::info!(
            "[Recorder] {} armed: {} ({}x{}, downsampling {})",
            settings.camera_id,
            paths.stem,
            input.width,
            input.height,
            downsampler.factor()
        );

        self.generation += 1;
        self.status = RecordingStatus::Armed;
        self.active = Some(ActiveRecording {
            paths: paths.clone(),
            metadata,
            encoder,
            gpio,
            downsampler,
            recorded: 0,
            dropped: 0,
        });

        Ok(paths)
    }

    /// Record one drained batch, in arrival order
    ///
    /// Returns the number of frames written. While idle the batch is ignored.
    /// On any failure the recording is finalized before the error is returned.
    pub fn write_frames(&mut self, frames: &[Frame], newly_dropped: u64) -> Result<usize> {
        let Some(active) = self.active.as_mut() else {
            return Ok(0);
        };

        active.dropped += newly_dropped;
        let mut failure = None;
        let mut written = 0;

        for frame in frames {
            let pixels = active.downsampler.apply(&frame.pixels);
            if let Err(e) = active.encoder.write_frame(&pixels) {
                failure = Some(RecordingError::EncodeFailed(e));
                break;
            }
            active.recorded += 1;
            written += 1;

            // The frame is in the video now; its row must follow even if the log fails
            if let Err(source) = active.gpio.append(&frame.gpio) {
                failure = Some(RecordingError::WriteFailed {
                    path: active.paths.gpio_log.clone(),
                    source,
                });
                break;
            }

            if active.recorded % 300 == 0 {
                log::debug!(
                    "[Recorder] {}: {} frames recorded, {} dropped",
                    active.metadata.camera_id,
                    active.recorded,
                    active.dropped
                );
            }
        }

        if written > 0 && self.status == RecordingStatus::Armed {
            self.status = RecordingStatus::Recording;
        }

        if failure.is_none() {
            if let Err(source) = active.gpio.flush() {
                failure = Some(RecordingError::WriteFailed {
                    path: active.paths.gpio_log.clone(),
                    source,
                });
            }
        }

        match failure {
            None => Ok(written),
            Some(cause) => {
                log::error!(
                    "[Recorder] {}: {}; finalizing recording",
                    active.metadata.camera_id,
                    cause
                );
                self.finalize(Some(cause)).map(|_| written)
            }
        }
    }

    /// Close the encoder and finalize all files. A no-op returning `None` while idle.
    ///
    /// A failure while closing (non-zero encoder exit, I/O error) is returned
    /// after the files have been finalized; the summary is still available
    /// through [`last_summary`](Self::last_summary).
    pub fn stop_recording(&mut self) -> Result<Option<RecordingSummary>> {
        self.finalize(None)
    }

    /// End the active recording because of an outside failure (device fault).
    /// The cause is recorded in the metadata and returned once the files are closed.
    pub fn abort(&mut self, cause: RecordingError) -> Result<Option<RecordingSummary>> {
        if self.active.is_none() {
            return Ok(None);
        }
        self.finalize(Some(cause))
    }

    /// Stopping -> Idle. Fails with the error that ended the recording, if any.
    fn finalize(&mut self, cause: Option<RecordingError>) -> Result<Option<RecordingSummary>> {
        let Some(active) = self.active.take() else {
            self.status = RecordingStatus::Idle;
            return cause.map_or(Ok(None), Err);
        };
        self.status = RecordingStatus::Stopping;

        let ActiveRecording {
            paths,
            mut metadata,
            encoder,
            gpio,
            recorded,
            dropped,
            ..
        } = active;

        let mut error = cause;

        if let Err(finish_error) = encoder.finish() {
            // A broken pipe is the symptom; the exit status is the cause
            let replaces = matches!(
                error,
                None | Some(RecordingError::EncodeFailed(EncoderError::Pipe(_)))
            );
            if replaces {
                error = Some(RecordingError::EncodeFailed(finish_error));
            } else {
                log::warn!("[Recorder] Encoder also failed while closing: {}", finish_error);
            }
        }

        if let Err(source) = gpio.finish() {
            log::error!("[Recorder] Failed to close GPIO log: {}", source);
            if error.is_none() {
                error = Some(RecordingError::WriteFailed {
                    path: paths.gpio_log.clone(),
                    source,
                });
            }
        }

        let end_time = format_timestamp(&Local::now());
        metadata.recorded_frame_count = recorded;
        metadata.dropped_frame_count = dropped;
        metadata.end_time = Some(end_time.clone());
        metadata.status = if error.is_some() {
            RecordingOutcome::Failed
        } else {
            RecordingOutcome::Complete
        };
        metadata.error = error.as_ref().map(|e| e.to_string());

        if let Err(source) = metadata.write_atomic(&paths.metadata) {
            log::error!("[Recorder] Failed to rewrite metadata: {}", source);
            if error.is_none() {
                error = Some(RecordingError::WriteFailed {
                    path: paths.metadata.clone(),
                    source,
                });
            }
        }

        let summary = RecordingSummary {
            recording_id: metadata.recording_id.clone(),
            subject_id: metadata.subject_id.clone(),
            camera_id: metadata.camera_id.clone(),
            paths,
            recorded_frame_count: recorded,
            dropped_frame_count: dropped,
            start_time: metadata.start_time.clone(),
            end_time,
            error: error.as_ref().map(|e| e.to_string()),
        };

        match &error {
            None => log::info!(
                "[Recorder] {} stopped: {} ({} frames, {} dropped)",
                summary.camera_id,
                summary.paths.stem,
                recorded,
                dropped
            ),
            Some(e) => log::error!(
                "[Recorder] {} stopped with error: {} ({} frames, {} dropped): {}",
                summary.camera_id,
                summary.paths.stem,
                recorded,
                dropped,
                e
            ),
        }

        self.last_summary = Some(summary.clone());
        self.status = RecordingStatus::Idle;
        match error {
            None => Ok(Some(summary)),
            Some(e) => Err(e),
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.active.is_some() {
            log::warn!("[Recorder] Session dropped while recording, finalizing");
            let _ = self.finalize(None);
        }
    }
}

fn initial_metadata(
    subject_id: &str,
    settings: &RecordingSettings,
    downsampler: &Downsampler,
    paths: &SessionPaths,
    start_time: &DateTime<Local>,
) -> SessionMetadata {
    let device = &settings.device;
    SessionMetadata {
        recording_id: uuid::Uuid::new_v4().to_string(),
        subject_id: subject_id.to_string(),
        camera_id: settings.camera_id.clone(),
        camera_name: settings.camera_name.clone(),
        fps: settings.fps,
        exposure_us: settings.exposure_us,
        gain_db: settings.gain_db,
        pixel_format: device.pixel_format,
        downsampling_factor: downsampler.factor(),
        frame_width: downsampler.output_width(),
        frame_height: downsampler.output_height(),
        device_model: device.model.clone(),
        serial_number: device.serial_number.clone(),
        gpio_lines: device.gpio_lines.clone(),
        encoder: EncoderInfo {
            codec: settings.encoder.codec,
            quality: settings.encoder.quality,
            preset: settings.encoder.preset.clone(),
        },
        video_file: SessionPaths::file_name(&paths.video),
        gpio_file: SessionPaths::file_name(&paths.gpio_log),
        recorded_frame_count: 0,
        dropped_frame_count: 0,
        start_time: format_timestamp(start_time),
        end_time: None,
        status: RecordingOutcome::Recording,
        error: None,
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("[Recorder] Could not remove {}: {}", path.display(), e);
    }
}
