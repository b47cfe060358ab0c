// Recording modules

pub mod buffer;
pub mod coordinator;
pub mod downsample;
pub mod pool;
pub mod session;

pub use buffer::{DropDetector, FpsMonitor, FrameBatch, FrameBuffer};
pub use coordinator::{CameraEvent, CameraStats, CoordinatorSettings, RecordingCoordinator};
pub use downsample::Downsampler;
pub use pool::{Job, SerialQueue, WorkerPool};
pub use session::{RecordingError, RecordingSession, RecordingSettings, RecordingSummary};

use serde::{Deserialize, Serialize};

/// Recording state of one camera
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Ready to record
    Idle,
    /// Files open and encoder running, no frame written yet
    Armed,
    /// At least one frame written
    Recording,
    /// Closing the encoder and finalizing files
    Stopping,
}

impl Default for RecordingStatus {
    fn default() -> Self {
        Self::Idle
    }
}
