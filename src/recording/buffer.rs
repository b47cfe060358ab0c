// Frame buffer: drains a camera device and accounts for dropped frames
//
// One FrameBuffer exists per attached device. Its poll() is called from the
// camera's polling thread on a fixed cadence and must never block; an empty
// batch simply means nothing new arrived since the last poll.

use std::time::{Duration, Instant};

use crate::devices::{CameraDevice, DeviceError, Frame};

/// Window of steady delivery before the frame rate is judged
const FPS_CHECK_WINDOW: Duration = Duration::from_secs(5);

/// Delivered rate below this share of the expected rate triggers a warning
const FPS_WARNING_RATIO: f64 = 0.75;

/// Counts frames lost between consecutive sequence numbers
#[derive(Debug, Default)]
pub struct DropDetector {
    last_sequence: Option<u64>,
    dropped: u64,
    reorders: u64,
}

impl DropDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one delivered frame and return how many frames were lost
    /// right before it. Non-increasing sequence numbers never count as drops.
    pub fn observe(&mut self, sequence_number: u64) -> u64 {
        let gap = match self.last_sequence {
            Some(last) if sequence_number > last => sequence_number - last - 1,
            Some(last) => {
                self.reorders += 1;
                // Rate-limit warnings: log first, then every 100th occurrence
                if self.reorders == 1 || self.reorders % 100 == 0 {
                    log::warn!(
                        "[Camera] Sequence number went from {} to {} ({} times); check device configuration",
                        last,
                        sequence_number,
                        self.reorders
                    );
                }
                0
            }
            None => 0,
        };
        self.last_sequence = Some(sequence_number);
        self.dropped += gap;
        gap
    }

    /// Total frames lost since the detector was created
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Out-of-order sequence numbers seen
    pub fn reorders(&self) -> u64 {
        self.reorders
    }
}

/// Watches the delivered frame rate and warns once when it falls well short
/// of the requested rate.
#[derive(Debug)]
pub struct FpsMonitor {
    expected_fps: f64,
    total_frames: u64,
    window_start: Option<Instant>,
    frames_at_window_start: u64,
    warning_emitted: bool,
}

impl FpsMonitor {
    pub fn new(expected_fps: f64) -> Self {
        Self {
            expected_fps,
            total_frames: 0,
            window_start: None,
            frames_at_window_start: 0,
            warning_emitted: false,
        }
    }

    pub fn record(&mut self, frames: u64) {
        self.total_frames += frames;
    }

    /// Returns the measured rate (one decimal) the first time it is too low
    pub fn check(&mut self) -> Option<f64> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> Option<f64> {
        if self.warning_emitted || self.total_frames == 0 {
            return None;
        }

        // Start the measurement window from the first frame, not from attach
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            self.frames_at_window_start = self.total_frames;
            return None;
        };

        let elapsed = now.saturating_duration_since(start);
        if elapsed < FPS_CHECK_WINDOW {
            return None;
        }

        let frames_in_window = self.total_frames - self.frames_at_window_start;
        let actual_fps = frames_in_window as f64 / elapsed.as_secs_f64();

        if actual_fps < self.expected_fps * FPS_WARNING_RATIO {
            self.warning_emitted = true;
            Some((actual_fps * 10.0).round() / 10.0)
        } else {
            None
        }
    }
}

/// Frames drained by one poll
#[derive(Debug, Default)]
pub struct FrameBatch {
    /// In arrival order
    pub frames: Vec<Frame>,
    /// Frames lost between the previous poll's last frame and this batch's last frame
    pub newly_dropped: u64,
}

impl FrameBatch {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The frame a live preview should show
    pub fn newest(&self) -> Option<&Frame> {
        self.frames.last()
    }
}

/// Per-device drain state
pub struct FrameBuffer {
    detector: DropDetector,
    fps: FpsMonitor,
    frames_drained: u64,
}

impl FrameBuffer {
    pub fn new(expected_fps: f64) -> Self {
        Self {
            detector: DropDetector::new(),
            fps: FpsMonitor::new(expected_fps),
            frames_drained: 0,
        }
    }

    /// Drain whatever the device has and account for gaps.
    /// A device error is returned as-is; the caller treats it as a fault.
    pub fn poll(&mut self, device: &mut dyn CameraDevice) -> Result<FrameBatch, DeviceError> {
        let frames = device.drain()?;
        let newly_dropped = frames
            .iter()
            .map(|f| self.detector.observe(f.sequence_number))
            .sum();
        self.frames_drained += frames.len() as u64;
        self.fps.record(frames.len() as u64);
        Ok(FrameBatch { frames, newly_dropped })
    }

    pub fn dropped_frames(&self) -> u64 {
        self.detector.dropped()
    }

    pub fn frames_drained(&self) -> u64 {
        self.frames_drained
    }

    /// See [`FpsMonitor::check`]
    pub fn check_fps(&mut self) -> Option<f64> {
        self.fps.check()
    }
}
