//! Non-blocking adapter for blocking camera SDKs
//!
//! Many vendor SDKs only offer a GetNextImage-style call that blocks until a
//! frame arrives. `ThreadedDevice` runs such a source on its own capture thread
//! which appends completed frames to a bounded channel; `drain()` then reads
//! that channel without ever blocking the polling loop.
//!
//! When the channel is full the newest frame is discarded. The device's own
//! sequence numbers then skip, so the loss shows up in normal drop accounting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, TryRecvError, TrySendError};

use super::{CameraDevice, DeviceError, DeviceInfo, Frame, Result};

/// How long one blocking wait may last before the stop flag is checked again
const NEXT_FRAME_TIMEOUT: Duration = Duration::from_millis(100);

/// A camera whose frame retrieval blocks
pub trait BlockingSource: Send + 'static {
    fn info(&self) -> DeviceInfo;

    fn start(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next frame. `Ok(None)` means the wait timed out.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>>;

    fn stop(&mut self) -> Result<()>;
}

/// Messages sent from the capture thread
enum CaptureMessage {
    Frame(Frame),
    Fault(DeviceError),
}

pub struct ThreadedDevice<S: BlockingSource> {
    info: DeviceInfo,
    source: Option<S>,
    capacity: usize,
    receiver: Option<Receiver<CaptureMessage>>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<S>>,
    discarded: Arc<AtomicU64>,
    /// Fault seen while frames were still being returned; reported on the next drain
    pending_fault: Option<DeviceError>,
}

impl<S: BlockingSource> ThreadedDevice<S> {
    /// Wrap `source`; `capacity` bounds the frames held between two drains
    pub fn new(source: S, capacity: usize) -> Self {
        Self {
            info: source.info(),
            source: Some(source),
            capacity: capacity.max(1),
            receiver: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
            discarded: Arc::new(AtomicU64::new(0)),
            pending_fault: None,
        }
    }

    /// Frames discarded because the queue was full
    pub fn discarded_frames(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    fn capture_loop(
        mut source: S,
        sender: crossbeam_channel::Sender<CaptureMessage>,
        stop_flag: Arc<AtomicBool>,
        discarded: Arc<AtomicU64>,
    ) -> S {
        while !stop_flag.load(Ordering::SeqCst) {
            match source.next_frame(NEXT_FRAME_TIMEOUT) {
                Ok(Some(frame)) => match sender.try_send(CaptureMessage::Frame(frame)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        discarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                },
                Ok(None) => {}
                Err(e) => {
                    log::error!("[Camera] Capture thread stopping: {}", e);
                    // If the queue is full the disconnect itself reports the fault
                    let _ = sender.try_send(CaptureMessage::Fault(e));
                    break;
                }
            }
        }

        if let Err(e) = source.stop() {
            log::warn!("[Camera] Failed to stop source: {}", e);
        }
        source
    }
}

impl<S: BlockingSource> CameraDevice for ThreadedDevice<S> {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn begin_capturing(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let mut source = self
            .source
            .take()
            .ok_or_else(|| DeviceError::Stream("source lost by a previous capture thread".into()))?;

        if let Err(e) = source.start() {
            self.source = Some(source);
            return Err(e);
        }

        let (sender, receiver) = bounded(self.capacity);
        self.stop_flag.store(false, Ordering::SeqCst);
        self.pending_fault = None;
        let stop_flag = self.stop_flag.clone();
        let discarded = self.discarded.clone();

        let handle = std::thread::Builder::new()
            .name(format!("camrig-capture-{}", self.info.serial_number))
            .spawn(move || Self::capture_loop(source, sender, stop_flag, discarded))
            .map_err(|e| DeviceError::Stream(format!("Failed to spawn capture thread: {}", e)))?;

        self.receiver = Some(receiver);
        self.thread = Some(handle);
        Ok(())
    }

    fn stop_capturing(&mut self) -> Result<()> {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.receiver = None;
        if let Some(handle) = self.thread.take() {
            let source = handle
                .join()
                .map_err(|_| DeviceError::Stream("capture thread panicked".into()))?;
            self.source = Some(source);
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<Vec<Frame>> {
        if let Some(fault) = self.pending_fault.take() {
            return Err(fault);
        }
        let receiver = self.receiver.as_ref().ok_or(DeviceError::NotCapturing)?;

        let mut frames = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(CaptureMessage::Frame(frame)) => frames.push(frame),
                Ok(CaptureMessage::Fault(e)) => {
                    if frames.is_empty() {
                        return Err(e);
                    }
                    self.pending_fault = Some(e);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    let fault = DeviceError::Disconnected(format!(
                        "capture thread for {} exited",
                        self.info.serial_number
                    ));
                    if frames.is_empty() {
                        return Err(fault);
                    }
                    self.pending_fault = Some(fault);
                    break;
                }
            }
        }
        Ok(frames)
    }
}

impl<S: BlockingSource> Drop for ThreadedDevice<S> {
    fn drop(&mut self) {
        let _ = self.stop_capturing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{default_gpio_line_names, GpioState};
    use crate::encoding::PixelFormat;

    /// Blocks 2ms per frame and fails after `fail_after` frames
    struct SlowSource {
        next: u64,
        fail_after: Option<u64>,
    }

    impl BlockingSource for SlowSource {
        fn info(&self) -> DeviceInfo {
            DeviceInfo {
                model: "blocking".into(),
                serial_number: "B1".into(),
                width: 2,
                height: 2,
                pixel_format: PixelFormat::Gray8,
                gpio_lines: default_gpio_line_names(1),
            }
        }

        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>> {
            if self.fail_after.is_some_and(|n| self.next > n) {
                return Err(DeviceError::Stream("cable pulled".into()));
            }
            std::thread::sleep(Duration::from_millis(2));
            self.next += 1;
            Ok(Some(Frame {
                sequence_number: self.next,
                timestamp_ns: self.next * 1_000,
                pixels: Arc::from(vec![0u8; 4]),
                gpio: GpioState::from_bits(0, 1),
            }))
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn drain_collects_frames_without_blocking() {
        let mut device = ThreadedDevice::new(SlowSource { next: 0, fail_after: None }, 1000);
        assert!(matches!(device.drain(), Err(DeviceError::NotCapturing)));

        device.begin_capturing().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let frames = device.drain().unwrap();
        assert!(!frames.is_empty());
        assert!(frames.windows(2).all(|w| w[1].sequence_number == w[0].sequence_number + 1));

        device.stop_capturing().unwrap();
        // Source comes back and capture can restart
        device.begin_capturing().unwrap();
        device.stop_capturing().unwrap();
    }

    #[test]
    fn full_queue_discards_frames() {
        let mut device = ThreadedDevice::new(SlowSource { next: 0, fail_after: None }, 2);
        device.begin_capturing().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let frames = device.drain().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(device.discarded_frames() > 0);
    }

    #[test]
    fn source_error_surfaces_after_pending_frames() {
        let mut device = ThreadedDevice::new(SlowSource { next: 0, fail_after: Some(3) }, 16);
        device.begin_capturing().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let frames = device.drain().unwrap();
        assert_eq!(frames.len(), 3);
        assert!(matches!(device.drain(), Err(DeviceError::Stream(_))));
    }
}
