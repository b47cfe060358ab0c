#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camrig_lib::devices::{
    default_gpio_line_names, CameraDevice, DeviceError, DeviceInfo, Frame, GpioState,
};
use camrig_lib::encoding::{EncoderSettings, PixelFormat};
use camrig_lib::recording::CameraEvent;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

/// Encoder stand-in that copies stdin to the output path (the last argument)
pub const CAT_ENCODER: &str = r#"for last; do :; done; cat > "$last""#;

pub type Feed = Arc<Mutex<VecDeque<Result<Vec<Frame>, DeviceError>>>>;

/// Device whose drains are scripted by the test. An exhausted feed drains empty.
pub struct FeedCamera {
    info: DeviceInfo,
    feed: Feed,
}

impl CameraDevice for FeedCamera {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn begin_capturing(&mut self) -> camrig_lib::devices::Result<()> {
        Ok(())
    }

    fn stop_capturing(&mut self) -> camrig_lib::devices::Result<()> {
        Ok(())
    }

    fn drain(&mut self) -> camrig_lib::devices::Result<Vec<Frame>> {
        self.feed.lock().pop_front().unwrap_or(Ok(Vec::new()))
    }
}

pub fn device_info(width: u32, height: u32, gpio_lines: usize) -> DeviceInfo {
    DeviceInfo {
        model: "Feed".into(),
        serial_number: "FEED-1".into(),
        width,
        height,
        pixel_format: PixelFormat::Gray8,
        gpio_lines: default_gpio_line_names(gpio_lines),
    }
}

pub fn feed_camera(info: DeviceInfo) -> (FeedCamera, Feed) {
    let feed: Feed = Arc::new(Mutex::new(VecDeque::new()));
    (
        FeedCamera {
            info,
            feed: feed.clone(),
        },
        feed,
    )
}

/// Frames with the given sequence numbers; GPIO lines carry the sequence bits
pub fn frames(info: &DeviceInfo, seqs: &[u64]) -> Vec<Frame> {
    seqs.iter()
        .map(|&seq| Frame {
            sequence_number: seq,
            timestamp_ns: seq * 33_333_333,
            pixels: Arc::from(vec![seq as u8; info.frame_size()]),
            gpio: GpioState::from_bits(seq as u32, info.n_gpio()),
        })
        .collect()
}

/// Encoder settings that run `script` under `sh`; the output path is the last argument
pub fn script_encoder(script: &str) -> EncoderSettings {
    EncoderSettings {
        program: PathBuf::from("sh"),
        program_args: vec!["-c".into(), script.into(), "encoder".into()],
        finish_timeout_secs: 20,
        ..EncoderSettings::default()
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Wait for the first event `pick` accepts, skipping the rest
pub fn wait_for_event<T>(
    events: &Receiver<CameraEvent>,
    timeout: Duration,
    mut pick: impl FnMut(CameraEvent) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events.recv_timeout(remaining).ok()?;
        if let Some(value) = pick(event) {
            return Some(value);
        }
    }
}

/// Data rows of a GPIO log (header excluded)
pub fn gpio_rows(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}
