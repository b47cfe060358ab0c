// Synthetic camera for the Generic backend
//
// Produces a moving gradient at the configured frame rate, driven by wall-clock
// time. Like real hardware it only keeps `ring_capacity` undelivered frames;
// draining too slowly overwrites the oldest ones and leaves sequence gaps.

use std::sync::Arc;
use std::time::Instant;

use super::{default_gpio_line_names, CameraDevice, DeviceError, DeviceInfo, Frame, GpioState, Result};
use crate::config::CameraConfig;

pub struct SyntheticCamera {
    info: DeviceInfo,
    fps: f64,
    ring_capacity: usize,
    started: Option<Instant>,
    /// Next sequence number that has not been delivered yet
    next_sequence: u64,
    overwritten: u64,
}

impl SyntheticCamera {
    pub fn new(info: DeviceInfo, fps: f64, ring_capacity: usize) -> Self {
        Self {
            info,
            fps,
            ring_capacity: ring_capacity.max(1),
            started: None,
            next_sequence: 1,
            overwritten: 0,
        }
    }

    pub fn from_config(config: &CameraConfig) -> Result<Self> {
        config.validate().map_err(DeviceError::Config)?;
        let info = DeviceInfo {
            model: "CamRig Synthetic".to_string(),
            serial_number: config
                .serial_number
                .clone()
                .unwrap_or_else(|| format!("SYN-{}", config.id)),
            width: config.width,
            height: config.height,
            pixel_format: config.pixel_format,
            gpio_lines: default_gpio_line_names(config.gpio_lines),
        };
        Ok(Self::new(info, config.fps, config.ring_capacity))
    }

    /// Frames lost to ring overruns since capture began
    pub fn overwritten_frames(&self) -> u64 {
        self.overwritten
    }

    fn render(&self, sequence_number: u64) -> Frame {
        let size = self.info.frame_size();
        let shift = sequence_number as usize;
        let data: Vec<u8> = (0..size).map(|i| ((i + shift) & 0xFF) as u8).collect();
        let timestamp_ns = ((sequence_number - 1) as f64 / self.fps * 1e9) as u64;

        Frame {
            sequence_number,
            timestamp_ns,
            pixels: Arc::from(data),
            // Lines follow the binary counter of the sequence number
            gpio: GpioState::from_bits(sequence_number as u32, self.info.n_gpio()),
        }
    }
}

impl CameraDevice for SyntheticCamera {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn begin_capturing(&mut self) -> Result<()> {
        self.started = Some(Instant::now());
        self.next_sequence = 1;
        self.overwritten = 0;
        log::info!(
            "[Camera] Synthetic {} capturing {}x{} @ {} fps",
            self.info.serial_number,
            self.info.width,
            self.info.height,
            self.fps
        );
        Ok(())
    }

    fn stop_capturing(&mut self) -> Result<()> {
        self.started = None;
        Ok(())
    }

    fn drain(&mut self) -> Result<Vec<Frame>> {
        let started = self.started.ok_or(DeviceError::NotCapturing)?;
        let produced = (started.elapsed().as_secs_f64() * self.fps).floor() as u64;
        if produced < self.next_sequence {
            return Ok(Vec::new());
        }

        let oldest_kept = produced
            .saturating_sub(self.ring_capacity as u64 - 1)
            .max(self.next_sequence);
        self.overwritten += oldest_kept - self.next_sequence;

        let frames = (oldest_kept..=produced).map(|seq| self.render(seq)).collect();
        self.next_sequence = produced + 1;
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::PixelFormat;
    use std::time::Duration;

    fn camera(fps: f64, ring: usize) -> SyntheticCamera {
        let info = DeviceInfo {
            model: "test".into(),
            serial_number: "1".into(),
            width: 8,
            height: 4,
            pixel_format: PixelFormat::Gray8,
            gpio_lines: default_gpio_line_names(2),
        };
        SyntheticCamera::new(info, fps, ring)
    }

    #[test]
    fn drain_before_begin_is_an_error() {
        let mut cam = camera(30.0, 8);
        assert!(matches!(cam.drain(), Err(DeviceError::NotCapturing)));
    }

    #[test]
    fn frames_are_consecutive_and_sized() {
        let mut cam = camera(200.0, 1000);
        cam.begin_capturing().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let first = cam.drain().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let second = cam.drain().unwrap();

        let seqs: Vec<u64> = first.iter().chain(second.iter()).map(|f| f.sequence_number).collect();
        assert!(!seqs.is_empty());
        assert_eq!(seqs[0], 1);
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        assert!(first.iter().all(|f| f.pixels.len() == 32));
        assert_eq!(first[0].gpio, GpioState::from_bits(1, 2));
    }

    #[test]
    fn slow_draining_overwrites_oldest_frames() {
        let mut cam = camera(500.0, 4);
        cam.begin_capturing().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let frames = cam.drain().unwrap();

        assert_eq!(frames.len(), 4);
        assert!(frames[0].sequence_number > 1);
        assert_eq!(cam.overwritten_frames(), frames[0].sequence_number - 1);
    }
}
