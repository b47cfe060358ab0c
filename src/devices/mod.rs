// Camera device capability and backend registry

pub mod synthetic;
pub mod threaded;

pub use synthetic::SyntheticCamera;
pub use threaded::{BlockingSource, ThreadedDevice};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::CameraConfig;
use crate::encoding::PixelFormat;

/// Maximum number of digital lines carried per frame
pub const MAX_GPIO_LINES: usize = 32;

/// Error type for camera device operations
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Stream not active")]
    NotCapturing,

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("{0:?} backend is not available in this build")]
    BackendUnavailable(CameraBackend),

    #[error("Invalid device configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Snapshot of the digital input lines captured with one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpioState {
    levels: u32,
    count: u8,
}

impl GpioState {
    /// Build from per-line levels (line 0 first). Lines past `MAX_GPIO_LINES` are ignored.
    pub fn from_levels(levels: &[bool]) -> Self {
        let count = levels.len().min(MAX_GPIO_LINES);
        let bits = levels
            .iter()
            .take(count)
            .enumerate()
            .fold(0u32, |acc, (i, &high)| if high { acc | (1 << i) } else { acc });
        Self {
            levels: bits,
            count: count as u8,
        }
    }

    /// Build from a bit mask, line 0 in the least significant bit
    pub fn from_bits(bits: u32, count: usize) -> Self {
        let count = count.min(MAX_GPIO_LINES);
        let mask = if count == MAX_GPIO_LINES { u32::MAX } else { (1u32 << count) - 1 };
        Self {
            levels: bits & mask,
            count: count as u8,
        }
    }

    pub fn line(&self, index: usize) -> bool {
        index < self.count as usize && self.levels & (1 << index) != 0
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bits(&self) -> u32 {
        self.levels
    }
}

/// One capture event as delivered by a device
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing per camera, assigned by the device
    pub sequence_number: u64,
    /// Device clock in nanoseconds
    pub timestamp_ns: u64,
    /// Raw pixel data, width × height × bytes-per-pixel
    pub pixels: Arc<[u8]>,
    /// Digital line levels latched with this frame
    pub gpio: GpioState,
}

/// Static description of an opened device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub serial_number: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Names of the digital lines, in the order they appear in `GpioState`
    pub gpio_lines: Vec<String>,
}

impl DeviceInfo {
    pub fn n_gpio(&self) -> usize {
        self.gpio_lines.len()
    }

    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

/// Default line names: Line0, Line1, ...
pub fn default_gpio_line_names(count: usize) -> Vec<String> {
    (0..count.min(MAX_GPIO_LINES)).map(|i| format!("Line{}", i)).collect()
}

/// The capability every camera backend provides to the acquisition core.
///
/// `drain()` must never block: it returns whatever frames arrived since the
/// last call, possibly none. Backends built on blocking SDK calls wrap them in
/// [`ThreadedDevice`].
pub trait CameraDevice: Send {
    fn info(&self) -> &DeviceInfo;

    fn begin_capturing(&mut self) -> Result<()>;

    fn stop_capturing(&mut self) -> Result<()>;

    /// Take all frames that became available since the previous call
    fn drain(&mut self) -> Result<Vec<Frame>>;

    fn get_width(&self) -> u32 {
        self.info().width
    }

    fn get_height(&self) -> u32 {
        self.info().height
    }

    fn n_gpio(&self) -> usize {
        self.info().n_gpio()
    }
}

/// Closed set of camera backends selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// FLIR/Teledyne Spinnaker SDK
    Spinnaker,
    /// UVC webcams
    Usb,
    /// Ximea xiAPI
    Ximea,
    /// Built-in synthetic test-pattern camera
    Generic,
}

impl CameraBackend {
    pub const ALL: &'static [CameraBackend] = &[
        CameraBackend::Spinnaker,
        CameraBackend::Usb,
        CameraBackend::Ximea,
        CameraBackend::Generic,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            CameraBackend::Spinnaker => "Spinnaker",
            CameraBackend::Usb => "USB",
            CameraBackend::Ximea => "Ximea",
            CameraBackend::Generic => "Generic",
        }
    }

    /// Whether this build can open devices of this backend
    pub fn is_available(&self) -> bool {
        matches!(self, CameraBackend::Generic)
    }
}

/// Open the device described by a camera configuration
pub fn open_device(config: &CameraConfig) -> Result<Box<dyn CameraDevice>> {
    match config.backend {
        CameraBackend::Generic => Ok(Box::new(SyntheticCamera::from_config(config)?)),
        // Vendor SDK bindings live outside this crate
        other => Err(DeviceError::BackendUnavailable(other)),
    }
}
