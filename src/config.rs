// Configuration management for CamRig

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::devices::CameraBackend;
use crate::encoding::{EncoderSettings, PixelFormat};
use crate::session::sanitize_device_name;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root folder for recordings; each camera records into its own subfolder
    #[serde(default = "get_default_save_root")]
    pub save_root: PathBuf,

    /// Polling cadence of each camera's drain loop, in Hz
    #[serde(default = "default_poll_hz")]
    pub poll_hz: u32,

    /// Threads in the shared write-behind pool
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Pending write batches per camera before a backpressure warning is raised
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,

    /// External encoder settings shared by all cameras
    #[serde(default)]
    pub encoder: EncoderSettings,

    /// Cameras to open at startup
    #[serde(default = "default_cameras")]
    pub cameras: Vec<CameraConfig>,
}

/// Per-camera acquisition and recording settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    /// Stable identifier used by the coordinator
    pub id: String,

    /// Human-readable name (also used for the recording subfolder)
    pub name: String,

    pub backend: CameraBackend,

    /// Serial number to open, for backends that enumerate several devices
    #[serde(default)]
    pub serial_number: Option<String>,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Requested frame rate
    #[serde(default = "default_fps")]
    pub fps: f64,

    /// Requested exposure in microseconds (None = device auto)
    #[serde(default)]
    pub exposure_us: Option<f64>,

    /// Requested gain in dB (None = device auto)
    #[serde(default)]
    pub gain_db: Option<f64>,

    #[serde(default)]
    pub pixel_format: PixelFormat,

    /// Keep every n-th pixel in both directions before encoding (1 = full resolution)
    #[serde(default = "default_downsampling_factor")]
    pub downsampling_factor: u32,

    /// Number of digital input lines captured with each frame
    #[serde(default = "default_gpio_lines")]
    pub gpio_lines: usize,

    /// Frames the device buffers internally before overwriting the oldest
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: "cam0".to_string(),
            name: "Camera 0".to_string(),
            backend: CameraBackend::Generic,
            serial_number: None,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            exposure_us: None,
            gain_db: None,
            pixel_format: PixelFormat::default(),
            downsampling_factor: default_downsampling_factor(),
            gpio_lines: default_gpio_lines(),
            ring_capacity: default_ring_capacity(),
        }
    }
}

impl CameraConfig {
    /// Check values that would make acquisition or encoding impossible
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("camera id must not be empty".into());
        }
        if self.width == 0 || self.height == 0 {
            return Err(format!("{}: frame size {}x{} is empty", self.id, self.width, self.height));
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(format!("{}: fps must be positive, got {}", self.id, self.fps));
        }
        if self.downsampling_factor == 0 {
            return Err(format!("{}: downsampling factor must be at least 1", self.id));
        }
        if self.ring_capacity == 0 {
            return Err(format!("{}: ring capacity must be at least 1", self.id));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save_root: get_default_save_root(),
            poll_hz: default_poll_hz(),
            worker_threads: default_worker_threads(),
            backpressure_threshold: default_backpressure_threshold(),
            encoder: EncoderSettings::default(),
            cameras: default_cameras(),
        }
    }
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(config_path, contents)?;

        Ok(())
    }

    /// Recording folder for one camera
    pub fn save_dir_for(&self, camera: &CameraConfig) -> PathBuf {
        self.save_root.join(sanitize_device_name(&camera.name))
    }
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("camrig")
        .join("config.toml")
}

/// Get the default storage path for recordings
fn get_default_save_root() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("CamRig")
}

fn default_poll_hz() -> u32 {
    30
}

fn default_worker_threads() -> usize {
    4
}

fn default_backpressure_threshold() -> usize {
    32
}

fn default_cameras() -> Vec<CameraConfig> {
    vec![CameraConfig::default()]
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_fps() -> f64 {
    30.0
}

fn default_downsampling_factor() -> u32 {
    1
}

fn default_gpio_lines() -> usize {
    4
}

fn default_ring_capacity() -> usize {
    64
}
