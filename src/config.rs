//! Vision configuration
//!
//! Everything the UI layer can set: which camera, what resolution, which
//! annotation passes run, how recovery backs off, and loop pacing. Loaded from
//! TOML; every field has a default so partial files are fine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::video::device::{Backend, DEFAULT_VERIFY_ATTEMPTS};
use crate::video::{Result, VisionError};

/// Camera device parameters. Only changeable while the device is stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Camera index (`/dev/video{index}` on Linux)
    pub index: u32,
    /// Requested width in pixels
    pub width: u32,
    /// Requested height in pixels
    pub height: u32,
    /// Requested frame rate
    pub frame_rate: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

impl DeviceConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn set_resolution(&mut self, resolution: Resolution) {
        self.width = resolution.width;
        self.height = resolution.height;
    }

    /// Minimum time between two captured frames at the requested frame rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.frame_rate.max(1)))
    }
}

/// `WIDTHxHEIGHT` resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const DEFAULT: Resolution = Resolution { width: 640, height: 480 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse, falling back to 640x480 on malformed input
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or(Self::DEFAULT)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for Resolution {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || VisionError::InvalidConfig(format!("resolution '{}' is not WIDTHxHEIGHT", s));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Camera index from a UI label such as "Camera 2". "Default" and anything unparsable map to 0.
pub fn parse_camera_label(label: &str) -> u32 {
    label
        .split_whitespace()
        .last()
        .and_then(|last| last.parse().ok())
        .unwrap_or(0)
}

/// Annotation feature toggles. Take effect on the next processing iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub face_detection: bool,
    pub emotion_detection: bool,
    pub gesture_detection: bool,
    /// Draw annotations onto frames handed to `on_frame`
    pub debug_overlay: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            face_detection: true,
            emotion_detection: false,
            gesture_detection: false,
            debug_overlay: false,
        }
    }
}

/// How the capture loop reopens a stalled device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Backends tried in order during a recovery cycle
    pub backends: Vec<Backend>,
    /// Last-resort backend tried after `final_backoff_ms`
    pub fallback: Option<Backend>,
    /// Consecutive read failures that trigger a recovery cycle
    pub failure_threshold: u32,
    /// Delay before each backend attempt
    pub backoff_ms: u64,
    /// Longer delay before the last-resort attempt
    pub final_backoff_ms: u64,
    /// Reads allowed to verify a freshly opened device
    pub verify_attempts: u32,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            backends: vec![Backend::V4l2Mmap, Backend::V4l2UserPtr],
            fallback: Some(Backend::Auto),
            failure_threshold: 5,
            backoff_ms: 500,
            final_backoff_ms: 2000,
            verify_attempts: DEFAULT_VERIFY_ATTEMPTS,
        }
    }
}

impl RecoverySettings {
    /// Backend used by `start`
    pub fn primary_backend(&self) -> Option<Backend> {
        self.backends.first().copied().or(self.fallback)
    }
}

/// Loop pacing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopTiming {
    /// Minimum sleep between capture iterations
    pub capture_interval_ms: u64,
    /// Sleep between processing iterations
    pub processing_interval_ms: u64,
    /// Poll interval while parked in the error state
    pub park_interval_ms: u64,
    /// Upper bound on how long `stop` waits for each loop
    pub stop_timeout_ms: u64,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            capture_interval_ms: 5,
            processing_interval_ms: 10,
            park_interval_ms: 100,
            stop_timeout_ms: 2000,
        }
    }
}

impl LoopTiming {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn park_interval(&self) -> Duration {
        Duration::from_millis(self.park_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Complete vision configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub device: DeviceConfig,
    pub features: FeatureFlags,
    pub recovery: RecoverySettings,
    pub timing: LoopTiming,
}

impl VisionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: VisionConfig =
            toml::from_str(s).map_err(|e| VisionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| VisionError::InvalidConfig(e.to_string()))
    }

    /// Reject settings the loops cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.device.width == 0 || self.device.height == 0 {
            return Err(VisionError::InvalidConfig("resolution must be non-zero".to_string()));
        }
        if self.device.frame_rate == 0 {
            return Err(VisionError::InvalidConfig("frame rate must be non-zero".to_string()));
        }
        if self.recovery.failure_threshold == 0 {
            return Err(VisionError::InvalidConfig("failure threshold must be at least 1".to_string()));
        }
        if self.recovery.primary_backend().is_none() {
            return Err(VisionError::InvalidConfig("no capture backend configured".to_string()));
        }
        Ok(())
    }
}
