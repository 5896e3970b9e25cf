//! Camera capture and frame annotation
//!
//! This module owns the live camera pipeline:
//! - `device`: the camera handle and the driver trait backends plug into
//! - `buffer`: the single-slot, latest-wins frame buffer shared between loops
//! - `recovery`: ordered backend fallback used when the device stalls
//! - `capture` / `processing`: the two independently scheduled worker loops
//! - `input`: the `VisionSystem` façade consumed by the UI layer
//!
//! Linux uses V4L2 for capture. Every other platform can still drive the
//! pipeline through a custom [`device::CameraDriver`] (see `scripted`).

pub mod buffer;
pub(crate) mod capture;
pub mod device;
pub mod face;
pub mod input;
pub mod overlay;
pub mod processing;
pub mod recovery;
pub mod scripted;
pub mod signal;

// Linux uses V4L2 for camera capture
#[cfg(target_os = "linux")]
pub mod linux_input;

use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

use self::device::Backend;

/// Pixel layout of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 32-bit RGBA
    Rgba,
    /// 32-bit BGRA
    Bgra,
    /// 24-bit RGB
    Rgb,
    /// 8-bit luma
    Gray,
}

impl PixelFormat {
    /// Bytes per pixel for this layout
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
            PixelFormat::Rgb => 3,
            PixelFormat::Gray => 1,
        }
    }
}

/// One captured image. Immutable once it leaves the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel layout of `data`
    pub pixel_format: PixelFormat,
    /// Raw pixel data, row-major, no padding
    pub data: Vec<u8>,
    /// Capture timestamp in nanoseconds since the Unix epoch
    pub timestamp_ns: u64,
}

impl VideoFrame {
    /// Create a new video frame
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat, data: Vec<u8>, timestamp_ns: u64) -> Self {
        Self {
            width,
            height,
            pixel_format,
            data,
            timestamp_ns,
        }
    }

    /// Create a black RGBA frame (for placeholders)
    pub fn black(width: u32, height: u32) -> Self {
        Self::solid(width, height, 0)
    }

    /// Create an RGBA frame where every colour channel holds `level`
    pub fn solid(width: u32, height: u32, level: u8) -> Self {
        let len = width as usize * height as usize * 4;
        let mut data = vec![level; len];
        for px in data.chunks_exact_mut(4) {
            px[3] = 255;
        }
        Self::new(width, height, PixelFormat::Rgba, data, now_ns())
    }

    /// Number of bytes a frame with these dimensions and layout must carry
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }

    /// A frame is valid when it has a non-zero size and a full pixel buffer
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }

    /// Convert to an RGBA image buffer (for saving snapshots or display)
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        if !self.is_valid() {
            return None;
        }
        let rgba = match self.pixel_format {
            PixelFormat::Rgba => self.data.clone(),
            PixelFormat::Bgra => {
                let mut data = self.data.clone();
                for px in data.chunks_exact_mut(4) {
                    px.swap(0, 2);
                }
                data
            }
            PixelFormat::Rgb => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[0], px[1], px[2], 255])
                .collect(),
            PixelFormat::Gray => self.data.iter().flat_map(|&l| [l, l, l, 255]).collect(),
        };
        RgbaImage::from_raw(self.width, self.height, rgba)
    }

    /// Grayscale derivation used by the annotation passes
    pub fn to_gray_image(&self) -> Option<GrayImage> {
        if self.pixel_format == PixelFormat::Gray {
            if !self.is_valid() {
                return None;
            }
            return GrayImage::from_raw(self.width, self.height, self.data.clone());
        }
        let rgba = self.to_rgba_image()?;
        Some(image::imageops::grayscale(&rgba))
    }
}

/// Wall-clock timestamp in nanoseconds
pub(crate) fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Camera state machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    /// Constructed, never started
    Initialized,
    /// Capturing frames
    Running,
    /// Reopening the device after a stall
    Recovering,
    /// Every backend failed; waiting for a manual recovery or stop
    Error,
    /// Stopped by the caller
    Stopped,
}

impl CameraStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            CameraStatus::Initialized => 0,
            CameraStatus::Running => 1,
            CameraStatus::Recovering => 2,
            CameraStatus::Error => 3,
            CameraStatus::Stopped => 4,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => CameraStatus::Initialized,
            1 => CameraStatus::Running,
            2 => CameraStatus::Recovering,
            4 => CameraStatus::Stopped,
            _ => CameraStatus::Error,
        }
    }

    /// Lower-case label shown in the status bar
    pub fn as_str(self) -> &'static str {
        match self {
            CameraStatus::Initialized => "initialized",
            CameraStatus::Running => "running",
            CameraStatus::Recovering => "recovering",
            CameraStatus::Error => "error",
            CameraStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned rectangle in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Center point (rounded down)
    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    /// Whether a point lies inside the rectangle
    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x && py >= self.y && px < self.x + self.width && py < self.y + self.height
    }
}

/// Snapshot of the vision pipeline, published to `on_info` consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionInfo {
    pub camera_status: CameraStatus,
    /// Frames captured during the last full one-second window
    pub fps: f32,
    /// Frames captured since the last successful start
    pub frame_count: u64,
    pub face_detected: bool,
    pub face_region: Option<Region>,
    /// Extension point: tag from the emotion pass
    pub emotion: Option<String>,
    /// Extension point: tag from the gesture pass
    pub gesture: Option<String>,
    /// Recovery cycles run since the last successful start
    pub recovery_attempts: u32,
    pub last_error: Option<String>,
    /// Sequence number of the newest frame the processing loop annotated
    pub processed_sequence: u64,
    /// Backend the device is currently open with
    pub backend: Option<Backend>,
}

impl Default for VisionInfo {
    fn default() -> Self {
        Self {
            camera_status: CameraStatus::Initialized,
            fps: 0.0,
            frame_count: 0,
            face_detected: false,
            face_region: None,
            emotion: None,
            gesture: None,
            recovery_attempts: 0,
            last_error: None,
            processed_sequence: 0,
            backend: None,
        }
    }
}

impl VisionInfo {
    /// JSON form for FFI / UI bridges
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Multi-line text for the info panel
    pub fn summary(&self) -> String {
        let mut out = format!("Status: {}\nFPS: {:.1}\n", self.camera_status, self.fps);
        match self.face_region {
            Some(r) if self.face_detected => {
                out.push_str(&format!("Face detected: yes ({}, {}, {}x{})\n", r.x, r.y, r.width, r.height));
            }
            _ => out.push_str("Face detected: no\n"),
        }
        if let Some(emotion) = &self.emotion {
            out.push_str(&format!("Emotion: {}\n", emotion));
        }
        if let Some(gesture) = &self.gesture {
            out.push_str(&format!("Gesture: {}\n", gesture));
        }
        if self.recovery_attempts > 0 {
            out.push_str(&format!("Recovery attempts: {}\n", self.recovery_attempts));
        }
        if let Some(err) = &self.last_error {
            out.push_str(&format!("Last error: {}\n", err));
        }
        out
    }
}

/// Vision error types
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    /// The backend could not open the camera at all
    #[error("camera {index} unavailable via {backend}: {reason}")]
    DeviceUnavailable {
        index: u32,
        backend: Backend,
        reason: String,
    },

    /// The camera opened but produced no valid frame
    #[error("camera {index} opened but returned no frames after {attempts} reads")]
    DeviceUnresponsive { index: u32, attempts: u32 },

    /// Reconfiguration attempted while the device is open or the loops are running
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),

    #[error("vision system is already running")]
    AlreadyRunning,

    #[error("vision system is not running")]
    NotRunning,

    /// Too many consecutive read failures; a recovery cycle follows
    #[error("camera stopped delivering frames ({failures} consecutive failures), recovering")]
    CaptureStalled { failures: u32 },

    /// Every backend failed during a recovery cycle
    #[error("camera recovery failed after trying {attempts} backends")]
    RecoveryExhausted { attempts: u32 },

    /// A recovery cycle was interrupted by stop
    #[error("recovery cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("camera capture is not supported on this platform")]
    UnsupportedPlatform,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using VisionError
pub type Result<T> = std::result::Result<T, VisionError>;
