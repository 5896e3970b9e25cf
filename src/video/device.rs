//! Camera device handle
//!
//! A [`CameraDriver`] is the raw platform binding (V4L2 on Linux, or a
//! scripted driver in tests). [`DeviceHandle`] wraps one and adds the rules the
//! rest of the pipeline relies on: verification reads after open, idempotent
//! close, and no reconfiguration while the device is open.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

use super::{Result, VideoFrame, VisionError};
use crate::config::DeviceConfig;

/// Distinct strategy for opening the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Driver default: no format negotiation, default I/O method
    Auto,
    /// V4L2 streaming through memory-mapped buffers
    V4l2Mmap,
    /// V4L2 streaming through user-pointer buffers
    V4l2UserPtr,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Auto => "auto",
            Backend::V4l2Mmap => "v4l2-mmap",
            Backend::V4l2UserPtr => "v4l2-userptr",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform camera binding
pub trait CameraDriver: Send {
    /// Short driver name for logs
    fn name(&self) -> &str;

    /// Acquire the camera at `config.index` using the given backend
    fn open(&mut self, config: &DeviceConfig, backend: Backend) -> io::Result<()>;

    /// One blocking read. `None` on a transient failure.
    fn grab(&mut self) -> Option<VideoFrame>;

    /// Release the camera. Called at most once per successful `open`.
    fn release(&mut self);
}

/// Default number of reads tried after opening before giving up
pub const DEFAULT_VERIFY_ATTEMPTS: u32 = 5;

/// Owns an opened (or closed) camera and its configured parameters
pub struct DeviceHandle {
    driver: Box<dyn CameraDriver>,
    config: DeviceConfig,
    /// Backend the device is open with; `None` while closed
    backend: Option<Backend>,
    verify_attempts: u32,
}

impl DeviceHandle {
    /// Create a closed handle
    pub fn new(driver: Box<dyn CameraDriver>, config: DeviceConfig) -> Self {
        Self {
            driver,
            config,
            backend: None,
            verify_attempts: DEFAULT_VERIFY_ATTEMPTS,
        }
    }

    /// Set how many verification reads `open` may spend (at least one)
    pub fn with_verify_attempts(mut self, attempts: u32) -> Self {
        self.verify_attempts = attempts.max(1);
        self
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn backend(&self) -> Option<Backend> {
        self.backend
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// Open the camera with `config` through `backend`, then verify it delivers a frame.
    ///
    /// Fails with `DeviceUnavailable` if the backend cannot open the index and
    /// with `DeviceUnresponsive` if no valid frame arrives within the
    /// configured number of verification reads. The handle is left closed on failure.
    pub fn open(&mut self, config: &DeviceConfig, backend: Backend) -> Result<()> {
        if self.is_open() {
            return Err(VisionError::ConfigurationConflict(format!(
                "camera {} is already open via {}",
                self.config.index,
                self.backend.map(Backend::as_str).unwrap_or("unknown")
            )));
        }
        self.config = config.clone();

        self.driver
            .open(&self.config, backend)
            .map_err(|e| VisionError::DeviceUnavailable {
                index: self.config.index,
                backend,
                reason: e.to_string(),
            })?;

        for attempt in 1..=self.verify_attempts {
            if let Some(frame) = self.driver.grab() {
                if frame.is_valid() {
                    log::debug!(
                        "camera {} verified via {} on read {} ({}x{})",
                        self.config.index,
                        backend,
                        attempt,
                        frame.width,
                        frame.height
                    );
                    self.backend = Some(backend);
                    return Ok(());
                }
            }
        }

        self.driver.release();
        Err(VisionError::DeviceUnresponsive {
            index: self.config.index,
            attempts: self.verify_attempts,
        })
    }

    /// One read from the open device. `None` on transient failure, invalid frame or closed handle.
    pub fn read(&mut self) -> Option<VideoFrame> {
        if !self.is_open() {
            return None;
        }
        self.driver.grab().filter(VideoFrame::is_valid)
    }

    /// Release the device. Closing a closed handle is a no-op.
    pub fn close(&mut self) {
        if self.backend.take().is_some() {
            self.driver.release();
            log::debug!("camera {} released", self.config.index);
        }
    }

    /// Replace the configuration. Only valid while closed.
    pub fn reconfigure(&mut self, config: DeviceConfig) -> Result<()> {
        if self.is_open() {
            return Err(VisionError::ConfigurationConflict(
                "cannot reconfigure an open camera".to_string(),
            ));
        }
        self.config = config;
        Ok(())
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}
