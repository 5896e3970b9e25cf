//! Companion Vision - camera capture subsystem for the companion assistant
//!
//! This library owns the live camera: it opens the device through a
//! pluggable driver, keeps the newest frame in a latest-wins buffer, recovers
//! from stalled capture by walking an ordered list of backends, and annotates
//! frames (face region, optional emotion and gesture passes) on an
//! independent processing loop. The UI layer talks to it through
//! [`VisionSystem`] and three callbacks.

// Core modules
pub mod config;
pub mod video;

// Re-exports for convenience
pub use config::{DeviceConfig, FeatureFlags, LoopTiming, RecoverySettings, Resolution, VisionConfig};
pub use video::buffer::{BufferedFrame, FrameBuffer};
pub use video::device::{Backend, CameraDriver, DeviceHandle};
pub use video::face::FaceRegionDetector;
pub use video::input::{VisionCallbacks, VisionSystem};
pub use video::processing::FrameAnnotator;
pub use video::recovery::{RecoveryState, RecoveryStrategy};
pub use video::scripted::ScriptedDriver;
pub use video::{CameraStatus, PixelFormat, Region, Result, VideoFrame, VisionError, VisionInfo};

#[cfg(target_os = "linux")]
pub use video::linux_input::{enumerate_cameras, CameraDevice, V4l2Driver};
