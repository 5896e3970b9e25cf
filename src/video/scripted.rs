//! Scripted camera driver
//!
//! Deterministic stand-in for a real camera. Open results per backend, read
//! failures and read latency are all scripted. Clones share the same script,
//! so a caller can keep steering a driver after handing it to a
//! `VisionSystem`.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::device::{Backend, CameraDriver};
use super::VideoFrame;
use crate::config::DeviceConfig;

type FrameFactory = Box<dyn Fn(u64, &DeviceConfig) -> VideoFrame + Send>;

struct Script {
    failing_backends: HashSet<Backend>,
    fail_next_reads: u32,
    dead: bool,
    read_delay: Duration,
    open_config: Option<DeviceConfig>,
    open_attempts: Vec<Backend>,
    opened: Vec<Backend>,
    releases: u32,
    frames_served: u64,
    factory: Option<FrameFactory>,
}

/// Camera driver whose behaviour is scripted by the caller
#[derive(Clone)]
pub struct ScriptedDriver {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                failing_backends: HashSet::new(),
                fail_next_reads: 0,
                dead: false,
                read_delay: Duration::ZERO,
                open_config: None,
                open_attempts: Vec::new(),
                opened: Vec::new(),
                releases: 0,
                frames_served: 0,
                factory: None,
            })),
        }
    }

    /// Produce frames with a custom generator. It receives the 1-based frame number.
    pub fn with_frames<F>(self, factory: F) -> Self
    where
        F: Fn(u64, &DeviceConfig) -> VideoFrame + Send + 'static,
    {
        self.script.lock().factory = Some(Box::new(factory));
        self
    }

    /// Make `open` fail for this backend
    pub fn fail_backend(&self, backend: Backend) {
        self.script.lock().failing_backends.insert(backend);
    }

    pub fn restore_backend(&self, backend: Backend) {
        self.script.lock().failing_backends.remove(&backend);
    }

    /// Make `open` fail for every backend
    pub fn fail_all_backends(&self) {
        let mut script = self.script.lock();
        script.failing_backends.extend([Backend::Auto, Backend::V4l2Mmap, Backend::V4l2UserPtr]);
    }

    pub fn restore_all_backends(&self) {
        self.script.lock().failing_backends.clear();
    }

    /// The next `count` reads fail
    pub fn fail_reads(&self, count: u32) {
        self.script.lock().fail_next_reads = count;
    }

    /// While dead, every read fails
    pub fn set_dead(&self, dead: bool) {
        self.script.lock().dead = dead;
    }

    /// Simulated blocking time of each read
    pub fn set_read_delay(&self, delay: Duration) {
        self.script.lock().read_delay = delay;
    }

    pub fn is_open(&self) -> bool {
        self.script.lock().open_config.is_some()
    }

    /// Every backend `open` was called with, in order
    pub fn open_attempts(&self) -> Vec<Backend> {
        self.script.lock().open_attempts.clone()
    }

    /// Backends that opened successfully, in order
    pub fn opened_backends(&self) -> Vec<Backend> {
        self.script.lock().opened.clone()
    }

    pub fn release_count(&self) -> u32 {
        self.script.lock().releases
    }

    pub fn frames_served(&self) -> u64 {
        self.script.lock().frames_served
    }

    fn default_frame(number: u64, config: &DeviceConfig) -> VideoFrame {
        // Small frames keep the scripted pipeline cheap regardless of the requested resolution
        let width = config.width.min(64);
        let height = config.height.min(48);
        let level = (number % 200) as u8 + 20;
        let mut frame = VideoFrame::solid(width, height, level);
        frame.timestamp_ns = number;
        frame
    }
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDriver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&mut self, config: &DeviceConfig, backend: Backend) -> io::Result<()> {
        let mut script = self.script.lock();
        script.open_attempts.push(backend);
        if script.failing_backends.contains(&backend) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("backend {} cannot open camera {}", backend, config.index),
            ));
        }
        script.open_config = Some(config.clone());
        script.opened.push(backend);
        Ok(())
    }

    fn grab(&mut self) -> Option<VideoFrame> {
        let delay = self.script.lock().read_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut script = self.script.lock();
        let config = script.open_config.clone()?;
        if script.dead {
            return None;
        }
        if script.fail_next_reads > 0 {
            script.fail_next_reads -= 1;
            return None;
        }
        script.frames_served += 1;
        let number = script.frames_served;
        let frame = match &script.factory {
            Some(factory) => factory(number, &config),
            None => Self::default_frame(number, &config),
        };
        Some(frame)
    }

    fn release(&mut self) {
        let mut script = self.script.lock();
        script.open_config = None;
        script.releases += 1;
    }
}
