//! Vision system façade
//!
//! `VisionSystem` is what the UI layer holds. It owns the camera handle while
//! stopped, spawns the capture and processing loops on `start`, routes frame,
//! error and info events to registered callbacks, and joins the loops (with a
//! bounded wait) on `stop`. All methods take `&self`, so one instance can be
//! shared between UI controllers behind an `Arc`.

use crossbeam::channel;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use super::buffer::FrameBuffer;
use super::capture::{self, CaptureContext, RecoveryRequest};
use super::device::{Backend, CameraDriver, DeviceHandle};
use super::processing::{self, AnnotatorSet, FrameAnnotator, ProcessingContext};
use super::recovery::RecoveryStrategy;
use super::signal::StopSignal;
use super::{CameraStatus, Result, VideoFrame, VisionError, VisionInfo};
use crate::config::{DeviceConfig, FeatureFlags, Resolution, VisionConfig};

/// Callback for captured frames
pub type FrameCallback = Arc<dyn Fn(&VideoFrame) + Send + Sync + 'static>;
/// Callback for surfaced failures
pub type ErrorCallback = Arc<dyn Fn(&VisionError) + Send + Sync + 'static>;
/// Callback for vision info snapshots
pub type InfoCallback = Arc<dyn Fn(&VisionInfo) + Send + Sync + 'static>;

/// Registered consumer callbacks.
///
/// Callbacks run on the loop that raised the event and must return quickly.
/// A panicking callback is logged and swallowed so it cannot kill a loop.
#[derive(Default)]
pub struct VisionCallbacks {
    on_frame: RwLock<Option<FrameCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
    on_info: RwLock<Option<InfoCallback>>,
}

impl VisionCallbacks {
    pub fn set_frame(&self, callback: impl Fn(&VideoFrame) + Send + Sync + 'static) {
        *self.on_frame.write() = Some(Arc::new(callback));
    }

    pub fn set_error(&self, callback: impl Fn(&VisionError) + Send + Sync + 'static) {
        *self.on_error.write() = Some(Arc::new(callback));
    }

    pub fn set_info(&self, callback: impl Fn(&VisionInfo) + Send + Sync + 'static) {
        *self.on_info.write() = Some(Arc::new(callback));
    }

    pub fn clear(&self) {
        *self.on_frame.write() = None;
        *self.on_error.write() = None;
        *self.on_info.write() = None;
    }

    pub fn has_frame_listener(&self) -> bool {
        self.on_frame.read().is_some()
    }

    pub(crate) fn emit_frame(&self, frame: &VideoFrame) {
        let callback = self.on_frame.read().clone();
        if let Some(callback) = callback {
            guarded("on_frame", || callback(frame));
        }
    }

    pub(crate) fn emit_error(&self, error: &VisionError) {
        let callback = self.on_error.read().clone();
        if let Some(callback) = callback {
            guarded("on_error", || callback(error));
        }
    }

    pub(crate) fn emit_info(&self, info: &VisionInfo) {
        let callback = self.on_info.read().clone();
        if let Some(callback) = callback {
            guarded("on_info", || callback(info));
        }
    }
}

fn guarded(name: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("{} callback panicked", name);
    }
}

/// State shared between the façade and both loops, one lock per structure
pub(crate) struct Shared {
    pub frames: FrameBuffer,
    pub info: Mutex<VisionInfo>,
    pub features: Mutex<FeatureFlags>,
    pub callbacks: VisionCallbacks,
}

impl Shared {
    pub fn new(features: FeatureFlags) -> Self {
        Self {
            frames: FrameBuffer::new(),
            info: Mutex::new(VisionInfo::default()),
            features: Mutex::new(features),
            callbacks: VisionCallbacks::default(),
        }
    }
}

/// Capture thread; yields the device back when it exits (`None` if it never got one)
type CaptureThread = JoinHandle<Option<DeviceHandle>>;

/// One started pair of loops
struct Session {
    stop: Arc<StopSignal>,
    capture: CaptureThread,
    capture_thread: ThreadId,
    processing: JoinHandle<()>,
    requests: channel::Sender<RecoveryRequest>,
    /// How long a manual recovery may take before the caller gives up
    recovery_timeout: Duration,
}

struct Inner {
    config: VisionConfig,
    /// Present while stopped; moved into the capture loop while running
    device: Option<DeviceHandle>,
    session: Option<Session>,
    /// Capture thread that overran the stop timeout and still owns the device
    orphan: Option<CaptureThread>,
    generation: u64,
}

/// Camera capture and annotation subsystem
pub struct VisionSystem {
    inner: Mutex<Inner>,
    shared: Arc<Shared>,
    annotators: Arc<Mutex<AnnotatorSet>>,
}

impl VisionSystem {
    /// Create a stopped system around `driver`
    pub fn new(driver: Box<dyn CameraDriver>, config: VisionConfig) -> Result<Self> {
        config.validate()?;
        let device = DeviceHandle::new(driver, config.device.clone())
            .with_verify_attempts(config.recovery.verify_attempts);
        Ok(Self {
            shared: Arc::new(Shared::new(config.features)),
            annotators: Arc::new(Mutex::new(AnnotatorSet::default())),
            inner: Mutex::new(Inner {
                config,
                device: Some(device),
                session: None,
                orphan: None,
                generation: 0,
            }),
        })
    }

    /// Create a system around the platform camera driver
    pub fn with_default_driver(config: VisionConfig) -> Result<Self> {
        #[cfg(target_os = "linux")]
        return Self::new(Box::new(super::linux_input::V4l2Driver::new()), config);
        #[cfg(not(target_os = "linux"))]
        {
            let _ = config;
            Err(VisionError::UnsupportedPlatform)
        }
    }

    /// Open the camera with the primary backend and spawn both loops
    pub fn start(&self) -> Result<()> {
        self.start_on(thread::Builder::new().name("vision-capture".to_string()))
    }

    fn start_on(&self, capture_thread: thread::Builder) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.session.is_some() {
            return Err(VisionError::AlreadyRunning);
        }
        Self::reclaim_device(&mut inner)?;

        let config = inner.config.clone();
        let strategy = RecoveryStrategy::from_settings(&config.recovery);
        let backend = strategy
            .primary()
            .ok_or_else(|| VisionError::InvalidConfig("no capture backend configured".to_string()))?;

        let mut device = match inner.device.take() {
            Some(device) => device,
            None => return Err(Self::lost_device(&config.device, backend)),
        };
        if let Err(e) = device.open(&config.device, backend) {
            log::error!("error starting vision system: {}", e);
            inner.device = Some(device);
            let mut info = self.shared.info.lock();
            info.camera_status = CameraStatus::Error;
            info.last_error = Some(e.to_string());
            return Err(e);
        }

        self.shared.frames.clear();
        let stop = Arc::new(StopSignal::new());
        let (requests, request_rx) = channel::bounded(1);
        let recovery_timeout = strategy.total_backoff()
            + config.timing.park_interval()
            + Duration::from_secs(5);

        let processing = {
            let ctx = ProcessingContext {
                shared: Arc::clone(&self.shared),
                annotators: Arc::clone(&self.annotators),
                stop: Arc::clone(&stop),
                interval: config.timing.processing_interval(),
            };
            match thread::Builder::new()
                .name("vision-processing".to_string())
                .spawn(move || processing::run(ctx))
            {
                Ok(handle) => handle,
                Err(e) => return Err(self.abort_start(&mut inner, device, e)),
            }
        };
        let (capture, handoff) = match spawn_awaiting(capture_thread, capture::run) {
            Ok(spawned) => spawned,
            Err(e) => {
                stop.stop();
                let _ = processing.join();
                return Err(self.abort_start(&mut inner, device, e));
            }
        };

        *self.shared.info.lock() = VisionInfo {
            camera_status: CameraStatus::Running,
            backend: Some(backend),
            ..VisionInfo::default()
        };
        let ctx = CaptureContext {
            device,
            strategy,
            failure_threshold: config.recovery.failure_threshold,
            shared: Arc::clone(&self.shared),
            stop: Arc::clone(&stop),
            requests: request_rx,
            timing: config.timing.clone(),
        };
        if let Err(unsent) = handoff.send(ctx) {
            stop.stop();
            let _ = processing.join();
            let _ = capture.join();
            let err = io::Error::other("capture thread exited before it received the camera");
            return Err(self.abort_start(&mut inner, unsent.0.device, err));
        }

        inner.generation += 1;
        inner.session = Some(Session {
            stop,
            capture_thread: capture.thread().id(),
            capture,
            processing,
            requests,
            recovery_timeout,
        });
        log::info!(
            "vision system started on camera {} ({}x{} @ {}fps via {})",
            config.device.index,
            config.device.width,
            config.device.height,
            config.device.frame_rate,
            backend
        );
        Ok(())
    }

    /// Undo a start whose loops could not be spawned. The camera stays with
    /// the system so the next `start` can use it.
    fn abort_start(&self, inner: &mut Inner, mut device: DeviceHandle, err: io::Error) -> VisionError {
        log::error!("could not spawn vision loops: {}", err);
        device.close();
        inner.device = Some(device);
        let err = VisionError::from(err);
        let mut info = self.shared.info.lock();
        info.camera_status = CameraStatus::Error;
        info.backend = None;
        info.last_error = Some(err.to_string());
        err
    }

    /// Replace the device configuration, then start
    pub fn start_with(&self, device: DeviceConfig) -> Result<()> {
        self.set_device_config(device)?;
        self.start()
    }

    /// Signal both loops, wait (bounded) for them and release the camera
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = inner.session.take().ok_or(VisionError::NotRunning)?;
        session.stop.stop();
        drop(session.requests);

        let deadline = Instant::now() + inner.config.timing.stop_timeout();
        if join_until(session.processing, deadline).is_err() {
            log::warn!("processing loop did not stop in time, detaching");
        }
        match join_until(session.capture, deadline).map(Option::flatten) {
            Ok(Some(mut device)) => {
                device.close();
                inner.device = Some(device);
            }
            Ok(None) => log::error!("capture loop panicked; camera handle lost"),
            Err(handle) => {
                log::warn!("capture loop did not stop in time; camera released when it exits");
                inner.orphan = Some(handle);
            }
        }

        {
            let mut info = self.shared.info.lock();
            info.camera_status = CameraStatus::Stopped;
            info.fps = 0.0;
            info.backend = None;
        }
        log::info!("vision system stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Manually retry the recovery cycle when the camera is in the error state.
    ///
    /// Returns `true` if the camera is running afterwards. Returns `false`
    /// when the system is stopped or a recovery is already in flight.
    pub fn attempt_recovery(&self) -> bool {
        let (requests, timeout) = {
            let inner = self.inner.lock();
            let Some(session) = inner.session.as_ref() else {
                return false;
            };
            // Called from a callback on the capture thread, which is the only one able to answer
            if thread::current().id() == session.capture_thread {
                log::warn!("recovery cannot be requested from the capture thread");
                return false;
            }
            match self.status() {
                CameraStatus::Running => return true,
                CameraStatus::Error => {}
                _ => return false,
            }
            (session.requests.clone(), session.recovery_timeout)
        };

        let (reply, outcome) = channel::bounded(1);
        if requests.send(RecoveryRequest { reply }).is_err() {
            return false;
        }
        outcome.recv_timeout(timeout).unwrap_or(false)
    }

    /// Copy of the newest frame, independent of the callback stream
    pub fn capture_snapshot(&self) -> Option<VideoFrame> {
        self.shared.frames.get().map(|latest| (*latest.frame).clone())
    }

    pub fn info(&self) -> VisionInfo {
        self.shared.info.lock().clone()
    }

    pub fn status(&self) -> CameraStatus {
        self.shared.info.lock().camera_status
    }

    pub fn status_text(&self) -> &'static str {
        self.status().as_str()
    }

    /// Register all three consumer callbacks at once
    pub fn register_callbacks<F, E, I>(&self, on_frame: F, on_error: E, on_info: I)
    where
        F: Fn(&VideoFrame) + Send + Sync + 'static,
        E: Fn(&VisionError) + Send + Sync + 'static,
        I: Fn(&VisionInfo) + Send + Sync + 'static,
    {
        self.shared.callbacks.set_frame(on_frame);
        self.shared.callbacks.set_error(on_error);
        self.shared.callbacks.set_info(on_info);
    }

    pub fn callbacks(&self) -> &VisionCallbacks {
        &self.shared.callbacks
    }

    /// Feature toggles, effective on the next processing iteration
    pub fn configure(&self, features: FeatureFlags) {
        *self.shared.features.lock() = features;
    }

    pub fn features(&self) -> FeatureFlags {
        *self.shared.features.lock()
    }

    pub fn enable_face_detection(&self, enabled: bool) {
        self.shared.features.lock().face_detection = enabled;
    }

    pub fn enable_emotion_detection(&self, enabled: bool) {
        self.shared.features.lock().emotion_detection = enabled;
    }

    pub fn enable_gesture_detection(&self, enabled: bool) {
        self.shared.features.lock().gesture_detection = enabled;
    }

    pub fn set_debug_overlay(&self, enabled: bool) {
        self.shared.features.lock().debug_overlay = enabled;
    }

    /// Replace the face pass
    pub fn set_face_annotator(&self, annotator: Box<dyn FrameAnnotator>) {
        self.annotators.lock().face = annotator;
    }

    /// Install (or remove) the emotion pass
    pub fn set_emotion_annotator(&self, annotator: Option<Box<dyn FrameAnnotator>>) {
        self.annotators.lock().emotion = annotator;
    }

    /// Install (or remove) the gesture pass
    pub fn set_gesture_annotator(&self, annotator: Option<Box<dyn FrameAnnotator>>) {
        self.annotators.lock().gesture = annotator;
    }

    pub fn device_config(&self) -> DeviceConfig {
        self.inner.lock().config.device.clone()
    }

    /// Reconfigure the camera. Fails with `ConfigurationConflict` while running.
    pub fn set_device_config(&self, device: DeviceConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.session.is_some() {
            return Err(VisionError::ConfigurationConflict(
                "stop the vision system before changing camera settings".to_string(),
            ));
        }
        let mut config = inner.config.clone();
        config.device = device.clone();
        config.validate()?;
        if let Some(handle) = inner.device.as_mut() {
            handle.reconfigure(device)?;
        }
        inner.config = config;
        Ok(())
    }

    pub fn set_camera_index(&self, index: u32) -> Result<()> {
        let mut device = self.device_config();
        device.index = index;
        self.set_device_config(device)
    }

    pub fn set_resolution(&self, resolution: Resolution) -> Result<()> {
        let mut device = self.device_config();
        device.set_resolution(resolution);
        self.set_device_config(device)
    }

    /// Number of loop pairs spawned over this instance's lifetime
    pub fn loop_generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Take the device back from a capture thread that overran a previous stop
    fn reclaim_device(inner: &mut Inner) -> Result<()> {
        if inner.device.is_some() {
            return Ok(());
        }
        let backend = inner.config.recovery.primary_backend().unwrap_or(Backend::Auto);
        match inner.orphan.take() {
            Some(handle) if handle.is_finished() => match handle.join().ok().flatten() {
                Some(device) => {
                    inner.device = Some(device);
                    Ok(())
                }
                None => Err(Self::lost_device(&inner.config.device, backend)),
            },
            Some(handle) => {
                inner.orphan = Some(handle);
                Err(VisionError::DeviceUnavailable {
                    index: inner.config.device.index,
                    backend,
                    reason: "previous capture loop still holds the camera".to_string(),
                })
            }
            None => Err(Self::lost_device(&inner.config.device, backend)),
        }
    }

    fn lost_device(device: &DeviceConfig, backend: Backend) -> VisionError {
        VisionError::DeviceUnavailable {
            index: device.index,
            backend,
            reason: "camera handle was lost when a capture loop panicked".to_string(),
        }
    }
}

impl Drop for VisionSystem {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Spawn `body` on a thread that waits for its context over a channel.
///
/// The caller keeps the context until it sends it, so a failed spawn loses
/// nothing. The thread returns `None` if the sender is dropped unsent.
fn spawn_awaiting<C, T>(
    builder: thread::Builder,
    body: fn(C) -> T,
) -> io::Result<(JoinHandle<Option<T>>, channel::Sender<C>)>
where
    C: Send + 'static,
    T: Send + 'static,
{
    let (handoff, pending) = channel::bounded(1);
    let handle = builder.spawn(move || pending.recv().ok().map(body))?;
    Ok((handle, handoff))
}

/// Join `handle` if it finishes before `deadline`; otherwise hand it back.
/// `Ok(None)` means the thread panicked.
fn join_until<T>(handle: JoinHandle<T>, deadline: Instant) -> std::result::Result<Option<T>, JoinHandle<T>> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        thread::sleep(Duration::from_millis(2));
    }
    Ok(handle.join().ok())
}
