//! End-to-end lifecycle, recovery and freshness scenarios against the scripted driver

use image::GrayImage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use companion_vision::{
    Backend, CameraStatus, FrameAnnotator, Resolution, ScriptedDriver, VideoFrame, VisionConfig, VisionError,
    VisionInfo, VisionSystem,
};

fn fast_config() -> VisionConfig {
    let mut config = VisionConfig::default();
    config.device.frame_rate = 500;
    config.recovery.backoff_ms = 1;
    config.recovery.final_backoff_ms = 2;
    config.timing.capture_interval_ms = 1;
    config.timing.processing_interval_ms = 4;
    config.timing.park_interval_ms = 5;
    config.timing.stop_timeout_ms = 1000;
    config
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Counts the error events a system reports
#[derive(Default)]
struct ErrorLog {
    stalled: AtomicUsize,
    exhausted: AtomicUsize,
    other: AtomicUsize,
}

impl ErrorLog {
    fn attach(system: &VisionSystem) -> Arc<Self> {
        let log = Arc::new(Self::default());
        let sink = Arc::clone(&log);
        system.callbacks().set_error(move |err| {
            let counter = match err {
                VisionError::CaptureStalled { .. } => &sink.stalled,
                VisionError::RecoveryExhausted { .. } => &sink.exhausted,
                _ => &sink.other,
            };
            counter.fetch_add(1, Ordering::SeqCst);
        });
        log
    }

    fn stalled(&self) -> usize {
        self.stalled.load(Ordering::SeqCst)
    }

    fn exhausted(&self) -> usize {
        self.exhausted.load(Ordering::SeqCst)
    }

    fn other(&self) -> usize {
        self.other.load(Ordering::SeqCst)
    }
}

fn system_with(driver: &ScriptedDriver, config: VisionConfig) -> VisionSystem {
    VisionSystem::new(Box::new(driver.clone()), config).unwrap()
}

fn running_with_frames(system: &VisionSystem) {
    system.start().unwrap();
    assert!(
        wait_for(Duration::from_secs(2), || system.info().frame_count > 0),
        "no frames captured"
    );
}

#[test]
fn test_failure_run_triggers_exactly_one_recovery() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    let errors = ErrorLog::attach(&system);
    running_with_frames(&system);

    driver.fail_reads(5);
    assert!(wait_for(Duration::from_secs(2), || {
        let info = system.info();
        info.camera_status == CameraStatus::Running && info.recovery_attempts == 1
    }));

    // Give the loop time to misbehave if it were going to
    thread::sleep(Duration::from_millis(50));
    let info = system.info();
    assert_eq!(info.camera_status, CameraStatus::Running);
    assert_eq!(info.recovery_attempts, 1);
    assert_eq!(info.backend, Some(Backend::V4l2Mmap));
    assert_eq!(errors.stalled(), 1);
    assert_eq!(errors.exhausted(), 0);
    assert_eq!(errors.other(), 0);
    assert_eq!(driver.opened_backends(), vec![Backend::V4l2Mmap, Backend::V4l2Mmap]);

    system.stop().unwrap();
}

#[test]
fn test_failures_below_threshold_are_absorbed() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    let errors = ErrorLog::attach(&system);
    running_with_frames(&system);

    driver.fail_reads(4);
    let served = driver.frames_served();
    assert!(wait_for(Duration::from_secs(2), || driver.frames_served() > served + 5));
    assert_eq!(errors.stalled(), 0);
    assert_eq!(system.info().recovery_attempts, 0);
    assert_eq!(system.status(), CameraStatus::Running);

    system.stop().unwrap();
}

#[test]
fn test_exhausted_recovery_parks_until_manual_retry() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    let errors = ErrorLog::attach(&system);
    running_with_frames(&system);

    driver.fail_all_backends();
    driver.set_dead(true);
    assert!(wait_for(Duration::from_secs(2), || system.status() == CameraStatus::Error));

    // Parked: no automatic retry
    thread::sleep(Duration::from_millis(50));
    assert_eq!(system.status(), CameraStatus::Error);
    assert_eq!(errors.exhausted(), 1);
    assert_eq!(errors.stalled(), 1);
    let cycle = [Backend::V4l2Mmap, Backend::V4l2UserPtr, Backend::Auto];
    assert_eq!(driver.open_attempts()[1..], cycle);
    assert!(system.info().last_error.is_some());

    // A manual retry walks the same sequence again
    assert!(!system.attempt_recovery());
    assert_eq!(errors.exhausted(), 2);
    assert_eq!(driver.open_attempts()[4..], cycle);

    driver.restore_all_backends();
    driver.set_dead(false);
    assert!(system.attempt_recovery());
    let info = system.info();
    assert_eq!(info.camera_status, CameraStatus::Running);
    assert_eq!(info.recovery_attempts, 3);
    assert_eq!(errors.exhausted(), 2);

    system.stop().unwrap();
}

#[test]
fn test_attempt_recovery_when_healthy_or_stopped() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    assert!(!system.attempt_recovery());

    running_with_frames(&system);
    assert!(system.attempt_recovery());
    assert_eq!(system.info().recovery_attempts, 0);

    system.stop().unwrap();
    assert!(!system.attempt_recovery());
}

#[test]
fn test_recovery_requested_from_error_callback_returns_promptly() {
    let driver = ScriptedDriver::new();
    let system = Arc::new(system_with(&driver, fast_config()));
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    {
        let weak = Arc::downgrade(&system);
        let outcomes = Arc::clone(&outcomes);
        system.callbacks().set_error(move |err| {
            if !matches!(err, VisionError::RecoveryExhausted { .. }) {
                return;
            }
            if let Some(system) = weak.upgrade() {
                let started = Instant::now();
                let recovered = system.attempt_recovery();
                outcomes.lock().push((recovered, started.elapsed()));
            }
        });
    }
    running_with_frames(&system);

    driver.fail_all_backends();
    driver.set_dead(true);
    assert!(wait_for(Duration::from_secs(2), || !outcomes.lock().is_empty()));
    let (recovered, elapsed) = outcomes.lock()[0];
    assert!(!recovered);
    assert!(elapsed < Duration::from_millis(500), "blocked for {:?}", elapsed);
    assert!(wait_for(Duration::from_secs(2), || system.status() == CameraStatus::Error));

    // The same request from another thread still reaches the loop
    driver.restore_all_backends();
    driver.set_dead(false);
    assert!(system.attempt_recovery());
    system.stop().unwrap();
}

#[test]
fn test_second_start_is_rejected_without_new_loops() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    running_with_frames(&system);

    assert!(matches!(system.start(), Err(VisionError::AlreadyRunning)));
    assert_eq!(system.loop_generation(), 1);
    assert_eq!(driver.open_attempts().len(), 1);

    system.stop().unwrap();
    assert!(matches!(system.stop(), Err(VisionError::NotRunning)));
    assert_eq!(system.status(), CameraStatus::Stopped);
    assert!(!driver.is_open());

    running_with_frames(&system);
    assert_eq!(system.loop_generation(), 2);
    system.stop().unwrap();
}

#[test]
fn test_restart_resets_recovery_counter() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    running_with_frames(&system);

    driver.fail_reads(5);
    assert!(wait_for(Duration::from_secs(2), || system.info().recovery_attempts == 1
        && system.status() == CameraStatus::Running));
    system.stop().unwrap();

    system.start().unwrap();
    let info = system.info();
    assert_eq!(info.recovery_attempts, 0);
    assert_eq!(info.camera_status, CameraStatus::Running);
    system.stop().unwrap();
}

#[test]
fn test_stop_is_bounded_during_slow_read() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    running_with_frames(&system);

    driver.set_read_delay(Duration::from_millis(300));
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    system.stop().unwrap();
    assert!(started.elapsed() < Duration::from_millis(1200));
    assert_eq!(system.status(), CameraStatus::Stopped);
    assert!(!driver.is_open());
}

#[test]
fn test_stop_timeout_detaches_stuck_loop_and_restart_reclaims_device() {
    let driver = ScriptedDriver::new();
    let mut config = fast_config();
    config.timing.stop_timeout_ms = 100;
    let system = system_with(&driver, config);
    running_with_frames(&system);

    driver.set_read_delay(Duration::from_millis(600));
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    system.stop().unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(system.status(), CameraStatus::Stopped);

    // The stuck read still owns the camera
    assert!(matches!(system.start(), Err(VisionError::DeviceUnavailable { .. })));
    assert!(!system.is_running());

    // Once the detached loop exits, the next start reclaims the device
    driver.set_read_delay(Duration::ZERO);
    assert!(wait_for(Duration::from_secs(2), || system.start().is_ok()));
    assert_eq!(system.loop_generation(), 2);
    assert!(wait_for(Duration::from_secs(2), || system.info().frame_count > 0));
    system.stop().unwrap();
}

#[test]
fn test_detached_recovery_cannot_revive_stopped_system() {
    let driver = ScriptedDriver::new();
    let mut config = fast_config();
    config.timing.stop_timeout_ms = 50;
    let system = system_with(&driver, config);
    let errors = ErrorLog::attach(&system);
    let frames = Arc::new(AtomicUsize::new(0));
    {
        let frames = Arc::clone(&frames);
        system.callbacks().set_frame(move |_| {
            frames.fetch_add(1, Ordering::SeqCst);
        });
    }
    running_with_frames(&system);

    // Every read (verification reads included) now blocks and fails
    driver.set_read_delay(Duration::from_millis(200));
    driver.set_dead(true);
    assert!(wait_for(Duration::from_secs(5), || system.status() == CameraStatus::Recovering));
    thread::sleep(Duration::from_millis(30));

    system.stop().unwrap();
    assert_eq!(system.status(), CameraStatus::Stopped);
    let frames_at_stop = frames.load(Ordering::SeqCst);
    let counted_at_stop = system.info().frame_count;

    // The blocked verification read now succeeds inside the detached loop
    driver.set_dead(false);
    thread::sleep(Duration::from_millis(600));

    let info = system.info();
    assert_eq!(info.camera_status, CameraStatus::Stopped);
    assert_eq!(info.backend, None);
    assert_eq!(info.frame_count, counted_at_stop);
    assert_eq!(frames.load(Ordering::SeqCst), frames_at_stop);
    assert_eq!(errors.exhausted(), 0);
    assert!(!system.is_running());
    assert!(!driver.is_open());

    driver.set_read_delay(Duration::ZERO);
    assert!(wait_for(Duration::from_secs(2), || system.start().is_ok()));
    system.stop().unwrap();
}

#[test]
fn test_stop_interrupts_recovery_backoff() {
    let driver = ScriptedDriver::new();
    let mut config = fast_config();
    config.recovery.backoff_ms = 5000;
    config.recovery.final_backoff_ms = 5000;
    let system = system_with(&driver, config);
    running_with_frames(&system);

    driver.set_dead(true);
    assert!(wait_for(Duration::from_secs(2), || system.status() == CameraStatus::Recovering));
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    system.stop().unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(system.status(), CameraStatus::Stopped);
}

#[test]
fn test_processing_never_goes_back_to_older_frames() {
    let driver = ScriptedDriver::new();
    let mut config = fast_config();
    // Processing at half the capture rate
    config.timing.processing_interval_ms = 4;
    let system = system_with(&driver, config);

    let processed = Arc::new(Mutex::new(Vec::new()));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    {
        let processed = Arc::clone(&processed);
        let delivered = Arc::clone(&delivered);
        system.register_callbacks(
            move |frame: &VideoFrame| delivered.lock().push(frame.timestamp_ns),
            |_err: &VisionError| {},
            move |info: &VisionInfo| processed.lock().push(info.processed_sequence),
        );
    }

    running_with_frames(&system);
    thread::sleep(Duration::from_millis(300));
    system.stop().unwrap();

    let processed = processed.lock();
    let delivered = delivered.lock();
    assert!(!processed.is_empty());
    assert!(processed.windows(2).all(|w| w[0] <= w[1]));
    assert!(delivered.windows(2).all(|w| w[0] < w[1]));

    let mut distinct = processed.clone();
    distinct.dedup();
    let captured = system.info().frame_count;
    assert!(*processed.last().unwrap() <= captured);
    assert!((distinct.len() as u64) < captured, "processing never skipped a frame");
}

#[test]
fn test_snapshot_before_first_frame_is_none() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    let infos = Arc::new(AtomicUsize::new(0));
    let unannotated = Arc::new(AtomicUsize::new(0));
    {
        let infos = Arc::clone(&infos);
        let unannotated = Arc::clone(&unannotated);
        system.callbacks().set_info(move |info| {
            infos.fetch_add(1, Ordering::SeqCst);
            if info.processed_sequence == 0 {
                unannotated.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    assert!(system.capture_snapshot().is_none());

    driver.set_read_delay(Duration::from_millis(200));
    system.start().unwrap();
    assert!(system.capture_snapshot().is_none());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(infos.load(Ordering::SeqCst), 0);

    driver.set_read_delay(Duration::ZERO);
    assert!(wait_for(Duration::from_secs(2), || system.capture_snapshot().is_some()));
    assert!(wait_for(Duration::from_secs(2), || infos.load(Ordering::SeqCst) > 0));
    let snapshot = system.capture_snapshot().unwrap();
    assert!(snapshot.is_valid());
    system.stop().unwrap();
    // Info events come from the processing loop, after a frame was annotated
    assert_eq!(unannotated.load(Ordering::SeqCst), 0);
}

#[test]
fn test_reconfigure_while_running_conflicts() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    running_with_frames(&system);

    let err = system.set_resolution(Resolution::new(1280, 720)).unwrap_err();
    assert!(matches!(err, VisionError::ConfigurationConflict(_)));
    assert!(matches!(
        system.set_camera_index(1),
        Err(VisionError::ConfigurationConflict(_))
    ));
    assert_eq!(system.device_config().resolution(), Resolution::new(640, 480));

    system.stop().unwrap();
    system.set_resolution(Resolution::new(1280, 720)).unwrap();
    system.set_camera_index(1).unwrap();
    let device = system.device_config();
    assert_eq!((device.index, device.width, device.height), (1, 1280, 720));

    running_with_frames(&system);
    system.stop().unwrap();
}

#[test]
fn test_start_with_applies_device_config() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    let mut device = system.device_config();
    device.set_resolution(Resolution::new(320, 240));
    system.start_with(device.clone()).unwrap();
    assert_eq!(system.device_config(), device);
    assert!(matches!(system.start_with(device), Err(VisionError::ConfigurationConflict(_))));
    system.stop().unwrap();
}

#[test]
fn test_debug_overlay_only_touches_delivered_copies() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    system.set_debug_overlay(true);
    let last = Arc::new(Mutex::new(None));
    {
        let last = Arc::clone(&last);
        system.callbacks().set_frame(move |frame| *last.lock() = Some(frame.clone()));
    }
    running_with_frames(&system);
    assert!(wait_for(Duration::from_secs(2), || last.lock().is_some()));
    system.stop().unwrap();

    let delivered = last.lock().clone().unwrap();
    assert_eq!(&delivered.data[..4], &[0u8, 255, 0, 255]);
    let buffered = system.capture_snapshot().unwrap();
    assert_eq!(buffered.data[0], buffered.data[1]);
    assert_eq!(buffered.data[1], buffered.data[2]);
}

struct Calm;

impl FrameAnnotator for Calm {
    fn name(&self) -> &str {
        "calm"
    }

    fn annotate(&mut self, _frame: &GrayImage, info: &mut VisionInfo) {
        info.emotion = Some("calm".to_string());
    }
}

#[test]
fn test_feature_toggles_apply_without_restart() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    system.set_emotion_annotator(Some(Box::new(Calm)));
    running_with_frames(&system);

    assert!(system.info().emotion.is_none());
    system.enable_emotion_detection(true);
    assert!(wait_for(Duration::from_secs(2), || system.info().emotion.as_deref() == Some("calm")));
    system.enable_emotion_detection(false);
    assert!(wait_for(Duration::from_secs(2), || system.info().emotion.is_none()));
    assert_eq!(system.loop_generation(), 1);

    system.stop().unwrap();
}

#[test]
fn test_panicking_frame_callback_does_not_kill_capture() {
    let driver = ScriptedDriver::new();
    let system = system_with(&driver, fast_config());
    system.callbacks().set_frame(|_| panic!("consumer bug"));
    running_with_frames(&system);

    let seen = system.info().frame_count;
    assert!(wait_for(Duration::from_secs(2), || system.info().frame_count > seen + 3));
    assert_eq!(system.status(), CameraStatus::Running);
    system.stop().unwrap();
}

#[test]
fn test_drop_releases_camera() {
    let driver = ScriptedDriver::new();
    {
        let system = system_with(&driver, fast_config());
        running_with_frames(&system);
        assert!(driver.is_open());
    }
    assert!(!driver.is_open());
    assert_eq!(driver.release_count(), 1);
}
