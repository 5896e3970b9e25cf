//! Capture loop
//!
//! Owns the `DeviceHandle` while the system runs. Each iteration reads one
//! frame into the buffer and hands it to `on_frame`. Consecutive read
//! failures are absorbed until the threshold is reached; then the loop reports
//! `CaptureStalled`, switches to `Recovering` and runs a recovery cycle on the
//! next iteration. An exhausted cycle parks the loop in `Error` until a manual
//! recovery request or stop arrives.
//!
//! ```text
//! Running --threshold--> Recovering --ok--> Running
//!                             |
//!                             +--exhausted--> Error --request--> Recovering
//! (any state) --stop--> Stopped
//! ```

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::device::DeviceHandle;
use super::input::Shared;
use super::overlay;
use super::recovery::{RecoveryState, RecoveryStrategy};
use super::signal::StopSignal;
use super::{CameraStatus, VideoFrame, VisionError, VisionInfo};
use crate::config::LoopTiming;

/// Manual recovery request from the façade; the loop answers whether it succeeded
pub(crate) struct RecoveryRequest {
    pub reply: Sender<bool>,
}

pub(crate) struct CaptureContext {
    pub device: DeviceHandle,
    pub strategy: RecoveryStrategy,
    pub failure_threshold: u32,
    pub shared: Arc<Shared>,
    pub stop: Arc<StopSignal>,
    pub requests: Receiver<RecoveryRequest>,
    pub timing: LoopTiming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Recovering,
    Parked,
}

/// Frames per one-second window
struct FpsCounter {
    window_start: Instant,
    frames: u32,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
        }
    }

    /// Count a frame; yields the rate when a window closes
    fn tick(&mut self) -> Option<f32> {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let rate = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.window_start = Instant::now();
        Some(rate)
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Capture loop body. Returns the (closed) device when `stop` fires.
pub(crate) fn run(ctx: CaptureContext) -> DeviceHandle {
    let CaptureContext {
        mut device,
        strategy,
        failure_threshold,
        shared,
        stop,
        requests,
        timing,
    } = ctx;
    let mut state = RecoveryState::new(failure_threshold);
    let mut fps = FpsCounter::new();
    let mut phase = Phase::Running;
    let frame_interval = device.config().frame_interval();
    log::debug!("capture loop started on camera {}", device.config().index);

    while !stop.is_stopped() {
        match phase {
            Phase::Running => {
                answer_pending(&requests);
                let started = Instant::now();
                match device.read() {
                    Some(frame) => {
                        state.record_success();
                        deliver(&shared, &stop, frame, &mut fps);
                    }
                    None => {
                        log::trace!("frame read failed ({} in a row)", state.consecutive_failures + 1);
                        if state.record_failure() {
                            let err = VisionError::CaptureStalled {
                                failures: state.consecutive_failures,
                            };
                            log::warn!("{}", err);
                            match publish(&shared, &stop) {
                                Some(mut info) => {
                                    info.camera_status = CameraStatus::Recovering;
                                    info.last_error = Some(err.to_string());
                                }
                                None => break,
                            }
                            shared.callbacks.emit_error(&err);
                            phase = Phase::Recovering;
                            continue;
                        }
                    }
                }
                let pause = frame_interval
                    .saturating_sub(started.elapsed())
                    .max(timing.capture_interval());
                if stop.sleep(pause) {
                    break;
                }
            }
            Phase::Recovering => match recover(&mut device, &strategy, &mut state, &shared, &stop) {
                Some(true) => {
                    fps.reset();
                    phase = Phase::Running;
                }
                Some(false) => phase = Phase::Parked,
                None => break,
            },
            Phase::Parked => match requests.recv_timeout(timing.park_interval()) {
                Ok(request) => {
                    log::info!("manual recovery requested");
                    let outcome = recover(&mut device, &strategy, &mut state, &shared, &stop);
                    let _ = request.reply.send(outcome == Some(true));
                    match outcome {
                        Some(true) => {
                            fps.reset();
                            phase = Phase::Running;
                        }
                        Some(false) => {}
                        None => break,
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if stop.sleep(timing.park_interval()) {
                        break;
                    }
                }
            },
        }
    }

    device.close();
    log::debug!("capture loop stopped");
    device
}

/// Requests that arrive while the camera is healthy succeed trivially
fn answer_pending(requests: &Receiver<RecoveryRequest>) {
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(true);
    }
}

/// Lock the shared info unless `stop` has fired.
///
/// `stop()` writes `Stopped` under this lock after raising the signal, so a
/// loop left running past its stop timeout can never publish over it.
fn publish<'a>(shared: &'a Shared, stop: &StopSignal) -> Option<MutexGuard<'a, VisionInfo>> {
    let info = shared.info.lock();
    if stop.is_stopped() {
        return None;
    }
    Some(info)
}

/// Store a captured frame and notify `on_frame`
fn deliver(shared: &Shared, stop: &StopSignal, frame: VideoFrame, fps: &mut FpsCounter) {
    let buffered = {
        let Some(mut info) = publish(shared, stop) else {
            return;
        };
        let buffered = shared.frames.put(frame);
        info.frame_count += 1;
        if let Some(rate) = fps.tick() {
            info.fps = rate;
        }
        buffered
    };

    if !shared.callbacks.has_frame_listener() {
        return;
    }
    let debug_overlay = shared.features.lock().debug_overlay;
    if debug_overlay {
        let info = shared.info.lock().clone();
        let mut annotated = (*buffered.frame).clone();
        overlay::draw_debug_overlay(&mut annotated, &info);
        shared.callbacks.emit_frame(&annotated);
    } else {
        shared.callbacks.emit_frame(&buffered.frame);
    }
}

/// Run one recovery cycle. `None` when stop interrupted it.
fn recover(
    device: &mut DeviceHandle,
    strategy: &RecoveryStrategy,
    state: &mut RecoveryState,
    shared: &Shared,
    stop: &StopSignal,
) -> Option<bool> {
    let cycle = state.begin_cycle();
    {
        let mut info = publish(shared, stop)?;
        info.camera_status = CameraStatus::Recovering;
        info.recovery_attempts = cycle;
        info.backend = None;
        info.fps = 0.0;
    }
    log::info!("recovery cycle {} on camera {}", cycle, device.config().index);

    let config = device.config().clone();
    match strategy.run(device, &config, state, stop) {
        Ok(backend) => {
            let Some(mut info) = publish(shared, stop) else {
                device.close();
                return None;
            };
            info.camera_status = CameraStatus::Running;
            info.backend = Some(backend);
            Some(true)
        }
        Err(VisionError::Cancelled) => None,
        Err(e) => {
            log::error!("{}", e);
            {
                let mut info = publish(shared, stop)?;
                info.camera_status = CameraStatus::Error;
                info.last_error = Some(e.to_string());
            }
            shared.callbacks.emit_error(&e);
            Some(false)
        }
    }
}
