//! Processing loop
//!
//! Runs on its own schedule, independent of capture. Each iteration takes the
//! newest frame from the buffer, runs the enabled annotation passes over its
//! grayscale derivation and publishes the merged `VisionInfo`. Frames may be
//! skipped (capture faster than processing) but the loop never moves backwards
//! to an older frame.

use image::GrayImage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::face::FaceRegionDetector;
use super::input::Shared;
use super::signal::StopSignal;
use super::VisionInfo;
use crate::config::FeatureFlags;

/// An annotation pass over one grayscale frame
pub trait FrameAnnotator: Send {
    /// Short pass name for logs
    fn name(&self) -> &str;

    /// Write this pass's findings into `info`
    fn annotate(&mut self, frame: &GrayImage, info: &mut VisionInfo);
}

/// The passes the processing loop runs
pub struct AnnotatorSet {
    pub face: Box<dyn FrameAnnotator>,
    pub emotion: Option<Box<dyn FrameAnnotator>>,
    pub gesture: Option<Box<dyn FrameAnnotator>>,
}

impl Default for AnnotatorSet {
    fn default() -> Self {
        Self {
            face: Box::new(FaceRegionDetector::new()),
            emotion: None,
            gesture: None,
        }
    }
}

impl AnnotatorSet {
    /// Run every enabled pass. Disabled passes leave their fields cleared.
    pub fn run(&mut self, frame: &GrayImage, features: &FeatureFlags) -> VisionInfo {
        let mut scratch = VisionInfo::default();
        if features.face_detection {
            self.face.annotate(frame, &mut scratch);
        }
        if features.emotion_detection {
            if let Some(pass) = self.emotion.as_mut() {
                pass.annotate(frame, &mut scratch);
            }
        }
        if features.gesture_detection {
            if let Some(pass) = self.gesture.as_mut() {
                pass.annotate(frame, &mut scratch);
            }
        }
        scratch
    }
}

pub(crate) struct ProcessingContext {
    pub shared: Arc<Shared>,
    pub annotators: Arc<Mutex<AnnotatorSet>>,
    pub stop: Arc<StopSignal>,
    pub interval: Duration,
}

/// Processing loop body. Returns when `stop` fires.
pub(crate) fn run(ctx: ProcessingContext) {
    let ProcessingContext {
        shared,
        annotators,
        stop,
        interval,
    } = ctx;
    let mut last_sequence = 0u64;
    log::debug!("processing loop started");

    while !stop.is_stopped() {
        if let Some(latest) = shared.frames.get() {
            if latest.sequence > last_sequence {
                let features = *shared.features.lock();
                match latest.frame.to_gray_image() {
                    Some(gray) => {
                        let found = annotators.lock().run(&gray, &features);
                        let mut info = shared.info.lock();
                        info.face_detected = found.face_detected;
                        info.face_region = found.face_region;
                        info.emotion = found.emotion;
                        info.gesture = found.gesture;
                        info.processed_sequence = latest.sequence;
                    }
                    None => {
                        log::debug!("frame {} has no grayscale form, skipped", latest.sequence);
                        // Results must describe the newest frame, even an unusable one
                        let mut info = shared.info.lock();
                        info.face_detected = false;
                        info.face_region = None;
                        info.emotion = None;
                        info.gesture = None;
                        info.processed_sequence = latest.sequence;
                    }
                }
                last_sequence = latest.sequence;
            }

            let snapshot = shared.info.lock().clone();
            shared.callbacks.emit_info(&snapshot);
        }

        if stop.sleep(interval) {
            break;
        }
    }
    log::debug!("processing loop stopped");
}
