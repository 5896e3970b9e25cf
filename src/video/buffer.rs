//! Latest-wins frame buffer
//!
//! One writer (the capture loop) replaces the slot on every frame; any number
//! of readers take cheap `Arc` clones of whatever is current. Frames that were
//! never read are dropped. There is no queue and no backpressure.

use parking_lot::Mutex;
use std::sync::Arc;

use super::VideoFrame;

/// A frame as stored in the buffer, tagged with its capture order
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    /// Monotonic sequence number, starting at 1 for the first frame
    pub sequence: u64,
    pub frame: Arc<VideoFrame>,
}

#[derive(Default)]
struct Slot {
    sequence: u64,
    frame: Option<Arc<VideoFrame>>,
}

/// Thread-safe single-slot holder for the most recent frame
#[derive(Default)]
pub struct FrameBuffer {
    slot: Mutex<Slot>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the newest frame, replacing any previous one
    pub fn put(&self, frame: VideoFrame) -> BufferedFrame {
        let frame = Arc::new(frame);
        let mut slot = self.slot.lock();
        slot.sequence += 1;
        slot.frame = Some(Arc::clone(&frame));
        BufferedFrame {
            sequence: slot.sequence,
            frame,
        }
    }

    /// Latest frame, or `None` before the first capture
    pub fn get(&self) -> Option<BufferedFrame> {
        let slot = self.slot.lock();
        slot.frame.as_ref().map(|frame| BufferedFrame {
            sequence: slot.sequence,
            frame: Arc::clone(frame),
        })
    }

    /// Sequence number of the latest frame (0 if none yet)
    pub fn sequence(&self) -> u64 {
        self.slot.lock().sequence
    }

    /// Drop the current frame. The sequence keeps counting so readers never see it go backwards.
    pub fn clear(&self) {
        self.slot.lock().frame = None;
    }
}
