//! Device recovery
//!
//! When the capture loop sees too many consecutive read failures it closes the
//! device and walks an ordered list of backends, waiting a short backoff
//! before each one and a longer one before the last-resort fallback. The first
//! backend that opens and passes a verification read wins. Running out of
//! backends is reported as `RecoveryExhausted`; nothing retries automatically.

use std::time::Duration;

use super::device::{Backend, DeviceHandle};
use super::signal::StopSignal;
use super::{Result, VisionError};
use crate::config::{DeviceConfig, RecoverySettings};

/// Failure counting and cycle bookkeeping for one capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryState {
    /// Consecutive read failures that trigger a cycle
    pub threshold: u32,
    /// Read failures since the last good frame
    pub consecutive_failures: u32,
    /// Position in the backend plan of the attempt in flight (or last tried)
    pub attempt_index: usize,
    /// Recovery cycles started this session
    pub cycles: u32,
}

impl RecoveryState {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            attempt_index: 0,
            cycles: 0,
        }
    }

    /// Count a failed read. Returns `true` exactly when the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures == self.threshold
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Start a new cycle and return its number
    pub fn begin_cycle(&mut self) -> u32 {
        self.cycles += 1;
        self.attempt_index = 0;
        self.cycles
    }

    /// Back to a clean slate after a successful recovery
    pub fn recovered(&mut self) {
        self.consecutive_failures = 0;
        self.attempt_index = 0;
    }
}

/// Ordered backend fallback with backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStrategy {
    backends: Vec<Backend>,
    fallback: Option<Backend>,
    backoff: Duration,
    final_backoff: Duration,
}

impl RecoveryStrategy {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends,
            fallback: None,
            backoff: Duration::from_millis(500),
            final_backoff: Duration::from_millis(2000),
        }
    }

    pub fn from_settings(settings: &RecoverySettings) -> Self {
        Self {
            backends: settings.backends.clone(),
            fallback: settings.fallback,
            backoff: Duration::from_millis(settings.backoff_ms),
            final_backoff: Duration::from_millis(settings.final_backoff_ms),
        }
    }

    /// Last-resort backend tried after the final backoff
    pub fn with_fallback(mut self, fallback: Option<Backend>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration, final_backoff: Duration) -> Self {
        self.backoff = backoff;
        self.final_backoff = final_backoff;
        self
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Backend used for the initial open
    pub fn primary(&self) -> Option<Backend> {
        self.backends.first().copied().or(self.fallback)
    }

    /// Every attempt of one cycle with the delay that precedes it
    pub fn plan(&self) -> Vec<(Duration, Backend)> {
        let mut plan: Vec<_> = self.backends.iter().map(|&b| (self.backoff, b)).collect();
        if let Some(fallback) = self.fallback {
            plan.push((self.final_backoff, fallback));
        }
        plan
    }

    /// Upper bound on how long one cycle spends sleeping
    pub fn total_backoff(&self) -> Duration {
        self.plan().iter().map(|(delay, _)| *delay).sum()
    }

    /// Run one recovery cycle against `device`.
    ///
    /// Closes the device, then tries each planned backend in turn. Returns the
    /// backend that succeeded, `RecoveryExhausted` when none did, or
    /// `Cancelled` if `stop` fired during a backoff or while a backend was
    /// opening. A cancelled cycle leaves the device closed.
    pub fn run(
        &self,
        device: &mut DeviceHandle,
        config: &DeviceConfig,
        state: &mut RecoveryState,
        stop: &StopSignal,
    ) -> Result<Backend> {
        device.close();
        let plan = self.plan();

        for (index, (delay, backend)) in plan.iter().enumerate() {
            state.attempt_index = index;
            if stop.sleep(*delay) {
                return Err(VisionError::Cancelled);
            }
            let opened = device.open(config, *backend);
            if stop.is_stopped() {
                device.close();
                return Err(VisionError::Cancelled);
            }
            match opened {
                Ok(()) => {
                    log::info!(
                        "camera {} recovered via {} (attempt {}/{})",
                        config.index,
                        backend,
                        index + 1,
                        plan.len()
                    );
                    state.recovered();
                    return Ok(*backend);
                }
                Err(e) => log::warn!("recovery attempt {}/{} failed: {}", index + 1, plan.len(), e),
            }
        }

        Err(VisionError::RecoveryExhausted {
            attempts: plan.len() as u32,
        })
    }
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self::from_settings(&RecoverySettings::default())
    }
}
