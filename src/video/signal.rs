//! Cooperative stop signal for the worker loops
//!
//! Throttle sleeps and recovery backoff wait on a condvar instead of plain
//! `thread::sleep`, so `stop` wakes them immediately.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request stop and wake every sleeper
    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for up to `timeout`. Returns `true` if stop was requested.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sleep_times_out_without_stop() {
        let signal = StopSignal::new();
        let started = Instant::now();
        assert!(!signal.sleep(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_stop_wakes_sleeper() {
        let signal = Arc::new(StopSignal::new());
        let sleeper = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                let started = Instant::now();
                let stopped = signal.sleep(Duration::from_secs(10));
                (stopped, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        signal.stop();
        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_after_stop_returns_immediately() {
        let signal = StopSignal::new();
        signal.stop();
        assert!(signal.is_stopped());
        assert!(signal.sleep(Duration::from_secs(10)));
    }
}
