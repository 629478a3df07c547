use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Stop request shared between a controller and its worker loops.
///
/// The scheduler worker checks it before every tick and sleeps its gate and
/// error back-offs through [`wait`](Self::wait), so `SchedulerHandle::shutdown`
/// or a Ctrl+C in `scry watch` takes effect within one tick instead of one
/// back-off. A stop request is final: the signal never resets.
pub struct ShutdownSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        // The flag is a plain bool, so a poisoned lock still holds a valid value
        self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request a stop and wake every worker sleeping in a back-off.
    pub fn trigger(&self) {
        *self.state() = true;
        self.wake.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.state()
    }

    /// Sleep a back-off of `duration`, cut short by a stop request.
    ///
    /// Returns `true` if the worker should stop.
    pub fn wait(&self, duration: Duration) -> bool {
        let guard = self.state();
        if *guard {
            return true;
        }
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_trigger_is_final() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_backoff_runs_full_duration() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();

        assert!(!signal.wait(Duration::from_millis(50)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[test]
    fn test_stop_cuts_backoff_short() {
        let signal = Arc::new(ShutdownSignal::new());
        let worker = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                let start = Instant::now();
                (signal.wait(Duration::from_secs(10)), start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        signal.trigger();

        let (stopped, elapsed) = worker.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_after_stop_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
