use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, trace, warn};

use super::{FeatureScheduler, TickOutcome, panic_message};
use crate::error::Result;
use crate::shutdown::ShutdownSignal;

/// Running scheduler thread.
pub struct SchedulerHandle {
    shutdown: Arc<ShutdownSignal>,
    done: mpsc::Receiver<()>,
    thread: JoinHandle<FeatureScheduler>,
    join_timeout: Duration,
}

impl FeatureScheduler {
    /// Move the scheduler onto its own worker thread.
    pub fn spawn(self) -> Result<SchedulerHandle> {
        let shutdown = Arc::new(ShutdownSignal::new());
        let (done_tx, done) = mpsc::channel();
        let join_timeout = self.config.join_timeout();

        let signal = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("scry-scheduler".to_string())
            .spawn(move || {
                let scheduler = self.run(&signal);
                let _ = done_tx.send(());
                scheduler
            })?;

        Ok(SchedulerHandle {
            shutdown,
            done,
            thread,
            join_timeout,
        })
    }

    fn run(mut self, shutdown: &ShutdownSignal) -> Self {
        info!(
            "Feature scheduler started with {} features",
            self.features.len()
        );

        while !shutdown.is_shutdown() {
            let pause = match panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
                Ok(Ok(TickOutcome::Gated(_))) => self.config.gate_backoff(),
                Ok(Ok(outcome)) => {
                    trace!("Tick: {}", outcome);
                    self.config.tick_interval()
                }
                Ok(Err(e)) => {
                    warn!("Scheduler tick failed: {}", e);
                    self.config.error_backoff()
                }
                Err(payload) => {
                    warn!("Scheduler tick panicked: {}", panic_message(payload.as_ref()));
                    self.config.error_backoff()
                }
            };
            if shutdown.wait(pause) {
                break;
            }
        }

        self.close_session();
        info!("Feature scheduler stopped");
        self
    }
}

impl SchedulerHandle {
    /// The signal the worker checks every iteration.
    pub fn signal(&self) -> Arc<ShutdownSignal> {
        Arc::clone(&self.shutdown)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stop the worker and wait up to the configured join timeout.
    ///
    /// Returns the scheduler (with its stats) if the thread exited in time;
    /// `None` if it is still stuck in a tick, in which case it is detached.
    pub fn shutdown(self) -> Option<FeatureScheduler> {
        self.shutdown.trigger();

        match self.done.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => match self.thread.join() {
                Ok(scheduler) => Some(scheduler),
                Err(_) => {
                    warn!("Feature scheduler thread panicked");
                    None
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Feature scheduler did not stop within {:?}, detaching",
                    self.join_timeout
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::context::MemoryContext;
    use crate::scatter::ScatterWriteHandle;
    use crate::scheduler::tests::{FragileCallbacks, OUT, TestProbe, WriteFeature, setup};
    use crate::scheduler::{Feature, FeatureContext, SessionEvent, SessionObserver, SessionProbe};

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::builder()
            .tick_interval(Duration::from_millis(1))
            .gate_backoff(Duration::from_millis(1))
            .join_timeout(Duration::from_millis(500))
            .build()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    struct Stopped(AtomicBool);

    impl SessionObserver for Stopped {
        fn on_session_event(&self, event: SessionEvent) {
            if event == SessionEvent::SessionStopped {
                self.0.store(true, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let (mock, probe, toggle, log) = setup();
        let stopped = Arc::new(Stopped(AtomicBool::new(false)));
        let mut scheduler = FeatureScheduler::new(
            Arc::new(MemoryContext::new(mock.clone())),
            probe,
            toggle,
            fast_config(),
        )
        .with_feature(WriteFeature::new("a", OUT, &log));
        scheduler.subscribe(stopped.clone());

        let handle = scheduler.spawn().unwrap();
        assert!(wait_for(|| mock.write_transactions() >= 3));

        let started = Instant::now();
        let scheduler = handle.shutdown().expect("worker stops in time");
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(scheduler.stats("a").unwrap().runs >= 3);
        // Open session closed on exit
        assert!(stopped.0.load(Ordering::SeqCst));
    }

    #[test]
    fn test_gated_worker_keeps_running() {
        let (mock, probe, toggle, _) = setup();
        toggle.set(false);
        let scheduler = FeatureScheduler::new(
            Arc::new(MemoryContext::new(mock.clone())),
            probe,
            toggle.clone(),
            fast_config(),
        );

        let handle = scheduler.spawn().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        assert!(handle.shutdown().is_some());
        assert_eq!(mock.write_transactions(), 0);
    }

    /// Panics on its first readiness check, then delegates.
    struct FlakyProbe {
        inner: TestProbe,
        tripped: AtomicBool,
    }

    impl SessionProbe for FlakyProbe {
        fn is_ready(&self) -> bool {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("torn session state");
            }
            self.inner.is_ready()
        }

        fn in_session(&self) -> bool {
            self.inner.in_session()
        }

        fn local_entity(&self) -> Option<u64> {
            self.inner.local_entity()
        }

        fn sub_handle(&self, local_entity: u64) -> Option<u64> {
            self.inner.sub_handle(local_entity)
        }

        fn safe_to_write(&self) -> bool {
            self.inner.safe_to_write()
        }
    }

    #[test]
    fn test_worker_survives_panics() {
        let (mock, _, toggle, log) = setup();
        let probe = Arc::new(FlakyProbe {
            inner: TestProbe::active(),
            tripped: AtomicBool::new(false),
        });
        let config = SchedulerConfig::builder()
            .tick_interval(Duration::from_millis(1))
            .gate_backoff(Duration::from_millis(1))
            .error_backoff(Duration::from_millis(1))
            .join_timeout(Duration::from_millis(500))
            .build();
        let scheduler = FeatureScheduler::new(
            Arc::new(MemoryContext::new(mock.clone())),
            probe,
            toggle,
            config,
        )
        .with_feature(FragileCallbacks(WriteFeature::new("fragile", OUT, &log)));

        let handle = scheduler.spawn().unwrap();
        assert!(wait_for(|| mock.write_transactions() >= 3));
        assert!(!handle.is_finished());

        let scheduler = handle.shutdown().expect("worker stops in time");
        assert!(scheduler.stats("fragile").unwrap().runs >= 3);
    }

    struct Stuck;

    impl Feature for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn try_apply(
            &mut self,
            _ctx: &FeatureContext<'_>,
            _batch: &mut ScatterWriteHandle<'_>,
        ) -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(400));
            Ok(())
        }
    }

    #[test]
    fn test_shutdown_join_is_bounded() {
        let (mock, probe, toggle, _) = setup();
        let config = SchedulerConfig::builder()
            .join_timeout(Duration::from_millis(50))
            .build();
        let scheduler =
            FeatureScheduler::new(Arc::new(MemoryContext::new(mock)), probe, toggle, config)
                .with_feature(Stuck);

        let handle = scheduler.spawn().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(handle.shutdown().is_none());
        assert!(started.elapsed() < Duration::from_millis(300));
    }
}
