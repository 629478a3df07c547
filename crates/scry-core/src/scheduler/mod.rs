//! Feature scheduler.
//!
//! Each tick walks `GateCheck -> BuildBatch -> SafetyGate -> Commit`:
//! eligible features add entries to one shared [`ScatterWriteHandle`], and the
//! batch is written only if the write toggle and the probe's safety check
//! still hold at commit time. A tick never commits part of a batch.

mod feature;
mod session;
mod worker;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strum::{Display, IntoStaticStr};
use tracing::{debug, trace, warn};

use crate::config::SchedulerConfig;
use crate::context::MemoryContext;
use crate::error::Result;
use crate::scatter::{CommitOutcome, ScatterWriteHandle};

pub use feature::{Feature, FeatureContext, FeatureStats};
pub use session::{ConfigStore, SessionEvent, SessionObserver, SessionProbe};
pub use worker::SchedulerHandle;

use session::SessionTracker;

/// First gate condition that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum GateFailure {
    WritesDisabled,
    NotReady,
    NoSession,
    NoLocalEntity,
    NoSubHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum TickOutcome {
    /// Preconditions not met; nothing was built
    Gated(GateFailure),
    NoEligibleFeatures,
    /// Batch built but the safety gate closed before commit
    Discarded,
    Committed,
    /// Features ran but queued no writes
    NothingToWrite,
}

struct FeatureSlot {
    feature: Box<dyn Feature>,
    stats: FeatureStats,
}

impl FeatureSlot {
    /// Run the feature's apply step in isolation. Returns whether it succeeded;
    /// on failure its entries are removed from the batch.
    fn apply(
        &mut self,
        ctx: &FeatureContext<'_>,
        batch: &mut ScatterWriteHandle<'_>,
        slow_threshold: Duration,
    ) -> bool {
        let checkpoint = batch.checkpoint();
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.feature.try_apply(ctx, batch)
        }));
        let elapsed = started.elapsed();

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
        };
        self.stats.record(elapsed, failure.is_none());

        if elapsed > slow_threshold {
            warn!("Feature {} is slow: {:?}", self.feature.name(), elapsed);
        }

        let Some(message) = failure else {
            return true;
        };
        batch.rollback(checkpoint);
        // Warn on the first failure of a streak only
        if self.stats.consecutive_failures == 1 {
            warn!("Feature {} failed: {}", self.feature.name(), message);
        } else {
            debug!(
                "Feature {} failed ({} in a row): {}",
                self.feature.name(),
                self.stats.consecutive_failures,
                message
            );
        }
        false
    }
}

/// Run a lifecycle callback so a panic in it is logged instead of unwinding
/// into the tick.
fn isolated(owner: &str, callback: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        warn!(
            "{} panicked in {}: {}",
            owner,
            callback,
            panic_message(payload.as_ref())
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

pub struct FeatureScheduler {
    context: Arc<MemoryContext>,
    probe: Arc<dyn SessionProbe>,
    store: Arc<dyn ConfigStore>,
    config: SchedulerConfig,
    features: Vec<FeatureSlot>,
    observers: Vec<Arc<dyn SessionObserver>>,
    tracker: SessionTracker,
}

impl FeatureScheduler {
    pub fn new(
        context: Arc<MemoryContext>,
        probe: Arc<dyn SessionProbe>,
        store: Arc<dyn ConfigStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            context,
            probe,
            store,
            config,
            features: Vec::new(),
            observers: Vec::new(),
            tracker: SessionTracker::default(),
        }
    }

    pub fn with_feature<F: Feature + 'static>(mut self, feature: F) -> Self {
        self.add_feature(Box::new(feature));
        self
    }

    pub fn add_feature(&mut self, feature: Box<dyn Feature>) {
        debug!("Registered feature {}", feature.name());
        self.features.push(FeatureSlot {
            feature,
            stats: FeatureStats::default(),
        });
    }

    /// Receive session transitions after the features have been notified.
    pub fn subscribe(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    pub fn stats(&self, name: &str) -> Option<FeatureStats> {
        self.features
            .iter()
            .find(|slot| slot.feature.name() == name)
            .map(|slot| slot.stats)
    }

    /// Run one scheduler tick.
    ///
    /// `Err` only when the write transaction itself failed.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        self.context.new_generation();

        let (local_entity, sub_handle) = match self.check_gate() {
            Ok(handles) => handles,
            Err(reason) => {
                trace!("Tick gated: {}", reason);
                return Ok(TickOutcome::Gated(reason));
            }
        };

        let context = Arc::clone(&self.context);
        let ctx = FeatureContext {
            memory: &context,
            local_entity,
            sub_handle,
        };
        let mut batch = ScatterWriteHandle::new(context.transport());
        let slow_threshold = self.config.slow_feature_threshold();

        let mut eligible = 0usize;
        let mut contributors = Vec::new();
        for (index, slot) in self.features.iter_mut().enumerate() {
            if !slot.feature.can_run() {
                continue;
            }
            eligible += 1;
            if slot.apply(&ctx, &mut batch, slow_threshold) {
                contributors.push(index);
            }
        }
        if eligible == 0 {
            return Ok(TickOutcome::NoEligibleFeatures);
        }

        let queued = batch.write_count();
        let store = Arc::clone(&self.store);
        let probe = Arc::clone(&self.probe);
        let report = batch.execute(|| store.writes_enabled() && probe.safe_to_write())?;

        Ok(match report.outcome {
            CommitOutcome::Committed => {
                trace!("Committed {} writes", report.written);
                for index in contributors {
                    let feature = &mut self.features[index].feature;
                    let name = feature.name().to_string();
                    isolated(&name, "on_apply", || feature.on_apply());
                }
                TickOutcome::Committed
            }
            CommitOutcome::Gated => {
                debug!("Safety gate closed, discarded {} writes", queued);
                TickOutcome::Discarded
            }
            CommitOutcome::NothingToWrite => TickOutcome::NothingToWrite,
        })
    }

    fn check_gate(&mut self) -> std::result::Result<(u64, u64), GateFailure> {
        let probe = Arc::clone(&self.probe);
        let ready = probe.is_ready();
        let in_session = ready && probe.in_session();
        let local_entity = if in_session {
            probe.local_entity().filter(|&handle| handle != 0)
        } else {
            None
        };
        let sub_handle = local_entity
            .and_then(|local| probe.sub_handle(local))
            .filter(|&handle| handle != 0);

        let events = self.tracker.update(in_session, sub_handle.is_some());
        self.dispatch(&events);

        if !self.store.writes_enabled() {
            return Err(GateFailure::WritesDisabled);
        }
        if !ready {
            return Err(GateFailure::NotReady);
        }
        if !in_session {
            return Err(GateFailure::NoSession);
        }
        let local_entity = local_entity.ok_or(GateFailure::NoLocalEntity)?;
        let sub_handle = sub_handle.ok_or(GateFailure::NoSubHandle)?;
        Ok((local_entity, sub_handle))
    }

    fn dispatch(&mut self, events: &[SessionEvent]) {
        for &event in events {
            debug!("Session event: {}", event);
            let callback: &'static str = event.into();
            for slot in &mut self.features {
                let feature = &mut slot.feature;
                let name = feature.name().to_string();
                isolated(&name, callback, || match event {
                    SessionEvent::SessionStarted => feature.on_session_start(),
                    SessionEvent::SessionStopped => feature.on_session_stop(),
                    SessionEvent::SubSessionStarted => feature.on_sub_session_start(),
                    SessionEvent::SubSessionEnded => feature.on_sub_session_end(),
                });
            }
            for observer in &self.observers {
                isolated("Session observer", callback, || {
                    observer.on_session_event(event)
                });
            }
        }
    }

    /// Deliver stop transitions for a session still open when the loop exits.
    fn close_session(&mut self) {
        if self.tracker.in_session() {
            let events = self.tracker.update(false, false);
            self.dispatch(&events);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use anyhow::bail;

    use super::*;
    use crate::config::WriteToggle;
    use crate::memory::{MockTransport, MockTransportBuilder};

    pub(crate) const OUT: u64 = 0x6000;
    const LOCAL: u64 = 0x7000;

    pub(crate) struct TestProbe {
        pub ready: AtomicBool,
        pub session: AtomicBool,
        pub local: AtomicU64,
        pub sub: AtomicU64,
        pub safe: AtomicBool,
    }

    impl TestProbe {
        pub(crate) fn active() -> Self {
            Self {
                ready: AtomicBool::new(true),
                session: AtomicBool::new(true),
                local: AtomicU64::new(LOCAL),
                sub: AtomicU64::new(0x7100),
                safe: AtomicBool::new(true),
            }
        }
    }

    impl SessionProbe for TestProbe {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn in_session(&self) -> bool {
            self.session.load(Ordering::SeqCst)
        }

        fn local_entity(&self) -> Option<u64> {
            Some(self.local.load(Ordering::SeqCst))
        }

        fn sub_handle(&self, _local_entity: u64) -> Option<u64> {
            Some(self.sub.load(Ordering::SeqCst))
        }

        fn safe_to_write(&self) -> bool {
            self.safe.load(Ordering::SeqCst)
        }
    }

    pub(crate) type Log = Arc<Mutex<Vec<String>>>;

    /// Writes `value` to `address` every tick and logs its callbacks.
    pub(crate) struct WriteFeature {
        pub name: &'static str,
        pub address: u64,
        pub value: u32,
        pub log: Log,
    }

    impl WriteFeature {
        pub(crate) fn new(name: &'static str, address: u64, log: &Log) -> Self {
            Self {
                name,
                address,
                value: 1,
                log: Arc::clone(log),
            }
        }

        fn note(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, what));
        }
    }

    impl Feature for WriteFeature {
        fn name(&self) -> &str {
            self.name
        }

        fn try_apply(
            &mut self,
            _ctx: &FeatureContext<'_>,
            batch: &mut ScatterWriteHandle<'_>,
        ) -> anyhow::Result<()> {
            batch.add_write(self.address, self.value);
            Ok(())
        }

        fn on_apply(&mut self) {
            self.note("apply");
        }

        fn on_session_start(&mut self) {
            self.note("start");
        }

        fn on_session_stop(&mut self) {
            self.note("stop");
        }

        fn on_sub_session_start(&mut self) {
            self.note("sub_start");
        }

        fn on_sub_session_end(&mut self) {
            self.note("sub_end");
        }
    }

    /// Queues a write, then fails.
    struct FailingFeature;

    impl Feature for FailingFeature {
        fn name(&self) -> &str {
            "failing"
        }

        fn try_apply(
            &mut self,
            _ctx: &FeatureContext<'_>,
            batch: &mut ScatterWriteHandle<'_>,
        ) -> anyhow::Result<()> {
            batch.add_write(OUT + 0x50, 0xBADu32);
            bail!("entity layout changed")
        }
    }

    struct PanickingFeature;

    impl Feature for PanickingFeature {
        fn name(&self) -> &str {
            "panicking"
        }

        fn try_apply(
            &mut self,
            _ctx: &FeatureContext<'_>,
            batch: &mut ScatterWriteHandle<'_>,
        ) -> anyhow::Result<()> {
            batch.add_write(OUT + 0x50, 0xBADu32);
            panic!("index out of bounds");
        }
    }

    /// Writes like [`WriteFeature`] but panics in its lifecycle callbacks.
    pub(crate) struct FragileCallbacks(pub WriteFeature);

    impl Feature for FragileCallbacks {
        fn name(&self) -> &str {
            self.0.name
        }

        fn try_apply(
            &mut self,
            ctx: &FeatureContext<'_>,
            batch: &mut ScatterWriteHandle<'_>,
        ) -> anyhow::Result<()> {
            self.0.try_apply(ctx, batch)
        }

        fn on_apply(&mut self) {
            panic!("apply hook");
        }

        fn on_session_start(&mut self) {
            panic!("session hook");
        }
    }

    struct PanickingObserver;

    impl SessionObserver for PanickingObserver {
        fn on_session_event(&self, _event: SessionEvent) {
            panic!("observer");
        }
    }

    /// Reads the local entity and writes a value derived from it.
    struct DerivedFeature;

    impl Feature for DerivedFeature {
        fn name(&self) -> &str {
            "derived"
        }

        fn try_apply(
            &mut self,
            ctx: &FeatureContext<'_>,
            batch: &mut ScatterWriteHandle<'_>,
        ) -> anyhow::Result<()> {
            let health = batch.add_read::<u32>(ctx.local_entity);
            batch.add_write_with(OUT + 0x20, move |resolved| {
                resolved.get(health).map(|v| v * 2)
            });
            Ok(())
        }
    }

    /// Closes the write toggle while the batch is being built.
    struct ToggleFeature(Arc<WriteToggle>);

    impl Feature for ToggleFeature {
        fn name(&self) -> &str {
            "toggle"
        }

        fn try_apply(
            &mut self,
            _ctx: &FeatureContext<'_>,
            batch: &mut ScatterWriteHandle<'_>,
        ) -> anyhow::Result<()> {
            batch.add_write(OUT, 1u32);
            self.0.set(false);
            Ok(())
        }
    }

    struct Idle;

    impl Feature for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        fn can_run(&self) -> bool {
            false
        }

        fn try_apply(
            &mut self,
            _ctx: &FeatureContext<'_>,
            _batch: &mut ScatterWriteHandle<'_>,
        ) -> anyhow::Result<()> {
            unreachable!("never eligible")
        }
    }

    struct Recorder(Mutex<Vec<SessionEvent>>);

    impl SessionObserver for Recorder {
        fn on_session_event(&self, event: SessionEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    pub(crate) fn target() -> Arc<MockTransport> {
        Arc::new(
            MockTransportBuilder::new()
                .map(OUT, 0x100)
                .u32(LOCAL, 21)
                .build(),
        )
    }

    pub(crate) fn scheduler(
        mock: &Arc<MockTransport>,
        probe: &Arc<TestProbe>,
        toggle: &Arc<WriteToggle>,
    ) -> FeatureScheduler {
        FeatureScheduler::new(
            Arc::new(MemoryContext::new(mock.clone())),
            probe.clone(),
            toggle.clone(),
            SchedulerConfig::default(),
        )
    }

    pub(crate) fn setup() -> (Arc<MockTransport>, Arc<TestProbe>, Arc<WriteToggle>, Log) {
        (
            target(),
            Arc::new(TestProbe::active()),
            Arc::new(WriteToggle::new(true)),
            Log::default(),
        )
    }

    fn written_addresses(mock: &MockTransport) -> Vec<u64> {
        mock.write_batches()
            .iter()
            .flatten()
            .map(|w| w.address)
            .collect()
    }

    #[test]
    fn test_failing_feature_is_isolated() {
        let (mock, probe, toggle, log) = setup();
        let mut scheduler = scheduler(&mock, &probe, &toggle)
            .with_feature(WriteFeature::new("first", OUT, &log))
            .with_feature(FailingFeature)
            .with_feature(WriteFeature::new("third", OUT + 8, &log));

        assert_eq!(scheduler.tick().unwrap(), TickOutcome::Committed);
        assert_eq!(mock.write_transactions(), 1);
        assert_eq!(written_addresses(&mock), vec![OUT, OUT + 8]);

        let stats = scheduler.stats("failing").unwrap();
        assert_eq!(stats.failures, 1);
        assert_eq!(scheduler.stats("first").unwrap().failures, 0);

        let log = log.lock().unwrap();
        assert!(log.contains(&"first:apply".to_string()));
        assert!(log.contains(&"third:apply".to_string()));
    }

    #[test]
    fn test_panicking_feature_is_isolated() {
        let (mock, probe, toggle, log) = setup();
        let mut scheduler = scheduler(&mock, &probe, &toggle)
            .with_feature(WriteFeature::new("first", OUT, &log))
            .with_feature(PanickingFeature)
            .with_feature(WriteFeature::new("third", OUT + 8, &log));

        assert_eq!(scheduler.tick().unwrap(), TickOutcome::Committed);
        assert_eq!(written_addresses(&mock), vec![OUT, OUT + 8]);
        assert_eq!(scheduler.stats("panicking").unwrap().failures, 1);

        // Still isolated on the next tick
        assert_eq!(scheduler.tick().unwrap(), TickOutcome::Committed);
        assert_eq!(scheduler.stats("panicking").unwrap().consecutive_failures, 2);
    }

    #[test]
    fn test_panicking_callbacks_do_not_abort_tick() {
        let (mock, probe, toggle, log) = setup();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut scheduler = scheduler(&mock, &probe, &toggle)
            .with_feature(FragileCallbacks(WriteFeature::new("fragile", OUT, &log)))
            .with_feature(WriteFeature::new("steady", OUT + 8, &log));
        scheduler.subscribe(Arc::new(PanickingObserver));
        scheduler.subscribe(recorder.clone());

        assert_eq!(scheduler.tick().unwrap(), TickOutcome::Committed);
        assert_eq!(written_addresses(&mock), vec![OUT, OUT + 8]);

        // Later features and observers still hear about the session
        let log = log.lock().unwrap();
        assert!(log.contains(&"steady:start".to_string()));
        assert!(log.contains(&"steady:apply".to_string()));
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![SessionEvent::SessionStarted, SessionEvent::SubSessionStarted]
        );
    }

    #[test]
    fn test_safety_gate_closing_during_build_discards_batch() {
        let (mock, probe, toggle, log) = setup();
        let mut scheduler = scheduler(&mock, &probe, &toggle)
            .with_feature(WriteFeature::new("first", OUT + 4, &log))
            .with_feature(ToggleFeature(toggle.clone()));

        assert_eq!(scheduler.tick().unwrap(), TickOutcome::Discarded);
        assert_eq!(mock.write_transactions(), 0);
        assert!(!log.lock().unwrap().contains(&"first:apply".to_string()));
    }

    #[test]
    fn test_unsafe_probe_discards_batch() {
        let (mock, probe, toggle, log) = setup();
        probe.safe.store(false, Ordering::SeqCst);
        let mut scheduler =
            scheduler(&mock, &probe, &toggle).with_feature(WriteFeature::new("a", OUT, &log));

        assert_eq!(scheduler.tick().unwrap(), TickOutcome::Discarded);
        assert_eq!(mock.write_transactions(), 0);
    }

    #[test]
    fn test_gate_conditions() {
        let (mock, probe, toggle, log) = setup();
        let mut scheduler =
            scheduler(&mock, &probe, &toggle).with_feature(WriteFeature::new("a", OUT, &log));

        toggle.set(false);
        assert_eq!(
            scheduler.tick().unwrap(),
            TickOutcome::Gated(GateFailure::WritesDisabled)
        );
        toggle.set(true);

        probe.sub.store(0, Ordering::SeqCst);
        assert_eq!(
            scheduler.tick().unwrap(),
            TickOutcome::Gated(GateFailure::NoSubHandle)
        );

        probe.local.store(0, Ordering::SeqCst);
        assert_eq!(
            scheduler.tick().unwrap(),
            TickOutcome::Gated(GateFailure::NoLocalEntity)
        );

        probe.session.store(false, Ordering::SeqCst);
        assert_eq!(
            scheduler.tick().unwrap(),
            TickOutcome::Gated(GateFailure::NoSession)
        );

        probe.ready.store(false, Ordering::SeqCst);
        assert_eq!(
            scheduler.tick().unwrap(),
            TickOutcome::Gated(GateFailure::NotReady)
        );

        assert_eq!(mock.write_transactions(), 0);
        assert_eq!(mock.read_transactions(), 0);
    }

    #[test]
    fn test_no_eligible_features() {
        let (mock, probe, toggle, _) = setup();
        let mut scheduler = scheduler(&mock, &probe, &toggle).with_feature(Idle);

        assert_eq!(scheduler.tick().unwrap(), TickOutcome::NoEligibleFeatures);
    }

    #[test]
    fn test_only_failures_write_nothing() {
        let (mock, probe, toggle, _) = setup();
        let mut scheduler = scheduler(&mock, &probe, &toggle).with_feature(FailingFeature);

        assert_eq!(scheduler.tick().unwrap(), TickOutcome::NothingToWrite);
        assert_eq!(mock.write_transactions(), 0);
    }

    #[test]
    fn test_feature_reads_before_write() {
        let (mock, probe, toggle, _) = setup();
        let mut scheduler = scheduler(&mock, &probe, &toggle).with_feature(DerivedFeature);

        assert_eq!(scheduler.tick().unwrap(), TickOutcome::Committed);
        assert_eq!(mock.read_transactions(), 1);
        assert_eq!(mock.peek(OUT + 0x20, 4).unwrap(), 42u32.to_le_bytes());
    }

    #[test]
    fn test_write_failure_is_an_error() {
        let (mock, probe, toggle, log) = setup();
        mock.set_fail_writes(true);
        let mut scheduler =
            scheduler(&mock, &probe, &toggle).with_feature(WriteFeature::new("a", OUT, &log));

        assert!(scheduler.tick().unwrap_err().is_transport());
        assert!(log.lock().unwrap().iter().all(|entry| entry != "a:apply"));
    }

    #[test]
    fn test_session_transitions() {
        let (mock, probe, toggle, log) = setup();
        probe.session.store(false, Ordering::SeqCst);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut scheduler =
            scheduler(&mock, &probe, &toggle).with_feature(WriteFeature::new("a", OUT, &log));
        scheduler.subscribe(recorder.clone());

        scheduler.tick().unwrap();
        probe.session.store(true, Ordering::SeqCst);
        scheduler.tick().unwrap();
        probe.sub.store(0, Ordering::SeqCst);
        scheduler.tick().unwrap();
        probe.session.store(false, Ordering::SeqCst);
        scheduler.tick().unwrap();

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                SessionEvent::SessionStarted,
                SessionEvent::SubSessionStarted,
                SessionEvent::SubSessionEnded,
                SessionEvent::SessionStopped,
            ]
        );
        let log = log.lock().unwrap();
        let lifecycle: Vec<&str> = log
            .iter()
            .map(String::as_str)
            .filter(|entry| *entry != "a:apply")
            .collect();
        assert_eq!(lifecycle, vec!["a:start", "a:sub_start", "a:sub_end", "a:stop"]);
    }

    #[test]
    fn test_transitions_tracked_while_writes_disabled() {
        let (mock, probe, toggle, _) = setup();
        toggle.set(false);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut scheduler = scheduler(&mock, &probe, &toggle);
        scheduler.subscribe(recorder.clone());

        scheduler.tick().unwrap();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![SessionEvent::SessionStarted, SessionEvent::SubSessionStarted]
        );
    }
}
