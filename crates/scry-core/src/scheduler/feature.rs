use std::time::Duration;

use crate::context::MemoryContext;
use crate::scatter::ScatterWriteHandle;

/// What a feature sees during one tick.
#[derive(Clone, Copy)]
pub struct FeatureContext<'a> {
    pub memory: &'a MemoryContext,
    /// Handle of the local entity for this session
    pub local_entity: u64,
    /// Secondary handle owned by the local entity (e.g. the held item)
    pub sub_handle: u64,
}

/// A unit of engineered writes driven by the scheduler.
///
/// `try_apply` adds entries to the shared batch. Returning an error (or
/// panicking) drops everything this feature added in the current tick; the
/// other features' entries are kept.
pub trait Feature: Send {
    fn name(&self) -> &str;

    /// Whether the feature wants to run this tick
    fn can_run(&self) -> bool {
        true
    }

    fn try_apply(
        &mut self,
        ctx: &FeatureContext<'_>,
        batch: &mut ScatterWriteHandle<'_>,
    ) -> anyhow::Result<()>;

    /// Called after a batch containing this feature's entries was committed.
    fn on_apply(&mut self) {}

    fn on_session_start(&mut self) {}

    fn on_session_stop(&mut self) {}

    fn on_sub_session_start(&mut self) {}

    fn on_sub_session_end(&mut self) {}
}

/// Per-feature timing and failure counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureStats {
    pub runs: u64,
    pub failures: u64,
    /// Failures since the last successful apply
    pub consecutive_failures: u32,
    pub last_elapsed: Duration,
    pub max_elapsed: Duration,
}

impl FeatureStats {
    pub(crate) fn record(&mut self, elapsed: Duration, ok: bool) {
        self.runs += 1;
        self.last_elapsed = elapsed;
        self.max_elapsed = self.max_elapsed.max(elapsed);
        if ok {
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }
}
