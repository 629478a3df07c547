//! Run the scheduler with no features and report what it sees.
//!
//! Useful to check that a session probe resolves before wiring features.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use owo_colors::OwoColorize;
use scry_core::{
    FeatureScheduler, MemoryContext, ScryConfig, SessionEvent, SessionObserver, SessionProbe,
    ShutdownSignal, Transport, TransportExt, WriteToggle,
};
use tracing::info;

use super::Target;

/// Session probe that follows a pointer chain: a static slot holding the local
/// entity, and a field in the entity holding the sub handle.
struct PointerProbe {
    transport: Arc<dyn Transport>,
    entity_slot: Option<u64>,
    sub_offset: u64,
}

impl SessionProbe for PointerProbe {
    fn is_ready(&self) -> bool {
        match self.entity_slot {
            Some(slot) => self.transport.read_u64(slot).is_ok(),
            None => true,
        }
    }

    fn in_session(&self) -> bool {
        self.local_entity().is_some()
    }

    fn local_entity(&self) -> Option<u64> {
        self.transport.read_ptr(self.entity_slot?).ok()
    }

    fn sub_handle(&self, local_entity: u64) -> Option<u64> {
        self.transport
            .read_ptr(local_entity + self.sub_offset)
            .ok()
    }
}

struct PrintEvents;

impl SessionObserver for PrintEvents {
    fn on_session_event(&self, event: SessionEvent) {
        let label: &'static str = event.into();
        match event {
            SessionEvent::SessionStarted | SessionEvent::SubSessionStarted => {
                println!("{}", label.green())
            }
            SessionEvent::SessionStopped | SessionEvent::SubSessionEnded => {
                println!("{}", label.yellow())
            }
        }
    }
}

pub fn run(
    target: &Target<'_>,
    config: &ScryConfig,
    entity_slot: Option<u64>,
    sub_offset: u64,
) -> Result<()> {
    let shutdown = Arc::new(ShutdownSignal::new());
    let shutdown_ctrlc = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping...");
        shutdown_ctrlc.trigger();
    })?;

    let transport = target.attach()?;
    let probe = Arc::new(PointerProbe {
        transport: Arc::clone(&transport),
        entity_slot,
        sub_offset,
    });
    let toggle = Arc::new(WriteToggle::new(config.writes_enabled));
    let context = Arc::new(MemoryContext::with_layout(transport, config.mirror));

    let mut scheduler =
        FeatureScheduler::new(context, probe, toggle, config.scheduler.clone());
    scheduler.subscribe(Arc::new(PrintEvents));
    let handle = scheduler.spawn()?;

    println!("Watching session state (Ctrl+C to stop)");
    while !shutdown.wait(Duration::from_millis(200)) {
        if handle.is_finished() {
            break;
        }
    }

    if handle.shutdown().is_none() {
        anyhow::bail!("Scheduler did not stop in time");
    }
    Ok(())
}
