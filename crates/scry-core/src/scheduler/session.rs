use strum::{Display, IntoStaticStr};

/// Session state supplied by whatever tracks the target's lifecycle.
pub trait SessionProbe: Send + Sync {
    /// Transport attached and the target past its loading phase
    fn is_ready(&self) -> bool;

    fn in_session(&self) -> bool;

    fn local_entity(&self) -> Option<u64>;

    fn sub_handle(&self, local_entity: u64) -> Option<u64>;

    /// Final check right before a batch is committed.
    fn safe_to_write(&self) -> bool {
        self.is_ready() && self.in_session()
    }
}

/// Source of the global write switch
pub trait ConfigStore: Send + Sync {
    fn writes_enabled(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum SessionEvent {
    SessionStarted,
    SessionStopped,
    SubSessionStarted,
    SubSessionEnded,
}

/// Receives session transitions detected by the scheduler.
pub trait SessionObserver: Send + Sync {
    fn on_session_event(&self, event: SessionEvent);
}

/// Edge detector over the probe's session and sub-session state
#[derive(Debug, Default)]
pub(crate) struct SessionTracker {
    in_session: bool,
    sub_session: bool,
}

impl SessionTracker {
    /// Feed the current state; returns the transitions in the order they apply.
    pub(crate) fn update(&mut self, in_session: bool, sub_session: bool) -> Vec<SessionEvent> {
        let sub_session = in_session && sub_session;
        let mut events = Vec::new();

        if self.sub_session && !sub_session {
            events.push(SessionEvent::SubSessionEnded);
        }
        if self.in_session != in_session {
            events.push(if in_session {
                SessionEvent::SessionStarted
            } else {
                SessionEvent::SessionStopped
            });
        }
        if !self.sub_session && sub_session {
            events.push(SessionEvent::SubSessionStarted);
        }

        self.in_session = in_session;
        self.sub_session = sub_session;
        events
    }

    pub(crate) fn in_session(&self) -> bool {
        self.in_session
    }
}
