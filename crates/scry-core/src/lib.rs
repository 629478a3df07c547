//! # scry-core
//!
//! Memory introspection core for a live target process.
//!
//! This crate provides:
//! - A transport abstraction over "read N bytes at A" / "write N bytes at A",
//!   with a Windows process implementation and a generation read cache
//! - Scatter-gather batches: one read and at most one write transaction per batch
//! - Pooled mirror containers for remote hash maps and hash sets
//! - A native call bridge running functions inside the target through a hooked
//!   trampoline
//! - A feature scheduler that gates and commits engineered writes
//!
//! ## Feature Flags
//!
//! - `mock`: Exposes `MockTransport`, an in-memory transport for tests and
//!   offline tooling.

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod mirror;
pub mod scatter;
pub mod scheduler;
pub mod shutdown;

pub use bridge::{BridgeConfig, NativeCallBridge};
pub use config::{
    ScryConfig, SchedulerConfig, WriteToggle, load_config, load_config_or_default, save_config,
};
pub use context::MemoryContext;
pub use error::{Error, Result};
#[cfg(any(test, feature = "mock"))]
pub use memory::{MockTransport, MockTransportBuilder};
#[cfg(target_os = "windows")]
pub use memory::{ProcessInfo, ProcessTransport};
pub use memory::{ReadCache, RemoteValue, Transport, TransportExt, read_utf16_string};
pub use mirror::{MAX_MIRROR_COUNT, MemDictionary, MemHashSet, MirrorLayout, MirrorPool};
pub use scatter::{
    CommitOutcome, ExecuteReport, PtrEntry, ReadEntry, Resolved, ScatterReadMap,
    ScatterWriteHandle,
};
pub use scheduler::{
    ConfigStore, Feature, FeatureContext, FeatureScheduler, FeatureStats, GateFailure,
    SchedulerHandle, SessionEvent, SessionObserver, SessionProbe, TickOutcome,
};
pub use shutdown::ShutdownSignal;
