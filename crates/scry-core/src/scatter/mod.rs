//! Scatter-gather batching over a [`Transport`](crate::memory::Transport).
//!
//! Many small logical reads and writes are collapsed into one physical read
//! transaction followed by at most one physical write transaction. Writes may
//! be computed from the batch's own reads because every read is resolved
//! before any write is serialized.

mod entry;
mod handle;
mod map;

pub use entry::{PtrEntry, ReadEntry, Resolved};
pub use handle::{Checkpoint, CommitOutcome, ExecuteReport, ScatterWriteHandle};
pub use map::ScatterReadMap;
