use strum::{Display, IntoStaticStr};
use tracing::trace;

use crate::error::Result;
use crate::memory::value::encode;
use crate::memory::{RemoteValue, ScatterRead, ScatterWrite, Transport};
use crate::scatter::entry::{PtrEntry, ReadEntry, Resolved, read_batch};

type DeferredWrite<'a> = Box<dyn FnOnce(&Resolved) -> Option<(u64, Vec<u8>)> + Send + 'a>;
type Completion<'a> = Box<dyn FnOnce(bool) + Send + 'a>;

enum PendingWrite<'a> {
    Ready(ScatterWrite),
    Deferred(DeferredWrite<'a>),
}

/// Result of the commit phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum CommitOutcome {
    /// The write transaction was issued and succeeded
    Committed,
    /// Writes were queued but the commit predicate was false; nothing was written
    Gated,
    /// No write survived resolution (or none was queued)
    NothingToWrite,
}

/// What happened when a batch executed
#[derive(Debug)]
pub struct ExecuteReport {
    pub outcome: CommitOutcome,
    pub resolved: Resolved,
    /// Writes serialized into the transaction (zero unless committed)
    pub written: usize,
    /// Writes dropped because their address or value could not be resolved
    pub failed_writes: usize,
}

impl ExecuteReport {
    pub fn committed(&self) -> bool {
        self.outcome == CommitOutcome::Committed
    }
}

/// Saved batch length, for dropping everything added after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    reads: usize,
    writes: usize,
    completions: usize,
}

/// An ordered batch of reads and writes executed as at most one read
/// transaction and one write transaction.
///
/// The handle is consumed by [`execute`](Self::execute), so nothing queued in
/// one tick can leak into the next.
pub struct ScatterWriteHandle<'a> {
    transport: &'a dyn Transport,
    reads: Vec<ScatterRead>,
    writes: Vec<PendingWrite<'a>>,
    completions: Vec<Completion<'a>>,
}

impl<'a> ScatterWriteHandle<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self {
            transport,
            reads: Vec::new(),
            writes: Vec::new(),
            completions: Vec::new(),
        }
    }

    pub fn add_read<T: RemoteValue>(&mut self, address: u64) -> ReadEntry<T> {
        self.reads.push(ScatterRead::new(address, T::SIZE));
        ReadEntry::new(self.reads.len() - 1)
    }

    pub fn add_ptr(&mut self, address: u64) -> PtrEntry {
        PtrEntry {
            entry: self.add_read::<u64>(address),
        }
    }

    pub fn add_write<T: RemoteValue>(&mut self, address: u64, value: T) {
        self.writes.push(PendingWrite::Ready(ScatterWrite {
            address,
            data: encode(value),
        }));
    }

    pub fn add_write_bytes(&mut self, address: u64, data: Vec<u8>) {
        self.writes
            .push(PendingWrite::Ready(ScatterWrite { address, data }));
    }

    /// Queue a write whose value is computed from this batch's reads.
    ///
    /// Returning `None` drops the write (for example when a read it depends
    /// on failed).
    pub fn add_write_with<T, F>(&mut self, address: u64, value: F)
    where
        T: RemoteValue,
        F: FnOnce(&Resolved) -> Option<T> + Send + 'a,
    {
        self.writes.push(PendingWrite::Deferred(Box::new(move |resolved| {
            value(resolved).map(|v| (address, encode(v)))
        })));
    }

    /// Queue a write whose address and value are both computed from this
    /// batch's reads, e.g. a field behind a pointer read in the same batch.
    pub fn add_write_at<T, F>(&mut self, target: F)
    where
        T: RemoteValue,
        F: FnOnce(&Resolved) -> Option<(u64, T)> + Send + 'a,
    {
        self.writes.push(PendingWrite::Deferred(Box::new(move |resolved| {
            target(resolved).map(|(address, v)| (address, encode(v)))
        })));
    }

    /// Run `callback` after the batch finishes, with whether the write
    /// transaction was committed.
    pub fn on_complete<F>(&mut self, callback: F)
    where
        F: FnOnce(bool) + Send + 'a,
    {
        self.completions.push(Box::new(callback));
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            reads: self.reads.len(),
            writes: self.writes.len(),
            completions: self.completions.len(),
        }
    }

    /// Drop everything queued after `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.reads.truncate(checkpoint.reads);
        self.writes.truncate(checkpoint.writes);
        self.completions.truncate(checkpoint.completions);
    }

    pub fn read_count(&self) -> usize {
        self.reads.len()
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Execute the batch.
    ///
    /// 1. One scatter read for all queued reads. Failures are flagged per
    ///    entry; a failed transaction marks every read failed.
    /// 2. Deferred writes are resolved against the reads.
    /// 3. If any write survives, `commit` is evaluated immediately before the
    ///    write transaction; if it returns `false` nothing is written.
    /// 4. Completion callbacks run with the commit result.
    ///
    /// An `Err` is only returned when the write transaction itself fails.
    pub fn execute<P>(self, commit: P) -> Result<ExecuteReport>
    where
        P: FnOnce() -> bool,
    {
        let Self {
            transport,
            mut reads,
            writes,
            completions,
        } = self;

        read_batch(transport, &mut reads);
        let resolved = Resolved { reads };

        let queued = writes.len();
        let batch: Vec<ScatterWrite> = writes
            .into_iter()
            .filter_map(|write| match write {
                PendingWrite::Ready(w) => Some(w),
                PendingWrite::Deferred(resolve) => resolve(&resolved)
                    .map(|(address, data)| ScatterWrite { address, data }),
            })
            .filter(|w| w.address != 0)
            .collect();
        let failed_writes = queued - batch.len();

        let outcome = if batch.is_empty() {
            CommitOutcome::NothingToWrite
        } else if !commit() {
            trace!("Commit predicate false, discarding {} writes", batch.len());
            CommitOutcome::Gated
        } else {
            match transport.write_scatter(&batch) {
                Ok(()) => CommitOutcome::Committed,
                Err(e) => {
                    completions.into_iter().for_each(|done| done(false));
                    return Err(e);
                }
            }
        };

        let committed = outcome == CommitOutcome::Committed;
        completions.into_iter().for_each(|done| done(committed));

        Ok(ExecuteReport {
            outcome,
            resolved,
            written: if committed { batch.len() } else { 0 },
            failed_writes,
        })
    }
}
