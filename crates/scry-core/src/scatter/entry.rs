use std::marker::PhantomData;

use tracing::debug;

use crate::memory::{RemoteValue, ScatterRead, Transport};

/// Typed reference to a read queued in a batch.
///
/// The value can only be obtained from the [`Resolved`] set produced by
/// executing the batch, so it is impossible to observe it before the
/// physical transfer has landed.
pub struct ReadEntry<T> {
    pub(crate) index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ReadEntry<T> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for ReadEntry<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ReadEntry<T> {}

/// A queued pointer read.
#[derive(Clone, Copy)]
pub struct PtrEntry {
    pub(crate) entry: ReadEntry<u64>,
}

impl PtrEntry {
    /// The pointer value once the batch has executed; `None` if the read
    /// failed or the pointer is null.
    pub fn transfer(&self, resolved: &Resolved) -> Option<u64> {
        resolved.get(self.entry).filter(|&ptr| ptr != 0)
    }

    pub fn entry(&self) -> ReadEntry<u64> {
        self.entry
    }
}

/// Results of the read phase of a batch.
#[derive(Debug, Default)]
pub struct Resolved {
    pub(crate) reads: Vec<ScatterRead>,
}

impl Resolved {
    pub fn get<T: RemoteValue>(&self, entry: ReadEntry<T>) -> Option<T> {
        let read = self.reads.get(entry.index)?;
        if read.failed {
            return None;
        }
        Some(T::from_le(&read.buf))
    }

    /// Raw bytes of a read, `None` if it failed.
    pub fn bytes<T>(&self, entry: ReadEntry<T>) -> Option<&[u8]> {
        self.reads
            .get(entry.index)
            .filter(|r| !r.failed)
            .map(|r| r.buf.as_slice())
    }

    pub fn failed<T>(&self, entry: ReadEntry<T>) -> bool {
        self.reads.get(entry.index).is_none_or(|r| r.failed)
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.reads.iter().filter(|r| r.failed).count()
    }
}

/// Issue one scatter read for every entry with a non-null address.
///
/// Null entries are flagged failed and never reach the transport. A failed
/// transaction flags every entry that was part of it.
pub(crate) fn read_batch(transport: &dyn Transport, reads: &mut [ScatterRead]) {
    let live: Vec<usize> = reads
        .iter()
        .enumerate()
        .filter(|(_, r)| r.address != 0)
        .map(|(i, _)| i)
        .collect();
    for read in reads.iter_mut().filter(|r| r.address == 0) {
        read.failed = true;
    }
    if live.is_empty() {
        return;
    }

    let mut batch: Vec<ScatterRead> = live.iter().map(|&i| reads[i].clone()).collect();
    match transport.read_scatter(&mut batch) {
        Ok(()) => {
            for (&slot, read) in live.iter().zip(batch) {
                reads[slot] = read;
            }
        }
        Err(e) => {
            debug!("Scatter read of {} entries failed: {}", live.len(), e);
            for &slot in &live {
                reads[slot].failed = true;
            }
        }
    }
}
