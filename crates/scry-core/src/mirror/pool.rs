//! Buffer pool for mirror containers.
//!
//! One free list per entry type. Buffers are plain byte vectors sized to
//! `count * entry_size`; a released buffer is cleared and kept for the next
//! rent of the same entry type. A new buffer is only allocated when the free
//! list is empty, so the number of buffers per type never exceeds the highest
//! number of containers that were alive at the same time.

use std::any::TypeId;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

#[derive(Default)]
struct Slab {
    free: Vec<Vec<u8>>,
    created: usize,
}

#[derive(Default)]
pub struct MirrorPool {
    slabs: Mutex<HashMap<TypeId, Slab>>,
}

impl MirrorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rent a zeroed buffer of `len` bytes for entry type `E`.
    ///
    /// Prefers the smallest free buffer that already has enough capacity;
    /// otherwise grows the largest free one.
    pub fn rent<E: 'static>(&self, len: usize) -> PooledBuffer<'_> {
        let key = TypeId::of::<E>();
        let mut buf = {
            let mut slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
            let slab = slabs.entry(key).or_default();
            match take_best_fit(&mut slab.free, len) {
                Some(buf) => buf,
                None => {
                    slab.created += 1;
                    Vec::with_capacity(len)
                }
            }
        };
        buf.resize(len, 0);

        PooledBuffer {
            pool: self,
            key,
            buf: Some(buf),
        }
    }

    fn give_back(&self, key: TypeId, mut buf: Vec<u8>) {
        buf.clear();
        let mut slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        slabs.entry(key).or_default().free.push(buf);
    }

    /// Number of buffers ever allocated for entry type `E`.
    pub fn high_water<E: 'static>(&self) -> usize {
        let slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        slabs.get(&TypeId::of::<E>()).map_or(0, |s| s.created)
    }

    /// Number of idle buffers for entry type `E`.
    pub fn available<E: 'static>(&self) -> usize {
        let slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        slabs.get(&TypeId::of::<E>()).map_or(0, |s| s.free.len())
    }
}

fn take_best_fit(free: &mut Vec<Vec<u8>>, len: usize) -> Option<Vec<u8>> {
    if free.is_empty() {
        return None;
    }
    let fitting = free
        .iter()
        .enumerate()
        .filter(|(_, b)| b.capacity() >= len)
        .min_by_key(|(_, b)| b.capacity())
        .map(|(i, _)| i);
    let index = fitting.unwrap_or_else(|| {
        free.iter()
            .enumerate()
            .max_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i)
            .unwrap_or(0)
    });
    Some(free.swap_remove(index))
}

/// A rented buffer; returns to its pool when dropped.
pub struct PooledBuffer<'p> {
    pool: &'p MirrorPool,
    key: TypeId,
    buf: Option<Vec<u8>>,
}

impl PooledBuffer<'_> {
    /// Return the buffer to the pool now.
    pub fn release(self) {}
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(self.key, buf);
        }
    }
}
