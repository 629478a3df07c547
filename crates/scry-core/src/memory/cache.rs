//! Read cache keyed by address and generation.
//!
//! A generation is one "view" of the target, typically one scheduler tick or
//! one UI frame. Advancing the generation invalidates everything at once
//! without walking the map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

struct CachedRead {
    generation: u64,
    bytes: Vec<u8>,
}

#[derive(Default)]
pub struct ReadCache {
    generation: AtomicU64,
    entries: Mutex<HashMap<u64, CachedRead>>,
}

impl ReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new generation and drop the previous one's entries.
    pub fn advance(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
        next
    }

    /// Fill `buf` from the cache. Returns `false` on a miss.
    pub fn get(&self, address: u64, buf: &mut [u8]) -> bool {
        let generation = self.generation();
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        match entries.get(&address) {
            Some(hit) if hit.generation == generation && hit.bytes.len() >= buf.len() => {
                buf.copy_from_slice(&hit.bytes[..buf.len()]);
                true
            }
            _ => false,
        }
    }

    pub fn insert(&self, address: u64, bytes: &[u8]) {
        let generation = self.generation();
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                address,
                CachedRead {
                    generation,
                    bytes: bytes.to_vec(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
