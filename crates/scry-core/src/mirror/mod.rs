//! Mirror containers for remote hash tables.
//!
//! A remote `Dictionary`/`HashSet` keeps its entries in one contiguous
//! backing array, so the whole table can be captured with a single bulk read
//! and iterated locally. Buffers come from [`MirrorPool`] and go back to it
//! when the container is dropped.

mod dictionary;
mod hash_set;
mod pool;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::layout;

pub use dictionary::MemDictionary;
pub use hash_set::MemHashSet;
pub use pool::{MirrorPool, PooledBuffer};

/// Largest remote count accepted by a mirror container
pub const MAX_MIRROR_COUNT: u32 = 16384;

/// Field offsets of the mirrored collection objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorLayout {
    pub dictionary_entries: u64,
    pub dictionary_count: u64,
    pub hash_set_slots: u64,
    pub hash_set_count: u64,
    pub array_data: u64,
}

impl Default for MirrorLayout {
    fn default() -> Self {
        Self {
            dictionary_entries: layout::dictionary::ENTRIES,
            dictionary_count: layout::dictionary::COUNT,
            hash_set_slots: layout::hash_set::SLOTS,
            hash_set_count: layout::hash_set::COUNT,
            array_data: layout::array::DATA,
        }
    }
}

/// Round `offset` up to a multiple of `align` (a power of two).
pub(crate) const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

pub(crate) const fn max_align(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

/// Validate a remote count against [`MAX_MIRROR_COUNT`].
///
/// Negative counts only show up in torn or freed objects and are rejected
/// the same way as oversized ones.
pub(crate) fn checked_count(raw: i32) -> Result<usize> {
    if raw < 0 || raw as u32 > MAX_MIRROR_COUNT {
        return Err(Error::CountOutOfRange {
            count: raw as u32,
            max: MAX_MIRROR_COUNT,
        });
    }
    Ok(raw as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(12, 4), 12);
        assert_eq!(align_up(9, 2), 10);
        assert_eq!(align_up(12, 8), 16);
        assert_eq!(align_up(20, 8), 24);
        assert_eq!(align_up(13, 1), 13);
    }

    #[test]
    fn test_checked_count_boundaries() {
        assert_eq!(checked_count(0).unwrap(), 0);
        assert_eq!(checked_count(16384).unwrap(), 16384);
        assert!(matches!(
            checked_count(16385),
            Err(Error::CountOutOfRange {
                count: 16385,
                max: 16384
            })
        ));
        assert!(checked_count(-1).is_err());
    }
}
