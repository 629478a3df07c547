use std::marker::PhantomData;

use crate::context::MemoryContext;
use crate::error::Result;
use crate::memory::RemoteValue;
use crate::memory::value::MAX_VALUE_SIZE;
use crate::mirror::pool::PooledBuffer;
use crate::mirror::{align_up, checked_count, max_align};

/// Remote slot: `{ hash: i32, next: i32, value: T }`, naturally aligned.
/// `HashSet<int>` slots are 12 bytes, `HashSet<long>` 16.
struct SetSlot<T>(PhantomData<T>);

const HASH_OFFSET: usize = 0;

impl<T: RemoteValue> SetSlot<T> {
    const VALUE: usize = align_up(8, T::SIZE);
    const SIZE: usize = align_up(Self::VALUE + T::SIZE, max_align(4, T::SIZE));
}

/// Snapshot of a remote `HashSet<T>` taken with one bulk read.
pub struct MemHashSet<'a, T: RemoteValue> {
    buffer: PooledBuffer<'a>,
    count: usize,
    _marker: PhantomData<T>,
}

impl<'a, T: RemoteValue> MemHashSet<'a, T> {
    /// Size of one remote slot in bytes
    pub const SLOT_SIZE: usize = SetSlot::<T>::SIZE;

    /// Capture the set object at `address`. Same contract as
    /// [`MemDictionary::acquire`](crate::mirror::MemDictionary::acquire).
    pub fn acquire(ctx: &'a MemoryContext, address: u64, use_cache: bool) -> Result<Self> {
        const {
            assert!(T::SIZE <= MAX_VALUE_SIZE);
        }
        let layout = ctx.layout();
        let count = checked_count(ctx.read_value::<i32>(address + layout.hash_set_count, use_cache)?)?;

        let mut buffer = ctx.pool().rent::<SetSlot<T>>(count * Self::SLOT_SIZE);
        if count > 0 {
            let slots = ctx.read_ptr(address + layout.hash_set_slots, use_cache)?;
            ctx.transport()
                .read_into(slots + layout.array_data, &mut buffer)?;
        }

        Ok(Self {
            buffer,
            count,
            _marker: PhantomData,
        })
    }

    pub fn capacity(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.buffer
            .chunks_exact(Self::SLOT_SIZE)
            .take(self.count)
            .filter(|slot| <i32 as RemoteValue>::from_le(&slot[HASH_OFFSET..]) >= 0)
            .map(|slot| T::from_le(&slot[SetSlot::<T>::VALUE..]))
    }

    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.iter().any(|v| &v == value)
    }

    pub fn release(self) {}
}
