use std::marker::PhantomData;

use crate::context::MemoryContext;
use crate::error::Result;
use crate::memory::RemoteValue;
use crate::memory::value::MAX_VALUE_SIZE;
use crate::mirror::pool::PooledBuffer;
use crate::mirror::{align_up, checked_count, max_align};

/// Remote entry: `{ hash: i32, next: i32, key: K, value: V }`, naturally
/// aligned. `Dictionary<int, int>` entries are 16 bytes, `<long, long>` 24.
struct DictionaryEntry<K, V>(PhantomData<(K, V)>);

const HASH_OFFSET: usize = 0;

impl<K: RemoteValue, V: RemoteValue> DictionaryEntry<K, V> {
    const KEY: usize = 8;
    const VALUE: usize = align_up(Self::KEY + K::SIZE, V::SIZE);
    const SIZE: usize = align_up(
        Self::VALUE + V::SIZE,
        max_align(4, max_align(K::SIZE, V::SIZE)),
    );
}

/// Snapshot of a remote `Dictionary<K, V>` taken with one bulk read.
pub struct MemDictionary<'a, K: RemoteValue, V: RemoteValue> {
    buffer: PooledBuffer<'a>,
    count: usize,
    _marker: PhantomData<(K, V)>,
}

impl<'a, K: RemoteValue, V: RemoteValue> MemDictionary<'a, K, V> {
    /// Size of one remote entry in bytes
    pub const ENTRY_SIZE: usize = DictionaryEntry::<K, V>::SIZE;

    /// Capture the dictionary object at `address`.
    ///
    /// Reads the count (optionally through the context cache), rejects counts
    /// above [`MAX_MIRROR_COUNT`](crate::mirror::MAX_MIRROR_COUNT), then reads
    /// the whole entries array into a pooled buffer. An empty dictionary costs
    /// no bulk read. On error the buffer goes straight back to the pool.
    pub fn acquire(ctx: &'a MemoryContext, address: u64, use_cache: bool) -> Result<Self> {
        const {
            assert!(K::SIZE <= MAX_VALUE_SIZE && V::SIZE <= MAX_VALUE_SIZE);
        }
        let layout = ctx.layout();
        let count = checked_count(ctx.read_value::<i32>(address + layout.dictionary_count, use_cache)?)?;

        let mut buffer = ctx
            .pool()
            .rent::<DictionaryEntry<K, V>>(count * Self::ENTRY_SIZE);
        if count > 0 {
            let entries = ctx.read_ptr(address + layout.dictionary_entries, use_cache)?;
            ctx.transport()
                .read_into(entries + layout.array_data, &mut buffer)?;
        }

        Ok(Self {
            buffer,
            count,
            _marker: PhantomData,
        })
    }

    /// Number of entries captured (the remote count, including free slots).
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live `(key, value)` pairs; free-list slots (negative hash) are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        self.buffer
            .chunks_exact(Self::ENTRY_SIZE)
            .take(self.count)
            .filter(|entry| <i32 as RemoteValue>::from_le(&entry[HASH_OFFSET..]) >= 0)
            .map(|entry| {
                (
                    K::from_le(&entry[DictionaryEntry::<K, V>::KEY..]),
                    V::from_le(&entry[DictionaryEntry::<K, V>::VALUE..]),
                )
            })
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = V> + '_ {
        self.iter().map(|(_, v)| v)
    }

    /// Linear lookup; these tables are small and scanned once per capture.
    pub fn get(&self, key: &K) -> Option<V>
    where
        K: PartialEq,
    {
        self.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Return the buffer to the pool now instead of at end of scope.
    pub fn release(self) {}
}
