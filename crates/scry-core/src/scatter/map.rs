use crate::memory::{RemoteValue, ScatterRead, Transport};
use crate::scatter::entry::{PtrEntry, ReadEntry, Resolved, read_batch};

type AddressFn<'a> = Box<dyn FnOnce(&Resolved) -> Option<u64> + Send + 'a>;

struct Slot<'a> {
    round: usize,
    len: usize,
    address: SlotAddress<'a>,
}

enum SlotAddress<'a> {
    Fixed(u64),
    Chained(AddressFn<'a>),
}

/// Multi-round read batch for pointer chains deeper than one hop.
///
/// Each round is one physical read transaction. Entries in round `n` may
/// compute their address from anything resolved in rounds `< n`.
///
/// ```ignore
/// let mut map = ScatterReadMap::new(transport);
/// let list = map.add_ptr(0, game_world + 0x90);
/// let count = map.add_chained::<i32, _>(1, move |r| list.transfer(r).map(|p| p + 0x18));
/// let resolved = map.execute();
/// ```
pub struct ScatterReadMap<'a> {
    transport: &'a dyn Transport,
    slots: Vec<Slot<'a>>,
}

impl<'a> ScatterReadMap<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self {
            transport,
            slots: Vec::new(),
        }
    }

    pub fn add_read<T: RemoteValue>(&mut self, round: usize, address: u64) -> ReadEntry<T> {
        self.push(round, T::SIZE, SlotAddress::Fixed(address))
    }

    pub fn add_ptr(&mut self, round: usize, address: u64) -> PtrEntry {
        PtrEntry {
            entry: self.add_read(round, address),
        }
    }

    /// Queue a read whose address comes from earlier rounds.
    ///
    /// `round` should be greater than the rounds the closure depends on;
    /// anything not yet resolved reads as failed.
    pub fn add_chained<T, F>(&mut self, round: usize, address: F) -> ReadEntry<T>
    where
        T: RemoteValue,
        F: FnOnce(&Resolved) -> Option<u64> + Send + 'a,
    {
        self.push(round, T::SIZE, SlotAddress::Chained(Box::new(address)))
    }

    /// Chained pointer read, for building the next hop.
    pub fn add_chained_ptr<F>(&mut self, round: usize, address: F) -> PtrEntry
    where
        F: FnOnce(&Resolved) -> Option<u64> + Send + 'a,
    {
        PtrEntry {
            entry: self.add_chained(round, address),
        }
    }

    fn push<T>(&mut self, round: usize, len: usize, address: SlotAddress<'a>) -> ReadEntry<T> {
        self.slots.push(Slot {
            round,
            len,
            address,
        });
        ReadEntry::new(self.slots.len() - 1)
    }

    pub fn rounds(&self) -> usize {
        self.slots.iter().map(|s| s.round + 1).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Run every round in order and return all results.
    pub fn execute(self) -> Resolved {
        let rounds = self.rounds();
        let mut resolved = Resolved {
            reads: self
                .slots
                .iter()
                .map(|s| {
                    let mut read = ScatterRead::new(0, s.len);
                    read.failed = true;
                    read
                })
                .collect(),
        };

        let mut pending: Vec<Option<Slot<'a>>> = self.slots.into_iter().map(Some).collect();
        for round in 0..rounds {
            let mut indices = Vec::new();
            let mut batch = Vec::new();
            for (index, slot) in pending.iter_mut().enumerate() {
                if slot.as_ref().is_none_or(|s| s.round != round) {
                    continue;
                }
                let Some(slot) = slot.take() else { continue };
                let address = match slot.address {
                    SlotAddress::Fixed(address) => address,
                    SlotAddress::Chained(resolve) => resolve(&resolved).unwrap_or(0),
                };
                indices.push(index);
                batch.push(ScatterRead::new(address, slot.len));
            }
            if batch.is_empty() {
                continue;
            }

            read_batch(self.transport, &mut batch);
            for (index, read) in indices.into_iter().zip(batch) {
                resolved.reads[index] = read;
            }
        }

        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockTransportBuilder;

    #[test]
    fn test_three_hop_chain_uses_one_transaction_per_round() {
        let mock = MockTransportBuilder::new()
            .u64(0x1000, 0x2000)
            .u64(0x2000 + 0x10, 0x3000)
            .i32(0x3000 + 0x18, 42)
            .u32(0x4000, 7)
            .build();

        let mut map = ScatterReadMap::new(&mock);
        let root = map.add_ptr(0, 0x1000);
        let side = map.add_read::<u32>(0, 0x4000);
        let list = map.add_chained_ptr(1, move |r| root.transfer(r).map(|p| p + 0x10));
        let count = map.add_chained::<i32, _>(2, move |r| list.transfer(r).map(|p| p + 0x18));
        assert_eq!(map.rounds(), 3);

        let resolved = map.execute();
        assert_eq!(resolved.get(count), Some(42));
        assert_eq!(resolved.get(side), Some(7));
        assert_eq!(mock.read_transactions(), 3);
    }

    #[test]
    fn test_broken_chain_fails_downstream_only() {
        let mock = MockTransportBuilder::new()
            .u64(0x1000, 0)
            .u32(0x4000, 7)
            .build();

        let mut map = ScatterReadMap::new(&mock);
        let root = map.add_ptr(0, 0x1000);
        let other = map.add_read::<u32>(1, 0x4000);
        let next = map.add_chained::<u64, _>(1, move |r| root.transfer(r));

        let resolved = map.execute();
        assert_eq!(resolved.get(root.entry()), Some(0));
        assert!(resolved.failed(next));
        assert_eq!(resolved.get(other), Some(7));
        assert_eq!(resolved.failed_count(), 1);
    }

    #[test]
    fn test_empty_map() {
        let mock = MockTransportBuilder::new().build();
        let map = ScatterReadMap::new(&mock);
        assert!(map.is_empty());
        assert!(map.execute().is_empty());
        assert_eq!(mock.read_transactions(), 0);
    }
}
