//! Shared handle to the target: transport, read cache and mirror pool.
//!
//! One context is built per attached process and passed by reference to the
//! scatter engine, the mirror containers, the call bridge and the scheduler.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::{ReadCache, RemoteValue, Transport};
use crate::mirror::{MirrorLayout, MirrorPool};

pub struct MemoryContext {
    transport: Arc<dyn Transport>,
    cache: ReadCache,
    pool: MirrorPool,
    layout: MirrorLayout,
}

impl MemoryContext {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_layout(transport, MirrorLayout::default())
    }

    pub fn with_layout(transport: Arc<dyn Transport>, layout: MirrorLayout) -> Self {
        Self {
            transport,
            cache: ReadCache::new(),
            pool: MirrorPool::new(),
            layout,
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Clone of the shared transport handle, for components that outlive a borrow.
    pub fn transport_handle(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn pool(&self) -> &MirrorPool {
        &self.pool
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    /// Invalidate cached reads; call once per frame or tick.
    pub fn new_generation(&self) -> u64 {
        self.cache.advance()
    }

    /// Read into `buf`, consulting the generation cache when `use_cache` is set.
    pub fn read_into(&self, address: u64, buf: &mut [u8], use_cache: bool) -> Result<()> {
        if address == 0 {
            return Err(Error::InvalidAddress(address));
        }
        if use_cache && self.cache.get(address, buf) {
            return Ok(());
        }
        self.transport.read_into(address, buf)?;
        if use_cache {
            self.cache.insert(address, buf);
        }
        Ok(())
    }

    pub fn read_value<T: RemoteValue>(&self, address: u64, use_cache: bool) -> Result<T> {
        let mut buf = [0u8; 8];
        self.read_into(address, &mut buf[..T::SIZE], use_cache)?;
        Ok(T::from_le(&buf))
    }

    /// Read a pointer, rejecting null.
    pub fn read_ptr(&self, address: u64, use_cache: bool) -> Result<u64> {
        let ptr: u64 = self.read_value(address, use_cache)?;
        if ptr == 0 {
            return Err(Error::InvalidAddress(ptr));
        }
        Ok(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockTransportBuilder;

    #[test]
    fn test_cached_read_skips_transport() {
        let mock = Arc::new(MockTransportBuilder::new().u32(0x1000, 77).build());
        let ctx = MemoryContext::new(mock.clone());

        assert_eq!(ctx.read_value::<u32>(0x1000, true).unwrap(), 77);
        assert_eq!(ctx.read_value::<u32>(0x1000, true).unwrap(), 77);
        assert_eq!(mock.read_transactions(), 1);

        ctx.new_generation();
        assert_eq!(ctx.read_value::<u32>(0x1000, true).unwrap(), 77);
        assert_eq!(mock.read_transactions(), 2);
    }

    #[test]
    fn test_uncached_read_always_hits_transport() {
        let mock = Arc::new(MockTransportBuilder::new().u32(0x1000, 1).build());
        let ctx = MemoryContext::new(mock.clone());

        ctx.read_value::<u32>(0x1000, false).unwrap();
        ctx.read_value::<u32>(0x1000, false).unwrap();
        assert_eq!(mock.read_transactions(), 2);
        assert!(ctx.cache().is_empty());
    }

    #[test]
    fn test_null_address_rejected_without_io() {
        let mock = Arc::new(MockTransportBuilder::new().build());
        let ctx = MemoryContext::new(mock.clone());
        assert!(matches!(
            ctx.read_value::<u32>(0, false),
            Err(Error::InvalidAddress(0))
        ));
        assert_eq!(mock.read_transactions(), 0);
    }
}
