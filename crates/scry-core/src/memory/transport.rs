//! Remote memory transport abstraction.
//!
//! Everything above this layer only knows how to "read N bytes at address A"
//! and "write N bytes at address A". Whether that is a DMA card, a driver
//! ioctl or `ReadProcessMemory` is the implementation's business.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::value::{RemoteValue, encode};

/// One read inside a scatter transaction.
#[derive(Debug, Clone)]
pub struct ScatterRead {
    pub address: u64,
    pub buf: Vec<u8>,
    /// Set by the transport when this entry could not be read
    pub failed: bool,
}

impl ScatterRead {
    pub fn new(address: u64, len: usize) -> Self {
        Self {
            address,
            buf: vec![0; len],
            failed: false,
        }
    }
}

/// One write inside a scatter transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterWrite {
    pub address: u64,
    pub data: Vec<u8>,
}

/// Raw access to the target's memory.
pub trait Transport: Send + Sync {
    /// Read exactly `buf.len()` bytes at `address`.
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at `address`.
    fn write_buffer(&self, address: u64, data: &[u8]) -> Result<()>;

    /// Read a set of independent ranges as one transaction.
    ///
    /// Individual failures are flagged on the entry; an `Err` means the whole
    /// transaction failed. The default implementation issues one read per
    /// entry; transports with native scatter support override it.
    fn read_scatter(&self, reads: &mut [ScatterRead]) -> Result<()> {
        for read in reads.iter_mut() {
            read.failed = self.read_into(read.address, &mut read.buf).is_err();
        }
        Ok(())
    }

    /// Write a set of ranges as one transaction.
    ///
    /// The default implementation reads every range back before the first
    /// write, so an unmapped address rejects the batch with nothing written.
    /// A write that still fails after that (e.g. a read-only page) surfaces as
    /// [`Error::PartialWrite`] carrying how many writes landed. Transports
    /// with native scatter support override this with a real transaction.
    fn write_scatter(&self, writes: &[ScatterWrite]) -> Result<()> {
        let mut scratch = Vec::new();
        for write in writes {
            scratch.resize(write.data.len(), 0);
            self.read_into(write.address, &mut scratch).map_err(|e| {
                Error::write_failed(write.address, format!("range not readable: {}", e))
            })?;
        }

        for (landed, write) in writes.iter().enumerate() {
            if let Err(e) = self.write_buffer(write.address, &write.data) {
                return Err(Error::PartialWrite {
                    landed,
                    total: writes.len(),
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_into(address, buf)
    }

    fn write_buffer(&self, address: u64, data: &[u8]) -> Result<()> {
        (**self).write_buffer(address, data)
    }

    fn read_scatter(&self, reads: &mut [ScatterRead]) -> Result<()> {
        (**self).read_scatter(reads)
    }

    fn write_scatter(&self, writes: &[ScatterWrite]) -> Result<()> {
        (**self).write_scatter(writes)
    }
}

/// Typed convenience wrappers over [`Transport`].
pub trait TransportExt: Transport {
    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_into(address, &mut buf)?;
        Ok(buf)
    }

    fn read_value<T: RemoteValue>(&self, address: u64) -> Result<T> {
        let mut buf = [0u8; 8];
        self.read_into(address, &mut buf[..T::SIZE])?;
        Ok(T::from_le(&buf))
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        self.read_value(address)
    }

    fn read_i32(&self, address: u64) -> Result<i32> {
        self.read_value(address)
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        self.read_value(address)
    }

    /// Read a pointer, rejecting null.
    fn read_ptr(&self, address: u64) -> Result<u64> {
        let ptr = self.read_u64(address)?;
        if ptr == 0 {
            return Err(Error::InvalidAddress(ptr));
        }
        Ok(ptr)
    }

    fn write_value<T: RemoteValue>(&self, address: u64, value: T) -> Result<()> {
        self.write_buffer(address, &encode(value))
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}
