//! In-memory transport for tests.
//!
//! Remote memory is modelled as sparse 4 KiB pages. Reads or writes that touch
//! an unmapped page fail, which stands in for an invalid remote address. The
//! scatter methods are overridden so each call counts as exactly one physical
//! transaction, the way a DMA transport behaves.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::memory::transport::{ScatterRead, ScatterWrite, Transport};

const PAGE_SIZE: u64 = 0x1000;

#[derive(Default)]
pub struct MockTransport {
    pages: RwLock<HashMap<u64, Box<[u8]>>>,
    failing: RwLock<HashSet<u64>>,
    fail_writes: AtomicBool,
    read_transactions: AtomicUsize,
    write_transactions: AtomicUsize,
    bytes_read: AtomicUsize,
    write_batches: Mutex<Vec<Vec<ScatterWrite>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map zeroed pages covering `[base, base + size)`.
    pub fn map(&self, base: u64, size: usize) {
        let mut pages = self.pages.write().unwrap();
        let first = base / PAGE_SIZE;
        let last = (base + size.max(1) as u64 - 1) / PAGE_SIZE;
        for page in first..=last {
            pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        }
    }

    /// Place bytes in remote memory, mapping pages as needed.
    ///
    /// Unlike `write_buffer` this never fails and is not counted.
    pub fn poke(&self, address: u64, data: &[u8]) {
        self.map(address, data.len());
        let mut pages = self.pages.write().unwrap();
        for (i, byte) in data.iter().enumerate() {
            let addr = address + i as u64;
            if let Some(page) = pages.get_mut(&(addr / PAGE_SIZE)) {
                page[(addr % PAGE_SIZE) as usize] = *byte;
            }
        }
    }

    /// Read remote memory without counting a transaction.
    pub fn peek(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0; len];
        self.copy_out(address, &mut buf).ok()?;
        Some(buf)
    }

    pub fn peek_u64(&self, address: u64) -> Option<u64> {
        let bytes = self.peek(address, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Make any access touching `address` fail.
    pub fn fail_address(&self, address: u64) {
        self.failing.write().unwrap().insert(address);
    }

    /// Make every write (single or scatter) fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn read_transactions(&self) -> usize {
        self.read_transactions.load(Ordering::SeqCst)
    }

    pub fn write_transactions(&self) -> usize {
        self.write_transactions.load(Ordering::SeqCst)
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read.load(Ordering::SeqCst)
    }

    /// Every committed write transaction, in order.
    pub fn write_batches(&self) -> Vec<Vec<ScatterWrite>> {
        self.write_batches.lock().unwrap().clone()
    }

    fn check_failing(&self, address: u64, len: usize) -> bool {
        let failing = self.failing.read().unwrap();
        failing
            .iter()
            .any(|&f| f >= address && f < address + len.max(1) as u64)
    }

    fn copy_out(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        if address == 0 || self.check_failing(address, buf.len()) {
            return Err(Error::read_failed(address, "injected failure"));
        }
        let pages = self.pages.read().unwrap();
        for (i, slot) in buf.iter_mut().enumerate() {
            let addr = address + i as u64;
            let page = pages
                .get(&(addr / PAGE_SIZE))
                .ok_or_else(|| Error::read_failed(address, "unmapped page"))?;
            *slot = page[(addr % PAGE_SIZE) as usize];
        }
        Ok(())
    }

    fn check_writable(&self, address: u64, len: usize) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst)
            || address == 0
            || self.check_failing(address, len)
        {
            return Err(Error::write_failed(address, "injected failure"));
        }
        let pages = self.pages.read().unwrap();
        let first = address / PAGE_SIZE;
        let last = (address + len.max(1) as u64 - 1) / PAGE_SIZE;
        if (first..=last).all(|page| pages.contains_key(&page)) {
            Ok(())
        } else {
            Err(Error::write_failed(address, "unmapped page"))
        }
    }

    fn copy_in(&self, address: u64, data: &[u8]) {
        let mut pages = self.pages.write().unwrap();
        for (i, byte) in data.iter().enumerate() {
            let addr = address + i as u64;
            if let Some(page) = pages.get_mut(&(addr / PAGE_SIZE)) {
                page[(addr % PAGE_SIZE) as usize] = *byte;
            }
        }
    }
}

impl Transport for MockTransport {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.read_transactions.fetch_add(1, Ordering::SeqCst);
        self.copy_out(address, buf)?;
        self.bytes_read.fetch_add(buf.len(), Ordering::SeqCst);
        Ok(())
    }

    fn write_buffer(&self, address: u64, data: &[u8]) -> Result<()> {
        self.write_scatter(&[ScatterWrite {
            address,
            data: data.to_vec(),
        }])
    }

    fn read_scatter(&self, reads: &mut [ScatterRead]) -> Result<()> {
        self.read_transactions.fetch_add(1, Ordering::SeqCst);
        for read in reads.iter_mut() {
            read.failed = self.copy_out(read.address, &mut read.buf).is_err();
            if !read.failed {
                self.bytes_read.fetch_add(read.buf.len(), Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn write_scatter(&self, writes: &[ScatterWrite]) -> Result<()> {
        self.write_transactions.fetch_add(1, Ordering::SeqCst);
        // All-or-nothing: validate every range before touching memory.
        for write in writes {
            self.check_writable(write.address, write.data.len())?;
        }
        for write in writes {
            self.copy_in(write.address, &write.data);
        }
        self.write_batches.lock().unwrap().push(writes.to_vec());
        Ok(())
    }
}

/// Builder for laying out remote memory in tests
#[derive(Default)]
pub struct MockTransportBuilder {
    transport: MockTransport,
}

impl MockTransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(self, base: u64, size: usize) -> Self {
        self.transport.map(base, size);
        self
    }

    pub fn bytes(self, address: u64, data: &[u8]) -> Self {
        self.transport.poke(address, data);
        self
    }

    pub fn u32(self, address: u64, value: u32) -> Self {
        self.bytes(address, &value.to_le_bytes())
    }

    pub fn i32(self, address: u64, value: i32) -> Self {
        self.bytes(address, &value.to_le_bytes())
    }

    pub fn u64(self, address: u64, value: u64) -> Self {
        self.bytes(address, &value.to_le_bytes())
    }

    pub fn fail_at(self, address: u64) -> Self {
        self.transport.fail_address(address);
        self
    }

    pub fn build(self) -> MockTransport {
        self.transport
    }
}
