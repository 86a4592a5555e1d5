//! Shared helpers for integration tests

#![allow(dead_code)]

use btt_rs::{MappedRegion, MemNamespace, NamespaceIo, MIN_SIZE};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const PARENT_UUID: [u8; 16] = [0xa5; 16];

/// Zeroed in-memory namespace of the minimum table size
pub fn mem_namespace() -> Arc<MemNamespace> {
    Arc::new(MemNamespace::new(MIN_SIZE as usize))
}

/// Block of `len` bytes tagged with `lba` in its first 8 bytes
pub fn tagged_block(lba: u64, fill: u8, len: usize) -> Vec<u8> {
    let mut block = vec![fill; len];
    block[..8].copy_from_slice(&lba.to_le_bytes());
    block
}

/// Namespace wrapper counting every write and zero call
pub struct CountingNamespace {
    inner: Arc<MemNamespace>,
    writes: AtomicUsize,
}

impl CountingNamespace {
    pub fn new(inner: Arc<MemNamespace>) -> Self {
        CountingNamespace {
            inner,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl NamespaceIo for CountingNamespace {
    fn read(&self, lane: usize, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.inner.read(lane, buf, offset)
    }

    fn write(&self, lane: usize, buf: &[u8], offset: u64) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(lane, buf, offset)
    }

    fn zero(&self, lane: usize, count: u64, offset: u64) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.zero(lane, count, offset)
    }

    fn map(&self, lane: usize, count: usize, offset: u64) -> io::Result<MappedRegion<'_>> {
        self.inner.map(lane, count, offset)
    }

    fn is_zeroed(&self) -> bool {
        self.inner.is_zeroed()
    }
}

/// Namespace wrapper that starts failing writes once armed and out of budget
///
/// Simulates power loss: writes that fail never reach the inner namespace,
/// which can then be reopened as it was at the moment of the "crash".
pub struct FaultyNamespace {
    inner: Arc<MemNamespace>,
    armed: AtomicBool,
    budget: AtomicUsize,
}

impl FaultyNamespace {
    pub fn new(inner: Arc<MemNamespace>) -> Self {
        FaultyNamespace {
            inner,
            armed: AtomicBool::new(false),
            budget: AtomicUsize::new(0),
        }
    }

    /// Let `allowed` more writes through, then fail every write
    pub fn fail_after(&self, allowed: usize) {
        self.budget.store(allowed, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    fn take_write(&self) -> io::Result<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .map(|_| ())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "injected write failure"))
    }
}

impl NamespaceIo for FaultyNamespace {
    fn read(&self, lane: usize, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.inner.read(lane, buf, offset)
    }

    fn write(&self, lane: usize, buf: &[u8], offset: u64) -> io::Result<()> {
        self.take_write()?;
        self.inner.write(lane, buf, offset)
    }

    fn zero(&self, lane: usize, count: u64, offset: u64) -> io::Result<()> {
        self.take_write()?;
        self.inner.zero(lane, count, offset)
    }

    fn is_zeroed(&self) -> bool {
        self.inner.is_zeroed()
    }
}

const SPARSE_PAGE: u64 = 4096;

/// Namespace of any size that only stores the pages written to it
///
/// Unwritten pages read as zeros, so multi-arena tables fit in memory.
pub struct SparseNamespace {
    len: u64,
    pages: RwLock<BTreeMap<u64, Box<[u8]>>>,
}

impl SparseNamespace {
    pub fn new(len: u64) -> Self {
        SparseNamespace {
            len,
            pages: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of pages holding data
    pub fn resident_pages(&self) -> usize {
        self.pages.read().len()
    }

    fn check_range(&self, count: usize, offset: u64) -> io::Result<()> {
        match offset.checked_add(count as u64) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {}+{} beyond namespace of {} bytes", offset, count, self.len),
            )),
        }
    }
}

impl NamespaceIo for SparseNamespace {
    fn read(&self, _lane: usize, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.check_range(buf.len(), offset)?;
        let pages = self.pages.read();

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let in_page = (pos % SPARSE_PAGE) as usize;
            let len = (SPARSE_PAGE as usize - in_page).min(buf.len() - done);
            let dst = &mut buf[done..done + len];
            match pages.get(&(pos / SPARSE_PAGE)) {
                Some(page) => dst.copy_from_slice(&page[in_page..in_page + len]),
                None => dst.fill(0),
            }
            done += len;
        }
        Ok(())
    }

    fn write(&self, _lane: usize, buf: &[u8], offset: u64) -> io::Result<()> {
        self.check_range(buf.len(), offset)?;
        let mut pages = self.pages.write();

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let in_page = (pos % SPARSE_PAGE) as usize;
            let len = (SPARSE_PAGE as usize - in_page).min(buf.len() - done);
            let page = pages
                .entry(pos / SPARSE_PAGE)
                .or_insert_with(|| vec![0u8; SPARSE_PAGE as usize].into_boxed_slice());
            page[in_page..in_page + len].copy_from_slice(&buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    fn is_zeroed(&self) -> bool {
        true
    }
}
