//! Namespace I/O for BTT tables
//!
//! A table never touches storage directly; every byte goes through a
//! [`NamespaceIo`] implementation. Two are provided: [`MemNamespace`] keeps
//! the namespace on the heap and [`FileNamespace`] memory-maps a file.

use memmap2::MmapMut;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Largest range the default [`NamespaceIo::map`] copies in one call
pub const DEFAULT_MAP_CHUNK: usize = 1 << 20;

/// Read-only view of a namespace range returned by [`NamespaceIo::map`]
///
/// The view may be shorter than requested; callers loop until they have
/// covered the range they need.
pub enum MappedRegion<'a> {
    /// Zero-copy view into the backing storage
    Mapped {
        offset: u64,
        view: MappedRwLockReadGuard<'a, [u8]>,
    },
    /// Copy of the range, for backends that cannot hand out views
    Buffered { offset: u64, data: Vec<u8> },
}

impl MappedRegion<'_> {
    /// Namespace offset of the first byte of the view
    pub fn offset(&self) -> u64 {
        match self {
            MappedRegion::Mapped { offset, .. } | MappedRegion::Buffered { offset, .. } => {
                *offset
            }
        }
    }
}

impl Deref for MappedRegion<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            MappedRegion::Mapped { view, .. } => &view[..],
            MappedRegion::Buffered { data, .. } => &data[..],
        }
    }
}

/// Storage underneath a BTT table
///
/// `lane` identifies the caller's concurrency slot; implementations may use
/// it to pick per-lane resources. Data passed to [`write`](Self::write) and
/// [`zero`](Self::zero) must be durable when the call returns.
pub trait NamespaceIo: Send + Sync {
    /// Fill `buf` from the namespace starting at `offset`
    fn read(&self, lane: usize, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write `buf` to the namespace starting at `offset`
    fn write(&self, lane: usize, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Zero `count` bytes starting at `offset`
    fn zero(&self, lane: usize, count: u64, offset: u64) -> io::Result<()> {
        let chunk = vec![0u8; DEFAULT_MAP_CHUNK.min(count as usize)];
        let mut done = 0u64;
        while done < count {
            let len = (count - done).min(chunk.len() as u64) as usize;
            self.write(lane, &chunk[..len], offset + done)?;
            done += len as u64;
        }
        Ok(())
    }

    /// View up to `count` bytes starting at `offset`
    ///
    /// The default copies at most [`DEFAULT_MAP_CHUNK`] bytes into a buffer.
    fn map(&self, lane: usize, count: usize, offset: u64) -> io::Result<MappedRegion<'_>> {
        let mut data = vec![0u8; count.min(DEFAULT_MAP_CHUNK)];
        self.read(lane, &mut data, offset)?;
        Ok(MappedRegion::Buffered { offset, data })
    }

    /// Flush changes made through a mapped range
    fn sync(&self, _region: &MappedRegion<'_>) -> io::Result<()> {
        Ok(())
    }

    /// True if the namespace was all zeros when handed to the table
    fn is_zeroed(&self) -> bool {
        false
    }
}

impl<T: NamespaceIo + ?Sized> NamespaceIo for Arc<T> {
    fn read(&self, lane: usize, buf: &mut [u8], offset: u64) -> io::Result<()> {
        (**self).read(lane, buf, offset)
    }

    fn write(&self, lane: usize, buf: &[u8], offset: u64) -> io::Result<()> {
        (**self).write(lane, buf, offset)
    }

    fn zero(&self, lane: usize, count: u64, offset: u64) -> io::Result<()> {
        (**self).zero(lane, count, offset)
    }

    fn map(&self, lane: usize, count: usize, offset: u64) -> io::Result<MappedRegion<'_>> {
        (**self).map(lane, count, offset)
    }

    fn sync(&self, region: &MappedRegion<'_>) -> io::Result<()> {
        (**self).sync(region)
    }

    fn is_zeroed(&self) -> bool {
        (**self).is_zeroed()
    }
}

fn check_range(len: usize, count: usize, offset: u64) -> io::Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset).map_err(|_| out_of_range(offset, count, len))?;
    match start.checked_add(count) {
        Some(end) if end <= len => Ok(start..end),
        _ => Err(out_of_range(offset, count, len)),
    }
}

fn out_of_range(offset: u64, count: usize, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "range {}+{} beyond namespace of {} bytes",
            offset, count, len
        ),
    )
}

/// Heap-backed namespace
pub struct MemNamespace {
    data: RwLock<Vec<u8>>,
    zeroed: bool,
}

impl MemNamespace {
    /// Create a zero-filled namespace of `size` bytes
    pub fn new(size: usize) -> Self {
        MemNamespace {
            data: RwLock::new(vec![0u8; size]),
            zeroed: true,
        }
    }

    /// Wrap existing contents
    pub fn from_bytes(data: Vec<u8>) -> Self {
        MemNamespace {
            data: RwLock::new(data),
            zeroed: false,
        }
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl NamespaceIo for MemNamespace {
    fn read(&self, _lane: usize, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.data.read();
        let range = check_range(data.len(), buf.len(), offset)?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write(&self, _lane: usize, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.write();
        let range = check_range(data.len(), buf.len(), offset)?;
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn zero(&self, _lane: usize, count: u64, offset: u64) -> io::Result<()> {
        let mut data = self.data.write();
        let range = check_range(data.len(), count as usize, offset)?;
        data[range].fill(0);
        Ok(())
    }

    fn map(&self, _lane: usize, count: usize, offset: u64) -> io::Result<MappedRegion<'_>> {
        let data = self.data.read();
        let range = check_range(data.len(), count, offset)?;
        Ok(MappedRegion::Mapped {
            offset,
            view: RwLockReadGuard::map(data, |d| &d[range]),
        })
    }

    fn is_zeroed(&self) -> bool {
        self.zeroed
    }
}

/// Namespace backed by a memory-mapped file
pub struct FileNamespace {
    map: RwLock<MmapMut>,
    path: PathBuf,
    zeroed: bool,
    // keeps the mapping's file open
    _file: File,
}

impl FileNamespace {
    /// Create (or truncate) a file of `size` bytes and map it
    ///
    /// The new file reads as zeros, so the namespace reports itself as
    /// pre-zeroed and layout creation skips zeroing the map.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;

        Self::from_file(file, path.as_ref(), true)
    }

    /// Map an existing file
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Self::from_file(file, path.as_ref(), false)
    }

    fn from_file(file: File, path: &Path, zeroed: bool) -> io::Result<Self> {
        // SAFETY: the mapping is only accessed through the RwLock below and the
        // file handle lives as long as the mapping.
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(FileNamespace {
            map: RwLock::new(map),
            path: path.to_path_buf(),
            zeroed,
            _file: file,
        })
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the mapped file
    pub fn len(&self) -> u64 {
        self.map.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush the whole mapping to disk
    pub fn flush(&self) -> io::Result<()> {
        self.map.read().flush()
    }
}

impl NamespaceIo for FileNamespace {
    fn read(&self, _lane: usize, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let map = self.map.read();
        let range = check_range(map.len(), buf.len(), offset)?;
        buf.copy_from_slice(&map[range]);
        Ok(())
    }

    fn write(&self, _lane: usize, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut map = self.map.write();
        let range = check_range(map.len(), buf.len(), offset)?;
        let (start, len) = (range.start, range.len());
        map[range].copy_from_slice(buf);
        map.flush_range(start, len)
    }

    fn zero(&self, _lane: usize, count: u64, offset: u64) -> io::Result<()> {
        let mut map = self.map.write();
        let range = check_range(map.len(), count as usize, offset)?;
        let (start, len) = (range.start, range.len());
        map[range].fill(0);
        map.flush_range(start, len)
    }

    fn map(&self, _lane: usize, count: usize, offset: u64) -> io::Result<MappedRegion<'_>> {
        let map = self.map.read();
        let range = check_range(map.len(), count, offset)?;
        Ok(MappedRegion::Mapped {
            offset,
            view: RwLockReadGuard::map(map, |m| &m[range]),
        })
    }

    fn sync(&self, region: &MappedRegion<'_>) -> io::Result<()> {
        let (start, len) = (region.offset() as usize, region.len());
        match region {
            // The region's read guard is still alive, so flush through a
            // fresh read guard on the same lock.
            MappedRegion::Mapped { .. } => self.map.read_recursive().flush_range(start, len),
            MappedRegion::Buffered { .. } => Ok(()),
        }
    }

    fn is_zeroed(&self) -> bool {
        self.zeroed
    }
}
