//! # btt-rs - Block Translation Table
//!
//! `btt-rs` gives power-fail atomic updates of fixed-size blocks stored in a
//! byte-addressable persistent region (a "namespace"). A write either lands
//! completely or not at all, without journaling the whole device:
//!
//! - **Arenas** of up to 512 GiB, each with its own metadata
//! - **Indirection map** from external blocks to internal blocks
//! - **Free-list log** ("flog") making each remap atomic and recoverable
//! - **Lanes** for lock-light concurrent access from many threads
//! - **Consistency checking** of the whole table
//!
//! The on-media format is the BTT layout used by NVDIMM namespaces, bit for
//! bit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use btt_rs::{BttBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let btt = BttBuilder::new()
//!     .raw_size(64 << 20)
//!     .block_size(512)
//!     .open_in_memory()?;
//!
//! // The first write lays out the namespace
//! btt.write(0, 42, &[7u8; 512])?;
//!
//! let mut block = [0u8; 512];
//! btt.read(0, 42, &mut block)?;
//! assert_eq!(block, [7u8; 512]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom storage
//!
//! Anything implementing [`NamespaceIo`] can hold a table:
//!
//! ```rust,no_run
//! use btt_rs::{Btt, FileNamespace, Result};
//!
//! # fn main() -> Result<()> {
//! let ns = FileNamespace::create("blocks.img", 256 << 20)?;
//! let mut btt = Btt::open(ns, 256 << 20, 4096, [0; 16], 8)?;
//!
//! btt.set_zero(0, 3)?;
//! assert!(btt.check()?.is_consistent());
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use self::core::{arena, btt, check, config, error, flog, layout, map, namespace};

// Re-export core types that users need
pub use crate::core::{
    arena::ArenaStats,
    btt::{Btt, LayoutState},
    check::{ArenaCheck, CheckReport},
    config::BttConfig,
    error::{BttError, ErrorKind, Result},
    layout::{Geometry, DEFAULT_NFREE, MAX_ARENA, MIN_SIZE},
    namespace::{FileNamespace, MappedRegion, MemNamespace, NamespaceIo},
};

use std::path::Path;
use tracing::debug;

/// Builder for opening tables with custom configuration
///
/// # Examples
///
/// ```rust,no_run
/// use btt_rs::{BttBuilder, BttConfig};
///
/// # fn main() -> btt_rs::Result<()> {
/// let config = BttConfig::from_toml_str("block_size = 4096\nmax_lanes = 16")?;
///
/// let btt = BttBuilder::new()
///     .config(config)
///     .parent_uuid([0x11; 16])
///     .create_file("volume.img", 1 << 30)?;
///
/// println!("{} blocks, {} lanes", btt.block_count(), btt.lane_count());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct BttBuilder {
    config: BttConfig,
    raw_size: Option<u64>,
    parent_uuid: [u8; 16],
}

impl BttBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: BttConfig) -> Self {
        self.config = config;
        self
    }

    /// External block size in bytes
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Upper bound on the lane count (0 = no bound)
    pub fn max_lanes(mut self, max_lanes: u32) -> Self {
        self.config.max_lanes = max_lanes;
        self
    }

    /// Free blocks per arena for a layout written by this table
    pub fn free_blocks(mut self, nfree: u32) -> Self {
        self.config.nfree = nfree;
        self
    }

    /// Bytes of the namespace the table may use
    pub fn raw_size(mut self, raw_size: u64) -> Self {
        self.raw_size = Some(raw_size);
        self
    }

    /// UUID of the namespace the table belongs to
    pub fn parent_uuid(mut self, parent_uuid: [u8; 16]) -> Self {
        self.parent_uuid = parent_uuid;
        self
    }

    /// Open a table over `ns`; requires [`raw_size`](Self::raw_size)
    pub fn open<N: NamespaceIo>(self, ns: N) -> Result<Btt<N>> {
        let raw_size = self.require_raw_size()?;
        Btt::open_with_config(ns, raw_size, self.parent_uuid, &self.config)
    }

    /// Open a table over a fresh, zeroed in-memory namespace
    pub fn open_in_memory(self) -> Result<Btt<MemNamespace>> {
        let raw_size = self.require_raw_size()?;
        let len = usize::try_from(raw_size)
            .map_err(|_| BttError::Config(format!("raw_size {} exceeds memory", raw_size)))?;

        debug!("Creating in-memory namespace of {} bytes", raw_size);
        Btt::open_with_config(
            MemNamespace::new(len),
            raw_size,
            self.parent_uuid,
            &self.config,
        )
    }

    /// Create a file of `size` bytes and open a table over it
    pub fn create_file<P: AsRef<Path>>(self, path: P, size: u64) -> Result<Btt<FileNamespace>> {
        debug!("Creating namespace file {:?} ({} bytes)", path.as_ref(), size);
        let ns = FileNamespace::create(path, size)?;
        let raw_size = self.raw_size.unwrap_or(size);
        Btt::open_with_config(ns, raw_size, self.parent_uuid, &self.config)
    }

    /// Open a table over an existing file, using the whole file unless
    /// [`raw_size`](Self::raw_size) says otherwise
    pub fn open_file<P: AsRef<Path>>(self, path: P) -> Result<Btt<FileNamespace>> {
        let ns = FileNamespace::open(path)?;
        let raw_size = self.raw_size.unwrap_or(ns.len());
        Btt::open_with_config(ns, raw_size, self.parent_uuid, &self.config)
    }

    fn require_raw_size(&self) -> Result<u64> {
        self.raw_size
            .ok_or_else(|| BttError::Config("raw_size must be set".into()))
    }
}
