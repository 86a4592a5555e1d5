//! BTT table handle
//!
//! [`Btt`] discovers an existing layout when opened, or writes one on the
//! first write or error flag, and routes every external block to its arena.
//! Reads, writes and flag changes go through the flog and map of that arena.

use crate::arena::{Arena, ArenaStats};
use crate::check::{check_arena, CheckReport};
use crate::config::BttConfig;
use crate::error::{BttError, Result};
use crate::layout::{
    roundup, BttInfo, FlogEntry, Geometry, MapEntry, MapState, FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN,
    INFO_SIG, INFO_SIZE, INFO_VERSION_MAJOR, INFO_VERSION_MINOR, MAP_ENTRY_ERROR, MAP_ENTRY_ZERO,
    MAX_ARENA, MIN_SIZE, UUID_LEN,
};
use crate::namespace::NamespaceIo;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::OnceLock;
use tracing::{debug, error, info, trace, warn};

/// Whether the namespace holds a layout yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LayoutState {
    /// Nothing written; every block reads as zeros
    Absent = 0,
    /// The first write is laying out the arenas
    Creating = 1,
    /// Arenas loaded and serving I/O
    Ready = 2,
}

impl LayoutState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LayoutState::Creating,
            2 => LayoutState::Ready,
            _ => LayoutState::Absent,
        }
    }
}

/// Runtime state of a written layout
struct Layout {
    uuid: [u8; UUID_LEN],
    arenas: Vec<Arena>,
}

/// Outcome of scanning the namespace for info blocks
enum Discovery {
    /// Every arena validated, paired with its absolute offset
    Present(Vec<(u64, BttInfo)>),
    Absent,
}

/// A Block Translation Table over a namespace
///
/// Lanes are caller-assigned concurrency slots in `0..lane_count()`. A lane
/// may be used by one thread at a time; different lanes run in parallel.
/// The handle is `Send + Sync` and is usually shared through an `Arc`.
///
/// # Examples
///
/// ```rust,no_run
/// use btt_rs::{Btt, MemNamespace};
///
/// # fn main() -> btt_rs::Result<()> {
/// let ns = MemNamespace::new(32 << 20);
/// let btt = Btt::open(ns, 32 << 20, 512, [0; 16], 4)?;
///
/// let block = vec![0xAB; 512];
/// btt.write(0, 17, &block)?;
///
/// let mut out = vec![0; 512];
/// btt.read(0, 17, &mut out)?;
/// assert_eq!(out, block);
/// # Ok(())
/// # }
/// ```
pub struct Btt<N: NamespaceIo> {
    ns: N,
    rawsize: u64,
    lbasize: u32,
    nfree: u32,
    nlba: u64,
    narena: usize,
    nlane: usize,
    parent_uuid: [u8; UUID_LEN],

    state: AtomicU8,
    layout: OnceLock<Layout>,
    /// Serializes layout creation
    layout_lock: Mutex<()>,
}

impl<N: NamespaceIo> Btt<N> {
    /// Open a table with `lbasize`-byte blocks over the first `rawsize`
    /// bytes of `ns`
    ///
    /// `max_lanes` bounds the lane count when non-zero.
    pub fn open(
        ns: N,
        rawsize: u64,
        lbasize: u32,
        parent_uuid: [u8; UUID_LEN],
        max_lanes: u32,
    ) -> Result<Self> {
        let config = BttConfig {
            block_size: lbasize,
            max_lanes,
            ..BttConfig::default()
        };
        Self::open_with_config(ns, rawsize, parent_uuid, &config)
    }

    /// Open a table described by `config`
    ///
    /// An existing layout is loaded and any interrupted write is completed.
    /// Without one, the geometry a new layout would have is computed so that
    /// [`block_count`](Self::block_count) is valid before the first write.
    pub fn open_with_config(
        ns: N,
        rawsize: u64,
        parent_uuid: [u8; UUID_LEN],
        config: &BttConfig,
    ) -> Result<Self> {
        config.validate()?;
        if rawsize < MIN_SIZE {
            return Err(BttError::NamespaceTooSmall {
                rawsize,
                min: MIN_SIZE,
            });
        }
        let lbasize = config.block_size;

        let (layout, nfree, nlba, narena) =
            match discover(&ns, 0, rawsize, lbasize, &parent_uuid)? {
                Discovery::Present(infos) => {
                    let nfree = infos
                        .iter()
                        .map(|(_, info)| info.nfree)
                        .min()
                        .unwrap_or(config.nfree);
                    let nlba = infos
                        .iter()
                        .map(|(_, info)| info.external_nlba as u64)
                        .sum();
                    let uuid = infos[0].1.uuid;
                    let arenas = load_arenas(&ns, 0, &infos, nfree)?;
                    let narena = arenas.len();

                    (Some(Layout { uuid, arenas }), nfree, nlba, narena)
                }
                Discovery::Absent => {
                    let geo = Geometry::compute(rawsize, lbasize, config.nfree)?;
                    debug!(
                        "Computed geometry: {} arena(s), {} blocks, internal block size {}",
                        geo.narena(),
                        geo.nlba(),
                        geo.internal_lbasize
                    );
                    (None, config.nfree, geo.nlba(), geo.narena())
                }
            };

        let mut nlane = nfree;
        if config.max_lanes != 0 && nlane > config.max_lanes {
            nlane = config.max_lanes;
        }

        let (state, layout) = match layout {
            Some(layout) => (LayoutState::Ready, OnceLock::from(layout)),
            None => (LayoutState::Absent, OnceLock::new()),
        };

        info!(
            "Opened BTT: {} blocks of {} bytes in {} arena(s), {} lanes, layout {:?}",
            nlba, lbasize, narena, nlane, state
        );

        Ok(Btt {
            ns,
            rawsize,
            lbasize,
            nfree,
            nlba,
            narena,
            nlane: nlane as usize,
            parent_uuid,
            state: AtomicU8::new(state as u8),
            layout,
            layout_lock: Mutex::new(()),
        })
    }

    /// Number of lanes callers may use concurrently
    pub fn lane_count(&self) -> usize {
        self.nlane
    }

    /// Number of external blocks
    pub fn block_count(&self) -> u64 {
        self.nlba
    }

    /// External block size in bytes
    pub fn block_size(&self) -> u32 {
        self.lbasize
    }

    pub fn arena_count(&self) -> usize {
        self.narena
    }

    /// Free blocks per arena
    pub fn free_blocks(&self) -> u32 {
        self.nfree
    }

    /// Table UUID, once a layout exists
    pub fn uuid(&self) -> Option<[u8; UUID_LEN]> {
        self.layout.get().map(|layout| layout.uuid)
    }

    pub fn parent_uuid(&self) -> [u8; UUID_LEN] {
        self.parent_uuid
    }

    pub fn layout_state(&self) -> LayoutState {
        LayoutState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_laid_out(&self) -> bool {
        self.layout.get().is_some()
    }

    /// The underlying namespace
    pub fn namespace(&self) -> &N {
        &self.ns
    }

    /// Read block `lba` into `buf`
    ///
    /// Blocks that were never written, or were marked zero, read as zeros.
    /// A block marked in error fails with [`BttError::BlockError`].
    pub fn read(&self, lane: usize, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.check_lane(lane)?;
        self.check_lba(lba)?;
        self.check_buf(buf.len())?;

        let layout = match self.layout.get() {
            Some(layout) => layout,
            None => {
                buf.fill(0);
                return Ok(());
            }
        };
        let (arena, premap_lba) = lba_to_arena(layout, lba)?;

        let mut entry = arena.read_map_entry(&self.ns, lane, premap_lba)?;
        let tracking = ReadTracking(&arena.rtt[lane]);

        loop {
            match entry.state() {
                MapState::Error => return Err(BttError::BlockError { lba }),
                MapState::Initial | MapState::Zero => {
                    buf.fill(0);
                    return Ok(());
                }
                MapState::Normal => {}
            }

            // publish the block before re-reading the map so a writer
            // recycling it either sees us or has already remapped
            tracking.publish(entry);

            let latest = arena.read_map_entry(&self.ns, lane, premap_lba)?;
            if latest == entry {
                break;
            }
            trace!("map[{}] changed during read, retrying", premap_lba);
            entry = latest;
        }

        self.ns
            .read(lane, buf, arena.block_offset(entry.block()))?;
        Ok(())
    }

    /// Atomically replace block `lba` with `buf`
    ///
    /// The first write to a table without a layout creates it.
    pub fn write(&self, lane: usize, lba: u64, buf: &[u8]) -> Result<()> {
        self.check_lane(lane)?;
        self.check_lba(lba)?;
        self.check_buf(buf.len())?;

        let layout = self.ensure_layout(lane)?;
        let (arena, premap_lba) = lba_to_arena(layout, lba)?;
        arena.check_writable()?;

        // this lane's flog slot owns its free block exclusively
        let mut flog = arena.flogs[lane].lock();
        let free_entry = MapEntry::normal(flog.free_block());

        arena.wait_for_readers(free_entry, self.nlane);

        self.ns
            .write(lane, buf, arena.block_offset(free_entry.block()))?;

        let guard = arena.map_lock(&self.ns, lane, premap_lba)?;
        let old_entry = guard.entry;

        if let Err(e) = flog.update(&self.ns, lane, premap_lba, old_entry.0, free_entry.0) {
            guard.abort();
            return Err(e);
        }

        if let Err(e) = guard.commit(&self.ns, lane, free_entry) {
            error!(
                "Map update for block {} failed after flog update: {}",
                lba, e
            );
            if let Err(set_err) = arena.set_error(&self.ns, lane) {
                error!(
                    "Arena {}: failed to record error flag: {}",
                    arena.index, set_err
                );
            }
            return Err(BttError::MapUpdateFailed {
                lba,
                arena: arena.index,
                source: Box::new(e),
            });
        }

        Ok(())
    }

    /// Mark block `lba` as reading zeros
    ///
    /// Does nothing when no layout exists yet or the block already reads
    /// as zeros.
    pub fn set_zero(&self, lane: usize, lba: u64) -> Result<()> {
        self.set_flag(lane, lba, MAP_ENTRY_ZERO)
    }

    /// Mark block `lba` as bad; reads fail until it is written again
    pub fn set_error(&self, lane: usize, lba: u64) -> Result<()> {
        self.set_flag(lane, lba, MAP_ENTRY_ERROR)
    }

    fn set_flag(&self, lane: usize, lba: u64, flag: u32) -> Result<()> {
        self.check_lane(lane)?;
        self.check_lba(lba)?;

        let layout = match self.layout.get() {
            Some(layout) => layout,
            // every block already reads as zeros
            None if flag == MAP_ENTRY_ZERO => return Ok(()),
            None => self.ensure_layout(lane)?,
        };
        let (arena, premap_lba) = lba_to_arena(layout, lba)?;
        arena.check_writable()?;

        let guard = arena.map_lock(&self.ns, lane, premap_lba)?;

        if flag == MAP_ENTRY_ZERO && guard.entry.is_zero_or_initial() {
            guard.abort();
            return Ok(());
        }

        let new_entry = guard.entry.with_flag(flag);
        guard.commit(&self.ns, lane, new_entry)
    }

    /// Scan every arena for duplicate and unreferenced internal blocks
    ///
    /// Taking `&mut self` keeps readers and writers out for the duration.
    /// A table without a layout is consistent.
    pub fn check(&mut self) -> Result<CheckReport> {
        let layout = match self.layout.get_mut() {
            Some(layout) => layout,
            None => {
                debug!("No layout yet, nothing to check");
                return Ok(CheckReport::default());
            }
        };

        let mut arenas = Vec::with_capacity(layout.arenas.len());
        for arena in layout.arenas.iter_mut() {
            arenas.push(check_arena(&self.ns, arena)?);
        }

        let report = CheckReport { arenas };
        if report.is_consistent() {
            info!("Consistency check passed for {} arena(s)", self.narena);
        } else {
            warn!("Consistency check found problems: {:?}", report);
        }

        Ok(report)
    }

    /// Geometry and health of each loaded arena, empty before layout
    pub fn arena_stats(&self) -> Vec<ArenaStats> {
        self.layout
            .get()
            .map(|layout| layout.arenas.iter().map(Arena::stats).collect())
            .unwrap_or_default()
    }

    /// Release all runtime state and hand back the namespace
    pub fn close(self) -> N {
        info!(
            "Closing BTT ({} arena(s), layout {:?})",
            self.narena,
            self.layout_state()
        );
        self.ns
    }

    fn check_lane(&self, lane: usize) -> Result<()> {
        if lane >= self.nlane {
            return Err(BttError::InvalidLane {
                lane,
                nlane: self.nlane,
            });
        }
        Ok(())
    }

    fn check_lba(&self, lba: u64) -> Result<()> {
        if lba >= self.nlba {
            return Err(BttError::LbaOutOfRange {
                lba,
                nlba: self.nlba,
            });
        }
        Ok(())
    }

    fn check_buf(&self, len: usize) -> Result<()> {
        if len != self.lbasize as usize {
            return Err(BttError::InvalidBufferLength {
                expected: self.lbasize as usize,
                actual: len,
            });
        }
        Ok(())
    }

    /// Return the layout, writing it first if this is the first write
    fn ensure_layout(&self, lane: usize) -> Result<&Layout> {
        if let Some(layout) = self.layout.get() {
            return Ok(layout);
        }

        let _guard = self.layout_lock.lock();
        if let Some(layout) = self.layout.get() {
            return Ok(layout);
        }

        self.state
            .store(LayoutState::Creating as u8, Ordering::Release);

        match self.write_layout(lane) {
            Ok(layout) => {
                let layout = self.layout.get_or_init(move || layout);
                self.state.store(LayoutState::Ready as u8, Ordering::Release);
                Ok(layout)
            }
            Err(e) => {
                // a later write tries again
                self.state.store(LayoutState::Absent as u8, Ordering::Release);
                error!("Failed to write BTT layout: {}", e);
                Err(e)
            }
        }
    }

    /// Write fresh metadata for every arena, then load it
    fn write_layout(&self, lane: usize) -> Result<Layout> {
        let geo = Geometry::compute(self.rawsize, self.lbasize, self.nfree)?;
        let uuid: [u8; UUID_LEN] = rand::random();

        info!(
            "Writing BTT layout: {} arena(s), {} blocks, nfree {}",
            geo.narena(),
            geo.nlba(),
            self.nfree
        );

        let pair_stride = roundup(2 * FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN);
        let mut infos = Vec::with_capacity(geo.narena());
        let mut arena_off = 0u64;

        for a in &geo.arenas {
            debug!(
                "Arena at {:#x}: data {:#x} map {:#x} flog {:#x} info {:#x} next {:#x}",
                arena_off, a.dataoff, a.mapoff, a.flogoff, a.infooff, a.nextoff
            );

            if !self.ns.is_zeroed() {
                self.ns.zero(lane, a.mapsize, arena_off + a.mapoff)?;
            }

            // first half marks one trailing block free, second half blank
            let mut pair = [0u8; 2 * FlogEntry::SIZE];
            for i in 0..self.nfree {
                let free = (a.external_nlba + i) | MAP_ENTRY_ZERO;
                let entry = FlogEntry {
                    lba: 0,
                    old_map: free,
                    new_map: free,
                    seq: 1,
                };
                pair[..FlogEntry::SIZE].copy_from_slice(&entry.to_bytes());
                self.ns.write(
                    lane,
                    &pair,
                    arena_off + a.flogoff + i as u64 * pair_stride,
                )?;
            }

            let info = BttInfo {
                sig: INFO_SIG,
                uuid,
                parent_uuid: self.parent_uuid,
                flags: 0,
                major: INFO_VERSION_MAJOR,
                minor: INFO_VERSION_MINOR,
                external_lbasize: self.lbasize,
                external_nlba: a.external_nlba,
                internal_lbasize: geo.internal_lbasize,
                internal_nlba: a.internal_nlba,
                nfree: self.nfree,
                infosize: INFO_SIZE as u32,
                nextoff: a.nextoff,
                dataoff: a.dataoff,
                mapoff: a.mapoff,
                flogoff: a.flogoff,
                infooff: a.infooff,
            };
            let bytes = info.to_bytes();
            self.ns.write(lane, &bytes, arena_off)?;
            self.ns.write(lane, &bytes, arena_off + a.infooff)?;

            infos.push((arena_off, info));
            arena_off += a.nextoff;
        }

        let arenas = load_arenas(&self.ns, lane, &infos, self.nfree)?;
        Ok(Layout { uuid, arenas })
    }
}

/// Clears a lane's read tracking slot when dropped
struct ReadTracking<'a>(&'a AtomicU32);

impl ReadTracking<'_> {
    fn publish(&self, entry: MapEntry) {
        self.0.store(entry.0, Ordering::SeqCst);
    }
}

impl Drop for ReadTracking<'_> {
    fn drop(&mut self) {
        self.0.store(MAP_ENTRY_ERROR, Ordering::SeqCst);
    }
}

/// Walk the arena chain validating each info block
///
/// A block that fails validation means "no layout", not an error. A valid
/// block whose contents cannot belong to this table is an error.
fn discover<N: NamespaceIo + ?Sized>(
    ns: &N,
    lane: usize,
    rawsize: u64,
    lbasize: u32,
    parent_uuid: &[u8; UUID_LEN],
) -> Result<Discovery> {
    let mut infos = Vec::new();
    let mut remaining = rawsize;
    let mut arena_off = 0u64;
    let mut bytes = vec![0u8; INFO_SIZE];

    while remaining >= MIN_SIZE {
        ns.read(lane, &mut bytes, arena_off)?;

        let info = match BttInfo::parse_valid(&bytes, parent_uuid) {
            Some(info) => info,
            None => {
                debug!(
                    "No valid info block at {:#x}, namespace not laid out",
                    arena_off
                );
                return Ok(Discovery::Absent);
            }
        };

        if info.external_lbasize != lbasize {
            return Err(BttError::InvalidLayout(format!(
                "arena at {:#x} has block size {}, expected {}",
                arena_off, info.external_lbasize, lbasize
            )));
        }
        if info.nfree == 0 {
            return Err(BttError::InvalidLayout(format!(
                "arena at {:#x} has no free blocks",
                arena_off
            )));
        }
        if info.external_nlba == 0 {
            return Err(BttError::InvalidLayout(format!(
                "arena at {:#x} has no external blocks",
                arena_off
            )));
        }
        if info.nextoff != 0 && info.nextoff != MAX_ARENA {
            return Err(BttError::InvalidLayout(format!(
                "arena at {:#x} has invalid size {:#x}",
                arena_off, info.nextoff
            )));
        }

        // the backup info block bounds every region of the arena
        let span = if info.nextoff == 0 {
            remaining
        } else {
            info.nextoff
        };
        if info
            .infooff
            .checked_add(INFO_SIZE as u64)
            .map_or(true, |end| end > span)
        {
            return Err(BttError::InvalidLayout(format!(
                "arena at {:#x}: info offset {:#x} beyond arena of {:#x} bytes",
                arena_off, info.infooff, span
            )));
        }

        let nextoff = info.nextoff;
        infos.push((arena_off, info));

        if nextoff == 0 {
            break;
        }
        if nextoff > remaining {
            return Err(BttError::InvalidLayout(format!(
                "arena at {:#x}: next offset {:#x} beyond namespace",
                arena_off, nextoff
            )));
        }
        arena_off += nextoff;
        remaining -= nextoff;
    }

    debug!("Found {} valid arena(s)", infos.len());
    Ok(Discovery::Present(infos))
}

fn load_arenas<N: NamespaceIo + ?Sized>(
    ns: &N,
    lane: usize,
    infos: &[(u64, BttInfo)],
    nfree: u32,
) -> Result<Vec<Arena>> {
    let mut arenas = Vec::new();
    arenas
        .try_reserve_exact(infos.len())
        .map_err(|e| BttError::Allocation(format!("{} arenas: {}", infos.len(), e)))?;

    for (index, (arena_off, info)) in infos.iter().enumerate() {
        arenas.push(Arena::load(ns, lane, index, *arena_off, info, nfree)?);
    }
    Ok(arenas)
}

/// Find the arena holding external block `lba` and its pre-map LBA there
fn lba_to_arena(layout: &Layout, lba: u64) -> Result<(&Arena, u32)> {
    let mut remaining = lba;
    for arena in &layout.arenas {
        if remaining < arena.external_nlba as u64 {
            return Ok((arena, remaining as u32));
        }
        remaining -= arena.external_nlba as u64;
    }

    Err(BttError::LbaOutOfRange {
        lba,
        nlba: layout
            .arenas
            .iter()
            .map(|a| a.external_nlba as u64)
            .sum(),
    })
}
