//! Per-arena runtime state
//!
//! An [`Arena`] owns everything the I/O paths need for one arena: its
//! offsets (absolute, unlike the arena-relative offsets stored on media),
//! the flog cache, the read tracking table and the map region locks. All of
//! it is released together when the arena is dropped.

use crate::error::{BttError, Result};
use crate::flog::FlogRuntime;
use crate::layout::{
    flog_size, roundup, BttInfo, MapEntry, FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN, INFO_FLAG_ERROR,
    INFO_FLAG_ERROR_MASK, INFO_SIZE, MAP_ENTRY_ERROR, MAP_ENTRY_SIZE,
};
use crate::namespace::NamespaceIo;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, warn};

/// Snapshot of an arena's geometry and health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub index: usize,
    pub flags: u32,
    pub external_nlba: u32,
    pub internal_nlba: u32,
    pub internal_lbasize: u32,
    pub startoff: u64,
    pub dataoff: u64,
    pub mapoff: u64,
    pub flogoff: u64,
    pub infooff: u64,
    pub nextoff: u64,
}

impl ArenaStats {
    pub fn is_error(&self) -> bool {
        self.flags & INFO_FLAG_ERROR_MASK != 0
    }
}

pub(crate) struct Arena {
    pub(crate) index: usize,
    flags: AtomicU32,
    pub(crate) external_nlba: u32,
    pub(crate) internal_lbasize: u32,
    pub(crate) internal_nlba: u32,

    pub(crate) startoff: u64,
    pub(crate) dataoff: u64,
    pub(crate) mapoff: u64,
    pub(crate) flogoff: u64,
    pub(crate) infooff: u64,
    pub(crate) nextoff: u64,

    /// Flog cache, indexed by lane
    pub(crate) flogs: Vec<Mutex<FlogRuntime>>,

    /// Read tracking table, indexed by lane
    ///
    /// A reader publishes the normal-state map entry it is about to read;
    /// idle slots hold the bare error flag, which matches no normal entry.
    pub(crate) rtt: Vec<AtomicU32>,

    /// nfree region locks over the map
    pub(crate) map_locks: Vec<Mutex<()>>,

    info_lock: Mutex<()>,
}

impl Arena {
    /// Build the runtime state for the arena at `arena_off` and run flog
    /// recovery on it
    pub(crate) fn load<N: NamespaceIo + ?Sized>(
        ns: &N,
        lane: usize,
        index: usize,
        arena_off: u64,
        info: &BttInfo,
        nfree: u32,
    ) -> Result<Self> {
        debug!(
            "Loading arena {} at {:#x}: external_nlba {} internal_nlba {} flags {:#x}",
            index, arena_off, info.external_nlba, info.internal_nlba, info.flags
        );

        check_regions(index, info, nfree)?;
        let flogoff = arena_off + info.flogoff;

        let mut arena = Arena {
            index,
            flags: AtomicU32::new(info.flags),
            external_nlba: info.external_nlba,
            internal_lbasize: info.internal_lbasize,
            internal_nlba: info.internal_nlba,
            startoff: arena_off,
            dataoff: arena_off + info.dataoff,
            mapoff: arena_off + info.mapoff,
            flogoff,
            infooff: arena_off + info.infooff,
            nextoff: if info.nextoff == 0 {
                0
            } else {
                arena_off + info.nextoff
            },
            flogs: Vec::new(),
            rtt: alloc_vec(nfree as usize, "rtt", || AtomicU32::new(MAP_ENTRY_ERROR))?,
            map_locks: alloc_vec(nfree as usize, "map lock", || Mutex::new(()))?,
            info_lock: Mutex::new(()),
        };

        let mut flogs = Vec::new();
        flogs
            .try_reserve_exact(nfree as usize)
            .map_err(|e| BttError::Allocation(format!("{} flog entries: {}", nfree, e)))?;

        let pair_stride = roundup(2 * FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN);
        for i in 0..nfree {
            let pair_off = flogoff + i as u64 * pair_stride;
            match FlogRuntime::load(ns, lane, &arena, i, pair_off) {
                Ok(runtime) => flogs.push(Mutex::new(runtime)),
                Err(e) => {
                    if let Err(set_err) = arena.set_error(ns, lane) {
                        error!("Arena {}: failed to record error flag: {}", index, set_err);
                    }
                    return Err(e);
                }
            }
        }
        arena.flogs = flogs;

        Ok(arena)
    }

    pub(crate) fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub(crate) fn is_error(&self) -> bool {
        self.flags() & INFO_FLAG_ERROR_MASK != 0
    }

    /// Writes and flag changes are refused once an arena is in error state
    pub(crate) fn check_writable(&self) -> Result<()> {
        let flags = self.flags();
        if flags & INFO_FLAG_ERROR_MASK != 0 {
            return Err(BttError::ArenaError {
                arena: self.index,
                flags: flags & INFO_FLAG_ERROR_MASK,
            });
        }
        Ok(())
    }

    /// Set the error flag in memory and in both info blocks
    pub(crate) fn set_error<N: NamespaceIo + ?Sized>(&self, ns: &N, lane: usize) -> Result<()> {
        warn!("Arena {} entering error state", self.index);
        self.set_flags(ns, lane, INFO_FLAG_ERROR)
    }

    fn set_flags<N: NamespaceIo + ?Sized>(&self, ns: &N, lane: usize, setf: u32) -> Result<()> {
        self.flags.fetch_or(setf, Ordering::AcqRel);

        let _guard = self.info_lock.lock();

        let mut bytes = vec![0u8; INFO_SIZE];
        ns.read(lane, &mut bytes, self.startoff)?;

        let mut info = BttInfo::from_bytes(&bytes)?;
        info.flags |= setf;
        let bytes = info.to_bytes();

        ns.write(lane, &bytes, self.startoff)?;
        ns.write(lane, &bytes, self.startoff + info.infooff)?;

        Ok(())
    }

    /// Spin until no read tracking slot holds `entry`
    pub(crate) fn wait_for_readers(&self, entry: MapEntry, nlane: usize) {
        for slot in self.rtt.iter().take(nlane) {
            let backoff = Backoff::new();
            while slot.load(Ordering::SeqCst) == entry.0 {
                backoff.snooze();
            }
        }
    }

    /// Byte offset of internal block `block` in the namespace
    pub(crate) fn block_offset(&self, block: u32) -> u64 {
        self.dataoff + block as u64 * self.internal_lbasize as u64
    }

    pub(crate) fn stats(&self) -> ArenaStats {
        ArenaStats {
            index: self.index,
            flags: self.flags(),
            external_nlba: self.external_nlba,
            internal_nlba: self.internal_nlba,
            internal_lbasize: self.internal_lbasize,
            startoff: self.startoff,
            dataoff: self.dataoff,
            mapoff: self.mapoff,
            flogoff: self.flogoff,
            infooff: self.infooff,
            nextoff: self.nextoff,
        }
    }
}

/// Data, map and flog must follow each other in that order, ending at or
/// before the backup info block
fn check_regions(index: usize, info: &BttInfo, nfree: u32) -> Result<()> {
    let ends_before = |start: u64, len: u64, limit: u64| {
        start
            .checked_add(len)
            .map_or(false, |end| end <= limit)
    };

    let data_len = info.internal_nlba as u64 * info.internal_lbasize as u64;
    if !ends_before(info.dataoff, data_len, info.mapoff) {
        return Err(BttError::InvalidLayout(format!(
            "arena {}: data at {:#x} overlaps map offset {:#x}",
            index, info.dataoff, info.mapoff
        )));
    }

    let map_len = info.external_nlba as u64 * MAP_ENTRY_SIZE;
    if !ends_before(info.mapoff, map_len, info.flogoff) {
        return Err(BttError::InvalidLayout(format!(
            "arena {}: map at {:#x} overlaps flog offset {:#x}",
            index, info.mapoff, info.flogoff
        )));
    }

    if info.flogoff == 0 || !ends_before(info.flogoff, flog_size(nfree), info.infooff) {
        return Err(BttError::InvalidLayout(format!(
            "arena {}: flog offset {:#x} does not fit before info offset {:#x}",
            index, info.flogoff, info.infooff
        )));
    }

    Ok(())
}

/// Allocate `len` elements without aborting on allocation failure
fn alloc_vec<T>(len: usize, what: &str, init: impl Fn() -> T) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| BttError::Allocation(format!("{} {} entries: {}", len, what, e)))?;
    v.extend((0..len).map(|_| init()));
    Ok(v)
}
