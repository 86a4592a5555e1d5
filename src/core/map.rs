//! Map access and region locking
//!
//! Map entries are guarded by `nfree` region locks per arena. Entries that
//! share a 64-byte stride of the map share a lock, so two lanes never
//! update the same cache line concurrently while the lock count stays
//! bounded by nfree.

use crate::arena::Arena;
use crate::error::Result;
use crate::layout::{MapEntry, MapState, MAP_ENTRY_LBA_MASK, MAP_ENTRY_SIZE, MAP_LOCK_ALIGN};
use crate::namespace::NamespaceIo;
use parking_lot::MutexGuard;
use tracing::trace;

/// A locked map entry
///
/// Dropping the guard releases the lock without writing anything, which is
/// how a failed atomic sequence backs out.
pub(crate) struct MapGuard<'a> {
    arena: &'a Arena,
    premap_lba: u32,
    /// Entry as read under the lock, initial state already resolved
    pub(crate) entry: MapEntry,
    _lock: MutexGuard<'a, ()>,
}

impl MapGuard<'_> {
    /// Persist `entry` and release the lock
    pub(crate) fn commit<N: NamespaceIo + ?Sized>(
        self,
        ns: &N,
        lane: usize,
        entry: MapEntry,
    ) -> Result<()> {
        let result = self.arena.write_map_entry(ns, lane, self.premap_lba, entry);

        trace!(
            "unlocked map[{}]: {} {:?}",
            self.premap_lba,
            entry.block(),
            entry.state()
        );

        result
    }

    /// Release the lock without persisting anything
    pub(crate) fn abort(self) {
        trace!("aborted map[{}]", self.premap_lba);
    }
}

impl Arena {
    fn map_entry_off(&self, premap_lba: u32) -> u64 {
        self.mapoff + MAP_ENTRY_SIZE * premap_lba as u64
    }

    /// Region lock protecting `premap_lba`'s map entry
    pub(crate) fn map_lock_index(&self, premap_lba: u32) -> usize {
        ((premap_lba as u64 * MAP_ENTRY_SIZE / MAP_LOCK_ALIGN) % self.map_locks.len() as u64)
            as usize
    }

    /// Read a map entry without locking
    pub(crate) fn read_map_entry<N: NamespaceIo + ?Sized>(
        &self,
        ns: &N,
        lane: usize,
        premap_lba: u32,
    ) -> Result<MapEntry> {
        let mut bytes = [0u8; MAP_ENTRY_SIZE as usize];
        ns.read(lane, &mut bytes, self.map_entry_off(premap_lba))?;
        Ok(MapEntry::from_bytes(bytes))
    }

    /// Write a map entry without locking
    pub(crate) fn write_map_entry<N: NamespaceIo + ?Sized>(
        &self,
        ns: &N,
        lane: usize,
        premap_lba: u32,
        entry: MapEntry,
    ) -> Result<()> {
        ns.write(lane, &entry.to_bytes(), self.map_entry_off(premap_lba))?;
        Ok(())
    }

    /// Lock `premap_lba`'s map region and read its entry
    ///
    /// A never-written entry reads as a normal entry mapping the block to
    /// itself; that value is not persisted here.
    pub(crate) fn map_lock<N: NamespaceIo + ?Sized>(
        &self,
        ns: &N,
        lane: usize,
        premap_lba: u32,
    ) -> Result<MapGuard<'_>> {
        let lock = self.map_locks[self.map_lock_index(premap_lba)].lock();

        let mut entry = self.read_map_entry(ns, lane, premap_lba)?;
        if entry.state() == MapState::Initial {
            entry = MapEntry::normal(premap_lba & MAP_ENTRY_LBA_MASK);
        }

        trace!(
            "locked map[{}]: {} {:?}",
            premap_lba,
            entry.block(),
            entry.state()
        );

        Ok(MapGuard {
            arena: self,
            premap_lba,
            entry,
            _lock: lock,
        })
    }
}
