//! Free-list log ("flog")
//!
//! Each lane owns one flog pair: two [`FlogEntry`] slots of which the one
//! with the dominating sequence number is current. A write never touches
//! the current slot. It fills in the other slot and only then bumps its
//! sequence number, so a crash at any point leaves one complete entry
//! authoritative.
//!
//! The current entry's `old_map` names the free block the lane writes to
//! next. If `new_map` differs from `old_map` and the map still shows
//! `old_map`, the write that produced the entry never finished its map
//! update; loading the pair completes it.

use crate::arena::Arena;
use crate::error::{BttError, Result};
use crate::layout::{next_seq, FlogEntry, MapEntry, MapState, FLOG_ENTRY_SIZE, MAP_ENTRY_LBA_MASK};
use crate::namespace::NamespaceIo;
use tracing::{error, trace};

/// Cached state of one lane's flog pair
#[derive(Debug, Clone, Default)]
pub(crate) struct FlogRuntime {
    /// Current entry
    pub(crate) flog: FlogEntry,
    /// Namespace offsets of the two slots
    entries: [u64; 2],
    /// Slot the next update goes to
    next: usize,
}

impl FlogRuntime {
    /// Load the pair at `pair_off`, recovering an interrupted map update
    ///
    /// A pair whose sequence numbers make no sense puts the arena in error
    /// state; the returned runtime is then a placeholder that no write will
    /// ever use.
    pub(crate) fn load<N: NamespaceIo + ?Sized>(
        ns: &N,
        lane: usize,
        arena: &Arena,
        flognum: u32,
        pair_off: u64,
    ) -> Result<Self> {
        let mut runtime = FlogRuntime {
            flog: FlogEntry::default(),
            entries: [pair_off, pair_off + FLOG_ENTRY_SIZE],
            next: 0,
        };

        let mut bytes = [0u8; 2 * FlogEntry::SIZE];
        ns.read(lane, &mut bytes, pair_off)?;
        let pair = [
            FlogEntry::from_bytes(&bytes[..FlogEntry::SIZE])?,
            FlogEntry::from_bytes(&bytes[FlogEntry::SIZE..])?,
        ];

        for entry in &pair {
            if entry.lba >= arena.external_nlba {
                return Err(BttError::InvalidLayout(format!(
                    "arena {} flog[{}]: lba {} out of range (nlba {})",
                    arena.index, flognum, entry.lba, arena.external_nlba
                )));
            }
        }

        trace!(
            "flog[{}] at {:#x}: seq {} / {}",
            flognum,
            pair_off,
            pair[0].seq,
            pair[1].seq
        );

        // no valid seq or identical seqs: inconsistent
        // one valid seq: that entry is current
        // two valid seqs: the later one is current
        let current = if pair[0].seq == pair[1].seq {
            error!(
                "arena {} flog[{}]: bad sequence numbers {} {}",
                arena.index, flognum, pair[0].seq, pair[1].seq
            );
            arena.set_error(ns, lane)?;
            return Ok(runtime);
        } else if pair[0].seq == 0 {
            runtime.next = 0;
            pair[1]
        } else if pair[1].seq == 0 {
            runtime.next = 1;
            pair[0]
        } else if next_seq(pair[0].seq) == pair[1].seq {
            runtime.next = 0;
            pair[1]
        } else {
            runtime.next = 1;
            pair[0]
        };
        runtime.flog = current;

        // old_map == new_map is the initial state, nothing to recover
        if current.old_map == current.new_map {
            return Ok(runtime);
        }

        let mut entry = arena.read_map_entry(ns, lane, current.lba)?;
        if entry.state() == MapState::Initial {
            entry = MapEntry::normal(current.lba);
        }

        if entry.0 != current.new_map && entry.0 == current.old_map {
            trace!(
                "recover flog[{}]: map[{}] -> {}",
                flognum,
                current.lba,
                current.new_map & MAP_ENTRY_LBA_MASK
            );
            arena.write_map_entry(ns, lane, current.lba, MapEntry(current.new_map))?;
        }

        Ok(runtime)
    }

    /// Internal block this lane writes to next
    pub(crate) fn free_block(&self) -> u32 {
        self.flog.old_map & MAP_ENTRY_LBA_MASK
    }

    /// Record that `lba` moves from `old_map` to `new_map`
    ///
    /// The first write covers `lba` and `old_map`; the second covers
    /// `new_map` and the sequence number that makes the slot current.
    pub(crate) fn update<N: NamespaceIo + ?Sized>(
        &mut self,
        ns: &N,
        lane: usize,
        lba: u32,
        old_map: u32,
        new_map: u32,
    ) -> Result<()> {
        let new_flog = FlogEntry {
            lba,
            old_map,
            new_map,
            seq: next_seq(self.flog.seq),
        };
        let bytes = new_flog.to_bytes();
        let off = self.entries[self.next];

        ns.write(lane, &bytes[..8], off)?;
        ns.write(lane, &bytes[8..], off + 8)?;

        self.next = 1 - self.next;
        self.flog = new_flog;

        trace!(
            "update flog[{}]: lba {} old {} new {} seq {}",
            lane,
            lba,
            old_map & MAP_ENTRY_LBA_MASK,
            new_map & MAP_ENTRY_LBA_MASK,
            new_flog.seq
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{
        BttInfo, Geometry, INFO_SIG, INFO_SIZE, MAP_ENTRY_NORMAL, MAP_ENTRY_ZERO, MIN_SIZE,
    };
    use crate::namespace::MemNamespace;

    const NFREE: u32 = 4;

    /// Namespace with a valid info block and initial flog pairs
    fn setup() -> (MemNamespace, BttInfo) {
        let geo = Geometry::compute(MIN_SIZE, 512, NFREE).unwrap();
        let a = geo.arenas[0];
        let info = BttInfo {
            sig: INFO_SIG,
            uuid: [0; 16],
            parent_uuid: [0; 16],
            flags: 0,
            major: 1,
            minor: 1,
            external_lbasize: 512,
            external_nlba: a.external_nlba,
            internal_lbasize: geo.internal_lbasize,
            internal_nlba: a.internal_nlba,
            nfree: NFREE,
            infosize: INFO_SIZE as u32,
            nextoff: 0,
            dataoff: a.dataoff,
            mapoff: a.mapoff,
            flogoff: a.flogoff,
            infooff: a.infooff,
        };
        let ns = MemNamespace::new(MIN_SIZE as usize);
        ns.write(0, &info.to_bytes(), 0).unwrap();
        ns.write(0, &info.to_bytes(), info.infooff).unwrap();
        for i in 0..NFREE {
            let free = (a.external_nlba + i) | MAP_ENTRY_ZERO;
            let entry = FlogEntry {
                lba: 0,
                old_map: free,
                new_map: free,
                seq: 1,
            };
            ns.write(0, &entry.to_bytes(), a.flogoff + i as u64 * 64)
                .unwrap();
        }
        (ns, info)
    }

    fn write_pair(ns: &MemNamespace, info: &BttInfo, lane: u64, pair: [FlogEntry; 2]) {
        let off = info.flogoff + lane * 64;
        ns.write(0, &pair[0].to_bytes(), off).unwrap();
        ns.write(0, &pair[1].to_bytes(), off + 16).unwrap();
    }

    #[test]
    fn test_initial_pair_needs_no_recovery() {
        let (ns, info) = setup();
        let arena = Arena::load(&ns, 0, 0, 0, &info, NFREE).unwrap();

        let runtime = arena.flogs[2].lock();
        assert_eq!(runtime.flog.seq, 1);
        assert_eq!(runtime.next, 1);
        assert_eq!(runtime.free_block(), info.external_nlba + 2);
    }

    #[test]
    fn test_update_alternates_slots() {
        let (ns, info) = setup();
        let arena = Arena::load(&ns, 0, 0, 0, &info, NFREE).unwrap();
        let mut runtime = arena.flogs[0].lock().clone();

        let free = runtime.free_block();
        runtime
            .update(&ns, 0, 7, MapEntry::normal(7).0, free | MAP_ENTRY_NORMAL)
            .unwrap();
        assert_eq!(runtime.flog.seq, 2);
        assert_eq!(runtime.free_block(), 7);
        assert_eq!(runtime.next, 0);

        let mut bytes = [0u8; 16];
        ns.read(0, &mut bytes, info.flogoff + 16).unwrap();
        assert_eq!(FlogEntry::from_bytes(&bytes).unwrap(), runtime.flog);

        runtime
            .update(&ns, 0, 8, MapEntry::normal(8).0, 7 | MAP_ENTRY_NORMAL)
            .unwrap();
        assert_eq!(runtime.flog.seq, 3);
        assert_eq!(runtime.next, 1);
    }

    #[test]
    fn test_sequence_wraps_to_later_entry() {
        let (ns, info) = setup();
        // seq 3 followed by seq 1: slot 1 is newer despite the smaller number
        let older = FlogEntry {
            lba: 0,
            old_map: 100 | MAP_ENTRY_NORMAL,
            new_map: 100 | MAP_ENTRY_NORMAL,
            seq: 3,
        };
        let newer = FlogEntry {
            lba: 0,
            old_map: 101 | MAP_ENTRY_NORMAL,
            new_map: 101 | MAP_ENTRY_NORMAL,
            seq: 1,
        };
        write_pair(&ns, &info, 1, [older, newer]);

        let arena = Arena::load(&ns, 0, 0, 0, &info, NFREE).unwrap();
        let runtime = arena.flogs[1].lock();
        assert_eq!(runtime.flog, newer);
        assert_eq!(runtime.next, 0);
    }

    #[test]
    fn test_interrupted_update_is_replayed() {
        let (ns, info) = setup();
        let free = info.external_nlba;
        // the write to lba 5 logged its flog entry but never updated the map
        let logged = FlogEntry {
            lba: 5,
            old_map: MapEntry::normal(5).0,
            new_map: free | MAP_ENTRY_NORMAL,
            seq: 2,
        };
        let initial = FlogEntry {
            lba: 0,
            old_map: free | MAP_ENTRY_ZERO,
            new_map: free | MAP_ENTRY_ZERO,
            seq: 1,
        };
        write_pair(&ns, &info, 0, [initial, logged]);

        let arena = Arena::load(&ns, 0, 0, 0, &info, NFREE).unwrap();
        assert_eq!(
            arena.read_map_entry(&ns, 0, 5).unwrap(),
            MapEntry::normal(free)
        );
        assert_eq!(arena.flogs[0].lock().free_block(), 5);
        assert!(!arena.is_error());
    }

    #[test]
    fn test_completed_update_left_alone() {
        let (ns, info) = setup();
        let free = info.external_nlba;
        let logged = FlogEntry {
            lba: 5,
            old_map: MapEntry::normal(5).0,
            new_map: free | MAP_ENTRY_NORMAL,
            seq: 1,
        };
        write_pair(&ns, &info, 0, [logged, FlogEntry::default()]);
        // a later write already moved lba 5 elsewhere
        let later = MapEntry::normal(free + 1);
        ns.write(0, &later.to_bytes(), info.mapoff + 5 * 4).unwrap();

        let arena = Arena::load(&ns, 0, 0, 0, &info, NFREE).unwrap();
        assert_eq!(arena.read_map_entry(&ns, 0, 5).unwrap(), later);
    }

    #[test]
    fn test_equal_sequence_numbers_mark_arena_error() {
        let (ns, info) = setup();
        write_pair(&ns, &info, 3, [FlogEntry::default(), FlogEntry::default()]);

        let arena = Arena::load(&ns, 0, 0, 0, &info, NFREE).unwrap();
        assert!(arena.is_error());

        let mut bytes = vec![0u8; INFO_SIZE];
        ns.read(0, &mut bytes, info.infooff).unwrap();
        let backup = BttInfo::parse_valid(&bytes, &[0; 16]).unwrap();
        assert_ne!(backup.flags & crate::layout::INFO_FLAG_ERROR, 0);
    }

    #[test]
    fn test_out_of_range_lba_fails_load() {
        let (ns, info) = setup();
        let bogus = FlogEntry {
            lba: info.external_nlba,
            old_map: 1,
            new_map: 1,
            seq: 1,
        };
        write_pair(&ns, &info, 0, [bogus, FlogEntry::default()]);

        assert!(matches!(
            Arena::load(&ns, 0, 0, 0, &info, NFREE),
            Err(BttError::InvalidLayout(_))
        ));
    }
}
