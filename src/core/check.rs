//! Consistency checking
//!
//! Every internal block of an arena must be referenced exactly once, either
//! by a map entry or as the free block of a flog pair. The map is streamed
//! through [`NamespaceIo::map`] in bounded chunks, so memory use is one bit
//! per internal block plus one chunk.

use crate::arena::Arena;
use crate::error::{BttError, Result};
use crate::layout::{MapEntry, MapState, MAP_ENTRY_SIZE};
use crate::namespace::{NamespaceIo, DEFAULT_MAP_CHUNK};
use tracing::{debug, trace, warn};

/// Findings for one arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaCheck {
    pub arena: usize,
    /// Internal blocks referenced more than once, in discovery order
    pub duplicates: Vec<u32>,
    /// Number of internal blocks nothing references
    pub unreferenced: u32,
    /// The arena carries its error flag
    pub error_flagged: bool,
}

impl ArenaCheck {
    pub fn is_consistent(&self) -> bool {
        self.duplicates.is_empty() && self.unreferenced == 0 && !self.error_flagged
    }
}

/// Result of [`Btt::check`](crate::Btt::check)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub arenas: Vec<ArenaCheck>,
}

impl CheckReport {
    /// True when every arena is consistent; a table without a layout has
    /// no arenas and is consistent
    pub fn is_consistent(&self) -> bool {
        self.arenas.iter().all(ArenaCheck::is_consistent)
    }
}

/// One bit per internal block
struct Bitmap {
    /// Bitmap words (each word = 64 bits = 64 blocks)
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    fn new(len: usize) -> Result<Self> {
        let num_words = len.div_ceil(64);
        let mut words = Vec::new();
        words
            .try_reserve_exact(num_words)
            .map_err(|e| BttError::Allocation(format!("bitmap of {} bits: {}", len, e)))?;
        words.resize(num_words, 0);
        Ok(Bitmap { words, len })
    }

    /// Set `bit`, returning whether it was already set
    fn test_and_set(&mut self, bit: u32) -> bool {
        let word_idx = bit as usize / 64;
        let mask = 1u64 << (bit % 64);
        let was_set = self.words[word_idx] & mask != 0;
        self.words[word_idx] |= mask;
        was_set
    }

    fn count_clear(&self) -> u32 {
        let set: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        self.len as u32 - set
    }
}

/// Check one arena
///
/// Fails only when the arena cannot be checked at all: a namespace error,
/// or a map or flog entry pointing past the internal blocks.
pub(crate) fn check_arena<N: NamespaceIo + ?Sized>(
    ns: &N,
    arena: &mut Arena,
) -> Result<ArenaCheck> {
    debug!(
        "Checking arena {}: {} external, {} internal blocks",
        arena.index, arena.external_nlba, arena.internal_nlba
    );

    let internal_nlba = arena.internal_nlba;
    let mut seen = Bitmap::new(internal_nlba as usize)?;
    let mut duplicates = Vec::new();

    let mut premap_lba = 0u32;
    while premap_lba < arena.external_nlba {
        let remaining = (arena.external_nlba - premap_lba) as usize * MAP_ENTRY_SIZE as usize;
        let offset = arena.mapoff + premap_lba as u64 * MAP_ENTRY_SIZE;
        let region = ns.map(0, remaining.min(DEFAULT_MAP_CHUNK), offset)?;
        debug_assert_eq!(region.offset(), offset);

        let nentries = region.len() / MAP_ENTRY_SIZE as usize;
        if nentries == 0 {
            return Err(BttError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "namespace returned an empty map view",
            )));
        }

        for bytes in region[..nentries * MAP_ENTRY_SIZE as usize].chunks_exact(4) {
            let entry = MapEntry::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

            // never-written entries map to themselves
            let block = if entry.state() == MapState::Initial {
                premap_lba
            } else {
                entry.block()
            };

            if block >= internal_nlba {
                return Err(BttError::InvalidLayout(format!(
                    "arena {} map[{}]: entry {} out of bounds (internal_nlba {})",
                    arena.index, premap_lba, block, internal_nlba
                )));
            }

            if seen.test_and_set(block) {
                warn!(
                    "arena {} map[{}]: duplicate entry {}",
                    arena.index, premap_lba, block
                );
                duplicates.push(block);
            } else if entry.state() != MapState::Initial {
                trace!("map[{}]: {} {:?}", premap_lba, block, entry.state());
            }

            premap_lba += 1;
        }
    }

    // the cached flog is current, no need to read it back
    for (i, flog) in arena.flogs.iter_mut().enumerate() {
        let block = flog.get_mut().free_block();
        if block >= internal_nlba {
            return Err(BttError::InvalidLayout(format!(
                "arena {} flog[{}]: free block {} out of bounds (internal_nlba {})",
                arena.index, i, block, internal_nlba
            )));
        }

        if seen.test_and_set(block) {
            warn!(
                "arena {} flog[{}]: duplicate entry {}",
                arena.index, i, block
            );
            duplicates.push(block);
        }
    }

    let unreferenced = seen.count_clear();
    if unreferenced > 0 {
        warn!(
            "arena {}: {} unreferenced internal blocks",
            arena.index, unreferenced
        );
    }

    let error_flagged = arena.is_error();
    if error_flagged {
        warn!(
            "arena {}: error flag set ({:#x})",
            arena.index,
            arena.flags()
        );
    }

    Ok(ArenaCheck {
        arena: arena.index,
        duplicates,
        unreferenced,
        error_flagged,
    })
}
