//! On-media layout of a BTT namespace
//!
//! All multi-byte fields are stored little-endian. Conversion happens only
//! in the `to_bytes`/`from_bytes` functions of this module, so everything
//! above it works with host-native values.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Arena 0 (at most 512 GiB)                    │
//! ├──────────────────────────────────────────────┤
//! │ Info block (4 KiB)                           │
//! │ Data area: internal_nlba blocks              │
//! │ Map: external_nlba x 4-byte entries          │
//! │ Flog: nfree pairs at a 64-byte stride        │
//! │ Backup info block (4 KiB)                    │
//! ├──────────────────────────────────────────────┤
//! │ Arena 1 ...                                  │
//! └──────────────────────────────────────────────┘
//! ```

use crate::error::{BttError, Result};

/// Arena info block signature, including two trailing NULs
pub const INFO_SIG: [u8; 16] = *b"BTT_ARENA_INFO\0\0";
pub const INFO_VERSION_MAJOR: u16 = 1;
pub const INFO_VERSION_MINOR: u16 = 1;
pub const UUID_LEN: usize = 16;

/// Size of an arena info block
pub const INFO_SIZE: usize = 4096;

/// Arena flag: the arena's metadata is known to be inconsistent
pub const INFO_FLAG_ERROR: u32 = 0x0000_0001;
pub const INFO_FLAG_ERROR_MASK: u32 = 0x0000_00ff;

/// Alignment of every metadata region
pub const ALIGNMENT: u64 = 4096;

/// Largest arena
pub const MAX_ARENA: u64 = 1 << 39;

/// Smallest namespace (and smallest arena) that can hold a layout
pub const MIN_SIZE: u64 = (1 << 20) * 16;

/// Free blocks per arena for newly created layouts
pub const DEFAULT_NFREE: u32 = 256;

pub const MIN_LBA_SIZE: u32 = 512;
pub const INTERNAL_LBA_ALIGNMENT: u32 = 256;

pub const MAP_ENTRY_SIZE: u64 = 4;
pub const MAP_ENTRY_ERROR: u32 = 0x4000_0000;
pub const MAP_ENTRY_ZERO: u32 = 0x8000_0000;
pub const MAP_ENTRY_NORMAL: u32 = 0xC000_0000;
pub const MAP_ENTRY_LBA_MASK: u32 = 0x3fff_ffff;

/// Map entries sharing one stride of this many bytes share a region lock
pub const MAP_LOCK_ALIGN: u64 = 64;

pub const FLOG_ENTRY_SIZE: u64 = 16;
pub const FLOG_PAIR_ALIGN: u64 = 64;

/// Round `value` up to the next multiple of `align`
pub fn roundup(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Next value in the 2-bit flog sequence 1 -> 2 -> 3 -> 1
pub fn next_seq(seq: u32) -> u32 {
    const NSEQ: [u32; 4] = [0, 2, 3, 1];
    NSEQ[(seq & 3) as usize]
}

/// Bytes occupied by the flog for `nfree` lanes
pub fn flog_size(nfree: u32) -> u64 {
    roundup(
        nfree as u64 * roundup(2 * FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN),
        ALIGNMENT,
    )
}

/// Fletcher-64 over little-endian 32-bit words
///
/// The 8 bytes at `csum_off` are treated as zero, so the same routine both
/// computes and verifies a checksum stored inside the range.
pub fn fletcher64(bytes: &[u8], csum_off: usize) -> u64 {
    let mut lo32: u32 = 0;
    let mut hi32: u32 = 0;
    let mut off = 0;

    while off + 4 <= bytes.len() {
        if off == csum_off || off == csum_off + 4 {
            hi32 = hi32.wrapping_add(lo32);
        } else {
            let word = u32::from_le_bytes([
                bytes[off],
                bytes[off + 1],
                bytes[off + 2],
                bytes[off + 3],
            ]);
            lo32 = lo32.wrapping_add(word);
            hi32 = hi32.wrapping_add(lo32);
        }
        off += 4;
    }

    ((hi32 as u64) << 32) | lo32 as u64
}

/// State selected by the top two bits of a map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// Never written; the block maps to itself
    Initial,
    Error,
    Zero,
    Normal,
}

/// One 32-bit map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapEntry(pub u32);

impl MapEntry {
    /// Normal-state entry pointing at `block`
    pub fn normal(block: u32) -> Self {
        MapEntry((block & MAP_ENTRY_LBA_MASK) | MAP_ENTRY_NORMAL)
    }

    pub fn state(self) -> MapState {
        match self.0 & !MAP_ENTRY_LBA_MASK {
            0 => MapState::Initial,
            MAP_ENTRY_ERROR => MapState::Error,
            MAP_ENTRY_ZERO => MapState::Zero,
            _ => MapState::Normal,
        }
    }

    /// Internal block index
    pub fn block(self) -> u32 {
        self.0 & MAP_ENTRY_LBA_MASK
    }

    pub fn is_zero_or_initial(self) -> bool {
        matches!(self.state(), MapState::Initial | MapState::Zero)
    }

    /// Same block, with `flag` replacing the state bits
    pub fn with_flag(self, flag: u32) -> Self {
        MapEntry(self.block() | flag)
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        MapEntry(u32::from_le_bytes(bytes))
    }
}

/// One half of a flog pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlogEntry {
    /// Pre-map LBA last written through this lane
    pub lba: u32,
    /// Map entry the write replaced; its block is now free
    pub old_map: u32,
    /// Map entry the write installed
    pub new_map: u32,
    /// Sequence number, 0 when this half was never written
    pub seq: u32,
}

impl FlogEntry {
    pub const SIZE: usize = FLOG_ENTRY_SIZE as usize;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.lba.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.old_map.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.new_map.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.seq.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(BttError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for flog entry",
            )));
        }

        Ok(FlogEntry {
            lba: read_u32(bytes, 0),
            old_map: read_u32(bytes, 4),
            new_map: read_u32(bytes, 8),
            seq: read_u32(bytes, 12),
        })
    }
}

/// Arena info block
///
/// Stored at the start of every arena and duplicated at `infooff`. The
/// offsets are relative to the start of the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BttInfo {
    pub sig: [u8; 16],
    pub uuid: [u8; UUID_LEN],
    pub parent_uuid: [u8; UUID_LEN],
    pub flags: u32,
    pub major: u16,
    pub minor: u16,
    pub external_lbasize: u32,
    pub external_nlba: u32,
    pub internal_lbasize: u32,
    pub internal_nlba: u32,
    pub nfree: u32,
    pub infosize: u32,
    pub nextoff: u64,
    pub dataoff: u64,
    pub mapoff: u64,
    pub flogoff: u64,
    pub infooff: u64,
}

impl BttInfo {
    pub const CHECKSUM_OFFSET: usize = INFO_SIZE - 8;

    /// Serialize into a full info block with the checksum filled in
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(INFO_SIZE);

        bytes.extend_from_slice(&self.sig);
        bytes.extend_from_slice(&self.uuid);
        bytes.extend_from_slice(&self.parent_uuid);
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.major.to_le_bytes());
        bytes.extend_from_slice(&self.minor.to_le_bytes());
        bytes.extend_from_slice(&self.external_lbasize.to_le_bytes());
        bytes.extend_from_slice(&self.external_nlba.to_le_bytes());
        bytes.extend_from_slice(&self.internal_lbasize.to_le_bytes());
        bytes.extend_from_slice(&self.internal_nlba.to_le_bytes());
        bytes.extend_from_slice(&self.nfree.to_le_bytes());
        bytes.extend_from_slice(&self.infosize.to_le_bytes());
        bytes.extend_from_slice(&self.nextoff.to_le_bytes());
        bytes.extend_from_slice(&self.dataoff.to_le_bytes());
        bytes.extend_from_slice(&self.mapoff.to_le_bytes());
        bytes.extend_from_slice(&self.flogoff.to_le_bytes());
        bytes.extend_from_slice(&self.infooff.to_le_bytes());

        // Unused space, then the checksum
        bytes.resize(INFO_SIZE, 0);
        let csum = fletcher64(&bytes, Self::CHECKSUM_OFFSET);
        bytes[Self::CHECKSUM_OFFSET..].copy_from_slice(&csum.to_le_bytes());

        bytes
    }

    /// Parse an info block without validating it
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INFO_SIZE {
            return Err(BttError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for info block",
            )));
        }

        let mut sig = [0u8; 16];
        sig.copy_from_slice(&bytes[0..16]);
        let mut uuid = [0u8; UUID_LEN];
        uuid.copy_from_slice(&bytes[16..32]);
        let mut parent_uuid = [0u8; UUID_LEN];
        parent_uuid.copy_from_slice(&bytes[32..48]);

        Ok(BttInfo {
            sig,
            uuid,
            parent_uuid,
            flags: read_u32(bytes, 48),
            major: u16::from_le_bytes([bytes[52], bytes[53]]),
            minor: u16::from_le_bytes([bytes[54], bytes[55]]),
            external_lbasize: read_u32(bytes, 56),
            external_nlba: read_u32(bytes, 60),
            internal_lbasize: read_u32(bytes, 64),
            internal_nlba: read_u32(bytes, 68),
            nfree: read_u32(bytes, 72),
            infosize: read_u32(bytes, 76),
            nextoff: read_u64(bytes, 80),
            dataoff: read_u64(bytes, 88),
            mapoff: read_u64(bytes, 96),
            flogoff: read_u64(bytes, 104),
            infooff: read_u64(bytes, 112),
        })
    }

    /// Parse and validate a raw info block
    ///
    /// Returns `None` when the block is not a valid info block belonging to
    /// `parent_uuid`: wrong signature, foreign parent, bad checksum or a
    /// zero major version.
    pub fn parse_valid(bytes: &[u8], parent_uuid: &[u8; UUID_LEN]) -> Option<Self> {
        let info = Self::from_bytes(bytes).ok()?;

        if info.sig != INFO_SIG {
            tracing::trace!("info block signature invalid");
            return None;
        }
        if &info.parent_uuid != parent_uuid {
            tracing::trace!("info block parent UUID mismatch");
            return None;
        }

        let stored = read_u64(bytes, Self::CHECKSUM_OFFSET);
        if fletcher64(&bytes[..INFO_SIZE], Self::CHECKSUM_OFFSET) != stored {
            tracing::trace!("info block checksum invalid");
            return None;
        }

        if info.major == 0 {
            tracing::trace!("info block major version is 0");
            return None;
        }

        Some(info)
    }
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn read_u64(bytes: &[u8], off: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(word)
}

/// Geometry of one arena, offsets relative to the arena start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaGeometry {
    pub rawsize: u64,
    pub internal_nlba: u32,
    pub external_nlba: u32,
    pub mapsize: u64,
    pub nextoff: u64,
    pub dataoff: u64,
    pub mapoff: u64,
    pub flogoff: u64,
    pub infooff: u64,
}

/// Geometry a new layout would have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub internal_lbasize: u32,
    pub flog_size: u64,
    pub arenas: Vec<ArenaGeometry>,
}

impl Geometry {
    /// Compute the arena geometry for a namespace of `rawsize` bytes
    ///
    /// Full 512 GiB arenas are carved off first; a remainder of at least
    /// [`MIN_SIZE`] becomes one more arena and anything smaller is unused.
    pub fn compute(rawsize: u64, lbasize: u32, nfree: u32) -> Result<Self> {
        if rawsize < MIN_SIZE {
            return Err(BttError::NamespaceTooSmall {
                rawsize,
                min: MIN_SIZE,
            });
        }
        if lbasize == 0 {
            return Err(BttError::InvalidBlockSize(lbasize));
        }

        let internal_lbasize = roundup(
            lbasize.max(MIN_LBA_SIZE) as u64,
            INTERNAL_LBA_ALIGNMENT as u64,
        );
        let internal_lbasize =
            u32::try_from(internal_lbasize).map_err(|_| BttError::InvalidBlockSize(lbasize))?;
        let flog_size = flog_size(nfree);

        let mut arenas = Vec::new();
        let mut remaining = rawsize;

        while remaining >= MIN_SIZE {
            let arena_rawsize = remaining.min(MAX_ARENA);
            remaining -= arena_rawsize;

            let required = 2 * nfree as u64;
            let too_small = || BttError::InsufficientBlocks {
                internal_nlba: 0,
                required,
            };

            let mut datasize = arena_rawsize
                .checked_sub(2 * INFO_SIZE as u64 + flog_size)
                .ok_or_else(too_small)?;

            // allow for map alignment padding
            let internal_nlba = datasize.checked_sub(ALIGNMENT).ok_or_else(too_small)?
                / (internal_lbasize as u64 + MAP_ENTRY_SIZE);

            if internal_nlba < required {
                return Err(BttError::InsufficientBlocks {
                    internal_nlba,
                    required,
                });
            }
            if internal_nlba > MAP_ENTRY_LBA_MASK as u64 {
                return Err(BttError::InvalidLayout(format!(
                    "{} internal blocks exceed the map entry range",
                    internal_nlba
                )));
            }
            let internal_nlba = internal_nlba as u32;
            let external_nlba = internal_nlba - nfree;

            let mapsize = roundup(external_nlba as u64 * MAP_ENTRY_SIZE, ALIGNMENT);
            datasize -= mapsize;
            debug_assert!(datasize / internal_lbasize as u64 >= internal_nlba as u64);

            let nextoff = if remaining >= MIN_SIZE {
                arena_rawsize
            } else {
                0
            };
            let infooff = arena_rawsize - INFO_SIZE as u64;
            let flogoff = infooff - flog_size;
            let mapoff = flogoff - mapsize;
            let dataoff = INFO_SIZE as u64;

            arenas.push(ArenaGeometry {
                rawsize: arena_rawsize,
                internal_nlba,
                external_nlba,
                mapsize,
                nextoff,
                dataoff,
                mapoff,
                flogoff,
                infooff,
            });
        }

        Ok(Geometry {
            internal_lbasize,
            flog_size,
            arenas,
        })
    }

    /// Total external blocks over all arenas
    pub fn nlba(&self) -> u64 {
        self.arenas.iter().map(|a| a.external_nlba as u64).sum()
    }

    pub fn narena(&self) -> usize {
        self.arenas.len()
    }
}
