use thiserror::Error;

/// Broad classification of a [`BttError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad block number, lane, or a geometry that cannot hold a layout
    InvalidArgument,
    /// Namespace failure, a block flagged as error, or an arena in error state
    Io,
    /// Runtime state could not be allocated
    Allocation,
    /// Configuration could not be parsed or validated
    Config,
}

#[derive(Error, Debug)]
pub enum BttError {
    #[error("LBA out of range: {lba} (nlba {nlba})")]
    LbaOutOfRange { lba: u64, nlba: u64 },

    #[error("Invalid lane {lane} (nlane {nlane})")]
    InvalidLane { lane: usize, nlane: usize },

    #[error("Namespace too small: {rawsize} bytes (minimum {min})")]
    NamespaceTooSmall { rawsize: u64, min: u64 },

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u32),

    #[error("Number of internal blocks {internal_nlba} is below the required {required}")]
    InsufficientBlocks { internal_nlba: u64, required: u64 },

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Invalid buffer length: {actual} (block size {expected})")]
    InvalidBufferLength { expected: usize, actual: usize },

    #[error("Block {lba} is in error state")]
    BlockError { lba: u64 },

    #[error("Arena {arena} is in error state (flags {flags:#x})")]
    ArenaError { arena: usize, flags: u32 },

    #[error("Map update failed for block {lba}, arena {arena} marked in error")]
    MapUpdateFailed {
        lba: u64,
        arena: usize,
        #[source]
        source: Box<BttError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl BttError {
    /// Map this error onto the coarse error kinds callers dispatch on
    pub fn kind(&self) -> ErrorKind {
        match self {
            BttError::LbaOutOfRange { .. }
            | BttError::InvalidLane { .. }
            | BttError::NamespaceTooSmall { .. }
            | BttError::InvalidBlockSize(_)
            | BttError::InsufficientBlocks { .. }
            | BttError::InvalidLayout(_)
            | BttError::InvalidBufferLength { .. } => ErrorKind::InvalidArgument,
            BttError::BlockError { .. }
            | BttError::ArenaError { .. }
            | BttError::MapUpdateFailed { .. }
            | BttError::Io(_) => ErrorKind::Io,
            BttError::Allocation(_) => ErrorKind::Allocation,
            BttError::Config(_) | BttError::ConfigParse(_) => ErrorKind::Config,
        }
    }
}

pub type Result<T> = std::result::Result<T, BttError>;
