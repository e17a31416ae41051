//! Archive errors

use thiserror::Error;

/// Errors that can occur while dumping or reading an archive.
///
/// Fatal errors (see [`ArchiveError::is_fatal`]) mean the archive cannot be
/// produced under the current limits and the dump must be abandoned. The rest
/// are contract violations between the writer and reader walkers, or a
/// corrupted archive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    /// The archive configuration is unusable
    #[error("Invalid archive configuration: {0}")]
    InvalidConfig(String),

    /// The backing store of a region could not be initialized
    #[error("Unable to allocate memory for shared space")]
    ReservationFailed,

    /// Committing more of the reservation failed
    #[error("Failed to commit {bytes} bytes of the archive reservation")]
    CommitFailed {
        /// Total committed size that was requested
        bytes: usize,
    },

    /// A region ran past its end
    #[error("Out of space in region {region}: {needed} more bytes required")]
    OutOfSpace {
        /// Name of the failing region
        region: String,
        /// Bytes requested beyond the current top
        needed: usize,
    },

    /// The archive grew beyond what a compressed offset can express
    #[error(
        "Out of memory in the archive ({delta} bytes past the base exceeds {max}). Please reduce the number of shared classes."
    )]
    SharedDeltaOverflow {
        /// Distance from the archive base to the requested top
        delta: usize,
        /// Largest representable distance
        max: usize,
    },

    /// The pointer marker was initialized twice
    #[error("Pointer marker may only be initialized once")]
    AlreadyInitialized,

    /// The pointer marker was used before `initialize`
    #[error("Pointer marker is not initialized")]
    MarkerNotInitialized,

    /// The pointer marker was used after compaction
    #[error("Pointer marker is already compacted")]
    MarkerFinalized,

    /// Pointer slots must be word aligned
    #[error("Pointer slot at offset {0:#x} is not word aligned")]
    MisalignedSlot(usize),

    /// A slot lies outside the tracked window
    #[error("Slot at offset {0:#x} is outside the tracked range")]
    SlotOutOfRange(usize),

    /// A stored pointer targets the very bottom of the archive
    #[error("Slot at offset {0:#x} points to the bottom of the archive")]
    PointsToArchiveBase(usize),

    /// Clearing a slot that was never marked
    #[error("Slot at offset {0:#x} was never marked")]
    NotMarked(usize),

    /// A marked pointer escapes the relocatable range
    #[error("Slot at offset {offset:#x} points outside the relocatable range: {value:#x}")]
    PointerOutOfRange {
        /// Offset of the slot
        offset: usize,
        /// Pointer value found in the slot
        value: usize,
    },

    /// The region is packed and can no longer change
    #[error("Region {0} is already packed")]
    RegionPacked(String),

    /// The region has no backing reservation yet
    #[error("Region {0} is not initialized")]
    RegionNotInitialized(String),

    /// A top was moved backwards
    #[error("Region {region} must not shrink (top {top:#x}, requested {requested:#x})")]
    ShrinkingTop {
        /// Name of the region
        region: String,
        /// Current top
        top: usize,
        /// Requested top
        requested: usize,
    },

    /// Heap objects were written or read while heap archiving is disabled
    #[error("Archiving heap objects is not allowed")]
    HeapArchivingNotAllowed,

    /// A heap object has no compressed form under the current codec
    #[error("Heap object at {0:#x} cannot be encoded as a narrow reference")]
    HeapRefOutOfRange(usize),

    /// A narrow reference read from the archive does not decode to an address
    #[error("Narrow reference {0:#x} does not decode to a heap address")]
    BadNarrowOop(u32),

    /// A structural tag did not match what the reader expected
    #[error("Archive tag mismatch: expected {expected}, found {found}")]
    TagMismatch {
        /// Tag the reader expected
        expected: i32,
        /// Tag found in the archive
        found: i32,
    },

    /// A pointer destination was already initialized before reading
    #[error("Initializing a previously initialized pointer")]
    SlotAlreadyInitialized,

    /// A tag value was found where a pointer was expected
    #[error("Hit tag {0} while initializing pointers")]
    HitTag(isize),

    /// A region size is not representable as a tag
    #[error("Bad region size: {0}")]
    BadSize(usize),

    /// The reader ran past the end of the mapped archive
    #[error("Unexpected end of archive at offset {0:#x}")]
    UnexpectedEnd(usize),
}

impl ArchiveError {
    /// Whether this error aborts the whole dump rather than signalling a
    /// walker mismatch or a corrupted archive.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::ReservationFailed
                | Self::CommitFailed { .. }
                | Self::OutOfSpace { .. }
                | Self::SharedDeltaOverflow { .. }
                | Self::AlreadyInitialized
                | Self::PointerOutOfRange { .. }
        )
    }
}

/// Result type for archive operations
pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;
