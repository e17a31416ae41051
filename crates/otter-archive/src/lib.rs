//! # Otter Archive
//!
//! Relocatable metadata archive dumping.
//!
//! The dumper copies metadata into one contiguous reservation so that the
//! archive can later be mapped at a different base address. Every word that
//! holds a raw pointer is recorded in a side bitmap at the moment it is
//! written; the loader only has to add one delta to the marked slots.
//!
//! ## Design
//!
//! - **ReservedSpace**: owned arena, committed lazily in page-sized steps
//! - **DumpRegion**: bump-allocated segment (`mc`, `rw`, `ro`) of the arena
//! - **ArchivePtrMarker**: pointer bitmap with an explicit lifecycle
//! - **WriteClosure / ReadClosure**: paired word-stream serializers
//! - **DumpSession**: drives one dump pass and produces the [`ArchiveImage`]

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod bitmap;
pub mod closure;
pub mod config;
pub mod error;
pub mod oops;
pub mod ptrmap;
pub mod region;
pub mod session;
pub mod space;

pub use bitmap::BitMap;
pub use closure::{ReadClosure, Serializable, SerializeClosure, WriteClosure};
pub use config::ArchiveConfig;
pub use error::{ArchiveError, ArchiveResult};
pub use oops::{CompressedOops, HeapArchive, NarrowOop, Oop};
pub use ptrmap::ArchivePtrMarker;
pub use region::DumpRegion;
pub use session::{ArchiveImage, DumpSession, RegionKind, RegionLayout};
pub use space::ReservedSpace;

/// Size of a machine word, the unit tracked by the pointer bitmap.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Round `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Check whether `value` is a multiple of `alignment` (a power of two).
#[inline]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Percentage of `part` in `total`, zero when `total` is zero.
#[inline]
pub(crate) fn percent_of(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
