//! Heap object references.
//!
//! Archived metadata may point at archived heap objects. Those references are
//! stored as compressed (narrow) values relative to the heap base instead of
//! absolute addresses, so they are not relocated through the pointer bitmap;
//! the loader decodes them through a [`HeapArchive`].

use std::num::NonZeroUsize;

use crate::error::{ArchiveError, ArchiveResult};

/// A non-null reference to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oop(NonZeroUsize);

impl Oop {
    /// Wrap an address; `None` for null.
    #[inline]
    pub fn new(address: usize) -> Option<Self> {
        NonZeroUsize::new(address).map(Self)
    }

    /// The object's address.
    #[inline]
    pub fn address(self) -> usize {
        self.0.get()
    }
}

/// A compressed heap reference. Zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NarrowOop(u32);

impl NarrowOop {
    /// The null reference.
    pub const NULL: NarrowOop = NarrowOop(0);

    /// Wrap a raw narrow value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Truncate an archive word to a narrow reference.
    #[inline]
    pub const fn from_word(word: usize) -> Self {
        Self(word as u32)
    }

    /// The raw narrow value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check for null.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Heap archiving capability and reference codec.
///
/// Supplied by the embedding runtime. The dumper only ever encodes non-null
/// references, and the reader only decodes when the archived heap region is
/// actually mapped.
pub trait HeapArchive {
    /// Whether heap objects may be archived in this run.
    fn is_heap_object_archiving_allowed(&self) -> bool;

    /// Whether the open archive heap region was mapped at load time.
    fn open_archive_heap_region_mapped(&self) -> bool;

    /// Compress a non-null reference. Fails if the object has no narrow form.
    fn encode_not_null(&self, obj: Oop) -> ArchiveResult<NarrowOop>;

    /// Expand a non-null narrow reference read from the archive.
    fn decode_from_archive(&self, narrow: NarrowOop) -> ArchiveResult<Oop>;
}

/// Base-plus-shift reference codec.
///
/// `narrow = (address - base) >> shift`, and back. With a shift of 3 a 32-bit
/// narrow value covers 32GB of heap.
#[derive(Debug, Clone)]
pub struct CompressedOops {
    /// Heap base; never itself a valid object address
    pub base: usize,
    /// Object alignment shift
    pub shift: u32,
    /// Whether heap objects may be archived
    pub archiving_allowed: bool,
    /// Whether the archived heap region is mapped
    pub region_mapped: bool,
}

impl CompressedOops {
    /// Codec with heap archiving enabled and the heap region mapped.
    pub fn new(base: usize, shift: u32) -> Self {
        Self {
            base,
            shift,
            archiving_allowed: true,
            region_mapped: true,
        }
    }

    /// Codec for runs where heap archiving is turned off entirely.
    pub fn disabled() -> Self {
        Self {
            base: 0,
            shift: 0,
            archiving_allowed: false,
            region_mapped: false,
        }
    }

    /// Set whether the archived heap region is mapped.
    pub fn with_region_mapped(mut self, mapped: bool) -> Self {
        self.region_mapped = mapped;
        self
    }
}

impl HeapArchive for CompressedOops {
    fn is_heap_object_archiving_allowed(&self) -> bool {
        self.archiving_allowed
    }

    fn open_archive_heap_region_mapped(&self) -> bool {
        self.region_mapped
    }

    fn encode_not_null(&self, obj: Oop) -> ArchiveResult<NarrowOop> {
        // Must lie above the base, be aligned to the shift and fit in 32 bits
        obj.address()
            .checked_sub(self.base)
            .filter(|&delta| delta != 0)
            .and_then(|delta| {
                delta
                    .checked_shr(self.shift)
                    .filter(|&narrow| narrow << self.shift == delta)
            })
            .and_then(|narrow| u32::try_from(narrow).ok())
            .map(NarrowOop)
            .ok_or(ArchiveError::HeapRefOutOfRange(obj.address()))
    }

    fn decode_from_archive(&self, narrow: NarrowOop) -> ArchiveResult<Oop> {
        if narrow.is_null() {
            return Err(ArchiveError::BadNarrowOop(narrow.0));
        }
        1usize
            .checked_shl(self.shift)
            .and_then(|scale| (narrow.0 as usize).checked_mul(scale))
            .and_then(|offset| self.base.checked_add(offset))
            .and_then(Oop::new)
            .ok_or(ArchiveError::BadNarrowOop(narrow.0))
    }
}
