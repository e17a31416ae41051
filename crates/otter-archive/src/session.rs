//! Dump session.
//!
//! Owns everything one dump pass mutates: the shared reservation, the
//! pointer marker and the `mc`, `rw` and `ro` regions. Regions are filled in
//! that order; packing the current region opens the next one right after it.
//! `finish` packs whatever is still open, compacts the pointer bitmap and
//! hands back the archive image.

use std::ops::Range;

use crate::bitmap::BitMap;
use crate::closure::{ReadClosure, WriteClosure};
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, ArchiveResult};
use crate::oops::HeapArchive;
use crate::ptrmap::ArchivePtrMarker;
use crate::region::{DumpRegion, RegionState, report_out_of_space};
use crate::space::ReservedSpace;
use crate::{WORD_SIZE, percent_of};

/// Archive regions, in fill order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Miscellaneous code: trampolines and vtables
    Mc = 0,
    /// Read-write metadata
    Rw = 1,
    /// Read-only metadata
    Ro = 2,
}

impl RegionKind {
    /// All regions in fill order.
    pub const ALL: [RegionKind; 3] = [RegionKind::Mc, RegionKind::Rw, RegionKind::Ro];

    /// Diagnostic name.
    pub fn name(self) -> &'static str {
        match self {
            RegionKind::Mc => "mc",
            RegionKind::Rw => "rw",
            RegionKind::Ro => "ro",
        }
    }

    /// The region filled after this one.
    pub fn next(self) -> Option<RegionKind> {
        match self {
            RegionKind::Mc => Some(RegionKind::Rw),
            RegionKind::Rw => Some(RegionKind::Ro),
            RegionKind::Ro => None,
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// One dump pass over a shared reservation.
pub struct DumpSession {
    config: ArchiveConfig,
    space: ReservedSpace,
    marker: ArchivePtrMarker,
    regions: [DumpRegion; 3],
    current: RegionKind,
}

impl DumpSession {
    /// Reserve the archive space and open the `mc` region.
    pub fn new(config: ArchiveConfig) -> ArchiveResult<Self> {
        let space = ReservedSpace::shared(&config)?;
        let mut marker = ArchivePtrMarker::new();
        marker.initialize(0, space.reserved(), config.estimated_archive_size)?;

        let mut regions = RegionKind::ALL.map(|kind| DumpRegion::new(kind.name(), &config));
        regions[RegionKind::Mc.index()].init(&space)?;

        tracing::debug!(
            target: "otter::archive",
            base = format_args!("{:#x}", space.base_address()),
            reserved = space.reserved(),
            "dump session started"
        );

        Ok(Self {
            config,
            space,
            marker,
            regions,
            current: RegionKind::Mc,
        })
    }

    /// Session configuration.
    #[inline]
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// The shared reservation.
    #[inline]
    pub fn space(&self) -> &ReservedSpace {
        &self.space
    }

    /// The pointer marker.
    #[inline]
    pub fn marker(&self) -> &ArchivePtrMarker {
        &self.marker
    }

    /// The region currently being filled.
    #[inline]
    pub fn current(&self) -> RegionKind {
        self.current
    }

    /// Look up a region.
    #[inline]
    pub fn region(&self, kind: RegionKind) -> &DumpRegion {
        &self.regions[kind.index()]
    }

    /// Allocate zeroed memory from the current region.
    pub fn allocate(&mut self, num_bytes: usize) -> ArchiveResult<usize> {
        let idx = self.current.index();
        self.regions[idx]
            .allocate(&mut self.space, num_bytes)
            .inspect_err(|err| self.report_out_of_space(err))
    }

    /// Store `value` at `slot` and mark it as a pointer. Used to fill in
    /// pointer fields of blocks obtained from [`DumpSession::allocate`].
    pub fn set_pointer(&mut self, slot: usize, value: usize) -> ArchiveResult<()> {
        self.marker.set_and_mark_pointer(&mut self.space, slot, value)
    }

    /// Store a scalar word at `slot` without marking it.
    pub fn set_word(&mut self, slot: usize, value: usize) -> ArchiveResult<()> {
        self.space.write_word(slot, value)
    }

    /// Null out a previously marked pointer slot and unmark it.
    pub fn clear_pointer(&mut self, slot: usize) -> ArchiveResult<()> {
        self.marker.clear_pointer(slot)?;
        self.space.write_word(slot, 0)
    }

    /// Dump-time address of `offset`.
    #[inline]
    pub fn address_of(&self, offset: usize) -> usize {
        self.space.address_of(offset)
    }

    /// A writer appending to the current region.
    pub fn writer<'a>(&'a mut self, heap: &'a dyn HeapArchive) -> WriteClosure<'a> {
        let idx = self.current.index();
        WriteClosure::new(&mut self.regions[idx], &mut self.space, &mut self.marker, heap)
    }

    /// Pack the current region and open the next one after it. Packing the
    /// last region leaves nothing open.
    pub fn pack_current(&mut self) -> ArchiveResult<()> {
        let idx = self.current.index();
        match self.current.next() {
            Some(next) => {
                let (head, tail) = self.regions.split_at_mut(idx + 1);
                head[idx].pack(&self.space, Some(&mut tail[0]))?;
                self.current = next;
            }
            None => self.regions[idx].pack(&self.space, None)?,
        }
        Ok(())
    }

    /// Log every region's usage.
    pub fn print_statistics(&self) {
        let total: usize = self.regions.iter().map(|r| r.used()).sum();
        for region in self.bound_regions() {
            region.print(&self.space, total);
        }
        tracing::debug!(
            target: "otter::archive",
            "total    : {:>9} [100.0% of total] out of {:>9} bytes [{:>5.1}% used]",
            total,
            self.space.reserved(),
            percent_of(total, self.space.reserved())
        );
    }

    /// Log the other regions after an out-of-space failure. The failing
    /// region has already reported itself.
    pub fn report_out_of_space(&self, err: &ArchiveError) {
        if let ArchiveError::OutOfSpace { region, needed } = err {
            report_out_of_space(
                &self.space,
                self.bound_regions().filter(|r| r.name() != region.as_str()),
                region,
                *needed,
            );
        }
    }

    /// Pack the open region, compact the pointer bitmap and produce the
    /// archive image.
    ///
    /// Marked pointers must target `relocatable`, which defaults to the whole
    /// archive.
    pub fn finish(mut self, relocatable: Option<Range<usize>>) -> ArchiveResult<ArchiveImage> {
        let idx = self.current.index();
        if self.regions[idx].is_allocatable() {
            self.regions[idx].pack(&self.space, None)?;
        }
        let end = self.regions[idx].end();

        self.print_statistics();

        let relocatable =
            relocatable.unwrap_or_else(|| self.space.base_address()..self.space.address_of(end));
        self.marker
            .compact(&self.space, relocatable.start, relocatable.end)?;

        let committed = end.min(self.space.committed());
        let mut bytes = self.space.bytes()[..committed].to_vec();
        bytes.resize(end, 0);

        let regions = self
            .bound_regions()
            .map(|r| RegionLayout {
                name: r.name().to_string(),
                base: r.base(),
                used: r.used(),
                end: r.end(),
            })
            .collect();

        tracing::debug!(
            target: "otter::archive",
            size = end,
            pointers = self.marker.marked_count(),
            "archive dump complete"
        );

        Ok(ArchiveImage {
            base_address: self.space.base_address(),
            bytes,
            regions,
            ptrmap: self.marker.bitmap().clone(),
        })
    }

    fn bound_regions(&self) -> impl Iterator<Item = &DumpRegion> {
        self.regions
            .iter()
            .filter(|r| r.state() != RegionState::Unbound)
    }
}

/// Placement of one region in the finished archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    /// Region name
    pub name: String,
    /// Offset of the first byte
    pub base: usize,
    /// Bytes in use
    pub used: usize,
    /// Packed end offset
    pub end: usize,
}

/// A finished archive: bytes laid out for `base_address` plus the bitmap of
/// word slots the loader has to relocate.
#[derive(Debug, Clone)]
pub struct ArchiveImage {
    base_address: usize,
    bytes: Vec<u8>,
    regions: Vec<RegionLayout>,
    ptrmap: BitMap,
}

impl ArchiveImage {
    /// Address the archive was laid out for.
    #[inline]
    pub fn base_address(&self) -> usize {
        self.base_address
    }

    /// Archive contents.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Archive size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Region placement, in fill order.
    #[inline]
    pub fn regions(&self) -> &[RegionLayout] {
        &self.regions
    }

    /// Look up a region by kind.
    pub fn region(&self, kind: RegionKind) -> Option<&RegionLayout> {
        self.regions.iter().find(|r| r.name == kind.name())
    }

    /// Relocation bitmap, one bit per word from the archive base.
    #[inline]
    pub fn ptrmap(&self) -> &BitMap {
        &self.ptrmap
    }

    /// Offsets of all words to relocate.
    pub fn pointer_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.ptrmap.iter_ones().map(|idx| idx * WORD_SIZE)
    }

    /// A reader over the word stream starting at a region's base.
    pub fn reader<'a>(
        &'a self,
        kind: RegionKind,
        heap: &'a dyn HeapArchive,
    ) -> Option<ReadClosure<'a>> {
        self.region(kind)
            .map(|r| ReadClosure::new(&self.bytes, r.base, heap))
    }
}
