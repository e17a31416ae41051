//! Dump regions.
//!
//! A region is a bump-allocated segment of the archive reservation. Regions
//! are filled one after another: when a region is packed its end is rounded up
//! to the packing alignment and the next region starts right there, so the
//! regions of one reservation never overlap.
//!
//! ```text
//! reservation: [ mc ......|pad][ rw ........|pad][ ro ...............     )
//!               base   top end  base     top end  base  top               end
//! ```

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, ArchiveResult};
use crate::ptrmap::ArchivePtrMarker;
use crate::space::ReservedSpace;
use crate::{WORD_SIZE, align_up, is_aligned, percent_of};

/// Lifecycle state of a [`DumpRegion`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Not yet bound to a reservation
    Unbound = 0,
    /// Bound and accepting allocations
    Open = 1,
    /// Finalized, read-only
    Packed = 2,
}

/// One named segment of the archive.
///
/// Invariant: `base <= top <= end`, all offsets into the bound
/// [`ReservedSpace`]. Every allocation is zeroed and aligned to
/// `alignment`.
#[derive(Debug, Clone)]
pub struct DumpRegion {
    name: String,
    /// Alignment of every allocated block
    alignment: usize,
    /// Alignment `end` is rounded to on packing
    pack_alignment: usize,
    base: usize,
    top: usize,
    end: usize,
    state: RegionState,
}

impl DumpRegion {
    /// Create an unbound region.
    pub fn new(name: impl Into<String>, config: &ArchiveConfig) -> Self {
        Self {
            name: name.into(),
            alignment: config.object_alignment,
            pack_alignment: config.reserved_space_alignment,
            base: 0,
            top: 0,
            end: 0,
            state: RegionState::Unbound,
        }
    }

    /// Bind this region to the whole of `space`, with nothing used yet.
    pub fn init(&mut self, space: &ReservedSpace) -> ArchiveResult<()> {
        if self.state == RegionState::Packed {
            return Err(ArchiveError::RegionPacked(self.name.clone()));
        }
        if space.reserved() == 0 {
            return Err(ArchiveError::ReservationFailed);
        }
        self.base = 0;
        self.top = 0;
        self.end = space.reserved();
        self.state = RegionState::Open;
        Ok(())
    }

    /// Region name, used in diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First offset of the region.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Current high-water mark.
    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    /// Hard upper bound.
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Allocation alignment.
    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Lifecycle state.
    #[inline]
    pub fn state(&self) -> RegionState {
        self.state
    }

    /// Bytes allocated so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.top - self.base
    }

    /// Bytes available to this region in total.
    #[inline]
    pub fn reserved(&self) -> usize {
        self.end - self.base
    }

    /// Whether `pack` has been called.
    #[inline]
    pub fn is_packed(&self) -> bool {
        self.state == RegionState::Packed
    }

    /// Whether the region is bound and not packed.
    #[inline]
    pub fn is_allocatable(&self) -> bool {
        self.state == RegionState::Open
    }

    /// Whether `offset` lies in the used part of the region.
    #[inline]
    pub fn contains(&self, offset: usize) -> bool {
        (self.base..self.top).contains(&offset)
    }

    /// Move `top` forward to `newtop`, committing memory as needed.
    ///
    /// Fails if the region cannot grow, if `newtop` lies past `end`, or if a
    /// shared reservation would grow past its compressed-offset limit.
    pub fn expand_top_to(&mut self, space: &mut ReservedSpace, newtop: usize) -> ArchiveResult<usize> {
        self.ensure_allocatable()?;
        if newtop < self.top {
            return Err(ArchiveError::ShrinkingTop {
                region: self.name.clone(),
                top: self.top,
                requested: newtop,
            });
        }
        if newtop > self.end {
            let needed = newtop - self.top;
            self.print_out_of_space_msg(space, &self.name, needed);
            return Err(ArchiveError::OutOfSpace {
                region: self.name.clone(),
                needed,
            });
        }

        if let Some(max) = space.max_delta() {
            // Offsets into the shared space are the distance from its base
            let delta = newtop;
            if delta > max {
                tracing::error!(
                    target: "otter::archive",
                    region = %self.name,
                    delta,
                    max,
                    "Out of memory in the archive. Please reduce the number of shared classes."
                );
                return Err(ArchiveError::SharedDeltaOverflow { delta, max });
            }
        }

        space.commit_to(newtop)?;
        self.top = newtop;
        Ok(self.top)
    }

    /// Allocate `num_bytes` of zeroed, aligned memory and return its offset.
    pub fn allocate(&mut self, space: &mut ReservedSpace, num_bytes: usize) -> ArchiveResult<usize> {
        self.ensure_allocatable()?;
        let p = align_up(self.top, self.alignment);
        let newtop = num_bytes
            .checked_next_multiple_of(self.alignment)
            .and_then(|size| p.checked_add(size))
            .ok_or_else(|| {
                self.print_out_of_space_msg(space, &self.name, num_bytes);
                ArchiveError::OutOfSpace {
                    region: self.name.clone(),
                    needed: num_bytes,
                }
            })?;
        self.expand_top_to(space, newtop)?;
        space.fill_zero(p..newtop);
        Ok(p)
    }

    /// Append one word at `top` and return its offset.
    ///
    /// When `marker` is given the slot is recorded as a relocatable pointer.
    pub fn append_word(
        &mut self,
        space: &mut ReservedSpace,
        value: usize,
        marker: Option<&mut ArchivePtrMarker>,
    ) -> ArchiveResult<usize> {
        self.ensure_allocatable()?;
        if !is_aligned(self.top, WORD_SIZE) {
            return Err(ArchiveError::MisalignedSlot(self.top));
        }
        let slot = self.top;
        self.expand_top_to(space, slot + WORD_SIZE)?;
        space.write_word(slot, value)?;
        if let Some(marker) = marker {
            marker.mark_pointer(space, slot)?;
        }
        Ok(slot)
    }

    /// Finalize the region.
    ///
    /// `end` is rounded up from `top` to the packing alignment. The optional
    /// successor takes over the rest of the reservation, starting at the new
    /// `end`.
    pub fn pack(&mut self, space: &ReservedSpace, next: Option<&mut DumpRegion>) -> ArchiveResult<()> {
        self.ensure_allocatable()?;
        if let Some(next) = next.as_deref()
            && next.is_packed()
        {
            return Err(ArchiveError::RegionPacked(next.name.clone()));
        }
        self.end = align_up(self.top, self.pack_alignment);
        debug_assert!(self.end <= space.reserved());
        self.state = RegionState::Packed;

        tracing::debug!(
            target: "otter::archive",
            region = %self.name,
            used = self.used(),
            end = self.end,
            "region packed"
        );

        if let Some(next) = next {
            next.base = self.end;
            next.top = self.end;
            next.end = space.reserved();
            next.state = RegionState::Open;
        }
        Ok(())
    }

    /// Log this region's usage relative to `total_bytes` of archive.
    pub fn print(&self, space: &ReservedSpace, total_bytes: usize) {
        tracing::debug!(
            target: "otter::archive",
            "{:<3} space: {:>9} [ {:>4.1}% of total] out of {:>9} bytes [{:>5.1}% used] at {:#x}",
            self.name,
            self.used(),
            percent_of(self.used(), total_bytes),
            self.reserved(),
            percent_of(self.used(), self.reserved()),
            space.address_of(self.base)
        );
    }

    /// Log this region's capacity while reporting an out-of-space failure.
    /// The shortfall is only printed for the failing region.
    pub fn print_out_of_space_msg(&self, space: &ReservedSpace, failing_region: &str, needed_bytes: usize) {
        tracing::error!(
            target: "otter::archive",
            "[{:<8}] {:#x} - {:#x} capacity ={:>9}, allocated ={:>9}",
            self.name,
            space.address_of(self.base),
            space.address_of(self.top),
            self.reserved(),
            self.used()
        );
        if self.name == failing_region {
            tracing::error!(target: "otter::archive", " required = {}", needed_bytes);
        }
    }

    fn ensure_allocatable(&self) -> ArchiveResult<()> {
        match self.state {
            RegionState::Open => Ok(()),
            RegionState::Unbound => Err(ArchiveError::RegionNotInitialized(self.name.clone())),
            RegionState::Packed => Err(ArchiveError::RegionPacked(self.name.clone())),
        }
    }
}

/// Log the state of every region after `failing_region` ran out of space.
pub fn report_out_of_space<'a>(
    space: &ReservedSpace,
    regions: impl IntoIterator<Item = &'a DumpRegion>,
    failing_region: &str,
    needed_bytes: usize,
) {
    tracing::error!(
        target: "otter::archive",
        region = failing_region,
        needed_bytes,
        "Unable to allocate from '{}' region",
        failing_region
    );
    for region in regions {
        region.print_out_of_space_msg(space, failing_region, needed_bytes);
    }
}
