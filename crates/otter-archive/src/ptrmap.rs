//! Archive pointer bitmap.
//!
//! Records which word slots of the archive hold a pointer that the loader has
//! to relocate. A slot is recorded when the dumper writes it, because a word's
//! bit pattern alone cannot tell a pointer from a scalar that happens to look
//! like one.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized --initialize--> Active --compact--> Compacted
//! ```
//!
//! `mark_pointer` and `clear_pointer` are only accepted while `Active`.
//! `compact` prunes marks whose slot was nulled afterwards, checks every
//! surviving pointer against the relocatable range, and trims the bitmap to
//! the last surviving bit.

use crate::bitmap::BitMap;
use crate::error::{ArchiveError, ArchiveResult};
use crate::space::ReservedSpace;
use crate::{WORD_SIZE, is_aligned};

/// Lifecycle state of an [`ArchivePtrMarker`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// `initialize` has not been called
    Uninitialized = 0,
    /// Accepting marks and clears
    Active = 1,
    /// Bitmap is final
    Compacted = 2,
}

/// Pointer bitmap over a window `[ptr_base, ptr_end)` of a [`ReservedSpace`].
///
/// Bit `i` covers the word at offset `ptr_base + i * WORD_SIZE`.
#[derive(Debug)]
pub struct ArchivePtrMarker {
    state: MarkerState,
    ptrmap: BitMap,
    /// First tracked offset (word aligned)
    ptr_base: usize,
    /// One past the last tracked offset
    ptr_end: usize,
}

impl Default for ArchivePtrMarker {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchivePtrMarker {
    /// Create an uninitialized marker.
    pub fn new() -> Self {
        Self {
            state: MarkerState::Uninitialized,
            ptrmap: BitMap::new(),
            ptr_base: 0,
            ptr_end: 0,
        }
    }

    /// Start tracking `[ptr_base, ptr_end)`.
    ///
    /// The bitmap is sized for `estimated_archive_size` bytes of archive, one
    /// bit per word. It grows on demand, so the estimate only matters for
    /// performance.
    pub fn initialize(
        &mut self,
        ptr_base: usize,
        ptr_end: usize,
        estimated_archive_size: usize,
    ) -> ArchiveResult<()> {
        if self.state != MarkerState::Uninitialized {
            return Err(ArchiveError::AlreadyInitialized);
        }
        if !is_aligned(ptr_base, WORD_SIZE) {
            return Err(ArchiveError::MisalignedSlot(ptr_base));
        }
        if ptr_end < ptr_base {
            return Err(ArchiveError::SlotOutOfRange(ptr_end));
        }

        self.ptr_base = ptr_base;
        self.ptr_end = ptr_end;
        self.ptrmap = BitMap::with_size(estimated_archive_size / WORD_SIZE);
        self.state = MarkerState::Active;

        tracing::debug!(
            target: "otter::archive",
            ptr_base,
            ptr_end,
            initial_bits = self.ptrmap.size(),
            "pointer marker initialized"
        );
        Ok(())
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> MarkerState {
        self.state
    }

    /// Whether `compact` has completed.
    #[inline]
    pub fn is_compacted(&self) -> bool {
        self.state == MarkerState::Compacted
    }

    /// The pointer bitmap. Only final once compacted.
    #[inline]
    pub fn bitmap(&self) -> &BitMap {
        &self.ptrmap
    }

    /// Tracked window as offsets.
    #[inline]
    pub fn window(&self) -> std::ops::Range<usize> {
        self.ptr_base..self.ptr_end
    }

    /// Number of marked slots.
    pub fn marked_count(&self) -> usize {
        self.ptrmap.count_ones()
    }

    /// Whether the slot at `offset` is currently marked.
    pub fn is_marked(&self, offset: usize) -> bool {
        self.window().contains(&offset)
            && is_aligned(offset - self.ptr_base, WORD_SIZE)
            && self.ptrmap.at(self.index_of(offset))
    }

    /// Record that the slot at `slot` holds a pointer.
    ///
    /// Slots outside the tracked window are ignored, as are null values: a
    /// null pointer is reproduced as null on load without relocation. A slot
    /// holding the address of the window's base is rejected, since the loader
    /// could not tell it apart from null when the archive is mapped at 0.
    pub fn mark_pointer(&mut self, space: &ReservedSpace, slot: usize) -> ArchiveResult<()> {
        self.ensure_active()?;
        if !self.window().contains(&slot) {
            return Ok(());
        }
        let value = space.read_word(slot)?;
        self.check_value(space, slot, value)?;
        if value != 0 {
            let idx = self.index_of(slot);
            if self.ptrmap.size() <= idx {
                self.ptrmap.resize((idx + 1) * 2);
            }
            self.ptrmap.set_bit(idx);
        }
        Ok(())
    }

    /// Store `value` at `slot` and mark it. Nothing is written when the
    /// mark would be rejected.
    pub fn set_and_mark_pointer(
        &mut self,
        space: &mut ReservedSpace,
        slot: usize,
        value: usize,
    ) -> ArchiveResult<()> {
        self.ensure_active()?;
        if self.window().contains(&slot) {
            self.check_value(space, slot, value)?;
        }
        space.write_word(slot, value)?;
        self.mark_pointer(space, slot)
    }

    /// Forget a previously marked slot.
    pub fn clear_pointer(&mut self, slot: usize) -> ArchiveResult<()> {
        self.ensure_active()?;
        if !self.window().contains(&slot) {
            return Err(ArchiveError::SlotOutOfRange(slot));
        }
        if !is_aligned(slot, WORD_SIZE) {
            return Err(ArchiveError::MisalignedSlot(slot));
        }

        let idx = self.index_of(slot);
        if !self.ptrmap.at(idx) {
            return Err(ArchiveError::NotMarked(slot));
        }
        self.ptrmap.clear_bit(idx);
        Ok(())
    }

    /// Finalize the bitmap.
    ///
    /// Every marked slot is re-read from `space`. Slots that have since
    /// become null are unmarked. Any other value must be an address in
    /// `[relocatable_base, relocatable_end)`; anything else means a foreign
    /// pointer leaked into the archive. The bitmap is then trimmed to end at
    /// the last surviving bit, or emptied when none survive.
    pub fn compact(
        &mut self,
        space: &ReservedSpace,
        relocatable_base: usize,
        relocatable_end: usize,
    ) -> ArchiveResult<()> {
        self.ensure_active()?;

        let marked: Vec<usize> = self.ptrmap.iter_ones().collect();
        let mut max_non_null: Option<usize> = None;
        let mut pruned = 0usize;

        for idx in marked {
            let slot = self.ptr_base + idx * WORD_SIZE;
            let value = space.read_word(slot)?;
            if value == 0 {
                self.ptrmap.clear_bit(idx);
                pruned += 1;
                tracing::trace!(target: "otter::archive", slot, idx, "clearing pointer -> null");
                continue;
            }
            if value == space.address_of(self.ptr_base) {
                return Err(ArchiveError::PointsToArchiveBase(slot));
            }
            if !(relocatable_base..relocatable_end).contains(&value) {
                return Err(ArchiveError::PointerOutOfRange {
                    offset: slot,
                    value,
                });
            }
            max_non_null = Some(idx);
        }

        let size = max_non_null.map_or(0, |idx| idx + 1);
        self.ptrmap.resize(size);
        self.state = MarkerState::Compacted;

        tracing::debug!(
            target: "otter::archive",
            bits = size,
            pointers = self.ptrmap.count_ones(),
            pruned,
            "pointer bitmap compacted"
        );
        Ok(())
    }

    /// Check a value about to be marked at an in-window `slot`.
    fn check_value(&self, space: &ReservedSpace, slot: usize, value: usize) -> ArchiveResult<()> {
        if !is_aligned(slot, WORD_SIZE) {
            return Err(ArchiveError::MisalignedSlot(slot));
        }
        if value == space.address_of(self.ptr_base) {
            return Err(ArchiveError::PointsToArchiveBase(slot));
        }
        Ok(())
    }

    #[inline]
    fn index_of(&self, slot: usize) -> usize {
        debug_assert!(slot >= self.ptr_base);
        (slot - self.ptr_base) / WORD_SIZE
    }

    fn ensure_active(&self) -> ArchiveResult<()> {
        match self.state {
            MarkerState::Active => Ok(()),
            MarkerState::Uninitialized => Err(ArchiveError::MarkerNotInitialized),
            MarkerState::Compacted => Err(ArchiveError::MarkerFinalized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveConfig;

    fn setup() -> (ReservedSpace, ArchivePtrMarker) {
        let mut space = ReservedSpace::new(&ArchiveConfig::small()).unwrap();
        space.commit_to(4096).unwrap();
        let mut marker = ArchivePtrMarker::new();
        // Tiny estimate so marking past it exercises growth
        marker.initialize(0, space.reserved(), 2 * WORD_SIZE).unwrap();
        (space, marker)
    }

    fn word(n: usize) -> usize {
        n * WORD_SIZE
    }

    #[test]
    fn test_initialize_once() {
        let (space, mut marker) = setup();
        assert_eq!(marker.state(), MarkerState::Active);
        assert_eq!(
            marker.initialize(0, space.reserved(), 0),
            Err(ArchiveError::AlreadyInitialized)
        );
    }

    #[test]
    fn test_uninitialized_rejects_marks() {
        let space = ReservedSpace::new(&ArchiveConfig::small()).unwrap();
        let mut marker = ArchivePtrMarker::new();
        assert_eq!(
            marker.mark_pointer(&space, 0),
            Err(ArchiveError::MarkerNotInitialized)
        );
    }

    #[test]
    fn test_mark_grows_bitmap() {
        let (mut space, mut marker) = setup();
        let target = space.address_of(word(1));
        marker.set_and_mark_pointer(&mut space, word(10), target).unwrap();

        assert!(marker.is_marked(word(10)));
        assert_eq!(marker.bitmap().size(), 22);
        assert_eq!(marker.marked_count(), 1);
    }

    #[test]
    fn test_null_is_not_marked() {
        let (space, mut marker) = setup();
        marker.mark_pointer(&space, word(3)).unwrap();
        assert!(!marker.is_marked(word(3)));
        assert_eq!(marker.marked_count(), 0);
    }

    #[test]
    fn test_outside_window_is_ignored() {
        let mut space = ReservedSpace::new(&ArchiveConfig::small()).unwrap();
        space.commit_to(4096).unwrap();
        let mut marker = ArchivePtrMarker::new();
        marker.initialize(word(4), word(8), 0).unwrap();

        let target = space.address_of(word(1));
        marker.set_and_mark_pointer(&mut space, word(2), target).unwrap();
        marker.set_and_mark_pointer(&mut space, word(8), target).unwrap();
        assert_eq!(marker.marked_count(), 0);

        marker.set_and_mark_pointer(&mut space, word(5), target).unwrap();
        assert!(marker.is_marked(word(5)));
        assert!(marker.bitmap().at(1));
    }

    #[test]
    fn test_misaligned_slot_rejected() {
        let (space, mut marker) = setup();
        assert_eq!(
            marker.mark_pointer(&space, 3),
            Err(ArchiveError::MisalignedSlot(3))
        );
    }

    #[test]
    fn test_pointer_to_archive_base_rejected() {
        let (mut space, mut marker) = setup();
        let base = space.base_address();
        assert_eq!(
            marker.set_and_mark_pointer(&mut space, word(2), base),
            Err(ArchiveError::PointsToArchiveBase(word(2)))
        );
    }

    #[test]
    fn test_pointer_to_window_base_rejected() {
        let mut space = ReservedSpace::new(&ArchiveConfig::small()).unwrap();
        space.commit_to(4096).unwrap();
        let mut marker = ArchivePtrMarker::new();
        marker.initialize(word(4), word(64), 0).unwrap();

        let window_base = space.address_of(word(4));
        assert_eq!(
            marker.set_and_mark_pointer(&mut space, word(6), window_base),
            Err(ArchiveError::PointsToArchiveBase(word(6)))
        );
        assert!(!marker.is_marked(word(6)));
        assert_eq!(space.read_word(word(6)).unwrap(), 0);

        // The space base is an ordinary target for a window above it
        let space_base = space.base_address();
        marker.set_and_mark_pointer(&mut space, word(6), space_base).unwrap();
        assert!(marker.is_marked(word(6)));

        space.write_word(word(6), window_base).unwrap();
        assert_eq!(
            marker.compact(&space, space_base, space_base + 4096),
            Err(ArchiveError::PointsToArchiveBase(word(6)))
        );
    }

    #[test]
    fn test_rejected_mark_leaves_slot_untouched() {
        let (mut space, mut marker) = setup();
        let base = space.base_address();
        space.write_word(word(2), 7).unwrap();
        assert_eq!(
            marker.set_and_mark_pointer(&mut space, word(2), base),
            Err(ArchiveError::PointsToArchiveBase(word(2)))
        );
        assert_eq!(space.read_word(word(2)).unwrap(), 7);
    }

    #[test]
    fn test_clear_pointer() {
        let (mut space, mut marker) = setup();
        let target = space.address_of(word(1));
        marker.set_and_mark_pointer(&mut space, word(4), target).unwrap();
        marker.clear_pointer(word(4)).unwrap();
        assert!(!marker.is_marked(word(4)));

        assert_eq!(
            marker.clear_pointer(word(4)),
            Err(ArchiveError::NotMarked(word(4)))
        );
        assert_eq!(
            marker.clear_pointer(word(1000)),
            Err(ArchiveError::NotMarked(word(1000)))
        );
    }

    #[test]
    fn test_compact_trims_to_last_pointer() {
        let (mut space, mut marker) = setup();
        let target = space.address_of(word(1));
        marker.set_and_mark_pointer(&mut space, word(3), target).unwrap();
        marker.set_and_mark_pointer(&mut space, word(40), target).unwrap();

        let base = space.base_address();
        marker.compact(&space, base, base + 4096).unwrap();
        assert!(marker.is_compacted());
        assert_eq!(marker.bitmap().size(), 41);
        assert_eq!(marker.bitmap().iter_ones().collect::<Vec<_>>(), vec![3, 40]);
    }

    #[test]
    fn test_compact_prunes_nulled_slots() {
        let (mut space, mut marker) = setup();
        let target = space.address_of(word(1));
        marker.set_and_mark_pointer(&mut space, word(3), target).unwrap();
        marker.set_and_mark_pointer(&mut space, word(40), target).unwrap();

        // Null the highest pointer after marking it
        space.write_word(word(40), 0).unwrap();

        let base = space.base_address();
        marker.compact(&space, base, base + 4096).unwrap();
        assert_eq!(marker.bitmap().size(), 4);
        assert_eq!(marker.marked_count(), 1);
        assert!(marker.bitmap().at(3));
    }

    #[test]
    fn test_compact_empty_bitmap() {
        let (space, mut marker) = setup();
        let base = space.base_address();
        marker.compact(&space, base, base + 4096).unwrap();
        assert!(marker.bitmap().is_empty());
    }

    #[test]
    fn test_compact_rejects_foreign_pointer() {
        let (mut space, mut marker) = setup();
        let base = space.base_address();
        marker.set_and_mark_pointer(&mut space, word(2), base + 8192).unwrap();
        assert_eq!(
            marker.compact(&space, base, base + 4096),
            Err(ArchiveError::PointerOutOfRange {
                offset: word(2),
                value: base + 8192
            })
        );
    }

    #[test]
    fn test_compact_rejects_pointer_to_base() {
        let (mut space, mut marker) = setup();
        let base = space.base_address();
        marker.set_and_mark_pointer(&mut space, word(2), base + 16).unwrap();
        space.write_word(word(2), base).unwrap();
        assert_eq!(
            marker.compact(&space, base, base + 4096),
            Err(ArchiveError::PointsToArchiveBase(word(2)))
        );
    }

    #[test]
    fn test_compact_finalizes() {
        let (mut space, mut marker) = setup();
        let base = space.base_address();
        marker.compact(&space, base, base + 4096).unwrap();

        assert_eq!(
            marker.compact(&space, base, base + 4096),
            Err(ArchiveError::MarkerFinalized)
        );
        assert_eq!(
            marker.set_and_mark_pointer(&mut space, word(2), base + 16),
            Err(ArchiveError::MarkerFinalized)
        );
        // A rejected store leaves the finalized archive unchanged
        assert_eq!(space.read_word(word(2)).unwrap(), 0);
        assert_eq!(
            marker.clear_pointer(word(2)),
            Err(ArchiveError::MarkerFinalized)
        );
    }
}
