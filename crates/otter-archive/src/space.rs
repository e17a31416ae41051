//! Archive reservation
//!
//! One contiguous address range the dump regions are carved from. Nothing is
//! committed up front; memory is committed in `commit_granularity` steps as
//! region tops move forward. Positions inside the space are byte offsets, and
//! the pointer values written into the archive are `base_address + offset`.

use std::ops::Range;

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, ArchiveResult};
use crate::{WORD_SIZE, align_up, is_aligned};

/// A reserved, lazily committed range of archive memory.
#[derive(Debug)]
pub struct ReservedSpace {
    /// Dump-time address of offset 0
    base_address: usize,
    /// Total reserved bytes
    reserved: usize,
    /// Committed prefix of the reservation
    memory: Vec<u8>,
    /// Commit step in bytes
    commit_granularity: usize,
    /// Largest reachable offset for shared reservations
    max_delta: Option<usize>,
}

impl ReservedSpace {
    /// Reserve a private space described by `config`, with nothing committed.
    pub fn new(config: &ArchiveConfig) -> ArchiveResult<Self> {
        config.validate()?;
        Ok(Self {
            base_address: config.base_address,
            reserved: config.reserve_size,
            memory: Vec::new(),
            commit_granularity: config.commit_granularity,
            max_delta: None,
        })
    }

    /// Reserve the shared archive space. Region tops in a shared space may
    /// not move further than `config.max_shared_delta` from the base, since
    /// offsets into it are stored compressed.
    pub fn shared(config: &ArchiveConfig) -> ArchiveResult<Self> {
        let mut space = Self::new(config)?;
        space.max_delta = Some(config.max_shared_delta);
        Ok(space)
    }

    /// Dump-time address of the first byte.
    #[inline]
    pub fn base_address(&self) -> usize {
        self.base_address
    }

    /// Dump-time address one past the last reserved byte.
    #[inline]
    pub fn end_address(&self) -> usize {
        self.base_address + self.reserved
    }

    /// Total reserved bytes.
    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Currently committed bytes.
    #[inline]
    pub fn committed(&self) -> usize {
        self.memory.len()
    }

    /// Whether this is the shared reservation with a compressed-offset limit.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.max_delta.is_some()
    }

    /// Compressed-offset limit, for shared reservations.
    #[inline]
    pub fn max_delta(&self) -> Option<usize> {
        self.max_delta
    }

    /// Address of the byte at `offset`.
    #[inline]
    pub fn address_of(&self, offset: usize) -> usize {
        self.base_address + offset
    }

    /// Offset of `address`, if it lies inside the reservation.
    #[inline]
    pub fn offset_of(&self, address: usize) -> Option<usize> {
        (self.base_address..self.end_address())
            .contains(&address)
            .then(|| address - self.base_address)
    }

    /// Commit memory so that every byte below `offset` is backed.
    ///
    /// Commits whole granules, never past the reservation, and never
    /// uncommits. Newly committed memory is zeroed.
    pub fn commit_to(&mut self, offset: usize) -> ArchiveResult<()> {
        if offset > self.reserved {
            return Err(ArchiveError::CommitFailed { bytes: offset });
        }
        let target = align_up(offset, self.commit_granularity).min(self.reserved);
        let committed = self.memory.len();
        if target <= committed {
            return Ok(());
        }

        self.memory
            .try_reserve_exact(target - committed)
            .map_err(|_| ArchiveError::CommitFailed { bytes: target })?;
        self.memory.resize(target, 0);

        tracing::trace!(
            target: "otter::archive",
            from = committed,
            to = target,
            reserved = self.reserved,
            "committed archive memory"
        );
        Ok(())
    }

    /// Read the word stored at `offset`.
    pub fn read_word(&self, offset: usize) -> ArchiveResult<usize> {
        let range = self.word_range(offset)?;
        let mut buf = [0u8; WORD_SIZE];
        buf.copy_from_slice(&self.memory[range]);
        Ok(usize::from_ne_bytes(buf))
    }

    /// Store `value` as the word at `offset`.
    pub fn write_word(&mut self, offset: usize, value: usize) -> ArchiveResult<()> {
        let range = self.word_range(offset)?;
        self.memory[range].copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    /// Committed bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.memory
    }

    /// Committed bytes, mutably. Used by walkers that build structures in
    /// place after allocating them from a region.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Zero a committed byte range.
    pub(crate) fn fill_zero(&mut self, range: Range<usize>) {
        debug_assert!(range.end <= self.memory.len(), "zeroing uncommitted memory");
        self.memory[range].fill(0);
    }

    fn word_range(&self, offset: usize) -> ArchiveResult<Range<usize>> {
        if !is_aligned(offset, WORD_SIZE) {
            return Err(ArchiveError::MisalignedSlot(offset));
        }
        match offset.checked_add(WORD_SIZE) {
            Some(end) if end <= self.memory.len() => Ok(offset..end),
            _ => Err(ArchiveError::SlotOutOfRange(offset)),
        }
    }
}
