//! Load side of the word stream

use super::{SerializeClosure, region_tag};
use crate::WORD_SIZE;
use crate::error::{ArchiveError, ArchiveResult};
use crate::oops::{HeapArchive, NarrowOop, Oop};

/// Lower bound of the tag range rejected by `do_ptr`. Words in
/// `[TAG_FLOOR, 0)` are small negative tags, not pointers.
const TAG_FLOOR: isize = -100;

/// Reads fields back from a mapped archive, one word per field.
pub struct ReadClosure<'a> {
    archive: &'a [u8],
    /// Byte offset of the next word
    cursor: usize,
    heap: &'a dyn HeapArchive,
}

impl<'a> ReadClosure<'a> {
    /// Create a reader starting at byte `start` of `archive`.
    pub fn new(archive: &'a [u8], start: usize, heap: &'a dyn HeapArchive) -> Self {
        Self {
            archive,
            cursor: start,
            heap,
        }
    }

    /// Byte offset of the next word.
    #[inline]
    pub fn position(&self) -> usize {
        self.cursor
    }

    fn next_ptr(&mut self) -> ArchiveResult<usize> {
        let end = self
            .cursor
            .checked_add(WORD_SIZE)
            .filter(|&end| end <= self.archive.len())
            .ok_or(ArchiveError::UnexpectedEnd(self.cursor))?;
        let mut buf = [0u8; WORD_SIZE];
        buf.copy_from_slice(&self.archive[self.cursor..end]);
        self.cursor = end;
        Ok(usize::from_ne_bytes(buf))
    }
}

impl SerializeClosure for ReadClosure<'_> {
    fn reading(&self) -> bool {
        true
    }

    fn do_ptr(&mut self, p: &mut usize) -> ArchiveResult<()> {
        if *p != 0 {
            return Err(ArchiveError::SlotAlreadyInitialized);
        }
        let obj = self.next_ptr()? as isize;
        if (TAG_FLOOR..0).contains(&obj) {
            return Err(ArchiveError::HitTag(obj));
        }
        *p = obj as usize;
        Ok(())
    }

    fn do_u4(&mut self, p: &mut u32) -> ArchiveResult<()> {
        *p = self.next_ptr()? as u32;
        Ok(())
    }

    fn do_bool(&mut self, p: &mut bool) -> ArchiveResult<()> {
        *p = self.next_ptr()? != 0;
        Ok(())
    }

    fn do_tag(&mut self, tag: i32) -> ArchiveResult<()> {
        let old_tag = self.next_ptr()? as isize as i32;
        if old_tag != tag {
            return Err(ArchiveError::TagMismatch {
                expected: tag,
                found: old_tag,
            });
        }
        Ok(())
    }

    fn do_oop(&mut self, p: &mut Option<Oop>) -> ArchiveResult<()> {
        let narrow = NarrowOop::from_word(self.next_ptr()?);
        // Without the heap region every archived reference reads as null
        if narrow.is_null() || !self.heap.open_archive_heap_region_mapped() {
            *p = None;
            return Ok(());
        }
        if !self.heap.is_heap_object_archiving_allowed() {
            return Err(ArchiveError::HeapArchivingNotAllowed);
        }
        *p = Some(self.heap.decode_from_archive(narrow)?);
        Ok(())
    }

    fn do_region(&mut self, words: &mut [usize]) -> ArchiveResult<()> {
        self.do_tag(region_tag(words)?)?;
        for word in words.iter_mut() {
            *word = self.next_ptr()?;
        }
        Ok(())
    }
}
