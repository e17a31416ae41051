//! Dump side of the word stream

use super::{SerializeClosure, region_tag};
use crate::error::{ArchiveError, ArchiveResult};
use crate::oops::{HeapArchive, Oop};
use crate::ptrmap::ArchivePtrMarker;
use crate::region::DumpRegion;
use crate::space::ReservedSpace;

/// Appends fields to the active dump region, marking raw pointers as it goes.
pub struct WriteClosure<'a> {
    region: &'a mut DumpRegion,
    space: &'a mut ReservedSpace,
    marker: &'a mut ArchivePtrMarker,
    heap: &'a dyn HeapArchive,
}

impl<'a> WriteClosure<'a> {
    /// Create a writer appending to `region`.
    pub fn new(
        region: &'a mut DumpRegion,
        space: &'a mut ReservedSpace,
        marker: &'a mut ArchivePtrMarker,
        heap: &'a dyn HeapArchive,
    ) -> Self {
        Self {
            region,
            space,
            marker,
            heap,
        }
    }

    /// Offset the next word will be written at.
    #[inline]
    pub fn position(&self) -> usize {
        self.region.top()
    }

    /// Append a raw pointer and mark it for relocation.
    pub fn write_ptr(&mut self, value: usize) -> ArchiveResult<()> {
        self.append(value, true)
    }

    /// Append a heap reference. Null is written as `0`; anything else is
    /// compressed through the heap codec and, being relative to the heap
    /// base, is not marked for relocation.
    pub fn write_pointer_or_heap_ref(&mut self, value: Option<Oop>) -> ArchiveResult<()> {
        match value {
            None => self.append(0, false),
            Some(obj) => {
                if !self.heap.is_heap_object_archiving_allowed() {
                    return Err(ArchiveError::HeapArchivingNotAllowed);
                }
                let narrow = self.heap.encode_not_null(obj)?;
                self.append(narrow.raw() as usize, false)
            }
        }
    }

    /// Append a block of raw pointers: a tag holding its size in bytes,
    /// then every word, each marked for relocation.
    pub fn write_region(&mut self, words: &[usize]) -> ArchiveResult<()> {
        self.write_tag(region_tag(words)?)?;
        for &word in words {
            self.append(word, true)?;
        }
        Ok(())
    }

    /// Append a 32-bit scalar.
    pub fn write_raw_word(&mut self, value: u32) -> ArchiveResult<()> {
        self.append(value as usize, false)
    }

    /// Append a flag.
    pub fn write_flag(&mut self, value: bool) -> ArchiveResult<()> {
        self.append(value as usize, false)
    }

    /// Append a self-check tag.
    pub fn write_tag(&mut self, tag: i32) -> ArchiveResult<()> {
        self.append(tag as isize as usize, false)
    }

    fn append(&mut self, value: usize, need_to_mark: bool) -> ArchiveResult<()> {
        let marker = need_to_mark.then_some(&mut *self.marker);
        self.region.append_word(self.space, value, marker)?;
        Ok(())
    }
}

impl SerializeClosure for WriteClosure<'_> {
    fn reading(&self) -> bool {
        false
    }

    fn do_ptr(&mut self, p: &mut usize) -> ArchiveResult<()> {
        self.write_ptr(*p)
    }

    fn do_u4(&mut self, p: &mut u32) -> ArchiveResult<()> {
        self.write_raw_word(*p)
    }

    fn do_bool(&mut self, p: &mut bool) -> ArchiveResult<()> {
        self.write_flag(*p)
    }

    fn do_tag(&mut self, tag: i32) -> ArchiveResult<()> {
        self.write_tag(tag)
    }

    fn do_oop(&mut self, p: &mut Option<Oop>) -> ArchiveResult<()> {
        self.write_pointer_or_heap_ref(*p)
    }

    fn do_region(&mut self, words: &mut [usize]) -> ArchiveResult<()> {
        self.write_region(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WORD_SIZE;
    use crate::config::ArchiveConfig;
    use crate::oops::CompressedOops;

    struct Fixture {
        space: ReservedSpace,
        region: DumpRegion,
        marker: ArchivePtrMarker,
    }

    impl Fixture {
        fn new() -> Self {
            let config = ArchiveConfig::small();
            let space = ReservedSpace::new(&config).unwrap();
            let mut region = DumpRegion::new("rw", &config);
            region.init(&space).unwrap();
            let mut marker = ArchivePtrMarker::new();
            marker.initialize(0, space.reserved(), 0).unwrap();
            Self {
                space,
                region,
                marker,
            }
        }

        fn writer<'a>(&'a mut self, heap: &'a dyn HeapArchive) -> WriteClosure<'a> {
            WriteClosure::new(&mut self.region, &mut self.space, &mut self.marker, heap)
        }

        fn word(&self, n: usize) -> usize {
            self.space.read_word(n * WORD_SIZE).unwrap()
        }
    }

    #[test]
    fn test_null_oop_is_zero_and_unmarked() {
        let mut fx = Fixture::new();
        let heap = CompressedOops::disabled();
        fx.writer(&heap).write_pointer_or_heap_ref(None).unwrap();
        assert_eq!(fx.word(0), 0);
        assert_eq!(fx.marker.marked_count(), 0);
    }

    #[test]
    fn test_oop_requires_heap_archiving() {
        let mut fx = Fixture::new();
        let heap = CompressedOops::disabled();
        let obj = Oop::new(0x1000);
        assert_eq!(
            fx.writer(&heap).write_pointer_or_heap_ref(obj),
            Err(ArchiveError::HeapArchivingNotAllowed)
        );
    }

    #[test]
    fn test_oop_is_compressed_and_unmarked() {
        let mut fx = Fixture::new();
        let heap = CompressedOops::new(0x1000, 3);
        let obj = Oop::new(0x1000 + 0x40);
        fx.writer(&heap).write_pointer_or_heap_ref(obj).unwrap();
        assert_eq!(fx.word(0), 8);
        assert_eq!(fx.marker.marked_count(), 0);
    }

    #[test]
    fn test_unencodable_oop_appends_nothing() {
        let mut fx = Fixture::new();
        let heap = CompressedOops::new(0x1000, 3);
        let below_base = Oop::new(0x800);
        let mut writer = fx.writer(&heap);
        assert_eq!(
            writer.write_pointer_or_heap_ref(below_base),
            Err(ArchiveError::HeapRefOutOfRange(0x800))
        );
        assert_eq!(writer.position(), 0);
    }

    #[test]
    fn test_region_writes_tag_then_marked_words() {
        let mut fx = Fixture::new();
        let heap = CompressedOops::disabled();
        let base = fx.space.base_address();
        let words = [base + 64, 0, base + 128];
        fx.writer(&heap).write_region(&words).unwrap();

        assert_eq!(fx.word(0), 3 * WORD_SIZE);
        assert_eq!(fx.word(1), base + 64);
        assert_eq!(fx.word(2), 0);
        assert_eq!(fx.word(3), base + 128);

        // Tag and null words are not pointers
        assert!(!fx.marker.is_marked(0));
        assert!(fx.marker.is_marked(WORD_SIZE));
        assert!(!fx.marker.is_marked(2 * WORD_SIZE));
        assert!(fx.marker.is_marked(3 * WORD_SIZE));
    }

    #[test]
    fn test_scalars_are_unmarked() {
        let mut fx = Fixture::new();
        let heap = CompressedOops::disabled();
        let mut writer = fx.writer(&heap);
        writer.write_raw_word(0xCAFE).unwrap();
        writer.write_flag(true).unwrap();
        writer.write_tag(-7).unwrap();
        assert_eq!(writer.position(), 3 * WORD_SIZE);

        assert_eq!(fx.word(0), 0xCAFE);
        assert_eq!(fx.word(1), 1);
        assert_eq!(fx.word(2) as isize, -7);
        assert_eq!(fx.marker.marked_count(), 0);
    }

    #[test]
    fn test_ptr_is_marked() {
        let mut fx = Fixture::new();
        let heap = CompressedOops::disabled();
        let target = fx.space.base_address() + 256;
        fx.writer(&heap).write_ptr(target).unwrap();
        assert!(fx.marker.is_marked(0));
    }
}
