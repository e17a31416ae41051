//! Growable bit vector.
//!
//! Bits are stored in `u64` words so set bits can be found with
//! `trailing_zeros()` instead of testing one index at a time. Bits past
//! `size` are always zero.

/// Bits per storage word.
const BITS_PER_WORD: usize = 64;

/// A resizable bit vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitMap {
    /// Storage, `size.div_ceil(64)` words.
    words: Vec<u64>,
    /// Number of addressable bits.
    size: usize,
}

impl BitMap {
    /// Create an empty bitmap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bitmap with `size` clear bits.
    pub fn with_size(size: usize) -> Self {
        Self {
            words: vec![0; size.div_ceil(BITS_PER_WORD)],
            size,
        }
    }

    /// Number of addressable bits.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if the bitmap has no addressable bits.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Grow or shrink to `size` bits. New bits are clear; bits cut off by a
    /// shrink are discarded.
    pub fn resize(&mut self, size: usize) {
        self.words.resize(size.div_ceil(BITS_PER_WORD), 0);
        self.size = size;

        // Keep the tail of the last word clear
        let remainder = size % BITS_PER_WORD;
        if remainder != 0
            && let Some(last) = self.words.last_mut()
        {
            *last &= (1u64 << remainder) - 1;
        }
    }

    /// Test bit `idx`. Out-of-range bits read as clear.
    #[inline]
    pub fn at(&self, idx: usize) -> bool {
        idx < self.size && self.words[idx / BITS_PER_WORD] & (1u64 << (idx % BITS_PER_WORD)) != 0
    }

    /// Set bit `idx`.
    ///
    /// # Panics
    /// Panics if `idx >= size()`.
    #[inline]
    pub fn set_bit(&mut self, idx: usize) {
        assert!(idx < self.size, "bit {idx} out of range {}", self.size);
        self.words[idx / BITS_PER_WORD] |= 1u64 << (idx % BITS_PER_WORD);
    }

    /// Clear bit `idx`.
    ///
    /// # Panics
    /// Panics if `idx >= size()`.
    #[inline]
    pub fn clear_bit(&mut self, idx: usize) {
        assert!(idx < self.size, "bit {idx} out of range {}", self.size);
        self.words[idx / BITS_PER_WORD] &= !(1u64 << (idx % BITS_PER_WORD));
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over the indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_idx, &word)| SetBits {
                word,
                base: word_idx * BITS_PER_WORD,
            })
    }

    /// Backing words, least significant bit first.
    #[inline]
    pub fn as_words(&self) -> &[u64] {
        &self.words
    }
}

/// Set bits of a single storage word.
struct SetBits {
    word: u64,
    base: usize,
}

impl Iterator for SetBits {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.word == 0 {
            return None;
        }
        let bit = self.word.trailing_zeros() as usize;
        // Clear the lowest set bit
        self.word &= self.word - 1;
        Some(self.base + bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_size() {
        let map = BitMap::with_size(130);
        assert_eq!(map.size(), 130);
        assert_eq!(map.as_words().len(), 3);
        assert_eq!(map.count_ones(), 0);
    }

    #[test]
    fn test_set_and_clear() {
        let mut map = BitMap::with_size(100);
        map.set_bit(0);
        map.set_bit(63);
        map.set_bit(64);
        map.set_bit(99);
        assert!(map.at(0));
        assert!(map.at(63));
        assert!(map.at(64));
        assert!(map.at(99));
        assert!(!map.at(1));
        assert_eq!(map.count_ones(), 4);

        map.clear_bit(63);
        assert!(!map.at(63));
        assert_eq!(map.count_ones(), 3);
    }

    #[test]
    fn test_out_of_range_reads_clear() {
        let map = BitMap::with_size(10);
        assert!(!map.at(10));
        assert!(!map.at(1000));
    }

    #[test]
    #[should_panic]
    fn test_set_out_of_range_panics() {
        let mut map = BitMap::with_size(10);
        map.set_bit(10);
    }

    #[test]
    fn test_iter_ones() {
        let mut map = BitMap::with_size(200);
        for idx in [3, 64, 65, 127, 199] {
            map.set_bit(idx);
        }
        let ones: Vec<usize> = map.iter_ones().collect();
        assert_eq!(ones, vec![3, 64, 65, 127, 199]);
    }

    #[test]
    fn test_grow_keeps_bits() {
        let mut map = BitMap::with_size(10);
        map.set_bit(9);
        map.resize(500);
        assert_eq!(map.size(), 500);
        assert!(map.at(9));
        assert!(!map.at(499));
        map.set_bit(499);
        assert!(map.at(499));
    }

    #[test]
    fn test_shrink_discards_tail() {
        let mut map = BitMap::with_size(128);
        map.set_bit(5);
        map.set_bit(70);
        map.resize(6);
        assert_eq!(map.size(), 6);
        assert_eq!(map.as_words(), &[1u64 << 5]);

        // Growing again must not resurrect bit 70
        map.resize(128);
        assert!(!map.at(70));
        assert_eq!(map.count_ones(), 1);
    }

    #[test]
    fn test_resize_to_zero() {
        let mut map = BitMap::with_size(64);
        map.set_bit(1);
        map.resize(0);
        assert!(map.is_empty());
        assert!(map.as_words().is_empty());
        assert_eq!(map.iter_ones().count(), 0);
    }
}
