//! Fixed-size bit arrays with optional atomic update.
//!
//! Bits are numbered MSB-first within each 64-bit word: bit 0 is the top
//! bit of word 0. This keeps the scan primitives (`first_zero`, `one_after`)
//! a single count-leading-zeros per word.
//!
//! Two flavors are provided: [`BitSet`], which owns its storage (sized in
//! whole words), and [`BitsRef`], a borrowed view over words that live
//! somewhere else (chunk headers, the bump heap's mapped start-bit index).
//! `set`/`clear` are linearizable via compare-exchange retry loops; the
//! O(n) scans are *not* atomic and assume no concurrent scan of the same
//! region, which callers arrange by holding the owning chunk's lock.

use std::sync::atomic::Ordering;

use crate::loom_testing::*;

pub const BITS_PER_WORD: usize = 64;

/// Number of words needed to hold `bits` bits.
pub const fn words_for_bits(bits: usize) -> usize {
    (bits + (BITS_PER_WORD - 1)) / BITS_PER_WORD
}

const fn bit_mask(bit_in_word: usize) -> u64 {
    1u64 << ((BITS_PER_WORD - 1) - bit_in_word)
}

/// Borrowed view of a bit array of `len` bits stored in `words`.
///
/// The view does not check that padding bits past `len` stay zero; all
/// writers go through the indexed operations, which cannot touch them.
#[derive(Clone, Copy)]
pub struct BitsRef<'a> {
    words: &'a [AtomicU64],
    len: usize,
}

impl<'a> BitsRef<'a> {
    pub fn new(words: &'a [AtomicU64], len: usize) -> Self {
        debug_assert!(words.len() >= words_for_bits(len));
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Read the bit at index `i`.
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let word = i / BITS_PER_WORD;
        let bit = i % BITS_PER_WORD;
        self.words[word].load(Ordering::Relaxed) & bit_mask(bit) != 0
    }

    /// Set the bit at index `i` to 1.
    ///
    /// The whole-word read-modify-write is made linearizable with a
    /// compare-exchange retry loop.
    pub fn set(&self, i: usize) {
        debug_assert!(i < self.len);
        let word = &self.words[i / BITS_PER_WORD];
        let mask = bit_mask(i % BITS_PER_WORD);
        let mut expected = word.load(Ordering::Relaxed);
        loop {
            match word.compare_exchange_weak(
                expected,
                expected | mask,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => expected = x,
            }
        }
    }

    /// Set the bit at index `i` to 0.
    pub fn clear(&self, i: usize) {
        debug_assert!(i < self.len);
        let word = &self.words[i / BITS_PER_WORD];
        let mask = bit_mask(i % BITS_PER_WORD);
        let mut expected = word.load(Ordering::Relaxed);
        loop {
            match word.compare_exchange_weak(
                expected,
                expected & !mask,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => expected = x,
            }
        }
    }

    /// Unconditional (non-atomic) set, for bits whose word is protected
    /// by an external lock. No retry loop; a concurrent writer to the
    /// same word would lose updates.
    pub fn set_unsync(&self, i: usize) {
        debug_assert!(i < self.len);
        let word = &self.words[i / BITS_PER_WORD];
        let v = word.load(Ordering::Relaxed);
        word.store(v | bit_mask(i % BITS_PER_WORD), Ordering::Relaxed);
    }

    /// Unconditional (non-atomic) clear; see [`set_unsync`](Self::set_unsync).
    pub fn clear_unsync(&self, i: usize) {
        debug_assert!(i < self.len);
        let word = &self.words[i / BITS_PER_WORD];
        let v = word.load(Ordering::Relaxed);
        word.store(v & !bit_mask(i % BITS_PER_WORD), Ordering::Relaxed);
    }

    /// Returns the index of the first zero bit, or `len` if every bit is
    /// set.
    ///
    /// WARNING: not atomic.
    pub fn first_zero(&self) -> usize {
        for (i, w) in self.words.iter().enumerate() {
            let word = w.load(Ordering::Relaxed);
            if word != u64::MAX {
                let idx = i * BITS_PER_WORD + (!word).leading_zeros() as usize;
                return if idx < self.len { idx } else { self.len };
            }
        }
        self.len
    }

    /// Returns the index of the first set bit strictly after `idx`, or
    /// `len` if there is none.
    ///
    /// WARNING: not atomic.
    pub fn one_after(&self, idx: usize) -> usize {
        let start = idx + 1;
        if start >= self.len {
            return self.len;
        }
        let mut word_i = start / BITS_PER_WORD;
        let bit = start % BITS_PER_WORD;
        // Zero the bits before the index we're looking for.
        let mut word = self.words[word_i].load(Ordering::Relaxed);
        if bit != 0 {
            word &= u64::MAX >> bit;
        }
        loop {
            if word != 0 {
                let idx = word_i * BITS_PER_WORD + word.leading_zeros() as usize;
                return if idx < self.len { idx } else { self.len };
            }
            word_i += 1;
            if word_i >= self.words.len() {
                return self.len;
            }
            word = self.words[word_i].load(Ordering::Relaxed);
        }
    }

    /// Returns the largest set index at or before `idx`, if any.
    ///
    /// WARNING: not atomic.
    pub fn previous_one_at_or_before(&self, idx: usize) -> Option<usize> {
        debug_assert!(idx < self.len);
        let mut word_i = idx / BITS_PER_WORD;
        let bit = idx % BITS_PER_WORD;
        // Zero the bits after the index we're starting from.
        let mut word =
            self.words[word_i].load(Ordering::Relaxed) & (u64::MAX << (BITS_PER_WORD - 1 - bit));
        loop {
            if word != 0 {
                let highest_index = (BITS_PER_WORD - 1) - word.trailing_zeros() as usize;
                return Some(word_i * BITS_PER_WORD + highest_index);
            }
            if word_i == 0 {
                return None;
            }
            word_i -= 1;
            word = self.words[word_i].load(Ordering::Relaxed);
        }
    }

    /// Number of set bits. Not atomic; used for invariant checks.
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

/// Owned fixed-size bit array of `WORDS * 64` bits.
pub struct BitSet<const WORDS: usize> {
    words: [AtomicU64; WORDS],
}

impl<const WORDS: usize> BitSet<WORDS> {
    pub const CAPACITY: usize = WORDS * BITS_PER_WORD;

    pub fn new() -> Self {
        Self {
            words: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn as_bits(&self) -> BitsRef<'_> {
        BitsRef::new(&self.words, Self::CAPACITY)
    }

    pub fn get(&self, i: usize) -> bool {
        self.as_bits().get(i)
    }

    pub fn set(&self, i: usize) {
        self.as_bits().set(i)
    }

    pub fn clear(&self, i: usize) {
        self.as_bits().clear(i)
    }

    pub fn first_zero(&self) -> usize {
        self.as_bits().first_zero()
    }

    pub fn one_after(&self, idx: usize) -> usize {
        self.as_bits().one_after(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_clear() {
        let b = BitSet::<2>::new();
        assert!(!b.get(0));
        b.set(0);
        assert!(b.get(0));
        b.set(77);
        assert!(b.get(77));
        assert!(!b.get(76));
        b.clear(0);
        assert!(!b.get(0));
        assert!(b.get(77));
        // the unconditional variants agree with the atomic ones
        let bits = b.as_bits();
        bits.set_unsync(12);
        assert!(bits.get(12));
        bits.clear_unsync(77);
        assert!(!bits.get(77));
    }

    #[test]
    fn msb_first_layout() {
        let b = BitSet::<1>::new();
        b.set(0);
        assert_eq!(b.words[0].load(Ordering::Relaxed), 1 << 63);
        b.set(63);
        assert_eq!(b.words[0].load(Ordering::Relaxed), (1 << 63) | 1);
    }

    #[test]
    fn first_zero_law() {
        // first_zero returns capacity iff every bit is set
        let b = BitSet::<1>::new();
        assert_eq!(b.first_zero(), 0);
        for i in 0..64 {
            b.set(i);
        }
        assert_eq!(b.first_zero(), BitSet::<1>::CAPACITY);
        b.clear(17);
        assert_eq!(b.first_zero(), 17);
    }

    #[test]
    fn one_after_monotone() {
        let b = BitSet::<3>::new();
        for &i in &[1usize, 2, 64, 130, 191] {
            b.set(i);
        }
        // one_after is strictly monotone in its result
        let mut at = b.one_after(0);
        let mut seen = vec![];
        while at < BitSet::<3>::CAPACITY {
            seen.push(at);
            at = b.one_after(at);
        }
        assert_eq!(seen, vec![1, 2, 64, 130, 191]);
        assert_eq!(b.one_after(191), BitSet::<3>::CAPACITY);
    }

    #[test]
    fn one_after_skips_zero_words() {
        let b = BitSet::<4>::new();
        b.set(250);
        assert_eq!(b.one_after(0), 250);
        assert_eq!(b.one_after(249), 250);
        assert_eq!(b.one_after(250), BitSet::<4>::CAPACITY);
    }

    #[test]
    fn previous_one_scans_back() {
        let b = BitSet::<2>::new();
        b.set(3);
        b.set(70);
        let bits = b.as_bits();
        assert_eq!(bits.previous_one_at_or_before(127), Some(70));
        assert_eq!(bits.previous_one_at_or_before(70), Some(70));
        assert_eq!(bits.previous_one_at_or_before(69), Some(3));
        assert_eq!(bits.previous_one_at_or_before(2), None);
    }

    #[test]
    fn partial_len_view() {
        // a view shorter than its storage clamps scan results to len
        let words: Vec<AtomicU64> = (0..2).map(|_| AtomicU64::new(0)).collect();
        let bits = BitsRef::new(&words, 100);
        for i in 0..100 {
            bits.set(i);
        }
        assert_eq!(bits.first_zero(), 100);
        assert_eq!(bits.one_after(99), 100);
        assert_eq!(bits.count_ones(), 100);
    }

    #[cfg(not(loom))]
    #[test]
    fn concurrent_set_distinct_bits() {
        use std::sync::Arc;
        let b = Arc::new(BitSet::<8>::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let b = b.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..BitSet::<8>::CAPACITY {
                    if i % 4 == t {
                        b.set(i);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..BitSet::<8>::CAPACITY {
            assert!(b.get(i));
        }
    }
}
