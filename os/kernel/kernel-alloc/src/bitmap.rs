//! Fixed-length bit set.
//!
//! Backs the zone free indexes and the per-page dirty and copy-on-write marks
//! of memory objects. Bits past `len` in the last word are kept clear.

use alloc::vec;
use alloc::vec::Vec;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// A bitmap of `len` bits, all set to `value`.
    #[must_use]
    pub fn new(len: usize, value: bool) -> Self {
        let mut bitmap = Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        };
        if value {
            bitmap.fill(true);
        }
        bitmap
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Panics
    /// If `index >= len`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of range {}", self.len);
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// # Panics
    /// If `index >= len`.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len, "bit {index} out of range {}", self.len);
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    pub fn set_range(&mut self, start: usize, count: usize, value: bool) {
        for index in start..start + count {
            self.set(index, value);
        }
    }

    pub fn fill(&mut self, value: bool) {
        let fill = if value { u64::MAX } else { 0 };
        self.words.iter_mut().for_each(|w| *w = fill);
        self.clear_tail();
    }

    fn clear_tail(&mut self) {
        let tail = self.len % WORD_BITS;
        if tail != 0
            && let Some(last) = self.words.last_mut()
        {
            *last &= (1 << tail) - 1;
        }
    }

    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Index of the first bit equal to `value` at or after `start`.
    #[must_use]
    pub fn find_first_from(&self, start: usize, value: bool) -> Option<usize> {
        if start >= self.len {
            return None;
        }
        let first_word = start / WORD_BITS;
        for (i, &word) in self.words.iter().enumerate().skip(first_word) {
            let mut bits = if value { word } else { !word };
            if i == first_word {
                bits &= u64::MAX << (start % WORD_BITS);
            }
            if bits != 0 {
                let index = i * WORD_BITS + bits.trailing_zeros() as usize;
                return (index < self.len).then_some(index);
            }
        }
        None
    }

    /// Start of the lowest run of `count` consecutive bits equal to `value`.
    #[must_use]
    pub fn find_run(&self, count: usize, value: bool) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let mut start = 0;
        while let Some(first) = self.find_first_from(start, value) {
            if first + count > self.len {
                return None;
            }
            match (first..first + count).find(|&i| self.get(i) != value) {
                None => return Some(first),
                Some(mismatch) => start = mismatch + 1,
            }
        }
        None
    }

    /// Indexes of all set bits, ascending.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = 0;
        core::iter::from_fn(move || {
            let found = self.find_first_from(next, true)?;
            next = found + 1;
            Some(found)
        })
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Bitmap({}/{} set)", self.count_ones(), self.len)
    }
}
