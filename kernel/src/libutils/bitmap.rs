//! Fixed-capacity bitmap
//!
//! Backing store of the event objects (`bmp`/`msk`) and of the masks callers
//! pass in. Capacity is [`EVT_MAX_BITS`]; objects only ever touch their first
//! `num` bits.

use core::fmt;

use crate::config::EVT_MAX_BITS;

const WORDS: usize = EVT_MAX_BITS / 64;

#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Bitmap {
    words: [u64; WORDS],
}

impl Bitmap {
    pub const CAPACITY: usize = EVT_MAX_BITS;

    /// All bits clear
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Bits `0..num` set
    pub fn first(num: usize) -> Self {
        let mut bmp = Self::new();
        bmp.s1_first(num);
        bmp
    }

    /// Bitmap with the given positions set. Positions beyond capacity are ignored.
    pub fn from_bits(bits: &[usize]) -> Self {
        let mut bmp = Self::new();
        for &b in bits {
            if b < Self::CAPACITY {
                bmp.s1i(b);
            }
        }
        bmp
    }

    #[inline]
    fn split(pos: usize) -> (usize, u64) {
        (pos / 64, 1u64 << (pos % 64))
    }

    /// Set bit
    #[inline]
    pub fn s1i(&mut self, pos: usize) {
        let (w, m) = Self::split(pos);
        self.words[w] |= m;
    }

    /// Clear bit
    #[inline]
    pub fn c0i(&mut self, pos: usize) {
        let (w, m) = Self::split(pos);
        self.words[w] &= !m;
    }

    /// Toggle bit
    #[inline]
    pub fn x1i(&mut self, pos: usize) {
        let (w, m) = Self::split(pos);
        self.words[w] ^= m;
    }

    /// Test bit
    #[inline]
    pub fn t1i(&self, pos: usize) -> bool {
        let (w, m) = Self::split(pos);
        self.words[w] & m != 0
    }

    /// Set every bit of `msk`
    pub fn s1m(&mut self, msk: &Bitmap) {
        for (d, s) in self.words.iter_mut().zip(msk.words.iter()) {
            *d |= *s;
        }
    }

    /// Clear every bit of `msk`
    pub fn c0m(&mut self, msk: &Bitmap) {
        for (d, s) in self.words.iter_mut().zip(msk.words.iter()) {
            *d &= !*s;
        }
    }

    /// Toggle every bit of `msk`
    pub fn x1m(&mut self, msk: &Bitmap) {
        for (d, s) in self.words.iter_mut().zip(msk.words.iter()) {
            *d ^= *s;
        }
    }

    /// Keep only the bits of `msk`
    pub fn and(&mut self, msk: &Bitmap) {
        for (d, s) in self.words.iter_mut().zip(msk.words.iter()) {
            *d &= *s;
        }
    }

    pub fn masked(&self, msk: &Bitmap) -> Bitmap {
        let mut r = *self;
        r.and(msk);
        r
    }

    pub fn xor(&self, other: &Bitmap) -> Bitmap {
        let mut r = *self;
        r.x1m(other);
        r
    }

    /// All bits of `msk` are set
    pub fn t1ma(&self, msk: &Bitmap) -> bool {
        self.words.iter().zip(msk.words.iter()).all(|(b, m)| b & m == *m)
    }

    /// At least one bit of `msk` is set
    pub fn t1mo(&self, msk: &Bitmap) -> bool {
        self.words.iter().zip(msk.words.iter()).any(|(b, m)| b & m != 0)
    }

    /// All bits of `msk` are clear
    pub fn t0ma(&self, msk: &Bitmap) -> bool {
        !self.t1mo(msk)
    }

    /// At least one bit of `msk` is clear
    pub fn t0mo(&self, msk: &Bitmap) -> bool {
        !self.t1ma(msk)
    }

    /// Set bits `0..num`, leave the others untouched
    pub fn s1_first(&mut self, num: usize) {
        let num = num.min(Self::CAPACITY);
        for (i, w) in self.words.iter_mut().enumerate() {
            let lo = i * 64;
            if num >= lo + 64 {
                *w = u64::MAX;
            } else if num > lo {
                *w |= (1u64 << (num - lo)) - 1;
            }
        }
    }

    pub fn clear(&mut self) {
        self.words = [0; WORDS];
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of set bits
    pub fn weight(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Lowest set bit
    pub fn ffs(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + w.trailing_zeros() as usize)
    }

    /// Highest set bit
    pub fn fls(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + 63 - w.leading_zeros() as usize)
    }

    /// Iterator over the set positions, lowest first
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..Self::CAPACITY).filter(move |p| self.t1i(*p))
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
