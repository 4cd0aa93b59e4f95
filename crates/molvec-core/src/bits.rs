//! Fixed-width bit vectors packed into 64-bit words
//!
//! Bit `i` lives in word `i / 64` at position `i % 64`. Viewed as little-endian
//! bytes this is byte `i / 8`, bit `i % 8`, which is the layout of the
//! persisted binary column. Padding bits past `num_bits` are always zero.

use crate::error::{MolvecError, Result};
use std::fmt;

/// Fixed-width binary fingerprint bits
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BitVector {
    words: Vec<u64>,
    num_bits: usize,
}

/// Number of bytes needed to hold `num_bits`
#[inline]
pub fn byte_len(num_bits: usize) -> usize {
    (num_bits + 7) / 8
}

/// Number of 64-bit words needed to hold `num_bits`
#[inline]
pub fn word_len(num_bits: usize) -> usize {
    (num_bits + 63) / 64
}

impl BitVector {
    /// All-zero vector of the given width
    pub fn zeros(num_bits: usize) -> Self {
        Self {
            words: vec![0u64; word_len(num_bits)],
            num_bits,
        }
    }

    /// Build from the indices of set bits
    pub fn from_on_bits(num_bits: usize, on_bits: &[usize]) -> Result<Self> {
        let mut bv = Self::zeros(num_bits);
        for &pos in on_bits {
            if pos >= num_bits {
                return Err(MolvecError::MalformedFingerprint(format!(
                    "bit index {} out of range for {}-bit fingerprint",
                    pos, num_bits
                )));
            }
            bv.set(pos, true);
        }
        Ok(bv)
    }

    /// Build from raw words; the caller guarantees padding bits are clear
    pub(crate) fn from_words(words: Vec<u64>, num_bits: usize) -> Self {
        debug_assert_eq!(words.len(), word_len(num_bits));
        Self { words, num_bits }
    }

    /// Width in bits
    #[inline]
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Backing words
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Read a bit
    #[inline]
    pub fn get(&self, pos: usize) -> bool {
        debug_assert!(pos < self.num_bits);
        (self.words[pos / 64] >> (pos % 64)) & 1 == 1
    }

    /// Write a bit
    #[inline]
    pub fn set(&mut self, pos: usize, value: bool) {
        debug_assert!(pos < self.num_bits);
        let mask = 1u64 << (pos % 64);
        if value {
            self.words[pos / 64] |= mask;
        } else {
            self.words[pos / 64] &= !mask;
        }
    }

    /// Popcount
    #[inline]
    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// True when no bit is set
    pub fn is_zero(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// `popcount(self & other)`, word-parallel
    #[inline]
    pub fn intersection_count(&self, other: &BitVector) -> u32 {
        self.words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a & b).count_ones())
            .sum()
    }

    /// `popcount(self | other)`, word-parallel
    #[inline]
    pub fn union_count(&self, other: &BitVector) -> u32 {
        self.words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a | b).count_ones())
            .sum()
    }

    /// Sorted indices of the set bits
    pub fn on_bits(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.count_ones() as usize);
        for (w_idx, &word) in self.words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let tz = w.trailing_zeros() as usize;
                out.push(w_idx * 64 + tz);
                w &= w - 1;
            }
        }
        out
    }

    /// Fraction of bits set
    pub fn density(&self) -> f64 {
        if self.num_bits == 0 {
            return 0.0;
        }
        self.count_ones() as f64 / self.num_bits as f64
    }
}

impl fmt::Debug for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BitVector({} bits, {} set)",
            self.num_bits,
            self.count_ones()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_on_bits_roundtrip() {
        let bv = BitVector::from_on_bits(2048, &[0, 5, 10, 64, 2047]).unwrap();
        assert_eq!(bv.count_ones(), 5);
        assert_eq!(bv.on_bits(), vec![0, 5, 10, 64, 2047]);
        assert!(bv.get(64));
        assert!(!bv.get(63));
    }

    #[test]
    fn test_out_of_range_bit_rejected() {
        let err = BitVector::from_on_bits(167, &[167]).unwrap_err();
        assert!(matches!(err, MolvecError::MalformedFingerprint(_)));
    }

    #[test]
    fn test_intersection_and_union() {
        let a = BitVector::from_on_bits(256, &[0, 5, 10]).unwrap();
        let b = BitVector::from_on_bits(256, &[0, 5, 20]).unwrap();
        assert_eq!(a.intersection_count(&b), 2);
        assert_eq!(a.union_count(&b), 4);
    }

    #[test]
    fn test_word_and_byte_lengths() {
        assert_eq!(byte_len(167), 21);
        assert_eq!(word_len(167), 3);
        assert_eq!(byte_len(2048), 256);
        assert_eq!(word_len(2048), 32);
    }
}
