use crate::bitmap::BitIndex;
use std::collections::TryReserveError;

/// Default sampling factor: one entry per 1024 blocks.
pub const DEFAULT_FACTOR: u8 = 10;

/// Largest accepted sampling factor.
pub const MAX_FACTOR: u8 = 32;

/// Sparse count of used blocks preceding every `2^factor`-th block.
///
/// `sums[i]` is the number of set bits in `[0, i << factor)`, clamped to the
/// bitmap length. Resolving the count for an arbitrary block costs one lookup plus
/// a scan of at most `2^factor - 1` bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixSumIndex {
    factor: u8,
    sums: Vec<u64>,
}

impl PrefixSumIndex {
    /// Builds the index with one linear scan of `bitmap`.
    ///
    /// Returns the index together with the total number of set bits.
    pub fn build(bitmap: &BitIndex, factor: u8) -> Result<(Self, u64), TryReserveError> {
        let total = bitmap.len();
        let entries = (total.div_ceil(1 << factor) + 1) as usize;
        let mask = (1u64 << factor) - 1;
        let mut sums = Vec::new();
        let mut nset = 0;

        sums.try_reserve_exact(entries)?;

        for pos in 0..total {
            if pos & mask == 0 {
                sums.push(nset);
            }

            if bitmap.test(pos) {
                nset += 1;
            }
        }

        // Trailing entries cover seeks to the end of the image.
        sums.resize(entries, nset);

        Ok((Self { factor, sums }, nset))
    }

    #[must_use]
    pub fn factor(&self) -> u8 {
        self.factor
    }

    /// Sampled count at entry `i`.
    #[must_use]
    pub fn sample(&self, i: usize) -> Option<u64> {
        self.sums.get(i).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sums.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// Number of used blocks strictly before `target`.
    ///
    /// `target` may equal the bitmap length.
    #[must_use]
    pub fn preceding(&self, bitmap: &BitIndex, target: u64) -> u64 {
        let base = self.sums[(target >> self.factor) as usize];
        let start = target & !((1u64 << self.factor) - 1);

        base + bitmap.count_range(start, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bitmap_from(bits: &[bool]) -> BitIndex {
        let mut bitmap = BitIndex::new(bits.len() as u64).unwrap();

        for (pos, &used) in bits.iter().enumerate() {
            if used {
                bitmap.set(pos as u64);
            }
        }

        bitmap
    }

    #[test]
    fn small_bitmap_with_factor_one() {
        let bitmap = bitmap_from(&[true, false, true, true, false]);
        let (index, nset) = PrefixSumIndex::build(&bitmap, 1).unwrap();

        assert_eq!(nset, 3);
        assert_eq!(index.len(), 4);
        assert_eq!(index.sample(0), Some(0));
        assert_eq!(index.sample(1), Some(1));
        assert_eq!(index.sample(2), Some(3));
        assert_eq!(index.sample(3), Some(3));
        assert_eq!(index.preceding(&bitmap, 5), 3);
        assert_eq!(index.preceding(&bitmap, 3), 2);
    }

    #[test]
    fn seek_to_end_on_exact_multiple() {
        let bitmap = bitmap_from(&[true; 8]);
        let (index, _) = PrefixSumIndex::build(&bitmap, 2).unwrap();

        assert_eq!(index.preceding(&bitmap, 8), 8);
    }

    #[test]
    fn empty_bitmap() {
        let bitmap = BitIndex::new(0).unwrap();
        let (index, nset) = PrefixSumIndex::build(&bitmap, DEFAULT_FACTOR).unwrap();

        assert_eq!(nset, 0);
        assert_eq!(index.preceding(&bitmap, 0), 0);
    }

    proptest! {
        #[test]
        fn samples_match_brute_force(
            bits in proptest::collection::vec(any::<bool>(), 0..3000),
            factor in 0u8..12,
        ) {
            let bitmap = bitmap_from(&bits);
            let (index, nset) = PrefixSumIndex::build(&bitmap, factor).unwrap();

            prop_assert_eq!(nset, bits.iter().filter(|&&b| b).count() as u64);

            for i in 0..index.len() {
                let end = ((i as u64) << factor).min(bits.len() as u64) as usize;
                let expected = bits[..end].iter().filter(|&&b| b).count() as u64;

                prop_assert_eq!(index.sample(i), Some(expected));
            }
        }

        #[test]
        fn preceding_matches_brute_force(
            bits in proptest::collection::vec(any::<bool>(), 1..2000),
            factor in 0u8..10,
            target in any::<prop::sample::Index>(),
        ) {
            let bitmap = bitmap_from(&bits);
            let (index, _) = PrefixSumIndex::build(&bitmap, factor).unwrap();
            let target = target.index(bits.len() + 1);
            let expected = bits[..target].iter().filter(|&&b| b).count() as u64;

            prop_assert_eq!(index.preceding(&bitmap, target as u64), expected);
        }
    }
}
