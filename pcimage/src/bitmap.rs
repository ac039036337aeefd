use std::collections::TryReserveError;

const BITS_PER_BYTE: u64 = 8;

/// Returns the number of bytes needed to hold `bits` packed bits.
#[inline]
#[must_use]
pub const fn bits_to_bytes(bits: u64) -> u64 {
    bits.div_ceil(BITS_PER_BYTE)
}

/// Packed bit-per-block usage map.
///
/// Bit `pos` lives in byte `pos / 8` at bit `pos % 8` (LSB first), which is also
/// the on-disk layout of the current image format. Callers are responsible for
/// keeping `pos < len()`.
#[derive(Clone, PartialEq, Eq)]
pub struct BitIndex {
    bits: Vec<u8>,
    len: u64,
}

impl std::fmt::Debug for BitIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitIndex")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl BitIndex {
    /// Allocates an all-clear index for `len` blocks.
    pub fn new(len: u64) -> Result<Self, TryReserveError> {
        let bytes = bits_to_bytes(len) as usize;
        let mut bits = Vec::new();

        bits.try_reserve_exact(bytes)?;
        bits.resize(bytes, 0);

        Ok(Self { bits, len })
    }

    /// Number of blocks tracked.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, pos: u64) {
        let idx = (pos / BITS_PER_BYTE) as usize;
        let bit = pos % BITS_PER_BYTE;

        self.bits[idx] |= 1 << bit;
    }

    #[inline]
    #[must_use]
    pub fn test(&self, pos: u64) -> bool {
        let idx = (pos / BITS_PER_BYTE) as usize;
        let bit = pos % BITS_PER_BYTE;

        (self.bits[idx] >> bit) & 1 != 0
    }

    /// Counts set bits in `start..end`.
    #[must_use]
    pub fn count_range(&self, start: u64, end: u64) -> u64 {
        (start..end).filter(|&pos| self.test(pos)).count() as u64
    }

    /// Raw packed bytes, suitable for writing back to disk.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Mutable packed bytes, used to load a bit-packed map straight from disk.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bits
    }
}
