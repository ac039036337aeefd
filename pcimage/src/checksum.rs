//! CRC32 (polynomial `0xEDB88320`) in the two flavours found in partclone
//! images.
//!
//! Both functions return the raw CRC register: there is no final inversion, and
//! the caller supplies the seed. Per-block checksums are chained, so the seed of
//! one block is the stored checksum of the previous one.

/// Seed used for the descriptor checksum and for the first used block.
pub const CRC32_SEED: u32 = 0xFFFF_FFFF;

/// Size of a stored CRC32 value.
pub const CRC32_SIZE: usize = 4;

const POLYNOMIAL: u32 = 0xEDB8_8320;

// Only the legacy first-byte checksum walks the table by hand.
static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;

        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

#[inline]
fn fold(crc: u32, byte: u8) -> u32 {
    (crc >> 8) ^ TABLE[((crc ^ byte as u32) & 0xff) as usize]
}

/// Standard CRC32 over `bytes`, continuing from the register `seed`.
#[must_use]
pub fn crc32(seed: u32, bytes: &[u8]) -> u32 {
    // crc32fast inverts on entry and exit; undo both to expose the register.
    let mut hasher = crc32fast::Hasher::new_with_initial(!seed);
    hasher.update(bytes);
    !hasher.finalize()
}

/// CRC32 as computed by partclone 0.1.x for per-block trailers.
///
/// The generating tool advanced its loop counter without indexing the buffer,
/// so the result is the first byte folded `bytes.len()` times. Images written by
/// that tool only verify against this exact computation.
#[must_use]
pub fn crc32_compat(seed: u32, bytes: &[u8]) -> u32 {
    let Some(&first) = bytes.first() else {
        return seed;
    };

    (0..bytes.len()).fold(seed, |crc, _| fold(crc, first))
}

/// Checksum algorithm applied to block payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// No per-block checksum is stored.
    None,
    /// Standard CRC32.
    Crc32,
    /// First-byte CRC32 of the legacy format.
    Crc32Compat,
}

impl Algorithm {
    /// Number of trailer bytes stored after each block payload.
    #[must_use]
    pub fn trailer_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Crc32 | Self::Crc32Compat => CRC32_SIZE,
        }
    }

    #[must_use]
    pub fn compute(self, seed: u32, bytes: &[u8]) -> u32 {
        match self {
            Self::None => seed,
            Self::Crc32 => crc32(seed, bytes),
            Self::Crc32Compat => crc32_compat(seed, bytes),
        }
    }
}
