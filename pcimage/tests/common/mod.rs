#![allow(dead_code)]

use pcimage::checksum::{CRC32_SEED, crc32, crc32_compat};
use std::path::{Path, PathBuf};

pub const LEGACY_DESC_SIZE: usize = 4160;
pub const CURRENT_DESC_SIZE: usize = 106;
pub const BITMAP_MAGIC: &[u8; 8] = b"BiTmAgIc";

/// Deterministic contents of `block`. The first byte differs per block.
pub fn payload(block: u64, block_size: u32) -> Vec<u8> {
    (0..block_size as u64)
        .map(|i| (block.wrapping_mul(31).wrapping_add(i * 7) ^ 0x5A) as u8)
        .collect()
}

fn padded<const N: usize>(s: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out[..s.len()].copy_from_slice(s);
    out
}

/// Builds legacy (`0001`) images.
#[derive(Clone, Debug)]
pub struct Legacy {
    pub block_size: u32,
    /// One byte per block; 1 = used.
    pub bitmap: Vec<u8>,
    /// Recorded used count; `None` uses the true count.
    pub used_blocks: Option<u64>,
    pub device_size: Option<u64>,
}

impl Legacy {
    pub fn new(block_size: u32, bitmap: &[u8]) -> Self {
        Self {
            block_size,
            bitmap: bitmap.to_vec(),
            used_blocks: None,
            device_size: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.bitmap.len() as u64
    }

    pub fn used(&self) -> Vec<u64> {
        (0..self.total())
            .filter(|&b| self.bitmap[b as usize] == 1)
            .collect()
    }

    pub fn data_offset(&self) -> usize {
        LEGACY_DESC_SIZE + self.bitmap.len() + BITMAP_MAGIC.len()
    }

    pub fn build(&self) -> Vec<u8> {
        let total = self.total();
        let used = self.used();
        let mut data = Vec::new();

        data.extend_from_slice(b"partclone-image");
        data.extend_from_slice(&padded::<15>(b"EXTFS"));
        data.extend_from_slice(b"0001");
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(&(self.block_size as i32).to_le_bytes());
        data.extend_from_slice(
            &self
                .device_size
                .unwrap_or(total * self.block_size as u64)
                .to_le_bytes(),
        );
        data.extend_from_slice(&total.to_le_bytes());
        data.extend_from_slice(
            &self
                .used_blocks
                .unwrap_or(used.len() as u64)
                .to_le_bytes(),
        );
        data.resize(LEGACY_DESC_SIZE, 0);
        data.extend_from_slice(&self.bitmap);
        data.extend_from_slice(BITMAP_MAGIC);

        let mut seed = CRC32_SEED;

        for block in used {
            let payload = payload(block, self.block_size);

            seed = crc32_compat(seed, &payload);
            data.extend_from_slice(&payload);
            data.extend_from_slice(&seed.to_le_bytes());
        }

        data
    }
}

/// Checksum layout of a current image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Checksum {
    None,
    Crc32,
    Crc32Reseed,
}

/// Builds current (`0002`) images.
#[derive(Clone, Debug)]
pub struct Current {
    pub block_size: u32,
    pub bits: Vec<bool>,
    pub checksum: Checksum,
    pub used_blocks: Option<u64>,
    pub endianness: u16,
    pub blocks_per_checksum: u32,
    pub bitmap_mode: u8,
}

impl Current {
    pub fn new(block_size: u32, bits: &[bool], checksum: Checksum) -> Self {
        Self {
            block_size,
            bits: bits.to_vec(),
            checksum,
            used_blocks: None,
            endianness: 0xC0DE,
            blocks_per_checksum: 1,
            bitmap_mode: 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.bits.len() as u64
    }

    pub fn used(&self) -> Vec<u64> {
        (0..self.total()).filter(|&b| self.bits[b as usize]).collect()
    }

    pub fn descriptor(&self) -> Vec<u8> {
        let total = self.total();
        let used = self.used().len() as u64;
        let (mode, size): (u16, u16) = match self.checksum {
            Checksum::None => (0x00, 0),
            Checksum::Crc32 | Checksum::Crc32Reseed => (0x20, 4),
        };
        let mut data = Vec::new();

        data.extend_from_slice(&padded::<16>(b"partclone-image"));
        data.extend_from_slice(&padded::<14>(b"0.3.27"));
        data.extend_from_slice(b"0002");
        data.extend_from_slice(&self.endianness.to_le_bytes());

        data.extend_from_slice(&padded::<16>(b"NTFS"));
        data.extend_from_slice(&(total * self.block_size as u64).to_le_bytes());
        data.extend_from_slice(&total.to_le_bytes());
        data.extend_from_slice(&self.used_blocks.unwrap_or(used).to_le_bytes());
        data.extend_from_slice(&used.to_le_bytes());
        data.extend_from_slice(&self.block_size.to_le_bytes());

        data.extend_from_slice(&18u32.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&64u16.to_le_bytes());
        data.extend_from_slice(&mode.to_le_bytes());
        data.extend_from_slice(&size.to_le_bytes());
        data.extend_from_slice(&self.blocks_per_checksum.to_le_bytes());
        data.push(u8::from(self.checksum == Checksum::Crc32Reseed));
        data.push(self.bitmap_mode);

        assert_eq!(data.len(), CURRENT_DESC_SIZE);
        data
    }

    pub fn build(&self) -> Vec<u8> {
        let mut data = self.descriptor();
        let crc = crc32(CRC32_SEED, &data);

        data.extend_from_slice(&crc.to_le_bytes());

        let mut bitmap = vec![0u8; self.bits.len().div_ceil(8)];

        for block in self.used() {
            bitmap[block as usize / 8] |= 1 << (block % 8);
        }

        data.extend_from_slice(&bitmap);
        data.extend_from_slice(BITMAP_MAGIC);

        let mut seed = CRC32_SEED;

        for block in self.used() {
            let payload = payload(block, self.block_size);

            data.extend_from_slice(&payload);

            match self.checksum {
                Checksum::None => {}
                Checksum::Crc32 => {
                    seed = crc32(seed, &payload);
                    data.extend_from_slice(&seed.to_le_bytes());
                }
                Checksum::Crc32Reseed => {
                    data.extend_from_slice(&crc32(CRC32_SEED, &payload).to_le_bytes());
                }
            }
        }

        data
    }
}

/// Writes `data` into `dir` and returns its path.
pub fn write_image(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}
