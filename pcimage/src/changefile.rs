//! File-backed [`Overlay`] storing changed blocks beside the image.
//!
//! Layout: a 32-byte header, a bit-per-block presence map, then a data area
//! (aligned to the block size) with one fixed slot per block. Slots of blocks
//! never written stay as holes on filesystems that support sparse files.

use crate::bitmap::{BitIndex, bits_to_bytes};
use crate::checksum::{CRC32_SEED, crc32};
use crate::overlay::{
    BufferSizeSnafu, InvalidHeaderSnafu, IoSnafu, Lookup, OpenSnafu, OutOfRangeSnafu, Overlay,
    OverlayError, TruncatedSnafu,
};
use crate::source::{pread_exact, pwrite_all};
use snafu::{ResultExt, ensure};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const MAGIC: &[u8; 8] = b"PCIMGCF1";

const HEADER_SIZE: u64 = size_of::<HeaderRaw>() as u64;

/// Bytes covered by the header checksum.
const CHECKED_SIZE: usize = 24;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct HeaderRaw {
    magic: [u8; 8],    // 0x00
    block_size: U32,   // 0x08
    reserved: U32,     // 0x0C
    total_blocks: U64, // 0x10
    checksum: U32,     // 0x18
    reserved2: U32,    // 0x1C
}

impl HeaderRaw {
    fn new(block_size: u32, total_blocks: u64) -> Self {
        let mut raw = Self {
            magic: *MAGIC,
            block_size: block_size.into(),
            reserved: 0.into(),
            total_blocks: total_blocks.into(),
            checksum: 0.into(),
            reserved2: 0.into(),
        };

        raw.checksum = crc32(CRC32_SEED, &raw.as_bytes()[..CHECKED_SIZE]).into();
        raw
    }

    fn is_valid(&self) -> bool {
        self.magic == *MAGIC
            && self.checksum.get() == crc32(CRC32_SEED, &self.as_bytes()[..CHECKED_SIZE])
    }
}

/// Change file overlay.
pub struct ChangeFile {
    path: PathBuf,
    file: File,
    block_size: u32,
    total_blocks: u64,
    map: BitIndex,
    dirty: bool,
    cursor: u64,
}

impl std::fmt::Debug for ChangeFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFile")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("cursor", &self.cursor)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl ChangeFile {
    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of blocks currently held.
    #[must_use]
    pub fn stored_blocks(&self) -> u64 {
        self.map.count_range(0, self.total_blocks)
    }

    fn data_offset(&self) -> u64 {
        data_offset(self.block_size, self.total_blocks)
    }

    fn expected_len(&self) -> u64 {
        self.data_offset() + self.total_blocks * self.block_size as u64
    }

    fn check_buffer(&self, len: usize) -> Result<(), OverlayError> {
        ensure!(
            len == self.block_size as usize,
            BufferSizeSnafu {
                len,
                block_size: self.block_size
            }
        );
        ensure!(
            self.cursor < self.total_blocks,
            OutOfRangeSnafu { block: self.cursor }
        );
        Ok(())
    }

    fn slot_offset(&self) -> u64 {
        self.data_offset() + self.cursor * self.block_size as u64
    }

    fn write_map(&mut self) -> Result<(), OverlayError> {
        pwrite_all(&self.file, self.map.as_bytes(), HEADER_SIZE).context(IoSnafu)?;
        self.dirty = false;
        Ok(())
    }

    fn create_fresh(path: &Path, block_size: u32, total_blocks: u64) -> Result<Self, OverlayError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .context(OpenSnafu { path })?;

        let map = BitIndex::new(total_blocks).map_err(|e| OverlayError::Io {
            source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, e),
        })?;

        let mut cf = Self {
            path: path.to_path_buf(),
            file,
            block_size,
            total_blocks,
            map,
            dirty: false,
            cursor: 0,
        };

        let header = HeaderRaw::new(block_size, total_blocks);

        pwrite_all(&cf.file, header.as_bytes(), 0).context(IoSnafu)?;
        cf.write_map()?;
        cf.file.set_len(cf.expected_len()).context(IoSnafu)?;

        debug!(path = %path.display(), block_size, total_blocks, "created change file");

        Ok(cf)
    }
}

fn data_offset(block_size: u32, total_blocks: u64) -> u64 {
    (HEADER_SIZE + bits_to_bytes(total_blocks)).next_multiple_of(u64::from(block_size.max(1)))
}

impl Overlay for ChangeFile {
    fn init(path: &Path, block_size: u32, total_blocks: u64) -> Result<Self, OverlayError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .context(OpenSnafu { path })?;

        let mut header_buf = [0u8; HEADER_SIZE as usize];

        pread_exact(&file, &mut header_buf, 0).map_err(|_| {
            InvalidHeaderSnafu {
                path: path.to_path_buf(),
            }
            .build()
        })?;

        let header = HeaderRaw::read_from_bytes(&header_buf).map_err(|_| {
            InvalidHeaderSnafu {
                path: path.to_path_buf(),
            }
            .build()
        })?;

        ensure!(header.is_valid(), InvalidHeaderSnafu { path });

        ensure!(
            header.block_size.get() == block_size && header.total_blocks.get() == total_blocks,
            crate::overlay::GeometryMismatchSnafu {
                block_size: header.block_size.get(),
                total_blocks: header.total_blocks.get(),
                expected_block_size: block_size,
                expected_total_blocks: total_blocks,
            }
        );

        let mut map = BitIndex::new(total_blocks).map_err(|e| OverlayError::Io {
            source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, e),
        })?;

        pread_exact(&file, map.as_mut_bytes(), HEADER_SIZE).context(IoSnafu)?;

        debug!(path = %path.display(), "opened change file");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            block_size,
            total_blocks,
            map,
            dirty: false,
            cursor: 0,
        })
    }

    fn create(path: &Path, block_size: u32, total_blocks: u64) -> Result<Self, OverlayError> {
        let existing = match std::fs::metadata(path) {
            Ok(m) => m.len() > 0,
            Err(_) => false,
        };

        // Never clobber an existing change file; it may hold earlier writes.
        if existing {
            Self::init(path, block_size, total_blocks)
        } else {
            Self::create_fresh(path, block_size, total_blocks)
        }
    }

    fn verify(&mut self) -> Result<(), OverlayError> {
        let len = self.file.metadata().context(IoSnafu)?.len();
        let expected = self.expected_len();

        ensure!(len >= expected, TruncatedSnafu { len, expected });
        Ok(())
    }

    fn seek(&mut self, block: u64) -> Result<(), OverlayError> {
        ensure!(block <= self.total_blocks, OutOfRangeSnafu { block });
        self.cursor = block;
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<Lookup, OverlayError> {
        self.check_buffer(buf.len())?;

        if !self.map.test(self.cursor) {
            self.cursor += 1;
            return Ok(Lookup::NotPresent);
        }

        pread_exact(&self.file, buf, self.slot_offset()).context(IoSnafu)?;
        self.cursor += 1;

        Ok(Lookup::Found)
    }

    fn write_block(&mut self, buf: &[u8]) -> Result<(), OverlayError> {
        self.check_buffer(buf.len())?;

        pwrite_all(&self.file, buf, self.slot_offset()).context(IoSnafu)?;

        if !self.map.test(self.cursor) {
            self.map.set(self.cursor);
            self.dirty = true;
        }

        self.cursor += 1;
        Ok(())
    }

    fn block_used(&self) -> bool {
        self.cursor < self.total_blocks && self.map.test(self.cursor)
    }

    fn sync(&mut self) -> Result<(), OverlayError> {
        if self.dirty {
            self.write_map()?;
        }

        self.file.sync_data().context(IoSnafu)
    }

    fn finish(mut self) -> Result<(), OverlayError> {
        self.sync()
    }
}

impl Drop for ChangeFile {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.write_map() {
                warn!(path = %self.path.display(), error = %e, "cannot persist change file map");
            }
        }
    }
}
