//! Per-version block access.
//!
//! A [`Backend`] is selected by exact match of the 4-byte head version against
//! [`VERSION_TABLE`]. The variants differ in how the descriptor and bitmap are
//! laid out and which checksum protects each block; seeking, reading and
//! writing share the record arithmetic below.

use crate::bitmap::BitIndex;
use crate::checksum::{Algorithm, CRC32_SEED, CRC32_SIZE};
use crate::header::{BITMAP_MAGIC, Descriptor, Version};
use crate::index::PrefixSumIndex;
use crate::overlay::{Lookup, Overlay};
use crate::source::ImageSource;
use crate::{
    AllocateSnafu, BitmapMagicSnafu, BlockChecksumSnafu, Error, InvalidStateSnafu, OverlaySnafu,
    ReadBitmapSnafu, ReadBlockSnafu, Readiness, UsedBlockCountSnafu,
};
use snafu::{ResultExt, ensure};
use std::io;
use tracing::{debug, trace, warn};

mod current;
mod legacy;

/// Most anomalous bitmap entries remembered for reporting.
pub const MAX_REPORTED_ANOMALIES: usize = 64;

/// On-disk layout variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// Version `0001`: byte-per-block bitmap, first-byte block checksums.
    Legacy,
    /// Version `0002`: checksummed descriptor, bit-per-block bitmap.
    Current,
}

/// Version strings and the layout each selects. First match wins.
pub const VERSION_TABLE: &[(Version, Format)] = &[
    (Version::LEGACY, Format::Legacy),
    (Version::CURRENT, Format::Current),
];

/// Looks up the layout for a head version.
#[must_use]
pub fn select(version: Version) -> Option<Format> {
    VERSION_TABLE
        .iter()
        .find(|(v, _)| *v == version)
        .map(|&(_, format)| format)
}

/// A bitmap entry that is neither 0 nor 1 (legacy images only).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Anomaly {
    pub block: u64,
    pub value: u8,
}

/// Results of the bitmap scan performed during verify.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitmapStats {
    pub total: u64,
    pub used: u64,
    pub unused: u64,
    /// Entries treated as unused because their value was not 0 or 1.
    pub anomalous: u64,
    /// The first [`MAX_REPORTED_ANOMALIES`] anomalous entries.
    pub anomalies: Vec<Anomaly>,
    pub last_used: Option<u64>,
}

/// Byte geometry of the block records that follow the bitmap.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Layout {
    /// Offset of the bitmap.
    bitmap_offset: u64,
    /// Bytes occupied by the bitmap.
    bitmap_len: u64,
    block_size: u32,
    /// Bytes stored after each payload.
    trailer: usize,
    algorithm: Algorithm,
    /// Every block is seeded with [`CRC32_SEED`] instead of the previous trailer.
    reseed: bool,
}

impl Layout {
    /// Offset of the first block record.
    pub(crate) fn data_offset(&self) -> u64 {
        self.bitmap_offset
            .saturating_add(self.bitmap_len)
            .saturating_add(BITMAP_MAGIC.len() as u64)
    }

    pub(crate) fn record_size(&self) -> u64 {
        self.block_size as u64 + self.trailer as u64
    }

    /// Offset of the record for the `nvb`-th used block.
    fn record_offset(&self, nvb: u64) -> u64 {
        self.data_offset() + nvb * self.record_size()
    }

    fn chained(&self) -> bool {
        self.algorithm != Algorithm::None && !self.reseed
    }
}

/// Per-handle state of the selected version.
pub(crate) struct Backend {
    format: Format,
    layout: Layout,
    factor: u8,
    bitmap: Option<BitIndex>,
    index: Option<PrefixSumIndex>,
    stats: BitmapStats,
    /// Used blocks preceding the cursor.
    nvbcount: u64,
    /// Scratch space for one record plus the preceding trailer.
    record: Vec<u8>,
}

impl Backend {
    /// Reads the version-specific descriptor and prepares block access.
    ///
    /// Fails if the file is too short for the bitmap and its trailer.
    pub(crate) fn init(
        format: Format,
        source: &dyn ImageSource,
        factor: u8,
    ) -> Result<(Self, Descriptor), Error> {
        let (desc, layout) = match format {
            Format::Legacy => legacy::init(source)?,
            Format::Current => current::init(source)?,
        };

        debug!(
            ?format,
            block_size = desc.fs.block_size,
            total_blocks = desc.fs.total_blocks,
            fs = %desc.fs.fs_type,
            "image descriptor loaded"
        );

        let len = source.len().context(ReadBitmapSnafu)?;
        let bitmap_end = layout
            .bitmap_offset
            .checked_add(layout.bitmap_len)
            .and_then(|offset| offset.checked_add(BITMAP_MAGIC.len() as u64));

        // Refuse a geometry the file cannot hold before anything is sized from it.
        if bitmap_end.is_none_or(|end| end > len) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "image ends before the bitmap trailer",
            ))
            .context(ReadBitmapSnafu);
        }

        let backend = Self {
            format,
            layout,
            factor,
            bitmap: None,
            index: None,
            stats: BitmapStats::default(),
            nvbcount: 0,
            record: Vec::new(),
        };

        Ok((backend, desc))
    }

    /// Loads the bitmap, checks its trailer and builds the prefix-sum index.
    ///
    /// Repairs an inconsistent device size and, unless `strict` is set, a stale
    /// used-block count in `desc`.
    pub(crate) fn verify(
        &mut self,
        source: &dyn ImageSource,
        desc: &mut Descriptor,
        strict: bool,
    ) -> Result<(), Error> {
        let total = desc.fs.total_blocks;
        let magic_offset = self.layout.bitmap_offset + self.layout.bitmap_len;

        let bitmap = self.bitmap.insert(BitIndex::new(total).context(AllocateSnafu {
            what: "bitmap",
        })?);

        let mut stats = match self.format {
            Format::Legacy => legacy::load_bitmap(source, self.layout.bitmap_offset, bitmap)?,
            Format::Current => current::load_bitmap(source, self.layout.bitmap_offset, bitmap)?,
        };

        let mut magic = [0u8; BITMAP_MAGIC.len()];

        source
            .read_exact_at(magic_offset, &mut magic)
            .context(ReadBitmapSnafu)?;
        ensure!(magic == *BITMAP_MAGIC, BitmapMagicSnafu);

        let (index, nset) =
            PrefixSumIndex::build(bitmap, self.factor).context(AllocateSnafu {
                what: "prefix-sum index",
            })?;

        stats.total = total;
        stats.used = nset;
        stats.unused = total - nset;
        stats.last_used = (0..total).rev().find(|&b| bitmap.test(b));

        let device_size = total.saturating_mul(desc.fs.block_size as u64);

        if desc.fs.device_size != device_size {
            warn!(
                recorded = desc.fs.device_size,
                computed = device_size,
                "correcting device size"
            );
            desc.fs.device_size = device_size;
        }

        if desc.fs.used_blocks != nset {
            ensure!(
                !strict,
                UsedBlockCountSnafu {
                    recorded: desc.fs.used_blocks,
                    scanned: nset
                }
            );

            warn!(
                recorded = desc.fs.used_blocks,
                scanned = nset,
                "correcting stale used-block count"
            );
            desc.fs.used_blocks = nset;
        }

        let record_len = self.layout.trailer + self.layout.record_size() as usize;

        self.record
            .try_reserve_exact(record_len)
            .context(AllocateSnafu {
                what: "record buffer",
            })?;
        self.record.resize(record_len, 0);

        debug!(used = nset, factor = self.factor, "bitmap loaded");

        self.index = Some(index);
        self.stats = stats;
        self.nvbcount = 0;

        Ok(())
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn stats(&self) -> &BitmapStats {
        &self.stats
    }

    fn tracker(&self) -> Result<(&BitIndex, &PrefixSumIndex), Error> {
        match (&self.bitmap, &self.index) {
            (Some(bitmap), Some(index)) => Ok((bitmap, index)),
            _ => InvalidStateSnafu {
                required: Readiness::Verified,
            }
            .fail(),
        }
    }

    /// Repositions to `target`, forwarding the seek to the overlay.
    ///
    /// Nothing changes if the overlay refuses the seek.
    pub(crate) fn seek<O: Overlay>(
        &mut self,
        overlay: Option<&mut O>,
        target: u64,
    ) -> Result<(), Error> {
        let (bitmap, index) = self.tracker()?;
        let nvbcount = index.preceding(bitmap, target);

        if let Some(overlay) = overlay {
            overlay.seek(target).context(OverlaySnafu)?;
        }

        self.nvbcount = nvbcount;
        Ok(())
    }

    /// Reads `block` (the cursor) into `buf`.
    ///
    /// The preceding-used-block count advances for every used block, even when
    /// the read fails, so later sequential reads stay aligned.
    pub(crate) fn read_block<O: Overlay>(
        &mut self,
        source: &dyn ImageSource,
        overlay: Option<&mut O>,
        filler: &[u8],
        block: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let used = self.tracker()?.0.test(block);

        if let Some(overlay) = overlay {
            overlay.seek(block).context(OverlaySnafu)?;

            if overlay.read_block(buf).context(OverlaySnafu)? == Lookup::Found {
                trace!(block, "block read from overlay");

                if used {
                    self.nvbcount += 1;
                }

                return Ok(());
            }
        }

        if !used {
            buf.copy_from_slice(filler);
            return Ok(());
        }

        let nvb = self.nvbcount;
        self.nvbcount += 1;

        self.read_record(source, nvb, block, buf)
    }

    fn read_record(
        &mut self,
        source: &dyn ImageSource,
        nvb: u64,
        block: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let layout = self.layout;
        let offset = layout.record_offset(nvb);

        trace!(block, nvb, offset, "reading block record");

        if layout.algorithm == Algorithm::None {
            source
                .read_exact_at(offset, buf)
                .context(ReadBlockSnafu { block })?;
            return Ok(());
        }

        // Chained checksums are seeded with the previous record's trailer, which
        // sits immediately before this record.
        let with_seed = layout.chained() && nvb > 0;
        let (start, window) = if with_seed {
            (offset - layout.trailer as u64, &mut self.record[..])
        } else {
            (offset, &mut self.record[layout.trailer..])
        };

        source
            .read_exact_at(start, window)
            .context(ReadBlockSnafu { block })?;

        let (seed, rest) = if with_seed {
            let (prev, rest) = window.split_at(layout.trailer);
            (trailer_value(prev), rest)
        } else {
            (CRC32_SEED, &window[..])
        };

        let (payload, stored) = rest.split_at(layout.block_size as usize);
        let stored = trailer_value(stored);
        let computed = layout.algorithm.compute(seed, payload);

        buf.copy_from_slice(payload);

        ensure!(
            computed == stored,
            BlockChecksumSnafu {
                block,
                stored,
                computed
            }
        );

        Ok(())
    }

    /// Whether `block` holds data, either in the overlay or the image.
    pub(crate) fn block_used<O: Overlay>(
        &self,
        overlay: Option<&mut O>,
        block: u64,
    ) -> Result<bool, Error> {
        if let Some(overlay) = overlay {
            overlay.seek(block).context(OverlaySnafu)?;

            if overlay.block_used() {
                return Ok(true);
            }
        }

        Ok(self.tracker()?.0.test(block))
    }

    /// Stores `buf` as `block` in the overlay. The image itself is never written.
    pub(crate) fn write_block<O: Overlay>(
        &mut self,
        overlay: &mut O,
        block: u64,
        buf: &[u8],
    ) -> Result<(), Error> {
        overlay.seek(block).context(OverlaySnafu)?;
        overlay.write_block(buf).context(OverlaySnafu)
    }

    pub(crate) fn sync<O: Overlay>(&mut self, overlay: &mut O) -> Result<(), Error> {
        overlay.sync().context(OverlaySnafu)
    }
}

/// Decodes a little-endian stored checksum.
fn trailer_value(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; CRC32_SIZE];
    raw.copy_from_slice(&bytes[..CRC32_SIZE]);
    u32::from_le_bytes(raw)
}
