use super::{BitmapStats, Layout};
use crate::bitmap::{BitIndex, bits_to_bytes};
use crate::checksum::{Algorithm, CRC32_SEED, CRC32_SIZE, crc32};
use crate::header::{
    self, BitmapMode, CURRENT_DESC_SIZE, ChecksumMode, Descriptor, Endianness, Version,
};
use crate::source::ImageSource;
use crate::{
    DescriptorChecksumSnafu, Error, ParseDescriptorSnafu, ReadBitmapSnafu, ReadDescriptorSnafu,
    UnsupportedSnafu,
};
use snafu::{ResultExt, ensure};
use tracing::debug;

pub(super) fn init(source: &dyn ImageSource) -> Result<(Descriptor, Layout), Error> {
    let mut buf = [0u8; CURRENT_DESC_SIZE + CRC32_SIZE];

    source
        .read_exact_at(0, &mut buf)
        .context(ReadDescriptorSnafu)?;

    let (body, stored) = buf.split_at(CURRENT_DESC_SIZE);
    let desc = header::parse_current(body).context(ParseDescriptorSnafu)?;

    let mut raw = [0u8; CRC32_SIZE];
    raw.copy_from_slice(stored);

    let stored = u32::from_le_bytes(raw);
    let computed = crc32(CRC32_SEED, body);

    ensure!(
        stored == computed,
        DescriptorChecksumSnafu { stored, computed }
    );

    let algorithm = algorithm(&desc)?;
    let options = &desc.options;

    // Without a checksum the trailer is whatever size the creator recorded.
    let trailer = match algorithm {
        Algorithm::None => options.checksum_size as usize,
        _ => algorithm.trailer_size(),
    };

    let layout = Layout {
        bitmap_offset: (CURRENT_DESC_SIZE + CRC32_SIZE) as u64,
        bitmap_len: bits_to_bytes(desc.fs.total_blocks),
        block_size: desc.fs.block_size,
        trailer,
        algorithm,
        reseed: options.reseed_checksum,
    };

    debug!(
        creator = %desc.head.creator,
        ?algorithm,
        reseed = options.reseed_checksum,
        "current descriptor checksum verified"
    );

    Ok((desc, layout))
}

/// Picks the block checksum for `desc`, rejecting layouts this reader cannot
/// follow.
fn algorithm(desc: &Descriptor) -> Result<Algorithm, Error> {
    let version = Version::CURRENT;
    let options = &desc.options;

    match desc.head.endianness {
        Endianness::Little => {}
        Endianness::Big => {
            return UnsupportedSnafu {
                version,
                feature: "big-endian images",
            }
            .fail();
        }
        Endianness::Unknown(marker) => {
            return UnsupportedSnafu {
                version,
                feature: format!("byte order marker {marker:#06x}"),
            }
            .fail();
        }
    }

    ensure!(
        options.bitmap_mode == BitmapMode::Bit,
        UnsupportedSnafu {
            version,
            feature: format!("bitmap mode {:?}", options.bitmap_mode),
        }
    );

    let algorithm = match options.checksum_mode {
        ChecksumMode::None => Algorithm::None,
        ChecksumMode::Crc32 => {
            ensure!(
                options.checksum_size as usize == CRC32_SIZE,
                UnsupportedSnafu {
                    version,
                    feature: format!("{}-byte CRC32 trailers", options.checksum_size),
                }
            );
            Algorithm::Crc32
        }
        mode => {
            return UnsupportedSnafu {
                version,
                feature: format!("checksum mode {mode:?}"),
            }
            .fail();
        }
    };

    ensure!(
        algorithm == Algorithm::None || options.blocks_per_checksum == 1,
        UnsupportedSnafu {
            version,
            feature: format!(
                "one checksum per {} blocks",
                options.blocks_per_checksum
            ),
        }
    );

    Ok(algorithm)
}

/// Reads the bit-packed bitmap straight into `bitmap`.
pub(super) fn load_bitmap(
    source: &dyn ImageSource,
    offset: u64,
    bitmap: &mut BitIndex,
) -> Result<BitmapStats, Error> {
    source
        .read_exact_at(offset, bitmap.as_mut_bytes())
        .context(ReadBitmapSnafu)?;

    Ok(BitmapStats::default())
}
