use super::{Anomaly, BitmapStats, Layout, MAX_REPORTED_ANOMALIES};
use crate::bitmap::BitIndex;
use crate::checksum::Algorithm;
use crate::header::{self, Descriptor, LEGACY_DESC_SIZE};
use crate::source::ImageSource;
use crate::{Error, ParseDescriptorSnafu, ReadBitmapSnafu, ReadDescriptorSnafu};
use snafu::ResultExt;
use tracing::warn;

/// Bytes of the byte-per-block bitmap read per call.
const BITMAP_CHUNK: usize = 16 * 1024;

const BLOCK_UNUSED: u8 = 0;
const BLOCK_USED: u8 = 1;

pub(super) fn init(source: &dyn ImageSource) -> Result<(Descriptor, Layout), Error> {
    let mut buf = vec![0u8; LEGACY_DESC_SIZE];

    source
        .read_exact_at(0, &mut buf)
        .context(ReadDescriptorSnafu)?;

    let desc = header::parse_legacy(&buf).context(ParseDescriptorSnafu)?;
    let algorithm = Algorithm::Crc32Compat;

    let layout = Layout {
        bitmap_offset: LEGACY_DESC_SIZE as u64,
        bitmap_len: desc.fs.total_blocks,
        block_size: desc.fs.block_size,
        trailer: algorithm.trailer_size(),
        algorithm,
        reseed: false,
    };

    Ok((desc, layout))
}

/// Reads one byte per block into `bitmap`.
///
/// Bytes other than 0 and 1 leave the block unused and are recorded as
/// anomalies.
pub(super) fn load_bitmap(
    source: &dyn ImageSource,
    offset: u64,
    bitmap: &mut BitIndex,
) -> Result<BitmapStats, Error> {
    let total = bitmap.len();
    let mut stats = BitmapStats::default();
    let mut chunk = vec![0u8; BITMAP_CHUNK];
    let mut block = 0u64;

    while block < total {
        let n = (total - block).min(BITMAP_CHUNK as u64) as usize;

        source
            .read_exact_at(offset + block, &mut chunk[..n])
            .context(ReadBitmapSnafu)?;

        for &value in &chunk[..n] {
            match value {
                BLOCK_USED => bitmap.set(block),
                BLOCK_UNUSED => {}
                value => {
                    stats.anomalous += 1;

                    if stats.anomalies.len() < MAX_REPORTED_ANOMALIES {
                        stats.anomalies.push(Anomaly { block, value });
                    }
                }
            }

            block += 1;
        }
    }

    if stats.anomalous > 0 {
        warn!(
            count = stats.anomalous,
            first = ?stats.anomalies.first(),
            "bitmap holds entries that are neither 0 nor 1; treating them as unused"
        );
    }

    Ok(stats)
}
