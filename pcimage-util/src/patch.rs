use pcimage::BlockImage;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::debug;

/// Errors that can occur while patching blocks.
#[derive(Debug, Snafu)]
pub enum PatchError {
    #[snafu(display("image is not verified"))]
    NotVerified,

    #[snafu(display("{len} bytes is not a whole number of {block_size}-byte blocks"))]
    PartialBlock { len: usize, block_size: u32 },

    #[snafu(display("blocks #{first}..#{end} are beyond the last block ({total} blocks)"))]
    OutOfRange { first: u64, end: u64, total: u64 },

    #[snafu(display("cannot write blocks: {source}"))]
    WriteFailed { source: pcimage::Error },

    #[snafu(display("cannot sync overlay: {source}"))]
    SyncFailed { source: pcimage::Error },
}

/// Writes `data` as whole blocks starting at `first` and syncs the overlay.
///
/// Returns the number of blocks written.
pub fn patch(image: &mut dyn BlockImage, first: u64, data: &[u8]) -> Result<u64, PatchError> {
    let block_size = image.block_size().context(NotVerifiedSnafu)?;
    let total = image.block_count().context(NotVerifiedSnafu)?;

    ensure!(
        data.len() % block_size as usize == 0,
        PartialBlockSnafu {
            len: data.len(),
            block_size
        }
    );

    let count = (data.len() / block_size as usize) as u64;
    let end = first.saturating_add(count);

    ensure!(end <= total, OutOfRangeSnafu { first, end, total });

    image.seek(first).context(WriteFailedSnafu)?;
    image.write_blocks(data).context(WriteFailedSnafu)?;
    image.sync().context(SyncFailedSnafu)?;

    debug!(first, count, "blocks patched");

    Ok(count)
}
