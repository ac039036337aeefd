use crate::progress::ExportProgress;
use pcimage::BlockImage;
use snafu::{OptionExt, ResultExt, Snafu};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Blocks processed between progress updates.
const PROGRESS_BATCH: u64 = 256;

/// Errors that can occur during export.
#[derive(Debug, Snafu)]
pub enum ExportError {
    #[snafu(display("image is not verified"))]
    NotVerified,

    #[snafu(display("cannot create {}: {source}", path.display()))]
    CreateFileFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot write to {}: {source}", path.display()))]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot read block #{block}: {source}"))]
    ReadBlockFailed {
        block: u64,
        source: pcimage::Error,
    },
}

/// Outcome of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub blocks: u64,
    /// Blocks holding data, in the image or its overlay.
    pub written: u64,
}

/// Writes the whole virtual device of a verified `image` to `output`.
///
/// The output is sized to the device first; unused blocks are skipped and stay
/// as holes (or zeros where sparse files are not supported).
pub fn export<P: ExportProgress>(
    image: &mut dyn BlockImage,
    output: &Path,
    progress: &P,
) -> Result<ExportSummary, ExportError> {
    let block_size = image.block_size().context(NotVerifiedSnafu)?;
    let total = image.block_count().context(NotVerifiedSnafu)?;

    let mut file = File::create(output).context(CreateFileFailedSnafu { path: output })?;

    file.set_len(total * block_size as u64)
        .context(WriteFailedSnafu { path: output })?;

    progress.start(output, total, block_size);

    let mut buf = vec![0u8; block_size as usize];
    let mut written = 0;

    image
        .seek(0)
        .context(ReadBlockFailedSnafu { block: 0u64 })?;

    for block in 0..total {
        let used = image
            .is_block_used()
            .context(ReadBlockFailedSnafu { block })?;

        // Unused blocks cost no I/O, and keep the cursor moving.
        image
            .read_blocks(&mut buf)
            .context(ReadBlockFailedSnafu { block })?;

        if used {
            file.seek(SeekFrom::Start(block * block_size as u64))
                .context(WriteFailedSnafu { path: output })?;
            file.write_all(&buf)
                .context(WriteFailedSnafu { path: output })?;
            written += 1;
        }

        if (block + 1) % PROGRESS_BATCH == 0 {
            progress.advance(PROGRESS_BATCH);
        }
    }

    progress.advance(total % PROGRESS_BATCH);
    file.sync_all().context(WriteFailedSnafu { path: output })?;
    progress.completed(written);

    debug!(output = %output.display(), total, written, "export finished");

    Ok(ExportSummary {
        blocks: total,
        written,
    })
}
