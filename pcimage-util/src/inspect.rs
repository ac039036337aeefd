use pcimage::header::Descriptor;
use pcimage::{BitmapStats, Image, OpenOptions};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use snafu::{OptionExt, ResultExt, Snafu};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors that prevent an image from being inspected at all.
#[derive(Debug, Snafu)]
pub enum InspectError {
    #[snafu(display("cannot open {}: {source}", path.display()))]
    OpenFailed {
        path: PathBuf,
        source: pcimage::Error,
    },

    #[snafu(display("cannot verify {}: {source}", path.display()))]
    VerifyFailed {
        path: PathBuf,
        source: pcimage::Error,
    },

    #[snafu(display("cannot get size of {}: {source}", path.display()))]
    MetadataFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{} has no descriptor after verify", path.display()))]
    NoDescriptor { path: PathBuf },
}

/// An inconsistency found in a readable image.
#[derive(Debug)]
pub enum Problem {
    /// The header's used-block count disagrees with the bitmap.
    StaleUsedCount { recorded: u64, scanned: u64 },

    /// Legacy bitmap entries that are neither 0 nor 1.
    AnomalousBitmap { count: u64 },

    /// The file ends before the last record.
    Truncated { missing: u64 },

    /// Bytes follow the last record.
    TrailingData { bytes: u64 },

    ReadFailed { block: u64, source: pcimage::Error },
}

impl Display for Problem {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::StaleUsedCount { recorded, scanned } => write!(
                f,
                "header records {recorded} used blocks, bitmap has {scanned}"
            ),
            Self::AnomalousBitmap { count } => {
                write!(f, "{count} bitmap entries are neither 0 nor 1")
            }
            Self::Truncated { missing } => {
                write!(f, "file is {missing} bytes short of the last record")
            }
            Self::TrailingData { bytes } => {
                write!(f, "{bytes} bytes follow the last record")
            }
            Self::ReadFailed { block, source } => {
                write!(f, "cannot read block #{block}: {source}")
            }
        }
    }
}

/// Consistency report for one image.
#[derive(Debug)]
pub struct Report {
    pub path: PathBuf,
    /// Descriptor after verify, with repaired fields.
    pub descriptor: Descriptor,
    pub stats: BitmapStats,
    pub file_size: u64,
    pub data_offset: u64,
    pub record_size: u64,
    /// Whole records between the data start and the end of the file.
    pub records: u64,
    /// Bytes after the last whole record.
    pub partial: u64,
    pub problems: Vec<Problem>,
}

impl Report {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Verifies `path` and checks its records against the bitmap.
///
/// Block 0 and the last used block are read to exercise both ends of the data
/// area.
pub fn inspect(path: &Path) -> Result<Report, InspectError> {
    let mut problems = Vec::new();

    // Strict first, so a stale used count shows up as a problem.
    let mut image = OpenOptions::new()
        .strict_headers(true)
        .open(path)
        .context(OpenFailedSnafu { path })?;

    match image.verify() {
        Ok(()) => {}
        Err(pcimage::Error::UsedBlockCount { recorded, scanned }) => {
            problems.push(Problem::StaleUsedCount { recorded, scanned });

            image = OpenOptions::new()
                .open(path)
                .context(OpenFailedSnafu { path })?;
            image.verify().context(VerifyFailedSnafu { path })?;
        }
        Err(e) => return Err(e).context(VerifyFailedSnafu { path }),
    }

    let descriptor = image
        .descriptor()
        .cloned()
        .context(NoDescriptorSnafu { path })?;
    let stats = image
        .bitmap_stats()
        .cloned()
        .context(NoDescriptorSnafu { path })?;
    let data_offset = image.data_offset().context(NoDescriptorSnafu { path })?;
    let record_size = image.record_size().context(NoDescriptorSnafu { path })?;
    let file_size = std::fs::metadata(path)
        .context(MetadataFailedSnafu { path })?
        .len();

    if stats.anomalous > 0 {
        problems.push(Problem::AnomalousBitmap {
            count: stats.anomalous,
        });
    }

    let area = file_size.saturating_sub(data_offset);
    let (records, partial) = match record_size {
        0 => (0, area),
        size => (area / size, area % size),
    };
    let end = data_offset + stats.used * record_size;

    if end > file_size {
        problems.push(Problem::Truncated {
            missing: end - file_size,
        });
    } else if end < file_size {
        problems.push(Problem::TrailingData {
            bytes: file_size - end,
        });
    }

    let mut probes = vec![0];

    if let Some(last) = stats.last_used.filter(|&b| b != 0) {
        probes.push(last);
    }

    for block in probes {
        if let Err(source) = read_one(&mut image, block) {
            problems.push(Problem::ReadFailed { block, source });
        }
    }

    debug!(path = %path.display(), problems = problems.len(), "image inspected");

    Ok(Report {
        path: path.to_path_buf(),
        descriptor,
        stats,
        file_size,
        data_offset,
        record_size,
        records,
        partial,
        problems,
    })
}

fn read_one(image: &mut Image, block: u64) -> Result<(), pcimage::Error> {
    let mut buf = vec![0u8; image.block_size().unwrap_or_default() as usize];

    image.seek(block)?;
    image.read_blocks(&mut buf)
}

/// Inspects every image in parallel. Results are in the order of `paths`.
pub fn inspect_all(paths: &[PathBuf]) -> Vec<Result<Report, InspectError>> {
    paths.par_iter().map(|path| inspect(path)).collect()
}
