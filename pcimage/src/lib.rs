//! Random-access block reading of partclone backup images.
//!
//! An image is treated as a virtual block device: seek to any block, ask whether
//! it holds data, and read it with its per-block checksum verified. Changed
//! blocks can be written to a copy-on-write [overlay](overlay::Overlay) so the
//! image itself is never modified.
//!
//! # Features
//!
//! - Legacy (`0001`) and current (`0002`) image layouts
//! - Near constant-time seeks through a sampled prefix-sum index
//! - Chained CRC32 verification, including the first-byte checksum of legacy images
//! - File-backed change-file overlay, or any custom [`Overlay`](overlay::Overlay)
//! - Raw (unformatted) images through the same [`BlockImage`] surface
//!
//! # Example
//!
//! ```no_run
//! let mut image = pcimage::Image::open("sda1.img", None, pcimage::OpenMode::ReadOnly).unwrap();
//! image.verify().unwrap();
//!
//! let block_size = image.block_size().unwrap() as usize;
//! let mut buf = vec![0u8; block_size * 4];
//!
//! image.seek(100).unwrap();
//! image.read_blocks(&mut buf).unwrap();
//! ```

use self::header::Version;
use self::overlay::OverlayError;
use snafu::{ResultExt, Snafu};
use std::collections::TryReserveError;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};

pub use self::any::{BlockImage, ImageType, open_any, probe_any};
pub use self::backend::{Anomaly, BitmapStats};
pub use self::changefile::ChangeFile;
pub use self::image::Image;
pub use self::raw::RawImage;

mod any;
mod backend;
pub mod bitmap;
pub mod changefile;
pub mod checksum;
pub mod header;
mod image;
pub mod index;
pub mod overlay;
pub mod raw;
pub mod source;

/// Byte pattern returned for blocks that hold no data.
pub const UNUSED_BLOCK_FILL: u8 = 0x45;

/// How an image handle treats writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Writes and syncs are rejected.
    #[default]
    ReadOnly,
    /// Writes go to the overlay. A configured overlay that cannot be opened is
    /// created on the first write instead.
    ReadWrite,
    /// Writes go to the overlay, which is opened or created during verify.
    Create,
}

/// The readiness an operation requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Opened but not yet verified.
    Open,
    Verified,
    ReadReady,
    Writable,
    WriteReady,
}

impl Display for Readiness {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Open => "freshly opened",
            Self::Verified => "verified",
            Self::ReadReady => "ready for reading",
            Self::Writable => "writable",
            Self::WriteReady => "ready for writing",
        })
    }
}

/// Broad class of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The handle is not in the state the operation requires.
    InvalidState,
    Io,
    /// The file is not an image of the expected kind or version.
    FormatMismatch,
    /// A checksum or magic value does not match.
    Integrity,
    Allocation,
    /// The image is recognized but uses a feature that cannot be read.
    Unsupported,
}

/// Errors for image handles.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("cannot open {}", path.display()))]
    OpenImage { path: PathBuf, source: io::Error },

    #[snafu(display("image handle is not {required}"))]
    InvalidState { required: Readiness },

    #[snafu(display("block #{block} is beyond the last block ({total} blocks)"))]
    OutOfRange { block: u64, total: u64 },

    #[snafu(display("buffer of {len} bytes is not a whole number of {block_size}-byte blocks"))]
    BufferSize { len: usize, block_size: u32 },

    #[snafu(display("cannot read image descriptor"))]
    ReadDescriptor { source: io::Error },

    #[snafu(display("cannot parse image descriptor"))]
    ParseDescriptor { source: header::ReadError },

    #[snafu(display("unsupported image version {version}"))]
    UnsupportedVersion { version: Version },

    #[snafu(display(
        "descriptor checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
    ))]
    DescriptorChecksum { stored: u32, computed: u32 },

    #[snafu(display("version {version} images with {feature} are not supported"))]
    Unsupported { version: Version, feature: String },

    #[snafu(display("cannot allocate {what}"))]
    Allocate {
        what: &'static str,
        source: TryReserveError,
    },

    #[snafu(display("cannot read bitmap"))]
    ReadBitmap { source: io::Error },

    #[snafu(display("bitmap is not followed by its trailer magic"))]
    BitmapMagic,

    #[snafu(display("header records {recorded} used blocks but the bitmap has {scanned}"))]
    UsedBlockCount { recorded: u64, scanned: u64 },

    #[snafu(display("cannot read block #{block}"))]
    ReadBlock { block: u64, source: io::Error },

    #[snafu(display(
        "checksum mismatch in block #{block} (stored {stored:#010x}, computed {computed:#010x})"
    ))]
    BlockChecksum {
        block: u64,
        stored: u32,
        computed: u32,
    },

    #[snafu(display("overlay failed"))]
    Overlay { source: OverlayError },
}

impl Error {
    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } | Self::OutOfRange { .. } | Self::BufferSize { .. } => {
                ErrorKind::InvalidState
            }
            Self::OpenImage { .. } | Self::ReadBitmap { .. } | Self::ReadBlock { .. } => {
                ErrorKind::Io
            }
            // Too short to hold a head is not an image either.
            Self::ReadDescriptor { source } if source.kind() == io::ErrorKind::UnexpectedEof => {
                ErrorKind::FormatMismatch
            }
            Self::ReadDescriptor { .. } => ErrorKind::Io,
            Self::ParseDescriptor { source } => match source {
                header::ReadError::NotPartclone => ErrorKind::FormatMismatch,
                header::ReadError::TooShort => ErrorKind::Io,
                header::ReadError::InvalidBlockSize { .. }
                | header::ReadError::InvalidBlocksPerChecksum => ErrorKind::Integrity,
            },
            Self::UnsupportedVersion { .. } => ErrorKind::FormatMismatch,
            Self::DescriptorChecksum { .. }
            | Self::BitmapMagic
            | Self::UsedBlockCount { .. }
            | Self::BlockChecksum { .. } => ErrorKind::Integrity,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Allocate { .. } => ErrorKind::Allocation,
            Self::Overlay { source } => match source {
                OverlayError::OutOfRange { .. } | OverlayError::BufferSize { .. } => {
                    ErrorKind::InvalidState
                }
                OverlayError::InvalidHeader { .. }
                | OverlayError::GeometryMismatch { .. }
                | OverlayError::Truncated { .. } => ErrorKind::Integrity,
                OverlayError::Open { .. } | OverlayError::Io { .. } => ErrorKind::Io,
            },
        }
    }
}

/// Options for opening an image, in the style of [`std::fs::OpenOptions`].
#[derive(Clone, Debug)]
pub struct OpenOptions {
    mode: OpenMode,
    overlay: Option<PathBuf>,
    strict_headers: bool,
    index_factor: u8,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    /// Read-only, lenient headers, default index factor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: OpenMode::ReadOnly,
            overlay: None,
            strict_headers: false,
            index_factor: index::DEFAULT_FACTOR,
        }
    }

    pub fn mode(&mut self, mode: OpenMode) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Sets the overlay path. Without one, `<image>.cf` is used when an overlay
    /// is needed.
    pub fn overlay(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.overlay = Some(path.into());
        self
    }

    /// Fail verification when the header's used-block count disagrees with the
    /// bitmap instead of correcting it.
    pub fn strict_headers(&mut self, strict: bool) -> &mut Self {
        self.strict_headers = strict;
        self
    }

    /// Samples the prefix-sum index every `2^factor` blocks. Values above
    /// [`index::MAX_FACTOR`] are clamped.
    pub fn index_factor(&mut self, factor: u8) -> &mut Self {
        self.index_factor = factor.min(index::MAX_FACTOR);
        self
    }

    #[must_use]
    pub fn get_mode(&self) -> OpenMode {
        self.mode
    }

    #[must_use]
    pub fn get_overlay(&self) -> Option<&Path> {
        self.overlay.as_deref()
    }

    /// Opens the image at `path` with the change-file overlay.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Image, Error> {
        self.open_with(path)
    }

    /// Opens the image at `path` with a custom overlay type.
    pub fn open_with<O: overlay::Overlay>(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Image<O>, Error> {
        let path = path.as_ref();
        let source = source::FileSource::open(path).context(OpenImageSnafu { path })?;

        Ok(self.open_source(source, path))
    }

    /// Wraps an already opened source. `path` names the image in logs and is the
    /// base of the default overlay path.
    pub fn open_source<O: overlay::Overlay>(
        &self,
        source: impl source::ImageSource + 'static,
        path: impl Into<PathBuf>,
    ) -> Image<O> {
        Image::from_parts(Box::new(source), path.into(), self.clone())
    }
}

/// Checks whether `path` is a usable image: it is opened read-only, verified
/// and closed again.
///
/// A foreign file fails on its head, before any bitmap is allocated.
pub fn probe(path: impl AsRef<Path>) -> Result<(), Error> {
    let mut image = OpenOptions::new().open(path)?;

    image.verify()?;
    image.close()
}
