//! The boundary between the block engine and a copy-on-write overlay store.
//!
//! An overlay holds blocks changed after the image was captured. The engine
//! asks it first on every read and sends every write to it, so the base image
//! is never modified.

use snafu::Snafu;
use std::path::{Path, PathBuf};

/// Errors reported by an overlay store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum OverlayError {
    #[snafu(display("cannot open overlay {}", path.display()))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("overlay i/o failed"))]
    Io { source: std::io::Error },

    #[snafu(display("overlay {} has an invalid header", path.display()))]
    InvalidHeader { path: PathBuf },

    #[snafu(display(
        "overlay geometry {block_size}x{total_blocks} does not match image {expected_block_size}x{expected_total_blocks}"
    ))]
    GeometryMismatch {
        block_size: u32,
        total_blocks: u64,
        expected_block_size: u32,
        expected_total_blocks: u64,
    },

    #[snafu(display("overlay is truncated ({len} of {expected} bytes)"))]
    Truncated { len: u64, expected: u64 },

    #[snafu(display("block #{block} is out of range"))]
    OutOfRange { block: u64 },

    #[snafu(display("buffer of {len} bytes does not hold a {block_size}-byte block"))]
    BufferSize { len: usize, block_size: u32 },
}

/// Result of asking an overlay for a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum Lookup {
    /// The overlay filled the buffer.
    Found,
    /// The overlay holds no copy of the block; read the base image instead.
    NotPresent,
}

/// A block-keyed side store intercepting reads and writes.
///
/// An overlay keeps its own cursor, positioned with [`seek()`](Self::seek).
pub trait Overlay: Sized + Send {
    /// Opens an existing overlay for an image with the given geometry.
    fn init(path: &Path, block_size: u32, total_blocks: u64) -> Result<Self, OverlayError>;

    /// Opens a compatible existing overlay or creates a fresh one.
    fn create(path: &Path, block_size: u32, total_blocks: u64) -> Result<Self, OverlayError>;

    /// Checks the overlay is internally consistent.
    fn verify(&mut self) -> Result<(), OverlayError>;

    fn seek(&mut self, block: u64) -> Result<(), OverlayError>;

    /// Reads the block at the cursor into `buf` if the overlay has it.
    fn read_block(&mut self, buf: &mut [u8]) -> Result<Lookup, OverlayError>;

    /// Stores `buf` as the block at the cursor.
    fn write_block(&mut self, buf: &[u8]) -> Result<(), OverlayError>;

    /// Whether the overlay holds the block at the cursor.
    fn block_used(&self) -> bool;

    fn sync(&mut self) -> Result<(), OverlayError>;

    /// Flushes and releases the overlay.
    fn finish(self) -> Result<(), OverlayError>;
}

/// Suffix appended to the image path when no overlay path is configured.
pub const OVERLAY_SUFFIX: &str = ".cf";

/// Derives the default overlay path for `image`.
#[must_use]
pub fn default_overlay_path(image: &Path) -> PathBuf {
    let mut path = image.as_os_str().to_owned();
    path.push(OVERLAY_SUFFIX);
    PathBuf::from(path)
}
