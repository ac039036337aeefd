//! Unformatted images: the file is the block device.

use crate::changefile::ChangeFile;
use crate::overlay::{Lookup, Overlay, default_overlay_path};
use crate::source::{FileSource, ImageSource};
use crate::{
    BufferSizeSnafu, Error, InvalidStateSnafu, OpenImageSnafu, OpenMode, OpenOptions,
    OutOfRangeSnafu, OverlaySnafu, ReadBlockSnafu, Readiness,
};
use snafu::{ResultExt, ensure};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Block size of raw images up to [`LARGE_IMAGE_THRESHOLD`] bytes.
pub const SMALL_BLOCK_SIZE: u32 = 512;

/// Block size of raw images larger than [`LARGE_IMAGE_THRESHOLD`] bytes.
pub const LARGE_BLOCK_SIZE: u32 = 4096;

pub const LARGE_IMAGE_THRESHOLD: u64 = 100_000_000_000;

/// A raw image with the same block surface as [`Image`](crate::Image).
///
/// Every block within the file is reported as used. Trailing bytes that do not
/// fill a whole block are not addressable.
pub struct RawImage<O: Overlay = ChangeFile> {
    source: Box<dyn ImageSource>,
    path: PathBuf,
    mode: OpenMode,
    verified: bool,
    read_only: bool,
    block_size: u32,
    total_blocks: u64,
    overlay_path: Option<PathBuf>,
    overlay: Option<O>,
    cursor: u64,
}

impl<O: Overlay> std::fmt::Debug for RawImage<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImage")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("verified", &self.verified)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl RawImage {
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self, Error> {
        Self::open_with(path, options)
    }
}

impl<O: Overlay> RawImage<O> {
    pub fn open_with(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self, Error> {
        let path = path.as_ref();
        let source = FileSource::open(path).context(OpenImageSnafu { path })?;

        Self::from_source(Box::new(source), path.to_path_buf(), options)
    }

    pub fn from_source(
        source: Box<dyn ImageSource>,
        path: PathBuf,
        options: &OpenOptions,
    ) -> Result<Self, Error> {
        let len = source.len().context(OpenImageSnafu { path: &path })?;
        let block_size = if len > LARGE_IMAGE_THRESHOLD {
            LARGE_BLOCK_SIZE
        } else {
            SMALL_BLOCK_SIZE
        };

        debug!(path = %path.display(), len, block_size, "raw image opened");

        Ok(Self {
            source,
            path,
            mode: options.get_mode(),
            verified: false,
            read_only: false,
            block_size,
            total_blocks: len / block_size as u64,
            overlay_path: options.get_overlay().map(Path::to_path_buf),
            overlay: None,
            cursor: 0,
        })
    }

    /// Attaches the overlay according to the open mode.
    pub fn verify(&mut self) -> Result<(), Error> {
        ensure!(
            !self.verified,
            InvalidStateSnafu {
                required: Readiness::Open
            }
        );

        match self.mode {
            OpenMode::ReadOnly => self.read_only = true,
            OpenMode::ReadWrite => {
                if let Some(path) = &self.overlay_path {
                    match O::init(path, self.block_size, self.total_blocks) {
                        Ok(mut overlay) => {
                            overlay.verify().context(OverlaySnafu)?;
                            self.overlay = Some(overlay);
                        }
                        Err(e) => warn!(
                            path = %path.display(),
                            error = %e,
                            "cannot open overlay; it will be created on the first write"
                        ),
                    }
                }
            }
            OpenMode::Create => self.attach_overlay()?,
        }

        self.verified = true;
        Ok(())
    }

    fn attach_overlay(&mut self) -> Result<(), Error> {
        let path = self
            .overlay_path
            .get_or_insert_with(|| default_overlay_path(&self.path));
        let mut overlay =
            O::create(path, self.block_size, self.total_blocks).context(OverlaySnafu)?;

        overlay.verify().context(OverlaySnafu)?;

        debug!(path = %path.display(), "overlay created for writing");

        self.overlay = Some(overlay);
        Ok(())
    }

    fn require(&self, required: Readiness) -> Result<(), Error> {
        let ready = match required {
            Readiness::Open => !self.verified,
            Readiness::Verified | Readiness::ReadReady => self.verified,
            Readiness::Writable => self.verified && !self.read_only,
            Readiness::WriteReady => self.verified && !self.read_only && self.overlay.is_some(),
        };

        ensure!(ready, InvalidStateSnafu { required });
        Ok(())
    }

    #[must_use]
    pub fn block_size(&self) -> Option<u32> {
        self.verified.then_some(self.block_size)
    }

    #[must_use]
    pub fn block_count(&self) -> Option<u64> {
        self.verified.then_some(self.total_blocks)
    }

    pub fn seek(&mut self, block: u64) -> Result<(), Error> {
        self.require(Readiness::ReadReady)?;

        let total = self.total_blocks;

        ensure!(block <= total, OutOfRangeSnafu { block, total });

        if let Some(overlay) = &mut self.overlay {
            overlay.seek(block).context(OverlaySnafu)?;
        }

        self.cursor = block;
        Ok(())
    }

    #[must_use]
    pub fn tell(&self) -> Option<u64> {
        self.verified.then_some(self.cursor)
    }

    fn check_buffer(&self, len: usize) -> Result<(), Error> {
        ensure!(
            len % self.block_size as usize == 0,
            BufferSizeSnafu {
                len,
                block_size: self.block_size
            }
        );
        Ok(())
    }

    fn check_cursor(&self) -> Result<(), Error> {
        ensure!(
            self.cursor < self.total_blocks,
            OutOfRangeSnafu {
                block: self.cursor,
                total: self.total_blocks
            }
        );
        Ok(())
    }

    /// Reads whole blocks at the cursor, preferring overlay copies.
    pub fn read_blocks(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.require(Readiness::ReadReady)?;
        self.check_buffer(buf.len())?;

        let block_size = self.block_size as usize;

        for chunk in buf.chunks_exact_mut(block_size) {
            self.check_cursor()?;

            let block = self.cursor;
            let found = match &mut self.overlay {
                Some(overlay) => {
                    overlay.seek(block).context(OverlaySnafu)?;
                    overlay.read_block(chunk).context(OverlaySnafu)? == Lookup::Found
                }
                None => false,
            };

            if !found {
                self.source
                    .read_exact_at(block * block_size as u64, chunk)
                    .context(ReadBlockSnafu { block })?;
            }

            self.cursor += 1;
        }

        Ok(())
    }

    /// Every block inside the file is used.
    pub fn is_block_used(&mut self) -> Result<bool, Error> {
        self.require(Readiness::ReadReady)?;
        self.check_cursor()?;

        Ok(true)
    }

    pub fn write_blocks(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.require(Readiness::Writable)?;
        self.check_buffer(buf.len())?;

        if self.overlay.is_none() {
            self.attach_overlay()?;
        }

        for chunk in buf.chunks_exact(self.block_size as usize) {
            self.check_cursor()?;

            let block = self.cursor;
            let Some(overlay) = &mut self.overlay else {
                return InvalidStateSnafu {
                    required: Readiness::WriteReady,
                }
                .fail();
            };

            overlay.seek(block).context(OverlaySnafu)?;
            overlay.write_block(chunk).context(OverlaySnafu)?;

            self.cursor += 1;
        }

        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), Error> {
        self.require(Readiness::WriteReady)?;

        match &mut self.overlay {
            Some(overlay) => overlay.sync().context(OverlaySnafu),
            None => InvalidStateSnafu {
                required: Readiness::WriteReady,
            }
            .fail(),
        }
    }

    pub fn close(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        match self.overlay.take() {
            Some(overlay) => overlay.finish().context(OverlaySnafu),
            None => Ok(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn overlay_path(&self) -> Option<&Path> {
        self.overlay_path.as_deref()
    }
}

impl<O: Overlay> Drop for RawImage<O> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), error = %e, "cannot release raw image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(len: usize, options: &OpenOptions) -> RawImage {
        let data: Vec<u8> = (0..len).map(|i| (i / 512) as u8).collect();

        RawImage::from_source(Box::new(data), PathBuf::from("mem.raw"), options).unwrap()
    }

    #[test]
    fn geometry_follows_file_size() {
        let mut image = raw(512 * 3 + 100, &OpenOptions::new());

        assert_eq!(image.block_size(), None);
        image.verify().unwrap();
        assert_eq!(image.block_size(), Some(512));
        assert_eq!(image.block_count(), Some(3));
    }

    #[test]
    fn reads_blocks_in_place() {
        let mut image = raw(512 * 4, &OpenOptions::new());
        let mut buf = vec![0u8; 1024];

        image.verify().unwrap();
        image.seek(2).unwrap();
        assert!(image.is_block_used().unwrap());
        image.read_blocks(&mut buf).unwrap();

        assert!(buf[..512].iter().all(|&b| b == 2));
        assert!(buf[512..].iter().all(|&b| b == 3));
        assert_eq!(image.tell(), Some(4));
        assert_eq!(
            image.read_blocks(&mut buf).unwrap_err().kind(),
            crate::ErrorKind::InvalidState
        );
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut image = raw(512 * 2, &OpenOptions::new());

        image.verify().unwrap();
        assert_eq!(
            image.write_blocks(&[0; 512]).unwrap_err().kind(),
            crate::ErrorKind::InvalidState
        );
    }

    #[test]
    fn writes_land_in_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = OpenOptions::new();

        options
            .mode(OpenMode::ReadWrite)
            .overlay(dir.path().join("mem.raw.cf"));

        let mut image = raw(512 * 4, &options);
        let mut buf = [0u8; 512];

        image.verify().unwrap();
        image.seek(1).unwrap();
        image.write_blocks(&[0xEE; 512]).unwrap();
        image.sync().unwrap();

        image.seek(1).unwrap();
        image.read_blocks(&mut buf).unwrap();
        assert_eq!(buf, [0xEE; 512]);

        image.read_blocks(&mut buf).unwrap();
        assert_eq!(buf, [2; 512]);

        image.close().unwrap();
    }
}
