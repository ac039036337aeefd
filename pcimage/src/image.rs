use crate::backend::{self, Backend, BitmapStats};
use crate::changefile::ChangeFile;
use crate::header::{self, Descriptor, HEAD_SIZE, Version};
use crate::overlay::{Overlay, default_overlay_path};
use crate::source::ImageSource;
use crate::{
    AllocateSnafu, BufferSizeSnafu, Error, InvalidStateSnafu, OpenMode, OpenOptions, OverlaySnafu,
    OutOfRangeSnafu, ParseDescriptorSnafu, ReadDescriptorSnafu, Readiness, UNUSED_BLOCK_FILL,
    UnsupportedVersionSnafu,
};
use snafu::{OptionExt, ResultExt, ensure};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Protocol state of a handle. Each step of [`Image::verify()`] advances it by
/// one; a failed step leaves it where it was.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Open,
    HeaderValid,
    VersionSelected,
    Initialized,
    Verified,
}

/// A handle on a partclone image.
///
/// The handle is opened with [`Image::open()`] or [`OpenOptions`], must be
/// [verified](Self::verify) before any block access, and is released by
/// [`close()`](Self::close) or on drop. A handle that failed partway through
/// verification can always be closed.
///
/// The cursor is shared by reads and writes: both start at [`tell()`](Self::tell)
/// and advance by one block per block transferred.
pub struct Image<O: Overlay = ChangeFile> {
    source: Box<dyn ImageSource>,
    path: PathBuf,
    options: OpenOptions,
    state: State,
    read_only: bool,
    descriptor: Option<Descriptor>,
    backend: Option<Backend>,
    filler: Option<Vec<u8>>,
    overlay_path: Option<PathBuf>,
    overlay: Option<O>,
    overlay_verified: bool,
    cursor: u64,
}

impl<O: Overlay> std::fmt::Debug for Image<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("read_only", &self.read_only)
            .field("overlay_path", &self.overlay_path)
            .field("has_overlay", &self.overlay.is_some())
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Opens the image at `path`.
    ///
    /// Only the file is opened; call [`verify()`](Self::verify) before use.
    pub fn open(
        path: impl AsRef<Path>,
        overlay: Option<&Path>,
        mode: OpenMode,
    ) -> Result<Self, Error> {
        let mut options = OpenOptions::new();

        options.mode(mode);

        if let Some(overlay) = overlay {
            options.overlay(overlay);
        }

        options.open(path)
    }
}

impl<O: Overlay> Image<O> {
    pub(crate) fn from_parts(
        source: Box<dyn ImageSource>,
        path: PathBuf,
        options: OpenOptions,
    ) -> Self {
        debug!(path = %path.display(), mode = ?options.get_mode(), "image opened");

        Self {
            source,
            overlay_path: options.get_overlay().map(Path::to_path_buf),
            path,
            options,
            state: State::Open,
            read_only: false,
            descriptor: None,
            backend: None,
            filler: None,
            overlay: None,
            overlay_verified: false,
            cursor: 0,
        }
    }

    /// Validates the descriptor and loads the bitmap.
    ///
    /// Only a freshly opened handle can be verified. On failure the handle stays
    /// unusable but can still be closed.
    pub fn verify(&mut self) -> Result<(), Error> {
        ensure!(
            self.state == State::Open,
            InvalidStateSnafu {
                required: Readiness::Open
            }
        );

        let version = read_version(&*self.source)?;
        self.state = State::HeaderValid;

        let format = backend::select(version).context(UnsupportedVersionSnafu { version })?;
        self.state = State::VersionSelected;

        debug!(%version, ?format, "image version selected");

        let (backend, desc) = Backend::init(format, &*self.source, self.options.index_factor)?;
        let block_size = desc.fs.block_size;
        let total_blocks = desc.fs.total_blocks;

        self.backend = Some(backend);
        self.descriptor = Some(desc);
        self.state = State::Initialized;

        self.init_overlay(block_size, total_blocks)?;

        if let (Some(backend), Some(desc)) = (&mut self.backend, &mut self.descriptor) {
            backend.verify(&*self.source, desc, self.options.strict_headers)?;
        }

        if let Some(overlay) = &mut self.overlay {
            overlay.verify().context(OverlaySnafu)?;
            self.overlay_verified = true;
        }

        let mut filler = Vec::new();

        filler
            .try_reserve_exact(block_size as usize)
            .context(AllocateSnafu {
                what: "unused block filler",
            })?;
        filler.resize(block_size as usize, UNUSED_BLOCK_FILL);

        self.filler = Some(filler);
        self.cursor = 0;
        self.state = State::Verified;

        debug!(path = %self.path.display(), block_size, total_blocks, "image verified");

        Ok(())
    }

    fn init_overlay(&mut self, block_size: u32, total_blocks: u64) -> Result<(), Error> {
        match self.options.get_mode() {
            OpenMode::ReadOnly => self.read_only = true,
            OpenMode::ReadWrite => {
                let Some(path) = &self.overlay_path else {
                    return Ok(());
                };

                match O::init(path, block_size, total_blocks) {
                    Ok(overlay) => {
                        debug!(path = %path.display(), "overlay opened");
                        self.overlay = Some(overlay);
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "cannot open overlay; it will be created on the first write"
                        );
                    }
                }
            }
            OpenMode::Create => {
                let path = self
                    .overlay_path
                    .get_or_insert_with(|| default_overlay_path(&self.path));
                let overlay = O::create(path, block_size, total_blocks).context(OverlaySnafu)?;

                debug!(path = %path.display(), "overlay opened for writing");
                self.overlay = Some(overlay);
            }
        }

        Ok(())
    }

    fn is_verified(&self) -> bool {
        self.state == State::Verified
    }

    fn is_read_ready(&self) -> bool {
        self.is_verified() && self.backend.is_some() && self.filler.is_some()
    }

    fn is_writable(&self) -> bool {
        !self.read_only && self.is_read_ready()
    }

    fn is_write_ready(&self) -> bool {
        self.is_writable() && self.overlay.is_some() && self.overlay_verified
    }

    fn require(&self, required: Readiness) -> Result<(), Error> {
        let ready = match required {
            Readiness::Open => self.state == State::Open,
            Readiness::Verified => self.is_verified(),
            Readiness::ReadReady => self.is_read_ready(),
            Readiness::Writable => self.is_writable(),
            Readiness::WriteReady => self.is_write_ready(),
        };

        ensure!(ready, InvalidStateSnafu { required });
        Ok(())
    }

    /// Size of one block in bytes, once verified.
    #[must_use]
    pub fn block_size(&self) -> Option<u32> {
        self.verified_descriptor().map(|d| d.fs.block_size)
    }

    /// Number of blocks on the source device, once verified.
    #[must_use]
    pub fn block_count(&self) -> Option<u64> {
        self.verified_descriptor().map(|d| d.fs.total_blocks)
    }

    fn verified_descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref().filter(|_| self.is_verified())
    }

    /// Moves the cursor to `block`, which may equal the block count.
    pub fn seek(&mut self, block: u64) -> Result<(), Error> {
        let total = self.ready_geometry()?.1;

        ensure!(block <= total, OutOfRangeSnafu { block, total });

        if let Some(backend) = &mut self.backend {
            backend.seek(self.overlay.as_mut(), block)?;
        }

        self.cursor = block;
        Ok(())
    }

    /// Current block, or `None` before the handle is ready.
    #[must_use]
    pub fn tell(&self) -> Option<u64> {
        self.is_read_ready().then_some(self.cursor)
    }

    fn ready_geometry(&self) -> Result<(u32, u64), Error> {
        self.require(Readiness::ReadReady)?;

        let desc = self.descriptor.as_ref().context(InvalidStateSnafu {
            required: Readiness::ReadReady,
        })?;

        Ok((desc.fs.block_size, desc.fs.total_blocks))
    }

    /// Reads whole blocks starting at the cursor until `buf` is full.
    ///
    /// Stops at the first failing block without advancing past it; blocks read
    /// before it are valid in `buf`.
    pub fn read_blocks(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let (block_size, total) = self.ready_geometry()?;

        ensure!(
            buf.len() % block_size as usize == 0,
            BufferSizeSnafu {
                len: buf.len(),
                block_size
            }
        );

        let (Some(backend), Some(filler)) = (&mut self.backend, &self.filler) else {
            return InvalidStateSnafu {
                required: Readiness::ReadReady,
            }
            .fail();
        };

        for chunk in buf.chunks_exact_mut(block_size as usize) {
            ensure!(
                self.cursor < total,
                OutOfRangeSnafu {
                    block: self.cursor,
                    total
                }
            );

            backend.read_block(
                &*self.source,
                self.overlay.as_mut(),
                filler,
                self.cursor,
                chunk,
            )?;

            self.cursor += 1;
        }

        Ok(())
    }

    /// Whether the block at the cursor holds data in the image or the overlay.
    pub fn is_block_used(&mut self) -> Result<bool, Error> {
        let total = self.ready_geometry()?.1;

        ensure!(
            self.cursor < total,
            OutOfRangeSnafu {
                block: self.cursor,
                total
            }
        );

        let backend = self.backend.as_ref().context(InvalidStateSnafu {
            required: Readiness::ReadReady,
        })?;

        backend.block_used(self.overlay.as_mut(), self.cursor)
    }

    /// Writes whole blocks from `buf` to the overlay, starting at the cursor.
    ///
    /// Without an overlay one is created at the configured path, or at
    /// `<image>.cf` if none was configured.
    pub fn write_blocks(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.require(Readiness::Writable)?;

        let (block_size, total) = self.ready_geometry()?;

        ensure!(
            buf.len() % block_size as usize == 0,
            BufferSizeSnafu {
                len: buf.len(),
                block_size
            }
        );

        if !self.is_write_ready() {
            self.attach_overlay(block_size, total)?;
        }

        let (Some(backend), Some(overlay)) = (&mut self.backend, &mut self.overlay) else {
            return InvalidStateSnafu {
                required: Readiness::WriteReady,
            }
            .fail();
        };

        for chunk in buf.chunks_exact(block_size as usize) {
            ensure!(
                self.cursor < total,
                OutOfRangeSnafu {
                    block: self.cursor,
                    total
                }
            );

            backend.write_block(overlay, self.cursor, chunk)?;
            self.cursor += 1;
        }

        Ok(())
    }

    fn attach_overlay(&mut self, block_size: u32, total_blocks: u64) -> Result<(), Error> {
        let path = self
            .overlay_path
            .get_or_insert_with(|| default_overlay_path(&self.path));
        let mut overlay = O::create(path, block_size, total_blocks).context(OverlaySnafu)?;

        overlay.verify().context(OverlaySnafu)?;

        debug!(path = %path.display(), "overlay created for writing");

        self.overlay = Some(overlay);
        self.overlay_verified = true;

        Ok(())
    }

    /// Flushes the overlay. The image itself is never written.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.require(Readiness::WriteReady)?;

        match (&mut self.backend, &mut self.overlay) {
            (Some(backend), Some(overlay)) => backend.sync(overlay),
            _ => InvalidStateSnafu {
                required: Readiness::WriteReady,
            }
            .fail(),
        }
    }

    /// Releases the handle, reporting any failure to flush the overlay.
    pub fn close(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        let result = match self.overlay.take() {
            Some(overlay) => overlay.finish().context(OverlaySnafu),
            None => Ok(()),
        };

        self.overlay_verified = false;
        self.filler = None;
        self.backend = None;

        result
    }

    /// Image path given at open.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overlay path, configured or synthesized.
    pub fn overlay_path(&self) -> Option<&Path> {
        self.overlay_path.as_deref()
    }

    pub fn overlay(&self) -> Option<&O> {
        self.overlay.as_ref()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The normalized descriptor. Available once the backend has been
    /// initialized, so it can be inspected even if verification failed later.
    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    /// Bitmap scan results, once verified.
    pub fn bitmap_stats(&self) -> Option<&BitmapStats> {
        self.backend
            .as_ref()
            .filter(|_| self.is_verified())
            .map(Backend::stats)
    }

    /// Byte offset of the first block record.
    #[must_use]
    pub fn data_offset(&self) -> Option<u64> {
        self.backend.as_ref().map(|b| b.layout().data_offset())
    }

    /// Bytes occupied by each used block, payload and trailer.
    #[must_use]
    pub fn record_size(&self) -> Option<u64> {
        self.backend.as_ref().map(|b| b.layout().record_size())
    }
}

impl<O: Overlay> Drop for Image<O> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), error = %e, "cannot release image");
        }
    }
}

fn read_version(source: &dyn ImageSource) -> Result<Version, Error> {
    let mut head = [0u8; HEAD_SIZE];

    source
        .read_exact_at(0, &mut head)
        .context(ReadDescriptorSnafu)?;

    header::identify(&head).context(ParseDescriptorSnafu)
}
