use crate::overlay::Overlay;
use crate::raw::RawImage;
use crate::{Error, ErrorKind, Image, OpenOptions};
use std::fmt::{Display, Formatter};
use std::path::Path;
use tracing::debug;

/// Block access shared by every image type.
///
/// See [`Image`] for the meaning of each operation.
pub trait BlockImage: Send {
    /// Short name of the image type.
    fn type_name(&self) -> &'static str;

    fn verify(&mut self) -> Result<(), Error>;

    fn block_size(&self) -> Option<u32>;

    fn block_count(&self) -> Option<u64>;

    fn seek(&mut self, block: u64) -> Result<(), Error>;

    fn tell(&self) -> Option<u64>;

    fn read_blocks(&mut self, buf: &mut [u8]) -> Result<(), Error>;

    fn is_block_used(&mut self) -> Result<bool, Error>;

    fn write_blocks(&mut self, buf: &[u8]) -> Result<(), Error>;

    fn sync(&mut self) -> Result<(), Error>;

    fn close(self: Box<Self>) -> Result<(), Error>;
}

impl<O: Overlay> BlockImage for Image<O> {
    fn type_name(&self) -> &'static str {
        "partclone"
    }

    fn verify(&mut self) -> Result<(), Error> {
        Image::verify(self)
    }

    fn block_size(&self) -> Option<u32> {
        Image::block_size(self)
    }

    fn block_count(&self) -> Option<u64> {
        Image::block_count(self)
    }

    fn seek(&mut self, block: u64) -> Result<(), Error> {
        Image::seek(self, block)
    }

    fn tell(&self) -> Option<u64> {
        Image::tell(self)
    }

    fn read_blocks(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        Image::read_blocks(self, buf)
    }

    fn is_block_used(&mut self) -> Result<bool, Error> {
        Image::is_block_used(self)
    }

    fn write_blocks(&mut self, buf: &[u8]) -> Result<(), Error> {
        Image::write_blocks(self, buf)
    }

    fn sync(&mut self) -> Result<(), Error> {
        Image::sync(self)
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        Image::close(*self)
    }
}

impl<O: Overlay> BlockImage for RawImage<O> {
    fn type_name(&self) -> &'static str {
        "raw"
    }

    fn verify(&mut self) -> Result<(), Error> {
        RawImage::verify(self)
    }

    fn block_size(&self) -> Option<u32> {
        RawImage::block_size(self)
    }

    fn block_count(&self) -> Option<u64> {
        RawImage::block_count(self)
    }

    fn seek(&mut self, block: u64) -> Result<(), Error> {
        RawImage::seek(self, block)
    }

    fn tell(&self) -> Option<u64> {
        RawImage::tell(self)
    }

    fn read_blocks(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        RawImage::read_blocks(self, buf)
    }

    fn is_block_used(&mut self) -> Result<bool, Error> {
        RawImage::is_block_used(self)
    }

    fn write_blocks(&mut self, buf: &[u8]) -> Result<(), Error> {
        RawImage::write_blocks(self, buf)
    }

    fn sync(&mut self) -> Result<(), Error> {
        RawImage::sync(self)
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        RawImage::close(*self)
    }
}

/// Image types recognized by [`probe_any()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageType {
    Partclone,
    Raw,
}

impl Display for ImageType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Partclone => "partclone",
            Self::Raw => "raw",
        })
    }
}

/// Opens and verifies `path` as a partclone image, or as a raw image if it is
/// not one.
///
/// Any other failure of the partclone reader is returned as is.
pub fn open_any(
    path: impl AsRef<Path>,
    options: &OpenOptions,
) -> Result<Box<dyn BlockImage>, Error> {
    let path = path.as_ref();
    let mut image = options.open(path)?;

    match image.verify() {
        Ok(()) => return Ok(Box::new(image)),
        Err(e) if e.kind() == ErrorKind::FormatMismatch => {
            debug!(path = %path.display(), error = %e, "not a partclone image, trying raw");
        }
        Err(e) => return Err(e),
    }

    drop(image);

    let mut raw = RawImage::open(path, options)?;

    raw.verify()?;

    Ok(Box::new(raw))
}

/// Reports which image type recognizes `path`.
///
/// Every readable file is at least a raw image; a damaged partclone image is
/// reported as an error.
pub fn probe_any(path: impl AsRef<Path>) -> Result<ImageType, Error> {
    match crate::probe(path) {
        Ok(()) => Ok(ImageType::Partclone),
        Err(e) if e.kind() == ErrorKind::FormatMismatch => Ok(ImageType::Raw),
        Err(e) => Err(e),
    }
}
