mod common;

use common::{Checksum, Current, Legacy, payload, write_image};
use pcimage::overlay::{Lookup, Overlay, OverlayError};
use pcimage::{ChangeFile, ErrorKind, Image, OpenMode, OpenOptions, UNUSED_BLOCK_FILL};
use std::collections::HashMap;
use std::io;
use std::path::Path;

/// In-memory overlay. Paths named `broken` fail every read.
struct MemOverlay {
    block_size: usize,
    total: u64,
    blocks: HashMap<u64, Vec<u8>>,
    cursor: u64,
    broken: bool,
}

impl MemOverlay {
    fn new(path: &Path, block_size: u32, total: u64) -> Self {
        Self {
            block_size: block_size as usize,
            total,
            blocks: HashMap::new(),
            cursor: 0,
            broken: path.file_name().is_some_and(|n| n == "broken"),
        }
    }
}

impl Overlay for MemOverlay {
    fn init(path: &Path, _block_size: u32, _total: u64) -> Result<Self, OverlayError> {
        Err(OverlayError::Open {
            path: path.to_path_buf(),
            source: io::ErrorKind::NotFound.into(),
        })
    }

    fn create(path: &Path, block_size: u32, total: u64) -> Result<Self, OverlayError> {
        Ok(Self::new(path, block_size, total))
    }

    fn verify(&mut self) -> Result<(), OverlayError> {
        Ok(())
    }

    fn seek(&mut self, block: u64) -> Result<(), OverlayError> {
        if block > self.total {
            return Err(OverlayError::OutOfRange { block });
        }

        self.cursor = block;
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<Lookup, OverlayError> {
        if self.broken {
            return Err(OverlayError::Io {
                source: io::Error::other("broken overlay"),
            });
        }

        let lookup = match self.blocks.get(&self.cursor) {
            Some(data) => {
                buf.copy_from_slice(data);
                Lookup::Found
            }
            None => Lookup::NotPresent,
        };

        self.cursor += 1;
        Ok(lookup)
    }

    fn write_block(&mut self, buf: &[u8]) -> Result<(), OverlayError> {
        assert_eq!(buf.len(), self.block_size);

        self.blocks.insert(self.cursor, buf.to_vec());
        self.cursor += 1;
        Ok(())
    }

    fn block_used(&self) -> bool {
        self.blocks.contains_key(&self.cursor)
    }

    fn sync(&mut self) -> Result<(), OverlayError> {
        Ok(())
    }

    fn finish(self) -> Result<(), OverlayError> {
        Ok(())
    }
}

#[test]
fn first_write_synthesizes_overlay_path() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = Legacy::new(512, &[1, 0, 1, 1]);
    let path = write_image(dir.path(), "sda1.img", &legacy.build());
    let mut image = Image::open(&path, None, OpenMode::ReadWrite).unwrap();

    image.verify().unwrap();
    assert_eq!(image.overlay_path(), None);

    image.write_blocks(&[0xAB; 512]).unwrap();
    assert_eq!(image.tell(), Some(1));

    let overlay = dir.path().join("sda1.img.cf");

    assert_eq!(image.overlay_path(), Some(overlay.as_path()));
    assert!(overlay.exists());

    let mut buf = [0u8; 512];

    image.seek(0).unwrap();
    image.read_blocks(&mut buf).unwrap();
    assert_eq!(buf, [0xAB; 512]);

    image.sync().unwrap();
    image.close().unwrap();

    // The base image is untouched.
    assert_eq!(std::fs::read(&path).unwrap(), legacy.build());
}

#[test]
fn overlay_persists_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = [true, false, true];
    let current = Current::new(1024, &pattern, Checksum::Crc32);
    let path = write_image(dir.path(), "sdb.img", &current.build());
    let overlay = dir.path().join("changes.cf");

    let mut image = Image::open(&path, Some(overlay.as_path()), OpenMode::Create).unwrap();
    image.verify().unwrap();
    assert!(overlay.exists());

    image.seek(1).unwrap();
    image.write_blocks(&[0x11; 1024]).unwrap();
    image.close().unwrap();

    let mut image = Image::open(&path, Some(overlay.as_path()), OpenMode::ReadWrite).unwrap();
    image.verify().unwrap();
    assert_eq!(image.overlay().unwrap().stored_blocks(), 1);

    let mut buf = vec![0u8; 3 * 1024];
    image.read_blocks(&mut buf).unwrap();

    assert_eq!(&buf[..1024], payload(0, 1024).as_slice());
    assert!(buf[1024..2048].iter().all(|&b| b == 0x11));
    assert_eq!(&buf[2048..], payload(2, 1024).as_slice());
}

#[test]
fn overlay_block_is_reported_used() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "sda1.img", &Legacy::new(512, &[1, 0, 1]).build());
    let mut image = Image::open(&path, None, OpenMode::ReadWrite).unwrap();

    image.verify().unwrap();
    image.seek(1).unwrap();
    assert!(!image.is_block_used().unwrap());

    image.write_blocks(&[0; 512]).unwrap();
    image.seek(1).unwrap();
    assert!(image.is_block_used().unwrap());
}

#[test]
fn missing_overlay_in_read_write_mode_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "sda1.img", &Legacy::new(512, &[1, 1]).build());
    let overlay = dir.path().join("missing").join("sda1.cf");
    let mut image = Image::open(&path, Some(overlay.as_path()), OpenMode::ReadWrite).unwrap();

    image.verify().unwrap();
    assert!(image.overlay().is_none());

    // Creation is attempted on the first write, where it fails.
    assert_eq!(
        image.write_blocks(&[0; 512]).unwrap_err().kind(),
        ErrorKind::Io
    );
}

#[test]
fn create_mode_surfaces_overlay_failures() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "sda1.img", &Legacy::new(512, &[1, 1]).build());
    let overlay = dir.path().join("missing").join("sda1.cf");
    let mut image = Image::open(&path, Some(overlay.as_path()), OpenMode::Create).unwrap();

    assert_eq!(image.verify().unwrap_err().kind(), ErrorKind::Io);
    image.close().unwrap();
}

#[test]
fn overlay_of_other_geometry_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "sda1.img", &Legacy::new(512, &[1, 1]).build());
    let overlay = dir.path().join("other.cf");

    ChangeFile::create(&overlay, 4096, 2).unwrap().finish().unwrap();

    let mut image = Image::open(&path, Some(overlay.as_path()), OpenMode::Create).unwrap();

    assert_eq!(image.verify().unwrap_err().kind(), ErrorKind::Integrity);
}

#[test]
fn overlay_hits_keep_records_aligned() {
    let pattern = [1u8, 1, 0, 1, 1];
    let legacy = Legacy::new(512, &pattern);
    let mut options = OpenOptions::new();

    options.mode(OpenMode::Create).overlay("mem");

    let mut image: Image<MemOverlay> = options.open_source(legacy.build(), "mem.img");
    image.verify().unwrap();

    // Override a used block and an unused one.
    image.seek(1).unwrap();
    image.write_blocks(&[0xC1; 1024]).unwrap();

    image.seek(0).unwrap();

    let mut buf = vec![0u8; 5 * 512];
    image.read_blocks(&mut buf).unwrap();

    assert_eq!(&buf[..512], payload(0, 512).as_slice());
    assert!(buf[512..1536].iter().all(|&b| b == 0xC1));
    assert_eq!(&buf[1536..2048], payload(3, 512).as_slice());
    assert_eq!(&buf[2048..], payload(4, 512).as_slice());
}

#[test]
fn absent_overlay_blocks_fall_through() {
    let pattern = [true, false, true];
    let current = Current::new(512, &pattern, Checksum::Crc32);
    let mut options = OpenOptions::new();

    options.mode(OpenMode::Create).overlay("mem");

    let mut image: Image<MemOverlay> = options.open_source(current.build(), "mem.img");
    let mut buf = vec![0u8; 3 * 512];

    image.verify().unwrap();
    image.read_blocks(&mut buf).unwrap();

    assert_eq!(&buf[..512], payload(0, 512).as_slice());
    assert!(buf[512..1024].iter().all(|&b| b == UNUSED_BLOCK_FILL));
    assert_eq!(&buf[1024..], payload(2, 512).as_slice());
}

#[test]
fn overlay_errors_are_fatal_for_the_read() {
    let mut options = OpenOptions::new();

    options.mode(OpenMode::Create).overlay("broken");

    let mut image: Image<MemOverlay> =
        options.open_source(Legacy::new(512, &[1, 1]).build(), "mem.img");
    let mut buf = [0u8; 512];

    image.verify().unwrap();

    let err = image.read_blocks(&mut buf).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(matches!(err, pcimage::Error::Overlay { .. }));
    assert_eq!(image.tell(), Some(0));
}
