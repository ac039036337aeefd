use zerocopy::byteorder::little_endian::{I32, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use std::fmt::{Display, Formatter};

use snafu::{Snafu, ensure};

/// Errors when parsing an image descriptor from bytes.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("source buffer is too short to read the descriptor"))]
    TooShort,

    #[snafu(display("not a partclone image"))]
    NotPartclone,

    #[snafu(display("invalid block size {block_size}"))]
    InvalidBlockSize { block_size: i64 },

    #[snafu(display("blocks per checksum must be at least 1"))]
    InvalidBlocksPerChecksum,
}

/// Magic string at the start of every image.
pub const IMAGE_MAGIC: &[u8; 15] = b"partclone-image";

/// Magic string following the bitmap.
pub const BITMAP_MAGIC: &[u8; 8] = b"BiTmAgIc";

/// Size of the image head shared by all versions.
pub const HEAD_SIZE: usize = 36;

/// Offset of the 4-byte version string within the head.
const VERSION_OFFSET: usize = 30;

const LEGACY_OPTIONS_SIZE: usize = 4096;

/// Size of the legacy descriptor (head, filesystem info, options).
pub const LEGACY_DESC_SIZE: usize =
    HEAD_SIZE + size_of::<LegacyFsRaw>() + LEGACY_OPTIONS_SIZE;

/// Size of the current descriptor, excluding its trailing CRC32.
pub const CURRENT_DESC_SIZE: usize =
    HEAD_SIZE + size_of::<CurrentFsRaw>() + size_of::<CurrentOptionsRaw>();

const ENDIAN_LITTLE: u16 = 0xC0DE;
const ENDIAN_BIG: u16 = 0xDEC0;

/// Legacy (0001) image head.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct LegacyHeadRaw {
    magic: [u8; 15],   // 0x00
    fs: [u8; 15],      // 0x0F
    version: [u8; 4],  // 0x1E
    padding: [u8; 2],  // 0x22
}

/// Legacy (0001) filesystem information.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct LegacyFsRaw {
    block_size: I32,   // 0x00
    device_size: U64,  // 0x04
    total_blocks: U64, // 0x0C
    used_blocks: U64,  // 0x14
}

/// Current (0002) image head.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct CurrentHeadRaw {
    magic: [u8; 16],   // 0x00
    creator: [u8; 14], // 0x10
    version: [u8; 4],  // 0x1E
    endianness: U16,   // 0x22
}

/// Current (0002) filesystem information.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct CurrentFsRaw {
    fs: [u8; 16],      // 0x00
    device_size: U64,  // 0x10
    total_blocks: U64, // 0x18
    used_blocks: U64,  // 0x20
    used_bitmap: U64,  // 0x28
    block_size: U32,   // 0x30
}

/// Current (0002) image options.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct CurrentOptionsRaw {
    feature_size: U32,        // 0x00
    image_version: U16,       // 0x04
    cpu_bits: U16,            // 0x06
    checksum_mode: U16,       // 0x08
    checksum_size: U16,       // 0x0A
    blocks_per_checksum: U32, // 0x0C
    reseed_checksum: u8,      // 0x10
    bitmap_mode: u8,          // 0x11
}

/// Four ASCII bytes identifying the on-disk layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Version([u8; 4]);

impl Version {
    pub const LEGACY: Self = Self(*b"0001");
    pub const CURRENT: Self = Self(*b"0002");

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
    Unknown(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumMode {
    None,
    Crc32,
    /// First-byte CRC32 used by every legacy image.
    Crc32Legacy,
    Unknown(u16),
}

impl ChecksumMode {
    fn from_raw(v: u16) -> Self {
        match v {
            0x00 => Self::None,
            0x20 => Self::Crc32,
            0xFF => Self::Crc32Legacy,
            v => Self::Unknown(v),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitmapMode {
    None,
    /// One bit per block.
    Bit,
    /// One byte per block.
    Byte,
    Unknown(u8),
}

impl BitmapMode {
    fn from_raw(v: u8) -> Self {
        match v {
            0x00 => Self::None,
            0x01 => Self::Bit,
            0x08 => Self::Byte,
            v => Self::Unknown(v),
        }
    }
}

/// Image head, normalized across versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Head {
    pub magic: [u8; 15],
    pub version: Version,
    /// Version of the tool that created the image; empty for legacy images.
    pub creator: String,
    pub endianness: Endianness,
}

/// Source device geometry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsInfo {
    /// Filesystem type tag, e.g. `EXTFS` or `NTFS`.
    pub fs_type: String,
    pub device_size: u64,
    pub total_blocks: u64,
    /// Used-block count recorded by the creating tool. Replaced by the bitmap
    /// count during verify unless strict headers are requested.
    pub used_blocks: u64,
    pub block_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    pub image_version: u16,
    pub cpu_bits: u16,
    pub checksum_mode: ChecksumMode,
    pub checksum_size: u16,
    pub blocks_per_checksum: u32,
    pub reseed_checksum: bool,
    pub bitmap_mode: BitmapMode,
}

/// In-memory image descriptor covering both legacy and current layouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub head: Head,
    pub fs: FsInfo,
    pub options: Options,
}

/// Checks the head magic and returns the layout version.
///
/// Only the first [`HEAD_SIZE`] bytes are inspected.
pub(crate) fn identify(data: &[u8]) -> Result<Version, ReadError> {
    ensure!(data.len() >= HEAD_SIZE, TooShortSnafu);
    ensure!(&data[..IMAGE_MAGIC.len()] == IMAGE_MAGIC, NotPartcloneSnafu);

    let mut version = [0u8; 4];
    version.copy_from_slice(&data[VERSION_OFFSET..VERSION_OFFSET + 4]);

    Ok(Version(version))
}

/// Parses a legacy descriptor from the start of `data`.
///
/// Legacy options are all zero on disk; every legacy image uses the same
/// options, which are filled in here.
pub(crate) fn parse_legacy(data: &[u8]) -> Result<Descriptor, ReadError> {
    let (head, rest) =
        LegacyHeadRaw::read_from_prefix(data).map_err(|_| TooShortSnafu.build())?;
    let (fs, _) = LegacyFsRaw::read_from_prefix(rest).map_err(|_| TooShortSnafu.build())?;

    ensure!(head.magic == *IMAGE_MAGIC, NotPartcloneSnafu);

    let block_size = fs.block_size.get();

    ensure!(
        block_size > 0,
        InvalidBlockSizeSnafu {
            block_size: block_size as i64
        }
    );

    Ok(Descriptor {
        head: Head {
            magic: head.magic,
            version: Version(head.version),
            creator: String::new(),
            endianness: Endianness::Little,
        },
        fs: FsInfo {
            fs_type: c_string(&head.fs),
            device_size: fs.device_size.get(),
            total_blocks: fs.total_blocks.get(),
            used_blocks: fs.used_blocks.get(),
            block_size: block_size as u32,
        },
        options: Options {
            image_version: 0x0001,
            cpu_bits: 0,
            checksum_mode: ChecksumMode::Crc32Legacy,
            checksum_size: crate::checksum::CRC32_SIZE as u16,
            blocks_per_checksum: 1,
            reseed_checksum: false,
            bitmap_mode: BitmapMode::Byte,
        },
    })
}

/// Parses a current descriptor from the start of `data`.
///
/// The trailing CRC32 is not checked here.
pub(crate) fn parse_current(data: &[u8]) -> Result<Descriptor, ReadError> {
    let (head, rest) =
        CurrentHeadRaw::read_from_prefix(data).map_err(|_| TooShortSnafu.build())?;
    let (fs, rest) = CurrentFsRaw::read_from_prefix(rest).map_err(|_| TooShortSnafu.build())?;
    let (options, _) =
        CurrentOptionsRaw::read_from_prefix(rest).map_err(|_| TooShortSnafu.build())?;

    ensure!(head.magic[..15] == *IMAGE_MAGIC, NotPartcloneSnafu);

    let block_size = fs.block_size.get();

    ensure!(
        block_size > 0,
        InvalidBlockSizeSnafu {
            block_size: block_size as i64
        }
    );

    let blocks_per_checksum = options.blocks_per_checksum.get();

    ensure!(blocks_per_checksum >= 1, InvalidBlocksPerChecksumSnafu);

    let endianness = match head.endianness.get() {
        ENDIAN_LITTLE => Endianness::Little,
        ENDIAN_BIG => Endianness::Big,
        v => Endianness::Unknown(v),
    };

    let mut magic = [0u8; 15];
    magic.copy_from_slice(&head.magic[..15]);

    Ok(Descriptor {
        head: Head {
            magic,
            version: Version(head.version),
            creator: c_string(&head.creator),
            endianness,
        },
        fs: FsInfo {
            fs_type: c_string(&fs.fs),
            device_size: fs.device_size.get(),
            total_blocks: fs.total_blocks.get(),
            used_blocks: fs.used_blocks.get(),
            block_size,
        },
        options: Options {
            image_version: options.image_version.get(),
            cpu_bits: options.cpu_bits.get(),
            checksum_mode: ChecksumMode::from_raw(options.checksum_mode.get()),
            checksum_size: options.checksum_size.get(),
            blocks_per_checksum,
            reseed_checksum: options.reseed_checksum != 0,
            bitmap_mode: BitmapMode::from_raw(options.bitmap_mode),
        },
    })
}

/// Decodes a NUL-padded on-disk string.
fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());

    String::from_utf8_lossy(&raw[..end]).into_owned()
}
