mod common;

use common::{Legacy, payload, write_image};
use pcimage::{Anomaly, ErrorKind, Image, OpenMode, OpenOptions, UNUSED_BLOCK_FILL};

fn open_verified(data: &[u8]) -> (tempfile::TempDir, Image) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "sda1.img", data);
    let mut image = Image::open(&path, None, OpenMode::ReadOnly).unwrap();

    image.verify().unwrap();
    (dir, image)
}

#[test]
fn stale_used_count_is_corrected() {
    let mut legacy = Legacy::new(512, &[1, 0, 1, 1]);
    legacy.used_blocks = Some(2);

    let (_dir, image) = open_verified(&legacy.build());
    let desc = image.descriptor().unwrap();
    let stats = image.bitmap_stats().unwrap();

    assert_eq!(desc.fs.used_blocks, 3);
    assert_eq!(desc.fs.total_blocks, 4);
    assert_eq!(image.block_size(), Some(512));
    assert_eq!(image.block_count(), Some(4));
    assert_eq!(stats.used, 3);
    assert_eq!(stats.unused, 1);
    assert_eq!(stats.last_used, Some(3));
    assert_eq!(image.data_offset(), Some(legacy.data_offset() as u64));
    assert_eq!(image.record_size(), Some(516));
}

#[test]
fn strict_headers_reject_stale_used_count() {
    let mut legacy = Legacy::new(512, &[1, 0, 1, 1]);
    legacy.used_blocks = Some(2);

    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "sda1.img", &legacy.build());
    let mut image = OpenOptions::new().strict_headers(true).open(&path).unwrap();

    let err = image.verify().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(matches!(
        err,
        pcimage::Error::UsedBlockCount {
            recorded: 2,
            scanned: 3
        }
    ));
    image.close().unwrap();
}

#[test]
fn device_size_is_repaired() {
    let mut legacy = Legacy::new(1024, &[1, 1, 0]);
    legacy.device_size = Some(12345);

    let (_dir, image) = open_verified(&legacy.build());

    assert_eq!(image.descriptor().unwrap().fs.device_size, 3 * 1024);
}

#[test]
fn unused_block_reads_filler_without_io() {
    let legacy = Legacy::new(512, &[1, 0, 1, 1]);
    let mut data = legacy.build();

    // Keep only the record of block 0.
    data.truncate(legacy.data_offset() + 516);

    let (_dir, mut image) = open_verified(&data);
    let mut buf = vec![0u8; 1024];

    image.read_blocks(&mut buf).unwrap();
    assert_eq!(&buf[..512], payload(0, 512).as_slice());
    assert!(buf[512..].iter().all(|&b| b == UNUSED_BLOCK_FILL));
    assert_eq!(image.tell(), Some(2));

    let err = image.read_blocks(&mut buf[..512]).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(image.tell(), Some(2));
}

#[test]
fn seek_then_read_matches_sequential_read() {
    let bitmap: Vec<u8> = (0u64..3000)
        .map(|b| u8::from((b * 2654435761) % 7 < 4))
        .collect();
    let legacy = Legacy::new(512, &bitmap);
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "big.img", &legacy.build());

    let mut image = OpenOptions::new().index_factor(4).open(&path).unwrap();
    image.verify().unwrap();

    let mut all = vec![0u8; 3000 * 512];
    image.read_blocks(&mut all).unwrap();

    for (block, chunk) in all.chunks_exact(512).enumerate() {
        if bitmap[block] == 1 {
            assert_eq!(chunk, payload(block as u64, 512).as_slice(), "block {block}");
        } else {
            assert!(chunk.iter().all(|&b| b == UNUSED_BLOCK_FILL), "block {block}");
        }
    }

    let mut one = [0u8; 512];

    for target in [2999u64, 0, 17, 16, 1024, 1023, 2048, 5, 2500] {
        image.seek(target).unwrap();
        assert_eq!(image.tell(), Some(target));

        image.read_blocks(&mut one).unwrap();
        assert_eq!(
            one.as_slice(),
            &all[target as usize * 512..(target as usize + 1) * 512],
            "block {target}"
        );
    }
}

#[test]
fn compat_checksum_only_covers_first_byte() {
    let legacy = Legacy::new(512, &[1, 1, 0, 1]);
    let mut data = legacy.build();
    let start = legacy.data_offset();

    // A change past the first byte of block 0 goes unnoticed.
    data[start + 100] ^= 0xFF;

    let (_dir, mut image) = open_verified(&data);
    let mut buf = vec![0u8; 4 * 512];

    image.read_blocks(&mut buf).unwrap();

    let mut expected = payload(0, 512);
    expected[100] ^= 0xFF;
    assert_eq!(&buf[..512], expected.as_slice());
    assert_eq!(&buf[3 * 512..], payload(3, 512).as_slice());
}

#[test]
fn corrupted_block_stops_the_read() {
    let legacy = Legacy::new(512, &[1, 1, 0, 1]);
    let mut data = legacy.build();
    let block1 = legacy.data_offset() + 516;

    data[block1] ^= 0xFF;

    let (_dir, mut image) = open_verified(&data);
    let mut buf = vec![0u8; 4 * 512];

    let err = image.read_blocks(&mut buf).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(matches!(err, pcimage::Error::BlockChecksum { block: 1, .. }));
    assert_eq!(&buf[..512], payload(0, 512).as_slice());
    assert_eq!(image.tell(), Some(1));

    // Skipping the bad block keeps later records aligned.
    image.seek(2).unwrap();
    image.read_blocks(&mut buf[..1024]).unwrap();
    assert!(buf[..512].iter().all(|&b| b == UNUSED_BLOCK_FILL));
    assert_eq!(&buf[512..1024], payload(3, 512).as_slice());
}

#[test]
fn anomalous_bitmap_entries_are_unused() {
    let legacy = Legacy::new(512, &[1, 2, 0, 1, 0xFF]);
    let (_dir, mut image) = open_verified(&legacy.build());
    let stats = image.bitmap_stats().unwrap().clone();

    assert_eq!(stats.used, 2);
    assert_eq!(stats.anomalous, 2);
    assert_eq!(
        stats.anomalies,
        vec![
            Anomaly { block: 1, value: 2 },
            Anomaly {
                block: 4,
                value: 0xFF
            }
        ]
    );

    image.seek(1).unwrap();
    assert!(!image.is_block_used().unwrap());

    let mut buf = [0u8; 512];
    image.read_blocks(&mut buf).unwrap();
    assert_eq!(buf, [UNUSED_BLOCK_FILL; 512]);

    image.seek(3).unwrap();
    assert!(image.is_block_used().unwrap());
    image.read_blocks(&mut buf).unwrap();
    assert_eq!(buf.as_slice(), payload(3, 512).as_slice());
}

#[test]
fn bitmap_magic_mismatch_is_integrity_failure() {
    let legacy = Legacy::new(512, &[1, 0]);
    let mut data = legacy.build();
    let magic = legacy.data_offset() - 8;

    data[magic] = b'X';

    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "sda1.img", &data);
    let mut image = Image::open(&path, None, OpenMode::ReadOnly).unwrap();

    assert_eq!(image.verify().unwrap_err().kind(), ErrorKind::Integrity);

    // A half-verified handle is not usable but closes cleanly.
    assert_eq!(image.block_size(), None);
    assert_eq!(image.tell(), None);
    assert!(image.descriptor().is_some());
    image.close().unwrap();
}

#[test]
fn huge_block_count_is_rejected_before_allocation() {
    let mut data = Legacy::new(512, &[1, 1]).build();

    data[48..56].copy_from_slice(&(u64::MAX - 10).to_le_bytes());

    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "sda1.img", &data);
    let mut image = Image::open(&path, None, OpenMode::ReadOnly).unwrap();
    let err = image.verify().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(matches!(err, pcimage::Error::ReadBitmap { .. }));
    assert_eq!(image.block_count(), None);
    assert_eq!(image.data_offset(), None);
    assert!(image.descriptor().is_none());
    image.close().unwrap();

    // No overlay is sized from the bogus geometry either.
    let overlay = dir.path().join("sda1.cf");
    let mut image = Image::open(&path, Some(overlay.as_path()), OpenMode::Create).unwrap();

    assert_eq!(image.verify().unwrap_err().kind(), ErrorKind::Io);
    assert!(!overlay.exists());
}

#[test]
fn operations_require_verify() {
    let legacy = Legacy::new(512, &[1, 0]);
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "sda1.img", &legacy.build());
    let mut image = Image::open(&path, None, OpenMode::ReadOnly).unwrap();
    let mut buf = [0u8; 512];

    assert_eq!(image.block_size(), None);
    assert_eq!(image.block_count(), None);
    assert_eq!(image.tell(), None);
    assert_eq!(image.seek(0).unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(
        image.read_blocks(&mut buf).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        image.is_block_used().unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    image.verify().unwrap();
    assert_eq!(image.verify().unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn read_only_handle_rejects_writes() {
    let (_dir, mut image) = open_verified(&Legacy::new(512, &[1, 0]).build());

    assert!(image.is_read_only());
    assert_eq!(
        image.write_blocks(&[0u8; 512]).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(image.sync().unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn cursor_bounds() {
    let (_dir, mut image) = open_verified(&Legacy::new(512, &[1, 0, 1]).build());
    let mut buf = [0u8; 512];

    assert_eq!(image.seek(4).unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(image.tell(), Some(0));

    image.seek(3).unwrap();
    assert_eq!(
        image.read_blocks(&mut buf).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        image.read_blocks(&mut buf[..100]).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}
