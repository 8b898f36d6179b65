#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use xfs_harness::{ImageSpec, demo_image};
use xfs_ondisk::checksum::{AGF_CRC_OFFSET, DINODE_CRC_OFFSET, SB_CRC_OFFSET};
use xfs_ondisk::sb::XFS_SB_SIZE;
use xfs_ondisk::{Agf, DinodeCore, Superblock, verify_crc};
use xfs_types::InodeNumber;

const SECTOR: usize = 512;

fn volume() -> Vec<u8> {
    demo_image(ImageSpec::default()).expect("demo image")
}

fn bench_superblock_parse(c: &mut Criterion) {
    let bytes = volume();
    let region = &bytes[..XFS_SB_SIZE];

    c.bench_function("xfs_superblock_parse", |b| {
        b.iter(|| {
            let sb = Superblock::parse_superblock_region(black_box(region)).expect("sb parse");
            sb.validate_geometry().expect("geometry");
            black_box(sb.geometry().expect("derive geometry"));
        });
    });

    c.bench_function("xfs_superblock_crc", |b| {
        b.iter(|| verify_crc(black_box(&bytes[..SECTOR]), SB_CRC_OFFSET).expect("crc"));
    });
}

fn bench_agf_parse(c: &mut Criterion) {
    let bytes = volume();
    let agf = &bytes[SECTOR..2 * SECTOR];

    c.bench_function("xfs_agf_parse", |b| {
        b.iter(|| {
            verify_crc(black_box(agf), AGF_CRC_OFFSET).expect("agf crc");
            Agf::parse(black_box(agf), true).expect("agf parse")
        });
    });
}

fn bench_dinode_parse(c: &mut Criterion) {
    let bytes = volume();
    let sb = Superblock::parse_superblock_region(&bytes[..XFS_SB_SIZE]).expect("sb parse");
    let geo = sb.geometry().expect("geometry");
    let loc = geo.locate_inode(geo.root_ino).expect("locate root");
    let start = usize::try_from(loc.byte_offset.0).expect("offset fits");
    let record = &bytes[start..start + geo.inode_size as usize];

    c.bench_function("xfs_dinode_parse", |b| {
        b.iter(|| {
            verify_crc(black_box(record), DINODE_CRC_OFFSET).expect("inode crc");
            DinodeCore::parse(black_box(record)).expect("inode parse")
        });
    });

    let neighbour = InodeNumber(geo.root_ino.0 + 1);
    c.bench_function("xfs_locate_inode", |b| {
        b.iter(|| geo.locate_inode(black_box(neighbour)).expect("locate"));
    });
}

criterion_group!(
    ondisk,
    bench_superblock_parse,
    bench_agf_parse,
    bench_dinode_parse,
);
criterion_main!(ondisk);
