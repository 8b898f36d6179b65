#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use xfs_block::MemByteDevice;
use xfs_core::{DirForm, Filesystem, OpenOptions};
use xfs_error::XfsError;
use xfs_harness::{ImageBuilder, ImageSpec, SparseFixture, demo_guide, demo_image};
use xfs_ondisk::ChecksumPolicy;
use xfs_types::InodeNumber;

fn open(bytes: Vec<u8>, checksums: ChecksumPolicy) -> Filesystem {
    let options = OpenOptions {
        checksums,
        ..OpenOptions::default()
    };
    Filesystem::from_device(Arc::new(MemByteDevice::new(bytes)), options).expect("open volume")
}

#[test]
fn shortform_root_survives_fixture_capture() {
    let mut b = ImageBuilder::new(ImageSpec::v5(512, 4096, 4)).expect("builder");
    let root = b.root();
    b.add_file_at(131, root, "a.txt", b"alpha\n").expect("file");
    b.mkdir_at(132, root, "sub").expect("dir");
    let bytes = b.build().expect("build");

    let fixture = SparseFixture::capture(&bytes, 64);
    let text = serde_json::to_string(&fixture).expect("serialize");
    let restored: SparseFixture = serde_json::from_str(&text).expect("deserialize");
    let fs = open(restored.materialize().expect("materialize"), ChecksumPolicy::Strict);

    let geo = fs.geometry();
    assert_eq!(geo.version, 5);
    assert_eq!(geo.block_size.get(), 512);
    assert_eq!(geo.ag_count, 4);

    let root = fs.root_inode().expect("root");
    assert_eq!(root.directory().expect("dir").form(), DirForm::Shortform);
    let found = root.lookup(b"a.txt").expect("lookup").expect("present");
    assert_eq!(found.ino, InodeNumber(131));
    assert_eq!(fs.inode(InodeNumber(131)).expect("inode").read_all().expect("read"), b"alpha\n");
    assert!(fs.inode(InodeNumber(132)).expect("inode").is_directory());
    assert!(root.lookup(b"missing").expect("lookup").is_none());
}

#[test]
fn ten_thousand_name_directory_uses_node_form() {
    const NAMES: usize = 10_000;
    let mut b = ImageBuilder::new(ImageSpec::default()).expect("builder");
    let root = b.root();
    let dir = b.mkdir(root, "big").expect("dir");
    let file = b.add_file(root, "payload", b"x").expect("file");
    for i in 0..NAMES {
        b.link(dir, format!("name-{i:05}"), file).expect("link");
    }
    let fs = open(b.build().expect("build"), ChecksumPolicy::Strict);

    let big = fs.resolve_path("/big").expect("resolve");
    let view = big.directory().expect("dir");
    assert_eq!(view.form(), DirForm::Node);

    let mut seen = BTreeSet::new();
    for entry in view.entries() {
        let entry = entry.expect("entry");
        assert_eq!(entry.ino.0, file);
        assert!(seen.insert(entry.name), "duplicate entry");
    }
    assert_eq!(seen.len(), NAMES);

    for i in 0..NAMES {
        let name = format!("name-{i:05}");
        let hit = view.lookup(name.as_bytes()).expect("lookup");
        assert_eq!(hit.map(|e| e.ino.0), Some(file), "{name}");
    }
    assert!(view.lookup(b"name-10000").expect("lookup").is_none());
    assert_eq!(fs.inode(InodeNumber(file)).expect("file").attr().nlink, NAMES as u32 + 1);
}

#[test]
fn demo_volume_reads_across_block_sizes() {
    for (bs, crc) in [(512, true), (1024, false), (2048, true), (4096, false)] {
        let spec = if crc {
            ImageSpec::v5(bs, 4096, 2)
        } else {
            ImageSpec::v4(bs, 4096, 2)
        };
        let fs = open(demo_image(spec).expect("demo"), ChecksumPolicy::Strict);
        let guide = fs.resolve_path("/link").expect("resolve link");
        assert_eq!(guide.read_all().expect("read"), demo_guide(bs), "block size {bs}");
        let sparse = fs.resolve_path("/sparse").expect("sparse");
        assert_eq!(sparse.read(0, 4).expect("head"), b"head");
        assert!(sparse.read(4096, 512).expect("hole").iter().all(|b| *b == 0));
    }
}

#[test]
fn damaged_directory_block_fails_only_under_strict_checksums() {
    let bytes = demo_image(ImageSpec::default()).expect("demo");
    let (start, count) = {
        let fs = open(bytes.clone(), ChecksumPolicy::Strict);
        let many = fs.resolve_path("/many").expect("many");
        assert_eq!(many.directory().expect("dir").form(), DirForm::Leaf);
        let data = many.extents().expect("extents")[0];
        let start = fs
            .volume()
            .run_start(data.start_block, data.block_count)
            .expect("run start");
        (start.0, data.block_count)
    };

    // The last data block is partly unused; damage its free region.
    let bs = 4096_u64;
    let offset = ((start + count) * bs - 64) as usize;
    let mut damaged = bytes;
    damaged[offset] ^= 0x5a;

    let lenient = open(damaged.clone(), ChecksumPolicy::Warn);
    let entries = lenient
        .resolve_path("/many")
        .expect("many")
        .directory_entries()
        .expect("entries")
        .count();
    assert_eq!(entries, xfs_harness::DEMO_MANY_NAMES + 1);

    let strict = open(damaged, ChecksumPolicy::Strict);
    let many = strict.resolve_path("/many").expect("many");
    let failure = many
        .directory_entries()
        .expect("entries")
        .find_map(Result::err)
        .expect("checksum failure");
    assert!(
        matches!(failure, XfsError::CorruptFilesystem { .. }),
        "unexpected error: {failure}"
    );
}
