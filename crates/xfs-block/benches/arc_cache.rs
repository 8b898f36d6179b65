#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use xfs_block::{ArcCache, BlockBuf, BlockDevice, ByteBlockDevice, ByteDevice, MemByteDevice, cached_byte_device};
use xfs_types::{BlockNumber, ByteOffset};

fn make_cache(
    block_size: u32,
    block_count: usize,
    capacity: usize,
) -> ArcCache<ByteBlockDevice<MemByteDevice>> {
    let mem = MemByteDevice::new(vec![0_u8; block_size as usize * block_count]);
    let dev = ByteBlockDevice::new(mem, block_size).expect("device");
    ArcCache::new(dev, capacity).expect("cache")
}

fn bench_cache_hit(c: &mut Criterion) {
    let cache = make_cache(4096, 16, 8);
    let _ = cache.read_block(BlockNumber(0)).expect("warmup");

    c.bench_function("arc_cache_hit_4k", |b| {
        b.iter(|| {
            let _buf: BlockBuf = cache.read_block(black_box(BlockNumber(0))).expect("hit");
        });
    });
}

fn bench_cache_miss_scan(c: &mut Criterion) {
    let cache = make_cache(4096, 256, 8);
    let mut next = 0_u64;

    c.bench_function("arc_cache_miss_scan_4k", |b| {
        b.iter(|| {
            let _buf = cache.read_block(black_box(BlockNumber(next))).expect("miss");
            next = (next + 1) % 256;
        });
    });
}

fn bench_straddling_inode_read(c: &mut Criterion) {
    let dev = cached_byte_device(MemByteDevice::new(vec![0_u8; 512 * 1024]), 512, 64)
        .expect("cached device");

    c.bench_function("cached_inode_read_512", |b| {
        b.iter(|| {
            let bytes = dev
                .read_vec_at(black_box(ByteOffset(65_536 + 256)), 512)
                .expect("read");
            black_box(bytes);
        });
    });
}

criterion_group!(
    benches,
    bench_cache_hit,
    bench_cache_miss_scan,
    bench_straddling_inode_read
);
criterion_main!(benches);
