#![forbid(unsafe_code)]
//! Byte sources and block views for the XFS decoder.
//!
//! The decoder only ever reads. [`ByteDevice`] is the positioned-read
//! collaborator every other crate consumes. [`BlockDevice`] is a whole-block
//! view used by the optional [`ArcCache`] memoization layer, and
//! [`BlockByteDevice`] turns any block view back into a byte source so the
//! cache can sit underneath the decoder transparently.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use xfs_error::{Result, XfsError};
use xfs_types::{BlockNumber, ByteOffset};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed source supporting positioned reads (pread semantics).
///
/// Implementations must tolerate concurrent reads from multiple threads.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Read `len` bytes at `offset` into a fresh buffer.
    fn read_vec_at(&self, offset: ByteOffset, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Box<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

fn check_range(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| XfsError::InvalidArgument("read length overflows u64".to_owned()))?,
        )
        .ok_or_else(|| XfsError::InvalidArgument("read range overflows u64".to_owned()))?;
    if end.0 > device_len {
        return Err(XfsError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("read out of bounds: offset={offset} len={len} device_len={device_len}"),
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`-style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. The file is opened read-only.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }
}

/// In-memory byte device over a shared, immutable image.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<[u8]>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = offset
            .to_usize()
            .map_err(|e| XfsError::InvalidArgument(e.to_string()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Block-addressed read interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks, counting a trailing partial block.
    fn block_count(&self) -> u64;
}

/// Whole-block view over a [`ByteDevice`].
///
/// Images truncated mid-block are common in forensic work, so a trailing
/// partial block is readable and zero-padded.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(XfsError::InvalidArgument(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_count = len.div_ceil(u64::from(block_size));
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(XfsError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "block out of range: block={} block_count={}",
                    block.0, self.block_count
                ),
            )));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| XfsError::InvalidArgument("block offset overflow".to_owned()))?;
        let block_len = usize::try_from(self.block_size)
            .map_err(|_| XfsError::InvalidArgument("block_size does not fit usize".to_owned()))?;
        let available = self.inner.len_bytes().saturating_sub(offset);
        let readable = usize::try_from(available).map_or(block_len, |a| a.min(block_len));

        let mut buf = vec![0_u8; block_len];
        self.inner
            .read_exact_at(ByteOffset(offset), &mut buf[..readable])?;
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// Byte-source view over a [`BlockDevice`].
///
/// Reads that straddle block boundaries are assembled from whole blocks.
#[derive(Debug)]
pub struct BlockByteDevice<B: BlockDevice> {
    inner: B,
    len: u64,
}

impl<B: BlockDevice> BlockByteDevice<B> {
    /// `len` is the byte length of the underlying image.
    #[must_use]
    pub fn new(inner: B, len: u64) -> Self {
        Self { inner, len }
    }

    #[must_use]
    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: BlockDevice> ByteDevice for BlockByteDevice<B> {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let block_size = u64::from(self.inner.block_size());
        let mut pos = offset.0;
        let mut filled = 0_usize;
        while filled < buf.len() {
            let block = self.inner.read_block(BlockNumber(pos / block_size))?;
            let in_block = usize::try_from(pos % block_size)
                .map_err(|_| XfsError::InvalidArgument("block offset overflow".to_owned()))?;
            let take = (block.as_slice().len() - in_block).min(buf.len() - filled);
            buf[filled..filled + take]
                .copy_from_slice(&block.as_slice()[in_block..in_block + take]);
            filled += take;
            pos += take as u64;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<BlockNumber>,
    t2: VecDeque<BlockNumber>,
    b1: VecDeque<BlockNumber>,
    b2: VecDeque<BlockNumber>,
    loc: HashMap<BlockNumber, ArcList>,
    resident: HashMap<BlockNumber, Vec<u8>>,
    hits: u64,
    misses: u64,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
            resident: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    fn remove_from_list(list: &mut VecDeque<BlockNumber>, key: BlockNumber) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    fn touch_mru(&mut self, key: BlockNumber) {
        let Some(list) = self.loc.get(&key).copied() else {
            return;
        };

        match list {
            ArcList::T1 => {
                let _ = Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            ArcList::T2 => {
                let _ = Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            ArcList::B1 | ArcList::B2 => {}
        }
    }

    fn replace(&mut self, incoming: BlockNumber) {
        let t1_len = self.t1.len();
        if t1_len >= 1
            && (t1_len > self.p
                || (matches!(self.loc.get(&incoming), Some(ArcList::B2)) && t1_len == self.p))
        {
            if let Some(victim) = self.t1.pop_front() {
                self.loc.insert(victim, ArcList::B1);
                let _ = self.resident.remove(&victim);
                self.b1.push_back(victim);
            }
        } else if let Some(victim) = self.t2.pop_front() {
            self.loc.insert(victim, ArcList::B2);
            let _ = self.resident.remove(&victim);
            self.b2.push_back(victim);
        }

        while self.b1.len() > self.capacity {
            if let Some(victim) = self.b1.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(victim) = self.b2.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
    }

    fn on_miss_or_ghost_hit(&mut self, key: BlockNumber) {
        let full = self.t1.len() + self.t2.len() >= self.capacity;

        if matches!(self.loc.get(&key), Some(ArcList::B1)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b2_len / b1_len).max(1);
            self.p = (self.p + delta).min(self.capacity);
            let _ = Self::remove_from_list(&mut self.b1, key);
            if full {
                self.replace(key);
            }
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        if matches!(self.loc.get(&key), Some(ArcList::B2)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b1_len / b2_len).max(1);
            self.p = self.p.saturating_sub(delta);
            let _ = Self::remove_from_list(&mut self.b2, key);
            if full {
                self.replace(key);
            }
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return;
        }

        // Not present in any list. Only evict once the resident set is full.
        let l1 = self.t1.len() + self.b1.len();
        let total = l1 + self.t2.len() + self.b2.len();
        if l1 == self.capacity {
            if self.t1.len() < self.capacity {
                let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                self.replace(key);
            } else if let Some(victim) = self.t1.pop_front() {
                let _ = self.loc.remove(&victim);
                let _ = self.resident.remove(&victim);
            }
        } else if total >= self.capacity {
            if total >= self.capacity.saturating_mul(2) {
                let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
            }
            if full {
                self.replace(key);
            }
        }

        self.t1.push_back(key);
        self.loc.insert(key, ArcList::T1);
    }
}

/// Hit/miss counters for an [`ArcCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
    pub capacity: usize,
}

/// ARC-cached wrapper around a [`BlockDevice`].
///
/// This is the optional memoization layer callers put under the decoder when
/// they expect repeated access to the same metadata blocks. The decoder itself
/// never caches.
#[derive(Debug)]
pub struct ArcCache<D: BlockDevice> {
    inner: D,
    state: Mutex<ArcState>,
}

impl<D: BlockDevice> ArcCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(XfsError::InvalidArgument(
                "ArcCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            state: Mutex::new(ArcState::new(capacity_blocks)),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let guard = self.state.lock();
        CacheStats {
            hits: guard.hits,
            misses: guard.misses,
            resident: guard.resident.len(),
            capacity: guard.capacity,
        }
    }
}

impl<D: BlockDevice> BlockDevice for ArcCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        {
            let mut guard = self.state.lock();
            if let Some(bytes) = guard.resident.get(&block).cloned() {
                guard.hits += 1;
                guard.touch_mru(block);
                drop(guard);
                return Ok(BlockBuf::new(bytes));
            }
        }

        let buf = self.inner.read_block(block)?;

        let mut guard = self.state.lock();
        guard.misses += 1;
        guard.on_miss_or_ghost_hit(block);
        guard.resident.insert(block, buf.as_slice().to_vec());
        drop(guard);
        Ok(buf)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }
}

/// Wrap `dev` in an ARC cache of `capacity_blocks` blocks of `block_size`
/// bytes and expose it as a byte source again.
pub fn cached_byte_device<D: ByteDevice + 'static>(
    dev: D,
    block_size: u32,
    capacity_blocks: usize,
) -> Result<BlockByteDevice<ArcCache<ByteBlockDevice<D>>>> {
    let len = dev.len_bytes();
    let blocks = ByteBlockDevice::new(dev, block_size)?;
    let cache = ArcCache::new(blocks, capacity_blocks)?;
    Ok(BlockByteDevice::new(cache, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(len: usize) -> MemByteDevice {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        MemByteDevice::new(bytes)
    }

    #[test]
    fn mem_device_reads_exact_range() {
        let dev = patterned(4096);
        let got = dev.read_vec_at(ByteOffset(250), 4).unwrap();
        assert_eq!(got, vec![250, 0, 1, 2]);
    }

    #[test]
    fn mem_device_rejects_out_of_bounds() {
        let dev = patterned(1024);
        let err = dev.read_vec_at(ByteOffset(1020), 8).unwrap_err();
        assert!(matches!(err, XfsError::Io(ref e) if e.kind() == ErrorKind::UnexpectedEof));
        assert!(dev.read_vec_at(ByteOffset(u64::MAX), 2).is_err());
    }

    #[test]
    fn byte_block_device_zero_pads_trailing_partial_block() {
        let dev = ByteBlockDevice::new(patterned(1536), 1024).unwrap();
        assert_eq!(dev.block_count(), 2);
        let tail = dev.read_block(BlockNumber(1)).unwrap();
        assert_eq!(tail.as_slice().len(), 1024);
        assert_eq!(tail.as_slice()[0], (1024 % 251) as u8);
        assert!(tail.as_slice()[512..].iter().all(|b| *b == 0));
        assert!(dev.read_block(BlockNumber(2)).is_err());
    }

    #[test]
    fn byte_block_device_rejects_bad_block_size() {
        assert!(ByteBlockDevice::new(patterned(4096), 0).is_err());
        assert!(ByteBlockDevice::new(patterned(4096), 1000).is_err());
    }

    #[test]
    fn block_byte_device_assembles_straddling_reads() {
        let raw = patterned(8192);
        let view = BlockByteDevice::new(ByteBlockDevice::new(raw.clone(), 512).unwrap(), 8192);
        let mut got = [0_u8; 1500];
        view.read_exact_at(ByteOffset(300), &mut got).unwrap();
        assert_eq!(&got[..], &raw.as_slice()[300..1800]);
    }

    #[test]
    fn arc_cache_hits_after_first_read() {
        let dev = ByteBlockDevice::new(patterned(4096 * 4), 4096).unwrap();
        let cache = ArcCache::new(dev, 2).unwrap();

        let r1 = cache.read_block(BlockNumber(1)).unwrap();
        let r2 = cache.read_block(BlockNumber(1)).unwrap();
        assert_eq!(r1, r2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.resident, 1);
    }

    #[test]
    fn arc_cache_respects_capacity() {
        let dev = ByteBlockDevice::new(patterned(4096 * 8), 4096).unwrap();
        let cache = ArcCache::new(dev, 3).unwrap();
        for block in 0..8 {
            cache.read_block(BlockNumber(block)).unwrap();
        }
        assert!(cache.stats().resident <= 3);
    }

    #[test]
    fn arc_cache_rejects_zero_capacity() {
        let dev = ByteBlockDevice::new(patterned(4096), 4096).unwrap();
        assert!(ArcCache::new(dev, 0).is_err());
    }

    #[test]
    fn cached_byte_device_matches_raw_reads() {
        let raw = patterned(4096 * 4);
        let cached = cached_byte_device(raw.clone(), 1024, 4).unwrap();
        for (offset, len) in [(0_u64, 16_usize), (1000, 100), (4000, 5000), (16_000, 384)] {
            let want = raw.read_vec_at(ByteOffset(offset), len).unwrap();
            let got = cached.read_vec_at(ByteOffset(offset), len).unwrap();
            assert_eq!(got, want, "offset {offset} len {len}");
        }
        assert!(cached.inner().stats().hits > 0);
    }
}
