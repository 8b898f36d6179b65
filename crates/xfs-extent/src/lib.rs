#![forbid(unsafe_code)]
//! Inode fork representations and logical-to-physical block mapping.
//!
//! A fork is the byte area an inode reserves for either its content (data
//! fork) or its extended attributes (attribute fork). The fork's format tag
//! decides how to read it:
//!
//! - `Local`: the bytes are the content itself.
//! - `Extents`: a packed array of extent records.
//! - `Btree`: the root of an extent-map btree whose leaves hold the records.
//!
//! [`ExtentMapper`] hides that difference. Its iterator yields extents in
//! ascending logical order and rejects zero-length or overlapping records.
//! A btree fork holds one leaf in memory at a time.

mod volume;

pub use volume::{AgNodeReader, Volume};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use xfs_btree::{Btree, BtreeRoot, Direction, ExtentMap, NodeReader, Traversal, corrupt_at};
use xfs_error::{Result, XfsError};
use xfs_ondisk::{ExtentRecord, ForkFormat};
use xfs_types::{ByteOffset, FileBlock, FsBlock, InodeNumber, ensure_slice, u64_to_usize};

// ── Fork ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkKind {
    Data,
    Attr,
}

impl ForkKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Attr => "attr",
        }
    }
}

/// Decoded storage of one fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkStorage {
    /// Literal bytes (shortform directory, shortform attributes, inline
    /// symlink target, small file).
    Inline(Vec<u8>),
    /// `count` packed 16-byte extent records.
    ExtentList { raw: Vec<u8>, count: u64 },
    /// Inline root of an extent-map btree.
    Btree(Vec<u8>),
}

/// One inode fork, detached from the inode record it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fork {
    pub owner: InodeNumber,
    /// Linear block holding the owning inode record, for diagnostics.
    pub origin_block: u64,
    pub kind: ForkKind,
    pub storage: ForkStorage,
}

impl Fork {
    /// Interpret `bytes` (the fork's literal area) according to `format`.
    ///
    /// `extent_count` is the inode's declared record count for this fork and
    /// only matters for the extent-list form.
    pub fn new(
        owner: InodeNumber,
        origin_block: u64,
        kind: ForkKind,
        format: ForkFormat,
        bytes: &[u8],
        extent_count: u64,
    ) -> Result<Self> {
        let storage = match format {
            ForkFormat::Local => ForkStorage::Inline(bytes.to_vec()),
            ForkFormat::Extents => {
                let needed = extent_count
                    .checked_mul(ExtentRecord::SIZE as u64)
                    .and_then(|n| u64_to_usize(n, "extent_list_len").ok())
                    .filter(|n| *n <= bytes.len())
                    .ok_or_else(|| XfsError::InvalidInode {
                        ino: owner.0,
                        detail: format!(
                            "{} fork declares {extent_count} extents but holds {} bytes",
                            kind.name(),
                            bytes.len()
                        ),
                    })?;
                ForkStorage::ExtentList {
                    raw: bytes[..needed].to_vec(),
                    count: extent_count,
                }
            }
            ForkFormat::Btree => ForkStorage::Btree(bytes.to_vec()),
            other => {
                return Err(XfsError::UnsupportedFeature(format!(
                    "{} fork format {} on inode {owner}",
                    kind.name(),
                    other.name()
                )));
            }
        };
        Ok(Self {
            owner,
            origin_block,
            kind,
            storage,
        })
    }

    #[must_use]
    pub fn format(&self) -> ForkFormat {
        match self.storage {
            ForkStorage::Inline(_) => ForkFormat::Local,
            ForkStorage::ExtentList { .. } => ForkFormat::Extents,
            ForkStorage::Btree(_) => ForkFormat::Btree,
        }
    }

    /// Literal bytes of a local fork.
    #[must_use]
    pub fn inline_bytes(&self) -> Option<&[u8]> {
        match &self.storage {
            ForkStorage::Inline(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Block-mapped forks (extent list or btree).
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        !matches!(self.storage, ForkStorage::Inline(_))
    }
}

// ── Extents ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtentState {
    Normal,
    /// Preallocated; reads as zeros.
    Unwritten,
}

/// A run of logically and physically contiguous blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub file_offset: FileBlock,
    pub start_block: FsBlock,
    pub block_count: u64,
    pub state: ExtentState,
}

impl Extent {
    /// One past the last logical block.
    #[must_use]
    pub fn file_end(&self) -> u64 {
        self.file_offset.0.saturating_add(self.block_count)
    }

    #[must_use]
    pub fn contains(&self, block: FileBlock) -> bool {
        block.0 >= self.file_offset.0 && block.0 < self.file_end()
    }

    #[must_use]
    pub fn is_unwritten(&self) -> bool {
        self.state == ExtentState::Unwritten
    }

    /// Packed physical block of logical block `block`, which must lie inside.
    #[must_use]
    pub fn physical(&self, block: FileBlock) -> FsBlock {
        FsBlock(self.start_block.0 + (block.0 - self.file_offset.0))
    }

    fn from_record(rec: &ExtentRecord) -> Self {
        Self {
            file_offset: FileBlock(rec.file_offset),
            start_block: rec.start_block,
            block_count: rec.block_count,
            state: if rec.unwritten {
                ExtentState::Unwritten
            } else {
                ExtentState::Normal
            },
        }
    }

    /// `next` picks up exactly where `self` ends, on disk as well as in the file.
    fn continues(&self, next: &Self) -> bool {
        self.file_end() == next.file_offset.0
            && self.start_block.0.checked_add(self.block_count) == Some(next.start_block.0)
            && self.state == next.state
    }
}

/// Result of a single-block lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    Mapped(Extent),
    /// No extent covers the block. `until` is the next mapped block, or
    /// `None` when nothing is mapped past it.
    Hole { until: Option<FileBlock> },
}

// ── Mapper ──────────────────────────────────────────────────────────────────

/// Logical block resolution over one fork.
#[derive(Debug, Clone, Copy)]
pub struct ExtentMapper<'a> {
    volume: &'a Volume,
    fork: &'a Fork,
}

impl<'a> ExtentMapper<'a> {
    #[must_use]
    pub fn new(volume: &'a Volume, fork: &'a Fork) -> Self {
        Self { volume, fork }
    }

    #[must_use]
    pub fn volume(&self) -> &'a Volume {
        self.volume
    }

    #[must_use]
    pub fn fork(&self) -> &'a Fork {
        self.fork
    }

    fn tree(&self) -> Btree<ExtentMap, &'a Volume> {
        Btree::new(
            ExtentMap {
                crc: self.volume.geometry().has_crc,
            },
            self.volume,
            self.volume.checksums(),
        )
    }

    /// Extents in ascending logical order. Inline forks have none.
    #[must_use]
    pub fn extents(&self) -> Extents<'a> {
        let source = match &self.fork.storage {
            ForkStorage::Inline(_) => Source::Empty,
            ForkStorage::ExtentList { raw, count } => Source::List {
                raw,
                next: 0,
                count: *count,
            },
            ForkStorage::Btree(root) => {
                Source::Tree(self.tree().traverse(&BtreeRoot::Inline(root.clone()), Direction::Forward))
            }
        };
        Extents::new(self.fork, source)
    }

    /// Extents starting with the one covering `block` (or the first one past
    /// it). Btree forks descend directly instead of scanning from the start.
    fn extents_from(&self, block: FileBlock) -> Extents<'a> {
        match &self.fork.storage {
            ForkStorage::Btree(root) => Extents::new(
                self.fork,
                Source::Tree(self.tree().range_from(&BtreeRoot::Inline(root.clone()), block.0)),
            ),
            _ => self.extents(),
        }
    }

    /// Every extent, merging neighbours that continue each other.
    pub fn all_extents(&self) -> Result<Vec<Extent>> {
        let mut out: Vec<Extent> = Vec::new();
        for extent in self.extents() {
            let extent = extent?;
            match out.last_mut() {
                Some(last) if last.continues(&extent) => last.block_count += extent.block_count,
                _ => out.push(extent),
            }
        }
        Ok(out)
    }

    /// Resolve a single logical block.
    pub fn extent_at(&self, block: FileBlock) -> Result<Mapping> {
        for extent in self.extents_from(block) {
            let extent = extent?;
            if extent.file_end() <= block.0 {
                continue;
            }
            if extent.file_offset > block {
                return Ok(Mapping::Hole {
                    until: Some(extent.file_offset),
                });
            }
            return Ok(Mapping::Mapped(extent));
        }
        Ok(Mapping::Hole { until: None })
    }

    /// Read `count` fork blocks that must be fully mapped and written, as
    /// directory and attribute blocks are.
    pub fn read_metadata(&self, start: FileBlock, count: u64) -> Result<Vec<u8>> {
        let bs = self.volume.block_size();
        let mut out = Vec::with_capacity(u64_to_usize(count.saturating_mul(bs), "metadata_len").unwrap_or(0));
        let end = start.0.saturating_add(count);
        let mut cursor = start;
        while cursor.0 < end {
            let extent = match self.extent_at(cursor)? {
                Mapping::Mapped(e) if !e.is_unwritten() => e,
                Mapping::Mapped(_) => {
                    return Err(self.fork_corrupt(format!(
                        "{} fork block {cursor} is unwritten metadata",
                        self.fork.kind.name()
                    )));
                }
                Mapping::Hole { .. } => {
                    return Err(self.fork_corrupt(format!(
                        "{} fork block {cursor} is a hole inside metadata",
                        self.fork.kind.name()
                    )));
                }
            };
            let run = (extent.file_end() - cursor.0).min(end - cursor.0);
            let linear = self.volume.run_start(extent.physical(cursor), run)?;
            out.extend_from_slice(&self.volume.read_blocks(linear, run)?);
            cursor = FileBlock(cursor.0 + run);
        }
        Ok(out)
    }

    /// Read `len` bytes of fork content starting at byte `offset`.
    ///
    /// Holes and unwritten extents read as zeros. The caller clamps the range
    /// to the file size; bytes past the last extent are zeros as well.
    pub fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0_u8; len];
        if len == 0 {
            return Ok(out);
        }
        if let ForkStorage::Inline(bytes) = &self.fork.storage {
            if let Ok(start) = usize::try_from(offset) {
                if start < bytes.len() {
                    let n = (bytes.len() - start).min(len);
                    out[..n].copy_from_slice(&bytes[start..start + n]);
                }
            }
            return Ok(out);
        }

        let bs = self.volume.block_size();
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| XfsError::InvalidArgument(format!("read range {offset}+{len} overflows")))?;
        let first = FileBlock(offset / bs);
        trace!(ino = self.fork.owner.0, offset, len, "read_range");

        for extent in self.extents_from(first) {
            let extent = extent?;
            let ext_start = extent.file_offset.0.saturating_mul(bs);
            let ext_end = extent.file_end().saturating_mul(bs);
            if ext_end <= offset {
                continue;
            }
            if ext_start >= end {
                break;
            }
            if extent.is_unwritten() {
                continue;
            }
            let lo = ext_start.max(offset);
            let hi = ext_end.min(end);
            let skip = lo - ext_start;
            let run_first = skip / bs;
            let run_blocks = (hi - ext_start).div_ceil(bs) - run_first;
            let linear = self.volume.run_start(
                FsBlock(extent.start_block.0 + run_first),
                run_blocks,
            )?;
            let byte = self
                .volume
                .geometry()
                .block_offset(linear)
                .map_err(|e| corrupt_at(linear.0, &e))?;
            let dest = &mut out[to_index(lo - offset)?..to_index(hi - offset)?];
            let src = ByteOffset(byte.0 + skip % bs);
            self.volume.device().read_exact_at(src, dest)?;
        }
        Ok(out)
    }

    fn fork_corrupt(&self, detail: String) -> XfsError {
        XfsError::corrupt(self.fork.origin_block, detail)
    }
}

fn to_index(value: u64) -> Result<usize> {
    u64_to_usize(value, "read_offset").map_err(|e| XfsError::InvalidArgument(e.to_string()))
}

// ── Extent iterator ─────────────────────────────────────────────────────────

enum Source<'a> {
    Empty,
    List { raw: &'a [u8], next: u64, count: u64 },
    Tree(Traversal<ExtentMap, &'a Volume>),
}

/// Lazy extent sequence of one fork. Fuses after the first error.
pub struct Extents<'a> {
    fork: &'a Fork,
    source: Source<'a>,
    prev_end: Option<u64>,
    failed: bool,
}

impl std::fmt::Debug for Extents<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extents")
            .field("owner", &self.fork.owner)
            .field("kind", &self.fork.kind)
            .field("prev_end", &self.prev_end)
            .finish_non_exhaustive()
    }
}

impl<'a> Extents<'a> {
    fn new(fork: &'a Fork, source: Source<'a>) -> Self {
        Self {
            fork,
            source,
            prev_end: None,
            failed: false,
        }
    }

    fn pull(&mut self) -> Option<Result<ExtentRecord>> {
        let origin = self.fork.origin_block;
        match &mut self.source {
            Source::Empty => None,
            Source::List { raw, next, count } => {
                if *next >= *count {
                    return None;
                }
                let index = *next;
                *next += 1;
                let parsed = u64_to_usize(index, "extent_index")
                    .and_then(|i| {
                        ensure_slice(raw, i.saturating_mul(ExtentRecord::SIZE), ExtentRecord::SIZE)
                    })
                    .and_then(ExtentRecord::parse)
                    .map_err(|e| corrupt_at(origin, &e));
                Some(parsed)
            }
            Source::Tree(traversal) => traversal.next(),
        }
    }

    fn check(&mut self, rec: &ExtentRecord) -> Result<Extent> {
        let kind = self.fork.kind.name();
        if rec.block_count == 0 {
            return Err(XfsError::corrupt(
                self.fork.origin_block,
                format!(
                    "inode {} {kind} fork: zero-length extent at file block {}",
                    self.fork.owner, rec.file_offset
                ),
            ));
        }
        if let Some(prev_end) = self.prev_end {
            if rec.file_offset < prev_end {
                return Err(XfsError::corrupt(
                    self.fork.origin_block,
                    format!(
                        "inode {} {kind} fork: extent at file block {} overlaps previous ending at {prev_end}",
                        self.fork.owner, rec.file_offset
                    ),
                ));
            }
        }
        self.prev_end = Some(rec.file_end());
        Ok(Extent::from_record(rec))
    }
}

impl Iterator for Extents<'_> {
    type Item = Result<Extent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = match self.pull()? {
            Ok(rec) => self.check(&rec),
            Err(err) => Err(err),
        };
        if let Err(err) = &item {
            debug!(ino = self.fork.owner.0, error = %err, "extent_walk_failed");
            self.failed = true;
        }
        Some(item)
    }
}

// ── Directory / attribute block reader ──────────────────────────────────────

/// Reads hash-index nodes addressed by fork-relative block number.
///
/// Directory and attribute btree pointers name logical blocks of the owning
/// fork; each node spans `blocks` filesystem blocks.
#[derive(Debug, Clone, Copy)]
pub struct DaNodeReader<'a> {
    mapper: ExtentMapper<'a>,
    blocks: u64,
}

impl<'a> DaNodeReader<'a> {
    #[must_use]
    pub fn new(mapper: ExtentMapper<'a>, blocks: u64) -> Self {
        Self { mapper, blocks }
    }
}

impl NodeReader for DaNodeReader<'_> {
    fn read_node(&self, ptr: u64) -> Result<Vec<u8>> {
        self.mapper.read_metadata(FileBlock(ptr), self.blocks)
    }

    fn node_address(&self, ptr: u64) -> u64 {
        match self.mapper.extent_at(FileBlock(ptr)) {
            Ok(Mapping::Mapped(extent)) => self
                .mapper
                .volume
                .fsblock_to_linear(extent.physical(FileBlock(ptr)))
                .map_or(ptr, |b| b.0),
            _ => ptr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use xfs_block::MemByteDevice;
    use xfs_ondisk::btree::XFS_BMAP_MAGIC;
    use xfs_ondisk::{ChecksumPolicy, Geometry};
    use xfs_types::{BlockSize, NULLFSBLOCK};

    const BS: usize = 512;
    const BLOCKS: usize = 128;

    /// Two 64-block AGs of 512-byte blocks, v4 (no checksums).
    fn geometry() -> Geometry {
        Geometry {
            block_size: BlockSize::new(512).unwrap(),
            block_log: 9,
            sector_size: 512,
            inode_size: 256,
            inodes_per_block: 2,
            inopb_log: 1,
            ag_blocks: 64,
            ag_block_log: 6,
            ag_count: 2,
            data_blocks: BLOCKS as u64,
            dir_block_log: 0,
            root_ino: InodeNumber(64),
            version: 4,
            has_crc: false,
            has_ftype: false,
            sparse_inodes: false,
            finobt: false,
            rmapbt: false,
            reflink: false,
            bigtime: false,
            large_extent_counts: false,
            meta_uuid: false,
            ascii_ci: false,
        }
    }

    /// Every block filled with its own number, except overrides.
    fn image(overrides: &[(usize, Vec<u8>)]) -> Vec<u8> {
        let mut img = vec![0_u8; BS * BLOCKS];
        for (b, chunk) in img.chunks_mut(BS).enumerate() {
            chunk.fill(b as u8);
        }
        for (block, bytes) in overrides {
            img[block * BS..block * BS + bytes.len()].copy_from_slice(bytes);
        }
        img
    }

    fn volume(img: Vec<u8>) -> Volume {
        Volume::new(
            Arc::new(MemByteDevice::new(img)),
            geometry(),
            ChecksumPolicy::Warn,
        )
    }

    fn rec(file_offset: u64, start: u64, count: u64, unwritten: bool) -> ExtentRecord {
        ExtentRecord {
            file_offset,
            start_block: FsBlock(start),
            block_count: count,
            unwritten,
        }
    }

    fn list_fork(recs: &[ExtentRecord]) -> Fork {
        let mut raw = vec![0_u8; 96];
        for (i, r) in recs.iter().enumerate() {
            raw[i * 16..i * 16 + 16].copy_from_slice(&r.encode());
        }
        Fork::new(
            InodeNumber(128),
            2,
            ForkKind::Data,
            ForkFormat::Extents,
            &raw[..recs.len().max(1) * 16],
            recs.len() as u64,
        )
        .unwrap()
    }

    fn bmap_leaf(recs: &[ExtentRecord]) -> Vec<u8> {
        let mut b = vec![0_u8; BS];
        b[0..4].copy_from_slice(&XFS_BMAP_MAGIC.to_be_bytes());
        b[6..8].copy_from_slice(&(recs.len() as u16).to_be_bytes());
        b[8..16].copy_from_slice(&NULLFSBLOCK.to_be_bytes());
        b[16..24].copy_from_slice(&NULLFSBLOCK.to_be_bytes());
        for (i, r) in recs.iter().enumerate() {
            b[24 + i * 16..40 + i * 16].copy_from_slice(&r.encode());
        }
        b
    }

    /// A 36-byte inline root with one child pointer.
    fn btree_fork(child: u64) -> Fork {
        let mut root = vec![0_u8; 36];
        root[0..2].copy_from_slice(&1_u16.to_be_bytes());
        root[2..4].copy_from_slice(&1_u16.to_be_bytes());
        root[4..12].copy_from_slice(&0_u64.to_be_bytes());
        root[20..28].copy_from_slice(&child.to_be_bytes());
        Fork::new(InodeNumber(128), 2, ForkKind::Data, ForkFormat::Btree, &root, 0).unwrap()
    }

    fn sample_recs() -> Vec<ExtentRecord> {
        vec![
            rec(0, 10, 2, false),
            rec(2, 12, 3, false),
            rec(8, 20, 1, true),
        ]
    }

    // ── Fork construction ───────────────────────────────────────────────────────

    #[test]
    fn extent_count_larger_than_fork_is_invalid_inode() {
        let err = Fork::new(
            InodeNumber(131),
            2,
            ForkKind::Data,
            ForkFormat::Extents,
            &[0_u8; 32],
            3,
        )
        .unwrap_err();
        assert!(matches!(err, XfsError::InvalidInode { ino: 131, .. }), "{err:?}");
    }

    #[test]
    fn device_and_uuid_forks_are_not_block_mapped() {
        for format in [ForkFormat::Dev, ForkFormat::Uuid, ForkFormat::Rmap] {
            let err = Fork::new(InodeNumber(1), 0, ForkKind::Data, format, &[0; 8], 0).unwrap_err();
            assert!(matches!(err, XfsError::UnsupportedFeature(_)), "{format:?}: {err:?}");
        }
    }

    // ── Extent list ─────────────────────────────────────────────────────────────

    #[test]
    fn list_extents_coalesce_contiguous_runs() {
        let vol = volume(image(&[]));
        let fork = list_fork(&sample_recs());
        let mapper = ExtentMapper::new(&vol, &fork);

        let raw: Vec<_> = mapper.extents().collect::<Result<_>>().unwrap();
        assert_eq!(raw.len(), 3);

        let merged = mapper.all_extents().unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].file_offset, FileBlock(0));
        assert_eq!(merged[0].block_count, 5);
        assert_eq!(merged[1].state, ExtentState::Unwritten);
    }

    #[test]
    fn extent_at_reports_mapped_blocks_and_holes() {
        let vol = volume(image(&[]));
        let fork = list_fork(&sample_recs());
        let mapper = ExtentMapper::new(&vol, &fork);

        match mapper.extent_at(FileBlock(3)).unwrap() {
            Mapping::Mapped(e) => assert_eq!(e.physical(FileBlock(3)), FsBlock(13)),
            other => panic!("expected mapping, got {other:?}"),
        }
        assert_eq!(
            mapper.extent_at(FileBlock(5)).unwrap(),
            Mapping::Hole {
                until: Some(FileBlock(8))
            }
        );
        assert_eq!(mapper.extent_at(FileBlock(9)).unwrap(), Mapping::Hole { until: None });
    }

    #[test]
    fn overlapping_extents_are_corrupt() {
        let vol = volume(image(&[]));
        let fork = list_fork(&[rec(0, 10, 4, false), rec(2, 30, 2, false)]);
        let err = ExtentMapper::new(&vol, &fork).all_extents().unwrap_err();
        assert!(matches!(err, XfsError::CorruptFilesystem { block: 2, .. }), "{err:?}");
    }

    #[test]
    fn zero_length_extent_is_corrupt() {
        let vol = volume(image(&[]));
        let fork = list_fork(&[rec(0, 10, 0, false)]);
        let mut extents = ExtentMapper::new(&vol, &fork).extents();
        assert!(extents.next().unwrap().unwrap_err().is_corruption());
        assert!(extents.next().is_none(), "iterator fuses after an error");
    }

    // ── Content reads ───────────────────────────────────────────────────────────

    #[test]
    fn read_range_zero_fills_holes_and_unwritten() {
        let vol = volume(image(&[]));
        let fork = list_fork(&[
            rec(0, 10, 2, false),
            rec(3, 30, 1, false),
            rec(4, 31, 1, true),
        ]);
        let data = ExtentMapper::new(&vol, &fork).read_range(0, 5 * BS).unwrap();
        assert!(data[..BS].iter().all(|b| *b == 10));
        assert!(data[BS..2 * BS].iter().all(|b| *b == 11));
        assert!(data[2 * BS..3 * BS].iter().all(|b| *b == 0));
        assert!(data[3 * BS..4 * BS].iter().all(|b| *b == 30));
        assert!(data[4 * BS..].iter().all(|b| *b == 0));
    }

    #[test]
    fn read_range_handles_unaligned_spans() {
        let vol = volume(image(&[]));
        let fork = list_fork(&[rec(0, 10, 2, false)]);
        let data = ExtentMapper::new(&vol, &fork).read_range(500, 20).unwrap();
        assert_eq!(&data[..12], &[10_u8; 12]);
        assert_eq!(&data[12..], &[11_u8; 8]);
    }

    #[test]
    fn extent_crossing_allocation_group_end_is_corrupt() {
        let vol = volume(image(&[]));
        let fork = list_fork(&[rec(0, 62, 4, false)]);
        let err = ExtentMapper::new(&vol, &fork).read_range(0, 4 * BS).unwrap_err();
        assert!(err.is_corruption(), "{err:?}");
    }

    #[test]
    fn second_allocation_group_addresses_resolve() {
        let vol = volume(image(&[]));
        // AG 1, block 5: packed (1 << 6) | 5, linear 64 + 5.
        let fork = list_fork(&[rec(0, 69, 1, false)]);
        let data = ExtentMapper::new(&vol, &fork).read_range(0, BS).unwrap();
        assert!(data.iter().all(|b| *b == 69));
    }

    #[test]
    fn inline_fork_reads_literal_bytes() {
        let vol = volume(image(&[]));
        let fork = Fork::new(InodeNumber(128), 2, ForkKind::Data, ForkFormat::Local, b"hello", 0).unwrap();
        let mapper = ExtentMapper::new(&vol, &fork);
        assert_eq!(mapper.read_range(1, 3).unwrap(), b"ell");
        assert_eq!(mapper.read_range(3, 4).unwrap(), b"lo\0\0");
        assert!(mapper.all_extents().unwrap().is_empty());
    }

    #[test]
    fn inline_fork_reads_like_extent_list_with_same_bytes() {
        let payload: Vec<u8> = (0..300_u32).map(|i| (i * 7 % 251) as u8).collect();
        let vol = volume(image(&[(30, payload.clone())]));
        let local = Fork::new(InodeNumber(128), 2, ForkKind::Data, ForkFormat::Local, &payload, 0).unwrap();
        let list = list_fork(&[rec(0, 30, 1, false)]);

        let inline = ExtentMapper::new(&vol, &local);
        let mapped = ExtentMapper::new(&vol, &list);
        for (offset, len) in [(0, payload.len()), (1, 17), (123, 100), (299, 1)] {
            let expected = &payload[offset as usize..offset as usize + len];
            assert_eq!(inline.read_range(offset, len).unwrap(), expected, "{offset}+{len}");
            assert_eq!(mapped.read_range(offset, len).unwrap(), expected, "{offset}+{len}");
        }
    }

    #[test]
    fn metadata_reads_refuse_holes() {
        let vol = volume(image(&[]));
        let fork = list_fork(&sample_recs());
        let mapper = ExtentMapper::new(&vol, &fork);

        let ok = mapper.read_metadata(FileBlock(1), 2).unwrap();
        assert!(ok[..BS].iter().all(|b| *b == 11));
        assert!(ok[BS..].iter().all(|b| *b == 12));

        assert!(mapper.read_metadata(FileBlock(4), 2).unwrap_err().is_corruption());
        assert!(mapper.read_metadata(FileBlock(8), 1).unwrap_err().is_corruption());
    }

    // ── Btree fork ──────────────────────────────────────────────────────────────

    #[test]
    fn btree_fork_matches_extent_list() {
        let recs = sample_recs();
        let vol = volume(image(&[(40, bmap_leaf(&recs))]));
        let tree_fork = btree_fork(40);
        let list = list_fork(&recs);

        let tree = ExtentMapper::new(&vol, &tree_fork);
        let flat = ExtentMapper::new(&vol, &list);
        assert_eq!(tree.all_extents().unwrap(), flat.all_extents().unwrap());
        assert_eq!(
            tree.read_range(0, 10 * BS).unwrap(),
            flat.read_range(0, 10 * BS).unwrap()
        );
        for block in 0..12 {
            assert_eq!(
                tree.extent_at(FileBlock(block)).unwrap(),
                flat.extent_at(FileBlock(block)).unwrap(),
                "block {block}"
            );
        }
    }

    #[test]
    fn btree_fork_with_bad_child_is_corrupt() {
        let vol = volume(image(&[]));
        let fork = btree_fork(40);
        let err = ExtentMapper::new(&vol, &fork).all_extents().unwrap_err();
        assert!(err.is_corruption(), "{err:?}");
    }

    // ── Hash-index node reader ──────────────────────────────────────────────────

    #[test]
    fn da_reader_stitches_discontiguous_fork_blocks() {
        let vol = volume(image(&[]));
        let fork = list_fork(&[rec(0, 50, 1, false), rec(1, 52, 1, false)]);
        let reader = DaNodeReader::new(ExtentMapper::new(&vol, &fork), 2);
        let node = reader.read_node(0).unwrap();
        assert_eq!(node.len(), 2 * BS);
        assert_eq!(node[0], 50);
        assert_eq!(node[BS], 52);
        assert_eq!(reader.node_address(1), 52);
        assert!(reader.read_node(5).is_err());
    }

    // ── Properties ──────────────────────────────────────────────────────────────

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Lookups and reads agree with a block-by-block model of the map.
        #[test]
        fn mapping_agrees_with_block_model(runs in proptest::collection::vec((0_u64..3, 1_u64..4), 1..6)) {
            let mut recs = Vec::new();
            let mut model = Vec::new();
            let (mut logical, mut physical) = (0_u64, 8_u64);
            for (gap, len) in runs {
                model.extend(std::iter::repeat_n(None, gap as usize));
                logical += gap;
                recs.push(rec(logical, physical, len, false));
                model.extend((0..len).map(|i| Some(physical + i)));
                logical += len;
                physical += len + 1;
            }
            let vol = volume(image(&[]));
            let fork = list_fork(&recs);
            let mapper = ExtentMapper::new(&vol, &fork);

            for (block, expected) in model.iter().enumerate() {
                let got = mapper.extent_at(FileBlock(block as u64)).unwrap();
                match (got, expected) {
                    (Mapping::Mapped(e), Some(phys)) => {
                        prop_assert_eq!(e.physical(FileBlock(block as u64)).0, *phys);
                    }
                    (Mapping::Hole { until: Some(next) }, None) => {
                        prop_assert!(next.0 > block as u64);
                        prop_assert!(model[next.0 as usize].is_some());
                    }
                    (other, _) => prop_assert!(false, "block {}: {:?} vs {:?}", block, other, expected),
                }
            }

            let data = mapper.read_range(0, model.len() * BS).unwrap();
            for (block, expected) in model.iter().enumerate() {
                let want = expected.map_or(0, |p| p as u8);
                prop_assert!(data[block * BS..(block + 1) * BS].iter().all(|b| *b == want));
            }
        }
    }
}
