//! Allocation group headers and the per-AG btrees they root.
//!
//! AGF and AGI are read on first use and kept for the session. The trees
//! themselves are walked fresh on every query.

use crate::Filesystem;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{debug, trace};
use xfs_btree::{
    Btree, BtreeRoot, BtreeShape, Direction, FreeSpaceByBlock, FreeSpaceBySize, InodeIndex,
    RefCount, ReverseMap, Traversal, corrupt_at,
};
use xfs_error::{Result, XfsError};
use xfs_extent::AgNodeReader;
use xfs_ondisk::ag::{AGF_SECTOR, AGI_SECTOR};
use xfs_ondisk::btree::XFS_INODES_PER_CHUNK;
use xfs_ondisk::checksum::{AGF_CRC_OFFSET, AGI_CRC_OFFSET};
use xfs_ondisk::{Agf, Agi, BtreeRootInfo, InobtRec};
use xfs_types::{AgInode, AgNumber, InodeNumber, u64_to_usize};

/// Lazily loaded headers of one allocation group.
#[derive(Debug, Default)]
pub(crate) struct AgSlot {
    agf: OnceLock<Agf>,
    agi: OnceLock<Agi>,
}

/// Lazy record sequence of one AG btree.
pub type AgRecords<'a, S> = Traversal<S, AgNodeReader<'a>>;

/// Space and inode accounting of one allocation group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgSummary {
    pub ag: u32,
    pub start_block: u64,
    pub length: u32,
    pub free_blocks: u32,
    pub longest_free: u32,
    pub inode_count: u32,
    pub free_inodes: u32,
}

impl Filesystem {
    fn slot(&self, ag: AgNumber) -> Result<&AgSlot> {
        usize::try_from(ag.0)
            .ok()
            .and_then(|i| self.ags.get(i))
            .ok_or_else(|| {
                XfsError::InvalidArgument(format!(
                    "allocation group {ag} out of range (volume has {})",
                    self.ags.len()
                ))
            })
    }

    /// Read the header sector `sector` of `ag`, returning the bytes and the
    /// linear block holding them.
    fn read_ag_sector(&self, ag: AgNumber, sector: u32) -> Result<(Vec<u8>, u64)> {
        let geo = self.volume.geometry();
        let start = geo.ag_start(ag).0;
        let offset = geo
            .ag_sector_offset(ag, sector)
            .map_err(|e| corrupt_at(start, &e))?;
        let len = u64_to_usize(u64::from(geo.sector_size), "sector_size")
            .map_err(|e| corrupt_at(start, &e))?;
        let block = offset.0 / self.volume.block_size();
        trace!(ag = ag.0, sector, block, "read_ag_sector");
        Ok((self.volume.read_bytes(offset, len)?, block))
    }

    /// Free space header of `ag`.
    pub fn agf(&self, ag: AgNumber) -> Result<&Agf> {
        let slot = self.slot(ag)?;
        if let Some(agf) = slot.agf.get() {
            return Ok(agf);
        }
        let (buf, block) = self.read_ag_sector(ag, AGF_SECTOR)?;
        self.volume.verify("agf", block, &buf, AGF_CRC_OFFSET)?;
        let agf = Agf::parse(&buf, self.volume.geometry().has_crc)
            .map_err(|e| corrupt_at(block, &e))?;
        self.check_ag_header("agf", ag, block, agf.seqno, agf.length)?;
        debug!(
            ag = ag.0,
            free = agf.free_blocks,
            bno_level = agf.by_block.level,
            cnt_level = agf.by_size.level,
            "agf_loaded"
        );
        Ok(slot.agf.get_or_init(|| agf))
    }

    /// Inode header of `ag`.
    pub fn agi(&self, ag: AgNumber) -> Result<&Agi> {
        let slot = self.slot(ag)?;
        if let Some(agi) = slot.agi.get() {
            return Ok(agi);
        }
        let (buf, block) = self.read_ag_sector(ag, AGI_SECTOR)?;
        self.volume.verify("agi", block, &buf, AGI_CRC_OFFSET)?;
        let geo = self.volume.geometry();
        let agi = Agi::parse(&buf, geo.has_crc, geo.finobt).map_err(|e| corrupt_at(block, &e))?;
        self.check_ag_header("agi", ag, block, agi.seqno, agi.length)?;
        debug!(
            ag = ag.0,
            count = agi.count,
            free = agi.free_count,
            level = agi.inodes.level,
            "agi_loaded"
        );
        Ok(slot.agi.get_or_init(|| agi))
    }

    fn check_ag_header(&self, what: &str, ag: AgNumber, block: u64, seqno: u32, length: u32) -> Result<()> {
        if seqno != ag.0 {
            return Err(XfsError::corrupt(
                block,
                format!("{what} of allocation group {ag} claims sequence {seqno}"),
            ));
        }
        let expected = self.volume.geometry().ag_length(ag);
        if length != expected {
            return Err(XfsError::corrupt(
                block,
                format!("{what} length {length} disagrees with geometry ({expected} blocks)"),
            ));
        }
        Ok(())
    }

    /// Header counters of `ag`.
    pub fn ag_summary(&self, ag: AgNumber) -> Result<AgSummary> {
        let agf = self.agf(ag)?;
        let agi = self.agi(ag)?;
        Ok(AgSummary {
            ag: ag.0,
            start_block: self.volume.geometry().ag_start(ag).0,
            length: agf.length,
            free_blocks: agf.free_blocks,
            longest_free: agf.longest,
            inode_count: agi.count,
            free_inodes: agi.free_count,
        })
    }

    fn ag_tree<S: BtreeShape + Clone>(&self, ag: AgNumber, shape: S, root: BtreeRootInfo) -> AgRecords<'_, S> {
        Btree::new(shape, AgNodeReader::new(&self.volume, ag), self.volume.checksums())
            .traverse(&BtreeRoot::Block(u64::from(root.root)), Direction::Forward)
    }

    /// Free extents of `ag` in ascending start block order.
    pub fn free_extents_by_block(&self, ag: AgNumber) -> Result<AgRecords<'_, FreeSpaceByBlock>> {
        let root = self.agf(ag)?.by_block;
        let crc = self.volume.geometry().has_crc;
        Ok(self.ag_tree(ag, FreeSpaceByBlock { crc }, root))
    }

    /// Free extents of `ag` in ascending (length, start block) order.
    pub fn free_extents_by_size(&self, ag: AgNumber) -> Result<AgRecords<'_, FreeSpaceBySize>> {
        let root = self.agf(ag)?.by_size;
        let crc = self.volume.geometry().has_crc;
        Ok(self.ag_tree(ag, FreeSpaceBySize { crc }, root))
    }

    /// Inode chunks of `ag` in ascending AG inode order.
    pub fn inode_chunks(&self, ag: AgNumber) -> Result<AgRecords<'_, InodeIndex>> {
        let root = self.agi(ag)?.inodes;
        Ok(self.ag_tree(ag, self.inode_index(false), root))
    }

    /// Chunks with at least one free inode, from the free inode btree.
    pub fn free_inode_chunks(&self, ag: AgNumber) -> Result<AgRecords<'_, InodeIndex>> {
        let root = self
            .agi(ag)?
            .free_inodes
            .ok_or_else(|| XfsError::UnsupportedFeature("free inode btree (finobt)".into()))?;
        Ok(self.ag_tree(ag, self.inode_index(true), root))
    }

    fn inode_index(&self, free: bool) -> InodeIndex {
        let geo = self.volume.geometry();
        InodeIndex {
            crc: geo.has_crc,
            sparse: geo.sparse_inodes,
            free,
        }
    }

    /// Reverse mappings of `ag`. Requires the rmapbt feature.
    pub fn rmaps(&self, ag: AgNumber) -> Result<AgRecords<'_, ReverseMap>> {
        if !self.volume.geometry().rmapbt {
            return Err(XfsError::UnsupportedFeature(
                "reverse-mapping btree (rmapbt)".into(),
            ));
        }
        let root = self.agf(ag)?.rmap;
        Ok(self.ag_tree(ag, ReverseMap, root))
    }

    /// Shared extent reference counts of `ag`. Requires the reflink feature.
    pub fn refcounts(&self, ag: AgNumber) -> Result<AgRecords<'_, RefCount>> {
        if !self.volume.geometry().reflink {
            return Err(XfsError::UnsupportedFeature(
                "reference-count btree (reflink)".into(),
            ));
        }
        let root = self.agf(ag)?.refcount;
        Ok(self.ag_tree(ag, RefCount, root))
    }

    /// Every allocated inode on the volume in ascending number order.
    #[must_use]
    pub fn inodes(&self) -> AllocatedInodes<'_> {
        AllocatedInodes {
            fs: self,
            next_ag: 0,
            chunks: None,
            chunk: None,
            done: false,
        }
    }
}

// ── Inode enumeration ───────────────────────────────────────────────────────

/// Lazy walk over every AG's inode btree. Fuses after the first error.
pub struct AllocatedInodes<'a> {
    fs: &'a Filesystem,
    next_ag: u32,
    chunks: Option<(AgNumber, AgRecords<'a, InodeIndex>)>,
    /// Current chunk and the next index inside it.
    chunk: Option<(AgNumber, InobtRec, u32)>,
    done: bool,
}

impl std::fmt::Debug for AllocatedInodes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedInodes")
            .field("next_ag", &self.next_ag)
            .field("chunk", &self.chunk)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl AllocatedInodes<'_> {
    fn pull(&mut self) -> Result<Option<InodeNumber>> {
        let fs = self.fs;
        let geo = fs.volume.geometry();
        loop {
            if let Some((ag, rec, index)) = &mut self.chunk {
                while *index < XFS_INODES_PER_CHUNK {
                    let i = *index;
                    *index += 1;
                    if rec.is_allocated(i) {
                        let agino = rec.start_ino.checked_add(i).ok_or_else(|| {
                            XfsError::corrupt(geo.ag_start(*ag).0, "inode chunk overflows AG inode space")
                        })?;
                        return Ok(Some(geo.make_ino(*ag, AgInode(agino))));
                    }
                }
                self.chunk = None;
            }

            if let Some((ag, chunks)) = &mut self.chunks {
                match chunks.next() {
                    Some(rec) => {
                        let rec = rec?;
                        trace!(ag = ag.0, start = rec.start_ino, free = rec.free_count, "inode_chunk");
                        self.chunk = Some((*ag, rec, 0));
                        continue;
                    }
                    None => self.chunks = None,
                }
            }

            if self.next_ag >= geo.ag_count {
                return Ok(None);
            }
            let ag = AgNumber(self.next_ag);
            self.next_ag += 1;
            self.chunks = Some((ag, fs.inode_chunks(ag)?));
        }
    }
}

impl Iterator for AllocatedInodes<'_> {
    type Item = Result<InodeNumber>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.pull() {
            Ok(Some(ino)) => Some(Ok(ino)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
