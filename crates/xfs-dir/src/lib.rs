#![forbid(unsafe_code)]
//! Directory decoding.
//!
//! XFS picks one of four storage forms for a directory as it grows:
//!
//! | Form | Entries | Name index |
//! |------|---------|------------|
//! | Shortform | data fork literal area | none |
//! | Block | one directory block | hash array before the block tail |
//! | Leaf | data blocks below the leaf offset | one leaf1 block |
//! | Node | data blocks below the leaf offset | DA btree over leafn blocks |
//!
//! [`Directory::entries`] walks entries in storage order and never touches
//! the name index. [`Directory::lookup`] hashes the name, follows the index
//! to candidate entries, and compares stored names, so a hash collision is
//! never reported as a match.
//!
//! `.` and `..` are not yielded by either operation; [`Directory::parent`]
//! exposes the parent reference.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::{debug, trace};
use xfs_btree::{Btree, BtreeRoot, DirHashIndex, NodeReader, corrupt_at};
use xfs_error::{Result, XfsError};
use xfs_extent::{DaNodeReader, ExtentMapper, Extents, Mapping, Volume};
use xfs_inode::InodeRecord;
use xfs_ondisk::checksum::{DA3_CRC_OFFSET, DIR3_DATA_CRC_OFFSET};
use xfs_ondisk::da::DaNodeHeader;
use xfs_ondisk::dir2::{
    BlockTail, DataSlot, LeafEntry, LeafHeader, SfDirEntry, SfDirHeader, XFS_DIR2_LEAF_ENTRY_LEN,
    ascii_ci_hashname, block_magic, check_data_header, data_magic, leaf1_magic, leafn_magic,
};
use xfs_ondisk::{DaBlkInfo, FileType, da_hashname};
use xfs_types::{FileBlock, InodeNumber, ParseError, read_be_u64};

/// Longest name a directory entry can carry.
pub const MAX_NAME_LEN: usize = 255;

/// Owner field of a v5 data or block header (`xfs_dir3_blk_hdr`).
const DIR3_OWNER_OFFSET: usize = 40;

// ── Entries ─────────────────────────────────────────────────────────────────

/// One directory entry. Names are raw bytes; XFS does not require UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub ino: InodeNumber,
    /// Type hint stored with the entry; `Unknown` without the ftype feature.
    pub file_type: FileType,
}

impl DirEntry {
    #[must_use]
    pub fn name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirForm {
    Shortform,
    Block,
    Leaf,
    Node,
}

impl DirForm {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Shortform => "shortform",
            Self::Block => "block",
            Self::Leaf => "leaf",
            Self::Node => "node",
        }
    }
}

fn is_dot(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

fn file_type(raw: Option<u8>) -> FileType {
    raw.map_or(FileType::Unknown, FileType::from_raw)
}

// ── Directory ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Layout<'a> {
    Shortform { header: SfDirHeader, bytes: &'a [u8] },
    Block,
    Leaf,
    Node,
}

/// A directory inode bound to the volume it lives on.
#[derive(Debug, Clone, Copy)]
pub struct Directory<'a> {
    volume: &'a Volume,
    inode: &'a InodeRecord,
    layout: Layout<'a>,
}

impl<'a> Directory<'a> {
    /// Recognize the storage form of `inode`'s data fork.
    ///
    /// A mapped fork with nothing past its first directory block is block
    /// form. Larger directories are told apart by the magic of the block at
    /// the leaf offset: leaf1 means leaf form, a DA node or leafn means node
    /// form.
    pub fn open(volume: &'a Volume, inode: &'a InodeRecord) -> Result<Self> {
        if !inode.is_directory() {
            return Err(XfsError::NotDirectory);
        }
        let geo = volume.geometry();
        let layout = if let Some(fork) = inode.data_fork.inline_bytes() {
            let size = usize::try_from(inode.size()).unwrap_or(usize::MAX);
            let bytes = &fork[..fork.len().min(size)];
            let header = SfDirHeader::parse(bytes).map_err(|e| corrupt_at(inode.block, &e))?;
            Layout::Shortform { header, bytes }
        } else if let Mapping::Hole { until: None } =
            ExtentMapper::new(volume, &inode.data_fork).extent_at(FileBlock(geo.dir_block_fsbs()))?
        {
            if inode.size() != u64::from(geo.dir_block_size()) {
                return Err(XfsError::corrupt(
                    inode.block,
                    format!("block directory {} has size {}", inode.number, inode.size()),
                ));
            }
            Layout::Block
        } else {
            let leaf_block = geo.dir_leaf_block();
            let reader = DaNodeReader::new(
                ExtentMapper::new(volume, &inode.data_fork),
                geo.dir_block_fsbs(),
            );
            let bytes = reader.read_node(leaf_block.0)?;
            let address = reader.node_address(leaf_block.0);
            let magic = DaBlkInfo::peek_magic(&bytes).map_err(|e| corrupt_at(address, &e))?;
            let crc = geo.has_crc;
            if magic == leaf1_magic(crc) {
                Layout::Leaf
            } else if magic == leafn_magic(crc) || magic == DaNodeHeader::magic(crc) {
                Layout::Node
            } else {
                return Err(XfsError::corrupt(
                    address,
                    format!("directory {} leaf block has magic {magic:#06x}", inode.number),
                ));
            }
        };
        let dir = Self {
            volume,
            inode,
            layout,
        };
        debug!(
            ino = inode.number.0,
            form = dir.form().name(),
            size = inode.size(),
            "dir_form"
        );
        Ok(dir)
    }

    #[must_use]
    pub fn form(&self) -> DirForm {
        match self.layout {
            Layout::Shortform { .. } => DirForm::Shortform,
            Layout::Block => DirForm::Block,
            Layout::Leaf => DirForm::Leaf,
            Layout::Node => DirForm::Node,
        }
    }

    #[must_use]
    pub fn inode(&self) -> &'a InodeRecord {
        self.inode
    }

    fn reader(&self) -> DaNodeReader<'a> {
        DaNodeReader::new(
            ExtentMapper::new(self.volume, &self.inode.data_fork),
            self.volume.geometry().dir_block_fsbs(),
        )
    }

    /// Lazy entry sequence in storage order.
    ///
    /// Shortform entries come in the order stored in the inode. Block, leaf,
    /// and node directories yield each data block's entries in offset order,
    /// data blocks in ascending logical order.
    #[must_use]
    pub fn entries(&self) -> Entries<'a> {
        let state = match self.layout {
            Layout::Shortform { header, bytes } => State::Shortform {
                bytes,
                width: header.ino_width(),
                offset: header.len(),
                remaining: header.entry_count(),
            },
            Layout::Block => State::Blocks {
                numbers: BlockNumbers::Single(Some(FileBlock(0))),
                current: None,
            },
            Layout::Leaf | Layout::Node => {
                let geo = self.volume.geometry();
                State::Blocks {
                    numbers: BlockNumbers::Walk {
                        extents: ExtentMapper::new(self.volume, &self.inode.data_fork).extents(),
                        step: geo.dir_block_fsbs(),
                        limit: geo.dir_leaf_block().0,
                        next: 0,
                        run_end: 0,
                    },
                    current: None,
                }
            }
        };
        Entries { dir: *self, state }
    }

    /// Inode number of the parent directory (the `..` entry).
    pub fn parent(&self) -> Result<InodeNumber> {
        if let Layout::Shortform { header, .. } = self.layout {
            return Ok(InodeNumber(header.parent));
        }
        let block = self.read_data_block(FileBlock(0))?;
        let mut offset = block.start;
        while offset < block.end {
            let slot = block.slot(offset, self.has_ftype())?;
            offset += slot.len();
            if let DataSlot::Entry { ino, name, .. } = slot {
                if name == b".." {
                    return Ok(InodeNumber(ino));
                }
            }
        }
        Err(XfsError::corrupt(
            block.address,
            format!("directory {} has no '..' entry", self.inode.number),
        ))
    }

    /// Find the entry called `name`.
    ///
    /// Returns `Ok(None)` for names the directory does not contain,
    /// including `.` and `..`. On ASCII case-insensitive volumes an exact
    /// match wins over a case-folded one.
    pub fn lookup(&self, name: &[u8]) -> Result<Option<DirEntry>> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || is_dot(name) {
            return Ok(None);
        }
        let ci = self.volume.geometry().ascii_ci;
        let hash = if ci {
            ascii_ci_hashname(name)
        } else {
            da_hashname(name)
        };
        let mut matcher = Matcher {
            wanted: name,
            ci,
            folded: None,
        };
        let exact = match self.layout {
            Layout::Shortform { .. } => self.lookup_shortform(&mut matcher)?,
            Layout::Block => self.lookup_block(hash, &mut matcher)?,
            Layout::Leaf => self.lookup_leaf(hash, &mut matcher)?,
            Layout::Node => self.lookup_node(hash, &mut matcher)?,
        };
        let found = exact.or(matcher.folded);
        trace!(
            ino = self.inode.number.0,
            hash,
            found = found.is_some(),
            "dir_lookup"
        );
        Ok(found)
    }

    fn lookup_shortform(&self, matcher: &mut Matcher<'_>) -> Result<Option<DirEntry>> {
        for entry in self.entries() {
            if let Some(hit) = matcher.offer(entry?) {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    fn lookup_block(&self, hash: u32, matcher: &mut Matcher<'_>) -> Result<Option<DirEntry>> {
        let block = self.read_data_block(FileBlock(0))?;
        let tail = BlockTail::parse(&block.bytes).map_err(|e| corrupt_at(block.address, &e))?;
        let index = hash_index(&block.bytes, block.end, tail.count as usize)
            .map_err(|e| corrupt_at(block.address, &e))?;
        let mut cache = Some(block);
        self.probe(&index, hash, &mut cache, matcher)
    }

    fn lookup_leaf(&self, hash: u32, matcher: &mut Matcher<'_>) -> Result<Option<DirEntry>> {
        let geo = self.volume.geometry();
        let reader = self.reader();
        let leaf_block = geo.dir_leaf_block().0;
        let address = reader.node_address(leaf_block);
        let bytes = reader.read_node(leaf_block)?;
        let header = LeafHeader::parse(&bytes, geo.has_crc).map_err(|e| corrupt_at(address, &e))?;
        if !header.is_leaf1() {
            return Err(XfsError::corrupt(address, "leaf directory index is not a leaf1 block"));
        }
        self.volume.verify("dir_leaf", address, &bytes, DA3_CRC_OFFSET)?;
        self.check_owner(address, header.info.owner)?;
        let index = hash_index(&bytes, LeafHeader::len(geo.has_crc), usize::from(header.count))
            .map_err(|e| corrupt_at(address, &e))?;
        self.probe(&index, hash, &mut None, matcher)
    }

    fn lookup_node(&self, hash: u32, matcher: &mut Matcher<'_>) -> Result<Option<DirEntry>> {
        let geo = self.volume.geometry();
        let tree = Btree::new(
            DirHashIndex { crc: geo.has_crc },
            self.reader(),
            self.volume.checksums(),
        );
        let root = BtreeRoot::Block(geo.dir_leaf_block().0);
        let mut cache = None;
        for record in tree.range_from(&root, hash) {
            let record = record?;
            if record.hashval > hash {
                break;
            }
            if record.hashval < hash || record.is_stale() {
                continue;
            }
            let entry = self.entry_at(record.address, &mut cache)?;
            if let Some(hit) = matcher.offer(entry) {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Check every live index entry carrying `hash`. The index is sorted by
    /// hash; equal hashes are adjacent.
    fn probe(
        &self,
        index: &[LeafEntry],
        hash: u32,
        cache: &mut Option<DataBlock>,
        matcher: &mut Matcher<'_>,
    ) -> Result<Option<DirEntry>> {
        let first = index.partition_point(|e| e.hashval < hash);
        for candidate in index[first..].iter().take_while(|e| e.hashval == hash) {
            if candidate.is_stale() {
                continue;
            }
            let entry = self.entry_at(candidate.address, cache)?;
            if let Some(hit) = matcher.offer(entry) {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Decode the entry a hash index address points at.
    fn entry_at(&self, address: u32, cache: &mut Option<DataBlock>) -> Result<DirEntry> {
        let geo = self.volume.geometry();
        let (number, offset) = geo.dataptr_to_dir_block(address);
        if number >= geo.dir_leaf_block() || (self.form() == DirForm::Block && number.0 != 0) {
            return Err(XfsError::corrupt(
                self.inode.block,
                format!("directory {} index points outside data blocks ({address:#x})", self.inode.number),
            ));
        }
        let block = match cache.take() {
            Some(block) if block.number == number => block,
            _ => self.read_data_block(number)?,
        };
        let slot = if offset < block.start || offset >= block.end {
            Err(XfsError::corrupt(
                block.address,
                format!("index address {address:#x} outside the entry area"),
            ))
        } else {
            block.slot(offset, self.has_ftype())
        };
        let address_block = block.address;
        *cache = Some(block);
        match slot? {
            DataSlot::Entry {
                ino, name, ftype, ..
            } => Ok(DirEntry {
                name,
                ino: InodeNumber(ino),
                file_type: file_type(ftype),
            }),
            DataSlot::Unused { .. } => Err(XfsError::corrupt(
                address_block,
                format!("index address {address:#x} points at unused space"),
            )),
        }
    }

    fn has_ftype(&self) -> bool {
        self.volume.geometry().has_ftype
    }

    fn check_owner(&self, address: u64, owner: Option<u64>) -> Result<()> {
        match owner {
            Some(owner) if owner != self.inode.number.0 => Err(XfsError::corrupt(
                address,
                format!(
                    "directory block owned by inode {owner}, expected {}",
                    self.inode.number
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Read and validate the data (or single block-form) block at `number`.
    fn read_data_block(&self, number: FileBlock) -> Result<DataBlock> {
        let geo = self.volume.geometry();
        let crc = geo.has_crc;
        let reader = self.reader();
        let bytes = reader.read_node(number.0)?;
        let address = reader.node_address(number.0);
        let is_block = self.form() == DirForm::Block;
        let magic = if is_block { block_magic(crc) } else { data_magic(crc) };
        let start = check_data_header(&bytes, magic, crc).map_err(|e| corrupt_at(address, &e))?;
        self.volume.verify("dir_data", address, &bytes, DIR3_DATA_CRC_OFFSET)?;
        if crc {
            let owner = read_be_u64(&bytes, DIR3_OWNER_OFFSET).map_err(|e| corrupt_at(address, &e))?;
            self.check_owner(address, Some(owner))?;
        }
        let end = if is_block {
            BlockTail::parse(&bytes)
                .and_then(|tail| tail.leaf_start(bytes.len(), start))
                .map_err(|e| corrupt_at(address, &e))?
        } else {
            bytes.len()
        };
        trace!(ino = self.inode.number.0, block = number.0, address, "dir_data_block");
        Ok(DataBlock {
            number,
            address,
            bytes,
            start,
            end,
        })
    }
}

/// Decode `count` hash index entries starting at byte `start`.
fn hash_index(bytes: &[u8], start: usize, count: usize) -> std::result::Result<Vec<LeafEntry>, ParseError> {
    (0..count)
        .map(|i| LeafEntry::parse(bytes, start + i * XFS_DIR2_LEAF_ENTRY_LEN))
        .collect()
}

// ── Name matching ───────────────────────────────────────────────────────────

struct Matcher<'n> {
    wanted: &'n [u8],
    ci: bool,
    folded: Option<DirEntry>,
}

impl Matcher<'_> {
    /// Returns the entry on an exact match; remembers the first case-folded one.
    fn offer(&mut self, entry: DirEntry) -> Option<DirEntry> {
        if entry.name == self.wanted {
            return Some(entry);
        }
        if self.ci && self.folded.is_none() && entry.name.eq_ignore_ascii_case(self.wanted) {
            self.folded = Some(entry);
        }
        None
    }
}

// ── Data blocks ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct DataBlock {
    number: FileBlock,
    address: u64,
    bytes: Vec<u8>,
    /// First byte after the header.
    start: usize,
    /// End of the entry area: the block end, or the hash array in block form.
    end: usize,
}

impl DataBlock {
    fn slot(&self, offset: usize, has_ftype: bool) -> Result<DataSlot> {
        DataSlot::parse(&self.bytes, offset, self.end, has_ftype)
            .map_err(|e| corrupt_at(self.address, &e))
    }
}

/// Fork-relative starting blocks of the directory's data blocks.
enum BlockNumbers<'a> {
    Single(Option<FileBlock>),
    Walk {
        extents: Extents<'a>,
        step: u64,
        limit: u64,
        next: u64,
        run_end: u64,
    },
}

impl Iterator for BlockNumbers<'_> {
    type Item = Result<FileBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Single(block) => block.take().map(Ok),
            Self::Walk {
                extents,
                step,
                limit,
                next,
                run_end,
            } => loop {
                if *next < *run_end && *next < *limit {
                    let block = FileBlock(*next);
                    *next += *step;
                    return Some(Ok(block));
                }
                let extent = match extents.next()? {
                    Ok(extent) => extent,
                    Err(err) => return Some(Err(err)),
                };
                if extent.file_offset.0 >= *limit {
                    return None;
                }
                let first = extent.file_offset.0 / *step * *step;
                *next = (*next).max(first);
                *run_end = extent.file_end();
            },
        }
    }
}

// ── Entry iterator ──────────────────────────────────────────────────────────

enum State<'a> {
    Shortform {
        bytes: &'a [u8],
        width: usize,
        offset: usize,
        remaining: usize,
    },
    Blocks {
        numbers: BlockNumbers<'a>,
        /// Block being walked and the offset of its next slot.
        current: Option<(DataBlock, usize)>,
    },
    Done,
}

/// Lazy entry sequence of one directory. Fuses after the first error.
pub struct Entries<'a> {
    dir: Directory<'a>,
    state: State<'a>,
}

impl std::fmt::Debug for Entries<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entries")
            .field("ino", &self.dir.inode.number)
            .field("form", &self.dir.form())
            .field("done", &matches!(self.state, State::Done))
            .finish()
    }
}

impl Entries<'_> {
    fn pull(&mut self) -> Result<Option<DirEntry>> {
        let Self { dir, state } = self;
        let has_ftype = dir.has_ftype();
        match state {
            State::Done => Ok(None),
            State::Shortform {
                bytes,
                width,
                offset,
                remaining,
            } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let entry = SfDirEntry::parse(*bytes, *offset, has_ftype, *width)
                    .map_err(|e| corrupt_at(dir.inode.block, &e))?;
                *offset += entry.len;
                *remaining -= 1;
                Ok(Some(DirEntry {
                    name: entry.name,
                    ino: InodeNumber(entry.ino),
                    file_type: file_type(entry.ftype),
                }))
            }
            State::Blocks { numbers, current } => loop {
                if let Some((block, offset)) = current {
                    while *offset < block.end {
                        let slot = block.slot(*offset, has_ftype)?;
                        *offset += slot.len();
                        if let DataSlot::Entry {
                            ino, name, ftype, ..
                        } = slot
                        {
                            if is_dot(&name) {
                                continue;
                            }
                            return Ok(Some(DirEntry {
                                name,
                                ino: InodeNumber(ino),
                                file_type: file_type(ftype),
                            }));
                        }
                    }
                    *current = None;
                }
                let Some(number) = numbers.next().transpose()? else {
                    return Ok(None);
                };
                let block = dir.read_data_block(number)?;
                let start = block.start;
                *current = Some((block, start));
            },
        }
    }
}

impl Iterator for Entries<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.pull() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.state = State::Done;
                None
            }
            Err(err) => {
                debug!(ino = self.dir.inode.number.0, error = %err, "dir_walk_failed");
                self.state = State::Done;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use xfs_block::MemByteDevice;
    use xfs_inode::read_inode;
    use xfs_ondisk::checksum::{DINODE_CRC_OFFSET, update_crc};
    use xfs_ondisk::da::{XFS_DA_NODE_MAGIC, XFS_DA3_NODE_MAGIC};
    use xfs_ondisk::dinode::XFS_DINODE_MAGIC;
    use xfs_ondisk::dir2::{
        XFS_DIR2_DATA_FREE_TAG, XFS_DIR2_LEAF1_MAGIC, XFS_DIR2_LEAFN_MAGIC, data_entry_len,
        data_header_len,
    };
    use xfs_ondisk::{ChecksumPolicy, ExtentRecord, Geometry};
    use xfs_types::{BlockSize, FsBlock, S_IFDIR, S_IFREG};

    const BS: usize = 512;
    const BLOCKS: usize = 128;
    const ISIZE: usize = 256;
    const DIR_INO: u64 = 20;
    const PARENT_INO: u64 = 3;

    fn geometry(crc: bool, ascii_ci: bool) -> Geometry {
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
            root_ino: InodeNumber(DIR_INO),
            version: if crc { 5 } else { 4 },
            has_crc: crc,
            has_ftype: crc,
            sparse_inodes: false,
            finobt: false,
            rmapbt: false,
            reflink: false,
            bigtime: false,
            large_extent_counts: false,
            meta_uuid: false,
            ascii_ci,
        }
    }

    fn leaf_block() -> u64 {
        geometry(false, false).dir_leaf_block().0
    }

    // ── Image assembly ──────────────────────────────────────────────────────────

    struct Image {
        bytes: Vec<u8>,
        crc: bool,
        ascii_ci: bool,
    }

    impl Image {
        fn new(crc: bool) -> Self {
            Self {
                bytes: vec![0_u8; BS * BLOCKS],
                crc,
                ascii_ci: false,
            }
        }

        fn block(&mut self, block: usize, data: &[u8]) {
            self.bytes[block * BS..block * BS + data.len()].copy_from_slice(data);
        }

        /// Directory inode `DIR_INO` with the given data fork.
        fn dir_inode(&mut self, format: u8, size: u64, fork: &[u8], nextents: u32) {
            let v3 = self.crc;
            let mut b = vec![0_u8; ISIZE];
            b[0..2].copy_from_slice(&XFS_DINODE_MAGIC.to_be_bytes());
            b[2..4].copy_from_slice(&(S_IFDIR | 0o755).to_be_bytes());
            b[4] = if v3 { 3 } else { 2 };
            b[5] = format;
            b[16..20].copy_from_slice(&2_u32.to_be_bytes());
            b[56..64].copy_from_slice(&size.to_be_bytes());
            b[76..80].copy_from_slice(&nextents.to_be_bytes());
            let lit = if v3 {
                b[152..160].copy_from_slice(&DIR_INO.to_be_bytes());
                176
            } else {
                100
            };
            b[lit..lit + fork.len()].copy_from_slice(fork);
            if v3 {
                update_crc(&mut b, DINODE_CRC_OFFSET).unwrap();
            }
            let off = DIR_INO as usize * ISIZE;
            self.bytes[off..off + ISIZE].copy_from_slice(&b);
        }

        fn volume(self) -> Volume {
            Volume::new(
                Arc::new(MemByteDevice::new(self.bytes)),
                geometry(self.crc, self.ascii_ci),
                ChecksumPolicy::Strict,
            )
        }
    }

    fn extents(list: &[(u64, u64, u64)]) -> Vec<u8> {
        list.iter()
            .flat_map(|&(file_offset, start, count)| {
                ExtentRecord {
                    file_offset,
                    start_block: FsBlock(start),
                    block_count: count,
                    unwritten: false,
                }
                .encode()
            })
            .collect()
    }

    fn open_dir(vol: &Volume) -> InodeRecord {
        read_inode(vol, InodeNumber(DIR_INO)).unwrap()
    }

    fn names_of(dir: &Directory<'_>) -> Vec<(Vec<u8>, u64)> {
        dir.entries()
            .map(|e| e.map(|e| (e.name, e.ino.0)))
            .collect::<Result<_>>()
            .unwrap()
    }

    fn named(list: &[(&str, u64)]) -> Vec<(Vec<u8>, u64)> {
        list.iter().map(|(n, i)| (n.as_bytes().to_vec(), *i)).collect()
    }

    // ── Directory block builders ────────────────────────────────────────────────

    struct BlockWriter {
        bytes: Vec<u8>,
        cursor: usize,
        crc: bool,
    }

    impl BlockWriter {
        fn new(crc: bool) -> Self {
            Self {
                bytes: vec![0_u8; BS],
                cursor: data_header_len(crc),
                crc,
            }
        }

        fn fits(&self, name: &[u8], limit: usize) -> bool {
            self.cursor + data_entry_len(name.len(), self.crc) <= limit
        }

        /// Append an entry; returns its offset within the block.
        fn entry(&mut self, name: &[u8], ino: u64) -> usize {
            let off = self.cursor;
            let len = data_entry_len(name.len(), self.crc);
            let b = &mut self.bytes;
            b[off..off + 8].copy_from_slice(&ino.to_be_bytes());
            b[off + 8] = name.len() as u8;
            b[off + 9..off + 9 + name.len()].copy_from_slice(name);
            if self.crc {
                b[off + 9 + name.len()] = 1;
            }
            b[off + len - 2..off + len].copy_from_slice(&(off as u16).to_be_bytes());
            self.cursor += len;
            off
        }

        fn unused_until(&mut self, end: usize) {
            let off = self.cursor;
            if off < end {
                let len = end - off;
                self.bytes[off..off + 2].copy_from_slice(&XFS_DIR2_DATA_FREE_TAG.to_be_bytes());
                self.bytes[off + 2..off + 4].copy_from_slice(&(len as u16).to_be_bytes());
                self.bytes[end - 2..end].copy_from_slice(&(off as u16).to_be_bytes());
                self.cursor = end;
            }
        }

        fn finish(mut self, magic: u32) -> Vec<u8> {
            self.bytes[0..4].copy_from_slice(&magic.to_be_bytes());
            if self.crc {
                self.bytes[DIR3_OWNER_OFFSET..DIR3_OWNER_OFFSET + 8].copy_from_slice(&DIR_INO.to_be_bytes());
                update_crc(&mut self.bytes, DIR3_DATA_CRC_OFFSET).unwrap();
            }
            self.bytes
        }
    }

    fn dataptr(block: u64, offset: usize) -> u32 {
        ((block * BS as u64 + offset as u64) / 8) as u32
    }

    fn with_dots(names: &[(Vec<u8>, u64)]) -> Vec<(Vec<u8>, u64)> {
        let mut all = vec![(b".".to_vec(), DIR_INO), (b"..".to_vec(), PARENT_INO)];
        all.extend_from_slice(names);
        all
    }

    fn write_index(block: &mut [u8], start: usize, index: &[LeafEntry]) {
        for (i, e) in index.iter().enumerate() {
            let off = start + i * 8;
            block[off..off + 4].copy_from_slice(&e.hashval.to_be_bytes());
            block[off + 4..off + 8].copy_from_slice(&e.address.to_be_bytes());
        }
    }

    /// A block-form directory block holding `.`, `..`, and `names`, indexed
    /// with `hash`.
    fn block_form_hashed(crc: bool, names: &[(Vec<u8>, u64)], hash: fn(&[u8]) -> u32) -> Vec<u8> {
        let all = with_dots(names);
        let leaf_start = BS - 8 - 8 * all.len();
        let mut w = BlockWriter::new(crc);
        let mut index = Vec::new();
        for (name, ino) in &all {
            assert!(w.fits(name, leaf_start), "test directory too large for one block");
            let off = w.entry(name, *ino);
            index.push(LeafEntry {
                hashval: hash(name),
                address: dataptr(0, off),
            });
        }
        w.unused_until(leaf_start);
        index.sort_by_key(|e| e.hashval);
        write_index(&mut w.bytes, leaf_start, &index);
        w.bytes[BS - 8..BS - 4].copy_from_slice(&(all.len() as u32).to_be_bytes());
        w.finish(block_magic(crc))
    }

    fn block_form(crc: bool, names: &[(Vec<u8>, u64)]) -> Vec<u8> {
        block_form_hashed(crc, names, da_hashname)
    }

    /// v4 data blocks for `.`, `..`, and `names`, plus their unsorted hash index.
    fn data_blocks(names: &[(Vec<u8>, u64)]) -> (Vec<Vec<u8>>, Vec<LeafEntry>) {
        let mut blocks = Vec::new();
        let mut index = Vec::new();
        let mut w = BlockWriter::new(false);
        for (name, ino) in with_dots(names) {
            if !w.fits(&name, BS) {
                w.unused_until(BS);
                let full = std::mem::replace(&mut w, BlockWriter::new(false));
                blocks.push(full.finish(data_magic(false)));
            }
            let off = w.entry(&name, ino);
            index.push(LeafEntry {
                hashval: da_hashname(&name),
                address: dataptr(blocks.len() as u64, off),
            });
        }
        w.unused_until(BS);
        blocks.push(w.finish(data_magic(false)));
        (blocks, index)
    }

    /// A v4 leaf1 or leafn block holding `entries` in the given order.
    fn leaf_index(magic: u16, entries: &[LeafEntry], forw: u32, back: u32) -> Vec<u8> {
        let mut b = vec![0_u8; BS];
        b[0..4].copy_from_slice(&forw.to_be_bytes());
        b[4..8].copy_from_slice(&back.to_be_bytes());
        b[8..10].copy_from_slice(&magic.to_be_bytes());
        b[12..14].copy_from_slice(&(entries.len() as u16).to_be_bytes());
        let stale = entries.iter().filter(|e| e.is_stale()).count() as u16;
        b[14..16].copy_from_slice(&stale.to_be_bytes());
        write_index(&mut b, 16, entries);
        b
    }

    /// A v4 DA interior node with `(hashval, before)` entries.
    fn da_node(level: u16, entries: &[(u32, u32)]) -> Vec<u8> {
        let mut b = vec![0_u8; BS];
        b[8..10].copy_from_slice(&XFS_DA_NODE_MAGIC.to_be_bytes());
        b[12..14].copy_from_slice(&(entries.len() as u16).to_be_bytes());
        b[14..16].copy_from_slice(&level.to_be_bytes());
        for (i, (hash, before)) in entries.iter().enumerate() {
            let off = 16 + i * 8;
            b[off..off + 4].copy_from_slice(&hash.to_be_bytes());
            b[off + 4..off + 8].copy_from_slice(&before.to_be_bytes());
        }
        b
    }

    /// Block-form image: the directory block at physical 40.
    fn block_image(crc: bool, block: &[u8]) -> Image {
        let mut img = Image::new(crc);
        img.block(40, block);
        img.dir_inode(2, BS as u64, &extents(&[(0, 40, 1)]), 1);
        img
    }

    /// Leaf-form image: data blocks at physical 40.., leaf1 at physical 60.
    fn leaf_image(names: &[(Vec<u8>, u64)]) -> Image {
        let (blocks, mut index) = data_blocks(names);
        index.sort_by_key(|e| e.hashval);
        let mut img = Image::new(false);
        for (i, block) in blocks.iter().enumerate() {
            img.block(40 + i, block);
        }
        img.block(60, &leaf_index(XFS_DIR2_LEAF1_MAGIC, &index, 0, 0));
        let fork = extents(&[(0, 40, blocks.len() as u64), (leaf_block(), 60, 1)]);
        img.dir_inode(2, (blocks.len() * BS) as u64, &fork, 2);
        img
    }

    /// Node-form image: data blocks at physical 40.., DA root at the leaf
    /// offset (physical 70), leafn children at leaf offset + 1 and + 2.
    fn node_image(names: &[(Vec<u8>, u64)]) -> Image {
        let (blocks, mut index) = data_blocks(names);
        index.sort_by_key(|e| e.hashval);
        // Split on a hash boundary so equal hashes share a leaf.
        let mut split = index.len() / 2;
        while split > 0 && index[split].hashval == index[split - 1].hashval {
            split -= 1;
        }
        let (left, right) = index.split_at(split);
        let lb = leaf_block() as u32;
        let mut img = Image::new(false);
        for (i, block) in blocks.iter().enumerate() {
            img.block(40 + i, block);
        }
        let keys = [
            (left.last().unwrap().hashval, lb + 1),
            (right.last().unwrap().hashval, lb + 2),
        ];
        img.block(70, &da_node(1, &keys));
        img.block(71, &leaf_index(XFS_DIR2_LEAFN_MAGIC, left, lb + 2, 0));
        img.block(72, &leaf_index(XFS_DIR2_LEAFN_MAGIC, right, 0, lb + 1));
        let fork = extents(&[(0, 40, blocks.len() as u64), (leaf_block(), 70, 3)]);
        img.dir_inode(2, (blocks.len() * BS) as u64, &fork, 2);
        img
    }

    // ── Shortform ───────────────────────────────────────────────────────────────

    fn sf_fork(parent: u64, entries: &[(&str, u64)], ftype: bool) -> Vec<u8> {
        let mut sf = vec![entries.len() as u8, 0];
        sf.extend_from_slice(&(parent as u32).to_be_bytes());
        let mut offset = 0x60_u16;
        for (name, ino) in entries {
            sf.push(name.len() as u8);
            sf.extend_from_slice(&offset.to_be_bytes());
            sf.extend_from_slice(name.as_bytes());
            if ftype {
                sf.push(1);
            }
            sf.extend_from_slice(&(*ino as u32).to_be_bytes());
            offset += 16;
        }
        sf
    }

    #[test]
    fn shortform_entries_in_stored_order() {
        let mut img = Image::new(true);
        let fork = sf_fork(PARENT_INO, &[("a.txt", 131), ("sub", 132)], true);
        img.dir_inode(1, fork.len() as u64, &fork, 0);
        let vol = img.volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();

        assert_eq!(dir.form(), DirForm::Shortform);
        assert_eq!(names_of(&dir), named(&[("a.txt", 131), ("sub", 132)]));
        assert_eq!(dir.parent().unwrap(), InodeNumber(PARENT_INO));
        let first = dir.entries().next().unwrap().unwrap();
        assert_eq!(first.file_type, FileType::Regular);

        assert_eq!(dir.lookup(b"sub").unwrap().map(|e| e.ino), Some(InodeNumber(132)));
        assert_eq!(dir.lookup(b"missing").unwrap(), None);
        assert_eq!(dir.lookup(b"..").unwrap(), None);
    }

    #[test]
    fn shortform_overrun_is_corrupt_and_fuses() {
        let mut img = Image::new(false);
        let mut fork = sf_fork(PARENT_INO, &[("a.txt", 131), ("sub", 132)], false);
        // Claim a third entry that is not there.
        fork[0] = 3;
        img.dir_inode(1, fork.len() as u64, &fork, 0);
        let vol = img.volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();

        let mut entries = dir.entries();
        assert!(entries.next().unwrap().is_ok());
        assert!(entries.next().unwrap().is_ok());
        let err = entries.next().unwrap().unwrap_err();
        assert!(matches!(err, XfsError::CorruptFilesystem { block: 10, .. }), "{err:?}");
        assert!(entries.next().is_none());
    }

    #[test]
    fn empty_shortform_with_wide_parent_has_no_entries() {
        let parent = 1_u64 << 33;
        let mut fork = vec![0_u8, 1];
        fork.extend_from_slice(&parent.to_be_bytes());
        let mut img = Image::new(false);
        img.dir_inode(1, fork.len() as u64, &fork, 0);
        let vol = img.volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();

        assert_eq!(dir.form(), DirForm::Shortform);
        assert!(dir.entries().next().is_none());
        assert_eq!(dir.lookup(b"x").unwrap(), None);
        assert_eq!(dir.parent().unwrap(), InodeNumber(parent));
    }

    #[test]
    fn non_directory_is_rejected() {
        let mut img = Image::new(false);
        img.dir_inode(2, 0, &[], 0);
        let off = DIR_INO as usize * ISIZE;
        img.bytes[off + 2..off + 4].copy_from_slice(&(S_IFREG | 0o644).to_be_bytes());
        let vol = img.volume();
        let inode = open_dir(&vol);
        assert!(matches!(Directory::open(&vol, &inode), Err(XfsError::NotDirectory)));
    }

    // ── Block form ──────────────────────────────────────────────────────────────

    #[test]
    fn block_form_v5_entries_and_lookup() {
        let names = named(&[("alpha", 200), ("beta", 201), ("gamma", 202)]);
        let vol = block_image(true, &block_form(true, &names)).volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();

        assert_eq!(dir.form(), DirForm::Block);
        assert_eq!(names_of(&dir), names);
        assert_eq!(dir.parent().unwrap(), InodeNumber(PARENT_INO));
        for (name, ino) in &names {
            let hit = dir.lookup(name).unwrap().expect("present");
            assert_eq!((hit.ino.0, hit.file_type), (*ino, FileType::Regular));
        }
        assert_eq!(dir.lookup(b"delta").unwrap(), None);
    }

    #[test]
    fn block_form_checksum_and_owner_are_enforced() {
        let names = named(&[("alpha", 200)]);
        let mut block = block_form(true, &names);
        block[100] ^= 1;
        let vol = block_image(true, &block).volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();
        let err = dir.entries().next().unwrap().unwrap_err();
        assert!(matches!(err, XfsError::CorruptFilesystem { block: 40, .. }), "{err:?}");

        let mut block = block_form(true, &names);
        block[DIR3_OWNER_OFFSET..DIR3_OWNER_OFFSET + 8].copy_from_slice(&99_u64.to_be_bytes());
        update_crc(&mut block, DIR3_DATA_CRC_OFFSET).unwrap();
        let vol = block_image(true, &block).volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();
        assert!(dir.lookup(b"alpha").unwrap_err().is_corruption());
    }

    #[test]
    fn block_form_size_must_match_block() {
        let mut img = block_image(false, &block_form(false, &[]));
        img.dir_inode(2, 4096, &extents(&[(0, 40, 1)]), 1);
        let vol = img.volume();
        let inode = open_dir(&vol);
        let err = Directory::open(&vol, &inode).unwrap_err();
        assert!(matches!(err, XfsError::CorruptFilesystem { block: 10, .. }), "{err:?}");
    }

    #[test]
    fn hash_collision_is_not_a_match() {
        // (0x61 << 7) ^ 0x62 == (0x60 << 7) ^ 0xE2
        let twin = vec![0x60_u8, 0xE2];
        assert_eq!(da_hashname(b"ab"), da_hashname(&twin));

        let vol = block_image(false, &block_form(false, &[(twin.clone(), 300)])).volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();
        assert_eq!(dir.lookup(b"ab").unwrap(), None);
        assert_eq!(dir.lookup(&twin).unwrap().map(|e| e.ino.0), Some(300));

        let both = [(twin.clone(), 300), (b"ab".to_vec(), 301)];
        let vol = block_image(false, &block_form(false, &both)).volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();
        assert_eq!(dir.lookup(b"ab").unwrap().map(|e| e.ino.0), Some(301));
        assert_eq!(dir.lookup(&twin).unwrap().map(|e| e.ino.0), Some(300));
    }

    #[test]
    fn case_insensitive_volume_folds_names() {
        let names = named(&[("README", 210), ("readme", 211), ("Makefile", 212)]);
        let mut img = block_image(false, &block_form_hashed(false, &names, ascii_ci_hashname));
        img.ascii_ci = true;
        let vol = img.volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();

        assert_eq!(dir.lookup(b"readme").unwrap().map(|e| e.ino.0), Some(211));
        assert_eq!(dir.lookup(b"README").unwrap().map(|e| e.ino.0), Some(210));
        assert_eq!(dir.lookup(b"MAKEFILE").unwrap().map(|e| e.ino.0), Some(212));
        assert_eq!(dir.lookup(b"makefile.bak").unwrap(), None);
    }

    // ── Leaf form ───────────────────────────────────────────────────────────────

    #[test]
    fn leaf_form_spans_data_blocks() {
        let names: Vec<(Vec<u8>, u64)> = (0..40)
            .map(|i| (format!("file-{i:03}").into_bytes(), 1000 + i))
            .collect();
        let vol = leaf_image(&names).volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();

        assert_eq!(dir.form(), DirForm::Leaf);
        assert_eq!(names_of(&dir), names);
        assert_eq!(dir.parent().unwrap(), InodeNumber(PARENT_INO));
        assert_eq!(dir.lookup(b"file-039").unwrap().map(|e| e.ino.0), Some(1039));
        assert_eq!(dir.lookup(b"file-040").unwrap(), None);
    }

    #[test]
    fn single_data_block_with_leaf_is_leaf_form() {
        let names = named(&[("x", 600)]);
        let vol = leaf_image(&names).volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();
        assert_eq!(dir.form(), DirForm::Leaf);
        assert_eq!(dir.lookup(b"x").unwrap().map(|e| e.ino.0), Some(600));
    }

    #[test]
    fn stale_index_entries_are_skipped() {
        let names = named(&[("keep", 400), ("gone", 401)]);
        let (blocks, mut index) = data_blocks(&names);
        let gone = da_hashname(b"gone");
        for e in &mut index {
            if e.hashval == gone {
                e.address = 0;
            }
        }
        index.sort_by_key(|e| e.hashval);
        let mut img = Image::new(false);
        img.block(40, &blocks[0]);
        img.block(60, &leaf_index(XFS_DIR2_LEAF1_MAGIC, &index, 0, 0));
        img.dir_inode(2, BS as u64, &extents(&[(0, 40, 1), (leaf_block(), 60, 1)]), 2);
        let vol = img.volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();
        assert_eq!(dir.lookup(b"gone").unwrap(), None);
        assert_eq!(dir.lookup(b"keep").unwrap().map(|e| e.ino.0), Some(400));
    }

    #[test]
    fn index_pointing_at_free_space_is_corrupt() {
        let (blocks, _) = data_blocks(&named(&[("only", 500)]));
        // Header 16 + "." 16 + ".." 16 + "only" 16: free space starts at 64.
        let index = [LeafEntry {
            hashval: da_hashname(b"only"),
            address: dataptr(0, 64),
        }];
        let mut img = Image::new(false);
        img.block(40, &blocks[0]);
        img.block(60, &leaf_index(XFS_DIR2_LEAF1_MAGIC, &index, 0, 0));
        img.dir_inode(2, BS as u64, &extents(&[(0, 40, 1), (leaf_block(), 60, 1)]), 2);
        let vol = img.volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();
        let err = dir.lookup(b"only").unwrap_err();
        assert!(matches!(err, XfsError::CorruptFilesystem { block: 40, .. }), "{err:?}");
    }

    #[test]
    fn unknown_leaf_magic_is_corrupt() {
        let (blocks, _) = data_blocks(&[]);
        let mut img = Image::new(false);
        img.block(40, &blocks[0]);
        img.block(60, &leaf_index(0x1234, &[], 0, 0));
        img.dir_inode(2, BS as u64, &extents(&[(0, 40, 1), (leaf_block(), 60, 1)]), 2);
        let vol = img.volume();
        let inode = open_dir(&vol);
        let err = Directory::open(&vol, &inode).unwrap_err();
        assert!(matches!(err, XfsError::CorruptFilesystem { block: 60, .. }), "{err:?}");
    }

    // ── Node form ───────────────────────────────────────────────────────────────

    #[test]
    fn node_form_lookup_through_da_btree() {
        let names: Vec<(Vec<u8>, u64)> = (0..60)
            .map(|i| (format!("entry_{i}").into_bytes(), 2000 + i))
            .collect();
        let vol = node_image(&names).volume();
        let inode = open_dir(&vol);
        let dir = Directory::open(&vol, &inode).unwrap();

        assert_eq!(dir.form(), DirForm::Node);
        assert_eq!(names_of(&dir), names);
        for (name, ino) in &names {
            assert_eq!(dir.lookup(name).unwrap().map(|e| e.ino.0), Some(*ino));
        }
        assert_eq!(dir.lookup(b"entry_60").unwrap(), None);
        assert_eq!(dir.lookup(b"zzz").unwrap(), None);
    }

    #[test]
    fn node_root_with_wrong_version_magic_is_corrupt() {
        let (blocks, _) = data_blocks(&[]);
        let mut img = Image::new(false);
        img.block(40, &blocks[0]);
        let mut root = da_node(1, &[]);
        root[8..10].copy_from_slice(&XFS_DA3_NODE_MAGIC.to_be_bytes());
        img.block(70, &root);
        img.dir_inode(2, BS as u64, &extents(&[(0, 40, 1), (leaf_block(), 70, 1)]), 2);
        let vol = img.volume();
        let inode = open_dir(&vol);
        assert!(Directory::open(&vol, &inode).unwrap_err().is_corruption());
    }

    // ── Properties ──────────────────────────────────────────────────────────────

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn lookup_agrees_with_enumeration(
            raw in proptest::collection::btree_map("[a-z0-9_.-]{1,12}", 100_u64..5000, 0..45),
            probe in "[a-z]{1,12}",
        ) {
            let raw: BTreeMap<String, u64> = raw
                .into_iter()
                .filter(|(name, _)| name != "." && name != "..")
                .collect();
            let names: Vec<(Vec<u8>, u64)> =
                raw.iter().map(|(n, i)| (n.clone().into_bytes(), *i)).collect();
            let vol = leaf_image(&names).volume();
            let inode = open_dir(&vol);
            let dir = Directory::open(&vol, &inode).unwrap();

            prop_assert_eq!(names_of(&dir), names.clone());
            for (name, ino) in &names {
                prop_assert_eq!(dir.lookup(name).unwrap().map(|e| e.ino.0), Some(*ino));
            }
            let expected = raw.get(&probe).copied();
            prop_assert_eq!(dir.lookup(probe.as_bytes()).unwrap().map(|e| e.ino.0), expected);
        }
    }
}
