//! Shape descriptors for every btree the decoder walks.
//!
//! Short-form AG trees (free space, inode, rmap, refcount) use 32-bit AG
//! block pointers, the extent map uses 64-bit packed filesystem blocks, and
//! the directory and attribute hash indexes use DA nodes addressed by
//! fork-relative block.

use crate::{BtreeShape, KeyRule, NodeLayout, Slots};
use xfs_ondisk::attr::{
    AttrLeafEntry, AttrLeafHeader, XFS_ATTR_LEAF_ENTRY_LEN, XFS_ATTR_LEAF_MAGIC,
    XFS_ATTR3_LEAF_MAGIC,
};
use xfs_ondisk::btree::{
    AllocRec, BmdrHeader, BtreeBlockHeader, ExtentRecord, InobtRec, PointerForm, RefcountRec,
    RmapRec, XFS_ABTB_CRC_MAGIC, XFS_ABTB_MAGIC, XFS_ABTC_CRC_MAGIC, XFS_ABTC_MAGIC,
    XFS_BMAP_CRC_MAGIC, XFS_BMAP_MAGIC, XFS_FIBT_CRC_MAGIC, XFS_FIBT_MAGIC, XFS_IBT_CRC_MAGIC,
    XFS_IBT_MAGIC, XFS_REFC_CRC_MAGIC, XFS_RMAP_CRC_MAGIC, slot_capacity,
};
use xfs_ondisk::checksum::{DA3_CRC_OFFSET, LBLOCK_CRC_OFFSET, SBLOCK_CRC_OFFSET};
use xfs_ondisk::da::{
    DaBlkInfo, DaNodeHeader, XFS_DA_NODE_ENTRY_LEN, XFS_DA_NODE_MAGIC, XFS_DA3_NODE_MAGIC,
};
use xfs_ondisk::dir2::{
    LeafEntry, LeafHeader, XFS_DIR2_LEAF_ENTRY_LEN, XFS_DIR2_LEAFN_MAGIC, XFS_DIR3_LEAFN_MAGIC,
};
use xfs_types::{ParseError, read_be_u32, read_be_u64};

// ── Shared node parsing ─────────────────────────────────────────────────────

fn check_magic(actual: u32, expected: u32) -> Result<(), ParseError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ParseError::InvalidMagic {
            expected: u64::from(expected),
            actual: u64::from(actual),
        })
    }
}

/// Layout of an AG or extent map btree block.
///
/// Interior nodes store all keys first, then all pointers; the pointer array
/// starts after room for `capacity` keys.
fn standard_layout(
    node: &[u8],
    form: PointerForm,
    crc: bool,
    magic: u32,
    record_len: usize,
    key_len: usize,
    ptr_len: usize,
) -> Result<NodeLayout, ParseError> {
    let header = BtreeBlockHeader::parse(node, form, crc)?;
    check_magic(header.magic, magic)?;
    let hdr = BtreeBlockHeader::len(form, crc);
    let numrecs = usize::from(header.numrecs);
    let layout = if header.level == 0 {
        NodeLayout {
            level: 0,
            numrecs,
            capacity: slot_capacity(node.len(), hdr, record_len),
            left: header.left,
            right: header.right,
            records: Slots::new(hdr, record_len, record_len),
            keys: Slots::default(),
            ptrs: Slots::default(),
        }
    } else {
        let capacity = slot_capacity(node.len(), hdr, key_len + ptr_len);
        NodeLayout {
            level: header.level,
            numrecs,
            capacity,
            left: header.left,
            right: header.right,
            records: Slots::default(),
            keys: Slots::new(hdr, key_len, key_len),
            ptrs: Slots::new(hdr + capacity * key_len, ptr_len, ptr_len),
        }
    };
    layout.check_capacity("bb_numrecs")
}

fn short_ptr(raw: &[u8]) -> Result<u64, ParseError> {
    read_be_u32(raw, 0).map(u64::from)
}

fn sblock_crc(crc: bool) -> Option<usize> {
    crc.then_some(SBLOCK_CRC_OFFSET)
}

// ── Free space ──────────────────────────────────────────────────────────────

/// Free extents keyed by start block (`bnobt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpaceByBlock {
    pub crc: bool,
}

impl BtreeShape for FreeSpaceByBlock {
    type Key = u32;
    type Record = AllocRec;

    fn name(&self) -> &'static str {
        "bnobt"
    }

    fn parse_node(&self, node: &[u8]) -> Result<NodeLayout, ParseError> {
        let magic = if self.crc { XFS_ABTB_CRC_MAGIC } else { XFS_ABTB_MAGIC };
        standard_layout(node, PointerForm::Short, self.crc, magic, AllocRec::SIZE, 8, 4)
    }

    fn decode_key(&self, raw: &[u8]) -> Result<u32, ParseError> {
        read_be_u32(raw, 0)
    }

    fn decode_ptr(&self, raw: &[u8]) -> Result<u64, ParseError> {
        short_ptr(raw)
    }

    fn decode_record(&self, raw: &[u8]) -> Result<AllocRec, ParseError> {
        AllocRec::parse(raw)
    }

    fn record_key(&self, record: &AllocRec) -> u32 {
        record.start_block
    }

    fn crc_offset(&self) -> Option<usize> {
        sblock_crc(self.crc)
    }
}

/// Free extents keyed by (length, start block) (`cntbt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpaceBySize {
    pub crc: bool,
}

impl BtreeShape for FreeSpaceBySize {
    type Key = (u32, u32);
    type Record = AllocRec;

    fn name(&self) -> &'static str {
        "cntbt"
    }

    fn parse_node(&self, node: &[u8]) -> Result<NodeLayout, ParseError> {
        let magic = if self.crc { XFS_ABTC_CRC_MAGIC } else { XFS_ABTC_MAGIC };
        standard_layout(node, PointerForm::Short, self.crc, magic, AllocRec::SIZE, 8, 4)
    }

    fn decode_key(&self, raw: &[u8]) -> Result<(u32, u32), ParseError> {
        let rec = AllocRec::parse(raw)?;
        Ok((rec.block_count, rec.start_block))
    }

    fn decode_ptr(&self, raw: &[u8]) -> Result<u64, ParseError> {
        short_ptr(raw)
    }

    fn decode_record(&self, raw: &[u8]) -> Result<AllocRec, ParseError> {
        AllocRec::parse(raw)
    }

    fn record_key(&self, record: &AllocRec) -> (u32, u32) {
        (record.block_count, record.start_block)
    }

    fn crc_offset(&self) -> Option<usize> {
        sblock_crc(self.crc)
    }
}

// ── Inodes ──────────────────────────────────────────────────────────────────

/// Inode chunks keyed by first AG inode (`inobt`, or `finobt` when `free`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeIndex {
    pub crc: bool,
    /// Records carry a holemask and count (sparse inode chunks).
    pub sparse: bool,
    /// The free inode tree rather than the full one.
    pub free: bool,
}

impl BtreeShape for InodeIndex {
    type Key = u32;
    type Record = InobtRec;

    fn name(&self) -> &'static str {
        if self.free { "finobt" } else { "inobt" }
    }

    fn parse_node(&self, node: &[u8]) -> Result<NodeLayout, ParseError> {
        let magic = match (self.free, self.crc) {
            (false, false) => XFS_IBT_MAGIC,
            (false, true) => XFS_IBT_CRC_MAGIC,
            (true, false) => XFS_FIBT_MAGIC,
            (true, true) => XFS_FIBT_CRC_MAGIC,
        };
        standard_layout(node, PointerForm::Short, self.crc, magic, InobtRec::SIZE, 4, 4)
    }

    fn decode_key(&self, raw: &[u8]) -> Result<u32, ParseError> {
        read_be_u32(raw, 0)
    }

    fn decode_ptr(&self, raw: &[u8]) -> Result<u64, ParseError> {
        short_ptr(raw)
    }

    fn decode_record(&self, raw: &[u8]) -> Result<InobtRec, ParseError> {
        InobtRec::parse(raw, self.sparse)
    }

    fn record_key(&self, record: &InobtRec) -> u32 {
        record.start_ino
    }

    fn crc_offset(&self) -> Option<usize> {
        sblock_crc(self.crc)
    }
}

// ── Reverse mappings ────────────────────────────────────────────────────────

/// Space owners keyed by (start block, owner, offset) (`rmapbt`).
///
/// Interior nodes carry a low and a high key per child; only the low key
/// steers the descent. The tree exists only on v5 volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseMap;

impl BtreeShape for ReverseMap {
    type Key = (u32, u64, u64);
    type Record = RmapRec;

    fn name(&self) -> &'static str {
        "rmapbt"
    }

    fn parse_node(&self, node: &[u8]) -> Result<NodeLayout, ParseError> {
        standard_layout(
            node,
            PointerForm::Short,
            true,
            XFS_RMAP_CRC_MAGIC,
            RmapRec::SIZE,
            2 * RmapRec::KEY_SIZE,
            4,
        )
    }

    fn decode_key(&self, raw: &[u8]) -> Result<(u32, u64, u64), ParseError> {
        RmapRec::parse_key(raw)
    }

    fn decode_ptr(&self, raw: &[u8]) -> Result<u64, ParseError> {
        short_ptr(raw)
    }

    fn decode_record(&self, raw: &[u8]) -> Result<RmapRec, ParseError> {
        RmapRec::parse(raw)
    }

    fn record_key(&self, record: &RmapRec) -> (u32, u64, u64) {
        (record.start_block, record.owner, record.file_offset())
    }

    fn crc_offset(&self) -> Option<usize> {
        Some(SBLOCK_CRC_OFFSET)
    }
}

// ── Reference counts ────────────────────────────────────────────────────────

/// Shared extents keyed by raw start block (`refcountbt`).
///
/// The key keeps the copy-on-write bit, so staging extents sort after every
/// shared extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefCount;

impl BtreeShape for RefCount {
    type Key = u32;
    type Record = RefcountRec;

    fn name(&self) -> &'static str {
        "refcountbt"
    }

    fn parse_node(&self, node: &[u8]) -> Result<NodeLayout, ParseError> {
        standard_layout(
            node,
            PointerForm::Short,
            true,
            XFS_REFC_CRC_MAGIC,
            RefcountRec::SIZE,
            4,
            4,
        )
    }

    fn decode_key(&self, raw: &[u8]) -> Result<u32, ParseError> {
        read_be_u32(raw, 0)
    }

    fn decode_ptr(&self, raw: &[u8]) -> Result<u64, ParseError> {
        short_ptr(raw)
    }

    fn decode_record(&self, raw: &[u8]) -> Result<RefcountRec, ParseError> {
        RefcountRec::parse(raw)
    }

    fn record_key(&self, record: &RefcountRec) -> u32 {
        if record.cow {
            record.start_block | xfs_ondisk::btree::XFS_REFC_COWFLAG
        } else {
            record.start_block
        }
    }

    fn crc_offset(&self) -> Option<usize> {
        Some(SBLOCK_CRC_OFFSET)
    }
}

// ── File extent maps ────────────────────────────────────────────────────────

/// Extents of a btree-format fork keyed by file offset (`bmbt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentMap {
    pub crc: bool,
}

impl BtreeShape for ExtentMap {
    type Key = u64;
    type Record = ExtentRecord;

    fn name(&self) -> &'static str {
        "bmbt"
    }

    fn parse_node(&self, node: &[u8]) -> Result<NodeLayout, ParseError> {
        let magic = if self.crc { XFS_BMAP_CRC_MAGIC } else { XFS_BMAP_MAGIC };
        standard_layout(node, PointerForm::Long, self.crc, magic, ExtentRecord::SIZE, 8, 8)
    }

    /// The fork-resident root: a 4-byte header, then `maxrecs` keys, then
    /// `maxrecs` pointers, sized by the fork.
    fn parse_inline_root(&self, root: &[u8]) -> Result<NodeLayout, ParseError> {
        let header = BmdrHeader::parse(root)?;
        if header.level == 0 {
            return Err(ParseError::InvalidField {
                field: "bb_level",
                reason: "inode btree root must be an interior node",
            });
        }
        let capacity = BmdrHeader::max_records(root.len());
        NodeLayout {
            level: header.level,
            numrecs: usize::from(header.numrecs),
            capacity,
            left: None,
            right: None,
            records: Slots::default(),
            keys: Slots::new(BmdrHeader::SIZE, 8, 8),
            ptrs: Slots::new(BmdrHeader::SIZE + capacity * 8, 8, 8),
        }
        .check_capacity("bb_numrecs")
    }

    fn decode_key(&self, raw: &[u8]) -> Result<u64, ParseError> {
        read_be_u64(raw, 0)
    }

    fn decode_ptr(&self, raw: &[u8]) -> Result<u64, ParseError> {
        read_be_u64(raw, 0)
    }

    fn decode_record(&self, raw: &[u8]) -> Result<ExtentRecord, ParseError> {
        ExtentRecord::parse(raw)
    }

    fn record_key(&self, record: &ExtentRecord) -> u64 {
        record.file_offset
    }

    fn crc_offset(&self) -> Option<usize> {
        self.crc.then_some(LBLOCK_CRC_OFFSET)
    }
}

// ── Hash indexes ────────────────────────────────────────────────────────────

/// Interior DA node layout: `(hashval, before)` pairs after the node header.
fn da_node_layout(node: &[u8], crc: bool) -> Result<NodeLayout, ParseError> {
    let header = DaNodeHeader::parse(node, crc)?;
    let hdr = DaNodeHeader::len(crc);
    NodeLayout {
        level: header.level,
        numrecs: usize::from(header.count),
        capacity: slot_capacity(node.len(), hdr, XFS_DA_NODE_ENTRY_LEN),
        left: header.info.back.map(u64::from),
        right: header.info.forw.map(u64::from),
        records: Slots::default(),
        keys: Slots::new(hdr, XFS_DA_NODE_ENTRY_LEN, 4),
        ptrs: Slots::new(hdr + 4, XFS_DA_NODE_ENTRY_LEN, 4),
    }
    .check_capacity("da_node_count")
}

fn is_da_node(magic: u16) -> bool {
    matches!(magic, XFS_DA_NODE_MAGIC | XFS_DA3_NODE_MAGIC)
}

fn da_crc(crc: bool) -> Option<usize> {
    crc.then_some(DA3_CRC_OFFSET)
}

/// Name hash index of a node-form directory.
///
/// Interior DA nodes lead to leafn blocks whose entries map a name hash to
/// the data address of the entry. Keys are the highest hash in each subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirHashIndex {
    pub crc: bool,
}

impl BtreeShape for DirHashIndex {
    type Key = u32;
    type Record = LeafEntry;

    fn name(&self) -> &'static str {
        "dir_hash"
    }

    fn key_rule(&self) -> KeyRule {
        KeyRule::HighKey
    }

    fn parse_node(&self, node: &[u8]) -> Result<NodeLayout, ParseError> {
        let magic = DaBlkInfo::peek_magic(node)?;
        if is_da_node(magic) {
            return da_node_layout(node, self.crc);
        }
        let expected = if self.crc { XFS_DIR3_LEAFN_MAGIC } else { XFS_DIR2_LEAFN_MAGIC };
        if magic != expected {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(expected),
                actual: u64::from(magic),
            });
        }
        let header = LeafHeader::parse(node, self.crc)?;
        let hdr = LeafHeader::len(self.crc);
        NodeLayout {
            level: 0,
            numrecs: usize::from(header.count),
            capacity: slot_capacity(node.len(), hdr, XFS_DIR2_LEAF_ENTRY_LEN),
            left: header.info.back.map(u64::from),
            right: header.info.forw.map(u64::from),
            records: Slots::new(hdr, XFS_DIR2_LEAF_ENTRY_LEN, XFS_DIR2_LEAF_ENTRY_LEN),
            keys: Slots::default(),
            ptrs: Slots::default(),
        }
        .check_capacity("leaf_count")
    }

    fn decode_key(&self, raw: &[u8]) -> Result<u32, ParseError> {
        read_be_u32(raw, 0)
    }

    fn decode_ptr(&self, raw: &[u8]) -> Result<u64, ParseError> {
        short_ptr(raw)
    }

    fn decode_record(&self, raw: &[u8]) -> Result<LeafEntry, ParseError> {
        LeafEntry::parse(raw, 0)
    }

    fn record_key(&self, record: &LeafEntry) -> u32 {
        record.hashval
    }

    fn crc_offset(&self) -> Option<usize> {
        da_crc(self.crc)
    }
}

/// Name hash index of a node-form attribute fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrHashIndex {
    pub crc: bool,
}

impl BtreeShape for AttrHashIndex {
    type Key = u32;
    type Record = AttrLeafEntry;

    fn name(&self) -> &'static str {
        "attr_hash"
    }

    fn key_rule(&self) -> KeyRule {
        KeyRule::HighKey
    }

    fn parse_node(&self, node: &[u8]) -> Result<NodeLayout, ParseError> {
        let magic = DaBlkInfo::peek_magic(node)?;
        if is_da_node(magic) {
            return da_node_layout(node, self.crc);
        }
        if !matches!(magic, XFS_ATTR_LEAF_MAGIC | XFS_ATTR3_LEAF_MAGIC) {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(xfs_ondisk::attr::leaf_magic(self.crc)),
                actual: u64::from(magic),
            });
        }
        let header = AttrLeafHeader::parse(node, self.crc)?;
        let hdr = AttrLeafHeader::len(self.crc);
        NodeLayout {
            level: 0,
            numrecs: usize::from(header.count),
            capacity: slot_capacity(node.len(), hdr, XFS_ATTR_LEAF_ENTRY_LEN),
            left: header.info.back.map(u64::from),
            right: header.info.forw.map(u64::from),
            records: Slots::new(hdr, XFS_ATTR_LEAF_ENTRY_LEN, XFS_ATTR_LEAF_ENTRY_LEN),
            keys: Slots::default(),
            ptrs: Slots::default(),
        }
        .check_capacity("attr_leaf_count")
    }

    fn decode_key(&self, raw: &[u8]) -> Result<u32, ParseError> {
        read_be_u32(raw, 0)
    }

    fn decode_ptr(&self, raw: &[u8]) -> Result<u64, ParseError> {
        short_ptr(raw)
    }

    fn decode_record(&self, raw: &[u8]) -> Result<AttrLeafEntry, ParseError> {
        AttrLeafEntry::parse(raw, 0)
    }

    fn record_key(&self, record: &AttrLeafEntry) -> u32 {
        record.hashval
    }

    fn crc_offset(&self) -> Option<usize> {
        da_crc(self.crc)
    }
}
