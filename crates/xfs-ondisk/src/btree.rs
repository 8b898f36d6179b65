//! Btree block headers and the leaf record layouts of every AG and fork btree.

use serde::{Deserialize, Serialize};
use xfs_types::{
    FsBlock, NULLAGBLOCK, NULLFSBLOCK, ParseError, ensure_slice, read_be_u16, read_be_u32,
    read_be_u64, read_u8,
};

// ── Magic numbers ───────────────────────────────────────────────────────────

pub const XFS_ABTB_MAGIC: u32 = 0x4142_5442;
pub const XFS_ABTB_CRC_MAGIC: u32 = 0x4142_3342;
pub const XFS_ABTC_MAGIC: u32 = 0x4142_5443;
pub const XFS_ABTC_CRC_MAGIC: u32 = 0x4142_3343;
pub const XFS_IBT_MAGIC: u32 = 0x4941_4254;
pub const XFS_IBT_CRC_MAGIC: u32 = 0x4941_4233;
pub const XFS_FIBT_MAGIC: u32 = 0x4649_4254;
pub const XFS_FIBT_CRC_MAGIC: u32 = 0x4649_4233;
pub const XFS_RMAP_CRC_MAGIC: u32 = 0x524d_4233;
pub const XFS_REFC_CRC_MAGIC: u32 = 0x5233_4643;
pub const XFS_BMAP_MAGIC: u32 = 0x424d_4150;
pub const XFS_BMAP_CRC_MAGIC: u32 = 0x424d_4133;

/// Short-form (AG-relative pointer) header sizes.
pub const XFS_BTREE_SBLOCK_LEN: usize = 16;
pub const XFS_BTREE_SBLOCK_CRC_LEN: usize = 56;
/// Long-form (64-bit pointer) header sizes.
pub const XFS_BTREE_LBLOCK_LEN: usize = 24;
pub const XFS_BTREE_LBLOCK_CRC_LEN: usize = 72;

// ── Block header ────────────────────────────────────────────────────────────

/// Pointer width of a btree family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerForm {
    /// 32-bit AG block numbers (free space, inode, rmap, refcount trees).
    Short,
    /// 64-bit packed filesystem blocks (extent map trees).
    Long,
}

/// Common header of every AG and fork btree block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreeBlockHeader {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub left: Option<u64>,
    pub right: Option<u64>,
    /// Self-describing block address (v5 only).
    pub blkno: Option<u64>,
    /// Owning AG or inode (v5 only).
    pub owner: Option<u64>,
}

impl BtreeBlockHeader {
    /// Header length in bytes.
    #[must_use]
    pub fn len(form: PointerForm, crc: bool) -> usize {
        match (form, crc) {
            (PointerForm::Short, false) => XFS_BTREE_SBLOCK_LEN,
            (PointerForm::Short, true) => XFS_BTREE_SBLOCK_CRC_LEN,
            (PointerForm::Long, false) => XFS_BTREE_LBLOCK_LEN,
            (PointerForm::Long, true) => XFS_BTREE_LBLOCK_CRC_LEN,
        }
    }

    pub fn parse(data: &[u8], form: PointerForm, crc: bool) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::len(form, crc))?;
        let magic = read_be_u32(data, 0)?;
        let level = read_be_u16(data, 4)?;
        let numrecs = read_be_u16(data, 6)?;
        match form {
            PointerForm::Short => {
                let sib = |off| {
                    read_be_u32(data, off)
                        .map(|v| (v != NULLAGBLOCK).then_some(u64::from(v)))
                };
                Ok(Self {
                    magic,
                    level,
                    numrecs,
                    left: sib(8)?,
                    right: sib(12)?,
                    blkno: if crc { Some(read_be_u64(data, 16)?) } else { None },
                    owner: if crc {
                        Some(u64::from(read_be_u32(data, 48)?))
                    } else {
                        None
                    },
                })
            }
            PointerForm::Long => {
                let sib = |off| read_be_u64(data, off).map(|v| (v != NULLFSBLOCK).then_some(v));
                Ok(Self {
                    magic,
                    level,
                    numrecs,
                    left: sib(8)?,
                    right: sib(16)?,
                    blkno: if crc { Some(read_be_u64(data, 24)?) } else { None },
                    owner: if crc { Some(read_be_u64(data, 56)?) } else { None },
                })
            }
        }
    }
}

/// Number of (key, pointer) or record slots that fit after the header.
#[must_use]
pub fn slot_capacity(block_len: usize, header_len: usize, slot_len: usize) -> usize {
    if slot_len == 0 {
        return 0;
    }
    block_len.saturating_sub(header_len) / slot_len
}

// ── Free space records ──────────────────────────────────────────────────────

/// One free extent (`xfs_alloc_rec`), AG-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRec {
    pub start_block: u32,
    pub block_count: u32,
}

impl AllocRec {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            start_block: read_be_u32(data, 0)?,
            block_count: read_be_u32(data, 4)?,
        })
    }
}

// ── Inode btree records ─────────────────────────────────────────────────────

pub const XFS_INODES_PER_CHUNK: u32 = 64;
pub const XFS_INODES_PER_HOLEMASK_BIT: u32 = 4;

/// One inode chunk (`xfs_inobt_rec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InobtRec {
    pub start_ino: u32,
    /// Bit set = 4-inode group not backed by disk (sparse chunks only).
    pub holemask: u16,
    pub count: u8,
    pub free_count: u32,
    /// Bit set = inode free.
    pub free: u64,
}

impl InobtRec {
    pub const SIZE: usize = 16;

    pub fn parse(data: &[u8], sparse: bool) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::SIZE)?;
        let start_ino = read_be_u32(data, 0)?;
        let (holemask, count, free_count) = if sparse {
            (
                read_be_u16(data, 4)?,
                read_u8(data, 6)?,
                u32::from(read_u8(data, 7)?),
            )
        } else {
            (0, XFS_INODES_PER_CHUNK as u8, read_be_u32(data, 4)?)
        };
        if free_count > XFS_INODES_PER_CHUNK || u32::from(count) > XFS_INODES_PER_CHUNK {
            return Err(ParseError::InvalidField {
                field: "ir_freecount",
                reason: "exceeds inodes per chunk",
            });
        }
        Ok(Self {
            start_ino,
            holemask,
            count,
            free_count,
            free: read_be_u64(data, 8)?,
        })
    }

    /// `true` if inode `index` (0..64) of the chunk has backing storage.
    #[must_use]
    pub fn is_present(&self, index: u32) -> bool {
        let bit = index / XFS_INODES_PER_HOLEMASK_BIT;
        bit < 16 && self.holemask & (1 << bit) == 0
    }

    /// `true` if inode `index` of the chunk is allocated.
    #[must_use]
    pub fn is_allocated(&self, index: u32) -> bool {
        index < XFS_INODES_PER_CHUNK && self.is_present(index) && self.free & (1 << index) == 0
    }

    /// AG-relative numbers of the allocated inodes in this chunk, ascending.
    pub fn allocated(&self) -> impl Iterator<Item = u32> + '_ {
        (0..XFS_INODES_PER_CHUNK)
            .filter(|i| self.is_allocated(*i))
            .map(|i| self.start_ino.wrapping_add(i))
    }
}

// ── Reverse mapping records ─────────────────────────────────────────────────

pub const XFS_RMAP_OFF_ATTR_FORK: u64 = 1 << 63;
pub const XFS_RMAP_OFF_BMBT_BLOCK: u64 = 1 << 62;
pub const XFS_RMAP_OFF_UNWRITTEN: u64 = 1 << 61;
pub const XFS_RMAP_OFF_MASK: u64 = (1 << 54) - 1;

/// Special (non-inode) owners of AG space.
pub const XFS_RMAP_OWN_NULL: u64 = -1_i64 as u64;
pub const XFS_RMAP_OWN_UNKNOWN: u64 = -2_i64 as u64;
pub const XFS_RMAP_OWN_FS: u64 = -3_i64 as u64;
pub const XFS_RMAP_OWN_LOG: u64 = -4_i64 as u64;
pub const XFS_RMAP_OWN_AG: u64 = -5_i64 as u64;
pub const XFS_RMAP_OWN_INOBT: u64 = -6_i64 as u64;
pub const XFS_RMAP_OWN_INODES: u64 = -7_i64 as u64;
pub const XFS_RMAP_OWN_REFC: u64 = -8_i64 as u64;
pub const XFS_RMAP_OWN_COW: u64 = -9_i64 as u64;

/// One reverse mapping (`xfs_rmap_rec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmapRec {
    pub start_block: u32,
    pub block_count: u32,
    pub owner: u64,
    pub offset_raw: u64,
}

impl RmapRec {
    pub const SIZE: usize = 24;
    /// Bytes of the low key (startblock, owner, offset).
    pub const KEY_SIZE: usize = 20;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            start_block: read_be_u32(data, 0)?,
            block_count: read_be_u32(data, 4)?,
            owner: read_be_u64(data, 8)?,
            offset_raw: read_be_u64(data, 16)?,
        })
    }

    /// Decode a 20-byte rmap key into (startblock, owner, offset).
    pub fn parse_key(data: &[u8]) -> Result<(u32, u64, u64), ParseError> {
        Ok((
            read_be_u32(data, 0)?,
            read_be_u64(data, 4)?,
            read_be_u64(data, 12)? & XFS_RMAP_OFF_MASK,
        ))
    }

    #[must_use]
    pub fn file_offset(&self) -> u64 {
        self.offset_raw & XFS_RMAP_OFF_MASK
    }

    #[must_use]
    pub fn is_attr_fork(&self) -> bool {
        self.offset_raw & XFS_RMAP_OFF_ATTR_FORK != 0
    }

    #[must_use]
    pub fn is_bmbt_block(&self) -> bool {
        self.offset_raw & XFS_RMAP_OFF_BMBT_BLOCK != 0
    }

    #[must_use]
    pub fn is_unwritten(&self) -> bool {
        self.offset_raw & XFS_RMAP_OFF_UNWRITTEN != 0
    }

    /// Name of a special owner, or `None` for an inode owner.
    #[must_use]
    pub fn special_owner(&self) -> Option<&'static str> {
        Some(match self.owner {
            XFS_RMAP_OWN_NULL => "null",
            XFS_RMAP_OWN_UNKNOWN => "unknown",
            XFS_RMAP_OWN_FS => "fs",
            XFS_RMAP_OWN_LOG => "log",
            XFS_RMAP_OWN_AG => "ag",
            XFS_RMAP_OWN_INOBT => "inobt",
            XFS_RMAP_OWN_INODES => "inodes",
            XFS_RMAP_OWN_REFC => "refcount",
            XFS_RMAP_OWN_COW => "cow",
            _ => return None,
        })
    }
}

// ── Reference count records ─────────────────────────────────────────────────

/// Startblock bit marking a copy-on-write staging extent.
pub const XFS_REFC_COWFLAG: u32 = 1 << 31;

/// One shared extent (`xfs_refcount_rec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefcountRec {
    pub start_block: u32,
    pub block_count: u32,
    pub refcount: u32,
    pub cow: bool,
}

impl RefcountRec {
    pub const SIZE: usize = 12;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw_start = read_be_u32(data, 0)?;
        Ok(Self {
            start_block: raw_start & !XFS_REFC_COWFLAG,
            block_count: read_be_u32(data, 4)?,
            refcount: read_be_u32(data, 8)?,
            cow: raw_start & XFS_REFC_COWFLAG != 0,
        })
    }
}

// ── Extent records ──────────────────────────────────────────────────────────

/// Largest block count a single extent record can carry (21 bits).
pub const XFS_MAX_BMBT_EXTLEN: u64 = (1 << 21) - 1;

/// One packed 128-bit extent record (`xfs_bmbt_rec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRecord {
    pub file_offset: u64,
    pub start_block: FsBlock,
    pub block_count: u64,
    pub unwritten: bool,
}

impl ExtentRecord {
    pub const SIZE: usize = 16;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let l0 = read_be_u64(data, 0)?;
        let l1 = read_be_u64(data, 8)?;
        Ok(Self {
            unwritten: l0 >> 63 != 0,
            file_offset: (l0 & ((1 << 63) - 1)) >> 9,
            start_block: FsBlock(((l0 & 0x1FF) << 43) | (l1 >> 21)),
            block_count: l1 & XFS_MAX_BMBT_EXTLEN,
        })
    }

    /// Pack into the 16-byte on-disk form. Used by image builders and tests.
    #[must_use]
    pub fn encode(&self) -> [u8; 16] {
        let l0 = (u64::from(self.unwritten) << 63)
            | ((self.file_offset & ((1 << 54) - 1)) << 9)
            | (self.start_block.0 >> 43);
        let l1 = ((self.start_block.0 & ((1 << 43) - 1)) << 21)
            | (self.block_count & XFS_MAX_BMBT_EXTLEN);
        let mut out = [0_u8; 16];
        out[..8].copy_from_slice(&l0.to_be_bytes());
        out[8..].copy_from_slice(&l1.to_be_bytes());
        out
    }

    /// One past the last file block covered.
    #[must_use]
    pub fn file_end(&self) -> u64 {
        self.file_offset.saturating_add(self.block_count)
    }
}

/// Header of the extent map root embedded in the inode (`xfs_bmdr_block`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmdrHeader {
    pub level: u16,
    pub numrecs: u16,
}

impl BmdrHeader {
    pub const SIZE: usize = 4;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            level: read_be_u16(data, 0)?,
            numrecs: read_be_u16(data, 2)?,
        })
    }

    /// Key/pointer slots in an inline root of `fork_len` bytes.
    #[must_use]
    pub fn max_records(fork_len: usize) -> usize {
        slot_capacity(fork_len, Self::SIZE, 16)
    }
}
