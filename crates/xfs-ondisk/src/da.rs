//! Directory/attribute ("DA") btree block headers.
//!
//! Every multi-block directory and attribute structure starts with the same
//! block info header carrying sibling links and a 16-bit magic; interior
//! nodes add a count/level header followed by `(hashval, before)` pairs.

use xfs_types::{ParseError, ensure_slice, read_be_u16, read_be_u32, read_be_u64};

pub const XFS_DA_NODE_MAGIC: u16 = 0xFEBE;
pub const XFS_DA3_NODE_MAGIC: u16 = 0x3EBE;

/// `xfs_da_blkinfo` length: forw, back, magic, pad.
pub const XFS_DA_BLKINFO_LEN: usize = 12;
/// `xfs_da3_blkinfo` length: adds crc, blkno, lsn, uuid, owner.
pub const XFS_DA3_BLKINFO_LEN: usize = 56;

pub const XFS_DA_NODE_HDR_LEN: usize = 16;
pub const XFS_DA3_NODE_HDR_LEN: usize = 64;

/// Bytes per `(hashval, before)` node entry.
pub const XFS_DA_NODE_ENTRY_LEN: usize = 8;

/// Deepest DA btree the kernel builds.
pub const XFS_DA_NODE_MAXDEPTH: u16 = 5;

/// Sibling links and magic common to all DA blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaBlkInfo {
    pub forw: Option<u32>,
    pub back: Option<u32>,
    pub magic: u16,
    /// v5 self-describing fields.
    pub blkno: Option<u64>,
    pub owner: Option<u64>,
}

impl DaBlkInfo {
    #[must_use]
    pub fn len(crc: bool) -> usize {
        if crc {
            XFS_DA3_BLKINFO_LEN
        } else {
            XFS_DA_BLKINFO_LEN
        }
    }

    pub fn parse(data: &[u8], crc: bool) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::len(crc))?;
        let link = |off| read_be_u32(data, off).map(|v| (v != 0).then_some(v));
        Ok(Self {
            forw: link(0)?,
            back: link(4)?,
            magic: read_be_u16(data, 8)?,
            blkno: if crc { Some(read_be_u64(data, 16)?) } else { None },
            owner: if crc { Some(read_be_u64(data, 48)?) } else { None },
        })
    }

    /// Peek only at the magic of a block without validating its length.
    pub fn peek_magic(data: &[u8]) -> Result<u16, ParseError> {
        read_be_u16(data, 8)
    }
}

/// Interior DA node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaNodeHeader {
    pub info: DaBlkInfo,
    pub count: u16,
    pub level: u16,
}

impl DaNodeHeader {
    #[must_use]
    pub fn len(crc: bool) -> usize {
        if crc {
            XFS_DA3_NODE_HDR_LEN
        } else {
            XFS_DA_NODE_HDR_LEN
        }
    }

    #[must_use]
    pub fn magic(crc: bool) -> u16 {
        if crc {
            XFS_DA3_NODE_MAGIC
        } else {
            XFS_DA_NODE_MAGIC
        }
    }

    pub fn parse(data: &[u8], crc: bool) -> Result<Self, ParseError> {
        let info = DaBlkInfo::parse(data, crc)?;
        if info.magic != Self::magic(crc) {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(Self::magic(crc)),
                actual: u64::from(info.magic),
            });
        }
        let base = DaBlkInfo::len(crc);
        let header = Self {
            info,
            count: read_be_u16(data, base)?,
            level: read_be_u16(data, base + 2)?,
        };
        if header.level == 0 || header.level > XFS_DA_NODE_MAXDEPTH {
            return Err(ParseError::InvalidField {
                field: "da_node_level",
                reason: "interior node level out of range",
            });
        }
        Ok(header)
    }
}

/// Interior DA node entry: every hash in the subtree at `before` is at most `hashval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaNodeEntry {
    pub hashval: u32,
    pub before: u32,
}

impl DaNodeEntry {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            hashval: read_be_u32(data, 0)?,
            before: read_be_u32(data, 4)?,
        })
    }
}
