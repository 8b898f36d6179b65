//! Extended attribute layouts: shortform, leaf blocks, and remote value headers.

use crate::da::DaBlkInfo;
use serde::{Deserialize, Serialize};
use xfs_types::{ParseError, ensure_slice, read_be_u16, read_be_u32, read_be_u64, read_u8};

pub const XFS_ATTR_LEAF_MAGIC: u16 = 0xFBEE;
pub const XFS_ATTR3_LEAF_MAGIC: u16 = 0x3BEE;
/// Remote value block header, "XARM" (v5 only).
pub const XFS_ATTR3_RMT_MAGIC: u32 = 0x5841_524d;

pub const XFS_ATTR_LOCAL: u8 = 0x01;
pub const XFS_ATTR_ROOT: u8 = 0x02;
pub const XFS_ATTR_SECURE: u8 = 0x04;
pub const XFS_ATTR_PARENT: u8 = 0x08;
pub const XFS_ATTR_INCOMPLETE: u8 = 0x80;
const XFS_ATTR_NSP_MASK: u8 = XFS_ATTR_ROOT | XFS_ATTR_SECURE | XFS_ATTR_PARENT;

pub const XFS_ATTR_SF_HDR_LEN: usize = 4;
pub const XFS_ATTR_LEAF_HDR_LEN: usize = 32;
pub const XFS_ATTR3_LEAF_HDR_LEN: usize = 80;
pub const XFS_ATTR_LEAF_ENTRY_LEN: usize = 8;
pub const XFS_ATTR3_RMT_HDR_LEN: usize = 56;

// ── Namespaces ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrNamespace {
    User,
    Trusted,
    Secure,
    Parent,
}

impl AttrNamespace {
    /// Classify on-disk entry flags; combined namespace bits are corrupt.
    pub fn from_flags(flags: u8) -> Result<Self, ParseError> {
        match flags & XFS_ATTR_NSP_MASK {
            0 => Ok(Self::User),
            XFS_ATTR_ROOT => Ok(Self::Trusted),
            XFS_ATTR_SECURE => Ok(Self::Secure),
            XFS_ATTR_PARENT => Ok(Self::Parent),
            _ => Err(ParseError::InvalidField {
                field: "attr_flags",
                reason: "more than one namespace bit set",
            }),
        }
    }

    /// Linux xattr name prefix.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::User => "user.",
            Self::Trusted => "trusted.",
            Self::Secure => "security.",
            Self::Parent => "parent.",
        }
    }

    #[must_use]
    pub fn to_flags(self) -> u8 {
        match self {
            Self::User => 0,
            Self::Trusted => XFS_ATTR_ROOT,
            Self::Secure => XFS_ATTR_SECURE,
            Self::Parent => XFS_ATTR_PARENT,
        }
    }
}

// ── Shortform ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfAttrHeader {
    pub total_size: u16,
    pub count: u8,
}

impl SfAttrHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let header = Self {
            total_size: read_be_u16(data, 0)?,
            count: read_u8(data, 2)?,
        };
        let total = usize::from(header.total_size);
        if total < XFS_ATTR_SF_HDR_LEN || total > data.len() {
            return Err(ParseError::InvalidField {
                field: "sf_totsize",
                reason: "shortform attribute size exceeds fork",
            });
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfAttrEntry {
    pub flags: u8,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub len: usize,
}

impl SfAttrEntry {
    /// Decode the entry at `offset`; `end` is the header's total size.
    pub fn parse(data: &[u8], offset: usize, end: usize) -> Result<Self, ParseError> {
        let region = ensure_slice(data, 0, end)?;
        let namelen = usize::from(read_u8(region, offset)?);
        let valuelen = usize::from(read_u8(region, offset + 1)?);
        let flags = read_u8(region, offset + 2)?;
        let nameval = ensure_slice(region, offset + 3, namelen + valuelen)?;
        Ok(Self {
            flags,
            name: nameval[..namelen].to_vec(),
            value: nameval[namelen..].to_vec(),
            len: 3 + namelen + valuelen,
        })
    }
}

// ── Leaf blocks ─────────────────────────────────────────────────────────────

#[must_use]
pub fn leaf_magic(crc: bool) -> u16 {
    if crc {
        XFS_ATTR3_LEAF_MAGIC
    } else {
        XFS_ATTR_LEAF_MAGIC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrLeafHeader {
    pub info: DaBlkInfo,
    pub count: u16,
    pub used_bytes: u16,
    pub first_used: u16,
}

impl AttrLeafHeader {
    #[must_use]
    pub fn len(crc: bool) -> usize {
        if crc {
            XFS_ATTR3_LEAF_HDR_LEN
        } else {
            XFS_ATTR_LEAF_HDR_LEN
        }
    }

    pub fn parse(data: &[u8], crc: bool) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::len(crc))?;
        let info = DaBlkInfo::parse(data, crc)?;
        if info.magic != leaf_magic(crc) {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(leaf_magic(crc)),
                actual: u64::from(info.magic),
            });
        }
        let base = DaBlkInfo::len(crc);
        let header = Self {
            info,
            count: read_be_u16(data, base)?,
            used_bytes: read_be_u16(data, base + 2)?,
            first_used: read_be_u16(data, base + 4)?,
        };
        let entries_end = Self::len(crc) + usize::from(header.count) * XFS_ATTR_LEAF_ENTRY_LEN;
        if entries_end > data.len() {
            return Err(ParseError::InvalidField {
                field: "attr_leaf_count",
                reason: "leaf entries overrun the block",
            });
        }
        Ok(header)
    }
}

/// Hash index entry of an attribute leaf block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrLeafEntry {
    pub hashval: u32,
    pub name_index: u16,
    pub flags: u8,
}

impl AttrLeafEntry {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            hashval: read_be_u32(data, offset)?,
            name_index: read_be_u16(data, offset + 4)?,
            flags: read_u8(data, offset + 6)?,
        })
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.flags & XFS_ATTR_LOCAL != 0
    }

    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.flags & XFS_ATTR_INCOMPLETE != 0
    }
}

/// Name (and for local entries, value) referenced by a leaf entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrLeafName {
    Local {
        name: Vec<u8>,
        value: Vec<u8>,
    },
    Remote {
        name: Vec<u8>,
        value_block: u32,
        value_len: u32,
    },
}

impl AttrLeafName {
    pub fn parse(block: &[u8], entry: &AttrLeafEntry) -> Result<Self, ParseError> {
        let off = usize::from(entry.name_index);
        if entry.is_local() {
            let valuelen = usize::from(read_be_u16(block, off)?);
            let namelen = usize::from(read_u8(block, off + 2)?);
            let nameval = ensure_slice(block, off + 3, namelen + valuelen)?;
            Ok(Self::Local {
                name: nameval[..namelen].to_vec(),
                value: nameval[namelen..].to_vec(),
            })
        } else {
            let value_block = read_be_u32(block, off)?;
            let value_len = read_be_u32(block, off + 4)?;
            let namelen = usize::from(read_u8(block, off + 8)?);
            Ok(Self::Remote {
                name: ensure_slice(block, off + 9, namelen)?.to_vec(),
                value_block,
                value_len,
            })
        }
    }

    #[must_use]
    pub fn name(&self) -> &[u8] {
        match self {
            Self::Local { name, .. } | Self::Remote { name, .. } => name,
        }
    }
}

// ── Remote values ───────────────────────────────────────────────────────────

/// Per-block header of a v5 remote attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrRmtHeader {
    pub offset: u32,
    pub bytes: u32,
    pub owner: u64,
    pub blkno: u64,
}

impl AttrRmtHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, XFS_ATTR3_RMT_HDR_LEN)?;
        let magic = read_be_u32(data, 0)?;
        if magic != XFS_ATTR3_RMT_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_ATTR3_RMT_MAGIC),
                actual: u64::from(magic),
            });
        }
        let header = Self {
            offset: read_be_u32(data, 4)?,
            bytes: read_be_u32(data, 8)?,
            owner: read_be_u64(data, 32)?,
            blkno: read_be_u64(data, 40)?,
        };
        if header.bytes as usize > data.len() - XFS_ATTR3_RMT_HDR_LEN {
            return Err(ParseError::InvalidField {
                field: "rm_bytes",
                reason: "remote value fragment exceeds block",
            });
        }
        Ok(header)
    }
}

/// Filesystem blocks needed to hold a remote value of `value_len` bytes.
#[must_use]
pub fn remote_value_blocks(value_len: u32, block_size: u32, crc: bool) -> u32 {
    let per_block = if crc {
        block_size.saturating_sub(XFS_ATTR3_RMT_HDR_LEN as u32)
    } else {
        block_size
    };
    if per_block == 0 {
        return 0;
    }
    value_len.div_ceil(per_block)
}
