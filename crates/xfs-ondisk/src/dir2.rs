//! Version 2/3 directory layouts: shortform, data/block blocks, leaf index
//! blocks, and the directory name hash.

use crate::da::DaBlkInfo;
use serde::{Deserialize, Serialize};
use xfs_types::{
    ParseError, align_up, ensure_slice, read_be_u16, read_be_u32, read_be_u64, read_be_uint,
    read_u8,
};

// ── Magic numbers ───────────────────────────────────────────────────────────

/// Single-block directory, "XD2B".
pub const XFS_DIR2_BLOCK_MAGIC: u32 = 0x5844_3242;
/// Multi-block data block, "XD2D".
pub const XFS_DIR2_DATA_MAGIC: u32 = 0x5844_3244;
/// Freespace index block, "XD2F".
pub const XFS_DIR2_FREE_MAGIC: u32 = 0x5844_3246;
pub const XFS_DIR3_BLOCK_MAGIC: u32 = 0x5844_4233;
pub const XFS_DIR3_DATA_MAGIC: u32 = 0x5844_4433;
pub const XFS_DIR3_FREE_MAGIC: u32 = 0x5844_4633;

pub const XFS_DIR2_LEAF1_MAGIC: u16 = 0xD2F1;
pub const XFS_DIR2_LEAFN_MAGIC: u16 = 0xD2FF;
pub const XFS_DIR3_LEAF1_MAGIC: u16 = 0x3DF1;
pub const XFS_DIR3_LEAFN_MAGIC: u16 = 0x3DFF;

/// Free tag marking an unused region inside a data block.
pub const XFS_DIR2_DATA_FREE_TAG: u16 = 0xFFFF;
/// Leaf entry address of a stale (deleted) entry.
pub const XFS_DIR2_NULL_DATAPTR: u32 = 0;

pub const XFS_DIR2_DATA_HDR_LEN: usize = 16;
pub const XFS_DIR3_DATA_HDR_LEN: usize = 64;
pub const XFS_DIR2_LEAF_HDR_LEN: usize = 16;
pub const XFS_DIR3_LEAF_HDR_LEN: usize = 64;
pub const XFS_DIR2_BLOCK_TAIL_LEN: usize = 8;
pub const XFS_DIR2_LEAF_ENTRY_LEN: usize = 8;
pub const XFS_DIR2_DATA_ALIGN: u64 = 8;

// ── File type hints ─────────────────────────────────────────────────────────

/// Directory entry file type hint (`XFS_DIR3_FT_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Unknown,
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
    Whiteout,
}

impl FileType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Regular,
            2 => Self::Directory,
            3 => Self::CharDevice,
            4 => Self::BlockDevice,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            8 => Self::Whiteout,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Regular => 1,
            Self::Directory => 2,
            Self::CharDevice => 3,
            Self::BlockDevice => 4,
            Self::Fifo => 5,
            Self::Socket => 6,
            Self::Symlink => 7,
            Self::Whiteout => 8,
        }
    }
}

// ── Name hash ───────────────────────────────────────────────────────────────

/// Directory and attribute name hash (`xfs_da_hashname`).
#[must_use]
pub fn da_hashname(name: &[u8]) -> u32 {
    let mut hash = 0_u32;
    let mut chunks = name.chunks_exact(4);
    for c in &mut chunks {
        hash = (u32::from(c[0]) << 21)
            ^ (u32::from(c[1]) << 14)
            ^ (u32::from(c[2]) << 7)
            ^ u32::from(c[3])
            ^ hash.rotate_left(7 * 4);
    }
    match *chunks.remainder() {
        [a, b, c] => {
            (u32::from(a) << 14) ^ (u32::from(b) << 7) ^ u32::from(c) ^ hash.rotate_left(7 * 3)
        }
        [a, b] => (u32::from(a) << 7) ^ u32::from(b) ^ hash.rotate_left(7 * 2),
        [a] => u32::from(a) ^ hash.rotate_left(7),
        _ => hash,
    }
}

/// Case-folded hash used by ASCII case-insensitive directories.
#[must_use]
pub fn ascii_ci_hashname(name: &[u8]) -> u32 {
    let mut hash = 0_u32;
    for &b in name {
        hash = u32::from(b.to_ascii_lowercase()) ^ hash.rotate_left(7);
    }
    hash
}

// ── Shortform ───────────────────────────────────────────────────────────────

/// Shortform directory header (`xfs_dir2_sf_hdr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfDirHeader {
    pub count: u8,
    pub i8count: u8,
    pub parent: u64,
}

impl SfDirHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let count = read_u8(data, 0)?;
        let i8count = read_u8(data, 1)?;
        let width = Self::ino_width_for(i8count);
        Ok(Self {
            count,
            i8count,
            parent: read_be_uint(data, 2, width)?,
        })
    }

    fn ino_width_for(i8count: u8) -> usize {
        if i8count > 0 { 8 } else { 4 }
    }

    /// Width of every inode number stored in this directory.
    #[must_use]
    pub fn ino_width(&self) -> usize {
        Self::ino_width_for(self.i8count)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        2 + self.ino_width()
    }

    /// Number of entries. `i8count` only selects the inode number width; an
    /// empty directory under a parent above 2^32 has `count == 0` and
    /// `i8count == 1`.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        usize::from(self.count)
    }
}

/// One shortform entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfDirEntry {
    pub name: Vec<u8>,
    /// Data-block offset this entry would occupy; used only for ordering.
    pub offset: u16,
    pub ftype: Option<u8>,
    pub ino: u64,
    /// Bytes consumed by this entry.
    pub len: usize,
}

impl SfDirEntry {
    pub fn parse(
        data: &[u8],
        offset: usize,
        has_ftype: bool,
        ino_width: usize,
    ) -> Result<Self, ParseError> {
        let namelen = usize::from(read_u8(data, offset)?);
        if namelen == 0 {
            return Err(ParseError::InvalidField {
                field: "sf_namelen",
                reason: "zero-length name",
            });
        }
        let tag = read_be_u16(data, offset + 1)?;
        let name = ensure_slice(data, offset + 3, namelen)?.to_vec();
        let mut cursor = offset + 3 + namelen;
        let ftype = if has_ftype {
            let ft = read_u8(data, cursor)?;
            cursor += 1;
            Some(ft)
        } else {
            None
        };
        let ino = read_be_uint(data, cursor, ino_width)?;
        cursor += ino_width;
        Ok(Self {
            name,
            offset: tag,
            ftype,
            ino,
            len: cursor - offset,
        })
    }
}

// ── Data and block blocks ───────────────────────────────────────────────────

#[must_use]
pub fn data_header_len(crc: bool) -> usize {
    if crc {
        XFS_DIR3_DATA_HDR_LEN
    } else {
        XFS_DIR2_DATA_HDR_LEN
    }
}

#[must_use]
pub fn block_magic(crc: bool) -> u32 {
    if crc {
        XFS_DIR3_BLOCK_MAGIC
    } else {
        XFS_DIR2_BLOCK_MAGIC
    }
}

#[must_use]
pub fn data_magic(crc: bool) -> u32 {
    if crc {
        XFS_DIR3_DATA_MAGIC
    } else {
        XFS_DIR2_DATA_MAGIC
    }
}

/// Check a data or block header magic and return the header length.
pub fn check_data_header(data: &[u8], expected_magic: u32, crc: bool) -> Result<usize, ParseError> {
    let magic = read_be_u32(data, 0)?;
    if magic != expected_magic {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(expected_magic),
            actual: u64::from(magic),
        });
    }
    let len = data_header_len(crc);
    ensure_slice(data, 0, len)?;
    Ok(len)
}

/// Size of a data entry with a name of `namelen` bytes, including padding.
#[must_use]
pub fn data_entry_len(namelen: usize, has_ftype: bool) -> usize {
    let raw = 8 + 1 + namelen + usize::from(has_ftype) + 2;
    // Names are at most 255 bytes; alignment cannot overflow.
    align_up(raw as u64, XFS_DIR2_DATA_ALIGN).map_or(raw, |v| v as usize)
}

/// One slot in a data block: a live entry or an unused gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSlot {
    Entry {
        ino: u64,
        name: Vec<u8>,
        ftype: Option<u8>,
        /// Offset of this entry within the block, as stored in its tag.
        tag: u16,
        len: usize,
    },
    Unused {
        len: usize,
    },
}

impl DataSlot {
    /// Decode the slot at `offset`. `end` bounds the region holding entries.
    pub fn parse(
        data: &[u8],
        offset: usize,
        end: usize,
        has_ftype: bool,
    ) -> Result<Self, ParseError> {
        let region = ensure_slice(data, 0, end)?;
        if read_be_u16(region, offset)? == XFS_DIR2_DATA_FREE_TAG {
            let len = usize::from(read_be_u16(region, offset + 2)?);
            if len == 0 || len % 8 != 0 || offset + len > end {
                return Err(ParseError::InvalidField {
                    field: "dup_length",
                    reason: "unused region length out of bounds",
                });
            }
            return Ok(Self::Unused { len });
        }
        let ino = read_be_u64(region, offset)?;
        let namelen = usize::from(read_u8(region, offset + 8)?);
        if namelen == 0 {
            return Err(ParseError::InvalidField {
                field: "dep_namelen",
                reason: "zero-length name",
            });
        }
        let len = data_entry_len(namelen, has_ftype);
        ensure_slice(region, offset, len)?;
        let name = region[offset + 9..offset + 9 + namelen].to_vec();
        let ftype = has_ftype.then(|| region[offset + 9 + namelen]);
        let tag = read_be_u16(region, offset + len - 2)?;
        if usize::from(tag) != offset {
            return Err(ParseError::InvalidField {
                field: "dep_tag",
                reason: "entry tag does not match its offset",
            });
        }
        Ok(Self::Entry {
            ino,
            name,
            ftype,
            tag,
            len,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Entry { len, .. } | Self::Unused { len } => *len,
        }
    }
}

/// Tail of a single-block directory (`xfs_dir2_block_tail`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTail {
    pub count: u32,
    pub stale: u32,
}

impl BlockTail {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let off = block
            .len()
            .checked_sub(XFS_DIR2_BLOCK_TAIL_LEN)
            .ok_or(ParseError::InsufficientData {
                needed: XFS_DIR2_BLOCK_TAIL_LEN,
                offset: 0,
                actual: block.len(),
            })?;
        Ok(Self {
            count: read_be_u32(block, off)?,
            stale: read_be_u32(block, off + 4)?,
        })
    }

    /// Byte offset of the first leaf entry; entries end where the tail starts.
    pub fn leaf_start(&self, block_len: usize, header_len: usize) -> Result<usize, ParseError> {
        let leaf_bytes = (self.count as usize)
            .checked_mul(XFS_DIR2_LEAF_ENTRY_LEN)
            .ok_or(ParseError::IntegerConversion { field: "btp_count" })?;
        block_len
            .checked_sub(XFS_DIR2_BLOCK_TAIL_LEN + leaf_bytes)
            .filter(|start| *start >= header_len && self.stale <= self.count)
            .ok_or(ParseError::InvalidField {
                field: "btp_count",
                reason: "leaf entries overrun the block",
            })
    }
}

// ── Leaf blocks ─────────────────────────────────────────────────────────────

/// Hash index entry: a name hash and the dataptr of its entry (8-byte units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    pub hashval: u32,
    pub address: u32,
}

impl LeafEntry {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            hashval: read_be_u32(data, offset)?,
            address: read_be_u32(data, offset + 4)?,
        })
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.address == XFS_DIR2_NULL_DATAPTR
    }
}

/// Header of a leaf1 or leafn block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafHeader {
    pub info: DaBlkInfo,
    pub count: u16,
    pub stale: u16,
}

impl LeafHeader {
    #[must_use]
    pub fn len(crc: bool) -> usize {
        if crc {
            XFS_DIR3_LEAF_HDR_LEN
        } else {
            XFS_DIR2_LEAF_HDR_LEN
        }
    }

    pub fn parse(data: &[u8], crc: bool) -> Result<Self, ParseError> {
        let info = DaBlkInfo::parse(data, crc)?;
        let base = DaBlkInfo::len(crc);
        let header = Self {
            info,
            count: read_be_u16(data, base)?,
            stale: read_be_u16(data, base + 2)?,
        };
        let needed = Self::len(crc) + usize::from(header.count) * XFS_DIR2_LEAF_ENTRY_LEN;
        if needed > data.len() || header.stale > header.count {
            return Err(ParseError::InvalidField {
                field: "leaf_count",
                reason: "leaf entries overrun the block",
            });
        }
        Ok(header)
    }

    #[must_use]
    pub fn is_leaf1(&self) -> bool {
        matches!(self.info.magic, XFS_DIR2_LEAF1_MAGIC | XFS_DIR3_LEAF1_MAGIC)
    }

    #[must_use]
    pub fn is_leafn(&self) -> bool {
        matches!(self.info.magic, XFS_DIR2_LEAFN_MAGIC | XFS_DIR3_LEAFN_MAGIC)
    }
}

#[must_use]
pub fn leaf1_magic(crc: bool) -> u16 {
    if crc {
        XFS_DIR3_LEAF1_MAGIC
    } else {
        XFS_DIR2_LEAF1_MAGIC
    }
}

#[must_use]
pub fn leafn_magic(crc: bool) -> u16 {
    if crc {
        XFS_DIR3_LEAFN_MAGIC
    } else {
        XFS_DIR2_LEAFN_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_reference_values() {
        assert_eq!(da_hashname(b""), 0);
        assert_eq!(da_hashname(b"a"), 0x61);
        assert_eq!(da_hashname(b"ab"), (0x61 << 7) ^ 0x62);
        assert_eq!(da_hashname(b"abc"), (0x61 << 14) ^ (0x62 << 7) ^ 0x63);
        let four = (0x61 << 21) ^ (0x62 << 14) ^ (0x63 << 7) ^ 0x64;
        assert_eq!(da_hashname(b"abcd"), four);
        let five = 0x65 ^ four.rotate_left(7);
        assert_eq!(da_hashname(b"abcde"), five);
    }

    #[test]
    fn ci_hash_folds_case_and_agrees_on_lowercase() {
        assert_eq!(ascii_ci_hashname(b"README"), ascii_ci_hashname(b"readme"));
        for name in [&b"x"[..], b"lower", b"abcdefgh", b"a.txt"] {
            assert_eq!(ascii_ci_hashname(name), da_hashname(name));
        }
    }

    #[test]
    fn wide_parent_does_not_count_as_entry() {
        let mut sf = vec![0_u8, 1];
        sf.extend_from_slice(&(1_u64 << 33).to_be_bytes());
        let hdr = SfDirHeader::parse(&sf).unwrap();
        assert_eq!((hdr.entry_count(), hdr.ino_width(), hdr.len()), (0, 8, 10));
        assert_eq!(hdr.parent, 1 << 33);
    }

    #[test]
    fn shortform_entries() {
        // count 2, i8count 0, parent 128; entries a.txt -> 131, sub -> 132.
        let mut sf = vec![2_u8, 0];
        sf.extend_from_slice(&128_u32.to_be_bytes());
        sf.extend_from_slice(&[5, 0, 0x60]);
        sf.extend_from_slice(b"a.txt");
        sf.push(1);
        sf.extend_from_slice(&131_u32.to_be_bytes());
        sf.extend_from_slice(&[3, 0, 0x70]);
        sf.extend_from_slice(b"sub");
        sf.push(2);
        sf.extend_from_slice(&132_u32.to_be_bytes());

        let hdr = SfDirHeader::parse(&sf).unwrap();
        assert_eq!((hdr.entry_count(), hdr.parent, hdr.len()), (2, 128, 6));
        let first = SfDirEntry::parse(&sf, hdr.len(), true, hdr.ino_width()).unwrap();
        assert_eq!(first.name, b"a.txt");
        assert_eq!((first.ino, first.ftype, first.offset), (131, Some(1), 0x60));
        let second = SfDirEntry::parse(&sf, hdr.len() + first.len, true, 4).unwrap();
        assert_eq!((second.name.as_slice(), second.ino), (&b"sub"[..], 132));

        // Truncated fork.
        assert!(SfDirEntry::parse(&sf[..sf.len() - 2], hdr.len() + first.len, true, 4).is_err());
    }

    #[test]
    fn data_slots_and_tail() {
        let mut block = vec![0_u8; 512];
        block[0..4].copy_from_slice(&XFS_DIR2_BLOCK_MAGIC.to_be_bytes());
        // Entry at 16: ino 131, "a.txt", ftype 1.
        block[16..24].copy_from_slice(&131_u64.to_be_bytes());
        block[24] = 5;
        block[25..30].copy_from_slice(b"a.txt");
        block[30] = 1;
        let len = data_entry_len(5, true);
        assert_eq!(len, 24);
        block[16 + len - 2..16 + len].copy_from_slice(&16_u16.to_be_bytes());
        // Unused region at 40 of 16 bytes.
        block[40..42].copy_from_slice(&XFS_DIR2_DATA_FREE_TAG.to_be_bytes());
        block[42..44].copy_from_slice(&16_u16.to_be_bytes());
        // Tail: 1 leaf entry.
        block[504..508].copy_from_slice(&1_u32.to_be_bytes());

        assert_eq!(check_data_header(&block, block_magic(false), false).unwrap(), 16);
        assert!(check_data_header(&block, data_magic(true), true).is_err());

        let tail = BlockTail::parse(&block).unwrap();
        assert_eq!(tail.count, 1);
        let end = tail.leaf_start(512, 16).unwrap();
        assert_eq!(end, 496);

        match DataSlot::parse(&block, 16, end, true).unwrap() {
            DataSlot::Entry { ino, name, ftype, tag, len } => {
                assert_eq!((ino, name.as_slice(), ftype, tag, len), (131, &b"a.txt"[..], Some(1), 16, 24));
            }
            DataSlot::Unused { .. } => panic!("expected entry"),
        }
        assert_eq!(
            DataSlot::parse(&block, 40, end, true).unwrap(),
            DataSlot::Unused { len: 16 }
        );

        // Tag mismatch is corruption.
        block[38..40].copy_from_slice(&17_u16.to_be_bytes());
        assert!(DataSlot::parse(&block, 16, end, true).is_err());
    }

    #[test]
    fn tail_count_overrun() {
        let mut block = vec![0_u8; 64];
        block[56..60].copy_from_slice(&100_u32.to_be_bytes());
        let tail = BlockTail::parse(&block).unwrap();
        assert!(tail.leaf_start(64, 16).is_err());
    }

    #[test]
    fn leaf_header_bounds() {
        let mut b = vec![0_u8; 64];
        b[8..10].copy_from_slice(&XFS_DIR2_LEAFN_MAGIC.to_be_bytes());
        b[12..14].copy_from_slice(&6_u16.to_be_bytes());
        let h = LeafHeader::parse(&b, false).unwrap();
        assert!(h.is_leafn());
        assert!(!h.is_leaf1());
        b[12..14].copy_from_slice(&7_u16.to_be_bytes());
        assert!(LeafHeader::parse(&b, false).is_err());

        let e = LeafEntry { hashval: 1, address: 0 };
        assert!(e.is_stale());
        assert_eq!(FileType::from_raw(7), FileType::Symlink);
        assert_eq!(FileType::from_raw(99), FileType::Unknown);
        assert_eq!(FileType::Whiteout.to_raw(), 8);
    }
}
