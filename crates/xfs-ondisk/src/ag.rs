//! Allocation group headers: the free-space header (AGF) and the inode
//! header (AGI). Both live in fixed sectors at the start of every AG.

use serde::{Deserialize, Serialize};
use xfs_types::{NULLAGINO, ParseError, read_be_u32, read_fixed};

pub const XFS_AGF_MAGIC: u32 = 0x5841_4746;
pub const XFS_AGI_MAGIC: u32 = 0x5841_4749;
pub const XFS_AGF_VERSION: u32 = 1;
pub const XFS_AGI_VERSION: u32 = 1;

/// Sector index of the AGF within an allocation group.
pub const AGF_SECTOR: u32 = 1;
/// Sector index of the AGI within an allocation group.
pub const AGI_SECTOR: u32 = 2;

/// Number of unlinked-inode hash buckets in the AGI.
pub const XFS_AGI_UNLINKED_BUCKETS: usize = 64;

const AGF_FIELDS_END: usize = 96;
const AGI_FIELDS_END: usize = 296;

/// Btree root and height pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeRootInfo {
    pub root: u32,
    pub level: u32,
}

impl BtreeRootInfo {
    /// An empty or absent tree has level 0.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.level > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agf {
    pub seqno: u32,
    pub length: u32,
    pub by_block: BtreeRootInfo,
    pub by_size: BtreeRootInfo,
    pub rmap: BtreeRootInfo,
    pub refcount: BtreeRootInfo,
    pub fl_first: u32,
    pub fl_last: u32,
    pub fl_count: u32,
    pub free_blocks: u32,
    pub longest: u32,
    pub btree_blocks: u32,
    pub rmap_blocks: u32,
    pub refcount_blocks: u32,
    pub uuid: [u8; 16],
}

impl Agf {
    /// Parse an AGF sector. `has_crc` enables the v5-only fields.
    pub fn parse(data: &[u8], has_crc: bool) -> Result<Self, ParseError> {
        xfs_types::ensure_slice(data, 0, AGF_FIELDS_END)?;
        let magic = read_be_u32(data, 0)?;
        if magic != XFS_AGF_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_AGF_MAGIC),
                actual: u64::from(magic),
            });
        }
        if read_be_u32(data, 4)? != XFS_AGF_VERSION {
            return Err(ParseError::InvalidField {
                field: "agf_versionnum",
                reason: "unsupported AGF version",
            });
        }
        let root = |i: usize| -> Result<BtreeRootInfo, ParseError> {
            Ok(BtreeRootInfo {
                root: read_be_u32(data, 16 + i * 4)?,
                level: read_be_u32(data, 28 + i * 4)?,
            })
        };
        let agf = Self {
            seqno: read_be_u32(data, 8)?,
            length: read_be_u32(data, 12)?,
            by_block: root(0)?,
            by_size: root(1)?,
            rmap: root(2)?,
            refcount: BtreeRootInfo {
                root: read_be_u32(data, 88)?,
                level: read_be_u32(data, 92)?,
            },
            fl_first: read_be_u32(data, 40)?,
            fl_last: read_be_u32(data, 44)?,
            fl_count: read_be_u32(data, 48)?,
            free_blocks: read_be_u32(data, 52)?,
            longest: read_be_u32(data, 56)?,
            btree_blocks: read_be_u32(data, 60)?,
            rmap_blocks: read_be_u32(data, 80)?,
            refcount_blocks: read_be_u32(data, 84)?,
            uuid: if has_crc {
                read_fixed::<16>(data, 64)?
            } else {
                [0; 16]
            },
        };
        if agf.free_blocks > agf.length || agf.longest > agf.length {
            return Err(ParseError::InvalidField {
                field: "agf_freeblks",
                reason: "free space exceeds allocation group length",
            });
        }
        Ok(agf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agi {
    pub seqno: u32,
    pub length: u32,
    pub count: u32,
    pub inodes: BtreeRootInfo,
    pub free_count: u32,
    pub new_ino: u32,
    pub dir_ino: u32,
    pub unlinked: Vec<u32>,
    pub uuid: [u8; 16],
    /// Free-inode index root; absent unless the volume has one.
    pub free_inodes: Option<BtreeRootInfo>,
}

impl Agi {
    /// Parse an AGI sector. `finobt` reads the free-inode index root.
    pub fn parse(data: &[u8], has_crc: bool, finobt: bool) -> Result<Self, ParseError> {
        xfs_types::ensure_slice(data, 0, AGI_FIELDS_END)?;
        let magic = read_be_u32(data, 0)?;
        if magic != XFS_AGI_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_AGI_MAGIC),
                actual: u64::from(magic),
            });
        }
        if read_be_u32(data, 4)? != XFS_AGI_VERSION {
            return Err(ParseError::InvalidField {
                field: "agi_versionnum",
                reason: "unsupported AGI version",
            });
        }
        let unlinked = (0..XFS_AGI_UNLINKED_BUCKETS)
            .map(|i| read_be_u32(data, 40 + i * 4))
            .collect::<Result<Vec<_>, _>>()?;
        let count = read_be_u32(data, 16)?;
        let free_count = read_be_u32(data, 28)?;
        if free_count > count {
            return Err(ParseError::InvalidField {
                field: "agi_freecount",
                reason: "more free inodes than allocated",
            });
        }
        Ok(Self {
            seqno: read_be_u32(data, 8)?,
            length: read_be_u32(data, 12)?,
            count,
            inodes: BtreeRootInfo {
                root: read_be_u32(data, 20)?,
                level: read_be_u32(data, 24)?,
            },
            free_count,
            new_ino: read_be_u32(data, 32)?,
            dir_ino: read_be_u32(data, 36)?,
            unlinked,
            uuid: if has_crc {
                read_fixed::<16>(data, 296)?
            } else {
                [0; 16]
            },
            free_inodes: if finobt {
                Some(BtreeRootInfo {
                    root: read_be_u32(data, 328)?,
                    level: read_be_u32(data, 332)?,
                })
            } else {
                None
            },
        })
    }

    /// Buckets whose unlinked list is non-empty.
    pub fn unlinked_heads(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.unlinked
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, head)| *head != NULLAGINO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn sample_agf() -> Vec<u8> {
        let mut b = vec![0_u8; 512];
        put(&mut b, 0, XFS_AGF_MAGIC);
        put(&mut b, 4, 1);
        put(&mut b, 8, 2);
        put(&mut b, 12, 4096);
        put(&mut b, 16, 1);
        put(&mut b, 20, 2);
        put(&mut b, 24, 5);
        put(&mut b, 28, 1);
        put(&mut b, 32, 2);
        put(&mut b, 36, 1);
        put(&mut b, 52, 3000);
        put(&mut b, 56, 2900);
        put(&mut b, 88, 6);
        put(&mut b, 92, 1);
        b
    }

    #[test]
    fn parses_agf_roots() {
        let agf = Agf::parse(&sample_agf(), true).unwrap();
        assert_eq!(agf.seqno, 2);
        assert_eq!(agf.by_block, BtreeRootInfo { root: 1, level: 1 });
        assert_eq!(agf.by_size, BtreeRootInfo { root: 2, level: 2 });
        assert_eq!(agf.rmap.root, 5);
        assert_eq!(agf.refcount, BtreeRootInfo { root: 6, level: 1 });
        assert_eq!(agf.longest, 2900);
    }

    #[test]
    fn agf_rejects_bad_magic_and_counts() {
        let mut raw = sample_agf();
        raw[3] = 0;
        assert!(matches!(
            Agf::parse(&raw, true),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut raw = sample_agf();
        put(&mut raw, 52, 5000);
        assert!(Agf::parse(&raw, true).is_err());
    }

    #[test]
    fn parses_agi_with_unlinked_buckets() {
        let mut b = vec![0_u8; 512];
        put(&mut b, 0, XFS_AGI_MAGIC);
        put(&mut b, 4, 1);
        put(&mut b, 12, 4096);
        put(&mut b, 16, 64);
        put(&mut b, 20, 3);
        put(&mut b, 24, 1);
        put(&mut b, 28, 61);
        for i in 0..XFS_AGI_UNLINKED_BUCKETS {
            put(&mut b, 40 + i * 4, NULLAGINO);
        }
        put(&mut b, 40 + 7 * 4, 133);
        put(&mut b, 328, 4);
        put(&mut b, 332, 1);

        let agi = Agi::parse(&b, true, true).unwrap();
        assert_eq!(agi.count, 64);
        assert_eq!(agi.inodes, BtreeRootInfo { root: 3, level: 1 });
        assert_eq!(agi.free_inodes, Some(BtreeRootInfo { root: 4, level: 1 }));
        assert_eq!(agi.unlinked_heads().collect::<Vec<_>>(), vec![(7, 133)]);

        let no_finobt = Agi::parse(&b, true, false).unwrap();
        assert_eq!(no_finobt.free_inodes, None);

        put(&mut b, 28, 65);
        assert!(Agi::parse(&b, true, true).is_err());
    }
}
