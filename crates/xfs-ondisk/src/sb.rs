//! Superblock layout, feature flags, and the derived volume geometry.

use crate::checksum::SB_CRC_OFFSET;
use serde::{Deserialize, Serialize};
use xfs_types::{
    AgBlock, AgInode, AgNumber, BlockNumber, BlockSize, ByteOffset, FileBlock, FsBlock,
    InodeNumber, ParseError, XFS_SB_MAGIC, log2_roundup, read_be_u16, read_be_u32, read_be_u64,
    read_fixed, read_u8, trim_nul_padded,
};

/// Bytes of the primary superblock that carry fields (v5 layout).
pub const XFS_SB_SIZE: usize = 264;

/// Field offsets of `struct xfs_dsb`.
mod off {
    pub const MAGICNUM: usize = 0;
    pub const BLOCKSIZE: usize = 4;
    pub const DBLOCKS: usize = 8;
    pub const RBLOCKS: usize = 16;
    pub const UUID: usize = 32;
    pub const LOGSTART: usize = 48;
    pub const ROOTINO: usize = 56;
    pub const RBMINO: usize = 64;
    pub const RSUMINO: usize = 72;
    pub const AGBLOCKS: usize = 84;
    pub const AGCOUNT: usize = 88;
    pub const LOGBLOCKS: usize = 96;
    pub const VERSIONNUM: usize = 100;
    pub const SECTSIZE: usize = 102;
    pub const INODESIZE: usize = 104;
    pub const INOPBLOCK: usize = 106;
    pub const FNAME: usize = 108;
    pub const BLOCKLOG: usize = 120;
    pub const SECTLOG: usize = 121;
    pub const INODELOG: usize = 122;
    pub const INOPBLOG: usize = 123;
    pub const AGBLKLOG: usize = 124;
    pub const INPROGRESS: usize = 126;
    pub const ICOUNT: usize = 128;
    pub const IFREE: usize = 136;
    pub const FDBLOCKS: usize = 144;
    pub const UQUOTINO: usize = 160;
    pub const GQUOTINO: usize = 168;
    pub const INOALIGNMT: usize = 180;
    pub const DIRBLKLOG: usize = 192;
    pub const FEATURES2: usize = 200;
    pub const FEATURES_COMPAT: usize = 208;
    pub const FEATURES_RO_COMPAT: usize = 212;
    pub const FEATURES_INCOMPAT: usize = 216;
    pub const FEATURES_LOG_INCOMPAT: usize = 220;
    pub const SPINO_ALIGN: usize = 228;
    pub const PQUOTINO: usize = 232;
    pub const LSN: usize = 240;
    pub const META_UUID: usize = 248;
}

// ── Feature flags ───────────────────────────────────────────────────────────

macro_rules! feature_flags {
    (
        $(#[$meta:meta])*
        $name:ident { $($flag:ident = $bit:expr),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            $(pub const $flag: Self = Self($bit);)*

            const KNOWN: &'static [(u32, &'static str)] = &[$(($bit, stringify!($flag))),*];

            #[must_use]
            pub fn bits(self) -> u32 {
                self.0
            }

            #[must_use]
            pub fn contains(self, flag: Self) -> bool {
                (self.0 & flag.0) != 0
            }

            /// Return names of all set flags. Unknown bits are omitted.
            #[must_use]
            pub fn describe(self) -> Vec<&'static str> {
                Self::KNOWN
                    .iter()
                    .filter(|(bit, _)| self.0 & bit != 0)
                    .map(|(_, name)| *name)
                    .collect()
            }

            /// Return the raw unknown bits (not covered by any named constant).
            #[must_use]
            pub fn unknown_bits(self) -> u32 {
                let known_mask: u32 = Self::KNOWN.iter().map(|(bit, _)| bit).fold(0, |a, b| a | b);
                self.0 & !known_mask
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                format_flags(f, self.0, Self::KNOWN)
            }
        }
    };
}

feature_flags! {
    /// Low bits of `sb_versionnum` above the version number nibble.
    XfsVersionFlags {
        ATTR = 0x0010,
        NLINK = 0x0020,
        QUOTA = 0x0040,
        ALIGN = 0x0080,
        DALIGN = 0x0100,
        SHARED = 0x0200,
        LOGV2 = 0x0400,
        SECTOR = 0x0800,
        EXTFLG = 0x1000,
        DIRV2 = 0x2000,
        BORG = 0x4000,
        MOREBITS = 0x8000,
    }
}

feature_flags! {
    /// `sb_features2`, the v4 overflow feature word.
    XfsFeatures2 {
        LAZYSBCOUNT = 0x0002,
        ATTR2 = 0x0008,
        PARENT = 0x0010,
        PROJID32 = 0x0080,
        CRC = 0x0100,
        FTYPE = 0x0200,
    }
}

feature_flags! {
    /// `sb_features_ro_compat` (v5 only).
    XfsRoCompatFeatures {
        FINOBT = 0x0001,
        RMAPBT = 0x0002,
        REFLINK = 0x0004,
        INOBTCNT = 0x0008,
    }
}

feature_flags! {
    /// `sb_features_incompat` (v5 only). Unknown bits make the volume unreadable.
    XfsIncompatFeatures {
        FTYPE = 0x0001,
        SPINODES = 0x0002,
        META_UUID = 0x0004,
        BIGTIME = 0x0008,
        NEEDSREPAIR = 0x0010,
        NREXT64 = 0x0020,
        EXCHRANGE = 0x0040,
        PARENT = 0x0080,
        METADIR = 0x0100,
    }
}

/// Format a bitmask as a pipe-separated list of flag names.
///
/// Example output: `FTYPE|SPINODES` or `(none)` when zero. Unknown bits are
/// appended as hex.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}

/// Incompat bits this decoder understands well enough to read the volume.
const READABLE_INCOMPAT: u32 = XfsIncompatFeatures::FTYPE.0
    | XfsIncompatFeatures::SPINODES.0
    | XfsIncompatFeatures::META_UUID.0
    | XfsIncompatFeatures::BIGTIME.0
    | XfsIncompatFeatures::NEEDSREPAIR.0
    | XfsIncompatFeatures::NREXT64.0
    | XfsIncompatFeatures::EXCHRANGE.0
    | XfsIncompatFeatures::PARENT.0;

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub block_size: u32,
    pub data_blocks: u64,
    pub rt_blocks: u64,
    pub ag_blocks: u32,
    pub ag_count: u32,
    pub sector_size: u16,
    pub inode_size: u16,
    pub inodes_per_block: u16,
    pub block_log: u8,
    pub sector_log: u8,
    pub inode_log: u8,
    pub inopb_log: u8,
    pub ag_block_log: u8,
    pub dir_block_log: u8,
    pub inode_alignment: u32,
    pub sparse_inode_alignment: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub uuid: [u8; 16],
    pub meta_uuid: [u8; 16],
    pub label: String,

    // ── Special inodes ───────────────────────────────────────────────────
    pub root_ino: u64,
    pub rbm_ino: u64,
    pub rsum_ino: u64,
    pub uquot_ino: u64,
    pub gquot_ino: u64,
    pub pquot_ino: u64,

    // ── Log ──────────────────────────────────────────────────────────────
    pub log_start: u64,
    pub log_blocks: u32,
    pub lsn: u64,

    // ── Counters ─────────────────────────────────────────────────────────
    pub inode_count: u64,
    pub inodes_free: u64,
    pub free_data_blocks: u64,
    pub in_progress: u8,

    // ── Features ─────────────────────────────────────────────────────────
    pub version: u8,
    pub version_flags: XfsVersionFlags,
    pub features2: XfsFeatures2,
    pub features_compat: u32,
    pub features_ro_compat: XfsRoCompatFeatures,
    pub features_incompat: XfsIncompatFeatures,
    pub features_log_incompat: u32,

    // ── Checksums ────────────────────────────────────────────────────────
    pub crc: u32,
}

impl Superblock {
    /// Parse the primary superblock from the first sector of the device.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < XFS_SB_SIZE {
            return Err(ParseError::InsufficientData {
                needed: XFS_SB_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_be_u32(region, off::MAGICNUM)?;
        if magic != XFS_SB_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_SB_MAGIC),
                actual: u64::from(magic),
            });
        }

        let versionnum = read_be_u16(region, off::VERSIONNUM)?;
        let version = (versionnum & 0x000F) as u8;
        let is_v5 = version == 5;

        let uuid = read_fixed::<16>(region, off::UUID)?;
        let features_incompat = XfsIncompatFeatures(if is_v5 {
            read_be_u32(region, off::FEATURES_INCOMPAT)?
        } else {
            0
        });
        let meta_uuid = if features_incompat.contains(XfsIncompatFeatures::META_UUID) {
            read_fixed::<16>(region, off::META_UUID)?
        } else {
            uuid
        };

        Ok(Self {
            block_size: read_be_u32(region, off::BLOCKSIZE)?,
            data_blocks: read_be_u64(region, off::DBLOCKS)?,
            rt_blocks: read_be_u64(region, off::RBLOCKS)?,
            ag_blocks: read_be_u32(region, off::AGBLOCKS)?,
            ag_count: read_be_u32(region, off::AGCOUNT)?,
            sector_size: read_be_u16(region, off::SECTSIZE)?,
            inode_size: read_be_u16(region, off::INODESIZE)?,
            inodes_per_block: read_be_u16(region, off::INOPBLOCK)?,
            block_log: read_u8(region, off::BLOCKLOG)?,
            sector_log: read_u8(region, off::SECTLOG)?,
            inode_log: read_u8(region, off::INODELOG)?,
            inopb_log: read_u8(region, off::INOPBLOG)?,
            ag_block_log: read_u8(region, off::AGBLKLOG)?,
            dir_block_log: read_u8(region, off::DIRBLKLOG)?,
            inode_alignment: read_be_u32(region, off::INOALIGNMT)?,
            sparse_inode_alignment: if is_v5 {
                read_be_u32(region, off::SPINO_ALIGN)?
            } else {
                0
            },
            uuid,
            meta_uuid,
            label: trim_nul_padded(&read_fixed::<12>(region, off::FNAME)?),
            root_ino: read_be_u64(region, off::ROOTINO)?,
            rbm_ino: read_be_u64(region, off::RBMINO)?,
            rsum_ino: read_be_u64(region, off::RSUMINO)?,
            uquot_ino: read_be_u64(region, off::UQUOTINO)?,
            gquot_ino: read_be_u64(region, off::GQUOTINO)?,
            pquot_ino: if is_v5 {
                read_be_u64(region, off::PQUOTINO)?
            } else {
                0
            },
            log_start: read_be_u64(region, off::LOGSTART)?,
            log_blocks: read_be_u32(region, off::LOGBLOCKS)?,
            lsn: if is_v5 {
                read_be_u64(region, off::LSN)?
            } else {
                0
            },
            inode_count: read_be_u64(region, off::ICOUNT)?,
            inodes_free: read_be_u64(region, off::IFREE)?,
            free_data_blocks: read_be_u64(region, off::FDBLOCKS)?,
            in_progress: read_u8(region, off::INPROGRESS)?,
            version,
            version_flags: XfsVersionFlags(u32::from(versionnum & 0xFFF0)),
            features2: XfsFeatures2(read_be_u32(region, off::FEATURES2)?),
            features_compat: if is_v5 {
                read_be_u32(region, off::FEATURES_COMPAT)?
            } else {
                0
            },
            features_ro_compat: XfsRoCompatFeatures(if is_v5 {
                read_be_u32(region, off::FEATURES_RO_COMPAT)?
            } else {
                0
            }),
            features_incompat,
            features_log_incompat: if is_v5 {
                read_be_u32(region, off::FEATURES_LOG_INCOMPAT)?
            } else {
                0
            },
            crc: if is_v5 {
                xfs_types::read_le_u32(region, SB_CRC_OFFSET)?
            } else {
                0
            },
        })
    }

    #[must_use]
    pub fn has_crc(&self) -> bool {
        self.version == 5
    }

    #[must_use]
    pub fn has_ftype(&self) -> bool {
        (self.has_crc() && self.features_incompat.contains(XfsIncompatFeatures::FTYPE))
            || self.features2.contains(XfsFeatures2::FTYPE)
    }

    /// Reject versions and feature bits this decoder cannot interpret.
    pub fn validate_features(&self) -> Result<(), ParseError> {
        match self.version {
            4 => {
                if !self.version_flags.contains(XfsVersionFlags::DIRV2) {
                    return Err(ParseError::InvalidField {
                        field: "sb_versionnum",
                        reason: "unsupported feature: version 1 directories",
                    });
                }
            }
            5 => {
                if self.features_incompat.bits() & !READABLE_INCOMPAT != 0 {
                    return Err(ParseError::InvalidField {
                        field: "sb_features_incompat",
                        reason: "unsupported feature: unknown or unreadable incompat bits",
                    });
                }
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "sb_versionnum",
                    reason: "unsupported feature: filesystem version predates v4",
                });
            }
        }
        Ok(())
    }

    /// Check that the geometry fields are self-consistent.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let block_size = BlockSize::new(self.block_size)?;
        if u32::from(self.block_log) != block_size.shift() {
            return Err(ParseError::InvalidField {
                field: "sb_blocklog",
                reason: "does not match sb_blocksize",
            });
        }

        let sect = u32::from(self.sector_size);
        if !sect.is_power_of_two()
            || !(512..=32768).contains(&sect)
            || sect.trailing_zeros() != u32::from(self.sector_log)
        {
            return Err(ParseError::InvalidField {
                field: "sb_sectsize",
                reason: "must be power of two in 512..=32768 matching sb_sectlog",
            });
        }

        let isize = u32::from(self.inode_size);
        if !isize.is_power_of_two()
            || !(256..=2048).contains(&isize)
            || isize.trailing_zeros() != u32::from(self.inode_log)
            || isize > self.block_size
        {
            return Err(ParseError::InvalidField {
                field: "sb_inodesize",
                reason: "must be power of two in 256..=2048 matching sb_inodelog",
            });
        }

        if u32::from(self.inodes_per_block) != self.block_size / isize
            || u32::from(self.inodes_per_block).trailing_zeros() != u32::from(self.inopb_log)
        {
            return Err(ParseError::InvalidField {
                field: "sb_inopblock",
                reason: "does not match block and inode sizes",
            });
        }

        if self.ag_blocks == 0 || self.ag_count == 0 {
            return Err(ParseError::InvalidField {
                field: "sb_agblocks",
                reason: "allocation group size and count must be non-zero",
            });
        }
        if log2_roundup(u64::from(self.ag_blocks)) != u32::from(self.ag_block_log) {
            return Err(ParseError::InvalidField {
                field: "sb_agblklog",
                reason: "does not match sb_agblocks",
            });
        }
        if u32::from(self.ag_block_log) + u32::from(self.inopb_log) > 32 {
            return Err(ParseError::InvalidField {
                field: "sb_agblklog",
                reason: "AG-relative inode numbers exceed 32 bits",
            });
        }

        let dir_shift = u32::from(self.block_log) + u32::from(self.dir_block_log);
        if dir_shift > 16 {
            return Err(ParseError::InvalidField {
                field: "sb_dirblklog",
                reason: "directory block size exceeds 64 KiB",
            });
        }

        if self.root_ino == 0 {
            return Err(ParseError::InvalidField {
                field: "sb_rootino",
                reason: "root inode number is zero",
            });
        }
        Ok(())
    }

    /// Derive the session geometry. Call after `validate_geometry`, or
    /// accept that inconsistent fields yield best-effort values.
    pub fn geometry(&self) -> Result<Geometry, ParseError> {
        let block_size = BlockSize::new(self.block_size)?;
        // Address composition shifts by these; out-of-range values cannot be
        // interpreted even when consistency checks are skipped.
        if self.inopb_log > 16 || u32::from(self.ag_block_log) + u32::from(self.inopb_log) > 32 {
            return Err(ParseError::InvalidField {
                field: "sb_agblklog",
                reason: "inode number split exceeds 32 bits",
            });
        }
        if block_size.shift() + u32::from(self.dir_block_log) > 16 {
            return Err(ParseError::InvalidField {
                field: "sb_dirblklog",
                reason: "directory block size exceeds 64 KiB",
            });
        }
        if self.ag_blocks == 0 || self.ag_count == 0 {
            return Err(ParseError::InvalidField {
                field: "sb_agblocks",
                reason: "allocation group size and count must be non-zero",
            });
        }
        let has_crc = self.has_crc();
        Ok(Geometry {
            block_size,
            block_log: block_size.shift(),
            sector_size: u32::from(self.sector_size),
            inode_size: u32::from(self.inode_size),
            inodes_per_block: u32::from(self.inodes_per_block).max(1),
            inopb_log: u32::from(self.inopb_log),
            ag_blocks: self.ag_blocks,
            ag_block_log: u32::from(self.ag_block_log),
            ag_count: self.ag_count,
            data_blocks: self.data_blocks,
            dir_block_log: u32::from(self.dir_block_log),
            root_ino: InodeNumber(self.root_ino),
            version: self.version,
            has_crc,
            has_ftype: self.has_ftype(),
            sparse_inodes: self
                .features_incompat
                .contains(XfsIncompatFeatures::SPINODES),
            finobt: self.features_ro_compat.contains(XfsRoCompatFeatures::FINOBT),
            rmapbt: self.features_ro_compat.contains(XfsRoCompatFeatures::RMAPBT),
            reflink: self.features_ro_compat.contains(XfsRoCompatFeatures::REFLINK),
            bigtime: self
                .features_incompat
                .contains(XfsIncompatFeatures::BIGTIME),
            large_extent_counts: self
                .features_incompat
                .contains(XfsIncompatFeatures::NREXT64),
            meta_uuid: self
                .features_incompat
                .contains(XfsIncompatFeatures::META_UUID),
            ascii_ci: !has_crc && self.version_flags.contains(XfsVersionFlags::BORG),
        })
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Addressing constants derived once from the superblock.
///
/// Every address composition in the decoder (inode numbers, packed fsblock
/// numbers, directory dataptrs) goes through these methods, so the bit split
/// is defined in exactly one place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: BlockSize,
    pub block_log: u32,
    pub sector_size: u32,
    pub inode_size: u32,
    pub inodes_per_block: u32,
    pub inopb_log: u32,
    pub ag_blocks: u32,
    pub ag_block_log: u32,
    pub ag_count: u32,
    pub data_blocks: u64,
    pub dir_block_log: u32,
    pub root_ino: InodeNumber,
    pub version: u8,
    pub has_crc: bool,
    pub has_ftype: bool,
    pub sparse_inodes: bool,
    pub finobt: bool,
    pub rmapbt: bool,
    pub reflink: bool,
    pub bigtime: bool,
    pub large_extent_counts: bool,
    pub meta_uuid: bool,
    pub ascii_ci: bool,
}

/// Where an inode record lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeLocation {
    pub ag: AgNumber,
    pub ag_inode: AgInode,
    pub ag_block: AgBlock,
    pub slot: u32,
    pub block: BlockNumber,
    pub byte_offset: ByteOffset,
}

/// Byte offset of the first directory leaf block in directory address space.
pub const XFS_DIR2_LEAF_OFFSET: u64 = 1 << 35;

impl Geometry {
    #[must_use]
    pub fn block_size_bytes(&self) -> usize {
        self.block_size.as_usize()
    }

    /// Bits of an inode number below the AG index.
    #[must_use]
    pub fn agino_log(&self) -> u32 {
        self.ag_block_log + self.inopb_log
    }

    /// Split an inode number into its AG index and AG-relative inode number.
    #[must_use]
    pub fn split_ino(&self, ino: InodeNumber) -> (AgNumber, AgInode) {
        let bits = self.agino_log();
        let agno = ino.0.checked_shr(bits).unwrap_or(0);
        let mask = (1_u64 << bits) - 1;
        (
            AgNumber(u32::try_from(agno).unwrap_or(u32::MAX)),
            AgInode((ino.0 & mask) as u32),
        )
    }

    /// Compose an inode number from its AG parts.
    #[must_use]
    pub fn make_ino(&self, ag: AgNumber, agino: AgInode) -> InodeNumber {
        InodeNumber((u64::from(ag.0) << self.agino_log()) | u64::from(agino.0))
    }

    /// Locate the inode record for `ino`, validating every component.
    pub fn locate_inode(&self, ino: InodeNumber) -> Result<InodeLocation, ParseError> {
        let (ag, agino) = self.split_ino(ino);
        if ag.0 >= self.ag_count || ino.0 >> self.agino_log() >= u64::from(self.ag_count) {
            return Err(ParseError::InvalidField {
                field: "inode_number",
                reason: "allocation group index out of range",
            });
        }
        let ag_block = agino.0 >> self.inopb_log;
        if ag_block >= self.ag_length(ag) {
            return Err(ParseError::InvalidField {
                field: "inode_number",
                reason: "inode block beyond allocation group",
            });
        }
        let slot = agino.0 & (self.inodes_per_block - 1);
        let block = self.ag_block_to_linear(ag, AgBlock(ag_block));
        let byte_offset = self
            .block_size
            .block_to_byte(block)
            .and_then(|b| b.checked_add(u64::from(slot) * u64::from(self.inode_size)))
            .ok_or(ParseError::IntegerConversion {
                field: "inode_byte_offset",
            })?;
        Ok(InodeLocation {
            ag,
            ag_inode: agino,
            ag_block: AgBlock(ag_block),
            slot,
            block,
            byte_offset,
        })
    }

    /// First linear block of an allocation group.
    #[must_use]
    pub fn ag_start(&self, ag: AgNumber) -> BlockNumber {
        BlockNumber(u64::from(ag.0) * u64::from(self.ag_blocks))
    }

    /// Length in blocks of an allocation group; the last one may be short.
    #[must_use]
    pub fn ag_length(&self, ag: AgNumber) -> u32 {
        let start = self.ag_start(ag).0;
        let remaining = self.data_blocks.saturating_sub(start);
        u32::try_from(remaining.min(u64::from(self.ag_blocks))).unwrap_or(self.ag_blocks)
    }

    #[must_use]
    pub fn ag_block_to_linear(&self, ag: AgNumber, agbno: AgBlock) -> BlockNumber {
        BlockNumber(self.ag_start(ag).0 + u64::from(agbno.0))
    }

    /// Split a packed filesystem block number.
    #[must_use]
    pub fn split_fsblock(&self, fsb: FsBlock) -> (AgNumber, AgBlock) {
        let agno = fsb.0.checked_shr(self.ag_block_log).unwrap_or(0);
        let mask = (1_u64 << self.ag_block_log) - 1;
        (
            AgNumber(u32::try_from(agno).unwrap_or(u32::MAX)),
            AgBlock((fsb.0 & mask) as u32),
        )
    }

    /// Convert a packed filesystem block number into a linear device block.
    pub fn fsblock_to_linear(&self, fsb: FsBlock) -> Result<BlockNumber, ParseError> {
        let (ag, agbno) = self.split_fsblock(fsb);
        if ag.0 >= self.ag_count {
            return Err(ParseError::InvalidField {
                field: "fsblock",
                reason: "allocation group index out of range",
            });
        }
        if agbno.0 >= self.ag_length(ag) {
            return Err(ParseError::InvalidField {
                field: "fsblock",
                reason: "AG block beyond allocation group size",
            });
        }
        Ok(self.ag_block_to_linear(ag, agbno))
    }

    #[must_use]
    pub fn make_fsblock(&self, ag: AgNumber, agbno: AgBlock) -> FsBlock {
        FsBlock((u64::from(ag.0) << self.ag_block_log) | u64::from(agbno.0))
    }

    /// Byte offset of a linear block.
    pub fn block_offset(&self, block: BlockNumber) -> Result<ByteOffset, ParseError> {
        self.block_size
            .block_to_byte(block)
            .ok_or(ParseError::IntegerConversion {
                field: "block_offset",
            })
    }

    /// Byte offset of sector `n` inside allocation group `ag`.
    pub fn ag_sector_offset(&self, ag: AgNumber, sector: u32) -> Result<ByteOffset, ParseError> {
        self.block_offset(self.ag_start(ag))?
            .checked_add(u64::from(sector) * u64::from(self.sector_size))
            .ok_or(ParseError::IntegerConversion {
                field: "ag_sector_offset",
            })
    }

    /// Directory block size in bytes.
    #[must_use]
    pub fn dir_block_size(&self) -> u32 {
        self.block_size.get() << self.dir_block_log
    }

    /// Filesystem blocks per directory block.
    #[must_use]
    pub fn dir_block_fsbs(&self) -> u64 {
        1_u64 << self.dir_block_log
    }

    /// Fork-relative block of the first directory leaf block.
    #[must_use]
    pub fn dir_leaf_block(&self) -> FileBlock {
        FileBlock(XFS_DIR2_LEAF_OFFSET >> self.block_log)
    }

    /// Translate a directory dataptr (8-byte units) into the fork-relative
    /// first block of its directory block and the byte offset within it.
    #[must_use]
    pub fn dataptr_to_dir_block(&self, address: u32) -> (FileBlock, usize) {
        let byte = u64::from(address) << 3;
        let dir_shift = self.block_log + self.dir_block_log;
        let dir_block = byte >> dir_shift;
        let within = (byte & ((1_u64 << dir_shift) - 1)) as usize;
        (FileBlock(dir_block << self.dir_block_log), within)
    }
}
