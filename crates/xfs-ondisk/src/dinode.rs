//! Inode core (`struct xfs_dinode`) layout and fork geometry.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use xfs_types::{
    ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
    ensure_slice, read_be_u16, read_be_u32, read_be_u64, read_fixed, read_u8,
};

pub const XFS_DINODE_MAGIC: u16 = 0x494E;

/// Size of the v1/v2 inode core; the literal area starts here.
pub const XFS_DINODE_CORE_V2_SIZE: usize = 100;
/// Size of the v3 inode core.
pub const XFS_DINODE_CORE_V3_SIZE: usize = 176;

mod off {
    pub const MAGIC: usize = 0;
    pub const MODE: usize = 2;
    pub const VERSION: usize = 4;
    pub const FORMAT: usize = 5;
    pub const ONLINK: usize = 6;
    pub const UID: usize = 8;
    pub const GID: usize = 12;
    pub const NLINK: usize = 16;
    pub const PROJID_LO: usize = 20;
    pub const PROJID_HI: usize = 22;
    pub const BIG_NEXTENTS: usize = 24;
    pub const ATIME: usize = 32;
    pub const MTIME: usize = 40;
    pub const CTIME: usize = 48;
    pub const SIZE: usize = 56;
    pub const NBLOCKS: usize = 64;
    pub const EXTSIZE: usize = 72;
    pub const NEXTENTS: usize = 76;
    pub const ANEXTENTS: usize = 80;
    pub const FORKOFF: usize = 82;
    pub const AFORMAT: usize = 83;
    pub const FLAGS: usize = 90;
    pub const GEN: usize = 92;
    pub const NEXT_UNLINKED: usize = 96;
    pub const CHANGECOUNT: usize = 104;
    pub const FLAGS2: usize = 120;
    pub const COWEXTSIZE: usize = 128;
    pub const CRTIME: usize = 144;
    pub const INO: usize = 152;
    pub const UUID: usize = 160;
}

// ── Inode flags ─────────────────────────────────────────────────────────────

pub const XFS_DIFLAG_REALTIME: u16 = 0x0001;
pub const XFS_DIFLAG_PREALLOC: u16 = 0x0002;
pub const XFS_DIFLAG_IMMUTABLE: u16 = 0x0008;
pub const XFS_DIFLAG_APPEND: u16 = 0x0010;
pub const XFS_DIFLAG_SYNC: u16 = 0x0020;
pub const XFS_DIFLAG_NOATIME: u16 = 0x0040;
pub const XFS_DIFLAG_NODUMP: u16 = 0x0080;

pub const XFS_DIFLAG2_DAX: u64 = 0x0001;
pub const XFS_DIFLAG2_REFLINK: u64 = 0x0002;
pub const XFS_DIFLAG2_COWEXTSIZE: u64 = 0x0004;
pub const XFS_DIFLAG2_BIGTIME: u64 = 0x0008;
pub const XFS_DIFLAG2_NREXT64: u64 = 0x0010;

// ── Fork format ─────────────────────────────────────────────────────────────

/// Storage representation tag of an inode fork (`di_format`, `di_aformat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkFormat {
    /// Device number stored in the literal area.
    Dev,
    /// Bytes embedded in the literal area.
    Local,
    /// Flat extent record array in the literal area.
    Extents,
    /// Extent map btree root in the literal area.
    Btree,
    Uuid,
    Rmap,
}

impl ForkFormat {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Dev),
            1 => Ok(Self::Local),
            2 => Ok(Self::Extents),
            3 => Ok(Self::Btree),
            4 => Ok(Self::Uuid),
            5 => Ok(Self::Rmap),
            _ => Err(ParseError::InvalidField {
                field: "di_format",
                reason: "unknown fork format",
            }),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Local => "local",
            Self::Extents => "extents",
            Self::Btree => "btree",
            Self::Uuid => "uuid",
            Self::Rmap => "rmap",
        }
    }
}

// ── File kind ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Classify the type bits of a mode; `None` for unrecognized types.
    #[must_use]
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            S_IFCHR => Some(Self::CharDevice),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    /// Single-letter `ls -l` type indicator.
    #[must_use]
    pub fn indicator(self) -> char {
        match self {
            Self::Regular => '-',
            Self::Directory => 'd',
            Self::Symlink => 'l',
            Self::CharDevice => 'c',
            Self::BlockDevice => 'b',
            Self::Fifo => 'p',
            Self::Socket => 's',
        }
    }
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// Seconds from 1970 and nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nsecs: u32,
}

/// Bigtime timestamps count nanoseconds from this many seconds before 1970.
pub const XFS_BIGTIME_EPOCH_OFFSET: i64 = 1 << 31;

impl Timestamp {
    /// Decode the 8-byte on-disk timestamp at `offset`.
    pub fn parse(data: &[u8], offset: usize, bigtime: bool) -> Result<Self, ParseError> {
        if bigtime {
            let ns = read_be_u64(data, offset)?;
            let secs = i64::try_from(ns / 1_000_000_000)
                .map_err(|_| ParseError::IntegerConversion { field: "timestamp" })?;
            Ok(Self {
                secs: secs - XFS_BIGTIME_EPOCH_OFFSET,
                nsecs: (ns % 1_000_000_000) as u32,
            })
        } else {
            let secs = read_be_u32(data, offset)? as i32;
            Ok(Self {
                secs: i64::from(secs),
                nsecs: read_be_u32(data, offset + 4)?,
            })
        }
    }
}

// ── Inode core ──────────────────────────────────────────────────────────────

/// Decoded inode core. Fork contents are not decoded here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DinodeCore {
    pub mode: u16,
    pub version: u8,
    pub format: u8,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub projid: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub size: u64,
    pub nblocks: u64,
    pub extsize: u32,
    pub nextents: u64,
    pub anextents: u32,
    pub forkoff: u8,
    pub aformat: u8,
    pub flags: u16,
    pub generation: u32,
    pub next_unlinked: u32,
    // v3 only.
    pub change_count: u64,
    pub flags2: u64,
    pub cow_extsize: u32,
    pub crtime: Option<Timestamp>,
    pub ino: Option<u64>,
    pub uuid: Option<[u8; 16]>,
    /// Size of the whole inode record this core was decoded from.
    pub inode_size: usize,
}

impl DinodeCore {
    /// Decode an inode record. `data` is exactly one inode (`sb_inodesize` bytes).
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u16(data, off::MAGIC)?;
        if magic != XFS_DINODE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_DINODE_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_u8(data, off::VERSION)?;
        if !(1..=3).contains(&version) {
            return Err(ParseError::InvalidField {
                field: "di_version",
                reason: "unknown inode version",
            });
        }
        let v3 = version == 3;
        let core_size = if v3 {
            XFS_DINODE_CORE_V3_SIZE
        } else {
            XFS_DINODE_CORE_V2_SIZE
        };
        ensure_slice(data, 0, core_size)?;

        let flags2 = if v3 { read_be_u64(data, off::FLAGS2)? } else { 0 };
        let bigtime = flags2 & XFS_DIFLAG2_BIGTIME != 0;
        let (nextents, anextents) = if flags2 & XFS_DIFLAG2_NREXT64 != 0 {
            (
                read_be_u64(data, off::BIG_NEXTENTS)?,
                read_be_u32(data, off::NEXTENTS)?,
            )
        } else {
            (
                u64::from(read_be_u32(data, off::NEXTENTS)?),
                u32::from(read_be_u16(data, off::ANEXTENTS)?),
            )
        };
        let (nlink, projid) = if version == 1 {
            (u32::from(read_be_u16(data, off::ONLINK)?), 0)
        } else {
            (
                read_be_u32(data, off::NLINK)?,
                u32::from(read_be_u16(data, off::PROJID_HI)?) << 16
                    | u32::from(read_be_u16(data, off::PROJID_LO)?),
            )
        };

        let core = Self {
            mode: read_be_u16(data, off::MODE)?,
            version,
            format: read_u8(data, off::FORMAT)?,
            uid: read_be_u32(data, off::UID)?,
            gid: read_be_u32(data, off::GID)?,
            nlink,
            projid,
            atime: Timestamp::parse(data, off::ATIME, bigtime)?,
            mtime: Timestamp::parse(data, off::MTIME, bigtime)?,
            ctime: Timestamp::parse(data, off::CTIME, bigtime)?,
            size: read_be_u64(data, off::SIZE)?,
            nblocks: read_be_u64(data, off::NBLOCKS)?,
            extsize: read_be_u32(data, off::EXTSIZE)?,
            nextents,
            anextents,
            forkoff: read_u8(data, off::FORKOFF)?,
            aformat: read_u8(data, off::AFORMAT)?,
            flags: read_be_u16(data, off::FLAGS)?,
            generation: read_be_u32(data, off::GEN)?,
            next_unlinked: read_be_u32(data, off::NEXT_UNLINKED)?,
            change_count: if v3 { read_be_u64(data, off::CHANGECOUNT)? } else { 0 },
            flags2,
            cow_extsize: if v3 { read_be_u32(data, off::COWEXTSIZE)? } else { 0 },
            crtime: if v3 {
                Some(Timestamp::parse(data, off::CRTIME, bigtime)?)
            } else {
                None
            },
            ino: if v3 { Some(read_be_u64(data, off::INO)?) } else { None },
            uuid: if v3 { Some(read_fixed::<16>(data, off::UUID)?) } else { None },
            inode_size: data.len(),
        };
        core.data_fork_range()?;
        Ok(core)
    }

    #[must_use]
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    /// Offset of the literal area (both forks) within the inode record.
    #[must_use]
    pub fn literal_offset(&self) -> usize {
        if self.version == 3 {
            XFS_DINODE_CORE_V3_SIZE
        } else {
            XFS_DINODE_CORE_V2_SIZE
        }
    }

    pub fn data_format(&self) -> Result<ForkFormat, ParseError> {
        ForkFormat::from_raw(self.format)
    }

    /// Attribute fork format, or `None` when the inode has no attribute fork.
    pub fn attr_format(&self) -> Result<Option<ForkFormat>, ParseError> {
        if self.forkoff == 0 {
            return Ok(None);
        }
        ForkFormat::from_raw(self.aformat).map(Some)
    }

    /// Byte range of the data fork inside the inode record.
    pub fn data_fork_range(&self) -> Result<Range<usize>, ParseError> {
        let start = self.literal_offset();
        let literal = self
            .inode_size
            .checked_sub(start)
            .ok_or(ParseError::InvalidField {
                field: "di_version",
                reason: "inode record smaller than its core",
            })?;
        let len = if self.forkoff == 0 {
            literal
        } else {
            let attr_off = usize::from(self.forkoff) * 8;
            if attr_off > literal {
                return Err(ParseError::InvalidField {
                    field: "di_forkoff",
                    reason: "attribute fork offset beyond inode literal area",
                });
            }
            attr_off
        };
        Ok(start..start + len)
    }

    /// Byte range of the attribute fork inside the inode record.
    pub fn attr_fork_range(&self) -> Result<Option<Range<usize>>, ParseError> {
        if self.forkoff == 0 {
            return Ok(None);
        }
        let data = self.data_fork_range()?;
        Ok(Some(data.end..self.inode_size))
    }

    #[must_use]
    pub fn is_realtime(&self) -> bool {
        self.flags & XFS_DIFLAG_REALTIME != 0
    }

    #[must_use]
    pub fn is_reflinked(&self) -> bool {
        self.flags2 & XFS_DIFLAG2_REFLINK != 0
    }

    #[must_use]
    pub fn has_bigtime(&self) -> bool {
        self.flags2 & XFS_DIFLAG2_BIGTIME != 0
    }
}

/// Split an old-style 32-bit device number into (major, minor).
#[must_use]
pub fn decode_dev(raw: u32) -> (u32, u32) {
    (raw >> 18, raw & 0x3_FFFF)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_v3_inode(mode: u16, format: u8) -> Vec<u8> {
        let mut b = vec![0_u8; 256];
        b[0..2].copy_from_slice(&XFS_DINODE_MAGIC.to_be_bytes());
        b[2..4].copy_from_slice(&mode.to_be_bytes());
        b[4] = 3;
        b[5] = format;
        b[8..12].copy_from_slice(&1000_u32.to_be_bytes());
        b[12..16].copy_from_slice(&100_u32.to_be_bytes());
        b[16..20].copy_from_slice(&1_u32.to_be_bytes());
        b[40..44].copy_from_slice(&1_700_000_000_u32.to_be_bytes());
        b[44..48].copy_from_slice(&500_u32.to_be_bytes());
        b[56..64].copy_from_slice(&4096_u64.to_be_bytes());
        b[76..80].copy_from_slice(&1_u32.to_be_bytes());
        b[92..96].copy_from_slice(&77_u32.to_be_bytes());
        b[152..160].copy_from_slice(&131_u64.to_be_bytes());
        b
    }

    #[test]
    fn parses_v3_core() {
        let core = DinodeCore::parse(&sample_v3_inode(S_IFREG | 0o644, 2)).unwrap();
        assert_eq!(core.kind(), Some(FileKind::Regular));
        assert_eq!(core.data_format().unwrap(), ForkFormat::Extents);
        assert_eq!(core.uid, 1000);
        assert_eq!(core.size, 4096);
        assert_eq!(core.nextents, 1);
        assert_eq!(core.generation, 77);
        assert_eq!(core.ino, Some(131));
        assert_eq!(
            core.mtime,
            Timestamp {
                secs: 1_700_000_000,
                nsecs: 500
            }
        );
        assert_eq!(core.data_fork_range().unwrap(), 176..256);
        assert_eq!(core.attr_fork_range().unwrap(), None);
        assert_eq!(core.attr_format().unwrap(), None);
    }

    #[test]
    fn fork_split_follows_forkoff() {
        let mut raw = sample_v3_inode(S_IFDIR | 0o755, 1);
        raw[82] = 5;
        raw[83] = 1;
        let core = DinodeCore::parse(&raw).unwrap();
        assert_eq!(core.data_fork_range().unwrap(), 176..216);
        assert_eq!(core.attr_fork_range().unwrap(), Some(216..256));
        assert_eq!(core.attr_format().unwrap(), Some(ForkFormat::Local));

        raw[82] = 11;
        assert!(matches!(
            DinodeCore::parse(&raw),
            Err(ParseError::InvalidField { field: "di_forkoff", .. })
        ));
    }

    #[test]
    fn large_extent_counts_move_fields() {
        let mut raw = sample_v3_inode(S_IFREG, 3);
        raw[120..128].copy_from_slice(&XFS_DIFLAG2_NREXT64.to_be_bytes());
        raw[24..32].copy_from_slice(&5_000_000_000_u64.to_be_bytes());
        raw[76..80].copy_from_slice(&70_000_u32.to_be_bytes());
        let core = DinodeCore::parse(&raw).unwrap();
        assert_eq!(core.nextents, 5_000_000_000);
        assert_eq!(core.anextents, 70_000);
    }

    #[test]
    fn bigtime_timestamps() {
        let mut raw = sample_v3_inode(S_IFREG, 2);
        raw[120..128].copy_from_slice(&XFS_DIFLAG2_BIGTIME.to_be_bytes());
        let ns = (1_u64 << 31) * 1_000_000_000 + 42;
        raw[40..48].copy_from_slice(&ns.to_be_bytes());
        let core = DinodeCore::parse(&raw).unwrap();
        assert_eq!(core.mtime, Timestamp { secs: 0, nsecs: 42 });
    }

    #[test]
    fn negative_classic_timestamp() {
        let mut raw = sample_v3_inode(S_IFREG, 2);
        raw[32..36].copy_from_slice(&(-5_i32).to_be_bytes());
        let core = DinodeCore::parse(&raw).unwrap();
        assert_eq!(core.atime.secs, -5);
    }

    #[test]
    fn v2_core_uses_short_literal_offset() {
        let mut raw = sample_v3_inode(S_IFLNK | 0o777, 1);
        raw[4] = 2;
        raw[20..22].copy_from_slice(&7_u16.to_be_bytes());
        raw[22..24].copy_from_slice(&1_u16.to_be_bytes());
        let core = DinodeCore::parse(&raw).unwrap();
        assert_eq!(core.literal_offset(), 100);
        assert_eq!(core.projid, 0x0001_0007);
        assert_eq!(core.crtime, None);
        assert_eq!(core.ino, None);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut raw = sample_v3_inode(S_IFREG, 2);
        raw[0] = 0;
        assert!(matches!(
            DinodeCore::parse(&raw),
            Err(ParseError::InvalidMagic { .. })
        ));
        let mut raw = sample_v3_inode(S_IFREG, 2);
        raw[4] = 9;
        assert!(DinodeCore::parse(&raw).is_err());
        assert!(DinodeCore::parse(&sample_v3_inode(S_IFREG, 2)[..120]).is_err());
    }

    #[test]
    fn file_kind_and_dev() {
        assert_eq!(FileKind::from_mode(S_IFSOCK | 0o600), Some(FileKind::Socket));
        assert_eq!(FileKind::from_mode(0o644), None);
        assert_eq!(FileKind::Directory.indicator(), 'd');
        assert_eq!(decode_dev((8 << 18) | 1), (8, 1));
        assert!(ForkFormat::from_raw(6).is_err());
    }
}
