#![forbid(unsafe_code)]
//! Inode resolution.
//!
//! Turns an inode number into its decoded core and two fork handles. The
//! inode number is split into AG, AG block, and slot through [`Geometry`],
//! the record is read and validated, and the literal area is cut into the
//! data and attribute forks. Fork contents are not decoded here: directory,
//! attribute, and extent decoders do that on demand.
//!
//! [`Geometry`]: xfs_ondisk::Geometry

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use xfs_btree::corrupt_at;
use xfs_error::{Result, XfsError};
use xfs_extent::{ExtentMapper, Fork, ForkKind, ForkStorage, Mapping, Volume};
use xfs_ondisk::checksum::{DINODE_CRC_OFFSET, SYMLINK_CRC_OFFSET};
use xfs_ondisk::dinode::decode_dev;
use xfs_ondisk::symlink::{SymlinkHeader, XFS_SYMLINK_MAXLEN};
use xfs_ondisk::{DinodeCore, FileKind, ForkFormat, Timestamp};
use xfs_types::{FileBlock, InodeNumber, ParseError, read_be_u32, u64_to_usize};

// ── Inode record ────────────────────────────────────────────────────────────

/// A decoded inode: immutable snapshot of the core plus its fork handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub number: InodeNumber,
    pub core: DinodeCore,
    /// Linear block holding the record.
    pub block: u64,
    pub data_fork: Fork,
    pub attr_fork: Option<Fork>,
    /// `(major, minor)` for character and block devices.
    pub rdev: Option<(u32, u32)>,
}

impl InodeRecord {
    /// File type. Always recognized: [`read_inode`] rejects unknown types.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.core.kind().unwrap_or(FileKind::Regular)
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.kind() == FileKind::Symlink
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.kind() == FileKind::Regular
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.core.size
    }

    /// Stat-style view of the core.
    #[must_use]
    pub fn attr(&self) -> InodeAttr {
        InodeAttr {
            ino: self.number,
            kind: self.kind(),
            perm: self.core.mode & 0o7777,
            nlink: self.core.nlink,
            uid: self.core.uid,
            gid: self.core.gid,
            projid: self.core.projid,
            size: self.core.size,
            blocks: self.core.nblocks,
            atime: self.core.atime,
            mtime: self.core.mtime,
            ctime: self.core.ctime,
            crtime: self.core.crtime,
            generation: self.core.generation,
            flags: self.core.flags,
            flags2: self.core.flags2,
            rdev: self.rdev,
            data_format: self.data_fork.format(),
            attr_format: self.attr_fork.as_ref().map(Fork::format),
            extents: self.core.nextents,
            attr_extents: self.core.anextents,
            version: self.core.version,
        }
    }
}

/// Inode attributes, analogous to POSIX `struct stat` plus XFS extras.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub kind: FileKind,
    /// Permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub projid: u32,
    pub size: u64,
    /// Filesystem blocks allocated, including metadata.
    pub blocks: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    /// Creation time; v3 inodes only.
    pub crtime: Option<Timestamp>,
    pub generation: u32,
    pub flags: u16,
    pub flags2: u64,
    pub rdev: Option<(u32, u32)>,
    pub data_format: ForkFormat,
    pub attr_format: Option<ForkFormat>,
    pub extents: u64,
    pub attr_extents: u32,
    pub version: u8,
}

// ── Resolver ────────────────────────────────────────────────────────────────

fn invalid(ino: InodeNumber, detail: impl Into<String>) -> XfsError {
    XfsError::InvalidInode {
        ino: ino.0,
        detail: detail.into(),
    }
}

/// Read and validate inode `ino`.
///
/// - Out-of-range number or bad signature: `InvalidInode`.
/// - Unrecognized file type: `InvalidInode`.
/// - Free inode (mode 0): `NotFound`.
/// - Structural damage in the literal area: `CorruptFilesystem`.
pub fn read_inode(vol: &Volume, ino: InodeNumber) -> Result<InodeRecord> {
    let geo = vol.geometry();
    let loc = geo
        .locate_inode(ino)
        .map_err(|e| invalid(ino, format!("cannot locate: {e}")))?;
    let size = usize::try_from(geo.inode_size)
        .map_err(|_| XfsError::corrupt(loc.block.0, "inode size overflows usize"))?;
    let raw = vol.read_bytes(loc.byte_offset, size)?;
    trace!(ino = ino.0, ag = loc.ag.0, block = loc.block.0, slot = loc.slot, "read_inode");

    let core = DinodeCore::parse(&raw).map_err(|e| match e {
        ParseError::InvalidMagic { actual, .. } => {
            invalid(ino, format!("bad inode signature {actual:#06x}"))
        }
        other => invalid(ino, other.to_string()),
    })?;
    if core.mode == 0 {
        return Err(XfsError::NotFound(format!("inode {ino} is not allocated")));
    }
    let Some(kind) = core.kind() else {
        return Err(invalid(ino, format!("unrecognized file type in mode {:#o}", core.mode)));
    };
    if core.version == 3 {
        vol.verify("inode", loc.block.0, &raw, DINODE_CRC_OFFSET)?;
        if core.ino != Some(ino.0) {
            return Err(invalid(
                ino,
                format!("record claims to be inode {}", core.ino.unwrap_or_default()),
            ));
        }
    }

    let data_range = core.data_fork_range().map_err(|e| corrupt_at(loc.block.0, &e))?;
    let data_bytes = &raw[data_range];
    let data_format = core.data_format().map_err(|e| corrupt_at(loc.block.0, &e))?;

    let (data_fork, rdev) = if data_format == ForkFormat::Dev {
        if !matches!(kind, FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket) {
            return Err(invalid(ino, format!("{kind:?} inode with device fork")));
        }
        let rdev = read_be_u32(data_bytes, 0).map_err(|e| corrupt_at(loc.block.0, &e))?;
        let fork = Fork {
            owner: ino,
            origin_block: loc.block.0,
            kind: ForkKind::Data,
            storage: ForkStorage::Inline(Vec::new()),
        };
        let rdev = matches!(kind, FileKind::CharDevice | FileKind::BlockDevice).then(|| decode_dev(rdev));
        (fork, rdev)
    } else {
        let fork = Fork::new(ino, loc.block.0, ForkKind::Data, data_format, data_bytes, core.nextents)?;
        (fork, None)
    };

    let attr_fork = match (
        core.attr_format().map_err(|e| corrupt_at(loc.block.0, &e))?,
        core.attr_fork_range().map_err(|e| corrupt_at(loc.block.0, &e))?,
    ) {
        (Some(format), Some(range)) => Some(Fork::new(
            ino,
            loc.block.0,
            ForkKind::Attr,
            format,
            &raw[range],
            u64::from(core.anextents),
        )?),
        _ => None,
    };

    debug!(
        ino = ino.0,
        kind = ?kind,
        data = data_fork.format().name(),
        attr = attr_fork.as_ref().map(|f| f.format().name()),
        "inode_decoded"
    );
    Ok(InodeRecord {
        number: ino,
        core,
        block: loc.block.0,
        data_fork,
        attr_fork,
        rdev,
    })
}

// ── Symlinks ────────────────────────────────────────────────────────────────

/// Target of a symbolic link.
///
/// Short targets live in the data fork. Longer ones are stored in blocks;
/// on v5 volumes each block starts with a header naming its owner and the
/// byte offset of its fragment.
pub fn read_symlink_target(vol: &Volume, inode: &InodeRecord) -> Result<Vec<u8>> {
    if !inode.is_symlink() {
        return Err(XfsError::NotSymlink);
    }
    let size = inode.core.size;
    if size == 0 || size > XFS_SYMLINK_MAXLEN {
        return Err(XfsError::corrupt(
            inode.block,
            format!("symlink {} has invalid length {size}", inode.number),
        ));
    }
    let len = u64_to_usize(size, "symlink_len").map_err(|e| corrupt_at(inode.block, &e))?;

    if let Some(bytes) = inode.data_fork.inline_bytes() {
        if bytes.len() < len {
            return Err(XfsError::corrupt(
                inode.block,
                format!("inline symlink {} shorter than its size", inode.number),
            ));
        }
        return Ok(bytes[..len].to_vec());
    }

    let mapper = ExtentMapper::new(vol, &inode.data_fork);
    if !vol.geometry().has_crc {
        return mapper.read_range(0, len);
    }

    let mut target = Vec::with_capacity(len);
    let mut fork_block = 0_u64;
    while target.len() < len {
        let block = mapper.read_metadata(FileBlock(fork_block), 1)?;
        let address = match mapper.extent_at(FileBlock(fork_block))? {
            Mapping::Mapped(e) => vol
                .fsblock_to_linear(e.physical(FileBlock(fork_block)))
                .map_or(inode.block, |b| b.0),
            Mapping::Hole { .. } => inode.block,
        };
        vol.verify("symlink", address, &block, SYMLINK_CRC_OFFSET)?;
        let header = SymlinkHeader::parse(&block).map_err(|e| corrupt_at(address, &e))?;
        if header.owner != inode.number.0 {
            return Err(XfsError::corrupt(
                address,
                format!("symlink block owned by inode {}, expected {}", header.owner, inode.number),
            ));
        }
        if header.offset as usize != target.len() {
            return Err(XfsError::corrupt(
                address,
                format!("symlink fragment at offset {}, expected {}", header.offset, target.len()),
            ));
        }
        if header.bytes == 0 {
            return Err(XfsError::corrupt(address, "empty symlink fragment"));
        }
        let payload = header.payload(&block).map_err(|e| corrupt_at(address, &e))?;
        let take = payload.len().min(len - target.len());
        target.extend_from_slice(&payload[..take]);
        fork_block += 1;
    }
    Ok(target)
}
