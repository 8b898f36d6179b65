#![forbid(unsafe_code)]
//! Read-only XFS session.
//!
//! [`Filesystem`] ties the decoders together: it validates the superblock,
//! derives the [`Geometry`] once, loads allocation group headers on demand,
//! and hands out [`Inode`] facades for directory, content, attribute, and
//! symlink access. Nothing here writes to the byte source.
//!
//! # Opening a volume
//!
//! ```ignore
//! let fs = Filesystem::open("/path/to/xfs.img")?;
//! let guide = fs.resolve_path("/docs/guide.txt")?;
//! let head = guide.read(0, 4096)?;
//! ```

mod ag;
mod inode;

pub use ag::{AgRecords, AgSummary, AllocatedInodes};
pub use inode::Inode;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use xfs_block::{ByteDevice, FileByteDevice, cached_byte_device};
use xfs_btree::enforce_checksum;
use xfs_error::{Result, XfsError};
use xfs_extent::Volume;
use xfs_inode::read_inode;
use xfs_ondisk::checksum::SB_CRC_OFFSET;
use xfs_ondisk::sb::XFS_SB_SIZE;
use xfs_ondisk::{ChecksumPolicy, Geometry, Superblock};
use xfs_types::{AgNumber, ByteOffset, InodeNumber, ParseError, u64_to_usize};

pub use xfs_dir::{DirEntry, DirForm, Directory, Entries};
pub use xfs_extent::{Extent, ExtentState, Mapping};
pub use xfs_inode::{InodeAttr, InodeRecord};
pub use xfs_ondisk::{AllocRec, FileKind, FileType, InobtRec, RefcountRec, RmapRec};
pub use xfs_xattr::{AttrEntries, AttrForm, AttrValue, Attribute, Attributes};

// ── Options ─────────────────────────────────────────────────────────────────

/// Options controlling how a volume is opened.
///
/// Defaults validate the superblock, verify v5 checksums in warn-only mode,
/// and read straight from the byte source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// What a checksum mismatch on v5 metadata does.
    pub checksums: ChecksumPolicy,
    /// Accept a superblock whose geometry fields disagree with each other.
    ///
    /// Feature checks still apply: an unknown incompat bit means the layout
    /// cannot be interpreted at all.
    pub skip_validation: bool,
    /// Memoize this many blocks in an ARC cache in front of the byte source.
    pub cache_blocks: Option<usize>,
    /// Symlinks followed by one path resolution before `SymlinkLoop`.
    pub max_symlink_depth: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            checksums: ChecksumPolicy::Warn,
            skip_validation: false,
            cache_blocks: None,
            max_symlink_depth: 40,
        }
    }
}

// ── Filesystem ──────────────────────────────────────────────────────────────

/// An opened volume.
///
/// Geometry is immutable after open. AG headers are read on first use;
/// everything else is decoded per call, so a `Filesystem` can be shared
/// across threads as long as the byte source allows concurrent reads.
pub struct Filesystem {
    superblock: Superblock,
    volume: Volume,
    ags: Vec<ag::AgSlot>,
    options: OpenOptions,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("label", &self.superblock.label)
            .field("volume", &self.volume)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Open the image or device at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Arc::new(dev), options)
    }

    /// Open a volume over an already-opened byte source.
    pub fn from_device(dev: Arc<dyn ByteDevice>, options: OpenOptions) -> Result<Self> {
        let len = dev.len_bytes();
        if len < XFS_SB_SIZE as u64 {
            return Err(XfsError::corrupt(
                0,
                format!("{len} byte source is too small to hold a superblock"),
            ));
        }
        let head = dev.read_vec_at(ByteOffset(0), XFS_SB_SIZE)?;
        let superblock = Superblock::parse_superblock_region(&head).map_err(|e| match e {
            ParseError::InvalidMagic { actual, .. } => XfsError::corrupt(
                0,
                format!("unrecognized superblock signature {actual:#010x}"),
            ),
            other => XfsError::corrupt(0, other.to_string()),
        })?;

        superblock.validate_features().map_err(|e| feature_error(&e))?;
        if options.skip_validation {
            if let Err(err) = superblock.validate_geometry() {
                warn!(%err, "superblock geometry inconsistent, continuing");
            }
        } else {
            superblock
                .validate_geometry()
                .map_err(|e| XfsError::corrupt(0, e.to_string()))?;
        }
        let geometry = superblock
            .geometry()
            .map_err(|e| XfsError::corrupt(0, e.to_string()))?;

        if superblock.has_crc() {
            let sector = u64_to_usize(u64::from(geometry.sector_size), "sector_size")
                .map_err(|e| XfsError::corrupt(0, e.to_string()))?;
            let buf = dev.read_vec_at(ByteOffset(0), sector)?;
            enforce_checksum(options.checksums, "superblock", 0, &buf, SB_CRC_OFFSET)?;
        }

        let expected = geometry
            .data_blocks
            .saturating_mul(u64::from(geometry.block_size.get()));
        if len < expected {
            warn!(len, expected, "byte source shorter than the data section");
        }

        let dev: Arc<dyn ByteDevice> = match options.cache_blocks {
            Some(blocks) => Arc::new(cached_byte_device(dev, geometry.block_size.get(), blocks)?),
            None => dev,
        };

        debug!(
            version = geometry.version,
            block_size = geometry.block_size.get(),
            ag_count = geometry.ag_count,
            ag_blocks = geometry.ag_blocks,
            inode_size = geometry.inode_size,
            root = geometry.root_ino.0,
            checksums = %options.checksums,
            "filesystem_opened"
        );

        let ags = (0..geometry.ag_count).map(|_| ag::AgSlot::default()).collect();
        Ok(Self {
            volume: Volume::new(dev, geometry, options.checksums),
            superblock,
            ags,
            options,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        self.volume.geometry()
    }

    /// Byte source and geometry, for driving the decoders directly.
    #[must_use]
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    #[must_use]
    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    #[must_use]
    pub fn ag_count(&self) -> u32 {
        self.volume.geometry().ag_count
    }

    /// Allocation group numbers of the volume.
    pub fn ag_numbers(&self) -> impl Iterator<Item = AgNumber> + use<> {
        (0..self.ag_count()).map(AgNumber)
    }

    // ── Inodes ────────────────────────────────────────────────────────────

    /// Decode inode `ino`.
    ///
    /// `NotFound` if the inode is free, `InvalidInode` if the number does
    /// not address an inode record or the record is unrecognizable.
    pub fn inode(&self, ino: InodeNumber) -> Result<Inode<'_>> {
        let record = read_inode(&self.volume, ino)?;
        Ok(Inode::new(self, record))
    }

    pub fn root_inode(&self) -> Result<Inode<'_>> {
        let root = self.inode(self.volume.geometry().root_ino)?;
        if !root.is_directory() {
            return Err(XfsError::corrupt(
                root.record().block,
                format!("root inode {} is not a directory", root.number()),
            ));
        }
        Ok(root)
    }

    // ── Summary ───────────────────────────────────────────────────────────

    /// Superblock facts for display.
    #[must_use]
    pub fn summary(&self) -> VolumeSummary {
        let sb = &self.superblock;
        let geo = self.volume.geometry();
        let mut features = sb.version_flags.describe();
        features.extend(sb.features2.describe());
        features.extend(sb.features_ro_compat.describe());
        features.extend(sb.features_incompat.describe());
        features.sort_unstable();
        features.dedup();
        VolumeSummary {
            label: sb.label.clone(),
            uuid: format_uuid(&sb.uuid),
            version: sb.version,
            block_size: geo.block_size.get(),
            sector_size: geo.sector_size,
            inode_size: geo.inode_size,
            dir_block_size: geo.dir_block_size(),
            ag_count: geo.ag_count,
            ag_blocks: geo.ag_blocks,
            data_blocks: geo.data_blocks,
            root_ino: geo.root_ino.0,
            inode_count: sb.inode_count,
            free_inodes: sb.inodes_free,
            free_blocks: sb.free_data_blocks,
            features,
        }
    }
}

/// Map a feature validation failure to `UnsupportedFeature`.
fn feature_error(err: &ParseError) -> XfsError {
    match err {
        ParseError::InvalidField { field, reason } => match reason.strip_prefix("unsupported feature: ") {
            Some(what) => XfsError::UnsupportedFeature(format!("{what} ({field})")),
            None => XfsError::corrupt(0, err.to_string()),
        },
        other => XfsError::corrupt(0, other.to_string()),
    }
}

/// Canonical 8-4-4-4-12 rendering.
#[must_use]
pub fn format_uuid(uuid: &[u8; 16]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeSummary {
    pub label: String,
    pub uuid: String,
    pub version: u8,
    pub block_size: u32,
    pub sector_size: u32,
    pub inode_size: u32,
    pub dir_block_size: u32,
    pub ag_count: u32,
    pub ag_blocks: u32,
    pub data_blocks: u64,
    pub root_ino: u64,
    pub inode_count: u64,
    pub free_inodes: u64,
    pub free_blocks: u64,
    pub features: Vec<&'static str>,
}
