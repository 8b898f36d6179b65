#![forbid(unsafe_code)]
//! Error types for the XFS decoder.
//!
//! # Error Taxonomy
//!
//! Two layers:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `xfs-types` | Layout violations detected while decoding a byte slice |
//! | Runtime | `XfsError` | `xfs-error` (this crate) | Errors surfaced to library callers and the CLI |
//!
//! ## Mapping Policy: ParseError → XfsError
//!
//! `xfs-error` does not depend on `xfs-types` or `xfs-ondisk`. The conversion
//! happens where the block number being decoded is known (`xfs_btree::corrupt_at`
//! and the inode resolver), so every structural failure carries the block that
//! produced it.
//!
//! | ParseError Variant | XfsError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `CorruptFilesystem { block, detail }` |
//! | `InvalidMagic` | `CorruptFilesystem` (or `InvalidInode` for inode cores) |
//! | `InvalidField` | `CorruptFilesystem` |
//! | `IntegerConversion` | `CorruptFilesystem` |
//!
//! ## Negative results
//!
//! Lookups (`Directory::lookup`, `Btree::lookup`, `Attributes::get`) return
//! `Ok(None)` when the key is absent. `NotFound` is reserved for operations
//! whose contract says the object must exist, such as path resolution.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `CorruptFilesystem` | `EUCLEAN` |
//! | `InvalidInode` | `EUCLEAN` |
//! | `NotFound` | `ENOENT` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `NotSymlink` | `EINVAL` |
//! | `IsDirectory` | `EISDIR` |
//! | `SymlinkLoop` | `ELOOP` |
//! | `InvalidArgument` | `EINVAL` |

use thiserror::Error;

/// Unified error type for all decoder operations.
#[derive(Debug, Error)]
pub enum XfsError {
    /// Operating system I/O error from the byte source.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A structural invariant of the on-disk format is violated.
    ///
    /// Bad magic, out-of-range pointer, overlapping extents, cyclic btree,
    /// truncated structure, or (under a strict checksum policy) a checksum
    /// mismatch. `block` is the linear filesystem block being decoded, or the
    /// byte-addressed structure's containing block.
    #[error("corrupt filesystem at block {block}: {detail}")]
    CorruptFilesystem { block: u64, detail: String },

    /// The inode record's signature or declared file type is unrecognized.
    #[error("invalid inode {ino}: {detail}")]
    InvalidInode { ino: u64, detail: String },

    /// A name, path, or key that must exist is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A recognized on-disk variant this decoder does not implement.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Directory operation on a non-directory inode.
    #[error("not a directory")]
    NotDirectory,

    /// Symlink operation on a non-symlink inode.
    #[error("not a symlink")]
    NotSymlink,

    /// File content read on a directory inode.
    #[error("is a directory")]
    IsDirectory,

    /// Path resolution followed more symlinks than allowed.
    #[error("too many levels of symbolic links")]
    SymlinkLoop,

    /// Caller-supplied argument out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl XfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive. Adding a new variant without updating this
    /// function is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::CorruptFilesystem { .. } | Self::InvalidInode { .. } => libc::EUCLEAN,
            Self::NotFound(_) => libc::ENOENT,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NotSymlink | Self::InvalidArgument(_) => libc::EINVAL,
            Self::IsDirectory => libc::EISDIR,
            Self::SymlinkLoop => libc::ELOOP,
        }
    }

    /// Shorthand for a `CorruptFilesystem` error.
    #[must_use]
    pub fn corrupt(block: u64, detail: impl Into<String>) -> Self {
        Self::CorruptFilesystem {
            block,
            detail: detail.into(),
        }
    }

    /// `true` for the structural-damage kinds (`CorruptFilesystem`, `InvalidInode`).
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptFilesystem { .. } | Self::InvalidInode { .. }
        )
    }
}

/// Result alias using `XfsError`.
pub type Result<T> = std::result::Result<T, XfsError>;
