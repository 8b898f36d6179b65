//! Inode facade and path resolution.

use crate::Filesystem;
use std::collections::VecDeque;
use tracing::{debug, trace};
use xfs_dir::{DirEntry, Directory, Entries};
use xfs_error::{Result, XfsError};
use xfs_extent::{Extent, ExtentMapper, Mapping};
use xfs_inode::{InodeAttr, InodeRecord, read_symlink_target};
use xfs_ondisk::FileKind;
use xfs_types::{FileBlock, InodeNumber, u64_to_usize};
use xfs_xattr::Attributes;

/// A decoded inode bound to its filesystem.
///
/// Holds an immutable snapshot of the inode record. Directory, extent, and
/// attribute views are built on each call and borrow the facade.
#[derive(Debug, Clone)]
pub struct Inode<'fs> {
    fs: &'fs Filesystem,
    record: InodeRecord,
}

impl<'fs> Inode<'fs> {
    pub(crate) fn new(fs: &'fs Filesystem, record: InodeRecord) -> Self {
        Self { fs, record }
    }

    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.record.number
    }

    #[must_use]
    pub fn record(&self) -> &InodeRecord {
        &self.record
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.record.kind()
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.record.is_directory()
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.record.is_symlink()
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.record.is_regular()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.record.size()
    }

    #[must_use]
    pub fn attr(&self) -> InodeAttr {
        self.record.attr()
    }

    // ── Directories ───────────────────────────────────────────────────────

    /// Directory view. `NotDirectory` for any other file type.
    pub fn directory(&self) -> Result<Directory<'_>> {
        Directory::open(&self.fs.volume, &self.record)
    }

    /// Entries in stored order, without `.` and `..`.
    pub fn directory_entries(&self) -> Result<Entries<'_>> {
        Ok(self.directory()?.entries())
    }

    /// The entry called `name`, or `None`.
    pub fn lookup(&self, name: &[u8]) -> Result<Option<DirEntry>> {
        self.directory()?.lookup(name)
    }

    /// Parent directory. The root is its own parent.
    pub fn parent(&self) -> Result<InodeNumber> {
        self.directory()?.parent()
    }

    // ── Content ───────────────────────────────────────────────────────────

    /// Logical to physical mapping of the data fork.
    #[must_use]
    pub fn mapper(&self) -> ExtentMapper<'_> {
        ExtentMapper::new(&self.fs.volume, &self.record.data_fork)
    }

    /// Data fork extents, ascending and coalesced. Empty for inline forks.
    pub fn extents(&self) -> Result<Vec<Extent>> {
        self.mapper().all_extents()
    }

    /// Mapping of logical block `block` of the data fork.
    pub fn extent_at(&self, block: FileBlock) -> Result<Mapping> {
        self.mapper().extent_at(block)
    }

    /// Read up to `len` bytes at `offset`.
    ///
    /// The range is clamped to the file size; holes and unwritten extents
    /// read as zeros. A symlink reads as its target.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self.kind() {
            FileKind::Directory => return Err(XfsError::IsDirectory),
            FileKind::Symlink => {
                let target = self.symlink_target()?;
                let start = usize::try_from(offset).map_or(target.len(), |o| o.min(target.len()));
                let end = start.saturating_add(len).min(target.len());
                return Ok(target[start..end].to_vec());
            }
            _ => {}
        }
        if self.record.core.is_realtime() {
            return Err(XfsError::UnsupportedFeature(format!(
                "realtime data on inode {}",
                self.number()
            )));
        }
        let size = self.size();
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let available = u64_to_usize(size - offset, "read_len").unwrap_or(usize::MAX);
        let len = len.min(available);
        trace!(ino = self.number().0, offset, len, "inode_read");
        self.mapper().read_range(offset, len)
    }

    /// The whole file.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let len = u64_to_usize(self.size(), "file_size")
            .map_err(|e| XfsError::InvalidArgument(e.to_string()))?;
        self.read(0, len)
    }

    // ── Attributes and symlinks ───────────────────────────────────────────

    pub fn attributes(&self) -> Result<Attributes<'_>> {
        Attributes::open(&self.fs.volume, &self.record)
    }

    /// Target bytes of a symlink. `NotSymlink` for any other file type.
    pub fn symlink_target(&self) -> Result<Vec<u8>> {
        read_symlink_target(&self.fs.volume, &self.record)
    }
}

// ── Path resolution ─────────────────────────────────────────────────────────

impl Filesystem {
    /// Resolve an absolute path, following every symlink including the last
    /// component.
    pub fn resolve_path(&self, path: impl AsRef<[u8]>) -> Result<Inode<'_>> {
        self.resolve(path.as_ref(), true)
    }

    /// Resolve an absolute path without following a final symlink.
    pub fn resolve_path_nofollow(&self, path: impl AsRef<[u8]>) -> Result<Inode<'_>> {
        self.resolve(path.as_ref(), false)
    }

    fn resolve(&self, path: &[u8], follow_final: bool) -> Result<Inode<'_>> {
        if path.first() != Some(&b'/') {
            return Err(XfsError::InvalidArgument(format!(
                "path must be absolute: {}",
                String::from_utf8_lossy(path)
            )));
        }
        let mut pending = components(path);
        let mut current = self.root_inode()?;
        let mut followed = 0_u32;

        while let Some(name) = pending.pop_front() {
            if name == b"." {
                continue;
            }
            if !current.is_directory() {
                return Err(XfsError::NotDirectory);
            }
            if name == b".." {
                let parent = current.parent()?;
                current = self.inode(parent)?;
                continue;
            }

            let entry = current.lookup(&name)?.ok_or_else(|| {
                XfsError::NotFound(format!(
                    "{} in {}",
                    String::from_utf8_lossy(&name),
                    String::from_utf8_lossy(path)
                ))
            })?;
            let next = self.inode(entry.ino)?;
            trace!(name = %String::from_utf8_lossy(&name), ino = entry.ino.0, "path_step");

            if next.is_symlink() && (follow_final || !pending.is_empty()) {
                followed += 1;
                if followed > self.options.max_symlink_depth {
                    debug!(path = %String::from_utf8_lossy(path), followed, "symlink_loop");
                    return Err(XfsError::SymlinkLoop);
                }
                let target = next.symlink_target()?;
                if target.first() == Some(&b'/') {
                    current = self.root_inode()?;
                }
                for component in components(&target).into_iter().rev() {
                    pending.push_front(component);
                }
                continue;
            }
            current = next;
        }
        Ok(current)
    }
}

fn components(path: &[u8]) -> VecDeque<Vec<u8>> {
    path.split(|b| *b == b'/')
        .filter(|c| !c.is_empty())
        .map(<[u8]>::to_vec)
        .collect()
}
