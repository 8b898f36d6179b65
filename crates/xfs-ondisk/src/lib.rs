#![forbid(unsafe_code)]
//! On-disk format parsing for XFS structures.
//!
//! Pure parsing crate with no I/O. Each module defines the field layout of
//! one family of on-disk structures and decodes byte slices into typed
//! records through the `xfs-types` read helpers. Nothing here knows which
//! block a buffer came from; callers attach that context when converting
//! `ParseError` into a runtime error.

pub mod ag;
pub mod attr;
pub mod btree;
pub mod checksum;
pub mod da;
pub mod dinode;
pub mod dir2;
pub mod sb;
pub mod symlink;

pub use ag::{Agf, Agi, BtreeRootInfo};
pub use attr::{AttrLeafEntry, AttrLeafHeader, AttrLeafName, AttrNamespace, SfAttrEntry, SfAttrHeader};
pub use btree::{
    AllocRec, BmdrHeader, BtreeBlockHeader, ExtentRecord, InobtRec, PointerForm, RefcountRec,
    RmapRec,
};
pub use checksum::{ChecksumPolicy, verify_crc};
pub use da::{DaBlkInfo, DaNodeEntry, DaNodeHeader};
pub use dinode::{DinodeCore, FileKind, ForkFormat, Timestamp};
pub use dir2::{FileType, da_hashname};
pub use sb::{Geometry, InodeLocation, Superblock};
