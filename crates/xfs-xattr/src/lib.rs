#![forbid(unsafe_code)]
//! Extended attribute decoding.
//!
//! The attribute fork holds one of three forms: shortform entries in the
//! inode literal area, a single leaf block at fork block 0, or a DA btree
//! rooted at fork block 0 whose leaves are attribute leaf blocks. A leaf
//! root is a one-level tree, so leaf and node forms share the btree engine.
//!
//! Values too large for a leaf entry live in separate fork blocks and are
//! only read by [`Attributes::value`].

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use xfs_btree::{AttrHashIndex, Btree, BtreeRoot, Direction, LeafWalk, Node, NodeReader, corrupt_at};
use xfs_error::{Result, XfsError};
use xfs_extent::{DaNodeReader, ExtentMapper, Fork, ForkStorage, Volume};
use xfs_inode::InodeRecord;
use xfs_ondisk::attr::{
    AttrLeafHeader, AttrRmtHeader, SfAttrEntry, SfAttrHeader, XFS_ATTR_SF_HDR_LEN,
    XFS_ATTR3_RMT_HDR_LEN, leaf_magic, remote_value_blocks,
};
use xfs_ondisk::checksum::ATTR3_RMT_CRC_OFFSET;
use xfs_ondisk::{AttrLeafEntry, AttrLeafName, AttrNamespace, DaBlkInfo, DaNodeHeader, da_hashname};
use xfs_types::FileBlock;

// ── Attributes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    Inline(Vec<u8>),
    /// Stored out of line, starting at attribute fork block `block`.
    Remote { block: u32, len: u32 },
}

impl AttrValue {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Inline(bytes) => bytes.len(),
            Self::Remote { len, .. } => *len as usize,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub namespace: AttrNamespace,
    pub name: Vec<u8>,
    pub value: AttrValue,
}

impl Attribute {
    /// Name with its namespace prefix, e.g. `user.comment`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}{}", self.namespace.prefix(), String::from_utf8_lossy(&self.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrForm {
    Shortform,
    Leaf,
    Node,
}

impl AttrForm {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Shortform => "shortform",
            Self::Leaf => "leaf",
            Self::Node => "node",
        }
    }
}

// ── Attribute fork ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Layout<'a> {
    Empty,
    Shortform { header: SfAttrHeader, bytes: &'a [u8] },
    Blocks { fork: &'a Fork, form: AttrForm },
}

/// The attribute fork of one inode.
#[derive(Debug, Clone, Copy)]
pub struct Attributes<'a> {
    volume: &'a Volume,
    inode: &'a InodeRecord,
    layout: Layout<'a>,
}

impl<'a> Attributes<'a> {
    /// Recognize the attribute fork's form. Inodes without an attribute
    /// fork have an empty set.
    pub fn open(volume: &'a Volume, inode: &'a InodeRecord) -> Result<Self> {
        let layout = match &inode.attr_fork {
            None => Layout::Empty,
            Some(fork) => Self::detect(volume, inode, fork)?,
        };
        let attrs = Self {
            volume,
            inode,
            layout,
        };
        debug!(
            ino = inode.number.0,
            form = attrs.form().map(AttrForm::name),
            "attr_form"
        );
        Ok(attrs)
    }

    fn detect(volume: &'a Volume, inode: &'a InodeRecord, fork: &'a Fork) -> Result<Layout<'a>> {
        if let Some(bytes) = fork.inline_bytes() {
            let header = SfAttrHeader::parse(bytes).map_err(|e| corrupt_at(inode.block, &e))?;
            return Ok(Layout::Shortform {
                header,
                bytes: &bytes[..usize::from(header.total_size)],
            });
        }
        if matches!(fork.storage, ForkStorage::ExtentList { count: 0, .. }) {
            return Ok(Layout::Empty);
        }
        let crc = volume.geometry().has_crc;
        let reader = DaNodeReader::new(ExtentMapper::new(volume, fork), 1);
        let bytes = reader.read_node(0)?;
        let address = reader.node_address(0);
        let magic = DaBlkInfo::peek_magic(&bytes).map_err(|e| corrupt_at(address, &e))?;
        let form = if magic == leaf_magic(crc) {
            AttrForm::Leaf
        } else if magic == DaNodeHeader::magic(crc) {
            AttrForm::Node
        } else {
            return Err(XfsError::corrupt(
                address,
                format!("attribute fork of inode {} starts with magic {magic:#06x}", inode.number),
            ));
        };
        Ok(Layout::Blocks { fork, form })
    }

    /// Storage form, or `None` when the inode has no attributes.
    #[must_use]
    pub fn form(&self) -> Option<AttrForm> {
        match self.layout {
            Layout::Empty => None,
            Layout::Shortform { .. } => Some(AttrForm::Shortform),
            Layout::Blocks { form, .. } => Some(form),
        }
    }

    fn tree(&self, fork: &'a Fork) -> Btree<AttrHashIndex, DaNodeReader<'a>> {
        Btree::new(
            AttrHashIndex {
                crc: self.volume.geometry().has_crc,
            },
            DaNodeReader::new(ExtentMapper::new(self.volume, fork), 1),
            self.volume.checksums(),
        )
    }

    /// Lazy attribute sequence: shortform entries in stored order, block
    /// forms in hash order. Entries left incomplete by an interrupted
    /// update are skipped.
    #[must_use]
    pub fn entries(&self) -> AttrEntries<'a> {
        let state = match self.layout {
            Layout::Empty => State::Done,
            Layout::Shortform { header, bytes } => State::Shortform {
                bytes,
                offset: XFS_ATTR_SF_HDR_LEN,
                remaining: usize::from(header.count),
            },
            Layout::Blocks { fork, .. } => State::Leaves {
                walk: self.tree(fork).leaves(&BtreeRoot::Block(0), Direction::Forward),
                current: None,
            },
        };
        AttrEntries { attrs: *self, state }
    }

    /// Find the attribute `name` in `namespace`.
    pub fn lookup(&self, namespace: AttrNamespace, name: &[u8]) -> Result<Option<Attribute>> {
        let wanted = |attr: &Attribute| attr.namespace == namespace && attr.name == name;
        let found = match self.layout {
            Layout::Empty => None,
            Layout::Shortform { .. } => {
                let mut found = None;
                for attr in self.entries() {
                    let attr = attr?;
                    if wanted(&attr) {
                        found = Some(attr);
                        break;
                    }
                }
                found
            }
            Layout::Blocks { fork, .. } => {
                let hash = da_hashname(name);
                let mut walk = self.tree(fork).range_from(&BtreeRoot::Block(0), hash);
                let mut found = None;
                while let Some(record) = walk.next() {
                    let record = record?;
                    if record.hashval > hash {
                        break;
                    }
                    if record.hashval < hash || record.is_incomplete() {
                        continue;
                    }
                    let Some(leaf) = walk.current_leaf() else {
                        break;
                    };
                    self.check_leaf(leaf)?;
                    let attr = decode_entry(leaf, &record)?;
                    if wanted(&attr) {
                        found = Some(attr);
                        break;
                    }
                }
                found
            }
        };
        trace!(
            ino = self.inode.number.0,
            namespace = namespace.prefix(),
            found = found.is_some(),
            "attr_lookup"
        );
        Ok(found)
    }

    /// Value bytes of `attr`, reading remote blocks when needed.
    pub fn value(&self, attr: &Attribute) -> Result<Vec<u8>> {
        match (&attr.value, self.layout) {
            (AttrValue::Inline(bytes), _) => Ok(bytes.clone()),
            (AttrValue::Remote { block, len }, Layout::Blocks { fork, .. }) => {
                self.read_remote(fork, *block, *len)
            }
            (AttrValue::Remote { .. }, _) => Err(XfsError::corrupt(
                self.inode.block,
                "remote attribute value without attribute blocks",
            )),
        }
    }

    /// Value of `name` in `namespace`, if present.
    pub fn get(&self, namespace: AttrNamespace, name: &[u8]) -> Result<Option<Vec<u8>>> {
        self.lookup(namespace, name)?
            .map(|attr| self.value(&attr))
            .transpose()
    }

    /// Value of an attribute that must exist.
    pub fn get_required(&self, namespace: AttrNamespace, name: &[u8]) -> Result<Vec<u8>> {
        self.get(namespace, name)?.ok_or_else(|| {
            XfsError::NotFound(format!(
                "attribute {}{} on inode {}",
                namespace.prefix(),
                String::from_utf8_lossy(name),
                self.inode.number
            ))
        })
    }

    fn read_remote(&self, fork: &'a Fork, block: u32, len: u32) -> Result<Vec<u8>> {
        let geo = self.volume.geometry();
        let blocks = u64::from(remote_value_blocks(len, geo.block_size.get(), geo.has_crc));
        let want = len as usize;
        let mapper = ExtentMapper::new(self.volume, fork);
        let first = u64::from(block);
        trace!(ino = self.inode.number.0, block, len, "attr_remote_read");

        if !geo.has_crc {
            let mut raw = mapper.read_metadata(FileBlock(first), blocks)?;
            raw.truncate(want);
            return Ok(raw);
        }

        let reader = DaNodeReader::new(mapper, 1);
        let mut value = Vec::with_capacity(want);
        for fork_block in first..first + blocks {
            let buf = reader.read_node(fork_block)?;
            let address = reader.node_address(fork_block);
            self.volume.verify("attr_remote", address, &buf, ATTR3_RMT_CRC_OFFSET)?;
            let header = AttrRmtHeader::parse(&buf).map_err(|e| corrupt_at(address, &e))?;
            if header.owner != self.inode.number.0 {
                return Err(XfsError::corrupt(
                    address,
                    format!(
                        "remote value block owned by inode {}, expected {}",
                        header.owner, self.inode.number
                    ),
                ));
            }
            if header.offset as usize != value.len() {
                return Err(XfsError::corrupt(
                    address,
                    format!("remote value fragment at {}, expected {}", header.offset, value.len()),
                ));
            }
            let take = (header.bytes as usize).min(want - value.len());
            value.extend_from_slice(&buf[XFS_ATTR3_RMT_HDR_LEN..XFS_ATTR3_RMT_HDR_LEN + take]);
        }
        if value.len() != want {
            return Err(XfsError::corrupt(
                self.inode.block,
                format!("remote value holds {} of {want} bytes", value.len()),
            ));
        }
        Ok(value)
    }

    /// v5 leaves name their owner.
    fn check_leaf(&self, leaf: &Node) -> Result<()> {
        let crc = self.volume.geometry().has_crc;
        if !crc {
            return Ok(());
        }
        let header = AttrLeafHeader::parse(&leaf.bytes, crc).map_err(|e| corrupt_at(leaf.address, &e))?;
        match header.info.owner {
            Some(owner) if owner != self.inode.number.0 => Err(XfsError::corrupt(
                leaf.address,
                format!(
                    "attribute leaf owned by inode {owner}, expected {}",
                    self.inode.number
                ),
            )),
            _ => Ok(()),
        }
    }
}

fn decode_entry(leaf: &Node, entry: &AttrLeafEntry) -> Result<Attribute> {
    let namespace = AttrNamespace::from_flags(entry.flags).map_err(|e| corrupt_at(leaf.address, &e))?;
    let attr = match AttrLeafName::parse(&leaf.bytes, entry).map_err(|e| corrupt_at(leaf.address, &e))? {
        AttrLeafName::Local { name, value } => Attribute {
            namespace,
            name,
            value: AttrValue::Inline(value),
        },
        AttrLeafName::Remote {
            name,
            value_block,
            value_len,
        } => Attribute {
            namespace,
            name,
            value: AttrValue::Remote {
                block: value_block,
                len: value_len,
            },
        },
    };
    Ok(attr)
}

// ── Entry iterator ──────────────────────────────────────────────────────────

enum State<'a> {
    Shortform {
        bytes: &'a [u8],
        offset: usize,
        remaining: usize,
    },
    Leaves {
        walk: LeafWalk<AttrHashIndex, DaNodeReader<'a>>,
        current: Option<(Node, usize)>,
    },
    Done,
}

/// Lazy attribute sequence of one inode. Fuses after the first error.
pub struct AttrEntries<'a> {
    attrs: Attributes<'a>,
    state: State<'a>,
}

impl std::fmt::Debug for AttrEntries<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttrEntries")
            .field("ino", &self.attrs.inode.number)
            .field("done", &matches!(self.state, State::Done))
            .finish()
    }
}

impl AttrEntries<'_> {
    fn pull(&mut self) -> Result<Option<Attribute>> {
        let Self { attrs, state } = self;
        match state {
            State::Done => Ok(None),
            State::Shortform {
                bytes,
                offset,
                remaining,
            } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let block = attrs.inode.block;
                let entry = SfAttrEntry::parse(bytes, *offset, bytes.len())
                    .map_err(|e| corrupt_at(block, &e))?;
                *offset += entry.len;
                *remaining -= 1;
                let namespace = AttrNamespace::from_flags(entry.flags).map_err(|e| corrupt_at(block, &e))?;
                Ok(Some(Attribute {
                    namespace,
                    name: entry.name,
                    value: AttrValue::Inline(entry.value),
                }))
            }
            State::Leaves { walk, current } => loop {
                if let Some((leaf, index)) = current {
                    while *index < leaf.layout.numrecs {
                        let raw = leaf
                            .layout
                            .records
                            .get(&leaf.bytes, *index)
                            .map_err(|e| corrupt_at(leaf.address, &e))?;
                        let entry = AttrLeafEntry::parse(raw, 0).map_err(|e| corrupt_at(leaf.address, &e))?;
                        *index += 1;
                        if entry.is_incomplete() {
                            continue;
                        }
                        return decode_entry(leaf, &entry).map(Some);
                    }
                    *current = None;
                }
                let Some(leaf) = walk.next().transpose()? else {
                    return Ok(None);
                };
                attrs.check_leaf(&leaf)?;
                *current = Some((leaf, 0));
            },
        }
    }
}

impl Iterator for AttrEntries<'_> {
    type Item = Result<Attribute>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.pull() {
            Ok(Some(attr)) => Some(Ok(attr)),
            Ok(None) => {
                self.state = State::Done;
                None
            }
            Err(err) => {
                debug!(ino = self.attrs.inode.number.0, error = %err, "attr_walk_failed");
                self.state = State::Done;
                Some(Err(err))
            }
        }
    }
}
