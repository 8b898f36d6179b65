//! Synthetic XFS volume construction.
//!
//! `ImageBuilder` lays out a small but structurally complete volume: a
//! superblock copy at the start of every AG, AGF and AGI headers, one-leaf
//! free space and inode btrees, a run of inode chunks in AG 0, and the
//! contents of files, directories, and symlinks. Directories take the
//! smallest form their entries fit in, so one builder produces shortform,
//! block, leaf, and node directories. Everything is checksummed on v5.

use anyhow::{Context, Result, bail, ensure};
use std::collections::{BTreeMap, BTreeSet};
use xfs_ondisk::ag::{
    AGF_SECTOR, AGI_SECTOR, XFS_AGF_MAGIC, XFS_AGF_VERSION, XFS_AGI_MAGIC,
    XFS_AGI_UNLINKED_BUCKETS, XFS_AGI_VERSION,
};
use xfs_ondisk::btree::{
    XFS_ABTB_CRC_MAGIC, XFS_ABTB_MAGIC, XFS_ABTC_CRC_MAGIC, XFS_ABTC_MAGIC,
    XFS_BTREE_SBLOCK_CRC_LEN, XFS_BTREE_SBLOCK_LEN, XFS_IBT_CRC_MAGIC, XFS_IBT_MAGIC,
};
use xfs_ondisk::checksum::{
    AGF_CRC_OFFSET, AGI_CRC_OFFSET, DA3_CRC_OFFSET, DINODE_CRC_OFFSET, DIR3_DATA_CRC_OFFSET,
    SB_CRC_OFFSET, SBLOCK_CRC_OFFSET, SYMLINK_CRC_OFFSET, update_crc,
};
use xfs_ondisk::dinode::{XFS_DINODE_CORE_V2_SIZE, XFS_DINODE_CORE_V3_SIZE, XFS_DINODE_MAGIC};
use xfs_ondisk::dir2::{
    LeafHeader, XFS_DIR2_BLOCK_TAIL_LEN, XFS_DIR2_DATA_FREE_TAG, XFS_DIR2_LEAF_ENTRY_LEN,
    block_magic, data_entry_len, data_header_len, data_magic, leaf1_magic, leafn_magic,
};
use xfs_ondisk::sb::{XfsFeatures2, XfsIncompatFeatures, XfsVersionFlags};
use xfs_ondisk::symlink::{XFS_SYMLINK_HDR_LEN, XFS_SYMLINK_MAGIC, XFS_SYMLINK_MAXLEN};
use xfs_ondisk::{
    AttrNamespace, DaBlkInfo, DaNodeHeader, ExtentRecord, FileKind, FileType, Geometry,
    Superblock, da_hashname,
};
use xfs_types::{
    AgBlock, AgInode, AgNumber, FsBlock, InodeNumber, NULLAGBLOCK, NULLAGINO, S_IFBLK, S_IFCHR,
    S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, XFS_SB_MAGIC, log2_roundup,
};

const SECTOR: usize = 512;
const INODES_PER_CHUNK: u32 = 64;
const TIMESTAMP: u32 = 1_700_000_000;
const MAX_NAME_LEN: usize = 255;

const FORMAT_DEV: u8 = 0;
const FORMAT_LOCAL: u8 = 1;
const FORMAT_EXTENTS: u8 = 2;

const DIR3_DATA_BLKNO: usize = 8;
const DIR3_DATA_UUID: usize = 24;
const DIR3_DATA_OWNER: usize = 40;
const DA3_BLKNO: usize = 16;
const DA3_UUID: usize = 32;
const DA3_OWNER: usize = 48;
const SYMLINK_BLKNO: usize = 40;

// ── Volume parameters ───────────────────────────────────────────────────────

/// Shape of the volume an `ImageBuilder` produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub block_size: u32,
    pub ag_blocks: u32,
    pub ag_count: u32,
    pub inode_size: u32,
    /// log2 of filesystem blocks per directory block.
    pub dir_block_log: u8,
    /// v5 (checksummed, self-describing metadata) instead of v4.
    pub crc: bool,
    /// Inode chunks reserved in AG 0; each holds 64 inodes.
    pub inode_chunks: u32,
    pub label: String,
    pub uuid: [u8; 16],
}

impl ImageSpec {
    #[must_use]
    pub fn v5(block_size: u32, ag_blocks: u32, ag_count: u32) -> Self {
        Self {
            block_size,
            ag_blocks,
            ag_count,
            inode_size: 512,
            dir_block_log: 0,
            crc: true,
            inode_chunks: 4,
            label: "synthetic".to_owned(),
            uuid: *b"xfs-harness-uuid",
        }
    }

    #[must_use]
    pub fn v4(block_size: u32, ag_blocks: u32, ag_count: u32) -> Self {
        Self {
            inode_size: 256,
            crc: false,
            ..Self::v5(block_size, ag_blocks, ag_count)
        }
    }
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self::v5(4096, 1024, 2)
    }
}

// ── Tree model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Content {
    File { size: u64, pieces: Vec<(u64, Vec<u8>)> },
    Dir { entries: Vec<(Vec<u8>, u64)>, parent: u64 },
    Symlink(Vec<u8>),
    Device(u32),
}

#[derive(Debug, Clone)]
struct Node {
    mode: u16,
    flags: u16,
    content: Content,
    xattrs: Vec<(AttrNamespace, Vec<u8>, Vec<u8>)>,
}

impl Node {
    fn new(mode: u16, content: Content) -> Self {
        Self {
            mode,
            flags: 0,
            content,
            xattrs: Vec::new(),
        }
    }
}

/// Placement of the fixed metadata inside each AG.
#[derive(Debug, Clone, Copy)]
struct AgLayout {
    bno_root: u32,
    cnt_root: u32,
    ino_root: u32,
    /// First block after the headers and btree roots.
    free_start: u32,
    chunk_start: u32,
    /// First block of AG 0 past the inode chunks.
    data_start: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    inodes: u64,
    free_inodes: u64,
    free_blocks: u64,
}

/// Data fork contents of one inode.
#[derive(Debug, Default)]
struct DataFork {
    format: u8,
    bytes: Vec<u8>,
    extents: u32,
    blocks: u64,
    size: u64,
}

impl DataFork {
    fn local(bytes: Vec<u8>) -> Self {
        Self {
            format: FORMAT_LOCAL,
            size: bytes.len() as u64,
            bytes,
            ..Self::default()
        }
    }

    fn mapped(size: u64) -> Self {
        Self {
            format: FORMAT_EXTENTS,
            size,
            ..Self::default()
        }
    }

    fn push_extent(&mut self, file_offset: u64, start: FsBlock, count: u32) {
        let record = ExtentRecord {
            file_offset,
            start_block: start,
            block_count: u64::from(count),
            unwritten: false,
        };
        self.bytes.extend_from_slice(&record.encode());
        self.extents += 1;
        self.blocks += u64::from(count);
    }
}

struct Output {
    bytes: Vec<u8>,
    /// Next unallocated block of each AG.
    cursors: Vec<u32>,
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Assembles a volume image in memory.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    spec: ImageSpec,
    geometry: Geometry,
    layout: AgLayout,
    nodes: BTreeMap<u64, Node>,
    names: BTreeSet<(u64, Vec<u8>)>,
    next_slot: u32,
    root: u64,
}

impl ImageBuilder {
    /// Start a volume holding only an empty root directory.
    pub fn new(spec: ImageSpec) -> Result<Self> {
        let bs = spec.block_size;
        ensure!(
            bs.is_power_of_two() && (512..=65536).contains(&bs),
            "block size {bs} must be a power of two in 512..=65536"
        );
        let inode_bytes = spec.inode_size;
        ensure!(
            inode_bytes.is_power_of_two() && (256..=2048).contains(&inode_bytes) && inode_bytes <= bs,
            "inode size {inode_bytes} unusable with {bs}-byte blocks"
        );
        ensure!(
            inode_bytes * INODES_PER_CHUNK >= bs,
            "an inode chunk must fill at least one block"
        );
        ensure!(spec.ag_count > 0, "volume needs at least one allocation group");
        ensure!(spec.inode_chunks > 0, "volume needs at least one inode chunk");
        ensure!(spec.label.len() <= 12, "label {:?} exceeds 12 bytes", spec.label);

        let header_blocks = (4 * SECTOR as u32).div_ceil(bs);
        let chunk_blocks = inode_bytes * INODES_PER_CHUNK / bs;
        let free_start = header_blocks + 3;
        let chunk_start = free_start.next_multiple_of(chunk_blocks);
        let data_start = chunk_start + spec.inode_chunks * chunk_blocks;
        ensure!(
            data_start < spec.ag_blocks,
            "allocation groups of {} blocks cannot hold {} inode chunks",
            spec.ag_blocks,
            spec.inode_chunks
        );
        let record_room = (bs as usize - sblock_len(spec.crc)) / 16;
        ensure!(
            spec.inode_chunks as usize <= record_room,
            "{} inode chunks overflow a single inode btree leaf",
            spec.inode_chunks
        );

        let layout = AgLayout {
            bno_root: header_blocks,
            cnt_root: header_blocks + 1,
            ino_root: header_blocks + 2,
            free_start,
            chunk_start,
            data_start,
        };
        let root = u64::from(chunk_start * (bs / inode_bytes));
        let region = encode_superblock(&spec, root, Counters::default())?;
        let sb = Superblock::parse_superblock_region(&region)?;
        sb.validate_features()?;
        sb.validate_geometry()?;
        let geometry = sb.geometry()?;

        let mut builder = Self {
            spec,
            geometry,
            layout,
            nodes: BTreeMap::new(),
            names: BTreeSet::new(),
            next_slot: 0,
            root,
        };
        let claimed = builder.claim(None)?;
        ensure!(claimed == root, "root landed on inode {claimed}, expected {root}");
        builder.nodes.insert(
            root,
            Node::new(
                S_IFDIR | 0o755,
                Content::Dir {
                    entries: Vec::new(),
                    parent: root,
                },
            ),
        );
        Ok(builder)
    }

    #[must_use]
    pub fn root(&self) -> u64 {
        self.root
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    /// Inode numbers the reserved chunks can hand out.
    #[must_use]
    pub fn inode_capacity(&self) -> u32 {
        self.spec.inode_chunks * INODES_PER_CHUNK
    }

    pub fn mkdir(&mut self, parent: u64, name: impl AsRef<[u8]>) -> Result<u64> {
        self.insert(None, parent, name.as_ref(), dir_node(parent))
    }

    /// Like `mkdir`, at a caller-chosen inode number inside the chunks.
    pub fn mkdir_at(&mut self, ino: u64, parent: u64, name: impl AsRef<[u8]>) -> Result<u64> {
        self.insert(Some(ino), parent, name.as_ref(), dir_node(parent))
    }

    pub fn add_file(&mut self, parent: u64, name: impl AsRef<[u8]>, data: &[u8]) -> Result<u64> {
        self.insert(None, parent, name.as_ref(), file_node(data))
    }

    pub fn add_file_at(
        &mut self,
        ino: u64,
        parent: u64,
        name: impl AsRef<[u8]>,
        data: &[u8],
    ) -> Result<u64> {
        self.insert(Some(ino), parent, name.as_ref(), file_node(data))
    }

    /// A file of `size` bytes holding `pieces` at block-aligned offsets;
    /// everything else is a hole.
    pub fn add_sparse_file(
        &mut self,
        parent: u64,
        name: impl AsRef<[u8]>,
        size: u64,
        pieces: &[(u64, &[u8])],
    ) -> Result<u64> {
        let bs = u64::from(self.spec.block_size);
        let mut mapped = Vec::with_capacity(pieces.len());
        let mut end = 0;
        for &(offset, data) in pieces {
            ensure!(offset % bs == 0, "piece offset {offset} is not block aligned");
            ensure!(offset >= end, "piece at {offset} overlaps the previous one");
            end = offset + data.len() as u64;
            ensure!(end <= size, "piece at {offset} extends past the file size {size}");
            end = end.next_multiple_of(bs);
            mapped.push((offset / bs, data.to_vec()));
        }
        let node = Node::new(
            S_IFREG | 0o644,
            Content::File {
                size,
                pieces: mapped,
            },
        );
        self.insert(None, parent, name.as_ref(), node)
    }

    pub fn symlink(
        &mut self,
        parent: u64,
        name: impl AsRef<[u8]>,
        target: impl AsRef<[u8]>,
    ) -> Result<u64> {
        let target = target.as_ref();
        ensure!(
            !target.is_empty() && target.len() as u64 <= XFS_SYMLINK_MAXLEN,
            "symlink target of {} bytes",
            target.len()
        );
        let node = Node::new(S_IFLNK | 0o777, Content::Symlink(target.to_vec()));
        self.insert(None, parent, name.as_ref(), node)
    }

    /// A character or block device node.
    pub fn add_device(
        &mut self,
        parent: u64,
        name: impl AsRef<[u8]>,
        kind: u16,
        major: u32,
        minor: u32,
    ) -> Result<u64> {
        ensure!(
            matches!(kind, S_IFCHR | S_IFBLK),
            "device kind {kind:#o} is not a character or block device"
        );
        ensure!(major < 1 << 14 && minor < 1 << 18, "device {major}:{minor} out of range");
        let node = Node::new(kind | 0o660, Content::Device((major << 18) | minor));
        self.insert(None, parent, name.as_ref(), node)
    }

    /// Add another name for an existing non-directory inode.
    pub fn link(&mut self, parent: u64, name: impl AsRef<[u8]>, ino: u64) -> Result<()> {
        match self.nodes.get(&ino) {
            None => bail!("inode {ino} does not exist"),
            Some(node) if node.mode & S_IFMT == S_IFDIR => {
                bail!("cannot hard link directory {ino}")
            }
            Some(_) => {}
        }
        let name = name.as_ref();
        self.check_name(parent, name)?;
        self.attach(parent, name, ino)
    }

    /// Attach a shortform extended attribute.
    pub fn set_xattr(
        &mut self,
        ino: u64,
        namespace: AttrNamespace,
        name: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        let (name, value) = (name.as_ref(), value.as_ref());
        ensure!(
            !name.is_empty() && name.len() <= MAX_NAME_LEN,
            "attribute name of {} bytes",
            name.len()
        );
        ensure!(value.len() <= 255, "attribute value of {} bytes", value.len());
        let node = self.node_mut(ino)?;
        ensure!(
            !node.xattrs.iter().any(|(ns, n, _)| *ns == namespace && n == name),
            "inode {ino} already has attribute {}",
            String::from_utf8_lossy(name)
        );
        node.xattrs.push((namespace, name.to_vec(), value.to_vec()));
        Ok(())
    }

    /// Set raw `di_flags` bits on an inode.
    pub fn set_flags(&mut self, ino: u64, flags: u16) -> Result<()> {
        self.node_mut(ino)?.flags = flags;
        Ok(())
    }

    fn node_mut(&mut self, ino: u64) -> Result<&mut Node> {
        self.nodes
            .get_mut(&ino)
            .with_context(|| format!("inode {ino} does not exist"))
    }

    fn insert(&mut self, ino: Option<u64>, parent: u64, name: &[u8], node: Node) -> Result<u64> {
        self.check_name(parent, name)?;
        let ino = self.claim(ino)?;
        self.nodes.insert(ino, node);
        self.attach(parent, name, ino)?;
        Ok(ino)
    }

    fn check_name(&self, parent: u64, name: &[u8]) -> Result<()> {
        ensure!(
            !name.is_empty() && name.len() <= MAX_NAME_LEN,
            "entry name of {} bytes",
            name.len()
        );
        ensure!(
            !name.contains(&b'/') && !name.contains(&0),
            "entry name {:?} contains a separator or NUL",
            String::from_utf8_lossy(name)
        );
        ensure!(name != b"." && name != b"..", "dot entries are implicit");
        match self.nodes.get(&parent) {
            Some(Node {
                content: Content::Dir { .. },
                ..
            }) => {}
            _ => bail!("inode {parent} is not a directory"),
        }
        ensure!(
            !self.names.contains(&(parent, name.to_vec())),
            "directory {parent} already has an entry {:?}",
            String::from_utf8_lossy(name)
        );
        Ok(())
    }

    fn attach(&mut self, parent: u64, name: &[u8], ino: u64) -> Result<()> {
        let Content::Dir { entries, .. } = &mut self.node_mut(parent)?.content else {
            bail!("inode {parent} is not a directory");
        };
        entries.push((name.to_vec(), ino));
        self.names.insert((parent, name.to_vec()));
        Ok(())
    }

    fn first_agino(&self) -> u32 {
        self.layout.chunk_start * self.geometry.inodes_per_block
    }

    fn slot_ino(&self, slot: u32) -> u64 {
        self.geometry
            .make_ino(AgNumber(0), AgInode(self.first_agino() + slot))
            .0
    }

    fn ino_slot(&self, ino: u64) -> Option<u32> {
        let (ag, agino) = self.geometry.split_ino(InodeNumber(ino));
        let slot = agino.0.checked_sub(self.first_agino())?;
        (ag.0 == 0 && slot < self.inode_capacity()).then_some(slot)
    }

    fn claim(&mut self, ino: Option<u64>) -> Result<u64> {
        let ino = match ino {
            Some(ino) => {
                ensure!(
                    self.ino_slot(ino).is_some(),
                    "inode {ino} lies outside the inode chunks"
                );
                ino
            }
            None => loop {
                ensure!(self.next_slot < self.inode_capacity(), "inode chunks exhausted");
                let ino = self.slot_ino(self.next_slot);
                self.next_slot += 1;
                if !self.nodes.contains_key(&ino) {
                    break ino;
                }
            },
        };
        ensure!(!self.nodes.contains_key(&ino), "inode {ino} already in use");
        Ok(ino)
    }

    // ── Image assembly ──────────────────────────────────────────────────

    /// Lay out every inode and its contents, then the AG metadata.
    pub fn build(&self) -> Result<Vec<u8>> {
        let geo = &self.geometry;
        let bs = geo.block_size_bytes();
        let blocks = usize::try_from(geo.data_blocks)?;
        let mut out = Output {
            bytes: vec![0_u8; blocks.checked_mul(bs).context("image size overflows usize")?],
            cursors: (0..self.spec.ag_count)
                .map(|ag| {
                    if ag == 0 {
                        self.layout.data_start
                    } else {
                        self.layout.free_start
                    }
                })
                .collect(),
        };

        let links = self.link_counts();
        for (&ino, node) in &self.nodes {
            let nlink = links.get(&ino).copied().unwrap_or(0);
            let raw = self.inode_record(&mut out, ino, node, nlink)?;
            let offset = geo.locate_inode(InodeNumber(ino))?.byte_offset.to_usize()?;
            out.bytes[offset..offset + raw.len()].copy_from_slice(&raw);
        }
        for slot in 0..self.inode_capacity() {
            let ino = self.slot_ino(slot);
            if self.nodes.contains_key(&ino) {
                continue;
            }
            let raw = self.free_inode_record(ino)?;
            let offset = geo.locate_inode(InodeNumber(ino))?.byte_offset.to_usize()?;
            out.bytes[offset..offset + raw.len()].copy_from_slice(&raw);
        }

        let capacity = u64::from(self.inode_capacity());
        let mut counters = Counters {
            inodes: capacity,
            free_inodes: capacity - self.nodes.len() as u64,
            free_blocks: 0,
        };
        for ag in 0..self.spec.ag_count {
            counters.free_blocks += self.write_ag(&mut out, AgNumber(ag))?;
        }
        let sb = encode_superblock(&self.spec, self.root, counters)?;
        for ag in 0..self.spec.ag_count {
            let offset = geo.ag_sector_offset(AgNumber(ag), 0)?.to_usize()?;
            out.bytes[offset..offset + SECTOR].copy_from_slice(&sb);
        }
        Ok(out.bytes)
    }

    /// Link count of every inode: names pointing at it, plus `.` and the
    /// `..` of each subdirectory for directories.
    fn link_counts(&self) -> BTreeMap<u64, u32> {
        let mut links = BTreeMap::new();
        for (&ino, node) in &self.nodes {
            if let Content::Dir { entries, .. } = &node.content {
                let subdirs = entries
                    .iter()
                    .filter(|(_, child)| self.is_dir(*child))
                    .count() as u32;
                *links.entry(ino).or_insert(0) += 2 + subdirs;
                for (_, child) in entries {
                    if !self.is_dir(*child) {
                        *links.entry(*child).or_insert(0) += 1;
                    }
                }
            }
        }
        links
    }

    fn is_dir(&self, ino: u64) -> bool {
        self.nodes
            .get(&ino)
            .is_some_and(|n| n.mode & S_IFMT == S_IFDIR)
    }

    fn ftype(&self, ino: u64) -> u8 {
        let kind = self
            .nodes
            .get(&ino)
            .and_then(|n| FileKind::from_mode(n.mode));
        let ftype = match kind {
            Some(FileKind::Regular) => FileType::Regular,
            Some(FileKind::Directory) => FileType::Directory,
            Some(FileKind::Symlink) => FileType::Symlink,
            Some(FileKind::CharDevice) => FileType::CharDevice,
            Some(FileKind::BlockDevice) => FileType::BlockDevice,
            Some(FileKind::Fifo) => FileType::Fifo,
            Some(FileKind::Socket) => FileType::Socket,
            None => FileType::Unknown,
        };
        ftype.to_raw()
    }

    fn allocate(&self, out: &mut Output, count: u32) -> Result<FsBlock> {
        for (ag, cursor) in out.cursors.iter_mut().enumerate() {
            let ag = AgNumber(u32::try_from(ag)?);
            if self.geometry.ag_length(ag) - *cursor >= count {
                let start = *cursor;
                *cursor += count;
                return Ok(self.geometry.make_fsblock(ag, AgBlock(start)));
            }
        }
        bail!("no allocation group has {count} free blocks")
    }

    fn write_run(&self, out: &mut Output, start: FsBlock, data: &[u8]) -> Result<()> {
        let linear = self.geometry.fsblock_to_linear(start)?;
        let offset = self.geometry.block_offset(linear)?.to_usize()?;
        out.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// 512-byte sector address of the `index`th block of a run.
    fn daddr(&self, start: FsBlock, index: u64) -> Result<u64> {
        let linear = self.geometry.fsblock_to_linear(start)?.0 + index;
        Ok(linear * (u64::from(self.spec.block_size) / SECTOR as u64))
    }

    fn ag_daddr(&self, ag: AgNumber, agbno: u32) -> u64 {
        self.geometry.ag_block_to_linear(ag, AgBlock(agbno)).0
            * (u64::from(self.spec.block_size) / SECTOR as u64)
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    fn inode_record(&self, out: &mut Output, ino: u64, node: &Node, nlink: u32) -> Result<Vec<u8>> {
        let crc = self.spec.crc;
        let inode_bytes = self.geometry.inode_size as usize;
        let literal_start = if crc {
            XFS_DINODE_CORE_V3_SIZE
        } else {
            XFS_DINODE_CORE_V2_SIZE
        };
        let literal = inode_bytes - literal_start;

        let attr = shortform_attrs(&node.xattrs)?;
        let (forkoff, data_room) = match &attr {
            Some(bytes) => {
                let room = bytes.len().next_multiple_of(8);
                ensure!(
                    room + 8 <= literal,
                    "attributes of inode {ino} overflow the inode"
                );
                let data_room = literal - room;
                (u8::try_from(data_room / 8)?, data_room)
            }
            None => (0, literal),
        };

        let fork = match &node.content {
            Content::File { size, pieces } => self.file_fork(out, *size, pieces)?,
            Content::Dir { entries, parent } => {
                self.dir_fork(out, ino, *parent, entries, data_room)?
            }
            Content::Symlink(target) => self.symlink_fork(out, ino, target, data_room)?,
            Content::Device(rdev) => DataFork {
                format: FORMAT_DEV,
                bytes: rdev.to_be_bytes().to_vec(),
                ..DataFork::default()
            },
        };
        ensure!(
            fork.bytes.len() <= data_room,
            "data fork of inode {ino} needs {} bytes, {data_room} available",
            fork.bytes.len()
        );

        let mut b = vec![0_u8; inode_bytes];
        put_u16(&mut b, 0, XFS_DINODE_MAGIC);
        put_u16(&mut b, 2, node.mode);
        b[4] = if crc { 3 } else { 2 };
        b[5] = fork.format;
        put_u32(&mut b, 16, nlink);
        for stamp in [32, 40, 48] {
            put_u32(&mut b, stamp, TIMESTAMP);
        }
        put_u64(&mut b, 56, fork.size);
        put_u64(&mut b, 64, fork.blocks);
        put_u32(&mut b, 76, fork.extents);
        b[82] = forkoff;
        b[83] = if attr.is_some() { FORMAT_LOCAL } else { FORMAT_EXTENTS };
        put_u16(&mut b, 90, node.flags);
        put_u32(&mut b, 92, (ino as u32).wrapping_mul(0x9E37_79B1));
        put_u32(&mut b, 96, NULLAGINO);
        if crc {
            put_u64(&mut b, 104, 1);
            put_u32(&mut b, 144, TIMESTAMP);
            put_u64(&mut b, 152, ino);
            b[160..176].copy_from_slice(&self.spec.uuid);
        }
        b[literal_start..literal_start + fork.bytes.len()].copy_from_slice(&fork.bytes);
        if let Some(attr) = attr {
            let start = literal_start + usize::from(forkoff) * 8;
            b[start..start + attr.len()].copy_from_slice(&attr);
        }
        if crc {
            update_crc(&mut b, DINODE_CRC_OFFSET)?;
        }
        Ok(b)
    }

    /// An initialized but unallocated record, as mkfs leaves them.
    fn free_inode_record(&self, ino: u64) -> Result<Vec<u8>> {
        let mut b = vec![0_u8; self.geometry.inode_size as usize];
        put_u16(&mut b, 0, XFS_DINODE_MAGIC);
        b[4] = if self.spec.crc { 3 } else { 2 };
        b[5] = FORMAT_EXTENTS;
        put_u32(&mut b, 96, NULLAGINO);
        if self.spec.crc {
            put_u64(&mut b, 152, ino);
            b[160..176].copy_from_slice(&self.spec.uuid);
            update_crc(&mut b, DINODE_CRC_OFFSET)?;
        }
        Ok(b)
    }

    fn file_fork(&self, out: &mut Output, size: u64, pieces: &[(u64, Vec<u8>)]) -> Result<DataFork> {
        let bs = self.geometry.block_size_bytes();
        let mut fork = DataFork::mapped(size);
        for (file_block, data) in pieces {
            if data.is_empty() {
                continue;
            }
            let count = u32::try_from(data.len().div_ceil(bs))?;
            let start = self.allocate(out, count)?;
            self.write_run(out, start, data)?;
            fork.push_extent(*file_block, start, count);
        }
        Ok(fork)
    }

    fn symlink_fork(&self, out: &mut Output, ino: u64, target: &[u8], room: usize) -> Result<DataFork> {
        if target.len() <= room {
            return Ok(DataFork::local(target.to_vec()));
        }
        let crc = self.spec.crc;
        let bs = self.geometry.block_size_bytes();
        let payload = if crc { bs - XFS_SYMLINK_HDR_LEN } else { bs };
        let pieces: Vec<&[u8]> = target.chunks(payload).collect();
        let count = u32::try_from(pieces.len())?;
        let start = self.allocate(out, count)?;

        let mut run = vec![0_u8; pieces.len() * bs];
        let mut offset = 0_u32;
        for (i, (block, piece)) in run.chunks_mut(bs).zip(&pieces).enumerate() {
            if crc {
                put_u32(block, 0, XFS_SYMLINK_MAGIC);
                put_u32(block, 4, offset);
                put_u32(block, 8, u32::try_from(piece.len())?);
                block[16..32].copy_from_slice(&self.spec.uuid);
                put_u64(block, 32, ino);
                put_u64(block, SYMLINK_BLKNO, self.daddr(start, i as u64)?);
                block[XFS_SYMLINK_HDR_LEN..XFS_SYMLINK_HDR_LEN + piece.len()].copy_from_slice(piece);
                update_crc(block, SYMLINK_CRC_OFFSET)?;
            } else {
                block[..piece.len()].copy_from_slice(piece);
            }
            offset += u32::try_from(piece.len())?;
        }
        self.write_run(out, start, &run)?;

        let mut fork = DataFork::mapped(target.len() as u64);
        fork.push_extent(0, start, count);
        Ok(fork)
    }

    // ── Directories ─────────────────────────────────────────────────────

    fn dir_fork(
        &self,
        out: &mut Output,
        ino: u64,
        parent: u64,
        entries: &[(Vec<u8>, u64)],
        room: usize,
    ) -> Result<DataFork> {
        if let Some(bytes) = self.shortform_dir(parent, entries, room) {
            return Ok(DataFork::local(bytes));
        }
        let dir = DirWriter::new(self, ino);
        let mut all = vec![(b".".to_vec(), ino), (b"..".to_vec(), parent)];
        all.extend_from_slice(entries);
        let (data, index) = dir.lay_out(&all)?;

        let mut fork = DataFork::mapped(data.len() as u64 * u64::from(self.geometry.dir_block_size()));
        let start = self.store_dir_run(out, data, DIR3_DATA_BLKNO, DIR3_DATA_CRC_OFFSET)?;
        fork.push_extent(0, start.0, start.1);
        if !index.is_empty() {
            let start = self.store_dir_run(out, index, DA3_BLKNO, DA3_CRC_OFFSET)?;
            fork.push_extent(self.geometry.dir_leaf_block().0, start.0, start.1);
        }
        Ok(fork)
    }

    /// Allocate and write consecutive directory blocks; on v5 stamp each
    /// with its sector address and checksum.
    fn store_dir_run(
        &self,
        out: &mut Output,
        mut blocks: Vec<Vec<u8>>,
        blkno_offset: usize,
        crc_offset: usize,
    ) -> Result<(FsBlock, u32)> {
        let fsbs = self.geometry.dir_block_fsbs();
        let count = u32::try_from(blocks.len() as u64 * fsbs)?;
        let start = self.allocate(out, count)?;
        let mut run = Vec::with_capacity(blocks.len() * blocks.first().map_or(0, Vec::len));
        for (i, block) in blocks.iter_mut().enumerate() {
            if self.spec.crc {
                put_u64(block, blkno_offset, self.daddr(start, i as u64 * fsbs)?);
                update_crc(block, crc_offset)?;
            }
            run.extend_from_slice(block);
        }
        self.write_run(out, start, &run)?;
        Ok((start, count))
    }

    fn shortform_dir(&self, parent: u64, entries: &[(Vec<u8>, u64)], room: usize) -> Option<Vec<u8>> {
        let narrow = |ino: u64| ino <= u64::from(u32::MAX);
        if !narrow(parent) || !entries.iter().all(|(_, ino)| narrow(*ino)) {
            return None;
        }
        let width = 4;
        let ftype = self.geometry.has_ftype;
        let size = 2
            + width
            + entries
                .iter()
                .map(|(name, _)| 3 + name.len() + usize::from(ftype) + width)
                .sum::<usize>();
        if size > room || entries.len() > usize::from(u8::MAX) {
            return None;
        }

        let mut b = Vec::with_capacity(size);
        b.push(entries.len() as u8);
        b.push(0);
        push_ino(&mut b, parent, width);
        let mut offset = data_header_len(self.spec.crc)
            + data_entry_len(1, ftype)
            + data_entry_len(2, ftype);
        for (name, ino) in entries {
            b.push(name.len() as u8);
            b.extend_from_slice(&(offset as u16).to_be_bytes());
            b.extend_from_slice(name);
            if ftype {
                b.push(self.ftype(*ino));
            }
            push_ino(&mut b, *ino, width);
            offset += data_entry_len(name.len(), ftype);
        }
        Some(b)
    }

    // ── Allocation group metadata ───────────────────────────────────────

    /// Write the headers and btree roots of `ag`; returns its free blocks.
    fn write_ag(&self, out: &mut Output, ag: AgNumber) -> Result<u64> {
        let geo = &self.geometry;
        let crc = self.spec.crc;
        let layout = self.layout;
        let length = geo.ag_length(ag);
        let cursor = out.cursors[ag.0 as usize];

        let mut free = Vec::new();
        if ag.0 == 0 && layout.chunk_start > layout.free_start {
            free.push((layout.free_start, layout.chunk_start - layout.free_start));
        }
        if cursor < length {
            free.push((cursor, length - cursor));
        }
        let free_blocks: u32 = free.iter().map(|(_, n)| n).sum();
        let longest = free.iter().map(|(_, n)| *n).max().unwrap_or(0);

        let encode = |recs: &[(u32, u32)]| -> Vec<u8> {
            recs.iter()
                .flat_map(|(start, count)| {
                    let mut r = start.to_be_bytes().to_vec();
                    r.extend_from_slice(&count.to_be_bytes());
                    r
                })
                .collect()
        };
        let by_block = encode(&free);
        let mut by_size = free.clone();
        by_size.sort_by_key(|&(start, count)| (count, start));
        let by_size = encode(&by_size);
        let (bno_magic, cnt_magic, ino_magic) = if crc {
            (XFS_ABTB_CRC_MAGIC, XFS_ABTC_CRC_MAGIC, XFS_IBT_CRC_MAGIC)
        } else {
            (XFS_ABTB_MAGIC, XFS_ABTC_MAGIC, XFS_IBT_MAGIC)
        };
        let bno = self.btree_leaf(bno_magic, ag, layout.bno_root, free.len(), &by_block)?;
        let cnt = self.btree_leaf(cnt_magic, ag, layout.cnt_root, free.len(), &by_size)?;

        let mut inodes = Vec::new();
        let (mut count, mut free_count) = (0_u32, 0_u32);
        if ag.0 == 0 {
            for chunk in 0..self.spec.inode_chunks {
                let mut mask = 0_u64;
                for i in 0..INODES_PER_CHUNK {
                    let ino = self.slot_ino(chunk * INODES_PER_CHUNK + i);
                    if !self.nodes.contains_key(&ino) {
                        mask |= 1 << i;
                    }
                }
                let start = self.first_agino() + chunk * INODES_PER_CHUNK;
                inodes.extend_from_slice(&start.to_be_bytes());
                inodes.extend_from_slice(&mask.count_ones().to_be_bytes());
                inodes.extend_from_slice(&mask.to_be_bytes());
                count += INODES_PER_CHUNK;
                free_count += mask.count_ones();
            }
        }
        let records = if ag.0 == 0 { self.spec.inode_chunks as usize } else { 0 };
        let ino = self.btree_leaf(ino_magic, ag, layout.ino_root, records, &inodes)?;

        for (agbno, block) in [(layout.bno_root, bno), (layout.cnt_root, cnt), (layout.ino_root, ino)] {
            self.write_run(out, geo.make_fsblock(ag, AgBlock(agbno)), &block)?;
        }

        let mut agf = vec![0_u8; SECTOR];
        put_u32(&mut agf, 0, XFS_AGF_MAGIC);
        put_u32(&mut agf, 4, XFS_AGF_VERSION);
        put_u32(&mut agf, 8, ag.0);
        put_u32(&mut agf, 12, length);
        put_u32(&mut agf, 16, layout.bno_root);
        put_u32(&mut agf, 20, layout.cnt_root);
        put_u32(&mut agf, 28, 1);
        put_u32(&mut agf, 32, 1);
        put_u32(&mut agf, 52, free_blocks);
        put_u32(&mut agf, 56, longest);
        if crc {
            agf[64..80].copy_from_slice(&self.spec.uuid);
            update_crc(&mut agf, AGF_CRC_OFFSET)?;
        }

        let mut agi = vec![0_u8; SECTOR];
        put_u32(&mut agi, 0, XFS_AGI_MAGIC);
        put_u32(&mut agi, 4, XFS_AGI_VERSION);
        put_u32(&mut agi, 8, ag.0);
        put_u32(&mut agi, 12, length);
        put_u32(&mut agi, 16, count);
        put_u32(&mut agi, 20, layout.ino_root);
        put_u32(&mut agi, 24, 1);
        put_u32(&mut agi, 28, free_count);
        put_u32(&mut agi, 32, if count > 0 { self.first_agino() } else { NULLAGINO });
        put_u32(&mut agi, 36, NULLAGINO);
        for bucket in 0..XFS_AGI_UNLINKED_BUCKETS {
            put_u32(&mut agi, 40 + bucket * 4, NULLAGINO);
        }
        if crc {
            agi[296..312].copy_from_slice(&self.spec.uuid);
            update_crc(&mut agi, AGI_CRC_OFFSET)?;
        }

        for (sector, bytes) in [(AGF_SECTOR, agf), (AGI_SECTOR, agi)] {
            let offset = geo.ag_sector_offset(ag, sector)?.to_usize()?;
            out.bytes[offset..offset + SECTOR].copy_from_slice(&bytes);
        }
        Ok(u64::from(free_blocks))
    }

    /// A root-only short-format btree block.
    fn btree_leaf(&self, magic: u32, ag: AgNumber, agbno: u32, numrecs: usize, records: &[u8]) -> Result<Vec<u8>> {
        let crc = self.spec.crc;
        let mut b = vec![0_u8; self.geometry.block_size_bytes()];
        let hdr = sblock_len(crc);
        ensure!(
            hdr + records.len() <= b.len(),
            "{numrecs} records overflow a btree leaf"
        );
        put_u32(&mut b, 0, magic);
        put_u16(&mut b, 6, u16::try_from(numrecs)?);
        put_u32(&mut b, 8, NULLAGBLOCK);
        put_u32(&mut b, 12, NULLAGBLOCK);
        b[hdr..hdr + records.len()].copy_from_slice(records);
        if crc {
            put_u64(&mut b, 16, self.ag_daddr(ag, agbno));
            b[32..48].copy_from_slice(&self.spec.uuid);
            put_u32(&mut b, 48, ag.0);
            update_crc(&mut b, SBLOCK_CRC_OFFSET)?;
        }
        Ok(b)
    }
}

fn dir_node(parent: u64) -> Node {
    Node::new(
        S_IFDIR | 0o755,
        Content::Dir {
            entries: Vec::new(),
            parent,
        },
    )
}

fn file_node(data: &[u8]) -> Node {
    Node::new(
        S_IFREG | 0o644,
        Content::File {
            size: data.len() as u64,
            pieces: vec![(0, data.to_vec())],
        },
    )
}

// ── Directory block layout ──────────────────────────────────────────────────

/// Hash index entry: name hash and dataptr.
type IndexEntry = (u32, u32);

struct DataBlock {
    bytes: Vec<u8>,
    cursor: usize,
}

/// Builds the data and index blocks of one block, leaf, or node directory.
struct DirWriter<'b> {
    image: &'b ImageBuilder,
    owner: u64,
    crc: bool,
    ftype: bool,
    size: usize,
}

impl<'b> DirWriter<'b> {
    fn new(image: &'b ImageBuilder, owner: u64) -> Self {
        Self {
            image,
            owner,
            crc: image.spec.crc,
            ftype: image.geometry.has_ftype,
            size: image.geometry.dir_block_size() as usize,
        }
    }

    /// Data blocks and, unless everything fits one block, index blocks
    /// starting at the leaf offset.
    fn lay_out(&self, all: &[(Vec<u8>, u64)]) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let entry_bytes: usize = all.iter().map(|(n, _)| data_entry_len(n.len(), self.ftype)).sum();
        let leaf_bytes = all.len() * XFS_DIR2_LEAF_ENTRY_LEN;
        if data_header_len(self.crc) + entry_bytes + leaf_bytes + XFS_DIR2_BLOCK_TAIL_LEN <= self.size {
            return Ok((vec![self.single_block(all)?], Vec::new()));
        }

        let mut blocks = Vec::new();
        let mut index = Vec::with_capacity(all.len());
        let mut block = self.open_block();
        for (name, ino) in all {
            if block.cursor + data_entry_len(name.len(), self.ftype) > self.size {
                let full = std::mem::replace(&mut block, self.open_block());
                blocks.push(full);
            }
            let offset = self.put_entry(&mut block, name, *ino);
            index.push((da_hashname(name), self.dataptr(blocks.len(), offset)?));
        }
        blocks.push(block);
        let bests: Vec<u16> = blocks
            .iter_mut()
            .map(|b| self.close_block(b, self.size))
            .collect();
        let data: Vec<Vec<u8>> = blocks
            .into_iter()
            .map(|b| self.seal_data(b, data_magic(self.crc)))
            .collect();
        index.sort_by_key(|e| e.0);

        let leaf1_room = (self.size - LeafHeader::len(self.crc) - 4 - 2 * bests.len()) / XFS_DIR2_LEAF_ENTRY_LEN;
        let index_blocks = if index.len() <= leaf1_room {
            vec![self.leaf1(&index, &bests)?]
        } else {
            self.node_tree(&index)?
        };
        Ok((data, index_blocks))
    }

    fn single_block(&self, all: &[(Vec<u8>, u64)]) -> Result<Vec<u8>> {
        let leaf_start = self.size - XFS_DIR2_BLOCK_TAIL_LEN - all.len() * XFS_DIR2_LEAF_ENTRY_LEN;
        let mut block = self.open_block();
        let mut index = Vec::with_capacity(all.len());
        for (name, ino) in all {
            let offset = self.put_entry(&mut block, name, *ino);
            index.push((da_hashname(name), self.dataptr(0, offset)?));
        }
        self.close_block(&mut block, leaf_start);
        index.sort_by_key(|e| e.0);
        write_index(&mut block.bytes, leaf_start, &index);
        let tail = self.size - XFS_DIR2_BLOCK_TAIL_LEN;
        put_u32(&mut block.bytes, tail, u32::try_from(all.len())?);
        Ok(self.seal_data(block, block_magic(self.crc)))
    }

    fn open_block(&self) -> DataBlock {
        DataBlock {
            bytes: vec![0_u8; self.size],
            cursor: data_header_len(self.crc),
        }
    }

    fn put_entry(&self, block: &mut DataBlock, name: &[u8], ino: u64) -> usize {
        let off = block.cursor;
        let len = data_entry_len(name.len(), self.ftype);
        let b = &mut block.bytes;
        put_u64(b, off, ino);
        b[off + 8] = name.len() as u8;
        b[off + 9..off + 9 + name.len()].copy_from_slice(name);
        if self.ftype {
            b[off + 9 + name.len()] = self.image.ftype(ino);
        }
        put_u16(b, off + len - 2, off as u16);
        block.cursor += len;
        off
    }

    /// Cover `[cursor, end)` with one unused region and record it as the
    /// block's best free region. Returns its length.
    fn close_block(&self, block: &mut DataBlock, end: usize) -> u16 {
        let off = block.cursor;
        if off >= end {
            return 0;
        }
        let len = (end - off) as u16;
        let b = &mut block.bytes;
        put_u16(b, off, XFS_DIR2_DATA_FREE_TAG);
        put_u16(b, off + 2, len);
        put_u16(b, end - 2, off as u16);
        let best = if self.crc { 48 } else { 4 };
        put_u16(b, best, off as u16);
        put_u16(b, best + 2, len);
        block.cursor = end;
        len
    }

    fn seal_data(&self, block: DataBlock, magic: u32) -> Vec<u8> {
        let mut b = block.bytes;
        put_u32(&mut b, 0, magic);
        if self.crc {
            b[DIR3_DATA_UUID..DIR3_DATA_UUID + 16].copy_from_slice(&self.image.spec.uuid);
            put_u64(&mut b, DIR3_DATA_OWNER, self.owner);
        }
        b
    }

    fn dataptr(&self, block: usize, offset: usize) -> Result<u32> {
        let byte = block as u64 * self.size as u64 + offset as u64;
        u32::try_from(byte / 8).context("directory address exceeds 32 bits")
    }

    /// An empty DA block with sibling links and magic.
    fn da_block(&self, magic: u16, forw: u32, back: u32) -> Vec<u8> {
        let mut b = vec![0_u8; self.size];
        put_u32(&mut b, 0, forw);
        put_u32(&mut b, 4, back);
        put_u16(&mut b, 8, magic);
        if self.crc {
            b[DA3_UUID..DA3_UUID + 16].copy_from_slice(&self.image.spec.uuid);
            put_u64(&mut b, DA3_OWNER, self.owner);
        }
        b
    }

    fn leaf(&self, magic: u16, forw: u32, back: u32, index: &[IndexEntry]) -> Result<Vec<u8>> {
        let mut b = self.da_block(magic, forw, back);
        put_u16(&mut b, DaBlkInfo::len(self.crc), u16::try_from(index.len())?);
        write_index(&mut b, LeafHeader::len(self.crc), index);
        Ok(b)
    }

    fn leaf1(&self, index: &[IndexEntry], bests: &[u16]) -> Result<Vec<u8>> {
        let mut b = self.leaf(leaf1_magic(self.crc), 0, 0, index)?;
        let tail = self.size - 4;
        put_u32(&mut b, tail, u32::try_from(bests.len())?);
        let start = tail - 2 * bests.len();
        for (i, best) in bests.iter().enumerate() {
            put_u16(&mut b, start + 2 * i, *best);
        }
        Ok(b)
    }

    /// Leafn blocks under a DA tree whose root sits at the leaf offset.
    /// Returned blocks are in fork order starting with the root.
    fn node_tree(&self, index: &[IndexEntry]) -> Result<Vec<Vec<u8>>> {
        let geo = &self.image.geometry;
        let fsbs = geo.dir_block_fsbs();
        let leaf_block = geo.dir_leaf_block().0;
        let crc = self.crc;
        let leaf_room = (self.size - LeafHeader::len(crc)) / XFS_DIR2_LEAF_ENTRY_LEN;
        let node_room = (self.size - DaNodeHeader::len(crc)) / XFS_DIR2_LEAF_ENTRY_LEN;
        let fork_block = |slot: usize| -> Result<u32> {
            u32::try_from(leaf_block + slot as u64 * fsbs).context("directory block exceeds 32 bits")
        };

        // Slot 0 is the root; everything else is appended in level order.
        let mut blocks: Vec<Vec<u8>> = vec![Vec::new()];
        let groups = split_runs(index, leaf_room);
        let first = blocks.len();
        let mut level: Vec<(u32, u32)> = Vec::with_capacity(groups.len());
        for (i, group) in groups.iter().enumerate() {
            let back = if i == 0 { 0 } else { fork_block(first + i - 1)? };
            let forw = if i + 1 == groups.len() { 0 } else { fork_block(first + i + 1)? };
            blocks.push(self.leaf(leafn_magic(crc), forw, back, group)?);
            let high = group.last().map_or(0, |e| e.0);
            level.push((high, fork_block(first + i)?));
        }

        let mut height = 1_u16;
        while level.len() > node_room {
            let first = blocks.len();
            let chunks: Vec<&[(u32, u32)]> = level.chunks(node_room).collect();
            let mut next = Vec::with_capacity(chunks.len());
            for (i, chunk) in chunks.iter().enumerate() {
                let back = if i == 0 { 0 } else { fork_block(first + i - 1)? };
                let forw = if i + 1 == chunks.len() { 0 } else { fork_block(first + i + 1)? };
                blocks.push(self.node(forw, back, height, chunk)?);
                let high = chunk.last().map_or(0, |e| e.0);
                next.push((high, fork_block(first + i)?));
            }
            level = next;
            height += 1;
            ensure!(height <= 5, "directory hash tree deeper than five levels");
        }
        blocks[0] = self.node(0, 0, height, &level)?;
        Ok(blocks)
    }

    fn node(&self, forw: u32, back: u32, height: u16, children: &[(u32, u32)]) -> Result<Vec<u8>> {
        let mut b = self.da_block(DaNodeHeader::magic(self.crc), forw, back);
        let base = DaBlkInfo::len(self.crc);
        put_u16(&mut b, base, u16::try_from(children.len())?);
        put_u16(&mut b, base + 2, height);
        write_index(&mut b, DaNodeHeader::len(self.crc), children);
        Ok(b)
    }
}

/// Split a hash-sorted index into leaf-sized groups, keeping runs of
/// equal hashes together when a run fits in one leaf.
fn split_runs(index: &[IndexEntry], room: usize) -> Vec<&[IndexEntry]> {
    let mut groups = Vec::new();
    let mut start = 0;
    while start < index.len() {
        let mut end = (start + room).min(index.len());
        if end < index.len() {
            let mut cut = end;
            while cut > start + 1 && index[cut].0 == index[cut - 1].0 {
                cut -= 1;
            }
            if index[cut].0 != index[cut - 1].0 {
                end = cut;
            }
        }
        groups.push(&index[start..end]);
        start = end;
    }
    groups
}

fn write_index(block: &mut [u8], start: usize, index: &[(u32, u32)]) {
    for (i, (hash, value)) in index.iter().enumerate() {
        let off = start + i * 8;
        put_u32(block, off, *hash);
        put_u32(block, off + 4, *value);
    }
}

// ── Encoders ────────────────────────────────────────────────────────────────

fn shortform_attrs(attrs: &[(AttrNamespace, Vec<u8>, Vec<u8>)]) -> Result<Option<Vec<u8>>> {
    if attrs.is_empty() {
        return Ok(None);
    }
    let mut b = vec![0_u8; 4];
    for (namespace, name, value) in attrs {
        b.push(name.len() as u8);
        b.push(value.len() as u8);
        b.push(namespace.to_flags());
        b.extend_from_slice(name);
        b.extend_from_slice(value);
    }
    let total = u16::try_from(b.len()).context("shortform attributes exceed 64 KiB")?;
    put_u16(&mut b, 0, total);
    b[2] = u8::try_from(attrs.len()).context("more than 255 shortform attributes")?;
    Ok(Some(b))
}

fn encode_superblock(spec: &ImageSpec, root: u64, counters: Counters) -> Result<Vec<u8>> {
    let bs = spec.block_size;
    let inopb = bs / spec.inode_size;
    let mut b = vec![0_u8; SECTOR];
    put_u32(&mut b, 0, XFS_SB_MAGIC);
    put_u32(&mut b, 4, bs);
    put_u64(&mut b, 8, u64::from(spec.ag_blocks) * u64::from(spec.ag_count));
    b[32..48].copy_from_slice(&spec.uuid);
    put_u64(&mut b, 56, root);
    put_u32(&mut b, 80, 1);
    put_u32(&mut b, 84, spec.ag_blocks);
    put_u32(&mut b, 88, spec.ag_count);

    let flags = XfsVersionFlags::ATTR.bits()
        | XfsVersionFlags::NLINK.bits()
        | XfsVersionFlags::ALIGN.bits()
        | XfsVersionFlags::LOGV2.bits()
        | XfsVersionFlags::EXTFLG.bits()
        | XfsVersionFlags::DIRV2.bits()
        | XfsVersionFlags::MOREBITS.bits();
    let version = if spec.crc { 5 } else { 4 };
    put_u16(&mut b, 100, u16::try_from(flags | version)?);
    put_u16(&mut b, 102, SECTOR as u16);
    put_u16(&mut b, 104, u16::try_from(spec.inode_size)?);
    put_u16(&mut b, 106, u16::try_from(inopb)?);
    b[108..108 + spec.label.len()].copy_from_slice(spec.label.as_bytes());
    b[120] = bs.trailing_zeros() as u8;
    b[121] = SECTOR.trailing_zeros() as u8;
    b[122] = spec.inode_size.trailing_zeros() as u8;
    b[123] = inopb.trailing_zeros() as u8;
    b[124] = u8::try_from(log2_roundup(u64::from(spec.ag_blocks)))?;
    b[127] = 25;
    put_u64(&mut b, 128, counters.inodes);
    put_u64(&mut b, 136, counters.free_inodes);
    put_u64(&mut b, 144, counters.free_blocks);
    put_u32(&mut b, 180, spec.inode_size * INODES_PER_CHUNK / bs);
    b[192] = spec.dir_block_log;
    b[193] = SECTOR.trailing_zeros() as u8;
    put_u16(&mut b, 194, SECTOR as u16);
    put_u32(&mut b, 196, 1);

    let mut features2 = XfsFeatures2::LAZYSBCOUNT.bits()
        | XfsFeatures2::ATTR2.bits()
        | XfsFeatures2::PROJID32.bits();
    if spec.crc {
        features2 |= XfsFeatures2::CRC.bits();
    }
    put_u32(&mut b, 200, features2);
    put_u32(&mut b, 204, features2);
    if spec.crc {
        put_u32(&mut b, 216, XfsIncompatFeatures::FTYPE.bits());
        update_crc(&mut b, SB_CRC_OFFSET)?;
    }
    Ok(b)
}

fn sblock_len(crc: bool) -> usize {
    if crc {
        XFS_BTREE_SBLOCK_CRC_LEN
    } else {
        XFS_BTREE_SBLOCK_LEN
    }
}

fn push_ino(buf: &mut Vec<u8>, ino: u64, width: usize) {
    if width == 8 {
        buf.extend_from_slice(&ino.to_be_bytes());
    } else {
        buf.extend_from_slice(&(ino as u32).to_be_bytes());
    }
}

fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_be_bytes());
}
