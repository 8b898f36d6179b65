#![forbid(unsafe_code)]
//! Generic read-only B+tree engine.
//!
//! XFS stores free space (by block and by size), inode chunks, reverse
//! mappings, reference counts, file extent maps, and the directory and
//! attribute hash indexes in btrees that share one shape: interior nodes
//! hold sorted `(key, child pointer)` arrays, leaves hold sorted records,
//! and every node on a level links to its left and right siblings.
//!
//! The engine is parameterized by a [`BtreeShape`] that knows how to locate
//! the arrays inside a node and decode keys, pointers, and records. Node
//! bytes come from a [`NodeReader`], which maps a child pointer to storage
//! (AG-relative block, packed filesystem block, or fork-relative directory
//! block).
//!
//! Traversals are lazy. A [`Traversal`] holds exactly one leaf at a time and
//! decodes one record per pull. Every traversal tracks the pointers it has
//! visited, checks that each child sits one level below its parent, and
//! checks that keys never go backwards, so a damaged tree surfaces as
//! `CorruptFilesystem` instead of a hang or an out-of-bounds read.

pub mod shapes;

use std::collections::HashSet;
use std::fmt::Debug;
use tracing::{error, trace, warn};
use xfs_error::{Result, XfsError};
use xfs_ondisk::ChecksumPolicy;
use xfs_types::{ParseError, ensure_slice};

pub use shapes::{
    AttrHashIndex, DirHashIndex, ExtentMap, FreeSpaceByBlock, FreeSpaceBySize, InodeIndex,
    RefCount, ReverseMap,
};

/// Deepest tree the engine will descend. XFS never builds more than nine
/// levels for any btree; anything deeper is corrupt.
pub const MAX_LEVELS: u16 = 16;

// ── Shape descriptor ────────────────────────────────────────────────────────

/// How interior keys partition the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRule {
    /// Each key is the lowest key in its subtree (AG and extent map trees).
    /// Descend into the child with the greatest key not above the target.
    LowKey,
    /// Each key is the highest hash in its subtree (directory and attribute
    /// hash indexes). Descend into the first child whose key is not below
    /// the target.
    HighKey,
}

/// Fixed-stride array inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slots {
    pub start: usize,
    pub stride: usize,
    pub len: usize,
}

impl Slots {
    #[must_use]
    pub fn new(start: usize, stride: usize, len: usize) -> Self {
        Self { start, stride, len }
    }

    /// Bytes of slot `index`.
    pub fn get<'b>(&self, node: &'b [u8], index: usize) -> std::result::Result<&'b [u8], ParseError> {
        let offset = index
            .checked_mul(self.stride)
            .and_then(|o| o.checked_add(self.start))
            .ok_or(ParseError::IntegerConversion { field: "slot_offset" })?;
        ensure_slice(node, offset, self.len)
    }
}

/// Where a decoded node keeps its arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    /// 0 for leaves.
    pub level: u16,
    pub numrecs: usize,
    /// Slots the node has room for; `numrecs` above this is corruption.
    pub capacity: usize,
    pub left: Option<u64>,
    pub right: Option<u64>,
    /// Leaf records (level 0 only).
    pub records: Slots,
    /// Interior keys (level > 0 only).
    pub keys: Slots,
    /// Interior child pointers (level > 0 only).
    pub ptrs: Slots,
}

impl NodeLayout {
    /// Reject a declared record count larger than the node can hold.
    pub fn check_capacity(self, field: &'static str) -> std::result::Result<Self, ParseError> {
        if self.numrecs > self.capacity {
            return Err(ParseError::InvalidField {
                field,
                reason: "record count exceeds node capacity",
            });
        }
        Ok(self)
    }
}

/// Per-tree knowledge the engine needs: node layout, key order, record decoding.
pub trait BtreeShape {
    type Key: Ord + Copy + Debug;
    type Record: Debug;

    /// Human-readable tree name for diagnostics.
    fn name(&self) -> &'static str;

    fn key_rule(&self) -> KeyRule {
        KeyRule::LowKey
    }

    /// Validate a node's signature and locate its arrays.
    fn parse_node(&self, node: &[u8]) -> std::result::Result<NodeLayout, ParseError>;

    /// Locate the arrays of a root embedded in an inode fork.
    fn parse_inline_root(&self, _root: &[u8]) -> std::result::Result<NodeLayout, ParseError> {
        Err(ParseError::InvalidField {
            field: "btree_root",
            reason: "this tree has no inline root form",
        })
    }

    fn decode_key(&self, raw: &[u8]) -> std::result::Result<Self::Key, ParseError>;
    fn decode_ptr(&self, raw: &[u8]) -> std::result::Result<u64, ParseError>;
    fn decode_record(&self, raw: &[u8]) -> std::result::Result<Self::Record, ParseError>;
    fn record_key(&self, record: &Self::Record) -> Self::Key;

    /// Offset of the node checksum, when the volume has one.
    fn crc_offset(&self) -> Option<usize>;
}

// ── Storage access ──────────────────────────────────────────────────────────

/// Maps child pointers to node bytes.
pub trait NodeReader {
    /// Read the node `ptr` refers to. Pointers outside the tree's address
    /// range must be rejected with `CorruptFilesystem`.
    fn read_node(&self, ptr: u64) -> Result<Vec<u8>>;

    /// Linear filesystem block of `ptr`, for diagnostics.
    fn node_address(&self, ptr: u64) -> u64;
}

impl<T: NodeReader + ?Sized> NodeReader for &T {
    fn read_node(&self, ptr: u64) -> Result<Vec<u8>> {
        (**self).read_node(ptr)
    }

    fn node_address(&self, ptr: u64) -> u64 {
        (**self).node_address(ptr)
    }
}

/// Where a tree's root lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtreeRoot {
    /// Root is a node addressed like any child.
    Block(u64),
    /// Root is embedded in an inode fork.
    Inline(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

// ── Error helpers ───────────────────────────────────────────────────────────

/// Attach a block number to a parse failure.
#[must_use]
pub fn corrupt_at(block: u64, err: &ParseError) -> XfsError {
    XfsError::CorruptFilesystem {
        block,
        detail: err.to_string(),
    }
}

/// Apply the checksum policy to a metadata buffer.
///
/// `Warn` logs and continues, `Strict` fails, `Ignore` skips the computation.
pub fn enforce_checksum(
    policy: ChecksumPolicy,
    what: &str,
    block: u64,
    buf: &[u8],
    crc_offset: usize,
) -> Result<()> {
    if !policy.verifies() {
        return Ok(());
    }
    match xfs_ondisk::verify_crc(buf, crc_offset) {
        Ok(()) => Ok(()),
        Err(err) => match policy {
            ChecksumPolicy::Strict => {
                error!(target: "xfs::checksum", block, what, "checksum_mismatch");
                Err(XfsError::corrupt(block, format!("{what}: {err}")))
            }
            _ => {
                warn!(target: "xfs::checksum", block, what, "checksum_mismatch");
                Ok(())
            }
        },
    }
}

/// Binary search over `0..len`; returns the first index where `pred` is
/// false, assuming `pred` is true then false.
fn partition(len: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

// ── Nodes ───────────────────────────────────────────────────────────────────

/// A node held by a traversal.
#[derive(Debug, Clone)]
pub struct Node {
    /// Pointer the node was reached through; `None` for an inline root.
    pub ptr: Option<u64>,
    /// Linear block for diagnostics.
    pub address: u64,
    pub bytes: Vec<u8>,
    pub layout: NodeLayout,
}

impl Node {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.layout.level == 0
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// A shape bound to its storage.
///
/// Readers are small handles (a reference, or a volume reference plus an AG
/// index) so traversals can carry their own copy.
#[derive(Clone)]
pub struct Btree<S, R> {
    shape: S,
    reader: R,
    checksums: ChecksumPolicy,
}

impl<S: Debug, R> Debug for Btree<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("shape", &self.shape)
            .field("checksums", &self.checksums)
            .finish_non_exhaustive()
    }
}

/// What a descent is looking for.
#[derive(Clone, Copy)]
enum Target<K> {
    Edge(Direction),
    Key(K),
}

impl<S: BtreeShape + Clone, R: NodeReader + Clone> Btree<S, R> {
    pub fn new(shape: S, reader: R, checksums: ChecksumPolicy) -> Self {
        Self {
            shape,
            reader,
            checksums,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &S {
        &self.shape
    }

    /// Every leaf record, in key order (`Forward`) or reverse key order.
    #[must_use]
    pub fn traverse(&self, root: &BtreeRoot, direction: Direction) -> Traversal<S, R> {
        Traversal::new(self.clone(), root.clone(), Target::Edge(direction), direction)
    }

    /// Records from the position `key` selects, moving forward.
    ///
    /// Under [`KeyRule::LowKey`] the first record yielded is the last one
    /// whose key is not above `key` (or the first record of the tree if all
    /// keys are above it). Under [`KeyRule::HighKey`] it is the first record
    /// whose key is not below `key`.
    #[must_use]
    pub fn range_from(&self, root: &BtreeRoot, key: S::Key) -> Traversal<S, R> {
        Traversal::new(self.clone(), root.clone(), Target::Key(key), Direction::Forward)
    }

    /// The record whose key equals `key`, if any.
    pub fn lookup(&self, root: &BtreeRoot, key: S::Key) -> Result<Option<S::Record>> {
        for record in self.range_from(root, key) {
            let record = record?;
            match self.shape.record_key(&record).cmp(&key) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => return Ok(Some(record)),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Every leaf node, in sibling order. Callers that need more than the
    /// record (names stored elsewhere in the leaf) decode from the bytes.
    #[must_use]
    pub fn leaves(&self, root: &BtreeRoot, direction: Direction) -> LeafWalk<S, R> {
        LeafWalk {
            traversal: Traversal::new(self.clone(), root.clone(), Target::Edge(direction), direction),
        }
    }

    fn fail(&self, block: u64, detail: String) -> XfsError {
        error!(
            tree = self.shape.name(),
            block,
            detail = %detail,
            "btree_invariant_violation"
        );
        XfsError::corrupt(block, detail)
    }

    fn parse_failure(&self, block: u64, err: &ParseError) -> XfsError {
        self.fail(block, format!("{} node: {err}", self.shape.name()))
    }

    fn load_root(&self, root: &BtreeRoot, visited: &mut HashSet<u64>) -> Result<Node> {
        match root {
            BtreeRoot::Block(ptr) => self.load(*ptr, visited),
            BtreeRoot::Inline(bytes) => {
                let layout = self
                    .shape
                    .parse_inline_root(bytes)
                    .map_err(|e| self.parse_failure(0, &e))?;
                if layout.level > MAX_LEVELS {
                    return Err(self.fail(0, format!("inline root level {} too deep", layout.level)));
                }
                Ok(Node {
                    ptr: None,
                    address: 0,
                    bytes: bytes.clone(),
                    layout,
                })
            }
        }
    }

    fn load(&self, ptr: u64, visited: &mut HashSet<u64>) -> Result<Node> {
        let address = self.reader.node_address(ptr);
        if !visited.insert(ptr) {
            return Err(self.fail(
                address,
                format!("{} cycle: node {ptr} reached twice", self.shape.name()),
            ));
        }
        let bytes = self.reader.read_node(ptr)?;
        if let Some(off) = self.shape.crc_offset() {
            enforce_checksum(self.checksums, self.shape.name(), address, &bytes, off)?;
        }
        let layout = self
            .shape
            .parse_node(&bytes)
            .map_err(|e| self.parse_failure(address, &e))?;
        if layout.level > MAX_LEVELS {
            return Err(self.fail(address, format!("node level {} too deep", layout.level)));
        }
        trace!(
            tree = self.shape.name(),
            ptr,
            address,
            level = layout.level,
            numrecs = layout.numrecs,
            "btree_node"
        );
        Ok(Node {
            ptr: Some(ptr),
            address,
            bytes,
            layout,
        })
    }

    fn key_at(&self, node: &Node, index: usize) -> Result<S::Key> {
        node.layout
            .keys
            .get(&node.bytes, index)
            .and_then(|raw| self.shape.decode_key(raw))
            .map_err(|e| self.parse_failure(node.address, &e))
    }

    fn ptr_at(&self, node: &Node, index: usize) -> Result<u64> {
        node.layout
            .ptrs
            .get(&node.bytes, index)
            .and_then(|raw| self.shape.decode_ptr(raw))
            .map_err(|e| self.parse_failure(node.address, &e))
    }

    fn record_at(&self, node: &Node, index: usize) -> Result<S::Record> {
        node.layout
            .records
            .get(&node.bytes, index)
            .and_then(|raw| self.shape.decode_record(raw))
            .map_err(|e| self.parse_failure(node.address, &e))
    }

    /// Partition predicate: `true` while `k` sorts before the search position.
    fn before_target(&self, k: S::Key, key: S::Key) -> bool {
        match self.shape.key_rule() {
            KeyRule::LowKey => k <= key,
            KeyRule::HighKey => k < key,
        }
    }

    /// Pick the child of an interior node.
    fn child_index(&self, node: &Node, target: Target<S::Key>) -> Result<usize> {
        let n = node.layout.numrecs;
        if n == 0 {
            return Err(self.fail(
                node.address,
                format!("{} interior node has no entries", self.shape.name()),
            ));
        }
        match target {
            Target::Edge(Direction::Forward) => Ok(0),
            Target::Edge(Direction::Backward) => Ok(n - 1),
            Target::Key(key) => {
                let mut failure = None;
                let pos = partition(n, |i| match self.key_at(node, i) {
                    Ok(k) => self.before_target(k, key),
                    Err(e) => {
                        failure = Some(e);
                        false
                    }
                });
                if let Some(e) = failure {
                    return Err(e);
                }
                Ok(match self.shape.key_rule() {
                    KeyRule::LowKey => pos.saturating_sub(1),
                    KeyRule::HighKey => pos.min(n - 1),
                })
            }
        }
    }

    /// First record index to yield from a leaf.
    fn leaf_start(&self, node: &Node, key: S::Key) -> Result<usize> {
        let mut failure = None;
        let pos = partition(node.layout.numrecs, |i| match self.record_at(node, i) {
            Ok(rec) => self.before_target(self.shape.record_key(&rec), key),
            Err(e) => {
                failure = Some(e);
                false
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(match self.shape.key_rule() {
            KeyRule::LowKey => pos.saturating_sub(1),
            KeyRule::HighKey => pos,
        })
    }

    /// Descend from `node` to the leaf `target` selects.
    fn descend(
        &self,
        mut node: Node,
        target: Target<S::Key>,
        visited: &mut HashSet<u64>,
    ) -> Result<Node> {
        while node.layout.level > 0 {
            let index = self.child_index(&node, target)?;
            let child_ptr = self.ptr_at(&node, index)?;
            let child = self.load(child_ptr, visited)?;
            if child.layout.level + 1 != node.layout.level {
                return Err(self.fail(
                    child.address,
                    format!(
                        "{} level mismatch: expected {}, got {}",
                        self.shape.name(),
                        node.layout.level - 1,
                        child.layout.level
                    ),
                ));
            }
            node = child;
        }
        Ok(node)
    }
}

// ── Traversal ───────────────────────────────────────────────────────────────

struct LeafCursor {
    node: Node,
    /// Next index to yield moving forward.
    front: usize,
    /// One past the next index to yield moving backward.
    back: usize,
}

enum State<K> {
    Start(BtreeRoot, Target<K>),
    Leaf(LeafCursor),
    Done,
}

/// Lazy sequence of leaf records.
///
/// Holds one leaf at a time. After an error the sequence ends.
pub struct Traversal<S: BtreeShape, R> {
    tree: Btree<S, R>,
    direction: Direction,
    state: State<S::Key>,
    visited: HashSet<u64>,
    last_key: Option<S::Key>,
}

impl<S: BtreeShape + Clone, R: NodeReader + Clone> Traversal<S, R> {
    fn new(tree: Btree<S, R>, root: BtreeRoot, target: Target<S::Key>, direction: Direction) -> Self {
        Self {
            tree,
            direction,
            state: State::Start(root, target),
            visited: HashSet::new(),
            last_key: None,
        }
    }

    /// The leaf the most recently yielded record came from.
    #[must_use]
    pub fn current_leaf(&self) -> Option<&Node> {
        match &self.state {
            State::Leaf(cursor) => Some(&cursor.node),
            _ => None,
        }
    }

    fn begin(&mut self, root: &BtreeRoot, target: Target<S::Key>) -> Result<LeafCursor> {
        let root_node = self.tree.load_root(root, &mut self.visited)?;
        let leaf = self.tree.descend(root_node, target, &mut self.visited)?;
        let n = leaf.layout.numrecs;
        let front = match target {
            Target::Key(key) => self.tree.leaf_start(&leaf, key)?,
            _ => 0,
        };
        Ok(LeafCursor {
            node: leaf,
            front,
            back: n,
        })
    }

    fn sibling(&mut self, cursor: &LeafCursor) -> Result<Option<LeafCursor>> {
        let next = match self.direction {
            Direction::Forward => cursor.node.layout.right,
            Direction::Backward => cursor.node.layout.left,
        };
        let Some(ptr) = next else {
            return Ok(None);
        };
        if cursor.node.ptr.is_none() {
            return Err(self.tree.fail(
                cursor.node.address,
                format!("{} inline root leaf has a sibling", self.tree.shape.name()),
            ));
        }
        let node = self.tree.load(ptr, &mut self.visited)?;
        if node.layout.level != 0 {
            return Err(self.tree.fail(
                node.address,
                format!(
                    "{} sibling of a leaf is at level {}",
                    self.tree.shape.name(),
                    node.layout.level
                ),
            ));
        }
        let n = node.layout.numrecs;
        Ok(Some(LeafCursor {
            node,
            front: 0,
            back: n,
        }))
    }

    fn step(&mut self) -> Result<Option<S::Record>> {
        loop {
            match std::mem::replace(&mut self.state, State::Done) {
                State::Done => return Ok(None),
                State::Start(root, target) => {
                    let cursor = self.begin(&root, target)?;
                    self.state = State::Leaf(cursor);
                }
                State::Leaf(mut cursor) => {
                    let index = match self.direction {
                        Direction::Forward if cursor.front < cursor.back => {
                            cursor.front += 1;
                            Some(cursor.front - 1)
                        }
                        Direction::Backward if cursor.front < cursor.back => {
                            cursor.back -= 1;
                            Some(cursor.back)
                        }
                        _ => None,
                    };
                    match index {
                        Some(i) => {
                            let record = self.tree.record_at(&cursor.node, i)?;
                            let key = self.tree.shape.record_key(&record);
                            self.check_order(&cursor.node, key)?;
                            self.state = State::Leaf(cursor);
                            return Ok(Some(record));
                        }
                        None => match self.sibling(&cursor)? {
                            Some(next) => self.state = State::Leaf(next),
                            None => return Ok(None),
                        },
                    }
                }
            }
        }
    }

    fn check_order(&mut self, node: &Node, key: S::Key) -> Result<()> {
        if let Some(prev) = self.last_key {
            let backwards = match self.direction {
                Direction::Forward => key < prev,
                Direction::Backward => key > prev,
            };
            if backwards {
                return Err(self.tree.fail(
                    node.address,
                    format!(
                        "{} keys out of order: {key:?} after {prev:?}",
                        self.tree.shape.name()
                    ),
                ));
            }
        }
        self.last_key = Some(key);
        Ok(())
    }

    fn step_leaf(&mut self) -> Result<Option<Node>> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Done => Ok(None),
            State::Start(root, target) => {
                let cursor = self.begin(&root, target)?;
                let node = cursor.node.clone();
                self.state = State::Leaf(cursor);
                Ok(Some(node))
            }
            State::Leaf(cursor) => match self.sibling(&cursor)? {
                Some(next) => {
                    let node = next.node.clone();
                    self.state = State::Leaf(next);
                    Ok(Some(node))
                }
                None => Ok(None),
            },
        }
    }
}

impl<S: BtreeShape + Clone, R: NodeReader + Clone> Iterator for Traversal<S, R> {
    type Item = Result<S::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.state = State::Done;
                Some(Err(err))
            }
        }
    }
}

/// Lazy sequence of leaf nodes.
pub struct LeafWalk<S: BtreeShape, R> {
    traversal: Traversal<S, R>,
}

impl<S: BtreeShape + Clone, R: NodeReader + Clone> Iterator for LeafWalk<S, R> {
    type Item = Result<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.traversal.step_leaf() {
            Ok(Some(node)) => Some(Ok(node)),
            Ok(None) => None,
            Err(err) => {
                self.traversal.state = State::Done;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use xfs_ondisk::btree::{ExtentRecord, XFS_ABTB_CRC_MAGIC, XFS_ABTB_MAGIC, XFS_BMAP_MAGIC};
    use xfs_ondisk::checksum::{SBLOCK_CRC_OFFSET, update_crc};
    use xfs_ondisk::da::XFS_DA_NODE_MAGIC;
    use xfs_ondisk::dir2::XFS_DIR2_LEAFN_MAGIC;
    use xfs_types::{FsBlock, NULLAGBLOCK, NULLFSBLOCK};

    const NODE: usize = 128;

    // ── In-memory storage ───────────────────────────────────────────────────────

    #[derive(Default)]
    struct MemReader {
        nodes: HashMap<u64, Vec<u8>>,
    }

    impl NodeReader for MemReader {
        fn read_node(&self, ptr: u64) -> Result<Vec<u8>> {
            self.nodes
                .get(&ptr)
                .cloned()
                .ok_or_else(|| XfsError::corrupt(ptr, "pointer outside test tree"))
        }

        fn node_address(&self, ptr: u64) -> u64 {
            ptr
        }
    }

    fn put_u16(b: &mut [u8], off: usize, v: u16) {
        b[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn put_u32(b: &mut [u8], off: usize, v: u32) {
        b[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn put_u64(b: &mut [u8], off: usize, v: u64) {
        b[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }

    fn sib(v: Option<u32>) -> u32 {
        v.unwrap_or(NULLAGBLOCK)
    }

    /// v4 bnobt leaf.
    fn bno_leaf(recs: &[(u32, u32)], left: Option<u32>, right: Option<u32>) -> Vec<u8> {
        let mut b = vec![0_u8; NODE];
        put_u32(&mut b, 0, XFS_ABTB_MAGIC);
        put_u16(&mut b, 6, recs.len() as u16);
        put_u32(&mut b, 8, sib(left));
        put_u32(&mut b, 12, sib(right));
        for (i, (start, count)) in recs.iter().enumerate() {
            put_u32(&mut b, 16 + i * 8, *start);
            put_u32(&mut b, 20 + i * 8, *count);
        }
        b
    }

    /// v4 bnobt interior node; keys are 8 bytes (start, count), pointers 4.
    fn bno_node(level: u16, children: &[(u32, u32)]) -> Vec<u8> {
        let mut b = vec![0_u8; NODE];
        put_u32(&mut b, 0, XFS_ABTB_MAGIC);
        put_u16(&mut b, 4, level);
        put_u16(&mut b, 6, children.len() as u16);
        put_u32(&mut b, 8, NULLAGBLOCK);
        put_u32(&mut b, 12, NULLAGBLOCK);
        let capacity = (NODE - 16) / 12;
        for (i, (key, ptr)) in children.iter().enumerate() {
            put_u32(&mut b, 16 + i * 8, *key);
            put_u32(&mut b, 16 + capacity * 8 + i * 4, *ptr);
        }
        b
    }

    /// Two-level bnobt: root at 1, leaves from 10 with `per_leaf` records each.
    fn build_bnobt(recs: &[(u32, u32)], per_leaf: usize) -> MemReader {
        let mut reader = MemReader::default();
        let chunks: Vec<&[(u32, u32)]> = recs.chunks(per_leaf).collect();
        let mut children = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let ptr = 10 + i as u32;
            let left = (i > 0).then(|| ptr - 1);
            let right = (i + 1 < chunks.len()).then(|| ptr + 1);
            reader.nodes.insert(u64::from(ptr), bno_leaf(chunk, left, right));
            children.push((chunk[0].0, ptr));
        }
        reader.nodes.insert(1, bno_node(1, &children));
        reader
    }

    fn bno_tree(reader: &MemReader) -> Btree<FreeSpaceByBlock, &MemReader> {
        Btree::new(FreeSpaceByBlock { crc: false }, reader, ChecksumPolicy::Warn)
    }

    fn starts<I: Iterator<Item = Result<xfs_ondisk::AllocRec>>>(it: I) -> Vec<u32> {
        it.map(|r| r.unwrap().start_block).collect()
    }

    fn sample_records() -> Vec<(u32, u32)> {
        (0..20).map(|i| (i * 10 + 5, i + 1)).collect()
    }

    // ── Traversal ───────────────────────────────────────────────────────────────

    #[test]
    fn traverse_visits_every_record_once_in_both_directions() {
        let recs = sample_records();
        let reader = build_bnobt(&recs, 6);
        let tree = bno_tree(&reader);
        let root = BtreeRoot::Block(1);

        let forward = starts(tree.traverse(&root, Direction::Forward));
        let expected: Vec<u32> = recs.iter().map(|r| r.0).collect();
        assert_eq!(forward, expected);

        let mut backward = starts(tree.traverse(&root, Direction::Backward));
        backward.reverse();
        assert_eq!(backward, expected);
    }

    #[test]
    fn empty_root_leaf_yields_nothing() {
        let mut reader = MemReader::default();
        reader.nodes.insert(7, bno_leaf(&[], None, None));
        let tree = bno_tree(&reader);
        let root = BtreeRoot::Block(7);
        assert_eq!(tree.traverse(&root, Direction::Forward).count(), 0);
        assert_eq!(tree.lookup(&root, 5).unwrap(), None);
    }

    #[test]
    fn leaves_walk_in_sibling_order() {
        let reader = build_bnobt(&sample_records(), 6);
        let tree = bno_tree(&reader);
        let ptrs: Vec<Option<u64>> = tree
            .leaves(&BtreeRoot::Block(1), Direction::Forward)
            .map(|n| n.unwrap().ptr)
            .collect();
        assert_eq!(ptrs, vec![Some(10), Some(11), Some(12), Some(13)]);

        let back: Vec<usize> = tree
            .leaves(&BtreeRoot::Block(1), Direction::Backward)
            .map(|n| n.unwrap().layout.numrecs)
            .collect();
        assert_eq!(back, vec![2, 6, 6, 6]);
    }

    // ── Search ──────────────────────────────────────────────────────────────────

    #[test]
    fn lookup_finds_exact_keys_and_is_repeatable() {
        let reader = build_bnobt(&sample_records(), 6);
        let tree = bno_tree(&reader);
        let root = BtreeRoot::Block(1);

        let hit = tree.lookup(&root, 65).unwrap().unwrap();
        assert_eq!((hit.start_block, hit.block_count), (65, 7));
        assert_eq!(tree.lookup(&root, 65).unwrap(), Some(hit));

        assert_eq!(tree.lookup(&root, 66).unwrap(), None);
        assert_eq!(tree.lookup(&root, 0).unwrap(), None);
        assert_eq!(tree.lookup(&root, 10_000).unwrap(), None);
    }

    #[test]
    fn range_from_starts_at_greatest_key_not_above_target() {
        let reader = build_bnobt(&sample_records(), 6);
        let tree = bno_tree(&reader);
        let root = BtreeRoot::Block(1);

        let from_67: Vec<u32> = starts(tree.range_from(&root, 67)).into_iter().take(3).collect();
        assert_eq!(from_67, vec![65, 75, 85]);

        // Below the first key: start at the first record.
        let from_0: Vec<u32> = starts(tree.range_from(&root, 0)).into_iter().take(2).collect();
        assert_eq!(from_0, vec![5, 15]);

        // Crosses into the next leaf.
        let from_55: Vec<u32> = starts(tree.range_from(&root, 55)).into_iter().take(2).collect();
        assert_eq!(from_55, vec![55, 65]);
    }

    // ── Corruption ──────────────────────────────────────────────────────────────

    #[test]
    fn sibling_cycle_is_reported_as_corruption() {
        let mut reader = MemReader::default();
        reader.nodes.insert(1, bno_node(1, &[(5, 10)]));
        reader.nodes.insert(10, bno_leaf(&[(5, 1)], None, Some(11)));
        reader.nodes.insert(11, bno_leaf(&[(6, 1)], Some(10), Some(10)));
        let tree = bno_tree(&reader);

        let results: Vec<_> = tree.traverse(&BtreeRoot::Block(1), Direction::Forward).collect();
        assert_eq!(results.len(), 3);
        let err = results.last().unwrap().as_ref().unwrap_err();
        assert!(err.is_corruption(), "{err}");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn child_pointing_at_ancestor_is_a_cycle() {
        let mut reader = MemReader::default();
        reader.nodes.insert(1, bno_node(1, &[(0, 1)]));
        let tree = bno_tree(&reader);
        let err = tree.lookup(&BtreeRoot::Block(1), 0).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn level_mismatch_is_rejected() {
        let mut reader = MemReader::default();
        reader.nodes.insert(1, bno_node(2, &[(5, 10)]));
        reader.nodes.insert(10, bno_leaf(&[(5, 1)], None, None));
        let tree = bno_tree(&reader);
        let err = tree
            .traverse(&BtreeRoot::Block(1), Direction::Forward)
            .next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, XfsError::CorruptFilesystem { block: 10, .. }), "{err}");
    }

    #[test]
    fn record_count_beyond_capacity_is_rejected() {
        let mut leaf = bno_leaf(&[(5, 1)], None, None);
        put_u16(&mut leaf, 6, 200);
        let mut reader = MemReader::default();
        reader.nodes.insert(3, leaf);
        let tree = bno_tree(&reader);
        let mut it = tree.traverse(&BtreeRoot::Block(3), Direction::Forward);
        assert!(it.next().unwrap().unwrap_err().is_corruption());
        assert!(it.next().is_none(), "traversal must end after an error");
    }

    #[test]
    fn keys_out_of_order_are_rejected() {
        let mut reader = MemReader::default();
        reader.nodes.insert(1, bno_node(1, &[(5, 10), (50, 11)]));
        reader.nodes.insert(10, bno_leaf(&[(5, 1), (60, 1)], None, Some(11)));
        reader.nodes.insert(11, bno_leaf(&[(50, 1)], Some(10), None));
        let tree = bno_tree(&reader);
        let results: Vec<_> = tree.traverse(&BtreeRoot::Block(1), Direction::Forward).collect();
        assert!(results.iter().any(|r| r.as_ref().is_err_and(XfsError::is_corruption)));
    }

    #[test]
    fn wrong_magic_is_corruption() {
        let mut leaf = bno_leaf(&[(5, 1)], None, None);
        put_u32(&mut leaf, 0, XFS_BMAP_MAGIC);
        let mut reader = MemReader::default();
        reader.nodes.insert(4, leaf);
        let tree = bno_tree(&reader);
        assert!(tree.lookup(&BtreeRoot::Block(4), 5).unwrap_err().is_corruption());
    }

    #[test]
    fn interior_node_without_entries_is_corruption() {
        let mut reader = MemReader::default();
        reader.nodes.insert(1, bno_node(1, &[]));
        let tree = bno_tree(&reader);
        assert!(tree.lookup(&BtreeRoot::Block(1), 5).unwrap_err().is_corruption());
    }

    // ── Checksums ───────────────────────────────────────────────────────────────

    fn crc_leaf() -> Vec<u8> {
        let mut b = vec![0_u8; NODE];
        put_u32(&mut b, 0, XFS_ABTB_CRC_MAGIC);
        put_u16(&mut b, 6, 1);
        put_u32(&mut b, 8, NULLAGBLOCK);
        put_u32(&mut b, 12, NULLAGBLOCK);
        put_u32(&mut b, 56, 42);
        put_u32(&mut b, 60, 3);
        update_crc(&mut b, SBLOCK_CRC_OFFSET).unwrap();
        b
    }

    #[test]
    fn checksum_policy_governs_bad_crc() {
        let mut reader = MemReader::default();
        reader.nodes.insert(2, crc_leaf());
        let root = BtreeRoot::Block(2);
        let shape = FreeSpaceByBlock { crc: true };

        let strict = Btree::new(shape, &reader, ChecksumPolicy::Strict);
        assert!(strict.lookup(&root, 42).unwrap().is_some());

        reader.nodes.get_mut(&2).unwrap()[60] ^= 0xFF;
        let strict = Btree::new(shape, &reader, ChecksumPolicy::Strict);
        assert!(strict.lookup(&root, 42).unwrap_err().is_corruption());

        let warn = Btree::new(shape, &reader, ChecksumPolicy::Warn);
        assert!(warn.lookup(&root, 42).unwrap().is_some());
        let ignore = Btree::new(shape, &reader, ChecksumPolicy::Ignore);
        assert!(ignore.lookup(&root, 42).unwrap().is_some());
    }

    // ── Extent map inline root ──────────────────────────────────────────────────

    fn bmap_leaf(recs: &[ExtentRecord]) -> Vec<u8> {
        let mut b = vec![0_u8; NODE];
        put_u32(&mut b, 0, XFS_BMAP_MAGIC);
        put_u16(&mut b, 6, recs.len() as u16);
        put_u64(&mut b, 8, NULLFSBLOCK);
        put_u64(&mut b, 16, NULLFSBLOCK);
        for (i, rec) in recs.iter().enumerate() {
            b[24 + i * 16..40 + i * 16].copy_from_slice(&rec.encode());
        }
        b
    }

    #[test]
    fn extent_map_descends_from_inline_root() {
        let recs = [
            ExtentRecord {
                file_offset: 0,
                start_block: FsBlock(100),
                block_count: 4,
                unwritten: false,
            },
            ExtentRecord {
                file_offset: 10,
                start_block: FsBlock(200),
                block_count: 2,
                unwritten: true,
            },
        ];
        let mut reader = MemReader::default();
        reader.nodes.insert(0x5000, bmap_leaf(&recs));

        // 36-byte fork: header, 2 key slots, 2 pointer slots.
        let mut fork = vec![0_u8; 36];
        put_u16(&mut fork, 0, 1);
        put_u16(&mut fork, 2, 1);
        put_u64(&mut fork, 4, 0);
        put_u64(&mut fork, 20, 0x5000);

        let tree = Btree::new(ExtentMap { crc: false }, &reader, ChecksumPolicy::Warn);
        let root = BtreeRoot::Inline(fork);
        let all: Vec<ExtentRecord> = tree
            .traverse(&root, Direction::Forward)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(all, recs.to_vec());
        assert_eq!(tree.range_from(&root, 11).next().unwrap().unwrap(), recs[1]);
        assert_eq!(tree.range_from(&root, 3).next().unwrap().unwrap(), recs[0]);
    }

    #[test]
    fn short_form_trees_have_no_inline_root() {
        let reader = MemReader::default();
        let tree = bno_tree(&reader);
        let err = tree.lookup(&BtreeRoot::Inline(vec![0, 1, 0, 1]), 0).unwrap_err();
        assert!(err.is_corruption());
    }

    // ── Hash indexes ────────────────────────────────────────────────────────────

    fn leafn(hashes: &[u32], back: u32, forw: u32) -> Vec<u8> {
        let mut b = vec![0_u8; NODE];
        put_u32(&mut b, 0, forw);
        put_u32(&mut b, 4, back);
        put_u16(&mut b, 8, XFS_DIR2_LEAFN_MAGIC);
        put_u16(&mut b, 12, hashes.len() as u16);
        for (i, h) in hashes.iter().enumerate() {
            put_u32(&mut b, 16 + i * 8, *h);
            put_u32(&mut b, 20 + i * 8, 2 + i as u32);
        }
        b
    }

    fn da_node(entries: &[(u32, u32)]) -> Vec<u8> {
        let mut b = vec![0_u8; NODE];
        put_u16(&mut b, 8, XFS_DA_NODE_MAGIC);
        put_u16(&mut b, 12, entries.len() as u16);
        put_u16(&mut b, 14, 1);
        for (i, (hash, before)) in entries.iter().enumerate() {
            put_u32(&mut b, 16 + i * 8, *hash);
            put_u32(&mut b, 20 + i * 8, *before);
        }
        b
    }

    #[test]
    fn hash_index_finds_duplicates_spanning_leaves() {
        let mut reader = MemReader::default();
        reader.nodes.insert(0, da_node(&[(5, 10), (9, 11)]));
        reader.nodes.insert(10, leafn(&[1, 5, 5], 0, 11));
        reader.nodes.insert(11, leafn(&[5, 5, 9], 10, 0));
        let tree = Btree::new(DirHashIndex { crc: false }, &reader, ChecksumPolicy::Warn);
        let root = BtreeRoot::Block(0);

        let fives = tree
            .range_from(&root, 5)
            .map(|r| r.unwrap().hashval)
            .take_while(|h| *h == 5)
            .count();
        assert_eq!(fives, 4);

        let nine = tree.lookup(&root, 9).unwrap().unwrap();
        assert_eq!(nine.hashval, 9);
        assert_eq!(tree.range_from(&root, 6).next().unwrap().unwrap().hashval, 9);
        assert!(tree.range_from(&root, 100).next().is_none());
        assert_eq!(tree.lookup(&root, 4).unwrap(), None);

        let mut walk = tree.range_from(&root, 9);
        walk.next().unwrap().unwrap();
        assert_eq!(walk.current_leaf().and_then(|n| n.ptr), Some(11));
    }

    // ── Properties ──────────────────────────────────────────────────────────────

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn two_level_bnobt_matches_sorted_input(
            keys in proptest::collection::btree_set(0_u32..10_000, 1..48),
            probe in 0_u32..10_000,
        ) {
            let recs: Vec<(u32, u32)> = keys.iter().map(|k| (*k, k % 7 + 1)).collect();
            let reader = build_bnobt(&recs, 6);
            let tree = bno_tree(&reader);
            let root = BtreeRoot::Block(1);

            let forward = starts(tree.traverse(&root, Direction::Forward));
            let expected: Vec<u32> = keys.iter().copied().collect();
            prop_assert_eq!(&forward, &expected);

            let mut backward = starts(tree.traverse(&root, Direction::Backward));
            backward.reverse();
            prop_assert_eq!(&backward, &expected);

            let found = tree.lookup(&root, probe).unwrap().map(|r| r.start_block);
            prop_assert_eq!(found, keys.contains(&probe).then_some(probe));
        }
    }
}
