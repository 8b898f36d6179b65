//! Block-level read access shared by every decoder.

use std::sync::Arc;
use tracing::trace;
use xfs_block::ByteDevice;
use xfs_btree::{NodeReader, corrupt_at, enforce_checksum};
use xfs_error::{Result, XfsError};
use xfs_ondisk::{ChecksumPolicy, Geometry};
use xfs_types::{AgBlock, AgNumber, BlockNumber, ByteOffset, FsBlock, u64_to_usize};

/// A byte source paired with the geometry that addresses it.
///
/// Cheap to clone; decoders borrow it for the duration of one operation.
#[derive(Clone)]
pub struct Volume {
    dev: Arc<dyn ByteDevice>,
    geometry: Arc<Geometry>,
    checksums: ChecksumPolicy,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("geometry", &self.geometry)
            .field("checksums", &self.checksums)
            .field("dev_len", &self.dev.len_bytes())
            .finish()
    }
}

impl Volume {
    pub fn new(dev: Arc<dyn ByteDevice>, geometry: Geometry, checksums: ChecksumPolicy) -> Self {
        Self {
            dev,
            geometry: Arc::new(geometry),
            checksums,
        }
    }

    #[must_use]
    pub fn device(&self) -> &dyn ByteDevice {
        &*self.dev
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn checksums(&self) -> ChecksumPolicy {
        self.checksums
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        u64::from(self.geometry.block_size.get())
    }

    /// Read `len` bytes at an absolute byte offset.
    pub fn read_bytes(&self, offset: ByteOffset, len: usize) -> Result<Vec<u8>> {
        self.dev.read_vec_at(offset, len)
    }

    /// Read `count` consecutive filesystem blocks starting at a linear block.
    pub fn read_blocks(&self, block: BlockNumber, count: u64) -> Result<Vec<u8>> {
        let end = block
            .checked_add(count)
            .ok_or_else(|| XfsError::corrupt(block.0, "block range overflows"))?;
        if end.0 > self.geometry.data_blocks {
            return Err(XfsError::corrupt(
                block.0,
                format!(
                    "blocks {}..{} beyond end of filesystem ({} blocks)",
                    block.0, end.0, self.geometry.data_blocks
                ),
            ));
        }
        let offset = self
            .geometry
            .block_offset(block)
            .map_err(|e| corrupt_at(block.0, &e))?;
        let len = count
            .checked_mul(self.block_size())
            .and_then(|n| u64_to_usize(n, "read_len").ok())
            .ok_or_else(|| XfsError::corrupt(block.0, "read length overflows"))?;
        trace!(block = block.0, count, "read_blocks");
        self.dev.read_vec_at(offset, len)
    }

    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        self.read_blocks(block, 1)
    }

    /// Translate a packed filesystem block, rejecting out-of-range parts.
    pub fn fsblock_to_linear(&self, fsb: FsBlock) -> Result<BlockNumber> {
        self.geometry
            .fsblock_to_linear(fsb)
            .map_err(|e| XfsError::corrupt(fsb.0, format!("fsblock {fsb}: {e}")))
    }

    pub fn read_fsblock(&self, fsb: FsBlock) -> Result<Vec<u8>> {
        let linear = self.fsblock_to_linear(fsb)?;
        self.read_block(linear)
    }

    /// Linear block of `agbno` in `ag`, rejecting blocks past the AG's end.
    pub fn ag_block(&self, ag: AgNumber, agbno: AgBlock) -> Result<BlockNumber> {
        if ag.0 >= self.geometry.ag_count || agbno.0 >= self.geometry.ag_length(ag) {
            return Err(XfsError::corrupt(
                u64::from(agbno.0),
                format!("AG block {agbno} outside allocation group {ag}"),
            ));
        }
        Ok(self.geometry.ag_block_to_linear(ag, agbno))
    }

    /// Linear start of a physically contiguous run, validating that the run
    /// stays inside one allocation group.
    pub fn run_start(&self, fsb: FsBlock, count: u64) -> Result<BlockNumber> {
        let linear = self.fsblock_to_linear(fsb)?;
        let (ag, agbno) = self.geometry.split_fsblock(fsb);
        if u64::from(agbno.0).saturating_add(count) > u64::from(self.geometry.ag_length(ag)) {
            return Err(XfsError::corrupt(
                linear.0,
                format!("extent of {count} blocks at {fsb} crosses allocation group end"),
            ));
        }
        Ok(linear)
    }

    /// Apply the checksum policy to a v5 metadata buffer. No-op on v4.
    pub fn verify(&self, what: &str, block: u64, buf: &[u8], crc_offset: usize) -> Result<()> {
        if !self.geometry.has_crc {
            return Ok(());
        }
        enforce_checksum(self.checksums, what, block, buf, crc_offset)
    }
}

/// Long-pointer trees (the extent map) address nodes by packed filesystem block.
impl NodeReader for Volume {
    fn read_node(&self, ptr: u64) -> Result<Vec<u8>> {
        self.read_fsblock(FsBlock(ptr))
    }

    fn node_address(&self, ptr: u64) -> u64 {
        self.geometry
            .fsblock_to_linear(FsBlock(ptr))
            .map_or(ptr, |b| b.0)
    }
}

/// Short-pointer trees address nodes by block inside one allocation group.
#[derive(Debug, Clone, Copy)]
pub struct AgNodeReader<'a> {
    volume: &'a Volume,
    ag: AgNumber,
}

impl<'a> AgNodeReader<'a> {
    #[must_use]
    pub fn new(volume: &'a Volume, ag: AgNumber) -> Self {
        Self { volume, ag }
    }
}

impl NodeReader for AgNodeReader<'_> {
    fn read_node(&self, ptr: u64) -> Result<Vec<u8>> {
        let agbno = u32::try_from(ptr)
            .map_err(|_| XfsError::corrupt(ptr, "AG btree pointer exceeds 32 bits"))?;
        let block = self.volume.ag_block(self.ag, AgBlock(agbno))?;
        self.volume.read_block(block)
    }

    fn node_address(&self, ptr: u64) -> u64 {
        u32::try_from(ptr).map_or(ptr, |agbno| {
            self.volume
                .geometry()
                .ag_block_to_linear(self.ag, AgBlock(agbno))
                .0
        })
    }
}
