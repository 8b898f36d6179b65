//! Remote symlink block header (v5).

use xfs_types::{ParseError, ensure_slice, read_be_u32, read_be_u64};

/// "XSLM".
pub const XFS_SYMLINK_MAGIC: u32 = 0x5853_4c4d;
pub const XFS_SYMLINK_HDR_LEN: usize = 56;
/// Longest symlink target the kernel creates.
pub const XFS_SYMLINK_MAXLEN: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymlinkHeader {
    pub offset: u32,
    pub bytes: u32,
    pub owner: u64,
    pub blkno: u64,
}

impl SymlinkHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, XFS_SYMLINK_HDR_LEN)?;
        let magic = read_be_u32(data, 0)?;
        if magic != XFS_SYMLINK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(XFS_SYMLINK_MAGIC),
                actual: u64::from(magic),
            });
        }
        let header = Self {
            offset: read_be_u32(data, 4)?,
            bytes: read_be_u32(data, 8)?,
            owner: read_be_u64(data, 16 + 16)?,
            blkno: read_be_u64(data, 40)?,
        };
        if header.bytes as usize > data.len() - XFS_SYMLINK_HDR_LEN {
            return Err(ParseError::InvalidField {
                field: "sl_bytes",
                reason: "symlink fragment exceeds block",
            });
        }
        Ok(header)
    }

    /// The target bytes this block carries.
    pub fn payload<'a>(&self, block: &'a [u8]) -> Result<&'a [u8], ParseError> {
        ensure_slice(block, XFS_SYMLINK_HDR_LEN, self.bytes as usize)
    }
}
