//! CRC32C verification for v5 metadata.
//!
//! Every self-describing v5 structure stores a little-endian CRC32C of the
//! whole buffer computed with the CRC field itself treated as zero.

use serde::{Deserialize, Serialize};
use xfs_types::{ParseError, ensure_slice, read_le_u32};

/// `sb_crc`.
pub const SB_CRC_OFFSET: usize = 224;
/// `agf_crc`.
pub const AGF_CRC_OFFSET: usize = 216;
/// `agi_crc`.
pub const AGI_CRC_OFFSET: usize = 312;
/// `di_crc`.
pub const DINODE_CRC_OFFSET: usize = 100;
/// `bb_crc` in a short-form (AG) btree block.
pub const SBLOCK_CRC_OFFSET: usize = 52;
/// `bb_crc` in a long-form (extent map) btree block.
pub const LBLOCK_CRC_OFFSET: usize = 64;
/// `crc` in a v5 dabtree/dir/attr block header.
pub const DA3_CRC_OFFSET: usize = 12;
/// `crc` in a v5 directory data/block header.
pub const DIR3_DATA_CRC_OFFSET: usize = 4;
/// `rm_crc` in a remote attribute value header.
pub const ATTR3_RMT_CRC_OFFSET: usize = 12;
/// `sl_crc` in a remote symlink header.
pub const SYMLINK_CRC_OFFSET: usize = 12;

/// What to do when a stored checksum disagrees with the computed one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Do not compute checksums at all.
    Ignore,
    /// Compute, log a warning on mismatch, keep decoding.
    #[default]
    Warn,
    /// Treat a mismatch as corruption.
    Strict,
}

impl ChecksumPolicy {
    #[must_use]
    pub fn verifies(self) -> bool {
        !matches!(self, Self::Ignore)
    }
}

impl std::fmt::Display for ChecksumPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ignore => "ignore",
            Self::Warn => "warn",
            Self::Strict => "strict",
        })
    }
}

impl std::str::FromStr for ChecksumPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(Self::Ignore),
            "warn" => Ok(Self::Warn),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown checksum policy: {other}")),
        }
    }
}

/// Compute the XFS CRC32C of `buf`, treating the 4 bytes at `crc_offset` as zero.
pub fn compute_crc(buf: &[u8], crc_offset: usize) -> Result<u32, ParseError> {
    ensure_slice(buf, crc_offset, 4)?;
    let crc = crc32c::crc32c(&buf[..crc_offset]);
    let crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    Ok(crc32c::crc32c_append(crc, &buf[crc_offset + 4..]))
}

/// Verify the stored checksum of `buf`.
///
/// Returns `InvalidField` naming the checksum on mismatch.
pub fn verify_crc(buf: &[u8], crc_offset: usize) -> Result<(), ParseError> {
    let stored = read_le_u32(buf, crc_offset)?;
    let computed = compute_crc(buf, crc_offset)?;
    if stored != computed {
        return Err(ParseError::InvalidField {
            field: "crc",
            reason: "checksum mismatch",
        });
    }
    Ok(())
}

/// Recompute and store the checksum in place. Image builders use this.
pub fn update_crc(buf: &mut [u8], crc_offset: usize) -> Result<(), ParseError> {
    let crc = compute_crc(buf, crc_offset)?;
    buf[crc_offset..crc_offset + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_ignores_stored_field() {
        let mut buf = vec![0x5A_u8; 512];
        update_crc(&mut buf, DINODE_CRC_OFFSET).unwrap();
        verify_crc(&buf, DINODE_CRC_OFFSET).unwrap();

        let first = compute_crc(&buf, DINODE_CRC_OFFSET).unwrap();
        buf[DINODE_CRC_OFFSET] ^= 0xFF;
        assert_eq!(compute_crc(&buf, DINODE_CRC_OFFSET).unwrap(), first);
        assert!(verify_crc(&buf, DINODE_CRC_OFFSET).is_err());
    }

    #[test]
    fn crc_matches_whole_buffer_crc_with_zeroed_field() {
        let mut buf: Vec<u8> = (0..=255_u8).collect();
        let with_field = compute_crc(&buf, 4).unwrap();
        buf[4..8].fill(0);
        assert_eq!(with_field, crc32c::crc32c(&buf));
    }

    #[test]
    fn payload_flip_fails_verification() {
        let mut buf = vec![0_u8; 4096];
        buf[0..4].copy_from_slice(b"XFSB");
        update_crc(&mut buf, SB_CRC_OFFSET).unwrap();
        buf[1000] = 1;
        assert_eq!(
            verify_crc(&buf, SB_CRC_OFFSET),
            Err(ParseError::InvalidField {
                field: "crc",
                reason: "checksum mismatch",
            })
        );
    }

    #[test]
    fn crc_offset_out_of_range() {
        assert!(compute_crc(&[0_u8; 8], 6).is_err());
    }

    #[test]
    fn policy_parse_and_default() {
        assert_eq!(ChecksumPolicy::default(), ChecksumPolicy::Warn);
        assert_eq!("strict".parse::<ChecksumPolicy>(), Ok(ChecksumPolicy::Strict));
        assert!("loud".parse::<ChecksumPolicy>().is_err());
        assert!(!ChecksumPolicy::Ignore.verifies());
        assert_eq!(ChecksumPolicy::Warn.to_string(), "warn");
    }
}
