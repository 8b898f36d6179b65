#![forbid(unsafe_code)]
//! Fixtures for conformance tests and benchmarks.
//!
//! Two sources of volume bytes: synthetic images from [`ImageBuilder`],
//! and sparse JSON fixtures that record only the non-zero regions of an
//! image so they can be checked in.

pub mod image;

pub use image::{ImageBuilder, ImageSpec};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use xfs_ondisk::{AttrNamespace, Superblock};
use xfs_types::S_IFCHR;

// ── Sparse fixtures ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseFixture {
    pub size: usize,
    pub writes: Vec<FixtureWrite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureWrite {
    pub offset: usize,
    pub hex: String,
}

impl SparseFixture {
    /// Record every `granule`-sized chunk of `bytes` that is not all zero.
    /// Adjacent chunks merge into one write.
    #[must_use]
    pub fn capture(bytes: &[u8], granule: usize) -> Self {
        let granule = granule.max(1);
        let mut writes: Vec<FixtureWrite> = Vec::new();
        let mut run: Option<(usize, usize)> = None;
        for (i, chunk) in bytes.chunks(granule).enumerate() {
            let start = i * granule;
            if chunk.iter().all(|b| *b == 0) {
                if let Some((from, to)) = run.take() {
                    writes.push(FixtureWrite {
                        offset: from,
                        hex: hex::encode(&bytes[from..to]),
                    });
                }
                continue;
            }
            run = Some(match run {
                Some((from, _)) => (from, start + chunk.len()),
                None => (start, start + chunk.len()),
            });
        }
        if let Some((from, to)) = run {
            writes.push(FixtureWrite {
                offset: from,
                hex: hex::encode(&bytes[from..to]),
            });
        }
        Self {
            size: bytes.len(),
            writes,
        }
    }

    /// Expand back into a zero-filled image.
    pub fn materialize(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0_u8; self.size];
        for write in &self.writes {
            let payload = hex::decode(&write.hex)
                .with_context(|| format!("invalid hex at offset {}", write.offset))?;

            let end = write
                .offset
                .checked_add(payload.len())
                .context("fixture offset overflow")?;
            if end > bytes.len() {
                bail!(
                    "fixture write out of bounds: offset={} payload={} size={}",
                    write.offset,
                    payload.len(),
                    bytes.len()
                );
            }

            bytes[write.offset..end].copy_from_slice(&payload);
        }
        Ok(bytes)
    }
}

pub fn load_sparse_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: SparseFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;
    fixture.materialize()
}

pub fn save_sparse_fixture(path: &Path, bytes: &[u8], granule: usize) -> Result<()> {
    let fixture = SparseFixture::capture(bytes, granule);
    let text = serde_json::to_string_pretty(&fixture)?;
    fs::write(path, text).with_context(|| format!("failed to write fixture {}", path.display()))
}

/// Parse and check the primary superblock of a fixture.
pub fn validate_superblock_fixture(path: &Path) -> Result<Superblock> {
    let data = load_sparse_fixture(path)?;
    let sb = Superblock::parse_superblock_region(&data)
        .with_context(|| format!("failed superblock parse for fixture {}", path.display()))?;
    sb.validate_features()
        .with_context(|| format!("unsupported features in fixture {}", path.display()))?;
    sb.validate_geometry()
        .with_context(|| format!("inconsistent geometry in fixture {}", path.display()))?;
    Ok(sb)
}

// ── Demo volume ─────────────────────────────────────────────────────────────

/// Names placed in `/many` of the demo volume.
pub const DEMO_MANY_NAMES: usize = 400;

/// Contents of `/docs/guide.txt` for a given block size: three full blocks
/// and a partial one.
#[must_use]
pub fn demo_guide(block_size: u32) -> Vec<u8> {
    let len = 3 * block_size as usize + 100;
    (0..len).map(|i| b"abcdefghijklmnopqrstuvwxyz\n"[i % 27]).collect()
}

/// A volume exercising every structure the decoder reads:
///
/// ```text
/// /README            inline-size file with a user attribute
/// /docs/guide.txt    multi-block file
/// /many/entry-NNNN   hard links to /many/target, leaf or node directory
/// /sparse            1 MiB file with two written pieces
/// /link              relative symlink to docs/guide.txt
/// /abs               absolute symlink to /docs
/// /null              character device 1:3
/// ```
pub fn demo_image(spec: ImageSpec) -> Result<Vec<u8>> {
    let bs = spec.block_size;
    let mut b = ImageBuilder::new(spec)?;
    let root = b.root();

    let readme = b.add_file(root, "README", b"synthetic xfs volume\n")?;
    b.set_xattr(readme, AttrNamespace::User, "mime_type", "text/plain")?;

    let docs = b.mkdir(root, "docs")?;
    b.add_file(docs, "guide.txt", &demo_guide(bs))?;

    let many = b.mkdir(root, "many")?;
    let target = b.add_file(many, "target", b"shared\n")?;
    for i in 0..DEMO_MANY_NAMES {
        b.link(many, format!("entry-{i:04}"), target)?;
    }

    let half = 512 * 1024;
    b.add_sparse_file(
        root,
        "sparse",
        2 * half,
        &[(0, b"head".as_slice()), (half, b"middle".as_slice())],
    )?;
    b.symlink(root, "link", "docs/guide.txt")?;
    b.symlink(root, "abs", "/docs")?;
    b.add_device(root, "null", S_IFCHR, 1, 3)?;
    b.build()
}
