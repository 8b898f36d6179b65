#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use std::env;
use std::fs;
use std::path::Path;
use xfs_harness::{ImageSpec, SparseFixture, demo_image, validate_superblock_fixture};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("build-image") => build_image(&args[1..]),
        Some("generate-fixture") => generate_fixture(&args[1..]),
        Some("check-fixtures") => {
            if args.len() < 2 {
                bail!("usage: xfs-harness check-fixtures <fixture.json>...");
            }
            for path in &args[1..] {
                let sb = validate_superblock_fixture(Path::new(path))?;
                println!(
                    "{path}: v{} block_size={} ags={}x{} label={:?}",
                    sb.version, sb.block_size, sb.ag_count, sb.ag_blocks, sb.label
                );
            }
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn build_image(args: &[String]) -> Result<()> {
    let out = args.first().context("build-image requires <out>")?;
    let mut spec = ImageSpec::default();
    let mut fixture = false;
    let mut index = 1_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--v4" => {
                spec = ImageSpec {
                    inode_size: 256,
                    crc: false,
                    ..spec
                };
                index += 1;
            }
            "--fixture" => {
                fixture = true;
                index += 1;
            }
            "--block-size" => {
                let raw = args.get(index + 1).context("--block-size requires a value")?;
                spec.block_size = raw.parse().context("invalid --block-size value")?;
                index += 2;
            }
            "--ag-blocks" => {
                let raw = args.get(index + 1).context("--ag-blocks requires a value")?;
                spec.ag_blocks = raw.parse().context("invalid --ag-blocks value")?;
                index += 2;
            }
            "--ag-count" => {
                let raw = args.get(index + 1).context("--ag-count requires a value")?;
                spec.ag_count = raw.parse().context("invalid --ag-count value")?;
                index += 2;
            }
            "--label" => {
                let raw = args.get(index + 1).context("--label requires a value")?;
                spec.label.clone_from(raw);
                index += 2;
            }
            other => bail!("unknown build-image option: {other}"),
        }
    }

    let granule = spec.block_size as usize;
    let bytes = demo_image(spec)?;
    if fixture {
        let text = serde_json::to_string_pretty(&SparseFixture::capture(&bytes, granule))?;
        fs::write(out, text).with_context(|| format!("failed to write {out}"))?;
    } else {
        fs::write(out, &bytes).with_context(|| format!("failed to write {out}"))?;
    }
    eprintln!("wrote {} byte image to {out}", bytes.len());
    Ok(())
}

fn generate_fixture(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("usage: xfs-harness generate-fixture <image> [superblock|image|region <offset> <len>]");
    }

    let image_path = Path::new(&args[0]);
    let image_data =
        fs::read(image_path).with_context(|| format!("failed to read {}", image_path.display()))?;

    let kind = args.get(1).map_or("superblock", String::as_str);
    let fixture = match kind {
        "superblock" => region(&image_data, 0, 512)?,
        "image" => SparseFixture::capture(&image_data, 512),
        "region" => {
            let offset: usize = args
                .get(2)
                .context("region requires <offset>")?
                .parse()
                .context("invalid offset")?;
            let len: usize = args
                .get(3)
                .context("region requires <len>")?
                .parse()
                .context("invalid len")?;
            region(&image_data, offset, len)?
        }
        _ => bail!("unknown fixture kind: {kind}"),
    };

    println!("{}", serde_json::to_string_pretty(&fixture)?);
    Ok(())
}

/// A fixture holding `len` bytes of the image at `offset`, rebased to 0.
fn region(image: &[u8], offset: usize, len: usize) -> Result<SparseFixture> {
    let end = offset.checked_add(len).context("region overflow")?;
    let bytes = image.get(offset..end).with_context(|| {
        format!(
            "region {offset}..{end} outside image of {} bytes",
            image.len()
        )
    })?;
    Ok(SparseFixture::capture(bytes, 64))
}

fn print_usage() {
    println!("xfs-harness: synthetic images and sparse fixtures");
    println!();
    println!("USAGE:");
    println!(
        "  xfs-harness build-image <out> [--v4] [--block-size N] [--ag-blocks N] [--ag-count N] [--label L] [--fixture]"
    );
    println!("  xfs-harness generate-fixture <image> [superblock|image|region <offset> <len>]");
    println!("  xfs-harness check-fixtures <fixture.json>...");
    println!();
    println!("IMAGES:");
    println!("  build-image writes the demo volume: files, a multi-block file, a large");
    println!("  directory, a sparse file, symlinks, a device node, and an attribute.");
    println!("  With --fixture the output is a sparse JSON fixture instead of raw bytes.");
    println!();
    println!("EXAMPLES:");
    println!("  xfs-harness build-image /tmp/demo.img --block-size 512 --ag-blocks 4096");
    println!("  xfs-harness generate-fixture /tmp/demo.img > conformance/fixtures/sb.json");
}
