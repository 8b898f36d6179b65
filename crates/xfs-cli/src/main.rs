#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::env::VarError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, info_span};
use tracing_subscriber::EnvFilter;
use xfs_core::{
    AgSummary, AllocRec, Extent, Filesystem, Inode, InodeAttr, OpenOptions, VolumeSummary,
};
use xfs_ondisk::ChecksumPolicy;
use xfs_types::{AgNumber, InodeNumber};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "XFS_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ChecksumArg {
    Ignore,
    Warn,
    Strict,
}

impl From<ChecksumArg> for ChecksumPolicy {
    fn from(arg: ChecksumArg) -> Self {
        match arg {
            ChecksumArg::Ignore => Self::Ignore,
            ChecksumArg::Warn => Self::Warn,
            ChecksumArg::Strict => Self::Strict,
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

#[derive(Parser)]
#[command(name = "xfs", about = "Read-only XFS image inspector")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `XFS_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    /// What a v5 metadata checksum mismatch does.
    #[arg(long, value_enum, global = true, default_value = "warn")]
    checksums: ChecksumArg,
    /// Accept a superblock with inconsistent geometry.
    #[arg(long, global = true)]
    skip_validation: bool,
    /// Memoize this many blocks in front of the image.
    #[arg(long, global = true)]
    cache_blocks: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show superblock geometry, features, and allocation group counters.
    Inspect {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory.
    Ls {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Absolute path inside the volume.
        #[arg(default_value = "/")]
        path: String,
        /// Show inode attributes for each entry.
        #[arg(long, short = 'l')]
        long: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Write file contents to stdout.
    Cat {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Absolute path inside the volume.
        path: String,
        /// Byte offset to start at.
        #[arg(long, default_value = "0")]
        offset: u64,
        /// Bytes to write; defaults to the rest of the file.
        #[arg(long)]
        len: Option<u64>,
    },
    /// Show inode attributes and data fork extents.
    Stat {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Absolute path inside the volume.
        path: Option<String>,
        /// Inode number instead of a path.
        #[arg(long, conflicts_with = "path")]
        inode: Option<u64>,
        /// Do not follow a final symlink.
        #[arg(long)]
        no_follow: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List extended attributes with their values.
    Xattr {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Absolute path inside the volume.
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List every allocated inode.
    Inodes {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List free extents of one or every allocation group.
    Freesp {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Restrict to one allocation group.
        #[arg(long)]
        ag: Option<u32>,
        /// Order by extent length instead of start block.
        #[arg(long)]
        by_size: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::Inspect { .. } => "inspect",
            Self::Ls { .. } => "ls",
            Self::Cat { .. } => "cat",
            Self::Stat { .. } => "stat",
            Self::Xattr { .. } => "xattr",
            Self::Inodes { .. } => "inodes",
            Self::Freesp { .. } => "freesp",
        }
    }
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;
    let command_name = cli.command.name();
    let run_span = info_span!(
        target: "xfs::cli",
        "command",
        command = command_name,
        log_format = log_format.as_str()
    );
    let _run_guard = run_span.enter();
    let started = Instant::now();
    info!(target: "xfs::cli", command = command_name, "command_start");

    let options = OpenOptions {
        checksums: cli.checksums.into(),
        skip_validation: cli.skip_validation,
        cache_blocks: cli.cache_blocks,
        ..OpenOptions::default()
    };

    let result = match cli.command {
        Command::Inspect { image, json } => inspect(&open(&image, options)?, json),
        Command::Ls {
            image,
            path,
            long,
            json,
        } => ls_cmd(&open(&image, options)?, &path, long, json),
        Command::Cat {
            image,
            path,
            offset,
            len,
        } => cat_cmd(&open(&image, options)?, &path, offset, len),
        Command::Stat {
            image,
            path,
            inode,
            no_follow,
            json,
        } => {
            let fs = open(&image, options)?;
            let target = match (inode, path) {
                (Some(ino), _) => fs.inode(InodeNumber(ino))?,
                (None, Some(path)) if no_follow => fs.resolve_path_nofollow(&path)?,
                (None, Some(path)) => fs.resolve_path(&path)?,
                (None, None) => bail!("stat requires a path or --inode"),
            };
            stat_cmd(&target, json)
        }
        Command::Xattr { image, path, json } => xattr_cmd(&open(&image, options)?, &path, json),
        Command::Inodes { image, json } => inodes_cmd(&open(&image, options)?, json),
        Command::Freesp {
            image,
            ag,
            by_size,
            json,
        } => freesp_cmd(&open(&image, options)?, ag, by_size, json),
    };

    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    if let Err(err) = &result {
        error!(
            target: "xfs::cli",
            command = command_name,
            duration_us,
            error = %err,
            "command_failed"
        );
    } else {
        info!(target: "xfs::cli", command = command_name, duration_us, "command_succeeded");
    }
    result
}

fn open(image: &Path, options: OpenOptions) -> Result<Filesystem> {
    Filesystem::open_with_options(image, options)
        .with_context(|| format!("failed to open XFS image {}", image.display()))
}

fn print_json(value: &impl Serialize, what: &str) -> Result<()> {
    let text = serde_json::to_string_pretty(value).with_context(|| format!("serialize {what}"))?;
    println!("{text}");
    Ok(())
}

// ── inspect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    #[serde(flatten)]
    volume: VolumeSummary,
    ags: Vec<AgSummary>,
}

fn inspect(fs: &Filesystem, json: bool) -> Result<()> {
    let ags = fs
        .ag_numbers()
        .map(|ag| fs.ag_summary(ag))
        .collect::<Result<Vec<_>, _>>()
        .context("read allocation group headers")?;
    let output = InspectOutput {
        volume: fs.summary(),
        ags,
    };

    if json {
        return print_json(&output, "inspect output");
    }
    let v = &output.volume;
    println!("XFS Inspector");
    println!("label: {}", v.label);
    println!("uuid: {}", v.uuid);
    println!("version: {}", v.version);
    println!("block_size: {}", v.block_size);
    println!("sector_size: {}", v.sector_size);
    println!("inode_size: {}", v.inode_size);
    println!("dir_block_size: {}", v.dir_block_size);
    println!("ag_count: {}", v.ag_count);
    println!("ag_blocks: {}", v.ag_blocks);
    println!("data_blocks: {}", v.data_blocks);
    println!("root_ino: {}", v.root_ino);
    println!("inodes: {} ({} free)", v.inode_count, v.free_inodes);
    println!("free_blocks: {}", v.free_blocks);
    println!("features: {}", v.features.join(" "));
    println!();
    println!("{:>4} {:>12} {:>10} {:>10} {:>10} {:>8} {:>8}", "ag", "start", "length", "free", "longest", "inodes", "ifree");
    for ag in &output.ags {
        println!(
            "{:>4} {:>12} {:>10} {:>10} {:>10} {:>8} {:>8}",
            ag.ag, ag.start_block, ag.length, ag.free_blocks, ag.longest_free, ag.inode_count, ag.free_inodes
        );
    }
    Ok(())
}

// ── ls ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct LsEntry {
    name: String,
    ino: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    attr: Option<InodeAttr>,
}

fn ls_cmd(fs: &Filesystem, path: &str, long: bool, json: bool) -> Result<()> {
    let dir = fs.resolve_path(path).with_context(|| format!("resolve {path}"))?;
    let mut entries = Vec::new();
    for entry in dir.directory_entries().with_context(|| format!("list {path}"))? {
        let entry = entry.with_context(|| format!("decode entry of {path}"))?;
        let attr = if long {
            Some(fs.inode(entry.ino)?.attr())
        } else {
            None
        };
        entries.push(LsEntry {
            name: entry.name_str().into_owned(),
            ino: entry.ino.0,
            attr,
        });
    }
    debug!(path, count = entries.len(), "ls_listed");

    if json {
        return print_json(&entries, "ls output");
    }
    for entry in &entries {
        match &entry.attr {
            Some(attr) => println!(
                "{}{:04o} {:>4} {:>6} {:>6} {:>12} {:>10} {}",
                attr.kind.indicator(),
                attr.perm,
                attr.nlink,
                attr.uid,
                attr.gid,
                attr.size,
                entry.ino,
                entry.name
            ),
            None => println!("{}", entry.name),
        }
    }
    Ok(())
}

// ── cat ─────────────────────────────────────────────────────────────────────

const CAT_CHUNK: u64 = 1 << 20;

fn cat_cmd(fs: &Filesystem, path: &str, offset: u64, len: Option<u64>) -> Result<()> {
    let file = fs.resolve_path(path).with_context(|| format!("resolve {path}"))?;
    let end = match len {
        Some(len) => offset.saturating_add(len).min(file.size()),
        None => file.size(),
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut at = offset;
    while at < end {
        let want = usize::try_from((end - at).min(CAT_CHUNK)).context("chunk length")?;
        let bytes = file.read(at, want).with_context(|| format!("read {path} at {at}"))?;
        if bytes.is_empty() {
            break;
        }
        out.write_all(&bytes).context("write stdout")?;
        at += bytes.len() as u64;
    }
    out.flush().context("flush stdout")?;
    Ok(())
}

// ── stat ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StatOutput {
    #[serde(flatten)]
    attr: InodeAttr,
    #[serde(skip_serializing_if = "Option::is_none")]
    symlink_target: Option<String>,
    extents: Vec<Extent>,
}

fn stat_cmd(inode: &Inode<'_>, json: bool) -> Result<()> {
    let symlink_target = if inode.is_symlink() {
        Some(String::from_utf8_lossy(&inode.symlink_target()?).into_owned())
    } else {
        None
    };
    let output = StatOutput {
        attr: inode.attr(),
        symlink_target,
        extents: inode.extents().context("map data fork")?,
    };

    if json {
        return print_json(&output, "stat output");
    }
    let a = &output.attr;
    println!("inode: {}", a.ino);
    println!("kind: {:?}", a.kind);
    println!("mode: {}{:04o}", a.kind.indicator(), a.perm);
    println!("nlink: {}", a.nlink);
    println!("uid: {}", a.uid);
    println!("gid: {}", a.gid);
    println!("projid: {}", a.projid);
    println!("size: {}", a.size);
    println!("blocks: {}", a.blocks);
    println!("atime: {}.{:09}", a.atime.secs, a.atime.nsecs);
    println!("mtime: {}.{:09}", a.mtime.secs, a.mtime.nsecs);
    println!("ctime: {}.{:09}", a.ctime.secs, a.ctime.nsecs);
    if let Some(crtime) = a.crtime {
        println!("crtime: {}.{:09}", crtime.secs, crtime.nsecs);
    }
    println!("generation: {}", a.generation);
    println!("flags: 0x{:04X}", a.flags);
    println!("flags2: 0x{:016X}", a.flags2);
    if let Some((major, minor)) = a.rdev {
        println!("rdev: {major}:{minor}");
    }
    println!("data_format: {}", a.data_format.name());
    if let Some(format) = a.attr_format {
        println!("attr_format: {}", format.name());
    }
    if let Some(target) = &output.symlink_target {
        println!("target: {target}");
    }
    if !output.extents.is_empty() {
        println!();
        println!("{:>12} {:>16} {:>10} state", "file_block", "fs_block", "count");
        for e in &output.extents {
            println!(
                "{:>12} {:>16} {:>10} {:?}",
                e.file_offset.0, e.start_block.0, e.block_count, e.state
            );
        }
    }
    Ok(())
}

// ── xattr ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct XattrEntry {
    name: String,
    /// UTF-8 values verbatim, anything else as hex.
    value: String,
    binary: bool,
}

fn xattr_cmd(fs: &Filesystem, path: &str, json: bool) -> Result<()> {
    let inode = fs.resolve_path(path).with_context(|| format!("resolve {path}"))?;
    let attrs = inode.attributes()?;
    let mut entries = Vec::new();
    for attr in attrs.entries() {
        let attr = attr.with_context(|| format!("decode attributes of {path}"))?;
        let raw = attrs.value(&attr)?;
        let (value, binary) = match String::from_utf8(raw) {
            Ok(text) => (text, false),
            Err(err) => (hex::encode(err.as_bytes()), true),
        };
        entries.push(XattrEntry {
            name: attr.full_name(),
            value,
            binary,
        });
    }

    if json {
        return print_json(&entries, "xattr output");
    }
    for entry in &entries {
        if entry.binary {
            println!("{}=0x{}", entry.name, entry.value);
        } else {
            println!("{}={:?}", entry.name, entry.value);
        }
    }
    Ok(())
}

// ── inodes ──────────────────────────────────────────────────────────────────

fn inodes_cmd(fs: &Filesystem, json: bool) -> Result<()> {
    let inodes = fs
        .inodes()
        .map(|ino| ino.map(|ino| ino.0))
        .collect::<Result<Vec<u64>, _>>()
        .context("walk inode btrees")?;
    if json {
        return print_json(&inodes, "inode list");
    }
    for ino in inodes {
        println!("{ino}");
    }
    Ok(())
}

// ── freesp ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct FreeExtent {
    ag: u32,
    #[serde(flatten)]
    rec: AllocRec,
}

fn freesp_cmd(fs: &Filesystem, ag: Option<u32>, by_size: bool, json: bool) -> Result<()> {
    let ags: Vec<AgNumber> = match ag {
        Some(ag) => vec![AgNumber(ag)],
        None => fs.ag_numbers().collect(),
    };
    let mut extents = Vec::new();
    for ag in ags {
        let records: Vec<AllocRec> = if by_size {
            fs.free_extents_by_size(ag)?.collect::<Result<_, _>>()
        } else {
            fs.free_extents_by_block(ag)?.collect::<Result<_, _>>()
        }
        .with_context(|| format!("walk free space of allocation group {ag}"))?;
        extents.extend(records.into_iter().map(|rec| FreeExtent { ag: ag.0, rec }));
    }

    if json {
        return print_json(&extents, "free space");
    }
    println!("{:>4} {:>10} {:>10}", "ag", "agbno", "len");
    for e in &extents {
        println!("{:>4} {:>10} {:>10}", e.ag, e.rec.start_block, e.rec.block_count);
    }
    let total: u64 = extents.iter().map(|e| u64::from(e.rec.block_count)).sum();
    println!("total free blocks: {total}");
    Ok(())
}
