// Command-line front end for wdiff.
//
// Subcommands: `show` dumps a diff file, `merge` folds several diffs into one
// sorted diff, `full` streams a base image overlaid with a diff chain, and
// `index` rewrites a diff in the indexed format.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};

use crate::compress::CompressionType;
use crate::diff::config::{
    CompressOptions, DEFAULT_CACHE_BYTES, DEFAULT_COMPRESS_LEVEL, LOGICAL_BLOCK_SIZE,
    MAX_NORMAL_IO_BLOCKS,
};
use crate::diff::stat::DiffStatistics;
use crate::diff::virt::{BaseReader, Sequential, open_base};
use crate::io::{MergeOptions, index_file, merge_files, show_file, virtual_full};

const BUF_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Size arguments
// ---------------------------------------------------------------------------

/// Parse a size such as `4096`, `8s` (logical blocks), `64K`, `32MiB` or `1g`.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("'{s}' does not start with a number"));
    }
    let unit_bytes: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "s" => LOGICAL_BLOCK_SIZE as u64,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        other => return Err(format!("unknown size unit '{other}' in '{s}'")),
    };
    let n: u64 = digits.parse().map_err(|e| format!("invalid size '{s}': {e}"))?;
    n.checked_mul(unit_bytes)
        .ok_or_else(|| format!("size '{s}' overflows"))
}

/// A size that must be a whole number of logical blocks, returned in bytes.
fn parse_block_aligned(s: &str) -> Result<u64, String> {
    let n = parse_size(s)?;
    if n % LOGICAL_BLOCK_SIZE as u64 != 0 {
        return Err(format!("'{s}' is not a multiple of {LOGICAL_BLOCK_SIZE}"));
    }
    Ok(n)
}

/// `--max-io-size`, converted to logical blocks and capped at the largest
/// IO a reader accepts.
fn parse_max_io_blocks(s: &str) -> Result<u32, String> {
    let blocks = parse_block_aligned(s)? / LOGICAL_BLOCK_SIZE as u64;
    if blocks > u64::from(MAX_NORMAL_IO_BLOCKS) {
        return Err(format!(
            "'{s}' exceeds the {} byte IO limit",
            u64::from(MAX_NORMAL_IO_BLOCKS) * LOGICAL_BLOCK_SIZE as u64
        ));
    }
    Ok(blocks as u32)
}

/// Cache budget in bytes; must fit in memory addressing.
fn parse_cache_size(s: &str) -> Result<usize, String> {
    let n = parse_size(s)?;
    usize::try_from(n).map_err(|_| format!("cache size '{s}' is too large"))
}

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Block-device diff (wdiff) tools.
#[derive(Parser, Debug)]
#[command(
    name = "wdiff",
    version,
    about = "Inspect, merge and apply block-device diffs",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Force overwrite existing output files.
    #[arg(short = 'f', long, global = true)]
    force: bool,

    /// Quiet mode (suppress non-error output).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Output stats as JSON to stderr.
    #[arg(long = "json", global = true)]
    json_output: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the header and records of a diff file.
    Show(ShowArgs),
    /// Merge diff files (oldest first) into one sorted diff.
    Merge(MergeArgs),
    /// Write a base image overlaid with diff files (oldest first).
    Full(FullArgs),
    /// Rewrite a diff file in the indexed format.
    Index(IndexArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CompressionArg {
    None,
    Gzip,
    Snappy,
    Lzma,
}

impl From<CompressionArg> for CompressionType {
    fn from(c: CompressionArg) -> Self {
        match c {
            CompressionArg::None => Self::None,
            CompressionArg::Gzip => Self::Gzip,
            CompressionArg::Snappy => Self::Snappy,
            CompressionArg::Lzma => Self::Lzma,
        }
    }
}

#[derive(Args, Debug)]
struct CompressArgs {
    /// Payload compression.
    #[arg(long, value_enum, default_value_t = CompressionArg::Snappy)]
    compression: CompressionArg,

    /// Compression level (0-9, meaning depends on the codec).
    #[arg(long, short = 'l', value_parser = clap::value_parser!(u32).range(0..=9), default_value_t = DEFAULT_COMPRESS_LEVEL)]
    level: u32,

    /// Largest IO written, e.g. 64K or 128s (0 = inherit from the inputs).
    #[arg(long = "max-io-size", value_parser = parse_max_io_blocks, default_value_t = 0)]
    max_io_blocks: u32,
}

impl CompressArgs {
    fn options(&self) -> CompressOptions {
        CompressOptions {
            kind: self.compression.into(),
            level: self.level,
        }
    }

    fn max_io_blocks(&self) -> u32 {
        self.max_io_blocks
    }
}

#[derive(Args, Debug)]
struct ShowArgs {
    /// Diff file (sorted or indexed).
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Print only the statistics line.
    #[arg(long = "stat-only")]
    stat_only: bool,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Input diff files, oldest first.
    #[arg(value_hint = ValueHint::FilePath, required = true, num_args = 1..)]
    inputs: Vec<PathBuf>,

    /// Output sorted diff.
    #[arg(long, short = 'o', value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Fail unless every input carries the same uuid.
    #[arg(long = "validate-uuid")]
    validate_uuid: bool,

    /// Payload cache budget for indexed inputs, e.g. 32M.
    #[arg(long = "cache-size", value_parser = parse_cache_size, default_value_t = DEFAULT_CACHE_BYTES)]
    cache_size: usize,

    #[command(flatten)]
    compress: CompressArgs,
}

#[derive(Args, Debug)]
struct FullArgs {
    /// Base image (default: stdin).
    #[arg(long, short = 'b', value_hint = ValueHint::FilePath)]
    base: Option<PathBuf>,

    /// Diff files to apply, oldest first.
    #[arg(value_hint = ValueHint::FilePath)]
    diffs: Vec<PathBuf>,

    /// Output image (default: stdout).
    #[arg(long, short = 'o', value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Read buffer size, a whole number of 512-byte blocks (e.g. 64K or 128s).
    #[arg(long = "buffer-size", value_parser = parse_block_aligned, default_value_t = BUF_SIZE as u64)]
    buffer_size: u64,

    /// Payload cache budget for indexed inputs, e.g. 32M.
    #[arg(long = "cache-size", value_parser = parse_cache_size, default_value_t = DEFAULT_CACHE_BYTES)]
    cache_size: usize,
}

#[derive(Args, Debug)]
struct IndexArgs {
    /// Input diff file (sorted or indexed).
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output indexed diff.
    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    compress: CompressArgs,
}

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Copy)]
struct Globals {
    force: bool,
    quiet: bool,
    verbose: u8,
    json_output: bool,
}

#[cfg(any(test, feature = "fuzzing"))]
pub fn fuzz_try_parse_args(args: &[String]) {
    let argv: Vec<String> = std::iter::once("wdiff".to_string())
        .chain(args.iter().cloned())
        .collect();
    let _ = Cli::try_parse_from(argv);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn stat_json(s: &DiffStatistics) -> serde_json::Value {
    serde_json::json!({
        "wdiff_nr": s.wdiff_nr,
        "normal_nr": s.normal_nr,
        "all_zero_nr": s.all_zero_nr,
        "discard_nr": s.discard_nr,
        "normal_lb": s.normal_lb,
        "all_zero_lb": s.all_zero_lb,
        "discard_lb": s.discard_lb,
        "data_size": s.data_size,
    })
}

fn print_json(v: &serde_json::Value) {
    eprintln!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Refuse to clobber `path` unless `--force` was given.
fn check_output(path: &Path, g: Globals) -> bool {
    if path.exists() && !g.force {
        eprintln!(
            "wdiff: output file exists, use -f to overwrite: {}",
            path.display()
        );
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Show command
// ---------------------------------------------------------------------------

fn cmd_show(args: &ShowArgs, g: Globals) -> i32 {
    let stdout = io::stdout();
    let mut out = BufWriter::with_capacity(BUF_SIZE, stdout.lock());
    let result = if args.stat_only {
        show_file(&args.input, &mut io::sink())
    } else {
        show_file(&args.input, &mut out)
    };
    let (header, stat) = match result {
        Ok(r) => r,
        Err(e) => {
            eprintln!("wdiff: show: {}: {e}", args.input.display());
            return 1;
        }
    };
    if args.stat_only {
        let _ = writeln!(out, "{stat}");
    }
    if let Err(e) = out.flush() {
        eprintln!("wdiff: show: write: {e}");
        return 1;
    }
    if g.verbose > 0 && !g.quiet && !args.stat_only {
        eprintln!("wdiff: show: {stat}");
    }
    if g.json_output {
        print_json(&serde_json::json!({
            "command": "show",
            "type": header.file_type.as_str(),
            "uuid": header.uuid.to_string(),
            "max_io_blocks": header.max_io_blocks,
            "stat": stat_json(&stat),
        }));
    }
    0
}

// ---------------------------------------------------------------------------
// Merge command
// ---------------------------------------------------------------------------

fn cmd_merge(args: &MergeArgs, g: Globals) -> i32 {
    if !check_output(&args.output, g) {
        return 1;
    }
    let opts = MergeOptions {
        compress: args.compress.options(),
        max_io_blocks: args.compress.max_io_blocks(),
        validate_uuid: args.validate_uuid,
        cache_bytes: args.cache_size,
    };
    let stats = match merge_files(&args.inputs, &args.output, &opts) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("wdiff: merge: {e}");
            return 1;
        }
    };
    if !g.quiet && g.verbose > 0 {
        eprintln!("wdiff: merge: in  {}", stats.stat_in);
        eprintln!("wdiff: merge: out {}", stats.stat_out);
    }
    if g.json_output {
        print_json(&serde_json::json!({
            "command": "merge",
            "inputs": stats.inputs,
            "output_size": stats.output_size,
            "uuid": stats.header.uuid.to_string(),
            "max_io_blocks": stats.header.max_io_blocks,
            "compression": args.compress.options().kind.as_str(),
            "stat_in": stat_json(&stats.stat_in),
            "stat_out": stat_json(&stats.stat_out),
        }));
    }
    0
}

// ---------------------------------------------------------------------------
// Full command
// ---------------------------------------------------------------------------

fn cmd_full(args: &FullArgs, g: Globals) -> i32 {
    let base: Box<dyn BaseReader> = match &args.base {
        Some(path) => match File::open(path) {
            Ok(f) => open_base(f),
            Err(e) => {
                eprintln!("wdiff: base image: {}: {e}", path.display());
                return 1;
            }
        },
        None => Box::new(Sequential(BufReader::with_capacity(
            BUF_SIZE,
            io::stdin().lock(),
        ))),
    };

    let mut out: Box<dyn Write> = match &args.output {
        None => Box::new(BufWriter::with_capacity(BUF_SIZE, io::stdout().lock())),
        Some(path) => {
            if !check_output(path, g) {
                return 1;
            }
            match File::create(path) {
                Ok(f) => Box::new(BufWriter::with_capacity(BUF_SIZE, f)),
                Err(e) => {
                    eprintln!("wdiff: output file: {}: {e}", path.display());
                    return 1;
                }
            }
        }
    };

    let buf_size = usize::try_from(args.buffer_size).unwrap_or(BUF_SIZE);
    let cache = args.cache_size;
    let stats = match virtual_full(base, &args.diffs, &mut out, buf_size, cache) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("wdiff: full: {e}");
            return 1;
        }
    };
    if let Err(e) = out.flush() {
        eprintln!("wdiff: full: write: {e}");
        return 1;
    }

    if g.verbose > 0 && !g.quiet {
        eprintln!(
            "wdiff: full: {} bytes, {} diffs, {} ios applied",
            stats.output_size,
            args.diffs.len(),
            stats.stat_out.total_ios()
        );
    }
    if g.json_output {
        print_json(&serde_json::json!({
            "command": "full",
            "output_size": stats.output_size,
            "diffs": args.diffs.len(),
            "sha256": stats.output_sha256.map(|h| hex(&h)),
            "stat_in": stat_json(&stats.stat_in),
            "stat_out": stat_json(&stats.stat_out),
        }));
    }
    0
}

// ---------------------------------------------------------------------------
// Index command
// ---------------------------------------------------------------------------

fn cmd_index(args: &IndexArgs, g: Globals) -> i32 {
    if !check_output(&args.output, g) {
        return 1;
    }
    let stats = match index_file(
        &args.input,
        &args.output,
        args.compress.options(),
        args.compress.max_io_blocks(),
    ) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("wdiff: index: {}: {e}", args.input.display());
            return 1;
        }
    };
    if g.verbose > 0 && !g.quiet {
        eprintln!(
            "wdiff: index: {} records, {} bytes",
            stats.n_records, stats.output_size
        );
    }
    if g.json_output {
        print_json(&serde_json::json!({
            "command": "index",
            "records": stats.n_records,
            "output_size": stats.output_size,
            "stat": stat_json(&stats.stat),
        }));
    }
    0
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Main CLI entry point. Parses arguments via clap, dispatches commands.
pub fn run() -> ! {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let cli = Cli::parse();
    let g = Globals {
        force: cli.force,
        quiet: cli.quiet,
        verbose: cli.verbose.min(2),
        json_output: cli.json_output,
    };

    let exit_code = match &cli.command {
        Cmd::Show(a) => cmd_show(a, g),
        Cmd::Merge(a) => cmd_merge(a, g),
        Cmd::Full(a) => cmd_full(a, g),
        Cmd::Index(a) => cmd_index(a, g),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
