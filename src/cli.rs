//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Resumable file downloader with durable progress state.
///
/// Downloads a URL to a destination file, checkpointing progress so an
/// interrupted transfer (Ctrl-C, crash, network drop) continues from its
/// last flushed byte on the next run.
#[derive(Parser, Debug)]
#[command(name = "downdraft")]
#[command(author, version, about)]
pub struct Args {
    /// URL to download.
    #[arg(required_unless_present = "list_resumable")]
    pub url: Option<String>,

    /// Destination file path (defaults to the URL's filename in the output
    /// directory).
    pub destination: Option<PathBuf>,

    /// Output directory used when no destination path is given.
    #[arg(short = 'o', long, default_value = ".")]
    pub output_dir: PathBuf,

    /// List interrupted downloads that can be resumed, then exit.
    #[arg(long)]
    pub list_resumable: bool,

    /// Transfer chunk size in bytes.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Maximum retry attempts for transient failures (0-10).
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub max_retries: Option<u32>,

    /// Base retry backoff delay in milliseconds.
    #[arg(long)]
    pub backoff_base_ms: Option<u64>,

    /// Retry backoff delay cap in milliseconds.
    #[arg(long)]
    pub backoff_cap_ms: Option<u64>,

    /// Minimum interval between progress checkpoints in milliseconds.
    #[arg(long)]
    pub checkpoint_interval_ms: Option<u64>,

    /// State ledger file (defaults to the per-user config area).
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output.
    #[arg(short, long)]
    pub quiet: bool,
}
