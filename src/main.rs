//! CLI entry point for the downdraft tool.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use downdraft_core::{
    Coordinator, DownloadError, EngineConfig, Outcome, ProgressEvent, ProgressSink, SourceKind,
    StateStore, classify, format_size, looks_like_playlist, resolver_for,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

/// Exit code for invalid input (bad URL, unsupported source kind).
const EXIT_INVALID_INPUT: u8 = 1;
/// Exit code for a fatal, non-retryable failure.
const EXIT_FATAL: u8 = 2;
/// Exit code when the retry budget was exhausted.
const EXIT_RETRIES_EXHAUSTED: u8 = 3;
/// Conventional exit code after SIGINT-style cancellation.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = build_config(&args);
    let store = Arc::new(match &args.state_file {
        Some(path) => StateStore::open(path).context("opening state ledger")?,
        None => StateStore::open_default().context("opening state ledger")?,
    });

    if args.list_resumable {
        list_resumable(&store);
        return Ok(ExitCode::SUCCESS);
    }

    // Clap guarantees the URL is present unless --list-resumable was given.
    let Some(url) = args.url.clone() else {
        eprintln!("error: no URL provided");
        return Ok(ExitCode::from(EXIT_INVALID_INPUT));
    };

    let kind = classify(&url);
    debug!(%url, kind = kind.label(), "classified URL");
    match kind {
        SourceKind::Invalid => {
            eprintln!("error: not a valid http(s) URL: {url}");
            return Ok(ExitCode::from(EXIT_INVALID_INPUT));
        }
        SourceKind::ProviderRepository => {
            eprintln!(
                "error: {url} is a repository page, not a file. \
                 Pass a direct file URL (e.g. a /resolve/... link)."
            );
            return Ok(ExitCode::from(EXIT_INVALID_INPUT));
        }
        SourceKind::VideoSite => {
            eprintln!(
                "error: {url} is a video/streaming page. \
                 Use a media extractor tool; this tool fetches plain files."
            );
            return Ok(ExitCode::from(EXIT_INVALID_INPUT));
        }
        SourceKind::DirectDownload | SourceKind::Unrecognized => {}
    }
    if looks_like_playlist(&url) {
        warn!(%url, "URL looks like a playlist/collection; fetching it as a single resource");
    }

    let Some(resolver) = resolver_for(kind) else {
        eprintln!("error: no resolver available for {url}");
        return Ok(ExitCode::from(EXIT_INVALID_INPUT));
    };
    let resolved = match resolver.resolve(&url).await {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(ExitCode::from(EXIT_INVALID_INPUT));
        }
    };

    let destination = args
        .destination
        .clone()
        .unwrap_or_else(|| args.output_dir.join(&resolved.suggested_filename));
    info!(url = %resolved.download_url, destination = %destination.display(), "starting download");

    let coordinator = Coordinator::new(Arc::clone(&store), config)
        .context("building download coordinator")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, pausing download");
            signal_cancel.cancel();
        }
    });

    let bar = (!args.quiet).then(progress_bar);
    let sink_bar = bar.clone();
    let sink = move |event: ProgressEvent| {
        if let Some(bar) = &sink_bar {
            render_progress(bar, &event);
        }
    };
    let sink: &ProgressSink = &sink;

    let outcome = coordinator
        .run(&resolved.download_url, &destination, &cancel, Some(sink))
        .await;

    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    Ok(match outcome {
        Outcome::Completed {
            final_path,
            bytes_downloaded,
        } => {
            println!(
                "completed: {} ({})",
                final_path.display(),
                format_size(bytes_downloaded)
            );
            ExitCode::SUCCESS
        }
        Outcome::Cancelled { bytes_downloaded } => {
            println!(
                "paused: {} downloaded, run the same command to resume",
                format_size(bytes_downloaded)
            );
            ExitCode::from(EXIT_CANCELLED)
        }
        Outcome::Failed { error, attempts } => {
            eprintln!("error: {error}");
            ExitCode::from(failure_exit_code(&error, attempts))
        }
    })
}

/// Layers CLI flag overrides over the file-backed configuration.
fn build_config(args: &Args) -> EngineConfig {
    let mut config = EngineConfig::load();
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size.max(1);
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(ms) = args.backoff_base_ms {
        config.backoff_base = Duration::from_millis(ms);
    }
    if let Some(ms) = args.backoff_cap_ms {
        config.backoff_cap = Duration::from_millis(ms);
    }
    if let Some(ms) = args.checkpoint_interval_ms {
        config.checkpoint_interval = Duration::from_millis(ms);
    }
    config
}

/// Maps a terminal failure to the documented exit codes: invalid input,
/// fatal, or retries exhausted.
fn failure_exit_code(error: &DownloadError, attempts: u32) -> u8 {
    use downdraft_core::download::{FailureType, classify_error};

    if matches!(error, DownloadError::InvalidUrl { .. }) {
        return EXIT_INVALID_INPUT;
    }
    match classify_error(error) {
        FailureType::Permanent => EXIT_FATAL,
        FailureType::Transient | FailureType::RateLimited => {
            debug!(attempts, "retry budget exhausted");
            EXIT_RETRIES_EXHAUSTED
        }
    }
}

fn list_resumable(store: &StateStore) {
    let candidates = store.find_resumable(None);
    if candidates.is_empty() {
        println!("no resumable downloads");
        return;
    }
    for candidate in candidates {
        let total = if candidate.total_size > 0 {
            format_size(candidate.total_size)
        } else {
            "unknown".to_string()
        };
        println!(
            "{:5.1}%  {} / {}  {}  <- {}",
            candidate.progress_percent,
            format_size(candidate.partial_size),
            total,
            candidate.filepath.display(),
            candidate.url,
        );
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    #[allow(clippy::expect_used)] // template is a compile-time literal
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
        )
        .expect("progress template is valid")
        .progress_chars("=>-"),
    );
    bar
}

fn render_progress(bar: &ProgressBar, event: &ProgressEvent) {
    if let Some(total) = event.total_bytes {
        bar.set_length(total);
    }
    bar.set_message(event.display_name.clone());
    bar.set_position(event.downloaded_bytes);
}
