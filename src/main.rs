//! CLI entry point for the mediafetch tool.

use std::io::{self, IsTerminal, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use mediafetch_core::{
    Config, Core, Database, DownloadOptions, HistoryStore, QueueManager, Scheduler,
    build_default_engine_registry, build_default_extractor_registry,
    postprocess::PostProcessor,
};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    // Read input: positional args or stdin.
    let urls: Vec<String> = if args.urls.is_empty() {
        if io::stdin().is_terminal() {
            info!("No input provided. Pipe URLs via stdin or pass as arguments.");
            info!("Example: echo 'https://example.com/file.mp4' | mediafetch");
            return Ok(());
        }
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    } else {
        args.urls.clone()
    };

    if urls.is_empty() {
        info!("No URLs to download");
        return Ok(());
    }

    // Config: file, then CLI overrides, then validation.
    let mut config = Config::load(&args.config)?;
    if let Some(n) = args.concurrency {
        config.max_concurrent_downloads = n;
    }
    if let Some(dir) = &args.output_dir {
        config.default_output_dir.clone_from(dir);
    }
    if args.proxy.is_some() {
        config.proxy.clone_from(&args.proxy);
    }
    if args.rate_limit.is_some() {
        config.rate_limit.clone_from(&args.rate_limit);
    }
    let config = config.validated().map_err(|e| anyhow::anyhow!("{e}"))?;

    let db = Database::open(&args.history_db).await?;
    let history = Arc::new(HistoryStore::new(db));
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    let queue = Arc::new(QueueManager::new(config.queue_size_limit));
    let core = Arc::new(Core::new(
        Arc::clone(&queue),
        Arc::clone(&history),
        Arc::new(build_default_extractor_registry(client.clone())),
        Arc::new(build_default_engine_registry(client)),
        Arc::new(PostProcessor::from_path()),
        config.clone(),
    ));

    let options = DownloadOptions {
        output_dir: config.default_output_dir.clone(),
        force_generic: args.force_generic,
        ..DownloadOptions::default()
    };

    let mut enqueued = 0usize;
    for url in &urls {
        match queue.add(url.clone(), options.clone(), None) {
            Ok(id) => {
                debug!(id, url = %url, "enqueued");
                enqueued += 1;
            }
            Err(e) => warn!(url = %url, error = %e, "could not enqueue"),
        }
    }
    info!(enqueued, "queue loaded");

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;

    let (spinner_handle, stop) = spawn_spinner(!args.no_spinner, Arc::clone(&queue), enqueued);

    // Drain: done when nothing is waiting or running.
    loop {
        let stats = queue.statistics();
        let pending = stats.scheduled
            + stats.queued
            + stats.allocating
            + stats.downloading
            + stats.processing
            + stats.paused;
        if pending == 0 {
            break;
        }
        queue.wait_for_change(Duration::from_millis(250)).await;
    }

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = spinner_handle {
        let _ = handle.await;
    }
    scheduler.shutdown(Duration::from_secs(30)).await;

    let stats = queue.statistics();
    info!(
        completed = stats.completed,
        failed = stats.errors,
        cancelled = stats.cancelled,
        "run finished"
    );
    for item in queue.list() {
        if let Some(message) = &item.error_message {
            warn!(url = %item.url, %message, "failed");
        }
    }

    if stats.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Spawns the progress spinner driven off queue statistics.
///
/// Returns (handle, stop) so the caller can signal stop and await the
/// handle. When disabled, returns (None, stop) with stop already true.
fn spawn_spinner(
    enabled: bool,
    queue: Arc<QueueManager>,
    total: usize,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let handle = tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop_flag.load(Ordering::SeqCst) {
            let stats = queue.statistics();
            let done = stats.completed + stats.errors + stats.cancelled;
            spinner.set_message(format!(
                "[{done}/{total}] downloading ({} active, {} queued)",
                stats.downloading + stats.processing,
                stats.queued + stats.scheduled
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        spinner.finish_and_clear();
    });
    (Some(handle), stop)
}
