//! Downkit CLI - command-line downloader
//!
//! Thin frontend over the orchestration core: builds tasks from arguments,
//! plugs in the reqwest engine and the indicatif sink, and drives either
//! the async path (enqueue + wait) or the blocking sync bridge (`--sync`).

mod engine;
mod progress;

use anyhow::{bail, Context, Result};
use clap::Parser;
use downkit_core::{Dispatcher, DispatcherConfig, NoopSink, ProgressSink, TaskBuilder, TaskStatus};
use engine::HttpEngine;
use progress::ProgressRenderer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Downkit - download files from the command line
#[derive(Parser)]
#[command(name = "downkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// URLs to download
    #[arg(required = true)]
    urls: Vec<String>,

    /// Destination directory (defaults to the platform download dir)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Extra request header as "Key: Value"; repeatable
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Discard partial files and download from scratch
    #[arg(long)]
    force: bool,

    /// Disable breakpoint resume
    #[arg(long)]
    no_resume: bool,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Overall transfer timeout in seconds (unlimited by default)
    #[arg(long)]
    transfer_timeout: Option<u64>,

    /// Fetch each URL through the blocking path, one at a time
    #[arg(long)]
    sync: bool,

    /// Print the final task state as JSON
    #[arg(long)]
    json: bool,

    /// Suppress progress bars
    #[arg(short, long)]
    quiet: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected \"Key: Value\", got {raw:?}"))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new().context("failed to start the dispatch runtime")?;

    let storage_root = cli
        .dir
        .clone()
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let sink: Arc<dyn ProgressSink> = if cli.quiet {
        Arc::new(NoopSink)
    } else {
        Arc::new(ProgressRenderer::new())
    };

    let dispatcher = Dispatcher::new(
        Arc::new(HttpEngine::new()),
        sink,
        DispatcherConfig { storage_root },
        runtime.handle().clone(),
    );

    // Ctrl-C cancels everything in flight; the wait loop below drains.
    runtime.spawn({
        let dispatcher = dispatcher.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let cancelled = dispatcher.cancel_all();
                tracing::info!(count = cancelled.len(), "interrupted, cancelling downloads");
            }
        }
    });

    let mut tasks = Vec::new();
    for url in &cli.urls {
        let mut builder = TaskBuilder::new(url)
            .connect_timeout(Duration::from_secs(cli.connect_timeout))
            .force_redownload(cli.force)
            .breakpoint_resume(!cli.no_resume);
        if let Some(secs) = cli.transfer_timeout {
            builder = builder.transfer_timeout(Duration::from_secs(secs));
        }
        for (key, value) in &cli.headers {
            builder = builder.header(key, value);
        }
        tasks.push(builder.build());
    }

    if cli.sync {
        // Main thread is not a runtime thread, so the bridge is usable here.
        for task in &tasks {
            let url = task.url();
            match dispatcher.blocking_fetch(task.clone()) {
                Ok(path) => println!("{}", path.display()),
                Err(cause) => eprintln!("{url}: {cause}"),
            }
        }
    } else {
        for task in &tasks {
            let url = task.url();
            match dispatcher.enqueue(task.clone()) {
                Ok(true) => {}
                Ok(false) => eprintln!("{url}: a download for this URL is already active"),
                Err(cause) => eprintln!("{url}: {cause}"),
            }
        }
        while dispatcher.active_count() > 0 {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    if cli.json {
        let snapshots: Vec<_> = tasks.iter().map(|task| task.snapshot()).collect();
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    }

    let failed = tasks
        .iter()
        .filter(|task| task.status() != TaskStatus::Completed)
        .count();
    if failed > 0 {
        bail!("{failed} download(s) did not complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parsing() {
        assert_eq!(
            parse_header("Cookie: a=1").unwrap(),
            ("Cookie".to_string(), "a=1".to_string())
        );
        assert_eq!(
            parse_header("X-Token:abc:def").unwrap(),
            ("X-Token".to_string(), "abc:def".to_string())
        );
        assert!(parse_header("no separator").is_err());
    }
}
