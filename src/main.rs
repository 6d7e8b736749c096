//! mediadex - a background media-indexing daemon.
//!
//! With no subcommand, runs as the daemon: indexes every configured
//! library path, watches them and `/media` for changes, and blocks until
//! interrupted. Any subcommand drives the same capabilities from the CLI
//! instead (see [`cli`]).

pub mod cli;
pub mod config;
pub mod error;
pub mod folder_art;
pub mod fsutil;
pub mod index;
pub mod invalidate;
pub mod metadata;
pub mod model;
pub mod mount;
pub mod scanner;
pub mod store;
pub mod volume;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use invalidate::Invalidator;
use volume::VolumeManager;

fn main() -> std::process::ExitCode {
    // The extractor worker process is spawned as `current_exe
    // --extractor-worker` by `metadata::worker::WorkerHandle`; it carries
    // no other arguments, so it's intercepted before clap ever parses the
    // rest of the command line.
    if std::env::args().nth(1).as_deref() == Some("--extractor-worker") {
        return run_extractor_worker();
    }

    let args = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env().add_directive("mediadex=info".parse().unwrap()))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return std::process::ExitCode::from(100);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(RunError::Init(e)) => {
            tracing::error!(error = %e, "fatal error during startup");
            std::process::ExitCode::from(100)
        }
        Err(RunError::Mainloop(e)) => {
            tracing::error!(error = %e, "daemon exited abnormally");
            std::process::ExitCode::from(99)
        }
    }
}

/// Distinguishes §6's two non-zero exit codes: a failure before the
/// daemon loop is up (100, fatal init error) from one the loop itself
/// reports after it starts (99, mainloop returned anomalously).
enum RunError {
    Init(anyhow::Error),
    Mainloop(anyhow::Error),
}

async fn run(args: Cli) -> Result<(), RunError> {
    let config = config::load();

    match cli::run_command(&args, &config).await {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        Err(e) => return Err(RunError::Init(e)),
    }

    run_daemon(config).await
}

/// No subcommand given: index and watch every configured library path,
/// plus (unless disabled) removable volumes appearing under `/media`,
/// until INT/TERM.
async fn run_daemon(config: Config) -> Result<(), RunError> {
    let manager = init_daemon(&config).await.map_err(RunError::Init)?;

    tracing::info!(paths = ?config.library.paths, "mediadex daemon started");
    cli::wait_for_shutdown_signal().await;
    tracing::info!("mediadex daemon shutting down");
    drop(manager);
    Ok(())
}

/// Open the store, attach every configured library path and the `/media`
/// mount adapter. Any failure here (store won't open, etc.) is a fatal
/// init error, not an anomalous mainloop return.
async fn init_daemon(config: &Config) -> anyhow::Result<Arc<VolumeManager>> {
    let store_path = config::store_path()?;
    if let Some(parent) = store_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(store::Store::open(&store_path, store::OpenMode::ReadWrite).await?);

    let (invalidator, mut changes) = Invalidator::new(config.timing.invalidation_delay());
    let manager = VolumeManager::new(store, invalidator, config.timing.clone());

    for path in &config.library.paths {
        manager.queue_add_volume(path.clone()).await;
    }
    if config.library.watch_for_changes {
        mount::spawn(PathBuf::from("/media"), Arc::clone(&manager));
    }

    tokio::spawn(async move {
        while let Some(scope) = changes.recv().await {
            tracing::debug!(%scope, "catalog changed");
        }
    });

    Ok(manager)
}

/// Entry point for the `--extractor-worker` hidden subcommand: a
/// crash-isolated child that performs the actual metadata extraction and
/// self-terminates after sitting idle.
fn run_extractor_worker() -> std::process::ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("extractor worker failed to start runtime: {e}");
            return std::process::ExitCode::from(100);
        }
    };

    let idle_timeout = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(30));

    match runtime.block_on(metadata::worker::run(idle_timeout)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("extractor worker error: {e}");
            std::process::ExitCode::from(99)
        }
    }
}
