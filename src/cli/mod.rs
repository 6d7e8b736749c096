//! Ambient CLI (§2.1): a local, synchronous way to drive the same
//! capability trait the daemon uses, standing in for the out-of-scope RPC
//! façade. `scan`/`watch` exercise the indexing side; `query`/`list-*`
//! exercise the read side through [`crate::store::ReadApi`];
//! `archive`/`restore`/`stats` are direct store operations.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;

use crate::config::{self, Config};
use crate::folder_art::FolderArtResolver;
use crate::index;
use crate::invalidate::Invalidator;
use crate::metadata::MetadataExtractor;
use crate::model::{Filter, MediaType, OrderBy};
use crate::scanner::Scanner;
use crate::store::{OpenMode, ReadApi, Store};
use crate::volume::VolumeManager;

/// mediadex: a background media-indexing daemon and its operator CLI.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// One-shot scan and index of a directory (no watcher installed).
    Scan { path: PathBuf },

    /// Index a directory, then watch it for changes until interrupted.
    Watch { path: PathBuf },

    /// Full-text search the catalog.
    Query {
        /// Search term; empty string selects by type/filter only.
        #[arg(default_value = "")]
        term: String,
        #[arg(long, value_enum, default_value = "audio")]
        r#type: MediaTypeArg,
        #[arg(long)]
        artist: Option<String>,
        #[arg(long)]
        album: Option<String>,
        #[arg(long)]
        album_artist: Option<String>,
        #[arg(long)]
        genre: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long, value_enum, default_value = "default")]
        order: OrderArg,
        #[arg(long, default_value_t = false)]
        reverse: bool,
    },

    /// List every distinct album.
    ListAlbums,

    /// List every distinct artist.
    ListArtists,

    /// Move every item whose path starts with `prefix` into the attic.
    Archive { prefix: String },

    /// Move every attic item whose path starts with `prefix` back to live.
    Restore { prefix: String },

    /// Print catalog size and per-type presence.
    Stats,
}

/// `clap`-facing mirror of [`MediaType`], restricted to the three
/// storable variants a CLI caller can sensibly ask for.
#[derive(Clone, Copy, ValueEnum)]
pub enum MediaTypeArg {
    Audio,
    Video,
    Image,
}

impl From<MediaTypeArg> for MediaType {
    fn from(v: MediaTypeArg) -> Self {
        match v {
            MediaTypeArg::Audio => MediaType::Audio,
            MediaTypeArg::Video => MediaType::Video,
            MediaTypeArg::Image => MediaType::Image,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OrderArg {
    Default,
    Rank,
    Title,
    Date,
    Modified,
}

impl From<OrderArg> for OrderBy {
    fn from(v: OrderArg) -> Self {
        match v {
            OrderArg::Default => OrderBy::Default,
            OrderArg::Rank => OrderBy::Rank,
            OrderArg::Title => OrderBy::Title,
            OrderArg::Date => OrderBy::Date,
            OrderArg::Modified => OrderBy::Modified,
        }
    }
}

/// Run the specified CLI command. Returns `Ok(true)` if a command ran.
pub async fn run_command(cli: &Cli, config: &Config) -> anyhow::Result<bool> {
    let Some(command) = &cli.command else {
        return Ok(false);
    };

    let store_path = config::store_path()?;
    if let Some(parent) = store_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open(&store_path, OpenMode::ReadWrite).await?);

    match command {
        Commands::Scan { path } => cmd_scan(&store, path, config).await?,
        Commands::Watch { path } => cmd_watch(store, path.clone(), config).await?,
        Commands::Query {
            term,
            r#type,
            artist,
            album,
            album_artist,
            genre,
            offset,
            limit,
            order,
            reverse,
        } => {
            let filter = build_filter(
                artist.clone(),
                album.clone(),
                album_artist.clone(),
                genre.clone(),
                *offset,
                *limit,
                (*order).into(),
                *reverse,
            );
            let results = store.query(term, (*r#type).into(), &filter).await?;
            let mut resolver = FolderArtResolver::new();
            for file in &results {
                let folder_art = std::path::Path::new(&file.filename)
                    .parent()
                    .and_then(|dir| resolver.resolve(dir));
                println!(
                    "{}\t{}\t{}\t{}",
                    file.filename,
                    file.effective_title(),
                    file.author,
                    file.art_uri(folder_art.as_deref())
                );
            }
            println!("{} result(s)", results.len());
        }
        Commands::ListAlbums => {
            let mut resolver = FolderArtResolver::new();
            for album in store.list_albums(&Filter::new()).await? {
                let folder_art = std::path::Path::new(&album.art_file_path)
                    .parent()
                    .and_then(|dir| resolver.resolve(dir));
                println!(
                    "{}\t{}\t{}",
                    album.title,
                    album.artist,
                    album.art_uri(folder_art.as_deref())
                );
            }
        }
        Commands::ListArtists => {
            for artist in store.list_artists(&Filter::new()).await? {
                println!("{artist}");
            }
        }
        Commands::Archive { prefix } => {
            store.archive_items(prefix).await?;
            println!("archived items under {prefix}");
        }
        Commands::Restore { prefix } => {
            store.restore_items(prefix).await?;
            println!("restored items under {prefix}");
        }
        Commands::Stats => {
            println!("total records: {}", store.size().await?);
            println!("has audio: {}", store.has_media(MediaType::Audio).await?);
            println!("has video: {}", store.has_media(MediaType::Video).await?);
            println!("has image: {}", store.has_media(MediaType::Image).await?);
        }
    }

    Ok(true)
}

#[allow(clippy::too_many_arguments)]
fn build_filter(
    artist: Option<String>,
    album: Option<String>,
    album_artist: Option<String>,
    genre: Option<String>,
    offset: i64,
    limit: i64,
    order: OrderBy,
    reverse: bool,
) -> Filter {
    let mut filter = Filter::new().with_offset(offset).with_limit(limit).with_order(order).with_reverse(reverse);
    if let Some(v) = artist {
        filter = filter.with_artist(v);
    }
    if let Some(v) = album {
        filter = filter.with_album(v);
    }
    if let Some(v) = album_artist {
        filter = filter.with_album_artist(v);
    }
    if let Some(v) = genre {
        filter = filter.with_genre(v);
    }
    filter
}

/// `scan <path>`: one-shot restore→prune→scan, writing records directly
/// to the live store. No watcher is installed, matching the "manual
/// inspection" purpose of the CLI rather than the daemon's volume
/// lifecycle.
async fn cmd_scan(store: &Store, path: &std::path::Path, config: &Config) -> anyhow::Result<()> {
    let prefix = path.to_string_lossy().into_owned();
    store.restore_items(&prefix).await?;
    store.prune_deleted().await?;

    let mut scanner = Scanner::new(path.to_path_buf(), MediaType::AllMedia);
    let mut extractor = MetadataExtractor::new(config.timing.extractor_worker_idle());
    let mut indexed = 0usize;
    while let Some(detected) = scanner.next().await {
        if index::index_into_store(store, &mut extractor, std::path::Path::new(&detected.filename)).await? {
            indexed += 1;
        }
    }
    println!("indexed {indexed} file(s) under {}", path.display());
    Ok(())
}

/// `watch <path>`: index `path`, attach a subtree watcher, then block
/// until INT/TERM, matching §6's process-control contract for a
/// foreground daemon loop over one root.
async fn cmd_watch(store: Arc<Store>, path: PathBuf, config: &Config) -> anyhow::Result<()> {
    let (invalidator, mut changes) = Invalidator::new(config.timing.invalidation_delay());
    let manager = VolumeManager::new(store, invalidator, config.timing.clone());
    manager.queue_add_volume(path.clone()).await;

    tokio::spawn(async move {
        while let Some(scope) = changes.recv().await {
            tracing::debug!(%scope, "catalog changed");
        }
    });

    println!("watching {} — press ctrl-c to stop", path.display());
    wait_for_shutdown_signal().await;
    println!("shutting down");
    Ok(())
}

/// Blocks until INT or TERM, per §6's signal handling contract. Shared
/// with the no-subcommand daemon path in `main.rs`.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
