//! gencache administration binary
//!
//! Inspect and maintain a cache on disk.
//!
//! # Examples
//!
//! ```bash
//! # Create an empty cache as configured
//! gencache --config gencache.toml create
//!
//! # Store files and print their hashes
//! gencache put build/app.wasm build/app.js
//!
//! # Fetch an object by hash
//! gencache get 3f2a...e1 --output app.wasm
//!
//! # Evict old generations down to 500 MB
//! gencache trim 500000000
//! ```

use bytes::Bytes;
use clap::{Parser, Subcommand};
use gencache::cache::{CacheStore, ContentHash, ContentStore, LruCache};
use gencache::error::Error;
use gencache::metrics::{export_metrics, init_metrics};
use gencache::CacheConfig;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Generational content-addressed object cache
#[derive(Parser, Debug)]
#[command(name = "gencache")]
#[command(version = gencache::VERSION)]
#[command(about = "Generational content-addressed object cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "GENCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "GENCACHE_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty cache, replacing any existing one
    Create,

    /// Store files in the cache
    Put {
        /// Files to store
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Fetch an object by its hash
    Get {
        /// 40-character hex content hash
        hash: ContentHash,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the hashes of all stored objects
    List,

    /// Show cache statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evict the oldest generations
    Trim {
        /// Size to shrink to in bytes (defaults to the configured trim target)
        target: Option<u64>,
    },

    /// Change capacity, migrating the existing contents
    Resize {
        #[arg(long)]
        max_items: usize,

        #[arg(long)]
        max_size: u64,
    },

    /// Print Prometheus metrics for the opened cache
    Metrics,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;
    init_metrics();

    let config = CacheConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Create => create_command(&config),
        Commands::Put { files } => put_command(&config, files).await,
        Commands::Get { hash, output } => get_command(&config, hash, output).await,
        Commands::List => list_command(&config),
        Commands::Stats { json } => stats_command(&config, json),
        Commands::Trim { target } => trim_command(&config, target).await,
        Commands::Resize {
            max_items,
            max_size,
        } => resize_command(&config, max_items, max_size),
        Commands::Metrics => {
            let _cache = config.open_cache()?;
            print!("{}", export_metrics());
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
///
/// Console logs go to stderr so `get` can stream objects to stdout.
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "gencache.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn create_command(config: &CacheConfig) -> anyhow::Result<()> {
    let cache = LruCache::create_new(
        &config.index_path,
        &config.data_path,
        config.max_items,
        config.max_size,
    )?;
    println!(
        "✅ Created cache at {} ({} items, {} bytes)",
        config.index_path.display(),
        cache.max_items(),
        cache.max_size()
    );
    Ok(())
}

async fn put_command(config: &CacheConfig, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let cache = Arc::new(config.open_cache()?);
    let store = CacheStore::new(Arc::clone(&cache));

    for file in files {
        let data = tokio::fs::read(&file).await?;
        let len = data.len();
        let hash = store.put(Bytes::from(data)).await?;
        if store.contains(&hash).await? {
            println!("{}  {}", hash, file.display());
        } else {
            warn!(file = %file.display(), len, "Cache full, object not stored");
            println!("{}  {} (not stored)", hash, file.display());
        }
    }

    cache.save_async().await?;
    Ok(())
}

async fn get_command(
    config: &CacheConfig,
    hash: ContentHash,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let cache = Arc::new(config.open_cache()?);
    let store = CacheStore::new(Arc::clone(&cache));

    let Some(data) = store.get(&hash).await? else {
        anyhow::bail!("object {} not found", hash);
    };

    match output {
        Some(path) => {
            tokio::fs::write(&path, &data).await?;
            info!(%hash, path = %path.display(), len = data.len(), "Wrote object");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }

    // Persist the refreshed generation
    cache.save_async().await?;
    Ok(())
}

fn list_command(config: &CacheConfig) -> anyhow::Result<()> {
    let cache = config.open_cache()?;
    let mut hashes = cache.hashes();
    hashes.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
    for hash in hashes {
        println!("{}", hash);
    }
    Ok(())
}

fn stats_command(config: &CacheConfig, json: bool) -> anyhow::Result<()> {
    let cache = config.open_cache()?;
    let stats = cache.stats();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Cache: {}", cache.index_path().display());
    println!("───────────────────────────────");
    println!("Items:              {} / {}", stats.num_items, stats.max_items);
    println!("Bytes:              {}", stats.num_bytes);
    println!("With block slack:   {}", stats.num_bytes_with_block_slack);
    println!("With page slack:    {} / {}", stats.num_bytes_with_page_slack, stats.max_size);
    println!("Free pages:         {}", stats.num_free_pages);
    println!("Generation:         {}", stats.generation);
    Ok(())
}

async fn trim_command(config: &CacheConfig, target: Option<u64>) -> anyhow::Result<()> {
    let cache = Arc::new(config.open_cache()?);
    let target = target.unwrap_or_else(|| config.trim_target());
    let before = cache.stats();

    if !cache.trim_async(target).await? {
        anyhow::bail!("trim refused: cache is in use");
    }

    let after = cache.stats();
    println!(
        "✅ Trimmed {} objects ({} → {} bytes)",
        before.num_items - after.num_items,
        before.num_bytes,
        after.num_bytes
    );
    Ok(())
}

fn resize_command(config: &CacheConfig, max_items: usize, max_size: u64) -> anyhow::Result<()> {
    let before = match LruCache::open(&config.index_path, &config.data_path) {
        Ok(cache) => cache.len(),
        Err(Error::MissingIndex(_)) => 0,
        Err(e) => return Err(e.into()),
    };
    let cache = LruCache::open_and_modify(&config.index_path, &config.data_path, max_items, max_size)?;
    let after = cache.stats();

    println!(
        "✅ Resized to {} items, {} bytes ({} of {} objects kept)",
        after.max_items, after.max_size, after.num_items, before
    );
    Ok(())
}
