//! Subcommand implementations for the `apkzoo` binary

use crate::cli::{DownloadArgs, MetadataArgs, SearchArgs, SyncArgs};
use apkzoo::catalog::{Catalog, Database, HttpIndexSource, HttpMetadataSource, MetadataCatalog, SyncStats};
use apkzoo::config::{Config, MAX_CONCURRENCY};
use apkzoo::fetcher::HttpFetcher;
use apkzoo::humanize::ByteSize;
use apkzoo::queue::{Callbacks, DownloadQueue, QueueConfig, QueueError};
use apkzoo::storage::PackageStore;
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Wait between enqueue attempts while the backlog is full
const BACKLOG_RETRY: Duration = Duration::from_millis(200);

fn index_client(config: &Config) -> Result<reqwest::Client, AnyError> {
    Ok(reqwest::Client::builder()
        .user_agent(&config.archive.user_agent)
        .connect_timeout(config.archive.connect_timeout())
        .build()?)
}

async fn open_catalog(config: &Config) -> Result<Catalog, AnyError> {
    let db = Database::connect(&config.catalog.database_path).await?;
    let source = HttpIndexSource::new(&config.catalog, index_client(config)?);
    Ok(Catalog::new(db, Arc::new(source), config.catalog.batch_size))
}

async fn open_metadata(config: &Config) -> Result<MetadataCatalog, AnyError> {
    let db = Database::connect(&config.catalog.database_path).await?;
    let source = HttpMetadataSource::new(&config.catalog, config.archive.api_key.clone(), index_client(config)?);
    Ok(MetadataCatalog::new(db, Arc::new(source), config.catalog.batch_size))
}

fn report_sync(what: &str, stats: &SyncStats) {
    if stats.up_to_date {
        println!(
            "{} already up to date ({})",
            what,
            stats.version.as_deref().unwrap_or("unknown version")
        );
    } else {
        println!(
            "{}: {} records, {} inserted, {} updated, {} unchanged, {} skipped",
            what, stats.processed, stats.inserted, stats.updated, stats.unchanged, stats.skipped
        );
    }
}

pub async fn download(config: Config, args: DownloadArgs) -> Result<(), AnyError> {
    let mut settings = config.queue.clone();
    if let Some(concurrency) = args.concurrency {
        if concurrency == 0 || concurrency > MAX_CONCURRENCY {
            return Err(format!("--concurrency must be between 1 and {}", MAX_CONCURRENCY).into());
        }
        settings.concurrency = concurrency;
    }

    let mut hashes = args.hashes;
    if let Some(name) = &args.search {
        let catalog = open_catalog(&config).await?;
        let found: Vec<String> = catalog
            .search(name)
            .map_ok(|entry| entry.sha256.to_string())
            .try_collect()
            .await?;
        info!(name, matches = found.len(), "Adding catalog matches");
        hashes.extend(found);
        catalog.database().close().await;
    }
    if hashes.is_empty() {
        return Err("nothing to download: pass hashes or --search".into());
    }

    let store = PackageStore::local(
        &config.storage.download_dir,
        config.storage.write_buffer.as_usize(),
        config.storage.verify_hash,
    )?;
    let fetcher = Arc::new(HttpFetcher::new(&config.archive, store)?);

    let (accepted, summary) = DownloadQueue::scope(
        QueueConfig::from_settings(&settings),
        fetcher,
        Callbacks::default(),
        |queue| async move {
            let mut accepted = 0usize;
            for hash in &hashes {
                loop {
                    match queue.enqueue(hash) {
                        Ok(_) => {
                            accepted += 1;
                            break;
                        }
                        Err(QueueError::QueueFull { .. }) => tokio::time::sleep(BACKLOG_RETRY).await,
                        Err(e @ QueueError::InvalidIdentifier { .. }) => {
                            warn!(error = %e, "Skipping");
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok::<_, QueueError>(accepted)
        },
    )
    .await?;

    println!(
        "{} queued, {} downloaded, {} failed, {} retries",
        accepted, summary.succeeded, summary.failed, summary.retries
    );

    if summary.failed > 0 {
        return Err(format!("{} downloads failed", summary.failed).into());
    }
    Ok(())
}

pub async fn sync(config: Config, args: SyncArgs) -> Result<(), AnyError> {
    if args.metadata {
        if config.archive.api_key.is_none() {
            return Err("the metadata dump needs an API key (APKZOO_API_KEY or ANDROZOO_API_KEY)".into());
        }
        let metadata = open_metadata(&config).await?;
        let stats = if args.force {
            metadata.force_sync().await?
        } else {
            metadata.sync().await?
        };
        report_sync("Metadata", &stats);
        metadata.database().close().await;
        return Ok(());
    }

    let catalog = open_catalog(&config).await?;
    let stats = if args.force {
        catalog.force_sync().await?
    } else {
        catalog.sync().await?
    };
    report_sync("Catalog", &stats);

    catalog.database().close().await;
    Ok(())
}

pub async fn metadata(config: Config, args: MetadataArgs) -> Result<(), AnyError> {
    let metadata = open_metadata(&config).await?;
    let found = metadata.get(&args.package).await?;
    metadata.database().close().await;

    match found {
        Some(found) => {
            println!("{}", serde_json::to_string_pretty(&found.data)?);
            Ok(())
        }
        None => Err(format!("no metadata for {}; run `apkzoo sync --metadata` first", args.package).into()),
    }
}

pub async fn search(config: Config, args: SearchArgs) -> Result<(), AnyError> {
    let catalog = open_catalog(&config).await?;
    let mut results = catalog.search(&args.name);
    let mut matches = 0usize;

    while let Some(entry) = results.try_next().await? {
        matches += 1;
        if args.json {
            println!("{}", serde_json::to_string(&entry)?);
        } else {
            let size = entry
                .apk_size
                .and_then(|s| u64::try_from(s).ok())
                .map(|s| ByteSize(s).to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{}  {:<50}  {:>10}  {:>8}",
                entry.sha256,
                entry.pkg_name,
                entry.vercode.map(|v| v.to_string()).unwrap_or_default(),
                size
            );
        }
    }

    if !args.json {
        info!(matches, "Search finished");
    }
    drop(results);
    catalog.database().close().await;
    Ok(())
}
