//! Bulk, resumable refresh of the catalog from an index source

use super::entry::CatalogEntry;
use super::index::{IndexError, IndexSource};
use super::Database;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Display;
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Index retrieval failed: {0}")]
    Index(#[from] IndexError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Counts over committed batches only.
///
/// `inserted + updated + unchanged + skipped == processed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Malformed index records
    pub skipped: u64,
    pub batches: u64,
    /// Version of the index that was applied
    pub version: Option<String>,
    /// The index had not changed since the last complete sync
    pub up_to_date: bool,
}

impl SyncStats {
    fn absorb(&mut self, batch: &BatchStats) {
        self.processed += batch.inserted + batch.updated + batch.unchanged + batch.skipped;
        self.inserted += batch.inserted;
        self.updated += batch.updated;
        self.unchanged += batch.unchanged;
        self.skipped += batch.skipped;
        self.batches += 1;
    }
}

#[derive(Debug, Default)]
struct BatchStats {
    inserted: u64,
    updated: u64,
    unchanged: u64,
    skipped: u64,
}

pub(crate) enum Upserted {
    Inserted,
    Updated,
    Unchanged,
}

/// A row type that a sync can write
#[async_trait]
pub(crate) trait SyncRecord: Send + Sync {
    /// Insert the row, or update it in place if any stored value differs
    async fn upsert(&self, tx: &mut Transaction<'_, Sqlite>) -> sqlx::Result<Upserted>;
}

/// Table recording the version of each complete sync
#[derive(Debug, Clone, Copy)]
pub(crate) enum SyncLog {
    Packages,
    PlayMetadata,
}

impl SyncLog {
    fn table(self) -> &'static str {
        match self {
            Self::Packages => "sync_log",
            Self::PlayMetadata => "metadata_sync_log",
        }
    }
}

const INSERT_SQL: &str = r#"
    INSERT OR IGNORE INTO apks
        (sha256, sha1, md5, dex_date, apk_size, pkg_name, vercode, vt_detection, vt_scan_date, dex_size, markets)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
"#;

// Unknown (NULL) values keep what is stored; the row is only written when
// something actually differs
const UPDATE_SQL: &str = r#"
    UPDATE apks SET
        sha1         = COALESCE(?2, sha1),
        md5          = COALESCE(?3, md5),
        dex_date     = COALESCE(?4, dex_date),
        apk_size     = COALESCE(?5, apk_size),
        pkg_name     = ?6,
        vercode      = COALESCE(?7, vercode),
        vt_detection = COALESCE(?8, vt_detection),
        vt_scan_date = COALESCE(?9, vt_scan_date),
        dex_size     = COALESCE(?10, dex_size),
        markets      = COALESCE(?11, markets)
    WHERE sha256 = ?1
      AND (
           sha1         IS NOT COALESCE(?2, sha1)
        OR md5          IS NOT COALESCE(?3, md5)
        OR dex_date     IS NOT COALESCE(?4, dex_date)
        OR apk_size     IS NOT COALESCE(?5, apk_size)
        OR pkg_name     IS NOT ?6
        OR vercode      IS NOT COALESCE(?7, vercode)
        OR vt_detection IS NOT COALESCE(?8, vt_detection)
        OR vt_scan_date IS NOT COALESCE(?9, vt_scan_date)
        OR dex_size     IS NOT COALESCE(?10, dex_size)
        OR markets      IS NOT COALESCE(?11, markets)
      )
"#;

fn bind_entry<'q>(
    sql: &'q str,
    entry: &CatalogEntry,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(sql)
        .bind(entry.sha256.as_str().to_owned())
        .bind(entry.sha1.clone())
        .bind(entry.md5.clone())
        .bind(entry.dex_date_column())
        .bind(entry.apk_size)
        .bind(entry.pkg_name.clone())
        .bind(entry.vercode)
        .bind(entry.vt_detection)
        .bind(entry.vt_scan_date_column())
        .bind(entry.dex_size)
        .bind(entry.markets_column())
}

#[async_trait]
impl SyncRecord for CatalogEntry {
    async fn upsert(&self, tx: &mut Transaction<'_, Sqlite>) -> sqlx::Result<Upserted> {
        let inserted = bind_entry(INSERT_SQL, self).execute(&mut **tx).await?;
        if inserted.rows_affected() > 0 {
            return Ok(Upserted::Inserted);
        }

        let updated = bind_entry(UPDATE_SQL, self).execute(&mut **tx).await?;
        if updated.rows_affected() > 0 {
            Ok(Upserted::Updated)
        } else {
            Ok(Upserted::Unchanged)
        }
    }
}

/// Apply one page atomically: all rows commit together or none do
async fn apply_page<T, E>(db: &Database, page: Vec<std::result::Result<T, E>>, batch: u64) -> Result<BatchStats>
where
    T: SyncRecord,
    E: Display,
{
    let mut stats = BatchStats::default();
    let mut tx = db.pool().begin().await?;

    for record in page {
        match record {
            Ok(row) => match row.upsert(&mut tx).await? {
                Upserted::Inserted => stats.inserted += 1,
                Upserted::Updated => stats.updated += 1,
                Upserted::Unchanged => stats.unchanged += 1,
            },
            Err(reason) => {
                debug!(batch, reason = %reason, "Skipping malformed record");
                stats.skipped += 1;
            }
        }
    }

    tx.commit().await?;
    Ok(stats)
}

/// Version recorded by the most recent complete sync
pub(crate) async fn last_version(db: &Database, log: SyncLog) -> sqlx::Result<Option<String>> {
    let sql = format!(
        "SELECT etag FROM {} ORDER BY synced_at DESC, rowid DESC LIMIT 1",
        log.table()
    );
    let row: Option<(String,)> = sqlx::query_as(&sql).fetch_optional(db.pool()).await?;
    Ok(row.map(|(etag,)| etag))
}

async fn log_sync(db: &Database, log: SyncLog, version: &str, processed: u64) -> sqlx::Result<()> {
    let synced_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let sql = format!(
        "INSERT OR REPLACE INTO {} (etag, synced_at, rows_processed) VALUES (?, ?, ?)",
        log.table()
    );
    sqlx::query(&sql)
        .bind(version)
        .bind(synced_at)
        .bind(i64::try_from(processed).unwrap_or(i64::MAX))
        .execute(db.pool())
        .await?;
    Ok(())
}

/// Sync from `source`. Without `force`, a source whose version matches the
/// last complete run is skipped.
pub(crate) async fn run<T, E>(
    db: &Database,
    source: &dyn IndexSource<std::result::Result<T, E>>,
    log: SyncLog,
    batch_size: usize,
    force: bool,
) -> Result<SyncStats>
where
    T: SyncRecord + 'static,
    E: Display + Send + 'static,
{
    let table = log.table();
    if !force {
        let remote = source.version().await?;
        let local = last_version(db, log).await?;
        if remote.is_some() && remote == local {
            info!(log = table, version = ?remote, "Catalog already up to date");
            return Ok(SyncStats {
                version: remote,
                up_to_date: true,
                ..SyncStats::default()
            });
        }
    }

    let mut pages = source.open(batch_size).await?;
    let version = pages.version().map(str::to_string);
    let mut stats = SyncStats {
        version: version.clone(),
        ..SyncStats::default()
    };

    info!(log = table, version = ?version, batch_size, "Catalog sync started");

    while let Some(page) = pages.next_page().await {
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    batches = stats.batches,
                    processed = stats.processed,
                    error = %e,
                    "Catalog sync interrupted; committed batches are kept"
                );
                return Err(e.into());
            }
        };

        let batch = stats.batches + 1;
        let batch_stats = apply_page(db, page, batch).await?;
        stats.absorb(&batch_stats);

        info!(
            batch,
            processed = stats.processed,
            inserted = stats.inserted,
            updated = stats.updated,
            skipped = stats.skipped,
            "Batch committed"
        );
    }

    if let Some(version) = &version {
        log_sync(db, log, version, stats.processed).await?;
    }

    info!(
        log = table,
        processed = stats.processed,
        inserted = stats.inserted,
        updated = stats.updated,
        unchanged = stats.unchanged,
        skipped = stats.skipped,
        "Catalog sync finished"
    );
    Ok(stats)
}
