//! Local metadata catalog mirrored from the archive's index
//!
//! [`Database`] owns the SQLite pool and is built once per process;
//! [`Catalog`] combines it with an [`IndexSource`] for sync and adds the
//! read side (search, lookup, counts). [`MetadataCatalog`] does the same for
//! the Google Play metadata dump.

mod db;
mod entry;
mod index;
mod metadata;
mod search;
mod sync;

pub use db::Database;
pub use entry::{CatalogEntry, INDEX_DATETIME, IndexHeader, MalformedRecord, MissingColumn, split_csv_line};
pub use index::{HttpIndexSource, IndexError, IndexPages, IndexRecord, IndexSource, MemoryIndex};
pub use metadata::{
    HttpMetadataSource, MalformedMetadata, MemoryMetadata, MetadataCatalog, MetadataRecord, PlayMetadata,
};
pub use sync::{SyncError, SyncStats};

use crate::identifier::Identifier;
use sync::SyncLog;
use futures::stream::BoxStream;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Catalog of package metadata backed by a shared [`Database`]
#[derive(Clone)]
pub struct Catalog {
    db: Database,
    source: Arc<dyn IndexSource>,
    batch_size: usize,
}

impl Catalog {
    pub fn new(db: Database, source: Arc<dyn IndexSource>, batch_size: usize) -> Self {
        Self {
            db,
            source,
            batch_size: batch_size.max(1),
        }
    }

    /// Refresh from the index unless it is unchanged since the last
    /// complete sync. Committed batches survive a failed run, and a rerun
    /// converges to the same rows.
    pub async fn sync(&self) -> std::result::Result<SyncStats, SyncError> {
        sync::run(&self.db, self.source.as_ref(), SyncLog::Packages, self.batch_size, false).await
    }

    /// Refresh from the index even if its version was already applied
    pub async fn force_sync(&self) -> std::result::Result<SyncStats, SyncError> {
        sync::run(&self.db, self.source.as_ref(), SyncLog::Packages, self.batch_size, true).await
    }

    /// Index version applied by the last complete sync
    pub async fn last_synced_version(&self) -> Result<Option<String>> {
        Ok(sync::last_version(&self.db, SyncLog::Packages).await?)
    }

    /// Entries whose package name contains `substring`, ordered by package
    /// name. Each call runs a fresh query.
    ///
    /// Matching ignores case for ASCII letters only: SQLite's `LIKE` does not
    /// fold non-ASCII characters, so `"ÉCOLE"` finds `com.École.app` but
    /// `"école"` does not.
    pub fn search(&self, substring: &str) -> BoxStream<'static, Result<CatalogEntry>> {
        search::search(self.db.pool().clone(), substring)
    }

    pub async fn get(&self, identifier: &Identifier) -> Result<Option<CatalogEntry>> {
        let entry = sqlx::query_as(
            "SELECT sha256, sha1, md5, dex_date, apk_size, pkg_name, vercode, \
             vt_detection, vt_scan_date, dex_size, markets FROM apks WHERE sha256 = ?",
        )
        .bind(identifier.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(entry)
    }

    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM apks")
            .fetch_one(self.db.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Direct access for arbitrary queries over the `apks` table
    pub fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    const HEADER: &str =
        "sha256,sha1,md5,dex_date,apk_size,pkg_name,vercode,vt_detection,vt_scan_date,dex_size,markets";

    fn row(hash_byte: char, pkg: &str) -> String {
        format!(
            "{},,,2016-06-01 12:00:00,2048,{},7,0,,512,play.google.com",
            hash_byte.to_string().repeat(64),
            pkg
        )
    }

    async fn catalog(csv: String) -> Catalog {
        let db = Database::connect_in_memory().await.unwrap();
        Catalog::new(db, Arc::new(MemoryIndex::from_csv(csv)), 2)
    }

    #[tokio::test]
    async fn test_get_and_count() {
        let csv = format!("{}\n{}\n{}\n", HEADER, row('A', "com.a"), row('B', "com.b"));
        let catalog = catalog(csv).await;
        catalog.sync().await.unwrap();

        assert_eq!(catalog.count().await.unwrap(), 2);
        let id = Identifier::parse(&"b".repeat(64)).unwrap();
        let entry = catalog.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.pkg_name, "com.b");
        assert_eq!(entry.apk_size, Some(2048));
        assert_eq!(entry.markets, vec!["play.google.com"]);

        let missing = Identifier::parse(&"C".repeat(64)).unwrap();
        assert!(catalog.get(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_pages_through_many_rows() {
        let mut csv = format!("{}\n", HEADER);
        for i in 0..600 {
            csv.push_str(&format!(
                "{:064X},,,,,org.sample.app{:04},,,,,\n",
                i, i
            ));
        }
        let catalog = catalog(csv).await;
        catalog.sync().await.unwrap();

        let found: Vec<CatalogEntry> = catalog.search("SAMPLE").try_collect().await.unwrap();
        assert_eq!(found.len(), 600);
        assert_eq!(found[0].pkg_name, "org.sample.app0000");
        assert_eq!(found[599].pkg_name, "org.sample.app0599");
    }

    #[tokio::test]
    async fn test_search_treats_wildcards_literally() {
        let csv = format!(
            "{}\n{}\n{}\n",
            HEADER,
            row('A', "com.percent%app"),
            row('B', "com.percentXapp")
        );
        let catalog = catalog(csv).await;
        catalog.sync().await.unwrap();

        let found: Vec<CatalogEntry> = catalog.search("%").try_collect().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pkg_name, "com.percent%app");
    }

    #[tokio::test]
    async fn test_search_folds_ascii_case_only() {
        let csv = format!("{}\n{}\n", HEADER, row('A', "com.École.app"));
        let catalog = catalog(csv).await;
        catalog.sync().await.unwrap();

        let upper: Vec<CatalogEntry> = catalog.search("ÉCOLE").try_collect().await.unwrap();
        assert_eq!(upper.len(), 1);

        let lower: Vec<CatalogEntry> = catalog.search("école").try_collect().await.unwrap();
        assert!(lower.is_empty());
    }
}
