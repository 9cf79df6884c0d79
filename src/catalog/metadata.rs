//! Google Play metadata mirrored from the archive's JSONL dump
//!
//! Each line of the dump is one JSON document describing a package as it
//! appeared on Google Play. The whole document is kept in `data`; a handful
//! of fields are pulled out into columns for direct queries.

use super::entry::decode_error;
use super::index::{IndexPages, IndexSource, PageSink, RemoteFile, read_line_pages};
use super::sync::{self, SyncLog, SyncRecord, SyncStats, Upserted};
use super::{Database, Result};
use crate::config::CatalogConfig;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, Sqlite, Transaction};
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const CACHE_FILE: &str = "gp-metadata-full.jsonl.gz";

/// One parsed line: a document, or the reason it was skipped
pub type MetadataRecord = std::result::Result<PlayMetadata, MalformedMetadata>;

/// Why a single dump line was skipped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMetadata {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("missing details.appDetails.packageName")]
    MissingPackageName,
}

/// Google Play details for one package
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayMetadata {
    pub package_name: String,
    pub title: Option<String>,
    pub description_short: Option<String>,
    pub description_html: Option<String>,
    /// Download bucket as Play shows it, e.g. `1,000,000+`
    pub num_downloads: Option<String>,
    pub installation_size: Option<i64>,
    pub developer_website: Option<String>,
    pub developer_name: Option<String>,
    pub developer_email: Option<String>,
    pub upload_date: Option<String>,
    pub version_code: Option<i64>,
    pub version_string: Option<String>,
    /// When the archive fetched this document
    pub az_metadata_date: Option<String>,
    /// The full document
    pub data: Value,
}

fn text(data: &Value, pointer: &str) -> Option<String> {
    data.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// Sizes show up both as numbers and as numeric strings
fn integer(data: &Value, pointer: &str) -> Option<i64> {
    match data.pointer(pointer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl PlayMetadata {
    /// Parse one line of the dump. Only the package name is required.
    pub fn from_json(line: &str) -> std::result::Result<Self, MalformedMetadata> {
        let data: Value = serde_json::from_str(line).map_err(|e| MalformedMetadata::Json(e.to_string()))?;
        let package_name =
            text(&data, "/details/appDetails/packageName").ok_or(MalformedMetadata::MissingPackageName)?;

        Ok(Self {
            package_name,
            title: text(&data, "/title"),
            description_short: text(&data, "/descriptionShort"),
            description_html: text(&data, "/descriptionHtml"),
            num_downloads: text(&data, "/details/appDetails/numDownloads"),
            installation_size: integer(&data, "/details/appDetails/installationSize"),
            developer_website: text(&data, "/details/appDetails/developerWebsite"),
            developer_name: text(&data, "/details/appDetails/developerName"),
            developer_email: text(&data, "/details/appDetails/developerEmail"),
            upload_date: text(&data, "/details/appDetails/uploadDate"),
            version_code: integer(&data, "/details/appDetails/versionCode"),
            version_string: text(&data, "/details/appDetails/versionString"),
            az_metadata_date: text(&data, "/azMetadataDate"),
            data,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for PlayMetadata {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let data: String = row.try_get("data")?;
        let data = serde_json::from_str(&data).map_err(|e| decode_error("data", e))?;

        Ok(Self {
            package_name: row.try_get("package_name")?,
            title: row.try_get("title")?,
            description_short: row.try_get("description_short")?,
            description_html: row.try_get("description_html")?,
            num_downloads: row.try_get("num_downloads")?,
            installation_size: row.try_get("installation_size")?,
            developer_website: row.try_get("developer_website")?,
            developer_name: row.try_get("developer_name")?,
            developer_email: row.try_get("developer_email")?,
            upload_date: row.try_get("upload_date")?,
            version_code: row.try_get("version_code")?,
            version_string: row.try_get("version_string")?,
            az_metadata_date: row.try_get("az_metadata_date")?,
            data,
        })
    }
}

const COLUMNS: &str = "package_name, title, description_short, description_html, num_downloads, \
     installation_size, developer_website, developer_name, developer_email, upload_date, \
     version_code, version_string, az_metadata_date, data";

const INSERT_SQL: &str = r#"
    INSERT OR IGNORE INTO gp_metadata
        (package_name, title, description_short, description_html, num_downloads,
         installation_size, developer_website, developer_name, developer_email, upload_date,
         version_code, version_string, az_metadata_date, data)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
"#;

// Every column derives from `data`, so comparing it is enough
const UPDATE_SQL: &str = r#"
    UPDATE gp_metadata SET
        title             = ?2,
        description_short = ?3,
        description_html  = ?4,
        num_downloads     = ?5,
        installation_size = ?6,
        developer_website = ?7,
        developer_name    = ?8,
        developer_email   = ?9,
        upload_date       = ?10,
        version_code      = ?11,
        version_string    = ?12,
        az_metadata_date  = ?13,
        data              = ?14
    WHERE package_name = ?1 AND data IS NOT ?14
"#;

fn bind_metadata<'q>(
    sql: &'q str,
    metadata: &PlayMetadata,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(sql)
        .bind(metadata.package_name.clone())
        .bind(metadata.title.clone())
        .bind(metadata.description_short.clone())
        .bind(metadata.description_html.clone())
        .bind(metadata.num_downloads.clone())
        .bind(metadata.installation_size)
        .bind(metadata.developer_website.clone())
        .bind(metadata.developer_name.clone())
        .bind(metadata.developer_email.clone())
        .bind(metadata.upload_date.clone())
        .bind(metadata.version_code)
        .bind(metadata.version_string.clone())
        .bind(metadata.az_metadata_date.clone())
        .bind(metadata.data.to_string())
}

#[async_trait]
impl SyncRecord for PlayMetadata {
    async fn upsert(&self, tx: &mut Transaction<'_, Sqlite>) -> sqlx::Result<Upserted> {
        let inserted = bind_metadata(INSERT_SQL, self).execute(&mut **tx).await?;
        if inserted.rows_affected() > 0 {
            return Ok(Upserted::Inserted);
        }

        let updated = bind_metadata(UPDATE_SQL, self).execute(&mut **tx).await?;
        if updated.rows_affected() > 0 {
            Ok(Upserted::Updated)
        } else {
            Ok(Upserted::Unchanged)
        }
    }
}

pub(crate) fn read_jsonl_pages<R: Read>(
    reader: R,
    batch_size: usize,
    sink: &PageSink<MetadataRecord>,
) -> super::index::Result<()> {
    read_line_pages(BufReader::new(reader), batch_size, sink, PlayMetadata::from_json)
}

fn read_gzip_file(path: &Path, batch_size: usize, sink: &PageSink<MetadataRecord>) -> super::index::Result<()> {
    let file = std::fs::File::open(path)?;
    read_jsonl_pages(GzDecoder::new(file), batch_size, sink)
}

/// The archive's gzipped metadata dump over HTTP, cached on disk between runs.
///
/// The endpoint wants the API key on every request, version checks included.
pub struct HttpMetadataSource {
    remote: RemoteFile,
}

impl HttpMetadataSource {
    pub fn new(config: &CatalogConfig, api_key: Option<String>, client: Client) -> Self {
        let remote = RemoteFile::new(client, config.metadata_url.clone(), config.cache_dir.clone(), CACHE_FILE)
            .with_api_key(api_key);
        Self { remote }
    }
}

#[async_trait]
impl IndexSource<MetadataRecord> for HttpMetadataSource {
    async fn version(&self) -> super::index::Result<Option<String>> {
        self.remote.version().await
    }

    async fn open(&self, batch_size: usize) -> super::index::Result<IndexPages<MetadataRecord>> {
        let version = self.remote.refresh().await?;
        let path = self.remote.cache_path();

        Ok(IndexPages::spawn_blocking(version, move |sink| {
            read_gzip_file(&path, batch_size, sink)
        }))
    }
}

/// Metadata dump held in memory, one JSON document per line
#[derive(Debug, Clone)]
pub struct MemoryMetadata {
    jsonl: String,
    version: Option<String>,
    interrupt_after: Option<usize>,
}

impl MemoryMetadata {
    pub fn from_jsonl(jsonl: impl Into<String>) -> Self {
        Self {
            jsonl: jsonl.into(),
            version: None,
            interrupt_after: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Fail after delivering `pages` pages
    pub fn interrupt_after(mut self, pages: usize) -> Self {
        self.interrupt_after = Some(pages);
        self
    }
}

#[async_trait]
impl IndexSource<MetadataRecord> for MemoryMetadata {
    async fn version(&self) -> super::index::Result<Option<String>> {
        Ok(self.version.clone())
    }

    async fn open(&self, batch_size: usize) -> super::index::Result<IndexPages<MetadataRecord>> {
        let jsonl = self.jsonl.clone();
        let pages = IndexPages::spawn_blocking(self.version.clone(), move |sink| {
            read_jsonl_pages(jsonl.as_bytes(), batch_size, sink)
        });
        Ok(pages.cut_after(self.interrupt_after))
    }
}

/// Local mirror of the Google Play metadata, sharing the catalog database
#[derive(Clone)]
pub struct MetadataCatalog {
    db: Database,
    source: Arc<dyn IndexSource<MetadataRecord>>,
    batch_size: usize,
}

impl MetadataCatalog {
    pub fn new(db: Database, source: Arc<dyn IndexSource<MetadataRecord>>, batch_size: usize) -> Self {
        Self {
            db,
            source,
            batch_size: batch_size.max(1),
        }
    }

    /// Refresh from the dump unless its ETag matches the last complete sync.
    /// Lines that are not valid documents are counted as skipped.
    pub async fn sync(&self) -> std::result::Result<SyncStats, sync::SyncError> {
        sync::run(&self.db, self.source.as_ref(), SyncLog::PlayMetadata, self.batch_size, false).await
    }

    pub async fn force_sync(&self) -> std::result::Result<SyncStats, sync::SyncError> {
        sync::run(&self.db, self.source.as_ref(), SyncLog::PlayMetadata, self.batch_size, true).await
    }

    pub async fn last_synced_version(&self) -> Result<Option<String>> {
        Ok(sync::last_version(&self.db, SyncLog::PlayMetadata).await?)
    }

    pub async fn get(&self, package_name: &str) -> Result<Option<PlayMetadata>> {
        let sql = format!("SELECT {} FROM gp_metadata WHERE package_name = ?", COLUMNS);
        let metadata = sqlx::query_as(&sql)
            .bind(package_name)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(metadata)
    }

    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM gp_metadata")
            .fetch_one(self.db.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}
