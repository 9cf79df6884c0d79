//! Sources of the remote package index

use super::entry::{CatalogEntry, IndexHeader, MalformedRecord, MissingColumn};
use crate::config::CatalogConfig;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pages buffered between the reader and the database writer
const PAGE_CHANNEL_DEPTH: usize = 4;
const CACHE_FILE: &str = "latest.csv.gz";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Index request returned HTTP {0}")]
    Status(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    MissingColumn(#[from] MissingColumn),

    #[error("Index is empty")]
    Empty,

    #[error("Index reader stopped: {0}")]
    Interrupted(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// One parsed line: an entry, or the reason it was skipped
pub type IndexRecord = std::result::Result<CatalogEntry, MalformedRecord>;

/// Stream of index pages produced by a background reader
pub struct IndexPages<R = IndexRecord> {
    version: Option<String>,
    rx: mpsc::Receiver<Result<Vec<R>>>,
    reader: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> IndexPages<R> {
    /// Spawn `produce` on the blocking pool; it pushes pages through `PageSink`
    pub(crate) fn spawn_blocking<F>(version: Option<String>, produce: F) -> Self
    where
        F: FnOnce(&PageSink<R>) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(PAGE_CHANNEL_DEPTH);
        let reader = tokio::task::spawn_blocking(move || {
            let sink = PageSink { tx };
            if let Err(e) = produce(&sink) {
                // Receiver may be gone already; nothing else to tell
                let _ = sink.tx.blocking_send(Err(e));
            }
        });

        Self {
            version,
            rx,
            reader: Some(reader),
        }
    }

    /// Pages fed by a custom producer; the stream ends when `rx` closes
    pub fn from_channel(version: Option<String>, rx: mpsc::Receiver<Result<Vec<R>>>) -> Self {
        Self {
            version,
            rx,
            reader: None,
        }
    }

    /// Version tag of the index content (HTTP ETag), if known
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub async fn next_page(&mut self) -> Option<Result<Vec<R>>> {
        match self.rx.recv().await {
            Some(page) => Some(page),
            None => {
                // Reader finished; surface a panic instead of a silent end
                let reader = self.reader.take()?;
                match reader.await {
                    Ok(()) => None,
                    Err(e) => Some(Err(IndexError::Interrupted(e.to_string()))),
                }
            }
        }
    }

    /// Re-deliver these pages through a new stream that fails after
    /// `limit` pages, as a dropped connection would
    pub(crate) fn cut_after(mut self, limit: Option<usize>) -> Self {
        let Some(limit) = limit else {
            return self;
        };
        let (tx, rx) = mpsc::channel(PAGE_CHANNEL_DEPTH);
        let version = self.version.clone();

        tokio::spawn(async move {
            let mut delivered = 0usize;
            while let Some(page) = self.next_page().await {
                if delivered >= limit {
                    let _ = tx
                        .send(Err(IndexError::Interrupted(format!(
                            "connection lost after {} pages",
                            delivered
                        ))))
                        .await;
                    return;
                }
                if tx.send(page).await.is_err() {
                    return;
                }
                delivered += 1;
            }
        });

        Self::from_channel(version, rx)
    }
}

/// Producer side handed to blocking readers
pub(crate) struct PageSink<R = IndexRecord> {
    tx: mpsc::Sender<Result<Vec<R>>>,
}

impl<R> PageSink<R> {
    /// False once the consumer has gone away
    pub(crate) fn send(&self, page: Vec<R>) -> bool {
        self.tx.blocking_send(Ok(page)).is_ok()
    }
}

/// Parse each non-blank remaining line of `reader` with `parse`, delivering
/// `batch_size` records per page
pub(crate) fn read_line_pages<B, R, P>(mut reader: B, batch_size: usize, sink: &PageSink<R>, mut parse: P) -> Result<()>
where
    B: BufRead,
    P: FnMut(&str) -> R,
{
    let batch_size = batch_size.max(1);
    let mut raw = Vec::new();
    let mut page = Vec::with_capacity(batch_size);
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        if line.trim().is_empty() {
            continue;
        }

        page.push(parse(&line));
        if page.len() >= batch_size {
            if !sink.send(std::mem::replace(&mut page, Vec::with_capacity(batch_size))) {
                debug!("Index consumer dropped, stopping reader");
                return Ok(());
            }
        }
    }

    if !page.is_empty() {
        sink.send(page);
    }
    Ok(())
}

/// Read a CSV index from `reader`, delivering `batch_size` records per page
pub(crate) fn read_csv_pages<R: Read>(reader: R, batch_size: usize, sink: &PageSink) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();

    let header = loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            return Err(IndexError::Empty);
        }
        let line = String::from_utf8_lossy(&raw);
        if !line.trim().is_empty() {
            break IndexHeader::parse(&line)?;
        }
    };

    read_line_pages(reader, batch_size, sink, |line| header.parse_record(line))
}

/// Where index records come from.
///
/// `R` is the record type of each page; the package index is the default.
#[async_trait]
pub trait IndexSource<R = IndexRecord>: Send + Sync {
    /// Cheap check of the current index version, if the source has one
    async fn version(&self) -> Result<Option<String>>;

    /// Start reading the whole index in pages of `batch_size` records
    async fn open(&self, batch_size: usize) -> Result<IndexPages<R>>;
}

fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_start_matches("W/").trim_matches('"').to_string()
}

/// A remote file mirrored into `cache_dir`, revalidated by ETag
pub(crate) struct RemoteFile {
    client: Client,
    url: String,
    api_key: Option<String>,
    cache_dir: PathBuf,
    file_name: &'static str,
}

impl RemoteFile {
    pub(crate) fn new(client: Client, url: String, cache_dir: PathBuf, file_name: &'static str) -> Self {
        Self {
            client,
            url,
            api_key: None,
            cache_dir,
            file_name,
        }
    }

    /// Send `apikey` as a query parameter on every request
    pub(crate) fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub(crate) fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(self.file_name)
    }

    fn etag_path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.etag", self.file_name))
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let request = self.client.request(method, &self.url);
        match self.api_key.as_deref() {
            Some(key) => request.query(&[("apikey", key)]),
            None => request,
        }
    }

    async fn cached_etag(&self) -> Option<String> {
        if !tokio::fs::try_exists(self.cache_path()).await.unwrap_or(false) {
            return None;
        }
        tokio::fs::read_to_string(self.etag_path())
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Current remote ETag; `None` when the server does not say
    pub(crate) async fn version(&self) -> Result<Option<String>> {
        let response = self.request(reqwest::Method::HEAD).send().await?;
        if !response.status().is_success() {
            warn!(
                file = self.file_name,
                status = response.status().as_u16(),
                "Index HEAD request failed"
            );
            return Ok(None);
        }
        Ok(response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag))
    }

    /// Bring the cached copy up to date; returns its version
    pub(crate) async fn refresh(&self) -> Result<Option<String>> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let cached = self.cached_etag().await;

        let mut request = self.request(reqwest::Method::GET);
        if let Some(etag) = &cached {
            request = request.header(IF_NONE_MATCH, format!("\"{}\"", etag));
        }
        let mut response = request.send().await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            info!(file = self.file_name, etag = ?cached, "Cached index is current");
            return Ok(cached);
        }
        if !response.status().is_success() {
            return Err(IndexError::Status(response.status().as_u16()));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag);

        let partial = self.cache_dir.join(format!("{}.part", self.file_name));
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut received: u64 = 0;
        let download = async {
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
                received += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<_, IndexError>(())
        };
        if let Err(e) = download.await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        drop(file);

        tokio::fs::rename(&partial, self.cache_path()).await?;
        match &etag {
            Some(tag) => tokio::fs::write(self.etag_path(), tag).await?,
            None => {
                let _ = tokio::fs::remove_file(self.etag_path()).await;
            }
        }

        info!(file = self.file_name, bytes = received, etag = ?etag, "Downloaded index");
        Ok(etag)
    }
}

/// The archive's gzipped CSV index over HTTP, cached on disk between runs
pub struct HttpIndexSource {
    remote: RemoteFile,
}

impl HttpIndexSource {
    pub fn new(config: &CatalogConfig, client: Client) -> Self {
        Self {
            remote: RemoteFile::new(client, config.index_url.clone(), config.cache_dir.clone(), CACHE_FILE),
        }
    }
}

#[async_trait]
impl IndexSource for HttpIndexSource {
    async fn version(&self) -> Result<Option<String>> {
        self.remote.version().await
    }

    async fn open(&self, batch_size: usize) -> Result<IndexPages> {
        let version = self.remote.refresh().await?;
        let path = self.remote.cache_path();

        Ok(IndexPages::spawn_blocking(version, move |sink| {
            read_gzip_file(&path, batch_size, sink)
        }))
    }
}

fn read_gzip_file(path: &Path, batch_size: usize, sink: &PageSink) -> Result<()> {
    let file = std::fs::File::open(path)?;
    read_csv_pages(GzDecoder::new(file), batch_size, sink)
}

/// Index held in memory, for tests and small imports.
///
/// `interrupt_after(n)` makes the source fail after delivering `n` pages,
/// which simulates a connection dropped mid-sync.
#[derive(Debug, Clone)]
pub struct MemoryIndex {
    csv: String,
    version: Option<String>,
    interrupt_after: Option<usize>,
}

impl MemoryIndex {
    pub fn from_csv(csv: impl Into<String>) -> Self {
        Self {
            csv: csv.into(),
            version: None,
            interrupt_after: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn interrupt_after(mut self, pages: usize) -> Self {
        self.interrupt_after = Some(pages);
        self
    }
}

#[async_trait]
impl IndexSource for MemoryIndex {
    async fn version(&self) -> Result<Option<String>> {
        Ok(self.version.clone())
    }

    async fn open(&self, batch_size: usize) -> Result<IndexPages> {
        let csv = self.csv.clone();
        let pages = IndexPages::spawn_blocking(self.version.clone(), move |sink| {
            read_csv_pages(csv.as_bytes(), batch_size, sink)
        });
        Ok(pages.cut_after(self.interrupt_after))
    }
}
