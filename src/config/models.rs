use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Remote archive endpoint and HTTP client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_download_url")]
    pub download_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound for one whole package transfer
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Archive API key (loaded from environment, not from config file)
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl ArchiveConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            download_url: default_download_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
            api_key: None,
        }
    }
}

fn default_download_url() -> String {
    "https://androzoo.uni.lu/api/download".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_user_agent() -> String {
    concat!("apkzoo/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Download queue sizing and retry settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_backlog: default_max_backlog(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_concurrency() -> usize {
    8
}

fn default_max_backlog() -> usize {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Local package storage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Bytes buffered before each write to storage
    #[serde(default = "default_write_buffer")]
    pub write_buffer: ByteSize,
    /// Check downloaded bytes against the identifier hash
    #[serde(default = "default_verify_hash")]
    pub verify_hash: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            write_buffer: default_write_buffer(),
            verify_hash: default_verify_hash(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_write_buffer() -> ByteSize {
    ByteSize(1024 * 1024) // 1 MB
}

fn default_verify_hash() -> bool {
    true
}

/// Metadata catalog and remote index settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_index_url")]
    pub index_url: String,
    /// Google Play metadata dump (needs the archive API key)
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    /// Where the downloaded index file is kept between syncs
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Rows committed per transaction during sync
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            index_url: default_index_url(),
            metadata_url: default_metadata_url(),
            cache_dir: default_cache_dir(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/catalog.db")
}

fn default_index_url() -> String {
    "https://androzoo.uni.lu/static/lists/latest.csv.gz".to_string()
}

fn default_metadata_url() -> String {
    "https://androzoo.uni.lu/api/get_gp_metadata_file/full".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/cache")
}

fn default_batch_size() -> usize {
    1000
}
