//! Configuration management for apkzoo
//!
//! Settings are layered, lowest priority first:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables
//!
//! # Usage
//!
//! ```no_run
//! use apkzoo::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Downloading into: {}", config.storage.download_dir.display());
//! ```
//!
//! # Environment Variables
//!
//! Any key can be overridden with `APKZOO__<section>__<key>`, e.g.
//! - `APKZOO__QUEUE__CONCURRENCY=20`
//! - `APKZOO__STORAGE__WRITE_BUFFER=4MB`
//! - `APKZOO__CATALOG__DATABASE_PATH=/var/lib/apkzoo/catalog.db`
//!
//! The archive API key is read from `APKZOO_API_KEY` (or `ANDROZOO_API_KEY`)
//! and never from the file.
//!
//! # Configuration File
//!
//! By default the file is `config/apkzoo.toml`; set `APKZOO_CONFIG` to use
//! another path.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{ArchiveConfig, CatalogConfig, Config, QueueSettings, StorageConfig};
pub use validation::{MAX_CONCURRENCY, ValidationError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or a value is out of range.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path, without secrets.
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
