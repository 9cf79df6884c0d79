pub mod catalog;
pub mod config;
pub mod fetcher;
pub mod humanize;
pub mod identifier;
pub mod observability;
pub mod queue;
pub mod storage;

pub use catalog::{Catalog, CatalogEntry, Database};
pub use fetcher::{FetchError, Fetcher, HttpFetcher};
pub use identifier::Identifier;
pub use queue::{Callbacks, DownloadQueue, Job, JobState, QueueConfig, QueueError};
