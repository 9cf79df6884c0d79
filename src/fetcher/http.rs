//! HTTP client for the archive's download endpoint

use super::{FetchError, Fetcher, Result};
use crate::config::ArchiveConfig;
use crate::identifier::Identifier;
use crate::storage::PackageStore;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Streams packages from the archive into a [`PackageStore`]
pub struct HttpFetcher {
    client: Client,
    download_url: String,
    api_key: Option<String>,
    store: PackageStore,
}

impl HttpFetcher {
    pub fn new(config: &ArchiveConfig, store: PackageStore) -> std::result::Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        if config.api_key.is_none() {
            warn!("No archive API key configured; downloads will be rejected");
        }

        Ok(Self {
            client,
            download_url: config.download_url.clone(),
            api_key: config.api_key.clone(),
            store,
        })
    }

    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    async fn download(&self, identifier: &Identifier) -> Result<PathBuf> {
        let mut params = vec![("sha256", identifier.as_str())];
        if let Some(key) = self.api_key.as_deref() {
            params.push(("apikey", key));
        }

        let mut response = self
            .client
            .get(&self.download_url)
            .query(&params)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let mut writer = self.store.begin(identifier).await?;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = writer.write(&chunk).await {
                        writer.abort().await;
                        return Err(e.into());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(
                        identifier = %identifier,
                        received = writer.bytes_written(),
                        "Body interrupted"
                    );
                    writer.abort().await;
                    return Err(classify_transport(e));
                }
            }
        }

        let stored = writer.finish().await?;
        debug!(identifier = %identifier, size = stored.size, "Download completed");
        Ok(stored.path)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, identifier: &Identifier) -> Result<PathBuf> {
        if self.store.contains_verified(identifier).await? {
            debug!(identifier = %identifier, "Already stored, skipping download");
            return Ok(self.store.location(identifier));
        }

        self.download(identifier).await
    }
}

/// Map a non-success HTTP status onto the failure taxonomy
pub(crate) fn classify_status(status: StatusCode) -> FetchError {
    match status {
        StatusCode::NOT_FOUND => FetchError::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            FetchError::Transient(format!("HTTP {}", status.as_u16()))
        }
        s if s.is_server_error() => FetchError::Transient(format!("HTTP {}", s.as_u16())),
        s => FetchError::Rejected(format!(
            "HTTP {}: {}",
            s.as_u16(),
            s.canonical_reason().unwrap_or("Unknown")
        )),
    }
}

fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Rejected(err.to_string())
    } else if err.is_timeout() {
        FetchError::Transient(format!("timeout: {}", err))
    } else {
        FetchError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FetchError::NotFound);
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            FetchError::Rejected(_)
        ));
    }

    #[test]
    fn test_new_with_defaults() {
        let fetcher = HttpFetcher::new(&ArchiveConfig::default(), PackageStore::in_memory()).unwrap();
        assert!(fetcher.api_key.is_none());
        assert!(fetcher.store().verifies());
    }
}
