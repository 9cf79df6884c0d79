use super::models::Config;
use thiserror::Error;

/// The archive refuses more parallel connections per key than this
pub const MAX_CONCURRENCY: usize = 40;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("queue.concurrency must be between 1 and {max}, got {actual}")]
    InvalidConcurrency { actual: usize, max: usize },

    #[error("queue.max_backlog must be positive")]
    InvalidBacklog,

    #[error("queue.max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("queue.backoff_multiplier must be >= 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("catalog.batch_size must be positive")]
    InvalidBatchSize,

    #[error("storage.write_buffer must be positive")]
    InvalidWriteBuffer,

    #[error("Invalid URL scheme for {field}: '{url}', expected http:// or https://")]
    InvalidUrlScheme { field: String, url: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_queue(config)?;
    validate_storage(config)?;
    validate_catalog(config)?;
    validate_urls(config)?;
    Ok(())
}

fn validate_queue(config: &Config) -> Result<(), ValidationError> {
    let queue = &config.queue;

    if queue.concurrency == 0 || queue.concurrency > MAX_CONCURRENCY {
        return Err(ValidationError::InvalidConcurrency {
            actual: queue.concurrency,
            max: MAX_CONCURRENCY,
        });
    }

    if queue.max_backlog == 0 {
        return Err(ValidationError::InvalidBacklog);
    }

    if queue.max_attempts == 0 {
        return Err(ValidationError::InvalidMaxAttempts);
    }

    // NaN fails this comparison too
    if !(queue.backoff_multiplier >= 1.0) {
        return Err(ValidationError::InvalidBackoffMultiplier(
            queue.backoff_multiplier,
        ));
    }

    Ok(())
}

fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    if config.storage.write_buffer.as_u64() == 0 {
        return Err(ValidationError::InvalidWriteBuffer);
    }
    Ok(())
}

fn validate_catalog(config: &Config) -> Result<(), ValidationError> {
    if config.catalog.batch_size == 0 {
        return Err(ValidationError::InvalidBatchSize);
    }
    Ok(())
}

fn validate_urls(config: &Config) -> Result<(), ValidationError> {
    let urls = [
        ("archive.download_url", &config.archive.download_url),
        ("catalog.index_url", &config.catalog.index_url),
        ("catalog.metadata_url", &config.catalog.metadata_url),
    ];

    for (field, url) in urls {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ValidationError::InvalidUrlScheme {
                field: field.to_string(),
                url: url.clone(),
            });
        }
    }

    Ok(())
}
