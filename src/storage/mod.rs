//! Package storage on top of the object_store crate
//!
//! One object per identifier, keyed `<IDENTIFIER>.apk`. Writes go through a
//! multipart upload so nothing becomes visible until [`PackageWriter::finish`]
//! commits it; the local backend stages into a temp file and renames.

use crate::identifier::Identifier;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{MultipartUpload, ObjectStore, PutPayload, path::Path as StoragePath};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to prepare storage directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Refusing to store empty package {0}")]
    Empty(Identifier),

    #[error("Digest mismatch for {identifier}: got {actual}")]
    DigestMismatch {
        identifier: Identifier,
        actual: String,
    },

    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),
}

impl StorageError {
    /// True when the bytes were wrong rather than the disk
    pub fn is_integrity(&self) -> bool {
        matches!(self, StorageError::Empty(_) | StorageError::DigestMismatch { .. })
    }
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// What a completed write produced
#[derive(Debug, Clone)]
pub struct StoredPackage {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Package store wrapping an object_store backend
#[derive(Clone)]
pub struct PackageStore {
    store: Arc<dyn ObjectStore>,
    root: Option<PathBuf>,
    write_buffer: usize,
    verify: bool,
}

impl std::fmt::Debug for PackageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageStore")
            .field("root", &self.root)
            .field("write_buffer", &self.write_buffer)
            .field("verify", &self.verify)
            .finish()
    }
}

impl PackageStore {
    /// Store packages as files under `dir`, creating it if needed
    pub fn local(dir: impl AsRef<Path>, write_buffer: usize, verify: bool) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| StorageError::Prepare {
            path: dir.to_path_buf(),
            source,
        })?;
        let root = dir.canonicalize().map_err(|source| StorageError::Prepare {
            path: dir.to_path_buf(),
            source,
        })?;
        let store = LocalFileSystem::new_with_prefix(&root)?;

        Ok(Self {
            store: Arc::new(store),
            root: Some(root),
            write_buffer: write_buffer.max(1),
            verify,
        })
    }

    /// Create in-memory storage for testing
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            root: None,
            write_buffer: 64 * 1024,
            verify: true,
        }
    }

    /// Skip digest checks (e.g. when tests feed arbitrary bytes)
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn verifies(&self) -> bool {
        self.verify
    }

    pub fn key_for(identifier: &Identifier) -> StoragePath {
        StoragePath::from(format!("{}.apk", identifier))
    }

    /// Filesystem path for local storage, object key otherwise
    pub fn location(&self, identifier: &Identifier) -> PathBuf {
        let key = Self::key_for(identifier);
        match &self.root {
            Some(root) => root.join(key.as_ref()),
            None => PathBuf::from(key.as_ref()),
        }
    }

    /// Start a write; nothing is visible until `finish`
    pub async fn begin(&self, identifier: &Identifier) -> Result<PackageWriter> {
        let upload = self.store.put_multipart(&Self::key_for(identifier)).await?;

        Ok(PackageWriter {
            identifier: identifier.clone(),
            location: self.location(identifier),
            upload: Some(upload),
            buffer: BytesMut::with_capacity(self.write_buffer.min(8 * 1024 * 1024)),
            buffer_limit: self.write_buffer,
            hasher: Sha256::new(),
            written: 0,
            verify: self.verify,
        })
    }

    pub async fn exists(&self, identifier: &Identifier) -> Result<bool> {
        match self.store.head(&Self::key_for(identifier)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// True if a non-empty copy is stored and, when verification is on,
    /// its digest matches the identifier
    pub async fn contains_verified(&self, identifier: &Identifier) -> Result<bool> {
        let result = match self.store.get(&Self::key_for(identifier)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if result.meta.size == 0 {
            return Ok(false);
        }
        if !self.verify {
            return Ok(true);
        }

        let mut hasher = Sha256::new();
        let mut stream = result.into_stream();
        while let Some(chunk) = stream.next().await {
            hasher.update(&chunk?);
        }

        Ok(identifier.matches_digest(&format!("{:X}", hasher.finalize())))
    }

    /// Read a stored package fully
    pub async fn read(&self, identifier: &Identifier) -> Result<Bytes> {
        let result = self.store.get(&Self::key_for(identifier)).await?;
        Ok(result.bytes().await?)
    }
}

/// In-progress package upload.
///
/// Dropping it without `finish` discards the upload.
pub struct PackageWriter {
    identifier: Identifier,
    location: PathBuf,
    upload: Option<Box<dyn MultipartUpload>>,
    buffer: BytesMut,
    buffer_limit: usize,
    hasher: Sha256,
    written: u64,
    verify: bool,
}

impl PackageWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() >= self.buffer_limit {
            self.flush().await?;
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let part = self.buffer.split().freeze();
        if let Some(upload) = self.upload.as_mut() {
            upload.put_part(PutPayload::from(part)).await?;
        }
        Ok(())
    }

    /// Check the body and commit it
    pub async fn finish(mut self) -> Result<StoredPackage> {
        if self.written == 0 {
            self.discard().await;
            return Err(StorageError::Empty(self.identifier.clone()));
        }

        let digest = format!("{:X}", std::mem::take(&mut self.hasher).finalize());
        if self.verify && !self.identifier.matches_digest(&digest) {
            self.discard().await;
            return Err(StorageError::DigestMismatch {
                identifier: self.identifier.clone(),
                actual: digest,
            });
        }

        if let Err(e) = self.flush().await {
            self.discard().await;
            return Err(e);
        }

        if let Some(mut upload) = self.upload.take() {
            if let Err(e) = upload.complete().await {
                let _ = upload.abort().await;
                return Err(e.into());
            }
        }

        tracing::debug!(
            identifier = %self.identifier,
            size = self.written,
            path = %self.location.display(),
            "Stored package"
        );

        Ok(StoredPackage {
            path: self.location.clone(),
            size: self.written,
            sha256: digest,
        })
    }

    /// Drop everything written so far
    pub async fn abort(mut self) {
        self.discard().await;
    }

    async fn discard(&mut self) {
        self.buffer.clear();
        if let Some(mut upload) = self.upload.take() {
            if let Err(e) = upload.abort().await {
                tracing::warn!(identifier = %self.identifier, error = %e, "Failed to abort upload");
            }
        }
    }
}
