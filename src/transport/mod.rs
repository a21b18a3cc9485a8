//! Byte-store transports used to persist the exported relational store.
//!
//! The store is persisted as one opaque blob. A transport only knows how to
//! read and overwrite that blob and which location it is configured to use:
//! - [`HttpByteStore`]: remote backend reached over HTTP
//! - [`FileByteStore`]: a blob file on the local filesystem
//! - [`MemoryByteStore`]: process-local blob, used for tests and ephemeral stores

mod http;

pub use http::HttpByteStore;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{TransportError, TransportResult};

/// Read/overwrite access to a single persisted blob.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ByteStore: Send + Sync {
    /// Whether the backend can currently be reached.
    async fn probe(&self) -> bool;

    /// Read the full blob, `None` if nothing has been written yet.
    async fn read(&self) -> TransportResult<Option<Vec<u8>>>;

    /// Overwrite the blob.
    async fn write(&self, bytes: &[u8]) -> TransportResult<()>;

    /// The explicitly configured location, if any.
    async fn configured_location(&self) -> TransportResult<Option<String>>;

    /// Point the transport at a new location.
    async fn set_configured_location(&self, location: &str) -> TransportResult<()>;

    /// Forget the configured location and fall back to the default.
    async fn clear_configured_location(&self) -> TransportResult<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    bytes: Option<Vec<u8>>,
    location: Option<String>,
    unreachable: bool,
    writes: usize,
}

/// In-process byte store. Clones share the same blob.
#[derive(Debug, Clone, Default)]
pub struct MemoryByteStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryByteStore {
    /// Create an empty, reachable store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a blob.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        let store = Self::new();
        store.lock().bytes = Some(bytes);
        store
    }

    /// Simulate the backend going up or down.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Current blob contents.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.lock().bytes.clone()
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_reachable(&self) -> TransportResult<()> {
        if self.lock().unreachable {
            return Err(TransportError::Unreachable {
                message: "memory store marked unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ByteStore for MemoryByteStore {
    async fn probe(&self) -> bool {
        !self.lock().unreachable
    }

    async fn read(&self) -> TransportResult<Option<Vec<u8>>> {
        self.ensure_reachable()?;
        Ok(self.lock().bytes.clone())
    }

    async fn write(&self, bytes: &[u8]) -> TransportResult<()> {
        self.ensure_reachable()?;
        let mut state = self.lock();
        state.bytes = Some(bytes.to_vec());
        state.writes += 1;
        Ok(())
    }

    async fn configured_location(&self) -> TransportResult<Option<String>> {
        Ok(self.lock().location.clone())
    }

    async fn set_configured_location(&self, location: &str) -> TransportResult<()> {
        self.lock().location = Some(location.to_string());
        Ok(())
    }

    async fn clear_configured_location(&self) -> TransportResult<()> {
        self.lock().location = None;
        Ok(())
    }
}

/// Blob stored as a single file. Writes go through a sibling temp file and a rename.
#[derive(Debug)]
pub struct FileByteStore {
    default_path: PathBuf,
    location: RwLock<Option<PathBuf>>,
}

impl FileByteStore {
    /// Create a file store writing to `path` unless another location is configured.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            default_path: path.into(),
            location: RwLock::new(None),
        }
    }

    /// Start with an explicitly configured location.
    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = RwLock::new(Some(location.into()));
        self
    }

    /// The file currently targeted.
    pub fn target(&self) -> PathBuf {
        self.location
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| self.default_path.clone())
    }

    fn parent_of(path: &Path) -> Option<&Path> {
        path.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

#[async_trait]
impl ByteStore for FileByteStore {
    async fn probe(&self) -> bool {
        let target = self.target();
        match Self::parent_of(&target) {
            Some(parent) => {
                if tokio::fs::create_dir_all(parent).await.is_err() {
                    return false;
                }
                tokio::fs::metadata(parent)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false)
            }
            None => true,
        }
    }

    async fn read(&self) -> TransportResult<Option<Vec<u8>>> {
        let target = self.target();
        match tokio::fs::read(&target).await {
            Ok(bytes) => {
                debug!(path = %target.display(), bytes = bytes.len(), "Read store blob");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    async fn write(&self, bytes: &[u8]) -> TransportResult<()> {
        let target = self.target();
        if let Some(parent) = Self::parent_of(&target) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = target.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;

        debug!(path = %target.display(), bytes = bytes.len(), "Wrote store blob");
        Ok(())
    }

    async fn configured_location(&self) -> TransportResult<Option<String>> {
        Ok(self
            .location
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.display().to_string()))
    }

    async fn set_configured_location(&self, location: &str) -> TransportResult<()> {
        *self.location.write().unwrap_or_else(|e| e.into_inner()) = Some(PathBuf::from(location));
        Ok(())
    }

    async fn clear_configured_location(&self) -> TransportResult<()> {
        *self.location.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
