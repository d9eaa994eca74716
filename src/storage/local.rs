//! Local filesystem object store.
//!
//! Objects are stored as flat files under the bucket directory
//! (`{root_dir}/{bucket}`).  The key is used directly as a relative path.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.
//! The bucket directory survives [`ObjectStore::close`] unless the store
//! was opened with `delete_on_close`.

use bytes::Bytes;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info};

use super::backend::{compute_etag, CloseFlag, ObjectStore, StoredObject};
use super::provider::StorageProvider;
use crate::config::ObjectStorageConfig;

/// Options for [`LocalStore::new`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOptions {
    /// Remove the bucket directory on close.
    pub delete_on_close: bool,
}

/// Stores objects on the local filesystem.
pub struct LocalStore {
    /// Bucket directory holding all objects.
    root: PathBuf,
    options: LocalOptions,
    closed: CloseFlag,
}

impl LocalStore {
    /// Create a new `LocalStore` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>, options: LocalOptions) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        // Also create the .tmp directory for atomic writes.
        std::fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self {
            root,
            options,
            closed: CloseFlag::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to an absolute file path.
    ///
    /// Rejects keys that would escape the bucket directory.
    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) | std::path::Component::CurDir => {}
                _ => anyhow::bail!("Path traversal detected in key: {}", key),
            }
        }
        let path = self.root.join(key);
        if path.exists() {
            let canonical_root = self
                .root
                .canonicalize()
                .unwrap_or_else(|_| self.root.clone());
            if !path.canonicalize()?.starts_with(&canonical_root) {
                anyhow::bail!("Path traversal detected in key: {}", key);
            }
        }
        Ok(path)
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(".tmp").join(format!("tmp-{}", id))
    }
}

impl ObjectStore for LocalStore {
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;
            let final_path = self.resolve(&key)?;

            // Keys with '/' separators map to nested directories.
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let etag = compute_etag(&data);

            let tmp_path = self.temp_path();
            if let Some(parent) = tmp_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;

            std::fs::rename(&tmp_path, &final_path)?;

            Ok(etag)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredObject>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;
            let path = self.resolve(&key)?;

            if !path.is_file() {
                anyhow::bail!("Object not found at key: {}", key);
            }

            let data = std::fs::read(&path)?;
            Ok(StoredObject::new(Bytes::from(data)))
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;
            let path = self.resolve(&key)?;

            if path.is_file() {
                std::fs::remove_file(&path)?;
            }

            Ok(())
        })
    }

    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;
            let path = self.resolve(&key)?;
            Ok(path.is_file())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if !self.closed.close() {
                return Ok(());
            }
            if self.options.delete_on_close && self.root.exists() {
                std::fs::remove_dir_all(&self.root)?;
                debug!("removed local bucket directory {}", self.root.display());
            }
            Ok(())
        })
    }
}

/// Settings for a local bucket directory.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub path: PathBuf,
    pub options: LocalOptions,
}

/// `local` provider strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProvider;

impl StorageProvider for LocalProvider {
    type Credentials = ();
    type Settings = LocalSettings;

    fn load_credentials(&self, _config: &ObjectStorageConfig) -> anyhow::Result<()> {
        Ok(())
    }

    fn build_settings(
        &self,
        _credentials: (),
        config: &ObjectStorageConfig,
    ) -> anyhow::Result<LocalSettings> {
        if config.bucket.trim().is_empty() {
            anyhow::bail!("local storage requires a bucket path");
        }
        Ok(LocalSettings {
            path: Path::new(&config.local.root_dir).join(&config.bucket),
            options: LocalOptions {
                delete_on_close: config.local.delete_on_close,
            },
        })
    }

    async fn connect(&self, settings: LocalSettings) -> anyhow::Result<Arc<dyn ObjectStore>> {
        let store = LocalStore::new(&settings.path, settings.options)?;
        info!("Local object store opened at {}", settings.path.display());
        Ok(Arc::new(store))
    }
}
