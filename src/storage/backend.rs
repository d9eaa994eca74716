//! Uniform object storage capability surface.
//!
//! Every provider variant implements [`ObjectStore`].  The trait works in
//! terms of opaque byte payloads so callers do not need to know which
//! provider backs a given handle.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

/// A stored object's data plus its content hash.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Raw bytes of the object.
    pub data: Bytes,
    /// Hex-encoded SHA-256 of `data`.
    pub content_hash: String,
}

impl StoredObject {
    pub fn new(data: Bytes) -> Self {
        use sha2::{Digest as Sha2Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let content_hash = hex::encode(hasher.finalize());
        Self { data, content_hash }
    }
}

/// Async object storage contract.
pub trait ObjectStore: Send + Sync + 'static {
    /// Write `data` to `key`, returning the quoted MD5 ETag.
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Read the full object at `key`.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredObject>> + Send + '_>>;

    /// Delete the object at `key`.  Deleting a missing key is not an error.
    fn delete(&self, key: &str)
        -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Check whether an object exists at `key`.
    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Release the client.  Operations after close fail.
    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Quoted hex MD5 of `data`, the ETag convention shared by all providers.
pub fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Open/closed flag shared by the store implementations.
#[derive(Debug, Default)]
pub(crate) struct CloseFlag(AtomicBool);

impl CloseFlag {
    /// Mark closed.  Returns `true` only for the first call.
    pub(crate) fn close(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> anyhow::Result<()> {
        if self.0.load(Ordering::SeqCst) {
            anyhow::bail!("object store is closed");
        }
        Ok(())
    }
}
