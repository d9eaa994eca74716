//! Object storage handles.
//!
//! The [`backend::ObjectStore`] trait abstracts over where bytes
//! physically live.  Implementations cover local disk, S3-compatible
//! services (AWS, DigitalOcean Spaces, MinIO) and Google Cloud Storage;
//! [`provider::ProviderRegistry`] picks one per configuration entry.

pub mod aws;
pub mod backend;
pub mod gcp;
pub mod local;
pub mod provider;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::ObjectStorageConfig;
use crate::errors::ResourceError;
use backend::ObjectStore;

/// A connected object store registered under a name.
pub struct ObjectStorageHandle {
    name: String,
    provider: String,
    store: Arc<dyn ObjectStore>,
    /// `{bucket_proto}://{bucket_url}` when a public URL is configured.
    public_base: Option<String>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ObjectStorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorageHandle")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("public_base", &self.public_base)
            .finish_non_exhaustive()
    }
}

impl ObjectStorageHandle {
    pub fn new(config: &ObjectStorageConfig, store: Arc<dyn ObjectStore>) -> Self {
        let public_base = match config.bucket_url.trim().trim_end_matches('/') {
            "" => None,
            url => {
                let proto = match config.bucket_proto.trim() {
                    "" => "https",
                    proto => proto,
                };
                Some(format!("{proto}://{url}"))
            }
        };

        Self {
            name: config.name.clone(),
            provider: config.provider.trim().to_lowercase(),
            store,
            public_base,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized provider identifier (`local`, `gcs`, `s3`, ...).
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Public URL of `key`, if the entry configures `bucket_url`.
    pub fn public_url(&self, key: &str) -> Option<String> {
        self.public_base
            .as_ref()
            .map(|base| format!("{}/{}", base, key.trim_start_matches('/')))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the underlying store.  Later calls return `Ok(())` without
    /// touching the store again.
    pub async fn close(&self) -> Result<(), ResourceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing object storage `{}` ({})", self.name, self.provider);
        self.store.close().await.map_err(ResourceError::Close)
    }
}
