//! Provider resolution for object storage.
//!
//! Each provider variant is a [`StorageProvider`] strategy with three
//! stages: load credentials, build provider settings, connect.  Strategies
//! are registered in a [`ProviderRegistry`] under a case-insensitive
//! identifier; supporting a new provider means registering a new strategy.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use super::aws::{S3Flavor, S3Provider};
use super::backend::ObjectStore;
use super::gcp::GcsProvider;
use super::local::LocalProvider;
use crate::config::ObjectStorageConfig;
use crate::errors::{ResourceError, Stage};

pub const PROVIDER_LOCAL: &str = "local";
pub const PROVIDER_GCS: &str = "gcs";
pub const PROVIDER_S3: &str = "s3";
pub const PROVIDER_DO: &str = "do";
pub const PROVIDER_MINIO: &str = "minio";

/// One provider variant: credentials -> settings -> connected store.
pub trait StorageProvider: Send + Sync + 'static {
    type Credentials: Send;
    type Settings: Send;

    /// Load the credential set named by `config`.
    fn load_credentials(&self, config: &ObjectStorageConfig) -> anyhow::Result<Self::Credentials>;

    /// Combine credentials with the bucket addressing in `config`.
    fn build_settings(
        &self,
        credentials: Self::Credentials,
        config: &ObjectStorageConfig,
    ) -> anyhow::Result<Self::Settings>;

    /// Produce a ready-to-use store.
    fn connect(
        &self,
        settings: Self::Settings,
    ) -> impl Future<Output = anyhow::Result<Arc<dyn ObjectStore>>> + Send;
}

/// Object-safe view of a [`StorageProvider`], tagging each stage's failure.
trait DynProvider: Send + Sync {
    fn open<'a>(
        &'a self,
        config: &'a ObjectStorageConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn ObjectStore>, ResourceError>> + Send + 'a>>;
}

impl<P: StorageProvider> DynProvider for P {
    fn open<'a>(
        &'a self,
        config: &'a ObjectStorageConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn ObjectStore>, ResourceError>> + Send + 'a>>
    {
        Box::pin(async move {
            let credentials = self
                .load_credentials(config)
                .map_err(|e| ResourceError::connect(Stage::Credentials, e))?;
            let settings = self
                .build_settings(credentials, config)
                .map_err(|e| ResourceError::connect(Stage::Settings, e))?;
            self.connect(settings)
                .await
                .map_err(|e| ResourceError::connect(Stage::Connect, e))
        })
    }
}

/// Strategy table keyed by lowercase provider identifier.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn DynProvider>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `local`, `gcs`, `s3`, `do` and `minio`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PROVIDER_LOCAL, LocalProvider);
        registry.register(PROVIDER_GCS, GcsProvider);
        registry.register(PROVIDER_S3, S3Provider::new(S3Flavor::Aws));
        registry.register(PROVIDER_DO, S3Provider::new(S3Flavor::DigitalOcean));
        registry.register(PROVIDER_MINIO, S3Provider::new(S3Flavor::Minio));
        registry
    }

    /// Register `provider` under `id`, replacing any previous entry.
    pub fn register<P: StorageProvider>(&mut self, id: &str, provider: P) {
        self.providers
            .insert(id.trim().to_lowercase(), Arc::new(provider));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(&id.trim().to_lowercase())
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Resolve `config.provider` and run its strategy.
    pub async fn open(
        &self,
        config: &ObjectStorageConfig,
    ) -> Result<Arc<dyn ObjectStore>, ResourceError> {
        let id = config.provider.trim().to_lowercase();
        let provider = self
            .providers
            .get(&id)
            .ok_or_else(|| ResourceError::ProviderNotFound(config.provider.clone()))?;
        debug!("resolved object storage provider `{}` for {}", id, config.name);
        provider.open(config).await
    }
}
