//! Cache endpoint handles.
//!
//! Every configured endpoint gets its own pool sized by the family-wide
//! `max_active` / `max_idle` settings.

pub mod redis;

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{CacheConfig, CacheConnConfig};
use crate::errors::ResourceError;

/// Pooled connections to one cache endpoint.
pub trait CachePool: Send + Sync + 'static {
    /// Round-trip a `PING`.
    fn ping(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Drop every pooled connection.  Idempotent.
    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Downcast hook for reaching the client-specific pool.
    fn as_any(&self) -> &dyn Any;
}

/// Connects a cache endpoint.
pub trait CacheConnector: Send + Sync + 'static {
    fn connect(
        &self,
        options: CacheOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn CachePool>>> + Send + '_>>;
}

/// Pool parameters for one endpoint.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub address: String,
    pub max_active: u32,
    pub max_idle: u32,
    pub timeout: Duration,
}

impl CacheOptions {
    pub fn new(family: &CacheConfig, endpoint: &CacheConnConfig) -> Self {
        Self {
            address: endpoint.address.clone(),
            max_active: family.max_active,
            max_idle: family.max_idle,
            timeout: Duration::from_secs(family.timeout).max(Duration::from_millis(100)),
        }
    }
}

/// A connected cache endpoint registered under a name.
pub struct CacheHandle {
    name: String,
    address: String,
    pool: Arc<dyn CachePool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl CacheHandle {
    pub fn new(name: impl Into<String>, address: impl Into<String>, pool: Arc<dyn CachePool>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            pool,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pool(&self) -> &Arc<dyn CachePool> {
        &self.pool
    }

    /// The pool as its concrete type, e.g. [`redis::RedisPool`].
    pub fn pool_as<T: CachePool>(&self) -> Option<&T> {
        self.pool.as_any().downcast_ref::<T>()
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.pool.ping().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the pool.  Later calls return `Ok(())`.
    pub async fn close(&self) -> Result<(), ResourceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing cache `{}` ({})", self.name, self.address);
        self.pool.close().await.map_err(ResourceError::Close)
    }
}
