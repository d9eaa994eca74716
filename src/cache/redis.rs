//! Redis connector backed by the `redis` crate's `r2d2` integration.
//!
//! Addresses may be given as `host:port` or as a full `redis://` /
//! `rediss://` URL.  Besides the blocking pool, the handle exposes the
//! underlying [`::redis::Client`] for multiplexed async connections.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use r2d2::{Pool, PooledConnection};
use tracing::{debug, info};

use super::{CacheConnector, CacheOptions, CachePool};

/// Prefix `redis://` when `address` carries no scheme.
fn normalize_address(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{address}")
    }
}

/// Default cache connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

impl CacheConnector for RedisConnector {
    fn connect(
        &self,
        options: CacheOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn CachePool>>> + Send + '_>> {
        Box::pin(async move {
            let pool = tokio::task::spawn_blocking(move || RedisPool::build(&options)).await??;
            Ok(Arc::new(pool) as Arc<dyn CachePool>)
        })
    }
}

/// Pooled connections to one redis endpoint.
pub struct RedisPool {
    url: String,
    client: ::redis::Client,
    /// `None` once closed.
    pool: RwLock<Option<Pool<::redis::Client>>>,
}

impl RedisPool {
    /// Build the pool and verify it with `PING`.  Blocking.
    pub fn build(options: &CacheOptions) -> anyhow::Result<Self> {
        let url = normalize_address(&options.address);
        let client = ::redis::Client::open(url.as_str())
            .map_err(|e| anyhow::anyhow!("Invalid redis address {}: {e}", options.address))?;

        let pool = Pool::builder()
            .max_size(options.max_active)
            .min_idle(Some(options.max_idle))
            .connection_timeout(options.timeout)
            .build(client.clone())
            .map_err(|e| anyhow::anyhow!("Failed to connect to redis {url}: {e}"))?;

        let mut conn = pool.get()?;
        let _: String = ::redis::cmd("PING").query(&mut *conn)?;
        drop(conn);

        info!(
            "Redis pool opened for {} (max_active={}, max_idle={})",
            url, options.max_active, options.max_idle
        );

        Ok(Self {
            url,
            client,
            pool: RwLock::new(Some(pool)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The client, for `get_multiplexed_async_connection` and friends.
    pub fn client(&self) -> &::redis::Client {
        &self.client
    }

    fn pool(&self) -> anyhow::Result<Pool<::redis::Client>> {
        self.pool
            .read()
            .map_err(|_| anyhow::anyhow!("redis pool lock poisoned"))?
            .clone()
            .ok_or_else(|| anyhow::anyhow!("redis pool {} is closed", self.url))
    }

    /// Check out a blocking connection.
    pub fn get(&self) -> anyhow::Result<PooledConnection<::redis::Client>> {
        Ok(self.pool()?.get()?)
    }
}

impl CachePool for RedisPool {
    fn ping(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.pool()?;
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let pool = self
                .pool
                .write()
                .map_err(|_| anyhow::anyhow!("redis pool lock poisoned"))?
                .take();
            if let Some(pool) = pool {
                tokio::task::spawn_blocking(move || drop(pool)).await?;
                debug!("Redis pool for {} closed", self.url);
            }
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("cache:6379"), "redis://cache:6379");
        assert_eq!(
            normalize_address("rediss://cache.example.com:6380/2"),
            "rediss://cache.example.com:6380/2"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let options = CacheOptions {
            address: "127.0.0.1:1".to_string(),
            max_active: 2,
            max_idle: 0,
            timeout: Duration::from_millis(500),
        };
        assert!(RedisConnector.connect(options).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_address_fails() {
        let options = CacheOptions {
            address: "http://not-redis".to_string(),
            max_active: 2,
            max_idle: 0,
            timeout: Duration::from_millis(500),
        };
        assert!(RedisConnector.connect(options).await.is_err());
    }
}
