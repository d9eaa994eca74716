//! SQLite driver backed by an `r2d2` connection pool.
//!
//! The DSN is a file path (optionally prefixed with `sqlite://`) or
//! `:memory:`.  Every pooled connection gets the same pragmas on open.
//! Pool construction and teardown block, so both run on the blocking
//! thread pool.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, info};

use super::driver::SqlDriver;
use super::{ConnectOptions, SqlPool};

pub const DRIVER_SQLITE: &str = "sqlite";

/// Pragmas applied to every new connection.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

/// `sqlite` driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqlDriver for SqliteDriver {
    fn open(
        &self,
        options: ConnectOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn SqlPool>>> + Send + '_>> {
        Box::pin(async move {
            let pool = tokio::task::spawn_blocking(move || SqlitePool::build(&options)).await??;
            Ok(Arc::new(pool) as Arc<dyn SqlPool>)
        })
    }
}

/// Pooled SQLite connections for one database file.
pub struct SqlitePool {
    path: String,
    /// `None` once closed.
    pool: RwLock<Option<Pool<SqliteConnectionManager>>>,
}

impl SqlitePool {
    /// Build the pool and verify a connection with `SELECT 1`.  Blocking.
    pub fn build(options: &ConnectOptions) -> anyhow::Result<Self> {
        let path = options
            .dsn
            .strip_prefix("sqlite://")
            .unwrap_or(&options.dsn)
            .to_string();

        let manager = if path == ":memory:" {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(&path)
        }
        .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));

        let pool = Pool::builder()
            .max_size(options.max_open_conns)
            .min_idle(Some(options.max_idle_conns))
            .connection_timeout(options.connect_timeout)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to open sqlite database {path}: {e}"))?;

        let conn = pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        drop(conn);

        info!(
            "SQLite pool opened at {} (max_open={}, max_idle={})",
            path, options.max_open_conns, options.max_idle_conns
        );

        Ok(Self {
            path,
            pool: RwLock::new(Some(pool)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn pool(&self) -> anyhow::Result<Pool<SqliteConnectionManager>> {
        self.pool
            .read()
            .map_err(|_| anyhow::anyhow!("sqlite pool lock poisoned"))?
            .clone()
            .ok_or_else(|| anyhow::anyhow!("sqlite pool {} is closed", self.path))
    }

    /// Check out a connection.  Blocks up to the connect timeout when the
    /// pool is exhausted; call from blocking context.
    pub fn get(&self) -> anyhow::Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool()?.get()?)
    }
}

impl SqlPool for SqlitePool {
    fn driver(&self) -> &str {
        DRIVER_SQLITE
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let pool = self.pool()?;
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let conn = pool.get()?;
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await?
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let pool = self
                .pool
                .write()
                .map_err(|_| anyhow::anyhow!("sqlite pool lock poisoned"))?
                .take();
            if let Some(pool) = pool {
                tokio::task::spawn_blocking(move || drop(pool)).await?;
                debug!("SQLite pool at {} closed", self.path);
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

    fn options(dsn: &str) -> ConnectOptions {
        ConnectOptions {
            dsn: dsn.to_string(),
            max_retry: 0,
            max_open_conns: 4,
            max_idle_conns: 1,
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let dsn = format!("sqlite://{}", path.display());

        let pool = SqliteDriver.open(options(&dsn)).await.unwrap();
        assert_eq!(pool.driver(), "sqlite");
        pool.ping().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_connections_share_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let pool = SqlitePool::build(&options(path.to_str().unwrap())).unwrap();

        {
            let conn = pool.get().unwrap();
            conn.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (7);")
                .unwrap();
        }
        let conn = pool.get().unwrap();
        let v: i64 = conn.query_row("SELECT v FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_memory_database() {
        let pool = SqliteDriver.open(options(":memory:")).await.unwrap();
        pool.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_unopenable_path_fails() {
        let result = SqliteDriver
            .open(options("/nonexistent-dir/nested/app.db"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::build(&options(dir.path().join("c.db").to_str().unwrap())).unwrap();

        pool.close().await.unwrap();
        pool.close().await.unwrap();
        assert!(pool.get().is_err());
        assert!(pool.ping().await.is_err());
    }
}
