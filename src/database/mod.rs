//! Relational database handles with leader/follower topology.
//!
//! A [`DatabaseHandle`] holds two pools: the leader for writes and the
//! follower for reads.  When no replica DSN is configured the follower is
//! the very same pool as the leader, so reads and writes share one
//! connection set.

pub mod driver;
pub mod postgres;
pub mod sqlite;

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::ConnConfig;
use crate::errors::ResourceError;

/// Lower bound for pool checkout timeouts; r2d2 rejects a zero timeout.
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// A pooled connection set to one database endpoint.
pub trait SqlPool: Send + Sync + 'static {
    /// Driver identifier that produced this pool.
    fn driver(&self) -> &str;

    /// Check out a connection and run a trivial query.
    fn ping(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Drop every pooled connection.  Idempotent.
    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Downcast hook for reaching the driver-specific pool.
    fn as_any(&self) -> &dyn Any;
}

/// Pool parameters resolved from a defaulted [`ConnConfig`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub dsn: String,
    pub max_retry: u32,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub connect_timeout: Duration,
}

impl From<&ConnConfig> for ConnectOptions {
    fn from(conn: &ConnConfig) -> Self {
        Self {
            dsn: conn.dsn.clone(),
            max_retry: conn.max_retry(),
            max_open_conns: conn.max_open_conns(),
            max_idle_conns: conn.max_idle_conns(),
            connect_timeout: conn.connect_timeout().max(MIN_CONNECT_TIMEOUT),
        }
    }
}

/// A connected database registered under a name.
pub struct DatabaseHandle {
    name: String,
    driver: String,
    leader: Arc<dyn SqlPool>,
    follower: Arc<dyn SqlPool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("has_replica", &self.has_replica())
            .finish_non_exhaustive()
    }
}

impl DatabaseHandle {
    /// Without a `follower`, reads are served by the leader pool.
    pub fn new(
        name: impl Into<String>,
        driver: impl Into<String>,
        leader: Arc<dyn SqlPool>,
        follower: Option<Arc<dyn SqlPool>>,
    ) -> Self {
        let follower = follower.unwrap_or_else(|| Arc::clone(&leader));
        Self {
            name: name.into(),
            driver: driver.into(),
            leader,
            follower,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Read-write pool.
    pub fn leader(&self) -> &Arc<dyn SqlPool> {
        &self.leader
    }

    /// Read-only pool; the leader itself when no replica is configured.
    pub fn follower(&self) -> &Arc<dyn SqlPool> {
        &self.follower
    }

    /// Whether the follower is a distinct pool.
    pub fn has_replica(&self) -> bool {
        !Arc::ptr_eq(&self.leader, &self.follower)
    }

    /// The leader as its concrete pool type, e.g. [`sqlite::SqlitePool`].
    pub fn leader_as<T: SqlPool>(&self) -> Option<&T> {
        self.leader.as_any().downcast_ref::<T>()
    }

    /// The follower as its concrete pool type.
    pub fn follower_as<T: SqlPool>(&self) -> Option<&T> {
        self.follower.as_any().downcast_ref::<T>()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the follower (when distinct) and the leader.
    ///
    /// Both pools are closed even if the first one fails.  Later calls
    /// return `Ok(())`.
    pub async fn close(&self) -> Result<(), ResourceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing database `{}` ({})", self.name, self.driver);

        let follower = if self.has_replica() {
            self.follower.close().await
        } else {
            Ok(())
        };
        let leader = self.leader.close().await;

        match (leader, follower) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(ResourceError::Close(e.context("leader"))),
            (Ok(()), Err(e)) => Err(ResourceError::Close(e.context("follower"))),
            (Err(leader), Err(follower)) => Err(ResourceError::Close(anyhow::anyhow!(
                "leader: {leader:#}; follower: {follower:#}"
            ))),
        }
    }
}
