//! Driver resolution for relational databases.
//!
//! Mirrors the object storage provider table: each driver is registered
//! under a case-insensitive identifier and opens a [`SqlPool`] from
//! [`ConnectOptions`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use super::postgres::PostgresDriver;
use super::sqlite::SqliteDriver;
use super::{ConnectOptions, DatabaseHandle, SqlPool};
use crate::backoff;
use crate::config::{ConnConfig, SqlDbConfig};
use crate::errors::{ResourceError, Stage};

/// Opens pools for one database engine.
pub trait SqlDriver: Send + Sync + 'static {
    fn open(
        &self,
        options: ConnectOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn SqlPool>>> + Send + '_>>;
}

/// Strategy table keyed by lowercase driver identifier.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn SqlDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `sqlite` (alias `sqlite3`) and `postgres` (alias
    /// `postgresql`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let sqlite = Arc::new(SqliteDriver);
        let postgres = Arc::new(PostgresDriver);
        registry.register_arc("sqlite", sqlite.clone());
        registry.register_arc("sqlite3", sqlite);
        registry.register_arc("postgres", postgres.clone());
        registry.register_arc("postgresql", postgres);
        registry
    }

    /// Register `driver` under `id`, replacing any previous entry.
    pub fn register<D: SqlDriver>(&mut self, id: &str, driver: D) {
        self.register_arc(id, Arc::new(driver));
    }

    fn register_arc(&mut self, id: &str, driver: Arc<dyn SqlDriver>) {
        self.drivers.insert(id.trim().to_lowercase(), driver);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.drivers.contains_key(&id.trim().to_lowercase())
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn SqlDriver>, ResourceError> {
        self.drivers
            .get(&id.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| ResourceError::DriverNotFound(id.to_string()))
    }

    /// Connect the leader, then the replica when one is configured.
    ///
    /// A follower failure closes the already opened leader before the
    /// error is returned.
    pub async fn connect(&self, config: &SqlDbConfig) -> Result<DatabaseHandle, ResourceError> {
        let driver = self.resolve(&config.driver)?;
        let driver_id = config.driver.trim().to_lowercase();

        debug!("connecting leader for database {}", config.name);
        let leader = open_with_retry(driver.as_ref(), &config.leader)
            .await
            .map_err(|e| ResourceError::connect(Stage::Leader, e))?;

        let follower = match config.replica() {
            Some(replica) => {
                debug!("connecting follower for database {}", config.name);
                match open_with_retry(driver.as_ref(), replica).await {
                    Ok(pool) => Some(pool),
                    Err(e) => {
                        if let Err(close_err) = leader.close().await {
                            warn!(
                                "closing leader of database {} after follower failure: {:#}",
                                config.name, close_err
                            );
                        }
                        return Err(ResourceError::connect(Stage::Follower, e));
                    }
                }
            }
            None => None,
        };

        Ok(DatabaseHandle::new(
            config.name.clone(),
            driver_id,
            leader,
            follower,
        ))
    }
}

async fn open_with_retry(
    driver: &dyn SqlDriver,
    conn: &ConnConfig,
) -> anyhow::Result<Arc<dyn SqlPool>> {
    let options = &ConnectOptions::from(conn);
    backoff::retry(options.max_retry, move || driver.open(options.clone())).await
}
