//! Configuration loading and types for the resource hub.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  It declares every resource to bring up, grouped by
//! family: relational databases, redis caches, and object storage.
//!
//! [`Config::set_default`] must run once before bring-up.  It fills unset
//! pool-sizing, timeout and retry fields from the family-wide defaults and
//! rejects configurations that cannot be resolved.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::errors::{ConfigError, ResourceKind};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct Config {
    /// Relational databases.
    #[serde(default)]
    #[garde(dive)]
    pub database: DatabaseConfig,

    /// Redis caches.
    #[serde(default)]
    #[garde(dive)]
    pub redis: CacheConfig,

    /// Object storage buckets.
    #[serde(default)]
    #[garde(dive)]
    pub object_storage: Vec<ObjectStorageConfig>,

    /// Logging settings.
    #[serde(default)]
    #[garde(skip)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Database family configuration.
///
/// The top-level `max_retry`, `max_open_conns`, `max_idle_conns` and
/// `connect_timeout` values are defaults for every leader and replica
/// connection that does not set its own.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DatabaseConfig {
    /// Extra connect attempts after the first failure.
    #[serde(default = "default_max_retry")]
    #[garde(skip)]
    pub max_retry: u32,

    /// Upper bound on pooled connections.
    #[serde(default = "default_max_open_conns")]
    #[garde(skip)]
    pub max_open_conns: u32,

    /// Connections kept idle in the pool.
    #[serde(default = "default_max_idle_conns")]
    #[garde(skip)]
    pub max_idle_conns: u32,

    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    #[garde(skip)]
    pub connect_timeout: u64,

    /// Configured databases.
    #[serde(default)]
    #[garde(dive)]
    pub dbs: Vec<SqlDbConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
            max_open_conns: default_max_open_conns(),
            max_idle_conns: default_max_idle_conns(),
            connect_timeout: default_connect_timeout(),
            dbs: Vec::new(),
        }
    }
}

/// One logical database with a leader and an optional replica.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SqlDbConfig {
    /// Registry name.
    #[garde(length(min = 1))]
    pub name: String,

    /// Driver identifier, e.g. `sqlite` or `postgres`.
    #[serde(default)]
    #[garde(skip)]
    pub driver: String,

    /// Read-write connection.
    #[garde(skip)]
    pub leader: ConnConfig,

    /// Read-only connection.  Without a DSN, reads go through the leader.
    #[serde(default)]
    #[garde(skip)]
    pub replica: Option<ConnConfig>,
}

impl SqlDbConfig {
    /// The replica settings, if one with a non-empty DSN is configured.
    pub fn replica(&self) -> Option<&ConnConfig> {
        self.replica.as_ref().filter(|r| !r.dsn.is_empty())
    }
}

/// Connection settings for a leader or replica.  `None` fields take the
/// family-wide default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnConfig {
    #[serde(default)]
    pub dsn: String,
    pub max_retry: Option<u32>,
    pub max_open_conns: Option<u32>,
    pub max_idle_conns: Option<u32>,
    /// Connect timeout in seconds.
    pub connect_timeout: Option<u64>,
}

impl ConnConfig {
    fn set_default(
        &mut self,
        defaults: &DatabaseConfig,
        name: &str,
        role: &'static str,
    ) -> Result<(), ConfigError> {
        let open = *self.max_open_conns.get_or_insert(defaults.max_open_conns);
        let idle = *self.max_idle_conns.get_or_insert(defaults.max_idle_conns);
        self.max_retry.get_or_insert(defaults.max_retry);
        self.connect_timeout.get_or_insert(defaults.connect_timeout);

        if open == 0 {
            return Err(ConfigError::ZeroOpenConns {
                name: name.to_string(),
                role,
            });
        }
        if idle > open {
            return Err(ConfigError::IdleExceedsOpen {
                name: name.to_string(),
                role,
                idle,
                open,
            });
        }
        Ok(())
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry.unwrap_or_else(default_max_retry)
    }

    pub fn max_open_conns(&self) -> u32 {
        self.max_open_conns.unwrap_or_else(default_max_open_conns)
    }

    pub fn max_idle_conns(&self) -> u32 {
        self.max_idle_conns.unwrap_or_else(default_max_idle_conns)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.unwrap_or_else(default_connect_timeout))
    }
}

/// Redis family configuration: shared pool settings plus endpoints.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CacheConfig {
    /// Upper bound on pooled connections per endpoint.
    #[serde(default = "default_cache_max_active")]
    #[garde(skip)]
    pub max_active: u32,

    /// Connections kept idle per endpoint.
    #[serde(default = "default_cache_max_idle")]
    #[garde(skip)]
    pub max_idle: u32,

    /// Connect / checkout timeout in seconds.
    #[serde(default = "default_cache_timeout")]
    #[garde(skip)]
    pub timeout: u64,

    /// Configured endpoints.
    #[serde(default)]
    #[garde(dive)]
    pub rds: Vec<CacheConnConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_active: default_cache_max_active(),
            max_idle: default_cache_max_idle(),
            timeout: default_cache_timeout(),
            rds: Vec::new(),
        }
    }
}

/// One redis endpoint.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CacheConnConfig {
    #[garde(length(min = 1))]
    pub name: String,
    /// `host:port` or a `redis://` URL.
    #[garde(length(min = 1))]
    pub address: String,
}

/// One object storage bucket.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ObjectStorageConfig {
    /// Registry name.
    #[garde(length(min = 1))]
    pub name: String,

    /// Provider identifier: `local`, `gcs`, `s3`, `do` or `minio` (case-insensitive).
    #[serde(default)]
    #[garde(skip)]
    pub provider: String,

    /// Bucket name, or directory name for `local`.
    #[serde(default)]
    #[garde(skip)]
    pub bucket: String,

    /// Scheme used when building public object URLs.
    #[serde(default)]
    #[garde(skip)]
    pub bucket_proto: String,

    /// Host (and optional path) used when building public object URLs.
    #[serde(default)]
    #[garde(skip)]
    pub bucket_url: String,

    #[serde(default)]
    #[garde(skip)]
    pub region: String,

    /// Custom endpoint for S3-compatible services.
    #[serde(default)]
    #[garde(skip)]
    pub endpoint: String,

    #[serde(default)]
    #[garde(skip)]
    pub gcs: GcsConfig,

    #[serde(default)]
    #[garde(skip)]
    pub s3: S3Config,

    #[serde(default)]
    #[garde(skip)]
    pub local: LocalConfig,
}

/// GCS credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcsConfig {
    /// Path to a service account JSON key file.
    #[serde(default)]
    pub json_key: String,
}

/// Credentials and addressing flags for the S3-compatible family.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Use plain HTTP for endpoints given without a scheme.
    #[serde(default)]
    pub disable_ssl: bool,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`.
    #[serde(default)]
    pub force_path_style: bool,
}

/// Local directory-backed storage options.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Parent directory of the bucket directory.
    #[serde(default = "default_local_root")]
    pub root_dir: String,
    /// Remove the bucket directory when the store is closed.
    #[serde(default)]
    pub delete_on_close: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root_dir: default_local_root(),
            delete_on_close: false,
        }
    }
}

impl Config {
    /// Validate the configuration and fill unset fields with defaults.
    ///
    /// Runs before any connection is attempted.  A failure here is fatal
    /// for the whole bring-up.  Calling it twice is harmless.
    pub fn set_default(&mut self) -> Result<(), ConfigError> {
        self.validate()?;

        ensure_unique(
            ResourceKind::Database,
            self.database.dbs.iter().map(|db| db.name.as_str()),
        )?;
        ensure_unique(
            ResourceKind::Cache,
            self.redis.rds.iter().map(|rd| rd.name.as_str()),
        )?;
        ensure_unique(
            ResourceKind::ObjectStorage,
            self.object_storage.iter().map(|os| os.name.as_str()),
        )?;

        let defaults = self.database.clone();
        for db in &mut self.database.dbs {
            // An empty driver is rejected rather than guessed.
            if db.driver.trim().is_empty() {
                return Err(ConfigError::EmptyDriver {
                    name: db.name.clone(),
                });
            }
            if db.leader.dsn.is_empty() {
                return Err(ConfigError::EmptyLeaderDsn {
                    name: db.name.clone(),
                });
            }
            db.leader.set_default(&defaults, &db.name, "leader")?;
            if let Some(replica) = db.replica.as_mut().filter(|r| !r.dsn.is_empty()) {
                replica.set_default(&defaults, &db.name, "replica")?;
            }
        }

        if self.redis.max_active == 0 {
            return Err(ConfigError::ZeroCacheActive);
        }
        if self.redis.max_idle > self.redis.max_active {
            return Err(ConfigError::CacheIdleExceedsActive {
                idle: self.redis.max_idle,
                active: self.redis.max_active,
            });
        }

        Ok(())
    }

    /// Total number of configured resources across all families.
    pub fn resource_count(&self) -> usize {
        self.database.dbs.len() + self.redis.rds.len() + self.object_storage.len()
    }
}

fn ensure_unique<'a>(
    kind: ResourceKind,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

// -- Defaults ----------------------------------------------------------------

fn default_max_retry() -> u32 {
    3
}

fn default_max_open_conns() -> u32 {
    10
}

fn default_max_idle_conns() -> u32 {
    2
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_cache_max_active() -> u32 {
    100
}

fn default_cache_max_idle() -> u32 {
    10
}

fn default_cache_timeout() -> u64 {
    5
}

fn default_local_root() -> String {
    ".".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}
