//! The resource registry.
//!
//! A [`ResourceHub`] is built once by bring-up and never mutated
//! afterwards, so lookups need no locking.  Each family has a fallible
//! accessor (`get_*`) and a fail-fast accessor (`must_get_*`) for
//! resources the caller cannot run without.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bringup::{self, Connectors};
use crate::cache::CacheHandle;
use crate::config::Config;
use crate::database::DatabaseHandle;
use crate::errors::{
    BringUpError, CloseAllError, LookupError, PartialBringUp, ResourceError, ResourceFailure,
    ResourceKind,
};
use crate::metrics::{CLOSED_TOTAL, CLOSE_FAILURES_TOTAL};
use crate::storage::ObjectStorageHandle;

/// A handle of any family.
#[derive(Debug, Clone)]
pub enum Resource {
    Database(Arc<DatabaseHandle>),
    Cache(Arc<CacheHandle>),
    ObjectStorage(Arc<ObjectStorageHandle>),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Database(_) => ResourceKind::Database,
            Resource::Cache(_) => ResourceKind::Cache,
            Resource::ObjectStorage(_) => ResourceKind::ObjectStorage,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Database(h) => h.name(),
            Resource::Cache(h) => h.name(),
            Resource::ObjectStorage(h) => h.name(),
        }
    }

    async fn close(&self) -> Result<(), ResourceError> {
        match self {
            Resource::Database(h) => h.close().await,
            Resource::Cache(h) => h.close().await,
            Resource::ObjectStorage(h) => h.close().await,
        }
    }
}

/// Name-keyed registry of connected resources.
#[derive(Default)]
pub struct ResourceHub {
    databases: HashMap<String, Arc<DatabaseHandle>>,
    caches: HashMap<String, Arc<CacheHandle>>,
    object_storages: HashMap<String, Arc<ObjectStorageHandle>>,
}

impl std::fmt::Debug for ResourceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHub")
            .field("databases", &self.names(ResourceKind::Database))
            .field("caches", &self.names(ResourceKind::Cache))
            .field("object_storages", &self.names(ResourceKind::ObjectStorage))
            .finish()
    }
}

impl ResourceHub {
    /// Default every entry of `config`, then connect all of them
    /// concurrently with the built-in connectors.
    ///
    /// Fails with [`BringUpError::Config`] before connecting anything when
    /// defaulting fails.  When some resources fail, the error is
    /// [`BringUpError::Partial`] and still carries a usable hub holding
    /// every resource that did come up.
    pub async fn new(config: Config) -> Result<Self, BringUpError> {
        Self::with_connectors(config, Connectors::default()).await
    }

    /// Like [`ResourceHub::new`], with caller-supplied strategies.
    pub async fn with_connectors(
        mut config: Config,
        connectors: Connectors,
    ) -> Result<Self, BringUpError> {
        config.set_default()?;

        let (hub, failures) = bringup::bring_up(config, connectors).await;
        if failures.is_empty() {
            Ok(hub)
        } else {
            Err(BringUpError::Partial(Box::new(PartialBringUp {
                hub,
                failures,
            })))
        }
    }

    pub(crate) fn insert(&mut self, name: String, resource: Resource) {
        match resource {
            Resource::Database(h) => {
                self.databases.insert(name, h);
            }
            Resource::Cache(h) => {
                self.caches.insert(name, h);
            }
            Resource::ObjectStorage(h) => {
                self.object_storages.insert(name, h);
            }
        }
    }

    // -- Lookup ---------------------------------------------------------------

    pub fn get_database(&self, name: &str) -> Result<Arc<DatabaseHandle>, LookupError> {
        lookup(&self.databases, ResourceKind::Database, name)
    }

    pub fn get_cache(&self, name: &str) -> Result<Arc<CacheHandle>, LookupError> {
        lookup(&self.caches, ResourceKind::Cache, name)
    }

    pub fn get_object_storage(&self, name: &str) -> Result<Arc<ObjectStorageHandle>, LookupError> {
        lookup(&self.object_storages, ResourceKind::ObjectStorage, name)
    }

    /// # Panics
    ///
    /// If no database named `name` is registered.
    #[track_caller]
    pub fn must_get_database(&self, name: &str) -> Arc<DatabaseHandle> {
        must(self.get_database(name))
    }

    /// # Panics
    ///
    /// If no cache named `name` is registered.
    #[track_caller]
    pub fn must_get_cache(&self, name: &str) -> Arc<CacheHandle> {
        must(self.get_cache(name))
    }

    /// # Panics
    ///
    /// If no object storage named `name` is registered.
    #[track_caller]
    pub fn must_get_object_storage(&self, name: &str) -> Arc<ObjectStorageHandle> {
        must(self.get_object_storage(name))
    }

    /// Family-agnostic lookup.
    pub fn get(&self, kind: ResourceKind, name: &str) -> Result<Resource, LookupError> {
        match kind {
            ResourceKind::Database => self.get_database(name).map(Resource::Database),
            ResourceKind::Cache => self.get_cache(name).map(Resource::Cache),
            ResourceKind::ObjectStorage => {
                self.get_object_storage(name).map(Resource::ObjectStorage)
            }
        }
    }

    /// Registered names of one family, sorted.
    pub fn names(&self, kind: ResourceKind) -> Vec<&str> {
        let mut names: Vec<&str> = match kind {
            ResourceKind::Database => self.databases.keys().map(String::as_str).collect(),
            ResourceKind::Cache => self.caches.keys().map(String::as_str).collect(),
            ResourceKind::ObjectStorage => {
                self.object_storages.keys().map(String::as_str).collect()
            }
        };
        names.sort_unstable();
        names
    }

    /// Number of registered resources across all families.
    pub fn len(&self) -> usize {
        self.databases.len() + self.caches.len() + self.object_storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- Shutdown -------------------------------------------------------------

    /// Close every registered resource exactly once.
    ///
    /// Object storages close first, then databases, then caches; within a
    /// family all closes run concurrently.  A failing close does not stop
    /// the rest, and every failure is returned.  Calling this again is a
    /// no-op for handles that were already closed.
    pub async fn close_all(&self) -> Result<(), CloseAllError> {
        let mut failures = Vec::new();

        for kind in [
            ResourceKind::ObjectStorage,
            ResourceKind::Database,
            ResourceKind::Cache,
        ] {
            let mut closing: Vec<(String, JoinHandle<Result<(), ResourceError>>)> = Vec::new();
            for name in self.names(kind) {
                if let Ok(resource) = self.get(kind, name) {
                    closing.push((
                        name.to_string(),
                        tokio::spawn(async move { resource.close().await }),
                    ));
                }
            }

            for (name, handle) in closing {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(ResourceError::Aborted(e.to_string())),
                };
                match outcome {
                    Ok(()) => {
                        counter!(CLOSED_TOTAL, "family" => kind.as_str()).increment(1);
                    }
                    Err(error) => {
                        counter!(CLOSE_FAILURES_TOTAL, "family" => kind.as_str()).increment(1);
                        error!("{} {} failed to close: {}", kind, name, error);
                        failures.push(ResourceFailure { kind, name, error });
                    }
                }
            }
        }

        if failures.is_empty() {
            info!("closed {} resource(s)", self.len());
            Ok(())
        } else {
            Err(CloseAllError { failures })
        }
    }
}

fn lookup<T>(
    map: &HashMap<String, Arc<T>>,
    kind: ResourceKind,
    name: &str,
) -> Result<Arc<T>, LookupError> {
    map.get(name).cloned().ok_or_else(|| LookupError {
        kind,
        name: name.to_string(),
    })
}

#[track_caller]
fn must<T>(found: Result<T, LookupError>) -> T {
    match found {
        Ok(handle) => handle,
        Err(e) => {
            error!("{}", e);
            panic!("{e}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConnConfig, ConnConfig, ObjectStorageConfig, SqlDbConfig};
    use crate::database::driver::SqlDriver;
    use crate::database::{ConnectOptions, SqlPool};
    use crate::errors::Stage;
    use crate::testing::{FakeCacheConnector, FakeDriver, FakeProvider};
    use std::future::Future;
    use std::pin::Pin;
    use std::time::{Duration, Instant};

    fn db(name: &str, replica: Option<&str>) -> SqlDbConfig {
        SqlDbConfig {
            name: name.to_string(),
            driver: "fake".to_string(),
            leader: ConnConfig {
                dsn: format!("{name}-leader"),
                max_retry: Some(0),
                ..Default::default()
            },
            replica: replica.map(|dsn| ConnConfig {
                dsn: dsn.to_string(),
                max_retry: Some(0),
                ..Default::default()
            }),
        }
    }

    fn cache(name: &str) -> CacheConnConfig {
        CacheConnConfig {
            name: name.to_string(),
            address: format!("{name}:6379"),
        }
    }

    fn store(name: &str, provider: &str) -> ObjectStorageConfig {
        ObjectStorageConfig {
            name: name.to_string(),
            provider: provider.to_string(),
            bucket: name.to_string(),
            ..Default::default()
        }
    }

    struct Fakes {
        driver: FakeDriver,
        cache: FakeCacheConnector,
        provider: FakeProvider,
    }

    impl Fakes {
        fn new() -> Self {
            Self {
                driver: FakeDriver::default(),
                cache: FakeCacheConnector::default(),
                provider: FakeProvider::default(),
            }
        }

        fn connectors(&self) -> Connectors {
            Connectors::default()
                .with_driver("fake", self.driver.clone())
                .with_cache(self.cache.clone())
                .with_provider("fake", self.provider.clone())
        }
    }

    fn config(dbs: Vec<SqlDbConfig>, rds: Vec<CacheConnConfig>, stores: Vec<ObjectStorageConfig>) -> Config {
        let mut config = Config::default();
        config.database.dbs = dbs;
        config.redis.rds = rds;
        config.object_storage = stores;
        config
    }

    #[tokio::test]
    async fn test_all_valid_registers_every_resource() {
        let fakes = Fakes::new();
        let cfg = config(
            vec![db("orders", None), db("audit", Some("audit-replica"))],
            vec![cache("sessions")],
            vec![store("avatars", "fake"), store("exports", "FAKE")],
        );

        let hub = ResourceHub::with_connectors(cfg, fakes.connectors())
            .await
            .unwrap();

        assert_eq!(hub.len(), 5);
        assert_eq!(hub.names(ResourceKind::Database), vec!["audit", "orders"]);
        assert_eq!(hub.names(ResourceKind::Cache), vec!["sessions"]);
        assert_eq!(
            hub.names(ResourceKind::ObjectStorage),
            vec!["avatars", "exports"]
        );
        assert_eq!(fakes.driver.opens(), 3);
        assert_eq!(fakes.cache.connects(), 1);
        assert_eq!(fakes.provider.connects(), 2);
    }

    #[tokio::test]
    async fn test_follower_is_leader_without_replica() {
        let fakes = Fakes::new();
        let cfg = config(vec![db("orders", None)], vec![], vec![]);
        let hub = ResourceHub::with_connectors(cfg, fakes.connectors())
            .await
            .unwrap();

        let orders = hub.must_get_database("orders");
        assert!(Arc::ptr_eq(orders.leader(), orders.follower()));
        assert!(!orders.has_replica());
    }

    #[tokio::test]
    async fn test_unknown_provider_is_partial() {
        let fakes = Fakes::new();
        let cfg = config(
            vec![db("orders", None)],
            vec![cache("sessions")],
            vec![
                store("avatars", "fake"),
                store("legacy", "ftp"),
                store("exports", "fake"),
            ],
        );

        let err = ResourceHub::with_connectors(cfg, fakes.connectors())
            .await
            .unwrap_err();
        assert_eq!(err.failures().len(), 1);

        let partial = err.into_partial().unwrap();
        let failure = &partial.failures[0];
        assert_eq!(failure.kind, ResourceKind::ObjectStorage);
        assert_eq!(failure.name, "legacy");
        assert!(matches!(failure.error, ResourceError::ProviderNotFound(ref p) if p == "ftp"));

        let hub = partial.hub;
        assert_eq!(hub.names(ResourceKind::ObjectStorage), vec!["avatars", "exports"]);
        assert!(hub.get_database("orders").is_ok());
        assert!(hub.get_cache("sessions").is_ok());
        assert!(hub.get_object_storage("legacy").is_err());
    }

    #[tokio::test]
    async fn test_every_failure_is_reported() {
        let fakes = Fakes {
            driver: FakeDriver::default().failing_on("orders-leader"),
            cache: FakeCacheConnector::default().failing_on("sessions:6379"),
            provider: FakeProvider::failing_at(Stage::Credentials),
        };
        let cfg = config(
            vec![db("orders", None), db("audit", None)],
            vec![cache("sessions"), cache("rate")],
            vec![store("avatars", "fake"), store("scratch", "nope")],
        );

        let err = ResourceHub::with_connectors(cfg, fakes.connectors())
            .await
            .unwrap_err();
        let failed: Vec<(ResourceKind, &str)> = err
            .failures()
            .iter()
            .map(|f| (f.kind, f.name.as_str()))
            .collect();
        assert_eq!(
            failed,
            vec![
                (ResourceKind::Database, "orders"),
                (ResourceKind::Cache, "sessions"),
                (ResourceKind::ObjectStorage, "avatars"),
                (ResourceKind::ObjectStorage, "scratch"),
            ]
        );

        let message = err.to_string();
        assert!(message.starts_with("4 resource(s) failed to come up"));
        assert!(message.contains("connecting leader failed"));
        assert!(message.contains("loading credentials failed"));

        let hub = err.into_partial().unwrap().hub;
        assert_eq!(hub.names(ResourceKind::Database), vec!["audit"]);
        assert_eq!(hub.names(ResourceKind::Cache), vec!["rate"]);
        assert!(hub.names(ResourceKind::ObjectStorage).is_empty());
    }

    #[tokio::test]
    async fn test_config_error_connects_nothing() {
        let fakes = Fakes::new();
        let mut bad = db("orders", None);
        bad.driver.clear();
        let cfg = config(vec![bad], vec![cache("sessions")], vec![]);

        let err = ResourceHub::with_connectors(cfg, fakes.connectors())
            .await
            .unwrap_err();
        assert!(matches!(err, BringUpError::Config(_)));
        assert!(err.into_partial().is_none());
        assert_eq!(fakes.cache.connects(), 0);
    }

    #[tokio::test]
    async fn test_get_unknown_name_is_lookup_error() {
        let hub = ResourceHub::default();
        let err = hub.get_cache("missing").unwrap_err();
        assert_eq!(
            err,
            LookupError {
                kind: ResourceKind::Cache,
                name: "missing".to_string()
            }
        );
        assert_eq!(err.to_string(), "cache with name `missing` does not exist");
        assert!(hub.get_database("missing").is_err());
        assert!(hub.get_object_storage("missing").is_err());
        assert!(hub.get(ResourceKind::Database, "missing").is_err());
        assert!(hub.is_empty());
    }

    #[test]
    #[should_panic(expected = "database with name `missing` does not exist")]
    fn test_must_get_database_panics() {
        ResourceHub::default().must_get_database("missing");
    }

    #[test]
    #[should_panic(expected = "cache with name `missing` does not exist")]
    fn test_must_get_cache_panics() {
        ResourceHub::default().must_get_cache("missing");
    }

    #[test]
    #[should_panic(expected = "object_storage with name `missing` does not exist")]
    fn test_must_get_object_storage_panics() {
        ResourceHub::default().must_get_object_storage("missing");
    }

    #[tokio::test]
    async fn test_generic_get() {
        let fakes = Fakes::new();
        let cfg = config(vec![], vec![cache("sessions")], vec![store("avatars", "fake")]);
        let hub = ResourceHub::with_connectors(cfg, fakes.connectors())
            .await
            .unwrap();

        let resource = hub.get(ResourceKind::ObjectStorage, "avatars").unwrap();
        assert_eq!(resource.kind(), ResourceKind::ObjectStorage);
        assert_eq!(resource.name(), "avatars");
        assert!(hub.get(ResourceKind::Database, "avatars").is_err());
    }

    #[tokio::test]
    async fn test_close_all_closes_each_handle_once() {
        let fakes = Fakes::new();
        let cfg = config(
            vec![db("orders", None), db("audit", None)],
            vec![cache("sessions")],
            vec![
                store("avatars", "fake"),
                store("exports", "fake"),
                store("scratch", "fake"),
            ],
        );
        let hub = ResourceHub::with_connectors(cfg, fakes.connectors())
            .await
            .unwrap();

        hub.close_all().await.unwrap();
        let total = fakes.driver.closes() + fakes.cache.closes() + fakes.provider.closes();
        assert_eq!(total, 6);

        hub.close_all().await.unwrap();
        let total = fakes.driver.closes() + fakes.cache.closes() + fakes.provider.closes();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn test_close_all_closes_replica_and_leader() {
        let fakes = Fakes::new();
        let cfg = config(vec![db("orders", Some("orders-replica"))], vec![], vec![]);
        let hub = ResourceHub::with_connectors(cfg, fakes.connectors())
            .await
            .unwrap();

        hub.close_all().await.unwrap();
        assert_eq!(fakes.driver.closes(), 2);
        assert!(hub.must_get_database("orders").is_closed());
    }

    #[tokio::test]
    async fn test_close_all_aggregates_failures_without_skipping() {
        let fakes = Fakes {
            driver: FakeDriver::default(),
            cache: FakeCacheConnector::default().failing_close(),
            provider: FakeProvider::default().failing_close(),
        };
        let cfg = config(
            vec![db("orders", None)],
            vec![cache("sessions"), cache("rate")],
            vec![store("avatars", "fake")],
        );
        let hub = ResourceHub::with_connectors(cfg, fakes.connectors())
            .await
            .unwrap();

        let err = hub.close_all().await.unwrap_err();
        let failed: Vec<(ResourceKind, &str)> = err
            .failures
            .iter()
            .map(|f| (f.kind, f.name.as_str()))
            .collect();
        assert_eq!(
            failed,
            vec![
                (ResourceKind::ObjectStorage, "avatars"),
                (ResourceKind::Cache, "rate"),
                (ResourceKind::Cache, "sessions"),
            ]
        );
        assert!(err.to_string().starts_with("3 resource(s) failed to close"));
        assert_eq!(fakes.driver.closes(), 1);
        assert_eq!(fakes.cache.closes(), 2);
        assert_eq!(fakes.provider.closes(), 1);
    }

    #[tokio::test]
    async fn test_many_resources_come_up_concurrently() {
        let fakes = Fakes {
            driver: FakeDriver::default(),
            cache: FakeCacheConnector::default(),
            provider: FakeProvider::default().with_delay(Duration::from_millis(100)),
        };
        let dbs = (0..20).map(|i| db(&format!("db-{i}"), None)).collect();
        let rds = (0..20).map(|i| cache(&format!("cache-{i}"))).collect();
        let stores = (0..20)
            .map(|i| store(&format!("store-{i}"), "fake"))
            .collect();

        let started = Instant::now();
        let hub = ResourceHub::with_connectors(config(dbs, rds, stores), fakes.connectors())
            .await
            .unwrap();

        assert_eq!(hub.len(), 60);
        for i in 0..20 {
            hub.must_get_database(&format!("db-{i}"));
            hub.must_get_cache(&format!("cache-{i}"));
            hub.must_get_object_storage(&format!("store-{i}"));
        }
        // Sequential connects would take 20 x 100ms.
        assert!(started.elapsed() < Duration::from_millis(1500));

        hub.close_all().await.unwrap();
        assert_eq!(
            fakes.driver.closes() + fakes.cache.closes() + fakes.provider.closes(),
            60
        );
    }

    /// Driver whose open panics.
    struct PanickingDriver;

    impl SqlDriver for PanickingDriver {
        fn open(
            &self,
            _options: ConnectOptions,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn SqlPool>>> + Send + '_>> {
            Box::pin(async { panic!("driver bug") })
        }
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_failure() {
        let fakes = Fakes::new();
        let mut panicking = db("broken", None);
        panicking.driver = "panics".to_string();
        let cfg = config(vec![panicking, db("orders", None)], vec![], vec![]);

        let err = ResourceHub::with_connectors(
            cfg,
            fakes.connectors().with_driver("panics", PanickingDriver),
        )
        .await
        .unwrap_err();

        let failure = &err.failures()[0];
        assert_eq!(failure.name, "broken");
        assert!(matches!(failure.error, ResourceError::Aborted(_)));
        assert!(err
            .into_partial()
            .unwrap()
            .hub
            .get_database("orders")
            .is_ok());
    }

    #[tokio::test]
    async fn test_real_sqlite_and_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.database.dbs = vec![SqlDbConfig {
            name: "app".to_string(),
            driver: "sqlite".to_string(),
            leader: ConnConfig {
                dsn: dir.path().join("app.db").to_string_lossy().into_owned(),
                ..Default::default()
            },
            replica: None,
        }];
        let mut files = store("files", "Local");
        files.local.root_dir = dir.path().to_string_lossy().into_owned();
        files.bucket_url = "files.example.com".to_string();
        cfg.object_storage = vec![files];

        let hub = ResourceHub::new(cfg).await.unwrap();

        let app = hub.must_get_database("app");
        app.leader().ping().await.unwrap();
        assert_eq!(app.driver(), "sqlite");

        let files = hub.must_get_object_storage("files");
        assert_eq!(files.provider(), "local");
        files
            .store()
            .put("hello.txt", bytes::Bytes::from("hi"))
            .await
            .unwrap();
        assert_eq!(
            files.public_url("hello.txt").as_deref(),
            Some("https://files.example.com/hello.txt")
        );

        hub.close_all().await.unwrap();
        assert!(files.store().get("hello.txt").await.is_err());
        assert!(dir.path().join("files").join("hello.txt").exists());
    }
}
