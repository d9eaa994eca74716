//! Concurrent bring-up of every configured resource.
//!
//! One tokio task is spawned per resource.  Tasks share nothing mutable:
//! each returns its outcome through its `JoinHandle`, and the caller
//! awaits every handle in configuration order, so the collector alone
//! builds the registry maps.  A failed resource never stops the others.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::cache::redis::RedisConnector;
use crate::cache::{CacheConnector, CacheHandle, CacheOptions};
use crate::config::Config;
use crate::database::driver::{DriverRegistry, SqlDriver};
use crate::errors::{ResourceError, ResourceFailure, ResourceKind, Stage};
use crate::hub::{Resource, ResourceHub};
use crate::metrics::{BRINGUP_DURATION_SECONDS, BRINGUP_FAILURES_TOTAL, BRINGUP_SUCCESS_TOTAL};
use crate::storage::provider::{ProviderRegistry, StorageProvider};
use crate::storage::ObjectStorageHandle;

/// The strategies used to connect each family.
#[derive(Clone)]
pub struct Connectors {
    pub drivers: DriverRegistry,
    pub cache: Arc<dyn CacheConnector>,
    pub providers: ProviderRegistry,
}

impl Default for Connectors {
    /// Built-in drivers, redis, and the five built-in storage providers.
    fn default() -> Self {
        Self {
            drivers: DriverRegistry::with_defaults(),
            cache: Arc::new(RedisConnector),
            providers: ProviderRegistry::with_defaults(),
        }
    }
}

impl Connectors {
    pub fn with_driver<D: SqlDriver>(mut self, id: &str, driver: D) -> Self {
        self.drivers.register(id, driver);
        self
    }

    pub fn with_cache<C: CacheConnector>(mut self, connector: C) -> Self {
        self.cache = Arc::new(connector);
        self
    }

    pub fn with_provider<P: StorageProvider>(mut self, id: &str, provider: P) -> Self {
        self.providers.register(id, provider);
        self
    }
}

type Pending = (
    ResourceKind,
    String,
    JoinHandle<Result<Resource, ResourceError>>,
);

/// Spawn `task` inside a `bringup` span and time it.
fn spawn_tracked<F>(kind: ResourceKind, name: String, task: F) -> Pending
where
    F: Future<Output = Result<Resource, ResourceError>> + Send + 'static,
{
    let span = info_span!("bringup", family = kind.as_str(), name = %name);
    let handle = tokio::spawn(
        async move {
            let started = Instant::now();
            let outcome = task.await;
            histogram!(BRINGUP_DURATION_SECONDS, "family" => kind.as_str())
                .record(started.elapsed().as_secs_f64());
            outcome
        }
        .instrument(span),
    );
    (kind, name, handle)
}

/// Connect every resource in `config`, which must already be defaulted.
///
/// Returns the registry of resources that came up together with one
/// tagged failure per resource that did not, in configuration order.
pub(crate) async fn bring_up(
    config: Config,
    connectors: Connectors,
) -> (ResourceHub, Vec<ResourceFailure>) {
    let connectors = Arc::new(connectors);
    let mut pending: Vec<Pending> = Vec::with_capacity(config.resource_count());

    info!(
        "bringing up {} database(s), {} cache(s), {} object storage(s)",
        config.database.dbs.len(),
        config.redis.rds.len(),
        config.object_storage.len()
    );

    for db in config.database.dbs {
        let connectors = Arc::clone(&connectors);
        let name = db.name.clone();
        pending.push(spawn_tracked(ResourceKind::Database, name, async move {
            let handle = connectors.drivers.connect(&db).await?;
            Ok(Resource::Database(Arc::new(handle)))
        }));
    }

    for rd in &config.redis.rds {
        let connectors = Arc::clone(&connectors);
        let options = CacheOptions::new(&config.redis, rd);
        let name = rd.name.clone();
        let task_name = name.clone();
        pending.push(spawn_tracked(ResourceKind::Cache, name, async move {
            let address = options.address.clone();
            let pool = connectors
                .cache
                .connect(options)
                .await
                .map_err(|e| ResourceError::connect(Stage::Connect, e))?;
            Ok(Resource::Cache(Arc::new(CacheHandle::new(
                task_name, address, pool,
            ))))
        }));
    }

    for os in config.object_storage {
        let connectors = Arc::clone(&connectors);
        let name = os.name.clone();
        pending.push(spawn_tracked(ResourceKind::ObjectStorage, name, async move {
            let store = connectors.providers.open(&os).await?;
            Ok(Resource::ObjectStorage(Arc::new(ObjectStorageHandle::new(
                &os, store,
            ))))
        }));
    }

    let mut hub = ResourceHub::default();
    let mut failures = Vec::new();

    for (kind, name, handle) in pending {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ResourceError::Aborted(e.to_string())),
        };
        match outcome {
            Ok(resource) => {
                counter!(BRINGUP_SUCCESS_TOTAL, "family" => kind.as_str()).increment(1);
                info!("{} {} is ready", kind, name);
                hub.insert(name, resource);
            }
            Err(error) => {
                counter!(BRINGUP_FAILURES_TOTAL, "family" => kind.as_str()).increment(1);
                error!("{} {} failed to come up: {}", kind, name, error);
                failures.push(ResourceFailure { kind, name, error });
            }
        }
    }

    info!(
        "bring-up finished: {} ready, {} failed",
        hub.len(),
        failures.len()
    );
    (hub, failures)
}
