//! In-process fakes for every resource family.
//!
//! Each fake counts opens and closes through shared atomics so tests can
//! assert exactly-once behavior after handles have been moved into a hub.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::cache::{CacheConnector, CacheOptions, CachePool};
use crate::config::ObjectStorageConfig;
use crate::database::driver::SqlDriver;
use crate::database::{ConnectOptions, SqlPool};
use crate::errors::Stage;
use crate::storage::backend::{compute_etag, ObjectStore, StoredObject};
use crate::storage::provider::StorageProvider;

// -- Object storage -----------------------------------------------------------

/// In-memory object store.
#[derive(Clone, Default)]
pub struct FakeStore {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    closes: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    fail_close: bool,
}

impl FakeStore {
    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    fn sharing(closes: Arc<AtomicUsize>, fail_close: bool) -> Self {
        Self {
            closes,
            fail_close,
            ..Self::default()
        }
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("fake store is closed");
        }
        Ok(())
    }
}

impl ObjectStore for FakeStore {
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let etag = compute_etag(&data);
            self.objects.lock().unwrap().insert(key, data);
            Ok(etag)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredObject>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let data = self.objects.lock().unwrap().get(&key).cloned();
            data.map(StoredObject::new)
                .ok_or_else(|| anyhow::anyhow!("Object not found at key: {key}"))
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            self.objects.lock().unwrap().remove(&key);
            Ok(())
        })
    }

    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            Ok(self.objects.lock().unwrap().contains_key(&key))
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                anyhow::bail!("fake store refused to close");
            }
            Ok(())
        })
    }
}

/// Provider producing [`FakeStore`]s, optionally failing at one stage.
#[derive(Clone, Default)]
pub struct FakeProvider {
    fail_at: Option<Stage>,
    fail_close: bool,
    delay: Duration,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn failing_at(stage: Stage) -> Self {
        Self {
            fail_at: Some(stage),
            ..Self::default()
        }
    }

    /// Stores whose close always fails (after counting).
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Sleep this long in the connect stage.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Close calls across every store this provider produced.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl StorageProvider for FakeProvider {
    type Credentials = ();
    type Settings = ();

    fn load_credentials(&self, _config: &ObjectStorageConfig) -> anyhow::Result<()> {
        if self.fail_at == Some(Stage::Credentials) {
            anyhow::bail!("no credentials");
        }
        Ok(())
    }

    fn build_settings(&self, _credentials: (), _config: &ObjectStorageConfig) -> anyhow::Result<()> {
        if self.fail_at == Some(Stage::Settings) {
            anyhow::bail!("bad settings");
        }
        Ok(())
    }

    async fn connect(&self, _settings: ()) -> anyhow::Result<Arc<dyn ObjectStore>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_at == Some(Stage::Connect) {
            anyhow::bail!("connection refused");
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeStore::sharing(
            self.closes.clone(),
            self.fail_close,
        )))
    }
}

// -- Databases ----------------------------------------------------------------

/// Pool produced by [`FakeDriver`].
pub struct FakePool {
    dsn: String,
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
    fail_close: bool,
}

impl FakePool {
    pub fn dsn(&self) -> &str {
        &self.dsn
    }
}

impl SqlPool for FakePool {
    fn driver(&self) -> &str {
        "fake"
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                anyhow::bail!("fake pool is closed");
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                anyhow::bail!("fake pool refused to close");
            }
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Driver producing [`FakePool`]s.
#[derive(Clone, Default)]
pub struct FakeDriver {
    fail_on: Option<String>,
    fail_close: bool,
    /// Opens that fail before the first success.
    flaky: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl FakeDriver {
    /// Fail every open whose DSN equals `dsn`.
    pub fn failing_on(mut self, dsn: &str) -> Self {
        self.fail_on = Some(dsn.to_string());
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Fail the first `failures` opens.
    pub fn flaky(self, failures: usize) -> Self {
        self.flaky.store(failures, Ordering::SeqCst);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl SqlDriver for FakeDriver {
    fn open(
        &self,
        options: ConnectOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn SqlPool>>> + Send + '_>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.as_deref() == Some(options.dsn.as_str()) {
                anyhow::bail!("cannot reach {}", options.dsn);
            }
            let remaining = self
                .flaky
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if remaining.is_ok() {
                anyhow::bail!("transient failure reaching {}", options.dsn);
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakePool {
                dsn: options.dsn,
                closes: self.closes.clone(),
                closed: AtomicBool::new(false),
                fail_close: self.fail_close,
            }) as Arc<dyn SqlPool>)
        })
    }
}

// -- Caches -------------------------------------------------------------------

/// Pool produced by [`FakeCacheConnector`].
pub struct FakeCachePool {
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
    fail_close: bool,
}

impl CachePool for FakeCachePool {
    fn ping(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                anyhow::bail!("fake cache is closed");
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                anyhow::bail!("fake cache refused to close");
            }
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Connector producing [`FakeCachePool`]s.
#[derive(Clone, Default)]
pub struct FakeCacheConnector {
    fail_on: Option<String>,
    fail_close: bool,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl FakeCacheConnector {
    /// Fail every connect whose address equals `address`.
    pub fn failing_on(mut self, address: &str) -> Self {
        self.fail_on = Some(address.to_string());
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl CacheConnector for FakeCacheConnector {
    fn connect(
        &self,
        options: CacheOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn CachePool>>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_on.as_deref() == Some(options.address.as_str()) {
                anyhow::bail!("cannot reach {}", options.address);
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeCachePool {
                closes: self.closes.clone(),
                closed: AtomicBool::new(false),
                fail_close: self.fail_close,
            }) as Arc<dyn CachePool>)
        })
    }
}
