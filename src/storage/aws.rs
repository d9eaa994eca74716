//! S3-compatible object store (`s3`, `do`, `minio` providers).
//!
//! All three providers speak the S3 API through `aws-sdk-s3`; they differ
//! only in how the endpoint, region and addressing style are derived:
//!
//!   s3:    region defaults to `us-east-1`, endpoint optional
//!   do:    region defaults to `nyc3`, endpoint defaults to
//!          `https://{region}.digitaloceanspaces.com`
//!   minio: endpoint required, path-style addressing forced
//!
//! Credentials are the static client id / secret from the configuration.

use aws_sdk_s3::Client;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

use super::backend::{compute_etag, CloseFlag, ObjectStore, StoredObject};
use super::provider::StorageProvider;
use crate::config::ObjectStorageConfig;

const DEFAULT_AWS_REGION: &str = "us-east-1";
const DEFAULT_DO_REGION: &str = "nyc3";

/// Which S3-compatible service a provider entry targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Flavor {
    Aws,
    DigitalOcean,
    Minio,
}

/// Static access key pair.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Fully resolved client settings.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub credentials: S3Credentials,
    pub bucket: String,
    pub region: String,
    /// Endpoint URL including scheme.  `None` uses the AWS default.
    pub endpoint: Option<String>,
    pub force_path_style: bool,
}

/// Object store backed by one S3 bucket.
pub struct S3Store {
    /// AWS S3 SDK client.
    client: Client,
    bucket: String,
    closed: CloseFlag,
}

impl S3Store {
    /// Build the S3 client for `settings`.
    ///
    /// No request is sent; the first operation surfaces network or
    /// permission problems.
    pub async fn new(settings: S3Settings) -> anyhow::Result<Self> {
        let creds = aws_sdk_s3::config::Credentials::new(
            settings.credentials.access_key_id,
            settings.credentials.secret_access_key,
            None, // session_token
            None, // expiry
            "resource-hub-config",
        );

        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .credentials_provider(creds);

        if let Some(ref endpoint) = settings.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.force_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "S3 object store initialized: bucket={} region={} endpoint={}",
            settings.bucket,
            settings.region,
            settings.endpoint.as_deref().unwrap_or("default")
        );

        Ok(Self {
            client,
            bucket: settings.bucket,
            closed: CloseFlag::default(),
        })
    }

    /// Map an AWS SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("S3 {context}: {err}")
    }
}

impl ObjectStore for S3Store {
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;

            // Computed locally; S3 returns a different ETag under SSE.
            let etag = compute_etag(&data);

            debug!("S3 put_object: bucket={} key={}", self.bucket, key);

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(aws_sdk_s3::primitives::ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;

            Ok(etag)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredObject>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;

            debug!("S3 get_object: bucket={} key={}", self.bucket, key);

            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        anyhow::anyhow!("Object not found at key: {key}")
                    } else {
                        Self::map_sdk_error("get_object", service_err)
                    }
                })?;

            let body_bytes = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();

            Ok(StoredObject::new(Bytes::from(body_bytes.to_vec())))
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;

            debug!("S3 delete_object: bucket={} key={}", self.bucket, key);

            // delete_object does not fail on missing keys.
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;

            Ok(())
        })
    }

    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;

            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(Self::map_sdk_error("head_object", service_err))
                    }
                }
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.close() {
                debug!("S3 object store for bucket {} closed", self.bucket);
            }
            Ok(())
        })
    }
}

/// `s3` / `do` / `minio` provider strategy.
#[derive(Debug, Clone, Copy)]
pub struct S3Provider {
    flavor: S3Flavor,
}

impl S3Provider {
    pub fn new(flavor: S3Flavor) -> Self {
        Self { flavor }
    }
}

/// Prefix `endpoint` with a scheme when it has none.
fn normalize_endpoint(endpoint: &str, disable_ssl: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if disable_ssl {
        format!("http://{endpoint}")
    } else {
        format!("https://{endpoint}")
    }
}

impl StorageProvider for S3Provider {
    type Credentials = S3Credentials;
    type Settings = S3Settings;

    fn load_credentials(&self, config: &ObjectStorageConfig) -> anyhow::Result<S3Credentials> {
        if config.s3.client_id.is_empty() || config.s3.client_secret.is_empty() {
            anyhow::bail!("s3 client_id and client_secret are required");
        }
        Ok(S3Credentials {
            access_key_id: config.s3.client_id.clone(),
            secret_access_key: config.s3.client_secret.clone(),
        })
    }

    fn build_settings(
        &self,
        credentials: S3Credentials,
        config: &ObjectStorageConfig,
    ) -> anyhow::Result<S3Settings> {
        if config.bucket.trim().is_empty() {
            anyhow::bail!("s3 storage requires a bucket");
        }

        let region = match (config.region.trim(), self.flavor) {
            ("", S3Flavor::DigitalOcean) => DEFAULT_DO_REGION.to_string(),
            ("", _) => DEFAULT_AWS_REGION.to_string(),
            (region, _) => region.to_string(),
        };

        let endpoint = match (config.endpoint.trim(), self.flavor) {
            ("", S3Flavor::Minio) => anyhow::bail!("minio storage requires an endpoint"),
            ("", S3Flavor::DigitalOcean) => {
                Some(format!("https://{region}.digitaloceanspaces.com"))
            }
            ("", S3Flavor::Aws) => None,
            (endpoint, _) => Some(normalize_endpoint(endpoint, config.s3.disable_ssl)),
        };

        let force_path_style = config.s3.force_path_style || self.flavor == S3Flavor::Minio;

        Ok(S3Settings {
            credentials,
            bucket: config.bucket.clone(),
            region,
            endpoint,
            force_path_style,
        })
    }

    async fn connect(&self, settings: S3Settings) -> anyhow::Result<Arc<dyn ObjectStore>> {
        let store = S3Store::new(settings).await?;
        Ok(Arc::new(store))
    }
}
