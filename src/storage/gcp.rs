//! Google Cloud Storage object store (`gcs` provider).
//!
//! Talks to the GCS JSON API using `reqwest`.  Credentials come from a
//! service account JSON key file named by `gcs.json_key`; access tokens
//! are obtained with the OAuth2 JWT-bearer flow and cached until shortly
//! before they expire.

use bytes::Bytes;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::backend::{compute_etag, CloseFlag, ObjectStore, StoredObject};
use super::provider::StorageProvider;
use crate::config::ObjectStorageConfig;

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com";

/// GCS upload base URL (for media uploads).
const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for each signed assertion.
const ASSERTION_TTL_SECS: u64 = 3600;

// -- GCS JSON API response types -----------------------------------------------

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    code: Option<u16>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

// -- Credentials ---------------------------------------------------------------

/// Fields read from a service account key file.
#[derive(Deserialize)]
struct ServiceAccountKey {
    #[serde(rename = "type")]
    key_type: String,
    client_email: Option<String>,
    private_key: Option<String>,
    token_uri: Option<String>,
    #[serde(default)]
    project_id: String,
}

/// Parsed service account credentials, ready for signing.
#[derive(Clone)]
pub struct GcsCredentials {
    pub client_email: String,
    pub project_id: String,
    pub token_uri: String,
    signing_key: EncodingKey,
}

impl std::fmt::Debug for GcsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsCredentials")
            .field("client_email", &self.client_email)
            .field("project_id", &self.project_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl GcsCredentials {
    /// Parse a service account key from its JSON text.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("Failed to parse service account key: {e}"))?;

        if key.key_type != "service_account" {
            anyhow::bail!(
                "Unsupported credential type `{}`, expected service_account",
                key.key_type
            );
        }

        let client_email = key
            .client_email
            .ok_or_else(|| anyhow::anyhow!("Missing client_email in service account key"))?;
        let private_key = key
            .private_key
            .ok_or_else(|| anyhow::anyhow!("Missing private_key in service account key"))?;
        let signing_key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid private_key in service account key: {e}"))?;

        Ok(Self {
            client_email,
            project_id: key.project_id,
            token_uri: key
                .token_uri
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            signing_key,
        })
    }

    /// Read and parse the key file at `path`.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read service account key {path}: {e}"))?;
        Self::from_json(&contents)
    }

    /// Sign a JWT-bearer assertion valid from `now` (seconds since epoch).
    fn sign_assertion(&self, now: u64) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: u64,
            exp: u64,
        }

        let claims = Claims {
            iss: &self.client_email,
            scope: STORAGE_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_TTL_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| anyhow::anyhow!("Failed to sign token assertion: {e}"))
    }
}

/// Resolved client settings.
#[derive(Debug, Clone)]
pub struct GcsSettings {
    pub credentials: GcsCredentials,
    pub bucket: String,
}

// -- Token management ---------------------------------------------------------

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

/// Object store backed by one GCS bucket.
pub struct GcsStore {
    /// HTTP client for GCS JSON API calls.
    client: reqwest::Client,
    bucket: String,
    credentials: GcsCredentials,
    /// Cached OAuth2 access token.
    token_cache: Mutex<Option<CachedToken>>,
    closed: CloseFlag,
}

impl GcsStore {
    /// Create the HTTP client.  Tokens are fetched lazily on the first call.
    pub fn new(settings: GcsSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        info!(
            "GCS object store initialized: bucket={} project={} account={}",
            settings.bucket, settings.credentials.project_id, settings.credentials.client_email
        );

        Ok(Self {
            client,
            bucket: settings.bucket,
            credentials: settings.credentials,
            token_cache: Mutex::new(None),
            closed: CloseFlag::default(),
        })
    }

    /// Return a cached token if it hasn't expired, otherwise exchange a new
    /// assertion (60s safety margin).
    async fn get_access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self
                .token_cache
                .lock()
                .map_err(|_| anyhow::anyhow!("token cache mutex poisoned"))?;
            if let Some(ref cached) = *cache {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.exchange_jwt_for_token().await?;
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));

        {
            let mut cache = self
                .token_cache
                .lock()
                .map_err(|_| anyhow::anyhow!("token cache mutex poisoned"))?;
            *cache = Some(CachedToken {
                access_token: token.clone(),
                expiry,
            });
        }

        Ok(token)
    }

    /// Exchange a signed JWT assertion for an access token.
    async fn exchange_jwt_for_token(&self) -> anyhow::Result<(String, u64)> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let assertion = self.credentials.sign_assertion(now)?;

        debug!("requesting GCS access token from {}", self.credentials.token_uri);

        let resp = self
            .client
            .post(&self.credentials.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Token exchange failed ({status}): {body}"));
        }

        let token: TokenResponse = resp.json().await?;
        Ok((token.access_token, token.expires_in))
    }

    /// Build authorization headers for GCS API calls.
    async fn auth_headers(&self) -> anyhow::Result<HeaderMap> {
        let token = self.get_access_token().await?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| anyhow::anyhow!("Invalid auth header value: {e}"))?,
        );
        Ok(headers)
    }

    /// URL-encode a GCS object name for use in API paths.
    fn url_encode_object_name(name: &str) -> String {
        percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string()
    }

    fn object_url(&self, object_name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            GCS_API_BASE,
            Self::url_encode_object_name(&self.bucket),
            Self::url_encode_object_name(object_name)
        )
    }

    /// Map a GCS HTTP error to an anyhow error with context.
    fn map_gcs_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        if let Ok(err_resp) = serde_json::from_str::<GcsErrorResponse>(body) {
            if let Some(err) = err_resp.error {
                return anyhow::anyhow!(
                    "GCS {}: {} (code {})",
                    context,
                    err.message.unwrap_or_default(),
                    err.code.unwrap_or(status.as_u16())
                );
            }
        }
        anyhow::anyhow!("GCS {context}: HTTP {status} - {body}")
    }

    // -- GCS API operations ---------------------------------------------------

    async fn gcs_upload(&self, object_name: &str, data: Bytes) -> anyhow::Result<()> {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/b/{}/o?uploadType=media&name={}",
            GCS_UPLOAD_BASE,
            Self::url_encode_object_name(&self.bucket),
            Self::url_encode_object_name(object_name)
        );

        let resp = self
            .client
            .post(&url)
            .headers(auth)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS upload request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("upload", status, &body));
        }
        Ok(())
    }

    async fn gcs_download(&self, object_name: &str) -> anyhow::Result<Bytes> {
        let auth = self.auth_headers().await?;
        let url = format!("{}?alt=media", self.object_url(object_name));

        let resp = self
            .client
            .get(&url)
            .headers(auth)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS download request failed: {e}"))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            anyhow::bail!("Object not found at key: {object_name}");
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("download", status, &body));
        }

        resp.bytes()
            .await
            .map_err(|e| anyhow::anyhow!("GCS download body read failed: {e}"))
    }

    /// Idempotent; a 404 counts as success.
    async fn gcs_delete(&self, object_name: &str) -> anyhow::Result<()> {
        let auth = self.auth_headers().await?;
        let resp = self
            .client
            .delete(self.object_url(object_name))
            .headers(auth)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS delete request failed: {e}"))?;

        let status = resp.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("delete", status, &body));
        }
        Ok(())
    }

    async fn gcs_exists(&self, object_name: &str) -> anyhow::Result<bool> {
        let auth = self.auth_headers().await?;
        let resp = self
            .client
            .get(self.object_url(object_name))
            .headers(auth)
            .query(&[("fields", "name")])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS exists check failed: {e}"))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(Self::map_gcs_error("exists", status, &body))
            }
        }
    }
}

impl ObjectStore for GcsStore {
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;
            let etag = compute_etag(&data);
            self.gcs_upload(&key, data).await?;
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
            let data = self.gcs_download(&key).await?;
            Ok(StoredObject::new(data))
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;
            self.gcs_delete(&key).await
        })
    }

    fn exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.closed.ensure_open()?;
            self.gcs_exists(&key).await
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.close() {
                if let Ok(mut cache) = self.token_cache.lock() {
                    cache.take();
                }
                debug!("GCS object store for bucket {} closed", self.bucket);
            }
            Ok(())
        })
    }
}

/// `gcs` provider strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcsProvider;

impl StorageProvider for GcsProvider {
    type Credentials = GcsCredentials;
    type Settings = GcsSettings;

    fn load_credentials(&self, config: &ObjectStorageConfig) -> anyhow::Result<GcsCredentials> {
        if config.gcs.json_key.trim().is_empty() {
            anyhow::bail!("gcs storage requires gcs.json_key");
        }
        GcsCredentials::from_file(&config.gcs.json_key)
    }

    fn build_settings(
        &self,
        credentials: GcsCredentials,
        config: &ObjectStorageConfig,
    ) -> anyhow::Result<GcsSettings> {
        if config.bucket.trim().is_empty() {
            anyhow::bail!("gcs storage requires a bucket");
        }
        Ok(GcsSettings {
            credentials,
            bucket: config.bucket.clone(),
        })
    }

    async fn connect(&self, settings: GcsSettings) -> anyhow::Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(GcsStore::new(settings)?))
    }
}
