//! Google Cloud Storage objects.
//!
//! Objects are read through the JSON API media download. A service account
//! key, when one is configured, is exchanged for a read-only access token;
//! otherwise the request is anonymous.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use importer_shared::constants::transfer::{IDLE_TIMEOUT_SECS, POLL_INTERVAL_MS};
use importer_shared::{ImportError, ImportResult};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::http::{HttpClient, TlsOptions, content_length, expect_ok, watch_idle};
use super::{Adapters, DataSource, StreamSource};
use crate::options::ImporterOptions;
use crate::phase::ProcessingPhase;

const API_HOST: &str = "https://storage.googleapis.com";
const BROWSER_HOST: &str = "storage.cloud.google.com";
const READ_ONLY_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_only";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Bucket and object named by a `gs://bucket/object` or
/// `https://storage.cloud.google.com/bucket/object` endpoint.
pub fn parse_gcs_endpoint(endpoint: &Url) -> ImportResult<(String, String)> {
    let (bucket, object) = match endpoint.scheme() {
        "gs" => (
            endpoint.host_str().unwrap_or_default().to_string(),
            endpoint.path().trim_start_matches('/').to_string(),
        ),
        "http" | "https" if endpoint.host_str() == Some(BROWSER_HOST) => {
            let path = endpoint.path().trim_start_matches('/');
            match path.split_once('/') {
                Some((bucket, object)) => (bucket.to_string(), object.to_string()),
                None => (path.to_string(), String::new()),
            }
        }
        _ => {
            return Err(ImportError::InvalidArgument(format!(
                "not a GCS endpoint: {}",
                endpoint
            )));
        }
    };
    if bucket.is_empty() || object.is_empty() {
        return Err(ImportError::InvalidArgument(format!(
            "GCS endpoint {} must name a bucket and an object",
            endpoint
        )));
    }
    Ok((bucket, object))
}

/// Media download URL of `bucket/object`.
fn media_url(bucket: &str, object: &str) -> ImportResult<Url> {
    let mut url = Url::parse(API_HOST)
        .map_err(|e| ImportError::Internal(format!("invalid GCS API host: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| ImportError::Internal("GCS API host cannot be a base".into()))?
        .extend(["storage", "v1", "b", bucket, "o", object]);
    url.query_pairs_mut().append_pair("alt", "media");
    Ok(url)
}

/// The parts of a service account key file this source uses.
#[derive(Debug, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl ServiceAccountKey {
    pub fn parse(json: &str) -> ImportResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| ImportError::Config(format!("invalid service account key: {}", e)))
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }

    /// Signed JWT asserting this account, valid for an hour.
    pub fn assertion(&self) -> ImportResult<String> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: READ_ONLY_SCOPE,
            aud: self.token_uri(),
            iat,
            exp: iat + 3600,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| ImportError::Config(format!("invalid service account private key: {}", e)))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| ImportError::Config(format!("unable to sign token request: {}", e)))
    }

    /// Exchange the assertion for an access token.
    fn access_token(&self, client: &HttpClient) -> ImportResult<String> {
        let assertion = self.assertion()?;
        let form = [("grant_type", JWT_GRANT), ("assertion", assertion.as_str())];
        let resp = client
            .block_on(client.inner().post(self.token_uri()).form(&form).send())
            .map_err(|e| ImportError::Network(format!("token request failed: {}", e)))?;
        let resp = expect_ok(resp)?;
        let token: TokenResponse = client
            .block_on(resp.json())
            .map_err(|e| ImportError::Network(format!("invalid token response: {}", e)))?;
        Ok(token.access_token)
    }
}

/// Service account key from the credentials file, else from the secret key.
fn service_account(options: &ImporterOptions) -> ImportResult<Option<ServiceAccountKey>> {
    if let Some(path) = &options.google_credentials {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ImportError::Config(format!("Failed to read credentials {}: {}", path.display(), e))
        })?;
        return ServiceAccountKey::parse(&json).map(Some);
    }
    if !options.secret_key.is_empty() {
        return ServiceAccountKey::parse(&options.secret_key).map(Some);
    }
    Ok(None)
}

/// Image stored in a GCS bucket.
pub struct GcsSource {
    stream: StreamSource,
    token: CancellationToken,
    _client: HttpClient,
}

impl GcsSource {
    pub fn new(options: &ImporterOptions, adapters: &Adapters) -> ImportResult<Self> {
        let endpoint = Url::parse(&options.endpoint).map_err(|e| {
            ImportError::InvalidArgument(format!("unable to parse endpoint {:?}: {}", options.endpoint, e))
        })?;
        let (bucket, object) = parse_gcs_endpoint(&endpoint)?;
        let client = HttpClient::new(&TlsOptions::from_options(options))?;

        let mut headers = HeaderMap::new();
        match service_account(options)? {
            Some(key) => {
                tracing::info!("Using service account {}", key.client_email);
                let token = key.access_token(&client)?;
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| ImportError::Network(format!("invalid access token: {}", e)))?;
                headers.insert(AUTHORIZATION, value);
            }
            None => tracing::info!("No credentials given, reading object anonymously"),
        }

        let url = media_url(&bucket, &object)?;
        let resp = client
            .send(Method::GET, &url, None, &headers)
            .and_then(expect_ok)
            .map_err(|e| e.context(format!("unable to create reader for object {}/{}", bucket, object)))?;
        let total = content_length(resp.headers());

        let token = CancellationToken::new();
        let body = client.stream(resp, token.clone());
        let stream = StreamSource::new(Box::new(body), total, options.content_type)
            .with_progress(adapters.counter(&options.owner_uid))
            .with_preallocation(options.preallocation);
        client.spawn(watch_idle(
            stream.count(),
            Duration::from_secs(IDLE_TIMEOUT_SECS),
            Duration::from_millis(POLL_INTERVAL_MS),
            token.clone(),
        ));

        Ok(Self {
            stream,
            token,
            _client: client,
        })
    }
}

impl DataSource for GcsSource {
    fn info(&mut self) -> ImportResult<ProcessingPhase> {
        self.stream.info()
    }

    fn transfer(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        self.stream.transfer(path)
    }

    fn transfer_file(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        self.stream.transfer_file(path)
    }

    fn url(&self) -> Option<String> {
        self.stream.url()
    }

    fn close(&mut self) -> ImportResult<()> {
        let result = self.stream.close();
        self.token.cancel();
        result
    }
}
