//! Blocking facade over the async HTTP client.
//!
//! Sources run on the phase loop's thread and read through `std::io::Read`,
//! while requests run on a small private runtime. Response bodies are pumped
//! through a bounded channel so an idle watchdog can cancel a stalled
//! transfer from the runtime side.

use std::future::Future;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use importer_shared::constants::http::USER_AGENT;
use importer_shared::{ImportError, ImportResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Certificate, Method, Response};
use serde::de::DeserializeOwned;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::options::ImporterOptions;
use crate::progress::ReadCount;
use crate::util::redact_url;

const MAX_REDIRECTS: usize = 10;

/// Chunks buffered between the network and the reader.
const BODY_CHANNEL_DEPTH: usize = 4;

/// Trust settings for outgoing connections.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// Directory of CA certificates for the origin
    pub cert_dir: Option<PathBuf>,
    /// Directory of proxy CA bundles
    pub proxy_cert_dir: Option<PathBuf>,
    pub insecure: bool,
}

impl TlsOptions {
    pub fn from_options(options: &ImporterOptions) -> Self {
        Self {
            cert_dir: options.cert_dir.clone(),
            proxy_cert_dir: options.proxy_cert_dir.clone(),
            insecure: options.insecure_tls,
        }
    }
}

/// Credentials sent with every request, including after redirects.
#[derive(Clone, Debug)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

impl BasicAuth {
    /// Auth from an access/secret key pair; both must be set.
    pub fn from_keys(access_key: &str, secret_key: &str) -> Option<Self> {
        if access_key.is_empty() || secret_key.is_empty() {
            return None;
        }
        Some(Self {
            user: access_key.to_string(),
            password: secret_key.to_string(),
        })
    }
}

/// HTTP client usable from synchronous code.
#[derive(Clone)]
pub struct HttpClient {
    runtime: Arc<Runtime>,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(tls: &TlsOptions) -> ImportResult<Self> {
        let runtime = build_runtime("importer-http")?;
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::none());
        for cert in root_certificates(tls)? {
            builder = builder.add_root_certificate(cert);
        }
        if tls.insecure {
            tracing::warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| ImportError::Config(format!("Error creating http client: {}", e)))?;
        Ok(Self { runtime, client })
    }

    /// Run `future` to completion on the client's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request, following redirects and replaying `auth` and
    /// `headers` on every hop.
    pub fn send(
        &self,
        method: Method,
        url: &Url,
        auth: Option<&BasicAuth>,
        headers: &HeaderMap,
    ) -> ImportResult<Response> {
        self.block_on(send_following(&self.client, method, url.clone(), auth, headers))
    }

    /// GET `url` and decode a JSON body. Any status but 200 fails.
    pub fn get_json<T: DeserializeOwned>(&self, url: &Url) -> ImportResult<T> {
        let resp = self.send(Method::GET, url, None, &HeaderMap::new())?;
        let resp = expect_ok(resp)?;
        self.block_on(resp.json::<T>())
            .map_err(|e| ImportError::Network(format!("failed to decode {}: {}", redact_url(url.as_str()), e)))
    }

    /// Turn `resp` into a blocking reader. Cancelling `token` aborts the
    /// transfer; so does dropping the reader.
    pub fn stream(&self, resp: Response, token: CancellationToken) -> BodyReader {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        self.runtime.spawn(pump_body(resp, tx, token.clone()));
        BodyReader {
            rx,
            current: Bytes::new(),
            token,
            _runtime: Arc::clone(&self.runtime),
        }
    }
}

/// Single-worker runtime for a blocking facade.
pub(crate) fn build_runtime(name: &str) -> ImportResult<Arc<Runtime>> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(name)
        .enable_all()
        .build()
        .map(Arc::new)
        .map_err(|e| ImportError::Internal(format!("Failed to start {} runtime: {}", name, e)))
}

/// Roots to trust on top of the system store: proxy bundles first, then the
/// origin's certificates.
fn root_certificates(tls: &TlsOptions) -> ImportResult<Vec<Certificate>> {
    let mut certs = Vec::new();
    if let Some(dir) = &tls.proxy_cert_dir {
        for path in visible_files(dir).unwrap_or_default() {
            if let Ok(pem) = std::fs::read(&path) {
                certs.extend(Certificate::from_pem_bundle(&pem).unwrap_or_default());
            }
        }
    }

    if let Some(dir) = &tls.cert_dir {
        let files = visible_files(dir).map_err(|e| {
            ImportError::Config(format!("Error listing files in {}: {}", dir.display(), e))
        })?;
        for path in files {
            tracing::info!("Attempting to get certs from {}", path.display());
            let pem = std::fs::read(&path).map_err(|e| {
                ImportError::Storage(format!("Error reading file {}: {}", path.display(), e))
            })?;
            match Certificate::from_pem_bundle(&pem) {
                Ok(found) if !found.is_empty() => certs.extend(found),
                _ => tracing::warn!("No certs in {}", path.display()),
            }
        }
    }
    Ok(certs)
}

/// Regular files of `dir` whose names do not start with a dot, sorted.
pub(crate) fn visible_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn send_following(
    client: &reqwest::Client,
    method: Method,
    mut url: Url,
    auth: Option<&BasicAuth>,
    headers: &HeaderMap,
) -> ImportResult<Response> {
    for _ in 0..=MAX_REDIRECTS {
        tracing::debug!("Attempting to {} {}", method, redact_url(url.as_str()));
        let mut req = client.request(method.clone(), url.clone()).headers(headers.clone());
        if let Some(auth) = auth {
            req = req.basic_auth(&auth.user, Some(&auth.password));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ImportError::Network(format!("HTTP request errored: {}", e)))?;
        if !resp.status().is_redirection() {
            return Ok(resp);
        }
        let Some(location) = resp.headers().get(LOCATION).and_then(|v| v.to_str().ok()) else {
            return Ok(resp);
        };
        url = url
            .join(location)
            .map_err(|e| ImportError::Network(format!("invalid redirect to {}: {}", location, e)))?;
    }
    Err(ImportError::Network(format!(
        "stopped after {} redirects",
        MAX_REDIRECTS
    )))
}

/// Fail with [`ImportError::UnexpectedStatus`] unless `resp` is a 200.
pub fn expect_ok(resp: Response) -> ImportResult<Response> {
    if resp.status() != reqwest::StatusCode::OK {
        tracing::error!("http: expected status code 200, got {}", resp.status().as_u16());
        return Err(ImportError::UnexpectedStatus {
            status: resp.status().as_u16(),
            url: redact_url(resp.url().as_str()),
        });
    }
    Ok(resp)
}

/// Content-Length of `headers`, 0 when absent or unparsable.
pub fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.trim().parse::<u64>().unwrap_or_else(|e| {
                tracing::error!("could not convert content length, got {}", e);
                0
            })
        })
        .unwrap_or(0)
}

/// Header map from `Name: value` lines. Malformed lines are skipped.
pub fn header_map<S: AsRef<str>>(lines: &[S]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.as_ref().split_once(':') else {
            continue;
        };
        let parsed = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        );
        match parsed {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::warn!("Ignoring malformed extra header"),
        }
    }
    map
}

async fn pump_body(mut resp: Response, tx: mpsc::Sender<io::Result<Bytes>>, token: CancellationToken) {
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => return,
            chunk = resp.chunk() => chunk,
        };
        let item = match chunk {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => return,
            Err(e) => Err(io::Error::other(e)),
        };
        let failed = item.is_err();
        tokio::select! {
            _ = token.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() || failed {
                    return;
                }
            }
        }
    }
}

/// Cancel `token` once `count` has not moved for `idle`. Returns when the
/// stream is done or the token is cancelled by someone else.
pub async fn watch_idle(count: ReadCount, idle: Duration, poll: Duration, token: CancellationToken) {
    let mut last = count.current();
    let mut last_progress = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(poll) => {}
        }
        if count.is_done() {
            return;
        }
        let current = count.current();
        if current > last {
            last = current;
            last_progress = tokio::time::Instant::now();
        } else if last_progress.elapsed() >= idle {
            tracing::warn!("No progress for {:?}, cancelling transfer", idle);
            token.cancel();
            return;
        }
    }
}

/// Blocking reader over a response body.
pub struct BodyReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
    token: CancellationToken,
    _runtime: Arc<Runtime>,
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.current.is_empty() {
                let n = buf.len().min(self.current.len());
                buf[..n].copy_from_slice(&self.current.split_to(n));
                return Ok(n);
            }
            match self.rx.blocking_recv() {
                Some(Ok(bytes)) => self.current = bytes,
                Some(Err(e)) => return Err(e),
                None if self.token.is_cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "transfer cancelled"));
                }
                None => return Ok(0),
            }
        }
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressReader;
    use tempfile::TempDir;

    #[test]
    fn test_basic_auth_needs_both_keys() {
        assert!(BasicAuth::from_keys("", "").is_none());
        assert!(BasicAuth::from_keys("user", "").is_none());
        let auth = BasicAuth::from_keys("user", "pass").expect("Should build auth");
        assert_eq!(auth.user, "user");
    }

    #[test]
    fn test_header_map() {
        let map = header_map(&["X-Token: abc", "Accept:  */*", "garbage", "Bad Name: x"]);
        assert_eq!(map.get("x-token").unwrap(), "abc");
        assert_eq!(map.get("accept").unwrap(), "*/*");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), 0);
        headers.insert("content-length", HeaderValue::from_static("100000"));
        assert_eq!(content_length(&headers), 100000);
        headers.insert("content-length", HeaderValue::from_static("nope"));
        assert_eq!(content_length(&headers), 0);
    }

    #[test]
    fn test_visible_files_skips_dot_entries() {
        let dir = TempDir::new().expect("Should create temp dir");
        std::fs::write(dir.path().join("ca.crt"), "x").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        std::fs::create_dir(dir.path().join("..data")).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let files = visible_files(dir.path()).expect("Should list");
        assert_eq!(files, vec![dir.path().join("ca.crt")]);
    }

    #[test]
    fn test_missing_cert_dir_fails() {
        let tls = TlsOptions {
            cert_dir: Some(PathBuf::from("/nonexistent/certs")),
            ..Default::default()
        };
        let err = HttpClient::new(&tls).err().expect("Missing cert dir should fail");
        assert_eq!(err.kind(), importer_shared::ErrorKind::Config);
    }

    #[test]
    fn test_unreadable_proxy_dir_is_ignored() {
        let tls = TlsOptions {
            proxy_cert_dir: Some(PathBuf::from("/nonexistent/proxycerts")),
            ..Default::default()
        };
        HttpClient::new(&tls).expect("Missing proxy certs should be ignored");
    }

    #[test]
    fn test_watchdog_cancels_idle_stream() {
        let client = HttpClient::new(&TlsOptions::default()).expect("Should build client");
        let reader = ProgressReader::new(io::empty(), 10, None);
        let token = CancellationToken::new();
        client.block_on(watch_idle(
            reader.count(),
            Duration::from_millis(50),
            Duration::from_millis(10),
            token.clone(),
        ));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_watchdog_stops_when_done() {
        let client = HttpClient::new(&TlsOptions::default()).expect("Should build client");
        let mut reader = ProgressReader::new(io::Cursor::new(vec![1u8; 16]), 16, None);
        io::copy(&mut reader, &mut io::sink()).expect("Should drain");
        let token = CancellationToken::new();
        client.block_on(watch_idle(
            reader.count(),
            Duration::from_millis(50),
            Duration::from_millis(10),
            token.clone(),
        ));
        assert!(!token.is_cancelled());
    }
}
