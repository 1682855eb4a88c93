//! HTTP origin serving in-memory files.
//!
//! Runs an axum server on a loopback port in its own runtime so blocking
//! tests can point the importer at it. `/info` answers like a node-local
//! image server.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

/// How the origin behaves.
#[derive(Clone, Debug)]
pub struct OriginConfig {
    /// Answer `HEAD`; otherwise it gets 405
    pub head: bool,
    /// Advertise `Accept-Ranges: bytes`
    pub accept_ranges: bool,
    pub content_type: String,
    /// `Env` list returned by `/info`
    pub info_env: Vec<String>,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            head: true,
            accept_ranges: true,
            content_type: "application/octet-stream".into(),
            info_env: Vec::new(),
        }
    }
}

/// One recorded request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct Shared {
    config: Mutex<OriginConfig>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<Request>>,
}

/// A running origin. Stops when dropped.
pub struct Origin {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    runtime: Option<Runtime>,
}

impl Origin {
    pub fn serve(config: OriginConfig) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("test-origin")
            .enable_all()
            .build()?;
        let shared = Arc::new(Shared {
            config: Mutex::new(config),
            ..Default::default()
        });

        let app = Router::new().fallback(handle).with_state(shared.clone());
        let listener = runtime.block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();
        runtime.spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            shared,
            shutdown: Some(tx),
            runtime: Some(runtime),
        })
    }

    /// Serve `body` at `path`.
    pub fn add(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.shared.files.lock().insert(normalize(path), body.into());
    }

    pub fn configure(&self, update: impl FnOnce(&mut OriginConfig)) {
        update(&mut self.shared.config.lock());
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, normalize(path))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> Vec<Request> {
        self.shared.requests.lock().clone()
    }
}

impl Drop for Origin {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

async fn handle(State(shared): State<Arc<Shared>>, method: Method, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    shared.requests.lock().push(Request {
        method: method.to_string(),
        path: path.clone(),
        headers: headers
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
    });
    let config = shared.config.lock().clone();

    if path == "/info" {
        let body = format!(
            "{{\"Env\":[{}]}}",
            config
                .info_env
                .iter()
                .map(|e| format!("{:?}", e))
                .collect::<Vec<_>>()
                .join(",")
        );
        return respond(StatusCode::OK, &[(CONTENT_TYPE.as_str(), "application/json")], body.into_bytes());
    }
    if let Some(target) = path.strip_prefix("/redirect") {
        return respond(StatusCode::FOUND, &[(LOCATION.as_str(), target)], Vec::new());
    }
    if method == Method::HEAD && !config.head {
        return respond(StatusCode::METHOD_NOT_ALLOWED, &[], Vec::new());
    }
    if method != Method::HEAD && method != Method::GET {
        return respond(StatusCode::METHOD_NOT_ALLOWED, &[], Vec::new());
    }

    let Some(body) = shared.files.lock().get(&path).cloned() else {
        return respond(StatusCode::NOT_FOUND, &[], b"not found".to_vec());
    };
    let length = body.len().to_string();
    let ranges = if config.accept_ranges { "bytes" } else { "none" };
    let headers = [
        (CONTENT_LENGTH.as_str(), length.as_str()),
        (ACCEPT_RANGES.as_str(), ranges),
        (CONTENT_TYPE.as_str(), config.content_type.as_str()),
    ];
    let body = if method == Method::HEAD { Vec::new() } else { body };
    respond(StatusCode::OK, &headers, body)
}

fn respond(status: StatusCode, headers: &[(&str, &str)], body: Vec<u8>) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
