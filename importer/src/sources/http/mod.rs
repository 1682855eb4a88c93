//! HTTP(S) origin.

mod client;
mod headers;

use std::path::Path;
use std::time::Duration;

use importer_shared::constants::http::PULL_METHOD_NODE;
use importer_shared::constants::transfer::{IDLE_TIMEOUT_SECS, POLL_INTERVAL_MS};
use importer_shared::{ImportError, ImportResult, TerminationMessage};
use reqwest::Method;
use reqwest::header::{ACCEPT_RANGES, CONTENT_TYPE};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::{Position, Url};

pub use client::{
    BasicAuth, BodyReader, HttpClient, TlsOptions, content_length, expect_ok, header_map, watch_idle,
};
pub(crate) use client::{build_runtime, visible_files};
pub use headers::{extra_headers_from_dir, extra_headers_from_env};

use super::{Adapters, Capabilities, DataSource, StreamSource};
use crate::labels::envs_to_labels;
use crate::options::{ContentType, ImporterOptions};
use crate::phase::ProcessingPhase;
use crate::readers::ChecksumValidator;
use crate::util::redact_url;

/// Body of the node image server's `/info` endpoint.
#[derive(Debug, Default, Deserialize)]
struct ServerInfo {
    #[serde(rename = "Env", alias = "env", default)]
    env: Vec<String>,
}

/// What the HEAD and GET exchange found out about the origin.
struct Probe {
    total: u64,
    /// The converter cannot read this origin itself (no ranges, or HEAD refused).
    broken_for_qemu_img: bool,
}

/// Image served over HTTP(S).
pub struct HttpSource {
    stream: StreamSource,
    client: HttpClient,
    token: CancellationToken,
    /// `<scheme>://<host>/info` when images come from a node-local server
    info_url: Option<Url>,
}

impl HttpSource {
    pub fn new(options: &ImporterOptions, adapters: &Adapters) -> ImportResult<Self> {
        Self::with_idle_timeout(options, adapters, Duration::from_secs(IDLE_TIMEOUT_SECS))
    }

    /// Like [`HttpSource::new`], cancelling the transfer after `idle`
    /// without a byte of progress.
    pub fn with_idle_timeout(
        options: &ImporterOptions,
        adapters: &Adapters,
        idle: Duration,
    ) -> ImportResult<Self> {
        let endpoint = Url::parse(&options.endpoint).map_err(|e| {
            ImportError::InvalidArgument(format!("unable to parse endpoint {:?}: {}", options.endpoint, e))
        })?;
        let checksum = options
            .checksum
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(ChecksumValidator::parse)
            .transpose()?;

        let client = HttpClient::new(&TlsOptions::from_options(options))?;
        let auth = BasicAuth::from_keys(&options.access_key, &options.secret_key);
        if !options.extra_headers.is_empty() {
            tracing::info!("Using extra headers {:?}", options.extra_headers);
        }
        let secret_headers = extra_headers_from_dir(&options.extra_headers_dir)?;
        let mut lines = options.extra_headers.clone();
        lines.extend(secret_headers);
        let headers = header_map(&lines);

        let head_total = match client
            .send(Method::HEAD, &endpoint, auth.as_ref(), &headers)
            .and_then(expect_ok)
        {
            Ok(resp) => Some(content_length(resp.headers())),
            Err(e) => {
                tracing::warn!("HEAD of {} failed: {}", redact_url(endpoint.as_str()), e);
                None
            }
        };

        tracing::info!("Attempting to get object {} via http client", redact_url(endpoint.as_str()));
        let resp = expect_ok(client.send(Method::GET, &endpoint, auth.as_ref(), &headers)?)?;

        if options.content_type == ContentType::Kubevirt
            && let Some(value) = resp.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
            && value.starts_with("text/")
        {
            tracing::warn!(
                "Unexpected content type '{}'. Content might not be a KubeVirt image.",
                value
            );
        }

        let accept_ranges = resp
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut probe = Probe {
            total: head_total.unwrap_or(0),
            broken_for_qemu_img: head_total.is_none(),
        };
        if accept_ranges.as_deref().is_none_or(|v| v == "none") {
            tracing::debug!("Accept-Ranges isn't bytes, avoiding qemu-img");
            probe.broken_for_qemu_img = true;
        }
        if probe.total == 0 {
            probe.total = content_length(resp.headers());
        }
        tracing::debug!(total = probe.total, broken = probe.broken_for_qemu_img, "Probed origin");

        // The converter reads the origin itself only when it needs nothing
        // this client adds: custom roots, credentials or headers.
        let direct = (!probe.broken_for_qemu_img
            && options.cert_dir.is_none()
            && auth.is_none()
            && headers.is_empty())
        .then(|| endpoint.to_string());

        let token = CancellationToken::new();
        let body = client.stream(resp, token.clone());
        let stream = StreamSource::new(Box::new(body), probe.total, options.content_type)
            .with_progress(adapters.counter(&options.owner_uid))
            .with_preallocation(options.preallocation)
            .with_checksum(checksum)
            .with_direct_url(direct);
        client.spawn(watch_idle(
            stream.count(),
            idle,
            Duration::from_millis(POLL_INTERVAL_MS.min(idle.as_millis() as u64).max(1)),
            token.clone(),
        ));

        let info_url = (options.pull_method == PULL_METHOD_NODE)
            .then(|| server_info_url(&endpoint))
            .flatten();

        Ok(Self {
            stream,
            client,
            token,
            info_url,
        })
    }

    fn server_info(&self, url: &Url) -> ImportResult<ServerInfo> {
        self.client.get_json(url)
    }
}

/// `<scheme>://<host[:port]>/info` of `endpoint`.
fn server_info_url(endpoint: &Url) -> Option<Url> {
    let authority = &endpoint[Position::BeforeHost..Position::AfterPort];
    Url::parse(&format!("{}://{}/info", endpoint.scheme(), authority)).ok()
}

impl DataSource for HttpSource {
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

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resume: false,
            produces_termination_info: self.info_url.is_some(),
        }
    }

    fn termination_message(&self) -> Option<TerminationMessage> {
        let url = self.info_url.as_ref()?;
        let info = self
            .server_info(url)
            .inspect_err(|e| tracing::error!("Failed to get server info: {}", e))
            .ok()?;
        let labels = envs_to_labels(&info.env);
        Some(TerminationMessage {
            labels: (!labels.is_empty()).then_some(labels),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_url() {
        let endpoint = Url::parse("http://node-server:8100/disk/cirros.qcow2").unwrap();
        assert_eq!(
            server_info_url(&endpoint).unwrap().as_str(),
            "http://node-server:8100/info"
        );
        let endpoint = Url::parse("https://user:pw@example.com/a.img").unwrap();
        assert_eq!(
            server_info_url(&endpoint).unwrap().as_str(),
            "https://example.com/info"
        );
    }

    #[test]
    fn test_server_info_decodes_env() {
        let info: ServerInfo = serde_json::from_str(r#"{"Env":["A=b"]}"#).unwrap();
        assert_eq!(info.env, vec!["A=b".to_string()]);
        let info: ServerInfo = serde_json::from_str("{}").unwrap();
        assert!(info.env.is_empty());
    }

    #[test]
    fn test_bad_endpoint() {
        let options = ImporterOptions::new(crate::SourceScheme::Http, "not a url");
        let adapters = Adapters::system(crate::ProgressMetrics::new(), "");
        let err = HttpSource::new(&options, &adapters).err().expect("Should reject endpoint");
        assert_eq!(err.kind(), importer_shared::ErrorKind::InvalidArgument);
    }
}
