//! oVirt engine REST client.

use std::collections::HashMap;

use importer_shared::{ImportError, ImportResult};
use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Method, RequestBuilder};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use url::{Position, Url};

use crate::sources::http::{HttpClient, TlsOptions, expect_ok};
use crate::util::redact_url;

const SSO_PATH: &str = "/ovirt-engine/sso/oauth/token";
const SSO_SCOPE: &str = "ovirt-app-api";
const JSON: &str = "application/json";

/// State of an image transfer on the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferPhase {
    Cancelled,
    CancelledSystem,
    CancelledUser,
    FinalizingCleanup,
    FinalizingFailure,
    FinalizingSuccess,
    FinishedFailure,
    FinishedSuccess,
    Initializing,
    PausedSystem,
    PausedUser,
    Resuming,
    Transferring,
    Unknown,
    /// A phase this client does not know
    Other(String),
}

impl TransferPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "cancelled" => TransferPhase::Cancelled,
            "cancelled_system" => TransferPhase::CancelledSystem,
            "cancelled_user" => TransferPhase::CancelledUser,
            "finalizing_cleanup" => TransferPhase::FinalizingCleanup,
            "finalizing_failure" => TransferPhase::FinalizingFailure,
            "finalizing_success" => TransferPhase::FinalizingSuccess,
            "finished_failure" => TransferPhase::FinishedFailure,
            "finished_success" => TransferPhase::FinishedSuccess,
            "initializing" => TransferPhase::Initializing,
            "paused_system" => TransferPhase::PausedSystem,
            "paused_user" => TransferPhase::PausedUser,
            "resuming" => TransferPhase::Resuming,
            "transferring" => TransferPhase::Transferring,
            "unknown" => TransferPhase::Unknown,
            other => TransferPhase::Other(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for TransferPhase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let phase = String::deserialize(deserializer)?;
        Ok(TransferPhase::parse(&phase))
    }
}

/// The engine renders numbers as strings; accept both.
fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s.parse().map(Some).map_err(de::Error::custom),
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct IdRef {
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StorageDomains {
    #[serde(default)]
    pub storage_domain: Vec<IdRef>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Disk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default, deserialize_with = "number_or_string")]
    pub total_size: Option<u64>,
    #[serde(default)]
    pub storage_domains: Option<StorageDomains>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DiskSnapshot {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "number_or_string")]
    pub actual_size: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ImageTransfer {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub phase: Option<TransferPhase>,
    #[serde(default)]
    pub transfer_url: Option<String>,
}

/// Disk format of a download.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Cow,
}

/// What to download: a disk's active image or one of its snapshots.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub disk_id: String,
    pub snapshot_id: Option<String>,
    pub format: DiskFormat,
    pub inactivity_timeout: u64,
}

/// Open sessions with an oVirt engine.
pub trait OvirtConnector: Send + Sync {
    fn connect(
        &self,
        endpoint: &str,
        user: &str,
        password: &str,
        tls: &TlsOptions,
    ) -> ImportResult<Box<dyn OvirtClient>>;
}

/// Session with an oVirt engine.
pub trait OvirtClient: Send {
    fn disk(&self, disk_id: &str) -> ImportResult<Disk>;

    fn disk_snapshots(&self, storage_domain_id: &str) -> ImportResult<Vec<DiskSnapshot>>;

    fn add_transfer(&self, request: &TransferRequest) -> ImportResult<ImageTransfer>;

    fn transfer(&self, transfer_id: &str) -> ImportResult<ImageTransfer>;

    fn finalize_transfer(&self, transfer_id: &str) -> ImportResult<()>;

    fn cancel_transfer(&self, transfer_id: &str) -> ImportResult<()>;

    fn close(&mut self) -> ImportResult<()> {
        Ok(())
    }
}

/// [`OvirtConnector`] speaking the engine's REST API.
pub struct RestOvirtConnector;

impl OvirtConnector for RestOvirtConnector {
    fn connect(
        &self,
        endpoint: &str,
        user: &str,
        password: &str,
        tls: &TlsOptions,
    ) -> ImportResult<Box<dyn OvirtClient>> {
        Ok(Box::new(RestOvirtClient::connect(endpoint, user, password, tls)?))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SnapshotList {
    #[serde(default)]
    disk_snapshot: Vec<DiskSnapshot>,
}

#[derive(Serialize)]
struct TransferBody<'a> {
    direction: &'static str,
    format: DiskFormat,
    inactivity_timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<HashMap<&'static str, &'a str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<HashMap<&'static str, &'a str>>,
}

/// REST session authenticated with an SSO bearer token.
pub struct RestOvirtClient {
    http: HttpClient,
    api: Url,
    token: String,
}

impl RestOvirtClient {
    pub fn connect(endpoint: &str, user: &str, password: &str, tls: &TlsOptions) -> ImportResult<Self> {
        let api = Url::parse(endpoint.trim_end_matches('/')).map_err(|e| {
            ImportError::InvalidArgument(format!("unable to parse endpoint {:?}: {}", endpoint, e))
        })?;
        let sso = Url::parse(&format!("{}{}", &api[..Position::AfterPort], SSO_PATH))
            .map_err(|e| ImportError::InvalidArgument(format!("invalid SSO URL: {}", e)))?;
        let http = HttpClient::new(tls)?;

        tracing::info!("Opening oVirt session at {}", redact_url(sso.as_str()));
        let form = [
            ("grant_type", "password"),
            ("scope", SSO_SCOPE),
            ("username", user),
            ("password", password),
        ];
        let resp = http
            .block_on(http.inner().post(sso).header(ACCEPT, JSON).form(&form).send())
            .map_err(|e| ImportError::Network(format!("Error creating connection: {}", e)))?;
        let token: TokenResponse = http
            .block_on(expect_ok(resp)?.json())
            .map_err(|e| ImportError::Network(format!("invalid SSO response: {}", e)))?;

        Ok(Self {
            http,
            api,
            token: token.access_token,
        })
    }

    fn url(&self, path: &str) -> ImportResult<Url> {
        Url::parse(&format!("{}/{}", self.api, path))
            .map_err(|e| ImportError::Internal(format!("invalid API path {}: {}", path, e)))
    }

    fn request(&self, method: Method, path: &str) -> ImportResult<RequestBuilder> {
        Ok(self
            .http
            .inner()
            .request(method, self.url(path)?)
            .bearer_auth(&self.token)
            .header(ACCEPT, HeaderValue::from_static(JSON)))
    }

    fn call<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> ImportResult<T> {
        let resp = self
            .http
            .block_on(request.send())
            .map_err(|e| ImportError::Network(format!("{}: {}", what, e)))?;
        let resp = expect_ok(resp).map_err(|e| e.context(what.to_string()))?;
        self.http
            .block_on(resp.json())
            .map_err(|e| ImportError::Network(format!("{}: invalid response: {}", what, e)))
    }

    fn action(&self, transfer_id: &str, action: &str) -> ImportResult<()> {
        let request = self
            .request(Method::POST, &format!("imagetransfers/{}/{}", transfer_id, action))?
            .json(&serde_json::json!({}));
        let resp = self
            .http
            .block_on(request.send())
            .map_err(|e| ImportError::Network(format!("Unable to {} transfer: {}", action, e)))?;
        expect_ok(resp).map(|_| ())
    }
}

impl OvirtClient for RestOvirtClient {
    fn disk(&self, disk_id: &str) -> ImportResult<Disk> {
        let request = self.request(Method::GET, &format!("disks/{}", disk_id))?;
        self.call(request, &format!("error fetching disk {}", disk_id))
    }

    fn disk_snapshots(&self, storage_domain_id: &str) -> ImportResult<Vec<DiskSnapshot>> {
        let request = self.request(
            Method::GET,
            &format!("storagedomains/{}/disksnapshots", storage_domain_id),
        )?;
        let list: SnapshotList = self.call(
            request,
            &format!("error listing snapshots in storage domain {}", storage_domain_id),
        )?;
        Ok(list.disk_snapshot)
    }

    fn add_transfer(&self, request: &TransferRequest) -> ImportResult<ImageTransfer> {
        let body = TransferBody {
            direction: "download",
            format: request.format,
            inactivity_timeout: request.inactivity_timeout,
            image: request
                .snapshot_id
                .is_none()
                .then(|| HashMap::from([("id", request.disk_id.as_str())])),
            snapshot: request
                .snapshot_id
                .as_deref()
                .map(|id| HashMap::from([("id", id)])),
        };
        let builder = self.request(Method::POST, "imagetransfers")?.json(&body);
        self.call(builder, "Error sending transfer image request")
    }

    fn transfer(&self, transfer_id: &str) -> ImportResult<ImageTransfer> {
        let request = self.request(Method::GET, &format!("imagetransfers/{}", transfer_id))?;
        self.call(request, &format!("Unable to read image transfer {}", transfer_id))
    }

    fn finalize_transfer(&self, transfer_id: &str) -> ImportResult<()> {
        self.action(transfer_id, "finalize")
    }

    fn cancel_transfer(&self, transfer_id: &str) -> ImportResult<()> {
        self.action(transfer_id, "cancel")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_decodes_string_numbers() {
        let disk: Disk = serde_json::from_str(
            r#"{"id":"d1","image_id":"i1","total_size":"1048576",
                "storage_domains":{"storage_domain":[{"id":"sd1"}]}}"#,
        )
        .expect("Should decode disk");
        assert_eq!(disk.total_size, Some(1 << 20));
        assert_eq!(disk.storage_domains.unwrap().storage_domain[0].id, "sd1");

        let disk: Disk = serde_json::from_str(r#"{"total_size":42}"#).unwrap();
        assert_eq!(disk.total_size, Some(42));
        assert!(serde_json::from_str::<Disk>(r#"{"total_size":"lots"}"#).is_err());
    }

    #[test]
    fn test_transfer_phase() {
        let transfer: ImageTransfer =
            serde_json::from_str(r#"{"id":"t1","phase":"transferring","transfer_url":"https://h/i"}"#)
                .unwrap();
        assert_eq!(transfer.phase, Some(TransferPhase::Transferring));
        assert_eq!(
            TransferPhase::parse("exploded"),
            TransferPhase::Other("exploded".into())
        );
    }

    #[test]
    fn test_transfer_body() {
        let body = TransferBody {
            direction: "download",
            format: DiskFormat::Raw,
            inactivity_timeout: 60,
            image: None,
            snapshot: Some(HashMap::from([("id", "s1")])),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "direction": "download",
                "format": "raw",
                "inactivity_timeout": 60,
                "snapshot": {"id": "s1"}
            })
        );
    }
}
