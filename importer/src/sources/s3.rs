//! S3-compatible object stores.
//!
//! Objects are fetched with a single path-style GET signed with AWS
//! Signature Version 4. Without keys the request goes out unsigned.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use importer_shared::constants::transfer::{IDLE_TIMEOUT_SECS, POLL_INTERVAL_MS};
use importer_shared::{ImportError, ImportResult};
use regex::Regex;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use ring::hmac;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::http::{HttpClient, TlsOptions, content_length, expect_ok, watch_idle};
use super::{Adapters, DataSource, StreamSource};
use crate::options::ImporterOptions;
use crate::phase::ProcessingPhase;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"s3\.(.+)\.amazonaws\.com").expect("region regex is valid"));

/// Region from an S3 host name: `s3.<region>.amazonaws.com`, otherwise the
/// first dot-separated label.
pub fn extract_region(host: &str) -> String {
    match REGION_RE.captures(host).and_then(|c| c.get(1)) {
        Some(region) => region.as_str().to_string(),
        None => host.split('.').next().unwrap_or_default().to_string(),
    }
}

/// Split `bucket/path/to/object` at the first separator.
pub fn extract_bucket_and_object(path: &str) -> (String, String) {
    let path = path.trim_matches('/');
    match path.split_once('/') {
        Some((bucket, object)) => (bucket.to_string(), object.to_string()),
        None => (path.to_string(), String::new()),
    }
}

/// Static credentials for request signing.
#[derive(Clone, Debug)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl S3Credentials {
    /// SigV4 headers for a GET of `url` at `now`.
    pub fn sign_get(&self, url: &Url, now: DateTime<Utc>) -> ImportResult<HeaderMap> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let host = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
            None => url.host_str().unwrap_or_default().to_string(),
        };

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            url.path(),
            url.query().unwrap_or_default(),
            host,
            UNSIGNED_PAYLOAD,
            amz_date,
            SIGNED_HEADERS,
            UNSIGNED_PAYLOAD
        );
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key = signing_key(&self.secret_key, &date, &self.region, "s3");
        let signature = hex::encode(hmac::sign(&key, string_to_sign.as_bytes()).as_ref());
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, SIGNED_HEADERS, signature
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-amz-date", header_value(&amz_date)?);
        headers.insert("x-amz-content-sha256", HeaderValue::from_static(UNSIGNED_PAYLOAD));
        headers.insert(AUTHORIZATION, header_value(&authorization)?);
        Ok(headers)
    }
}

fn header_value(value: &str) -> ImportResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ImportError::InvalidArgument(format!("invalid header value: {}", e)))
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> hmac::Key {
    let mut key = hmac::Key::new(hmac::HMAC_SHA256, format!("AWS4{}", secret).as_bytes());
    for part in [date, region, service, "aws4_request"] {
        let tag = hmac::sign(&key, part.as_bytes());
        key = hmac::Key::new(hmac::HMAC_SHA256, tag.as_ref());
    }
    key
}

/// Path-style object URL on the endpoint's host.
fn object_url(endpoint: &Url, bucket: &str, object: &str) -> ImportResult<Url> {
    let scheme = match endpoint.scheme() {
        "http" => "http",
        _ => "https",
    };
    let host = &endpoint[url::Position::BeforeHost..url::Position::AfterPort];
    // Segments keep the endpoint's percent-encoding.
    Url::parse(&format!("{}://{}/{}/{}", scheme, host, bucket, object))
        .map_err(|e| ImportError::InvalidArgument(format!("invalid object URL: {}", e)))
}

/// Image stored as an S3 object.
pub struct S3Source {
    stream: StreamSource,
    token: CancellationToken,
    _client: HttpClient,
}

impl S3Source {
    pub fn new(options: &ImporterOptions, adapters: &Adapters) -> ImportResult<Self> {
        let endpoint = Url::parse(&options.endpoint).map_err(|e| {
            ImportError::InvalidArgument(format!("unable to parse endpoint {:?}: {}", options.endpoint, e))
        })?;
        let host = endpoint.host_str().unwrap_or_default();
        tracing::info!("Endpoint {}", host);
        let (bucket, object) = extract_bucket_and_object(endpoint.path());
        tracing::debug!("bucket {}", bucket);
        tracing::debug!("object {}", object);
        let url = object_url(&endpoint, &bucket, &object)?;

        let client = HttpClient::new(&TlsOptions::from_options(options))?;
        let headers = if options.access_key.is_empty() && options.secret_key.is_empty() {
            HeaderMap::new()
        } else {
            S3Credentials {
                access_key: options.access_key.clone(),
                secret_key: options.secret_key.clone(),
                region: extract_region(host),
            }
            .sign_get(&url, Utc::now())?
        };

        let resp = client
            .send(Method::GET, &url, None, &headers)
            .and_then(expect_ok)
            .map_err(|e| e.context(format!("could not get s3 object: \"{}/{}\"", bucket, object)))?;
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

impl DataSource for S3Source {
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_extract_region() {
        assert_eq!(extract_region("s3.us-west-2.amazonaws.com"), "us-west-2");
        assert_eq!(extract_region("minio.example.com"), "minio");
        assert_eq!(extract_region("localhost"), "localhost");
    }

    #[test]
    fn test_extract_bucket_and_object() {
        assert_eq!(
            extract_bucket_and_object("/bucket/dir/disk.img"),
            ("bucket".to_string(), "dir/disk.img".to_string())
        );
        assert_eq!(
            extract_bucket_and_object("bucket"),
            ("bucket".to_string(), String::new())
        );
    }

    #[test]
    fn test_object_url_is_path_style() {
        let endpoint = Url::parse("http://minio:9000/images/my disk.img").unwrap();
        let (bucket, object) = extract_bucket_and_object(endpoint.path());
        let url = object_url(&endpoint, &bucket, &object).unwrap();
        assert_eq!(url.as_str(), "http://minio:9000/images/my%20disk.img");

        let endpoint = Url::parse("s3://s3.us-east-1.amazonaws.com/b/k").unwrap();
        let url = object_url(&endpoint, "b", "k").unwrap();
        assert_eq!(url.as_str(), "https://s3.us-east-1.amazonaws.com/b/k");
    }

    #[test]
    fn test_signing_key_matches_published_example() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        // The derived key is only observable through a signature; sign the
        // empty message with both it and the published raw key.
        let expected = hmac::Key::new(
            hmac::HMAC_SHA256,
            &hex::decode("f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d").unwrap(),
        );
        assert_eq!(
            hmac::sign(&key, b"").as_ref(),
            hmac::sign(&expected, b"").as_ref()
        );
    }

    #[test]
    fn test_sign_get_headers() {
        let creds = S3Credentials {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "secret".into(),
            region: "us-east-1".into(),
        };
        let url = Url::parse("https://s3.us-east-1.amazonaws.com/bucket/disk.img").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let headers = creds.sign_get(&url, now).expect("Should sign");
        assert_eq!(headers.get("x-amz-date").unwrap(), "20240102T030405Z");
        let auth = headers.get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240102/us-east-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        let signature = auth.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);

        let again = creds.sign_get(&url, now).unwrap();
        assert_eq!(again.get(AUTHORIZATION), headers.get(AUTHORIZATION));
    }
}
