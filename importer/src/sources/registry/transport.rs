//! Image transports: a remote registry, or an OCI layout on local disk.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use importer_shared::{ImportError, ImportResult};
use oci_client::client::{Certificate, CertificateEncoding, ClientConfig, ClientProtocol};
use oci_client::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use serde::de::DeserializeOwned;
use tokio::io::DuplexStream;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use crate::options::ImporterOptions;
use crate::readers::BoxedReader;
use crate::sources::http::{build_runtime, visible_files};

const DOCKER_TRANSPORT: &str = "docker";
const OCI_ARCHIVE_TRANSPORT: &str = "oci-archive";

/// Bytes buffered between a blob download and its reader.
const BLOB_PIPE_SIZE: usize = 1 << 20;

/// A parsed `transport:reference` image name.
#[derive(Clone, Debug)]
pub enum ImageReference {
    /// `docker://registry/repository[:tag|@digest]`
    Docker(Reference),
    /// `oci-archive:<path>`, a tar of an OCI layout or the layout directory
    OciArchive(PathBuf),
}

impl ImageReference {
    pub fn parse(image: &str) -> ImportResult<Self> {
        let Some((transport, rest)) = image.split_once(':') else {
            return Err(ImportError::InvalidArgument(format!(
                "Invalid image name \"{}\", expected colon-separated transport:reference",
                image
            )));
        };
        match transport {
            DOCKER_TRANSPORT => {
                let name = rest.strip_prefix("//").ok_or_else(|| {
                    ImportError::InvalidArgument(format!(
                        "docker reference {:?} must start with //",
                        rest
                    ))
                })?;
                let reference = name.parse::<Reference>().map_err(|e| {
                    ImportError::InvalidArgument(format!("Could not parse image {:?}: {}", name, e))
                })?;
                Ok(ImageReference::Docker(reference))
            }
            OCI_ARCHIVE_TRANSPORT if !rest.is_empty() => {
                Ok(ImageReference::OciArchive(PathBuf::from(rest)))
            }
            _ => Err(ImportError::InvalidArgument(format!(
                "Invalid image name \"{}\", unknown transport",
                image
            ))),
        }
    }
}

/// How to reach and trust a registry.
#[derive(Clone, Debug, Default)]
pub struct RegistryConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub cert_dir: Option<PathBuf>,
    pub proxy_cert_dir: Option<PathBuf>,
    pub insecure: bool,
    /// Architecture the image must be built for; the host's when unset
    pub architecture: Option<String>,
}

impl RegistryConfig {
    pub fn from_options(options: &ImporterOptions) -> Self {
        let keys = !options.access_key.is_empty() && !options.secret_key.is_empty();
        Self {
            username: keys.then(|| options.access_key.clone()),
            password: keys.then(|| options.secret_key.clone()),
            cert_dir: options.cert_dir.clone(),
            proxy_cert_dir: options.proxy_cert_dir.clone(),
            insecure: options.insecure_tls,
            architecture: options.registry_arch.clone().filter(|a| !a.is_empty()),
        }
    }

    fn auth(&self) -> RegistryAuth {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => RegistryAuth::Basic(user.clone(), password.clone()),
            _ => RegistryAuth::Anonymous,
        }
    }

    fn wanted_architecture(&self) -> String {
        self.architecture
            .clone()
            .unwrap_or_else(|| host_architecture().to_string())
    }

    fn root_certificates(&self) -> Vec<Certificate> {
        let mut certs = Vec::new();
        for dir in [&self.proxy_cert_dir, &self.cert_dir].into_iter().flatten() {
            for path in visible_files(dir).unwrap_or_default() {
                match std::fs::read(&path) {
                    Ok(data) => certs.push(Certificate {
                        encoding: CertificateEncoding::Pem,
                        data,
                    }),
                    Err(e) => tracing::warn!("Skipping certificate {}: {}", path.display(), e),
                }
            }
        }
        certs
    }
}

/// OCI name of the host CPU architecture.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// One layer blob of an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerBlob {
    pub digest: String,
    pub media_type: String,
    pub size: i64,
}

/// An opened image: its layers and configuration.
pub trait ImageSource: Send {
    /// Layers in manifest order, base layer first.
    fn layers(&self) -> &[LayerBlob];

    /// Stream the raw (possibly compressed) contents of `layer`.
    fn open_layer(&self, layer: &LayerBlob) -> ImportResult<BoxedReader>;

    /// `Env` of the image configuration.
    fn env(&self) -> &[String];
}

/// Open the image `reference` names.
pub fn open_image_source(
    reference: &ImageReference,
    config: &RegistryConfig,
) -> ImportResult<Box<dyn ImageSource>> {
    match reference {
        ImageReference::Docker(reference) => {
            Ok(Box::new(DockerImageSource::open(reference, config)?))
        }
        ImageReference::OciArchive(path) => {
            Ok(Box::new(OciArchiveSource::open(path, config.architecture.as_deref())?))
        }
    }
}

fn pull_failed(what: &str, err: impl std::fmt::Display) -> ImportError {
    ImportError::ImagePullFailed(format!("{}: {}", what, err))
}

/// Fail unless the configuration was built for `wanted`.
fn check_architecture(
    config: &oci_spec::image::ImageConfiguration,
    wanted: Option<&str>,
) -> ImportResult<()> {
    let Some(wanted) = wanted else {
        return Ok(());
    };
    let actual = config.architecture().to_string();
    if actual != wanted {
        return Err(ImportError::InvalidArgument(format!(
            "Error validating architecture: manifest image architecture: \"{}\" doesn't match requested architecture: \"{}\"",
            actual, wanted
        )));
    }
    Ok(())
}

fn config_env(config: &oci_spec::image::ImageConfiguration) -> Vec<String> {
    config
        .config()
        .as_ref()
        .and_then(|c| c.env().clone())
        .unwrap_or_default()
}

// ============================================================================
// Registry
// ============================================================================

/// Image in a remote registry.
pub struct DockerImageSource {
    runtime: Arc<Runtime>,
    client: Client,
    reference: Reference,
    layers: Vec<LayerBlob>,
    env: Vec<String>,
}

impl DockerImageSource {
    pub fn open(reference: &Reference, config: &RegistryConfig) -> ImportResult<Self> {
        let runtime = build_runtime("importer-registry")?;
        let registry = reference.resolve_registry().to_string();
        let client_config = ClientConfig {
            protocol: if config.insecure {
                ClientProtocol::HttpsExcept(vec![registry])
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: config.insecure,
            extra_root_certificates: config.root_certificates(),
            ..Default::default()
        };
        let client = Client::new(client_config);
        let auth = config.auth();
        let architecture = config.wanted_architecture();

        tracing::info!("Pulling manifest of {}", reference.whole());
        let (reference, manifest) = runtime.block_on(resolve_manifest(
            &client,
            reference,
            &auth,
            &architecture,
        ))?;

        let mut raw_config = Vec::new();
        runtime
            .block_on(client.pull_blob(&reference, &manifest.config, &mut raw_config))
            .map_err(|e| pull_failed("failed to pull image config", e))?;
        let image_config: oci_spec::image::ImageConfiguration =
            serde_json::from_slice(&raw_config)
                .map_err(|e| pull_failed("failed to parse image config", e))?;
        check_architecture(&image_config, config.architecture.as_deref())?;

        let layers = manifest
            .layers
            .iter()
            .map(|layer| LayerBlob {
                digest: layer.digest.clone(),
                media_type: layer.media_type.clone(),
                size: layer.size,
            })
            .collect();

        Ok(Self {
            runtime,
            client,
            reference,
            layers,
            env: config_env(&image_config),
        })
    }
}

/// Pull the manifest of `reference`, resolving an image index to the entry
/// built for `architecture` on linux.
async fn resolve_manifest(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    architecture: &str,
) -> ImportResult<(Reference, OciImageManifest)> {
    let (manifest, _) = client
        .pull_manifest(reference, auth)
        .await
        .map_err(|e| pull_failed("failed to pull manifest", e))?;

    let index = match manifest {
        OciManifest::Image(image) => return Ok((reference.clone(), image)),
        OciManifest::ImageIndex(index) => index,
    };

    let entry = select_platform_manifest(&index.manifests, architecture)?;
    tracing::info!("Pulling platform-specific manifest: {}", entry.digest);
    let platform_reference = Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        entry.digest.clone(),
    );
    let (platform_manifest, _) = client
        .pull_manifest(&platform_reference, auth)
        .await
        .map_err(|e| pull_failed("failed to pull platform manifest", e))?;
    match platform_manifest {
        OciManifest::Image(image) => Ok((platform_reference, image)),
        OciManifest::ImageIndex(_) => Err(ImportError::ImagePullFailed(
            "platform manifest is not a valid image".into(),
        )),
    }
}

fn select_platform_manifest<'a>(
    entries: &'a [ImageIndexEntry],
    architecture: &str,
) -> ImportResult<&'a ImageIndexEntry> {
    entries
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == architecture)
        })
        .ok_or_else(|| {
            let available = entries
                .iter()
                .filter_map(|m| {
                    m.platform
                        .as_ref()
                        .map(|p| format!("{}/{}", p.os, p.architecture))
                })
                .collect::<Vec<_>>()
                .join(", ");
            ImportError::ImagePullFailed(format!(
                "no image found for platform linux/{}. Available platforms: {}",
                architecture, available
            ))
        })
}

impl ImageSource for DockerImageSource {
    fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    fn open_layer(&self, layer: &LayerBlob) -> ImportResult<BoxedReader> {
        let (writer, reader) = tokio::io::duplex(BLOB_PIPE_SIZE);
        let client = self.client.clone();
        let reference = self.reference.clone();
        let descriptor = OciDescriptor {
            digest: layer.digest.clone(),
            media_type: layer.media_type.clone(),
            size: layer.size,
            urls: None,
            annotations: None,
        };
        let task = self.runtime.spawn(async move {
            client
                .pull_blob(&reference, &descriptor, writer)
                .await
                .map_err(|e| e.to_string())
        });
        let handle = self.runtime.handle().clone();
        Ok(Box::new(BlobReader {
            bridge: SyncIoBridge::new_with_handle(reader, handle),
            task: Some(task),
            runtime: Arc::clone(&self.runtime),
        }))
    }

    fn env(&self) -> &[String] {
        &self.env
    }
}

/// Blocking reader over a blob being downloaded. A failed download surfaces
/// as a read error once the piped bytes run out.
struct BlobReader {
    bridge: SyncIoBridge<DuplexStream>,
    task: Option<JoinHandle<Result<(), String>>>,
    runtime: Arc<Runtime>,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.bridge.read(buf)?;
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        match self.task.take().map(|task| self.runtime.block_on(task)) {
            None | Some(Ok(Ok(()))) => Ok(0),
            Some(Ok(Err(e))) => Err(io::Error::other(format!("blob download failed: {}", e))),
            Some(Err(e)) => Err(io::Error::other(format!("blob download aborted: {}", e))),
        }
    }
}

impl Drop for BlobReader {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// OCI layout
// ============================================================================

/// Where the layout's files live.
#[derive(Clone, Debug)]
enum Layout {
    Dir(PathBuf),
    Tar(PathBuf),
}

impl Layout {
    fn open(&self, name: &str) -> ImportResult<BoxedReader> {
        match self {
            Layout::Dir(root) => {
                let path = root.join(name);
                let file = File::open(&path)
                    .map_err(|e| ImportError::from_io(format!("open {}", path.display()), e))?;
                Ok(Box::new(file))
            }
            Layout::Tar(archive) => open_tar_member(archive, name),
        }
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> ImportResult<T> {
        let reader = self.open(name)?;
        serde_json::from_reader(reader)
            .map_err(|e| ImportError::ImagePullFailed(format!("Failed to parse {}: {}", name, e)))
    }
}

/// Reader over the member `name` of the tar file `archive`, read in place.
fn open_tar_member(archive: &Path, name: &str) -> ImportResult<BoxedReader> {
    let open = |path: &Path| {
        File::open(path).map_err(|e| ImportError::from_io(format!("open {}", path.display()), e))
    };
    let read_err = |e: io::Error| ImportError::from_io(format!("read {}", archive.display()), e);

    let mut tar = tar::Archive::new(open(archive)?);
    let mut found = None;
    for entry in tar.entries().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path().map_err(read_err)?;
        if path.to_string_lossy().trim_start_matches("./") == name {
            found = Some((entry.raw_file_position(), entry.size()));
            break;
        }
    }
    let (position, size) = found.ok_or_else(|| {
        ImportError::ImagePullFailed(format!("{} not found in {}", name, archive.display()))
    })?;

    let mut file = open(archive)?;
    file.seek(SeekFrom::Start(position)).map_err(read_err)?;
    Ok(Box::new(file.take(size)))
}

/// `blobs/<algorithm>/<hex>` of a digest.
fn blob_name(digest: &str) -> ImportResult<String> {
    match digest.split_once(':') {
        Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() && !hex.contains('/') => {
            Ok(format!("blobs/{}/{}", algorithm, hex))
        }
        _ => Err(ImportError::ImagePullFailed(format!("invalid digest {:?}", digest))),
    }
}

/// Image stored as an OCI layout, packed in a tar file or unpacked.
pub struct OciArchiveSource {
    layout: Layout,
    layers: Vec<LayerBlob>,
    env: Vec<String>,
}

impl OciArchiveSource {
    pub fn open(path: &Path, architecture: Option<&str>) -> ImportResult<Self> {
        let layout = if path.is_dir() {
            Layout::Dir(path.to_path_buf())
        } else if path.is_file() {
            Layout::Tar(path.to_path_buf())
        } else {
            return Err(ImportError::ImagePullFailed(format!(
                "OCI archive {} does not exist",
                path.display()
            )));
        };

        let index: oci_spec::image::ImageIndex = layout.read_json("index.json")?;
        let wanted = architecture.unwrap_or_else(|| host_architecture());
        let manifests = index.manifests();
        let entry = manifests
            .iter()
            .find(|m| {
                m.platform()
                    .as_ref()
                    .is_some_and(|p| p.architecture().to_string() == wanted)
            })
            .or_else(|| manifests.first())
            .ok_or_else(|| ImportError::ImagePullFailed("No manifests in index.json".into()))?;

        let manifest: oci_spec::image::ImageManifest =
            layout.read_json(&blob_name(&entry.digest().to_string())?)?;
        let config: oci_spec::image::ImageConfiguration =
            layout.read_json(&blob_name(&manifest.config().digest().to_string())?)?;
        check_architecture(&config, architecture)?;

        let layers = manifest
            .layers()
            .iter()
            .map(|layer| LayerBlob {
                digest: layer.digest().to_string(),
                media_type: layer.media_type().to_string(),
                size: layer.size() as i64,
            })
            .collect();

        Ok(Self {
            layout,
            layers,
            env: config_env(&config),
        })
    }
}

impl ImageSource for OciArchiveSource {
    fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    fn open_layer(&self, layer: &LayerBlob) -> ImportResult<BoxedReader> {
        self.layout.open(&blob_name(&layer.digest)?)
    }

    fn env(&self) -> &[String] {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use importer_shared::ErrorKind;

    #[test]
    fn test_parse_docker_reference() {
        let reference = ImageReference::parse("docker://quay.io/kubevirt/cirros:latest")
            .expect("Should parse docker reference");
        match reference {
            ImageReference::Docker(r) => {
                assert_eq!(r.registry(), "quay.io");
                assert_eq!(r.repository(), "kubevirt/cirros");
                assert_eq!(r.tag(), Some("latest"));
            }
            other => panic!("unexpected reference {:?}", other),
        }
    }

    #[test]
    fn test_parse_oci_archive_reference() {
        match ImageReference::parse("oci-archive:/images/disk.tar").unwrap() {
            ImageReference::OciArchive(path) => assert_eq!(path, PathBuf::from("/images/disk.tar")),
            other => panic!("unexpected reference {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        for name in ["quay.io/kubevirt/cirros", "ftp://x/y", "docker:quay.io/a", "oci-archive:"] {
            let err = ImageReference::parse(name).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{}", name);
        }
    }

    #[test]
    fn test_blob_name() {
        assert_eq!(blob_name("sha256:abcd").unwrap(), "blobs/sha256/abcd");
        assert!(blob_name("abcd").is_err());
        assert!(blob_name("sha256:../../etc").is_err());
    }

    #[test]
    fn test_registry_config_auth() {
        let mut options = ImporterOptions::new(crate::SourceScheme::Registry, "docker://a/b");
        assert!(matches!(RegistryConfig::from_options(&options).auth(), RegistryAuth::Anonymous));
        options.access_key = "user".into();
        options.secret_key = "pw".into();
        options.registry_arch = Some("arm64".into());
        let config = RegistryConfig::from_options(&options);
        assert!(matches!(config.auth(), RegistryAuth::Basic(u, p) if u == "user" && p == "pw"));
        assert_eq!(config.wanted_architecture(), "arm64");
    }

    #[test]
    fn test_open_tar_member() {
        let dir = tempfile::TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("layout.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for (name, data) in [("./oci-layout", &b"{}"[..]), ("./blobs/sha256/ab", &b"blob"[..])] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.finish().unwrap();
        drop(builder);

        let mut out = String::new();
        open_tar_member(&path, "blobs/sha256/ab")
            .expect("Should find member")
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "blob");
        assert!(open_tar_member(&path, "index.json").is_err());
    }
}
