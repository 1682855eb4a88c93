//! Import configuration.
//!
//! [`ImporterOptions`] carries everything a single import needs. The binary
//! fills it from flags and environment variables; tests build it directly.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use importer_shared::constants::paths;
use importer_shared::{ImportLayout, VolumeMode};
use serde::{Deserialize, Serialize};

use crate::sources::SourceScheme;

/// What the payload is expected to be.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    /// A VM disk image, possibly compressed or wrapped in tar.
    #[default]
    Kubevirt,
    /// A tar archive unpacked into the data directory.
    Archive,
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "kubevirt" => Ok(ContentType::Kubevirt),
            "archive" => Ok(ContentType::Archive),
            other => Err(format!("unknown content type '{}'", other)),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Kubevirt => f.write_str("kubevirt"),
            ContentType::Archive => f.write_str("archive"),
        }
    }
}

/// VMware-specific parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VddkOptions {
    /// VM instance UUID
    pub uuid: String,
    /// Datastore path of the disk, e.g. `[datastore1] vm/vm.vmdk`
    pub backing_file: String,
    /// SHA-1 thumbprint of the host certificate
    pub thumbprint: String,
    /// Snapshot to copy from
    pub current_checkpoint: String,
    /// Snapshot name or change ID the previous copy ended at
    pub previous_checkpoint: String,
    /// Last stage of a warm migration
    pub final_checkpoint: bool,
    /// Directory holding a `vddk-config-file`
    pub config_dir: Option<PathBuf>,
}

/// Everything one import run needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImporterOptions {
    pub source: SourceScheme,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub cert_dir: Option<PathBuf>,
    pub proxy_cert_dir: Option<PathBuf>,
    pub insecure_tls: bool,
    pub content_type: ContentType,

    /// Requested size as a Kubernetes quantity; empty means "as large as the image".
    pub image_size: String,
    pub filesystem_overhead: f64,
    pub preallocation: bool,
    pub volume_mode: VolumeMode,
    pub layout: ImportLayout,

    /// oVirt disk ID (imageio)
    pub disk_id: String,
    pub vddk: VddkOptions,

    /// `algorithm:hash` to verify the payload against
    pub checksum: Option<String>,
    pub registry_arch: Option<String>,
    pub pull_method: String,

    /// Service account key file for GCS
    pub google_credentials: Option<PathBuf>,

    /// Extra HTTP headers, `Name: value`
    pub extra_headers: Vec<String>,
    /// Directory of header files mounted from a secret
    pub extra_headers_dir: PathBuf,

    pub owner_uid: String,
    pub termination_message_path: PathBuf,
}

impl Default for ImporterOptions {
    fn default() -> Self {
        Self {
            source: SourceScheme::Http,
            endpoint: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            cert_dir: None,
            proxy_cert_dir: Some(PathBuf::from(paths::PROXY_CERT_DIR)),
            insecure_tls: false,
            content_type: ContentType::Kubevirt,
            image_size: String::new(),
            filesystem_overhead: 0.0,
            preallocation: false,
            volume_mode: VolumeMode::Filesystem,
            layout: ImportLayout::standard(VolumeMode::Filesystem),
            disk_id: String::new(),
            vddk: VddkOptions::default(),
            checksum: None,
            registry_arch: None,
            pull_method: String::new(),
            google_credentials: None,
            extra_headers: Vec::new(),
            extra_headers_dir: PathBuf::from(paths::EXTRA_HEADERS_DIR),
            owner_uid: String::new(),
            termination_message_path: PathBuf::from(paths::TERMINATION_LOG),
        }
    }
}

impl ImporterOptions {
    /// Options for `source` at `endpoint` with everything else defaulted.
    pub fn new(source: SourceScheme, endpoint: impl Into<String>) -> Self {
        Self {
            source,
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn is_block_destination(&self) -> bool {
        self.volume_mode == VolumeMode::Block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_parse() {
        assert_eq!("".parse::<ContentType>().unwrap(), ContentType::Kubevirt);
        assert_eq!("kubevirt".parse::<ContentType>().unwrap(), ContentType::Kubevirt);
        assert_eq!("archive".parse::<ContentType>().unwrap(), ContentType::Archive);
        assert!("zip".parse::<ContentType>().is_err());
    }

    #[test]
    fn test_defaults_point_at_pod_mounts() {
        let opts = ImporterOptions::new(SourceScheme::Http, "http://x/disk.img");
        assert_eq!(opts.layout.data_file, PathBuf::from("/data/disk.img"));
        assert_eq!(opts.extra_headers_dir, PathBuf::from("/extraheaders"));
        assert!(!opts.is_block_destination());
    }
}
