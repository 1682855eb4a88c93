//! Command-line arguments. Every flag falls back to the environment variable
//! the importer pod is configured with.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use clap::builder::BoolishValueParser;
use importer::options::VddkOptions;
use importer::sources::http::extra_headers_from_env;
use importer::{ContentType, ImportLayout, ImporterOptions, SourceScheme, VolumeMode};
use importer_shared::constants::{envs, paths};

/// Import a virtual machine disk image into a volume
#[derive(Parser, Debug)]
#[command(name = "importer", author, version, about)]
pub struct Cli {
    /// Where the image comes from: http, s3, gcs, upload, async-upload,
    /// registry, imageio, vddk or blank
    #[arg(long, env = envs::SOURCE, default_value = "http")]
    pub source: SourceScheme,

    /// Image URL, bucket URL, registry reference or vSphere endpoint
    #[arg(long, env = envs::ENDPOINT, default_value = "")]
    pub endpoint: String,

    /// kubevirt (a disk image) or archive (a tar of files)
    #[arg(long, env = envs::CONTENT_TYPE, default_value = "kubevirt")]
    pub content_type: ContentType,

    /// Requested image size, as a Kubernetes quantity
    #[arg(long, env = envs::IMAGE_SIZE, default_value = "")]
    pub image_size: String,

    #[arg(long, env = envs::ACCESS_KEY_ID, default_value = "", hide_env_values = true)]
    pub access_key: String,

    #[arg(long, env = envs::SECRET_KEY, default_value = "", hide_env_values = true)]
    pub secret_key: String,

    /// Directory of CA certificates for the endpoint
    #[arg(long, env = envs::CERT_DIR)]
    pub cert_dir: Option<PathBuf>,

    /// Directory of proxy CA bundles
    #[arg(long, env = envs::PROXY_CERT_DIR, default_value = paths::PROXY_CERT_DIR)]
    pub proxy_cert_dir: PathBuf,

    /// Skip TLS verification of the endpoint
    #[arg(
        long,
        env = envs::INSECURE_TLS,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub insecure_tls: bool,

    /// oVirt disk ID (imageio)
    #[arg(long, env = envs::DISK_ID, default_value = "")]
    pub disk_id: String,

    /// VM UUID (vddk)
    #[arg(long, env = envs::UUID, default_value = "")]
    pub uuid: String,

    /// Datastore path of the disk to copy (vddk)
    #[arg(long, env = envs::BACKING_FILE, default_value = "")]
    pub backing_file: String,

    /// SHA-1 thumbprint of the vSphere certificate (vddk)
    #[arg(long, env = envs::THUMBPRINT, default_value = "")]
    pub thumbprint: String,

    #[arg(long, env = envs::CURRENT_CHECKPOINT, default_value = "")]
    pub current_checkpoint: String,

    #[arg(long, env = envs::PREVIOUS_CHECKPOINT, default_value = "")]
    pub previous_checkpoint: String,

    #[arg(
        long,
        env = envs::FINAL_CHECKPOINT,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub final_checkpoint: bool,

    /// Directory holding a vddk-config-file
    #[arg(long, env = envs::VDDK_CONFIG)]
    pub vddk_config_dir: Option<PathBuf>,

    /// `algorithm:hash` the payload must match
    #[arg(long, env = envs::CHECKSUM)]
    pub checksum: Option<String>,

    /// Platform architecture to pick from a registry image index
    #[arg(long, env = envs::REGISTRY_IMAGE_ARCHITECTURE)]
    pub registry_arch: Option<String>,

    #[arg(long, env = envs::PULL_METHOD, default_value = "")]
    pub pull_method: String,

    /// Service account key for GCS
    #[arg(long, env = envs::GOOGLE_CREDENTIALS)]
    pub google_credentials: Option<PathBuf>,

    /// Fraction of the volume reserved for filesystem overhead
    #[arg(long, env = envs::FILESYSTEM_OVERHEAD, default_value_t = 0.0)]
    pub filesystem_overhead: f64,

    #[arg(
        long,
        env = envs::PREALLOCATION,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub preallocation: bool,

    #[arg(long, env = envs::VOLUME_MODE, default_value = "filesystem")]
    pub volume_mode: VolumeMode,

    #[arg(long, env = envs::DATA_DIR, default_value = paths::DATA_DIR)]
    pub data_dir: PathBuf,

    /// Destination image; defaults to disk.img in the data directory, or
    /// the block device in block mode
    #[arg(long, env = envs::WRITE_PATH)]
    pub write_path: Option<PathBuf>,

    #[arg(long, env = envs::SCRATCH_DIR, default_value = paths::SCRATCH_DIR)]
    pub scratch_dir: PathBuf,

    /// Directory of extra HTTP header files mounted from a secret
    #[arg(long, env = envs::SECRET_EXTRA_HEADERS_DIR, default_value = paths::EXTRA_HEADERS_DIR)]
    pub extra_headers_dir: PathBuf,

    /// Label of the progress counter
    #[arg(long, env = envs::OWNER_UID, default_value = "")]
    pub owner_uid: String,

    #[arg(long, env = envs::TERMINATION_MESSAGE_PATH, default_value = paths::TERMINATION_LOG)]
    pub termination_message_path: PathBuf,

    /// Write logs to daily-rotated files here instead of stderr
    #[arg(long, env = envs::LOG_DIR)]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    pub fn layout(&self) -> ImportLayout {
        match self.volume_mode {
            VolumeMode::Block => ImportLayout {
                data_file: self
                    .write_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(paths::BLOCK_DEVICE)),
                data_dir: None,
                scratch_dir: Some(self.scratch_dir.clone()),
            },
            VolumeMode::Filesystem => {
                let mut layout = ImportLayout::in_dir(&self.data_dir).with_scratch(&self.scratch_dir);
                if let Some(path) = &self.write_path {
                    layout.data_file = path.clone();
                }
                layout
            }
        }
    }

    pub fn to_options(&self) -> ImporterOptions {
        ImporterOptions {
            source: self.source,
            endpoint: self.endpoint.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            cert_dir: self.cert_dir.clone(),
            proxy_cert_dir: Some(self.proxy_cert_dir.clone()),
            insecure_tls: self.insecure_tls,
            content_type: self.content_type,
            image_size: self.image_size.clone(),
            filesystem_overhead: self.filesystem_overhead,
            preallocation: self.preallocation,
            volume_mode: self.volume_mode,
            layout: self.layout(),
            disk_id: self.disk_id.clone(),
            vddk: VddkOptions {
                uuid: self.uuid.clone(),
                backing_file: self.backing_file.clone(),
                thumbprint: self.thumbprint.clone(),
                current_checkpoint: self.current_checkpoint.clone(),
                previous_checkpoint: self.previous_checkpoint.clone(),
                final_checkpoint: self.final_checkpoint,
                config_dir: self.vddk_config_dir.clone(),
            },
            checksum: self.checksum.clone().filter(|c| !c.is_empty()),
            registry_arch: self.registry_arch.clone().filter(|a| !a.is_empty()),
            pull_method: self.pull_method.clone(),
            google_credentials: self.google_credentials.clone(),
            extra_headers: extra_headers_from_env(),
            extra_headers_dir: self.extra_headers_dir.clone(),
            owner_uid: self.owner_uid.clone(),
            termination_message_path: self.termination_message_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["importer"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("Should parse arguments")
    }

    #[test]
    fn test_filesystem_layout() {
        let cli = parse(&["--data-dir", "/mnt/data", "--scratch-dir", "/mnt/scratch"]);
        let layout = cli.layout();
        assert_eq!(layout.data_file, PathBuf::from("/mnt/data/disk.img"));
        assert_eq!(layout.data_dir, Some(PathBuf::from("/mnt/data")));
        assert_eq!(layout.scratch_dir, Some(PathBuf::from("/mnt/scratch")));
    }

    #[test]
    fn test_block_layout() {
        let cli = parse(&["--volume-mode", "block"]);
        let layout = cli.layout();
        assert_eq!(layout.data_file, PathBuf::from(paths::BLOCK_DEVICE));
        assert!(layout.data_dir.is_none());
    }

    #[test]
    fn test_write_path_overrides_data_file() {
        let cli = parse(&["--data-dir", "/d", "--write-path", "/d/other.img"]);
        assert_eq!(cli.layout().data_file, PathBuf::from("/d/other.img"));
    }

    #[test]
    fn test_boolish_flags() {
        let cli = parse(&["--preallocation", "--insecure-tls", "false"]);
        assert!(cli.preallocation);
        assert!(!cli.insecure_tls);
    }

    #[test]
    fn test_vddk_options() {
        let cli = parse(&[
            "--source",
            "vddk",
            "--uuid",
            "42",
            "--backing-file",
            "[ds] vm/vm.vmdk",
            "--current-checkpoint",
            "snapshot-2",
            "--final-checkpoint",
            "true",
        ]);
        let options = cli.to_options();
        assert_eq!(options.source, SourceScheme::Vddk);
        assert_eq!(options.vddk.backing_file, "[ds] vm/vm.vmdk");
        assert_eq!(options.vddk.current_checkpoint, "snapshot-2");
        assert!(options.vddk.final_checkpoint);
    }

    #[test]
    fn test_empty_checksum_is_none() {
        let cli = parse(&["--checksum", ""]);
        assert!(cli.to_options().checksum.is_none());
    }

    #[test]
    fn test_unknown_source_rejected() {
        assert!(Cli::try_parse_from(["importer", "--source", "ftp"]).is_err());
    }
}
