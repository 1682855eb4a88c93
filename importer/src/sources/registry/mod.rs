//! Container disk images.
//!
//! The VM disk lives as a single file under `disk/` inside a container
//! image. The file is extracted into scratch space and converted from there.

mod extract;
mod transport;

use std::path::{Path, PathBuf};

use importer_shared::constants::paths::CONTAINER_DISK_DIR;
use importer_shared::{ImportError, ImportResult, TerminationMessage};

pub use extract::copy_image_files;
pub use transport::{
    DockerImageSource, ImageReference, ImageSource, LayerBlob, OciArchiveSource, RegistryConfig,
    host_architecture, open_image_source,
};

use super::{Adapters, Capabilities, DataSource};
use crate::labels::envs_to_labels;
use crate::options::ImporterOptions;
use crate::phase::ProcessingPhase;
use crate::processor::available_space;

/// Image pulled from a registry or an OCI archive.
///
/// Phases: Info → TransferScratch → Convert.
pub struct RegistrySource {
    reference: ImageReference,
    config: RegistryConfig,
    preallocation: bool,
    /// Extracted disk file in scratch space
    url: Option<String>,
    env: Vec<String>,
}

impl RegistrySource {
    pub fn new(options: &ImporterOptions, _adapters: &Adapters) -> ImportResult<Self> {
        Ok(Self {
            reference: ImageReference::parse(&options.endpoint)?,
            config: RegistryConfig::from_options(options),
            preallocation: options.preallocation,
            url: None,
            env: Vec::new(),
        })
    }
}

impl DataSource for RegistrySource {
    fn info(&mut self) -> ImportResult<ProcessingPhase> {
        Ok(ProcessingPhase::TransferScratch)
    }

    fn transfer(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        if available_space(path).unwrap_or(0) == 0 {
            return Err(ImportError::InvalidPath);
        }
        let image_dir = path.join(CONTAINER_DISK_DIR);

        tracing::info!("Copying registry image to scratch space.");
        let source = open_image_source(&self.reference, &self.config).map_err(|e| match e {
            ImportError::ImagePullFailed(_) | ImportError::InvalidArgument(_) => e,
            other => ImportError::ImagePullFailed(other.to_string()),
        })?;
        let prefix = format!("{}/", CONTAINER_DISK_DIR);
        copy_image_files(source.as_ref(), path, &prefix, true, self.preallocation)
            .map_err(|e| e.context("Failed to read registry image"))?;

        let image_file = image_file_name(&image_dir).map_err(|e| e.context("Cannot locate image file"))?;
        let url = image_dir.join(image_file);
        tracing::info!("Successfully found file. VM disk image filename is {}", url.display());
        self.url = Some(url.to_string_lossy().into_owned());
        self.env = source.env().to_vec();
        Ok(ProcessingPhase::Convert)
    }

    fn transfer_file(&mut self, _path: &Path) -> ImportResult<ProcessingPhase> {
        Err(ImportError::Internal(
            "Transferfile should not be called".into(),
        ))
    }

    fn url(&self) -> Option<String> {
        self.url.clone()
    }

    fn close(&mut self) -> ImportResult<()> {
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resume: false,
            produces_termination_info: true,
        }
    }

    fn termination_message(&self) -> Option<TerminationMessage> {
        let labels = envs_to_labels(&self.env);
        Some(TerminationMessage {
            labels: (!labels.is_empty()).then_some(labels),
            ..Default::default()
        })
    }
}

/// Name of the single regular file in `dir`.
pub fn image_file_name(dir: &Path) -> ImportResult<String> {
    if !dir.exists() {
        return Err(ImportError::ImageFileNotFound(
            "image directory does not exist".into(),
        ));
    }
    let entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .and_then(|entries| entries.map(|e| e.map(|e| e.path())).collect())
        .map_err(|e| ImportError::from_io("image file does not exist in image directory", e))?;

    match entries.as_slice() {
        [] => Err(ImportError::ImageFileNotFound(
            "image file does not exist in image directory - directory is empty".into(),
        )),
        [entry] => {
            if entry.is_dir() {
                return Err(ImportError::Storage(
                    "image directory contains another directory".into(),
                ));
            }
            let name = entry
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.trim().is_empty() {
                return Err(ImportError::ImageFileNotFound("image file has no name".into()));
            }
            tracing::debug!("VM disk image filename is {}", name);
            Ok(name)
        }
        _ => Err(ImportError::Storage(
            "image directory contains more than one file".into(),
        )),
    }
}
