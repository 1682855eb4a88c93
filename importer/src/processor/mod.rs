//! The import state machine.
//!
//! [`DataProcessor`] owns one [`DataSource`] and drives it phase by phase
//! until the image is complete or the source asks to pause. The source picks
//! the transfer path during `Info`; conversion, resizing and preallocation
//! are run here through the QEMU adapter.

pub mod space;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use importer_shared::{ImportError, ImportResult, TerminationMessage};

use crate::options::ImporterOptions;
use crate::phase::ProcessingPhase;
use crate::qemu::QemuOperations;
use crate::sink::is_block_device;
use crate::sources::{CloseHandle, DataSource};

pub use space::{
    available_space, block_device_size, clean_dir, parse_quantity, usable_space,
};

/// Destination and sizing parameters of one import.
#[derive(Clone, Debug, Default)]
pub struct ProcessorConfig {
    /// Raw image path, or the block device itself
    pub data_file: PathBuf,
    /// Directory holding `data_file`; absent for block destinations
    pub data_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    /// Kubernetes quantity; empty leaves the image at its own size
    pub requested_size: String,
    pub filesystem_overhead: f64,
    pub preallocation: bool,
}

impl ProcessorConfig {
    pub fn from_options(options: &ImporterOptions) -> Self {
        Self {
            data_file: options.layout.data_file.clone(),
            data_dir: options.layout.data_dir.clone(),
            scratch_dir: options.layout.scratch_dir.clone(),
            requested_size: options.image_size.clone(),
            filesystem_overhead: options.filesystem_overhead,
            preallocation: options.preallocation,
        }
    }
}

/// Drives a [`DataSource`] through the import phases.
pub struct DataProcessor {
    phase: ProcessingPhase,
    source: Option<Box<dyn DataSource>>,
    qemu: Arc<dyn QemuOperations>,
    config: ProcessorConfig,
    /// Space the image may occupy, fixed at construction
    available_space: u64,
    preallocation_applied: bool,
}

impl DataProcessor {
    pub fn new(
        source: Box<dyn DataSource>,
        config: ProcessorConfig,
        qemu: Arc<dyn QemuOperations>,
    ) -> ImportResult<Self> {
        Self::build(Some(source), config, qemu)
    }

    /// A processor without a source, for creating blank images.
    pub fn blank(config: ProcessorConfig, qemu: Arc<dyn QemuOperations>) -> ImportResult<Self> {
        Self::build(None, config, qemu)
    }

    fn build(
        source: Option<Box<dyn DataSource>>,
        config: ProcessorConfig,
        qemu: Arc<dyn QemuOperations>,
    ) -> ImportResult<Self> {
        let available_space = calculate_target_size(&config)?;
        Ok(Self {
            phase: ProcessingPhase::Info,
            source,
            qemu,
            config,
            available_space,
            preallocation_applied: false,
        })
    }

    pub fn phase(&self) -> ProcessingPhase {
        self.phase
    }

    pub fn available_space(&self) -> u64 {
        self.available_space
    }

    pub fn preallocation_applied(&self) -> bool {
        self.preallocation_applied
    }

    /// Clean the scratch and data directories, then run the phase loop.
    /// Scratch space is cleaned again on the way out, whatever the outcome.
    pub fn process_data(&mut self) -> ImportResult<ProcessingPhase> {
        let scratch = self
            .config
            .scratch_dir
            .clone()
            .filter(|dir| available_space(dir).is_some_and(|size| size > 0));
        if let Some(dir) = &scratch {
            clean_dir(dir).map_err(|e| e.context("Failure cleaning up temporary scratch space"))?;
        }
        if !is_block_device(&self.config.data_file)
            && let Some(dir) = self
                .config
                .data_dir
                .as_deref()
                .filter(|dir| available_space(dir).is_some_and(|size| size > 0))
        {
            clean_dir(dir).map_err(|e| e.context("Failure cleaning up target space"))?;
        }

        let result = self.process_data_with_pause();

        if let Some(dir) = &scratch
            && let Err(e) = clean_dir(dir)
        {
            tracing::warn!("Failed to clean scratch space {}: {}", dir.display(), e);
        }
        result
    }

    /// Re-enter the loop of a paused, resumable source at the phase it names.
    pub fn process_data_resume(&mut self) -> ImportResult<ProcessingPhase> {
        let resume = self
            .source
            .as_ref()
            .filter(|source| source.capabilities().supports_resume)
            .and_then(|source| source.resume_phase())
            .ok_or(ImportError::NotResumable)?;
        tracing::info!("Resuming processing at phase {}", resume);
        self.phase = resume;
        self.process_data_with_pause()
    }

    /// Run phases until `Complete` or `Pause`.
    pub fn process_data_with_pause(&mut self) -> ImportResult<ProcessingPhase> {
        while !self.phase.is_terminal() {
            let phase = self.phase;
            let next = self.run_phase(phase).inspect_err(|e| {
                tracing::error!(phase = %phase, "{}", e);
            })?;
            tracing::info!("New phase: {}", next);
            self.phase = next;
        }
        Ok(self.phase)
    }

    fn run_phase(&mut self, phase: ProcessingPhase) -> ImportResult<ProcessingPhase> {
        match phase {
            ProcessingPhase::Info => self
                .source_mut()?
                .info()
                .map_err(|e| e.context("Unable to obtain information about data source")),
            ProcessingPhase::TransferScratch => {
                let dir = self
                    .config
                    .scratch_dir
                    .clone()
                    .ok_or(ImportError::RequiresScratchSpace)?;
                match self.source_mut()?.transfer(&dir) {
                    Err(ImportError::InvalidPath) => Err(ImportError::RequiresScratchSpace),
                    result => result
                        .map_err(|e| e.context("Unable to transfer source data to scratch space")),
                }
            }
            ProcessingPhase::TransferDataDir => {
                let dir = self.config.data_dir.clone().ok_or(ImportError::InvalidPath);
                dir.and_then(|dir| self.source_mut()?.transfer(&dir))
                    .map_err(|e| e.context("Unable to transfer source data to target directory"))
            }
            ProcessingPhase::TransferDataFile => {
                let file = self.config.data_file.clone();
                self.source_mut()?
                    .transfer_file(&file)
                    .map_err(|e| e.context("Unable to transfer source data to target file"))
            }
            ProcessingPhase::ValidatePause => {
                let url = self.source_url()?;
                self.validate(&url)?;
                Ok(ProcessingPhase::Pause)
            }
            ProcessingPhase::Convert => self
                .source_url()
                .and_then(|url| self.convert(&url))
                .map_err(|e| e.context("Unable to convert source data to target format")),
            ProcessingPhase::Resize => self
                .resize()
                .map_err(|e| e.context("Unable to resize disk image to requested size")),
            ProcessingPhase::Preallocate => self
                .preallocate()
                .map_err(|e| e.context("Unable to preallocate disk image")),
            other => Err(ImportError::UnknownPhase(other.to_string())),
        }
    }

    fn source_mut(&mut self) -> ImportResult<&mut Box<dyn DataSource>> {
        self.source
            .as_mut()
            .ok_or_else(|| ImportError::Internal("processor has no data source".into()))
    }

    fn source_url(&self) -> ImportResult<String> {
        self.source
            .as_ref()
            .and_then(|source| source.url())
            .ok_or_else(|| ImportError::Internal("data source did not provide a URL".into()))
    }

    fn validate(&self, url: &str) -> ImportResult<()> {
        tracing::info!("Validating image");
        self.qemu
            .validate(url, self.available_space, self.config.filesystem_overhead)
            .map(|_| ())
    }

    fn convert(&mut self, url: &str) -> ImportResult<ProcessingPhase> {
        self.validate(url)?;
        tracing::info!("Converting to Raw");
        self.qemu
            .convert_to_raw_stream(url, &self.config.data_file, self.config.preallocation)
            .map_err(|e| e.context("Conversion to Raw failed"))?;
        self.preallocation_applied = self.config.preallocation;
        Ok(ProcessingPhase::Resize)
    }

    fn resize(&mut self) -> ImportResult<ProcessingPhase> {
        let data_file = self.config.data_file.clone();
        let is_block = is_block_device(&data_file);
        if !self.config.requested_size.is_empty() && !is_block {
            tracing::info!("Resizing image");
            self.resize_image(&data_file)
                .map_err(|e| e.context("Resize of image failed"))?;
        }
        if !is_block
            && data_file.exists()
            && let Err(e) =
                std::fs::set_permissions(&data_file, std::fs::Permissions::from_mode(0o660))
        {
            tracing::warn!("Unable to change permissions of target file: {}", e);
        }
        if self.config.preallocation && !self.preallocation_applied {
            return Ok(ProcessingPhase::Preallocate);
        }
        Ok(ProcessingPhase::Complete)
    }

    /// Grow the image to the requested size, bounded by the usable space.
    /// Returns whether a resize happened.
    fn resize_image(&mut self, data_file: &Path) -> ImportResult<bool> {
        let info = self.qemu.info(&data_file.to_string_lossy())?;
        let requested = parse_quantity(&self.config.requested_size)?;
        let usable = usable_space(self.config.filesystem_overhead, self.available_space);
        let target = requested.min(usable);
        if target < requested {
            tracing::warn!(
                "Available space less than requested size, resizing image to available space {}",
                target
            );
        }
        if info.virtual_size == target {
            tracing::info!(
                "No need to resize image. Requested size: {}, Image size: {}",
                self.config.requested_size,
                info.virtual_size
            );
            return Ok(false);
        }
        tracing::info!("Expanding image size to: {}", target);
        self.qemu
            .resize(data_file, target, self.config.preallocation)?;
        if self.config.preallocation {
            self.preallocation_applied = true;
        }
        Ok(true)
    }

    fn preallocate(&mut self) -> ImportResult<ProcessingPhase> {
        tracing::info!("Preallocating {}", self.config.data_file.display());
        self.qemu.preallocate(&self.config.data_file)?;
        self.preallocation_applied = true;
        Ok(ProcessingPhase::Complete)
    }

    /// Create an empty raw image of the requested size, bounded by the
    /// usable space. Block destinations are left as they are.
    pub fn create_blank_image(&mut self) -> ImportResult<()> {
        let data_file = self.config.data_file.clone();
        if is_block_device(&data_file) {
            tracing::info!("Destination is a block device, nothing to create");
            self.phase = ProcessingPhase::Complete;
            return Ok(());
        }
        let usable = usable_space(self.config.filesystem_overhead, self.available_space);
        let size = if self.config.requested_size.is_empty() {
            usable
        } else {
            parse_quantity(&self.config.requested_size)?.min(usable)
        };
        if let Some(dir) = &self.config.data_dir {
            clean_dir(dir).map_err(|e| e.context("Failure cleaning up target space"))?;
        }
        self.qemu
            .create_blank_image(&data_file, size, self.config.preallocation)
            .map_err(|e| e.context("Unable to create blank image"))?;
        self.preallocation_applied = self.config.preallocation;
        self.phase = ProcessingPhase::Complete;
        Ok(())
    }

    /// What the controller should learn once the run ends.
    pub fn termination_message(&self) -> TerminationMessage {
        let mut message = TerminationMessage {
            preallocation_applied: Some(self.preallocation_applied),
            ..Default::default()
        };
        if let Some(from_source) = self
            .source
            .as_ref()
            .filter(|source| source.capabilities().produces_termination_info)
            .and_then(|source| source.termination_message())
        {
            message.merge(from_source);
        }
        message
    }

    /// Close the source. Safe to call more than once.
    /// Closer the caller can run from another thread, e.g. a signal handler,
    /// while a phase is in progress.
    pub fn close_handle(&self) -> Option<CloseHandle> {
        self.source.as_ref().and_then(|source| source.close_handle())
    }

    pub fn close(&mut self) -> ImportResult<()> {
        match self.source.as_mut() {
            Some(source) => source.close(),
            None => Ok(()),
        }
    }
}

impl Drop for DataProcessor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close data source: {}", e);
        }
    }
}

/// Space the image may occupy: the device size for block destinations,
/// otherwise the free space in the data directory, capped by the requested
/// size.
fn calculate_target_size(config: &ProcessorConfig) -> ImportResult<u64> {
    tracing::debug!("Calculating available size");
    let size = match block_device_size(&config.data_file) {
        Some(size) => {
            tracing::debug!("Checking out block volume size");
            size
        }
        None => {
            tracing::debug!("Checking out file system volume size");
            config
                .data_dir
                .as_deref()
                .and_then(available_space)
                .unwrap_or(0)
        }
    };
    let target = if config.requested_size.is_empty() {
        size
    } else {
        size.min(parse_quantity(&config.requested_size)?)
    };
    tracing::debug!("Target size {}", target);
    Ok(target)
}
