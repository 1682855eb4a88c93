//! Data sources.
//!
//! Every origin the importer can read from implements [`DataSource`]. The
//! [`DataProcessor`](crate::DataProcessor) calls `info`, then one of the
//! transfer operations, then asks for a URL to convert from, and finally
//! closes the source. Calls never overlap.

pub mod gcs;
pub mod http;
pub mod imageio;
pub mod registry;
pub mod s3;
mod stream;
pub mod upload;
pub mod vddk;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use importer_shared::{ImportError, ImportResult, TerminationMessage};
use serde::{Deserialize, Serialize};

use crate::options::ImporterOptions;
use crate::phase::ProcessingPhase;
use crate::progress::{ProgressCounter, ProgressMetrics};
use crate::qemu::{QemuImg, QemuOperations};
use crate::readers::BoxedReader;

pub use gcs::GcsSource;
pub use http::HttpSource;
pub use imageio::{ImageioSource, OvirtConnector, RestOvirtConnector};
pub use registry::RegistrySource;
pub use s3::S3Source;
pub use stream::StreamSource;
pub use upload::{AsyncUploadSource, UploadSource};
pub use vddk::{NbdConnector, SocketNbdConnector, SoapVmwareConnector, VddkSource, VmwareConnector};

/// One origin of image data.
pub trait DataSource: Send {
    /// Inspect the data and choose the next phase.
    fn info(&mut self) -> ImportResult<ProcessingPhase>;

    /// Write the data into the directory `path` (scratch space, or the data
    /// directory for archives).
    fn transfer(&mut self, path: &Path) -> ImportResult<ProcessingPhase>;

    /// Write the data to the destination image `path`.
    fn transfer_file(&mut self, path: &Path) -> ImportResult<ProcessingPhase>;

    /// Where the converter should read from, once known.
    fn url(&self) -> Option<String>;

    /// Release connections, readers and helpers. Safe to call repeatedly.
    fn close(&mut self) -> ImportResult<()>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Phase to re-enter after a pause.
    fn resume_phase(&self) -> Option<ProcessingPhase> {
        None
    }

    /// Extra details for the termination message.
    fn termination_message(&self) -> Option<TerminationMessage> {
        None
    }

    /// Handle that releases helpers outside this process (nbdkit) from
    /// another thread, while the phase loop still owns the source.
    fn close_handle(&self) -> Option<CloseHandle> {
        None
    }
}

/// Thread-safe closer for what a source holds outside the process.
#[derive(Clone)]
pub struct CloseHandle(Arc<dyn Fn() + Send + Sync>);

impl CloseHandle {
    pub fn new(close: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(close))
    }

    /// Run the closer. It must tolerate being called more than once.
    pub fn close(&self) {
        (self.0)()
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CloseHandle")
    }
}

/// Optional behaviour a source supports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The source can pause and be resumed at [`DataSource::resume_phase`].
    pub supports_resume: bool,
    /// [`DataSource::termination_message`] carries information.
    pub produces_termination_info: bool,
}

/// Where the image comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceScheme {
    Http,
    S3,
    Gcs,
    Upload,
    AsyncUpload,
    Registry,
    Imageio,
    Vddk,
    /// No source: create an empty image.
    Blank,
}

impl SourceScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceScheme::Http => "http",
            SourceScheme::S3 => "s3",
            SourceScheme::Gcs => "gcs",
            SourceScheme::Upload => "upload",
            SourceScheme::AsyncUpload => "async-upload",
            SourceScheme::Registry => "registry",
            SourceScheme::Imageio => "imageio",
            SourceScheme::Vddk => "vddk",
            SourceScheme::Blank => "blank",
        }
    }
}

impl FromStr for SourceScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "http" => Ok(SourceScheme::Http),
            "s3" => Ok(SourceScheme::S3),
            "gcs" => Ok(SourceScheme::Gcs),
            "upload" => Ok(SourceScheme::Upload),
            "async-upload" => Ok(SourceScheme::AsyncUpload),
            "registry" => Ok(SourceScheme::Registry),
            "imageio" => Ok(SourceScheme::Imageio),
            "vddk" => Ok(SourceScheme::Vddk),
            "blank" | "none" => Ok(SourceScheme::Blank),
            other => Err(format!("unknown source '{}'", other)),
        }
    }
}

impl fmt::Display for SourceScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External collaborators handed to every source.
///
/// Production code uses [`Adapters::system`]; tests swap in fakes.
#[derive(Clone)]
pub struct Adapters {
    pub qemu: Arc<dyn QemuOperations>,
    pub nbd: Arc<dyn NbdConnector>,
    pub vmware: Arc<dyn VmwareConnector>,
    pub ovirt: Arc<dyn OvirtConnector>,
    pub progress: ProgressMetrics,
}

impl Adapters {
    /// Real implementations. qemu-img conversion progress feeds the counter
    /// of `owner_uid`.
    pub fn system(progress: ProgressMetrics, owner_uid: &str) -> Self {
        Self {
            qemu: Arc::new(QemuImg::new().with_progress(progress.counter(owner_uid))),
            nbd: Arc::new(SocketNbdConnector),
            vmware: Arc::new(SoapVmwareConnector),
            ovirt: Arc::new(RestOvirtConnector),
            progress,
        }
    }

    /// Progress counter for `owner_uid`, if one is configured.
    pub fn counter(&self, owner_uid: &str) -> Option<ProgressCounter> {
        if owner_uid.is_empty() {
            return None;
        }
        Some(self.progress.counter(owner_uid))
    }
}

/// Build the source named by `options.source`.
///
/// Upload sources read the request body from `upload` when given, otherwise
/// from the file named by the endpoint, or stdin when the endpoint is empty
/// or `-`.
pub fn build_source(
    options: &ImporterOptions,
    adapters: &Adapters,
    upload: Option<BoxedReader>,
) -> ImportResult<Box<dyn DataSource>> {
    tracing::info!(source = %options.source, "Creating data source");
    let source: Box<dyn DataSource> = match options.source {
        SourceScheme::Http => Box::new(HttpSource::new(options, adapters)?),
        SourceScheme::S3 => Box::new(S3Source::new(options, adapters)?),
        SourceScheme::Gcs => Box::new(GcsSource::new(options, adapters)?),
        SourceScheme::Upload => {
            let body = upload.map_or_else(|| upload::open_upload_stream(&options.endpoint), Ok)?;
            Box::new(UploadSource::new(body, options, adapters))
        }
        SourceScheme::AsyncUpload => {
            let body = upload.map_or_else(|| upload::open_upload_stream(&options.endpoint), Ok)?;
            Box::new(AsyncUploadSource::new(body, options, adapters))
        }
        SourceScheme::Registry => Box::new(RegistrySource::new(options, adapters)?),
        SourceScheme::Imageio => Box::new(ImageioSource::new(options, adapters)?),
        SourceScheme::Vddk => Box::new(VddkSource::new(options, adapters)?),
        SourceScheme::Blank => {
            return Err(ImportError::InvalidArgument(
                "blank images have no data source".into(),
            ));
        }
    };
    Ok(source)
}
