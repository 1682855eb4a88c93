//! Streaming virtual machine disk image importer.
//!
//! A [`DataProcessor`] drives a [`DataSource`] through the import phases
//! (`Info`, `Transfer*`, `Convert`, `Resize`, `Preallocate`) and leaves a raw
//! disk image at the destination. Sources exist for HTTP(S), S3, GCS, push
//! uploads, OCI registries, oVirt imageio and VMware VDDK.

pub mod format;
pub mod labels;
pub mod nbdkit;
pub mod options;
pub mod phase;
pub mod processor;
pub mod progress;
pub mod qemu;
pub mod readers;
pub mod sink;
pub mod sources;
pub mod termination;
pub mod util;

pub use importer_shared::{
    ErrorKind, ImportError, ImportLayout, ImportResult, TerminationMessage, VddkInfo, VolumeMode,
};
pub use options::{ContentType, ImporterOptions};
pub use phase::ProcessingPhase;
pub use processor::DataProcessor;
pub use progress::ProgressMetrics;
pub use qemu::{ImgInfo, QemuOperations};
pub use sources::{Adapters, Capabilities, CloseHandle, DataSource, SourceScheme, build_source};
