//! Error taxonomy for the import pipeline.
//!
//! Every failure carries exactly one [`ErrorKind`]. The phase loop adds
//! context with [`ImportError::context`] without losing the kind of the
//! underlying failure, so callers classify errors by `kind()` and never by
//! message text.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias used across the workspace.
pub type ImportResult<T> = Result<T, ImportError>;

// ============================================================================
// Error kinds
// ============================================================================

/// Classification of an [`ImportError`], independent of context wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationSize,
    RequiresScratchSpace,
    InvalidPath,
    UnknownPhase,
    UnexpectedStatus,
    NbdkitStartTimeout,
    NbdkitPluginMissing,
    VmNotFound,
    DiskNotFound,
    SnapshotNotFound,
    ArchiveExpectedNotTar,
    ImageFileNotFound,
    ImagePullFailed,
    NoCapacity,
    ChecksumMismatch,
    NotResumable,
    Storage,
    Network,
    Config,
    InvalidArgument,
    Execution,
    Unsupported,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Top-level error
// ============================================================================

/// Errors produced while importing a disk image.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The image's virtual size does not fit the destination.
    #[error("{0}")]
    ValidationSize(String),

    /// A source needed scratch space and none was provided.
    #[error("scratch space required and none found")]
    RequiresScratchSpace,

    /// The transfer directory has no usable space.
    #[error("invalid transfer path")]
    InvalidPath,

    /// The phase loop reached a phase it does not know how to run.
    #[error("unknown processing phase {0}")]
    UnknownPhase(String),

    /// An HTTP origin answered with something other than the expected status.
    #[error("expected status code 200, got {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    /// nbdkit never wrote its PID file.
    #[error("timed out waiting for nbdkit to start: {0}")]
    NbdkitStartTimeout(String),

    /// The nbdkit plugin could not be loaded.
    #[error("nbdkit plugin is not available: {0}")]
    NbdkitPluginMissing(String),

    #[error("unable to locate VM {0} in any datacenter")]
    VmNotFound(String),

    #[error("disk not found: {0}")]
    DiskNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Archive content was requested but the payload is not a tar stream.
    #[error("cannot process a non-tar payload as an archive")]
    ArchiveExpectedNotTar,

    /// No layer of a container image held a disk file.
    #[error("failed to find VM disk image file in the container image: {0}")]
    ImageFileNotFound(String),

    /// Any lower-level failure while copying a container image.
    #[error("failed to pull image: {0}")]
    ImagePullFailed(String),

    /// The destination ran out of space or quota.
    #[error("no space left on destination: {0}")]
    NoCapacity(String),

    #[error("checksum mismatch: expected {expected}, calculated {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("data source is not resumable")]
    NotResumable,

    #[error("storage: {0}")]
    Storage(String),

    #[error("network: {0}")]
    Network(String),

    #[error("config: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("execution: {0}")]
    Execution(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal: {0}")]
    Internal(String),

    /// Context added on the way up, e.g. by the phase loop.
    #[error("{message}: {source}")]
    Context {
        message: String,
        #[source]
        source: Box<ImportError>,
    },
}

impl ImportError {
    /// Wrap this error with a context message, keeping its kind.
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through context wrappers.
    pub fn root(&self) -> &ImportError {
        let mut current = self;
        while let ImportError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Kind of the innermost error.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            ImportError::ValidationSize(_) => ErrorKind::ValidationSize,
            ImportError::RequiresScratchSpace => ErrorKind::RequiresScratchSpace,
            ImportError::InvalidPath => ErrorKind::InvalidPath,
            ImportError::UnknownPhase(_) => ErrorKind::UnknownPhase,
            ImportError::UnexpectedStatus { .. } => ErrorKind::UnexpectedStatus,
            ImportError::NbdkitStartTimeout(_) => ErrorKind::NbdkitStartTimeout,
            ImportError::NbdkitPluginMissing(_) => ErrorKind::NbdkitPluginMissing,
            ImportError::VmNotFound(_) => ErrorKind::VmNotFound,
            ImportError::DiskNotFound(_) => ErrorKind::DiskNotFound,
            ImportError::SnapshotNotFound(_) => ErrorKind::SnapshotNotFound,
            ImportError::ArchiveExpectedNotTar => ErrorKind::ArchiveExpectedNotTar,
            ImportError::ImageFileNotFound(_) => ErrorKind::ImageFileNotFound,
            ImportError::ImagePullFailed(_) => ErrorKind::ImagePullFailed,
            ImportError::NoCapacity(_) => ErrorKind::NoCapacity,
            ImportError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            ImportError::NotResumable => ErrorKind::NotResumable,
            ImportError::Storage(_) => ErrorKind::Storage,
            ImportError::Network(_) => ErrorKind::Network,
            ImportError::Config(_) => ErrorKind::Config,
            ImportError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ImportError::Execution(_) => ErrorKind::Execution,
            ImportError::Unsupported(_) => ErrorKind::Unsupported,
            ImportError::Internal(_) => ErrorKind::Internal,
            // root() never returns a wrapper
            ImportError::Context { .. } => ErrorKind::Internal,
        }
    }

    /// True for out-of-space conditions, including a failed size validation.
    pub fn is_no_capacity(&self) -> bool {
        matches!(self.kind(), ErrorKind::NoCapacity | ErrorKind::ValidationSize)
    }

    /// Build an error from an I/O failure.
    ///
    /// `ENOSPC` and `EDQUOT` become [`ImportError::NoCapacity`]; everything
    /// else is [`ImportError::Storage`].
    pub fn from_io(context: impl fmt::Display, err: io::Error) -> Self {
        let message = format!("{}: {}", context, err);
        match err.raw_os_error() {
            Some(code) if code == libc::ENOSPC || code == libc::EDQUOT => {
                ImportError::NoCapacity(message)
            }
            _ => ImportError::Storage(message),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::Internal(format!("json: {}", err))
    }
}
