//! Push uploads.
//!
//! The upload server accepts the request and hands its body over as an
//! already-open stream. The async variant pauses after the transfer so the
//! server can acknowledge the upload before conversion runs.

use std::fs::File;
use std::io;
use std::path::Path;

use importer_shared::{ImportError, ImportResult};

use super::{Adapters, Capabilities, DataSource, StreamSource};
use crate::options::ImporterOptions;
use crate::phase::ProcessingPhase;
use crate::readers::BoxedReader;

/// Open the body of an upload: stdin for `-` or an empty endpoint, else the
/// file the endpoint names.
pub fn open_upload_stream(endpoint: &str) -> ImportResult<BoxedReader> {
    match endpoint {
        "" | "-" => Ok(Box::new(io::stdin())),
        path => {
            let file = File::open(path).map_err(|e| {
                ImportError::from_io(format!("unable to open upload stream {}", path), e)
            })?;
            Ok(Box::new(file))
        }
    }
}

fn stream_source(body: BoxedReader, options: &ImporterOptions, adapters: &Adapters) -> StreamSource {
    StreamSource::new(body, 0, options.content_type)
        .with_progress(adapters.counter(&options.owner_uid))
        .with_preallocation(options.preallocation)
}

/// Synchronous upload: the body is imported straight through.
pub struct UploadSource {
    stream: StreamSource,
}

impl UploadSource {
    pub fn new(body: BoxedReader, options: &ImporterOptions, adapters: &Adapters) -> Self {
        Self {
            stream: stream_source(body, options, adapters),
        }
    }
}

impl DataSource for UploadSource {
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
        self.stream.close()
    }
}

/// Upload that pauses once the bytes are on disk and resumes at conversion
/// (scratch) or resize (data file).
pub struct AsyncUploadSource {
    stream: StreamSource,
    resume_phase: Option<ProcessingPhase>,
    url: Option<String>,
}

impl AsyncUploadSource {
    pub fn new(body: BoxedReader, options: &ImporterOptions, adapters: &Adapters) -> Self {
        Self {
            stream: stream_source(body, options, adapters),
            resume_phase: None,
            url: None,
        }
    }

    /// Park `next` as the resume phase and pause instead.
    fn pause_before(&mut self, next: ProcessingPhase) -> ProcessingPhase {
        match next {
            ProcessingPhase::Convert | ProcessingPhase::Resize => {
                self.resume_phase = Some(next);
                ProcessingPhase::ValidatePause
            }
            other => other,
        }
    }
}

impl DataSource for AsyncUploadSource {
    fn info(&mut self) -> ImportResult<ProcessingPhase> {
        self.stream.info()
    }

    fn transfer(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        let next = self.stream.transfer(path)?;
        self.url = self.stream.url();
        Ok(self.pause_before(next))
    }

    fn transfer_file(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        let next = self.stream.transfer_file(path)?;
        self.url = Some(path.to_string_lossy().into_owned());
        Ok(self.pause_before(next))
    }

    fn url(&self) -> Option<String> {
        self.url.clone()
    }

    fn close(&mut self) -> ImportResult<()> {
        self.stream.close()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resume: true,
            produces_termination_info: false,
        }
    }

    fn resume_phase(&self) -> Option<ProcessingPhase> {
        self.resume_phase
    }
}
