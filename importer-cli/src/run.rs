//! One import run, from parsed arguments to a termination message.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use importer::processor::{ProcessorConfig, clean_dir};
use importer::termination::write_termination_message;
use importer::{
    Adapters, CloseHandle, DataProcessor, ImporterOptions, ProcessingPhase, ProgressMetrics,
    SourceScheme, TerminationMessage, build_source,
};
use importer_shared::constants::messages;
use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

/// Closer of the source being imported, shared with the signal thread.
#[derive(Clone, Default)]
pub struct SourceCloser(Arc<Mutex<Option<CloseHandle>>>);

impl SourceCloser {
    pub fn set(&self, handle: Option<CloseHandle>) {
        *self.0.lock() = handle;
    }

    /// Run the registered closer, at most once.
    pub fn close(&self) {
        let handle = self.0.lock().take();
        if let Some(handle) = handle {
            handle.close();
        }
    }
}

/// Run the import described by `options` and return what the controller
/// should be told on success.
pub fn import(options: &ImporterOptions, closer: &SourceCloser) -> anyhow::Result<TerminationMessage> {
    tracing::info!(
        source = %options.source,
        endpoint = %importer::util::redact_url(&options.endpoint),
        content_type = %options.content_type,
        volume_mode = %options.volume_mode,
        "Starting import"
    );

    let config = ProcessorConfig::from_options(options);
    let adapters = Adapters::system(ProgressMetrics::new(), &options.owner_uid);

    if options.source == SourceScheme::Blank {
        let mut processor = DataProcessor::blank(config, adapters.qemu.clone())
            .context("Failed to prepare blank image")?;
        processor.create_blank_image()?;
        let mut message = TerminationMessage::with_message(messages::IMPORT_COMPLETE);
        message.merge(processor.termination_message());
        return Ok(message);
    }

    let source = build_source(options, &adapters, None)?;
    let mut processor = DataProcessor::new(source, config, adapters.qemu.clone())?;
    closer.set(processor.close_handle());

    let phase = if options.source == SourceScheme::AsyncUpload {
        // The whole body is already on hand, so conversion can follow at once.
        let phase = match processor.process_data_with_pause()? {
            ProcessingPhase::Pause => {
                tracing::info!("Upload received, resuming conversion");
                processor.process_data_resume()?
            }
            other => other,
        };
        if let Some(scratch) = &options.layout.scratch_dir
            && let Err(e) = clean_dir(scratch)
        {
            tracing::warn!("Failed to clean scratch space {}: {}", scratch.display(), e);
        }
        phase
    } else {
        processor.process_data()?
    };
    closer.set(None);
    processor.close()?;

    let text = match phase {
        ProcessingPhase::Pause => messages::IMPORT_PAUSED,
        _ => messages::IMPORT_COMPLETE,
    };
    tracing::info!(phase = %phase, "{}", text);
    let mut message = TerminationMessage::with_message(text);
    message.merge(processor.termination_message());
    Ok(message)
}

/// Catch SIGTERM and SIGINT on a background thread.
///
/// On delivery the source's helpers are closed, the scratch space is
/// emptied, a failure message is written and the process exits with status
/// 1. Open connections close with the process.
pub fn install_signal_handler(
    termination_path: PathBuf,
    scratch_dir: Option<PathBuf>,
    closer: SourceCloser,
) -> anyhow::Result<()> {
    let mut signals =
        Signals::new([SIGTERM, SIGINT]).context("Failed to register signal handlers")?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                tracing::warn!(signal, "Received termination signal, closing source");
                closer.close();
                if let Some(dir) = &scratch_dir
                    && let Err(e) = clean_dir(dir)
                {
                    tracing::warn!("Failed to clean scratch space {}: {}", dir.display(), e);
                }
                let message =
                    TerminationMessage::with_message(format!("Import interrupted by signal {}", signal));
                if let Err(e) = write_termination_message(&termination_path, &message) {
                    tracing::error!("Failed to write termination message: {}", e);
                }
                std::process::exit(1);
            }
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_source_closer_runs_once() {
        let count = Arc::new(AtomicU32::new(0));
        let closer = SourceCloser::default();
        closer.close();

        let seen = count.clone();
        closer.set(Some(CloseHandle::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        let other = closer.clone();
        thread::spawn(move || other.close())
            .join()
            .expect("Should join closer thread");
        closer.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleared_closer_does_nothing() {
        let count = Arc::new(AtomicU32::new(0));
        let closer = SourceCloser::default();
        let seen = count.clone();
        closer.set(Some(CloseHandle::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        closer.set(None);
        closer.close();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
