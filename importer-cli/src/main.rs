//! `importer`: copy one disk image into the volume mounted in this pod.
//!
//! Exits 0 when the image is in place and 1 on any failure. Either way a
//! one-line JSON termination message is written for the controller.

mod cli;
mod run;

use std::process::ExitCode;

use clap::Parser;
use importer::TerminationMessage;
use importer::termination::write_termination_message;

use crate::cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match importer::util::init_logging(cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let options = cli.to_options();
    let closer = run::SourceCloser::default();
    if let Err(e) = run::install_signal_handler(
        options.termination_message_path.clone(),
        options.layout.scratch_dir.clone(),
        closer.clone(),
    ) {
        tracing::warn!("{:#}", e);
    }

    let (message, code) = match run::import(&options, &closer) {
        Ok(message) => (message, ExitCode::SUCCESS),
        Err(e) => {
            tracing::error!("Import failed: {:#}", e);
            (TerminationMessage::with_message(format!("{:#}", e)), ExitCode::FAILURE)
        }
    };

    if let Err(e) = write_termination_message(&options.termination_message_path, &message) {
        tracing::error!("Failed to write termination message: {}", e);
        return ExitCode::FAILURE;
    }
    code
}
