//! Import processing phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A step of the import state machine.
///
/// Transitions are chosen by the source for the info and transfer phases and
/// by the processor for the rest:
///
/// ```text
/// Info ─┬─> TransferScratch ──> Convert ──> Resize ─┬─> Complete
///       ├─> TransferDataDir ──────────────> Complete └─> Preallocate ──> Complete
///       ├─> TransferDataFile ─> Resize
///       └─> Convert
/// TransferScratch / TransferDataFile ─> ValidatePause ─> Pause
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingPhase {
    Info,
    TransferScratch,
    TransferDataDir,
    TransferDataFile,
    ValidatePause,
    Convert,
    Resize,
    Preallocate,
    Complete,
    Pause,
    Error,
}

impl ProcessingPhase {
    /// Phases that end the processing loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingPhase::Complete | ProcessingPhase::Pause)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingPhase::Info => "Info",
            ProcessingPhase::TransferScratch => "TransferScratch",
            ProcessingPhase::TransferDataDir => "TransferDataDir",
            ProcessingPhase::TransferDataFile => "TransferDataFile",
            ProcessingPhase::ValidatePause => "ValidatePause",
            ProcessingPhase::Convert => "Convert",
            ProcessingPhase::Resize => "Resize",
            ProcessingPhase::Preallocate => "Preallocate",
            ProcessingPhase::Complete => "Complete",
            ProcessingPhase::Pause => "Pause",
            ProcessingPhase::Error => "Error",
        }
    }
}

impl fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
